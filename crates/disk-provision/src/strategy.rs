// SPDX-License-Identifier: LGPL-3.0-only

//! Installation strategy catalogue.
//!
//! Each strategy pairs a feasibility test against a disk snapshot with a
//! plan builder producing the ordered operations that realize it. Ranking
//! returns only the feasible ones, highest priority first.

use crate::device::{FileSystem, TableKind, GIB, MIB};
use crate::inspect::DiskSnapshot;
use crate::inventory::FirmwareEnv;
use crate::ops::{DiskOperation, NewPartition, OpKind, VOLUME_GROUP};
use crate::os_probe::OsInfo;
use crate::partitions::PartitionType;
use std::path::PathBuf;

/// Smallest disk the engine will install onto.
pub const MINIMUM_DISK_BYTES: u64 = 10 * GIB;

/// Below this much install space, no swap partition is carved out.
const SWAP_FLOOR_BYTES: u64 = 15 * GIB;

/// Swap size for a given disk capacity.
pub fn find_best_swap_size(capacity: u64) -> u64 {
    if capacity > 50 * GIB {
        4 * GIB
    } else if capacity >= 40 * GIB {
        2 * GIB
    } else {
        GIB
    }
}

/// EFI system partition size for a given disk capacity.
pub fn find_best_esp_size(capacity: u64) -> u64 {
    if capacity >= 20 * GIB {
        512 * MIB
    } else {
        250 * MIB
    }
}

/// What the user asked for, beyond the choice of strategy itself.
#[derive(Clone, Debug, Default)]
pub struct ProvisionRequest {
    pub root_fs: Option<FileSystem>,
    /// Passphrase for full-disk encryption, when requested.
    pub encrypt: Option<String>,
    pub use_lvm: bool,
    /// Space to reclaim from the shrunk system when installing alongside;
    /// clamped into the feasible range.
    pub alongside_bytes: Option<u64>,
    /// Partition assignments for the custom strategy.
    pub chosen: Option<UserPartitionChoice>,
}

impl ProvisionRequest {
    fn root_fs(&self) -> FileSystem {
        self.root_fs.clone().unwrap_or(FileSystem::Ext4)
    }
}

/// Explicit partition assignments supplied by the user.
#[derive(Clone, Debug)]
pub struct UserPartitionChoice {
    pub root: PathBuf,
    pub root_fs: FileSystem,
    pub swap: Option<PathBuf>,
    pub home: Option<HomeChoice>,
}

#[derive(Clone, Debug)]
pub struct HomeChoice {
    pub path: PathBuf,
    pub fs: FileSystem,
    /// Format instead of adopting the existing contents.
    pub format: bool,
}

/// An existing installation that a strategy would shrink or replace.
#[derive(Clone, Debug)]
pub struct CandidateOs {
    pub number: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub min_shrink_bytes: Option<u64>,
    pub fs: FileSystem,
    pub os: OsInfo,
    pub logical: bool,
}

/// Candidates for the alongside/replace strategies: partitions carrying a
/// detected operating system.
pub fn candidates(snapshot: &DiskSnapshot) -> Vec<CandidateOs> {
    snapshot
        .real_partitions()
        .filter_map(|part| {
            let os = part.os.clone()?;
            let fs = part.content.filesystem()?.clone();
            Some(CandidateOs {
                number: part.number,
                path: part.path.clone()?,
                size_bytes: part.size_bytes,
                min_shrink_bytes: part.min_shrink_bytes,
                fs,
                os,
                logical: part.part_type == PartitionType::Logical,
            })
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    WipeDisk,
    EmptyDisk,
    DualBoot,
    ReplaceOs,
    UserPartition,
}

#[derive(Clone, Debug)]
pub struct Strategy {
    pub kind: StrategyKind,
    /// The installation shrunk or replaced, for the strategies that need one.
    pub candidate: Option<CandidateOs>,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy is not feasible for this disk")]
    NotFeasible,
    #[error("strategy requires partition assignments")]
    MissingChoice,
}

impl Strategy {
    pub fn priority(&self) -> u8 {
        match self.kind {
            StrategyKind::EmptyDisk => 50,
            StrategyKind::DualBoot => 40,
            StrategyKind::ReplaceOs => 30,
            StrategyKind::WipeDisk => 20,
            StrategyKind::UserPartition => 10,
        }
    }

    pub fn label(&self) -> String {
        let os_name = || {
            self.candidate
                .as_ref()
                .map_or_else(|| "the existing system".to_owned(), |c| c.os.name.clone())
        };

        match self.kind {
            StrategyKind::EmptyDisk => "Install on the empty disk".to_owned(),
            StrategyKind::WipeDisk => "Erase everything and install".to_owned(),
            StrategyKind::DualBoot => format!("Install alongside {}", os_name()),
            StrategyKind::ReplaceOs => format!("Replace {}", os_name()),
            StrategyKind::UserPartition => "Use custom partitions".to_owned(),
        }
    }

    pub fn is_feasible(
        &self,
        snapshot: &DiskSnapshot,
        firmware: &FirmwareEnv,
        request: &ProvisionRequest,
    ) -> bool {
        let capacity = snapshot.capacity_bytes();
        if capacity < MINIMUM_DISK_BYTES {
            return false;
        }

        match self.kind {
            // A fresh table wants nothing but a big enough disk.
            StrategyKind::EmptyDisk => snapshot.is_empty(),
            StrategyKind::WipeDisk => !snapshot.is_empty(),
            StrategyKind::DualBoot => {
                self.dual_boot_need(snapshot, firmware).is_some()
                    && !firmware.broken_uefi_setup
                    && table_matches_firmware(snapshot.table, firmware)
            }
            StrategyKind::ReplaceOs => {
                let candidate = match &self.candidate {
                    Some(candidate) => candidate,
                    None => return false,
                };
                // Replacing on a UEFI disk without an ESP means carving
                // one out, which needs a slot and free space.
                let esp_ok = !firmware.uefi
                    || snapshot.has_esp()
                    || (snapshot.fits_additional(1, false)
                        && snapshot.largest_free_bytes() >= find_best_esp_size(capacity));
                !candidate.os.is_windows()
                    && candidate.size_bytes >= MINIMUM_DISK_BYTES
                    && !firmware.broken_uefi_setup
                    && table_matches_firmware(snapshot.table, firmware)
                    && esp_ok
            }
            StrategyKind::UserPartition => request.chosen.is_some(),
        }
    }

    /// Space the alongside strategy must reclaim: a root at the minimum
    /// install size, plus an ESP when the disk lacks one. `None` when the
    /// candidate cannot yield that much or the table has no slot budget.
    fn dual_boot_need(
        &self,
        snapshot: &DiskSnapshot,
        firmware: &FirmwareEnv,
    ) -> Option<u64> {
        let candidate = self.candidate.as_ref()?;

        // New partitions only land in primary slots; space reclaimed from
        // a logical partition stays inside the extended container where
        // the allocator cannot reach it.
        if candidate.logical {
            return None;
        }

        let headroom = candidate
            .size_bytes
            .saturating_sub(candidate.min_shrink_bytes?)
            .saturating_sub(MIB);

        let esp_needed = firmware.uefi && !snapshot.has_esp();
        let mut need = MINIMUM_DISK_BYTES;
        let mut new_parts = 1;
        if esp_needed {
            need += find_best_esp_size(snapshot.capacity_bytes());
            new_parts += 1;
        }

        if headroom < need || !snapshot.fits_additional(new_parts, candidate.logical) {
            return None;
        }

        Some(need)
    }

    /// Build the ordered operation plan for this strategy.
    pub fn build_operations(
        &self,
        snapshot: &DiskSnapshot,
        firmware: &FirmwareEnv,
        request: &ProvisionRequest,
    ) -> Result<Vec<DiskOperation>, StrategyError> {
        if !self.is_feasible(snapshot, firmware, request) {
            return Err(StrategyError::NotFeasible);
        }

        match self.kind {
            StrategyKind::EmptyDisk | StrategyKind::WipeDisk => {
                Ok(whole_disk_plan(snapshot, firmware, request))
            }
            StrategyKind::DualBoot => self.dual_boot_plan(snapshot, firmware, request),
            StrategyKind::ReplaceOs => self.replace_plan(snapshot, firmware, request),
            StrategyKind::UserPartition => user_partition_plan(snapshot, request),
        }
    }

    fn dual_boot_plan(
        &self,
        snapshot: &DiskSnapshot,
        firmware: &FirmwareEnv,
        request: &ProvisionRequest,
    ) -> Result<Vec<DiskOperation>, StrategyError> {
        let candidate = self.candidate.as_ref().ok_or(StrategyError::NotFeasible)?;
        let need = self
            .dual_boot_need(snapshot, firmware)
            .ok_or(StrategyError::NotFeasible)?;

        let headroom = candidate
            .size_bytes
            .saturating_sub(candidate.min_shrink_bytes.unwrap_or(candidate.size_bytes))
            .saturating_sub(MIB);

        // Default to an even split of the reclaimable space.
        let carve = request
            .alongside_bytes
            .unwrap_or(headroom / 2)
            .max(need)
            .min(headroom);

        let device = &snapshot.device.path;
        let mut ops = vec![DiskOperation::new(
            device,
            OpKind::ResizeForeignOs {
                number: candidate.number,
                path: candidate.path.clone(),
                fs: candidate.fs.clone(),
                new_size_bytes: candidate.size_bytes - carve,
                resolved: None,
            },
        )];

        let esp_needed = firmware.uefi && !snapshot.has_esp();
        let extra_parts = 1 + usize::from(esp_needed);
        if esp_needed {
            ops.push(DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(
                        crate::table::PartitionRole::Esp,
                        FileSystem::Fat32,
                        Some(find_best_esp_size(snapshot.capacity_bytes())),
                    ),
                    resolved: None,
                    crypto_uuid: None,
                },
            ));
        }

        // Swap only when the reclaimed space affords it and a table slot
        // remains after root and the optional ESP.
        let swap_size = find_best_swap_size(snapshot.capacity_bytes());
        if carve >= SWAP_FLOOR_BYTES
            && snapshot.fits_additional(extra_parts + 1, candidate.logical)
        {
            ops.push(DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(
                        crate::table::PartitionRole::Swap,
                        FileSystem::Swap,
                        Some(swap_size),
                    ),
                    resolved: None,
                    crypto_uuid: None,
                },
            ));
        }

        ops.push(DiskOperation::new(
            device,
            OpKind::CreatePartition {
                part: NewPartition::new(
                    crate::table::PartitionRole::Root,
                    request.root_fs(),
                    None,
                ),
                resolved: None,
                crypto_uuid: None,
            },
        ));

        Ok(ops)
    }

    fn replace_plan(
        &self,
        snapshot: &DiskSnapshot,
        firmware: &FirmwareEnv,
        request: &ProvisionRequest,
    ) -> Result<Vec<DiskOperation>, StrategyError> {
        let candidate = self.candidate.as_ref().ok_or(StrategyError::NotFeasible)?;
        let device = &snapshot.device.path;
        let mut ops = Vec::new();

        if firmware.uefi && !snapshot.has_esp() {
            ops.push(DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(
                        crate::table::PartitionRole::Esp,
                        FileSystem::Fat32,
                        Some(find_best_esp_size(snapshot.capacity_bytes())),
                    ),
                    resolved: None,
                    crypto_uuid: None,
                },
            ));
        }

        ops.push(DiskOperation::new(
            device,
            OpKind::FormatPartition {
                path: candidate.path.clone(),
                fs: request.root_fs(),
                role: crate::table::PartitionRole::Root,
                late: false,
            },
        ));

        if let Some(swap) = snapshot.swap_partition() {
            if let Some(path) = &swap.path {
                ops.push(DiskOperation::new(
                    device,
                    OpKind::UseExistingSwap { path: path.clone() },
                ));
            }
        }

        Ok(ops)
    }
}

fn table_matches_firmware(table: TableKind, firmware: &FirmwareEnv) -> bool {
    match table {
        TableKind::Gpt => firmware.uefi,
        TableKind::Mbr => !firmware.uefi,
        TableKind::None => false,
    }
}

/// Plan for taking over the whole device: fresh table, then either a flat
/// ESP/swap/root split or a single container carrying LVM (optionally
/// inside LUKS).
fn whole_disk_plan(
    snapshot: &DiskSnapshot,
    firmware: &FirmwareEnv,
    request: &ProvisionRequest,
) -> Vec<DiskOperation> {
    use crate::table::PartitionRole;

    let device = &snapshot.device.path;
    let capacity = snapshot.capacity_bytes();

    let table = if firmware.uefi { TableKind::Gpt } else { TableKind::Mbr };
    let mut ops = vec![DiskOperation::new(device, OpKind::CreateTable { kind: table })];

    let esp_size = if firmware.uefi {
        find_best_esp_size(capacity)
    } else {
        0
    };
    if esp_size > 0 {
        ops.push(DiskOperation::new(
            device,
            OpKind::CreatePartition {
                part: NewPartition::new(PartitionRole::Esp, FileSystem::Fat32, Some(esp_size)),
                resolved: None,
                crypto_uuid: None,
            },
        ));
    }

    let after_esp = capacity - esp_size;
    let swap_size = if after_esp >= SWAP_FLOOR_BYTES {
        find_best_swap_size(capacity)
    } else {
        0
    };

    if request.encrypt.is_none() && !request.use_lvm {
        if swap_size > 0 {
            ops.push(DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(PartitionRole::Swap, FileSystem::Swap, Some(swap_size)),
                    resolved: None,
                    crypto_uuid: None,
                },
            ));
        }

        ops.push(DiskOperation::new(
            device,
            OpKind::CreatePartition {
                part: NewPartition::new(
                    PartitionRole::Root,
                    request.root_fs(),
                    Some(capacity - esp_size - swap_size),
                ),
                resolved: None,
                crypto_uuid: None,
            },
        ));

        return ops;
    }

    // LVM layout: one container partition fills the disk, swap and root
    // become logical volumes inside it.
    let (role, fs, passphrase) = match &request.encrypt {
        Some(passphrase) => (
            PartitionRole::LuksContainer,
            FileSystem::Luks,
            Some(passphrase.clone()),
        ),
        None => (PartitionRole::PhysicalVolume, FileSystem::Lvm, None),
    };

    let mut container = NewPartition::new(role, fs, None);
    container.passphrase = passphrase;
    ops.push(DiskOperation::new(
        device,
        OpKind::CreatePartition { part: container, resolved: None, crypto_uuid: None },
    ));

    ops.push(DiskOperation::new(
        device,
        OpKind::CreateVolumeGroup { vg: VOLUME_GROUP.to_owned() },
    ));

    if swap_size > 0 {
        ops.push(DiskOperation::new(
            device,
            OpKind::CreateLogicalVolume {
                vg: VOLUME_GROUP.to_owned(),
                lv: "swap".to_owned(),
                size_bytes: Some(swap_size),
                role: PartitionRole::Swap,
                fs: FileSystem::Swap,
            },
        ));
    }

    ops.push(DiskOperation::new(
        device,
        OpKind::CreateLogicalVolume {
            vg: VOLUME_GROUP.to_owned(),
            lv: "root".to_owned(),
            size_bytes: None,
            role: PartitionRole::Root,
            fs: request.root_fs(),
        },
    ));

    ops
}

fn user_partition_plan(
    snapshot: &DiskSnapshot,
    request: &ProvisionRequest,
) -> Result<Vec<DiskOperation>, StrategyError> {
    use crate::table::PartitionRole;

    let chosen = request.chosen.as_ref().ok_or(StrategyError::MissingChoice)?;
    let device = &snapshot.device.path;

    let mut ops = vec![DiskOperation::new(
        device,
        OpKind::FormatPartition {
            path: chosen.root.clone(),
            fs: chosen.root_fs.clone(),
            role: PartitionRole::Root,
            late: false,
        },
    )];

    if let Some(swap) = &chosen.swap {
        ops.push(DiskOperation::new(
            device,
            OpKind::UseExistingSwap { path: swap.clone() },
        ));
    }

    if let Some(home) = &chosen.home {
        if home.format {
            // Formatting an adopted home runs after every other format so
            // an abort mid-plan leaves the old contents recoverable.
            ops.push(DiskOperation::new(
                device,
                OpKind::FormatPartition {
                    path: home.path.clone(),
                    fs: home.fs.clone(),
                    role: PartitionRole::Home,
                    late: true,
                },
            ));
        } else {
            ops.push(DiskOperation::new(
                device,
                OpKind::UseExistingHome {
                    path: home.path.clone(),
                    fs: home.fs.clone(),
                },
            ));
        }
    }

    Ok(ops)
}

/// All feasible strategies for a snapshot, best first. Ties keep catalogue
/// order, which never happens with the current priorities.
pub fn rank_strategies(
    snapshot: &DiskSnapshot,
    firmware: &FirmwareEnv,
    request: &ProvisionRequest,
) -> Vec<Strategy> {
    let mut catalogue = vec![
        Strategy { kind: StrategyKind::EmptyDisk, candidate: None },
        Strategy { kind: StrategyKind::WipeDisk, candidate: None },
        Strategy { kind: StrategyKind::UserPartition, candidate: None },
    ];

    for candidate in candidates(snapshot) {
        catalogue.push(Strategy {
            kind: StrategyKind::DualBoot,
            candidate: Some(candidate.clone()),
        });
        catalogue.push(Strategy {
            kind: StrategyKind::ReplaceOs,
            candidate: Some(candidate),
        });
    }

    catalogue.retain(|strategy| strategy.is_feasible(snapshot, firmware, request));
    catalogue.sort_by(|a, b| b.priority().cmp(&a.priority()));
    catalogue
}
