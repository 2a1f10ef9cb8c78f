// SPDX-License-Identifier: LGPL-3.0-only

//! Disk operations and the two-phase pipeline that runs them.
//!
//! Phase one (`apply`) edits table geometry in memory and is safe to run
//! while simulating. Phase two (`apply_format`) shells out to the
//! formatting tools and is never simulated; callers must not reach it
//! without a committed table.

use crate::device::{FileSystem, TableKind, MIB};
use crate::external;
use crate::luks::{self, LuksError};
use crate::lvm;
use crate::table::{PartitionRole, ResolvedPartition, TableEditor, TableError};
use std::path::{Path, PathBuf};

/// Mapper name used for the root LUKS container.
pub const LUKS_MAPPER: &str = "cryptdata";

/// Volume group name used for installer-created LVM layouts.
pub const VOLUME_GROUP: &str = "system";

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Luks(#[from] LuksError),
    #[error("external command failed: {0}")]
    Command(#[from] cradle::Error),
    #[error("format phase ran twice for the same operation")]
    AlreadyFormatted,
    #[error("no resolved partition available for {0}")]
    Unresolved(&'static str),
    #[error("{0} file systems cannot be resized")]
    Unresizable(String),
}

/// A freshly planned partition, before geometry is resolved.
#[derive(Clone, Debug)]
pub struct NewPartition {
    pub role: PartitionRole,
    pub fs: FileSystem,
    /// `None` fills the largest free region.
    pub size_bytes: Option<u64>,
    pub label: Option<String>,
    /// Only set for `LuksContainer` partitions.
    pub passphrase: Option<String>,
}

impl NewPartition {
    pub fn new(role: PartitionRole, fs: FileSystem, size_bytes: Option<u64>) -> NewPartition {
        NewPartition {
            role,
            fs,
            size_bytes,
            label: None,
            passphrase: None,
        }
    }
}

#[derive(Debug)]
pub enum OpKind {
    CreateTable {
        kind: TableKind,
    },
    CreatePartition {
        part: NewPartition,
        resolved: Option<ResolvedPartition>,
        /// UUID reported by luksFormat, for containers.
        crypto_uuid: Option<String>,
    },
    CreateVolumeGroup {
        vg: String,
    },
    CreateLogicalVolume {
        vg: String,
        lv: String,
        /// `None` takes all remaining extents.
        size_bytes: Option<u64>,
        role: PartitionRole,
        fs: FileSystem,
    },
    UseExistingSwap {
        path: PathBuf,
    },
    UseExistingHome {
        path: PathBuf,
        fs: FileSystem,
    },
    ResizeForeignOs {
        number: u32,
        path: PathBuf,
        fs: FileSystem,
        new_size_bytes: u64,
        resolved: Option<ResolvedPartition>,
    },
    FormatPartition {
        path: PathBuf,
        fs: FileSystem,
        role: PartitionRole,
        /// Late formats run after every ordinary format has finished.
        late: bool,
    },
}

/// One step of a provisioning plan. Records its own failure so an aborted
/// plan can be reported partition by partition.
#[derive(Debug)]
pub struct DiskOperation {
    pub device: PathBuf,
    pub kind: OpKind,
    pub error: Option<String>,
    formatted: bool,
}

impl DiskOperation {
    pub fn new(device: &Path, kind: OpKind) -> DiskOperation {
        DiskOperation {
            device: device.to_owned(),
            kind,
            error: None,
            formatted: false,
        }
    }

    /// Human-readable audit line for plan previews and logs.
    pub fn describe(&self) -> String {
        let device = self.device.display();
        match &self.kind {
            OpKind::CreateTable { kind } => match kind {
                TableKind::Gpt => format!("create a GPT partition table on {}", device),
                TableKind::Mbr => format!("create an MBR partition table on {}", device),
                TableKind::None => format!("clear the partition table on {}", device),
            },
            OpKind::CreatePartition { part, .. } => {
                let what = match part.role {
                    PartitionRole::Esp => "EFI system partition",
                    PartitionRole::Swap => "swap partition",
                    PartitionRole::Boot => "boot partition",
                    PartitionRole::LuksContainer => "encrypted container",
                    PartitionRole::PhysicalVolume => "LVM physical volume",
                    _ => "partition",
                };
                match part.size_bytes {
                    Some(bytes) => {
                        format!("create a {} {} on {}", format_size(bytes), what, device)
                    }
                    None => format!("create a {} on {} using the remaining space", what, device),
                }
            }
            OpKind::CreateVolumeGroup { vg } => {
                format!("create volume group '{}' on {}", vg, device)
            }
            OpKind::CreateLogicalVolume { vg, lv, size_bytes, .. } => match size_bytes {
                Some(bytes) => format!(
                    "create a {} logical volume '{}' in volume group '{}'",
                    format_size(*bytes),
                    lv,
                    vg
                ),
                None => format!(
                    "create logical volume '{}' in volume group '{}' using the remaining space",
                    lv, vg
                ),
            },
            OpKind::UseExistingSwap { path } => {
                format!("reuse existing swap partition {}", path.display())
            }
            OpKind::UseExistingHome { path, .. } => {
                format!("keep {} as the home partition without formatting", path.display())
            }
            OpKind::ResizeForeignOs { path, new_size_bytes, .. } => format!(
                "shrink {} to {}",
                path.display(),
                format_size(*new_size_bytes)
            ),
            OpKind::FormatPartition { path, fs, .. } => {
                format!("format {} as {}", path.display(), fs.as_str())
            }
        }
    }

    /// Bytes this operation consumes from the device, when that is known
    /// before geometry resolution.
    pub fn size_bytes(&self) -> Option<u64> {
        match &self.kind {
            OpKind::CreatePartition { part, .. } => part.size_bytes,
            OpKind::CreateLogicalVolume { size_bytes, .. } => *size_bytes,
            _ => None,
        }
    }

    /// Late formats run after all ordinary formats. Only reused home
    /// partitions qualify today; the variant keeps the door open for
    /// other preserve-then-adopt flows.
    pub fn is_late(&self) -> bool {
        matches!(self.kind, OpKind::FormatPartition { late: true, .. })
    }

    /// Phase one: edit table geometry in memory.
    pub fn apply(&mut self, editor: &mut TableEditor) -> Result<(), OpError> {
        let result = self.apply_inner(editor);
        if let Err(why) = &result {
            self.error = Some(why.to_string());
        }
        result
    }

    fn apply_inner(&mut self, editor: &mut TableEditor) -> Result<(), OpError> {
        match &mut self.kind {
            OpKind::CreateTable { kind } => {
                editor.create_table(*kind)?;
            }
            OpKind::CreatePartition { part, resolved, .. } => {
                let placed = editor.create_partition(
                    part.role,
                    part.size_bytes,
                    part.label.as_deref(),
                )?;
                *resolved = Some(placed);
            }
            OpKind::ResizeForeignOs { number, new_size_bytes, resolved, .. } => {
                let placed = editor.resize_partition(*number, *new_size_bytes)?;
                *resolved = Some(placed);
            }
            // Geometry-neutral operations act only in the format phase.
            _ => (),
        }

        Ok(())
    }

    /// Phase two: run the destructive formatting tools. Must only be
    /// called once per operation, after the table was committed.
    pub fn apply_format(&mut self, editor: &mut TableEditor) -> Result<(), OpError> {
        if self.formatted {
            return Err(OpError::AlreadyFormatted);
        }
        self.formatted = true;

        let result = self.format_inner(editor);
        if let Err(why) = &result {
            self.error = Some(why.to_string());
        }
        result
    }

    fn format_inner(&mut self, editor: &mut TableEditor) -> Result<(), OpError> {
        match &mut self.kind {
            OpKind::CreatePartition { part, resolved, crypto_uuid } => {
                let placed = resolved
                    .as_ref()
                    .ok_or(OpError::Unresolved("partition"))?;

                match part.role {
                    PartitionRole::Swap => external::mkswap(&placed.path)?,
                    PartitionRole::LuksContainer => {
                        let passphrase = part
                            .passphrase
                            .as_deref()
                            .ok_or(OpError::Unresolved("passphrase"))?;
                        let uuid =
                            luks::format_container(&placed.path, passphrase, LUKS_MAPPER)?;
                        *crypto_uuid = Some(uuid);
                        editor.luks_mapper = Some(luks::mapper_path(LUKS_MAPPER));
                    }
                    PartitionRole::PhysicalVolume => lvm::pv_create(&placed.path)?,
                    _ => external::mkfs(&placed.path, &part.fs)?,
                }
            }
            OpKind::CreateVolumeGroup { vg } => {
                let pv = editor
                    .luks_mapper
                    .clone()
                    .or_else(|| {
                        editor
                            .resolved_by_role(PartitionRole::PhysicalVolume)
                            .map(|p| p.path.clone())
                    })
                    .ok_or(OpError::Unresolved("physical volume"))?;
                lvm::vg_create(vg, &pv)?;
                // Event-driven autoactivation may be off on live media.
                lvm::vg_activate(vg)?;
            }
            OpKind::CreateLogicalVolume { vg, lv, size_bytes, fs, .. } => {
                lvm::lv_create(vg, lv, *size_bytes)?;
                let path = lvm::lv_path(vg, lv);
                if let FileSystem::Swap = fs {
                    external::mkswap(&path)?;
                } else {
                    external::mkfs(&path, fs)?;
                }
            }
            OpKind::ResizeForeignOs { path, fs, new_size_bytes, .. } => {
                resize_filesystem(path, fs, *new_size_bytes)?;
            }
            OpKind::FormatPartition { path, fs, .. } => {
                // Adopted partitions carry signatures from their previous
                // life; scrub them before the new file system lands.
                external::wipefs(path)?;
                if let FileSystem::Swap = fs {
                    external::mkswap(path)?;
                } else {
                    external::mkfs(path, fs)?;
                }
            }
            // Table creation was handled at commit; reused partitions are
            // adopted untouched.
            OpKind::CreateTable { .. }
            | OpKind::UseExistingSwap { .. }
            | OpKind::UseExistingHome { .. } => (),
        }

        Ok(())
    }
}

/// Shrink a foreign file system in place before the table entry shrinks
/// around it.
fn resize_filesystem(path: &Path, fs: &FileSystem, new_size_bytes: u64) -> Result<(), OpError> {
    match fs {
        FileSystem::Ntfs => {
            external::ntfs_check(path, new_size_bytes)?;
            external::ntfs_resize(path, new_size_bytes)?;
        }
        fs if fs.is_ext() => {
            external::ext_check(path)?;
            external::ext_resize(path, new_size_bytes)?;
        }
        other => return Err(OpError::Unresizable(other.as_str().to_owned())),
    }

    Ok(())
}

/// Run phase one for every operation in order, then commit the table.
/// Stops at the first failure, leaving its message in the operation.
pub fn apply_all(ops: &mut [DiskOperation], editor: &mut TableEditor) -> Result<(), OpError> {
    for op in ops.iter_mut() {
        debug!("applying: {}", op.describe());
        op.apply(editor)?;
    }

    editor.commit()?;
    Ok(())
}

/// Run phase two: ordinary formats in plan order, then the late ones.
pub fn format_all(ops: &mut [DiskOperation], editor: &mut TableEditor) -> Result<(), OpError> {
    for late_pass in &[false, true] {
        for op in ops.iter_mut().filter(|op| op.is_late() == *late_pass) {
            debug!("formatting: {}", op.describe());
            op.apply_format(editor)?;
        }
    }

    Ok(())
}

/// Where each mount point of the installed system will live.
#[derive(Clone, Debug)]
pub struct PartRef {
    pub path: PathBuf,
    pub fs: FileSystem,
    /// Created and formatted by this plan, as opposed to adopted.
    pub created: bool,
}

#[derive(Clone, Debug)]
pub struct TargetLayout {
    pub root: PartRef,
    pub esp: Option<PartRef>,
    pub boot: Option<PartRef>,
    pub swap: Option<PartRef>,
    pub home: Option<PartRef>,
    pub crypto_uuid: Option<String>,
}

/// Derive the final mount layout from a fully applied plan.
pub fn resolve_layout(ops: &[DiskOperation]) -> Result<TargetLayout, OpError> {
    let mut root = None;
    let mut esp = None;
    let mut boot = None;
    let mut swap = None;
    let mut home = None;
    let mut crypto_uuid = None;

    for op in ops {
        match &op.kind {
            OpKind::CreatePartition { part, resolved, crypto_uuid: uuid } => {
                if let Some(uuid) = uuid {
                    crypto_uuid = Some(uuid.clone());
                }

                let placed = match resolved {
                    Some(placed) => placed,
                    None => continue,
                };
                let part_ref = PartRef {
                    path: placed.path.clone(),
                    fs: part.fs.clone(),
                    created: true,
                };

                match part.role {
                    PartitionRole::Root => root = Some(part_ref),
                    PartitionRole::Esp => esp = Some(part_ref),
                    PartitionRole::Boot => boot = Some(part_ref),
                    PartitionRole::Swap => swap = Some(part_ref),
                    _ => (),
                }
            }
            OpKind::CreateLogicalVolume { vg, lv, role, fs, .. } => {
                let part_ref = PartRef {
                    path: lvm::lv_path(vg, lv),
                    fs: fs.clone(),
                    created: true,
                };
                match role {
                    PartitionRole::Root => root = Some(part_ref),
                    PartitionRole::Swap => swap = Some(part_ref),
                    PartitionRole::Home => home = Some(part_ref),
                    _ => (),
                }
            }
            OpKind::UseExistingSwap { path } => {
                swap = Some(PartRef {
                    path: path.clone(),
                    fs: FileSystem::Swap,
                    created: false,
                });
            }
            OpKind::UseExistingHome { path, fs } => {
                home = Some(PartRef {
                    path: path.clone(),
                    fs: fs.clone(),
                    created: false,
                });
            }
            OpKind::FormatPartition { path, fs, role, .. } => {
                let part_ref = PartRef {
                    path: path.clone(),
                    fs: fs.clone(),
                    created: true,
                };
                match role {
                    PartitionRole::Root => root = Some(part_ref),
                    PartitionRole::Esp => esp = Some(part_ref),
                    PartitionRole::Boot => boot = Some(part_ref),
                    PartitionRole::Home => home = Some(part_ref),
                    PartitionRole::Swap => swap = Some(part_ref),
                    _ => (),
                }
            }
            OpKind::CreateTable { .. }
            | OpKind::CreateVolumeGroup { .. }
            | OpKind::ResizeForeignOs { .. } => (),
        }
    }

    Ok(TargetLayout {
        root: root.ok_or(OpError::Unresolved("root"))?,
        esp,
        boot,
        swap,
        home,
        crypto_uuid,
    })
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else {
        format!("{} MiB", bytes / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GIB;
    use tempfile::NamedTempFile;

    fn editor(file: &NamedTempFile, bytes: u64, simulate: bool) -> TableEditor {
        file.as_file().set_len(bytes).unwrap();
        TableEditor::open(file.path(), 512, bytes / 512, simulate).unwrap()
    }

    fn plan(device: &Path) -> Vec<DiskOperation> {
        vec![
            DiskOperation::new(device, OpKind::CreateTable { kind: TableKind::Gpt }),
            DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(
                        PartitionRole::Esp,
                        FileSystem::Fat32,
                        Some(512 * MIB),
                    ),
                    resolved: None,
                    crypto_uuid: None,
                },
            ),
            DiskOperation::new(
                device,
                OpKind::CreatePartition {
                    part: NewPartition::new(PartitionRole::Root, FileSystem::Ext4, None),
                    resolved: None,
                    crypto_uuid: None,
                },
            ),
        ]
    }

    #[test]
    fn apply_resolves_partitions_in_order() {
        let file = NamedTempFile::new().unwrap();
        let mut editor = editor(&file, 8 * GIB, true);
        let mut ops = plan(file.path());

        apply_all(&mut ops, &mut editor).unwrap();

        let layout = resolve_layout(&ops).unwrap();
        assert!(layout.root.created);
        assert_eq!(layout.esp.as_ref().unwrap().fs, FileSystem::Fat32);
        assert!(layout.swap.is_none());
        assert!(ops.iter().all(|op| op.error.is_none()));
    }

    #[test]
    fn layout_without_root_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        let ops = vec![DiskOperation::new(
            file.path(),
            OpKind::UseExistingSwap { path: PathBuf::from("/dev/sda2") },
        )];

        assert!(matches!(
            resolve_layout(&ops),
            Err(OpError::Unresolved("root"))
        ));
    }

    #[test]
    fn adopted_partitions_are_not_marked_created() {
        let file = NamedTempFile::new().unwrap();
        let ops = vec![
            DiskOperation::new(
                file.path(),
                OpKind::FormatPartition {
                    path: PathBuf::from("/dev/sda3"),
                    fs: FileSystem::Ext4,
                    role: PartitionRole::Root,
                    late: false,
                },
            ),
            DiskOperation::new(
                file.path(),
                OpKind::UseExistingHome {
                    path: PathBuf::from("/dev/sda4"),
                    fs: FileSystem::Ext4,
                },
            ),
        ];

        let layout = resolve_layout(&ops).unwrap();
        assert!(layout.root.created);
        assert!(!layout.home.as_ref().unwrap().created);
    }

    #[test]
    fn format_phase_refuses_to_run_twice() {
        let file = NamedTempFile::new().unwrap();
        let mut editor = editor(&file, 2 * GIB, true);
        let mut op = DiskOperation::new(
            file.path(),
            OpKind::UseExistingSwap { path: PathBuf::from("/dev/sda2") },
        );

        op.apply_format(&mut editor).unwrap();
        assert!(matches!(
            op.apply_format(&mut editor),
            Err(OpError::AlreadyFormatted)
        ));
    }

    #[test]
    fn geometry_failures_are_recorded_on_the_operation() {
        let file = NamedTempFile::new().unwrap();
        let mut editor = editor(&file, 2 * GIB, true);
        let mut op = DiskOperation::new(
            file.path(),
            OpKind::CreatePartition {
                part: NewPartition::new(PartitionRole::Root, FileSystem::Ext4, None),
                resolved: None,
                crypto_uuid: None,
            },
        );

        // No table yet, so geometry resolution must fail loudly.
        assert!(op.apply(&mut editor).is_err());
        assert!(op.error.as_ref().unwrap().contains("no partition table"));
    }

    #[test]
    fn failed_adopted_format_is_recorded() {
        let file = NamedTempFile::new().unwrap();
        let mut editor = editor(&file, 2 * GIB, false);
        let mut op = DiskOperation::new(
            file.path(),
            OpKind::FormatPartition {
                // Neither the signature scrub nor mkfs can touch this.
                path: PathBuf::from("/dev/null"),
                fs: FileSystem::Ext4,
                role: PartitionRole::Root,
                late: false,
            },
        );

        assert!(op.apply_format(&mut editor).is_err());
        assert!(op.error.is_some());
    }

    #[test]
    fn failed_container_format_leaves_no_crypto_uuid() {
        let file = NamedTempFile::new().unwrap();
        let mut editor = editor(&file, 2 * GIB, false);
        let mut part = NewPartition::new(PartitionRole::LuksContainer, FileSystem::Ext4, None);
        part.passphrase = Some("hunter2".into());
        let mut op = DiskOperation::new(
            file.path(),
            OpKind::CreatePartition {
                part,
                // cryptsetup cannot format the null device.
                resolved: Some(ResolvedPartition {
                    number: 1,
                    path: PathBuf::from("/dev/null"),
                    start: 2048,
                    end: 4096,
                }),
                crypto_uuid: None,
            },
        );

        assert!(op.apply_format(&mut editor).is_err());
        assert!(op.error.is_some());
        if let OpKind::CreatePartition { crypto_uuid, .. } = &op.kind {
            assert!(crypto_uuid.is_none());
        }
        assert!(editor.luks_mapper.is_none());
    }

    #[test]
    fn unsupported_resize_reports_the_file_system() {
        let err = resize_filesystem(Path::new("/dev/sda1"), &FileSystem::Btrfs, GIB)
            .unwrap_err();
        assert!(matches!(err, OpError::Unresizable(ref fs) if fs == "btrfs"));
    }

    #[test]
    fn descriptions_name_device_and_size() {
        let device = Path::new("/dev/vda");
        let op = DiskOperation::new(
            device,
            OpKind::CreatePartition {
                part: NewPartition::new(PartitionRole::Swap, FileSystem::Swap, Some(4 * GIB)),
                resolved: None,
                crypto_uuid: None,
            },
        );
        assert_eq!(op.describe(), "create a 4 GiB swap partition on /dev/vda");

        let table = DiskOperation::new(device, OpKind::CreateTable { kind: TableKind::Mbr });
        assert_eq!(
            table.describe(),
            "create an MBR partition table on /dev/vda"
        );
    }
}
