// SPDX-License-Identifier: GPL-3.0-only

//! The post-install pipeline: ordered, chroot-scoped configuration steps
//! run against the populated target root. The pipeline halts at the first
//! failing step; bind mounts accumulated along the way stay tracked in the
//! context so the engine can unwind them even after a failure.

mod bootloader;
mod cleanup;
mod fstab;
mod keyboard;
mod locale;
mod machine_id;
mod network;
mod sweep;
mod timezone;
mod users;
mod vfs;

pub use self::fstab::generate_fstab;
pub use self::keyboard::keyboard_stanza;
pub use self::locale::normalize_locale;
pub use self::network::hosts_content;

use crate::install_info::InstallInfo;
use disk_provision::ops::TargetLayout;
use std::path::{Path, PathBuf};
use sys_mount::{Mount, UnmountDrop};

/// Shared state threaded through the pipeline.
pub struct StepContext<'a> {
    pub info: &'a InstallInfo,
    pub layout: &'a TargetLayout,
    /// Mount point of the new root.
    pub target: &'a Path,
    /// A Windows installation exists somewhere on the machine.
    pub windows_present: bool,
    /// Transient account of the live installation medium, to be removed.
    pub live_user: Option<String>,
    /// Clean default configuration files replacing installer branding.
    pub resources: Option<PathBuf>,
    /// Virtual-filesystem bind mounts, unwound by the engine in reverse
    /// order whether or not the pipeline finished.
    pub vfs_mounts: Vec<UnmountDrop<Mount>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    MountVirtual,
    InstallerCleanup,
    MachineId,
    Users,
    Network,
    Locale,
    Timezone,
    Keyboard,
    Fstab,
    Bootloader,
    FinalSweep,
}

pub struct PostInstallStep {
    pub kind: StepKind,
    pub error: Option<String>,
}

impl PostInstallStep {
    /// The full pipeline, in execution order.
    pub fn pipeline() -> Vec<PostInstallStep> {
        use self::StepKind::*;

        [
            MountVirtual,
            InstallerCleanup,
            MachineId,
            Users,
            Network,
            Locale,
            Timezone,
            Keyboard,
            Fstab,
            Bootloader,
            FinalSweep,
        ]
        .iter()
        .map(|&kind| PostInstallStep { kind, error: None })
        .collect()
    }

    pub fn describe(&self) -> &'static str {
        match self.kind {
            StepKind::MountVirtual => "mounting virtual file systems",
            StepKind::InstallerCleanup => "removing installation-medium remnants",
            StepKind::MachineId => "regenerating the machine identity",
            StepKind::Users => "creating user accounts",
            StepKind::Network => "configuring hostname and hosts",
            StepKind::Locale => "configuring the system locale",
            StepKind::Timezone => "configuring the time zone",
            StepKind::Keyboard => "configuring the keyboard layout",
            StepKind::Fstab => "writing the file system table",
            StepKind::Bootloader => "installing the boot loader",
            StepKind::FinalSweep => "running the final configuration sweep",
        }
    }

    /// Steps whose duration is dominated by external tools, flagged so a
    /// caller can switch to indeterminate progress.
    pub fn is_slow(&self) -> bool {
        matches!(
            self.kind,
            StepKind::InstallerCleanup | StepKind::Bootloader | StepKind::FinalSweep
        )
    }

    /// Run the step. A failure fills the error slot and returns false; the
    /// caller must not continue the pipeline after that.
    pub fn apply(&mut self, ctx: &mut StepContext) -> bool {
        info!("post-install: {}", self.describe());

        let result = match self.kind {
            StepKind::MountVirtual => vfs::apply(ctx),
            StepKind::InstallerCleanup => cleanup::apply(ctx),
            StepKind::MachineId => machine_id::apply(ctx),
            StepKind::Users => users::apply(ctx),
            StepKind::Network => network::apply(ctx),
            StepKind::Locale => locale::apply(ctx),
            StepKind::Timezone => timezone::apply(ctx),
            StepKind::Keyboard => keyboard::apply(ctx),
            StepKind::Fstab => fstab::apply(ctx),
            StepKind::Bootloader => bootloader::apply(ctx),
            StepKind::FinalSweep => sweep::apply(ctx),
        };

        match result {
            Ok(()) => true,
            Err(why) => {
                error!("{} failed: {:#}", self.describe(), why);
                self.error = Some(format!("{:#}", why));
                false
            }
        }
    }
}
