// SPDX-License-Identifier: GPL-3.0-only

//! The installation engine: one worker thread owns the whole run, from
//! privilege elevation through disk mutation to the post-install pipeline.
//! The coordinating thread only receives progress callbacks.

use crate::install_info::InstallInfo;
use crate::privilege;
use crate::steps::{PostInstallStep, StepContext};
use anyhow::{anyhow, Context};
use disk_provision::ops::{self, DiskOperation, OpKind, PartRef};
use disk_provision::{active_swaps, external, inspect, luks, lvm, swaps_on, Device, TableEditor};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use sys_mount::{FilesystemType, Mount, Unmount, UnmountDrop, UnmountFlags};

/// Progress reported to the coordinating thread.
#[derive(Clone, Debug)]
pub enum InstallEvent {
    StepStarted { description: String, slow: bool },
    StepCompleted { description: String },
    Finished { result: Result<(), String> },
}

/// Fills the freshly mounted target root with the system image. Runs on
/// the worker thread between disk mutation and the post-install pipeline.
pub type PopulateHook = Box<dyn FnOnce(&Path) -> anyhow::Result<()> + Send>;

pub struct Installer {
    /// Where the new root is mounted during installation.
    pub target: PathBuf,
    /// Plan and report without writing anything to the device.
    pub simulate: bool,
    /// Transient live-medium account removed during cleanup.
    pub live_user: Option<String>,
    /// Clean default configuration files restored during cleanup.
    pub resources: Option<PathBuf>,
}

impl Default for Installer {
    fn default() -> Installer {
        Installer {
            target: PathBuf::from("/target"),
            simulate: false,
            live_user: None,
            resources: None,
        }
    }
}

impl Installer {
    /// Spawn the worker thread and run the installation to completion.
    /// Every outcome, success or failure, arrives as a final `Finished`
    /// event; the handle only confirms the thread exited.
    pub fn start<E>(
        self,
        device: Device,
        operations: Vec<DiskOperation>,
        info: InstallInfo,
        populate: PopulateHook,
        on_event: E,
    ) -> JoinHandle<()>
    where
        E: Fn(InstallEvent) + Send + 'static,
    {
        thread::spawn(move || {
            let mut operations = operations;
            let result = self.run(&device, &mut operations, &info, populate, &on_event);

            if let Err(why) = &result {
                error!("installation failed: {:#}", why);
                for op in &operations {
                    if let Some(error) = &op.error {
                        error!("  {}: {}", op.describe(), error);
                    }
                }
            }

            on_event(InstallEvent::Finished {
                result: result.map_err(|why| format!("{:#}", why)),
            });
        })
    }

    fn run(
        &self,
        device: &Device,
        operations: &mut [DiskOperation],
        info: &InstallInfo,
        populate: PopulateHook,
        on_event: &dyn Fn(InstallEvent),
    ) -> anyhow::Result<()> {
        info.validate()?;

        let _privileges = privilege::elevate()?;

        for op in operations.iter() {
            info!("planned: {}", op.describe());
        }

        // Live swap on the target would keep the kernel holding partitions
        // the plan is about to rewrite.
        if !self.simulate {
            for swap in swaps_on(&device.path, &active_swaps()) {
                external::swapoff(&swap).with_context(|| {
                    format!("unable to deactivate swap on {}", swap.display())
                })?;
            }
        }

        let mut editor = TableEditor::open(
            &device.path,
            device.sector_size,
            device.sectors,
            self.simulate,
        )
        .context("unable to open the target device")?;

        ops::apply_all(operations, &mut editor)
            .context("unable to lay out the partition table")?;

        if self.simulate {
            info!("simulation complete; no changes were written");
            return Ok(());
        }

        ops::format_all(operations, &mut editor)
            .context("unable to format the new partitions")?;

        let layout = ops::resolve_layout(operations)?;

        // The table changed under us; inspect reality again rather than
        // trusting the plan, and note any Windows install for later steps.
        let snapshot = inspect(device).context("unable to re-inspect the device")?;
        let windows_present = snapshot
            .real_partitions()
            .filter_map(|part| part.os.as_ref())
            .any(|os| os.is_windows());

        let mut mounts = self.mount_target(&layout)?;

        populate(&self.target).context("unable to populate the target")?;

        let mut ctx = StepContext {
            info,
            layout: &layout,
            target: &self.target,
            windows_present,
            live_user: self.live_user.clone(),
            resources: self.resources.clone(),
            vfs_mounts: Vec::new(),
        };

        let mut failure = None;
        for step in PostInstallStep::pipeline().iter_mut() {
            on_event(InstallEvent::StepStarted {
                description: step.describe().to_owned(),
                slow: step.is_slow(),
            });

            if !step.apply(&mut ctx) {
                let error = step
                    .error
                    .take()
                    .unwrap_or_else(|| "unknown error".to_owned());
                failure = Some(anyhow!("{}: {}", step.describe(), error));
                break;
            }

            on_event(InstallEvent::StepCompleted {
                description: step.describe().to_owned(),
            });
        }

        // Teardown is best-effort and runs on every path; unmount errors
        // must never mask the original failure.
        while let Some(mount) = ctx.vfs_mounts.pop() {
            drop(mount);
        }
        while let Some(mount) = mounts.pop() {
            drop(mount);
        }

        // The run leaves nothing holding the device: deactivate any volume
        // group it created and close the crypt container under it.
        if operations
            .iter()
            .any(|op| matches!(op.kind, OpKind::CreateVolumeGroup { .. }))
        {
            if let Err(why) = lvm::vg_deactivate(ops::VOLUME_GROUP) {
                warn!("unable to deactivate the volume group: {}", why);
            }
        }
        if layout.crypto_uuid.is_some() {
            if let Err(why) = luks::close_container(ops::LUKS_MAPPER) {
                warn!("unable to close the crypt container: {}", why);
            }
        }

        match failure {
            Some(why) => Err(why),
            None => Ok(()),
        }
    }

    /// Mount the resolved layout under the target root: root itself, then
    /// boot, the ESP, and home. Returned guards unmount in reverse order.
    fn mount_target(
        &self,
        layout: &ops::TargetLayout,
    ) -> anyhow::Result<Vec<UnmountDrop<Mount>>> {
        let mut mounts = Vec::new();

        fs::create_dir_all(&self.target).context("unable to create the target mount point")?;
        mounts.push(mount_part(&layout.root, &self.target)?);

        if let Some(boot) = &layout.boot {
            let dest = self.target.join("boot");
            fs::create_dir_all(&dest)?;
            mounts.push(mount_part(boot, &dest)?);
        }

        if let Some(esp) = &layout.esp {
            let dest = self.target.join("boot/efi");
            fs::create_dir_all(&dest)?;
            mounts.push(mount_part(esp, &dest)?);
        }

        if let Some(home) = &layout.home {
            let dest = self.target.join("home");
            fs::create_dir_all(&dest)?;
            mounts.push(mount_part(home, &dest)?);
        }

        Ok(mounts)
    }
}

fn mount_part(part: &PartRef, dest: &Path) -> anyhow::Result<UnmountDrop<Mount>> {
    let mount = Mount::builder()
        .fstype(FilesystemType::Manual(part.fs.as_str()))
        .mount(&part.path, dest)
        .with_context(|| {
            format!("unable to mount {} at {}", part.path.display(), dest.display())
        })?;

    Ok(mount.into_unmount_drop(UnmountFlags::DETACH))
}
