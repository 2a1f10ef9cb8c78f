// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::chroot;
use crate::install_info::BootloaderTarget;
use anyhow::Context;
use disk_provision::external;
use std::fs;
use sys_mount::{FilesystemType, Mount, Unmount, UnmountFlags};

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    match &ctx.info.bootloader {
        BootloaderTarget::Esp => {
            mount_efivars(ctx);
            stage_resume_parameter(ctx)?;
        }
        BootloaderTarget::Disk(disk) => {
            chroot::exec(
                ctx.target,
                vec![
                    "grub-install".to_owned(),
                    "--recheck".to_owned(),
                    disk.display().to_string(),
                ],
            )
            .with_context(|| format!("unable to install boot code to {}", disk.display()))?;
        }
    }

    chroot::exec(ctx.target, chroot::args(&["update-grub"]))
        .context("unable to update the boot manager configuration")?;

    Ok(())
}

/// Bind the EFI variable file system into the target so the boot manager
/// can register itself with the firmware. Some firmware refuses this;
/// the update still works without variables, so failure is a quirk, not
/// an error.
fn mount_efivars(ctx: &mut StepContext) {
    let dest = ctx.target.join("sys/firmware/efi/efivars");
    if let Err(why) = fs::create_dir_all(&dest) {
        warn!("unable to create the efivars mount point: {}", why);
        return;
    }

    match Mount::builder()
        .fstype(FilesystemType::Manual("efivarfs"))
        .mount("efivarfs", &dest)
    {
        Ok(mount) => ctx
            .vfs_mounts
            .push(mount.into_unmount_drop(UnmountFlags::DETACH)),
        Err(why) => warn!("unable to mount efivarfs; continuing without it: {}", why),
    }
}

/// Point the kernel's resume parameter at the swap partition so suspend
/// to disk works out of the box.
fn stage_resume_parameter(ctx: &StepContext) -> anyhow::Result<()> {
    let swap = match &ctx.layout.swap {
        Some(swap) => swap,
        None => return Ok(()),
    };

    let uuid = match external::blkid_uuid(&swap.path) {
        Some(uuid) => uuid,
        None => {
            warn!(
                "swap partition {} has no UUID; skipping the resume parameter",
                swap.path.display()
            );
            return Ok(());
        }
    };

    let dir = ctx.target.join("etc/default/grub.d");
    fs::create_dir_all(&dir).context("unable to create /etc/default/grub.d")?;
    fs::write(
        dir.join("99-installer-resume.cfg"),
        format!(
            "GRUB_CMDLINE_LINUX_DEFAULT=\"$GRUB_CMDLINE_LINUX_DEFAULT resume=UUID={}\"\n",
            uuid
        ),
    )
    .context("unable to write the resume configuration")?;

    Ok(())
}
