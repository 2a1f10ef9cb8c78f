// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use anyhow::Context;
use std::fs;
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

/// Kernel virtual file systems the chroot-scoped steps depend on, bound
/// into the target in this order and unwound in reverse.
const BINDS: &[(&str, &str)] = &[
    ("/dev", "dev"),
    ("/dev/shm", "dev/shm"),
    ("/dev/pts", "dev/pts"),
    ("/sys", "sys"),
    ("/proc", "proc"),
];

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    for (source, relative) in BINDS {
        let dest = ctx.target.join(relative);
        fs::create_dir_all(&dest)
            .with_context(|| format!("unable to create {}", dest.display()))?;

        let mount = Mount::builder()
            .flags(MountFlags::BIND)
            .mount(source, &dest)
            .with_context(|| format!("unable to bind {} to {}", source, dest.display()))?;

        ctx.vfs_mounts.push(mount.into_unmount_drop(UnmountFlags::DETACH));
    }

    Ok(())
}
