// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::chroot;
use anyhow::Context;
use std::fs;

/// Delete the machine identity inherited from the installation medium and
/// regenerate a fresh one inside the target.
pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    for relative in &["etc/machine-id", "var/lib/dbus/machine-id"] {
        let path = ctx.target.join(relative);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("unable to remove {}", path.display()))?;
        }
    }

    chroot::exec(ctx.target, chroot::args(&["systemd-machine-id-setup"]))
        .context("unable to regenerate the machine id")?;

    Ok(())
}
