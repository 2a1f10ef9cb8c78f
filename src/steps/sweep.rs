// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::chroot;

/// System-reconfiguration commands run at the very end. Each is desirable
/// rather than essential, so individual failures are logged and skipped.
const SWEEP: &[&[&str]] = &[
    &["glib-compile-schemas", "/usr/share/glib-2.0/schemas"],
    &["ldconfig"],
    &["update-desktop-database", "-q"],
    &["fc-cache", "-s"],
];

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    for command in SWEEP {
        if let Err(why) = chroot::exec(ctx.target, chroot::args(command)) {
            warn!("sweep command '{}' failed: {}", command.join(" "), why);
        }
    }

    // Push everything to disk before the caller offers a reboot.
    nix::unistd::sync();

    Ok(())
}
