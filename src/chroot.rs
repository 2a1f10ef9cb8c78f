// SPDX-License-Identifier: GPL-3.0-only

//! Commands executed inside the mounted target root.

use cradle::prelude::*;
use std::path::Path;

fn root(target: &Path) -> String {
    target.to_string_lossy().into_owned()
}

/// Run a command inside the target root.
pub fn exec(target: &Path, command: Vec<String>) -> Result<(), cradle::Error> {
    debug!("chroot {}: {}", target.display(), command.join(" "));
    run_result!("chroot", root(target), command)
}

/// Run a shell fragment inside the target root; needed for redirections.
pub fn sh(target: &Path, script: &str) -> Result<(), cradle::Error> {
    debug!("chroot {}: sh -c '{}'", target.display(), script);
    run_result!("chroot", root(target), "sh", "-c", script)
}

/// Build an argument vector from string literals.
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}
