// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::chroot;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Remove the live-medium account and installer-only files, then restore
/// clean default configuration from the resource directory.
pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    if let Some(user) = &ctx.live_user {
        // The account may already be absent on some media.
        if let Err(why) = chroot::exec(ctx.target, chroot_userdel(user)) {
            warn!("unable to remove live user '{}': {}", user, why);
        }
    }

    for relative in &["var/lib/installer", "etc/installer.conf"] {
        let path = ctx.target.join(relative);
        if path.exists() {
            remove_any(&path)
                .with_context(|| format!("unable to remove {}", path.display()))?;
        }
    }

    if let Some(resources) = &ctx.resources {
        restore_defaults(resources, ctx.target)?;
    }

    Ok(())
}

fn chroot_userdel(user: &str) -> Vec<String> {
    vec!["userdel".to_owned(), "-r".to_owned(), user.to_owned()]
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy every file under the resource tree into the target, preserving
/// relative paths and overwriting installer-branded originals.
fn restore_defaults(resources: &Path, target: &Path) -> anyhow::Result<()> {
    let mut stack = vec![resources.to_owned()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("unable to read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                stack.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(resources)
                .context("resource path escaped its root")?;
            let dest = target.join(relative);

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::copy(&path, &dest)
                .with_context(|| format!("unable to restore {}", dest.display()))?;
        }
    }

    Ok(())
}
