// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::chroot;
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

/// Supplementary groups for every account.
const BASE_GROUPS: &[&str] = &["users", "video", "audio", "plugdev"];

/// Additional groups for administrators.
const ADMIN_GROUPS: &[&str] = &["adm", "sudo", "lpadmin"];

/// Credentials file inside the target, removed on every exit path.
const CREDENTIALS: &str = "tmp/.installer-credentials";

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    for user in &ctx.info.users {
        let mut groups: Vec<&str> = BASE_GROUPS.to_vec();
        if user.admin {
            groups.extend_from_slice(ADMIN_GROUPS);
        }

        chroot::exec(
            ctx.target,
            vec![
                "useradd".to_owned(),
                "-m".to_owned(),
                "-s".to_owned(),
                "/bin/bash".to_owned(),
                "-c".to_owned(),
                user.real_name.clone(),
                "-G".to_owned(),
                groups.join(","),
                user.username.clone(),
            ],
        )
        .with_context(|| format!("unable to create user '{}'", user.username))?;
    }

    set_passwords(ctx)?;

    chroot::exec(ctx.target, chroot::args(&["passwd", "-l", "root"]))
        .context("unable to lock the root account")?;

    Ok(())
}

/// Apply every password in one chpasswd invocation, fed from a 0600 file
/// that is deleted whether or not the command succeeded.
fn set_passwords(ctx: &mut StepContext) -> anyhow::Result<()> {
    let credentials = ctx.target.join(CREDENTIALS);
    if let Some(parent) = credentials.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&credentials)
            .context("unable to stage the credentials file")?;

        for user in &ctx.info.users {
            writeln!(file, "{}:{}", user.username, user.password)?;
        }
    }

    let result = chroot::sh(ctx.target, &format!("chpasswd < /{}", CREDENTIALS));

    if let Err(why) = fs::remove_file(&credentials) {
        warn!("unable to remove the credentials file: {}", why);
    }

    result.context("unable to apply user passwords")?;
    Ok(())
}
