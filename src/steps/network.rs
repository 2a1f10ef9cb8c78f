// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use anyhow::Context;
use std::fs;

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    let hostname = &ctx.info.hostname;

    fs::write(ctx.target.join("etc/hostname"), format!("{}\n", hostname))
        .context("unable to write /etc/hostname")?;

    fs::write(ctx.target.join("etc/hosts"), hosts_content(hostname))
        .context("unable to write /etc/hosts")?;

    Ok(())
}

/// `/etc/hosts` with the loopback aliases and the IPv6 boilerplate block.
pub fn hosts_content(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{}\n\
         \n\
         # The following lines are desirable for IPv6 capable hosts\n\
         ::1     localhost ip6-localhost ip6-loopback\n\
         ff02::1 ip6-allnodes\n\
         ff02::2 ip6-allrouters\n",
        hostname
    )
}
