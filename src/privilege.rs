// SPDX-License-Identifier: GPL-3.0-only

//! Scoped privilege elevation for the worker thread.
//!
//! The process runs setuid-root via pkexec or sudo; the effective uid is
//! raised for the lifetime of the guard and dropped back to the original
//! caller when it goes out of scope, failure paths included.

use anyhow::Context;
use nix::unistd::{seteuid, Uid};
use std::env;

pub struct PrivilegeGuard {
    drop_to: Uid,
}

/// The identity that invoked the installer, taken from the elevation
/// helper's environment, or the current uid when running unelevated.
pub fn caller_uid() -> Uid {
    env::var("PKEXEC_UID")
        .or_else(|_| env::var("SUDO_UID"))
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .map(Uid::from_raw)
        .unwrap_or_else(Uid::current)
}

/// Raise the effective uid to root for the lifetime of the guard.
pub fn elevate() -> anyhow::Result<PrivilegeGuard> {
    let drop_to = caller_uid();
    seteuid(Uid::from_raw(0)).context("unable to elevate privileges")?;
    debug!("elevated privileges; will drop back to uid {}", drop_to);
    Ok(PrivilegeGuard { drop_to })
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if let Err(why) = seteuid(self.drop_to) {
            warn!("unable to drop privileges to uid {}: {}", self.drop_to, why);
        }
    }
}
