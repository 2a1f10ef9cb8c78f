// SPDX-License-Identifier: GPL-3.0-only

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod chroot;
pub mod engine;
pub mod install_info;
pub mod privilege;
pub mod steps;

pub use self::engine::{InstallEvent, Installer, PopulateHook};
pub use self::install_info::*;
