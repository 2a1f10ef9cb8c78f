// SPDX-License-Identifier: LGPL-3.0-only

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate thiserror;

mod device;
mod inspect;
mod inventory;
mod partitions;
mod table;

pub mod external;
pub mod luks;
pub mod lvm;
pub mod ops;
pub mod os_probe;
pub mod strategy;

pub use self::device::*;
pub use self::inspect::*;
pub use self::inventory::*;
pub use self::partitions::*;
pub use self::table::*;
