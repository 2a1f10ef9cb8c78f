// SPDX-License-Identifier: LGPL-3.0-only

//! Thin wrappers over the LVM command-line tools. These only run during
//! the format phase, once the backing partition exists on disk.

use cradle::prelude::*;
use std::path::{Path, PathBuf};

pub fn pv_create(device: &Path) -> Result<(), cradle::Error> {
    info!("creating LVM PV on {}", device.display());
    run_result!("pvcreate", "-ff", "-y", device.to_string_lossy().into_owned())
}

pub fn vg_create(vg: &str, device: &Path) -> Result<(), cradle::Error> {
    info!("creating LVM VG {} on {}", vg, device.display());
    run_result!("vgcreate", "-f", vg, device.to_string_lossy().into_owned())
}

/// Create a logical volume. `size_bytes` of `None` consumes all remaining
/// free extents in the group.
pub fn lv_create(vg: &str, lv: &str, size_bytes: Option<u64>) -> Result<(), cradle::Error> {
    info!("creating LVM LV {}/{}", vg, lv);
    match size_bytes {
        Some(bytes) => run_result!(
            "lvcreate",
            "-y",
            "-L",
            format!("{}b", bytes),
            "-n",
            lv,
            vg
        ),
        None => run_result!("lvcreate", "-y", "-l", "100%FREE", "-n", lv, vg),
    }
}

pub fn vg_activate(vg: &str) -> Result<(), cradle::Error> {
    info!("activating LVM VG {}", vg);
    run_result!("vgchange", "-ay", vg)
}

pub fn vg_deactivate(vg: &str) -> Result<(), cradle::Error> {
    info!("deactivating LVM VG {}", vg);
    run_result!("vgchange", "-an", vg)
}

/// Path of a logical volume's device node.
pub fn lv_path(vg: &str, lv: &str) -> PathBuf {
    Path::new("/dev").join(vg).join(lv)
}
