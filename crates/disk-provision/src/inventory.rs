// SPDX-License-Identifier: LGPL-3.0-only

//! Best-effort enumeration of whole-disk block devices and firmware facts.
//!
//! Everything in this module reads the kernel's file interfaces. An
//! unreadable file degrades to "unknown"/empty rather than failing, since
//! listing devices must never abort an installation attempt.

use crate::device::Device;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Firmware facts resolved once at startup and cached for process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareEnv {
    /// True when the system booted through UEFI firmware.
    pub uefi: bool,
    /// Firmware word size: 32 or 64.
    pub bits: u8,
    /// Vendor firmware known to mishandle additional UEFI boot entries
    /// alongside a Windows setup. Disables dual-boot style provisioning.
    pub broken_uefi_setup: bool,
}

impl FirmwareEnv {
    pub fn detect() -> &'static FirmwareEnv {
        static ENV: OnceLock<FirmwareEnv> = OnceLock::new();
        ENV.get_or_init(|| {
            let uefi = Path::new("/sys/firmware/efi").exists();

            let bits = fs::read_to_string("/sys/firmware/efi/fw_platform_size")
                .ok()
                .and_then(|raw| raw.trim().parse::<u8>().ok())
                .unwrap_or(64);

            let vendor = fs::read_to_string("/sys/class/dmi/id/sys_vendor")
                .unwrap_or_default();

            let env = FirmwareEnv {
                uefi,
                bits,
                broken_uefi_setup: uefi && quirky_vendor(vendor.trim()),
            };

            info!(
                "firmware: uefi={} bits={} quirk={}",
                env.uefi, env.bits, env.broken_uefi_setup
            );

            env
        })
    }
}

/// Vendors whose firmware is known to drop or reorder extra UEFI entries
/// when a Windows boot manager is present.
fn quirky_vendor(vendor: &str) -> bool {
    const QUIRKY: &[&str] = &["Insyde", "ILIFE"];
    QUIRKY.iter().any(|v| vendor.starts_with(v))
}

/// Whether a `/proc/partitions` entry names a whole disk rather than a
/// partition of one. Plain disks (`sda`, `vda`, `hda`), eMMC (`mmcblk0`),
/// NVMe namespaces (`nvme0n1`) and software RAID (`md0`) qualify.
pub fn is_whole_disk_name(name: &str) -> bool {
    fn digits(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
    }

    fn letters(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase())
    }

    for prefix in &["sd", "vd", "hd"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return letters(rest);
        }
    }

    if let Some(rest) = name.strip_prefix("mmcblk") {
        return digits(rest);
    }

    if let Some(rest) = name.strip_prefix("nvme") {
        // nvme<ctrl>n<namespace>, but not nvme<ctrl>n<namespace>p<part>
        let mut parts = rest.split('n');
        return match (parts.next(), parts.next(), parts.next()) {
            (Some(ctrl), Some(ns), None) => digits(ctrl) && digits(ns) && !ns.contains('p'),
            _ => false,
        };
    }

    if let Some(rest) = name.strip_prefix("md") {
        return digits(rest);
    }

    false
}

/// Parse the body of `/proc/partitions` into `(name, size_in_1k_blocks)`
/// rows, keeping only whole-disk entries.
pub fn parse_proc_partitions(text: &str) -> Vec<(String, u64)> {
    let mut rows = Vec::new();

    for line in text.lines().skip(2) {
        let mut fields = line.split_whitespace();
        let _major = fields.next();
        let _minor = fields.next();
        let blocks = fields.next().and_then(|f| f.parse::<u64>().ok());
        let name = fields.next();

        if let (Some(blocks), Some(name)) = (blocks, name) {
            if is_whole_disk_name(name) {
                rows.push((name.to_owned(), blocks));
            }
        }
    }

    rows
}

/// Read a sysfs attribute for a block device, such as `queue/rotational`.
fn sysfs_block_attr(name: &str, attr: &str) -> Option<String> {
    let path = Path::new("/sys/class/block").join(name).join(attr);
    fs::read_to_string(path).ok().map(|raw| raw.trim().to_owned())
}

fn logical_sector_size(name: &str) -> u64 {
    sysfs_block_attr(name, "queue/logical_block_size")
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|size| *size >= 512)
        .unwrap_or(512)
}

/// Enumerate whole-disk block devices from the kernel's partition listing,
/// deduplicated by resolved real path. Purely a read; mutates nothing.
pub fn scan_devices() -> Vec<Device> {
    let listing = match fs::read_to_string("/proc/partitions") {
        Ok(listing) => listing,
        Err(why) => {
            warn!("unable to read /proc/partitions: {}", why);
            return Vec::new();
        }
    };

    let mut seen = BTreeSet::new();
    let mut devices = Vec::new();

    for (name, blocks) in parse_proc_partitions(&listing) {
        let path = ward::ward!(
            Path::new("/dev").join(&name).canonicalize().ok(),
            else {
                warn!("{}: device node did not resolve", name);
                continue;
            }
        );

        if !seen.insert(path.clone()) {
            continue;
        }

        let sector_size = logical_sector_size(&name);

        let rotational = sysfs_block_attr(&name, "queue/rotational")
            .map_or(false, |raw| raw == "1");

        let model = sysfs_block_attr(&name, "device/model").unwrap_or_default();

        info!(
            "discovered {} ({} MiB, sector size {})",
            path.display(),
            blocks / 1024,
            sector_size
        );

        devices.push(Device {
            path,
            sectors: blocks * 1024 / sector_size,
            sector_size,
            rotational,
            model,
        });
    }

    devices
}

/// Whether a device is backed by solid-state storage. eMMC devices are
/// never treated as trim-eligible, whatever their rotational flag says.
pub fn is_solid_state(device: &Device) -> bool {
    if device.name().starts_with("mmcblk") {
        return false;
    }

    !device.rotational
}

/// Parse `/proc/mounts` content into a `source -> mountpoint` map. Only the
/// first mountpoint per source is retained.
pub fn parse_mounts(text: &str) -> BTreeMap<PathBuf, PathBuf> {
    let mut table = BTreeMap::new();

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(source), Some(dest)) = (fields.next(), fields.next()) {
            if source.starts_with("/dev/") {
                table
                    .entry(PathBuf::from(source))
                    .or_insert_with(|| PathBuf::from(unescape_mount_field(dest)));
            }
        }
    }

    table
}

/// `/proc/mounts` escapes spaces and other characters as octal sequences.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut bytes = field.bytes().peekable();

    while let Some(byte) = bytes.next() {
        if byte == b'\\' {
            let mut code = 0u32;
            let mut digits = 0;
            while digits < 3 {
                match bytes.peek() {
                    Some(d) if d.is_ascii_digit() => {
                        code = code * 8 + u32::from(d - b'0');
                        bytes.next();
                        digits += 1;
                    }
                    _ => break,
                }
            }
            if digits == 3 {
                out.push(code as u8 as char);
                continue;
            }
            out.push('\\');
        } else {
            out.push(byte as char);
        }
    }

    out
}

/// The live mount table, used to avoid double-mounting and to find
/// already-mounted foreign partitions for inspection.
pub fn mount_table() -> BTreeMap<PathBuf, PathBuf> {
    match fs::read_to_string("/proc/mounts") {
        Ok(text) => parse_mounts(&text),
        Err(why) => {
            warn!("unable to read /proc/mounts: {}", why);
            BTreeMap::new()
        }
    }
}

/// Parse `/proc/swaps` content into the set of active swap devices.
pub fn parse_swaps(text: &str) -> BTreeSet<PathBuf> {
    text.lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter(|source| source.starts_with("/dev/"))
        .map(PathBuf::from)
        .collect()
}

/// Devices currently in use as swap.
pub fn active_swaps() -> BTreeSet<PathBuf> {
    match fs::read_to_string("/proc/swaps") {
        Ok(text) => parse_swaps(&text),
        Err(why) => {
            warn!("unable to read /proc/swaps: {}", why);
            BTreeSet::new()
        }
    }
}

/// The subset of `swaps` that are partitions of `device`. Matching is by
/// name: the device path followed by a partition number, with the `p`
/// infix used by nvme/mmc naming.
pub fn swaps_on(device: &Path, swaps: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let prefix = device.to_string_lossy().into_owned();

    swaps
        .iter()
        .filter(|swap| {
            let name = swap.to_string_lossy();
            match name.strip_prefix(&prefix) {
                Some(rest) => {
                    let rest = rest.strip_prefix('p').unwrap_or(rest);
                    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
                }
                None => false,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_PARTITIONS: &str = "\
major minor  #blocks  name

   8        0  234431064 sda
   8        1     524288 sda1
   8        2  233905152 sda2
 259        0  500107608 nvme0n1
 259        1     498688 nvme0n1p1
 179        0   62367744 mmcblk0
 179        1   62366720 mmcblk0p1
   9        0  976630336 md0
   7        0    1048576 loop0
";

    #[test]
    fn whole_disks_only() {
        let rows = parse_proc_partitions(PROC_PARTITIONS);
        let names: Vec<&str> = rows.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["sda", "nvme0n1", "mmcblk0", "md0"]);
        assert_eq!(rows[0].1, 234431064);
    }

    #[test]
    fn partition_names_are_rejected() {
        assert!(is_whole_disk_name("sda"));
        assert!(!is_whole_disk_name("sda1"));
        assert!(is_whole_disk_name("nvme0n1"));
        assert!(!is_whole_disk_name("nvme0n1p1"));
        assert!(is_whole_disk_name("mmcblk1"));
        assert!(!is_whole_disk_name("mmcblk1p2"));
        assert!(!is_whole_disk_name("loop0"));
        assert!(!is_whole_disk_name("dm-0"));
    }

    #[test]
    fn emmc_is_never_trim_eligible() {
        let emmc = Device {
            path: PathBuf::from("/dev/mmcblk0"),
            sectors: 1024,
            sector_size: 512,
            rotational: false,
            model: String::new(),
        };
        assert!(!is_solid_state(&emmc));

        let nvme = Device {
            path: PathBuf::from("/dev/nvme0n1"),
            ..emmc.clone()
        };
        assert!(is_solid_state(&nvme));
    }

    #[test]
    fn mount_table_parses_and_unescapes() {
        let text = "\
/dev/sda2 / ext4 rw,noatime 0 0
/dev/sda1 /boot/efi vfat rw 0 0
proc /proc proc rw 0 0
/dev/sdb1 /mnt/with\\040space ext4 rw 0 0
";
        let table = parse_mounts(text);
        assert_eq!(table[Path::new("/dev/sda2")], PathBuf::from("/"));
        assert_eq!(table[Path::new("/dev/sda1")], PathBuf::from("/boot/efi"));
        assert_eq!(
            table[Path::new("/dev/sdb1")],
            PathBuf::from("/mnt/with space")
        );
        assert!(!table.contains_key(Path::new("proc")));
    }

    #[test]
    fn swap_listing() {
        let text = "\
Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority
/dev/sda3                               partition\t4194300\t\t0\t\t-2
/swapfile                               file\t\t1048572\t\t0\t\t-3
";
        let swaps = parse_swaps(text);
        assert!(swaps.contains(Path::new("/dev/sda3")));
        assert_eq!(swaps.len(), 1);
    }

    #[test]
    fn swap_filter_matches_one_disk_only() {
        let swaps: BTreeSet<PathBuf> = [
            "/dev/sda2",
            "/dev/sdab1",
            "/dev/nvme0n1p3",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        assert_eq!(
            swaps_on(Path::new("/dev/sda"), &swaps),
            vec![PathBuf::from("/dev/sda2")]
        );
        assert_eq!(
            swaps_on(Path::new("/dev/nvme0n1"), &swaps),
            vec![PathBuf::from("/dev/nvme0n1p3")]
        );
        assert!(swaps_on(Path::new("/dev/sdb"), &swaps).is_empty());
    }
}
