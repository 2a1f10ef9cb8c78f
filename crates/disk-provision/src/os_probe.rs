// SPDX-License-Identifier: LGPL-3.0-only

//! Best-effort identification of operating systems already present on a
//! partition. Nothing here is an error path: an unrecognized partition
//! simply yields `None`.

use crate::device::FileSystem;
use os_release::OsRelease;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sys_mount::{FilesystemType, Mount, MountFlags, SupportedFilesystems, Unmount, UnmountFlags};
use tempfile::TempDir;

/// Classification tag for a detected installation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsKind {
    Linux,
    Windows,
    /// A Windows boot-manager partition rather than a full system.
    WindowsBoot,
    Other,
}

/// A foreign operating system found on a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub kind: OsKind,
}

impl OsInfo {
    pub fn is_windows(&self) -> bool {
        matches!(self.kind, OsKind::Windows | OsKind::WindowsBoot)
    }
}

/// Detect an operating system on `partition`. Reuses an existing mountpoint
/// when the partition is already mounted; otherwise mounts it read-only on
/// a throwaway directory which is unmounted and removed on every exit path.
pub fn detect_foreign_os(
    partition: &Path,
    fs_hint: Option<&FileSystem>,
    mounts: &BTreeMap<PathBuf, PathBuf>,
) -> Option<OsInfo> {
    if let Some(mount_point) = mounts.get(partition) {
        return classify_root(mount_point);
    }

    let staging = match TempDir::new() {
        Ok(dir) => dir,
        Err(why) => {
            warn!("unable to create probe directory: {}", why);
            return None;
        }
    };

    let mut builder = Mount::builder().flags(MountFlags::RDONLY);

    let supported;
    match fs_hint {
        Some(fs) => builder = builder.fstype(FilesystemType::Manual(fs.as_str())),
        None => match SupportedFilesystems::new() {
            Ok(fs) => {
                supported = fs;
                builder = builder.fstype(FilesystemType::from(&supported));
            }
            Err(why) => {
                warn!("unable to list supported file systems: {}", why);
                return None;
            }
        },
    }

    let mount = match builder.mount(partition, staging.path()) {
        Ok(mount) => mount,
        Err(why) => {
            debug!("probe mount of {} failed: {}", partition.display(), why);
            return None;
        }
    };

    // Unmounts when dropped, before the staging directory is removed.
    let guard = mount.into_unmount_drop(UnmountFlags::DETACH);
    let result = classify_root(staging.path());
    drop(guard);

    result
}

/// Identify an operating system from the contents of a mounted root.
/// Checked in priority order: full Windows systems, Windows boot manager
/// partitions, then Linux release files.
pub fn classify_root(root: &Path) -> Option<OsInfo> {
    if let Some(name) = windows_system(root) {
        return Some(OsInfo {
            name,
            kind: OsKind::Windows,
        });
    }

    if windows_boot_manager(root) {
        return Some(OsInfo {
            name: "Windows Boot Manager".to_owned(),
            kind: OsKind::WindowsBoot,
        });
    }

    if let Some(name) = linux_release(root) {
        return Some(OsInfo {
            name,
            kind: OsKind::Linux,
        });
    }

    None
}

/// A full Windows installation carries a servicing version directory whose
/// name encodes the release.
fn windows_system(root: &Path) -> Option<String> {
    if !root.join("Windows/System32/config").is_dir() {
        return None;
    }

    let version = fs::read_dir(root.join("Windows/servicing/Version"))
        .ok()
        .and_then(|dir| {
            dir.filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .max()
        });

    Some(match version {
        Some(version) => windows_version_name(&version),
        None => "Windows".to_owned(),
    })
}

/// Map a servicing version string such as `10.0.19041.1` to a marketing
/// name. Windows 11 kept the 10.0 prefix and is distinguished by build.
fn windows_version_name(version: &str) -> String {
    let mut fields = version.split('.');
    let major = fields.next().unwrap_or("");
    let minor = fields.next().unwrap_or("");
    let build = fields.next().and_then(|b| b.parse::<u32>().ok());

    let name = match (major, minor) {
        ("10", "0") => {
            if build.map_or(false, |b| b >= 22000) {
                "Windows 11"
            } else {
                "Windows 10"
            }
        }
        ("6", "3") => "Windows 8.1",
        ("6", "2") => "Windows 8",
        ("6", "1") => "Windows 7",
        ("6", "0") => "Windows Vista",
        ("5", "1") => "Windows XP",
        _ => "Windows",
    };

    name.to_owned()
}

/// Known marker files of the Windows boot manager, covering both the BIOS
/// and the UEFI loader layouts.
fn windows_boot_manager(root: &Path) -> bool {
    const MARKERS: &[&str] = &[
        "bootmgr",
        "Boot/BCD",
        "EFI/Microsoft/Boot/bootmgfw.efi",
        "EFI/Microsoft/Boot/BCD",
    ];

    MARKERS.iter().any(|marker| root.join(marker).exists())
}

/// Linux identification: os-release `PRETTY_NAME` falling back to `NAME`,
/// then lsb-release `DISTRIB_DESCRIPTION` falling back to `DISTRIB_ID`.
fn linux_release(root: &Path) -> Option<String> {
    if let Ok(release) = OsRelease::new_from(&root.join("etc/os-release")) {
        if !release.pretty_name.is_empty() {
            return Some(release.pretty_name);
        }
        if !release.name.is_empty() {
            return Some(release.name);
        }
    }

    let lsb = fs::read_to_string(root.join("etc/lsb-release")).ok()?;
    lsb_field(&lsb, "DISTRIB_DESCRIPTION").or_else(|| lsb_field(&lsb, "DISTRIB_ID"))
}

fn lsb_field(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.strip_prefix(key)?.strip_prefix('=')?;
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn windows_10_detected_by_servicing_version() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Windows/System32/config/SOFTWARE");
        fs::create_dir_all(dir.path().join("Windows/servicing/Version/10.0.19041.1"))
            .unwrap();

        let os = classify_root(dir.path()).unwrap();
        assert_eq!(os.kind, OsKind::Windows);
        assert_eq!(os.name, "Windows 10");
        assert!(os.is_windows());
    }

    #[test]
    fn windows_11_distinguished_by_build() {
        assert_eq!(windows_version_name("10.0.22631.2861"), "Windows 11");
        assert_eq!(windows_version_name("10.0.19045.0"), "Windows 10");
        assert_eq!(windows_version_name("6.1.7601.0"), "Windows 7");
    }

    #[test]
    fn boot_manager_partition_is_not_a_full_system() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "EFI/Microsoft/Boot/bootmgfw.efi");

        let os = classify_root(dir.path()).unwrap();
        assert_eq!(os.kind, OsKind::WindowsBoot);
    }

    #[test]
    fn linux_pretty_name_preferred_over_name() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "etc/os-release",
            "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n",
        );

        let os = classify_root(dir.path()).unwrap();
        assert_eq!(os.kind, OsKind::Linux);
        assert_eq!(os.name, "Debian GNU/Linux 12 (bookworm)");
    }

    #[test]
    fn lsb_release_fallback() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "etc/lsb-release",
            "DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\n",
        );

        let os = classify_root(dir.path()).unwrap();
        assert_eq!(os.name, "Ubuntu");
    }

    #[test]
    fn unrecognized_root_yields_none_repeatedly() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "random-file");

        assert!(classify_root(dir.path()).is_none());
        // A second pass sees the same answer and leaves no residue behind.
        assert!(classify_root(dir.path()).is_none());
        assert!(dir.path().join("random-file").exists());
    }
}
