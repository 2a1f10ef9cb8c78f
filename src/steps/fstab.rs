// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use anyhow::{bail, Context};
use disk_provision::external;
use disk_provision::ops::TargetLayout;
use std::fs;
use std::path::Path;

const HEADER: &str = "\
# /etc/fstab: static file system information.
#
# Use 'blkid' to print the universally unique identifier for a device;
# this may be used with UUID= as a more robust way to name devices that
# works even if disks are added and removed. See fstab(5).
#
# <file system>\t<mount point>\t<type>\t<options>\t<dump>\t<pass>
";

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    let table = generate_fstab(ctx.layout, &|path| external::blkid_uuid(path))?;
    fs::write(ctx.target.join("etc/fstab"), table).context("unable to write /etc/fstab")?;
    Ok(())
}

/// Render `/etc/fstab` for a resolved layout. Entries appear in a fixed
/// order with root last. Swap (and only non-root entries) may fall back to
/// the raw device path when no UUID is resolvable; a root without a UUID
/// is a hard failure since the system would not boot.
pub fn generate_fstab(
    layout: &TargetLayout,
    uuid_of: &dyn Fn(&Path) -> Option<String>,
) -> anyhow::Result<String> {
    let mut table = String::from(HEADER);

    let source = |path: &Path| -> String {
        match uuid_of(path) {
            Some(uuid) => format!("UUID={}", uuid),
            None => {
                warn!(
                    "no UUID for {}; falling back to the device path",
                    path.display()
                );
                path.display().to_string()
            }
        }
    };

    if let Some(home) = &layout.home {
        table.push_str(&format!(
            "{}\t/home\t{}\tdefaults\t0\t2\n",
            source(&home.path),
            home.fs.as_str()
        ));
    }

    if let Some(boot) = &layout.boot {
        table.push_str(&format!(
            "{}\t/boot\t{}\tdefaults\t0\t2\n",
            source(&boot.path),
            boot.fs.as_str()
        ));
    }

    if let Some(esp) = &layout.esp {
        table.push_str(&format!(
            "{}\t/boot/efi\tvfat\tumask=0077\t0\t0\n",
            source(&esp.path)
        ));
    }

    if let Some(swap) = &layout.swap {
        table.push_str(&format!("{}\tnone\tswap\tsw\t0\t0\n", source(&swap.path)));
    }

    let root_uuid = match uuid_of(&layout.root.path) {
        Some(uuid) => uuid,
        None => bail!(
            "root partition {} has no UUID",
            layout.root.path.display()
        ),
    };
    table.push_str(&format!(
        "UUID={}\t/\t{}\terrors=remount-ro\t0\t1\n",
        root_uuid,
        layout.root.fs.as_str()
    ));

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_provision::ops::PartRef;
    use disk_provision::FileSystem;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn part(path: &str, fs: FileSystem) -> PartRef {
        PartRef {
            path: PathBuf::from(path),
            fs,
            created: true,
        }
    }

    fn layout() -> TargetLayout {
        TargetLayout {
            root: part("/dev/sda3", FileSystem::Ext4),
            esp: Some(part("/dev/sda1", FileSystem::Fat32)),
            boot: None,
            swap: Some(part("/dev/sda2", FileSystem::Swap)),
            home: Some(part("/dev/sdb1", FileSystem::Ext4)),
            crypto_uuid: None,
        }
    }

    fn uuids() -> BTreeMap<PathBuf, String> {
        let mut map = BTreeMap::new();
        map.insert(PathBuf::from("/dev/sda1"), "AAAA-BBBB".to_owned());
        map.insert(PathBuf::from("/dev/sda2"), "swap-uuid".to_owned());
        map.insert(PathBuf::from("/dev/sda3"), "root-uuid".to_owned());
        map.insert(PathBuf::from("/dev/sdb1"), "home-uuid".to_owned());
        map
    }

    #[test]
    fn entries_follow_the_fixed_order_with_root_last() {
        let uuids = uuids();
        let table = generate_fstab(&layout(), &|p| uuids.get(p).cloned()).unwrap();

        assert!(table.starts_with("# /etc/fstab"));

        let entries: Vec<&str> = table
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect();
        assert_eq!(
            entries,
            vec![
                "UUID=home-uuid\t/home\text4\tdefaults\t0\t2",
                "UUID=AAAA-BBBB\t/boot/efi\tvfat\tumask=0077\t0\t0",
                "UUID=swap-uuid\tnone\tswap\tsw\t0\t0",
                "UUID=root-uuid\t/\text4\terrors=remount-ro\t0\t1",
            ]
        );
    }

    #[test]
    fn swap_falls_back_to_the_raw_path() {
        let mut uuids = uuids();
        uuids.remove(&PathBuf::from("/dev/sda2"));

        let table = generate_fstab(&layout(), &|p| uuids.get(p).cloned()).unwrap();
        assert!(table.contains("/dev/sda2\tnone\tswap\tsw\t0\t0"));
    }

    #[test]
    fn missing_root_uuid_is_fatal() {
        let mut uuids = uuids();
        uuids.remove(&PathBuf::from("/dev/sda3"));

        assert!(generate_fstab(&layout(), &|p| uuids.get(p).cloned()).is_err());
    }

    #[test]
    fn minimal_layout_writes_only_root() {
        let minimal = TargetLayout {
            root: part("/dev/vda1", FileSystem::Btrfs),
            esp: None,
            boot: None,
            swap: None,
            home: None,
            crypto_uuid: None,
        };
        let uuids: BTreeMap<PathBuf, String> =
            [(PathBuf::from("/dev/vda1"), "only-root".to_owned())]
                .iter()
                .cloned()
                .collect();

        let table = generate_fstab(&minimal, &|p| uuids.get(p).cloned()).unwrap();
        let entries: Vec<&str> = table
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect();
        assert_eq!(
            entries,
            vec!["UUID=only-root\t/\tbtrfs\terrors=remount-ro\t0\t1"]
        );
    }
}
