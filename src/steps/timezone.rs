// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use anyhow::{bail, Context};
use std::fs;
use std::os::unix::fs::symlink;

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    let zone = ctx.target.join("usr/share/zoneinfo").join(&ctx.info.timezone);
    if !zone.exists() {
        bail!("time zone '{}' does not exist in the target", ctx.info.timezone);
    }

    let localtime = ctx.target.join("etc/localtime");
    if localtime.exists() || fs::symlink_metadata(&localtime).is_ok() {
        fs::remove_file(&localtime).context("unable to replace /etc/localtime")?;
    }

    symlink(
        format!("/usr/share/zoneinfo/{}", ctx.info.timezone),
        &localtime,
    )
    .context("unable to link /etc/localtime")?;

    // Windows keeps the hardware clock in local time; match it so the two
    // systems stop fighting over the clock.
    if ctx.windows_present {
        fs::write(ctx.target.join("etc/adjtime"), "0.0 0 0.0\n0\nLOCAL\n")
            .context("unable to write /etc/adjtime")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install_info::{BootloaderTarget, InstallInfo, KeyboardLayout};
    use disk_provision::ops::{PartRef, TargetLayout};
    use disk_provision::FileSystem;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context_over<'a>(
        info: &'a InstallInfo,
        layout: &'a TargetLayout,
        target: &'a std::path::Path,
        windows: bool,
    ) -> StepContext<'a> {
        StepContext {
            info,
            layout,
            target,
            windows_present: windows,
            live_user: None,
            resources: None,
            vfs_mounts: Vec::new(),
        }
    }

    fn fixture_info(timezone: &str) -> InstallInfo {
        InstallInfo {
            hostname: "host".to_owned(),
            locale: "en_US.UTF-8".to_owned(),
            timezone: timezone.to_owned(),
            keyboard: KeyboardLayout {
                model: "pc105".to_owned(),
                layout: "us".to_owned(),
                variant: None,
            },
            users: Vec::new(),
            bootloader: BootloaderTarget::Esp,
            encrypt: None,
        }
    }

    fn fixture_layout() -> TargetLayout {
        TargetLayout {
            root: PartRef {
                path: PathBuf::from("/dev/sda2"),
                fs: FileSystem::Ext4,
                created: true,
            },
            esp: None,
            boot: None,
            swap: None,
            home: None,
            crypto_uuid: None,
        }
    }

    #[test]
    fn localtime_links_to_the_chosen_zone() {
        let target = TempDir::new().unwrap();
        fs::create_dir_all(target.path().join("usr/share/zoneinfo/America")).unwrap();
        fs::write(target.path().join("usr/share/zoneinfo/America/Denver"), "tz").unwrap();
        fs::create_dir_all(target.path().join("etc")).unwrap();

        let info = fixture_info("America/Denver");
        let layout = fixture_layout();
        let mut ctx = context_over(&info, &layout, target.path(), false);

        apply(&mut ctx).unwrap();

        let link = fs::read_link(target.path().join("etc/localtime")).unwrap();
        assert_eq!(link, PathBuf::from("/usr/share/zoneinfo/America/Denver"));
        assert!(!target.path().join("etc/adjtime").exists());
    }

    #[test]
    fn windows_presence_forces_local_hardware_clock() {
        let target = TempDir::new().unwrap();
        fs::create_dir_all(target.path().join("usr/share/zoneinfo")).unwrap();
        fs::write(target.path().join("usr/share/zoneinfo/UTC"), "tz").unwrap();
        fs::create_dir_all(target.path().join("etc")).unwrap();

        let info = fixture_info("UTC");
        let layout = fixture_layout();
        let mut ctx = context_over(&info, &layout, target.path(), true);

        apply(&mut ctx).unwrap();

        let adjtime = fs::read_to_string(target.path().join("etc/adjtime")).unwrap();
        assert!(adjtime.ends_with("LOCAL\n"));
    }

    #[test]
    fn missing_zone_is_fatal() {
        let target = TempDir::new().unwrap();
        fs::create_dir_all(target.path().join("etc")).unwrap();

        let info = fixture_info("Atlantis/Lost");
        let layout = fixture_layout();
        let mut ctx = context_over(&info, &layout, target.path(), false);

        assert!(apply(&mut ctx).is_err());
    }
}
