// SPDX-License-Identifier: GPL-3.0-only

//! The record of every choice the caller made for one installation attempt.

use anyhow::bail;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallInfo {
    pub hostname: String,
    /// Locale tag such as `en_US.UTF-8`; non-UTF-8 tags are normalized
    /// when written.
    pub locale: String,
    /// Zoneinfo path relative to `/usr/share/zoneinfo`.
    pub timezone: String,
    pub keyboard: KeyboardLayout,
    pub users: Vec<UserAccount>,
    pub bootloader: BootloaderTarget,
    /// Passphrase for full-disk encryption, when the chosen strategy
    /// creates an encrypted container.
    pub encrypt: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyboardLayout {
    pub model: String,
    pub layout: String,
    pub variant: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub real_name: String,
    pub password: String,
    /// Administrators receive the extended supplementary-group set.
    pub admin: bool,
}

/// Where boot code lands: the EFI system partition under UEFI, or the MBR
/// of a whole disk under BIOS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BootloaderTarget {
    Esp,
    Disk(PathBuf),
}

impl InstallInfo {
    /// Reject records the pipeline could not act on. Runs before any
    /// device is touched.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !hostname_validator::is_valid(&self.hostname) {
            bail!("'{}' is not a valid hostname", self.hostname);
        }

        if self.users.is_empty() {
            bail!("at least one user account is required");
        }

        for user in &self.users {
            if !valid_username(&user.username) {
                bail!("'{}' is not a valid username", user.username);
            }
            if user.password.is_empty() {
                bail!("user '{}' has an empty password", user.username);
            }
        }

        if self.locale.is_empty() {
            bail!("a locale is required");
        }

        if self.timezone.is_empty() || self.timezone.starts_with('/') {
            bail!("'{}' is not a valid timezone", self.timezone);
        }

        Ok(())
    }
}

fn valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => (),
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> InstallInfo {
        InstallInfo {
            hostname: "pop-desktop".to_owned(),
            locale: "en_US.UTF-8".to_owned(),
            timezone: "America/Denver".to_owned(),
            keyboard: KeyboardLayout {
                model: "pc105".to_owned(),
                layout: "us".to_owned(),
                variant: None,
            },
            users: vec![UserAccount {
                username: "alice".to_owned(),
                real_name: "Alice".to_owned(),
                password: "hunter2".to_owned(),
                admin: true,
            }],
            bootloader: BootloaderTarget::Esp,
            encrypt: None,
        }
    }

    #[test]
    fn complete_record_validates() {
        assert!(info().validate().is_ok());
    }

    #[test]
    fn hostnames_are_checked() {
        let mut bad = info();
        bad.hostname = "-leading-dash".to_owned();
        assert!(bad.validate().is_err());

        bad.hostname = String::new();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn usernames_are_checked() {
        assert!(valid_username("alice"));
        assert!(valid_username("_svc-account"));
        assert!(!valid_username("Alice"));
        assert!(!valid_username("1user"));
        assert!(!valid_username(""));

        let mut bad = info();
        bad.users[0].username = "root!".to_owned();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn timezone_must_be_relative() {
        let mut bad = info();
        bad.timezone = "/usr/share/zoneinfo/UTC".to_owned();
        assert!(bad.validate().is_err());
    }
}
