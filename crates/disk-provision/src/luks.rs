// SPDX-License-Identifier: LGPL-3.0-only

//! LUKS container creation through the cryptsetup tool.
//!
//! The passphrase never touches the command line: it is written to a
//! restrictively-permissioned temporary key file which is removed on every
//! exit path, success or failure.

use cradle::prelude::*;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Error)]
pub enum LuksError {
    #[error("unable to stage key file: {0}")]
    KeyFile(#[from] io::Error),
    #[error("cryptsetup failed: {0}")]
    Cryptsetup(#[from] cradle::Error),
}

/// A passphrase staged on disk for batch-mode cryptsetup invocations.
/// Removed when dropped.
pub struct KeyFile {
    file: NamedTempFile,
}

impl KeyFile {
    pub fn stage(passphrase: &str) -> io::Result<KeyFile> {
        let mut file = NamedTempFile::new()?;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
        file.write_all(passphrase.as_bytes())?;
        file.flush()?;
        Ok(KeyFile { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Format `device` as a LUKS container, open it under `mapper_name`, and
/// return the container UUID. All three cryptsetup invocations run in
/// batch mode with the staged key file; no interactive prompts.
pub fn format_container(
    device: &Path,
    passphrase: &str,
    mapper_name: &str,
) -> Result<String, LuksError> {
    let key = KeyFile::stage(passphrase)?;
    let dev = device.to_string_lossy().into_owned();
    let key_path = key.path().to_string_lossy().into_owned();

    info!("creating LUKS container on {}", device.display());
    let () = run_result!(
        "cryptsetup",
        "-q",
        "--batch-mode",
        "luksFormat",
        "--key-file",
        key_path.as_str(),
        dev.as_str()
    )?;

    info!("opening LUKS container {} as {}", device.display(), mapper_name);
    let () = run_result!(
        "cryptsetup",
        "luksOpen",
        "--key-file",
        key_path.as_str(),
        dev.as_str(),
        mapper_name
    )?;

    let StdoutTrimmed(uuid) = run_result!("cryptsetup", "luksUUID", dev.as_str())?;

    Ok(uuid)
}

/// Path of an opened container's device map.
pub fn mapper_path(mapper_name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(mapper_name)
}

/// Close an opened LUKS container.
pub fn close_container(mapper_name: &str) -> Result<(), cradle::Error> {
    info!("closing LUKS container {}", mapper_name);
    run_result!("cryptsetup", "luksClose", mapper_name)
}
