//! Safety gates run once, before anything on the device is touched.
//!
//! Checks are not repeated later in the run, so a concurrent change to the
//! system between validation and formatting goes unnoticed.

use std::{
    os::unix::fs::MetadataExt as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use thiserror::Error;

use crate::{
    config::PathsConfig,
    fs::{blkid, host::Host, luks2},
    persist::fstab,
    target::{self, EncryptionTarget},
    types::CallingUser,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Label '{0}' should contain only alphanumeric characters and underscores")]
    InvalidLabelSyntax(String),

    #[error("Filesystem with label '{label}' already exists on {device}")]
    LabelCollision { label: String, device: String },

    #[error("Mount point {0:?} already exists")]
    MountPointExists(PathBuf),

    #[error("{fstab:?} already has an entry for {mount_point:?}")]
    MountEntryExists { fstab: PathBuf, mount_point: PathBuf },

    #[error("Keyfile {0:?} already exists, it may still unlock another container")]
    KeyFileExists(PathBuf),

    #[error("Systemd service {0} already exists")]
    ServiceExists(String),

    #[error("{0:?} does not exist")]
    DeviceNotFound(PathBuf),

    #[error("{0:?} is not a block device")]
    NotABlockDevice(PathBuf),

    #[error("Refusing to encrypt {device:?}, it refers to the protected path {protected:?}")]
    ProtectedPathAlias { device: PathBuf, protected: PathBuf },

    #[error("The device {0:?} is currently in use")]
    DeviceBusy(PathBuf),

    #[error("{0:?} already carries a LUKS header, refusing to encrypt it again")]
    AlreadyEncrypted(PathBuf),
}

pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Paths no device may alias: the boot mount, root's home, this executable,
/// and whatever the configuration adds.
pub fn protected_paths(paths: &PathsConfig) -> Vec<PathBuf> {
    let mut protected = vec![PathBuf::from("/boot"), PathBuf::from("/root")];
    match std::env::current_exe() {
        Ok(exe) => protected.push(exe),
        Err(e) => tracing::warn!("Cannot determine the path of the running executable: {e}"),
    }
    protected.extend(paths.protected_paths.iter().cloned());
    protected
}

pub async fn validate_label(host: &dyn Host, label: &str, paths: &PathsConfig) -> Result<()> {
    if !is_valid_label(label) {
        return Err(ValidationError::InvalidLabelSyntax(label.to_owned()).into());
    }

    if let Some(device) = blkid::find_device_by_label(host, label).await? {
        return Err(ValidationError::LabelCollision {
            label: label.to_owned(),
            device,
        }
        .into());
    }

    let mount_point = target::mount_point_for(label, paths);
    if mount_point.exists() {
        return Err(ValidationError::MountPointExists(mount_point).into());
    }

    if fstab::has_entry_for(&fstab::read_table(&paths.fstab).await?, &mount_point) {
        return Err(ValidationError::MountEntryExists {
            fstab: paths.fstab.clone(),
            mount_point,
        }
        .into());
    }

    let key_file = target::key_file_for(label, paths);
    if key_file.exists() {
        return Err(ValidationError::KeyFileExists(key_file).into());
    }

    if target::service_path_for(label, paths).exists() {
        return Err(ValidationError::ServiceExists(target::service_name_for(label)).into());
    }

    tracing::info!("Label validation passed for '{label}'");
    Ok(())
}

/// Checks `device` and returns its canonical path.
pub async fn validate_device(
    host: &dyn Host,
    device: &Path,
    protected: &[PathBuf],
) -> Result<PathBuf> {
    let resolved = host
        .canonicalize(device)
        .map_err(|_| ValidationError::DeviceNotFound(device.to_owned()))?;

    if let Some(protected) = protected
        .iter()
        .find(|protected| refers_to_same_file(host, &resolved, protected))
    {
        return Err(ValidationError::ProtectedPathAlias {
            device: resolved,
            protected: protected.to_owned(),
        }
        .into());
    }

    if !host.is_block_device(&resolved) {
        return Err(ValidationError::NotABlockDevice(resolved).into());
    }

    if host
        .is_device_busy(&resolved)
        .with_context(|| format!("Failed to check whether {resolved:?} is in use"))?
    {
        return Err(ValidationError::DeviceBusy(resolved).into());
    }

    if luks2::is_luks(host, &resolved).await? {
        return Err(ValidationError::AlreadyEncrypted(resolved).into());
    }

    tracing::info!("Device check passed: {resolved:?} is safe to encrypt");
    Ok(resolved)
}

/// Same canonical path, or same device and inode. Paths that cannot be
/// inspected never match.
fn refers_to_same_file(host: &dyn Host, resolved: &Path, other: &Path) -> bool {
    let Ok(other_resolved) = host.canonicalize(other) else {
        return false;
    };
    if other_resolved == resolved {
        return true;
    }

    match (std::fs::metadata(resolved), std::fs::metadata(&other_resolved)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Runs every check once and builds the target the rest of the run works on.
pub async fn validate(
    host: &dyn Host,
    device: &Path,
    label: &str,
    paths: &PathsConfig,
    user: &CallingUser,
) -> Result<EncryptionTarget> {
    validate_label(host, label, paths).await?;
    let device = validate_device(host, device, &protected_paths(paths)).await?;
    Ok(EncryptionTarget::new(device, label, paths, user))
}
