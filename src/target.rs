use std::path::{Path, PathBuf};

use crate::{config::PathsConfig, types::CallingUser};

/// Everything one provisioning run operates on. Only the validator builds it,
/// and nothing can change the device or the label afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionTarget {
    device: PathBuf,
    label: String,
    crypt_name: String,
    mapped_device: PathBuf,
    mount_point: PathBuf,
    key_file: PathBuf,
    service_name: String,
    service_path: PathBuf,
    script_path: PathBuf,
    symlink_path: PathBuf,
    backup_dir: PathBuf,
}

impl EncryptionTarget {
    pub(crate) fn new(
        device: PathBuf,
        label: &str,
        paths: &PathsConfig,
        user: &CallingUser,
    ) -> Self {
        let crypt_name = crypt_name_for(label);
        let service_name = service_name_for(label);
        Self {
            device,
            label: label.to_owned(),
            mapped_device: paths.mapper_dir.join(&crypt_name),
            mount_point: mount_point_for(label, paths),
            key_file: key_file_for(label, paths),
            service_path: service_path_for(label, paths),
            script_path: paths.script_dir.join(format!("{service_name}.sh")),
            symlink_path: user.home.join(label),
            backup_dir: user.home.join("backups"),
            crypt_name,
            service_name,
        }
    }

    /// The canonical path of the outer block device.
    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Name of the mapping under the mapper directory.
    pub fn crypt_name(&self) -> &str {
        &self.crypt_name
    }

    /// The decrypted block device, present while the container is open.
    pub fn mapped_device(&self) -> &Path {
        &self.mapped_device
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_path(&self) -> &Path {
        &self.service_path
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Convenience link in the calling user's home directory.
    pub fn symlink_path(&self) -> &Path {
        &self.symlink_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}

pub fn crypt_name_for(label: &str) -> String {
    format!("{label}_crypt")
}

pub fn service_name_for(label: &str) -> String {
    format!("{label}-crypt.service")
}

pub fn mount_point_for(label: &str, paths: &PathsConfig) -> PathBuf {
    paths.mount_root.join(label)
}

pub fn service_path_for(label: &str, paths: &PathsConfig) -> PathBuf {
    paths.unit_dir.join(service_name_for(label))
}

pub fn key_file_for(label: &str, paths: &PathsConfig) -> PathBuf {
    paths.key_dir.join(format!("{label}.key"))
}
