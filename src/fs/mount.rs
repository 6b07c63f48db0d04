use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use thiserror::Error;

use crate::{target::EncryptionTarget, types::CallingUser};

use super::host::{ExternalCommand, Host};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountError {
    #[error("{0:?} exists and is not a symlink, move it away manually and run again")]
    SymlinkPathOccupied(PathBuf),
}

pub async fn mount(host: &dyn Host, dev: &Path, mount_point: &Path) -> Result<()> {
    host.run(&ExternalCommand::new("mount").arg(dev).arg(mount_point))
        .await
        .with_context(|| format!("Failed to mount {dev:?} on {mount_point:?}"))?;
    Ok(())
}

pub async fn unmount(host: &dyn Host, mount_point: &Path) -> Result<()> {
    host.run(&ExternalCommand::new("umount").arg(mount_point))
        .await
        .with_context(|| format!("Failed to umount {mount_point:?}"))?;
    Ok(())
}

/// Points `link` at `destination`. An existing symlink at `link` is replaced;
/// anything else there is left alone and reported.
pub fn replace_symlink(link: &Path, destination: &Path) -> Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            tracing::info!("Removing existing symlink: {link:?}");
            std::fs::remove_file(link)
                .with_context(|| format!("Failed to remove existing symlink {link:?}"))?;
        }
        Ok(_) => return Err(MountError::SymlinkPathOccupied(link.to_owned()).into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect {link:?}")),
    }

    std::os::unix::fs::symlink(destination, link)
        .with_context(|| format!("Failed to create symlink {link:?}"))?;
    Ok(())
}

/// Mounts the opened container, gives the mount point to `user` and links it
/// from the user's home directory.
pub async fn mount_and_link(
    host: &dyn Host,
    target: &EncryptionTarget,
    user: &CallingUser,
) -> Result<()> {
    let mount_point = target.mount_point();

    tokio::fs::create_dir_all(mount_point)
        .await
        .with_context(|| format!("Failed to create mount point {mount_point:?}"))?;
    mount(host, target.mapped_device(), mount_point).await?;

    std::os::unix::fs::chown(mount_point, Some(user.uid), Some(user.gid))
        .with_context(|| format!("Failed to hand {mount_point:?} over to {}", user.name))?;

    let link = target.symlink_path();
    replace_symlink(link, mount_point)?;
    std::os::unix::fs::lchown(link, Some(user.uid), Some(user.gid))
        .with_context(|| format!("Failed to hand {link:?} over to {}", user.name))?;
    tracing::info!("Created symlink: {link:?} -> {mount_point:?}");

    Ok(())
}
