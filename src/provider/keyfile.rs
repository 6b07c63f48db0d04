use std::{
    io::Write as _,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use rand::{rngs::OsRng, RngCore as _};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Size of the generated keyfile in bytes.
pub const KEYFILE_LEN: usize = 512;

/// Writes a fresh random keyfile to `path`, readable by `uid`/`gid` only.
/// The content is written to a temporary file next to `path` and renamed.
pub async fn create_keyfile(path: &Path, uid: u32, gid: u32) -> Result<PathBuf> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || write_keyfile(&path, uid, gid).map(|_| path))
        .await
        .context("Keyfile writer task failed")?
}

fn write_keyfile(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create key directory {parent:?}"))?;

    let mut key = Zeroizing::new(vec![0u8; KEYFILE_LEN]);
    OsRng
        .try_fill_bytes(&mut key)
        .context("Failed to read random bytes from the operating system")?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary keyfile in {parent:?}"))?;
    std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o600))?;
    std::os::unix::fs::fchown(temp.as_file(), Some(uid), Some(gid))
        .context("Failed to set owner of keyfile")?;
    temp.as_file_mut().write_all(&key)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move keyfile into place at {path:?}"))?;

    tracing::info!("Created secure keyfile: {path:?}");
    Ok(())
}

#[cfg(test)]
pub mod tests {

    use std::os::unix::fs::MetadataExt as _;

    use super::*;

    #[tokio::test]
    async fn test_create_keyfile() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys").join("vault.key");
        let (uid, gid) = (nix::unistd::geteuid().as_raw(), nix::unistd::getegid().as_raw());

        create_keyfile(&path, uid, gid).await?;

        let metadata = std::fs::metadata(&path)?;
        assert_eq!(metadata.len(), KEYFILE_LEN as u64);
        assert_eq!(metadata.mode() & 0o777, 0o600);
        assert_eq!(metadata.uid(), uid);

        let first = std::fs::read(&path)?;
        create_keyfile(&path, uid, gid).await?;
        assert_ne!(std::fs::read(&path)?, first);

        // Only the keyfile itself is left in the directory.
        assert_eq!(std::fs::read_dir(path.parent().unwrap())?.count(), 1);
        Ok(())
    }
}
