use std::path::Path;

use anyhow::{bail, Context as _, Result};
use tokio::io::AsyncWriteExt as _;

use crate::{
    fs::{blkid, host::Host},
    target::EncryptionTarget,
    types::MakeFsType,
};

/// The mount table line for an opened container. `noauto` keeps the boot
/// sequence from trying to mount it before the unlock service ran.
pub fn entry_line(uuid: &str, mount_point: &Path, fs_type: MakeFsType) -> String {
    format!(
        "UUID={uuid}  {}  {}  defaults,noauto  0  2",
        mount_point.display(),
        fs_type.fstab_type()
    )
}

/// Whether any active (non-comment) line mounts something on `mount_point`.
pub fn has_entry_for(content: &str, mount_point: &Path) -> bool {
    content
        .lines()
        .map(str::trim_start)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|field| Path::new(field) == mount_point)
}

/// Content of the mount table, empty if the file does not exist yet.
pub async fn read_table(fstab: &Path) -> Result<String> {
    match tokio::fs::read_to_string(fstab).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {fstab:?}")),
    }
}

/// Appends the mount entry of the opened container to `fstab` and returns the
/// UUID of the filesystem inside the container.
pub async fn append_entry(
    host: &dyn Host,
    target: &EncryptionTarget,
    fs_type: MakeFsType,
    fstab: &Path,
) -> Result<String> {
    let uuid = blkid::uuid_of(host, target.mapped_device()).await?;
    let mount_point = target.mount_point();

    let content = read_table(fstab).await?;
    if has_entry_for(&content, mount_point) {
        bail!("{fstab:?} already has an entry for {mount_point:?}")
    }

    let mut line = String::new();
    if !content.is_empty() && !content.ends_with('\n') {
        line.push('\n');
    }
    line.push_str(&entry_line(&uuid, mount_point, fs_type));
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fstab)
        .await
        .with_context(|| format!("Failed to open {fstab:?} for appending"))?;
    file.write_all(line.as_bytes())
        .await
        .with_context(|| format!("Failed to append to {fstab:?}"))?;
    file.flush().await?;

    tracing::info!("Added entry for {mount_point:?} to {fstab:?}");
    Ok(uuid)
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_entry_line() {
        assert_eq!(
            entry_line(
                "0b1f8c2e-4f0e-4a4b-9d55-2d1f7c3a9e10",
                Path::new("/mnt/vault"),
                MakeFsType::Ext4
            ),
            "UUID=0b1f8c2e-4f0e-4a4b-9d55-2d1f7c3a9e10  /mnt/vault  ext4  defaults,noauto  0  2"
        );
        assert!(entry_line("abc", Path::new("/mnt/x"), MakeFsType::Xfs).contains("  xfs  "));
    }

    #[test]
    fn test_has_entry_for() {
        let content = "\
# /etc/fstab
UUID=1111  /  ext4  defaults  0  1
#UUID=2222  /mnt/old  ext4  defaults,noauto  0  2
/dev/sdb1\t/mnt/data\txfs\tdefaults\t0 2
";
        assert!(has_entry_for(content, Path::new("/")));
        assert!(has_entry_for(content, Path::new("/mnt/data")));
        assert!(!has_entry_for(content, Path::new("/mnt/old")));
        assert!(!has_entry_for(content, Path::new("/mnt/vault")));
    }

    #[tokio::test]
    async fn test_read_table_of_missing_file_is_empty() -> Result<()> {
        let root = tempfile::tempdir()?;
        assert_eq!(read_table(&root.path().join("fstab")).await?, "");

        std::fs::write(root.path().join("fstab"), "UUID=1  /  ext4  defaults  0  1\n")?;
        assert!(has_entry_for(
            &read_table(&root.path().join("fstab")).await?,
            Path::new("/")
        ));
        Ok(())
    }
}
