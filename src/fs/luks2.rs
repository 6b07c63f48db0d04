use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};

use crate::{
    target::EncryptionTarget,
    types::{CallingUser, Passphrase},
};

use super::host::{ExternalCommand, Host};

/// `cryptsetup status` exit code for a mapping that is not active.
const CRYPTSETUP_STATUS_INACTIVE: i32 = 4;

/// How the container is unlocked when opened.
#[derive(Debug, Clone, Copy)]
pub enum UnlockMaterial<'a> {
    Passphrase(&'a Passphrase),
    Keyfile(&'a Path),
}

fn cryptsetup(host: &dyn Host) -> ExternalCommand {
    let command = ExternalCommand::new("cryptsetup");
    match host.verbose() {
        true => command.arg("--debug"),
        false => command,
    }
}

pub async fn format(host: &dyn Host, dev: &Path, passphrase: &Passphrase) -> Result<()> {
    host.run(
        &cryptsetup(host)
            .args(["luksFormat", "--type", "luks2", "--batch-mode", "--key-file=-"])
            .arg(dev)
            .secret_input(passphrase),
    )
    .await
    .with_context(|| format!("Failed to format {dev:?} as LUKS2 volume"))?;

    Ok(())
}

pub async fn is_luks(host: &dyn Host, dev: &Path) -> Result<bool> {
    let output = host
        .exec(&cryptsetup(host).arg("isLuks").arg(dev))
        .await
        .with_context(|| format!("Failed to check initialization status of device {dev:?}"))?;

    match output.code {
        0 => Ok(true),
        1 => Ok(false),
        code => bail!(
            "cryptsetup isLuks {dev:?} failed with exit code {code}: {}",
            output.diagnostic()
        ),
    }
}

/// Saves the LUKS header of `dev` below `backup_dir` and hands the copy over
/// to `owner`, so the operator can read it without root.
pub async fn backup_header(
    host: &dyn Host,
    dev: &Path,
    label: &str,
    backup_dir: &Path,
    owner: &CallingUser,
) -> Result<PathBuf> {
    prepare_backup_dir(backup_dir, owner).await?;

    let backup_path = backup_dir.join(format!(
        "{label}-luks-header-{}.bak",
        chrono::Local::now().format("%Y-%m-%d-%H%M%S")
    ));
    tracing::info!("Backing up LUKS header to: {backup_path:?}");

    host.run(
        &cryptsetup(host)
            .arg("luksHeaderBackup")
            .arg(dev)
            .arg("--header-backup-file")
            .arg(&backup_path),
    )
    .await
    .with_context(|| format!("Failed to back up LUKS header of {dev:?}"))?;

    tokio::fs::set_permissions(&backup_path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("Failed to restrict permissions of {backup_path:?}"))?;
    std::os::unix::fs::chown(&backup_path, Some(owner.uid), Some(owner.gid))
        .with_context(|| format!("Failed to hand {backup_path:?} over to {}", owner.name))?;

    Ok(backup_path)
}

/// Creates `backup_dir` if needed. A directory created here belongs to
/// `owner`; an existing one is left as it is. Returns whether it was created.
async fn prepare_backup_dir(backup_dir: &Path, owner: &CallingUser) -> Result<bool> {
    if tokio::fs::try_exists(backup_dir).await.unwrap_or(false) {
        return Ok(false);
    }

    tokio::fs::create_dir_all(backup_dir)
        .await
        .with_context(|| format!("Failed to create backup directory {backup_dir:?}"))?;
    std::os::unix::fs::chown(backup_dir, Some(owner.uid), Some(owner.gid))
        .with_context(|| format!("Failed to hand {backup_dir:?} over to {}", owner.name))?;
    Ok(true)
}

pub async fn is_active(host: &dyn Host, volume: &str) -> Result<bool> {
    let output = host
        .exec(&ExternalCommand::new("cryptsetup").arg("status").arg(volume))
        .await
        .with_context(|| format!("Failed to query status of mapping {volume}"))?;

    match output.code {
        0 => Ok(true),
        CRYPTSETUP_STATUS_INACTIVE => Ok(false),
        code => bail!(
            "cryptsetup status {volume} failed with exit code {code}: {}",
            output.diagnostic()
        ),
    }
}

/// Opens the container of `target` under its mapping name. A mapping with the
/// same name left over from an earlier attempt is closed first.
pub async fn open(
    host: &dyn Host,
    target: &EncryptionTarget,
    unlock: UnlockMaterial<'_>,
) -> Result<()> {
    let volume = target.crypt_name();

    if is_active(host, volume).await? {
        tracing::info!("Container {volume} is already open, closing it first");
        close(host, volume)
            .await
            .with_context(|| format!("Cannot clean up existing open container {volume}"))?;
    }

    let command = cryptsetup(host).args(["open", "--type", "luks2"]);
    let command = match unlock {
        UnlockMaterial::Passphrase(passphrase) => {
            tracing::info!("Opening container {volume} with passphrase");
            command.arg("--key-file=-").secret_input(passphrase)
        }
        UnlockMaterial::Keyfile(keyfile) => {
            tracing::info!("Opening container {volume} with keyfile");
            command.arg("--key-file").arg(keyfile)
        }
    };

    host.run(&command.arg(target.device()).arg(volume))
        .await
        .with_context(|| format!("Failed to setup mapping for volume {volume}"))?;

    Ok(())
}

/// Registers `keyfile` in a new key slot, authorized by the passphrase slot.
pub async fn add_keyfile_slot(
    host: &dyn Host,
    dev: &Path,
    passphrase: &Passphrase,
    keyfile: &Path,
) -> Result<()> {
    if passphrase.is_empty() {
        bail!("The existing LUKS passphrase cannot be empty")
    }

    host.run(
        &cryptsetup(host)
            .args(["luksAddKey", "--batch-mode", "--key-file=-"])
            .arg(dev)
            .arg(keyfile)
            .secret_input(passphrase),
    )
    .await
    .with_context(|| format!("Failed to add keyfile {keyfile:?} to {dev:?}"))?;

    Ok(())
}

/// Closes the mapping. A mapping that is already gone counts as closed.
pub async fn close(host: &dyn Host, volume: &str) -> Result<()> {
    let output = host
        .exec(&cryptsetup(host).arg("close").arg(volume))
        .await
        .with_context(|| format!("Failed to close volume `{volume}`"))?;

    if output.success() {
        return Ok(());
    }

    let diagnostic = output.diagnostic().to_ascii_lowercase();
    if diagnostic.contains("does not exist")
        || diagnostic.contains("doesn't exist")
        || diagnostic.contains("not active")
    {
        tracing::debug!("Mapping {volume} was not active");
        return Ok(());
    }

    bail!(
        "Failed to close volume `{volume}` (exit code {}): {}",
        output.code,
        output.diagnostic()
    )
}
