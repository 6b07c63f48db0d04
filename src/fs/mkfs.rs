use std::path::Path;

use anyhow::{Context as _, Result};

use crate::types::MakeFsType;

use super::host::{ExternalCommand, Host};

/// Creates a `fs_type` filesystem on `device_path`, labelled `label`.
pub async fn make_fs(
    host: &dyn Host,
    device_path: &Path,
    label: &str,
    fs_type: MakeFsType,
) -> Result<()> {
    let (mkfs_cmd, force_arg, label_arg) = fs_type.mkfs_command();

    tracing::info!("Creating {fs_type} filesystem with label '{label}' on {device_path:?}");
    host.run(
        &ExternalCommand::new(mkfs_cmd)
            .arg(force_arg)
            .arg(label_arg)
            .arg(label)
            .arg(device_path),
    )
    .await
    .with_context(|| format!("Failed to initialize {fs_type} fs on {device_path:?}"))?;

    Ok(())
}
