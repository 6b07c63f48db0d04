use std::path::Path;

use anyhow::{bail, Context as _, Result};

use super::host::{ExternalCommand, Host};

/// blkid exit code when nothing matched the query.
const BLKID_NOT_FOUND: i32 = 2;

/// Returns the device that already carries a filesystem labelled `label`.
pub async fn find_device_by_label(host: &dyn Host, label: &str) -> Result<Option<String>> {
    let output = host
        .exec(&ExternalCommand::new("blkid").arg("-L").arg(label))
        .await
        .with_context(|| format!("Failed to query filesystem label {label}"))?;

    match output.code {
        0 => {
            let device = output.stdout_trimmed();
            Ok((!device.is_empty()).then_some(device))
        }
        BLKID_NOT_FOUND => Ok(None),
        code => bail!(
            "blkid failed with exit code {code} while looking up label {label}: {}",
            output.diagnostic()
        ),
    }
}

/// Probes `device` directly (bypassing the blkid cache, which does not know
/// about devices created a moment ago) and returns its UUID.
pub async fn uuid_of(host: &dyn Host, device: &Path) -> Result<String> {
    let output = host
        .run(
            &ExternalCommand::new("blkid")
                .args(["-p", "-s", "UUID", "-o", "value"])
                .arg(device),
        )
        .await
        .with_context(|| format!("Failed to read UUID of {device:?}"))?;

    let uuid = output.stdout_trimmed();
    if uuid.is_empty() {
        bail!("blkid reported no UUID for {device:?}")
    }
    Ok(uuid)
}
