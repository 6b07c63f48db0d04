//! The systemd service that unlocks and mounts the container at boot.
//!
//! The unit itself stays trivial and delegates to a helper script, which waits
//! for the outer device, opens the container with the keyfile and mounts it
//! through its mount table entry.

use std::{os::unix::fs::PermissionsExt as _, path::Path};

use anyhow::{Context as _, Result};

use crate::{
    config::BootConfig,
    fs::host::{ExternalCommand, Host},
    target::EncryptionTarget,
};

/// The path the outer device keeps across reboots and re-enumeration.
pub fn stable_device_path(outer_uuid: &str) -> String {
    format!("/dev/disk/by-uuid/{outer_uuid}")
}

fn format_seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

pub fn render_script(target: &EncryptionTarget, stable_device: &str, boot: &BootConfig) -> String {
    format!(
        r#"#!/bin/sh
# Unlocks and mounts the encrypted volume '{label}'.
set -u

DEVICE="{device}"
KEY_FILE="{key_file}"
CRYPT_NAME="{crypt_name}"
MAPPED_DEVICE="{mapped_device}"
MOUNT_POINT="{mount_point}"
POLL_ATTEMPTS={attempts}
POLL_INTERVAL={interval}

wait_for_device() {{
    attempt=0
    while [ ! -b "$DEVICE" ]; do
        attempt=$((attempt + 1))
        if [ "$attempt" -ge "$POLL_ATTEMPTS" ]; then
            echo "Timed out waiting for $DEVICE" >&2
            exit 1
        fi
        sleep "$POLL_INTERVAL"
    done
}}

case "${{1:-}}" in
start)
    wait_for_device
    if [ ! -b "$MAPPED_DEVICE" ]; then
        cryptsetup open --type luks2 --key-file "$KEY_FILE" "$DEVICE" "$CRYPT_NAME" || exit 1
    fi
    if ! mountpoint -q "$MOUNT_POINT"; then
        mount "$MOUNT_POINT" || exit 1
    fi
    ;;
stop)
    umount "$MOUNT_POINT" || true
    cryptsetup close "$CRYPT_NAME" || true
    ;;
*)
    echo "Usage: $0 {{start|stop}}" >&2
    exit 2
    ;;
esac
"#,
        label = target.label(),
        device = stable_device,
        key_file = target.key_file().display(),
        crypt_name = target.crypt_name(),
        mapped_device = target.mapped_device().display(),
        mount_point = target.mount_point().display(),
        attempts = boot.poll_attempts(),
        interval = format_seconds(boot.device_poll_interval_ms),
    )
}

pub fn render_unit(target: &EncryptionTarget) -> String {
    let script = target.script_path().display();
    format!(
        "\
[Unit]
Description=Unlock and mount encrypted volume {label}
After=local-fs-pre.target

[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart={script} start
ExecStop={script} stop

[Install]
WantedBy=multi-user.target
",
        label = target.label(),
    )
}

async fn write_with_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {parent:?}"))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Failed to set permissions of {path:?}"))?;
    Ok(())
}

/// Writes the helper script and the unit, then enables the unit.
pub async fn install_boot_unit(
    host: &dyn Host,
    target: &EncryptionTarget,
    outer_uuid: &str,
    boot: &BootConfig,
) -> Result<()> {
    let script = render_script(target, &stable_device_path(outer_uuid), boot);
    write_with_mode(target.script_path(), &script, 0o755).await?;
    tracing::info!("Wrote boot helper script {:?}", target.script_path());

    write_with_mode(target.service_path(), &render_unit(target), 0o644).await?;
    tracing::info!("Wrote systemd unit {:?}", target.service_path());

    host.run(&ExternalCommand::new("systemctl").arg("daemon-reload"))
        .await
        .context("Failed to reload systemd units")?;
    host.run(
        &ExternalCommand::new("systemctl")
            .arg("enable")
            .arg(target.service_name()),
    )
    .await
    .with_context(|| format!("Failed to enable {}", target.service_name()))?;

    tracing::info!("Enabled {}", target.service_name());
    Ok(())
}
