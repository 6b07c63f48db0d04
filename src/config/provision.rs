use std::path::PathBuf;

use anyhow::{bail, Result};
use documented::DocumentedFields;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, DocumentedFields)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Locations of the system files and directories written during provisioning.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Configuration of the generated boot-time unlock service.
    #[serde(default)]
    pub boot: BootConfig,

    /// Configuration of the one-time setup passphrase.
    #[serde(default)]
    pub passphrase: PassphraseConfig,
}

impl ProvisionConfig {
    pub fn check(&self) -> Result<()> {
        if self.passphrase.words == 0 {
            bail!("passphrase.words must be at least 1")
        }
        if self.boot.device_poll_interval_ms == 0 {
            bail!("boot.device_poll_interval_ms must be greater than 0")
        }
        if self.boot.device_wait_timeout_ms < self.boot.device_poll_interval_ms {
            bail!("boot.device_wait_timeout_ms must not be shorter than boot.device_poll_interval_ms")
        }
        if let Some(install_command) = &self.passphrase.install_command {
            if install_command.is_empty() {
                bail!("passphrase.install_command must not be empty if set")
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    /// The static mount table the `noauto` entry is appended to.
    pub fstab: PathBuf,

    /// Directory where opened containers show up as mapped block devices.
    pub mapper_dir: PathBuf,

    /// Directory under which the per-label mount point is created.
    pub mount_root: PathBuf,

    /// Directory holding the generated keyfiles, one `<label>.key` per volume.
    pub key_dir: PathBuf,

    /// Directory holding the helper scripts run by the boot services.
    pub script_dir: PathBuf,

    /// Directory the systemd unit files are written to.
    pub unit_dir: PathBuf,

    /// Extra paths a device must never alias, in addition to `/boot`, `/root` and this executable.
    pub protected_paths: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            fstab: "/etc/fstab".into(),
            mapper_dir: "/dev/mapper".into(),
            mount_root: "/mnt".into(),
            key_dir: "/etc/luks-keys".into(),
            script_dir: "/etc/luks-scripts".into(),
            unit_dir: "/etc/systemd/system".into(),
            protected_paths: vec![],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct BootConfig {
    /// How long the boot service waits for the outer device to appear before failing, in milliseconds.
    pub device_wait_timeout_ms: u64,

    /// How often the boot service checks for the outer device, in milliseconds.
    pub device_poll_interval_ms: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            device_wait_timeout_ms: 10_000,
            device_poll_interval_ms: 200,
        }
    }
}

impl BootConfig {
    pub fn poll_attempts(&self) -> u64 {
        self.device_wait_timeout_ms
            .div_ceil(self.device_poll_interval_ms.max(1))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct PassphraseConfig {
    /// Number of words in the generated passphrase.
    pub words: usize,

    /// Separator placed between the words.
    pub delimiter: String,

    /// Word list files to pick words from. The first one that exists and holds enough usable words is used.
    pub wordfiles: Vec<PathBuf>,

    /// Command that installs a word list when none is available, e.g. `["apt-get", "install", "-y", "wamerican"]`. If not set, it is derived from the package manager found on the system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_command: Option<Vec<String>>,
}

impl Default for PassphraseConfig {
    fn default() -> Self {
        Self {
            words: 6,
            delimiter: "-".into(),
            wordfiles: vec![
                "/usr/share/dict/words".into(),
                "/usr/share/dict/american-english".into(),
                "/usr/share/dict/british-english".into(),
                "/usr/share/dict/web2".into(),
            ],
            install_command: None,
        }
    }
}
