use std::path::PathBuf;

use clap::Parser;

use crate::{build::CLAP_LONG_VERSION, types::MakeFsType};

/// Encrypts a block device with LUKS2 and sets it up to be unlocked and
/// mounted at boot.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    /// The block device to encrypt. All data on it will be destroyed.
    pub device: PathBuf,

    /// Label of the new volume, used for the filesystem, the mapping name, the mount point and the boot service.
    #[clap(long, default_value = "data")]
    pub label: String,

    /// Filesystem to create inside the encrypted container.
    #[clap(long, value_enum, default_value_t = MakeFsType::Ext4)]
    pub fs_type: MakeFsType,

    #[clap(long, short = 'c')]
    /// Path to the directory where to load provision.toml from. Default value is /etc/cryptpilot.
    pub config_dir: Option<String>,

    /// Do not try to install a missing word list.
    #[clap(long, hide = true)]
    pub no_reinstall: bool,
}
