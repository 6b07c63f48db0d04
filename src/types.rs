use std::{
    fmt::{Debug, Display},
    path::PathBuf,
};

use anyhow::{anyhow, Context as _, Result};
use clap::ValueEnum;
use nix::unistd::{Uid, User};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The one-time passphrase used for interactive setup. It is only ever handed
/// to child processes over stdin and is wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop, Clone, PartialEq, Eq)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Exposes the secret as text. Only the final summary should call this.
    pub fn expose(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum MakeFsType {
    Ext4,
    Xfs,
}

impl MakeFsType {
    /// Returns the mkfs binary together with its force flag and its volume label flag.
    pub fn mkfs_command(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            MakeFsType::Ext4 => ("mkfs.ext4", "-F", "-L"),
            MakeFsType::Xfs => ("mkfs.xfs", "-f", "-L"),
        }
    }

    /// The type column written to the mount table.
    pub fn fstab_type(&self) -> &'static str {
        match self {
            MakeFsType::Ext4 => "ext4",
            MakeFsType::Xfs => "xfs",
        }
    }
}

impl Display for MakeFsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}

/// The non-privileged account that invoked the tool (through sudo, usually).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl CallingUser {
    /// Resolves `SUDO_USER` if set, otherwise the owner of the current process.
    pub fn from_env() -> Result<Self> {
        let user = match std::env::var("SUDO_USER") {
            Ok(name) if !name.is_empty() => User::from_name(&name)
                .with_context(|| format!("Failed to look up user {name}"))?
                .ok_or_else(|| anyhow!("User {name} from SUDO_USER does not exist"))?,
            _ => {
                let uid = Uid::current();
                User::from_uid(uid)
                    .with_context(|| format!("Failed to look up user with uid {uid}"))?
                    .ok_or_else(|| anyhow!("No passwd entry for uid {uid}"))?
            }
        };

        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }
}
