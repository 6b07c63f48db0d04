//! The boundary between provisioning logic and the machine it runs on.
//!
//! Every external tool (cryptsetup, mkfs, blkid, mount, systemctl, the package
//! manager) is reached through [`Host::exec`], so the whole pipeline can be
//! driven against a simulated host in tests.

use std::{
    ffi::{OsStr, OsString},
    fmt::Debug,
    fs::OpenOptions,
    os::unix::fs::{FileTypeExt as _, OpenOptionsExt as _},
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::types::Passphrase;

pub use super::cmd::CommandOutput;
use super::cmd::CaptureOutput as _;

/// A command line plus optional secret input for its stdin.
///
/// Secrets are never part of `args`, so the `Debug` output of a command is
/// safe to log.
#[derive(Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
    input: Option<Passphrase>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Feeds `secret` to the child over stdin.
    pub fn secret_input(mut self, secret: &Passphrase) -> Self {
        self.input = Some(secret.clone());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    pub fn input(&self) -> Option<&Passphrase> {
        self.input.as_ref()
    }
}

impl Debug for ExternalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("input", &self.input.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Runs `command` to completion. A non-zero exit code is not an error at
    /// this level; only failing to spawn or wait for the child is.
    async fn exec(&self, command: &ExternalCommand) -> Result<CommandOutput>;

    /// Whether external tools should be asked for debug output.
    fn verbose(&self) -> bool {
        false
    }

    /// Runs `command` and fails unless it exits with code 0.
    async fn run(&self, command: &ExternalCommand) -> Result<CommandOutput> {
        let output = self.exec(command).await?;
        if !output.success() {
            bail!(
                "{}",
                output.failure_report(command.program(), command.get_args())
            )
        }
        Ok(output)
    }

    fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|metadata| metadata.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// A block device opened elsewhere (mounted, held by a mapping) refuses an
    /// exclusive open with `EBUSY`.
    fn is_device_busy(&self, path: &Path) -> Result<bool> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.custom_flags(libc::O_EXCL);
        match options.open(path) {
            Ok(_) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs commands on the local machine.
pub struct SystemHost {
    verbose: bool,
}

impl SystemHost {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn exec(&self, command: &ExternalCommand) -> Result<CommandOutput> {
        Command::new(command.program())
            .args(command.get_args())
            .capture_output(command.input().map(Passphrase::as_bytes))
            .await
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_debug_hides_secret_input() {
        let command = ExternalCommand::new("cryptsetup")
            .args(["open", "--key-file=-", "/dev/sdz", "data_crypt"])
            .secret_input(&Passphrase::from("very-secret-words".to_owned()));

        let debug = format!("{command:?}");
        assert!(debug.contains("data_crypt"));
        assert!(!debug.contains("very-secret-words"));
    }

    #[tokio::test]
    async fn test_system_host_feeds_stdin() -> Result<()> {
        let host = SystemHost::new(false);
        let output = host
            .run(&ExternalCommand::new("cat").secret_input(&Passphrase::from(b"abc".to_vec())))
            .await?;
        assert_eq!(output.stdout, b"abc");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let host = SystemHost::new(false);
        let err = host
            .run(&ExternalCommand::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("exit code: 3"));
        assert!(message.contains("oops"));

        let output = host
            .exec(&ExternalCommand::new("sh").args(["-c", "exit 2"]))
            .await
            .unwrap();
        assert_eq!(output.code, 2);
    }
}
