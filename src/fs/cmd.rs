use std::process::Stdio;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

/// Exit code and captured streams of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }

    /// stderr if it carries anything, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_owned();
        if stderr.is_empty() {
            self.stdout_trimmed()
        } else {
            stderr
        }
    }

    /// Multi-line report of a non-zero exit, for error contexts.
    pub fn failure_report(&self, program: &str, args: &[impl std::fmt::Debug]) -> String {
        format!(
            "Bad exit code\ncmd: {program} {args:?}\nexit code: {}\nstdout: {}\nstderr: {}",
            self.code,
            indent_multi_line(&self.stdout),
            indent_multi_line(&self.stderr),
        )
    }
}

fn indent_multi_line(text: &[u8]) -> String {
    let text = String::from_utf8_lossy(text);
    if text.contains('\n') {
        format!("(multi-line)\n\t{}", text.replace('\n', "\n\t"))
    } else {
        text.into()
    }
}

#[async_trait]
pub trait CaptureOutput {
    /// Spawns the tool, feeds `stdin_secret` (if any) through a pipe and waits
    /// for it. Any exit code is returned; a child killed by a signal is not.
    async fn capture_output(&mut self, stdin_secret: Option<&[u8]>) -> Result<CommandOutput>;
}

#[async_trait]
impl CaptureOutput for Command {
    async fn capture_output(&mut self, stdin_secret: Option<&[u8]>) -> Result<CommandOutput> {
        // tools are matched on their English diagnostics
        self.env("LC_ALL", "C");
        self.stdin(if stdin_secret.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        tracing::trace!(cmd = ?self.as_std(), with_secret = stdin_secret.is_some(), "spawning tool");

        let mut child = self
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.as_std().get_program()))?;

        if let Some(secret) = stdin_secret {
            let mut stdin = child.stdin.take().context("Child has no stdin pipe")?;
            stdin
                .write_all(secret)
                .await
                .context("Failed to hand the secret to the child")?;
            stdin.shutdown().await?;
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {:?}", self.as_std().get_program()))?;

        let code = output
            .status
            .code()
            .ok_or_else(|| anyhow!("{:?} was killed by a signal", self.as_std().get_program()))?;

        Ok(CommandOutput {
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
