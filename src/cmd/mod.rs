use anyhow::Result;
use async_trait::async_trait;

pub mod provision;

use provision::{ProvisionCommand, ProvisionOptions, RecoveryAttempt};

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Cli {
    fn into_command(self) -> Box<dyn Command> {
        Box::new(ProvisionCommand {
            options: ProvisionOptions {
                device: self.device,
                label: self.label,
                fs_type: self.fs_type,
                recovery: match self.no_reinstall {
                    true => RecoveryAttempt::AfterRecovery,
                    false => RecoveryAttempt::FirstRun,
                },
            },
            config_dir: self.config_dir,
        })
    }
}
