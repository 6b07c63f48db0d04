use std::{fmt::Display, future::Future, path::PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use dialoguer::{console::Term, Input};

use crate::{
    config::{
        source::{fs::FileSystemConfigSource, ConfigSource as _},
        ProvisionConfig,
    },
    fs::{
        blkid,
        host::{Host, SystemHost},
        luks2::{self, UnlockMaterial},
        mkfs, mount,
    },
    persist::{fstab, unit},
    provider::{
        keyfile,
        wordlist::{self, PassphraseError},
        IntoProvider as _, KeyProvider as _,
    },
    target::EncryptionTarget,
    types::{CallingUser, MakeFsType, Passphrase},
    validate,
};

/// The literal the operator has to type before the device is overwritten.
pub const CONFIRMATION_LITERAL: &str = "YES";

/// Asks the operator a question and returns the answer as typed.
pub trait ConfirmPrompt: Send + Sync {
    fn ask(&self, prompt: &str) -> Result<String>;
}

pub struct TerminalPrompt;

impl ConfirmPrompt for TerminalPrompt {
    fn ask(&self, prompt: &str) -> Result<String> {
        if !Term::stderr().is_term() {
            bail!("Standard error is not a terminal, cannot ask for confirmation");
        }

        let answer: String = Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?;
        Ok(answer)
    }
}

/// Whether the word list may still be installed during this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAttempt {
    FirstRun,
    AfterRecovery,
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub device: PathBuf,
    pub label: String,
    pub fs_type: MakeFsType,
    pub recovery: RecoveryAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    GeneratePassphrase,
    ConfirmDestruction,
    Format,
    BackupHeader,
    OpenWithPassphrase,
    CreateFilesystem,
    CreateKeyfile,
    AddKeyfileSlot,
    OpenWithKeyfile,
    MountAndLink,
    AddPersistentMountEntry,
    InstallBootUnit,
    Close,
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Step::Validate => "validate device and label",
            Step::GeneratePassphrase => "generate passphrase",
            Step::ConfirmDestruction => "confirm destruction",
            Step::Format => "format LUKS2 container",
            Step::BackupHeader => "back up LUKS header",
            Step::OpenWithPassphrase => "open container with passphrase",
            Step::CreateFilesystem => "create filesystem",
            Step::CreateKeyfile => "create keyfile",
            Step::AddKeyfileSlot => "add keyfile slot",
            Step::OpenWithKeyfile => "open container with keyfile",
            Step::MountAndLink => "mount and link",
            Step::AddPersistentMountEntry => "add mount table entry",
            Step::InstallBootUnit => "install boot unit",
            Step::Close => "unmount and close",
        })
    }
}

/// Completed steps of a run, reported if a later step fails.
#[derive(Debug, Default)]
pub struct Progress {
    completed: Vec<Step>,
}

impl Progress {
    async fn step<T, F>(&mut self, step: Step, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tracing::debug!("Running step: {step}");
        let value = fut.await.with_context(|| format!("Failed to {step}"))?;
        self.completed.push(step);
        Ok(value)
    }

    pub fn completed(&self) -> &[Step] {
        &self.completed
    }

    fn report_failure(&self) {
        if self.completed.is_empty() {
            tracing::error!("Provisioning failed before any step completed");
            return;
        }
        let destructive = self.completed.contains(&Step::Format);
        tracing::error!(
            "Provisioning failed after completing: {}",
            self.completed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        if destructive {
            tracing::error!(
                "Nothing was rolled back, inspect and clean up the artifacts above before running again"
            );
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Completed(ProvisionSummary),
    Aborted,
}

/// Everything the operator needs to keep after a successful run.
#[derive(Debug)]
pub struct ProvisionSummary {
    target: EncryptionTarget,
    fs_type: MakeFsType,
    header_backup: PathBuf,
    fstab: PathBuf,
    fs_uuid: String,
    outer_uuid: String,
    passphrase: Passphrase,
}

impl ProvisionSummary {
    pub fn target(&self) -> &EncryptionTarget {
        &self.target
    }

    pub fn header_backup(&self) -> &std::path::Path {
        &self.header_backup
    }

    pub fn fs_uuid(&self) -> &str {
        &self.fs_uuid
    }

    /// UUID of the LUKS container, which the boot service waits for.
    pub fn outer_uuid(&self) -> &str {
        &self.outer_uuid
    }

    pub fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    /// The table printed at the end of a run. This is the only place the
    /// passphrase is ever shown.
    pub fn render(&self) -> String {
        let target = &self.target;
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Item", "Value"]);

        let rows = [
            ("Label", target.label().to_owned()),
            ("Device", target.device().display().to_string()),
            ("Container UUID", self.outer_uuid.clone()),
            ("Mapper name", target.crypt_name().to_owned()),
            ("Mapped device", target.mapped_device().display().to_string()),
            ("Filesystem", format!("{} (UUID={})", self.fs_type, self.fs_uuid)),
            ("Mount point", target.mount_point().display().to_string()),
            ("Home symlink", target.symlink_path().display().to_string()),
            ("Keyfile", target.key_file().display().to_string()),
            ("Header backup", self.header_backup.display().to_string()),
            ("Mount table", self.fstab.display().to_string()),
            ("Boot service", target.service_name().to_owned()),
            ("Boot script", target.script_path().display().to_string()),
        ];
        for (item, value) in rows {
            table.add_row(vec![Cell::new(item), Cell::new(value)]);
        }
        table.add_row(vec![
            Cell::new("Passphrase").fg(Color::Yellow),
            Cell::new(self.passphrase.expose()).fg(Color::Yellow),
        ]);

        format!(
            "{table}\nWrite the passphrase down and keep it with the header backup, it is not stored anywhere."
        )
    }
}

pub struct Provisioner<'a> {
    host: &'a dyn Host,
    config: &'a ProvisionConfig,
    user: &'a CallingUser,
    prompt: &'a dyn ConfirmPrompt,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        host: &'a dyn Host,
        config: &'a ProvisionConfig,
        user: &'a CallingUser,
        prompt: &'a dyn ConfirmPrompt,
    ) -> Self {
        Self {
            host,
            config,
            user,
            prompt,
        }
    }

    pub async fn provision(&self, options: &ProvisionOptions) -> Result<Outcome> {
        let mut progress = Progress::default();
        let result = self.run_pipeline(options, &mut progress).await;
        if result.is_err() {
            progress.report_failure();
        }
        result
    }

    async fn run_pipeline(
        &self,
        options: &ProvisionOptions,
        progress: &mut Progress,
    ) -> Result<Outcome> {
        let host = self.host;
        let paths = &self.config.paths;

        let target = progress
            .step(
                Step::Validate,
                validate::validate(host, &options.device, &options.label, paths, self.user),
            )
            .await?;

        let passphrase = progress
            .step(
                Step::GeneratePassphrase,
                self.generate_passphrase(options.recovery),
            )
            .await?;

        let confirmed = progress
            .step(Step::ConfirmDestruction, async { self.confirm(&target) })
            .await?;
        if !confirmed {
            tracing::info!("Aborted");
            return Ok(Outcome::Aborted);
        }

        let device = target.device();
        progress
            .step(Step::Format, luks2::format(host, device, &passphrase))
            .await?;
        tracing::info!("Formatted {device:?} as LUKS2 container");

        let header_backup = progress
            .step(
                Step::BackupHeader,
                luks2::backup_header(
                    host,
                    device,
                    target.label(),
                    target.backup_dir(),
                    self.user,
                ),
            )
            .await?;

        progress
            .step(
                Step::OpenWithPassphrase,
                luks2::open(host, &target, UnlockMaterial::Passphrase(&passphrase)),
            )
            .await?;

        progress
            .step(
                Step::CreateFilesystem,
                mkfs::make_fs(
                    host,
                    target.mapped_device(),
                    target.label(),
                    options.fs_type,
                ),
            )
            .await?;

        progress
            .step(
                Step::CreateKeyfile,
                keyfile::create_keyfile(
                    target.key_file(),
                    nix::unistd::geteuid().as_raw(),
                    nix::unistd::getegid().as_raw(),
                ),
            )
            .await?;

        progress
            .step(
                Step::AddKeyfileSlot,
                luks2::add_keyfile_slot(host, device, &passphrase, target.key_file()),
            )
            .await?;
        tracing::info!("Keyfile added as an additional unlock slot");

        progress
            .step(
                Step::OpenWithKeyfile,
                luks2::open(host, &target, UnlockMaterial::Keyfile(target.key_file())),
            )
            .await?;

        progress
            .step(
                Step::MountAndLink,
                mount::mount_and_link(host, &target, self.user),
            )
            .await?;

        let fs_uuid = progress
            .step(
                Step::AddPersistentMountEntry,
                fstab::append_entry(host, &target, options.fs_type, &paths.fstab),
            )
            .await?;

        let outer_uuid = progress
            .step(Step::InstallBootUnit, async {
                let outer_uuid = blkid::uuid_of(host, device).await?;
                unit::install_boot_unit(host, &target, &outer_uuid, &self.config.boot).await?;
                anyhow::Ok(outer_uuid)
            })
            .await?;

        progress
            .step(Step::Close, async {
                mount::unmount(host, target.mount_point()).await?;
                luks2::close(host, target.crypt_name()).await
            })
            .await?;

        tracing::info!(
            "Volume {} is ready, start {} to unlock and mount it",
            target.label(),
            target.service_name()
        );

        Ok(Outcome::Completed(ProvisionSummary {
            target,
            fs_type: options.fs_type,
            header_backup,
            fstab: paths.fstab.clone(),
            fs_uuid,
            outer_uuid,
            passphrase,
        }))
    }

    /// Generates the setup passphrase. A missing word list is installed once
    /// and the generation retried.
    async fn generate_passphrase(&self, mut attempt: RecoveryAttempt) -> Result<Passphrase> {
        loop {
            let provider = self.config.passphrase.clone().into_provider();
            let err = match provider.get_key().await {
                Ok(passphrase) => return Ok(passphrase),
                Err(err) => err,
            };

            if err.downcast_ref::<PassphraseError>().is_none() {
                return Err(err);
            }

            match attempt {
                RecoveryAttempt::FirstRun => {
                    tracing::warn!("{err:#}");
                    wordlist::install_wordlist(self.host, &self.config.passphrase).await?;
                    attempt = RecoveryAttempt::AfterRecovery;
                }
                RecoveryAttempt::AfterRecovery => {
                    return Err(err.context(
                        "Still no word list after the install attempt, install one manually",
                    ));
                }
            }
        }
    }

    fn confirm(&self, target: &EncryptionTarget) -> Result<bool> {
        let answer = self.prompt.ask(&format!(
            "All data on {} will be permanently destroyed. Type {CONFIRMATION_LITERAL} to continue",
            target.device().display()
        ))?;
        Ok(answer == CONFIRMATION_LITERAL)
    }
}

pub struct ProvisionCommand {
    pub options: ProvisionOptions,
    pub config_dir: Option<String>,
}

#[async_trait]
impl super::Command for ProvisionCommand {
    async fn run(&self) -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            bail!("This command must be run as root");
        }

        let config_source = match &self.config_dir {
            Some(config_dir) => {
                let path = std::path::Path::new(config_dir);
                if !path.is_dir() {
                    bail!("Config dir {config_dir} does not exist or not a directory")
                }
                FileSystemConfigSource::new(path)
            }
            None => FileSystemConfigSource::new_with_default_config_dir(),
        };
        tracing::debug!(
            "Using config source from {}",
            config_source.source_debug_string()
        );
        let config = config_source.get_config().await?;

        let host = SystemHost::new(tracing::enabled!(
            target: "cryptpilot_provision",
            tracing::Level::DEBUG
        ));
        let user = CallingUser::from_env()?;
        tracing::info!("Provisioning on behalf of user {} ({})", user.name, user.uid);

        let outcome = Provisioner::new(&host, &config, &user, &TerminalPrompt)
            .provision(&self.options)
            .await?;

        if let Outcome::Completed(summary) = outcome {
            println!("{}", summary.render());
        }

        Ok(())
    }
}
