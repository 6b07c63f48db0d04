use std::{collections::BTreeSet, path::PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use rand::{rngs::OsRng, Rng as _};
use thiserror::Error;

use crate::{
    config::PassphraseConfig,
    fs::host::{ExternalCommand, Host},
    types::Passphrase,
};

use super::{IntoProvider, KeyProvider};

/// A word list shorter than this gives too little entropy per word.
pub const MIN_WORDLIST_LEN: usize = 2048;
const MIN_WORD_LEN: usize = 4;
const MAX_WORD_LEN: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PassphraseError {
    #[error("No usable word list found (searched: {})", display_paths(.searched))]
    DependencyUnavailable { searched: Vec<PathBuf> },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct WordListKeyProvider {
    options: PassphraseConfig,
}

impl IntoProvider for PassphraseConfig {
    type Provider = WordListKeyProvider;

    fn into_provider(self) -> Self::Provider {
        WordListKeyProvider { options: self }
    }
}

impl KeyProvider for WordListKeyProvider {
    async fn get_key(&self) -> Result<Passphrase> {
        let wordlist = load_wordlist(&self.options.wordfiles).await?;
        generate(&wordlist, self.options.words, &self.options.delimiter)
    }
}

/// Keeps lowercase ASCII words of a memorable length, sorted and deduplicated.
pub fn parse_wordlist(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|word| (MIN_WORD_LEN..=MAX_WORD_LEN).contains(&word.len()))
        .filter(|word| word.bytes().all(|b| b.is_ascii_lowercase()))
        .map(ToOwned::to_owned)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Returns the words of the first file in `wordfiles` that has enough of them.
pub async fn load_wordlist(wordfiles: &[PathBuf]) -> Result<Vec<String>> {
    for wordfile in wordfiles {
        let content = match tokio::fs::read_to_string(wordfile).await {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("Skipping word file {wordfile:?}: {e}");
                continue;
            }
        };

        let wordlist = parse_wordlist(&content);
        if wordlist.len() < MIN_WORDLIST_LEN {
            tracing::debug!(
                "Skipping word file {wordfile:?}: only {} usable words",
                wordlist.len()
            );
            continue;
        }

        tracing::debug!("Using word file {wordfile:?} with {} words", wordlist.len());
        return Ok(wordlist);
    }

    Err(PassphraseError::DependencyUnavailable {
        searched: wordfiles.to_vec(),
    }
    .into())
}

/// Picks `words` entries from `wordlist` with the OS random number generator.
pub fn generate(wordlist: &[String], words: usize, delimiter: &str) -> Result<Passphrase> {
    if wordlist.is_empty() {
        bail!("Cannot generate a passphrase from an empty word list")
    }

    let mut rng = OsRng;
    let passphrase = (0..words)
        .map(|_| wordlist[rng.gen_range(0..wordlist.len())].as_str())
        .collect::<Vec<_>>()
        .join(delimiter);

    Ok(Passphrase::from(passphrase))
}

/// Package manager binaries and the command installing a word list with each.
const KNOWN_INSTALLERS: &[(&str, &[&str])] = &[
    ("apt-get", &["apt-get", "install", "-y", "wamerican"]),
    ("dnf", &["dnf", "install", "-y", "words"]),
    ("yum", &["yum", "install", "-y", "words"]),
    ("zypper", &["zypper", "--non-interactive", "install", "words"]),
    ("pacman", &["pacman", "-S", "--noconfirm", "words"]),
];

pub fn detect_install_command() -> Option<Vec<String>> {
    KNOWN_INSTALLERS
        .iter()
        .find(|(binary, _)| which::which(binary).is_ok())
        .map(|(_, command)| command.iter().map(|s| s.to_string()).collect())
}

/// Installs a word list with the configured command, or with the package
/// manager found on this system.
pub async fn install_wordlist(host: &dyn Host, options: &PassphraseConfig) -> Result<()> {
    let command = options
        .install_command
        .clone()
        .or_else(detect_install_command)
        .ok_or_else(|| {
            anyhow!(
                "No supported package manager found, install a word list to one of: {}",
                display_paths(&options.wordfiles)
            )
        })?;

    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("The word list install command is empty"))?;

    tracing::info!("No word list found, installing one now: {}", command.join(" "));
    host.run(&ExternalCommand::new(program.as_str()).args(args))
        .await
        .with_context(|| format!("Failed to install a word list with `{}`", command.join(" ")))?;

    Ok(())
}
