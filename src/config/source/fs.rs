use std::path::PathBuf;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::config::ProvisionConfig;

use super::ConfigSource;

pub const CRYPTPILOT_CONFIG_DIR_DEFAULT: &str = "/etc/cryptpilot";
pub const PROVISION_CONFIG_FILE: &str = "provision.toml";

pub struct FileSystemConfigSource {
    config_dir: PathBuf,
}

impl FileSystemConfigSource {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn new_with_default_config_dir() -> Self {
        Self::new(PathBuf::from(CRYPTPILOT_CONFIG_DIR_DEFAULT))
    }

    async fn load_config(&self) -> Result<ProvisionConfig> {
        let path = self.config_dir.join(PROVISION_CONFIG_FILE);

        tracing::debug!("Loading provision config from: {path:?}");
        if !path.exists() {
            tracing::debug!("Provision config not found, using defaults: {path:?}");
            return Ok(ProvisionConfig::default());
        }

        let config = tokio::fs::read_to_string(&path)
            .await
            .map_err(Into::into)
            .and_then(|content| {
                toml::from_str::<ProvisionConfig>(&content)
                    .context("Failed to parse content as TOML")
            })
            .and_then(|config| config.check().map(|_| config))
            .with_context(|| format!("Failed to load provision config file: {}", path.display()))?;

        Ok(config)
    }
}

#[async_trait]
impl ConfigSource for FileSystemConfigSource {
    fn source_debug_string(&self) -> String {
        format!("filesystem: {:?}", self.config_dir)
    }

    async fn get_config(&self) -> Result<ProvisionConfig> {
        self.load_config().await
    }
}
