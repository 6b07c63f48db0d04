#![deny(clippy::disallowed_methods)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod fs;
pub mod persist;
pub mod provider;
pub mod target;
pub mod types;
pub mod validate;

use anyhow::Result;
use clap::Parser as _;
use cmd::IntoCommand as _;
use shadow_rs::shadow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse();

    tracing::info!(
        "cryptpilot-provision version: v{}  commit: {}  buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );

    // Handle the command
    args.into_command().run().await?;

    Ok(())
}
