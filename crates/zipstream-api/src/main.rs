//! `zipstream-api` binary entrypoint.
//!
//! Loads an optional config file, then environment variables, connects the
//! manifest and object backends, and serves until shutdown.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::{Context as _, Result};

use zipstream_api::config::{Config, StorageType};
use zipstream_api::server::Server;
use zipstream_core::observability::{init_logging, LogFormat};
use zipstream_core::storage::{LocalBackend, ObjectBackend, S3Backend};

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_logging(LogFormat::from_env());

    let config = Config::from_env().context("failed to load configuration")?;

    let manifests = zipstream_core::db::connect(&config.store_config())
        .await
        .context("failed to initialize manifest store")?;
    tracing::info!(engine = config.db_engine.as_str(), "initialized manifest store");

    let backend: Arc<dyn ObjectBackend> = match config.storage_type {
        StorageType::Local => {
            let path = config
                .storage_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("STORAGE_PATH is required for local storage"))?;
            Arc::new(LocalBackend::new(path).context("failed to initialize local storage")?)
        }
        StorageType::S3 => Arc::new(S3Backend::new(config.s3.clone())),
    };
    tracing::info!(kind = backend.kind(), "initialized storage backend");

    Server::new(config, manifests, backend).serve().await?;
    Ok(())
}

/// Loads environment variables from a file before `Config::from_env`.
///
/// Priority: `CONFIG_FILE` env var, then `.env` in the working directory.
/// A named file that cannot be read is fatal; a missing `.env` is not.
fn load_env_file() {
    match std::env::var("CONFIG_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("failed to load config file {path}: {e}");
                std::process::exit(1);
            }
            eprintln!("loaded config from: {path}");
        }
        _ => {
            if dotenvy::dotenv().is_ok() {
                eprintln!("loaded config from: .env");
            }
        }
    }
}
