mod config;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_storage_core::ByteReader;
use vault_storage_local::{validate_config, LocalBackend, StorageBackend, StorageConfig};

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries file contents and listings.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let local = config.local_config();
    validate_config(&StorageConfig::Local(local.clone()))?;

    if let Command::Validate = config.command {
        println!("configuration is valid");
        return Ok(());
    }

    info!("Opening vault at {}", local.path.display());
    let backend = LocalBackend::new(local)
        .await
        .context("failed to open vault")?
        .with_cancellation(create_cancel_signal());

    let result = run(&backend, &config.command).await;
    backend.close().await?;
    result
}

async fn run(backend: &LocalBackend, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Validate => {}
        Command::Health => {
            backend.health().await?;
            println!("ok");
        }
        Command::Read { path } => {
            let mut reader = backend.read_stream(path).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
        Command::Write { path, from } => {
            let reader: ByteReader = match from {
                Some(file) => Box::pin(
                    tokio::fs::File::open(file)
                        .await
                        .with_context(|| format!("failed to open {}", file.display()))?,
                ),
                None => Box::pin(tokio::io::stdin()),
            };
            let written = backend.write_stream(path, reader).await?;
            info!("Wrote {} bytes to {}", written, path);
        }
        Command::Delete { path } => {
            backend.delete(path).await?;
            info!("Deleted {}", path);
        }
        Command::List { prefix } => {
            for path in backend.list(prefix).await? {
                println!("{}", path);
            }
        }
        Command::Stat { path } => {
            let info = backend.stat(path).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}

/// Cancel pending lock waits on Ctrl+C.
///
/// Only waits are cancelled; a write already in progress finishes or rolls back on its own.
fn create_cancel_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling pending lock waits");
            trigger.cancel();
        }
    });

    token
}
