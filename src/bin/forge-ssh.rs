use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use forge_ssh::registry::ConfigKeyRegistry;
use forge_ssh::{serv, Settings, SshServer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Built-in SSH server for a self-hosted Git service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Path to the service configuration file.
  #[arg(long, global = true, default_value = "custom/conf/app.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the SSH server.
  Run,

  /// Serve one Git command for an authenticated key. Started by the SSH
  /// server with the client's command in SSH_ORIGINAL_COMMAND.
  Serv {
    /// The authenticated key, as `key-<id>`.
    key: String,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  match args.command {
    Command::Run => run(args.config).await,
    Command::Serv { key } => {
      // stderr goes to the Git client, so keep it to what they should see.
      tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .init();

      let settings = Settings::load(&args.config).context("failed to load settings")?;
      let original_command = std::env::var("SSH_ORIGINAL_COMMAND").ok();
      match serv::run(&settings, &key, original_command.as_deref()).await {
        Ok(code) => std::process::exit(code as i32),
        Err(error) => {
          eprintln!("{}: {error}", settings.app_name);
          std::process::exit(1);
        }
      }
    }
  }
}

async fn run(config: PathBuf) -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .pretty()
        // Use span events to automatically log each of the SSH handlers.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW),
    )
    .with(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let settings = Settings::load(&config).with_context(|| format!("failed to load settings from {config:?}"))?;
  tracing::debug!(app_path = ?settings.app_path, app_data_path = ?settings.app_data_path, "settings loaded");
  let registry = Arc::new(ConfigKeyRegistry::new(settings.public_keys.clone()));

  let server = SshServer::new(Arc::new(settings), registry)?;
  let (_, accept_loop) = server.start().await?;

  tokio::select! {
    result = accept_loop => result.context("accept loop panicked")?,
    result = tokio::signal::ctrl_c() => {
      result.context("failed to listen for ctrl-c")?;
      tracing::info!("shutting down");
    }
  }
  Ok(())
}
