//! pane-push server binary.
//!
//! See the `pane_push` library for the core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use pane_push::server::{self, AppState};
use pane_push::{Config, Dispatcher, Store, Tmux, VapidKeys, WebPush};

#[derive(Parser)]
#[command(name = "pane-push")]
#[command(version)]
#[command(about = "Web push relay for terminal automation events")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Override the configured bind address (e.g. 127.0.0.1:9000)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the VAPID public key and the notify API key
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => serve(bind).await,
        Commands::Keys => show_keys(),
    }
}

/// Load config and key material, generating secrets on first run.
fn load_setup() -> Result<(Config, VapidKeys)> {
    let mut config = Config::load()?;
    config.ensure_api_key()?;
    let vapid = VapidKeys::load_or_generate(&Config::config_dir()?)?;
    Ok((config, vapid))
}

async fn serve(bind_override: Option<String>) -> Result<()> {
    let (mut config, vapid) = load_setup()?;
    if let Some(bind) = bind_override {
        config.bind = bind;
    }

    let store = Arc::new(Store::open(Config::data_dir()?)?);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let gateway = Arc::new(WebPush::new(
        client,
        vapid.private_key_base64url().to_string(),
        config.push_contact.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), gateway));

    let bind = config.bind.clone();
    let state = AppState {
        vapid_public_key: vapid.public_key_base64url().to_string(),
        store,
        dispatcher,
        tmux: Arc::new(Tmux::new()),
        config: Arc::new(config),
    };

    // Printed for client setup, same as the `keys` subcommand.
    println!("VAPID public key: {}", state.vapid_public_key);
    println!("API key: {}", state.config.api_key);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log::info!("[Server] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("[Server] Shutting down");
}

fn show_keys() -> Result<()> {
    let (config, vapid) = load_setup()?;
    println!("VAPID public key: {}", vapid.public_key_base64url());
    println!("API key: {}", config.api_key);
    Ok(())
}
