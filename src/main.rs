mod actions;
mod api;
mod attachments;
mod attributes;
mod config;
mod content;
mod export;
mod model;
mod revision;
mod storage;
mod users;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use jiff::Span;
use tracing_subscriber::EnvFilter;

use actions::{ActionHandler, CommandHandler, Dispatcher, Signal};
use attachments::LocalBlobs;
use config::Config;
use storage::Storage;
use users::StaticDirectory;

/// elogd, the electronic logbook service.
#[derive(Debug, Parser)]
#[command(name = "elogd")]
struct Cli {
    /// Path to the configuration file. Defaults to `./elogd.toml`, then
    /// `~/.config/elogd/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    let local = PathBuf::from("elogd.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("elogd").join("config.toml"))
        .unwrap_or(local)
}

fn dispatcher_from(config: &config::ActionsConfig) -> Dispatcher {
    let mut handlers: HashMap<Signal, Arc<dyn ActionHandler>> = HashMap::new();
    let configured = [
        (Signal::NewEntry, &config.new_entry),
        (Signal::EditEntry, &config.edit_entry),
        (Signal::NewLogbook, &config.new_logbook),
        (Signal::EditLogbook, &config.edit_logbook),
    ];
    for (signal, command) in configured {
        if let Some(command) = command {
            handlers.insert(signal, Arc::new(CommandHandler::new(command.clone())));
        }
    }
    Dispatcher::new(handlers, config.queue, config.workers)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("elogd=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&config_path(&cli)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let storage = match Storage::open(&config.database.name) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to open database: {e}");
            process::exit(1);
        }
    };
    let blobs = match LocalBlobs::new(&config.upload_folder) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("Failed to initialize upload folder: {e}");
            process::exit(1);
        }
    };

    let state = api::AppState {
        storage,
        blobs,
        dispatcher: dispatcher_from(&config.actions),
        directory: Arc::new(StaticDirectory::new(config.users.clone())),
        exporter: None,
        lock_ttl: Span::new().minutes(config.lock_ttl_minutes),
    };
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(config.listen.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {e}", config.listen);
            process::exit(1);
        }
    };
    tracing::info!(listen = %config.listen, database = %config.database.name.display(), "elogd up");

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {e}");
        process::exit(1);
    }
}
