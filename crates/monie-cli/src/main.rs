//! monie - offline exchange-rate worker host.
//!
//! Runs the worker against the configured origin and drives it from stdin:
//! one JSON object per line, answered with JSON lines on stdout.
//!
//! ```text
//! {"fetch": "api/latest.json"}
//! {"fetch": "push-register", "method": "POST", "body": {...}}
//! {"push": {"type": "NEW_RATES"}}
//! {"message": {"type": "REQUEST_STATUS_INFO"}}
//! ```
//!
//! `--status` prints the cache state, `--refresh` fetches fresh rates once.
//! `--init-config` writes the default config file.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use monie_core::worker::{EventOutcome, LifecycleEvent};
use monie_core::{
    CacheStore, ClientId, Config, HttpNetwork, Notification, NotificationSink, Request, Response,
    Worker,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix inside the cache directory
const LOG_FILE: &str = "monie.log";

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Write one JSON line to stdout.
fn emit(kind: &str, value: impl Serialize) {
    match serde_json::to_value(value) {
        Ok(value) => {
            let mut line = Map::new();
            line.insert(kind.to_string(), value);
            println!("{}", Value::Object(line));
        }
        Err(e) => warn!(kind, error = %e, "Failed to encode output"),
    }
}

/// Shows notifications by printing them.
struct ConsoleSink {
    granted: bool,
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn permission_granted(&self) -> bool {
        self.granted
    }

    async fn show(&self, notification: Notification) -> monie_core::Result<()> {
        emit("notification", &notification);
        Ok(())
    }
}

#[derive(Serialize)]
struct ResponseLine {
    status: u16,
    body: String,
}

impl From<&Response> for ResponseLine {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status,
            body: response.text(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    // Check for CLI commands
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "--init-config" {
        let (path, written) = Config::init().context("Failed to write configuration")?;
        if written {
            println!("Wrote default config to {}", path.display());
        } else {
            println!("Config already exists at {}", path.display());
        }
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    let cache_dir = config.cache_dir()?;
    if config.log_to_file {
        std::fs::create_dir_all(&cache_dir)?;
    }
    let _log_guard = init_tracing(config.log_to_file.then_some(cache_dir.as_path()));
    info!(version = %config.version, origin = %config.origin, "monie starting");

    let store = CacheStore::open_dir(cache_dir.clone())
        .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?;
    let network = HttpNetwork::new(config.request_timeout())?;
    let sink = ConsoleSink {
        granted: config.notifications_granted,
    };
    let worker = Worker::new(config.worker_config()?, store, Arc::new(network), Arc::new(sink))?;

    if args.len() > 1 && args[1] == "--status" {
        emit("status", worker.status().await);
        return Ok(());
    }
    if args.len() > 1 && args[1] == "--refresh" {
        return refresh_once(&worker).await;
    }

    run(&worker).await
}

async fn refresh_once(worker: &Worker) -> Result<()> {
    worker.start().await;
    let outcome = worker.refresh_service().refresh().await;
    worker.settled().await;
    emit("response", ResponseLine::from(&outcome.response));
    if !outcome.updated {
        anyhow::bail!("Rates were not updated (status {})", outcome.response.status);
    }
    Ok(())
}

/// Event loop: start the worker, then feed it stdin until EOF.
async fn run(worker: &Worker) -> Result<()> {
    let state = worker.start().await;
    info!(?state, "Worker started");

    let (client, mut messages) = worker.connect_client().await;
    let forward = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            emit("message", message);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(command) => handle_command(worker, client, command).await,
            Err(e) => warn!(error = %e, "Ignoring malformed input line"),
        }
    }

    // Closing the last client lets a waiting update take over
    worker.disconnect_client(client).await;
    worker.settled().await;
    if let Err(e) = forward.await {
        warn!(error = %e, "Message forwarder failed");
    }
    Ok(())
}

async fn handle_command(worker: &Worker, client: ClientId, command: Value) {
    if let Some(path) = command.get("fetch").and_then(Value::as_str) {
        match fetch_request(worker, path, &command) {
            Ok(request) => match worker.respond_to(request).await {
                Some(response) => emit("response", ResponseLine::from(&response)),
                None => emit("response", Value::Null),
            },
            Err(e) => warn!(path, error = %e, "Invalid fetch"),
        }
    } else if let Some(payload) = command.get("push") {
        let data = match payload {
            Value::Null => None,
            Value::String(raw) => Some(raw.clone().into_bytes()),
            other => Some(other.to_string().into_bytes()),
        };
        if let EventOutcome::Pushed(outcome) = worker.dispatch(LifecycleEvent::Push(data)).outcome().await {
            emit("push", outcome);
        }
    } else if let Some(data) = command.get("message") {
        let event = LifecycleEvent::Message {
            from: client,
            data: data.clone(),
        };
        worker.dispatch(event).outcome().await;
    } else {
        debug!(%command, "Unknown command");
    }
}

fn fetch_request(worker: &Worker, path: &str, command: &Value) -> Result<Request> {
    let url = worker.config().origin.join(path)?;
    let method = command.get("method").and_then(Value::as_str).unwrap_or("GET");
    let request = match method.to_ascii_uppercase().as_str() {
        "GET" => Request::get(url),
        "POST" => {
            let body = command.get("body").cloned().unwrap_or(Value::Null);
            Request::post_json(url, serde_json::to_vec(&body)?)
        }
        other => anyhow::bail!("Unsupported method {}", other),
    };
    Ok(request)
}
