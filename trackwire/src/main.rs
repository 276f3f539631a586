//! trackwire - CLI for inspecting and driving the dispatch queue
//!
//! This tool provides commands for:
//! - Checking configuration and the number of queued events
//! - Releasing queued events to the collect endpoint
//! - Discarding queued events
//! - Sending a single event through the full pipeline
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/trackwire/data.db (~/.local/share/trackwire/data.db)
//! - Config: $XDG_CONFIG_HOME/trackwire/config.toml (~/.config/trackwire/config.toml)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use trackwire_core::modules::{Dispatcher, ModuleCompletion};
use trackwire_core::{
    Config, DispatchRequest, ModuleResponse, Payload, TrackDecision, TrackRequest, Tracker,
};

/// How long to wait for the collect endpoint before giving up
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "trackwire")]
#[command(about = "Inspect and drive the trackwire dispatch queue")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queue status
    Status,

    /// Release queued events to the collect endpoint now
    Flush,

    /// Discard all queued events without sending them
    Clear,

    /// Track one event through the pipeline
    Send {
        /// Event name
        event: String,

        /// Extra event data as a JSON object
        #[arg(short, long)]
        data: Option<String>,

        /// Track as a screen view instead of an event
        #[arg(long)]
        view: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(trackwire_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(config),
        Command::Flush => cmd_flush(config),
        Command::Clear => cmd_clear(config),
        Command::Send { event, data, view } => cmd_send(config, &event, data.as_deref(), view),
    }
}

fn cmd_status(config: Config) -> Result<()> {
    println!("trackwire Configuration");
    println!("=======================");
    println!();
    println!("Store:           {}", config.database_path().display());
    println!("Log File:        {}", Config::log_path().display());
    println!("Max Queue Size:  {}", config.queue.max_queue_size);
    println!(
        "Expiration:      {}",
        config
            .queue
            .expiration_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "until cleared".to_string())
    );
    println!("Batching:        {}", config.batching.enabled);
    println!("Batch Size:      {}", config.batching.batch_size);
    println!(
        "Bypass Keys:     {}",
        config
            .batching
            .bypass_keys
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Collect:         {}",
        match (&config.collect.url, config.collect.is_ready()) {
            (Some(url), true) => url.clone(),
            _ => "disabled".to_string(),
        }
    );
    println!("Tag Management:  {}", config.tag_management.enabled);

    let tracker = Tracker::open(config).context("failed to open store")?;
    println!();
    println!("Queued events:   {}", tracker.queued_events());

    Ok(())
}

fn cmd_clear(config: Config) -> Result<()> {
    let tracker = Tracker::open(config).context("failed to open store")?;
    let queued = tracker.queued_events();
    tracker.clear_queue();
    println!("Cleared {} queued event(s)", queued);
    Ok(())
}

fn cmd_flush(config: Config) -> Result<()> {
    if !config.collect.is_ready() {
        println!("Collect dispatcher is not configured. Run 'status' for details.");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let tracker = Tracker::open(config).context("failed to open store")?;
    let deliveries = register_collect(&tracker, &runtime)?;

    let queued = tracker.queued_events();
    if queued == 0 {
        println!("No queued events to flush.");
        return Ok(());
    }

    println!("Flushing {} queued event(s)...", queued);
    let released = tracker.flush();

    let responses = deliveries.wait_all()?;
    let failed: Vec<_> = responses.iter().filter(|r| !r.success).collect();

    if failed.is_empty() {
        println!("Flushed {} event(s) in {} request(s)", released, responses.len());
        Ok(())
    } else {
        for response in &failed {
            if let Some(error) = &response.error {
                eprintln!("  {}", error);
            }
        }
        bail!(
            "{} of {} request(s) failed; released events are not re-queued",
            failed.len(),
            responses.len()
        )
    }
}

fn cmd_send(config: Config, event: &str, data: Option<&str>, view: bool) -> Result<()> {
    let data = match data {
        Some(raw) => parse_data(raw)?,
        None => Payload::new(),
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let tracker = Tracker::open(config).context("failed to open store")?;
    let deliveries = register_collect(&tracker, &runtime)?;

    let request = if view {
        TrackRequest::view(event)
    } else {
        TrackRequest::event(event)
    };

    let (tx, rx) = mpsc::channel();
    let request = request
        .with_data(data)
        .with_completion(move |outcome| {
            let _ = tx.send(outcome);
        });

    match tracker.track(request) {
        TrackDecision::Queued => {
            println!(
                "Queued '{}' ({} event(s) waiting)",
                event,
                tracker.queued_events()
            );
            // A batch-size release may have been triggered by this event
            deliveries.wait_all()?;
            Ok(())
        }
        TrackDecision::Dropped => bail!("'{}' was dropped by a validator", event),
        TrackDecision::Forwarded => {
            let outcome = rx
                .recv_timeout(DELIVERY_TIMEOUT)
                .context("timed out waiting for delivery")?;
            deliveries.wait_all()?;

            if outcome.success {
                println!("Sent '{}'", event);
                Ok(())
            } else {
                let reason = outcome
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                bail!("failed to send '{}': {}", event, reason)
            }
        }
    }
}

fn parse_data(raw: &str) -> Result<Payload> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--data must be valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("--data must be a JSON object"),
    }
}

/// Register the collect dispatcher behind a wrapper that reports every
/// response, so the process can wait for in-flight requests before exiting.
fn register_collect(tracker: &Tracker, runtime: &tokio::runtime::Runtime) -> Result<Deliveries> {
    let registry = tracker.registry();
    tracker
        .enable_collect(runtime.handle().clone())
        .context("failed to configure collect dispatcher")?;

    let (tx, rx) = mpsc::channel();
    let deliveries = Deliveries {
        started: Arc::new(AtomicUsize::new(0)),
        responses: rx,
    };

    if let Some(inner) = registry
        .entry(trackwire_core::dispatchers::collect::MODULE_ID)
        .and_then(|entry| entry.dispatcher)
    {
        tracing::debug!("Collect dispatcher registered");
        registry.register_dispatcher(Arc::new(Observed {
            inner,
            started: Arc::clone(&deliveries.started),
            responses: Mutex::new(tx),
        }));
    }

    Ok(deliveries)
}

/// Dispatcher wrapper that counts requests and echoes responses
struct Observed {
    inner: Arc<dyn Dispatcher>,
    started: Arc<AtomicUsize>,
    responses: Mutex<Sender<ModuleResponse>>,
}

impl Dispatcher for Observed {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn dynamic_track(&self, request: DispatchRequest, completion: ModuleCompletion) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let tx = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.inner.dynamic_track(
            request,
            Box::new(move |response| {
                let _ = tx.send(response.clone());
                completion(response);
            }),
        );
    }
}

struct Deliveries {
    started: Arc<AtomicUsize>,
    responses: Receiver<ModuleResponse>,
}

impl Deliveries {
    /// Block until every request handed to the dispatcher has a response
    fn wait_all(&self) -> Result<Vec<ModuleResponse>> {
        let expected = self.started.load(Ordering::SeqCst);
        (0..expected)
            .map(|_| {
                self.responses
                    .recv_timeout(DELIVERY_TIMEOUT)
                    .context("timed out waiting for collect endpoint")
            })
            .collect()
    }
}
