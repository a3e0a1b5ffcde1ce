//! Resilient queue service.
//!
//! ```text
//!   enqueue ──▶ storage breaker ──▶ pending lists (high/normal/low)
//!                    │                        │
//!                    ▼                        ▼
//!              retry buffer            workers ──▶ handler breaker ──▶ handler
//!                                             │
//!                                  ┌──────────┴──────────┐
//!                                  ▼                     ▼
//!                            retry index           dead letter store
//!                          (retry scheduler)        (+ notifier)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use resilient_queue::config::{load_config, ServiceConfig};
use resilient_queue::lifecycle::wait_for_shutdown_signal;
use resilient_queue::observability::{logging, metrics};
use resilient_queue::queue::{handler_fn, HandlerError, MessagePriority, MessageQueue, Payload};
use resilient_queue::resilience::CircuitBreakerRegistry;
use resilient_queue::storage::InMemoryStorage;

#[derive(Parser)]
#[command(name = "resilient-queue")]
#[command(about = "Resilient prioritized message queue with retries and a dead letter store", long_about = None)]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured worker count.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enqueue this many sample messages on startup.
    #[arg(long, default_value_t = 0)]
    demo: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.queue.worker_count = workers;
    }

    logging::init_logging(&config.observability);
    tracing::info!("resilient-queue v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = CircuitBreakerRegistry::new();
    let queue = MessageQueue::new(Arc::new(InMemoryStorage::new()), &registry, &config);

    queue.register_handler(
        "log",
        handler_fn(|user_id: String, payload: Payload| async move {
            tracing::info!(user_id = %user_id, payload = %serde_json::Value::Object(payload), "Handled message");
            Ok::<(), HandlerError>(())
        }),
    );

    for i in 0..cli.demo {
        let mut payload = Payload::new();
        payload.insert("sequence".to_string(), json!(i));
        let priority = MessagePriority::ALL[i % MessagePriority::ALL.len()];
        let message = queue.new_message("demo", "log", payload).with_priority(priority);
        queue.enqueue(message).await;
    }

    queue.process_queue(config.queue.worker_count).await?;
    tracing::info!(workers = config.queue.worker_count, "Queue running, waiting for shutdown signal");

    wait_for_shutdown_signal().await;
    queue.stop_processing().await;

    match queue.stats().await {
        Ok(stats) => tracing::info!(?stats, "Final queue stats"),
        Err(e) => tracing::warn!(error = %e, "Could not read final queue stats"),
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
