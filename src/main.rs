//! flux event ingester
//!
//! Reads newline-delimited JSON events from stdin, one `["event.name", {...}]`
//! pair per line, and processes them against the configured schema.
//!
//! Aggregates live only in this process's in-memory store, so a run is a
//! dry run: it validates the schema against real traffic and reports how
//! many events went through and how many aggregates they produced. The
//! summary printed on exit counts live keys per kind.
//!
//! ## Usage
//!
//! ```text
//! flux --config flux.toml < events.ndjson
//! ```
//!
//! The config path may also come from `FLUX_CONFIG`; without one, defaults
//! and `FLUX_*` environment variables apply. A schema must be configured
//! through `schema_path` or `FLUX_SCHEMA_PATH`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use flux::{init_tracing, parse_event, ConfigError, FluxConfig, FluxError, FluxService};
use futures::StreamExt;
use std::path::PathBuf;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("FLUX_CONFIG").ok().map(PathBuf::from)
}

fn load_config() -> Result<FluxConfig, ConfigError> {
    match config_path() {
        Some(path) => FluxConfig::load(&path),
        None => FluxConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    init_tracing(&config);

    let mut service = FluxService::in_memory(config)?;
    let schema_id = service.register_configured_schema()?.ok_or_else(|| {
        FluxError::Config("no schema configured (set schema_path or FLUX_SCHEMA_PATH)".into())
    })?;
    service.start_workers();
    info!("Reading events for schema {} from stdin", schema_id);

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut accepted = 0u64;
    let mut rejected = 0u64;

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(&line)
            .map_err(|e| FluxError::Schema(format!("invalid JSON: {}", e)))
            .and_then(parse_event);
        let outcome = match parsed {
            Ok((event_name, attrs)) => service.submit_event(&schema_id, &event_name, attrs).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => accepted += 1,
            Err(FluxError::ReadOnly) => return Err(FluxError::ReadOnly.into()),
            Err(e) => {
                rejected += 1;
                warn!("Rejected event: {}", e);
            }
        }
    }

    service.flush().await;
    let stats = service.dispatch_stats();
    let keys = service.key_summary()?;
    info!(
        "Done: {} accepted, {} rejected, {} processed, {} failed",
        accepted, rejected, stats.processed, stats.failed
    );
    info!(
        "Keys: {} sets, {} distinct counters, {} gross counters, {} leaderboards",
        keys.sets, keys.distinct_counters, keys.gross_counters, keys.leaderboards
    );
    println!(
        "{}",
        serde_json::json!({
            "accepted": accepted,
            "rejected": rejected,
            "processed": stats.processed,
            "failed": stats.failed,
            "keys": keys,
        })
    );
    Ok(())
}
