//! Service facade
//!
//! Bundles the store, schema registry, executor, query engine and worker
//! pool behind the operations an outer transport exposes. Enforces the
//! read-only gate and query page-size limits.

use crate::clock::{SharedClock, SystemClock};
use crate::config::FluxConfig;
use crate::dispatch::{DispatchStats, EventDispatcher, ExpirySweeper, QueuedEvent};
use crate::error::{FluxError, Result};
use crate::executor::{EventExecutor, ProcessReport};
use crate::keys::FluxKeys;
use crate::leaderboard::LeaderEntry;
use crate::query::{DistinctOp, QueryCursor, QueryEngine, QueryPage, ScoreRange, StoredCount};
use crate::resolver::Attributes;
use crate::schema::SchemaRegistry;
use crate::score::ScoreEncoder;
use crate::store::{InMemorySetStore, SharedStore};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Number of live aggregates of each kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub sets: usize,
    pub distinct_counters: usize,
    pub gross_counters: usize,
    pub leaderboards: usize,
}

pub struct FluxService {
    config: FluxConfig,
    store: SharedStore,
    registry: Arc<SchemaRegistry>,
    executor: Arc<EventExecutor>,
    queries: QueryEngine,
    dispatcher: Option<EventDispatcher>,
}

impl FluxService {
    pub fn new(config: FluxConfig, store: SharedStore, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let encoder = Arc::new(ScoreEncoder::with_clock(clock.clone()));
        let executor = Arc::new(EventExecutor::new(
            store.clone(),
            encoder,
            clock.clone(),
            config.hyperloglog_precision,
            config.default_leaderboard_size,
        )?);
        let queries = QueryEngine::new(
            store.clone(),
            clock.clone(),
            config.hyperloglog_precision,
            config.stored_query_ttl(),
        )?;
        let registry = Arc::new(SchemaRegistry::new(store.clone(), clock));

        Ok(FluxService {
            config,
            store,
            registry,
            executor,
            queries,
            dispatcher: None,
        })
    }

    /// Service over a fresh in-process store using the system clock
    pub fn in_memory(config: FluxConfig) -> Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let store: SharedStore = Arc::new(InMemorySetStore::with_clock(clock.clone()));
        Self::new(config, store, clock)
    }

    /// Spawn the worker pool and expiry sweeper. Events submitted before
    /// this call are processed inline. Must run inside a tokio runtime.
    pub fn start_workers(&mut self) -> EventDispatcher {
        if let Some(dispatcher) = &self.dispatcher {
            return dispatcher.clone();
        }
        let dispatcher = EventDispatcher::spawn(
            self.registry.clone(),
            self.executor.clone(),
            self.config.worker_count,
            self.config.queue_capacity,
        );
        tokio::spawn(ExpirySweeper::new(self.store.clone(), SWEEP_INTERVAL).run());
        self.dispatcher = Some(dispatcher.clone());
        dispatcher
    }

    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    pub fn add_schema(&self, raw: &str) -> Result<String> {
        self.registry.add_schema(raw)
    }

    pub fn schema_ids(&self) -> Result<Vec<String>> {
        self.registry.all_schema_ids()
    }

    fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            warn!("Rejecting event ingestion in read-only mode");
            return Err(FluxError::ReadOnly);
        }
        Ok(())
    }

    /// Accept one event for processing. Queued when workers are running,
    /// otherwise processed before returning.
    pub async fn submit_event(
        &self,
        schema_id: &str,
        event_name: &str,
        attrs: Attributes,
    ) -> Result<()> {
        self.check_writable()?;
        let schema = self.registry.get_schema(schema_id)?;
        match &self.dispatcher {
            Some(dispatcher) => {
                dispatcher
                    .submit(QueuedEvent {
                        schema_id: schema_id.to_string(),
                        event_name: event_name.to_string(),
                        attrs,
                    })
                    .await
            }
            None => self
                .executor
                .process_event(&schema, event_name, &attrs)
                .map(|_| ()),
        }
    }

    /// Accept a batch of `(event name, attributes)` pairs
    pub async fn submit_events(
        &self,
        schema_id: &str,
        events: Vec<(String, Attributes)>,
    ) -> Result<usize> {
        self.check_writable()?;
        let count = events.len();
        for (event_name, attrs) in events {
            self.submit_event(schema_id, &event_name, attrs).await?;
        }
        Ok(count)
    }

    /// Process one event synchronously, bypassing the queue
    pub fn process_now(
        &self,
        schema_id: &str,
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<ProcessReport> {
        self.check_writable()?;
        let schema = self.registry.get_schema(schema_id)?;
        self.executor.process_event(&schema, event_name, attrs)
    }

    /// Wait for queued events to be processed
    pub async fn flush(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.flush().await;
        }
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default()
    }

    /// Page size actually used for a requested `max_results`.
    /// Missing or out-of-range requests get the configured cap.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        let cap = self.config.max_query_results;
        match requested {
            Some(n) if n >= 1 && n <= cap => n,
            _ => cap,
        }
    }

    pub fn query(
        &self,
        keys: &[String],
        max_results: Option<usize>,
        cursor: Option<&str>,
        range: ScoreRange,
    ) -> Result<QueryPage> {
        let cursor = cursor
            .filter(|c| !c.trim().is_empty())
            .map(str::parse::<QueryCursor>)
            .transpose()?;
        self.queries
            .run_query(keys, self.page_size(max_results), cursor, range)
    }

    pub fn distinct_count(
        &self,
        keys: &[String],
        op: DistinctOp,
        min_score: Option<u64>,
    ) -> Result<u64> {
        self.queries.distinct_count(keys, op, min_score)
    }

    pub fn gross_count(&self, keys: &[String], min_score: Option<u64>) -> Result<u64> {
        self.queries.gross_count(keys, min_score)
    }

    pub fn store_distinct_count(
        &self,
        keys: &[String],
        min_score: Option<u64>,
    ) -> Result<StoredCount> {
        self.queries.store_distinct_count(keys, min_score)
    }

    pub fn leaderboard(&self, key: &str, max_results: Option<usize>) -> Result<Vec<LeaderEntry>> {
        self.queries.leaderboard(key, max_results)
    }

    pub fn up(&self) -> bool {
        self.queries.store_up()
    }

    pub fn key_summary(&self) -> Result<KeySummary> {
        let count = |prefix: &str| -> Result<usize> {
            Ok(self.store.keys_with_prefix(prefix)?.len())
        };
        Ok(KeySummary {
            sets: count(FluxKeys::SET_PREFIX)?,
            distinct_counters: count(FluxKeys::DISTINCT_PREFIX)?,
            gross_counters: count(FluxKeys::GROSS_PREFIX)?,
            leaderboards: count(FluxKeys::LEADERBOARD_PREFIX)?,
        })
    }

    /// Register the schema file named in the configuration, if any
    pub fn register_configured_schema(&self) -> Result<Option<String>> {
        let Some(path) = &self.config.schema_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FluxError::Config(format!("failed to read schema {}: {}", path.display(), e))
        })?;
        let id = self.add_schema(&raw)?;
        info!("Schema {} loaded from {}", id, path.display());
        Ok(Some(id))
    }
}

/// Parse one `["event.name", {attributes}]` pair. Scalar attribute values
/// are converted to strings; `null` values are dropped.
pub fn parse_event(value: Value) -> Result<(String, Attributes)> {
    let Value::Array(mut parts) = value else {
        return Err(FluxError::Schema("event must be a [name, attributes] pair".into()));
    };
    if parts.len() != 2 {
        return Err(FluxError::Schema("event must be a [name, attributes] pair".into()));
    }
    let attrs_value = parts.pop().unwrap_or(Value::Null);
    let Some(Value::String(name)) = parts.pop() else {
        return Err(FluxError::Schema("event name must be a string".into()));
    };

    let mut attrs = Attributes::new();
    match attrs_value {
        Value::Object(map) => {
            for (key, value) in map {
                let text = match value {
                    Value::String(s) => s,
                    Value::Null => continue,
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    // Arrays (e.g. @targets) keep their JSON form
                    other => other.to_string(),
                };
                attrs.insert(key, text);
            }
        }
        Value::Null => {}
        _ => return Err(FluxError::Schema("event attributes must be an object".into())),
    }
    Ok((name, attrs))
}

/// Parse a JSON array of event pairs
pub fn parse_event_batch(raw: &str) -> Result<Vec<(String, Attributes)>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| FluxError::Schema(format!("invalid JSON: {}", e)))?;
    let Value::Array(events) = value else {
        return Err(FluxError::Schema("expected an array of events".into()));
    };
    events.into_iter().map(parse_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = r#"{"follow": [{"targets": ["[followee].followers"], "add": "follower"}]}"#;

    fn service(config: FluxConfig) -> FluxService {
        FluxService::in_memory(config).unwrap()
    }

    #[test]
    fn test_page_size() {
        let svc = service(FluxConfig::default());
        assert_eq!(svc.page_size(None), 50);
        assert_eq!(svc.page_size(Some(0)), 50);
        assert_eq!(svc.page_size(Some(100)), 50);
        assert_eq!(svc.page_size(Some(10)), 10);
    }

    #[tokio::test]
    async fn test_read_only_rejects_events_but_serves_queries() {
        let svc = service(FluxConfig {
            read_only: true,
            ..FluxConfig::default()
        });
        let id = svc.add_schema(SCHEMA).unwrap();
        let result = svc.submit_event(&id, "follow", Attributes::new()).await;
        assert_eq!(result, Err(FluxError::ReadOnly));
        assert!(svc.process_now(&id, "follow", &Attributes::new()).is_err());
        assert!(svc
            .query(&["u1:followers".to_string()], Some(10), None, ScoreRange::default())
            .unwrap()
            .results
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_schema_rejected_before_dispatch() {
        let svc = service(FluxConfig::default());
        let result = svc.submit_event("nope", "follow", Attributes::new()).await;
        assert_eq!(result, Err(FluxError::UnknownSchema("nope".into())));
    }

    #[tokio::test]
    async fn test_submit_through_workers() {
        let mut svc = service(FluxConfig::default());
        let id = svc.add_schema(SCHEMA).unwrap();
        svc.start_workers();

        let events = parse_event_batch(
            r#"[["follow", {"followee": "u1", "follower": "u2"}],
                ["follow", {"followee": "u1", "follower": "u3"}]]"#,
        )
        .unwrap();
        assert_eq!(svc.submit_events(&id, events).await.unwrap(), 2);
        svc.flush().await;

        let page = svc
            .query(&["u1:followers".to_string()], None, None, ScoreRange::default())
            .unwrap();
        assert_eq!(page.results, vec!["u3", "u2"]);
        assert_eq!(svc.dispatch_stats().processed, 2);
    }

    #[test]
    fn test_invalid_cursor() {
        let svc = service(FluxConfig::default());
        let result = svc.query(&["k".to_string()], None, Some("abc"), ScoreRange::default());
        assert!(matches!(result, Err(FluxError::Range(_))));
        assert!(svc
            .query(&["k".to_string()], None, Some(""), ScoreRange::default())
            .is_ok());
    }

    #[test]
    fn test_parse_event_converts_scalars() {
        let (name, attrs) = parse_event(json!(["follow", {
            "follower": "u2",
            "@score": 8,
            "flag": true,
            "gone": null,
            "@targets": ["['x']"]
        }]))
        .unwrap();
        assert_eq!(name, "follow");
        assert_eq!(attrs.get("@score").map(String::as_str), Some("8"));
        assert_eq!(attrs.get("flag").map(String::as_str), Some("true"));
        assert!(!attrs.contains_key("gone"));
        assert_eq!(attrs.get("@targets").map(String::as_str), Some(r#"["['x']"]"#));
    }

    #[test]
    fn test_parse_event_rejects_malformed() {
        assert!(parse_event(json!({"name": "x"})).is_err());
        assert!(parse_event(json!(["only-name"])).is_err());
        assert!(parse_event(json!([1, {}])).is_err());
        assert!(parse_event(json!(["x", "attrs"])).is_err());
        assert!(parse_event_batch("not json").is_err());
    }

    #[test]
    fn test_key_summary_counts_aggregates() {
        let svc = service(FluxConfig::default());
        assert_eq!(svc.key_summary().unwrap(), KeySummary::default());

        let id = svc
            .add_schema(
                r#"{"follow": [
                    {"targets": ["[followee].followers"], "add": "follower"},
                    {"targets": ["['popular']"], "countFrequency": "followee"}
                ]}"#,
            )
            .unwrap();
        for (followee, follower) in [("u1", "u2"), ("u3", "u2")] {
            let mut attrs = Attributes::new();
            attrs.insert("followee".into(), followee.into());
            attrs.insert("follower".into(), follower.into());
            svc.process_now(&id, "follow", &attrs).unwrap();
        }

        assert_eq!(
            svc.key_summary().unwrap(),
            KeySummary {
                sets: 2,
                distinct_counters: 2,
                gross_counters: 2,
                leaderboards: 1,
            }
        );
    }

    #[test]
    fn test_up() {
        assert!(service(FluxConfig::default()).up());
    }

    #[test]
    fn test_register_configured_schema() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, SCHEMA.as_bytes()).unwrap();
        let svc = service(FluxConfig {
            schema_path: Some(file.path().to_path_buf()),
            ..FluxConfig::default()
        });
        let id = svc.register_configured_schema().unwrap().unwrap();
        assert_eq!(svc.schema_ids().unwrap(), vec![id]);
    }
}
