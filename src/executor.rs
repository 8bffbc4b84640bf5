//! Applies schema handlers to events

use crate::clock::SharedClock;
use crate::error::{FluxError, Result};
use crate::hll::HyperLogLog;
use crate::keys::FluxKeys;
use crate::leaderboard::Leaderboard;
use crate::resolver::{explicit_score, Attributes, KeyResolver};
use crate::schema::{Handler, HandlerAction, HandlerSpec, Schema};
use crate::score::{is_valid_score, ScoreEncoder};
use crate::store::SharedStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default SpaceSaving table size when a handler sets no `maxStoredValues`
pub const DEFAULT_LEADERBOARD_SIZE: usize = 10;

/// Outcome of processing one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Handlers whose targets resolved
    pub handlers_run: usize,
    /// Keys mutated
    pub writes: usize,
    /// Handler or key combinations skipped for a missing attribute
    pub skipped: usize,
}

impl ProcessReport {
    fn merge(&mut self, other: ProcessReport) {
        self.handlers_run += other.handlers_run;
        self.writes += other.writes;
        self.skipped += other.skipped;
    }
}

pub struct EventExecutor {
    store: SharedStore,
    encoder: Arc<ScoreEncoder>,
    resolver: KeyResolver,
    counter: HyperLogLog,
    leaderboard: Leaderboard,
    clock: SharedClock,
    default_leaderboard_size: usize,
}

impl EventExecutor {
    pub fn new(
        store: SharedStore,
        encoder: Arc<ScoreEncoder>,
        clock: SharedClock,
        hll_precision: u32,
        default_leaderboard_size: usize,
    ) -> Result<Self> {
        Ok(EventExecutor {
            resolver: KeyResolver::new(store.clone(), encoder.clone(), clock.clone()),
            counter: HyperLogLog::new(store.clone(), hll_precision)?,
            leaderboard: Leaderboard::new(store.clone()),
            store,
            encoder,
            clock,
            default_leaderboard_size,
        })
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Run every handler whose prefix matches `event_name`, in declaration
    /// order, then the runtime handler carried in `@targets`, if any.
    pub fn process_event(
        &self,
        schema: &Schema,
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        for handler in schema.matching(event_name) {
            report.merge(self.run_permissive(handler, event_name, attrs)?);
        }

        if let Some(handler) = runtime_handler(attrs)? {
            debug!("Running runtime handler for {}", event_name);
            report.merge(self.run_permissive(&handler, event_name, attrs)?);
        }

        Ok(report)
    }

    /// Execute a handler, turning a missing-attribute failure into a skip
    fn run_permissive(
        &self,
        handler: &Handler,
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<ProcessReport> {
        match self.execute_handler(handler, event_name, attrs) {
            Ok(report) => Ok(report),
            Err(e) if e.is_skippable() => {
                warn!("Skipping {} handler for {}: {}", handler.action.name(), event_name, e);
                Ok(ProcessReport {
                    skipped: 1,
                    ..ProcessReport::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn execute_handler(
        &self,
        handler: &Handler,
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<ProcessReport> {
        let keys = self.resolver.resolve(&handler.targets, event_name, attrs)?;
        let mut report = ProcessReport {
            handlers_run: 1,
            ..ProcessReport::default()
        };

        for key in keys {
            let value = match self
                .resolver
                .resolve_id(handler.action.value_expr(), event_name, attrs)
            {
                Ok(value) => value,
                Err(e) if e.is_skippable() => {
                    warn!("Skipping {} for {}: {}", key, event_name, e);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.apply(handler, &key, &value, attrs)?;
            report.writes += 1;
        }
        Ok(report)
    }

    fn apply(&self, handler: &Handler, key: &str, value: &str, attrs: &Attributes) -> Result<()> {
        let explicit = explicit_score(attrs);
        let set_key = FluxKeys::set(key);

        match &handler.action {
            HandlerAction::Add(_) => {
                let score = self.encoder.encode(explicit, Some(value));
                if handler.stores_values() {
                    debug!("Appending '{}' to {}", value, key);
                    self.store.zadd(&set_key, score as f64, value)?;
                    // Limits beyond isize::MAX can never be exceeded
                    let limit = handler
                        .max_stored_values
                        .and_then(|limit| isize::try_from(limit).ok());
                    if let Some(limit) = limit {
                        let removed = self.store.zremrangebyrank(&set_key, 0, -1 - limit)?;
                        if removed > 0 {
                            debug!("Trimmed {} values from {} (limit {})", removed, key, limit);
                        }
                    }
                }

                let timestamp = explicit
                    .filter(|s| is_valid_score(*s))
                    .map(|s| s as u64)
                    .unwrap_or_else(|| self.clock.now_secs());
                debug!("Incrementing distinct count for {} at {}", key, timestamp);
                self.counter.add(&FluxKeys::distinct(key), value, timestamp)?;
                debug!("Incrementing gross count for {} at {}", key, timestamp);
                self.counter
                    .add(&FluxKeys::gross(key), &score.to_string(), timestamp)?;
            }
            HandlerAction::Remove(_) => {
                debug!("Removing '{}' from {}", value, key);
                self.store.zrem(&set_key, value)?;
            }
            HandlerAction::CountFrequency(_) => {
                let capacity = handler
                    .max_stored_values
                    .unwrap_or(self.default_leaderboard_size);
                debug!("Updating leaderboard for {} with {}", key, value);
                self.leaderboard.increment(key, value, capacity)?;
            }
            HandlerAction::ReplaceWith(_) => {
                debug!("Replacing the contents of {} with '{}'", key, value);
                self.store.del(&set_key)?;
                let score = self.encoder.encode(explicit, Some(value));
                self.store.zadd(&set_key, score as f64, value)?;
            }
        }
        Ok(())
    }
}

/// Build the handler described by an event's `@targets` attributes
pub fn runtime_handler(attrs: &Attributes) -> Result<Option<Handler>> {
    let Some(raw_targets) = attrs.get("@targets").or_else(|| attrs.get("@target")) else {
        return Ok(None);
    };

    // A JSON array of expressions, or a single expression
    let targets = serde_json::from_str::<Vec<String>>(raw_targets)
        .unwrap_or_else(|_| vec![raw_targets.clone()]);

    let max_stored_values = attrs
        .get("@maxStoredValues")
        .or_else(|| attrs.get("@max_stored_values"))
        .map(|raw| {
            raw.trim().parse::<usize>().map_err(|_| {
                FluxError::Schema(format!("invalid @maxStoredValues '{}'", raw))
            })
        })
        .transpose()?;

    let spec = HandlerSpec {
        targets,
        add: attrs.get("@add").cloned(),
        remove: attrs.get("@remove").cloned(),
        count_frequency: attrs
            .get("@countFrequency")
            .or_else(|| attrs.get("@count_frequency"))
            .cloned(),
        replace_with: None,
        max_stored_values,
        expires: None,
    };
    Handler::try_from(spec).map(Some)
}
