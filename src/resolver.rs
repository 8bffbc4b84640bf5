//! Target-expression key resolution
//!
//! A target expression is a dot-separated path whose first segment is a
//! bracketed seed list:
//!
//! ```text
//! [@eventName, user].friends.feed
//! ```
//!
//! Seeds are resolved against the event, then every middle segment is a join
//! (each entry `e` is replaced by the members of `flux:set:<e>:<field>`) and
//! the last segment is appended to form the final key. Several expressions on
//! one handler combine by cartesian product, joined with `:`.

use crate::clock::SharedClock;
use crate::error::{FluxError, Result};
use crate::keys::FluxKeys;
use crate::score::{is_valid_score, ScoreEncoder};
use crate::store::SharedStore;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::trace;

/// Upper bound on path segments in one target expression
pub const MAX_TARGET_SEGMENTS: usize = 32;

/// Event attributes, including `@`-directives
pub type Attributes = AHashMap<String, String>;

/// Parsed target expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetExpression {
    seeds: Vec<String>,
    fields: Vec<String>,
}

impl TargetExpression {
    pub fn parse(expr: &str) -> Result<Self> {
        let segments: Vec<&str> = expr.split('.').collect();
        if segments.len() > MAX_TARGET_SEGMENTS {
            return Err(FluxError::Schema(format!(
                "target '{}' has {} segments (max {})",
                expr,
                segments.len(),
                MAX_TARGET_SEGMENTS
            )));
        }

        let head = segments[0].trim();
        let seed_list = head
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| {
                FluxError::Schema(format!(
                    "target '{}' must start with a bracketed seed list",
                    expr
                ))
            })?;

        let seeds: Vec<String> = seed_list.split(',').map(|s| s.trim().to_string()).collect();
        if seeds.iter().any(|s| s.is_empty()) {
            return Err(FluxError::Schema(format!("target '{}' has an empty seed", expr)));
        }

        let fields: Vec<String> = segments[1..].iter().map(|s| s.trim().to_string()).collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(FluxError::Schema(format!("target '{}' has an empty field", expr)));
        }

        Ok(TargetExpression { seeds, fields })
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Resolves identifiers and target expressions against one event
pub struct KeyResolver {
    store: SharedStore,
    encoder: Arc<ScoreEncoder>,
    clock: SharedClock,
}

impl KeyResolver {
    pub fn new(store: SharedStore, encoder: Arc<ScoreEncoder>, clock: SharedClock) -> Self {
        KeyResolver {
            store,
            encoder,
            clock,
        }
    }

    /// Resolve a single identifier expression.
    ///
    /// `@name` directives may be overridden by an attribute literally named
    /// `@name`; `'text'` is a literal; anything else is an attribute lookup.
    pub fn resolve_id(&self, id: &str, event_name: &str, attrs: &Attributes) -> Result<String> {
        if let Some(directive) = id.strip_prefix('@') {
            if let Some(value) = attrs.get(id) {
                return Ok(value.clone());
            }
            return match directive {
                "eventName" => Ok(event_name.to_string()),
                "uniqueId" => Ok(self.encoder.encode(None, None).to_string()),
                "daily" => Ok(self.bucket_time(attrs).format("daily-%d-%m-%y").to_string()),
                "weekly" => Ok(self.bucket_time(attrs).format("weekly-%U-%y").to_string()),
                "monthly" => Ok(self.bucket_time(attrs).format("monthly-%m-%y").to_string()),
                _ => Err(FluxError::UnknownIdentifier(id.to_string())),
            };
        }

        if id.len() >= 2 && id.starts_with('\'') && id.ends_with('\'') {
            return Ok(id[1..id.len() - 1].to_string());
        }

        attrs
            .get(id)
            .cloned()
            .ok_or_else(|| FluxError::MissingAttribute(id.to_string()))
    }

    /// Resolve every expression and return the cartesian product of the
    /// results, each combination joined with `:`.
    pub fn resolve(
        &self,
        targets: &[TargetExpression],
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<Vec<String>> {
        let mut keys = vec![String::new()];
        for (i, target) in targets.iter().enumerate() {
            let entries = self.resolve_target(target, event_name, attrs)?;
            keys = keys
                .iter()
                .flat_map(|prefix| {
                    entries.iter().map(move |entry| {
                        if i == 0 {
                            entry.clone()
                        } else {
                            format!("{}:{}", prefix, entry)
                        }
                    })
                })
                .collect();
        }
        if targets.is_empty() {
            keys.clear();
        }
        Ok(keys)
    }

    /// Resolve one expression: seeds, then joins, then the final field.
    pub fn resolve_target(
        &self,
        target: &TargetExpression,
        event_name: &str,
        attrs: &Attributes,
    ) -> Result<Vec<String>> {
        let mut entries = target
            .seeds
            .iter()
            .map(|seed| self.resolve_id(seed, event_name, attrs))
            .collect::<Result<Vec<_>>>()?;

        let last = target.fields.len().saturating_sub(1);
        for (i, field) in target.fields.iter().enumerate() {
            if i == last {
                entries = entries
                    .into_iter()
                    .map(|entry| format!("{}:{}", entry, field))
                    .collect();
            } else {
                let mut joined = Vec::new();
                for entry in &entries {
                    let set_key = FluxKeys::set(&format!("{}:{}", entry, field));
                    let members = self.store.zrevrange(&set_key, 0, -1)?;
                    trace!("Join through {} yielded {} members", set_key, members.len());
                    joined.extend(members.into_iter().map(|(member, _)| member));
                }
                entries = joined;
            }
        }
        Ok(entries)
    }

    /// Time used for calendar buckets: a valid `@score` in seconds, else now
    fn bucket_time(&self, attrs: &Attributes) -> DateTime<Utc> {
        let secs = explicit_score(attrs)
            .filter(|s| is_valid_score(*s))
            .unwrap_or(self.clock.now_secs() as i64);
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }
}

/// Client-supplied `@score` (or its `@time` alias), if it parses
pub fn explicit_score(attrs: &Attributes) -> Option<i64> {
    attrs
        .get("@score")
        .or_else(|| attrs.get("@time"))
        .and_then(|s| s.trim().parse::<i64>().ok())
}
