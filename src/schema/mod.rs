//! Declarative event schemas
//!
//! A schema maps event-name prefixes to handler lists:
//!
//! ```json
//! {
//!   "user.follow": [
//!     { "targets": ["[followee].followers"], "add": "follower" },
//!     { "targets": ["[follower].following"], "add": "followee", "maxStoredValues": 500 }
//!   ]
//! }
//! ```
//!
//! Declaration order is significant and preserved.

mod registry;

pub use registry::SchemaRegistry;

use crate::error::{FluxError, Result};
use crate::resolver::TargetExpression;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;

/// The single storage mutation a handler performs, with its value expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerAction {
    Add(String),
    Remove(String),
    CountFrequency(String),
    /// Legacy: clear the set, then add the single value
    ReplaceWith(String),
}

impl HandlerAction {
    pub fn value_expr(&self) -> &str {
        match self {
            HandlerAction::Add(v)
            | HandlerAction::Remove(v)
            | HandlerAction::CountFrequency(v)
            | HandlerAction::ReplaceWith(v) => v,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandlerAction::Add(_) => "add",
            HandlerAction::Remove(_) => "remove",
            HandlerAction::CountFrequency(_) => "countFrequency",
            HandlerAction::ReplaceWith(_) => "replaceWith",
        }
    }
}

/// Handler as written in schema JSON
#[derive(Debug, Default, Deserialize)]
pub struct HandlerSpec {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub add: Option<String>,
    #[serde(default)]
    pub remove: Option<String>,
    #[serde(default, rename = "countFrequency", alias = "count_frequency")]
    pub count_frequency: Option<String>,
    #[serde(default, rename = "replaceWith", alias = "replace_with")]
    pub replace_with: Option<String>,
    #[serde(default, rename = "maxStoredValues", alias = "max_stored_values")]
    pub max_stored_values: Option<usize>,
    #[serde(default)]
    pub expires: Option<bool>,
}

/// Validated schema rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HandlerSpec")]
pub struct Handler {
    pub targets: Vec<TargetExpression>,
    pub action: HandlerAction,
    /// `Some(0)` updates counters without storing set members
    pub max_stored_values: Option<usize>,
    /// Legacy transient-retention flag; carried, not acted on
    pub expires: bool,
}

impl Handler {
    /// True unless `maxStoredValues` is exactly 0
    pub fn stores_values(&self) -> bool {
        self.max_stored_values != Some(0)
    }
}

impl TryFrom<HandlerSpec> for Handler {
    type Error = FluxError;

    fn try_from(spec: HandlerSpec) -> Result<Self> {
        let mut actions = Vec::with_capacity(1);
        if let Some(v) = spec.add {
            actions.push(HandlerAction::Add(v));
        }
        if let Some(v) = spec.remove {
            actions.push(HandlerAction::Remove(v));
        }
        if let Some(v) = spec.count_frequency {
            actions.push(HandlerAction::CountFrequency(v));
        }
        if let Some(v) = spec.replace_with {
            actions.push(HandlerAction::ReplaceWith(v));
        }
        if actions.len() != 1 {
            return Err(FluxError::Schema(format!(
                "handler must specify exactly one of add, remove, countFrequency or replaceWith (found {})",
                actions.len()
            )));
        }
        if let Some(limit) = spec.max_stored_values {
            if isize::try_from(limit).is_err() {
                return Err(FluxError::Schema(format!(
                    "maxStoredValues {} is too large",
                    limit
                )));
            }
        }
        if spec.targets.is_empty() {
            return Err(FluxError::Schema("handler has no targets".to_string()));
        }

        let targets = spec
            .targets
            .iter()
            .map(|t| TargetExpression::parse(t))
            .collect::<Result<Vec<_>>>()?;

        Ok(Handler {
            targets,
            action: actions.remove(0),
            max_stored_values: spec.max_stored_values,
            expires: spec.expires.unwrap_or(false),
        })
    }
}

/// Ordered mapping from event-name prefix to handlers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    rules: Vec<(String, Vec<Handler>)>,
}

impl Schema {
    pub fn new(rules: Vec<(String, Vec<Handler>)>) -> Self {
        Schema { rules }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| FluxError::Schema(e.to_string()))
    }

    /// Prefixes in declaration order
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(prefix, _)| prefix.as_str())
    }

    /// Handlers of every prefix `event_name` starts with, in declaration order.
    /// Matching is plain string-prefix, not segment-aware.
    pub fn matching<'a>(&'a self, event_name: &'a str) -> impl Iterator<Item = &'a Handler> + 'a {
        self.rules
            .iter()
            .filter(move |(prefix, _)| event_name.starts_with(prefix.as_str()))
            .flat_map(|(_, handlers)| handlers.iter())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

struct SchemaVisitor;

impl<'de> Visitor<'de> for SchemaVisitor {
    type Value = Schema;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of event-name prefixes to handler lists")
    }

    fn visit_map<A>(self, mut access: A) -> std::result::Result<Schema, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut rules: Vec<(String, Vec<Handler>)> =
            Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((prefix, handlers)) = access.next_entry::<String, Vec<Handler>>()? {
            if let Some(existing) = rules.iter_mut().find(|(p, _)| *p == prefix) {
                // Later duplicate key wins, keeping the first position
                existing.1 = handlers;
            } else {
                rules.push((prefix, handlers));
            }
        }
        Ok(Schema { rules })
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(SchemaVisitor)
    }
}
