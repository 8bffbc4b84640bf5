//! flux: schema-driven event aggregation over sorted sets
//!
//! Events carrying attribute maps are projected by a declarative schema into
//! ordered membership sets, HyperLogLog distinct/gross counters and
//! SpaceSaving leaderboards, all persisted through a [`SetStore`].

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod hll;
pub mod keys;
pub mod leaderboard;
pub mod observability;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod score;
pub mod service;
pub mod store;

pub use clock::{Clock, SharedClock, SimulatedClock, SystemClock};
pub use config::{ConfigError, FluxConfig, LogFormat};
pub use dispatch::{DispatchStats, EventDispatcher, QueuedEvent};
pub use error::{FluxError, Result};
pub use executor::{EventExecutor, ProcessReport};
pub use hll::HyperLogLog;
pub use keys::FluxKeys;
pub use leaderboard::{LeaderEntry, Leaderboard};
pub use observability::init_tracing;
pub use query::{DistinctOp, QueryCursor, QueryEngine, QueryPage, ScoreRange, StoredCount};
pub use resolver::{Attributes, KeyResolver, TargetExpression};
pub use schema::{Handler, HandlerAction, Schema, SchemaRegistry};
pub use score::ScoreEncoder;
pub use service::{parse_event, parse_event_batch, FluxService, KeySummary};
pub use store::{InMemorySetStore, SetStore, SharedStore, StoreError};
