//! Read side: ranged multi-key set queries, counters and leaderboards

use crate::clock::SharedClock;
use crate::error::{FluxError, Result};
use crate::hll::HyperLogLog;
use crate::keys::FluxKeys;
use crate::leaderboard::{LeaderEntry, Leaderboard};
use crate::score::ScoreEncoder;
use crate::store::{ScoreBound, SharedStore};
use ahash::AHashSet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Exclusive upper score bound for the next page of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryCursor(u64);

impl QueryCursor {
    pub fn new(score: u64) -> Self {
        QueryCursor(score)
    }

    pub fn score(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryCursor {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        // Stores may hand scores back in float notation
        let trimmed = s.trim();
        trimmed
            .parse::<u64>()
            .ok()
            .or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
            .map(QueryCursor)
            .ok_or_else(|| FluxError::Range(format!("invalid cursor '{}'", s)))
    }
}

/// Client score window in seconds. Both ends are optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl ScoreRange {
    pub fn new(min: Option<i64>, max: Option<i64>) -> Self {
        ScoreRange { min, max }
    }
}

/// One page of merged set members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryPage {
    pub results: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<QueryCursor>,
}

/// Set operation for distinct counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistinctOp {
    #[default]
    Union,
    Intersection,
}

impl FromStr for DistinctOp {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "union" => Ok(DistinctOp::Union),
            "intersection" => Ok(DistinctOp::Intersection),
            other => Err(FluxError::Range(format!("unknown distinct op '{}'", other))),
        }
    }
}

/// Handle to a temporary stored union
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCount {
    pub key: String,
    pub ttl: u64,
}

pub struct QueryEngine {
    store: SharedStore,
    counter: HyperLogLog,
    leaderboard: Leaderboard,
    clock: SharedClock,
    stored_query_ttl: Duration,
}

impl QueryEngine {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        hll_precision: u32,
        stored_query_ttl: Duration,
    ) -> Result<Self> {
        Ok(QueryEngine {
            counter: HyperLogLog::new(store.clone(), hll_precision)?,
            leaderboard: Leaderboard::new(store.clone()),
            store,
            clock,
            stored_query_ttl,
        })
    }

    /// Merge the stored sets at `keys` by descending score.
    ///
    /// At most `max_results` raw members are consumed; duplicates are
    /// reported once, at their highest-scoring occurrence, also across the
    /// pages of one cursor walk. A full page carries the last consumed score
    /// as the cursor for the next call.
    pub fn run_query(
        &self,
        keys: &[String],
        max_results: usize,
        cursor: Option<QueryCursor>,
        range: ScoreRange,
    ) -> Result<QueryPage> {
        if max_results == 0 {
            return Err(FluxError::Range("max_results must be positive".to_string()));
        }

        let upper = match (cursor, range.max) {
            (Some(cursor), _) => Some(cursor.score()),
            (None, Some(max)) => Some(ScoreEncoder::boundary(max.saturating_add(1))),
            (None, None) => None,
        };
        let lower = range
            .min
            .map(|min| ScoreEncoder::boundary(min.saturating_add(1)));

        if let (Some(lower), Some(upper)) = (lower, upper) {
            if lower >= upper {
                debug!("Empty score range [{}, {})", lower, upper);
                return Ok(QueryPage::default());
            }
        }

        let max_bound = upper.map_or(ScoreBound::Unbounded, |u| ScoreBound::Exclusive(u as f64));
        let min_bound = lower.map_or(ScoreBound::Unbounded, |l| ScoreBound::Inclusive(l as f64));

        let mut sources: Vec<VecDeque<(String, u64)>> = Vec::with_capacity(keys.len());
        for key in keys {
            let members = self.store.zrevrangebyscore(
                &FluxKeys::set(key),
                max_bound,
                min_bound,
                Some(max_results),
            )?;
            sources.push(
                members
                    .into_iter()
                    .map(|(member, score)| (member, score as u64))
                    .collect(),
            );
        }

        let mut page = merge_page(sources, max_results);
        if let Some(cursor) = cursor {
            // Earlier pages covered [cursor, window_top) in every key
            let window_top = range
                .max
                .map(|max| ScoreEncoder::boundary(max.saturating_add(1)));
            let mut fresh = Vec::with_capacity(page.results.len());
            for member in page.results {
                if self.reported_earlier(keys, &member, cursor.score(), window_top)? {
                    debug!("Dropping '{}', already returned above {}", member, cursor);
                } else {
                    fresh.push(member);
                }
            }
            page.results = fresh;
        }
        Ok(page)
    }

    /// True if any of `keys` holds `member` inside `[cursor, window_top)`
    fn reported_earlier(
        &self,
        keys: &[String],
        member: &str,
        cursor: u64,
        window_top: Option<u64>,
    ) -> Result<bool> {
        for key in keys {
            if let Some(score) = self.store.zscore(&FluxKeys::set(key), member)? {
                let score = score as u64;
                if score >= cursor && window_top.map_or(true, |top| score < top) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn distinct_count(
        &self,
        keys: &[String],
        op: DistinctOp,
        min_score: Option<u64>,
    ) -> Result<u64> {
        let namespaced: Vec<String> = keys.iter().map(|k| FluxKeys::distinct(k)).collect();
        let cutoff = min_score.unwrap_or(0);
        match op {
            DistinctOp::Union => self.counter.union(&namespaced, cutoff),
            DistinctOp::Intersection => self.counter.intersection(&namespaced, cutoff),
        }
    }

    pub fn gross_count(&self, keys: &[String], min_score: Option<u64>) -> Result<u64> {
        let namespaced: Vec<String> = keys.iter().map(|k| FluxKeys::gross(k)).collect();
        self.counter.union(&namespaced, min_score.unwrap_or(0))
    }

    /// Store the union of the distinct counters at `keys` under a fresh
    /// random key that expires after the stored-query TTL. The returned key
    /// can be queried like any other distinct counter until then.
    pub fn store_distinct_count(
        &self,
        keys: &[String],
        min_score: Option<u64>,
    ) -> Result<StoredCount> {
        let key = format!("{:032x}", rand::thread_rng().gen::<u128>());
        let namespaced: Vec<String> = keys.iter().map(|k| FluxKeys::distinct(k)).collect();
        let target = FluxKeys::distinct(&key);

        self.counter
            .union_store(&target, &namespaced, min_score.unwrap_or(0))?;
        self.store.expire(&target, self.stored_query_ttl)?;
        debug!("Stored union of {} counters at {}", keys.len(), target);

        Ok(StoredCount {
            key,
            ttl: self.stored_query_ttl.as_secs(),
        })
    }

    pub fn leaderboard(&self, key: &str, max_results: Option<usize>) -> Result<Vec<LeaderEntry>> {
        self.leaderboard.leaders(key, max_results)
    }

    /// Liveness check: records the current time at `flux:system:pingtime`
    pub fn store_up(&self) -> bool {
        let now = self.clock.now_secs().to_string();
        match self.store.set(FluxKeys::PING_TIME, &now) {
            Ok(()) => true,
            Err(e) => {
                warn!("Store liveness check failed: {}", e);
                false
            }
        }
    }
}

/// k-way merge of descending per-key lists
fn merge_page(mut sources: Vec<VecDeque<(String, u64)>>, max_results: usize) -> QueryPage {
    // Ties go to the earlier key
    let mut heads: BinaryHeap<(u64, Reverse<usize>)> = sources
        .iter()
        .enumerate()
        .filter_map(|(i, list)| list.front().map(|(_, score)| (*score, Reverse(i))))
        .collect();

    let mut seen = AHashSet::new();
    let mut results = Vec::new();
    let mut consumed = 0usize;
    let mut last_score = None;

    while consumed < max_results {
        let Some((_, Reverse(source))) = heads.pop() else {
            break;
        };
        let Some((member, score)) = sources[source].pop_front() else {
            continue;
        };
        if let Some((_, next)) = sources[source].front() {
            heads.push((*next, Reverse(source)));
        }

        consumed += 1;
        last_score = Some(score);
        if seen.insert(member.clone()) {
            results.push(member);
        }
    }

    let next = if consumed < max_results {
        None
    } else {
        last_score.map(QueryCursor)
    };
    QueryPage { results, next }
}
