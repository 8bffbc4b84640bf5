//! SpaceSaving approximate top-K leaderboard
//!
//! At most `k` items are tracked per key. An untracked item arriving at a
//! full table evicts the minimum-count entry and inherits its count as an
//! over-estimate, so the true frequency of any tracked item lies in
//! `[count - over_estimate, count]`.
//!
//! Persisted as two sorted sets updated in one atomic store call:
//! `flux:leaderboard:<key>` (item -> count) and
//! `flux:leaderboard-over:<key>` (item -> over-estimate).

use crate::error::Result;
use crate::keys::FluxKeys;
use crate::store::{SharedStore, SortedSet};
use std::cmp::Ordering;
use tracing::trace;

pub const DEFAULT_LEADERS_LIMIT: usize = 100;

/// One tracked item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderEntry {
    pub item: String,
    pub count: u64,
    pub over_estimate: u64,
}

impl LeaderEntry {
    /// Lower bound on the item's true frequency
    pub fn guaranteed(&self) -> u64 {
        self.count.saturating_sub(self.over_estimate)
    }
}

pub struct Leaderboard {
    store: SharedStore,
}

impl Leaderboard {
    pub fn new(store: SharedStore) -> Self {
        Leaderboard { store }
    }

    /// Count one occurrence of `item` in the table at `key`, tracking at
    /// most `capacity` items (at least one).
    pub fn increment(&self, key: &str, item: &str, capacity: usize) -> Result<()> {
        let capacity = capacity.max(1);
        let keys = [FluxKeys::leaderboard(key), FluxKeys::leaderboard_overestimates(key)];

        self.store.atomic_update(&keys, &mut |sets| {
            let (counts, rest) = sets.split_at_mut(1);
            space_saving_step(&mut counts[0], &mut rest[0], item, capacity);
        })?;
        trace!("Counted {} in leaderboard {}", item, key);
        Ok(())
    }

    /// Tracked entries by count descending, then item ascending
    pub fn leaders(&self, key: &str, limit: Option<usize>) -> Result<Vec<LeaderEntry>> {
        let limit = limit.unwrap_or(DEFAULT_LEADERS_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let counts = self.store.zrevrange(&FluxKeys::leaderboard(key), 0, -1)?;
        let overestimates_key = FluxKeys::leaderboard_overestimates(key);

        let mut entries = counts
            .into_iter()
            .map(|(item, count)| {
                let over = self.store.zscore(&overestimates_key, &item)?.unwrap_or(0.0);
                Ok(LeaderEntry {
                    item,
                    count: count as u64,
                    over_estimate: over as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        entries.sort_by(|a, b| match b.count.cmp(&a.count) {
            Ordering::Equal => a.item.cmp(&b.item),
            other => other,
        });
        entries.truncate(limit);
        Ok(entries)
    }
}

/// One SpaceSaving update over the persisted table
fn space_saving_step(counts: &mut SortedSet, overestimates: &mut SortedSet, item: &str, capacity: usize) {
    if let Some(count) = counts.score(item) {
        counts.add(item, count + 1.0);
        return;
    }

    if counts.len() < capacity {
        counts.add(item, 1.0);
        return;
    }

    // Lowest count, ties broken by lowest member
    let Some((victim, min_count)) = counts.iter().next().map(|(m, s)| (m.to_string(), s)) else {
        return;
    };
    counts.remove(&victim);
    overestimates.remove(&victim);
    counts.add(item, min_count + 1.0);
    overestimates.add(item, min_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySetStore;
    use std::sync::Arc;
    use std::thread;

    fn board() -> Leaderboard {
        Leaderboard::new(Arc::new(InMemorySetStore::new()))
    }

    fn items(entries: &[LeaderEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.item.as_str()).collect()
    }

    #[test]
    fn test_counts_below_capacity_are_exact() {
        let board = board();
        for item in ["a", "b", "a", "c", "a", "b"] {
            board.increment("k", item, 10).unwrap();
        }
        let leaders = board.leaders("k", None).unwrap();
        assert_eq!(items(&leaders), vec!["a", "b", "c"]);
        assert_eq!(leaders[0].count, 3);
        assert!(leaders.iter().all(|e| e.over_estimate == 0));
    }

    #[test]
    fn test_eviction_inherits_minimum() {
        let board = board();
        board.increment("k", "a", 2).unwrap();
        board.increment("k", "a", 2).unwrap();
        board.increment("k", "b", 2).unwrap();
        // Table full: "c" evicts "b" (count 1)
        board.increment("k", "c", 2).unwrap();

        let leaders = board.leaders("k", None).unwrap();
        assert_eq!(leaders.len(), 2);
        assert_eq!(
            leaders[1],
            LeaderEntry {
                item: "c".into(),
                count: 2,
                over_estimate: 1
            }
        );
        assert_eq!(leaders[1].guaranteed(), 1);

        // Ties on count are ordered by item
        assert_eq!(items(&leaders), vec!["a", "c"]);
    }

    #[test]
    fn test_tie_on_minimum_evicts_lowest_member() {
        let board = board();
        board.increment("k", "y", 2).unwrap();
        board.increment("k", "x", 2).unwrap();
        board.increment("k", "z", 2).unwrap();
        let leaders = board.leaders("k", None).unwrap();
        assert_eq!(items(&leaders), vec!["z", "y"]);
    }

    #[test]
    fn test_key_ending_in_overestimates_is_independent() {
        let board = board();
        board.increment("a", "x", 1).unwrap();
        board.increment("a", "y", 1).unwrap();
        board.increment("a:overestimates", "z", 5).unwrap();

        let leaders = board.leaders("a", None).unwrap();
        assert_eq!(
            leaders,
            vec![LeaderEntry {
                item: "y".into(),
                count: 2,
                over_estimate: 1
            }]
        );
        let other = board.leaders("a:overestimates", None).unwrap();
        assert_eq!(items(&other), vec!["z"]);
        assert_eq!(other[0].over_estimate, 0);
    }

    #[test]
    fn test_limit() {
        let board = board();
        for item in ["a", "b", "c", "a"] {
            board.increment("k", item, 10).unwrap();
        }
        assert_eq!(items(&board.leaders("k", Some(1)).unwrap()), vec!["a"]);
        assert!(board.leaders("k", Some(0)).unwrap().is_empty());
        assert!(board.leaders("missing", None).unwrap().is_empty());
    }

    #[test]
    fn test_heavy_hitter_wins_under_churn() {
        let board = board();
        for i in 0..500 {
            board.increment("k", "hot", 5).unwrap();
            board.increment("k", &format!("cold-{}", i), 5).unwrap();
        }
        let leaders = board.leaders("k", None).unwrap();
        assert_eq!(leaders[0].item, "hot");
        assert!(leaders[0].guaranteed() > 0);
        assert!(leaders.len() <= 5);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let board = Arc::new(board());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let board = board.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        let item = format!("item-{}", (t + i) % 4);
                        board.increment("shared", &item, 10).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = board
            .leaders("shared", None)
            .unwrap()
            .iter()
            .map(|e| e.count)
            .sum();
        assert_eq!(total, 8 * 250);
    }
}
