//! Sorted set with a member index and a score-ordered index

use ahash::AHashMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Total-ordered wrapper so scores can key a `BTreeMap`
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One end of a score range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    Inclusive(f64),
    Exclusive(f64),
    /// -inf as a minimum, +inf as a maximum
    Unbounded,
}

impl ScoreBound {
    fn to_bound(self) -> Bound<Score> {
        match self {
            ScoreBound::Inclusive(s) => Bound::Included(Score(s)),
            ScoreBound::Exclusive(s) => Bound::Excluded(Score(s)),
            ScoreBound::Unbounded => Bound::Unbounded,
        }
    }
}

/// True when no score can satisfy `min <= score <= max` under the bound kinds
fn range_is_empty(min: ScoreBound, max: ScoreBound) -> bool {
    let (lo, lo_open) = match min {
        ScoreBound::Inclusive(s) => (s, false),
        ScoreBound::Exclusive(s) => (s, true),
        ScoreBound::Unbounded => return false,
    };
    let (hi, hi_open) = match max {
        ScoreBound::Inclusive(s) => (s, false),
        ScoreBound::Exclusive(s) => (s, true),
        ScoreBound::Unbounded => return false,
    };
    match Score(lo).cmp(&Score(hi)) {
        Ordering::Greater => true,
        Ordering::Equal => lo_open || hi_open,
        Ordering::Less => false,
    }
}

/// Normalize Redis-style rank indices (negative counts from the end).
/// Returns `None` when the range selects nothing.
fn normalize_ranks(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    if len == 0 {
        return None;
    }
    let start = if start < 0 {
        (len + start).max(0)
    } else {
        start.min(len)
    };
    let stop = if stop < 0 {
        (len + stop).max(-1)
    } else {
        stop.min(len - 1)
    };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Sorted set: one entry per member, ordered by (score, member)
#[derive(Clone, Debug, Default)]
pub struct SortedSet {
    /// O(1) score lookup by member
    members: AHashMap<String, f64>,
    /// Members grouped by score, ascending
    by_score: BTreeMap<Score, BTreeSet<String>>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        let indexed: usize = self.by_score.values().map(|m| m.len()).sum();
        debug_assert_eq!(
            self.members.len(),
            indexed,
            "Invariant violated: members.len() ({}) != score index size ({})",
            self.members.len(),
            indexed
        );
        debug_assert!(
            self.by_score.values().all(|m| !m.is_empty()),
            "Invariant violated: empty score bucket left in index"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}

    fn unindex(&mut self, member: &str, score: f64) {
        if let Some(bucket) = self.by_score.get_mut(&Score(score)) {
            bucket.remove(member);
            if bucket.is_empty() {
                self.by_score.remove(&Score(score));
            }
        }
    }

    /// Add member with score. Returns true if the member is new.
    pub fn add(&mut self, member: &str, score: f64) -> bool {
        let is_new = match self.members.get(member).copied() {
            Some(old) if Score(old) == Score(score) => return false,
            Some(old) => {
                self.unindex(member, old);
                false
            }
            None => true,
        };
        self.members.insert(member.to_string(), score);
        self.by_score
            .entry(Score(score))
            .or_default()
            .insert(member.to_string());

        self.verify_invariants();
        is_new
    }

    /// Add member, or raise its score if `score` is greater (ZADD GT).
    /// Returns true if anything changed.
    pub fn add_if_greater(&mut self, member: &str, score: f64) -> bool {
        match self.members.get(member) {
            Some(current) if Score(*current) >= Score(score) => false,
            _ => {
                self.add(member, score);
                true
            }
        }
    }

    /// Remove member. Returns true if removed.
    pub fn remove(&mut self, member: &str) -> bool {
        let removed = match self.members.remove(member) {
            Some(score) => {
                self.unindex(member, score);
                true
            }
            None => false,
        };
        self.verify_invariants();
        removed
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.members.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate (member, score) in ascending order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, f64)> {
        self.by_score
            .iter()
            .flat_map(|(score, members)| members.iter().map(move |m| (m.as_str(), score.0)))
    }

    /// Members by descending rank, `[start, stop]` inclusive (ZREVRANGE)
    pub fn rev_range(&self, start: isize, stop: isize) -> Vec<(String, f64)> {
        match normalize_ranks(start, stop, self.len()) {
            Some((start, stop)) => self
                .iter()
                .rev()
                .skip(start)
                .take(stop - start + 1)
                .map(|(m, s)| (m.to_string(), s))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Members with `min <= score <= max`, highest first (ZREVRANGEBYSCORE)
    pub fn rev_range_by_score(
        &self,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> Vec<(String, f64)> {
        if range_is_empty(min, max) {
            return Vec::new();
        }
        let limit = limit.unwrap_or(usize::MAX);
        self.by_score
            .range((min.to_bound(), max.to_bound()))
            .rev()
            .flat_map(|(score, members)| members.iter().rev().map(move |m| (m.clone(), score.0)))
            .take(limit)
            .collect()
    }

    /// Remove members by ascending rank, `[start, stop]` inclusive
    /// (ZREMRANGEBYRANK). Returns the number removed.
    pub fn remove_range_by_rank(&mut self, start: isize, stop: isize) -> usize {
        let Some((start, stop)) = normalize_ranks(start, stop, self.len()) else {
            return 0;
        };
        let doomed: Vec<String> = self
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(m, _)| m.to_string())
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len()
    }
}

impl PartialEq for SortedSet {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
    }
}
