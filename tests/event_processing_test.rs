//! End-to-end event processing through the service facade
//!
//! Each test registers a schema, submits events and checks the resulting
//! sets, counters and leaderboards through the query operations.

use flux::{
    Attributes, DistinctOp, FluxConfig, FluxError, FluxService, InMemorySetStore, ScoreRange,
    SetStore, SharedClock, SimulatedClock,
};
use std::sync::Arc;

const NOW_MS: u64 = 1_700_000_000_000;

struct Harness {
    service: FluxService,
    store: Arc<InMemorySetStore>,
    clock: SimulatedClock,
}

fn harness() -> Harness {
    let clock = SimulatedClock::new(NOW_MS);
    let shared: SharedClock = Arc::new(clock.clone());
    let store = Arc::new(InMemorySetStore::with_clock(shared.clone()));
    let service = FluxService::new(FluxConfig::default(), store.clone(), shared).unwrap();
    Harness {
        service,
        store,
        clock,
    }
}

fn attrs(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn all_results(service: &FluxService, names: &[&str]) -> Vec<String> {
    service
        .query(&keys(names), None, None, ScoreRange::default())
        .unwrap()
        .results
}

// =============================================================================
// Sets
// =============================================================================

#[test]
fn test_follow_feed_newest_first() {
    let h = harness();
    let id = h
        .service
        .add_schema(
            r#"{"follow": [
                {"targets": ["[followee].followers"], "add": "follower"},
                {"targets": ["[follower].following"], "add": "followee"}
            ]}"#,
        )
        .unwrap();

    for follower in ["u2", "u3", "u4"] {
        h.service
            .process_now(&id, "follow", &attrs(&[("followee", "u1"), ("follower", follower)]))
            .unwrap();
    }

    assert_eq!(all_results(&h.service, &["u1:followers"]), vec!["u4", "u3", "u2"]);
    assert_eq!(all_results(&h.service, &["u3:following"]), vec!["u1"]);
    assert_eq!(h.service.schema_ids().unwrap(), vec![id]);
}

#[test]
fn test_unfollow_removes_member() {
    let h = harness();
    let id = h
        .service
        .add_schema(
            r#"{
                "follow": [{"targets": ["[followee].followers"], "add": "follower"}],
                "unfollow": [{"targets": ["[followee].followers"], "remove": "follower"}]
            }"#,
        )
        .unwrap();

    let pair = attrs(&[("followee", "u1"), ("follower", "u2")]);
    h.service.process_now(&id, "follow", &pair).unwrap();
    h.service.process_now(&id, "unfollow", &pair).unwrap();

    assert!(all_results(&h.service, &["u1:followers"]).is_empty());
    assert_eq!(h.store.zcard("flux:set:u1:followers").unwrap(), 0);
}

#[test]
fn test_feed_join_fans_out_to_followers() {
    let h = harness();
    let id = h
        .service
        .add_schema(
            r#"{
                "follow": [{"targets": ["[followee].followers"], "add": "follower"}],
                "post": [{"targets": ["[author].followers.feed"], "add": "post_id"}]
            }"#,
        )
        .unwrap();

    for follower in ["bob", "carol"] {
        h.service
            .process_now(&id, "follow", &attrs(&[("followee", "alice"), ("follower", follower)]))
            .unwrap();
    }
    let report = h
        .service
        .process_now(&id, "post", &attrs(&[("author", "alice"), ("post_id", "p1")]))
        .unwrap();

    assert_eq!(report.writes, 2);
    assert_eq!(all_results(&h.service, &["bob:feed"]), vec!["p1"]);
    assert_eq!(all_results(&h.service, &["carol:feed"]), vec!["p1"]);
    assert!(all_results(&h.service, &["alice:feed"]).is_empty());
}

#[test]
fn test_prefix_matching_runs_every_matching_rule() {
    let h = harness();
    let id = h
        .service
        .add_schema(
            r#"{
                "a": [{"targets": ["['all']"], "add": "@eventName"}],
                "a.b": [{"targets": ["['ab']"], "add": "@eventName"}]
            }"#,
        )
        .unwrap();

    for event in ["a.b.c", "a.c", "b"] {
        h.service.process_now(&id, event, &Attributes::new()).unwrap();
    }

    assert_eq!(all_results(&h.service, &["all"]), vec!["a.c", "a.b.c"]);
    assert_eq!(all_results(&h.service, &["ab"]), vec!["a.b.c"]);
}

#[test]
fn test_max_stored_values_keeps_newest() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"view": [{"targets": ["[user].recent"], "add": "page", "maxStoredValues": 3}]}"#)
        .unwrap();

    for page in ["p1", "p2", "p3", "p4", "p5"] {
        h.service
            .process_now(&id, "view", &attrs(&[("user", "u"), ("page", page)]))
            .unwrap();
    }

    assert_eq!(all_results(&h.service, &["u:recent"]), vec!["p5", "p4", "p3"]);
}

#[test]
fn test_replace_with_keeps_single_member() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"status": [{"targets": ["[user].status"], "replaceWith": "text"}]}"#)
        .unwrap();

    for text in ["online", "away", "offline"] {
        h.service
            .process_now(&id, "status", &attrs(&[("user", "u"), ("text", text)]))
            .unwrap();
    }
    assert_eq!(all_results(&h.service, &["u:status"]), vec!["offline"]);
}

#[test]
fn test_missing_attribute_skips_handler() {
    let h = harness();
    let id = h
        .service
        .add_schema(
            r#"{"e": [
                {"targets": ["[missing].x"], "add": "v"},
                {"targets": ["['ok']"], "add": "v"}
            ]}"#,
        )
        .unwrap();

    let report = h
        .service
        .process_now(&id, "e", &attrs(&[("v", "1")]))
        .unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.handlers_run, 1);
    assert_eq!(all_results(&h.service, &["ok"]), vec!["1"]);
}

#[test]
fn test_unknown_directive_fails_event() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"e": [{"targets": ["[@nonsense].x"], "add": "v"}]}"#)
        .unwrap();
    let result = h.service.process_now(&id, "e", &attrs(&[("v", "1")]));
    assert!(matches!(result, Err(FluxError::UnknownIdentifier(_))));
}

#[test]
fn test_runtime_targets_from_event() {
    let h = harness();
    let id = h.service.add_schema(r#"{"unrelated": []}"#).unwrap();

    let event = attrs(&[
        ("@targets", r#"["['inbox']", "[to].mail"]"#),
        ("@add", "msg"),
        ("to", "dana"),
        ("msg", "m1"),
    ]);
    h.service.process_now(&id, "mail.send", &event).unwrap();

    assert_eq!(all_results(&h.service, &["inbox:dana:mail"]), vec!["m1"]);
}

// =============================================================================
// Time windows
// =============================================================================

#[test]
fn test_explicit_scores_drive_order_and_ranges() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"tick": [{"targets": ["['ticks']"], "add": "n"}]}"#)
        .unwrap();

    for secs in [120, 100, 110, 105, 106] {
        let n = secs.to_string();
        h.service
            .process_now(&id, "tick", &attrs(&[("n", n.as_str()), ("@score", n.as_str())]))
            .unwrap();
    }

    assert_eq!(
        all_results(&h.service, &["ticks"]),
        vec!["120", "110", "106", "105", "100"]
    );

    // min is exclusive, max inclusive
    let page = h
        .service
        .query(&keys(&["ticks"]), None, None, ScoreRange::new(Some(105), Some(110)))
        .unwrap();
    assert_eq!(page.results, vec!["110", "106"]);
}

#[test]
fn test_calendar_buckets_from_score() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"visit": [{"targets": ["[@daily].visits", "[@monthly]"], "add": "user"}]}"#)
        .unwrap();

    h.service
        .process_now(
            &id,
            "visit",
            &attrs(&[("user", "u1"), ("@score", "1328400000")]),
        )
        .unwrap();

    assert_eq!(
        all_results(&h.service, &["daily-05-02-12:visits:monthly-02-12"]),
        vec!["u1"]
    );
}

// =============================================================================
// Counters and leaderboards
// =============================================================================

#[test]
fn test_distinct_and_gross_counts() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"play": [{"targets": ["[song].plays"], "add": "user", "maxStoredValues": 0}]}"#)
        .unwrap();

    for user in ["a", "b", "a", "c", "a"] {
        h.service
            .process_now(&id, "play", &attrs(&[("song", "s1"), ("user", user)]))
            .unwrap();
        h.clock.advance_ms(1);
    }

    // Counters only: nothing stored in the set
    assert!(all_results(&h.service, &["s1:plays"]).is_empty());
    assert_eq!(
        h.service
            .distinct_count(&keys(&["s1:plays"]), DistinctOp::Union, None)
            .unwrap(),
        3
    );
    let gross = h.service.gross_count(&keys(&["s1:plays"]), None).unwrap();
    assert!((4..=5).contains(&gross), "gross estimate {}", gross);
}

#[test]
fn test_distinct_counts_respect_cutoff() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"visit": [{"targets": ["['site']"], "add": "user"}]}"#)
        .unwrap();

    h.service
        .process_now(&id, "visit", &attrs(&[("user", "old"), ("@score", "1000")]))
        .unwrap();
    h.service
        .process_now(&id, "visit", &attrs(&[("user", "new"), ("@score", "2000")]))
        .unwrap();

    let site = keys(&["site"]);
    assert_eq!(h.service.distinct_count(&site, DistinctOp::Union, None).unwrap(), 2);
    assert_eq!(
        h.service
            .distinct_count(&site, DistinctOp::Union, Some(1500))
            .unwrap(),
        1
    );
}

#[test]
fn test_intersection_of_overlapping_audiences() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"visit": [{"targets": ["[page]"], "add": "user", "maxStoredValues": 0}]}"#)
        .unwrap();

    for i in 0..200 {
        let user = format!("user-{}", i);
        if i < 150 {
            h.service
                .process_now(&id, "visit", &attrs(&[("page", "home"), ("user", user.as_str())]))
                .unwrap();
        }
        if i >= 50 {
            h.service
                .process_now(&id, "visit", &attrs(&[("page", "docs"), ("user", user.as_str())]))
                .unwrap();
        }
    }

    let both = h
        .service
        .distinct_count(&keys(&["home", "docs"]), DistinctOp::Intersection, None)
        .unwrap();
    assert!((60..=140).contains(&both), "intersection estimate {}", both);

    let union = h
        .service
        .distinct_count(&keys(&["home", "docs"]), DistinctOp::Union, None)
        .unwrap();
    assert!((170..=230).contains(&union), "union estimate {}", union);
}

#[test]
fn test_stored_union_is_queryable_until_expiry() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"visit": [{"targets": ["[page]"], "add": "user"}]}"#)
        .unwrap();
    for (page, user) in [("a", "u1"), ("a", "u2"), ("b", "u2"), ("b", "u3")] {
        h.service
            .process_now(&id, "visit", &attrs(&[("page", page), ("user", user)]))
            .unwrap();
    }

    let stored = h
        .service
        .store_distinct_count(&keys(&["a", "b"]), None)
        .unwrap();
    assert_eq!(stored.ttl, 300);
    assert_eq!(
        h.service
            .distinct_count(&[stored.key.clone()], DistinctOp::Union, None)
            .unwrap(),
        3
    );

    h.clock.advance_ms(301_000);
    assert_eq!(
        h.service
            .distinct_count(&[stored.key], DistinctOp::Union, None)
            .unwrap(),
        0
    );
}

#[test]
fn test_count_frequency_leaderboard() {
    let h = harness();
    let id = h
        .service
        .add_schema(r#"{"search": [{"targets": ["['queries']"], "countFrequency": "q", "maxStoredValues": 3}]}"#)
        .unwrap();

    for q in ["rust", "go", "rust", "zig", "rust", "go", "c"] {
        h.service
            .process_now(&id, "search", &attrs(&[("q", q)]))
            .unwrap();
    }

    let leaders = h.service.leaderboard("queries", None).unwrap();
    assert_eq!(leaders.len(), 3);
    assert_eq!(leaders[0].item, "rust");
    assert_eq!(leaders[0].count, 3);
    assert_eq!(leaders[0].over_estimate, 0);
    // "c" took over the slot of "zig" and ties with "go"
    assert_eq!(leaders[1].item, "c");
    assert_eq!(leaders[1].count, 2);
    assert_eq!(leaders[1].over_estimate, 1);
    assert_eq!(leaders[2].item, "go");
    assert_eq!(leaders[2].guaranteed(), 2);
}

// =============================================================================
// Async ingestion
// =============================================================================

#[tokio::test]
async fn test_worker_pool_preserves_per_event_order() {
    let mut h = harness();
    let id = h
        .service
        .add_schema(r#"{"status": [{"targets": ["[user].status"], "replaceWith": "text"}]}"#)
        .unwrap();
    h.service.start_workers();

    for i in 0..100 {
        let text = format!("s{}", i);
        h.service
            .submit_event(&id, "status", attrs(&[("user", "u"), ("text", text.as_str())]))
            .await
            .unwrap();
    }
    h.service.flush().await;

    assert_eq!(all_results(&h.service, &["u:status"]), vec!["s99"]);
    let stats = h.service.dispatch_stats();
    assert_eq!(stats.accepted, 100);
    assert_eq!(stats.processed, 100);
    assert_eq!(h.store.zcard("flux:set:u:status").unwrap(), 1);
}
