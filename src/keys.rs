//! Key namespacing for persisted aggregates
//!
//! Every structure lives under a `flux:` namespace so external tooling can
//! find it:
//!
//! - `flux:set:<key>` stored sets
//! - `flux:distinct:<key>` distinct-value counters
//! - `flux:gross:<key>` gross-event counters
//! - `flux:leaderboard:<key>` frequency leaderboards
//! - `flux:leaderboard-over:<key>` their per-item over-estimates
//! - `flux:system:pingtime` liveness check

/// Encodes resolved keys into namespaced store keys
pub struct FluxKeys;

impl FluxKeys {
    pub const SET_PREFIX: &'static str = "flux:set:";
    pub const DISTINCT_PREFIX: &'static str = "flux:distinct:";
    pub const GROSS_PREFIX: &'static str = "flux:gross:";
    pub const LEADERBOARD_PREFIX: &'static str = "flux:leaderboard:";
    pub const OVERESTIMATE_PREFIX: &'static str = "flux:leaderboard-over:";
    pub const SCHEMA_PREFIX: &'static str = "flux:schema:";

    /// Sorted set listing every registered schema id
    pub const SCHEMA_INDEX: &'static str = "flux:schemas";
    pub const PING_TIME: &'static str = "flux:system:pingtime";

    pub fn set(key: &str) -> String {
        format!("{}{}", Self::SET_PREFIX, key)
    }

    pub fn distinct(key: &str) -> String {
        format!("{}{}", Self::DISTINCT_PREFIX, key)
    }

    pub fn gross(key: &str) -> String {
        format!("{}{}", Self::GROSS_PREFIX, key)
    }

    pub fn leaderboard(key: &str) -> String {
        format!("{}{}", Self::LEADERBOARD_PREFIX, key)
    }

    /// Companion set holding the SpaceSaving over-estimate of each tracked item
    pub fn leaderboard_overestimates(key: &str) -> String {
        format!("{}{}", Self::OVERESTIMATE_PREFIX, key)
    }

    pub fn schema(id: &str) -> String {
        format!("{}{}", Self::SCHEMA_PREFIX, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces() {
        assert_eq!(FluxKeys::set("user1:followers"), "flux:set:user1:followers");
        assert_eq!(FluxKeys::distinct("a"), "flux:distinct:a");
        assert_eq!(FluxKeys::gross("a"), "flux:gross:a");
        assert_eq!(FluxKeys::leaderboard("a"), "flux:leaderboard:a");
        assert_eq!(
            FluxKeys::leaderboard_overestimates("a"),
            "flux:leaderboard-over:a"
        );
    }

    #[test]
    fn test_overestimates_never_alias_a_leaderboard() {
        assert_ne!(
            FluxKeys::leaderboard_overestimates("a"),
            FluxKeys::leaderboard("a:overestimates")
        );
        assert!(!FluxKeys::leaderboard_overestimates("a").starts_with(FluxKeys::LEADERBOARD_PREFIX));
    }
}
