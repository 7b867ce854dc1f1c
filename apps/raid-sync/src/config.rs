use std::time::Duration;

use raid_common::MAX_WORKER_ID;

/// Raid sync configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Snowflake worker id used for broadcast sequence numbers.
    pub worker_id: u16,
    /// Safety TTL for cached room detail views.
    pub room_view_ttl: Duration,
    /// Upper bound for the listing view, which is otherwise cached until the next write.
    pub listing_view_ttl: Duration,
    /// Capacity of the fanout channel. Slow receivers skip messages beyond it.
    pub broadcast_capacity: usize,
    /// Gateway sessions without a heartbeat for this long are evicted.
    pub session_idle_timeout: Duration,
    /// How often the sweeper evicts idle sessions and expired views.
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            worker_id: 0,
            room_view_ttl: Duration::from_secs(10),
            listing_view_ttl: Duration::from_secs(300),
            broadcast_capacity: 4096,
            session_idle_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            worker_id: checked_worker_id(parsed_var("WORKER_ID"), defaults.worker_id),
            room_view_ttl: secs_var("ROOM_VIEW_TTL_SECS").unwrap_or(defaults.room_view_ttl),
            listing_view_ttl: secs_var("LISTING_VIEW_TTL_SECS")
                .unwrap_or(defaults.listing_view_ttl),
            broadcast_capacity: parsed_var("BROADCAST_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(defaults.broadcast_capacity),
            session_idle_timeout: secs_var("SESSION_IDLE_TIMEOUT_SECS")
                .unwrap_or(defaults.session_idle_timeout),
            sweep_interval: secs_var("SWEEP_INTERVAL_SECS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Worker ids above [`MAX_WORKER_ID`] fall back to `default`.
fn checked_worker_id(raw: Option<u16>, default: u16) -> u16 {
    match raw {
        Some(id) if id <= MAX_WORKER_ID => id,
        Some(id) => {
            tracing::warn!(
                worker_id = id,
                max = MAX_WORKER_ID,
                fallback = default,
                "WORKER_ID out of range, using fallback"
            );
            default
        }
        None => default,
    }
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cache_policy() {
        let config = Config::default();
        assert_eq!(config.room_view_ttl, Duration::from_secs(10));
        assert!(config.listing_view_ttl > config.room_view_ttl);
        assert!(config.session_idle_timeout > config.sweep_interval);
    }

    #[test]
    fn out_of_range_worker_id_falls_back() {
        assert_eq!(checked_worker_id(Some(MAX_WORKER_ID), 0), MAX_WORKER_ID);
        assert_eq!(checked_worker_id(Some(MAX_WORKER_ID + 1), 7), 7);
        assert_eq!(checked_worker_id(Some(u16::MAX), 0), 0);
        assert_eq!(checked_worker_id(None, 3), 3);
    }
}
