//! Runtime configuration from environment.

use std::env;
use std::time::Duration;

use dispatch_core::PlannerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Flight executor tick
    pub tick_interval: Duration,
    /// Path points each drone advances per tick
    pub moves_per_tick: usize,
    pub max_expansions: usize,
    /// Give up on a scenario run after this long
    pub max_run: Duration,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            tick_interval: Duration::from_millis(
                env::var("DISPATCH_TICK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            ),
            moves_per_tick: env::var("DISPATCH_MOVES_PER_TICK")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(1),
            max_expansions: env::var("DISPATCH_MAX_EXPANSIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(250_000),
            max_run: Duration::from_secs(
                env::var("DISPATCH_MAX_RUN_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            log_json: env::var("DISPATCH_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            max_expansions: self.max_expansions,
            ..PlannerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            moves_per_tick: 1,
            max_expansions: 250_000,
            max_run: Duration::from_secs(120),
            log_json: false,
        }
    }
}
