//! Hand-rolled oracle-level telemetry counters (§6, SPEC_FULL.md 9.1
//! resolution 7).
//!
//! The teacher depends on the `metrics` crate but never calls its macros
//! anywhere in the tree (confirmed by grep before it was dropped from
//! Cargo.toml); this crate instead follows the pattern `ws_session.rs`'s own
//! `SessionMetrics` already uses - plain `AtomicU64` counters held as a
//! shared struct field, paired with a `tracing` event at the increment site,
//! rather than a global sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Default)]
pub struct OracleMetrics {
    pub new_tick: AtomicU64,
    pub failure_tick: AtomicU64,
    pub failure_provider_timeout: AtomicU64,
    pub failure_provider_ticker: AtomicU64,
    pub vote_failure_missed: AtomicU64,
    runtime_tick_micros_last: AtomicU64,
}

impl OracleMetrics {
    /// `new.tick` - incremented once per scheduler loop iteration, whether or
    /// not that iteration turns out to be a voting boundary.
    pub fn record_new_tick(&self) {
        self.new_tick.fetch_add(1, Ordering::Relaxed);
    }

    /// `failure.tick` - incremented when `tick()` returns an error.
    pub fn record_failure_tick(&self) {
        self.failure_tick.fetch_add(1, Ordering::Relaxed);
    }

    /// `failure.provider.type=timeout` - a provider's fetch was skipped this
    /// tick because it exceeded `provider_timeout`.
    pub fn record_provider_timeout(&self, provider: &str) {
        self.failure_provider_timeout.fetch_add(1, Ordering::Relaxed);
        debug!(metric = "failure.provider", r#type = "timeout", provider, "provider timed out");
    }

    /// `failure.provider.type=ticker` - a provider returned no usable ticker
    /// prices this tick (distinct from an outright timeout).
    pub fn record_provider_ticker_failure(&self, provider: &str) {
        self.failure_provider_ticker.fetch_add(1, Ordering::Relaxed);
        debug!(metric = "failure.provider", r#type = "ticker", provider, "provider reported no ticker prices");
    }

    /// `vote.failure.missed` - the scheduler detected a missed voting period
    /// and reset its commit state instead of revealing (§4.5, Scenario 3).
    pub fn record_vote_missed(&self) {
        self.vote_failure_missed.fetch_add(1, Ordering::Relaxed);
        debug!(metric = "vote.failure.missed", "missed voting period, resetting commit state");
    }

    /// `runtime.tick` - wall-clock duration of the most recently completed
    /// `tick()` call.
    pub fn record_tick_duration(&self, elapsed: Duration) {
        self.runtime_tick_micros_last
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        debug!(metric = "runtime.tick", micros = elapsed.as_micros() as u64, "tick completed");
    }

    pub fn runtime_tick_last(&self) -> Duration {
        Duration::from_micros(self.runtime_tick_micros_last.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = OracleMetrics::default();
        assert_eq!(metrics.new_tick.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.vote_failure_missed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn record_vote_missed_increments_counter() {
        let metrics = OracleMetrics::default();
        metrics.record_vote_missed();
        metrics.record_vote_missed();
        assert_eq!(metrics.vote_failure_missed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn record_tick_duration_stores_last_value() {
        let metrics = OracleMetrics::default();
        metrics.record_tick_duration(Duration::from_millis(42));
        assert_eq!(metrics.runtime_tick_last(), Duration::from_micros(42_000));
    }
}
