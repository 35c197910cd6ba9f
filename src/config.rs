//! Application configuration, loaded once from the environment at startup.
//!
//! Follows the source's own `env::var(...).unwrap_or_else(...).parse().unwrap_or(default)`
//! idiom field by field rather than a derive-based config crate - every numeric knob
//! named across SPEC_FULL.md (stale cutoff, deviation threshold, lead blocks, backoff
//! cap, forced-reconnect period, min providers, provider timeout, ticker sleep, param
//! cache window) gets exactly one line here.

use std::collections::HashMap;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Validator's feeder address, used in prevote/vote messages.
    pub validator_address: String,
    pub feeder_address: String,

    /// How often the vote scheduler ticks. Default 1000ms (SPEC_FULL.md 4.5).
    pub ticker_sleep_ms: u64,
    /// Configurable "lead blocks" gating parameter (SPEC_FULL.md 9), default 4.
    pub lead_blocks: u64,
    /// Blocks a cached `x/oracle` param set stays fresh before re-query, default 200.
    pub param_cache_window_blocks: i64,

    /// Per-provider fetch timeout for the aggregator's fan-out, default 5s.
    pub provider_timeout_ms: u64,
    /// Deviation threshold T (sigma multiples), default 1.0.
    pub deviation_threshold: f64,
    /// Minimum number of providers that must report a symbol for it to survive
    /// aggregation, default 3.
    pub min_providers: usize,
    /// Per-symbol deviation-threshold overrides (SPEC_FULL.md 4.4.3), e.g.
    /// `ATOM=2.0`. A symbol absent here uses `deviation_threshold`.
    pub deviation_overrides: HashMap<String, f64>,
    /// Per-symbol minimum-provider-count overrides (SPEC_FULL.md 4.4.6). A
    /// symbol absent here uses `min_providers`.
    pub min_provider_overrides: HashMap<String, usize>,
    /// Ticker staleness cutoff, default 1 minute.
    pub stale_cutoff_secs: u64,

    /// Websocket reconnect backoff: attempt cap (25) and base seconds (5).
    pub backoff_max_attempts: u32,
    pub backoff_base_secs: u64,
    /// Forced reconnect interval, default 23h.
    pub forced_reconnect_secs: u64,

    /// gRPC param query timeout, default 15s.
    pub grpc_timeout_ms: u64,
    /// Base bases required at every tick; missing ones are logged, not fatal.
    pub required_bases: Vec<String>,

    /// Healthcheck URLs pinged on successful reveal, each with its own timeout.
    /// Entries whose timeout fails to parse are warned-and-skipped at construction
    /// (SPEC_FULL.md 3.1), never rejected wholesale.
    pub healthcheck_urls: Vec<(String, Duration)>,

    pub chain_rpc_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let validator_address =
            std::env::var("ORACLE_VALIDATOR_ADDRESS").unwrap_or_else(|_| String::new());

        let feeder_address =
            std::env::var("ORACLE_FEEDER_ADDRESS").unwrap_or_else(|_| String::new());

        let ticker_sleep_ms = std::env::var("ORACLE_TICKER_SLEEP_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let lead_blocks = std::env::var("ORACLE_LEAD_BLOCKS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4);

        let param_cache_window_blocks = std::env::var("ORACLE_PARAM_CACHE_WINDOW_BLOCKS")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .unwrap_or(200);

        let provider_timeout_ms = std::env::var("ORACLE_PROVIDER_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let deviation_threshold = std::env::var("ORACLE_DEVIATION_THRESHOLD")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .unwrap_or(1.0);

        let min_providers = std::env::var("ORACLE_MIN_PROVIDERS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let deviation_overrides = parse_symbol_overrides(
            &std::env::var("ORACLE_DEVIATION_OVERRIDES").unwrap_or_default(),
            |v| v.parse::<f64>().ok(),
        );

        let min_provider_overrides = parse_symbol_overrides(
            &std::env::var("ORACLE_MIN_PROVIDER_OVERRIDES").unwrap_or_default(),
            |v| v.parse::<usize>().ok(),
        );

        let stale_cutoff_secs = std::env::var("ORACLE_STALE_CUTOFF_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let backoff_max_attempts = std::env::var("ORACLE_BACKOFF_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "25".to_string())
            .parse()
            .unwrap_or(25);

        let backoff_base_secs = std::env::var("ORACLE_BACKOFF_BASE_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let forced_reconnect_secs = std::env::var("ORACLE_FORCED_RECONNECT_SECS")
            .unwrap_or_else(|_| (23 * 3600).to_string())
            .parse()
            .unwrap_or(23 * 3600);

        let grpc_timeout_ms = std::env::var("ORACLE_GRPC_TIMEOUT_MS")
            .unwrap_or_else(|_| "15000".to_string())
            .parse()
            .unwrap_or(15000);

        let required_bases = std::env::var("ORACLE_REQUIRED_BASES")
            .unwrap_or_else(|_| "ATOM,BTC,ETH".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let healthcheck_urls = parse_healthcheck_urls(
            &std::env::var("ORACLE_HEALTHCHECK_URLS").unwrap_or_default(),
        );

        let chain_rpc_url = std::env::var("ORACLE_CHAIN_RPC_URL")
            .unwrap_or_else(|_| "http://localhost:26657".to_string());

        Ok(Self {
            validator_address,
            feeder_address,
            ticker_sleep_ms,
            lead_blocks,
            param_cache_window_blocks,
            provider_timeout_ms,
            deviation_threshold,
            min_providers,
            deviation_overrides,
            min_provider_overrides,
            stale_cutoff_secs,
            backoff_max_attempts,
            backoff_base_secs,
            forced_reconnect_secs,
            grpc_timeout_ms,
            required_bases,
            healthcheck_urls,
            chain_rpc_url,
        })
    }

    pub fn ticker_sleep(&self) -> Duration {
        Duration::from_millis(self.ticker_sleep_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn stale_cutoff(&self) -> Duration {
        Duration::from_secs(self.stale_cutoff_secs)
    }

    pub fn forced_reconnect(&self) -> Duration {
        Duration::from_secs(self.forced_reconnect_secs)
    }

    pub fn grpc_timeout(&self) -> Duration {
        Duration::from_millis(self.grpc_timeout_ms)
    }
}

/// Parses `"url1=5s,url2=2s"` style config, warning-and-skipping entries whose
/// duration fails to parse rather than failing the whole list (SPEC_FULL.md 3.1,
/// grounded on the source's `oracle.New()` healthcheck construction).
fn parse_healthcheck_urls(raw: &str) -> Vec<(String, Duration)> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let (url, dur) = entry.split_once('=')?;
            match parse_duration_secs(dur.trim()) {
                Ok(d) => Some((url.trim().to_string(), d)),
                Err(_) => {
                    tracing::warn!(entry, "skipping healthcheck url with unparseable timeout");
                    None
                }
            }
        })
        .collect()
}

/// Parses `"ATOM=2.0,ETH=1.5"` style per-symbol overrides, warning-and-skipping
/// entries whose value fails to parse rather than failing the whole list
/// (same idiom as `parse_healthcheck_urls`).
fn parse_symbol_overrides<T>(raw: &str, parse: impl Fn(&str) -> Option<T>) -> HashMap<String, T> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let (symbol, value) = entry.split_once('=')?;
            match parse(value.trim()) {
                Some(v) => Some((symbol.trim().to_ascii_uppercase(), v)),
                None => {
                    tracing::warn!(entry, "skipping symbol override with unparseable value");
                    None
                }
            }
        })
        .collect()
}

fn parse_duration_secs(s: &str) -> anyhow::Result<Duration> {
    let secs: u64 = s
        .trim_end_matches('s')
        .parse()
        .map_err(|_| anyhow::anyhow!("unparseable duration: {s}"))?;
    Ok(Duration::from_secs(secs))
}
