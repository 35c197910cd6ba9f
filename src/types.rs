//! Core data model shared across the provider runtime, aggregator, and vote scheduler.
//!
//! Mirrors `types/currency.go`, `types/ticker_price.go`, `types/candle_price.go` and
//! `types/errors.go` from the feeder this crate distills, generalized to `rust_decimal`
//! for fixed-point precision.

use std::collections::HashMap;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An ordered pair of uppercase asset symbols, e.g. `(ATOM, USD)`.
///
/// Equality and hashing are case-insensitive because construction always upper-cases
/// both legs; there is no way to observe a lowercase `CurrencyPair` once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// Canonical string form: concatenation without separator, e.g. `ATOMUSD`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Rendering with an explicit separator, for providers whose subscription topics
    /// need one (e.g. `atom-usd` style channels).
    pub fn join(&self, separator: &str) -> String {
        format!("{}{}{}", self.base, separator, self.quote)
    }

    pub fn reverse(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

/// A price observation for an instantaneous quote.
#[derive(Debug, Clone, Copy)]
pub struct TickerPrice {
    pub price: Decimal,
    pub volume: Decimal,
    pub time: Instant,
}

impl TickerPrice {
    /// Validates at construction: a non-positive price is rejected here, not merely
    /// at the aggregation filter boundary (see SPEC_FULL.md 3.1 / 9.1 on why this is
    /// stricter than the source's silent-zero-on-parse-failure behavior).
    pub fn new(price: Decimal, volume: Decimal, time: Instant) -> Result<Self, OracleError> {
        if price <= Decimal::ZERO {
            return Err(OracleError::ProtocolDecode(format!(
                "ticker price must be > 0, got {price}"
            )));
        }
        Ok(Self {
            price,
            volume,
            time,
        })
    }

    /// Parses `price`/`volume` from decimal strings, the shape message handlers
    /// actually receive off the wire.
    pub fn parse(price: &str, volume: &str, time: Instant) -> Result<Self, OracleError> {
        let price: Decimal = price
            .parse()
            .map_err(|_| OracleError::ProtocolDecode(format!("unparseable price: {price}")))?;
        let volume: Decimal = volume
            .parse()
            .map_err(|_| OracleError::ProtocolDecode(format!("unparseable volume: {volume}")))?;
        Self::new(price, volume, time)
    }

    pub fn is_stale(&self, cutoff: std::time::Duration) -> bool {
        self.time.elapsed() > cutoff
    }
}

/// A price/volume observation carrying an explicit millisecond timestamp, used
/// internally by derivative (TWAP) sources only - those sources are treated as a
/// black box by this crate (see SPEC_FULL.md 1) but the type is kept so their
/// output can be folded into the same aggregation path as ticker prices.
#[derive(Debug, Clone, Copy)]
pub struct CandlePrice {
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp_ms: i64,
}

impl CandlePrice {
    pub fn new(price: Decimal, volume: Decimal, timestamp_ms: i64) -> Result<Self, OracleError> {
        if price <= Decimal::ZERO {
            return Err(OracleError::ProtocolDecode(format!(
                "candle price must be > 0, got {price}"
            )));
        }
        Ok(Self {
            price,
            volume,
            timestamp_ms,
        })
    }
}

/// An opaque, symbolic provider identifier. Closed at dispatch time (see
/// `crate::provider::ProviderKind`) but treated as a plain string everywhere else
/// (logging, telemetry keys, config maps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderName {
    Binance,
    Okx,
    Coinbase,
    UniswapV3,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Binance => "binance",
            ProviderName::Okx => "okx",
            ProviderName::Coinbase => "coinbase",
            ProviderName::UniswapV3 => "uniswapv3",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-provider configuration. Any field may be absent; absent fields fall back to
/// hard-coded per-provider defaults supplied by that provider's module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: Option<String>,
    pub http_urls: Vec<String>,
    pub websocket_host: Option<String>,
    pub websocket_path: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub ping_period_ms: Option<u64>,
    pub ping_message_type: Option<u8>,
    pub ping_message: Option<String>,
    pub contract_addresses: HashMap<String, String>,
}

/// `map<ProviderName, map<Symbol, TickerPrice>>`, built fresh each aggregator tick
/// and discarded once aggregation completes.
pub type AggregatedTickers = HashMap<ProviderName, HashMap<String, TickerPrice>>;

/// The committed half of a commit-reveal vote. Created on a successful prevote
/// broadcast, consumed on the matching reveal. At most one exists at any moment -
/// enforced by `VoteScheduler` holding it as a plain `Option<PreviousPrevote>`
/// field, not a collection.
#[derive(Debug, Clone)]
pub struct PreviousPrevote {
    pub salt: String,
    pub exchange_rates: String,
    pub submit_block_height: i64,
    pub vote_period: u64,
}

/// Cached `x/oracle` chain parameters, refreshed when stale (see
/// `Config::param_cache_window_blocks`, default 200 blocks).
#[derive(Debug, Clone)]
pub struct ParamCache {
    pub params: OracleParams,
    pub last_updated_block: i64,
}

impl ParamCache {
    pub fn is_fresh(&self, current_block: i64, window_blocks: i64) -> bool {
        current_block - self.last_updated_block < window_blocks
    }
}

/// `x/oracle.Params()` response shape, the minimal fields the scheduler consumes.
#[derive(Debug, Clone)]
pub struct OracleParams {
    pub vote_period: u64,
    pub whitelist: Vec<String>,
    pub reward_band: Decimal,
}

/// A transaction the scheduler asks the (out-of-scope) chain RPC client to broadcast.
#[derive(Debug, Clone)]
pub enum OracleTx {
    Prevote {
        hash: String,
        feeder: String,
        validator: String,
    },
    Vote {
        salt: String,
        exchange_rates: String,
        feeder: String,
        validator: String,
    },
}

/// The chain's response to a broadcast transaction.
#[derive(Debug, Clone)]
pub struct TxResponse {
    pub code: u32,
    pub raw_log: String,
}

/// Error kinds per SPEC_FULL.md 7 / 7.1. Most call sites still propagate via
/// `anyhow::Result` - this enum exists only at the seams that must dispatch on
/// error *kind* programmatically rather than merely log it.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("transient network failure: {0}")]
    TransientNetwork(#[source] anyhow::Error),

    #[error("protocol decode failure: {0}")]
    ProtocolDecode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("insufficient samples to compute deviation (need >= 3, got {0})")]
    InsufficientSamples(usize),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}
