//! Exchange rate providers (C3).
//!
//! Grounded on `examples/original_source/provider/provider.go`: a shared
//! `provider` struct (http client, pair/inverse maps, `RwLock`-guarded ticker
//! cache, optional websocket controller) wired by a per-exchange constructor.
//! The source dispatches providers through a `switch` on a string `Name`
//! (`oracle.go::NewProvider`); this crate replaces that with a tagged
//! `ProviderKind` enum and a `ProviderOps` trait supplying each provider's wire
//! format, per SPEC_FULL.md's REDESIGN FLAG against string-keyed provider
//! dispatch.

mod binance;
mod coinbase;
mod okx;
mod uniswap_v3;

pub use binance::BinanceOps;
pub use coinbase::CoinbaseOps;
pub use okx::OkxOps;
pub use uniswap_v3::UniswapV3Ops;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::Client;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::types::{CurrencyPair, Endpoint, ProviderName, TickerPrice};
use crate::ws_session::{Frame, WebsocketSession, WsSessionConfig};

/// Tickers go stale after this long without a fresh observation
/// (`staleTickersCutoff` in the source).
pub const STALE_TICKERS_CUTOFF: Duration = Duration::from_secs(60);
/// Candle-derived derivative sources bucket observations into 10-minute
/// windows (`providerCandlePeriod`). Kept as a named constant for parity even
/// though this crate does not itself implement a candle-derivative source.
pub const PROVIDER_CANDLE_PERIOD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Binance,
    Okx,
    Coinbase,
    UniswapV3,
}

impl ProviderKind {
    pub fn name(&self) -> ProviderName {
        match self {
            ProviderKind::Binance => ProviderName::Binance,
            ProviderKind::Okx => ProviderName::Okx,
            ProviderKind::Coinbase => ProviderName::Coinbase,
            ProviderKind::UniswapV3 => ProviderName::UniswapV3,
        }
    }
}

/// Per-exchange wire format, materialized by each `provider/*.rs` module.
/// Resolves SPEC_FULL.md's dynamic-dispatch REDESIGN FLAG: a tagged enum
/// picks the `ProviderOps` impl instead of a string match at every call site.
pub trait ProviderOps: Send + Sync {
    /// Whether this provider streams over a websocket at all; `UniswapV3`
    /// does not (it is HTTP-poll only, per the source's `PollInterval` field).
    fn uses_websocket(&self) -> bool;

    fn subscribe_message(&self, pairs: &[CurrencyPair]) -> Vec<Message>;

    /// Decodes one inbound frame into `(symbol, ticker)` pairs. A frame may
    /// carry zero, one, or several tickers (e.g. a combined-stream frame).
    fn parse_frame(&self, frame: Frame) -> Vec<(String, TickerPrice)>;

    /// For HTTP-poll providers: the URL to fetch the next batch of tickers
    /// from. Returns `None` for pure-websocket providers.
    fn poll_url(&self, base_url: &str, pairs: &[CurrencyPair]) -> Option<String>;

    /// Decodes an HTTP poll response body into `(symbol, ticker)` pairs.
    fn parse_poll_response(&self, body: &str) -> Vec<(String, TickerPrice)>;

    /// Of `candidates`, the subset this exchange natively lists exactly as
    /// given (same base/quote orientation) - e.g. Binance only ever lists a
    /// pair against one of its stablecoin quote currencies, never the
    /// reverse. Returns `None` when the provider has no fixed listing
    /// convention to check against; `Provider::init`'s registration then
    /// falls back to registering both directions speculatively (SPEC_FULL.md
    /// 4.3 `set_pairs`).
    fn available_pairs(&self, candidates: &[CurrencyPair]) -> Option<Vec<CurrencyPair>> {
        let _ = candidates;
        None
    }

    /// Wire-format symbol under which a registered pair's ticker updates
    /// arrive. Defaults to the canonical `{base}{quote}` form, which is also
    /// what `parse_frame`/`parse_poll_response` normalize their output into.
    fn pair_to_symbol(&self, pair: &CurrencyPair) -> String {
        pair.symbol()
    }
}

/// Shared state for a single exchange connection: the http client, the
/// pair/inverse maps (for providers that only publish one direction of a
/// pair), and the `RwLock`-guarded ticker cache read by the aggregator and
/// written by the provider's own background tasks.
pub struct Provider {
    pub name: ProviderName,
    ops: Arc<dyn ProviderOps>,
    http: Client,
    /// Shuffled at construction (`rand::thread_rng()`, seeded from system
    /// entropy - SPEC_FULL.md 6 only requires a cheap PRNG here, unlike the
    /// salt generator). `base_index` tracks which URL is currently favored;
    /// a failed request rotates to the next one (§4.3 HTTP failover).
    http_urls: Vec<String>,
    base_index: std::sync::atomic::AtomicUsize,
    pairs: HashMap<String, CurrencyPair>,
    inverse: HashMap<String, CurrencyPair>,
    tickers: RwLock<HashMap<String, TickerPrice>>,
}

impl Provider {
    /// Wires a provider exactly the way `provider.Init()` does: HTTP client
    /// and base URL first, then - only if the endpoint configures one - a
    /// websocket session spawned in the background.
    pub async fn init(
        kind: ProviderKind,
        ops: Arc<dyn ProviderOps>,
        endpoint: Endpoint,
        pairs: Vec<CurrencyPair>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let mut http_urls = endpoint.http_urls.clone();
        if http_urls.is_empty() {
            anyhow::bail!("provider {:?} has no configured http url", kind);
        }
        shuffle(&mut http_urls);

        let (pair_map, inverse_map) = Self::register_pairs(kind, ops.as_ref(), &pairs);

        let provider = Arc::new(Self {
            name: kind.name(),
            ops: ops.clone(),
            http: Client::new(),
            http_urls,
            base_index: std::sync::atomic::AtomicUsize::new(0),
            pairs: pair_map,
            inverse: inverse_map,
            tickers: RwLock::new(HashMap::new()),
        });

        if ops.uses_websocket() && endpoint.websocket_host.is_some() {
            let ws_url = format!(
                "wss://{}{}",
                endpoint.websocket_host.clone().unwrap_or_default(),
                endpoint.websocket_path.clone().unwrap_or_default(),
            );
            let ping_period = endpoint
                .ping_period_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO);

            let session_ops = ops.clone();
            let message_provider = provider.clone();
            let subscribe_ops = ops.clone();

            let session = WebsocketSession::new(
                WsSessionConfig {
                    ping_period,
                    ..WsSessionConfig::default()
                },
                vec![ws_url],
                pairs.clone(),
                Arc::new(move |frame: Frame| {
                    message_provider.ingest(session_ops.parse_frame(frame));
                }),
                Arc::new(move |p: &[CurrencyPair]| subscribe_ops.subscribe_message(p)),
            );

            tokio::spawn(session.run(cancel.clone()));
        } else if !ops.uses_websocket() {
            let poll_interval = endpoint
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(30));
            provider.clone().spawn_poll_loop(pairs.clone(), poll_interval, cancel.clone());
        }

        Ok(provider)
    }

    /// Pair registration (`set_pairs`, SPEC_FULL.md 4.3): each requested pair
    /// is registered direct if the provider natively lists it that way,
    /// inverse if only the reverse is listed, or dropped with a logged error
    /// if the provider reports neither. `inverse_map` is keyed by the wire
    /// symbol of the *reverse* pair (e.g. `USDUSDT` for a requested
    /// `USDT/USD`) and maps back to the canonical pair, so `ingest()` can
    /// recognize a reverse-quoted frame and invert it into canonical symbol
    /// space before it ever reaches the cache.
    ///
    /// When a provider doesn't implement `available_pairs` at all (returns
    /// `None`), there's no listing information to check against, so every
    /// pair is registered both ways speculatively and `ingest()` is left to
    /// sort out which direction the provider actually sends.
    fn register_pairs(
        kind: ProviderKind,
        ops: &dyn ProviderOps,
        pairs: &[CurrencyPair],
    ) -> (HashMap<String, CurrencyPair>, HashMap<String, CurrencyPair>) {
        let mut pair_map = HashMap::new();
        let mut inverse_map = HashMap::new();

        let Some(direct_available) = ops.available_pairs(pairs) else {
            for pair in pairs {
                pair_map.insert(ops.pair_to_symbol(pair), pair.clone());
                inverse_map.insert(ops.pair_to_symbol(&pair.reverse()), pair.clone());
            }
            return (pair_map, inverse_map);
        };

        let direct_symbols: std::collections::HashSet<String> =
            direct_available.iter().map(CurrencyPair::symbol).collect();

        let reverse_candidates: Vec<CurrencyPair> = pairs
            .iter()
            .filter(|pair| !direct_symbols.contains(&pair.symbol()))
            .map(CurrencyPair::reverse)
            .collect();
        let reverse_available = ops.available_pairs(&reverse_candidates).unwrap_or_default();
        let reverse_symbols: std::collections::HashSet<String> =
            reverse_available.iter().map(CurrencyPair::symbol).collect();

        for pair in pairs {
            if direct_symbols.contains(&pair.symbol()) {
                pair_map.insert(ops.pair_to_symbol(pair), pair.clone());
                continue;
            }
            let reversed = pair.reverse();
            if reverse_symbols.contains(&reversed.symbol()) {
                inverse_map.insert(ops.pair_to_symbol(&reversed), pair.clone());
            } else {
                error!(provider = ?kind, pair = %pair.symbol(), "pair is not available on this provider, dropping");
            }
        }

        (pair_map, inverse_map)
    }

    /// Write path from the provider's own frame/poll handlers
    /// (`setTickerPrice` in the source, §4.3). Rejects non-positive prices,
    /// inverts observations reported under the provider's native reverse
    /// symbol so the cache stays keyed canonically, drops anything the
    /// provider wasn't asked to track, and logs a per-`(provider, symbol)`
    /// trace of what landed in the cache.
    fn ingest(&self, observed: Vec<(String, TickerPrice)>) {
        if observed.is_empty() {
            return;
        }
        let mut tickers = self.tickers.write();
        for (wire_symbol, ticker) in observed {
            if ticker.price <= rust_decimal::Decimal::ZERO {
                warn!(provider = %self.name, symbol = %wire_symbol, price = %ticker.price, "rejecting non-positive ticker price");
                continue;
            }
            if let Some(canonical) = self.inverse.get(&wire_symbol) {
                let canonical_symbol = canonical.symbol();
                let inverted = invert(ticker);
                tracing::debug!(provider = %self.name, symbol = %canonical_symbol, price = %inverted.price, volume = %inverted.volume, "ticker price updated (inverted)");
                tickers.insert(canonical_symbol, inverted);
            } else if self.pairs.contains_key(&wire_symbol) {
                tracing::debug!(provider = %self.name, symbol = %wire_symbol, price = %ticker.price, volume = %ticker.volume, "ticker price updated");
                tickers.insert(wire_symbol, ticker);
            }
        }
    }

    fn spawn_poll_loop(
        self: Arc<Self>,
        pairs: Vec<CurrencyPair>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        self.poll_once(&pairs).await;
                    }
                }
            }
        });
    }

    /// Current favored base URL (`provider.go`'s `p.baseURL`, mutated on
    /// failover rather than read from a fixed field).
    fn http_base(&self) -> &str {
        &self.http_urls[self.base_index.load(std::sync::atomic::Ordering::Relaxed) % self.http_urls.len()]
    }

    /// Rotates to the next configured URL; the first subsequent success
    /// becomes the new favored base (§4.3 HTTP failover).
    fn rotate_http_base(&self) {
        if self.http_urls.len() <= 1 {
            return;
        }
        self.base_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn poll_once(&self, pairs: &[CurrencyPair]) {
        let Some(url) = self.ops.poll_url(self.http_base(), pairs) else {
            return;
        };
        match self.http.get(&url).send().await {
            Ok(resp) => {
                if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || resp.status().as_u16() == 418
                {
                    let retry_after = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    warn!(provider = %self.name, status = %resp.status(), retry_after, url, "provider rate-limited");
                    self.rotate_http_base();
                    return;
                }
                if !resp.status().is_success() {
                    warn!(provider = %self.name, status = %resp.status(), url, "provider poll request failed");
                    self.rotate_http_base();
                    return;
                }
                match resp.text().await {
                    Ok(body) => self.ingest(self.ops.parse_poll_response(&body)),
                    Err(e) => warn!(provider = %self.name, error = %e, "failed to read poll response body"),
                }
            }
            Err(e) => {
                warn!(provider = %self.name, error = %e, url, "provider poll request failed");
                self.rotate_http_base();
            }
        }
    }

    /// One `RLock` acquisition for the whole batch (`GetTickerPrices` in the
    /// source), not one per pair. `ingest()` already inverted reverse-pair
    /// observations into canonical symbol space, so this is a plain
    /// stale/missing check with no inversion logic of its own.
    pub fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> HashMap<String, TickerPrice> {
        let cache = self.tickers.read();
        let mut out = HashMap::with_capacity(pairs.len());

        for pair in pairs {
            let symbol = self.ops.pair_to_symbol(pair);
            match cache.get(&symbol) {
                Some(ticker) => {
                    if ticker.is_stale(STALE_TICKERS_CUTOFF) {
                        warn!(provider = %self.name, pair = %symbol, "ticker price is stale");
                    } else {
                        out.insert(symbol, *ticker);
                    }
                }
                None => {
                    warn!(provider = %self.name, pair = %symbol, "missing ticker price for pair");
                }
            }
        }

        out
    }
}

/// Fisher-Yates shuffle seeded from system entropy. URL ordering only needs a
/// cheap PRNG (SPEC_FULL.md 6/9.1), unlike salt generation which requires a
/// cryptographic one (`scheduler::generate_salt`).
fn shuffle(urls: &mut [String]) {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for i in (1..urls.len()).rev() {
        let j = rng.gen_range(0..=i);
        urls.swap(i, j);
    }
}

/// Stores `1/price` and `volume*price` under the canonical symbol when a
/// provider only natively publishes the reverse pair (SPEC_FULL.md 3/4.3).
fn invert(ticker: TickerPrice) -> TickerPrice {
    TickerPrice {
        price: rust_decimal::Decimal::ONE / ticker.price,
        volume: ticker.volume * ticker.price,
        time: ticker.time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn tp(price: i64, volume: i64) -> TickerPrice {
        TickerPrice {
            price: Decimal::from(price),
            volume: Decimal::from(volume),
            time: Instant::now(),
        }
    }

    #[test]
    fn invert_stores_reciprocal_price_and_rescaled_volume() {
        let t = tp(2, 100);
        let inverted = invert(t);
        assert_eq!(inverted.price, Decimal::new(5, 1));
        assert_eq!(inverted.volume, Decimal::from(200));
    }

    fn provider_for(pairs: &[CurrencyPair]) -> Provider {
        let mut pair_map = HashMap::new();
        let mut inverse_map = HashMap::new();
        for pair in pairs {
            pair_map.insert(pair.symbol(), pair.clone());
            inverse_map.insert(pair.reverse().symbol(), pair.clone());
        }
        Provider {
            name: ProviderName::Binance,
            ops: Arc::new(BinanceOps),
            http: Client::new(),
            http_urls: vec!["https://example.invalid".to_string()],
            base_index: std::sync::atomic::AtomicUsize::new(0),
            pairs: pair_map,
            inverse: inverse_map,
            tickers: RwLock::new(HashMap::new()),
        }
    }

    /// Scenario 5: config requests `USDT/USD`, the provider only publishes
    /// the reverse `USD/USDT` frame at 0.999 - the canonical cache entry must
    /// end up as the inverted `1/0.999` price.
    #[test]
    fn ingest_inverts_reverse_quoted_frames_into_canonical_symbol_space() {
        let canonical = CurrencyPair::new("usdt", "usd");
        let provider = provider_for(&[canonical.clone()]);

        let reverse_symbol = canonical.reverse().symbol();
        let reverse_tick = TickerPrice::new(Decimal::new(999, 3), Decimal::from(100), Instant::now()).unwrap();
        provider.ingest(vec![(reverse_symbol, reverse_tick)]);

        let out = provider.get_ticker_prices(&[canonical.clone()]);
        let stored = out.get(&canonical.symbol()).expect("canonical symbol must be populated from the inverted frame");
        assert_eq!(stored.price, Decimal::ONE / Decimal::new(999, 3));
        assert_eq!(stored.volume, Decimal::from(100) * Decimal::new(999, 3));
    }

    #[test]
    fn ingest_stores_directly_quoted_frames_under_their_own_symbol() {
        let pair = CurrencyPair::new("atom", "usd");
        let provider = provider_for(&[pair.clone()]);

        provider.ingest(vec![(pair.symbol(), tp(10, 100))]);

        let out = provider.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out.get(&pair.symbol()).unwrap().price, Decimal::from(10));
    }

    #[test]
    fn ingest_drops_non_positive_prices() {
        let pair = CurrencyPair::new("atom", "usd");
        let provider = provider_for(&[pair.clone()]);

        provider.ingest(vec![(pair.symbol(), tp(0, 100))]);

        assert!(provider.get_ticker_prices(&[pair]).is_empty());
    }

    #[test]
    fn ingest_drops_symbols_the_provider_was_not_asked_to_track() {
        let tracked = CurrencyPair::new("atom", "usd");
        let provider = provider_for(&[tracked]);

        let untracked = CurrencyPair::new("eth", "usd");
        provider.ingest(vec![(untracked.symbol(), tp(10, 100))]);

        assert!(provider.get_ticker_prices(&[untracked]).is_empty());
    }

    /// Exposes only a fixed set of natively-listed quote currencies, the way
    /// a real exchange's `available_pairs` override behaves, so
    /// `register_pairs`'s direct/inverse/unavailable branches can be driven
    /// deterministically.
    struct FakeOps {
        native_quotes: &'static [&'static str],
    }

    impl ProviderOps for FakeOps {
        fn uses_websocket(&self) -> bool {
            true
        }
        fn subscribe_message(&self, _pairs: &[CurrencyPair]) -> Vec<Message> {
            Vec::new()
        }
        fn parse_frame(&self, _frame: Frame) -> Vec<(String, TickerPrice)> {
            Vec::new()
        }
        fn poll_url(&self, _base_url: &str, _pairs: &[CurrencyPair]) -> Option<String> {
            None
        }
        fn parse_poll_response(&self, _body: &str) -> Vec<(String, TickerPrice)> {
            Vec::new()
        }
        fn available_pairs(&self, candidates: &[CurrencyPair]) -> Option<Vec<CurrencyPair>> {
            Some(
                candidates
                    .iter()
                    .filter(|p| self.native_quotes.contains(&p.quote.as_str()))
                    .cloned()
                    .collect(),
            )
        }
    }

    struct UnknownOps;

    impl ProviderOps for UnknownOps {
        fn uses_websocket(&self) -> bool {
            true
        }
        fn subscribe_message(&self, _pairs: &[CurrencyPair]) -> Vec<Message> {
            Vec::new()
        }
        fn parse_frame(&self, _frame: Frame) -> Vec<(String, TickerPrice)> {
            Vec::new()
        }
        fn poll_url(&self, _base_url: &str, _pairs: &[CurrencyPair]) -> Option<String> {
            None
        }
        fn parse_poll_response(&self, _body: &str) -> Vec<(String, TickerPrice)> {
            Vec::new()
        }
    }

    #[test]
    fn register_pairs_registers_direct_when_natively_listed() {
        let ops = FakeOps { native_quotes: &["USDT"] };
        let pair = CurrencyPair::new("atom", "usdt");
        let (direct, inverse) = Provider::register_pairs(ProviderKind::Binance, &ops, &[pair.clone()]);
        assert_eq!(direct.get(&pair.symbol()), Some(&pair));
        assert!(inverse.is_empty());
    }

    #[test]
    fn register_pairs_registers_inverse_when_only_reverse_is_listed() {
        let ops = FakeOps { native_quotes: &["USDT"] };
        // Requested USD/USDT, but this exchange only ever lists USDT/USD.
        let pair = CurrencyPair::new("usd", "usdt");
        let (direct, inverse) = Provider::register_pairs(ProviderKind::Binance, &ops, &[pair.clone()]);
        assert!(direct.is_empty());
        assert_eq!(inverse.get(&pair.reverse().symbol()), Some(&pair));
    }

    #[test]
    fn register_pairs_drops_pairs_unavailable_in_either_direction() {
        let ops = FakeOps { native_quotes: &["USDT"] };
        let pair = CurrencyPair::new("atom", "eur");
        let (direct, inverse) = Provider::register_pairs(ProviderKind::Binance, &ops, &[pair]);
        assert!(direct.is_empty());
        assert!(inverse.is_empty());
    }

    #[test]
    fn register_pairs_falls_back_to_speculative_both_directions_when_unknown() {
        let ops = UnknownOps;
        let pair = CurrencyPair::new("atom", "usd");
        let (direct, inverse) = Provider::register_pairs(ProviderKind::Binance, &ops, &[pair.clone()]);
        assert_eq!(direct.get(&pair.symbol()), Some(&pair));
        assert_eq!(inverse.get(&pair.reverse().symbol()), Some(&pair));
    }
}
