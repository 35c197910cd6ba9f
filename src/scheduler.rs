//! The commit-reveal vote loop (C5).
//!
//! Grounded on `examples/original_source/oracle/oracle.go`: `tick()`'s exact
//! vote-period arithmetic and gating rule, `GenerateSalt`/
//! `GenerateExchangeRatesString`, `GetParamCache`/`checkWhitelist`, and
//! `Start`/`Stop`'s sleep-after-tick loop with a blocking, idempotent stop.
//! The vote hash follows the Cosmos/Terra/Kujira oracle module convention
//! (`GetAggregateVoteHash`): SHA256 of `salt:exchange_rates:validator`,
//! truncated to the first 20 bytes, uppercase hex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::chain_height::ChainHeightTracker;
use crate::chain_rpc::ChainRpc;
use crate::healthcheck::HealthcheckPinger;
use crate::metrics::OracleMetrics;
use crate::types::{OracleTx, ParamCache, PreviousPrevote};

pub struct VoteScheduler {
    rpc: Arc<dyn ChainRpc>,
    height: Arc<ChainHeightTracker>,
    aggregator: Arc<Aggregator>,
    healthchecks: HealthcheckPinger,
    feeder_address: String,
    validator_address: String,
    lead_blocks: u64,
    param_cache_window_blocks: i64,
    ticker_sleep: Duration,
    metrics: Arc<OracleMetrics>,

    previous_prevote: tokio::sync::Mutex<Option<PreviousPrevote>>,
    previous_vote_period: tokio::sync::Mutex<f64>,
    param_cache: tokio::sync::Mutex<Option<ParamCache>>,

    stopping: AtomicBool,
    stopped: Notify,
}

impl VoteScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        height: Arc<ChainHeightTracker>,
        aggregator: Arc<Aggregator>,
        healthchecks: HealthcheckPinger,
        feeder_address: String,
        validator_address: String,
        lead_blocks: u64,
        param_cache_window_blocks: i64,
        ticker_sleep: Duration,
        metrics: Arc<OracleMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            height,
            aggregator,
            healthchecks,
            feeder_address,
            validator_address,
            lead_blocks,
            param_cache_window_blocks,
            ticker_sleep,
            metrics,
            previous_prevote: tokio::sync::Mutex::new(None),
            previous_vote_period: tokio::sync::Mutex::new(0.0),
            param_cache: tokio::sync::Mutex::new(None),
            stopping: AtomicBool::new(false),
            stopped: Notify::new(),
        })
    }

    /// Blocking tick loop: sleep-after-tick, not a fixed-cadence interval, so a
    /// slow tick pushes the next one back rather than producing back-to-back
    /// catch-up ticks (`Start` in the source).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() || self.stopping.load(Ordering::SeqCst) {
                self.stopped.notify_waiters();
                return;
            }

            debug!("executing oracle tick");
            self.metrics.record_new_tick();
            let started = std::time::Instant::now();
            if let Err(err) = self.tick().await {
                self.metrics.record_failure_tick();
                error!(error = %err, "oracle tick failed");
            }
            self.metrics.record_tick_duration(started.elapsed());

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stopped.notify_waiters();
                    return;
                }
                _ = tokio::time::sleep(self.ticker_sleep) => {}
            }
        }
    }

    /// Idempotent: a second call while a stop is already in flight just waits
    /// alongside the first. Returns once the in-flight tick (if any) has
    /// completed and `run()` has observed the stop flag.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stopped.notified().await;
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let (block_height, _err) = self.height.get_height();
        if block_height < 1 {
            anyhow::bail!("expected positive block height");
        }

        let params = self.get_param_cache(block_height).await?;

        let next_block_height = block_height + 1;
        let current_vote_period = (next_block_height as f64 / params.vote_period as f64).floor();
        let index_in_vote_period = (next_block_height as u64) % params.vote_period;

        let previous_vote_period = *self.previous_vote_period.lock().await;

        debug!(
            vote_period = params.vote_period,
            previous_vote_period,
            current_vote_period,
            index_in_vote_period,
            "tick state"
        );

        // Skip until a new voting period, or until within `lead_blocks` of the
        // period boundary (SPEC_FULL.md 9: lead_blocks is a configurable
        // parameter, default 4, matching the source's hardcoded `4`).
        if (previous_vote_period != 0.0 && current_vote_period == previous_vote_period)
            || (index_in_vote_period > 0
                && params.vote_period.saturating_sub(index_in_vote_period) > self.lead_blocks)
        {
            info!("skipping until next voting period");
            return Ok(());
        }

        self.aggregator.set_prices().await?;

        let mut previous_vote_period_guard = self.previous_vote_period.lock().await;
        if *previous_vote_period_guard != 0.0 && current_vote_period - *previous_vote_period_guard != 1.0 {
            self.metrics.record_vote_missed();
            info!("missing vote during voting period");
            *previous_vote_period_guard = 0.0;
            *self.previous_prevote.lock().await = None;
            return Ok(());
        }
        drop(previous_vote_period_guard);

        let salt = generate_salt();
        let exchange_rates_str = generate_exchange_rates_string(&self.aggregator.get_prices());
        let hash = aggregate_vote_hash(&salt, &exchange_rates_str, &self.validator_address);

        let is_prevote_only = self.previous_prevote.lock().await.is_none();

        if is_prevote_only {
            info!(hash, validator = self.validator_address, "broadcasting pre-vote");
            self.rpc
                .broadcast_tx(
                    OracleTx::Prevote {
                        hash: hash.clone(),
                        feeder: self.feeder_address.clone(),
                        validator: self.validator_address.clone(),
                    },
                    params.vote_period * 2,
                )
                .await?;

            let (current_height, _) = self.height.get_height();
            *self.previous_vote_period.lock().await = (current_height as f64 / params.vote_period as f64).floor();
            *self.previous_prevote.lock().await = Some(PreviousPrevote {
                salt,
                exchange_rates: exchange_rates_str,
                submit_block_height: current_height,
                vote_period: params.vote_period,
            });
        } else {
            let prevote = self.previous_prevote.lock().await.clone().expect("checked above");
            info!(
                exchange_rates = prevote.exchange_rates,
                validator = self.validator_address,
                "broadcasting vote"
            );
            self.rpc
                .broadcast_tx(
                    OracleTx::Vote {
                        salt: prevote.salt,
                        exchange_rates: prevote.exchange_rates,
                        feeder: self.feeder_address.clone(),
                        validator: self.validator_address.clone(),
                    },
                    params.vote_period.saturating_sub(index_in_vote_period),
                )
                .await?;

            *self.previous_prevote.lock().await = None;
            *self.previous_vote_period.lock().await = 0.0;
            self.healthchecks.ping_all().await;
        }

        Ok(())
    }

    /// Refreshes the cached `x/oracle` params when stale
    /// (`param_cache_window_blocks`, default 200), warning (not failing) on
    /// any whitelisted denom with no current price.
    async fn get_param_cache(&self, current_block: i64) -> anyhow::Result<crate::types::OracleParams> {
        let mut cache_guard = self.param_cache.lock().await;
        if let Some(cache) = cache_guard.as_ref() {
            if cache.is_fresh(current_block, self.param_cache_window_blocks) {
                return Ok(cache.params.clone());
            }
        }

        let params = self.rpc.oracle_params().await?;
        self.check_whitelist(&params).await;
        *cache_guard = Some(ParamCache {
            params: params.clone(),
            last_updated_block: current_block,
        });
        Ok(params)
    }

    async fn check_whitelist(&self, params: &crate::types::OracleParams) {
        let prices = self.aggregator.get_prices();
        for denom in &params.whitelist {
            let symbol = denom.to_ascii_uppercase();
            if !prices.contains_key(&symbol) {
                warn!(denom = symbol, "price missing for required denom");
            }
        }
    }
}

/// 32 random bytes, hex-encoded (64 hex characters).
fn generate_salt() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Canonical, sorted `base=price` string representation of the aggregated
/// exchange rates (`GenerateExchangeRatesString`/`sdk.DecCoins.Sort+String`).
fn generate_exchange_rates_string(prices: &std::collections::HashMap<String, Decimal>) -> String {
    let mut entries: Vec<(&String, &Decimal)> = prices.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(base, price)| format!("{price}{base}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn aggregate_vote_hash(salt: &str, exchange_rates: &str, validator: &str) -> String {
    let payload = format!("{salt}:{exchange_rates}:{validator}");
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode_upper(&digest[..20])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::chain_rpc::fakes::FakeChainRpc;
    use crate::types::{CurrencyPair, OracleParams, ProviderName};
    use std::collections::HashMap;

    fn params(vote_period: u64) -> OracleParams {
        OracleParams {
            vote_period,
            whitelist: vec!["ATOM".into()],
            reward_band: Decimal::new(2, 2),
        }
    }

    fn aggregator() -> Arc<Aggregator> {
        let mut provider_pairs = HashMap::new();
        provider_pairs.insert(ProviderName::Binance, vec![CurrencyPair::new("atom", "usd")]);
        Arc::new(Aggregator::new(
            HashMap::new(),
            provider_pairs,
            Duration::from_secs(5),
            Decimal::ONE,
            1,
            vec!["ATOM".to_string()],
            HashMap::new(),
            HashMap::new(),
            Arc::new(OracleMetrics::default()),
        ))
    }

    #[test]
    fn salt_is_64_hex_chars_and_distinct() {
        let a = generate_salt();
        let b = generate_salt();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn exchange_rates_string_is_sorted_by_base() {
        let mut prices = HashMap::new();
        prices.insert("ETH".to_string(), Decimal::new(200000, 2));
        prices.insert("ATOM".to_string(), Decimal::new(1000, 2));
        let s = generate_exchange_rates_string(&prices);
        assert_eq!(s, "10.00ATOM,2000.00ETH");
    }

    #[test]
    fn vote_hash_is_40_uppercase_hex_chars() {
        let hash = aggregate_vote_hash("abc123", "10.00ATOM", "kujiravaloper1xyz");
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn vote_hash_is_deterministic_for_same_inputs() {
        let h1 = aggregate_vote_hash("abc123", "10.00ATOM", "val1");
        let h2 = aggregate_vote_hash("abc123", "10.00ATOM", "val1");
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn gating_skips_within_lead_blocks_of_boundary() {
        let rpc = Arc::new(FakeChainRpc::new(98, params(100)));
        let rpc_dyn: Arc<dyn ChainRpc> = rpc.clone();
        let cancel = CancellationToken::new();
        let height = ChainHeightTracker::spawn(rpc_dyn.clone(), Duration::from_secs(3600), cancel.clone()).await;

        let scheduler = VoteScheduler::new(
            rpc_dyn,
            height,
            aggregator(),
            HealthcheckPinger::new(Vec::new()),
            "feeder".to_string(),
            "validator".to_string(),
            4,
            200,
            Duration::from_millis(10),
            Arc::new(OracleMetrics::default()),
        );

        // height=98 -> next=99, index=99, vote_period-index=1 <= lead_blocks(4): should NOT skip.
        scheduler.tick().await.unwrap();
        assert_eq!(rpc.broadcasts.lock().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let rpc = Arc::new(FakeChainRpc::new(1, params(100)));
        let rpc_dyn: Arc<dyn ChainRpc> = rpc.clone();
        let cancel = CancellationToken::new();
        let height = ChainHeightTracker::spawn(rpc_dyn.clone(), Duration::from_secs(3600), cancel.clone()).await;
        let scheduler = VoteScheduler::new(
            rpc_dyn,
            height,
            aggregator(),
            HealthcheckPinger::new(Vec::new()),
            "feeder".to_string(),
            "validator".to_string(),
            4,
            200,
            Duration::from_millis(10),
            Arc::new(OracleMetrics::default()),
        );

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run(cancel.clone()).await });

        let s1 = scheduler.clone();
        let s2 = scheduler.clone();
        tokio::join!(async { s1.stop().await }, async { s2.stop().await });

        let _ = handle.await;
    }

    #[tokio::test]
    async fn missed_vote_period_resets_state_and_increments_counter() {
        // next_block_height=20, vote_period=10 -> current_vote_period=2.0, index=0
        // (passes the lead_blocks gate), but `previous_vote_period` is seeded to a
        // value that isn't 2.0 - 1.0, so `tick()` takes the missed-period branch
        // instead of broadcasting.
        let rpc = Arc::new(FakeChainRpc::new(19, params(10)));
        let rpc_dyn: Arc<dyn ChainRpc> = rpc.clone();
        let cancel = CancellationToken::new();
        let height = ChainHeightTracker::spawn(rpc_dyn.clone(), Duration::from_secs(3600), cancel.clone()).await;
        let metrics = Arc::new(OracleMetrics::default());

        let scheduler = VoteScheduler::new(
            rpc_dyn,
            height,
            aggregator(),
            HealthcheckPinger::new(Vec::new()),
            "feeder".to_string(),
            "validator".to_string(),
            4,
            200,
            Duration::from_millis(10),
            metrics.clone(),
        );

        *scheduler.previous_vote_period.lock().await = 0.5;

        scheduler.tick().await.unwrap();

        assert_eq!(rpc.broadcasts.lock().len(), 0);
        assert_eq!(metrics.vote_failure_missed.load(Ordering::Relaxed), 1);
        assert_eq!(*scheduler.previous_vote_period.lock().await, 0.0);
        cancel.cancel();
    }
}
