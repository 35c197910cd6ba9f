//! Price Feed Oracle
//!
//! Fetches exchange rates from a fixed set of providers and submits
//! commit-reveal prevote/vote transactions for the chain's price oracle
//! module.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use price_feed_oracle::aggregator::{Aggregator, BRIDGE_QUOTES};
use price_feed_oracle::chain_height::ChainHeightTracker;
use price_feed_oracle::chain_rpc::http::RestChainRpc;
use price_feed_oracle::chain_rpc::ChainRpc;
use price_feed_oracle::config::Config;
use price_feed_oracle::healthcheck::HealthcheckPinger;
use price_feed_oracle::metrics::OracleMetrics;
use price_feed_oracle::provider::{
    BinanceOps, CoinbaseOps, OkxOps, Provider, ProviderKind, ProviderOps, UniswapV3Ops,
};
use price_feed_oracle::scheduler::VoteScheduler;
use price_feed_oracle::types::{CurrencyPair, Endpoint, ProviderName};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "price_feed_oracle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_endpoint(kind: ProviderKind) -> Endpoint {
    match kind {
        ProviderKind::Binance => Endpoint {
            http_urls: vec!["https://api.binance.com".to_string()],
            websocket_host: Some("stream.binance.com:9443".to_string()),
            websocket_path: Some("/stream".to_string()),
            ping_period_ms: Some(15_000),
            ..Endpoint::default()
        },
        ProviderKind::Okx => Endpoint {
            http_urls: vec!["https://www.okx.com".to_string()],
            websocket_host: Some("ws.okx.com:8443".to_string()),
            websocket_path: Some("/ws/v5/public".to_string()),
            ping_period_ms: Some(20_000),
            ..Endpoint::default()
        },
        ProviderKind::Coinbase => Endpoint {
            http_urls: vec!["https://api.exchange.coinbase.com".to_string()],
            websocket_host: Some("ws-feed.exchange.coinbase.com".to_string()),
            websocket_path: Some("/".to_string()),
            ping_period_ms: Some(30_000),
            ..Endpoint::default()
        },
        ProviderKind::UniswapV3 => Endpoint {
            http_urls: vec!["https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v3".to_string()],
            poll_interval_ms: Some(30_000),
            ..Endpoint::default()
        },
    }
}

fn provider_ops(kind: ProviderKind, endpoint: &Endpoint) -> Arc<dyn ProviderOps> {
    match kind {
        ProviderKind::Binance => Arc::new(BinanceOps),
        ProviderKind::Okx => Arc::new(OkxOps),
        ProviderKind::Coinbase => Arc::new(CoinbaseOps),
        ProviderKind::UniswapV3 => Arc::new(UniswapV3Ops {
            contract_addresses: endpoint.contract_addresses.clone(),
        }),
    }
}

/// Every configured base quoted against USD and every bridge asset, plus each
/// bridge asset quoted against USD. The bridge/USD pairs (e.g. `USDT/USD`)
/// carry no base that's in `bases` itself, but providers must still subscribe
/// to them: without that rate the aggregator has no way to resolve a
/// bridge-quoted observation (`ATOM/USDT`) into a USD price (aggregator's
/// `resolve_usd_ticker`, SPEC_FULL.md 4.4 point 5).
/// A production deployment would instead read this from a pairs config file;
/// kept simple here since pair configuration is outside SPEC_FULL.md's scope.
fn pairs_for(bases: &[String]) -> Vec<CurrencyPair> {
    const QUOTES: &[&str] = &["USD", "USDT", "USDC"];
    let base_pairs = bases
        .iter()
        .flat_map(|base| QUOTES.iter().map(move |quote| CurrencyPair::new(base.clone(), *quote)));
    let bridge_pairs = BRIDGE_QUOTES.iter().map(|bridge| CurrencyPair::new(*bridge, "USD"));
    base_pairs.chain(bridge_pairs).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("starting price feed oracle");

    let config = Config::from_env()?;
    let cancel = CancellationToken::new();

    let rpc: Arc<dyn ChainRpc> = Arc::new(
        RestChainRpc::new(config.chain_rpc_url.clone(), config.grpc_timeout())
            .context("failed to build chain rpc client")?,
    );

    let height = ChainHeightTracker::spawn(rpc.clone(), std::time::Duration::from_secs(5), cancel.clone()).await;

    let pairs = pairs_for(&config.required_bases);
    let kinds = [
        ProviderKind::Binance,
        ProviderKind::Okx,
        ProviderKind::Coinbase,
        ProviderKind::UniswapV3,
    ];

    let mut providers: HashMap<ProviderName, Arc<Provider>> = HashMap::new();
    let mut provider_pairs: HashMap<ProviderName, Vec<CurrencyPair>> = HashMap::new();

    for kind in kinds {
        let endpoint = default_endpoint(kind);
        let ops = provider_ops(kind, &endpoint);
        let provider = Provider::init(kind, ops, endpoint, pairs.clone(), cancel.clone())
            .await
            .with_context(|| format!("failed to initialize provider {kind:?}"))?;
        providers.insert(kind.name(), provider);
        provider_pairs.insert(kind.name(), pairs.clone());
    }

    let deviation_overrides = config
        .deviation_overrides
        .iter()
        .filter_map(|(symbol, v)| rust_decimal::Decimal::try_from(*v).ok().map(|d| (symbol.clone(), d)))
        .collect();

    let metrics = Arc::new(OracleMetrics::default());

    let aggregator = Arc::new(Aggregator::new(
        providers,
        provider_pairs,
        config.provider_timeout(),
        rust_decimal::Decimal::try_from(config.deviation_threshold)?,
        config.min_providers,
        config.required_bases.clone(),
        deviation_overrides,
        config.min_provider_overrides.clone(),
        metrics.clone(),
    ));

    let healthchecks = HealthcheckPinger::new(config.healthcheck_urls.clone());

    let scheduler = VoteScheduler::new(
        rpc,
        height,
        aggregator,
        healthchecks,
        config.feeder_address.clone(),
        config.validator_address.clone(),
        config.lead_blocks,
        config.param_cache_window_blocks,
        config.ticker_sleep(),
        metrics,
    );

    let run_handle = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    cancel.cancel();
    scheduler.stop().await;
    let _ = run_handle.await;

    Ok(())
}
