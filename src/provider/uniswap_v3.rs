//! UniswapV3 is the one HTTP-poll-only provider (no websocket): the source's
//! `Endpoint.PollInterval` field exists for exactly this case. Rather than
//! issuing raw `eth_call`s against a quoter contract, this queries a
//! configured subgraph-style HTTP endpoint per pool, keyed by the pair's
//! configured `contract_addresses` entry (SPEC_FULL.md 3.1: "only consumed by
//! UniswapV3"). Polling cadence defaults to 30s absent an explicit
//! `poll_interval_ms` (the source's own UniswapV3 default).

use std::time::Instant;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::provider::ProviderOps;
use crate::types::{CurrencyPair, TickerPrice};
use crate::ws_session::Frame;

pub struct UniswapV3Ops {
    pub contract_addresses: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PoolQuote {
    symbol: String,
    price: String,
    #[serde(default = "default_volume")]
    volume: String,
}

fn default_volume() -> String {
    "0".to_string()
}

#[derive(Debug, Deserialize)]
struct PoolQuoteBatch {
    quotes: Vec<PoolQuote>,
}

impl ProviderOps for UniswapV3Ops {
    fn uses_websocket(&self) -> bool {
        false
    }

    fn subscribe_message(&self, _pairs: &[CurrencyPair]) -> Vec<Message> {
        Vec::new()
    }

    fn parse_frame(&self, _frame: Frame) -> Vec<(String, TickerPrice)> {
        Vec::new()
    }

    fn poll_url(&self, base_url: &str, pairs: &[CurrencyPair]) -> Option<String> {
        let pools: Vec<&str> = pairs
            .iter()
            .filter_map(|p| self.contract_addresses.get(&p.symbol()).map(String::as_str))
            .collect();
        if pools.is_empty() {
            return None;
        }
        Some(format!("{}?pools={}", base_url.trim_end_matches('/'), pools.join(",")))
    }

    fn parse_poll_response(&self, body: &str) -> Vec<(String, TickerPrice)> {
        let Ok(batch) = serde_json::from_str::<PoolQuoteBatch>(body) else {
            return Vec::new();
        };
        batch
            .quotes
            .into_iter()
            .filter_map(|q| {
                TickerPrice::parse(&q.price, &q.volume, Instant::now())
                    .ok()
                    .map(|tp| (q.symbol.to_ascii_uppercase(), tp))
            })
            .collect()
    }

    /// Availability is just "is there a configured pool contract for this
    /// exact symbol", the same lookup `poll_url` makes.
    fn available_pairs(&self, candidates: &[CurrencyPair]) -> Option<Vec<CurrencyPair>> {
        Some(
            candidates
                .iter()
                .filter(|p| self.contract_addresses.contains_key(&p.symbol()))
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> UniswapV3Ops {
        let mut contract_addresses = std::collections::HashMap::new();
        contract_addresses.insert("ATOMUSDC".to_string(), "0xpool".to_string());
        UniswapV3Ops { contract_addresses }
    }

    #[test]
    fn poll_url_is_none_without_configured_pool() {
        let ops = ops();
        let pair = CurrencyPair::new("eth", "usdc");
        assert!(ops.poll_url("https://subgraph.example", &[pair]).is_none());
    }

    #[test]
    fn poll_url_includes_configured_pool() {
        let ops = ops();
        let pair = CurrencyPair::new("atom", "usdc");
        let url = ops.poll_url("https://subgraph.example/", &[pair]).unwrap();
        assert_eq!(url, "https://subgraph.example?pools=0xpool");
    }

    #[test]
    fn available_pairs_requires_a_configured_pool() {
        let ops = ops();
        let configured = CurrencyPair::new("atom", "usdc");
        let unconfigured = CurrencyPair::new("eth", "usdc");
        let available = ops.available_pairs(&[configured.clone(), unconfigured]).unwrap();
        assert_eq!(available, vec![configured]);
    }

    #[test]
    fn parses_pool_quote_batch() {
        let ops = ops();
        let body = r#"{"quotes":[{"symbol":"atomusdc","price":"9.5","volume":"100"}]}"#;
        let parsed = ops.parse_poll_response(body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "ATOMUSDC");
    }
}
