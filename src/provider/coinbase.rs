//! Coinbase wire format: the `ticker` channel over Coinbase's public
//! Exchange websocket feed.
//!
//! Subscribe frame: `{"type":"subscribe","product_ids":[...],"channels":["ticker"]}`;
//! updates arrive as `{"type":"ticker","product_id":"ATOM-USD","price":"...","volume_24h":"..."}`.

use std::time::Instant;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::provider::ProviderOps;
use crate::types::{CurrencyPair, TickerPrice};
use crate::ws_session::Frame;

pub struct CoinbaseOps;

/// Coinbase Exchange genuinely lists fiat-USD pairs alongside USDT/USDC
/// stablecoin pairs (e.g. `ATOM-USD`, `USDT-USD`), unlike Binance/OKX - which
/// is what makes it a usable source for the bridge-asset USD rate other
/// providers need to resolve a stablecoin-quoted observation.
const NATIVE_QUOTES: &[&str] = &["USD", "USDT", "USDC"];

fn product_id(pair: &CurrencyPair) -> String {
    pair.join("-")
}

#[derive(Debug, Deserialize)]
struct CoinbaseTicker {
    #[serde(rename = "type")]
    kind: String,
    product_id: String,
    price: String,
    volume_24h: String,
}

impl ProviderOps for CoinbaseOps {
    fn uses_websocket(&self) -> bool {
        true
    }

    fn subscribe_message(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let product_ids: Vec<String> = pairs.iter().map(product_id).collect();
        let frame = serde_json::json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channels": ["ticker"],
        });
        vec![Message::Text(frame.to_string())]
    }

    fn parse_frame(&self, frame: Frame) -> Vec<(String, TickerPrice)> {
        let Frame::Text(text) = frame else {
            return Vec::new();
        };
        let Ok(ticker) = serde_json::from_str::<CoinbaseTicker>(&text) else {
            return Vec::new();
        };
        if ticker.kind != "ticker" {
            return Vec::new();
        }
        let symbol = ticker.product_id.replace('-', "").to_ascii_uppercase();
        match TickerPrice::parse(&ticker.price, &ticker.volume_24h, Instant::now()) {
            Ok(tp) => vec![(symbol, tp)],
            Err(_) => Vec::new(),
        }
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
                .filter(|p| NATIVE_QUOTES.contains(&p.quote.as_str()))
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_pairs_accepts_usd_and_stablecoin_quotes() {
        let ops = CoinbaseOps;
        let usd = CurrencyPair::new("atom", "usd");
        let eur = CurrencyPair::new("atom", "eur");
        let available = ops.available_pairs(&[usd.clone(), eur]).unwrap();
        assert_eq!(available, vec![usd]);
    }

    #[test]
    fn product_id_uses_dash_separator() {
        let pair = CurrencyPair::new("atom", "usd");
        assert_eq!(product_id(&pair), "ATOM-USD");
    }

    #[test]
    fn parses_ticker_update() {
        let ops = CoinbaseOps;
        let frame = Frame::Text(
            r#"{"type":"ticker","product_id":"ATOM-USD","price":"9.87","volume_24h":"5000"}"#
                .to_string(),
        );
        let parsed = ops.parse_frame(frame);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "ATOMUSD");
    }

    #[test]
    fn ignores_non_ticker_message_types() {
        let ops = CoinbaseOps;
        let frame = Frame::Text(r#"{"type":"subscriptions","channels":[]}"#.to_string());
        assert!(ops.parse_frame(frame).is_empty());
    }
}
