//! Binance wire format: combined-stream `@ticker` frames over one websocket.
//!
//! Grounded on `examples/original_source/provider/provider.go`'s generic
//! provider shape plus the teacher's `src/scrapers/binance_session.rs`
//! (which names the same stream/topic conventions, even though it never
//! actually opens a socket). Subscribes via the standard combined-stream
//! `SUBSCRIBE` frame; individual ticker updates carry `s` (symbol), `c`
//! (last price), `v` (base asset volume).

use std::time::Instant;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::provider::ProviderOps;
use crate::types::{CurrencyPair, TickerPrice};
use crate::ws_session::Frame;

pub struct BinanceOps;

/// Binance lists a base asset only against one of these quote currencies;
/// it has no fiat-USD spot market at all (e.g. no `ATOMUSD`).
const NATIVE_QUOTES: &[&str] = &["USDT", "USDC", "BUSD"];

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "v")]
    volume: String,
}

fn stream_name(pair: &CurrencyPair) -> String {
    format!("{}@ticker", pair.symbol().to_ascii_lowercase())
}

impl ProviderOps for BinanceOps {
    fn uses_websocket(&self) -> bool {
        true
    }

    fn subscribe_message(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let params: Vec<String> = pairs.iter().map(stream_name).collect();
        let frame = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        });
        vec![Message::Text(frame.to_string())]
    }

    fn parse_frame(&self, frame: Frame) -> Vec<(String, TickerPrice)> {
        let Frame::Text(text) = frame else {
            return Vec::new();
        };
        let Ok(ticker) = serde_json::from_str::<BinanceTicker>(&text) else {
            return Vec::new();
        };
        match TickerPrice::parse(&ticker.last_price, &ticker.volume, Instant::now()) {
            Ok(tp) => vec![(ticker.symbol.to_ascii_uppercase(), tp)],
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
    fn available_pairs_accepts_only_native_stablecoin_quotes() {
        let ops = BinanceOps;
        let usdt = CurrencyPair::new("atom", "usdt");
        let eur = CurrencyPair::new("atom", "eur");
        let available = ops.available_pairs(&[usdt.clone(), eur]).unwrap();
        assert_eq!(available, vec![usdt]);
    }

    #[test]
    fn stream_name_is_lowercase_symbol_plus_ticker_suffix() {
        let pair = CurrencyPair::new("atom", "usdt");
        assert_eq!(stream_name(&pair), "atomusdt@ticker");
    }

    #[test]
    fn parses_ticker_frame() {
        let ops = BinanceOps;
        let frame = Frame::Text(r#"{"s":"ATOMUSDT","c":"12.34","v":"1000.5"}"#.to_string());
        let parsed = ops.parse_frame(frame);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "ATOMUSDT");
    }

    #[test]
    fn ignores_non_ticker_frames() {
        let ops = BinanceOps;
        let frame = Frame::Text(r#"{"result":null,"id":1}"#.to_string());
        assert!(ops.parse_frame(frame).is_empty());
    }
}
