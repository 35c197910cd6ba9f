//! OKX wire format: `tickers` channel over a single public websocket.
//!
//! Subscribe frames are `{"op":"subscribe","args":[{"channel":"tickers","instId":"ATOM-USDT"}]}`;
//! updates arrive as `{"arg":{"instId":...},"data":[{"last":"...","vol24h":"..."}]}`.

use std::time::Instant;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::provider::ProviderOps;
use crate::types::{CurrencyPair, TickerPrice};
use crate::ws_session::Frame;

pub struct OkxOps;

/// OKX spot markets quote almost exclusively against USDT/USDC; it does not
/// list fiat-USD pairs.
const NATIVE_QUOTES: &[&str] = &["USDT", "USDC"];

fn inst_id(pair: &CurrencyPair) -> String {
    pair.join("-")
}

#[derive(Debug, Deserialize)]
struct OkxArg {
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct OkxTickerData {
    last: String,
    #[serde(rename = "vol24h")]
    vol_24h: String,
}

#[derive(Debug, Deserialize)]
struct OkxMessage {
    arg: OkxArg,
    data: Vec<OkxTickerData>,
}

impl ProviderOps for OkxOps {
    fn uses_websocket(&self) -> bool {
        true
    }

    fn subscribe_message(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let args: Vec<serde_json::Value> = pairs
            .iter()
            .map(|p| serde_json::json!({"channel": "tickers", "instId": inst_id(p)}))
            .collect();
        let frame = serde_json::json!({"op": "subscribe", "args": args});
        vec![Message::Text(frame.to_string())]
    }

    fn parse_frame(&self, frame: Frame) -> Vec<(String, TickerPrice)> {
        let Frame::Text(text) = frame else {
            return Vec::new();
        };
        let Ok(msg) = serde_json::from_str::<OkxMessage>(&text) else {
            return Vec::new();
        };
        let symbol = msg.arg.inst_id.replace('-', "").to_ascii_uppercase();
        msg.data
            .into_iter()
            .filter_map(|d| {
                TickerPrice::parse(&d.last, &d.vol_24h, Instant::now())
                    .ok()
                    .map(|tp| (symbol.clone(), tp))
            })
            .collect()
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
        let ops = OkxOps;
        let usdt = CurrencyPair::new("atom", "usdt");
        let usd = CurrencyPair::new("atom", "usd");
        let available = ops.available_pairs(&[usdt.clone(), usd]).unwrap();
        assert_eq!(available, vec![usdt]);
    }

    #[test]
    fn inst_id_uses_dash_separator() {
        let pair = CurrencyPair::new("atom", "usdt");
        assert_eq!(inst_id(&pair), "ATOM-USDT");
    }

    #[test]
    fn parses_ticker_channel_frame() {
        let ops = OkxOps;
        let frame = Frame::Text(
            r#"{"arg":{"channel":"tickers","instId":"ATOM-USDT"},"data":[{"last":"12.34","vol24h":"1000"}]}"#
                .to_string(),
        );
        let parsed = ops.parse_frame(frame);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "ATOMUSDT");
    }
}
