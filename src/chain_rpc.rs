//! The chain RPC/gRPC client boundary.
//!
//! Block-height polling, transaction signing/broadcast, and the gRPC client itself
//! are out of scope for this crate (SPEC_FULL.md 1, 6) - they are concrete,
//! chain-specific collaborators. This trait is the seam `ChainHeightTracker` and
//! `VoteScheduler` are built against; the concrete implementation lives outside
//! this crate. Mirrors the teacher's own `#[async_trait] trait ExecutionAdapter`
//! pattern (`src/vault/execution.rs`) for external-system adapters.

use crate::types::{OracleParams, OracleTx, TxResponse};

#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    /// Latest committed block height, per the node's `Status()` RPC.
    async fn status(&self) -> anyhow::Result<i64>;

    /// `x/oracle.Params()` gRPC query.
    async fn oracle_params(&self) -> anyhow::Result<OracleParams>;

    /// Broadcasts a prevote or vote transaction, giving it `timeout_blocks` blocks
    /// to land (SPEC_FULL.md 4.5: `2 * vote_period` for a prevote,
    /// `vote_period - index_in_period` for a vote).
    async fn broadcast_tx(&self, tx: OracleTx, timeout_blocks: u64) -> anyhow::Result<TxResponse>;
}

/// A minimal REST-based `ChainRpc` against a Tendermint RPC + LCD node.
///
/// Transaction signing and the Cosmos SDK's gRPC query client are explicitly
/// out of scope for this crate (SPEC_FULL.md 1/6) - this adapter only relays
/// already-built prevote/vote payloads to a configured broadcast endpoint
/// (e.g. a local signing sidecar) and reads plain JSON over HTTP, so it needs
/// nothing beyond the `reqwest` this crate already carries. It exists so
/// `src/bin/oracle.rs` has something concrete to construct; a real deployment
/// is expected to swap in its own `ChainRpc` impl backed by a proper Cosmos
/// SDK client.
pub mod http {
    use super::*;
    use serde::Deserialize;

    pub struct RestChainRpc {
        client: reqwest::Client,
        base_url: String,
    }

    impl RestChainRpc {
        pub fn new(base_url: String, timeout: std::time::Duration) -> anyhow::Result<Self> {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            Ok(Self { client, base_url })
        }
    }

    #[derive(Debug, Deserialize)]
    struct StatusResponse {
        result: StatusResult,
    }
    #[derive(Debug, Deserialize)]
    struct StatusResult {
        sync_info: SyncInfo,
    }
    #[derive(Debug, Deserialize)]
    struct SyncInfo {
        latest_block_height: String,
    }

    #[derive(Debug, Deserialize)]
    struct ParamsResponse {
        vote_period: u64,
        whitelist: Vec<String>,
        reward_band: rust_decimal::Decimal,
    }

    #[async_trait::async_trait]
    impl ChainRpc for RestChainRpc {
        async fn status(&self) -> anyhow::Result<i64> {
            let resp: StatusResponse = self
                .client
                .get(format!("{}/status", self.base_url))
                .send()
                .await?
                .json()
                .await?;
            Ok(resp.result.sync_info.latest_block_height.parse()?)
        }

        async fn oracle_params(&self) -> anyhow::Result<OracleParams> {
            let resp: ParamsResponse = self
                .client
                .get(format!("{}/oracle/params", self.base_url))
                .send()
                .await?
                .json()
                .await?;
            Ok(OracleParams {
                vote_period: resp.vote_period,
                whitelist: resp.whitelist,
                reward_band: resp.reward_band,
            })
        }

        async fn broadcast_tx(&self, tx: OracleTx, timeout_blocks: u64) -> anyhow::Result<TxResponse> {
            let body = serde_json::json!({
                "tx": match &tx {
                    OracleTx::Prevote { hash, feeder, validator } => serde_json::json!({
                        "type": "prevote", "hash": hash, "feeder": feeder, "validator": validator,
                    }),
                    OracleTx::Vote { salt, exchange_rates, feeder, validator } => serde_json::json!({
                        "type": "vote", "salt": salt, "exchange_rates": exchange_rates,
                        "feeder": feeder, "validator": validator,
                    }),
                },
                "timeout_blocks": timeout_blocks,
            });

            let resp: serde_json::Value = self
                .client
                .post(format!("{}/oracle/broadcast", self.base_url))
                .json(&body)
                .send()
                .await?
                .json()
                .await?;

            Ok(TxResponse {
                code: resp.get("code").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                raw_log: resp
                    .get("raw_log")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use parking_lot::Mutex;

    /// A fake chain RPC client for tests, grounded on the same kind of in-memory
    /// fake the teacher uses for its `PaperExecutionAdapter`.
    pub struct FakeChainRpc {
        pub height: Mutex<i64>,
        pub params: OracleParams,
        pub broadcasts: Mutex<Vec<OracleTx>>,
        pub fail_status: bool,
    }

    impl FakeChainRpc {
        pub fn new(height: i64, params: OracleParams) -> Self {
            Self {
                height: Mutex::new(height),
                params,
                broadcasts: Mutex::new(Vec::new()),
                fail_status: false,
            }
        }

        pub fn set_height(&self, height: i64) {
            *self.height.lock() = height;
        }
    }

    #[async_trait::async_trait]
    impl ChainRpc for FakeChainRpc {
        async fn status(&self) -> anyhow::Result<i64> {
            if self.fail_status {
                anyhow::bail!("rpc unreachable");
            }
            Ok(*self.height.lock())
        }

        async fn oracle_params(&self) -> anyhow::Result<OracleParams> {
            Ok(self.params.clone())
        }

        async fn broadcast_tx(
            &self,
            tx: OracleTx,
            _timeout_blocks: u64,
        ) -> anyhow::Result<TxResponse> {
            self.broadcasts.lock().push(tx);
            Ok(TxResponse {
                code: 0,
                raw_log: String::new(),
            })
        }
    }
}
