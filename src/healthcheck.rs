//! Reveal-time healthcheck pings (`healthchecksPing` in
//! `examples/original_source/oracle/oracle.go`). Fired once per successful
//! vote broadcast, each target probed concurrently with its own configured
//! timeout and a warn-on-failure log; a failing healthcheck never fails the
//! vote itself. Concurrent-fan-out-with-per-target-client shape follows the
//! teacher's `src/route_quality/prober.rs`.

use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HealthcheckPinger {
    targets: Vec<(String, Duration)>,
}

impl HealthcheckPinger {
    pub fn new(targets: Vec<(String, Duration)>) -> Self {
        Self { targets }
    }

    pub async fn ping_all(&self) {
        if self.targets.is_empty() {
            return;
        }
        info!(count = self.targets.len(), "updating healthcheck status");

        let pings = self.targets.iter().map(|(url, timeout)| {
            let url = url.clone();
            let timeout = *timeout;
            async move {
                let client = match Client::builder().timeout(timeout).build() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(url, error = %e, "failed to build healthcheck client");
                        return;
                    }
                };
                if let Err(e) = client.get(&url).send().await {
                    warn!(url, error = %e, "healthcheck ping failed");
                }
            }
        });

        futures_util::future::join_all(pings).await;
    }
}
