//! Target probe - waiting for the UI under test to answer

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Polls a deployed UI until it serves pages
pub struct TargetProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl TargetProbe {
    pub fn new(url: impl Into<String>) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            interval: PROBE_INTERVAL,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait until the target answers with a non-server-error status.
    /// Returns the number of attempts it took.
    pub async fn wait_until_reachable(&self, timeout: Duration) -> E2eResult<usize> {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.client.get(&self.url).send().await {
                Ok(resp) if !resp.status().is_server_error() => {
                    info!("Target {} is up ({})", self.url, resp.status());
                    return Ok(attempts);
                }
                Ok(resp) => {
                    warn!("Target returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for {} to come up...", self.url);
                    }
                    // Connection refused is expected while a deploy rolls out
                    if !e.is_connect() {
                        warn!("Probe error: {}", e);
                    }
                }
            }

            if start.elapsed() + self.interval > timeout {
                break;
            }
            sleep(self.interval).await;
        }

        Err(E2eError::TargetUnreachable {
            url: self.url.clone(),
            attempts,
        })
    }
}
