//! Pushed experiment updates over Socket.IO
//!
//! The API broadcasts `ExperimentUpdates-<experimentId>` events while
//! pipeline stages run. This module speaks just enough Engine.IO v4 over a
//! websocket to receive them:
//!
//! ```text
//! server: 0{"sid":...}          open        -> client: 40   (namespace connect)
//! server: 2                     ping        -> client: 3    (pong)
//! server: 42["ExperimentUpdates-e1",{...}]  -> StatusUpdate
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::pipeline::{status_from_backend, JobId, JobStatus, PipelineStage, StatusUpdate};
use crate::waiter::StatusSource;

const EVENT_PREFIX: &str = "ExperimentUpdates-";

/// One decoded Engine.IO frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open,
    Close,
    Ping,
    /// Socket.IO event payload (the JSON array after `42`)
    Event(String),
    Other,
}

pub fn decode_frame(text: &str) -> Frame {
    match text.as_bytes().first() {
        Some(b'0') => Frame::Open,
        Some(b'1') => Frame::Close,
        Some(b'2') => Frame::Ping,
        Some(b'4') if text.starts_with("42") => {
            // Optional ack id between the packet type and the payload
            let payload = text[2..].trim_start_matches(|c: char| c.is_ascii_digit());
            Frame::Event(payload.to_string())
        }
        _ => Frame::Other,
    }
}

/// Decode an event payload into a status update, if it is one
pub fn decode_event(payload: &str) -> Option<StatusUpdate> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let items = value.as_array()?;

    let experiment_id = items.first()?.as_str()?.strip_prefix(EVENT_PREFIX)?;
    let data = items.get(1)?;
    let stage = PipelineStage::from_update_type(data.get("type")?.as_str()?)?;
    let status = status_from_backend(data.get("status")?, stage);

    Some(StatusUpdate {
        job: JobId::new(experiment_id, stage),
        status,
    })
}

/// Engine.IO websocket URL for an API base URL
pub fn socket_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/socket.io/?EIO=4&transport=websocket", base)
}

/// Live feed of experiment status updates
pub struct StatusFeed {
    tx: broadcast::Sender<StatusUpdate>,
    latest: Arc<RwLock<HashMap<JobId, JobStatus>>>,
    reader: JoinHandle<()>,
}

impl StatusFeed {
    /// Connect and start reading. An empty `experiment_ids` accepts all.
    pub async fn connect(base_url: &str, experiment_ids: &[String]) -> E2eResult<Self> {
        let url = socket_endpoint(base_url);
        info!("Connecting to experiment updates at {}", url);

        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let (tx, _) = broadcast::channel(64);
        let latest = Arc::new(RwLock::new(HashMap::new()));
        let wanted: Vec<String> = experiment_ids.to_vec();

        let reader_tx = tx.clone();
        let reader_latest = Arc::clone(&latest);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let reply = match msg {
                    Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                        Frame::Open => Some(Message::text("40".to_string())),
                        Frame::Ping => Some(Message::text("3".to_string())),
                        Frame::Close => break,
                        Frame::Event(payload) => {
                            if let Some(update) = decode_event(&payload) {
                                if wanted.is_empty() || wanted.contains(&update.job.experiment_id) {
                                    debug!(job = %update.job, status = %update.status, "Status pushed");
                                    reader_latest
                                        .write()
                                        .await
                                        .insert(update.job.clone(), update.status.clone());
                                    // No subscribers is fine; `latest` keeps the value
                                    let _ = reader_tx.send(update);
                                }
                            }
                            None
                        }
                        Frame::Other => None,
                    },
                    Ok(Message::Ping(data)) => Some(Message::Pong(data)),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Experiment update socket failed: {}", e);
                        break;
                    }
                };

                if let Some(reply) = reply {
                    if let Err(e) = write.send(reply).await {
                        warn!("Failed to answer experiment update socket: {}", e);
                        break;
                    }
                }
            }
            info!("Experiment update socket closed");
        });

        Ok(Self { tx, latest, reader })
    }

    /// Sender to hand to [`crate::waiter::CompletionWaiter::with_updates`]
    pub fn sender(&self) -> broadcast::Sender<StatusUpdate> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for StatusFeed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Last pushed status; jobs never heard of are reported as not created
#[async_trait]
impl StatusSource for StatusFeed {
    async fn status(&self, job: &JobId) -> E2eResult<JobStatus> {
        if let Some(status) = self.latest.read().await.get(job) {
            return Ok(status.clone());
        }
        if !self.is_connected() {
            return Err(E2eError::Socket(format!(
                "update socket closed before any status for {}",
                job
            )));
        }
        Ok(JobStatus::NotCreated)
    }
}
