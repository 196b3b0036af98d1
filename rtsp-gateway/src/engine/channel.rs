//! Control channel adapters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ControlChannel, EngineError};

/// A raw message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

const LOOPBACK_HISTORY: usize = 4096;

/// In-memory channel: inbound messages are injected by the caller and
/// published messages are kept in a bounded history.
pub struct LoopbackChannel {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    published: Mutex<VecDeque<(String, Bytes)>>,
    connected: AtomicBool,
    fail_publishes: AtomicBool,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            published: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Deliver a message as if it arrived from the broker.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(InboundMessage::new(topic, payload));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Payloads published to exactly `topic`, oldest first.
    pub fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Most recent payload on `topic` parsed as JSON.
    pub fn last_json(&self, topic: &str) -> Option<serde_json::Value> {
        let published = self.published.lock();
        let (_, payload) = published.iter().rev().find(|(t, _)| t == topic)?;
        serde_json::from_slice(payload).ok()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), EngineError> {
        if self.fail_publishes.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::transient("control channel not connected"));
        }
        let mut published = self.published.lock();
        if published.len() == LOOPBACK_HISTORY {
            published.pop_front();
        }
        published.push_back((topic.to_string(), payload));
        Ok(())
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// One line written by [`StdioChannel`].
#[derive(Debug, Serialize, Deserialize)]
struct StdioEnvelope {
    topic: String,
    payload: serde_json::Value,
}

/// JSON-lines control channel over the process's stdin and stdout.
///
/// Every stdin line is delivered as a message on `command_topic`. Published
/// messages are written to stdout only for topics starting with one of the
/// echo prefixes, so periodic status does not flood the terminal.
pub struct StdioChannel {
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    stdout: tokio::sync::Mutex<tokio::io::Stdout>,
    echo_prefixes: Vec<String>,
    connected: Arc<AtomicBool>,
}

impl StdioChannel {
    /// Spawn the stdin reader. Must be called inside a runtime.
    pub fn spawn(command_topic: impl Into<String>, echo_prefixes: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let topic = command_topic.into();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        if tx.send(InboundMessage::new(&topic, line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read control input");
                        break;
                    }
                }
            }
        });

        Self {
            inbound_rx: tokio::sync::Mutex::new(rx),
            stdout: tokio::sync::Mutex::new(tokio::io::stdout()),
            echo_prefixes,
            connected,
        }
    }

    fn echoes(&self, topic: &str) -> bool {
        self.echo_prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }
}

#[async_trait]
impl ControlChannel for StdioChannel {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), EngineError> {
        if !self.echoes(topic) {
            return Ok(());
        }
        let payload = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&payload).into_owned()));
        let mut line = serde_json::to_vec(&StdioEnvelope {
            topic: topic.to_string(),
            payload,
        })
        .map_err(|e| EngineError::permanent(e.to_string()))?;
        line.push(b'\n');

        let mut stdout = self.stdout.lock().await;
        let written = async {
            stdout.write_all(&line).await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            self.connected.store(false, Ordering::SeqCst);
            return Err(EngineError::transient(format!("stdout write failed: {e}")));
        }
        Ok(())
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
