//! In-process transport pair for embedding and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::CancellationToken;
use crate::types::{JsonRpcMessage, McpError, McpResult};

use super::{Transport, TransportEvent, TransportEvents};

/// One end of an in-memory pipe. Values cross as `serde_json::Value`.
pub struct InMemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    closed: CancellationToken,
    session_id: String,
}

impl InMemoryTransport {
    /// Two connected ends sharing one session id.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let session_id = uuid::Uuid::new_v4().to_string();
        (
            Self::new(b_tx, a_rx, session_id.clone()),
            Self::new(a_tx, b_rx, session_id),
        )
    }

    fn new(
        outbound: mpsc::UnboundedSender<Value>,
        inbound: mpsc::UnboundedReceiver<Value>,
        session_id: String,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            closed: CancellationToken::new(),
            session_id,
        }
    }

    /// Push an arbitrary JSON value to the peer, bypassing message typing.
    pub fn send_value(&self, value: Value) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(McpError::ConnectionClosed);
        };
        tx.send(value)
            .map_err(|_| McpError::Transport("in-memory peer is gone".to_string()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self, events: TransportEvents) -> McpResult<()> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| McpError::Transport("transport already started".to_string()))?;
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                let value = tokio::select! {
                    _ = closed.cancelled() => break,
                    value = inbound.recv() => value,
                };
                match value {
                    Some(value) => {
                        if events.send(TransportEvent::Message(value)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            let _ = events.send(TransportEvent::Closed);
        });
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        let value = serde_json::to_value(&message)?;
        self.send_value(value)
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.cancel();
        self.outbound.lock().take();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
}
