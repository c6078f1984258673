//! Stdio transport: newline-delimited JSON-RPC over a byte stream pair.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};

use agentic_jsonrpc::{frame_message, parse_line};

use crate::protocol::CancellationToken;
use crate::types::{JsonRpcMessage, McpError, McpResult};

use super::{Transport, TransportEvent, TransportEvents};

/// Stdio transport for desktop MCP clients. Generic over the streams so the
/// same framing runs over pipes, sockets, or in-process duplex buffers.
pub struct StdioTransport<R = Stdin, W = Stdout> {
    reader: Mutex<Option<R>>,
    writer: tokio::sync::Mutex<W>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Reads from stdin, writes to stdout.
    pub fn new() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn with_streams(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self, events: TransportEvents) -> McpResult<()> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| McpError::Transport("transport already started".to_string()))?;
        let shutdown = self.shutdown.clone();

        tracing::info!("Stdio transport started");

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    read = reader.read_until(b'\n', &mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        tracing::info!("EOF on input, shutting down");
                        break;
                    }
                    Ok(_) => {
                        let event = match std::str::from_utf8(&buf) {
                            Ok(line) if line.trim().is_empty() => continue,
                            Ok(line) => match parse_line(line) {
                                Ok(value) => TransportEvent::Message(value),
                                Err(e) => {
                                    tracing::warn!("Parse error: {e}");
                                    TransportEvent::Error(e.into())
                                }
                            },
                            Err(e) => {
                                tracing::warn!("Dropping non-UTF-8 line: {e}");
                                TransportEvent::Error(McpError::ParseError(format!(
                                    "invalid UTF-8: {e}"
                                )))
                            }
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(McpError::Io(e)));
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed);
        });
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let framed = frame_message(&message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(framed.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Error shutting down output stream: {e}");
        }
        Ok(())
    }
}
