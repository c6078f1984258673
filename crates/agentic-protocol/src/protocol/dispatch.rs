//! Inbound routing: responses to the tracker, requests to handlers,
//! notifications to the engine or the ordered worker queue.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use crate::types::*;

use super::cancellation::CancellationToken;
use super::engine::{Inner, Protocol, QueuedNotification};
use super::handler::{decode_params, RequestContext, RequestRoute};
use super::negotiation::Role;

impl Inner {
    pub(crate) async fn handle_incoming(self: &Arc<Self>, raw: Value) {
        let message = match agentic_jsonrpc::classify(raw) {
            Ok(message) => message,
            Err(e) => {
                self.report_error(&McpError::from(e));
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
            JsonRpcMessage::Response(response) => {
                self.handle_response(response.id, Ok(response.result))
            }
            JsonRpcMessage::Error(error) => {
                self.handle_response(error.id, Err(McpError::from(error.error)))
            }
        }
    }

    fn handle_response(&self, id: RequestId, outcome: McpResult<Value>) {
        if !self.tracker.resolve(&id, outcome) {
            tracing::warn!("Dropping response for unknown request id {id}");
        }
    }

    async fn handle_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        if method.is_empty() {
            let err = McpError::InvalidRequest("Method name must not be empty".to_string());
            self.send_or_report(err.to_json_rpc_error(id).into()).await;
            return;
        }

        let route = self.handlers.lock().route_request(&method);
        let Some(route) = route else {
            tracing::debug!("No handler for {method}");
            self.send_or_report(McpError::MethodNotFound(method).to_json_rpc_error(id).into())
                .await;
            return;
        };

        let token = CancellationToken::new();
        if self
            .inbound
            .lock()
            .insert(id.clone(), token.clone())
            .is_some()
        {
            tracing::warn!("Peer reused in-flight request id {id}");
        }

        let ctx = RequestContext::new(
            id.clone(),
            method.clone(),
            self.session_id(),
            RequestMeta::from_params(params.as_ref()),
            token.clone(),
            Protocol::from_inner(self.clone()),
        );
        let inner = self.clone();

        tokio::spawn(async move {
            let work = match route {
                RequestRoute::Method(handler) => handler(params, ctx),
                RequestRoute::Fallback(handler) => handler(method.clone(), params, ctx),
            };
            // A panicking handler must not take the connection down with it.
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(join) => Err(McpError::InternalError(format!(
                    "handler for {method} failed: {join}"
                ))),
            };

            {
                let mut inbound = inner.inbound.lock();
                if inbound.get(&id).is_some_and(|t| t.same_as(&token)) {
                    inbound.remove(&id);
                }
            }

            if token.is_cancelled() {
                tracing::debug!("Request {id} ({method}) was cancelled; not responding");
                return;
            }

            let message: JsonRpcMessage = match outcome {
                Ok(result) => JsonRpcResponse::new(id, result).into(),
                Err(e) => {
                    tracing::debug!("Handler for {method} returned error: {e}");
                    e.to_json_rpc_error(id).into()
                }
            };
            inner.send_or_report(message).await;
        });
    }

    fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let JsonRpcNotification { method, params, .. } = notification;

        match method.as_str() {
            m if m == Cancelled::METHOD => return self.handle_cancelled(params),
            m if m == Progress::METHOD => return self.handle_progress(params),
            m if m == Initialized::METHOD => self.handle_initialized(),
            _ => {}
        }

        let route = self.handlers.lock().route_notification(&method);
        match route {
            Some(route) => self.enqueue_notification(QueuedNotification {
                method,
                params,
                route,
            }),
            None => tracing::debug!("Dropping notification {method} with no handler"),
        }
    }

    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams = match decode_params(Cancelled::METHOD, params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Ignoring malformed cancellation: {e}");
                return;
            }
        };

        let token = self.inbound.lock().get(&params.request_id).cloned();
        match token {
            Some(token) => {
                let reason = params
                    .reason
                    .unwrap_or_else(|| "cancelled by peer".to_string());
                tracing::debug!("Peer cancelled request {}: {reason}", params.request_id);
                token.cancel_with_reason(reason);
            }
            None => tracing::debug!(
                "Cancellation for unknown or finished request {}",
                params.request_id
            ),
        }
    }

    fn handle_progress(&self, params: Option<Value>) {
        let params: ProgressParams = match decode_params(Progress::METHOD, params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Ignoring malformed progress: {e}");
                return;
            }
        };
        if !self.tracker.progress(&params, Instant::now()) {
            tracing::debug!("Progress for unknown token {}", params.progress_token);
        }
    }

    fn handle_initialized(&self) {
        if self.role() != Role::Server {
            tracing::warn!("Unexpected {} from a responder", Initialized::METHOD);
            return;
        }
        if self.mark_ready() {
            tracing::info!("Handshake complete");
        }
    }
}
