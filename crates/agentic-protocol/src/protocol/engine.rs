//! The protocol engine: one per connection, symmetric for both roles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::ProtocolOptions;
use crate::session::LogLevelRegistry;
use crate::transport::{Transport, TransportEvent};
use crate::types::*;

use super::cancellation::CancellationToken;
use super::handler::{
    raw_notification_handler, raw_request_handler, typed_notification_handler,
    typed_request_handler, BoxFuture, FallbackNotificationFn, FallbackRequestFn, HandlerRegistry,
    NotificationHandlerFn, NotificationRoute, RequestContext, RequestHandlerFn,
};
use super::negotiation::{CapabilityNegotiator, PeerInfo, Role};
use super::tracker::{Registration, RequestOptions, RequestTracker, TimeoutPolicy};

pub type ErrorCallback = Arc<dyn Fn(&McpError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

pub(crate) struct QueuedNotification {
    pub method: String,
    pub params: Option<Value>,
    pub route: NotificationRoute,
}

struct Link {
    transport: Arc<dyn Transport>,
    notifications: mpsc::UnboundedSender<QueuedNotification>,
}

#[derive(Default)]
struct Callbacks {
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

pub(crate) struct Inner {
    pub(crate) negotiator: CapabilityNegotiator,
    pub(crate) options: ProtocolOptions,
    pub(crate) info: Implementation,
    instructions: Mutex<Option<String>>,
    pub(crate) tracker: RequestTracker,
    pub(crate) handlers: Mutex<HandlerRegistry>,
    pub(crate) inbound: Mutex<HashMap<RequestId, CancellationToken>>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) log_levels: LogLevelRegistry,
    callbacks: Mutex<Callbacks>,
}

/// A JSON-RPC endpoint speaking MCP over one transport.
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl Protocol {
    pub fn new(
        role: Role,
        info: Implementation,
        capabilities: Capabilities,
        options: ProtocolOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unconnected);
        let inner = Arc::new(Inner {
            negotiator: CapabilityNegotiator::new(role, capabilities, &options),
            options,
            info,
            instructions: Mutex::new(None),
            tracker: RequestTracker::new(),
            handlers: Mutex::new(HandlerRegistry::default()),
            inbound: Mutex::new(HashMap::new()),
            state,
            link: Mutex::new(None),
            shutdown: CancellationToken::new(),
            log_levels: LogLevelRegistry::new(),
            callbacks: Mutex::new(Callbacks::default()),
        });
        let protocol = Self { inner };
        protocol.install_builtin_handlers();
        protocol
    }

    /// An initiating endpoint.
    pub fn client(info: Implementation, capabilities: Capabilities, options: ProtocolOptions) -> Self {
        Self::new(Role::Client, info, capabilities, options)
    }

    /// A responding endpoint.
    pub fn server(info: Implementation, capabilities: Capabilities, options: ProtocolOptions) -> Self {
        Self::new(Role::Server, info, capabilities, options)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn install_builtin_handlers(&self) {
        let mut handlers = self.inner.handlers.lock();
        handlers.set_request(
            Ping::METHOD,
            typed_request_handler::<Ping, _, _>(|_, _| async { Ok(EmptyResult {}) }),
        );

        if self.role() != Role::Server {
            return;
        }

        handlers.set_request(
            Initialize::METHOD,
            typed_request_handler::<Initialize, _, _>(|params, ctx| async move {
                Ok(ctx.peer().accept_initialize(params))
            }),
        );

        if self.inner.negotiator.local().supports("logging") {
            handlers.set_request(
                SetLevel::METHOD,
                typed_request_handler::<SetLevel, _, _>(|params, ctx| async move {
                    ctx.peer()
                        .inner
                        .log_levels
                        .set(ctx.session_id(), params.level);
                    tracing::debug!("Log level set to {:?}", params.level);
                    Ok(EmptyResult {})
                }),
            );
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.inner.negotiator.role()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn info(&self) -> &Implementation {
        &self.inner.info
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.inner.options
    }

    pub fn local_capabilities(&self) -> &Capabilities {
        self.inner.negotiator.local()
    }

    /// Absent until the handshake completes.
    pub fn peer_capabilities(&self) -> Option<Capabilities> {
        self.inner.negotiator.peer_capabilities()
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.inner.negotiator.peer()
    }

    /// Negotiated protocol revision, once agreed.
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.negotiator.peer().map(|p| p.protocol_version)
    }

    /// Instructions a responder returns from `initialize`.
    pub fn set_instructions(&self, instructions: impl Into<String>) {
        *self.inner.instructions.lock() = Some(instructions.into());
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&McpError) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().on_error = Some(Arc::new(callback));
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().on_close = Some(Arc::new(callback));
    }

    /// Wait for the handshake. Errors if the connection closes first.
    pub async fn ready(&self) -> McpResult<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
            .await
            .map_err(|_| McpError::ConnectionClosed)?;
        match state {
            ConnectionState::Ready => Ok(()),
            _ => Err(McpError::ConnectionClosed),
        }
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub(crate) fn accept_initialize(&self, params: InitializeParams) -> InitializeResult {
        let instructions = self.inner.instructions.lock().clone();
        self.inner
            .negotiator
            .accept_initialize(params, self.inner.info.clone(), instructions)
    }

    // ── Handler registration ─────────────────────────────────────────

    /// Register a typed request handler. Params failing to decode answer InvalidParams.
    pub fn set_request_handler<R, F, Fut>(&self, handler: F) -> McpResult<()>
    where
        R: Request,
        F: Fn(R::Params, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<R::Result>> + Send + 'static,
    {
        self.register_request(R::METHOD, typed_request_handler::<R, F, Fut>(handler))
    }

    /// Register a handler that sees params as raw JSON.
    pub fn set_raw_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        self.register_request(method, raw_request_handler(handler))
    }

    fn ensure_open(&self) -> McpResult<()> {
        match self.state() {
            ConnectionState::Closed => Err(McpError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    fn register_request(&self, method: &str, handler: RequestHandlerFn) -> McpResult<()> {
        self.ensure_open()?;
        self.inner.negotiator.assert_can_handle_request(method)?;
        if self.inner.handlers.lock().set_request(method, handler) {
            tracing::debug!("Replaced request handler for {method}");
        }
        Ok(())
    }

    pub fn remove_request_handler(&self, method: &str) -> bool {
        self.inner.handlers.lock().remove_request(method)
    }

    /// Serve any request method without a dedicated handler.
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        let handler: FallbackRequestFn = Arc::new(
            move |method: String,
                  params: Option<Value>,
                  ctx: RequestContext|
                  -> BoxFuture<McpResult<Value>> { Box::pin(handler(method, params, ctx)) },
        );
        self.inner
            .handlers
            .lock()
            .set_fallback_request(Some(handler));
    }

    pub fn remove_fallback_request_handler(&self) {
        self.inner.handlers.lock().set_fallback_request(None);
    }

    pub fn set_notification_handler<N, F, Fut>(&self, handler: F) -> McpResult<()>
    where
        N: Notification,
        F: Fn(N::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.register_notification(N::METHOD, typed_notification_handler::<N, F, Fut>(handler))
    }

    pub fn set_raw_notification_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.register_notification(method, raw_notification_handler(handler))
    }

    fn register_notification(&self, method: &str, handler: NotificationHandlerFn) -> McpResult<()> {
        self.ensure_open()?;
        if self.inner.handlers.lock().set_notification(method, handler) {
            tracing::debug!("Replaced notification handler for {method}");
        }
        Ok(())
    }

    pub fn remove_notification_handler(&self, method: &str) -> bool {
        self.inner.handlers.lock().remove_notification(method)
    }

    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        let handler: FallbackNotificationFn = Arc::new(
            move |method: String, params: Option<Value>| -> BoxFuture<McpResult<()>> {
                Box::pin(handler(method, params))
            },
        );
        self.inner
            .handlers
            .lock()
            .set_fallback_notification(Some(handler));
    }

    pub fn remove_fallback_notification_handler(&self) {
        self.inner.handlers.lock().set_fallback_notification(None);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach a transport and, as initiator, run the handshake to completion.
    ///
    /// A responder returns once the transport is live; use [`ready`](Self::ready)
    /// to wait for the initiator's `initialized`.
    pub async fn connect<T: Transport + 'static>(&self, transport: T) -> McpResult<()> {
        let claimed = self.inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Unconnected {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match self.state() {
                ConnectionState::Closed => McpError::ConnectionClosed,
                _ => McpError::AlreadyConnected,
            });
        }

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        *self.inner.link.lock() = Some(Link {
            transport: transport.clone(),
            notifications: queue_tx,
        });

        if let Err(e) = transport.start(event_tx).await {
            tracing::error!("Transport failed to start: {e}");
            let _ = self.close().await;
            return Err(e);
        }

        tokio::spawn(self.inner.clone().run_dispatch(event_rx));
        tokio::spawn(self.inner.clone().run_notification_worker(queue_rx));
        self.inner.advance(ConnectionState::Handshaking);
        tracing::debug!(role = ?self.role(), session = ?transport.session_id(), "Transport connected");

        if self.role() == Role::Client {
            if let Err(e) = self.handshake().await {
                tracing::error!("Handshake failed: {e}");
                let _ = self.close().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn handshake(&self) -> McpResult<()> {
        let params = InitializeParams {
            protocol_version: self.inner.options.latest_version().to_string(),
            capabilities: self.local_capabilities().clone(),
            client_info: self.inner.info.clone(),
        };
        let result = self
            .request::<Initialize>(params, RequestOptions::default())
            .await?;

        self.inner.negotiator.accept_version(&result.protocol_version)?;
        self.inner.negotiator.record_peer(PeerInfo {
            capabilities: result.capabilities,
            implementation: result.server_info,
            protocol_version: result.protocol_version,
            instructions: result.instructions,
        });

        self.notify::<Initialized>(EmptyParams {}).await?;
        self.inner.advance(ConnectionState::Ready);
        Ok(())
    }

    /// Close the connection. Idempotent.
    ///
    /// Pending outbound requests fail with ConnectionClosed and in-flight
    /// inbound handlers see their cancellation fire.
    pub async fn close(&self) -> McpResult<()> {
        let first = self.inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed {
                false
            } else {
                *s = ConnectionState::Closed;
                true
            }
        });
        if !first {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        let link = self.inner.link.lock().take();
        let result = match &link {
            Some(link) => link.transport.close().await,
            None => Ok(()),
        };
        drop(link);

        let rejected = self.inner.tracker.reject_all(|| McpError::ConnectionClosed);
        let inbound: Vec<CancellationToken> =
            self.inner.inbound.lock().drain().map(|(_, t)| t).collect();
        for token in inbound {
            token.cancel_with_reason("connection closed");
        }

        tracing::info!(rejected, "Connection closed");
        let on_close = self.inner.callbacks.lock().on_close.clone();
        if let Some(callback) = on_close {
            callback();
        }
        result
    }

    // ── Outbound traffic ─────────────────────────────────────────────

    /// Send a typed request and decode its result.
    pub async fn request<R: Request>(
        &self,
        params: R::Params,
        options: RequestOptions,
    ) -> McpResult<R::Result> {
        let params = serde_json::to_value(params)?;
        let value = self.request_raw(R::METHOD, Some(params), options).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::InvalidParams(format!("invalid {} result: {e}", R::METHOD)))
    }

    /// Send a request with raw JSON params and get the raw result back.
    pub async fn request_raw(
        &self,
        method: &str,
        mut params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        if method == Initialize::METHOD && options.cancellation.is_some() {
            return Err(McpError::NotCancellable(
                "initialize cannot be cancelled".to_string(),
            ));
        }
        let transport = self.inner.transport()?;
        self.inner.negotiator.assert_can_send_request(method)?;
        if let Some(token) = &options.cancellation {
            if token.is_cancelled() {
                return Err(McpError::Cancelled(cancel_reason(token)));
            }
        }

        let id = self.inner.tracker.next_id();
        if let Some((token, _)) = &options.progress {
            attach_progress_token(&mut params, token);
        }
        let policy = TimeoutPolicy::new(
            options.timeout.unwrap_or(self.inner.options.request_timeout),
            options.max_total_timeout,
            options.reset_timeout_on_progress,
            Instant::now(),
        );
        let Registration {
            mut response,
            mut deadline,
        } = self
            .inner
            .tracker
            .register(id.clone(), method, policy, options.progress.clone());
        let _guard = PendingGuard {
            inner: self.inner.clone(),
            id: id.clone(),
            method: method.to_string(),
        };

        tracing::debug!("Sending request {id} ({method})");
        if let Err(e) = transport
            .send(JsonRpcRequest::new(id.clone(), method, params).into())
            .await
        {
            self.inner.tracker.take(&id);
            self.inner.report_error(&e);
            return Err(e);
        }

        let cancellation = options.cancellation.clone();
        loop {
            let current = *deadline.borrow_and_update();
            tokio::select! {
                biased;
                outcome = &mut response => {
                    return outcome.unwrap_or(Err(McpError::ConnectionClosed));
                }
                changed = deadline.changed() => {
                    if changed.is_err() {
                        // Settled by someone else; the outcome is already on its way.
                        return (&mut response).await.unwrap_or(Err(McpError::ConnectionClosed));
                    }
                }
                _ = wait_cancelled(cancellation.as_ref()) => {
                    if self.inner.tracker.take(&id).is_none() {
                        return (&mut response).await.unwrap_or(Err(McpError::ConnectionClosed));
                    }
                    let reason = cancellation
                        .as_ref()
                        .map(cancel_reason)
                        .unwrap_or_default();
                    self.inner.send_cancelled(&id, method, &reason).await;
                    return Err(McpError::Cancelled(reason));
                }
                _ = tokio::time::sleep_until(current) => {
                    if let Some(err) = self.inner.tracker.expire(&id, Instant::now()) {
                        self.inner.send_cancelled(&id, method, &err.to_string()).await;
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Send a typed notification. Empty params are omitted from the wire.
    pub async fn notify<N: Notification>(&self, params: N::Params) -> McpResult<()> {
        let value = serde_json::to_value(params)?;
        let params = match &value {
            Value::Object(map) if map.is_empty() => None,
            _ => Some(value),
        };
        self.notify_raw(N::METHOD, params).await
    }

    pub async fn notify_raw(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.inner.send_notification(method, params).await
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.request::<Ping>(EmptyParams {}, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// Ask the responder to forward only log records at `level` or above.
    pub async fn set_logging_level(&self, level: LogLevel) -> McpResult<()> {
        self.request::<SetLevel>(SetLevelParams { level }, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// Forward a log record to the peer unless it is below the session's level.
    pub async fn send_logging_message(&self, params: LoggingMessageParams) -> McpResult<()> {
        let session = self.session_id();
        if self
            .inner
            .log_levels
            .is_ignored(params.level, session.as_deref())
        {
            tracing::trace!("Dropping {:?} log record below session level", params.level);
            return Ok(());
        }
        self.notify::<LoggingMessage>(params).await
    }
}

/// Drops the pending entry if the caller stops waiting early.
struct PendingGuard {
    inner: Arc<Inner>,
    id: RequestId,
    method: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.tracker.take(&self.id).is_none() {
            return;
        }
        tracing::debug!("Request {} ({}) abandoned by caller", self.id, self.method);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            let id = self.id.clone();
            let method = std::mem::take(&mut self.method);
            handle.spawn(async move {
                inner.send_cancelled(&id, &method, "request abandoned").await;
            });
        }
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn cancel_reason(token: &CancellationToken) -> String {
    token
        .reason()
        .unwrap_or_else(|| "cancelled by caller".to_string())
}

fn attach_progress_token(params: &mut Option<Value>, token: &ProgressToken) {
    let params = params.get_or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(map) = params else {
        tracing::warn!("Cannot attach progress token to non-object params");
        return;
    };
    let meta = map.entry("_meta").or_insert_with(|| json!({}));
    match meta {
        Value::Object(meta) => {
            meta.insert("progressToken".to_string(), json!(token));
        }
        _ => tracing::warn!("Cannot attach progress token: _meta is not an object"),
    }
}

impl Inner {
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed || *s == next {
                false
            } else {
                *s = next;
                true
            }
        })
    }

    pub(crate) fn mark_ready(&self) -> bool {
        self.advance(ConnectionState::Ready)
    }

    pub(crate) fn role(&self) -> Role {
        self.negotiator.role()
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.link
            .lock()
            .as_ref()
            .and_then(|link| link.transport.session_id())
    }

    fn transport(&self) -> McpResult<Arc<dyn Transport>> {
        match self.link.lock().as_ref() {
            Some(link) => Ok(link.transport.clone()),
            None if *self.state.borrow() == ConnectionState::Closed => {
                Err(McpError::ConnectionClosed)
            }
            None => Err(McpError::NotConnected),
        }
    }

    pub(crate) fn report_error(&self, error: &McpError) {
        tracing::warn!("Protocol error: {error}");
        let callback = self.callbacks.lock().on_error.clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    pub(crate) async fn send_message(&self, message: JsonRpcMessage) -> McpResult<()> {
        self.transport()?.send(message).await
    }

    /// Send a message, routing failures to the error callback.
    pub(crate) async fn send_or_report(&self, message: JsonRpcMessage) {
        if let Err(e) = self.send_message(message).await {
            self.report_error(&e);
        }
    }

    pub(crate) async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<()> {
        let transport = self.transport()?;
        self.negotiator.assert_can_send_notification(method)?;
        if let Err(e) = transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
        {
            self.report_error(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort `notifications/cancelled`; never sent for `initialize`.
    async fn send_cancelled(&self, id: &RequestId, method: &str, reason: &str) {
        if method == Initialize::METHOD {
            return;
        }
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("Could not encode cancellation for {id}: {e}");
                return;
            }
        };
        if let Err(e) = self.send_notification(Cancelled::METHOD, Some(params)).await {
            tracing::debug!("Could not notify peer of cancelled request {id}: {e}");
        }
    }

    pub(crate) fn enqueue_notification(&self, queued: QueuedNotification) {
        let sent = match self.link.lock().as_ref() {
            Some(link) => link.notifications.send(queued).is_ok(),
            None => false,
        };
        if !sent {
            tracing::debug!("Notification queue closed; dropping notification");
        }
    }

    async fn run_dispatch(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::Message(raw)) => self.handle_incoming(raw).await,
                Some(TransportEvent::Error(e)) => self.report_error(&e),
                Some(TransportEvent::Closed) | None => {
                    tracing::debug!("Transport reported closure");
                    if let Err(e) = Protocol::from_inner(self.clone()).close().await {
                        tracing::debug!("Error while closing transport: {e}");
                    }
                    break;
                }
            }
        }
    }

    /// Runs notification handlers one at a time, in arrival order.
    async fn run_notification_worker(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<QueuedNotification>,
    ) {
        while let Some(QueuedNotification {
            method,
            params,
            route,
        }) = queue.recv().await
        {
            let work = match route {
                NotificationRoute::Method(handler) => handler(params),
                NotificationRoute::Fallback(handler) => handler(method.clone(), params),
            };
            match tokio::spawn(work).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report_error(&McpError::InternalError(format!(
                    "notification handler for {method} failed: {e}"
                ))),
                Err(join) => self.report_error(&McpError::InternalError(format!(
                    "notification handler for {method} panicked: {join}"
                ))),
            }
        }
    }
}
