//! Handler registry: method name to request/notification handler, plus fallbacks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::types::{
    McpError, McpResult, Notification, Progress, ProgressParams, ProgressToken, Request,
    RequestId, RequestMeta,
};

use super::cancellation::CancellationToken;
use super::engine::Protocol;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) type RequestHandlerFn =
    Arc<dyn Fn(Option<Value>, RequestContext) -> BoxFuture<McpResult<Value>> + Send + Sync>;
pub(crate) type FallbackRequestFn = Arc<
    dyn Fn(String, Option<Value>, RequestContext) -> BoxFuture<McpResult<Value>> + Send + Sync,
>;
pub(crate) type NotificationHandlerFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<McpResult<()>> + Send + Sync>;
pub(crate) type FallbackNotificationFn =
    Arc<dyn Fn(String, Option<Value>) -> BoxFuture<McpResult<()>> + Send + Sync>;

pub(crate) enum RequestRoute {
    Method(RequestHandlerFn),
    Fallback(FallbackRequestFn),
}

pub(crate) enum NotificationRoute {
    Method(NotificationHandlerFn),
    Fallback(FallbackNotificationFn),
}

/// Registered handlers for one engine. Replacing a handler is allowed.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    requests: HashMap<String, RequestHandlerFn>,
    notifications: HashMap<String, NotificationHandlerFn>,
    fallback_request: Option<FallbackRequestFn>,
    fallback_notification: Option<FallbackNotificationFn>,
}

impl HandlerRegistry {
    /// Returns true if an existing handler was replaced.
    pub fn set_request(&mut self, method: &str, handler: RequestHandlerFn) -> bool {
        self.requests.insert(method.to_string(), handler).is_some()
    }

    pub fn remove_request(&mut self, method: &str) -> bool {
        self.requests.remove(method).is_some()
    }

    pub fn set_notification(&mut self, method: &str, handler: NotificationHandlerFn) -> bool {
        self.notifications
            .insert(method.to_string(), handler)
            .is_some()
    }

    pub fn remove_notification(&mut self, method: &str) -> bool {
        self.notifications.remove(method).is_some()
    }

    pub fn set_fallback_request(&mut self, handler: Option<FallbackRequestFn>) {
        self.fallback_request = handler;
    }

    pub fn set_fallback_notification(&mut self, handler: Option<FallbackNotificationFn>) {
        self.fallback_notification = handler;
    }

    pub fn route_request(&self, method: &str) -> Option<RequestRoute> {
        self.requests
            .get(method)
            .cloned()
            .map(RequestRoute::Method)
            .or_else(|| self.fallback_request.clone().map(RequestRoute::Fallback))
    }

    pub fn route_notification(&self, method: &str) -> Option<NotificationRoute> {
        self.notifications
            .get(method)
            .cloned()
            .map(NotificationRoute::Method)
            .or_else(|| {
                self.fallback_notification
                    .clone()
                    .map(NotificationRoute::Fallback)
            })
    }
}

/// Decode params against a serde schema. Absent params decode as `{}`.
pub(crate) fn decode_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> McpResult<T> {
    serde_json::from_value(params.unwrap_or_else(|| Value::Object(Map::new())))
        .map_err(|e| McpError::InvalidParams(format!("{method}: {e}")))
}

pub(crate) fn typed_request_handler<R, F, Fut>(handler: F) -> RequestHandlerFn
where
    R: Request,
    F: Fn(R::Params, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<R::Result>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |params: Option<Value>, ctx: RequestContext| -> BoxFuture<McpResult<Value>> {
        let handler = handler.clone();
        Box::pin(async move {
            let params: R::Params = decode_params(R::METHOD, params)?;
            let result = handler(params, ctx).await?;
            serde_json::to_value(result).map_err(|e| McpError::InternalError(e.to_string()))
        })
    })
}

pub(crate) fn raw_request_handler<F, Fut>(handler: F) -> RequestHandlerFn
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    Arc::new(
        move |params: Option<Value>, ctx: RequestContext| -> BoxFuture<McpResult<Value>> {
            Box::pin(handler(params, ctx))
        },
    )
}

pub(crate) fn typed_notification_handler<N, F, Fut>(handler: F) -> NotificationHandlerFn
where
    N: Notification,
    F: Fn(N::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |params: Option<Value>| -> BoxFuture<McpResult<()>> {
        let handler = handler.clone();
        Box::pin(async move {
            let params: N::Params = decode_params(N::METHOD, params)?;
            handler(params).await
        })
    })
}

pub(crate) fn raw_notification_handler<F, Fut>(handler: F) -> NotificationHandlerFn
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<()>> + Send + 'static,
{
    Arc::new(move |params: Option<Value>| -> BoxFuture<McpResult<()>> {
        Box::pin(handler(params))
    })
}

/// Everything a request handler can see about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    method: String,
    session_id: Option<String>,
    meta: Option<RequestMeta>,
    cancellation: CancellationToken,
    peer: Protocol,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        method: String,
        session_id: Option<String>,
        meta: Option<RequestMeta>,
        cancellation: CancellationToken,
        peer: Protocol,
    ) -> Self {
        Self {
            request_id,
            method,
            session_id,
            meta,
            cancellation,
            peer,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn meta(&self) -> Option<&RequestMeta> {
        self.meta.as_ref()
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.meta.as_ref().and_then(|m| m.progress_token.as_ref())
    }

    /// Fires when the peer cancels this request or the connection closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The engine serving this request, for nested requests and notifications.
    pub fn peer(&self) -> &Protocol {
        &self.peer
    }

    /// Report progress if the caller supplied a progress token; a no-op otherwise.
    pub async fn send_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<()> {
        let Some(token) = self.progress_token().cloned() else {
            return Ok(());
        };
        self.peer
            .notify::<Progress>(ProgressParams {
                progress_token: token,
                progress,
                total,
                message,
            })
            .await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
