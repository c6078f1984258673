//! Outbound request tracking: id allocation, correlation, timeouts, progress.
//!
//! Every settlement path (response, error response, timeout, cancellation,
//! connection closure, dropped caller) goes through removal from the pending
//! table. Whoever removes an entry owns its outcome; everyone else finds
//! nothing and backs off, which is what makes resolution at-most-once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::types::{McpError, McpResult, ProgressParams, ProgressToken, RequestId};

use super::cancellation::CancellationToken;

/// Invoked for each progress notification correlated to a request.
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Per-call options for an outbound request.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the connection's default timeout.
    pub timeout: Option<Duration>,
    /// Restart the timeout window on every correlated progress notification.
    pub reset_timeout_on_progress: bool,
    /// Absolute ceiling measured from send time; never extended by progress.
    pub max_total_timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    pub progress: Option<(ProgressToken, ProgressCallback)>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("cancellation", &self.cancellation.is_some())
            .field("progress_token", &self.progress.as_ref().map(|(t, _)| t))
            .finish()
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reset the timeout on progress, but never past `max_total`.
    pub fn reset_on_progress(mut self, max_total: Duration) -> Self {
        self.reset_timeout_on_progress = true;
        self.max_total_timeout = Some(max_total);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_progress<F>(mut self, token: impl Into<ProgressToken>, callback: F) -> Self
    where
        F: Fn(ProgressParams) + Send + Sync + 'static,
    {
        self.progress = Some((token.into(), Arc::new(callback)));
        self
    }
}

/// Deadline bookkeeping for one request.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub started: Instant,
    pub ceiling: Option<Instant>,
    pub reset_on_progress: bool,
}

fn add(at: Instant, d: Duration) -> Instant {
    at.checked_add(d).unwrap_or_else(|| at + FAR_FUTURE)
}

impl TimeoutPolicy {
    pub fn new(
        base: Duration,
        max_total: Option<Duration>,
        reset_on_progress: bool,
        started: Instant,
    ) -> Self {
        Self {
            base,
            started,
            ceiling: max_total.map(|m| add(started, m)),
            reset_on_progress,
        }
    }

    fn cap(&self, at: Instant) -> Instant {
        match self.ceiling {
            Some(ceiling) => at.min(ceiling),
            None => at,
        }
    }

    pub fn initial_deadline(&self) -> Instant {
        self.cap(add(self.started, self.base))
    }

    /// Deadline after progress observed at `now`.
    pub fn reset_deadline(&self, now: Instant) -> Instant {
        self.cap(add(now, self.base))
    }

    pub fn ceiling_reached(&self, now: Instant) -> bool {
        self.ceiling.is_some_and(|c| now >= c)
    }
}

struct PendingRequest {
    method: String,
    responder: oneshot::Sender<McpResult<Value>>,
    progress: Option<(ProgressToken, ProgressCallback)>,
    policy: TimeoutPolicy,
    deadline: Instant,
    deadline_tx: watch::Sender<Instant>,
}

#[derive(Default)]
struct TrackerState {
    pending: HashMap<RequestId, PendingRequest>,
    by_token: HashMap<ProgressToken, RequestId>,
}

impl TrackerState {
    fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        let entry = self.pending.remove(id)?;
        if let Some((token, _)) = &entry.progress {
            if self.by_token.get(token) == Some(id) {
                self.by_token.remove(token);
            }
        }
        Some(entry)
    }
}

/// Handles the caller keeps while its request is in flight.
pub struct Registration {
    pub response: oneshot::Receiver<McpResult<Value>>,
    /// Current deadline; closes once the entry leaves the table.
    pub deadline: watch::Receiver<Instant>,
}

/// The pending-request table for one connection.
#[derive(Default)]
pub struct RequestTracker {
    next_id: AtomicI64,
    state: Mutex<TrackerState>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next outbound id. Ids are never reused within a connection.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        policy: TimeoutPolicy,
        progress: Option<(ProgressToken, ProgressCallback)>,
    ) -> Registration {
        let (responder, response) = oneshot::channel();
        let deadline = policy.initial_deadline();
        let (deadline_tx, deadline_rx) = watch::channel(deadline);

        let mut state = self.state.lock();
        if let Some((token, _)) = &progress {
            if let Some(previous) = state.by_token.insert(token.clone(), id.clone()) {
                tracing::warn!(
                    "Progress token {token} moved from request {previous} to request {id}"
                );
            }
        }
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                responder,
                progress,
                policy,
                deadline,
                deadline_tx,
            },
        );

        Registration {
            response,
            deadline: deadline_rx,
        }
    }

    /// Settle a request with an inbound outcome. False if nothing was pending under `id`.
    pub fn resolve(&self, id: &RequestId, outcome: McpResult<Value>) -> bool {
        let entry = self.state.lock().remove(id);
        match entry {
            Some(entry) => {
                tracing::trace!("Resolved request {id} ({})", entry.method);
                // The caller may have gone away; that is not an error here.
                let _ = entry.responder.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without delivering anything; returns its method.
    pub fn take(&self, id: &RequestId) -> Option<String> {
        self.state.lock().remove(id).map(|entry| entry.method)
    }

    /// Time out `id` if its deadline has passed by `now`.
    pub fn expire(&self, id: &RequestId, now: Instant) -> Option<McpError> {
        let mut state = self.state.lock();
        let entry = state.pending.get(id)?;
        if now < entry.deadline {
            return None;
        }
        let entry = state.remove(id)?;
        let elapsed = now.saturating_duration_since(entry.policy.started);
        tracing::debug!("Request {id} ({}) timed out after {elapsed:?}", entry.method);
        Some(McpError::RequestTimeout { elapsed })
    }

    /// Route a progress notification. False when no pending request owns the token.
    pub fn progress(&self, params: &ProgressParams, now: Instant) -> bool {
        let callback = {
            let mut state = self.state.lock();
            let Some(id) = state.by_token.get(&params.progress_token).cloned() else {
                return false;
            };
            let Some(entry) = state.pending.get_mut(&id) else {
                state.by_token.remove(&params.progress_token);
                return false;
            };

            if entry.policy.reset_on_progress {
                if entry.policy.ceiling_reached(now) {
                    // Pull the deadline in; the caller's timer expires the
                    // request and notifies the peer.
                    tracing::debug!("Progress for request {id} after its ceiling");
                    entry.deadline = entry.deadline.min(now);
                    entry.deadline_tx.send_replace(entry.deadline);
                    return true;
                }
                entry.deadline = entry.policy.reset_deadline(now);
                entry.deadline_tx.send_replace(entry.deadline);
            }

            entry.progress.as_ref().map(|(_, cb)| cb.clone())
        };

        if let Some(callback) = callback {
            callback(params.clone());
        }
        true
    }

    /// Reject everything still pending, e.g. on connection closure.
    pub fn reject_all(&self, make_error: impl Fn() -> McpError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock();
            state.by_token.clear();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
