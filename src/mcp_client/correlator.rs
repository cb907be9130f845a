//! Request correlation: matches responses to callers by JSON-RPC id.
//!
//! One `Correlator` belongs to one transport instance. Ids start at 1 and
//! are never reused for the lifetime of that instance. Each pending entry is
//! removed exactly once: on response, on timeout, or on teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::JsonRpcResponse;

type Reply = oneshot::Sender<Result<serde_json::Value, McpError>>;

/// A request awaiting its response.
struct PendingRequest {
    method: String,
    reply: Reply,
}

/// Handle returned by `register`; resolved via `Correlator::wait`.
///
/// Dropping the handle removes its entry, so a caller that gives up early
/// (an outer timeout, a lost `select!` branch) does not leave it behind.
pub struct PendingHandle<'a> {
    pub id: u64,
    method: String,
    rx: oneshot::Receiver<Result<serde_json::Value, McpError>>,
    correlator: &'a Correlator,
}

impl Drop for PendingHandle<'_> {
    fn drop(&mut self) {
        // Ids are never reused, so this is a no-op once the entry is gone.
        if self.correlator.cancel(self.id) {
            tracing::debug!(
                server = %self.correlator.server,
                id = self.id,
                method = %self.method,
                "request abandoned by caller"
            );
        }
    }
}

/// Per-transport request bookkeeping.
pub struct Correlator {
    server: String,
    next_id: AtomicU64,
    open: AtomicBool,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Correlator {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Accept new requests (called once the channel is usable).
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Allocate an id and register a pending entry for it.
    pub fn register(&self, method: &str) -> Result<PendingHandle<'_>, McpError> {
        let mut pending = self.lock();
        if !self.open.load(Ordering::SeqCst) {
            return Err(McpError::NotConnected {
                server: self.server.clone(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                reply: tx,
            },
        );
        Ok(PendingHandle {
            id,
            method: method.to_string(),
            rx,
            correlator: self,
        })
    }

    /// Wait for a registered request to resolve, failing with
    /// `RequestTimeout` (and dropping the entry) when the budget runs out.
    pub async fn wait(
        &self,
        mut handle: PendingHandle<'_>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        match tokio::time::timeout(timeout, &mut handle.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::TransportClosed {
                server: self.server.clone(),
            }),
            Err(_) => {
                self.cancel(handle.id);
                Err(McpError::RequestTimeout {
                    server: self.server.clone(),
                    method: std::mem::take(&mut handle.method),
                    id: handle.id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Deliver a response. Returns `false` when no request with that id is
    /// outstanding (late, duplicate, or unsolicited).
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let entry = self.lock().remove(&response.id);
        match entry {
            Some(req) => {
                tracing::trace!(
                    server = %self.server,
                    id = response.id,
                    method = %req.method,
                    "response matched"
                );
                let _ = req.reply.send(extract_result(response));
                true
            }
            None => false,
        }
    }

    /// Fail a single pending request with a specific error.
    pub fn fail(&self, id: u64, error: McpError) -> bool {
        match self.lock().remove(&id) {
            Some(req) => {
                let _ = req.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry without replying (timeout or abandoned caller).
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Stop accepting requests and fail everything outstanding.
    ///
    /// Returns the number of requests that were failed.
    pub fn close_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> McpError,
    {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.lock();
            self.open.store(false, Ordering::SeqCst);
            pending.drain().map(|(_, req)| req).collect()
        };
        let count = drained.len();
        for req in drained {
            let _ = req.reply.send(Err(make_error()));
        }
        if count > 0 {
            tracing::debug!(server = %self.server, count, "failed pending requests");
        }
        count
    }

    /// Whether `id` is still awaiting a response.
    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        // A poisoned map only means a panic elsewhere; the entries are still valid.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Convert a JSON-RPC response into the caller's result.
///
/// An `error` object wins; otherwise the `result` (or `null`) is returned.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(serde_json::Value::Null))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
