//! Round-trip bridge to an attached frontend console.
//!
//! `get_console_history` cannot read the browser console itself. It
//! broadcasts a [`ConsoleRequest`] to every subscriber (a websocket layer,
//! a test) and waits for one of them to call [`ConsoleBridge::fulfil`] with
//! the same id.

use crate::error::ToolError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleRequest {
    pub id: String,
    pub conversation_id: String,
}

pub struct ConsoleBridge {
    requests: broadcast::Sender<ConsoleRequest>,
    pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
}

impl std::fmt::Debug for ConsoleBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleBridge")
            .field("subscribers", &self.requests.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for ConsoleBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleBridge {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(16);
        Self {
            requests,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleRequest> {
        self.requests.subscribe()
    }

    /// Deliver the history for request `id`. `false` if nobody is waiting
    /// (unknown id, or the request already timed out).
    pub fn fulfil(&self, id: &str, history: serde_json::Value) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match waiter {
            Some(tx) => tx.send(history).is_ok(),
            None => {
                debug!("Console history for unknown request {id}");
                false
            }
        }
    }

    /// Broadcast a request and wait for its history. Returns `(id, history)`.
    pub async fn request(
        &self,
        conversation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, serde_json::Value), ToolError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id.clone(), tx);

        let request = ConsoleRequest {
            id: id.clone(),
            conversation_id: conversation_id.to_string(),
        };
        if self.requests.send(request).is_err() {
            self.pending_map().remove(&id);
            return Err(ToolError::Failed("no console is attached".into()));
        }

        let answer = tokio::select! {
            _ = cancel.cancelled() => {
                self.pending_map().remove(&id);
                return Err(ToolError::Cancelled);
            }
            r = tokio::time::timeout(timeout, rx) => r,
        };
        match answer {
            Ok(Ok(history)) => Ok((id, history)),
            Ok(Err(_)) => Err(ToolError::Failed("console request was dropped".into())),
            Err(_) => {
                self.pending_map().remove(&id);
                warn!("Console request {id} timed out after {timeout:?}");
                Err(ToolError::Failed(format!(
                    "console did not answer within {} seconds",
                    timeout.as_secs()
                )))
            }
        }
    }

    fn pending_map(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<serde_json::Value>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn subscriber_fulfils_request() {
        let bridge = Arc::new(ConsoleBridge::new());
        let mut rx = bridge.subscribe();
        let responder = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Ok(req) = rx.recv().await {
                responder.fulfil(&req.id, serde_json::json!(["log: ready"]));
            }
        });

        let (id, history) = bridge
            .request("conv", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(history, serde_json::json!(["log: ready"]));
    }

    #[tokio::test]
    async fn no_subscriber_fails_fast() {
        let bridge = ConsoleBridge::new();
        let err = bridge
            .request("conv", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no console"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscriber_times_out() {
        let bridge = ConsoleBridge::new();
        let _rx = bridge.subscribe();
        let err = bridge
            .request("conv", Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("30 seconds"));
        assert!(!bridge.fulfil("late", serde_json::Value::Null));
    }
}
