// ── Request correlation ──
//
// Request-style calls over the stream: each request carries a fresh UUID,
// and the matching JSON-RPC response resolves exactly that caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use wapp_api::{FrameSink, RpcRequest, RpcResponse};

use crate::error::CoreError;

type Resolver = oneshot::Sender<Result<Value, CoreError>>;

struct PendingRequest {
    created_at: Instant,
    method: String,
    resolver: Resolver,
}

/// Table of in-flight requests.
pub struct RequestCorrelator {
    pending: DashMap<String, PendingRequest>,
    sink: Arc<dyn FrameSink>,
    default_timeout: Duration,
}

/// Removes the pending entry when the caller stops waiting for any reason.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

impl RequestCorrelator {
    pub fn new(sink: Arc<dyn FrameSink>, default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            sink,
            default_timeout,
        }
    }

    /// Send a request and wait for its response, with the default timeout.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        self.send_request_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for its response.
    ///
    /// A response arriving after the deadline is discarded.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        let id = Uuid::new_v4().to_string();
        let frame = RpcRequest::new(id.clone(), method, params).to_frame()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                created_at: Instant::now(),
                method: method.to_owned(),
                resolver: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        self.sink.send_frame(frame)?;
        debug!(correlation_id = %id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Resolver dropped without an answer.
            Ok(Err(_)) => Err(CoreError::NotConnected),
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(correlation_id = %id, method, timeout_ms, "request timed out");
                Err(CoreError::RequestTimeout { timeout_ms })
            }
        }
    }

    /// Resolve the request matching `response`.
    ///
    /// Returns `false` when no request with that id is pending (expired,
    /// already answered, or never sent).
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let id = response.correlation_id();
        let Some((_, request)) = self.pending.remove(&id) else {
            debug!(correlation_id = %id, "response for unknown or expired request");
            return false;
        };

        let result = match response.error {
            Some(err) => Err(CoreError::RequestRejected {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        debug!(
            correlation_id = %id,
            method = %request.method,
            elapsed_ms = u64::try_from(request.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = result.is_ok(),
            "request resolved"
        );
        // The caller may have given up in the meantime.
        let _ = request.resolver.send(result);
        true
    }

    /// Fail every pending request: the connection is gone for good.
    pub fn fail_all(&self, attempts: u32) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0_usize;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request
                    .resolver
                    .send(Err(CoreError::ReconnectExhausted { attempts }));
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, "failed pending requests after connection closed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use serde_json::json;
    use wapp_api::RpcError;

    /// Records frames instead of sending them.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: String) -> Result<(), wapp_api::Error> {
            if self.fail {
                return Err(wapp_api::Error::NotConnected);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    impl RecordingSink {
        fn ids(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str::<Value>(f).unwrap()["id"].as_str().unwrap().to_owned())
                .collect()
        }
    }

    fn response(id: &str, result: Value) -> RpcResponse {
        RpcResponse {
            id: json!(id),
            result: Some(result),
            error: None,
        }
    }

    async fn wait_for_frames(sink: &RecordingSink, n: usize) {
        while sink.frames.lock().unwrap().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_requests_never_cross_resolve() {
        let sink = Arc::new(RecordingSink::default());
        let correlator = Arc::new(RequestCorrelator::new(sink.clone(), Duration::from_secs(5)));

        let first = tokio::spawn({
            let c = Arc::clone(&correlator);
            async move { c.send_request("GET", json!({ "n": 1 })).await }
        });
        wait_for_frames(&sink, 1).await;
        let second = tokio::spawn({
            let c = Arc::clone(&correlator);
            async move { c.send_request("GET", json!({ "n": 2 })).await }
        });
        wait_for_frames(&sink, 2).await;

        let ids = sink.ids();
        assert_ne!(ids[0], ids[1]);
        // Answer out of order.
        assert!(correlator.resolve(response(&ids[1], json!("second"))));
        assert!(correlator.resolve(response(&ids[0], json!("first"))));

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_is_rejection() {
        let sink = Arc::new(RecordingSink::default());
        let correlator = Arc::new(RequestCorrelator::new(sink.clone(), Duration::from_secs(5)));

        let call = tokio::spawn({
            let c = Arc::clone(&correlator);
            async move { c.send_request("DELETE", json!({})).await }
        });
        wait_for_frames(&sink, 1).await;
        let id = sink.ids().remove(0);
        correlator.resolve(RpcResponse {
            id: json!(id),
            result: None,
            error: Some(RpcError {
                code: 300_020,
                message: "no access".into(),
                data: None,
            }),
        });

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::RequestRejected { code: 300_020, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_response_is_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let correlator = RequestCorrelator::new(sink.clone(), Duration::from_secs(30));

        let err = correlator
            .send_request_with_timeout("GET", json!({}), Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RequestTimeout { timeout_ms: 250 }));
        assert_eq!(correlator.pending_count(), 0);

        let id = sink.ids().remove(0);
        assert!(!correlator.resolve(response(&id, json!("late"))));
    }

    #[tokio::test]
    async fn send_failure_leaves_nothing_pending() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let correlator = RequestCorrelator::new(sink, Duration::from_secs(5));

        let err = correlator.send_request("GET", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_with_reconnect_exhausted() {
        let sink = Arc::new(RecordingSink::default());
        let correlator = Arc::new(RequestCorrelator::new(sink.clone(), Duration::from_secs(60)));

        let call = tokio::spawn({
            let c = Arc::clone(&correlator);
            async move { c.send_request("GET", json!({})).await }
        });
        wait_for_frames(&sink, 1).await;
        correlator.fail_all(10);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ReconnectExhausted { attempts: 10 }));
    }

    #[test]
    fn unknown_response_is_noop() {
        let correlator =
            RequestCorrelator::new(Arc::new(RecordingSink::default()), Duration::from_secs(1));
        assert!(!correlator.resolve(response("nobody", Value::Null)));
    }
}
