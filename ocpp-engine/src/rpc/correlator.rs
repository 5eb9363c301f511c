//! Client-side call correlation
//!
//! Each outbound CALL gets a fresh id and a `PendingCall` entry holding the
//! resolver for the suspended caller. The entry leaves the table exactly once:
//! when the matching CALLRESULT/CALLERROR arrives, when its deadline passes, when
//! the caller gives up, or when the session closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MessageIdStrategy;
use crate::error::OcppError;
use crate::ocpp::{encode, Call, Envelope};

type Settlement = Result<Value, OcppError>;

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(issued_at: Instant, timeout: Duration) -> Instant {
    issued_at
        .checked_add(timeout.min(FAR_FUTURE))
        .unwrap_or(issued_at)
}

/// Outbound call awaiting its response
struct PendingCall {
    action: String,
    issued_at: Instant,
    deadline: Instant,
    resolver: oneshot::Sender<Settlement>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<String, PendingCall>,
    closed: bool,
}

enum IdGenerator {
    Uuid,
    Sequential(AtomicU64),
}

impl IdGenerator {
    fn new(strategy: MessageIdStrategy) -> Self {
        match strategy {
            MessageIdStrategy::Uuid => IdGenerator::Uuid,
            MessageIdStrategy::Sequential => IdGenerator::Sequential(AtomicU64::new(1)),
        }
    }

    fn next(&self) -> String {
        match self {
            IdGenerator::Uuid => Uuid::new_v4().to_string(),
            IdGenerator::Sequential(counter) => counter.fetch_add(1, Ordering::Relaxed).to_string(),
        }
    }
}

struct Inner {
    session: String,
    pending: Mutex<PendingTable>,
    outbound: mpsc::Sender<Vec<u8>>,
    ids: IdGenerator,
}

impl Inner {
    fn forget(&self, message_id: &str) -> Option<PendingCall> {
        self.pending.lock().calls.remove(message_id)
    }
}

/// Removes the pending entry if the caller stops waiting early
struct PendingGuard<'a> {
    inner: &'a Inner,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.forget(self.message_id);
    }
}

/// Issues calls and matches responses to them
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// `outbound` receives encoded frames for the transport to write
    pub fn new(
        session: impl Into<String>,
        outbound: mpsc::Sender<Vec<u8>>,
        ids: MessageIdStrategy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: session.into(),
                pending: Mutex::new(PendingTable::default()),
                outbound,
                ids: IdGenerator::new(ids),
            }),
        }
    }

    /// Send a CALL and wait for its result, an error, or the timeout
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, OcppError> {
        let (resolver, mut settled) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = deadline_after(issued_at, timeout);

        let message_id = {
            let mut table = self.inner.pending.lock();
            if table.closed {
                return Err(OcppError::ConnectionClosed);
            }

            let mut id = self.inner.ids.next();
            while table.calls.contains_key(&id) {
                id = self.inner.ids.next();
            }

            table.calls.insert(
                id.clone(),
                PendingCall {
                    action: action.to_string(),
                    issued_at,
                    deadline,
                    resolver,
                },
            );
            id
        };
        let _guard = PendingGuard {
            inner: &self.inner,
            message_id: &message_id,
        };

        let frame = encode(&Envelope::Call(Call::new(&message_id, action, payload)));
        debug!(
            session = %self.inner.session,
            id = %message_id,
            "Sending {}: {}", action, String::from_utf8_lossy(&frame)
        );

        match tokio::time::timeout_at(deadline, self.inner.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(OcppError::ConnectionClosed),
            Err(_) => return self.expire(&message_id, &mut settled),
        }

        match tokio::time::timeout_at(deadline, &mut settled).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => self.expire(&message_id, &mut settled),
        }
    }

    /// `call` with typed request and response payloads
    pub async fn call_typed<Req, Resp>(
        &self,
        action: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, OcppError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let response = self.call(action, payload, timeout).await?;
        Ok(serde_json::from_value(response)?)
    }

    fn expire(
        &self,
        message_id: &str,
        settled: &mut oneshot::Receiver<Settlement>,
    ) -> Result<Value, OcppError> {
        match self.inner.forget(message_id) {
            Some(pending) => {
                let elapsed = pending.issued_at.elapsed();
                warn!(
                    session = %self.inner.session,
                    id = %message_id,
                    "{} timed out after {:?}", pending.action, elapsed
                );
                Err(OcppError::Timeout {
                    action: pending.action,
                    elapsed,
                })
            }
            // Settled between the deadline firing and us taking the lock
            None => settled.try_recv().unwrap_or(Err(OcppError::ConnectionClosed)),
        }
    }

    /// Feed a CALLRESULT or CALLERROR received on this session.
    ///
    /// Returns `false` when the id matches nothing outstanding; such responses are
    /// logged and dropped.
    pub fn on_envelope(&self, envelope: Envelope) -> bool {
        let (message_id, settlement) = match envelope {
            Envelope::CallResult(result) => (result.message_id, Ok(result.payload)),
            Envelope::CallError(error) => (
                error.message_id,
                Err(OcppError::RemoteError {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                }),
            ),
            Envelope::Call(call) => {
                warn!(
                    session = %self.inner.session,
                    id = %call.message_id,
                    "Correlator cannot answer CALL {}", call.action
                );
                return false;
            }
        };

        match self.inner.forget(&message_id) {
            Some(pending) => {
                debug!(
                    session = %self.inner.session,
                    id = %message_id,
                    "{} settled after {:?}", pending.action, pending.issued_at.elapsed()
                );
                // The caller may have stopped waiting; nothing to do then.
                let _ = pending.resolver.send(settlement);
                true
            }
            None => {
                warn!(
                    session = %self.inner.session,
                    id = %message_id,
                    "Protocol anomaly: response matches no pending call, discarding"
                );
                false
            }
        }
    }

    /// Fail every outstanding call with `ConnectionClosed` and refuse new ones.
    ///
    /// Returns how many calls were failed.
    pub fn close(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.inner.pending.lock();
            table.closed = true;
            table.calls.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            debug!(
                session = %self.inner.session,
                "Failing pending {}: connection closed", pending.action
            );
            let _ = pending.resolver.send(Err(OcppError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    /// Number of calls awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().calls.len()
    }

    /// Earliest deadline among outstanding calls
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .pending
            .lock()
            .calls
            .values()
            .map(|pending| pending.deadline)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{decode, CallError, CallResult, ErrorCode};
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    fn correlator(ids: MessageIdStrategy) -> (Correlator, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        (Correlator::new("test", tx, ids), rx)
    }

    async fn next_call(rx: &mut mpsc::Receiver<Vec<u8>>) -> Call {
        match decode(&rx.recv().await.unwrap()).unwrap() {
            Envelope::Call(call) => call,
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_resolves_on_result() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Uuid);

        let c = correlator.clone();
        let handle = tokio::spawn(async move {
            c.call("KeepAlive", json!({}), Duration::from_secs(5)).await
        });

        let call = next_call(&mut rx).await;
        assert_eq!(call.action, "KeepAlive");
        assert_eq!(correlator.pending_count(), 1);

        let matched = correlator.on_envelope(
            CallResult::new(&call.message_id, json!({"serverTime": "2026-01-20T12:00:00Z"})).into(),
        );
        assert!(matched);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result["serverTime"], "2026-01-20T12:00:00Z");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_error_settles_as_remote_error() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Uuid);

        let c = correlator.clone();
        let handle = tokio::spawn(async move {
            c.call("Foo", json!({}), Duration::from_secs(5)).await
        });

        let call = next_call(&mut rx).await;
        correlator.on_envelope(
            CallError::new(&call.message_id, ErrorCode::NotImplemented, "no Foo").into(),
        );

        match handle.await.unwrap() {
            Err(OcppError::RemoteError { code, description, .. }) => {
                assert_eq!(code, ErrorCode::NotImplemented);
                assert_eq!(description, "no Foo");
            }
            other => panic!("Expected RemoteError, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_waits_for_response() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Sequential);

        let mut call = tokio_test::task::spawn(correlator.call("KeepAlive", json!({}), Duration::MAX));
        assert_pending!(call.poll());
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.next_deadline().unwrap() > Instant::now() + Duration::from_secs(86400));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_pending!(call.poll());

        let sent = next_call(&mut rx).await;
        correlator.on_envelope(CallResult::new(&sent.message_id, json!({})).into());
        assert_eq!(assert_ready!(call.poll()).unwrap(), json!({}));
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();

        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
        assert_eq!(
            deadline_after(now, Duration::from_secs(u64::MAX)),
            now + FAR_FUTURE
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline_not_before() {
        let (correlator, _rx) = correlator(MessageIdStrategy::Sequential);

        let mut call = tokio_test::task::spawn(correlator.call(
            "KeepAlive",
            json!({}),
            Duration::from_millis(100),
        ));
        assert_pending!(call.poll());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_pending!(call.poll());
        assert_eq!(correlator.pending_count(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        match assert_ready!(call.poll()) {
            Err(OcppError::Timeout { action, elapsed }) => {
                assert_eq!(action, "KeepAlive");
                assert_eq!(elapsed, Duration::from_millis(100));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_anomaly() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Sequential);

        let result = correlator
            .call("KeepAlive", json!({}), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(OcppError::Timeout { .. })));

        let call = next_call(&mut rx).await;
        assert!(!correlator.on_envelope(CallResult::new(&call.message_id, json!({})).into()));
    }

    #[tokio::test]
    async fn test_unmatched_id_is_discarded() {
        let (correlator, _rx) = correlator(MessageIdStrategy::Uuid);

        assert!(!correlator.on_envelope(CallResult::new("nobody", json!({})).into()));
        assert!(!correlator.on_envelope(
            CallError::new("nobody", ErrorCode::GenericError, "").into()
        ));
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_calls_settle_out_of_order() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Sequential);

        let c1 = correlator.clone();
        let first = tokio::spawn(async move {
            c1.call("A", json!({}), Duration::from_secs(5)).await
        });
        let a = next_call(&mut rx).await;

        let c2 = correlator.clone();
        let second = tokio::spawn(async move {
            c2.call("B", json!({}), Duration::from_secs(5)).await
        });
        let b = next_call(&mut rx).await;

        assert_eq!(a.message_id, "1");
        assert_eq!(b.message_id, "2");
        assert_eq!(correlator.pending_count(), 2);

        correlator.on_envelope(CallResult::new("2", json!({"who": "B"})).into());
        assert_eq!(second.await.unwrap().unwrap(), json!({"who": "B"}));
        assert_eq!(correlator.pending_count(), 1);

        correlator.on_envelope(CallResult::new("1", json!({"who": "A"})).into());
        assert_eq!(first.await.unwrap().unwrap(), json!({"who": "A"}));
    }

    #[tokio::test]
    async fn test_close_fails_all_pending() {
        let (correlator, mut rx) = correlator(MessageIdStrategy::Uuid);

        let mut handles = Vec::new();
        for action in ["A", "B"] {
            let c = correlator.clone();
            handles.push(tokio::spawn(async move {
                c.call(action, json!({}), Duration::from_secs(60)).await
            }));
            next_call(&mut rx).await;
        }
        assert_eq!(correlator.pending_count(), 2);

        assert_eq!(correlator.close(), 2);
        assert_eq!(correlator.pending_count(), 0);

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(OcppError::ConnectionClosed)));
        }

        // No new calls after close, and nothing is sent
        let result = correlator.call("C", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(OcppError::ConnectionClosed)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_failure_is_connection_closed() {
        let (correlator, rx) = correlator(MessageIdStrategy::Uuid);
        drop(rx);

        let result = correlator.call("A", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(OcppError::ConnectionClosed)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_entry() {
        let (correlator, _rx) = correlator(MessageIdStrategy::Uuid);

        let mut call = tokio_test::task::spawn(correlator.call(
            "A",
            json!({}),
            Duration::from_secs(60),
        ));
        assert_pending!(call.poll());
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.next_deadline().is_some());

        drop(call);
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.next_deadline().is_none());
    }

    #[tokio::test]
    async fn test_call_typed() {
        #[derive(serde::Deserialize)]
        struct Pong {
            n: u32,
        }

        let (correlator, mut rx) = correlator(MessageIdStrategy::Sequential);

        let c = correlator.clone();
        let handle = tokio::spawn(async move {
            c.call_typed::<_, Pong>("Ping", &json!({"n": 1}), Duration::from_secs(5))
                .await
        });

        let call = next_call(&mut rx).await;
        assert_eq!(call.payload, json!({"n": 1}));
        correlator.on_envelope(CallResult::new(&call.message_id, json!({"n": 2})).into());

        assert_eq!(handle.await.unwrap().unwrap().n, 2);
    }
}
