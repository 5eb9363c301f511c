//! Per-connection sessions
//!
//! A session binds the codec plus either a router (server role) or a correlator
//! (client role) to one link. The transport feeds it frames and close/error events;
//! the session writes encoded frames into its outbound channel.
//!
//! Lifecycle: `Connected` → `Active` (handshake done) → `Closed`. A client whose
//! handshake is refused goes to `Rejected` instead of `Active`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::OcppError;
use crate::ocpp::{
    decode, encode, BootHandshakeRequest, BootHandshakeResponse, Call, Envelope, KeepAliveRequest,
    RegistrationStatus, StatusReportRequest, StatusReportResponse, BOOT_HANDSHAKE, STATUS_REPORT,
};
use crate::rpc::{Correlator, DispatchError, KeepAliveScheduler, KeepAliveState, Router};

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Link open, no handshake yet
    Connected,
    /// Handshake completed
    Active,
    /// Handshake refused by the central system
    Rejected,
    /// Link gone; nothing more is sent
    Closed,
}

/// Which side of the link this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// What the transport reports to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound frame
    Frame(Vec<u8>),
    /// Orderly close by the peer
    Closed,
    /// Transport failure
    Error(String),
}

/// Server side of a link: answers every CALL through the shared router
pub struct ServerSession {
    id: String,
    router: Arc<Router>,
    outbound: mpsc::Sender<Vec<u8>>,
    state: SessionState,
}

impl ServerSession {
    pub fn new(id: impl Into<String>, router: Arc<Router>, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        let id = id.into();
        info!(session = %id, "Session connected");
        Self {
            id,
            router,
            outbound,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        Role::Server
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one inbound frame. Frames are handled one at a time, in arrival order.
    pub async fn on_bytes(&mut self, bytes: &[u8]) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!(session = %self.id, "Received: {}", String::from_utf8_lossy(bytes));

        match decode(bytes) {
            Ok(Envelope::Call(call)) => {
                let reply = self.router.handle(&call);

                if self.state == SessionState::Connected && accepts_boot(&call, &reply) {
                    self.state = SessionState::Active;
                    info!(session = %self.id, "Session active after {}", call.action);
                }

                self.send(&reply).await;
            }
            Ok(other) => {
                // This side issues no calls, so no response can match anything
                warn!(
                    session = %self.id,
                    id = %other.message_id(),
                    "Protocol anomaly: unsolicited {:?}, discarding",
                    other.message_type()
                );
            }
            Err(e) => {
                warn!(
                    session = %self.id,
                    raw = %e.raw(),
                    "Dropping malformed frame: {}", e.reason()
                );
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        let bytes = encode(envelope);
        debug!(session = %self.id, "Sending: {}", String::from_utf8_lossy(&bytes));

        if self.outbound.send(bytes).await.is_err() {
            self.close("outbound channel closed");
        }
    }

    /// Enter `Closed`. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        info!(session = %self.id, "Session closed: {}", reason);
    }

    /// Drive the session until the transport closes or fails
    pub async fn run<S>(mut self, mut inbound: S) -> SessionState
    where
        S: Stream<Item = TransportEvent> + Unpin,
    {
        while let Some(event) = inbound.next().await {
            match event {
                TransportEvent::Frame(bytes) => self.on_bytes(&bytes).await,
                TransportEvent::Closed => {
                    self.close("closed by peer");
                }
                TransportEvent::Error(e) => {
                    error!(session = %self.id, "Transport error: {}", e);
                    self.close("transport error");
                }
            }

            if self.state == SessionState::Closed {
                break;
            }
        }

        self.close("transport ended");
        self.state
    }
}

/// Whether `reply` accepts a boot handshake
fn accepts_boot(call: &Call, reply: &Envelope) -> bool {
    if call.action != BOOT_HANDSHAKE {
        return false;
    }
    match reply {
        Envelope::CallResult(result) => matches!(
            result.parse_payload::<BootHandshakeResponse>(),
            Ok(BootHandshakeResponse {
                status: RegistrationStatus::Accepted,
                ..
            })
        ),
        _ => false,
    }
}

/// Client side of a link: issues calls, runs the keep-alive after boot
pub struct ClientSession {
    id: String,
    config: EngineConfig,
    correlator: Correlator,
    router: Option<Arc<Router>>,
    outbound: mpsc::Sender<Vec<u8>>,
    keep_alive: Mutex<KeepAliveScheduler>,
    keep_alive_payload: Value,
    state: watch::Sender<SessionState>,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<Vec<u8>>, config: EngineConfig) -> Self {
        let id = id.into();
        let correlator = Correlator::new(id.clone(), outbound.clone(), config.message_ids);
        let (state, _) = watch::channel(SessionState::Connected);
        info!(session = %id, "Session connected");

        Self {
            id,
            config,
            correlator,
            router: None,
            outbound,
            keep_alive: Mutex::new(KeepAliveScheduler::new()),
            keep_alive_payload: Value::Object(serde_json::Map::new()),
            state,
        }
    }

    /// Answer server-initiated calls with this router instead of `NotImplemented`
    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Payload sent with every keep-alive
    pub fn with_keep_alive_request(mut self, request: &KeepAliveRequest) -> Result<Self, OcppError> {
        self.keep_alive_payload = serde_json::to_value(request)?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        Role::Client
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this only ends on `Closed`
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    pub fn keep_alive_state(&self) -> KeepAliveState {
        self.keep_alive.lock().state()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Issue a call with the configured timeout
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, OcppError> {
        self.correlator
            .call(action, payload, self.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, OcppError> {
        self.correlator.call(action, payload, timeout).await
    }

    /// Run the boot handshake. An `Accepted` result arms the keep-alive at the
    /// negotiated interval; any other status leaves it idle.
    pub async fn boot(
        &self,
        request: &BootHandshakeRequest,
    ) -> Result<BootHandshakeResponse, OcppError> {
        let response: BootHandshakeResponse = self
            .correlator
            .call_typed(BOOT_HANDSHAKE, request, self.config.call_timeout)
            .await?;

        match response.status {
            RegistrationStatus::Accepted => {
                let interval = Duration::from_secs(response.keep_alive_interval_seconds);
                let mut keep_alive = self.keep_alive.lock();

                // Checked under the scheduler lock so a concurrent close cannot miss it
                let activated = self.state.send_if_modified(|state| {
                    if *state == SessionState::Connected {
                        *state = SessionState::Active;
                        true
                    } else {
                        false
                    }
                });

                if activated {
                    info!(session = %self.id, "Boot accepted, keep-alive interval: {:?}", interval);
                    keep_alive.arm(
                        interval,
                        self.correlator.clone(),
                        self.keep_alive_payload.clone(),
                        &self.config.keep_alive,
                    );
                } else {
                    warn!(session = %self.id, "Boot accepted in state {:?}, ignoring", self.state());
                }
            }
            RegistrationStatus::Rejected => {
                self.state.send_if_modified(|state| {
                    if *state == SessionState::Connected {
                        *state = SessionState::Rejected;
                        true
                    } else {
                        false
                    }
                });
                warn!(session = %self.id, "Boot rejected, keep-alive stays idle");
            }
            RegistrationStatus::Pending => {
                info!(session = %self.id, "Boot pending, keep-alive stays idle");
            }
        }

        Ok(response)
    }

    pub async fn status_report(
        &self,
        request: &StatusReportRequest,
    ) -> Result<StatusReportResponse, OcppError> {
        self.correlator
            .call_typed(STATUS_REPORT, request, self.config.call_timeout)
            .await
    }

    /// Handle one inbound frame
    pub async fn on_bytes(&self, bytes: &[u8]) {
        if self.state() == SessionState::Closed {
            return;
        }
        debug!(session = %self.id, "Received: {}", String::from_utf8_lossy(bytes));

        match decode(bytes) {
            Ok(Envelope::Call(call)) => {
                let reply = match &self.router {
                    Some(router) => router.handle(&call),
                    None => {
                        warn!(session = %self.id, "No router for server call {}", call.action);
                        Envelope::CallError(
                            DispatchError::NotImplemented(call.action.clone()).to_call_error(&call),
                        )
                    }
                };

                if self.outbound.send(encode(&reply)).await.is_err() {
                    self.close("outbound channel closed");
                }
            }
            Ok(response) => {
                self.correlator.on_envelope(response);
            }
            Err(e) => {
                warn!(
                    session = %self.id,
                    raw = %e.raw(),
                    "Dropping malformed frame: {}", e.reason()
                );
            }
        }
    }

    /// Enter `Closed`: stop the keep-alive and fail every pending call. Idempotent.
    pub fn close(&self, reason: &str) {
        let closing = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !closing {
            return;
        }

        self.keep_alive.lock().cancel();
        let failed = self.correlator.close();
        info!(
            session = %self.id,
            "Session closed: {} ({} pending calls failed)", reason, failed
        );
    }

    /// Drive inbound traffic until the transport closes or fails
    pub async fn run<S>(&self, mut inbound: S)
    where
        S: Stream<Item = TransportEvent> + Unpin,
    {
        while let Some(event) = inbound.next().await {
            match event {
                TransportEvent::Frame(bytes) => self.on_bytes(&bytes).await,
                TransportEvent::Closed => self.close("closed by peer"),
                TransportEvent::Error(e) => {
                    error!(session = %self.id, "Transport error: {}", e);
                    self.close("transport error");
                }
            }

            if self.state() == SessionState::Closed {
                return;
            }
        }

        self.close("transport ended");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close("session dropped");
    }
}
