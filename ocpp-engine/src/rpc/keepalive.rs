//! Keep-alive scheduling
//!
//! Armed once the boot handshake is accepted. Issues one KeepAlive immediately,
//! then one per negotiated interval, until cancelled or until too many consecutive
//! keep-alives time out.
//!
//! ```text
//! Idle ──arm──► Armed(interval) ──first tick──► Running ──cancel / give up──► Cancelled
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::correlator::Correlator;
use crate::config::KeepAlivePolicy;
use crate::error::OcppError;
use crate::ocpp::KEEP_ALIVE;

/// Keep-alive scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// No accepted handshake yet
    Idle,
    /// Interval negotiated, loop spawned
    Armed(Duration),
    /// Loop ticking
    Running,
    /// Stopped for good
    Cancelled,
}

/// Owns the keep-alive task. Dropping the scheduler cancels it.
pub struct KeepAliveScheduler {
    state: Arc<watch::Sender<KeepAliveState>>,
    task: Option<JoinHandle<()>>,
}

impl Default for KeepAliveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAliveScheduler {
    pub fn new() -> Self {
        let (state, _) = watch::channel(KeepAliveState::Idle);
        Self {
            state: Arc::new(state),
            task: None,
        }
    }

    pub fn state(&self) -> KeepAliveState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<KeepAliveState> {
        self.state.subscribe()
    }

    /// Start the loop. Only valid from `Idle` and with a non-zero interval.
    ///
    /// Returns whether the loop was started.
    pub fn arm(
        &mut self,
        interval: Duration,
        correlator: Correlator,
        payload: Value,
        policy: &KeepAlivePolicy,
    ) -> bool {
        let current = self.state();
        if current != KeepAliveState::Idle {
            warn!("Keep-alive already {:?}, not re-arming", current);
            return false;
        }
        if interval.is_zero() {
            warn!("Refusing to arm keep-alive with a zero interval");
            return false;
        }
        let interval = if interval > policy.max_interval {
            warn!(
                "Negotiated keep-alive interval {:?} clamped to {:?}",
                interval, policy.max_interval
            );
            policy.max_interval
        } else {
            interval
        };
        if interval.is_zero() {
            warn!("Refusing to arm keep-alive with a zero maximum interval");
            return false;
        }

        self.state.send_replace(KeepAliveState::Armed(interval));
        info!("Keep-alive armed, interval: {:?}", interval);

        let ticker = Ticker {
            state: self.state.clone(),
            correlator,
            interval,
            payload,
            timeout: policy.timeout_for(interval),
            max_consecutive_failures: policy.max_consecutive_failures.max(1),
        };
        self.task = Some(tokio::spawn(ticker.run()));
        true
    }

    /// Stop the loop. No keep-alive is issued after this returns.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        // An idle scheduler was never armed and stays idle
        let cancelled = self.state.send_if_modified(|state| match state {
            KeepAliveState::Armed(_) | KeepAliveState::Running => {
                *state = KeepAliveState::Cancelled;
                true
            }
            KeepAliveState::Idle | KeepAliveState::Cancelled => false,
        });
        if cancelled {
            info!("Keep-alive cancelled");
        }
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Ticker {
    state: Arc<watch::Sender<KeepAliveState>>,
    correlator: Correlator,
    interval: Duration,
    payload: Value,
    timeout: Duration,
    max_consecutive_failures: u32,
}

impl Ticker {
    async fn run(self) {
        // First tick completes immediately
        let mut interval = tokio::time::interval(self.interval);
        let mut consecutive_timeouts = 0u32;

        loop {
            interval.tick().await;

            let proceed = self.state.send_if_modified(|state| match state {
                KeepAliveState::Armed(_) => {
                    *state = KeepAliveState::Running;
                    true
                }
                _ => false,
            }) || self.state() == KeepAliveState::Running;
            if !proceed {
                break;
            }

            match self
                .correlator
                .call(KEEP_ALIVE, self.payload.clone(), self.timeout)
                .await
            {
                Ok(response) => {
                    consecutive_timeouts = 0;
                    debug!("KeepAlive acknowledged: {}", response);
                }
                Err(OcppError::Timeout { elapsed, .. }) => {
                    consecutive_timeouts += 1;
                    warn!(
                        "KeepAlive unanswered after {:?} ({}/{})",
                        elapsed, consecutive_timeouts, self.max_consecutive_failures
                    );
                    if consecutive_timeouts >= self.max_consecutive_failures {
                        error!(
                            "Giving up keep-alive after {} consecutive timeouts",
                            consecutive_timeouts
                        );
                        break;
                    }
                }
                Err(OcppError::ConnectionClosed) => {
                    debug!("Keep-alive stopping: connection closed");
                    break;
                }
                Err(e) => {
                    warn!("KeepAlive failed: {}", e);
                }
            }
        }

        self.state.send_replace(KeepAliveState::Cancelled);
    }

    fn state(&self) -> KeepAliveState {
        *self.state.borrow()
    }
}
