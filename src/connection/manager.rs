use std::sync::{Arc, atomic::Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{metrics::METRICS, schema::SensorReading, util};

use super::{
    backoff::ReconnectPolicy,
    registry::{SubscriberRegistry, Subscription},
    transport::{Frame, Link, Transport, WsTransport},
};

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, driver not yet running
    Disconnected,

    /// Opening a link to the endpoint
    Connecting,

    /// A live link is held
    Open,

    /// Link lost; retry `attempt` fires after `delay`
    RetryPending { attempt: u32, delay: Duration },

    /// Retry budget spent. Terminal for the automatic path.
    Exhausted,

    /// `disconnect()` was called. Terminal.
    Shutdown,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Exhausted | ConnectionState::Shutdown)
    }
}

/// Behaviour flags for the driver that don't affect the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Log every raw frame payload at debug level
    pub log_raw: bool,
}

/// ============================================================
/// ConnectionManager
/// ============================================================
///
/// Owns one logical connection to the sensor stream.
///
/// Responsibilities:
/// - Open the link on construction
/// - Parse every inbound frame as a `SensorReading`
/// - Fan readings out to subscribers, in subscription order
/// - Reconnect with bounded linear backoff after any closure
///
/// Lifecycle:
/// - A single driver task runs the state machine; it is the only
///   owner of the live link, so at most one link exists at a time.
/// - `disconnect()` (or dropping the manager) moves the state to
///   `Shutdown` before returning and cancels the driver. Open attempts
///   in flight, live links and pending retry timers are all abandoned;
///   `join()` waits until the driver has closed its link.
/// - There is no way to resume after `Shutdown` or `Exhausted`.
pub struct ConnectionManager {
    endpoint: String,
    registry: SubscriberRegistry,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state: watch::Receiver<ConnectionState>,

    /// Cancelled by the driver task when it exits.
    finished: CancellationToken,
}

impl ConnectionManager {
    /// Starts a manager for `endpoint` over WebSocket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(endpoint: impl Into<String>, policy: ReconnectPolicy, options: LinkOptions) -> Self {
        Self::start(endpoint, policy, options, Arc::new(WsTransport))
    }

    /// Starts a manager over an arbitrary transport.
    pub fn start(
        endpoint: impl Into<String>,
        policy: ReconnectPolicy,
        options: LinkOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let endpoint = endpoint.into();
        let registry = SubscriberRegistry::new();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let state_tx = Arc::new(state_tx);

        tokio::spawn(run_link_loop(LinkDriver {
            endpoint: endpoint.clone(),
            policy,
            options,
            transport,
            registry: registry.clone(),
            cancel: cancel.clone(),
            state: state_tx.clone(),
            finished: finished.clone(),
        }));

        Self {
            endpoint,
            registry,
            cancel,
            state_tx,
            state: state_rx,
            finished,
        }
    }

    /// Registers `callback` for every reading parsed from now on.
    ///
    /// The returned handle removes exactly this callback; it may be
    /// used from inside any callback, including this one.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SensorReading) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    /// Closes the live link (if any) and stops all reconnection.
    ///
    /// The state is `Shutdown` (no live link) as soon as this returns;
    /// the close handshake finishes on the driver task.
    /// Idempotent. Never fails.
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Disconnect requested for {}", self.endpoint);
        }
        self.shut_down();
    }

    fn shut_down(&self) {
        // Cancel first: the driver refuses any non-terminal state
        // once the token is cancelled.
        self.cancel.cancel();
        self.state_tx.send_replace(ConnectionState::Shutdown);
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True while a live link is held.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Resolves once the manager reached `Exhausted` or `Shutdown`.
    pub async fn stopped(&self) -> ConnectionState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // Driver gone without a terminal state: treat as shut down
            Err(_) => ConnectionState::Shutdown,
        };
        state
    }

    /// Resolves once the driver task has exited and released its link.
    pub async fn join(&self) {
        self.finished.cancelled().await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shut_down();
    }
}

// ------------------------------------------------------------
// Driver task
// ------------------------------------------------------------

struct LinkDriver {
    endpoint: String,
    policy: ReconnectPolicy,
    options: LinkOptions,
    transport: Arc<dyn Transport>,
    registry: SubscriberRegistry,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    finished: CancellationToken,
}

/// How a live link ended.
enum LinkEnd {
    /// Peer closed or transport failed → retry cycle
    Lost,
    /// Shutdown requested
    Cancelled,
}

impl LinkDriver {
    /// Publishes `state` unless shutdown was requested, in which case
    /// only `Shutdown` may be written.
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if self.cancel.is_cancelled() && state != ConnectionState::Shutdown {
                return false;
            }
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Parses one text payload and dispatches it.
    ///
    /// A malformed payload is logged and dropped; it never touches
    /// the connection state or the attempt counter.
    fn handle_text(&self, text: &str) {
        METRICS.frames_received.fetch_add(1, Ordering::Relaxed);

        if self.options.log_raw {
            log::debug!("[RAW] {}", text);
        }

        let reading: SensorReading = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Error parsing sensor frame: {}", e);
                return;
            }
        };

        self.registry.dispatch(&reading);
        METRICS.readings_dispatched.fetch_add(1, Ordering::Relaxed);
        METRICS.last_reading_ms.store(util::now_ms(), Ordering::Relaxed);
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Text(text) => self.handle_text(&text),

            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => self.handle_text(&text),
                Err(e) => {
                    METRICS.frames_received.fetch_add(1, Ordering::Relaxed);
                    METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Error parsing sensor frame: binary payload is not UTF-8: {}", e);
                }
            },

            Frame::Control => {}
        }
    }

    /// Reads from `link` until it ends or shutdown is requested.
    async fn pump(&self, link: &mut Box<dyn Link>) -> LinkEnd {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    link.close().await;
                    return LinkEnd::Cancelled;
                }

                frame = link.next_frame() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),

                    Some(Err(e)) => {
                        log::error!("WebSocket error on {}: {}", self.endpoint, e);
                        return LinkEnd::Lost;
                    }

                    None => {
                        log::info!("WebSocket disconnected from {}", self.endpoint);
                        return LinkEnd::Lost;
                    }
                },
            }
        }
    }
}

/// Runs the connect / reconnect state machine until a terminal state.
///
/// STATES:
/// - Connecting → Open            (open succeeded, counter reset)
/// - Connecting → RetryPending    (open failed)
/// - Open       → RetryPending    (closed or errored, no distinction)
/// - RetryPending → Connecting    (timer fired)
/// - RetryPending → Exhausted     (counter reached the maximum)
/// - any        → Shutdown        (cancelled)
///
/// The retry timer is awaited inline, so at most one exists.
async fn run_link_loop(driver: LinkDriver) {
    let _finished = driver.finished.clone().drop_guard();
    let mut attempts: u32 = 0;

    loop {
        driver.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            _ = driver.cancel.cancelled() => break,
            opened = driver.transport.open(&driver.endpoint) => opened,
        };

        match opened {
            Ok(mut link) => {
                attempts = 0;
                driver.set_state(ConnectionState::Open);
                METRICS.ws_connects.fetch_add(1, Ordering::Relaxed);
                METRICS.ws_connections_active.fetch_add(1, Ordering::Relaxed);
                log::info!("WebSocket connected to {} ({})", driver.endpoint, driver.transport.name());

                let end = driver.pump(&mut link).await;
                METRICS.ws_connections_active.fetch_sub(1, Ordering::Relaxed);

                if let LinkEnd::Cancelled = end {
                    break;
                }

                // Finish the close handshake before any new attempt
                link.close().await;
            }

            Err(e) => {
                log::error!("WebSocket connection error for {}: {}", driver.endpoint, e);
            }
        }

        let Some((attempt, delay)) = driver.policy.next(attempts) else {
            log::error!(
                "Giving up on {} after {} reconnect attempts",
                driver.endpoint,
                driver.policy.max_attempts
            );
            driver.set_state(ConnectionState::Exhausted);
            return;
        };
        attempts = attempt;
        driver.set_state(ConnectionState::RetryPending { attempt, delay });

        tokio::select! {
            biased;
            _ = driver.cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }

        METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Attempting to reconnect... ({}/{})",
            attempt,
            driver.policy.max_attempts
        );
    }

    log::info!("Connection manager for {} shut down", driver.endpoint);
    driver.set_state(ConnectionState::Shutdown);
}
