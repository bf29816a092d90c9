//! Connection lifecycle: connect, keepalive, backoff and reconnect.

use crate::backoff::ReconnectPolicy;
use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::metrics;
use crate::transport::{Connector, Link, TransportEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use viewlink_protocol::OutboundMessage;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Connection status as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

struct ConnState {
    status: ConnectionStatus,
    attempt: u32,
    last_activity: Instant,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Bumped whenever the current transport is replaced or torn down.
    /// Callbacks from older transports compare against it and bail out.
    generation: u64,
    intentional_close: bool,
    driver: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    last_backoff: Option<Duration>,
    last_error: Option<String>,
}

impl ConnState {
    /// Abort background tasks and drop the transport.
    ///
    /// Must not be called from the driver or timer task itself.
    fn teardown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.outbound = None;
    }
}

/// Owns one logical connection to the remote endpoint.
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    keepalive_interval: Duration,
    connect_timeout: Duration,
    state: Mutex<ConnState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    frames: mpsc::UnboundedSender<String>,
}

impl ConnectionManager {
    /// Create a manager. Inbound text frames are forwarded to `frames`.
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: &ConnectionConfig,
        frames: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let endpoint = endpoint.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            endpoint,
            connector,
            policy: ReconnectPolicy::from(config),
            keepalive_interval: config.keepalive_interval(),
            connect_timeout: config.connect_timeout(),
            state: Mutex::new(ConnState {
                status: ConnectionStatus::Disconnected,
                attempt: 0,
                last_activity: Instant::now(),
                outbound: None,
                generation: 0,
                intentional_close: false,
                driver: None,
                reconnect_timer: None,
                last_backoff: None,
                last_error: None,
            }),
            status_tx,
            frames,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to status transitions, delivered in transition order.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Reconnect attempts made since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.state.lock().attempt
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// Delay used for the most recently scheduled reconnect.
    pub fn last_backoff(&self) -> Option<Duration> {
        self.state.lock().last_backoff
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    fn set_status(&self, state: &mut ConnState, status: ConnectionStatus) {
        if state.status == status {
            return;
        }
        debug!("Connection status: {} -> {}", state.status, status);
        state.status = status;
        // Sent under the state lock so subscribers observe strict order.
        let _ = self.status_tx.send(status);
    }

    /// Open the connection.
    ///
    /// Returns immediately when already connected or connecting. An error
    /// on this first attempt is returned to the caller and also starts the
    /// reconnect backoff.
    pub async fn connect(&self) -> Result<(), EngineError> {
        let generation = {
            let mut state = self.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                return Ok(());
            }
            state.teardown();
            state.intentional_close = false;
            state.generation += 1;
            self.set_status(&mut state, ConnectionStatus::Connecting);
            state.generation
        };

        info!("Connecting to {}", self.endpoint);
        match self.open_link().await {
            Ok(link) => {
                if self.on_established(generation, link) {
                    Ok(())
                } else {
                    Err(EngineError::NotConnected)
                }
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", self.endpoint, e);
                self.on_transport_lost(generation, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the connection on purpose. Suppresses auto-reconnect.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.intentional_close = true;
        state.generation += 1;
        state.teardown();
        self.set_status(&mut state, ConnectionStatus::Disconnected);
        info!("Disconnected from {}", self.endpoint);
    }

    /// Disconnect, reset backoff, and connect again.
    pub async fn reconnect(&self) -> Result<(), EngineError> {
        self.disconnect();
        {
            let mut state = self.state.lock();
            state.attempt = 0;
            state.last_backoff = None;
        }
        self.connect().await
    }

    /// Hand a text frame to the transport.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the status is `connected`.
    pub fn send(&self, payload: String) -> Result<(), EngineError> {
        let state = self.state.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(EngineError::NotConnected);
        }
        let outbound = state.outbound.as_ref().ok_or(EngineError::NotConnected)?;
        outbound.send(payload).map_err(|_| EngineError::NotConnected)
    }

    /// Serialize and send a protocol message.
    pub fn send_message(&self, message: &OutboundMessage) -> Result<(), EngineError> {
        self.send(message.to_json()?)
    }

    async fn open_link(&self) -> Result<Link, EngineError> {
        match tokio::time::timeout(self.connect_timeout, self.connector.open(&self.endpoint)).await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.connect_timeout)),
        }
    }

    fn on_established(&self, generation: u64, link: Link) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.intentional_close {
            debug!("Dropping superseded link (generation {})", generation);
            return false;
        }

        state.outbound = Some(link.outbound);
        state.attempt = 0;
        state.last_activity = Instant::now();
        state.last_error = None;
        // May be the task running this call; drop the handle, don't abort.
        state.reconnect_timer = None;
        state.driver = Some(tokio::spawn(drive(
            self.me.clone(),
            generation,
            link.inbound,
            self.keepalive_interval,
        )));
        self.set_status(&mut state, ConnectionStatus::Connected);
        info!("Connected to {}", self.endpoint);
        true
    }

    fn on_frame(&self, generation: u64, text: String) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_activity = Instant::now();
        }
        if self.frames.send(text).is_err() {
            debug!("Inbound frame dropped: no dispatcher listening");
        }
    }

    /// Returns false when the driver should stop.
    fn keepalive(&self, generation: u64) -> bool {
        let idle = {
            let state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.last_activity.elapsed()
        };

        if idle > self.keepalive_interval * 2 {
            warn!("No inbound activity for {:?}, presuming connection dead", idle);
            self.on_transport_lost(generation, Some("keepalive timeout".to_string()));
            return false;
        }

        if let Err(e) = self.send_message(&OutboundMessage::ping()) {
            debug!("Keepalive ping not sent: {}", e);
        }
        true
    }

    /// Handle an unexpected loss of the current transport.
    fn on_transport_lost(&self, generation: u64, error: Option<String>) {
        let mut state = self.state.lock();
        if state.generation != generation || state.intentional_close {
            return;
        }

        state.outbound = None;
        // May be the driver task itself; drop the handle, don't abort.
        state.driver = None;

        match error {
            Some(err) => {
                warn!("Transport error on {}: {}", self.endpoint, err);
                state.last_error = Some(err);
                self.set_status(&mut state, ConnectionStatus::Error);
            }
            None => info!("Connection to {} closed unexpectedly", self.endpoint),
        }

        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(&self, state: &mut ConnState) {
        if !self.policy.allows(state.attempt) {
            let err = EngineError::ReconnectExhausted(state.attempt);
            error!("{}; call reconnect() to resume", err);
            state.last_error = Some(err.to_string());
            self.set_status(state, ConnectionStatus::Error);
            return;
        }

        let delay = self.policy.delay_for(state.attempt);
        state.attempt += 1;
        state.last_backoff = Some(delay);
        metrics::increment_reconnect_attempt();
        self.set_status(state, ConnectionStatus::Reconnecting);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, state.attempt, self.policy.max_attempts
        );

        let generation = state.generation;
        let me = self.me.clone();
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = me.upgrade() {
                manager.attempt_reconnect(generation).await;
            }
        }));
    }

    async fn attempt_reconnect(&self, scheduled_generation: u64) {
        let generation = {
            let mut state = self.state.lock();
            if state.generation != scheduled_generation
                || state.intentional_close
                || state.status != ConnectionStatus::Reconnecting
            {
                return;
            }
            state.reconnect_timer = None;
            state.generation += 1;
            state.generation
        };

        debug!("Reconnect attempt to {}", self.endpoint);
        match self.open_link().await {
            Ok(link) => {
                self.on_established(generation, link);
            }
            Err(e) => self.on_transport_lost(generation, Some(e.to_string())),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.state.lock().teardown();
    }
}

/// Per-transport task: routes inbound events and runs the keepalive ticker.
async fn drive(
    me: Weak<ConnectionManager>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    keepalive_interval: Duration,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(manager) = me.upgrade() else { return };
                match event {
                    Some(TransportEvent::Frame(text)) => manager.on_frame(generation, text),
                    Some(TransportEvent::Closed { reason }) => {
                        debug!("Transport closed: {:?}", reason);
                        manager.on_transport_lost(generation, None);
                        return;
                    }
                    Some(TransportEvent::Error(err)) => {
                        manager.on_transport_lost(generation, Some(err));
                        return;
                    }
                    None => {
                        manager.on_transport_lost(generation, None);
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(manager) = me.upgrade() else { return };
                if !manager.keepalive(generation) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self, _endpoint: &str) -> Result<Link, EngineError> {
            Err(EngineError::Transport("connection refused".to_string()))
        }
    }

    fn manager(max_attempts: u32) -> Arc<ConnectionManager> {
        let config = ConnectionConfig {
            max_attempts,
            ..ConnectionConfig::default()
        };
        let (frames, _rx) = mpsc::unbounded_channel();
        ConnectionManager::new("ws://test", Arc::new(RefusingConnector), &config, frames)
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let manager = manager(3);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            manager.send("{}".to_string()),
            Err(EngineError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_reported_and_backoff_scheduled() {
        let manager = manager(3);
        let mut statuses = manager.subscribe();

        let result = manager.connect().await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
        assert_eq!(manager.attempt(), 1);
        assert_eq!(manager.last_backoff(), Some(Duration::from_millis(1000)));

        assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connecting);
        assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Error);
        assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Reconnecting);
        manager.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_goes_terminal_immediately() {
        let manager = manager(0);
        let _ = manager.connect().await;
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert!(manager.last_error().unwrap().contains("exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let manager = manager(3);
        let _ = manager.connect().await;
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.attempt(), 1);
    }
}
