//! Connection hub
//!
//! Owns the single transport to a controller and everything needed to keep it
//! usable:
//! - read/write wrappers with an overall deadline, failure accounting and a
//!   circuit breaker gate
//! - notification subscriptions with stable ids, re-armed after reconnects
//! - a dispatcher task that decodes pushed samples off the delivery path
//! - a periodic health check and an exponential-backoff reconnect loop
//!
//! Locking: the transport sits behind an async mutex that serializes every
//! call against it; counters, breaker and connection state sit behind a
//! short-lived sync mutex that is never held across an await.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::AdsOptions;
use crate::decoder;
use crate::error::{AdsError, Result};
use crate::reconnect::{ReconnectPolicy, ReconnectStats};
use crate::registry::NotificationRegistry;
use crate::transport::{AdsTransport, NotificationSink, RawNotification, TransportFactory};
use crate::types::{
    ConnectionState, DeviceState, NotificationCallback, PlcValue, ProtocolType, SubscriptionId,
};

/// Interval between connection health checks
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive timeouts that force a reconnect
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

/// Connection lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    /// The connection was lost or torn down
    Disconnected,
    /// A reconnect succeeded and subscriptions were re-armed
    Reconnected,
}

/// Point-in-time view of the hub's counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub connection_state: ConnectionState,
    pub connection_failures: u32,
    pub consecutive_timeouts: u32,
    pub reconnect_delay_secs: f64,
    pub breaker_state: CircuitState,
    pub notifications_enabled: bool,
    pub subscriptions: usize,
    pub armed_subscriptions: usize,
    pub dropped_notifications: u64,
    pub healthy: bool,
    pub reconnect: ReconnectStats,
}

struct HubState {
    connection_state: ConnectionState,
    connection_failures: u32,
    consecutive_timeouts: u32,
    reconnect_delay: Duration,
    breaker: CircuitBreaker,
    stats: ReconnectStats,
}

#[derive(Default)]
struct HubTasks {
    dispatcher: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl HubTasks {
    fn abort_all(&mut self) {
        for task in [
            self.reconnect.take(),
            self.health.take(),
            self.dispatcher.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Connection manager for one controller
pub struct AdsHub {
    factory: Arc<dyn TransportFactory>,
    options: AdsOptions,
    policy: ReconnectPolicy,
    transport: tokio::sync::Mutex<Option<Box<dyn AdsTransport>>>,
    state: Mutex<HubState>,
    registry: Arc<NotificationRegistry>,
    notify_tx: mpsc::Sender<RawNotification>,
    /// Epoch of the live connection; samples from older epochs are stale
    epoch: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    tasks: Mutex<HubTasks>,
    events: broadcast::Sender<HubEvent>,
    closed: AtomicBool,
}

impl AdsHub {
    /// Connect, verify the device answers, and start background tasks
    pub async fn setup(factory: Arc<dyn TransportFactory>, options: AdsOptions) -> Result<Arc<Self>> {
        options.validate()?;

        let (notify_tx, notify_rx) = mpsc::channel(options.notification_queue_capacity);
        let policy = ReconnectPolicy::with_max_delay(options.reconnect_max_delay());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: options.max_connection_failures,
            recovery_timeout: options.reconnect_max_delay(),
            half_open_requests: 1,
        });
        let (events, _) = broadcast::channel(16);

        let hub = Arc::new(Self {
            factory,
            state: Mutex::new(HubState {
                connection_state: ConnectionState::Disconnected,
                connection_failures: 0,
                consecutive_timeouts: 0,
                reconnect_delay: policy.initial_delay,
                breaker,
                stats: ReconnectStats::default(),
            }),
            options,
            policy,
            transport: tokio::sync::Mutex::new(None),
            registry: Arc::new(NotificationRegistry::new()),
            notify_tx,
            epoch: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(HubTasks::default()),
            events,
            closed: AtomicBool::new(false),
        });

        if let Err(e) = hub.connect().await {
            error!("Failed to connect to PLC at {}: {}", hub.factory.describe(), e);
            return Err(e);
        }

        {
            let mut tasks = hub.tasks.lock();
            tasks.dispatcher = Some(tokio::spawn(dispatch_loop(
                notify_rx,
                hub.registry.clone(),
                hub.epoch.clone(),
            )));
            tasks.health = Some(tokio::spawn(health_loop(Arc::downgrade(&hub))));
        }
        Ok(hub)
    }

    /// Cancel background work, remove every subscription and close the transport
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.reconnect.take() {
                task.abort();
            }
            if let Some(task) = tasks.health.take() {
                task.abort();
            }
        }

        self.unsubscribe_all().await;
        self.teardown().await;
        self.tasks.lock().abort_all();
        info!("ADS hub closed: {}", self.factory.describe());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection_state.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    /// Connected, breaker closed and both failure budgets intact
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        self.healthy_locked(&state)
    }

    fn healthy_locked(&self, state: &HubState) -> bool {
        state.connection_state.is_connected()
            && state.breaker.is_healthy()
            && state.connection_failures < self.options.max_connection_failures
            && state.consecutive_timeouts < MAX_CONSECUTIVE_TIMEOUTS
    }

    pub fn options(&self) -> &AdsOptions {
        &self.options
    }

    pub fn notifications_enabled(&self) -> bool {
        self.options.use_notifications
    }

    /// Receive connection lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> HubStatus {
        let state = self.state.lock();
        HubStatus {
            connection_state: state.connection_state,
            connection_failures: state.connection_failures,
            consecutive_timeouts: state.consecutive_timeouts,
            reconnect_delay_secs: state.reconnect_delay.as_secs_f64(),
            breaker_state: state.breaker.state(),
            notifications_enabled: self.options.use_notifications,
            subscriptions: self.registry.len(),
            armed_subscriptions: self.registry.armed(),
            dropped_notifications: self.dropped.load(Ordering::Relaxed),
            healthy: self.healthy_locked(&state),
            reconnect: state.stats.clone(),
        }
    }

    // ========================================================================
    // Read / write
    // ========================================================================

    pub async fn read_value(self: &Arc<Self>, address: &str, ty: ProtocolType) -> Result<PlcValue> {
        self.read_value_with_timeout(address, ty, self.options.operation_timeout())
            .await
    }

    /// Read and decode one variable within `deadline`
    pub async fn read_value_with_timeout(
        self: &Arc<Self>,
        address: &str,
        ty: ProtocolType,
        deadline: Duration,
    ) -> Result<PlcValue> {
        self.admit()?;
        let attempt = timeout(deadline, async {
            let mut slot = self.transport.lock().await;
            let transport = slot.as_mut().ok_or(AdsError::NotConnected)?;
            transport.read_by_name(address, ty.byte_size()).await
        })
        .await;
        let data = self.settle(address, flatten(attempt, deadline))?;
        decoder::decode(ty, &data)
    }

    pub async fn write_value(
        self: &Arc<Self>,
        address: &str,
        value: &PlcValue,
        ty: ProtocolType,
    ) -> Result<()> {
        self.write_value_with_timeout(address, value, ty, self.options.operation_timeout())
            .await
    }

    /// Encode and write one variable within `deadline`
    pub async fn write_value_with_timeout(
        self: &Arc<Self>,
        address: &str,
        value: &PlcValue,
        ty: ProtocolType,
        deadline: Duration,
    ) -> Result<()> {
        let data = decoder::encode(value, ty)?;
        self.admit()?;
        let attempt = timeout(deadline, async {
            let mut slot = self.transport.lock().await;
            let transport = slot.as_mut().ok_or(AdsError::NotConnected)?;
            transport.write_by_name(address, &data).await
        })
        .await;
        self.settle(address, flatten(attempt, deadline))?;
        debug!("Wrote {} to {}", value, address);
        Ok(())
    }

    /// Gate an operation on connection state and breaker
    fn admit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connection_state.is_connected() {
            return Err(AdsError::NotConnected);
        }
        if !state.breaker.can_execute() {
            return Err(AdsError::CircuitOpen);
        }
        Ok(())
    }

    /// Account the outcome of an attempted operation
    fn settle<T>(self: &Arc<Self>, address: &str, result: Result<T>) -> Result<T> {
        let err = match &result {
            Ok(_) => {
                let mut state = self.state.lock();
                state.connection_failures = 0;
                state.consecutive_timeouts = 0;
                state.breaker.record_success();
                return result;
            },
            Err(e) => e,
        };

        if err.is_timeout() {
            let ceiling_hit = {
                let mut state = self.state.lock();
                state.consecutive_timeouts += 1;
                state.connection_failures += 1;
                state.breaker.record_failure();
                warn!(
                    "{} (timeout {}/{})",
                    err.describe_for(address),
                    state.consecutive_timeouts,
                    MAX_CONSECUTIVE_TIMEOUTS
                );
                state.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS
                    && state.connection_state.is_connected()
            };
            if ceiling_hit {
                error!("Too many consecutive timeouts, forcing reconnection");
                self.mark_down();
                self.start_reconnect(true);
            }
        } else if err.is_transport_failure() {
            let mut state = self.state.lock();
            state.connection_failures += 1;
            state.breaker.record_failure();
            debug!(
                "{} (failure {}/{})",
                err.describe_for(address),
                state.connection_failures,
                self.options.max_connection_failures
            );
            if state.connection_failures >= self.options.max_connection_failures {
                warn!("Multiple failures accessing PLC, connection will be tested");
            }
        }
        result
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register an on-change notification
    ///
    /// Best effort: returns `None` when not connected, when notifications are
    /// disabled, or when the device refuses the registration.
    pub async fn subscribe(
        &self,
        address: &str,
        ty: ProtocolType,
        callback: NotificationCallback,
    ) -> Option<SubscriptionId> {
        if !self.options.use_notifications || !self.is_connected() {
            return None;
        }
        if !ty.is_supported() {
            debug!("Subscribing to {} with undecoded type {}", address, ty);
        }

        let deadline = self.options.operation_timeout();
        let attempt = timeout(deadline, async {
            let mut slot = self.transport.lock().await;
            let transport = slot.as_mut().ok_or(AdsError::NotConnected)?;
            let handle = transport.add_notification(address, ty.byte_size()).await?;
            let id = self.registry.allocate_id();
            self.registry.insert(id, address, ty, callback, handle);
            Ok((id, handle))
        })
        .await;

        match flatten(attempt, deadline) {
            Ok((id, handle)) => {
                debug!("Added device notification {} for variable {}", handle, address);
                info!("Successfully setup notification for {} ({})", address, id);
                Some(id)
            },
            Err(e) => {
                warn!("Error subscribing to {}: {}", address, e);
                None
            },
        }
    }

    /// Remove one subscription; transport-side removal is best effort
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(sub) = self.registry.remove(id) else {
            return false;
        };
        if let Some(handle) = sub.transport_handle {
            self.delete_notifications(vec![handle]).await;
        }
        debug!("Removed subscription {} for {}", id, sub.address);
        true
    }

    /// Remove every subscription, tolerating individual failures
    pub async fn unsubscribe_all(&self) {
        let handles: Vec<_> = self
            .registry
            .drain()
            .into_iter()
            .filter_map(|sub| sub.transport_handle)
            .collect();
        if !handles.is_empty() {
            self.delete_notifications(handles).await;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether subscription `id` holds a handle on the current connection
    pub fn is_armed(&self, id: SubscriptionId) -> bool {
        self.registry.is_armed(id)
    }

    async fn delete_notifications(&self, handles: Vec<u32>) {
        let deadline = self.options.operation_timeout();
        let cleanup = async {
            let mut slot = self.transport.lock().await;
            let Some(transport) = slot.as_mut() else {
                return;
            };
            for handle in handles {
                debug!("Deleting device notification {}", handle);
                if let Err(e) = transport.del_notification(handle).await {
                    debug!("Error deleting notification: {}", e);
                }
            }
        };
        if timeout(deadline, cleanup).await.is_err() {
            debug!("Notification cleanup timed out");
        }
    }

    /// Re-register every subscription that lost its handle
    async fn rearm_subscriptions(&self) {
        let pending = self.registry.pending();
        if pending.is_empty() {
            return;
        }
        let deadline = self.options.operation_timeout();
        let mut slot = self.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            return;
        };
        let mut armed = 0;
        for (id, address, ty) in pending {
            match timeout(deadline, transport.add_notification(&address, ty.byte_size())).await {
                Ok(Ok(handle)) => {
                    if self.registry.attach(id, handle) {
                        armed += 1;
                    } else if let Err(e) = transport.del_notification(handle).await {
                        debug!("Error deleting orphaned notification: {}", e);
                    }
                },
                Ok(Err(e)) => debug!("Failed to re-setup notification for {}: {}", address, e),
                Err(_) => debug!("Timed out re-arming notification for {}", address),
            }
        }
        info!("Re-armed {} notification(s)", armed);
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open a fresh transport and verify it with a state query
    async fn connect(&self) -> Result<()> {
        self.state.lock().connection_state = ConnectionState::Connecting;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = NotificationSink::new(self.notify_tx.clone(), epoch, self.dropped.clone());
        let mut transport = self.factory.create(sink);

        let deadline = self.options.operation_timeout();
        let verified = flatten(timeout(deadline, open_and_verify(transport.as_mut())).await, deadline);
        let device = match verified {
            Ok(device) => device,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("Error closing failed transport: {}", close_err);
                }
                self.state.lock().connection_state = ConnectionState::Disconnected;
                return Err(e);
            },
        };
        if !device.is_running() {
            warn!(
                "PLC answered but is not in RUN state (ads_state={})",
                device.ads_state
            );
        }

        let mut slot = self.transport.lock().await;
        if let Some(mut old) = slot.replace(transport) {
            if let Err(e) = old.close().await {
                debug!("Error closing previous transport: {}", e);
            }
        }

        // `close` sets the flag before its teardown takes the slot
        let installed = {
            let mut state = self.state.lock();
            if self.is_closed() {
                state.connection_state = ConnectionState::Disconnected;
                false
            } else {
                state.connection_state = ConnectionState::Connected;
                state.connection_failures = 0;
                state.consecutive_timeouts = 0;
                state.reconnect_delay = self.policy.initial_delay;
                state.breaker.record_success();
                state.stats.last_connected = Some(std::time::Instant::now());
                true
            }
        };
        if installed {
            info!("Connected to PLC at {}", self.factory.describe());
            return Ok(());
        }

        debug!("Hub closed while connecting, dropping new connection");
        if let Some(mut fresh) = slot.take() {
            if let Err(e) = fresh.close().await {
                debug!("Error closing abandoned transport: {}", e);
            }
        }
        Err(AdsError::NotConnected)
    }

    /// Flag the connection as down so new operations fail fast
    fn mark_down(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            let was = state.connection_state.is_connected();
            state.connection_state = ConnectionState::Disconnected;
            was
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if was_connected {
            let _ = self.events.send(HubEvent::Disconnected);
        }
    }

    /// Detach subscriptions and close the transport
    async fn teardown(&self) {
        self.mark_down();
        let handles = self.registry.detach_all();
        let deadline = self.options.operation_timeout();

        let mut slot = self.transport.lock().await;
        let Some(mut transport) = slot.take() else {
            return;
        };
        let cleanup = async {
            for handle in handles {
                if let Err(e) = transport.del_notification(handle).await {
                    debug!("Error deleting notification {}: {}", handle, e);
                }
            }
            if let Err(e) = transport.close().await {
                debug!("Error closing PLC connection: {}", e);
            }
        };
        if timeout(deadline, cleanup).await.is_err() {
            debug!("Transport teardown timed out");
        }
    }

    /// Administrative reconnect: reset budgets, tear down, reconnect
    pub async fn force_reconnect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        info!("Forcing reconnection...");
        {
            let mut state = self.state.lock();
            state.connection_failures = 0;
            state.consecutive_timeouts = 0;
        }
        self.teardown().await;
        self.start_reconnect(false);
    }

    /// Start the reconnect loop unless one is already running
    fn start_reconnect(self: &Arc<Self>, teardown_first: bool) {
        if self.is_closed() {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            trace!("Reconnect already in progress");
            return;
        }
        let hub = Arc::downgrade(self);
        tasks.reconnect = Some(tokio::spawn(async move {
            if teardown_first {
                if let Some(hub) = hub.upgrade() {
                    hub.teardown().await;
                }
            }
            reconnect_loop(hub).await;
        }));
    }

    /// One health check pass
    async fn check_connection(self: &Arc<Self>) {
        let (connected, breached) = {
            let state = self.state.lock();
            (
                state.connection_state.is_connected(),
                state.connection_failures >= self.options.max_connection_failures
                    || state.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS,
            )
        };
        if !connected {
            self.start_reconnect(false);
            return;
        }
        if !breached {
            return;
        }

        let deadline = self.options.operation_timeout();
        let probe = timeout(deadline, async {
            let mut slot = self.transport.lock().await;
            let transport = slot.as_mut().ok_or(AdsError::NotConnected)?;
            transport.read_state().await
        })
        .await;

        match flatten(probe, deadline) {
            Ok(_) => {
                let mut state = self.state.lock();
                state.connection_failures = 0;
                state.consecutive_timeouts = 0;
                state.reconnect_delay = self.policy.initial_delay;
                debug!("Connection test passed, failure counters reset");
            },
            Err(e) => {
                warn!("Connection test failed: {}", e);
                self.mark_down();
                self.start_reconnect(true);
            },
        }
    }
}

impl Drop for AdsHub {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

async fn open_and_verify(transport: &mut dyn AdsTransport) -> Result<DeviceState> {
    transport.open().await?;
    transport.read_state().await
}

/// Collapse a timed-out attempt into the error taxonomy
fn flatten<T>(
    attempt: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    deadline: Duration,
) -> Result<T> {
    match attempt {
        Ok(result) => result,
        Err(_) => Err(AdsError::timeout(format!("Operation timeout ({}s)", deadline.as_secs_f64()))),
    }
}

async fn reconnect_loop(hub: Weak<AdsHub>) {
    loop {
        let Some(strong) = hub.upgrade() else {
            return;
        };
        if strong.is_closed() || strong.is_connected() {
            return;
        }

        info!("Attempting to reconnect to PLC at {}...", strong.factory.describe());
        strong.state.lock().stats.total_attempts += 1;
        match strong.connect().await {
            Ok(()) => {
                strong.state.lock().stats.successful_reconnects += 1;
                strong.rearm_subscriptions().await;
                if strong.is_closed() {
                    return;
                }
                info!("Connection restored");
                let _ = strong.events.send(HubEvent::Reconnected);
                return;
            },
            Err(_) if strong.is_closed() => return,
            Err(e) => {
                debug!("Reconnection failed: {}", e);
                let delay = {
                    let mut state = strong.state.lock();
                    state.stats.failed_reconnects += 1;
                    let delay = state.reconnect_delay;
                    state.reconnect_delay = strong.policy.next_delay(delay);
                    delay
                };
                drop(strong);
                tokio::time::sleep(delay).await;
            },
        }
    }
}

async fn health_loop(hub: Weak<AdsHub>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            return;
        };
        if hub.is_closed() {
            return;
        }
        hub.check_connection().await;
    }
}

/// Decode queued samples and hand them to subscriber callbacks
async fn dispatch_loop(
    mut rx: mpsc::Receiver<RawNotification>,
    registry: Arc<NotificationRegistry>,
    epoch: Arc<AtomicU64>,
) {
    while let Some(raw) = rx.recv().await {
        if raw.epoch != epoch.load(Ordering::SeqCst) {
            trace!("Dropping stale notification {} from epoch {}", raw.handle, raw.epoch);
            continue;
        }
        let Some(target) = registry.lookup(raw.handle) else {
            debug!("Unknown device notification handle: {}", raw.handle);
            continue;
        };
        match decoder::decode(target.value_type, &raw.data) {
            Ok(value) => (target.callback)(&target.address, &value),
            Err(e) => debug!("Error decoding notification for {}: {}", target.address, e),
        }
    }
}

#[cfg(all(test, feature = "virt"))]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::virt::VirtualPlc;
    use tracing_test::traced_test;

    fn options() -> AdsOptions {
        AdsOptions {
            operation_timeout_secs: 1,
            ..Default::default()
        }
    }

    async fn hub_with(plc: &VirtualPlc, options: AdsOptions) -> Arc<AdsHub> {
        AdsHub::setup(Arc::new(plc.factory()), options).await.unwrap()
    }

    fn plc() -> VirtualPlc {
        let plc = VirtualPlc::new();
        plc.set("GVL.rTemp", 21.5, ProtocolType::Real).unwrap();
        plc.set("GVL.bRun", false, ProtocolType::Bool).unwrap();
        plc
    }

    async fn settle_tasks() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_read_write() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        assert!(hub.is_connected());
        assert!(hub.is_healthy());

        let value = hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap();
        assert_eq!(value, PlcValue::Float(21.5));

        hub.write_value("GVL.bRun", &PlcValue::Bool(true), ProtocolType::Bool)
            .await
            .unwrap();
        assert_eq!(plc.get("GVL.bRun", ProtocolType::Bool), Some(PlcValue::Bool(true)));
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fails_when_unreachable() {
        let plc = plc();
        plc.set_reachable(false);
        let result = AdsHub::setup(Arc::new(plc.factory()), options()).await;
        assert!(matches!(result, Err(AdsError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_rejects_invalid_options() {
        let plc = plc();
        let bad = AdsOptions {
            operation_timeout_secs: 60,
            ..Default::default()
        };
        let result = AdsHub::setup(Arc::new(plc.factory()), bad).await;
        assert!(matches!(result, Err(AdsError::Config(_))));
        assert_eq!(plc.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_makes_no_attempt() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.set_reachable(false);
        hub.force_reconnect().await;

        let reads = plc.read_count();
        let err = hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err();
        assert_eq!(err, AdsError::NotConnected);
        assert_eq!(plc.read_count(), reads);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.fail_address("GVL.rTemp", AdsError::transport("io"));

        for _ in 0..3 {
            let err = hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err();
            assert!(matches!(err, AdsError::Transport(_)));
        }
        let reads = plc.read_count();
        let err = hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err();
        assert_eq!(err, AdsError::CircuitOpen);
        assert_eq!(plc.read_count(), reads);
        assert!(!hub.is_healthy());
        // Writes share the same gate
        let err = hub
            .write_value("GVL.bRun", &PlcValue::Bool(true), ProtocolType::Bool)
            .await
            .unwrap_err();
        assert_eq!(err, AdsError::CircuitOpen);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counters() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.fail_next_reads(2, AdsError::transport("io"));
        assert!(hub.read_value("GVL.rTemp", ProtocolType::Real).await.is_err());
        assert!(hub.read_value("GVL.rTemp", ProtocolType::Real).await.is_err());
        assert_eq!(hub.status().connection_failures, 2);

        hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap();
        let status = hub.status();
        assert_eq!(status.connection_failures, 0);
        assert_eq!(status.breaker_state, CircuitState::Closed);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timeout_ceiling_forces_reconnect() {
        let plc = plc();
        let hub = hub_with(
            &plc,
            AdsOptions {
                max_connection_failures: 10,
                ..options()
            },
        )
        .await;
        let mut events = hub.subscribe_events();
        plc.set_read_delay(Some(Duration::from_secs(30)));

        for n in 1..=MAX_CONSECUTIVE_TIMEOUTS {
            let err = hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err();
            assert!(err.is_timeout(), "read {n}: {err:?}");
        }
        assert!(logs_contain("Too many consecutive timeouts"));
        assert_eq!(events.recv().await.unwrap(), HubEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), HubEvent::Reconnected);
        assert!(hub.is_connected());
        assert_eq!(plc.open_count(), 2);
        assert_eq!(hub.status().consecutive_timeouts, 0);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_and_reset() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.set_reachable(false);
        hub.force_reconnect().await;
        settle_tasks().await;

        // First attempt failed immediately, now sleeping 5s
        assert_eq!(hub.status().reconnect_delay_secs, 10.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hub.status().reconnect_delay_secs, 20.0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hub.status().reconnect_delay_secs, 40.0);

        plc.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let status = hub.status();
        assert_eq!(status.connection_state, ConnectionState::Connected);
        assert_eq!(status.reconnect_delay_secs, 5.0);
        assert_eq!(status.reconnect.failed_reconnects, 3);
        assert_eq!(status.reconnect.successful_reconnects, 1);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reconnects_after_drop() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.drop_connection();

        // Failed reads breach the budget, the next health check probes and reconnects
        for _ in 0..3 {
            assert!(hub.read_value("GVL.rTemp", ProtocolType::Real).await.is_err());
        }
        tokio::time::sleep(HEALTH_CHECK_INTERVAL + Duration::from_millis(10)).await;
        assert!(hub.is_connected());
        assert_eq!(plc.open_count(), 2);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_survives_reconnect() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: NotificationCallback = Arc::new(move |address: &str, value: &PlcValue| {
            let _ = tx.send((address.to_string(), value.clone()));
        });

        let id = hub
            .subscribe("GVL.bRun", ProtocolType::Bool, callback)
            .await
            .unwrap();
        plc.set("GVL.bRun", true, ProtocolType::Bool).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ("GVL.bRun".to_string(), PlcValue::Bool(true))
        );

        hub.force_reconnect().await;
        settle_tasks().await;
        assert!(hub.is_connected());
        assert_eq!(hub.status().armed_subscriptions, 1);
        assert_eq!(plc.active_notifications(), 1);

        plc.set("GVL.bRun", false, ProtocolType::Bool).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ("GVL.bRun".to_string(), PlcValue::Bool(false))
        );

        assert!(hub.unsubscribe(id).await);
        assert!(!hub.unsubscribe(id).await);
        assert_eq!(plc.active_notifications(), 0);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_best_effort() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        let noop: NotificationCallback = Arc::new(|_: &str, _: &PlcValue| {});

        assert!(hub
            .subscribe("GVL.missing", ProtocolType::Int, noop.clone())
            .await
            .is_none());

        plc.set_notifications_supported(false);
        assert!(hub
            .subscribe("GVL.bRun", ProtocolType::Bool, noop.clone())
            .await
            .is_none());
        hub.close().await;

        let disabled = hub_with(
            &plc,
            AdsOptions {
                use_notifications: false,
                ..options()
            },
        )
        .await;
        plc.set_notifications_supported(true);
        assert!(disabled
            .subscribe("GVL.bRun", ProtocolType::Bool, noop)
            .await
            .is_none());
        disabled.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        let noop: NotificationCallback = Arc::new(|_: &str, _: &PlcValue| {});
        hub.subscribe("GVL.bRun", ProtocolType::Bool, noop).await.unwrap();

        hub.close().await;
        hub.close().await;
        assert!(!plc.is_connected());
        assert_eq!(plc.deleted_notifications(), 1);
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(
            hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err(),
            AdsError::NotConnected
        );
        // No reconnect after close
        hub.force_reconnect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(plc.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_slow_connect_stays_closed() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        plc.set_open_delay(Some(Duration::from_millis(500)));

        // A connect attempt that close() cannot cancel
        let connecting = tokio::spawn({
            let hub = hub.clone();
            async move { hub.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.close().await;

        assert!(connecting.await.unwrap().is_err());
        assert!(!hub.is_connected());
        assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
        assert!(!plc.is_connected());
        assert_eq!(
            hub.read_value("GVL.rTemp", ProtocolType::Real).await.unwrap_err(),
            AdsError::NotConnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_reconnecting() {
        let plc = plc();
        let hub = hub_with(&plc, options()).await;
        let mut events = hub.subscribe_events();
        plc.set_open_delay(Some(Duration::from_millis(500)));

        hub.force_reconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.close().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!hub.is_connected());
        assert!(!plc.is_connected());
        assert_eq!(events.recv().await.unwrap(), HubEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(hub.status().reconnect.successful_reconnects, 0);
    }
}
