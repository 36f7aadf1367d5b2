//! Polling coordinator
//!
//! Keeps one tracking entry per configured address and refreshes them in
//! batches. Addresses backed by a notification that is armed on the current
//! connection and has a cached value are served from the cache; everything
//! else is read through the hub, all reads of a cycle running concurrently.
//! Pushed values are published to watchers as they arrive. Failed reads fall back to the last known
//! value so that consumers do not see addresses vanish on a transient error.
//!
//! The address set is replaced wholesale on reconfiguration. Every entry set
//! carries a generation number; results and notifications belonging to an
//! older generation are discarded.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::AddressConfig;
use crate::error::{AdsError, Result};
use crate::hub::{AdsHub, HubEvent};
use crate::types::{NotificationCallback, PlcValue, ProtocolType, SubscriptionId};

/// Per-address error count at which the address is reported unavailable
pub const MAX_ADDRESS_ERRORS: u32 = 3;

/// Result of one successful refresh, as published to watchers
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollSnapshot {
    pub values: BTreeMap<String, PlcValue>,
    pub error_counts: BTreeMap<String, u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Coordinator health summary
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub tracked_addresses: usize,
    pub notification_addresses: usize,
    pub last_refresh_success: Option<bool>,
    pub last_error: Option<String>,
    /// Addresses with a non-zero error count
    pub error_counts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone)]
struct AddressEntry {
    value_type: ProtocolType,
    last_value: Option<PlcValue>,
    error_count: u32,
    use_notifications: bool,
    subscription: Option<SubscriptionId>,
}

impl AddressEntry {
    fn from_config(config: &AddressConfig) -> Self {
        Self {
            value_type: config.plc_type,
            last_value: None,
            error_count: 0,
            use_notifications: config.use_notifications,
            subscription: None,
        }
    }

    /// Served from the notification cache instead of the network
    ///
    /// Only while the subscription is armed on the current connection; one
    /// that failed to re-arm after a reconnect delivers nothing.
    fn cached_value(&self, hub: &AdsHub) -> Option<&PlcValue> {
        let live = self.subscription.is_some_and(|id| hub.is_armed(id));
        if self.use_notifications && live {
            self.last_value.as_ref()
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Tracked {
    generation: u64,
    entries: BTreeMap<String, AddressEntry>,
    /// Values of the latest successful refresh of this generation
    latest: BTreeMap<String, PlcValue>,
    last_success: Option<bool>,
    last_error: Option<String>,
}

impl Tracked {
    fn error_counts(&self) -> BTreeMap<String, u32> {
        self.entries
            .iter()
            .map(|(address, entry)| (address.clone(), entry.error_count))
            .collect()
    }

    fn record_failure(&mut self, err: &AdsError) {
        self.last_success = Some(false);
        self.last_error = Some(err.to_string());
    }
}

/// Batched polling over a configured address set
pub struct PollingCoordinator {
    hub: Arc<AdsHub>,
    tracked: Mutex<Tracked>,
    snapshots: watch::Sender<PollSnapshot>,
    refresh_requested: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl PollingCoordinator {
    pub fn new(hub: Arc<AdsHub>, addresses: &[AddressConfig]) -> Arc<Self> {
        let (snapshots, _) = watch::channel(PollSnapshot::default());
        let tracked = Tracked {
            generation: 1,
            entries: addresses
                .iter()
                .map(|config| (config.address.clone(), AddressEntry::from_config(config)))
                .collect(),
            ..Default::default()
        };
        Arc::new(Self {
            hub,
            tracked: Mutex::new(tracked),
            snapshots,
            refresh_requested: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Refresh every tracked address once
    pub async fn refresh(&self) -> Result<BTreeMap<String, PlcValue>> {
        if !self.hub.is_connected() {
            let err = AdsError::NotConnected;
            self.tracked.lock().record_failure(&err);
            return Err(err);
        }

        let (generation, mut data, reads) = {
            let tracked = self.tracked.lock();
            let mut cached = BTreeMap::new();
            let mut reads = Vec::new();
            for (address, entry) in &tracked.entries {
                match entry.cached_value(&self.hub) {
                    Some(value) => {
                        cached.insert(address.clone(), value.clone());
                    },
                    None => reads.push((address.clone(), entry.value_type)),
                }
            }
            (tracked.generation, cached, reads)
        };

        let results = join_all(reads.into_iter().map(|(address, ty)| async move {
            let result = self.hub.read_value(&address, ty).await;
            (address, result)
        }))
        .await;

        let mut tracked = self.tracked.lock();
        if tracked.generation != generation {
            debug!("Address set changed during refresh, discarding results");
            return Err(AdsError::PollFailed(
                "address configuration changed during refresh".to_string(),
            ));
        }

        let mut errors = Vec::new();
        for (address, result) in results {
            let Some(entry) = tracked.entries.get_mut(&address) else {
                continue;
            };
            match result {
                Ok(value) => {
                    entry.last_value = Some(value.clone());
                    entry.error_count = 0;
                    data.insert(address, value);
                },
                Err(e) => {
                    entry.error_count += 1;
                    errors.push(e.describe_for(&address));
                    if let Some(stale) = &entry.last_value {
                        data.insert(address, stale.clone());
                    }
                },
            }
        }

        if !errors.is_empty() && errors.len() < 5 {
            debug!("Some PLC reads failed: {}", errors[..errors.len().min(3)].join("; "));
        } else if !errors.is_empty() {
            warn!("Multiple PLC read failures: {} errors", errors.len());
        }

        if data.is_empty() && !errors.is_empty() {
            let err = AdsError::PollFailed(format!("All PLC reads failed: {}", errors[0]));
            tracked.record_failure(&err);
            return Err(err);
        }

        tracked.latest = data.clone();
        tracked.last_success = Some(true);
        tracked.last_error = None;
        let snapshot = PollSnapshot {
            values: data.clone(),
            error_counts: tracked.error_counts(),
            updated_at: Some(Utc::now()),
        };
        drop(tracked);
        self.snapshots.send_replace(snapshot);
        Ok(data)
    }

    /// Whether the value of `address` is trustworthy enough to present
    pub fn availability(&self, address: &str) -> bool {
        if !self.hub.is_connected() {
            return false;
        }
        let tracked = self.tracked.lock();
        tracked
            .entries
            .get(address)
            .is_some_and(|entry| entry.error_count < MAX_ADDRESS_ERRORS)
            && tracked.latest.contains_key(address)
    }

    /// Latest value of `address` from the last successful refresh
    pub fn value(&self, address: &str) -> Option<PlcValue> {
        self.tracked.lock().latest.get(address).cloned()
    }

    pub fn error_count(&self, address: &str) -> Option<u32> {
        self.tracked
            .lock()
            .entries
            .get(address)
            .map(|entry| entry.error_count)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.tracked.lock().entries.keys().cloned().collect()
    }

    /// Receiver of published snapshots
    pub fn watch(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshots.subscribe()
    }

    /// Ask the polling loop for an immediate refresh
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Replace the whole address set and schedule an immediate refresh
    pub async fn reconfigure(self: &Arc<Self>, addresses: &[AddressConfig]) {
        let stale: Vec<SubscriptionId> = {
            let mut tracked = self.tracked.lock();
            let stale = tracked
                .entries
                .values()
                .filter_map(|entry| entry.subscription)
                .collect();
            *tracked = Tracked {
                generation: tracked.generation + 1,
                entries: addresses
                    .iter()
                    .map(|config| (config.address.clone(), AddressEntry::from_config(config)))
                    .collect(),
                ..Default::default()
            };
            stale
        };
        info!("Updating address configuration with {} addresses", addresses.len());

        for id in stale {
            self.hub.unsubscribe(id).await;
        }
        self.setup_notifications().await;
        self.request_refresh();
    }

    /// Subscribe every notification-enabled address that has no live subscription
    pub async fn setup_notifications(self: &Arc<Self>) {
        if !self.hub.notifications_enabled() {
            return;
        }
        let (generation, wanted) = {
            let tracked = self.tracked.lock();
            let wanted: Vec<(String, ProtocolType)> = tracked
                .entries
                .iter()
                .filter(|(_, entry)| entry.use_notifications && entry.subscription.is_none())
                .map(|(address, entry)| (address.clone(), entry.value_type))
                .collect();
            (tracked.generation, wanted)
        };

        for (address, ty) in wanted {
            let coordinator = Arc::downgrade(self);
            let callback: NotificationCallback = Arc::new(move |name: &str, value: &PlcValue| {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.on_notification(generation, name, value);
                }
            });

            let Some(id) = self.hub.subscribe(&address, ty, callback).await else {
                debug!("No notification for {}, polling instead", address);
                continue;
            };
            let kept = {
                let mut tracked = self.tracked.lock();
                let current = tracked.generation;
                match tracked.entries.get_mut(&address) {
                    Some(entry) if current == generation => {
                        entry.subscription = Some(id);
                        true
                    },
                    _ => false,
                }
            };
            if kept {
                debug!("Setup notification for {}", address);
            } else {
                self.hub.unsubscribe(id).await;
            }
        }
    }

    /// Cache a pushed value and publish it without touching the network
    fn on_notification(&self, generation: u64, address: &str, value: &PlcValue) {
        let snapshot = {
            let mut tracked = self.tracked.lock();
            if tracked.generation != generation {
                return;
            }
            let Some(entry) = tracked.entries.get_mut(address) else {
                return;
            };
            entry.last_value = Some(value.clone());
            entry.error_count = 0;

            // Cached only until the address set has been refreshed once
            if tracked.latest.is_empty() {
                return;
            }
            tracked.latest.insert(address.to_string(), value.clone());
            PollSnapshot {
                values: tracked.latest.clone(),
                error_counts: tracked.error_counts(),
                updated_at: Some(Utc::now()),
            }
        };
        trace!("Publishing pushed value of {}", address);
        self.snapshots.send_replace(snapshot);
    }

    pub fn status(&self) -> CoordinatorStatus {
        let tracked = self.tracked.lock();
        CoordinatorStatus {
            tracked_addresses: tracked.entries.len(),
            notification_addresses: tracked
                .entries
                .values()
                .filter(|entry| entry.subscription.is_some())
                .count(),
            last_refresh_success: tracked.last_success,
            last_error: tracked.last_error.clone(),
            error_counts: tracked
                .entries
                .iter()
                .filter(|(_, entry)| entry.error_count > 0)
                .map(|(address, entry)| (address.clone(), entry.error_count))
                .collect(),
        }
    }

    /// Start the polling loop
    ///
    /// Refreshes every scan interval, on request and after every reconnect,
    /// until [`stop`](Self::stop) is called or the coordinator is dropped.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut ticker = interval(self.hub.options().scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(poll_loop(
            Arc::downgrade(self),
            self.hub.subscribe_events(),
            ticker,
            self.refresh_requested.clone(),
            self.shutdown.clone(),
        ))
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

/// Waits without holding the coordinator; it is upgraded only to do work
async fn poll_loop(
    coordinator: Weak<PollingCoordinator>,
    mut events: broadcast::Receiver<HubEvent>,
    mut ticker: Interval,
    refresh_requested: Arc<Notify>,
    shutdown: Arc<Notify>,
) {
    loop {
        let reconnected = tokio::select! {
            biased;

            _ = shutdown.notified() => {
                debug!("Polling loop received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(HubEvent::Reconnected) => true,
                Ok(HubEvent::Disconnected) => continue,
                Err(RecvError::Lagged(missed)) => {
                    debug!("Missed {} hub events", missed);
                    false
                },
                Err(RecvError::Closed) => break,
            },
            _ = refresh_requested.notified() => false,
            _ = ticker.tick() => false,
        };

        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if reconnected {
            info!("Connection restored, refreshing all addresses");
            coordinator.setup_notifications().await;
        }
        if let Err(e) = coordinator.refresh().await {
            debug!("Refresh failed: {}", e);
        }
    }
    debug!("Polling loop stopped");
}

#[cfg(all(test, feature = "virt"))]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::AdsOptions;
    use crate::virt::VirtualPlc;
    use std::time::Duration;

    const ADDRESSES: [&str; 5] = ["GVL.a", "GVL.b", "GVL.c", "GVL.d", "GVL.e"];

    fn plc() -> VirtualPlc {
        let plc = VirtualPlc::new();
        for (n, address) in ADDRESSES.iter().enumerate() {
            plc.set(address, n as i64, ProtocolType::Int).unwrap();
        }
        plc
    }

    fn polled(addresses: &[&str]) -> Vec<AddressConfig> {
        addresses
            .iter()
            .map(|address| AddressConfig {
                use_notifications: false,
                ..AddressConfig::new(*address, ProtocolType::Int)
            })
            .collect()
    }

    async fn coordinator(plc: &VirtualPlc, addresses: &[AddressConfig]) -> Arc<PollingCoordinator> {
        let options = AdsOptions {
            operation_timeout_secs: 1,
            ..Default::default()
        };
        let hub = AdsHub::setup(Arc::new(plc.factory()), options).await.unwrap();
        PollingCoordinator::new(hub, addresses)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_reads_every_address() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&ADDRESSES)).await;
        let values = c.refresh().await.unwrap();
        assert_eq!(values.len(), 5);
        assert_eq!(values["GVL.c"], PlcValue::Integer(2));
        assert_eq!(plc.read_count(), 5);
        assert!(ADDRESSES.iter().all(|a| c.availability(a)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_fall_back_to_stale_values() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&ADDRESSES)).await;
        c.refresh().await.unwrap();

        plc.fail_address("GVL.b", AdsError::transport("io"));
        plc.fail_address("GVL.d", AdsError::transport("io"));
        plc.set("GVL.a", 10, ProtocolType::Int).unwrap();

        let values = c.refresh().await.unwrap();
        assert_eq!(values.len(), 5);
        assert_eq!(values["GVL.a"], PlcValue::Integer(10));
        assert_eq!(values["GVL.b"], PlcValue::Integer(1));
        assert_eq!(values["GVL.d"], PlcValue::Integer(3));
        assert_eq!(c.error_count("GVL.b"), Some(1));
        assert_eq!(c.error_count("GVL.a"), Some(0));
        assert!(c.availability("GVL.b"));

        c.refresh().await.unwrap();
        assert!(c.availability("GVL.d"));
        c.refresh().await.unwrap();
        assert_eq!(c.error_count("GVL.d"), Some(3));
        assert!(!c.availability("GVL.b"));
        assert!(!c.availability("GVL.d"));
        assert!(c.availability("GVL.a"));

        let status = c.status();
        assert_eq!(status.error_counts.len(), 2);
        assert_eq!(status.last_refresh_success, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_when_disconnected_makes_no_reads() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&ADDRESSES)).await;
        plc.set_reachable(false);
        c.hub.force_reconnect().await;

        let reads = plc.read_count();
        assert_eq!(c.refresh().await.unwrap_err(), AdsError::NotConnected);
        assert_eq!(plc.read_count(), reads);
        assert!(!c.availability("GVL.a"));
        assert_eq!(c.status().last_refresh_success, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_without_fallback() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&["GVL.missing", "GVL.gone"])).await;
        let err = c.refresh().await.unwrap_err();
        assert!(matches!(err, AdsError::PollFailed(_)), "{err:?}");
        assert_eq!(c.error_count("GVL.missing"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_replaces_address_set() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&["GVL.a", "GVL.b"])).await;
        c.refresh().await.unwrap();

        c.reconfigure(&polled(&["GVL.c"])).await;
        assert!(!c.availability("GVL.a"));
        let values = c.refresh().await.unwrap();
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["GVL.c"]);
        assert_eq!(c.addresses(), vec!["GVL.c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_refresh_of_old_generation_is_discarded() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&["GVL.a"])).await;
        plc.set_read_delay(Some(Duration::from_millis(500)));

        let in_flight = tokio::spawn({
            let c = c.clone();
            async move { c.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.reconfigure(&polled(&["GVL.b"])).await;

        let stale = in_flight.await.unwrap();
        assert!(matches!(stale, Err(AdsError::PollFailed(_))));
        assert!(c.value("GVL.a").is_none());
        assert_eq!(c.error_count("GVL.b"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_cache_skips_reads() {
        let plc = plc();
        let addresses = vec![
            AddressConfig::new("GVL.a", ProtocolType::Int),
            AddressConfig {
                use_notifications: false,
                ..AddressConfig::new("GVL.b", ProtocolType::Int)
            },
        ];
        let c = coordinator(&plc, &addresses).await;
        c.setup_notifications().await;
        assert_eq!(c.status().notification_addresses, 1);

        plc.set("GVL.a", 42, ProtocolType::Int).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let values = c.refresh().await.unwrap();
        assert_eq!(values["GVL.a"], PlcValue::Integer(42));
        assert_eq!(plc.reads_of("GVL.a"), 0);
        assert_eq!(plc.reads_of("GVL.b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_loop_publishes_snapshots() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&["GVL.a", "GVL.b"])).await;
        let mut rx = c.watch();
        let task = c.spawn();

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.values.len(), 2);
        assert!(snapshot.updated_at.is_some());

        plc.set("GVL.a", 7, ProtocolType::Int).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().values["GVL.a"], PlcValue::Integer(7));

        c.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_subscription_is_read_over_the_network() {
        let plc = plc();
        let c = coordinator(&plc, &[AddressConfig::new("GVL.a", ProtocolType::Int)]).await;
        c.setup_notifications().await;
        plc.set("GVL.a", 42, ProtocolType::Int).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.refresh().await.unwrap()["GVL.a"], PlcValue::Integer(42));
        assert_eq!(plc.reads_of("GVL.a"), 0);

        // The subscription survives the reconnect but cannot be re-armed
        plc.set_notifications_supported(false);
        c.hub.force_reconnect().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(c.hub.is_connected());
        assert_eq!(c.hub.subscription_count(), 1);
        assert_eq!(c.hub.status().armed_subscriptions, 0);

        plc.set("GVL.a", 99, ProtocolType::Int).unwrap();
        let values = c.refresh().await.unwrap();
        assert_eq!(values["GVL.a"], PlcValue::Integer(99));
        assert_eq!(plc.reads_of("GVL.a"), 1);
        assert!(c.availability("GVL.a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_values_publish_without_network_reads() {
        let plc = plc();
        let addresses = vec![
            AddressConfig::new("GVL.a", ProtocolType::Int),
            AddressConfig {
                use_notifications: false,
                ..AddressConfig::new("GVL.b", ProtocolType::Int)
            },
        ];
        let c = coordinator(&plc, &addresses).await;
        c.setup_notifications().await;
        let mut rx = c.watch();
        let task = c.spawn();
        rx.changed().await.unwrap();
        let (reads_a, reads_b) = (plc.reads_of("GVL.a"), plc.reads_of("GVL.b"));
        assert_eq!(reads_b, 1);

        // 40 samples over 4s, all inside one scan interval
        for n in 0..40i64 {
            plc.set("GVL.a", 100 + n, ProtocolType::Int).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.values["GVL.a"], PlcValue::Integer(139));
        assert_eq!(snapshot.values["GVL.b"], PlcValue::Integer(1));
        assert_eq!(plc.reads_of("GVL.a"), reads_a);
        assert_eq!(plc.reads_of("GVL.b"), reads_b);
        assert_eq!(c.value("GVL.a"), Some(PlcValue::Integer(139)));

        c.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_loop_ends_when_coordinator_dropped() {
        let plc = plc();
        let c = coordinator(&plc, &polled(&["GVL.a"])).await;
        let hub = c.hub.clone();
        let task = c.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(plc.reads_of("GVL.a"), 1);

        drop(c);
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("polling loop kept the coordinator alive")
            .unwrap();
        hub.close().await;
    }
}
