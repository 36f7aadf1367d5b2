//! Session handle
//!
//! One [`AdsSession`] owns one hub and one polling coordinator for a single
//! controller. It is the object the host application keeps around and
//! threads through every later call.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::ams::AmsTcpFactory;
use crate::config::{validate_addresses, AddressConfig, AdsOptions, EndpointConfig, SessionConfig};
use crate::coordinator::{PollSnapshot, PollingCoordinator};
use crate::diagnostics::SessionDiagnostics;
use crate::error::Result;
use crate::hub::AdsHub;
use crate::transport::TransportFactory;
use crate::types::{NotificationCallback, PlcValue, ProtocolType, SubscriptionId};

pub struct AdsSession {
    endpoint: EndpointConfig,
    hub: Arc<AdsHub>,
    coordinator: Arc<PollingCoordinator>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl AdsSession {
    /// Validate configuration, connect and start polling
    ///
    /// Fails with a configuration error before any network activity, or with
    /// the connect error when the controller cannot be reached or verified.
    pub async fn setup(
        endpoint: EndpointConfig,
        options: AdsOptions,
        addresses: Vec<AddressConfig>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        endpoint.validate()?;
        options.validate()?;
        validate_addresses(&addresses)?;

        let hub = AdsHub::setup(factory, options).await?;
        let coordinator = PollingCoordinator::new(hub.clone(), &addresses);
        coordinator.setup_notifications().await;
        let poller = coordinator.spawn();

        info!(
            "ADS session ready: {} ({}), {} addresses",
            endpoint.host,
            endpoint.ams_net_id,
            addresses.len()
        );
        Ok(Self {
            endpoint,
            hub,
            coordinator,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// Open a session over AMS/TCP as described by `config`
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let factory = AmsTcpFactory::from_endpoint(&config.endpoint, config.options.operation_timeout())?;
        Self::setup(config.endpoint, config.options, config.addresses, Arc::new(factory)).await
    }

    pub async fn read_value(&self, address: &str, ty: ProtocolType) -> Result<PlcValue> {
        self.hub.read_value(address, ty).await
    }

    pub async fn write_value(&self, address: &str, value: &PlcValue, ty: ProtocolType) -> Result<()> {
        self.hub.write_value(address, value, ty).await
    }

    /// Best-effort change notification; `None` means the caller must poll
    pub async fn subscribe(
        &self,
        address: &str,
        ty: ProtocolType,
        callback: NotificationCallback,
    ) -> Option<SubscriptionId> {
        self.hub.subscribe(address, ty, callback).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id).await
    }

    /// Refresh every tracked address now
    pub async fn poll_now(&self) -> Result<BTreeMap<String, PlcValue>> {
        self.coordinator.refresh().await
    }

    pub fn is_available(&self, address: &str) -> bool {
        self.coordinator.availability(address)
    }

    pub fn is_healthy(&self) -> bool {
        self.hub.is_healthy()
    }

    pub async fn force_reconnect(&self) {
        self.hub.force_reconnect().await;
    }

    /// Replace the tracked address set; a refresh follows immediately
    pub async fn reconfigure(&self, addresses: Vec<AddressConfig>) -> Result<()> {
        validate_addresses(&addresses)?;
        self.coordinator.reconfigure(&addresses).await;
        Ok(())
    }

    /// Receiver of the snapshots published by each successful refresh
    pub fn watch(&self) -> watch::Receiver<PollSnapshot> {
        self.coordinator.watch()
    }

    /// Latest value of `address` from the last successful refresh
    pub fn value(&self, address: &str) -> Option<PlcValue> {
        self.coordinator.value(address)
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics::new(&self.endpoint, self.hub.status(), self.coordinator.status())
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn hub(&self) -> &Arc<AdsHub> {
        &self.hub
    }

    /// Stop polling, drop every subscription and close the connection
    pub async fn close(&self) {
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            self.coordinator.stop();
            poller.abort();
        }
        self.hub.close().await;
    }
}

impl Drop for AdsSession {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}
