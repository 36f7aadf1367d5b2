//! Virtual ADS controller
//!
//! An in-memory stand-in for a PLC, used by tests and by `ads-monitor --virt`.
//! The [`VirtualPlc`] handle is shared between the test (or demo) and every
//! transport the hub creates from its [`VirtFactory`], so failures can be
//! injected and traffic observed while the hub is running.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::decoder;
use crate::error::{AdsError, Result, ADSERR_DEVICE_SYMBOLNOTFOUND};
use crate::transport::{AdsTransport, NotificationSink, TransportFactory};
use crate::types::{DeviceState, NotificationHandle, PlcValue, ProtocolType};

/// ADS code for "notification handle invalid"
const ADSERR_DEVICE_NOTIFYHNDINVALID: u32 = 0x714;
/// ADS code for "service not supported"
const ADSERR_DEVICE_SRVNOTSUPP: u32 = 0x701;

#[derive(Default)]
struct VirtState {
    values: HashMap<String, Vec<u8>>,
    reachable: bool,
    ads_state: u16,
    /// Id of the connection currently accepted by the device
    active_session: Option<u64>,
    next_session: u64,
    sink: Option<NotificationSink>,
    notifications: HashMap<NotificationHandle, (String, u32)>,
    next_handle: NotificationHandle,
    notifications_supported: bool,
    read_delay: Option<Duration>,
    open_delay: Option<Duration>,
    failing_reads: u32,
    read_error: Option<AdsError>,
    failing_addresses: HashMap<String, AdsError>,
    read_count: u64,
    reads_by_address: HashMap<String, u64>,
    write_count: u64,
    open_count: u64,
    deleted_notifications: u64,
}

impl VirtState {
    fn notify(&self, address: &str) {
        let (Some(sink), Some(data)) = (&self.sink, self.values.get(address)) else {
            return;
        };
        for (handle, (addr, size)) in &self.notifications {
            if addr == address {
                let mut payload = data.clone();
                payload.resize(*size as usize, 0);
                sink.deliver(*handle, payload);
            }
        }
    }
}

/// Shared handle to a simulated controller
#[derive(Clone)]
pub struct VirtualPlc {
    state: Arc<Mutex<VirtState>>,
}

impl Default for VirtualPlc {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualPlc {
    /// A reachable controller in RUN state with no variables
    pub fn new() -> Self {
        let state = VirtState {
            reachable: true,
            ads_state: DeviceState::RUN,
            notifications_supported: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn factory(&self) -> VirtFactory {
        VirtFactory { plc: self.clone() }
    }

    /// Store a value, notifying any subscriber of `address`
    pub fn set(&self, address: &str, value: impl Into<PlcValue>, ty: ProtocolType) -> Result<()> {
        let bytes = decoder::encode(&value.into(), ty)?;
        self.set_raw(address, bytes);
        Ok(())
    }

    pub fn set_raw(&self, address: &str, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        state.values.insert(address.to_string(), bytes);
        state.notify(address);
    }

    pub fn get_raw(&self, address: &str) -> Option<Vec<u8>> {
        self.state.lock().values.get(address).cloned()
    }

    /// Decode the stored value of `address` as `ty`
    pub fn get(&self, address: &str, ty: ProtocolType) -> Option<PlcValue> {
        let bytes = self.get_raw(address)?;
        decoder::decode(ty, &bytes).ok()
    }

    /// Delete a variable; later accesses fail with "symbol not found"
    pub fn remove(&self, address: &str) {
        self.state.lock().values.remove(address);
    }

    /// Whether new connections are accepted
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Drop the active connection, as if the cable were pulled
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.active_session = None;
        state.sink = None;
        state.notifications.clear();
        debug!("Virtual PLC dropped its connection");
    }

    pub fn set_ads_state(&self, ads_state: u16) {
        self.state.lock().ads_state = ads_state;
    }

    pub fn set_notifications_supported(&self, supported: bool) {
        self.state.lock().notifications_supported = supported;
    }

    /// Delay every read; longer than the operation timeout simulates a hang
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// Delay connection setup, before the session is accepted
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.state.lock().open_delay = delay;
    }

    /// Fail the next `count` reads with `err`
    pub fn fail_next_reads(&self, count: u32, err: AdsError) {
        let mut state = self.state.lock();
        state.failing_reads = count;
        state.read_error = Some(err);
    }

    /// Fail every read of `address` with `err` until cleared
    pub fn fail_address(&self, address: &str, err: AdsError) {
        self.state
            .lock()
            .failing_addresses
            .insert(address.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_reads = 0;
        state.read_error = None;
        state.failing_addresses.clear();
        state.read_delay = None;
    }

    /// Push the current value of `address` to its subscribers again
    pub fn push_notification(&self, address: &str) {
        self.state.lock().notify(address);
    }

    /// Total reads that reached the device
    pub fn read_count(&self) -> u64 {
        self.state.lock().read_count
    }

    pub fn reads_of(&self, address: &str) -> u64 {
        self.state
            .lock()
            .reads_by_address
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn write_count(&self) -> u64 {
        self.state.lock().write_count
    }

    /// Number of successful connection opens
    pub fn open_count(&self) -> u64 {
        self.state.lock().open_count
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().active_session.is_some()
    }

    /// Notifications registered on the active connection
    pub fn active_notifications(&self) -> usize {
        self.state.lock().notifications.len()
    }

    pub fn deleted_notifications(&self) -> u64 {
        self.state.lock().deleted_notifications
    }
}

/// Transport bound to a [`VirtualPlc`]
pub struct VirtTransport {
    plc: VirtualPlc,
    sink: NotificationSink,
    session: Option<u64>,
}

impl VirtTransport {
    fn check_session(&self, state: &VirtState) -> Result<()> {
        match self.session {
            None => Err(AdsError::NotConnected),
            Some(id) if state.active_session == Some(id) => Ok(()),
            Some(_) => Err(AdsError::transport("virtual connection lost")),
        }
    }
}

#[async_trait]
impl AdsTransport for VirtTransport {
    async fn open(&mut self) -> Result<()> {
        let delay = self.plc.state.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.plc.state.lock();
        if !state.reachable {
            return Err(AdsError::transport("virtual PLC unreachable"));
        }
        state.next_session += 1;
        let id = state.next_session;
        state.active_session = Some(id);
        state.sink = Some(self.sink.clone());
        state.notifications.clear();
        state.open_count += 1;
        self.session = Some(id);
        debug!("Virtual PLC session {} opened", id);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(id) = self.session.take() else {
            return Ok(());
        };
        let mut state = self.plc.state.lock();
        if state.active_session == Some(id) {
            state.active_session = None;
            state.sink = None;
            state.notifications.clear();
        }
        Ok(())
    }

    async fn read_state(&mut self) -> Result<DeviceState> {
        let state = self.plc.state.lock();
        self.check_session(&state)?;
        Ok(DeviceState {
            ads_state: state.ads_state,
            device_state: 0,
        })
    }

    async fn read_by_name(&mut self, address: &str, size: u32) -> Result<Vec<u8>> {
        let delay = {
            let mut state = self.plc.state.lock();
            self.check_session(&state)?;
            state.read_count += 1;
            *state.reads_by_address.entry(address.to_string()).or_default() += 1;
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.plc.state.lock();
        self.check_session(&state)?;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            if let Some(err) = state.read_error.clone() {
                return Err(err);
            }
        }
        if let Some(err) = state.failing_addresses.get(address) {
            return Err(err.clone());
        }
        let mut data = state
            .values
            .get(address)
            .cloned()
            .ok_or_else(|| AdsError::from_ads_code(ADSERR_DEVICE_SYMBOLNOTFOUND))?;
        data.resize(size as usize, 0);
        Ok(data)
    }

    async fn write_by_name(&mut self, address: &str, data: &[u8]) -> Result<()> {
        let mut state = self.plc.state.lock();
        self.check_session(&state)?;
        if !state.values.contains_key(address) {
            return Err(AdsError::from_ads_code(ADSERR_DEVICE_SYMBOLNOTFOUND));
        }
        state.write_count += 1;
        state.values.insert(address.to_string(), data.to_vec());
        state.notify(address);
        Ok(())
    }

    async fn add_notification(&mut self, address: &str, size: u32) -> Result<NotificationHandle> {
        let mut state = self.plc.state.lock();
        self.check_session(&state)?;
        if !state.notifications_supported {
            return Err(AdsError::from_ads_code(ADSERR_DEVICE_SRVNOTSUPP));
        }
        if !state.values.contains_key(address) {
            return Err(AdsError::from_ads_code(ADSERR_DEVICE_SYMBOLNOTFOUND));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .notifications
            .insert(handle, (address.to_string(), size));
        Ok(handle)
    }

    async fn del_notification(&mut self, handle: NotificationHandle) -> Result<()> {
        let mut state = self.plc.state.lock();
        self.check_session(&state)?;
        if state.notifications.remove(&handle).is_none() {
            return Err(AdsError::from_ads_code(ADSERR_DEVICE_NOTIFYHNDINVALID));
        }
        state.deleted_notifications += 1;
        Ok(())
    }
}

/// Factory producing transports bound to one [`VirtualPlc`]
#[derive(Clone)]
pub struct VirtFactory {
    plc: VirtualPlc,
}

impl TransportFactory for VirtFactory {
    fn describe(&self) -> String {
        "virtual PLC".to_string()
    }

    fn create(&self, sink: NotificationSink) -> Box<dyn AdsTransport> {
        Box::new(VirtTransport {
            plc: self.plc.clone(),
            sink,
            session: None,
        })
    }
}
