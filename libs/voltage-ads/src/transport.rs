//! Transport seam between the hub and a concrete ADS implementation
//!
//! A transport is a single, non-reentrant connection to one controller. The
//! hub is the only caller and serializes every call behind its transport
//! lock. Notifications travel the other way: the transport pushes raw
//! samples into a [`NotificationSink`] from whatever thread or task receives
//! them, and the hub's dispatcher decodes them on the scheduler.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{DeviceState, NotificationHandle};

/// Raw notification sample as delivered by a transport
#[derive(Debug, Clone)]
pub struct RawNotification {
    /// Connection epoch of the transport that produced the sample
    pub epoch: u64,
    pub handle: NotificationHandle,
    pub data: Vec<u8>,
}

/// Non-blocking producer side of the notification channel
///
/// Safe to use from a foreign thread; `deliver` never waits.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<RawNotification>,
    epoch: u64,
    dropped: Arc<AtomicU64>,
}

impl NotificationSink {
    pub fn new(tx: mpsc::Sender<RawNotification>, epoch: u64, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, epoch, dropped }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Enqueue a sample; returns false when it had to be dropped
    pub fn deliver(&self, handle: NotificationHandle, data: Vec<u8>) -> bool {
        let item = RawNotification {
            epoch: self.epoch,
            handle,
            data,
        };
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(item)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Notification queue full, dropping sample for handle {} ({} dropped)",
                    item.handle, total
                );
                false
            },
            Err(TrySendError::Closed(item)) => {
                debug!("Notification dispatcher gone, dropping handle {}", item.handle);
                false
            },
        }
    }
}

/// A single connection to an ADS device
#[async_trait]
pub trait AdsTransport: Send {
    /// Open the underlying connection
    async fn open(&mut self) -> Result<()>;

    /// Close the connection; must be safe to call on a closed transport
    async fn close(&mut self) -> Result<()>;

    /// Lightweight status query used to verify a connection
    async fn read_state(&mut self) -> Result<DeviceState>;

    /// Read `size` bytes of the variable named `address`
    async fn read_by_name(&mut self, address: &str, size: u32) -> Result<Vec<u8>>;

    /// Write an encoded value to the variable named `address`
    async fn write_by_name(&mut self, address: &str, data: &[u8]) -> Result<()>;

    /// Register an on-change notification of `size` bytes for `address`
    async fn add_notification(&mut self, address: &str, size: u32) -> Result<NotificationHandle>;

    /// Remove a notification registered earlier on this connection
    async fn del_notification(&mut self, handle: NotificationHandle) -> Result<()>;
}

/// Creates a fresh transport for every connect attempt
pub trait TransportFactory: Send + Sync {
    /// Human readable endpoint description for logs
    fn describe(&self) -> String;

    fn create(&self, sink: NotificationSink) -> Box<dyn AdsTransport>;
}
