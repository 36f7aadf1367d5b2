//! AMS/TCP connection
//!
//! One TCP stream per transport. Requests are written through a framed sink
//! and correlated with responses by invoke id; a reader task owns the read
//! half, completes pending requests and forwards device notifications to the
//! hub's [`NotificationSink`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use super::constants::*;
use super::frame::{self, AmsAddr, AmsCodec, AmsFrame, AmsNetId};
use crate::config::EndpointConfig;
use crate::error::{AdsError, Result, ADSERR_DEVICE_INVALIDSYMBOL, ADSERR_DEVICE_SYMBOLNOTFOUND};
use crate::transport::{AdsTransport, NotificationSink, TransportFactory};
use crate::types::{DeviceState, NotificationHandle};

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<AmsFrame>>>>;

/// Removes a request's waiter when the caller stops waiting, however it stops
struct PendingGuard {
    pending: PendingMap,
    invoke_id: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.invoke_id);
    }
}

/// Connection parameters for one controller
#[derive(Debug, Clone)]
pub struct AmsTcpConfig {
    pub host: String,
    pub tcp_port: u16,
    pub target: AmsAddr,
    /// Local net id; derived from the socket's local IPv4 address when `None`
    pub local_net_id: Option<AmsNetId>,
    pub source_port: u16,
    /// Deadline for connecting and for each request
    pub timeout: Duration,
}

impl AmsTcpConfig {
    pub fn from_endpoint(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let target_net_id: AmsNetId = endpoint.ams_net_id.parse()?;
        let local_net_id: Option<AmsNetId> = endpoint
            .local_ams_net_id
            .as_deref()
            .map(str::parse)
            .transpose()?;
        Ok(Self {
            host: endpoint.host.clone(),
            tcp_port: endpoint.tcp_port,
            target: AmsAddr::new(target_net_id, endpoint.port),
            local_net_id,
            source_port: endpoint.source_port,
            timeout,
        })
    }
}

struct Link {
    writer: FramedWrite<OwnedWriteHalf, AmsCodec>,
    source: AmsAddr,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// ADS transport speaking AMS/TCP directly to a router or runtime
pub struct AmsTcpTransport {
    config: AmsTcpConfig,
    sink: NotificationSink,
    link: Option<Link>,
    invoke_id: u32,
    /// Symbol name to variable handle, valid for the current connection
    symbol_handles: HashMap<String, u32>,
}

impl AmsTcpTransport {
    pub fn new(config: AmsTcpConfig, sink: NotificationSink) -> Self {
        Self {
            config,
            sink,
            link: None,
            invoke_id: 0,
            symbol_handles: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| !link.closed.load(Ordering::SeqCst))
    }

    async fn request(&mut self, command: u16, payload: Vec<u8>) -> Result<AmsFrame> {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        let invoke_id = self.invoke_id;
        let deadline = self.config.timeout;
        let target = self.config.target;
        let link = self.link.as_mut().ok_or(AdsError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = link.pending.lock();
            if link.closed.load(Ordering::SeqCst) {
                return Err(AdsError::transport("AMS connection closed by peer"));
            }
            pending.insert(invoke_id, tx);
        }
        let _waiter = PendingGuard {
            pending: link.pending.clone(),
            invoke_id,
        };

        let request = AmsFrame::request(target, link.source, command, invoke_id, payload);
        if let Err(e) = link.writer.send(request).await {
            error!("AMS TX: {}", e);
            return Err(e);
        }
        trace!("AMS TX: cmd={} invoke={}", command, invoke_id);

        let response = match timeout(deadline, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                return Err(AdsError::transport(
                    "AMS connection closed while waiting for response",
                ))
            },
            Err(_) => {
                return Err(AdsError::timeout(format!(
                    "No response to command {command} within {deadline:?}"
                )));
            },
        };

        if response.header.error_code != 0 {
            return Err(AdsError::from_ads_code(response.header.error_code));
        }
        if response.header.command != command {
            return Err(AdsError::transport(format!(
                "Response command {} does not match request {command}",
                response.header.command
            )));
        }
        Ok(response)
    }

    #[cfg(test)]
    fn pending_requests(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.pending.lock().len())
    }

    async fn symbol_handle(&mut self, name: &str) -> Result<u32> {
        if let Some(&handle) = self.symbol_handles.get(name) {
            return Ok(handle);
        }
        let payload = frame::read_write_request(ADSIGRP_SYM_HNDBYNAME, 0, 4, name.as_bytes());
        let response = self.request(CMD_READ_WRITE, payload).await?;
        let data = frame::parse_read_response(&response.data)?;
        let bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| AdsError::invalid_data(format!("Short symbol handle for {name}")))?;
        let handle = u32::from_le_bytes(bytes);
        debug!("Symbol handle {} = 0x{:X}", name, handle);
        self.symbol_handles.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// Drop a cached handle the device no longer recognizes
    fn forget_symbol_on(&mut self, name: &str, err: &AdsError) {
        if let AdsError::Device { code, .. } = err {
            if *code == ADSERR_DEVICE_INVALIDSYMBOL || *code == ADSERR_DEVICE_SYMBOLNOTFOUND {
                self.symbol_handles.remove(name);
            }
        }
    }

    async fn release_handles(&mut self, handles: Vec<u32>) {
        for handle in handles {
            let payload = frame::write_request(ADSIGRP_SYM_RELEASEHND, 0, &handle.to_le_bytes());
            if let Err(e) = self.request(CMD_WRITE, payload).await {
                debug!("Release handle 0x{:X}: {}", handle, e);
                break;
            }
        }
    }
}

impl Drop for AmsTcpTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, AmsCodec>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    sink: NotificationSink,
) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(frame) if frame.header.command == CMD_DEVICE_NOTIFICATION => {
                match frame::parse_device_notification(&frame.data) {
                    Ok(samples) => {
                        for (handle, data) in samples {
                            sink.deliver(handle, data);
                        }
                    },
                    Err(e) => warn!("AMS notification malformed: {}", e),
                }
            },
            Ok(frame) => {
                let waiter = pending.lock().remove(&frame.header.invoke_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    },
                    None => debug!("AMS RX: no waiter for invoke {}", frame.header.invoke_id),
                }
            },
            Err(e) => {
                warn!("AMS RX: {}", e);
                break;
            },
        }
    }
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    debug!("AMS reader stopped");
}

#[async_trait]
impl AdsTransport for AmsTcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            self.close().await?;
        }

        let addr = format!("{}:{}", self.config.host, self.config.tcp_port);
        debug!("AMS connecting: {}", addr);
        let stream = match timeout(self.config.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("AMS err: {} - {}", addr, e);
                return Err(AdsError::transport(format!("Failed to connect to {addr}: {e}")));
            },
            Err(_) => {
                warn!("AMS timeout: {}", addr);
                return Err(AdsError::timeout(format!("Connection to {addr} timed out")));
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }

        let local_net_id = match (self.config.local_net_id, stream.local_addr()?) {
            (Some(id), _) => id,
            (None, SocketAddr::V4(local)) => AmsNetId::from_ipv4(*local.ip()),
            (None, SocketAddr::V6(_)) => {
                return Err(AdsError::config(
                    "local_ams_net_id is required for IPv6 connections",
                ))
            },
        };
        let source = AmsAddr::new(local_net_id, self.config.source_port);

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, AmsCodec),
            pending.clone(),
            closed.clone(),
            self.sink.clone(),
        ));

        self.link = Some(Link {
            writer: FramedWrite::new(write_half, AmsCodec),
            source,
            pending,
            closed,
            reader,
        });
        info!("AMS connected: {} as {} -> {}", addr, source, self.config.target);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }
        let handles: Vec<u32> = self.symbol_handles.drain().map(|(_, h)| h).collect();
        if self.is_open() && !handles.is_empty() {
            let deadline = self.config.timeout;
            if timeout(deadline, self.release_handles(handles)).await.is_err() {
                debug!("Symbol handle release timed out");
            }
        }

        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.writer.close().await {
                debug!("AMS shutdown: {}", e);
            }
            link.reader.abort();
            link.pending.lock().clear();
        }
        debug!("AMS closed: {}:{}", self.config.host, self.config.tcp_port);
        Ok(())
    }

    async fn read_state(&mut self) -> Result<DeviceState> {
        let response = self.request(CMD_READ_STATE, Vec::new()).await?;
        frame::parse_read_state_response(&response.data)
    }

    async fn read_by_name(&mut self, address: &str, size: u32) -> Result<Vec<u8>> {
        let handle = self.symbol_handle(address).await?;
        let payload = frame::read_request(ADSIGRP_SYM_VALBYHND, handle, size);
        let result = match self.request(CMD_READ, payload).await {
            Ok(response) => frame::parse_read_response(&response.data),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.forget_symbol_on(address, e);
        }
        result
    }

    async fn write_by_name(&mut self, address: &str, data: &[u8]) -> Result<()> {
        let handle = self.symbol_handle(address).await?;
        let payload = frame::write_request(ADSIGRP_SYM_VALBYHND, handle, data);
        let result = match self.request(CMD_WRITE, payload).await {
            Ok(response) => frame::parse_result(&response.data),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.forget_symbol_on(address, e);
        }
        result
    }

    async fn add_notification(&mut self, address: &str, size: u32) -> Result<NotificationHandle> {
        let handle = self.symbol_handle(address).await?;
        let payload = frame::add_notification_request(ADSIGRP_SYM_VALBYHND, handle, size);
        let response = self.request(CMD_ADD_NOTIFICATION, payload).await?;
        frame::parse_handle_response(&response.data)
    }

    async fn del_notification(&mut self, handle: NotificationHandle) -> Result<()> {
        let payload = frame::del_notification_request(handle);
        let response = self.request(CMD_DEL_NOTIFICATION, payload).await?;
        frame::parse_result(&response.data)
    }
}

/// Creates [`AmsTcpTransport`]s for one endpoint
#[derive(Debug, Clone)]
pub struct AmsTcpFactory {
    config: AmsTcpConfig,
}

impl AmsTcpFactory {
    pub fn new(config: AmsTcpConfig) -> Self {
        Self { config }
    }

    pub fn from_endpoint(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        Ok(Self::new(AmsTcpConfig::from_endpoint(endpoint, timeout)?))
    }
}

impl TransportFactory for AmsTcpFactory {
    fn describe(&self) -> String {
        format!(
            "{}:{} ({})",
            self.config.host, self.config.tcp_port, self.config.target
        )
    }

    fn create(&self, sink: NotificationSink) -> Box<dyn AdsTransport> {
        Box::new(AmsTcpTransport::new(self.config.clone(), sink))
    }
}
