//! Session Integration Tests
//!
//! End-to-end behaviour of a session against the virtual controller:
//! - Notifications delivered to subscribers and kept across a dropped link
//! - Stale-value fallback and availability under failing reads
//! - Circuit breaker gating after repeated failures
//! - Scaled reads and writes

#![cfg(feature = "virt")]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voltage_ads::virt::VirtualPlc;
use voltage_ads::{
    AddressConfig, AdsError, AdsOptions, AdsSession, EndpointConfig, NotificationCallback,
    PlcValue, ProtocolType, Scaling,
};

fn endpoint() -> EndpointConfig {
    EndpointConfig::new("192.168.10.20", "192.168.10.20.1.1")
}

fn polled(address: &str, ty: ProtocolType) -> AddressConfig {
    AddressConfig {
        use_notifications: false,
        ..AddressConfig::new(address, ty)
    }
}

async fn open(plc: &VirtualPlc, options: AdsOptions, addresses: Vec<AddressConfig>) -> AdsSession {
    AdsSession::setup(endpoint(), options, addresses, Arc::new(plc.factory()))
        .await
        .unwrap()
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_subscription_survives_dropped_link() {
    let plc = VirtualPlc::new();
    plc.set("GVL.rSetpoint", 1.5, ProtocolType::Real).unwrap();
    plc.set("GVL.nHeartbeat", 0, ProtocolType::Dint).unwrap();

    let options = AdsOptions {
        scan_interval_secs: 1,
        ..Default::default()
    };
    let session = open(&plc, options, vec![polled("GVL.nHeartbeat", ProtocolType::Dint)]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: NotificationCallback = Arc::new(move |address: &str, value: &PlcValue| {
        let _ = tx.send((address.to_string(), value.clone()));
    });
    let id = session
        .subscribe("GVL.rSetpoint", ProtocolType::Real, callback)
        .await
        .unwrap();

    plc.set("GVL.rSetpoint", 2.5, ProtocolType::Real).unwrap();
    let (address, value) = rx.recv().await.unwrap();
    assert_eq!(address, "GVL.rSetpoint");
    assert_eq!(value, PlcValue::Float(2.5));

    // Polls fail until the health check notices and reconnects
    plc.drop_connection();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(plc.open_count() >= 2);
    assert!(session.hub().is_connected());
    assert_eq!(plc.active_notifications(), 1);

    plc.set("GVL.rSetpoint", 3.5, ProtocolType::Real).unwrap();
    let (_, value) = rx.recv().await.unwrap();
    assert_eq!(value, PlcValue::Float(3.5));

    assert!(session.unsubscribe(id).await);
    assert_eq!(plc.active_notifications(), 0);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_notifications_disabled_falls_back_to_polling() {
    let plc = VirtualPlc::new();
    plc.set("GVL.rLevel", 0.25, ProtocolType::Real).unwrap();
    let options = AdsOptions {
        use_notifications: false,
        scan_interval_secs: 3600,
        ..Default::default()
    };
    let session = open(&plc, options, vec![AddressConfig::new("GVL.rLevel", ProtocolType::Real)]).await;

    let callback: NotificationCallback = Arc::new(|_: &str, _: &PlcValue| {});
    assert!(session
        .subscribe("GVL.rLevel", ProtocolType::Real, callback)
        .await
        .is_none());
    assert_eq!(plc.active_notifications(), 0);

    let values = session.poll_now().await.unwrap();
    assert_eq!(values["GVL.rLevel"], PlcValue::Float(0.25));
    assert!(plc.reads_of("GVL.rLevel") >= 1);
    session.close().await;
}

// ============================================================================
// Polling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_removed_variable_keeps_stale_value_until_unavailable() {
    let plc = VirtualPlc::new();
    plc.set("GVL.nSpeed", 1200, ProtocolType::Int).unwrap();
    plc.set("GVL.nTorque", 80, ProtocolType::Int).unwrap();
    let options = AdsOptions {
        scan_interval_secs: 3600,
        ..Default::default()
    };
    let session = open(
        &plc,
        options,
        vec![
            polled("GVL.nSpeed", ProtocolType::Int),
            polled("GVL.nTorque", ProtocolType::Int),
        ],
    )
    .await;

    let mut snapshots = session.watch();
    snapshots.changed().await.unwrap();
    assert!(session.is_available("GVL.nTorque"));

    plc.remove("GVL.nTorque");
    for _ in 0..2 {
        let values = session.poll_now().await.unwrap();
        assert_eq!(values["GVL.nTorque"], PlcValue::Integer(80));
        assert!(session.is_available("GVL.nTorque"));
    }

    let values = session.poll_now().await.unwrap();
    assert_eq!(values["GVL.nTorque"], PlcValue::Integer(80));
    assert!(!session.is_available("GVL.nTorque"));
    assert!(session.is_available("GVL.nSpeed"));

    let diagnostics = session.diagnostics();
    assert_eq!(diagnostics.coordinator.error_counts["GVL.nTorque"], 3);
    assert!(diagnostics.hub.status.healthy);
    session.close().await;
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_repeated_failures() {
    let plc = VirtualPlc::new();
    plc.set("MAIN.nMode", 1, ProtocolType::Int).unwrap();
    let session = open(&plc, AdsOptions::default(), vec![]).await;

    plc.fail_next_reads(3, AdsError::transport("checksum mismatch"));
    for _ in 0..3 {
        let err = session
            .read_value("MAIN.nMode", ProtocolType::Int)
            .await
            .unwrap_err();
        assert!(matches!(err, AdsError::Transport(_)));
    }

    let reads = plc.read_count();
    let err = session
        .read_value("MAIN.nMode", ProtocolType::Int)
        .await
        .unwrap_err();
    assert_eq!(err, AdsError::CircuitOpen);
    assert_eq!(plc.read_count(), reads);
    assert!(!session.is_healthy());

    let redacted = session.diagnostics().redacted();
    assert!(!redacted.to_json().unwrap().contains("192.168.10.20"));
    session.close().await;
}

// ============================================================================
// Scaling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scaled_round_trip() {
    let plc = VirtualPlc::new();
    plc.set("GVL.nPressureRaw", 0, ProtocolType::Uint).unwrap();
    let session = open(&plc, AdsOptions::default(), vec![]).await;
    let scaling = Scaling::new(0.5, 0.0).with_precision(1);

    let raw = scaling.reverse(225.0, ProtocolType::Uint);
    session
        .write_value("GVL.nPressureRaw", &raw, ProtocolType::Uint)
        .await
        .unwrap();

    let value = session
        .read_value("GVL.nPressureRaw", ProtocolType::Uint)
        .await
        .unwrap();
    assert_eq!(value, PlcValue::Integer(450));
    assert_eq!(scaling.apply(&value), Some(225.0));
    session.close().await;
}
