//! Hardware integration tests for posture-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package posture-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the device via environment variables:
//! - `POSTURE_DEVICE`: address of a powered-on SensorTag
//! - `POSTURE_ROLE`: role label for the device (defaults to `neck`)
//!
//! Example:
//! ```
//! POSTURE_DEVICE="54:6C:0E:53:3B:0A" cargo test --package posture-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use posture_core::{
    BleTransport, DeviceSession, EventDispatcher, GattTransport, ReadinessBarrier, SessionConfig,
    SessionState, WarningFlag,
};
use posture_types::{DeviceIdentity, Role, SensorSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn device() -> Option<DeviceIdentity> {
    let address = env::var("POSTURE_DEVICE").ok().filter(|s| !s.is_empty())?;
    let role = env::var("POSTURE_ROLE")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(Role::Neck);
    Some(DeviceIdentity::new(address, role))
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_discover_device() {
    let Some(identity) = device() else {
        println!("POSTURE_DEVICE not set, skipping");
        return;
    };

    let transport = BleTransport::new().await.expect("Bluetooth adapter");
    let wanted = vec![identity.address.clone()];
    let visible = timeout(BLE_TIMEOUT, transport.discover(&wanted, Duration::from_secs(10)))
        .await
        .expect("scan timed out")
        .expect("scan failed");

    assert!(
        visible.contains(&identity.address),
        "{} was not seen during the scan",
        identity
    );
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_stream_motion() {
    let Some(identity) = device() else {
        println!("POSTURE_DEVICE not set, skipping");
        return;
    };

    let transport = BleTransport::new().await.expect("Bluetooth adapter");
    let barrier = ReadinessBarrier::new([identity.clone()]);
    let mut session = DeviceSession::new(
        SessionConfig::new(identity.clone(), SensorSet::default()),
        barrier.clone(),
        EventDispatcher::default(),
        WarningFlag::new(),
    );
    let mut snapshots = session.snapshots();
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    let reader = tokio::spawn(async move {
        let first = timeout(BLE_TIMEOUT, snapshots.changed()).await;
        let snapshot = snapshots.borrow().clone();
        stopper.cancel();
        (first, snapshot)
    });

    let result = session.run(&transport, &cancel).await;
    let (first, snapshot) = reader.await.unwrap();

    result.expect("session failed");
    assert!(first.is_ok(), "no notification within {:?}", BLE_TIMEOUT);
    for (variant, reading) in &snapshot.latest {
        println!("{}: {:?}", variant, reading.measurement.values());
    }
    assert_eq!(snapshot.latest.len(), 3);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    println!("stats: {:?}", session.stats());
}
