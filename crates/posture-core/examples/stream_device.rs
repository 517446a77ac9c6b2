//! Example: Streaming One SensorTag
//!
//! Connects to a single device, enables the motion sensors and prints the
//! latest readings once per second until Ctrl-C.
//!
//! Run with: `cargo run --example stream_device -- 54:6C:0E:53:3B:0A`

use std::time::Duration;

use posture_core::{
    BleTransport, DeviceSession, EventDispatcher, ReadinessBarrier, SessionConfig, WarningFlag,
};
use posture_types::{DeviceIdentity, Role, SensorSet};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let address = std::env::args()
        .nth(1)
        .ok_or("usage: stream_device <address>")?;
    let identity = DeviceIdentity::new(address, Role::Neck);

    let transport = BleTransport::new().await?;
    let mut session = DeviceSession::new(
        SessionConfig::new(identity.clone(), SensorSet::default()),
        ReadinessBarrier::new([identity.clone()]),
        EventDispatcher::default(),
        WarningFlag::new(),
    );
    let snapshots = session.snapshots();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            while !cancel.is_cancelled() {
                tick.tick().await;
                let snapshot = snapshots.borrow().clone();
                for (variant, reading) in &snapshot.latest {
                    println!("{:>14}: {:?}", variant, reading.measurement.values());
                }
                println!();
            }
        });
    }

    println!("Connecting to {}...", identity);
    let result = session.run(&transport, &cancel).await;
    session.stop().await;

    let stats = session.stats();
    println!(
        "Received {} notifications ({} dropped)",
        stats.notifications, stats.dropped
    );
    result?;
    Ok(())
}
