//! Utility functions for posture-core.

use std::future::Future;

use btleplug::platform::PeripheralId;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_null_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Whether an address is the all-zero placeholder CoreBluetooth reports.
pub fn is_null_address(address: &str) -> bool {
    address == "00:00:00:00:00:00"
}

/// Compare two device addresses ignoring case and separators.
///
/// ```
/// use posture_core::util::addresses_match;
///
/// assert!(addresses_match("A0:E6:F8:AF:53:84", "a0e6f8af5384"));
/// assert!(!addresses_match("A0:E6:F8:AF:53:84", "A0:E6:F8:AF:53:85"));
/// ```
pub fn addresses_match(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Race `fut` against cancellation and an optional deadline.
///
/// Returns `None` if `cancel` fired or `deadline` passed first.
pub(crate) async fn bounded<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Option<F::Output> {
    let expiry = async {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = expiry => None,
        output = fut => Some(output),
    }
}
