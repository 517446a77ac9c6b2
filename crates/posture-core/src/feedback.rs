//! Posture warning flag.
//!
//! Business logic outside the core decides whether the wearer should be
//! warned and sets this flag; sessions with an indicator turn it into an
//! LED/buzzer code. The flag is owned by the supervisor and outlives every
//! cohort, so a warning raised during a restart is shown once devices are
//! back.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared boolean warning state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WarningFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl WarningFlag {
    /// Create an inactive flag.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise or lower the warning. Returns `true` if the state changed.
    pub fn set(&self, active: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
        if changed {
            info!(active, "posture warning changed");
        }
        changed
    }

    /// Current state.
    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for WarningFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret a text payload as a warning state.
///
/// Accepts `1`/`0`, `true`/`false` and `on`/`off`, ignoring case and
/// surrounding whitespace.
///
/// ```
/// use posture_core::feedback::parse_warning_payload;
///
/// assert_eq!(parse_warning_payload(b" ON\n"), Some(true));
/// assert_eq!(parse_warning_payload(b"0"), Some(false));
/// assert_eq!(parse_warning_payload(b"maybe"), None);
/// ```
pub fn parse_warning_payload(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?;
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_changes_only() {
        let flag = WarningFlag::new();
        assert!(!flag.is_active());
        assert!(flag.set(true));
        assert!(!flag.set(true));
        assert!(flag.is_active());
        assert!(flag.set(false));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let flag = WarningFlag::new();
        let mut rx = flag.subscribe();
        let clone = flag.clone();
        clone.set(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn test_parse_payloads() {
        assert_eq!(parse_warning_payload(b"true"), Some(true));
        assert_eq!(parse_warning_payload(b"Off"), Some(false));
        assert_eq!(parse_warning_payload(b"1"), Some(true));
        assert_eq!(parse_warning_payload(&[0xFF, 0xFE]), None);
        assert_eq!(parse_warning_payload(b""), None);
    }
}
