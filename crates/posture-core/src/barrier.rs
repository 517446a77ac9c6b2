//! Cross-session readiness barrier.
//!
//! One flag per expected device. Sessions set their own flag after a
//! successful decode and clear it when their link dies; consumers wait until
//! every flag is set. The state lives in a [`tokio::sync::watch`] channel, so
//! flag mutation and the all-set check are serialised by the channel and any
//! number of waiters observe the same condition.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use posture_types::DeviceIdentity;

use crate::error::{Error, Result};

/// Flags keyed by device identity.
pub type Flags = BTreeMap<DeviceIdentity, bool>;

/// Fan-in barrier over a fixed set of devices.
///
/// Cheap to clone; all clones share the same flags.
///
/// # Example
///
/// ```
/// use posture_core::ReadinessBarrier;
/// use posture_types::{DeviceIdentity, Role};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let neck = DeviceIdentity::new("AA:AA", Role::Neck);
/// let back = DeviceIdentity::new("BB:BB", Role::BackMid);
/// let barrier = ReadinessBarrier::new([neck.clone(), back.clone()]);
///
/// barrier.set(&neck);
/// assert!(!barrier.all_set());
/// barrier.set(&back);
/// barrier.wait_all().await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ReadinessBarrier {
    tx: Arc<watch::Sender<Flags>>,
}

impl ReadinessBarrier {
    /// Create a barrier with every flag cleared.
    ///
    /// A barrier over no devices is trivially ready.
    pub fn new(identities: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        let flags = identities.into_iter().map(|id| (id, false)).collect();
        let (tx, _) = watch::channel(flags);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag for `identity`. Returns `true` if the flag changed.
    ///
    /// Setting an already-set flag, or an identity the barrier does not
    /// track, is a no-op.
    pub fn set(&self, identity: &DeviceIdentity) -> bool {
        self.update(identity, true)
    }

    /// Clear the flag for `identity`. Returns `true` if the flag changed.
    pub fn clear(&self, identity: &DeviceIdentity) -> bool {
        self.update(identity, false)
    }

    /// Clear every flag as one unit.
    pub fn clear_all(&self) {
        self.tx.send_if_modified(|flags| {
            let mut changed = false;
            for flag in flags.values_mut() {
                changed |= *flag;
                *flag = false;
            }
            changed
        });
    }

    /// Whether the flag for `identity` is set.
    pub fn is_set(&self, identity: &DeviceIdentity) -> bool {
        self.tx.borrow().get(identity).copied().unwrap_or(false)
    }

    /// Whether every flag is set.
    pub fn all_set(&self) -> bool {
        self.tx.borrow().values().all(|f| *f)
    }

    /// Identities whose flag is still clear.
    pub fn pending(&self) -> Vec<DeviceIdentity> {
        self.tx
            .borrow()
            .iter()
            .filter(|(_, set)| !**set)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    /// Whether the barrier tracks no devices.
    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Watch the raw flags, e.g. for a status display.
    pub fn subscribe(&self) -> watch::Receiver<Flags> {
        self.tx.subscribe()
    }

    /// Suspend until every flag is set.
    ///
    /// Resolves immediately if the condition already holds. Callers race this
    /// against their cancellation token; the barrier itself never times out.
    pub async fn wait_all(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|flags| flags.values().all(|f| *f))
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)
    }

    fn update(&self, identity: &DeviceIdentity, value: bool) -> bool {
        let changed = self.tx.send_if_modified(|flags| match flags.get_mut(identity) {
            Some(flag) if *flag != value => {
                *flag = value;
                true
            }
            _ => false,
        });
        if changed {
            debug!(device = %identity, ready = value, "readiness flag changed");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use posture_types::Role;

    fn ids() -> Vec<DeviceIdentity> {
        vec![
            DeviceIdentity::new("AA:AA", Role::Neck),
            DeviceIdentity::new("BB:BB", Role::BackMid),
            DeviceIdentity::new("CC:CC", Role::ShoulderLeft),
        ]
    }

    async fn resolves(barrier: &ReadinessBarrier) -> bool {
        timeout(Duration::from_millis(50), barrier.wait_all())
            .await
            .is_ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_all_requires_every_flag() {
        let ids = ids();
        let barrier = ReadinessBarrier::new(ids.clone());

        assert!(!resolves(&barrier).await);
        barrier.set(&ids[0]);
        barrier.set(&ids[1]);
        assert!(!resolves(&barrier).await);
        barrier.set(&ids[2]);
        assert!(resolves(&barrier).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_blocks_waiters_again() {
        let ids = ids();
        let barrier = ReadinessBarrier::new(ids.clone());
        for id in &ids {
            barrier.set(id);
        }
        assert!(resolves(&barrier).await);

        barrier.clear(&ids[1]);
        assert!(!resolves(&barrier).await);
        assert_eq!(barrier.pending(), vec![ids[1].clone()]);

        barrier.set(&ids[1]);
        assert!(resolves(&barrier).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_resets_as_unit() {
        let ids = ids();
        let barrier = ReadinessBarrier::new(ids.clone());
        for id in &ids {
            barrier.set(id);
        }
        barrier.clear_all();
        assert_eq!(barrier.pending().len(), 3);
        assert!(!resolves(&barrier).await);
    }

    #[tokio::test]
    async fn test_multiple_waiters_released_together() {
        let ids = ids();
        let barrier = ReadinessBarrier::new(ids.clone());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let b = barrier.clone();
            waiters.push(tokio::spawn(async move { b.wait_all().await }));
        }
        tokio::task::yield_now().await;

        for id in &ids {
            barrier.set(id);
        }
        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .expect("task joined")
                .expect("barrier ok");
        }
    }

    #[test]
    fn test_set_is_idempotent() {
        let ids = ids();
        let barrier = ReadinessBarrier::new(ids.clone());
        let mut rx = barrier.subscribe();
        rx.mark_unchanged();

        assert!(barrier.set(&ids[0]));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        assert!(!barrier.set(&ids[0]));
        assert!(!rx.has_changed().unwrap());
        assert!(barrier.is_set(&ids[0]));
    }

    #[test]
    fn test_unknown_identity_ignored() {
        let barrier = ReadinessBarrier::new(ids());
        let stranger = DeviceIdentity::new("FF:FF", Role::BackLow);
        assert!(!barrier.set(&stranger));
        assert!(!barrier.is_set(&stranger));
        assert_eq!(barrier.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_barrier_is_ready() {
        let barrier = ReadinessBarrier::new(Vec::new());
        assert!(barrier.is_empty());
        assert!(barrier.all_set());
        barrier.wait_all().await.unwrap();
    }
}
