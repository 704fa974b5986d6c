//! In-process SIP event bus.
//!
//! Hold, retrieve, and transfer are observed on one dialog leg but waited
//! for by another instance's chain. The bus carries those notifications
//! across instances without the chains sharing state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::graph::InstanceId;

/// Cross-instance SIP notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipSignal {
    Held,
    Retrieved,
    Transferred,
}

impl fmt::Display for SipSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Held => "HELD",
            Self::Retrieved => "RETRIEVED",
            Self::Transferred => "TRANSFERRED",
        };
        f.write_str(s)
    }
}

type SubscriberMap = HashMap<(InstanceId, SipSignal), Vec<(u64, mpsc::Sender<()>)>>;

/// Publish/subscribe fan-out keyed by (instance, signal).
#[derive(Default)]
pub struct SipEventBus {
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: AtomicU64,
}

impl SipEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a signal on an instance. The subscription
    /// unregisters itself on drop.
    pub fn subscribe(&self, instance: &InstanceId, signal: SipSignal) -> SipEventSubscription {
        // Capacity 1: repeated signals coalesce while the waiter is away.
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (instance.clone(), signal);
        self.subscribers
            .write()
            .entry(key.clone())
            .or_default()
            .push((id, tx));
        SipEventSubscription {
            subscribers: Arc::clone(&self.subscribers),
            key,
            id,
            rx,
        }
    }

    /// Notify every subscriber of a signal. Never blocks; a subscriber
    /// whose slot is already full has a wakeup pending and needs no more.
    pub fn emit(&self, instance: &InstanceId, signal: SipSignal) {
        trace!(%instance, %signal, "SIP event emitted");
        let subscribers = self.subscribers.read();
        if let Some(entries) = subscribers.get(&(instance.clone(), signal)) {
            for (_, tx) in entries {
                let _ = tx.try_send(());
            }
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, instance: &InstanceId, signal: SipSignal) -> usize {
        self.subscribers
            .read()
            .get(&(instance.clone(), signal))
            .map_or(0, Vec::len)
    }
}

/// A live subscription. Dropping it removes the registration.
pub struct SipEventSubscription {
    subscribers: Arc<RwLock<SubscriberMap>>,
    key: (InstanceId, SipSignal),
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl SipEventSubscription {
    /// Await the next signal.
    pub async fn wait(&mut self) {
        let _ = self.rx.recv().await;
    }
}

impl Drop for SipEventSubscription {
    fn drop(&mut self) {
        let mut subscribers = self.subscribers.write();
        if let Some(entries) = subscribers.get_mut(&self.key) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                subscribers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_to_matching_subscriber() {
        let bus = SipEventBus::new();
        let a = InstanceId::from("a");
        let mut sub = bus.subscribe(&a, SipSignal::Held);
        bus.emit(&a, SipSignal::Held);
        tokio::time::timeout(Duration::from_secs(1), sub.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn signal_and_instance_are_both_keyed() {
        let bus = SipEventBus::new();
        let a = InstanceId::from("a");
        let b = InstanceId::from("b");
        let mut sub = bus.subscribe(&a, SipSignal::Held);

        bus.emit(&a, SipSignal::Retrieved);
        bus.emit(&b, SipSignal::Held);

        let delivered = tokio::time::timeout(Duration::from_millis(100), sub.wait()).await;
        assert!(delivered.is_err(), "unrelated signals must not wake the subscriber");
    }

    #[tokio::test]
    async fn repeated_emits_coalesce() {
        let bus = SipEventBus::new();
        let a = InstanceId::from("a");
        let mut sub = bus.subscribe(&a, SipSignal::Transferred);
        bus.emit(&a, SipSignal::Transferred);
        bus.emit(&a, SipSignal::Transferred);
        bus.emit(&a, SipSignal::Transferred);
        tokio::time::timeout(Duration::from_secs(1), sub.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let bus = SipEventBus::new();
        let a = InstanceId::from("a");
        let sub = bus.subscribe(&a, SipSignal::Held);
        assert_eq!(bus.subscriber_count(&a, SipSignal::Held), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(&a, SipSignal::Held), 0);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = SipEventBus::new();
        bus.emit(&InstanceId::from("ghost"), SipSignal::Held);
    }
}
