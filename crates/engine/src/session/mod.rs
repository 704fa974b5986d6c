//! Per-run registry of active dialogs and pending inbound calls.

mod bus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::endpoint::{Dialog, ServerSession};
use crate::graph::InstanceId;

pub use bus::{SipEventBus, SipEventSubscription, SipSignal};

/// Bound on how long `hangup_all` spends tearing down leftover dialogs.
const HANGUP_ALL_DEADLINE: Duration = Duration::from_secs(5);

/// Tracks each instance's active dialog and pending inbound call for the
/// duration of one run, and owns the SIP event bus.
#[derive(Default)]
pub struct SessionStore {
    dialogs: RwLock<HashMap<InstanceId, Arc<dyn Dialog>>>,
    pending: Mutex<HashMap<InstanceId, Box<dyn ServerSession>>>,
    bus: SipEventBus,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> &SipEventBus {
        &self.bus
    }

    /// Store an instance's active dialog, replacing any previous one.
    pub async fn store_dialog(&self, instance: &InstanceId, dialog: Arc<dyn Dialog>) {
        self.dialogs.write().await.insert(instance.clone(), dialog);
    }

    pub async fn dialog(&self, instance: &InstanceId) -> Option<Arc<dyn Dialog>> {
        self.dialogs.read().await.get(instance).cloned()
    }

    /// Park an inbound call until an Answer command consumes it.
    pub async fn store_pending(&self, instance: &InstanceId, session: Box<dyn ServerSession>) {
        self.pending.lock().await.insert(instance.clone(), session);
    }

    pub async fn take_pending(&self, instance: &InstanceId) -> Option<Box<dyn ServerSession>> {
        self.pending.lock().await.remove(instance)
    }

    /// Hang up every dialog still registered, under one shared deadline.
    /// Failures are logged and swallowed; cleanup must always run through.
    pub async fn hangup_all(&self) {
        let dialogs: Vec<(InstanceId, Arc<dyn Dialog>)> = {
            let mut map = self.dialogs.write().await;
            map.drain().collect()
        };
        if dialogs.is_empty() {
            return;
        }

        let teardown = async {
            for (instance, dialog) in &dialogs {
                if dialog.is_terminated() {
                    continue;
                }
                if let Err(err) = dialog.hangup().await {
                    warn!(instance = %instance, %err, "hangup during cleanup failed");
                } else {
                    debug!(instance = %instance, "dialog hung up during cleanup");
                }
            }
        };
        if tokio::time::timeout(HANGUP_ALL_DEADLINE, teardown).await.is_err() {
            warn!("hangup_all exceeded {HANGUP_ALL_DEADLINE:?}, abandoning remaining dialogs");
        }
    }

    /// Drop everything the run accumulated. Called after `hangup_all`.
    pub async fn clear(&self) {
        self.dialogs.write().await.clear();
        self.pending.lock().await.clear();
    }
}
