//! Exclusive-operation flag shared by sync, download and queue draining.

use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

/// The single "sync or download running" flag.
///
/// At most one [`OperationGuard`] exists at a time. Releasing it is
/// observable through [`OperationGate::subscribe`], which is how the
/// transfer queue knows to resume draining.
///
/// The flag only stops new uploads from starting. The transport itself is
/// guarded by a separate lock: the queue holds it around each upload, and an
/// exclusive operation takes it after the flag so it waits out the upload in
/// flight.
#[derive(Debug, Clone)]
pub struct OperationGate {
    busy: Arc<watch::Sender<bool>>,
    transport: Arc<Mutex<()>>,
}

impl OperationGate {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            busy: Arc::new(busy),
            transport: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for sole use of the transport.
    pub async fn lock_transport(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.transport).lock_owned().await
    }

    /// Take the flag, or `None` if an exclusive operation is running.
    pub fn try_acquire(&self) -> Option<OperationGuard> {
        let acquired = self.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then(|| OperationGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Receiver notified whenever the flag flips.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of an exclusive operation; releases on drop.
#[derive(Debug)]
pub struct OperationGuard {
    busy: Arc<watch::Sender<bool>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.busy.send_replace(false);
    }
}
