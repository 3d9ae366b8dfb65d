//! In-memory reverse index from pubkey to tenant id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::store::Store;

/// Read-mostly snapshot of registered tenant pubkeys.
///
/// Reloaded in full from the store; readers clone the current `Arc` and are
/// never blocked by a reload. A watch channel carries a generation counter so
/// the relay pool can reissue subscriptions when the tenant set changes.
pub struct TenantRegistry {
    snapshot: RwLock<Arc<HashMap<String, i64>>>,
    generation: watch::Sender<u64>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            generation,
        }
    }

    /// Tenant id for a pubkey, if registered.
    pub fn lookup(&self, pubkey: &str) -> Option<i64> {
        self.snapshot.read().unwrap().get(pubkey).copied()
    }

    /// All registered pubkeys in the current snapshot.
    pub fn all_pubkeys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Subscribe to tenant-set change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Swap in a fresh snapshot from the store.
    ///
    /// Returns true when the pubkey set changed. A failed store read leaves
    /// the previous snapshot in force.
    pub fn reload(&self, store: &Store) -> Result<bool> {
        let fresh: Arc<HashMap<String, i64>> = Arc::new(
            store
                .tenant_pubkeys()?
                .into_iter()
                .map(|(id, pk)| (pk, id))
                .collect(),
        );
        let changed = {
            let mut current = self.snapshot.write().unwrap();
            let changed = **current != *fresh;
            *current = fresh;
            changed
        };
        if changed {
            self.generation.send_modify(|g| *g += 1);
        }
        Ok(changed)
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically reload the registry until `shutdown` flips.
pub async fn reload_task(
    registry: Arc<TenantRegistry>,
    store: Store,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        match registry.reload(&store) {
            Ok(true) => debug!("tenant registry reloaded with changes"),
            Ok(false) => {}
            Err(e) => warn!("tenant registry reload failed: {e:#}"),
        }
    }
}
