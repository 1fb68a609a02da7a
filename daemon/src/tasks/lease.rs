use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{sync::Mutex, task::JoinHandle};

use meridian_common::{
    config::{LEASE_RENEW_INTERVAL_SECS, LEASE_TTL_SECS},
    time::get_current_time_in_millis,
};

use crate::core::{error::StorageError, storage::Storage};

// Holds a TTL'd singleton lease and renews it in the background. The owning
// service checks `is_held` every loop iteration and exits when the lease is
// lost; the replacement instance resumes from persisted state.
pub struct LeaseKeeper<S: Storage> {
    storage: Arc<S>,
    name: String,
    holder: String,
    held: Arc<AtomicBool>,
    renewer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> LeaseKeeper<S> {
    // Single acquisition attempt; None when another instance holds the lease
    pub async fn try_acquire(
        storage: Arc<S>,
        name: impl Into<String>,
        holder: impl Into<String>,
    ) -> Result<Option<Arc<Self>>, StorageError> {
        let name = name.into();
        let holder = holder.into();
        let now = get_current_time_in_millis();
        let ttl_ms = LEASE_TTL_SECS * 1_000;

        if !storage.try_acquire_lease(&name, &holder, ttl_ms, now).await? {
            return Ok(None);
        }
        info!("acquired lease '{}' as {}", name, holder);

        let keeper = Arc::new(Self {
            storage,
            name,
            holder,
            held: Arc::new(AtomicBool::new(true)),
            renewer: Mutex::new(None),
        });
        keeper.spawn_renewer().await;
        Ok(Some(keeper))
    }

    // Poll until the lease is ours
    pub async fn acquire(
        storage: Arc<S>,
        name: impl Into<String>,
        holder: impl Into<String>,
    ) -> Result<Arc<Self>, StorageError> {
        let name = name.into();
        let holder = holder.into();
        loop {
            if let Some(keeper) =
                Self::try_acquire(Arc::clone(&storage), name.clone(), holder.clone()).await?
            {
                return Ok(keeper);
            }
            debug!("lease '{}' unavailable, retrying", name);
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
        }
    }

    async fn spawn_renewer(self: &Arc<Self>) {
        let zelf = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let ttl_ms = LEASE_TTL_SECS * 1_000;
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
                if !zelf.held.load(Ordering::SeqCst) {
                    break;
                }
                let now = get_current_time_in_millis();
                match zelf
                    .storage
                    .renew_lease(&zelf.name, &zelf.holder, ttl_ms, now)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("lease '{}' lost by {}", zelf.name, zelf.holder);
                        zelf.held.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        // Keep trying until the TTL actually lapses; the store
                        // may only be transiently unavailable
                        warn!("failed to renew lease '{}': {}", zelf.name, e);
                    }
                }
            }
        });
        *self.renewer.lock().await = Some(handle);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub async fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        if let Some(handle) = self.renewer.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.storage.release_lease(&self.name, &self.holder).await {
            warn!("failed to release lease '{}': {}", self.name, e);
        } else {
            debug!("released lease '{}'", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;
    use tempdir::TempDir;

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let dir = TempDir::new("meridian-lease").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());

        let first = LeaseKeeper::try_acquire(Arc::clone(&storage), "ingestor", "node-a")
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(first.is_held());

        let second = LeaseKeeper::try_acquire(Arc::clone(&storage), "ingestor", "node-b")
            .await
            .unwrap();
        assert!(second.is_none());

        first.release().await;
        let second = LeaseKeeper::try_acquire(Arc::clone(&storage), "ingestor", "node-b")
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn same_holder_reacquires_its_own_lease() {
        let dir = TempDir::new("meridian-lease").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());

        let first = LeaseKeeper::try_acquire(Arc::clone(&storage), "driver", "node-a")
            .await
            .unwrap()
            .expect("acquire");
        // a rolling restart of the same instance id re-enters its lease
        let again = LeaseKeeper::try_acquire(Arc::clone(&storage), "driver", "node-a")
            .await
            .unwrap();
        assert!(again.is_some());
        first.release().await;
    }
}
