//! Device link cache -- per-master view of linked devices.
//!
//! Maps master identity → set of DeviceLink, plus a last-refresh timestamp
//! per queried identity. Refreshed lazily from the directory service when
//! the timestamp is older than the configured interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use threadlink_protocol::{DeviceLink, Identity, MultiDeviceDestination};
use threadlink_storage::Storage;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::services::{DirectoryError, DirectoryService};

#[derive(Default)]
struct LinkTable {
    by_master: HashMap<Identity, HashSet<DeviceLink>>,
    last_refresh: HashMap<Identity, Instant>,
}

impl LinkTable {
    fn links(&self) -> impl Iterator<Item = &DeviceLink> + Clone {
        self.by_master.values().flatten()
    }

    /// Replace the master's own set and merge links that name it as a slave.
    fn apply_fetch(&mut self, master: &str, fetched: &[DeviceLink]) {
        let own: HashSet<DeviceLink> = fetched
            .iter()
            .filter(|l| l.master_identity() == master)
            .cloned()
            .collect();
        if own.is_empty() {
            self.by_master.remove(master);
        } else {
            self.by_master.insert(master.to_string(), own);
        }

        for link in fetched.iter().filter(|l| l.master_identity() != master) {
            self.by_master
                .entry(link.master_identity().to_string())
                .or_default()
                .replace(link.clone());
        }
    }
}

/// Thread-safe cache of the device link graph.
#[derive(Clone)]
pub struct DeviceLinkCache {
    inner: Arc<RwLock<LinkTable>>,
    directory: Arc<dyn DirectoryService>,
    storage: Arc<dyn Storage>,
    refresh_interval: Duration,
}

impl DeviceLinkCache {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        storage: Arc<dyn Storage>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LinkTable::default())),
            directory,
            storage,
            refresh_interval,
        }
    }

    /// Warm the cache from persisted links. Timestamps are not restored, so
    /// the first resolve for any identity still hits the directory.
    pub async fn load(&self) -> threadlink_storage::Result<usize> {
        let links = self.storage.read_all_device_links()?;
        let count = links.len();
        let mut table = self.inner.write().await;
        for link in links {
            table
                .by_master
                .entry(link.master_identity().to_string())
                .or_default()
                .insert(link);
        }
        tracing::info!(links = count, "devices: cache loaded from storage");
        Ok(count)
    }

    /// Master of `identity` according to the cached graph, or `identity`
    /// itself when it is not known as a slave.
    pub async fn master_of(&self, identity: &str) -> Identity {
        let table = self.inner.read().await;
        master_in(table.links(), identity)
    }

    /// Snapshot of the links whose master is `master`.
    pub async fn links_for_master(&self, master: &str) -> Vec<DeviceLink> {
        let table = self.inner.read().await;
        let mut links: Vec<DeviceLink> = table
            .by_master
            .get(master)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        links.sort_by(|a, b| a.slave_identity().cmp(b.slave_identity()));
        links
    }

    pub async fn contains_link(&self, master: &str, slave: &str) -> bool {
        let table = self.inner.read().await;
        table
            .by_master
            .get(master)
            .is_some_and(|set| set.iter().any(|l| l.matches(master, slave)))
    }

    /// Resolve every device that should receive a message for `identity`.
    ///
    /// The master is always first and appears exactly once; slaves follow
    /// in identity order.
    pub async fn resolve_destinations(
        &self,
        identity: &str,
    ) -> Result<Vec<MultiDeviceDestination>, DirectoryError> {
        if self.is_stale(identity).await {
            let master = self.master_of(identity).await;
            self.refresh(identity, &master).await?;

            // The fetch may have revealed `identity` as someone's slave
            let resolved = self.master_of(identity).await;
            if resolved != master && self.is_stale(&resolved).await {
                self.refresh(&resolved, &resolved).await?;
            }
        }

        let table = self.inner.read().await;
        Ok(destinations_in(table.links(), identity))
    }

    async fn is_stale(&self, identity: &str) -> bool {
        let table = self.inner.read().await;
        match table.last_refresh.get(identity) {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        }
    }

    /// Fetch the master's links and fold them into the cache. Concurrent
    /// refreshes for the same identity may both fetch; the later write wins.
    async fn refresh(&self, identity: &str, master: &str) -> Result<(), DirectoryError> {
        match self.directory.fetch_device_links(master).await {
            Ok(fetched) => {
                {
                    let mut table = self.inner.write().await;
                    table.apply_fetch(master, &fetched);
                    table.last_refresh.insert(identity.to_string(), Instant::now());
                }
                self.persist(master, &fetched);
                tracing::debug!(
                    identity = %identity,
                    master = %master,
                    links = fetched.len(),
                    "devices: refreshed from directory"
                );
                Ok(())
            }
            Err(DirectoryError::ParsingFailed(reason)) => {
                let mut table = self.inner.write().await;
                table.last_refresh.insert(identity.to_string(), Instant::now());
                tracing::warn!(
                    identity = %identity,
                    reason = %reason,
                    "devices: unparseable directory response, keeping cached links"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "devices: refresh failed");
                Err(e)
            }
        }
    }

    fn persist(&self, master: &str, fetched: &[DeviceLink]) {
        let own: Vec<DeviceLink> = fetched
            .iter()
            .filter(|l| l.master_identity() == master)
            .cloned()
            .collect();
        if let Err(e) = self.storage.replace_device_links(master, &own) {
            tracing::warn!(master = %master, error = %e, "devices: failed to persist links");
        }
        for link in fetched.iter().filter(|l| l.master_identity() != master) {
            if let Err(e) = self.storage.upsert_device_link(link) {
                tracing::warn!(master = %link.master_identity(), error = %e, "devices: failed to persist link");
            }
        }
    }

    /// Directory's view of links involving `identity`.
    ///
    /// The cached snapshot is reused only if this identity was refreshed
    /// less than `max_age` ago; a zero `max_age` always queries. A fresh
    /// view is returned to the caller without being applied to the cache.
    pub async fn fetch_remote_view(
        &self,
        identity: &str,
        max_age: Duration,
    ) -> Result<Vec<DeviceLink>, DirectoryError> {
        {
            let table = self.inner.read().await;
            if let Some(at) = table.last_refresh.get(identity) {
                if at.elapsed() < max_age {
                    return Ok(table.links().filter(|l| l.involves(identity)).cloned().collect());
                }
            }
        }
        self.directory.fetch_device_links(identity).await
    }

    /// Add a newly authorized link to the cache and persisted rows.
    pub async fn record_link(&self, link: DeviceLink) {
        if let Err(e) = self.storage.upsert_device_link(&link) {
            tracing::warn!(master = %link.master_identity(), error = %e, "devices: failed to persist link");
        }
        let mut table = self.inner.write().await;
        table
            .by_master
            .entry(link.master_identity().to_string())
            .or_default()
            .replace(link);
    }

    /// Drop a link from the cache and persisted rows.
    pub async fn evict_link(&self, link: &DeviceLink) {
        {
            let mut table = self.inner.write().await;
            if let Some(set) = table.by_master.get_mut(link.master_identity()) {
                set.remove(link);
                if set.is_empty() {
                    table.by_master.remove(link.master_identity());
                }
            }
        }
        if let Err(e) = self
            .storage
            .delete_device_link(link.master_identity(), link.slave_identity())
        {
            tracing::warn!(master = %link.master_identity(), error = %e, "devices: failed to delete link");
        }
    }
}

/// Resolve destinations for `identity` from a link list without touching
/// the directory. Used for offline inspection of persisted links.
pub fn offline_destinations(identity: &str, links: &[DeviceLink]) -> Vec<MultiDeviceDestination> {
    destinations_in(links.iter(), identity)
}

fn master_in<'a>(mut links: impl Iterator<Item = &'a DeviceLink>, identity: &str) -> Identity {
    links
        .find(|l| l.slave_identity() == identity)
        .map(|l| l.master_identity().to_string())
        .unwrap_or_else(|| identity.to_string())
}

fn destinations_in<'a>(
    links: impl Iterator<Item = &'a DeviceLink> + Clone,
    identity: &str,
) -> Vec<MultiDeviceDestination> {
    let master = master_in(links.clone(), identity);

    let mut slaves: Vec<&str> = links
        .filter(|l| l.master_identity() == master && l.slave_identity() != master)
        .map(|l| l.slave_identity())
        .collect();
    slaves.sort_unstable();
    slaves.dedup();

    let mut destinations = Vec::with_capacity(slaves.len() + 1);
    destinations.push(MultiDeviceDestination::master(master));
    destinations.extend(slaves.into_iter().map(MultiDeviceDestination::slave));
    destinations
}
