//! Threadlink Node -- multi-device fan-out and closed-group polling.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! wire the router, link handler and poll scheduler to real collaborators.

pub mod config;
pub mod device_links;
pub mod group_poll_task;
pub mod handshake;
pub mod link_events;
pub mod router;
pub mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use threadlink_protocol::now_ms;
use threadlink_storage::{SqliteStorage, Storage};

use crate::config::NodeConfig;
use crate::device_links::DeviceLinkCache;
use crate::group_poll_task::GroupPollScheduler;
use crate::handshake::AutoHandshakeGenerator;
use crate::link_events::LinkEventHandler;
use crate::router::MultiDeviceRouter;
use crate::services::{
    DirectoryService, LinkingSessionSlot, MessageSender, NotificationBus, SwarmClient,
};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Open the configured database, creating its parent directory.
pub fn open_storage(cfg: &NodeConfig) -> anyhow::Result<Arc<SqliteStorage>> {
    let path = expand_tilde(&cfg.node.database);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStorage::open(&path)?))
}

/// External services a node is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectoryService>,
    pub swarm: Arc<dyn SwarmClient>,
    pub sender: Arc<dyn MessageSender>,
    pub notifications: Arc<dyn NotificationBus>,
    pub storage: Arc<dyn Storage>,
}

/// Fully wired set of components sharing one link cache and storage.
pub struct Node {
    pub links: DeviceLinkCache,
    pub router: Arc<MultiDeviceRouter>,
    pub link_events: LinkEventHandler,
    pub polling: GroupPollScheduler,
    pub sessions: LinkingSessionSlot,
    pub handshakes: AutoHandshakeGenerator,
    pub storage: Arc<dyn Storage>,
}

impl Node {
    pub fn assemble(cfg: &NodeConfig, services: Collaborators) -> Self {
        let links = DeviceLinkCache::new(
            services.directory.clone(),
            services.storage.clone(),
            cfg.devices.refresh_interval(),
        );
        let handshakes = AutoHandshakeGenerator::new(
            services.storage.clone(),
            Duration::from_secs(cfg.handshake.expiry_secs),
        );
        let router = Arc::new(MultiDeviceRouter::new(
            links.clone(),
            handshakes.clone(),
            services.sender.clone(),
            services.storage.clone(),
        ));
        let sessions = LinkingSessionSlot::new();
        let link_events = LinkEventHandler::new(
            cfg.node.local_identity.clone(),
            sessions.clone(),
            links.clone(),
            handshakes.clone(),
            services.directory.clone(),
            services.storage.clone(),
            services.notifications.clone(),
            cfg.unlink.max_view_age(),
        );
        let polling = GroupPollScheduler::new(
            services.swarm.clone(),
            services.storage.clone(),
            cfg.polling.timing(),
        );

        Self {
            links,
            router,
            link_events,
            polling,
            sessions,
            handshakes,
            storage: services.storage,
        }
    }

    /// Warm the link cache, expire lapsed handshakes and start polling
    /// every known group.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.links.load().await?;
        self.handshakes.expire_stale(now_ms())?;
        let started = self.polling.start_all_from_storage().await?;
        tracing::info!(groups = started, "node: started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let stopped = self.polling.stop_all().await;
        self.sessions.end().await;
        tracing::info!(groups = stopped, "node: shut down");
    }
}
