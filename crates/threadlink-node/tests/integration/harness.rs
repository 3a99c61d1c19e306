//! Test harness for in-process threadlink-node integration tests.
//!
//! Provides in-memory collaborators (directory, transport, swarm, linking
//! session) and TestNode, a fully assembled Node over a temporary database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use threadlink_node::config::NodeConfig;
use threadlink_node::services::{
    BroadcastNotifications, DirectoryError, DirectoryService, LinkingError, LinkingSession,
    MessageSender, SendError, SwarmClient, SwarmError,
};
use threadlink_node::{Collaborators, Node};
use threadlink_protocol::{
    now_ms, DeviceLink, InboundEnvelope, OutgoingEnvelope, RawMessage, RawMessageBatch, SwarmNode,
};
use threadlink_storage::{SqliteStorage, Storage};

// ============================================================================
// Directory
// ============================================================================

/// Directory backed by a shared link list.
#[derive(Default)]
pub struct MemoryDirectory {
    links: Mutex<Vec<DeviceLink>>,
    down: Mutex<bool>,
    fetches: Mutex<usize>,
    removed: Mutex<Vec<DeviceLink>>,
}

#[allow(dead_code)]
impl MemoryDirectory {
    pub fn add(&self, link: DeviceLink) {
        self.links.lock().unwrap().push(link);
    }

    pub fn forget(&self, link: &DeviceLink) {
        self.links.lock().unwrap().retain(|l| l != link);
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }

    pub fn removed(&self) -> Vec<DeviceLink> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn fetch_device_links(&self, identity: &str) -> Result<Vec<DeviceLink>, DirectoryError> {
        *self.fetches.lock().unwrap() += 1;
        if *self.down.lock().unwrap() {
            return Err(DirectoryError::Unavailable("directory offline".into()));
        }
        Ok(self
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.involves(identity))
            .cloned()
            .collect())
    }

    async fn remove_device_link(&self, link: &DeviceLink) -> Result<(), DirectoryError> {
        self.forget(link);
        self.removed.lock().unwrap().push(link.clone());
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Records every envelope; recipients in `failing` are rejected.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutgoingEnvelope>>,
    failing: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl RecordingSender {
    pub fn fail_for(&self, identity: &str) {
        self.failing.lock().unwrap().insert(identity.to_string());
    }

    pub fn sent(&self) -> Vec<OutgoingEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, identity: &str) -> Vec<OutgoingEnvelope> {
        self.sent()
            .into_iter()
            .filter(|e| e.recipient == identity)
            .collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, envelope: OutgoingEnvelope) -> Result<(), SendError> {
        if self.failing.lock().unwrap().contains(&envelope.recipient) {
            return Err(SendError::Unreachable(envelope.recipient));
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}

// ============================================================================
// Swarm
// ============================================================================

/// Per-group swarm with queued raw messages. Each fetch drains the queue.
#[derive(Default)]
pub struct MemorySwarm {
    nodes: Vec<SwarmNode>,
    pending: Mutex<HashMap<String, Vec<RawMessage>>>,
    fetches: Mutex<HashMap<String, usize>>,
}

#[allow(dead_code)]
impl MemorySwarm {
    pub fn with_nodes(n: u16) -> Self {
        Self {
            nodes: (0..n)
                .map(|i| SwarmNode {
                    address: format!("10.0.0.{}", i + 1),
                    port: 22021,
                    public_key: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn push(&self, group_id: &str, message: RawMessage) {
        self.pending
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn fetches(&self, group_id: &str) -> usize {
        self.fetches.lock().unwrap().get(group_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SwarmClient for MemorySwarm {
    async fn get_swarm(&self, _group_id: &str) -> Result<Vec<SwarmNode>, SwarmError> {
        if self.nodes.is_empty() {
            return Err(SwarmError::InsufficientNodes);
        }
        Ok(self.nodes.clone())
    }

    async fn get_raw_messages(
        &self,
        _node: &SwarmNode,
        group_id: &str,
        _cursor: Option<&str>,
    ) -> Result<RawMessageBatch, SwarmError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_default() += 1;
        let messages = self
            .pending
            .lock()
            .unwrap()
            .remove(group_id)
            .unwrap_or_default();
        let cursor = messages.last().map(|m| m.hash.clone());
        Ok(RawMessageBatch { messages, cursor })
    }
}

/// JSON-encoded envelope as a swarm node would return it.
pub fn raw_group_message(hash: &str, group_id: &str, source: &str) -> RawMessage {
    let envelope = InboundEnvelope {
        version: 1,
        source: source.into(),
        group_id: Some(group_id.into()),
        timestamp_ms: now_ms(),
        content: b"sealed".to_vec(),
        server_hash: None,
    };
    RawMessage {
        hash: hash.into(),
        data: serde_json::to_vec(&envelope).unwrap(),
        expiration_ms: None,
    }
}

// ============================================================================
// Linking session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Request { slave: String, master: String },
    Authorization { master: String, slave: String },
}

/// Accepts everything unless `reject` is set; records calls.
#[derive(Default)]
pub struct RecordingSession {
    pub calls: Mutex<Vec<SessionCall>>,
    pub reject: bool,
}

#[async_trait]
impl LinkingSession for RecordingSession {
    async fn process_linking_request(
        &self,
        slave: &str,
        master: &str,
        _slave_signature: &[u8],
    ) -> Result<(), LinkingError> {
        self.calls.lock().unwrap().push(SessionCall::Request {
            slave: slave.into(),
            master: master.into(),
        });
        Ok(())
    }

    async fn process_linking_authorization(
        &self,
        master: &str,
        slave: &str,
        _master_signature: &[u8],
        _slave_signature: &[u8],
    ) -> Result<(), LinkingError> {
        self.calls.lock().unwrap().push(SessionCall::Authorization {
            master: master.into(),
            slave: slave.into(),
        });
        if self.reject {
            return Err(LinkingError::InvalidSignature);
        }
        Ok(())
    }
}

// ============================================================================
// Node
// ============================================================================

/// A fully assembled node over a temporary on-disk database.
pub struct TestNode {
    pub node: Node,
    pub directory: Arc<MemoryDirectory>,
    pub sender: Arc<RecordingSender>,
    pub swarm: Arc<MemorySwarm>,
    pub notifications: BroadcastNotifications,
    pub storage: Arc<dyn Storage>,
    _tempdir: tempfile::TempDir,
}

impl TestNode {
    pub fn new(local_identity: &str) -> Self {
        Self::with_config(local_identity, |_| {})
    }

    pub fn with_config(local_identity: &str, tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let mut cfg = NodeConfig::default();
        cfg.node.local_identity = local_identity.into();
        tweak(&mut cfg);

        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::open(&tempdir.path().join("threadlink.db")).unwrap());
        let directory = Arc::new(MemoryDirectory::default());
        let sender = Arc::new(RecordingSender::default());
        let swarm = Arc::new(MemorySwarm::with_nodes(3));
        let notifications = BroadcastNotifications::new(16);

        let node = Node::assemble(
            &cfg,
            Collaborators {
                directory: directory.clone(),
                swarm: swarm.clone(),
                sender: sender.clone(),
                notifications: Arc::new(notifications.clone()),
                storage: storage.clone(),
            },
        );

        Self {
            node,
            directory,
            sender,
            swarm,
            notifications,
            storage,
            _tempdir: tempdir,
        }
    }

    /// Mark trust with `identity` as established.
    pub fn trust(&self, identity: &str) {
        self.storage.get_or_create_contact_thread(identity, false).unwrap();
        self.storage
            .write_handshake_state(identity, threadlink_protocol::HandshakeState::Established, None)
            .unwrap();
    }
}
