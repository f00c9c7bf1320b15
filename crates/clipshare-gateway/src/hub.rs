use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use clipshare_store::{RoomStore, StoreError};
use clipshare_types::events::HubEvent;
use clipshare_types::models::{ConnectionId, Room};

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HubError {
    /// Message safe to hand back to a client; internals stay in the logs.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Store(StoreError::ConfigurationFatal(_)) => "room allocation failed",
            Self::Store(StoreError::Persistence(_)) => "storage failure",
            Self::Task(_) => "internal error",
        }
    }
}

/// What happened to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Persisted and handed to this many live members.
    Delivered { recipients: usize },
    /// The room does not exist or has expired; nothing was stored.
    Dropped,
}

/// Owns live connections and per-room membership, and runs the
/// persist-then-fan-out send protocol.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: Arc<RoomStore>,

    /// Live sessions: conn_id -> outbound queue + joined room codes
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,

    /// Broadcast groups: room code -> members and send ordering
    groups: RwLock<HashMap<String, Arc<RoomGroup>>>,
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<HubEvent>,
    rooms: HashSet<String>,
}

/// Per-room state. Each room has its own locks so rooms never contend.
#[derive(Default)]
struct RoomGroup {
    /// Held across persist + fan-out so history order equals delivery order.
    send_lock: Mutex<()>,
    members: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<HubEvent>>>,
}

impl Hub {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                connections: RwLock::new(HashMap::new()),
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Attach a live session. Every event for it is pushed to `tx`.
    pub async fn register(&self, tx: mpsc::UnboundedSender<HubEvent>) -> ConnectionId {
        let conn_id = ConnectionId::new();
        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionEntry {
                tx,
                rooms: HashSet::new(),
            },
        );
        conn_id
    }

    /// Allocate a room. The caller is not joined to it.
    pub async fn create_room(&self, conn_id: ConnectionId) -> Result<String, HubError> {
        let room = self.blocking(|store| store.create_room()).await.inspect_err(|e| {
            if let HubError::Store(StoreError::ConfigurationFatal(msg)) = e {
                error!("FATAL: room allocation for {} failed: {}", conn_id, msg);
            }
        })?;
        info!("{} created room {}", conn_id, room.code);
        Ok(room.code)
    }

    /// Add `conn_id` to the room's membership. Unknown, malformed and expired
    /// codes all return `false` without side effects.
    pub async fn join_room(&self, conn_id: ConnectionId, code: &str) -> Result<bool, HubError> {
        let Some(room) = self.lookup(code).await? else {
            debug!("{} tried to join unknown room {:?}", conn_id, code);
            return Ok(false);
        };

        let tx = match self.inner.connections.read().await.get(&conn_id) {
            Some(entry) => entry.tx.clone(),
            None => {
                warn!("{} joined {} after disconnecting", conn_id, room.code);
                return Ok(false);
            }
        };

        let group = self.group(&room.code).await;
        let members = {
            let mut members = group.members.lock().await;
            members.insert(conn_id, tx);
            members.len()
        };

        // A disconnect that ran after the lookup above never saw this room,
        // so undo the insert ourselves.
        let recorded = match self.inner.connections.write().await.get_mut(&conn_id) {
            Some(entry) => {
                entry.rooms.insert(room.code.clone());
                true
            }
            None => false,
        };
        if !recorded {
            group.members.lock().await.remove(&conn_id);
            drop(group);
            self.prune(&room.code).await;
            warn!("{} disconnected while joining {}", conn_id, room.code);
            return Ok(false);
        }

        info!("{} joined room {} ({} members)", conn_id, room.code, members);
        Ok(true)
    }

    pub async fn leave_room(&self, conn_id: ConnectionId, code: &str) {
        let removed = {
            let mut connections = self.inner.connections.write().await;
            connections
                .get_mut(&conn_id)
                .is_some_and(|entry| entry.rooms.remove(code))
        };
        if removed {
            self.remove_member(code, conn_id).await;
            info!("{} left room {}", conn_id, code);
        }
    }

    /// Persist `content` to the room, then deliver it to every current member
    /// (the sender included when joined). Sends to a missing room are dropped.
    ///
    /// Once the room is found the send runs to completion even if the caller
    /// is cancelled: a persisted item is always fanned out.
    pub async fn send_content(
        &self,
        conn_id: ConnectionId,
        code: &str,
        content: &str,
    ) -> Result<SendOutcome, HubError> {
        let Some(room) = self.lookup(code).await? else {
            debug!("{} sent to unknown room {:?}, dropping", conn_id, code);
            return Ok(SendOutcome::Dropped);
        };

        let code = room.code.clone();
        let hub = self.clone();
        let content = content.to_string();
        let size = content.len();
        let recipients = tokio::spawn(async move {
            let group = hub.group(&room.code).await;
            let result = hub.persist_and_fan_out(&group, &room, content).await;
            drop(group);
            hub.prune(&room.code).await;
            result
        })
        .await??;

        debug!(
            "{} sent {} bytes to room {} ({} recipients)",
            conn_id, size, code, recipients
        );
        Ok(SendOutcome::Delivered { recipients })
    }

    /// Decrypted history for the room, oldest first; empty when the room is absent.
    pub async fn get_history(&self, conn_id: ConnectionId, code: &str) -> Result<Vec<String>, HubError> {
        let Some(room) = self.lookup(code).await? else {
            return Ok(Vec::new());
        };
        let history = self.blocking(move |store| store.get_history(room.id)).await?;
        debug!("{} fetched {} history items from {}", conn_id, history.len(), code);
        Ok(history)
    }

    /// Drop the connection from every room it joined.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let entry = self.inner.connections.write().await.remove(&conn_id);
        let Some(entry) = entry else {
            return;
        };

        for code in &entry.rooms {
            self.remove_member(code, conn_id).await;
        }
        debug!("{} disconnected from {} rooms", conn_id, entry.rooms.len());
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Rooms that currently have a broadcast group (members or an in-flight send).
    pub async fn active_room_count(&self) -> usize {
        self.inner.groups.read().await.len()
    }

    pub async fn member_count(&self, code: &str) -> usize {
        let group = self.inner.groups.read().await.get(code).cloned();
        match group {
            Some(group) => group.members.lock().await.len(),
            None => 0,
        }
    }

    async fn persist_and_fan_out(&self, group: &RoomGroup, room: &Room, content: String) -> Result<usize, HubError> {
        let _ordered = group.send_lock.lock().await;

        let room_id = room.id;
        let plaintext = content.clone();
        self.blocking(move |store| store.append_item(room_id, &plaintext)).await?;

        // Snapshot after the persist so a member removed meanwhile gets nothing.
        let recipients: Vec<_> = group.members.lock().await.values().cloned().collect();
        let event = HubEvent::ReceiveClipboardContent {
            code: room.code.clone(),
            content,
        };
        for tx in &recipients {
            let _ = tx.send(event.clone());
        }
        Ok(recipients.len())
    }

    async fn lookup(&self, code: &str) -> Result<Option<Room>, HubError> {
        let code = code.to_string();
        self.blocking(move |store| store.get_room_by_code(&code)).await
    }

    /// Run a store call off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, HubError>
    where
        F: FnOnce(&RoomStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    async fn group(&self, code: &str) -> Arc<RoomGroup> {
        if let Some(group) = self.inner.groups.read().await.get(code) {
            return group.clone();
        }
        self.inner
            .groups
            .write()
            .await
            .entry(code.to_string())
            .or_default()
            .clone()
    }

    async fn remove_member(&self, code: &str, conn_id: ConnectionId) {
        let group = self.inner.groups.read().await.get(code).cloned();
        if let Some(group) = group {
            group.members.lock().await.remove(&conn_id);
        }
        self.prune(code).await;
    }

    /// Discard a room's group once nobody is a member and no send holds it.
    async fn prune(&self, code: &str) {
        let mut groups = self.inner.groups.write().await;
        // With the only `Arc` held by the map nobody else can hold the
        // member lock, so `try_lock` cannot fail spuriously here.
        let idle = groups.get(code).is_some_and(|group| {
            Arc::strong_count(group) == 1 && group.members.try_lock().is_ok_and(|members| members.is_empty())
        });
        if idle {
            groups.remove(code);
        }
    }
}
