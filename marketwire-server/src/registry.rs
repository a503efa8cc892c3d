//! Connection registry: user id → live connections.
//!
//! A user may hold several connections at once (tabs, devices). Each
//! connection owns a bounded outbound queue; the registry only ever does
//! `try_send`, so a push never blocks on a slow client. A connection whose
//! queue is full is signalled through its eviction [`Notify`] and the
//! lifecycle loop closes it. The registry itself never removes entries on
//! send failure; that happens when the lifecycle calls [`ConnectionRegistry::deregister`].
//!
//! Lock discipline: the map is behind a single mutex that is never held
//! across an await point. Callers that also hold the database lock take the
//! database lock first.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::protocol::ServerFrame;

pub type ConnId = u64;

/// Sending side of one live connection.
#[derive(Clone)]
pub struct Outbox {
    pub tx: mpsc::Sender<ServerFrame>,
    pub evict: Arc<Notify>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<ServerFrame>) -> Self {
        Self { tx, evict: Arc::new(Notify::new()) }
    }

    /// Queue a frame. On overflow the connection is flagged for eviction.
    pub fn offer(&self, frame: ServerFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Back-reference from a connection to its registry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub conn_id: ConnId,
    pub user_id: String,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    users: Mutex<HashMap<String, HashMap<ConnId, Outbox>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a connection that has not authenticated yet.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, user_id: &str, conn_id: ConnId, outbox: Outbox) -> Registration {
        self.users
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id, outbox);
        Registration { conn_id, user_id: user_id.to_string() }
    }

    /// Remove a connection. Safe to call more than once.
    pub fn deregister(&self, reg: &Registration) -> bool {
        let mut users = self.users.lock();
        let Some(conns) = users.get_mut(&reg.user_id) else {
            return false;
        };
        let removed = conns.remove(&reg.conn_id).is_some();
        if conns.is_empty() {
            users.remove(&reg.user_id);
        }
        removed
    }

    pub fn connections_for(&self, user_id: &str) -> Vec<ConnId> {
        self.users
            .lock()
            .get(user_id)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.lock().contains_key(user_id)
    }

    /// Send to every live connection of `user_id`. Returns how many accepted the frame.
    pub fn push(&self, user_id: &str, frame: &ServerFrame) -> usize {
        self.push_except(user_id, frame, None)
    }

    /// Like [`push`](Self::push) but skips one connection (the originator).
    pub fn push_except(&self, user_id: &str, frame: &ServerFrame, skip: Option<ConnId>) -> usize {
        let users = self.users.lock();
        let Some(conns) = users.get(user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for (conn_id, outbox) in conns {
            if Some(*conn_id) == skip {
                continue;
            }
            if outbox.offer(frame.clone()) {
                delivered += 1;
            } else {
                tracing::warn!(user_id, conn_id, "push skipped: outbound queue full or closed");
            }
        }
        delivered
    }

    /// Send to a single connection of `user_id`.
    pub fn send_to(&self, user_id: &str, conn_id: ConnId, frame: &ServerFrame) -> bool {
        let users = self.users.lock();
        users
            .get(user_id)
            .and_then(|conns| conns.get(&conn_id))
            .is_some_and(|outbox| outbox.offer(frame.clone()))
    }

    pub fn connection_count(&self) -> usize {
        self.users.lock().values().map(HashMap::len).sum()
    }

    pub fn online_users(&self) -> usize {
        self.users.lock().len()
    }
}
