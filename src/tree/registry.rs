//! Membership registry for one broker port.
//!
//! The roster is the single source of truth for who is connected: one entry
//! per live connection, at most one entry per mac. Only the accept and
//! finish paths mutate it; forwarders just read.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::pipe::{Pipe, PipeError};

/// One admitted connection.
pub struct Member {
    conn_id: u64,
    mac: String,
    identity: Value,
    pipe: Arc<Pipe>,
    stream: TcpStream,
    /// Held for the duration of a `trans`/`flow_trans` relay: at most one
    /// flow per connection at a time.
    pub(crate) flow_lock: Mutex<()>,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("conn_id", &self.conn_id)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

impl Member {
    pub(crate) fn new(
        conn_id: u64,
        mac: String,
        identity: Value,
        pipe: Arc<Pipe>,
        stream: TcpStream,
    ) -> Self {
        Self { conn_id, mac, identity, pipe, stream, flow_lock: Mutex::new(()) }
    }

    /// Connection id, unique per roster for its lifetime.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The member's mac id.
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Identity fields declared at handshake (mac, uid, os, name, version,
    /// meth). Secrets are never stored here.
    pub fn identity(&self) -> &Value {
        &self.identity
    }

    /// Enqueue an envelope on this member's send pipe.
    pub fn send(&self, meta: Vec<u8>, info: Value) -> Result<(), PipeError> {
        self.pipe.create_mission(meta, info).map(|_| ())
    }

    pub(crate) fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// Tear the connection down: pipe first, then the socket, so blocked
    /// reads wake.
    pub fn shutdown(&self) {
        self.pipe.close();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// See the module docs.
pub struct Roster {
    members: Mutex<Vec<Arc<Member>>>,
    next_conn_id: AtomicU64,
}

impl std::fmt::Debug for Roster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roster").field("members", &self.len()).finish()
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    /// An empty roster.
    pub fn new() -> Self {
        Self { members: Mutex::new(Vec::new()), next_conn_id: AtomicU64::new(1) }
    }

    /// Allocate a connection id for a member under construction.
    pub(crate) fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Admit a member. The caller must have evicted any prior holder of the
    /// same mac first.
    pub(crate) fn insert(&self, member: Arc<Member>) {
        self.members.lock().expect("roster poisoned").push(member);
    }

    /// Remove and return the member holding `mac`, if any.
    pub(crate) fn evict(&self, mac: &str) -> Option<Arc<Member>> {
        let mut members = self.members.lock().expect("roster poisoned");
        let pos = members.iter().position(|m| m.mac == mac)?;
        Some(members.remove(pos))
    }

    /// Remove the member with `conn_id`, if still present. Guarded by
    /// connection id so a finish path cannot remove a newer connection that
    /// reclaimed the same mac.
    pub(crate) fn remove_conn(&self, conn_id: u64) -> Option<Arc<Member>> {
        let mut members = self.members.lock().expect("roster poisoned");
        let pos = members.iter().position(|m| m.conn_id == conn_id)?;
        Some(members.remove(pos))
    }

    /// Look a member up by mac.
    pub fn get(&self, mac: &str) -> Option<Arc<Member>> {
        self.members
            .lock()
            .expect("roster poisoned")
            .iter()
            .find(|m| m.mac == mac)
            .cloned()
    }

    /// Identity list for `activities` / `lsc`.
    pub fn snapshot(&self) -> Vec<Value> {
        self.members
            .lock()
            .expect("roster poisoned")
            .iter()
            .map(|m| m.identity.clone())
            .collect()
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.members.lock().expect("roster poisoned").len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
