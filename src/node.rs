//! Node-side broker client.
//!
//! A [`Node`] dials a tree, runs the shared-secret handshake, and then
//! exchanges envelopes: broker commands (correlated `_server` replies),
//! forwards to peers, and raw-frame flow pushes. A background demux thread
//! splits inbound traffic: envelopes whose `_add` matches an outstanding
//! request complete that request; everything else lands on the receive
//! queue for the application.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::ident;
use crate::pipe::{Pipe, PipeError, PipeMessage};

/// Default wait for a broker command reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Node-side failures.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The tree closed the connection during the handshake (bad token,
    /// bad credentials, or not a tree at all).
    #[error("handshake rejected by the tree")]
    Rejected,

    /// A correlated wait expired.
    #[error("request timed out")]
    Timeout,

    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// The broker refused an operation (e.g. flow target offline).
    #[error("broker refused: {0}")]
    Refused(String),

    /// Socket-level failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Pipe-level failure.
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

/// What a node tells the tree about itself at handshake.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Group id.
    pub uid: String,
    /// Group secret.
    pub pwd: String,
    /// Node id: host MAC, optionally role-tagged.
    pub mac: String,
    /// Library version string.
    pub version: String,
    /// Operating system label.
    pub os: String,
    /// Host name.
    pub name: String,
    /// Declared methods: name → description.
    pub methods: Map<String, Value>,
}

impl NodeIdentity {
    /// Gather identity from the host: MAC probe, hostname, OS label.
    pub fn gather(uid: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            pwd: pwd.into(),
            mac: ident::host_mac(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            name: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            methods: Map::new(),
        }
    }

    /// Suffix the mac with a role tag, e.g. `-FileNode-ab12`.
    pub fn with_role(mut self, role: &str) -> Self {
        self.mac = format!("{}-{}-{}", self.mac, role, ident::safe_code(4));
        self
    }

    /// Declare a method the node answers to (surfaced via `activities`).
    pub fn declare(mut self, method: &str, description: &str) -> Self {
        self.methods
            .insert(method.to_string(), Value::String(description.to_string()));
        self
    }
}

/// Handler for commands peers run on this node via `multi_cmd`.
///
/// A `Some` return is sent back to the originator as a correlated reply.
pub type NodeCommandFn = Arc<dyn Fn(&Node, &[u8], &Value) -> Option<Value> + Send + Sync>;

struct NodeInner {
    pipe: Arc<Pipe>,
    stream: TcpStream,
    mac: String,
    server_methods: Vec<String>,
    waiters: Mutex<HashMap<String, mpsc::SyncSender<PipeMessage>>>,
    recv_rx: Mutex<mpsc::Receiver<PipeMessage>>,
    commands: Mutex<HashMap<String, (String, NodeCommandFn)>>,
}

/// See the module docs.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("mac", &self.inner.mac).finish_non_exhaustive()
    }
}

impl Node {
    /// Dial a tree and run the handshake.
    pub fn connect(
        addr: impl ToSocketAddrs,
        token: &str,
        identity: NodeIdentity,
    ) -> Result<Self, NodeError> {
        let stream = TcpStream::connect(addr)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let pipe = Arc::new(Pipe::new(reader, writer));

        let hello = json!({
            "uid": identity.uid,
            "pwd": identity.pwd,
            "token": token,
            "mac": identity.mac.clone(),
            "version": identity.version,
        });
        pipe.create_mission(serde_json::to_vec(&hello).unwrap_or_default(), json!({}))?;
        let descr = json!({
            "os": identity.os,
            "name": identity.name,
            "meth": identity.methods,
        });
        pipe.create_mission(serde_json::to_vec(&descr).unwrap_or_default(), json!({}))?;

        // A tree that rejects the handshake closes without replying.
        let Some((meta, _info)) = pipe.recv_timeout(Duration::from_secs(30)) else {
            pipe.close();
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return Err(NodeError::Rejected);
        };
        let reply: Value = serde_json::from_slice(&meta).map_err(|_| NodeError::Rejected)?;
        let server_methods = reply
            .get("meth")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let (recv_tx, recv_rx) = mpsc::channel();
        let inner = Arc::new(NodeInner {
            pipe: Arc::clone(&pipe),
            stream,
            mac: identity.mac,
            server_methods,
            waiters: Mutex::new(HashMap::new()),
            recv_rx: Mutex::new(recv_rx),
            commands: Mutex::new(HashMap::new()),
        });

        let demux = Arc::clone(&inner);
        thread::spawn(move || demux_loop(&demux, &recv_tx));

        Ok(Self { inner })
    }

    /// This node's mac id, as admitted by the tree.
    pub fn mac(&self) -> &str {
        &self.inner.mac
    }

    /// Commands the tree advertised at handshake.
    pub fn server_methods(&self) -> &[String] {
        &self.inner.server_methods
    }

    /// Whether the connection is still live.
    pub fn is_connected(&self) -> bool {
        self.inner.pipe.is_running()
    }

    /// Run a broker command and wait for its correlated `_server` reply.
    /// `extra` fields are merged into the command envelope.
    pub fn command(
        &self,
        cmd: &str,
        extra: Map<String, Value>,
        timeout: Duration,
    ) -> Result<PipeMessage, NodeError> {
        let add = ident::correlator();
        let mut info = extra;
        info.insert("_type".into(), json!("cmd"));
        info.insert("cmd".into(), json!(cmd));
        info.insert("_add".into(), json!(add));
        self.send_correlated(Vec::new(), Value::Object(info), &add, timeout)
    }

    /// `activities` (a.k.a. `lsc`): the tree's current membership list.
    pub fn activities(&self) -> Result<Vec<Value>, NodeError> {
        let (meta, _) = self.command("activities", Map::new(), DEFAULT_COMMAND_TIMEOUT)?;
        let list: Value = serde_json::from_slice(&meta).map_err(|_| NodeError::Closed)?;
        Ok(list.as_array().cloned().unwrap_or_default())
    }

    /// Fire-and-forget forward of `data` to the peer holding `recver_mac`.
    pub fn forward(
        &self,
        recver_mac: &str,
        data: Vec<u8>,
        headers: Map<String, Value>,
    ) -> Result<(), NodeError> {
        let mut info = headers;
        info.insert("_type".into(), json!("for"));
        info.insert("recver".into(), json!(recver_mac));
        self.inner.pipe.create_mission(data, Value::Object(info))?;
        Ok(())
    }

    /// Forward to a peer and wait for its `_add`-correlated reply.
    pub fn request(
        &self,
        recver_mac: &str,
        data: Vec<u8>,
        headers: Map<String, Value>,
        timeout: Duration,
    ) -> Result<PipeMessage, NodeError> {
        let add = ident::correlator();
        let mut info = headers;
        info.insert("_type".into(), json!("for"));
        info.insert("recver".into(), json!(recver_mac));
        info.insert("_add".into(), json!(add));
        self.send_correlated(data, Value::Object(info), &add, timeout)
    }

    /// Register a handler for a command peers invoke via `multi_cmd`.
    ///
    /// Dispatch runs on its own thread per invocation, so a handler may call
    /// back into the node (including correlated requests) freely.
    pub fn on_command(
        &self,
        name: &str,
        description: &str,
        handler: impl Fn(&Node, &[u8], &Value) -> Option<Value> + Send + Sync + 'static,
    ) {
        self.inner.commands.lock().expect("commands poisoned").insert(
            name.to_string(),
            (description.to_string(), Arc::new(handler)),
        );
    }

    /// Commands this node answers to, as `name → description`.
    pub fn declared_commands(&self) -> Map<String, Value> {
        self.inner
            .commands
            .lock()
            .expect("commands poisoned")
            .iter()
            .map(|(name, (desc, _))| (name.clone(), Value::String(desc.clone())))
            .collect()
    }

    /// Run `command` on the node holding `remote_mac` and wait for its
    /// correlated reply. A missing or unreachable target answers
    /// `{"resp": "Inactive"}` from the broker.
    pub fn remote_command(
        &self,
        remote_mac: &str,
        command: &str,
        extra: Map<String, Value>,
        timeout: Duration,
    ) -> Result<PipeMessage, NodeError> {
        let add = ident::correlator();
        let mut info = extra;
        info.insert("_type".into(), json!("cmd"));
        info.insert("cmd".into(), json!("multi_cmd"));
        info.insert("remote".into(), json!(remote_mac));
        info.insert("command".into(), json!(command));
        info.insert("_add".into(), json!(add));
        self.send_correlated(Vec::new(), Value::Object(info), &add, timeout)
    }

    /// Answer a forwarded request: same `_add`, back to its `sender`.
    pub fn reply(&self, request_info: &Value, data: Vec<u8>) -> Result<(), NodeError> {
        let Some(sender) = request_info.get("sender").and_then(Value::as_str) else {
            return Err(NodeError::Closed);
        };
        let mut headers = Map::new();
        if let Some(add) = request_info.get("_add") {
            headers.insert("_add".into(), add.clone());
        }
        self.forward(sender, data, headers)
    }

    /// Next envelope not claimed by a correlated wait.
    pub fn recv(&self) -> Option<PipeMessage> {
        self.inner.recv_rx.lock().expect("recv rx poisoned").recv().ok()
    }

    /// Non-blocking [`Node::recv`].
    pub fn try_recv(&self) -> Option<PipeMessage> {
        self.inner.recv_rx.lock().expect("recv rx poisoned").try_recv().ok()
    }

    /// [`Node::recv`] with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PipeMessage> {
        self.inner
            .recv_rx
            .lock()
            .expect("recv rx poisoned")
            .recv_timeout(timeout)
            .ok()
    }

    /// Push one raw frame to a peer through the tree (`flow_trans`).
    ///
    /// Waits for the broker's `Con` gate, then streams `len` bytes from
    /// `reader` as a single frame tagged `name`. The peer receives it on its
    /// pipe's raw path (buffered, or spooled via `set_raw_spool`).
    pub fn flow_push(
        &self,
        target_mac: &str,
        name: &str,
        len: u64,
        reader: &mut dyn Read,
    ) -> Result<(), NodeError> {
        let mut extra = Map::new();
        extra.insert("target".into(), json!(target_mac));
        self.gated_push("flow_trans", extra, name, len, reader)
    }

    /// Legacy-shaped transfer (`trans`): the peer is first told
    /// `[name, size, buff]`, then receives the frame.
    pub fn trans_push(
        &self,
        target_mac: &str,
        name: &str,
        len: u64,
        buff: u64,
        reader: &mut dyn Read,
    ) -> Result<(), NodeError> {
        let mut extra = Map::new();
        extra.insert("target".into(), json!(target_mac));
        extra.insert("name".into(), json!(name));
        extra.insert("size".into(), json!(len));
        extra.insert("buff".into(), json!(buff));
        self.gated_push("trans", extra, name, len, reader)
    }

    fn gated_push(
        &self,
        cmd: &str,
        extra: Map<String, Value>,
        name: &str,
        len: u64,
        reader: &mut dyn Read,
    ) -> Result<(), NodeError> {
        let (gate, _) = self.command(cmd, extra, DEFAULT_COMMAND_TIMEOUT)?;
        if gate.as_slice() != b"Con" {
            return Err(NodeError::Refused(
                String::from_utf8_lossy(&gate).into_owned(),
            ));
        }
        self.inner.pipe.write_raw_frame_from(name, len, reader)?;
        Ok(())
    }

    /// Spool for incoming raw frames; see [`Pipe::set_raw_spool`].
    pub fn set_raw_spool(
        &self,
        spool: impl Fn(&str, u64) -> Option<Box<dyn std::io::Write + Send>> + Send + 'static,
    ) {
        self.inner.pipe.set_raw_spool(spool);
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.inner.pipe.close();
        let _ = self.inner.stream.shutdown(std::net::Shutdown::Both);
    }

    fn send_correlated(
        &self,
        data: Vec<u8>,
        info: Value,
        add: &str,
        timeout: Duration,
    ) -> Result<PipeMessage, NodeError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.inner
            .waiters
            .lock()
            .expect("waiters poisoned")
            .insert(add.to_string(), tx);

        if let Err(err) = self.inner.pipe.create_mission(data, info) {
            self.inner.waiters.lock().expect("waiters poisoned").remove(add);
            return Err(err.into());
        }

        match rx.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.inner.waiters.lock().expect("waiters poisoned").remove(add);
                Err(NodeError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(NodeError::Closed),
        }
    }
}

fn demux_loop(inner: &Arc<NodeInner>, recv_tx: &mpsc::Sender<PipeMessage>) {
    while let Some((data, info)) = inner.pipe.recv() {
        let waiter = info
            .get("_add")
            .and_then(Value::as_str)
            .and_then(|add| inner.waiters.lock().expect("waiters poisoned").remove(add));
        if let Some(tx) = waiter {
            let _ = tx.send((data, info));
            continue;
        }

        // A command a peer asked us to run, delivered through `multi_cmd`.
        let handler = info
            .get("command")
            .and_then(Value::as_str)
            .and_then(|name| {
                inner
                    .commands
                    .lock()
                    .expect("commands poisoned")
                    .get(name)
                    .map(|(_, f)| Arc::clone(f))
            });
        if let Some(handler) = handler {
            let node = Node { inner: Arc::clone(inner) };
            thread::spawn(move || {
                if let Some(result) = handler(&node, &data, &info) {
                    let payload = serde_json::to_vec(&result).unwrap_or_default();
                    if let Err(err) = node.reply(&info, payload) {
                        log::warn!("[node] command reply failed: {err}");
                    }
                }
            });
            continue;
        }

        if recv_tx.send((data, info)).is_err() {
            break;
        }
    }
    // Connection gone: wake every outstanding waiter by dropping its slot.
    inner.waiters.lock().expect("waiters poisoned").clear();
    log::debug!("[node] {} demux finished", inner.mac);
}
