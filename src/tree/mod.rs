//! The broker ("tree"): authenticates nodes, tracks membership, routes
//! envelopes, relays bulk flows.
//!
//! ```text
//! node ──TCP──► Tree ── handshake ──► roster entry
//!                 │
//!                 ├─ {_type:"cmd"}  → broker command (alive/lsc/activities/
//!                 │                   trans/flow_trans/multi_cmd/extensions)
//!                 └─ {_type:"for"}  → look up recver, stamp sender + time,
//!                                     enqueue on target's send pipe
//! ```
//!
//! One `Tree` owns one port: its own admission token, group secrets, command
//! table, and membership roster. Multi-port deployments run several trees;
//! nothing is shared between them, so connections cannot leak across ports.
//!
//! Per accepted connection: a [`Pipe`] over the socket and a handler thread
//! draining its envelopes. Routing fields ride in the mission `info`; the
//! payload (`_data`) is the mission meta and is never inspected here — the
//! broker routes envelopes, it does not read them.
//!
//! Failure is local: a framing error, an idle timeout (300 s default), or a
//! failed handshake closes that one connection and deterministically removes
//! its roster entry. Other connections are unaffected.

pub mod registry;

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::pipe::Pipe;

pub use registry::{Member, Roster};

/// Default idle read window before a connection is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Window for the two handshake envelopes plus reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Context handed to an extension command.
pub struct CmdContext<'a> {
    /// The connection that issued the command.
    pub member: &'a Arc<Member>,
    /// This port's membership roster.
    pub roster: &'a Roster,
    /// Envelope payload (`_data`).
    pub meta: &'a [u8],
    /// Envelope headers.
    pub info: &'a Value,
}

type CommandFn = Arc<dyn for<'a> Fn(&CmdContext<'a>) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
enum CommandKind {
    Alive,
    Activities,
    Trans,
    FlowTrans,
    MultiCmd,
    Custom(CommandFn),
}

#[derive(Clone)]
struct CommandEntry {
    description: String,
    kind: CommandKind,
}

struct TreeInner {
    name: String,
    token: Mutex<Option<String>>,
    groups: Mutex<HashMap<String, String>>,
    commands: Mutex<HashMap<String, CommandEntry>>,
    roster: Roster,
    running: AtomicBool,
    idle_timeout: Mutex<Duration>,
}

/// See the module docs.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("name", &self.inner.name)
            .field("members", &self.inner.roster.len())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// A broker with the built-in command set and no groups yet.
    pub fn new(name: impl Into<String>) -> Self {
        let mut commands = HashMap::new();
        let builtin = [
            ("alive", "Test for checking connection", CommandKind::Alive),
            ("lsc", "Get online nodes list", CommandKind::Activities),
            ("activities", "Get online nodes list", CommandKind::Activities),
            ("trans", "Relay a named byte stream to another node", CommandKind::Trans),
            ("flow_trans", "Relay one raw frame to another node", CommandKind::FlowTrans),
            ("multi_cmd", "Run a command on another node", CommandKind::MultiCmd),
        ];
        for (name, desc, kind) in builtin {
            commands.insert(
                name.to_string(),
                CommandEntry { description: desc.to_string(), kind },
            );
        }
        Self {
            inner: Arc::new(TreeInner {
                name: name.into(),
                token: Mutex::new(None),
                groups: Mutex::new(HashMap::new()),
                commands: Mutex::new(commands),
                roster: Roster::new(),
                running: AtomicBool::new(false),
                idle_timeout: Mutex::new(DEFAULT_IDLE_TIMEOUT),
            }),
        }
    }

    /// Set the admission token nodes must present.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.inner.token.lock().expect("token poisoned") = Some(token.into());
    }

    /// Register a group (uid) and its shared secret.
    pub fn add_group(&self, uid: impl Into<String>, pwd: impl Into<String>) {
        self.inner
            .groups
            .lock()
            .expect("groups poisoned")
            .insert(uid.into(), pwd.into());
    }

    /// Idle read window per connection.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.inner.idle_timeout.lock().expect("idle timeout poisoned") = timeout;
    }

    /// Register an extension command. `Some` returns are sent back to the
    /// caller as a `_server` reply correlated by `_add`.
    pub fn command(
        &self,
        name: &str,
        description: &str,
        handler: impl for<'a> Fn(&CmdContext<'a>) -> Option<Value> + Send + Sync + 'static,
    ) {
        self.inner.commands.lock().expect("commands poisoned").insert(
            name.to_string(),
            CommandEntry {
                description: description.to_string(),
                kind: CommandKind::Custom(Arc::new(handler)),
            },
        );
    }

    /// This port's roster.
    pub fn roster(&self) -> &Roster {
        &self.inner.roster
    }

    /// Bind and serve, blocking the calling thread.
    pub fn run(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).context("bind tree listener")?;
        self.serve(listener)
    }

    /// Bind, then serve on a background thread. Returns the bound address.
    pub fn spawn(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).context("bind tree listener")?;
        let local = listener.local_addr()?;
        let tree = self.clone();
        thread::spawn(move || {
            if let Err(err) = tree.serve(listener) {
                log::error!("[tree] serve failed: {err}");
            }
        });
        Ok(local)
    }

    /// Stop accepting. Existing connections drain on their own timeouts.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    fn serve(&self, listener: TcpListener) -> Result<()> {
        self.inner.running.store(true, Ordering::Release);
        listener.set_nonblocking(true).context("set listener non-blocking")?;
        log::info!(
            "[tree] '{}' listening on {}",
            self.inner.name,
            listener.local_addr().map_or_else(|_| "?".into(), |a| a.to_string())
        );
        while self.inner.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("[tree] connection from {peer}");
                    let inner = Arc::clone(&self.inner);
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(&inner, stream) {
                            log::debug!("[tree] connection from {peer} ended: {err}");
                        }
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(250));
                }
                Err(err) => return Err(err).context("accept"),
            }
        }
        Ok(())
    }
}

/// Seconds since the epoch, for envelope `time` stamps.
fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// ─── Connection lifecycle ──────────────────────────────────────────────────

fn handle_connection(inner: &Arc<TreeInner>, stream: TcpStream) -> Result<()> {
    let idle = *inner.idle_timeout.lock().expect("idle timeout poisoned");
    stream.set_read_timeout(Some(idle)).context("set read timeout")?;
    let reader = stream.try_clone().context("clone for reader")?;
    let writer = stream.try_clone().context("clone for writer")?;
    let pipe = Arc::new(Pipe::new(reader, writer));

    let member = match admit(inner, &pipe, &stream) {
        Ok(member) => member,
        Err(err) => {
            // No reply on a failed handshake: close and walk away.
            pipe.close();
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return Err(err);
        }
    };
    let conn_id = member.conn_id();
    let mac = member.mac().to_string();
    log::info!("[tree] '{}' admitted {mac}", inner.name);

    while let Some((meta, info)) = pipe.recv() {
        match info.get("_type").and_then(Value::as_str) {
            Some("cmd") => handle_cmd(inner, &member, &meta, &info),
            Some("for") => handle_forward(inner, &member, meta, &info),
            _ => {
                if info.get("_raw").is_some() {
                    log::debug!("[tree] unexpected raw frame from {mac}, dropped");
                } else {
                    log::debug!("[tree] envelope without _type from {mac}, dropped");
                }
            }
        }
    }

    // Deterministic teardown: only this connection's entry, never a newer
    // holder of the same mac.
    inner.roster.remove_conn(conn_id);
    member.shutdown();
    log::info!("[tree] '{}' dropped {mac}", inner.name);
    Ok(())
}

/// The shared-secret handshake. Any failure is silent: no reply, connection
/// closed by the caller.
fn admit(inner: &Arc<TreeInner>, pipe: &Arc<Pipe>, stream: &TcpStream) -> Result<Arc<Member>> {
    let Some((meta, _)) = pipe.recv_timeout(HANDSHAKE_TIMEOUT) else {
        bail!("no handshake envelope");
    };
    let hello: Value = serde_json::from_slice(&meta).context("handshake-1 json")?;

    let token_ok = match &*inner.token.lock().expect("token poisoned") {
        Some(expected) => hello.get("token").and_then(Value::as_str) == Some(expected.as_str()),
        None => true,
    };
    if !token_ok {
        bail!("bad admission token");
    }
    let uid = hello.get("uid").and_then(Value::as_str).unwrap_or_default().to_string();
    let pwd = hello.get("pwd").and_then(Value::as_str).unwrap_or_default();
    let group_ok = inner
        .groups
        .lock()
        .expect("groups poisoned")
        .get(&uid)
        .is_some_and(|expected| expected == pwd);
    if !group_ok {
        bail!("bad group credentials");
    }
    let Some(mac) = hello.get("mac").and_then(Value::as_str).map(str::to_string) else {
        bail!("handshake without mac");
    };

    let Some((meta2, _)) = pipe.recv_timeout(HANDSHAKE_TIMEOUT) else {
        bail!("no descriptor envelope");
    };
    let descr: Value = serde_json::from_slice(&meta2).context("handshake-2 json")?;

    let identity = json!({
        "mac": mac,
        "uid": uid,
        "version": hello.get("version").cloned().unwrap_or(Value::Null),
        "os": descr.get("os").cloned().unwrap_or(Value::Null),
        "name": descr.get("name").cloned().unwrap_or(Value::Null),
        "meth": descr.get("meth").cloned().unwrap_or(Value::Null),
    });

    // One mac, one connection: evict the prior holder before admitting.
    if let Some(old) = inner.roster.evict(&mac) {
        log::info!("[tree] evicting prior connection for {mac}");
        old.shutdown();
    }

    let conn_id = inner.roster.alloc_conn_id();
    let member = Arc::new(Member::new(
        conn_id,
        mac,
        identity,
        Arc::clone(pipe),
        stream.try_clone().context("clone for member")?,
    ));
    inner.roster.insert(Arc::clone(&member));

    let meth: Vec<String> = {
        let commands = inner.commands.lock().expect("commands poisoned");
        let mut names: Vec<String> = commands.keys().cloned().collect();
        names.sort();
        names
    };
    member
        .send(
            serde_json::to_vec(&json!({ "meth": meth }))?,
            json!({"sender": "_server", "time": unix_now()}),
        )
        .context("handshake reply")?;
    Ok(member)
}

// ─── Command dispatch ──────────────────────────────────────────────────────

fn server_reply(member: &Arc<Member>, add: &str, result: &Value) {
    let payload = serde_json::to_vec(result).unwrap_or_default();
    send_server_meta(member, add, payload);
}

fn send_server_meta(member: &Arc<Member>, add: &str, meta: Vec<u8>) {
    let info = json!({"sender": "_server", "time": unix_now(), "_add": add});
    if let Err(err) = member.send(meta, info) {
        log::warn!("[tree] reply to {} failed: {err}", member.mac());
    }
}

fn handle_cmd(inner: &Arc<TreeInner>, member: &Arc<Member>, meta: &[u8], info: &Value) {
    let cmd = info.get("cmd").and_then(Value::as_str).unwrap_or_default();
    let add = info.get("_add").and_then(Value::as_str).unwrap_or_default().to_string();

    let entry = inner.commands.lock().expect("commands poisoned").get(cmd).cloned();
    let Some(entry) = entry else {
        log::debug!("[tree] unknown command '{cmd}' from {}", member.mac());
        return;
    };

    match entry.kind {
        CommandKind::Alive => server_reply(member, &add, &json!({"resp": "OK"})),
        CommandKind::Activities => {
            server_reply(member, &add, &Value::Array(inner.roster.snapshot()));
        }
        CommandKind::Trans => run_flow(inner, member, info, &add, true),
        CommandKind::FlowTrans => run_flow(inner, member, info, &add, false),
        CommandKind::MultiCmd => run_multi_cmd(inner, member, meta, info, &add),
        CommandKind::Custom(handler) => {
            let ctx = CmdContext { member, roster: &inner.roster, meta, info };
            if let Some(result) = handler(&ctx) {
                server_reply(member, &add, &result);
            }
        }
    }
}

/// Fields of a `multi_cmd` envelope consumed by the broker itself.
const MULTI_CMD_FIELDS: [&str; 5] = ["_type", "cmd", "remote", "method", "pipe_safe_code"];

/// Run a command on another node: rewrite the envelope as
/// `{command, remote: <source mac>, ...}` and enqueue it on the target.
///
/// The meaningful response comes from the remote node (correlated by the
/// `_add` the envelope carries through), so no broker confirmation is sent
/// on success; a missing target answers `{"resp": "Inactive"}` so a
/// correlated caller is not left hanging.
fn run_multi_cmd(
    inner: &Arc<TreeInner>,
    source: &Arc<Member>,
    meta: &[u8],
    info: &Value,
    add: &str,
) {
    let remote = info.get("remote").and_then(Value::as_str).unwrap_or_default();
    let command = info.get("command").and_then(Value::as_str).unwrap_or("msg");
    let Some(target) = inner.roster.get(remote) else {
        server_reply(source, add, &json!({"resp": "Inactive"}));
        return;
    };

    let mut fwd: Map<String, Value> = match info {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for field in MULTI_CMD_FIELDS {
        fwd.remove(field);
    }
    fwd.insert("command".into(), Value::String(command.to_string()));
    fwd.insert("remote".into(), Value::String(source.mac().to_string()));
    fwd.insert("sender".into(), Value::String(source.mac().to_string()));
    fwd.insert("time".into(), Value::from(unix_now()));

    if target.send(meta.to_vec(), Value::Object(fwd)).is_err() {
        log::warn!("[tree] multi_cmd delivery to {remote} failed, closing it");
        inner.roster.remove_conn(target.conn_id());
        target.shutdown();
        server_reply(source, add, &json!({"resp": "Inactive"}));
    }
}

/// Relay one raw frame from `source` to the node named by `info.target`.
///
/// `legacy_notice` is the `trans` shape: the target is told
/// `[name, size, buff]` before the bytes; `flow_trans` skips the notice.
/// Both gate source and target with their flow locks (taken in mac order)
/// so at most one flow runs on either connection, and the relay itself
/// holds the target's writer for the whole body.
fn run_flow(
    inner: &Arc<TreeInner>,
    source: &Arc<Member>,
    info: &Value,
    add: &str,
    legacy_notice: bool,
) {
    let target_mac = info.get("target").and_then(Value::as_str).unwrap_or_default();
    let Some(target) = inner.roster.get(target_mac) else {
        send_server_meta(source, add, b"Not".to_vec());
        return;
    };

    let same = source.conn_id() == target.conn_id();
    let (first, second) = if source.mac() <= target.mac() {
        (Arc::clone(source), Arc::clone(&target))
    } else {
        (Arc::clone(&target), Arc::clone(source))
    };
    let _flow_a = first.flow_lock.lock().expect("flow lock poisoned");
    let _flow_b = if same {
        None
    } else {
        Some(second.flow_lock.lock().expect("flow lock poisoned"))
    };

    if legacy_notice {
        let name = info.get("name").and_then(Value::as_str).unwrap_or("temp.cot");
        let size = info.get("size").and_then(Value::as_u64).unwrap_or(0);
        let buff = info.get("buff").and_then(Value::as_u64).unwrap_or(2048);
        let notice = serde_json::to_vec(&json!([name, size, buff])).unwrap_or_default();
        // Written synchronously: the relayed frame goes through the same
        // writer and must not overtake the notice.
        if target
            .pipe()
            .write_mission_now(
                notice,
                json!({"sender": "_server", "time": unix_now(), "flow": "incoming"}),
            )
            .is_err()
        {
            send_server_meta(source, add, b"Not".to_vec());
            return;
        }
    }

    // Arm the relay before 'Con': the source sends its raw frame only after
    // seeing the reply, so the receiver cannot miss it.
    let done = source.pipe().relay_next_raw_frame(target.pipe().raw_writer());
    send_server_meta(source, add, b"Con".to_vec());

    match done.recv() {
        Ok(Ok(bytes)) => {
            log::info!(
                "[tree] relayed {bytes} bytes {} -> {}",
                source.mac(),
                target.mac()
            );
        }
        Ok(Err(err)) => {
            // A target write failure closes the target, not the source.
            log::warn!("[tree] relay into {} failed: {err}", target.mac());
            inner.roster.remove_conn(target.conn_id());
            target.shutdown();
        }
        Err(_) => {
            log::debug!("[tree] relay source {} went away", source.mac());
        }
    }
}

// ─── Forwarding ────────────────────────────────────────────────────────────

/// Client-only envelope fields stripped before forwarding.
const CLIENT_ONLY_FIELDS: [&str; 4] = ["_type", "recver", "method", "pipe_safe_code"];

fn handle_forward(inner: &Arc<TreeInner>, member: &Arc<Member>, meta: Vec<u8>, info: &Value) {
    let Some(recver) = info.get("recver").and_then(Value::as_str) else {
        log::debug!("[tree] forward without recver from {}", member.mac());
        return;
    };
    let Some(target) = inner.roster.get(recver) else {
        // Best-effort delivery: a missing target drops silently.
        log::debug!("[tree] forward to offline {recver} dropped");
        return;
    };

    let mut fwd: Map<String, Value> = match info {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for field in CLIENT_ONLY_FIELDS {
        fwd.remove(field);
    }
    fwd.insert("sender".into(), Value::String(member.mac().to_string()));
    fwd.insert("time".into(), Value::from(unix_now()));

    if target.send(meta, Value::Object(fwd)).is_err() {
        log::warn!("[tree] delivery to {recver} failed, closing it");
        inner.roster.remove_conn(target.conn_id());
        target.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_command_table() {
        let tree = Tree::new("t");
        let commands = tree.inner.commands.lock().unwrap();
        for name in ["alive", "lsc", "activities", "trans", "flow_trans", "multi_cmd"] {
            assert!(commands.contains_key(name), "missing builtin {name}");
            assert!(!commands[name].description.is_empty());
        }
    }

    #[test]
    fn extension_commands_join_the_table() {
        let tree = Tree::new("t");
        tree.command("echo2", "Echo the envelope back", |ctx| {
            Some(json!({"len": ctx.meta.len()}))
        });
        assert!(tree.inner.commands.lock().unwrap().contains_key("echo2"));
    }

    #[test]
    fn unix_now_is_sane() {
        // Past 2020, below 2100.
        let now = unix_now();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
