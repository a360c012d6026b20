//! Multiplex pipe: many concurrent chunked transfers over one byte stream.
//!
//! A [`Pipe`] takes a blocking reader/writer pair and presents a
//! mission-oriented API: [`Pipe::create_mission`] queues a payload with a JSON
//! `info` header, [`Pipe::recv`] yields fully reassembled `(data, info)`
//! messages, [`Pipe::cancel_mission`] abandons a transfer on both sides.
//!
//! ```text
//! create_mission ──► send pool ──► sender thread ──► frames ──► socket
//! socket ──► receiver thread ──► recv pool ──► inbound queue ──► recv()
//! ```
//!
//! Two internal threads per pipe. The sender drains control frames first
//! (announce before data, always) and then round-robins one chunk per active
//! mission per turn, so a large mission cannot starve a small concurrent one.
//! The receiver accumulates chunks per mission and surfaces a mission only
//! once its declared length is reached; a chunk past the declared length is
//! fatal for the whole pipe.
//!
//! The pipe is one-shot: after a transport error or [`Pipe::close`] it cannot
//! be restarted. The first failure fires the final-error hook exactly once.

mod mission;
pub mod multi;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ident;
use crate::protocol::{self, Frame, ProtocolError, MAX_META_LEN};

use mission::{
    split_chunks, Announce, ControlItem, FrameTag, IncomingMission, MissionRef, OutgoingMission,
    SendPool,
};

pub use multi::MultiPipe;

/// Default chunk size for mission payloads.
pub const DEFAULT_CHUNK: usize = 4096;

/// A reassembled inbound message: payload bytes plus the sender's `info`.
pub type PipeMessage = (Vec<u8>, Value);

/// Failures that shut a pipe down.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The pipe has already been closed or failed.
    #[error("pipe is closed")]
    Closed,

    /// Framing violation on the inbound stream.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An inbound mission received more bytes than it announced.
    #[error("mission {extension} overran its announced length")]
    MissionOverrun {
        /// The offending mission id.
        extension: String,
    },

    /// A control frame carried an unparseable body.
    #[error("malformed control frame: {0}")]
    BadControl(String),

    /// Transport write failure.
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    /// No pipe registered under the requested safe-code.
    #[error("no pipe registered under code {0:?}")]
    UnknownPipe(String),

    /// The MultiPipe has no child pipes yet.
    #[error("no pipes registered")]
    NoPipes,
}

type BoxedReader = Box<dyn Read + Send>;
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;
type CancelHook = Box<dyn Fn(&str) + Send + Sync>;
type ErrorHook = Box<dyn FnOnce(PipeError) + Send>;
type RawSpool = Box<dyn Fn(&str, u64) -> Option<Box<dyn Write + Send>> + Send>;

/// Pending raw-frame relay: forward the next raw frame into another writer.
struct FlowRelay {
    target: SharedWriter,
    done: mpsc::Sender<Result<u64, String>>,
}

/// Single-fire slot for the final-error hook.
#[derive(Default)]
struct ErrorSlot {
    hook: Option<ErrorHook>,
    pending: Option<PipeError>,
    fired: bool,
}

struct Shared {
    chunk: usize,
    running: AtomicBool,
    pool: Mutex<SendPool>,
    pool_cv: Condvar,
    writer: SharedWriter,
    inbound_tx: Mutex<Option<mpsc::Sender<PipeMessage>>>,
    cancel_hook: Mutex<Option<CancelHook>>,
    error_slot: Mutex<ErrorSlot>,
    relay: Mutex<Option<FlowRelay>>,
    raw_spool: Mutex<Option<RawSpool>>,
}

impl Shared {
    /// Record a failure; fires the final-error hook at most once, outside locks.
    fn fail(&self, err: PipeError) {
        let hook = {
            let mut slot = self.error_slot.lock().expect("error slot poisoned");
            if slot.fired {
                return;
            }
            match slot.hook.take() {
                Some(hook) => {
                    slot.fired = true;
                    Some(hook)
                }
                None => {
                    if slot.pending.is_none() {
                        slot.pending = Some(err);
                    }
                    return;
                }
            }
        };
        if let Some(hook) = hook {
            hook(err);
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.pool_cv.notify_all();
        // Unblock consumers and drop any armed relay so its waiter wakes.
        self.inbound_tx.lock().expect("inbound lock poisoned").take();
        self.relay.lock().expect("relay lock poisoned").take();
    }

    fn fire_cancel(&self, id: &str) {
        if let Some(hook) = &*self.cancel_hook.lock().expect("cancel hook poisoned") {
            hook(id);
        }
    }
}

/// One multiplexed connection. See the module docs.
pub struct Pipe {
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::Receiver<PipeMessage>>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Pipe {
    /// Start a pipe over a reader/writer pair with the default chunk size.
    ///
    /// Spawns the sender and receiver threads immediately.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self::with_chunk(reader, writer, DEFAULT_CHUNK)
    }

    /// Start a pipe with an explicit chunk size.
    pub fn with_chunk(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        chunk: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            chunk: chunk.max(1),
            running: AtomicBool::new(true),
            pool: Mutex::new(SendPool::default()),
            pool_cv: Condvar::new(),
            writer: Arc::new(Mutex::new(Box::new(writer) as Box<dyn Write + Send>)),
            inbound_tx: Mutex::new(Some(tx)),
            cancel_hook: Mutex::new(None),
            error_slot: Mutex::new(ErrorSlot::default()),
            relay: Mutex::new(None),
            raw_spool: Mutex::new(None),
        });

        let sender_shared = Arc::clone(&shared);
        thread::spawn(move || sender_loop(&sender_shared));

        let recv_shared = Arc::clone(&shared);
        let boxed: BoxedReader = Box::new(reader);
        thread::spawn(move || receiver_loop(&recv_shared, boxed));

        Self { shared, inbound_rx: Mutex::new(rx) }
    }

    /// An in-memory connected pair, for tests and local wiring.
    pub fn pair() -> (Pipe, Pipe) {
        Self::pair_with_chunk(DEFAULT_CHUNK)
    }

    /// [`Pipe::pair`] with an explicit chunk size.
    pub fn pair_with_chunk(chunk: usize) -> (Pipe, Pipe) {
        let (a_read, b_write) = duplex_half();
        let (b_read, a_write) = duplex_half();
        (
            Pipe::with_chunk(a_read, a_write, chunk),
            Pipe::with_chunk(b_read, b_write, chunk),
        )
    }

    /// Whether the pipe is still live.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue a payload as a new mission. Returns the 6-char mission id.
    ///
    /// The announcement is queued ahead of the data chunks; chunks interleave
    /// fairly with other active missions.
    pub fn create_mission(&self, data: Vec<u8>, info: Value) -> Result<String, PipeError> {
        self.create_mission_with_chunk(data, info, self.shared.chunk)
    }

    /// [`Pipe::create_mission`] with an explicit chunk size for this mission.
    pub fn create_mission_with_chunk(
        &self,
        data: Vec<u8>,
        info: Value,
        chunk: usize,
    ) -> Result<String, PipeError> {
        if !self.is_running() {
            return Err(PipeError::Closed);
        }
        let chunk = chunk.max(1);
        if chunk > MAX_META_LEN {
            return Err(PipeError::BadControl("chunk size exceeds frame limit".into()));
        }

        let mut pool = self.shared.pool.lock().expect("send pool poisoned");
        let mut id = ident::mission_id();
        while pool.active.iter().any(|m| m.id == id) {
            id = ident::mission_id();
        }

        let announce = Announce {
            extension: id.clone(),
            length: data.len() as u64,
            info,
        };
        let meta = serde_json::to_vec(&announce)
            .map_err(|e| PipeError::BadControl(e.to_string()))?;
        pool.control.push_back(ControlItem {
            mission: Some(id.clone()),
            frame: Frame::new(FrameTag::Mission.to_extension(), meta),
        });

        let chunks = split_chunks(data, chunk);
        if !chunks.is_empty() {
            pool.active.push_back(OutgoingMission { id: id.clone(), chunks });
        }
        drop(pool);
        self.shared.pool_cv.notify_all();
        Ok(id)
    }

    /// Cancel an outgoing mission.
    ///
    /// Removes any unsent chunks, emits a `cancel_mission` control frame to
    /// the peer (unless the announcement itself never left the queue) and
    /// fires the cancel hook. Returns `true` if the mission was still live on
    /// the send side.
    pub fn cancel_mission(&self, id: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let (known, announce_unsent) = {
            let mut pool = self.shared.pool.lock().expect("send pool poisoned");
            let (known, announce_unsent) = pool.remove_mission(id);
            if known && !announce_unsent {
                let body = MissionRef { extension: id.to_string() };
                pool.control.push_back(ControlItem {
                    mission: None,
                    frame: Frame::new(
                        FrameTag::CancelMission.to_extension(),
                        serde_json::to_vec(&body).expect("mission ref serialization"),
                    ),
                });
            }
            (known, announce_unsent)
        };
        if known || announce_unsent {
            self.shared.pool_cv.notify_all();
            self.shared.fire_cancel(id);
        }
        known || announce_unsent
    }

    /// Blocking receive of the next reassembled mission.
    ///
    /// Returns `None` once the pipe has shut down and the queue is drained.
    pub fn recv(&self) -> Option<PipeMessage> {
        self.inbound_rx.lock().expect("inbound rx poisoned").recv().ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<PipeMessage> {
        self.inbound_rx.lock().expect("inbound rx poisoned").try_recv().ok()
    }

    /// Receive with a deadline. `None` on timeout or shutdown.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PipeMessage> {
        self.inbound_rx
            .lock()
            .expect("inbound rx poisoned")
            .recv_timeout(timeout)
            .ok()
    }

    /// Install the cancellation hook, fired with the mission id on local and
    /// remote cancels.
    pub fn on_cancel(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.cancel_hook.lock().expect("cancel hook poisoned") = Some(Box::new(hook));
    }

    /// Install the final-error hook. Fires at most once, on the first
    /// transport or protocol failure; if the pipe already failed, fires
    /// immediately.
    pub fn on_final_error(&self, hook: impl FnOnce(PipeError) + Send + 'static) {
        let mut slot = self.shared.error_slot.lock().expect("error slot poisoned");
        if slot.fired {
            return;
        }
        if let Some(err) = slot.pending.take() {
            slot.fired = true;
            drop(slot);
            hook(err);
        } else {
            slot.hook = Some(Box::new(hook));
        }
    }

    /// Install a spool for raw (non-pipe) frames.
    ///
    /// Called with the frame extension and body length; returning a writer
    /// streams the body into it instead of buffering, and the surfaced
    /// message carries an empty payload with `"_spooled": true`.
    pub fn set_raw_spool(
        &self,
        spool: impl Fn(&str, u64) -> Option<Box<dyn Write + Send>> + Send + 'static,
    ) {
        *self.shared.raw_spool.lock().expect("raw spool poisoned") = Some(Box::new(spool));
    }

    /// Shut the pipe down. Idempotent; queued inbound messages stay readable.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Shared handle to the underlying writer, for raw-frame relays.
    pub(crate) fn raw_writer(&self) -> SharedWriter {
        Arc::clone(&self.shared.writer)
    }

    /// Write a whole mission synchronously, bypassing the send pool.
    ///
    /// The writer is held for the announcement and every chunk, so the
    /// mission hits the wire contiguously and ahead of anything queued
    /// behind it. Meant for small control notices that must not be
    /// overtaken by a raw-frame relay into the same writer.
    pub fn write_mission_now(&self, data: Vec<u8>, info: Value) -> Result<String, PipeError> {
        if !self.is_running() {
            return Err(PipeError::Closed);
        }
        let id = ident::mission_id();
        let announce = Announce { extension: id.clone(), length: data.len() as u64, info };
        let meta = serde_json::to_vec(&announce)
            .map_err(|e| PipeError::BadControl(e.to_string()))?;
        let announce_frame = Frame::new(FrameTag::Mission.to_extension(), meta);
        let data_tag = FrameTag::Data { extension: id.clone() }.to_extension();

        let mut writer = self.shared.writer.lock().expect("writer poisoned");
        protocol::write_frame(&mut **writer, &announce_frame)?;
        for chunk in split_chunks(data, self.shared.chunk) {
            protocol::write_frame(&mut **writer, &Frame::new(data_tag.clone(), chunk))?;
        }
        writer.flush()?;
        Ok(id)
    }

    /// Write one raw frame whose body is streamed from `reader`.
    ///
    /// Holds the writer for the whole frame, so no mission chunk can
    /// interleave with the body.
    pub fn write_raw_frame_from(
        &self,
        extension: &str,
        len: u64,
        reader: &mut dyn Read,
    ) -> Result<(), PipeError> {
        if !self.is_running() {
            return Err(PipeError::Closed);
        }
        if len as usize > MAX_META_LEN {
            return Err(PipeError::BadControl("raw frame body exceeds frame limit".into()));
        }
        let head = protocol::encode_head(extension, len as usize)
            .map_err(|e| PipeError::BadControl(e.to_string()))?;
        let mut writer = self.shared.writer.lock().expect("writer poisoned");
        writer.write_all(&head)?;
        protocol::copy_body(reader, len as usize, &mut **writer, self.shared.chunk)?;
        writer.flush()?;
        Ok(())
    }

    /// Arm a relay: the next *raw* inbound frame is forwarded verbatim
    /// (header and body) into `target`, bypassing reassembly. Pipe control
    /// and data frames keep flowing normally until the raw frame arrives.
    ///
    /// Returns a channel yielding the relayed body length, or an error
    /// description. The channel errors out if the pipe dies first.
    pub(crate) fn relay_next_raw_frame(
        &self,
        target: SharedWriter,
    ) -> mpsc::Receiver<Result<u64, String>> {
        let (done_tx, done_rx) = mpsc::channel();
        *self.shared.relay.lock().expect("relay lock poisoned") =
            Some(FlowRelay { target, done: done_tx });
        done_rx
    }
}

// ─── Sender thread ─────────────────────────────────────────────────────────

fn sender_loop(shared: &Arc<Shared>) {
    loop {
        let frame = {
            let mut pool = shared.pool.lock().expect("send pool poisoned");
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = pool.control.pop_front() {
                    break item.frame;
                }
                if let Some(mut mission) = pool.active.pop_front() {
                    let Some(chunk) = mission.chunks.pop_front() else {
                        continue;
                    };
                    let tag = FrameTag::Data { extension: mission.id.clone() };
                    if !mission.chunks.is_empty() {
                        pool.active.push_back(mission);
                    }
                    break Frame::new(tag.to_extension(), chunk);
                }
                pool = shared.pool_cv.wait(pool).expect("send pool poisoned");
            }
        };

        let result = {
            let mut writer = shared.writer.lock().expect("writer poisoned");
            protocol::write_frame(&mut **writer, &frame).and_then(|()| writer.flush())
        };
        if let Err(err) = result {
            log::debug!("[pipe] send failed: {err}");
            shared.fail(PipeError::Io(err));
            shared.shutdown();
            return;
        }
    }
}

// ─── Receiver thread ───────────────────────────────────────────────────────

fn receiver_loop(shared: &Arc<Shared>, mut reader: BoxedReader) {
    let mut pool: HashMap<String, IncomingMission> = HashMap::new();

    loop {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        let head = match protocol::read_head(&mut reader) {
            Ok(head) => head,
            Err(err) => {
                if shared.running.load(Ordering::Acquire) {
                    shared.fail(PipeError::Protocol(err));
                    shared.shutdown();
                }
                return;
            }
        };

        let tag = FrameTag::parse(&head.extension);

        // A raw frame while a relay is armed belongs to the relay.
        if tag.is_none() {
            if let Some(relay) = shared.relay.lock().expect("relay lock poisoned").take() {
                match run_relay(&mut reader, &head.raw, head.meta_len, &relay, shared.chunk) {
                    Ok(()) => continue,
                    Err(err) => {
                        shared.fail(err);
                        shared.shutdown();
                        return;
                    }
                }
            }
        }

        let outcome = match tag {
            Some(FrameTag::Mission) => handle_announce(shared, &mut reader, head.meta_len, &mut pool),
            Some(FrameTag::Data { extension }) => {
                handle_data(shared, &mut reader, head.meta_len, extension, &mut pool)
            }
            Some(FrameTag::CancelMission) => {
                handle_cancel(shared, &mut reader, head.meta_len, &mut pool)
            }
            Some(FrameTag::MissionComplete) => {
                match read_mission_ref(&mut reader, head.meta_len) {
                    Ok(mref) => {
                        log::debug!("[pipe] peer reassembled mission {}", mref.extension);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            None => handle_raw(shared, &mut reader, &head.extension, head.meta_len),
        };

        if let Err(err) = outcome {
            shared.fail(err);
            shared.shutdown();
            return;
        }
    }
}

fn handle_announce(
    shared: &Shared,
    reader: &mut BoxedReader,
    meta_len: usize,
    pool: &mut HashMap<String, IncomingMission>,
) -> Result<(), PipeError> {
    let body = protocol::read_body(reader, meta_len)?;
    let announce: Announce =
        serde_json::from_slice(&body).map_err(|e| PipeError::BadControl(e.to_string()))?;
    if announce.length == 0 {
        deliver(shared, Vec::new(), announce.info);
        return Ok(());
    }
    if pool.contains_key(&announce.extension) {
        log::warn!("[pipe] duplicate announcement for mission {}", announce.extension);
    }
    pool.insert(
        announce.extension.clone(),
        IncomingMission { length: announce.length, info: announce.info, buf: Vec::new() },
    );
    Ok(())
}

fn handle_data(
    shared: &Shared,
    reader: &mut BoxedReader,
    meta_len: usize,
    extension: String,
    pool: &mut HashMap<String, IncomingMission>,
) -> Result<(), PipeError> {
    let body = protocol::read_body(reader, meta_len)?;
    let Some(incoming) = pool.get_mut(&extension) else {
        // Already cancelled or completed; the chunk was in flight.
        log::debug!("[pipe] chunk for unknown mission {extension}");
        return Ok(());
    };
    if incoming.buf.len() as u64 + body.len() as u64 > incoming.length {
        return Err(PipeError::MissionOverrun { extension });
    }
    incoming.buf.extend_from_slice(&body);
    if incoming.buf.len() as u64 == incoming.length {
        let done = pool.remove(&extension).expect("mission present");
        // Informational completion notice back to the sender.
        let notice = MissionRef { extension };
        let mut send_pool = shared.pool.lock().expect("send pool poisoned");
        send_pool.control.push_back(ControlItem {
            mission: None,
            frame: Frame::new(
                FrameTag::MissionComplete.to_extension(),
                serde_json::to_vec(&notice).expect("mission ref serialization"),
            ),
        });
        drop(send_pool);
        shared.pool_cv.notify_all();
        deliver(shared, done.buf, done.info);
    }
    Ok(())
}

fn handle_cancel(
    shared: &Shared,
    reader: &mut BoxedReader,
    meta_len: usize,
    pool: &mut HashMap<String, IncomingMission>,
) -> Result<(), PipeError> {
    let mref = read_mission_ref(reader, meta_len)?;
    if pool.remove(&mref.extension).is_some() {
        log::debug!("[pipe] mission {} cancelled by peer, partial discarded", mref.extension);
    }
    shared.fire_cancel(&mref.extension);
    Ok(())
}

fn handle_raw(
    shared: &Shared,
    reader: &mut BoxedReader,
    extension: &str,
    meta_len: usize,
) -> Result<(), PipeError> {
    let spooled = {
        let spool = shared.raw_spool.lock().expect("raw spool poisoned");
        match &*spool {
            Some(f) => f(extension, meta_len as u64),
            None => None,
        }
    };
    let info = |spooled: bool| {
        serde_json::json!({
            "_raw": extension,
            "_length": meta_len as u64,
            "_spooled": spooled,
        })
    };
    match spooled {
        Some(mut sink) => {
            protocol::copy_body(reader, meta_len, &mut sink, shared.chunk)?;
            sink.flush().map_err(PipeError::Io)?;
            deliver(shared, Vec::new(), info(true));
        }
        None => {
            let body = protocol::read_body(reader, meta_len)?;
            deliver(shared, body, info(false));
        }
    }
    Ok(())
}

fn read_mission_ref(reader: &mut BoxedReader, meta_len: usize) -> Result<MissionRef, PipeError> {
    let body = protocol::read_body(reader, meta_len)?;
    serde_json::from_slice(&body).map_err(|e| PipeError::BadControl(e.to_string()))
}

fn deliver(shared: &Shared, data: Vec<u8>, info: Value) {
    if let Some(tx) = &*shared.inbound_tx.lock().expect("inbound lock poisoned") {
        let _ = tx.send((data, info));
    }
}

/// Forward one already-headed raw frame into the relay target.
///
/// The target writer is held for the whole body, so nothing the target's
/// sender queues can interleave with the relayed bytes. A target write
/// failure is reported to the relay's waiter but keeps this pipe alive: the
/// remaining body bytes are drained to preserve framing.
fn run_relay(
    reader: &mut BoxedReader,
    raw_head: &[u8],
    meta_len: usize,
    relay: &FlowRelay,
    chunk: usize,
) -> Result<(), PipeError> {
    let mut target = relay.target.lock().expect("relay target poisoned");
    let mut sink_err: Option<std::io::Error> = None;

    if let Err(err) = target.write_all(raw_head) {
        sink_err = Some(err);
    }

    let mut buf = vec![0u8; chunk.max(1)];
    let mut remaining = meta_len;
    while remaining > 0 {
        let take = remaining.min(buf.len());
        reader
            .read_exact(&mut buf[..take])
            .map_err(|e| PipeError::Protocol(ProtocolError::from(e)))?;
        if sink_err.is_none() {
            if let Err(err) = target.write_all(&buf[..take]) {
                sink_err = Some(err);
            }
        }
        remaining -= take;
    }
    if sink_err.is_none() {
        if let Err(err) = target.flush() {
            sink_err = Some(err);
        }
    }
    drop(target);

    let result = match sink_err {
        None => Ok(meta_len as u64),
        Some(err) => Err(err.to_string()),
    };
    let _ = relay.done.send(result);
    Ok(())
}

// ─── In-memory duplex ──────────────────────────────────────────────────────

/// One direction of an in-memory byte stream.
///
/// Reads block until bytes arrive; EOF once the write half is dropped.
fn duplex_half() -> (DuplexReader, DuplexWriter) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    (DuplexReader { rx, leftover: Vec::new(), pos: 0 }, DuplexWriter { tx })
}

struct DuplexReader {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    pos: usize,
}

impl Read for DuplexReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.leftover.len() {
            match self.rx.recv() {
                Ok(bytes) => {
                    self.leftover = bytes;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len() - self.pos);
        buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct DuplexWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for DuplexWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn wait_recv(pipe: &Pipe) -> PipeMessage {
        pipe.recv_timeout(Duration::from_secs(5)).expect("message within deadline")
    }

    #[test]
    fn single_mission_round_trip() {
        let (a, b) = Pipe::pair();
        let id = a
            .create_mission(b"hello mission".to_vec(), json!({"route": "echo"}))
            .unwrap();
        assert_eq!(id.len(), 6);
        let (data, info) = wait_recv(&b);
        assert_eq!(data, b"hello mission");
        assert_eq!(info["route"], "echo");
    }

    #[test]
    fn empty_mission_surfaces_immediately() {
        let (a, b) = Pipe::pair();
        a.create_mission(Vec::new(), json!({"k": 1})).unwrap();
        let (data, info) = wait_recv(&b);
        assert!(data.is_empty());
        assert_eq!(info["k"], 1);
    }

    #[test]
    fn reassembly_across_chunk_sizes() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in [1usize, 2, 4096, payload.len() + 1] {
            let (a, b) = Pipe::pair_with_chunk(chunk);
            a.create_mission(payload.clone(), json!({})).unwrap();
            let (data, _) = b.recv_timeout(Duration::from_secs(30)).expect("reassembled");
            assert_eq!(data, payload, "chunk={chunk}");
        }
    }

    #[test]
    fn many_concurrent_missions_all_arrive() {
        let (a, b) = Pipe::pair_with_chunk(64);
        let mut expected = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; 500 + i as usize];
            a.create_mission(payload.clone(), json!({"n": i})).unwrap();
            expected.push(payload);
        }
        let mut seen = vec![false; 20];
        for _ in 0..20 {
            let (data, info) = wait_recv(&b);
            let n = info["n"].as_u64().unwrap() as usize;
            assert_eq!(data, expected[n]);
            seen[n] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn fairness_interleaves_concurrent_missions() {
        // Stall the sender by holding the writer, queue both missions, then
        // release: the 5-chunk mission must finish ahead of the 20-chunk one
        // because the sender round-robins one chunk per mission per turn.
        let (a, b) = Pipe::pair_with_chunk(10);
        let big = vec![1u8; 200];
        let small = vec![2u8; 50];
        {
            let writer = a.raw_writer();
            let _stall = writer.lock().unwrap();
            let id_big = a.create_mission(big.clone(), json!({"which": "big"})).unwrap();
            let id_small = a.create_mission(small.clone(), json!({"which": "small"})).unwrap();
            assert_ne!(id_big, id_small);
        }

        let (first, info) = wait_recv(&b);
        assert_eq!(info["which"], "small");
        assert_eq!(first, small);
        let (second, info) = wait_recv(&b);
        assert_eq!(info["which"], "big");
        assert_eq!(second, big);
    }

    #[test]
    fn cancel_before_announce_suppresses_everything() {
        let (a, b) = Pipe::pair_with_chunk(8);
        let cancelled = Arc::new(AtomicUsize::new(0));
        {
            let cancelled = Arc::clone(&cancelled);
            a.on_cancel(move |_| {
                cancelled.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Hold the writer so nothing hits the wire, then cancel while the
        // announcement is still queued: the peer must never hear about the
        // mission at all.
        let id = {
            let writer = a.raw_writer();
            let _stall = writer.lock().unwrap();
            let id = a.create_mission(vec![1u8; 50_000], json!({"which": "victim"})).unwrap();
            assert!(a.cancel_mission(&id));
            assert!(!a.cancel_mission(&id));
            id
        };
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        // A later mission still flows; the victim never surfaces.
        a.create_mission(b"after".to_vec(), json!({"which": "after"})).unwrap();
        let (data, info) = wait_recv(&b);
        assert_eq!(info["which"], "after");
        assert_eq!(data, b"after");
        assert!(b.try_recv().is_none());
        let _ = id;
    }

    #[test]
    fn cancel_mid_stream_discards_peer_partial() {
        let (a, b) = Pipe::pair_with_chunk(8);
        let remote = Arc::new(AtomicUsize::new(0));
        {
            let remote = Arc::clone(&remote);
            b.on_cancel(move |_| {
                remote.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Let the mission start streaming, then cancel it mid-flight. The
        // payload is large enough (625k chunks) that it cannot complete
        // before the cancel lands.
        let id = a.create_mission(vec![3u8; 5_000_000], json!({"which": "victim"})).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(a.cancel_mission(&id));

        // Fence: a follow-up mission arriving proves the cancel frame (queued
        // ahead of it) was processed by b.
        a.create_mission(b"fence".to_vec(), json!({"which": "fence"})).unwrap();
        loop {
            let (_, info) = wait_recv(&b);
            if info["which"] == "fence" {
                break;
            }
            panic!("victim surfaced despite cancellation");
        }
        assert_eq!(remote.load(Ordering::SeqCst), 1);
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn cancel_unknown_mission_is_false() {
        let (a, _b) = Pipe::pair();
        assert!(!a.cancel_mission("nosuch"));
    }

    #[test]
    fn final_error_fires_once_on_peer_gone() {
        let (a, b) = Pipe::pair();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            a.on_final_error(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(b);
        // a's receiver sees EOF and shuts the pipe down.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!a.is_running());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            a.create_mission(vec![1], json!({})),
            Err(PipeError::Closed)
        ));
    }

    #[test]
    fn recv_returns_none_after_close() {
        let (a, b) = Pipe::pair();
        a.create_mission(b"last".to_vec(), json!({})).unwrap();
        let _ = wait_recv(&b);
        b.close();
        assert!(b.recv().is_none());
    }

    #[test]
    fn raw_frame_surfaces_out_of_band() {
        let (a, b) = Pipe::pair();
        let mut payload = &b"file-bytes"[..];
        a.write_raw_frame_from("report.txt", payload.len() as u64, &mut payload)
            .unwrap();
        let (data, info) = wait_recv(&b);
        assert_eq!(data, b"file-bytes");
        assert_eq!(info["_raw"], "report.txt");
        assert_eq!(info["_length"], 10);
        assert_eq!(info["_spooled"], false);
    }

    #[test]
    fn raw_frame_spools_when_sink_provided() {
        let (a, b) = Pipe::pair();
        let spooled: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let spooled = Arc::clone(&spooled);
            b.set_raw_spool(move |ext, _len| {
                assert_eq!(ext, "dump.bin");
                let spooled = Arc::clone(&spooled);
                Some(Box::new(SpoolWriter { target: spooled }) as Box<dyn Write + Send>)
            });
        }
        let body = vec![42u8; 9000];
        a.write_raw_frame_from("dump.bin", body.len() as u64, &mut body.as_slice())
            .unwrap();
        let (data, info) = wait_recv(&b);
        assert!(data.is_empty());
        assert_eq!(info["_spooled"], true);
        assert_eq!(spooled.lock().unwrap().len(), 9000);
    }

    struct SpoolWriter {
        target: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for SpoolWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.target.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn relay_forwards_raw_frame_verbatim() {
        // a ── pipe ──► b, with b relaying the raw frame into c's writer.
        let (a, b) = Pipe::pair();
        let (c_src, c_sink) = Pipe::pair();
        let done = b.relay_next_raw_frame(c_src.raw_writer());

        // Normal mission traffic still flows while the relay is armed.
        a.create_mission(b"normal".to_vec(), json!({})).unwrap();
        let (data, _) = wait_recv(&b);
        assert_eq!(data, b"normal");

        let body = vec![7u8; 20_000];
        a.write_raw_frame_from("flow.bin", body.len() as u64, &mut body.as_slice())
            .unwrap();
        let relayed = done
            .recv_timeout(Duration::from_secs(5))
            .expect("relay completes")
            .expect("relay succeeds");
        assert_eq!(relayed, 20_000);

        // c's peer receives the very same raw frame.
        let (data, info) = wait_recv(&c_sink);
        assert_eq!(info["_raw"], "flow.bin");
        assert_eq!(data, body);
    }

    #[test]
    fn mission_overrun_is_fatal() {
        // Hand-craft a malicious peer: announce 4 bytes, send 8.
        let (read_half, write_half) = duplex_half();
        let (sink_read, sink_write) = duplex_half();
        drop(sink_read);
        let pipe = Pipe::new(read_half, sink_write);
        let failed = Arc::new(AtomicUsize::new(0));
        {
            let failed = Arc::clone(&failed);
            pipe.on_final_error(move |err| {
                assert!(matches!(err, PipeError::MissionOverrun { .. }));
                failed.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut w = write_half;
        let announce = Announce { extension: "abc123".into(), length: 4, info: json!({}) };
        let frame = Frame::new(
            FrameTag::Mission.to_extension(),
            serde_json::to_vec(&announce).unwrap(),
        );
        protocol::write_frame(&mut w, &frame).unwrap();
        let data = Frame::new(
            FrameTag::Data { extension: "abc123".into() }.to_extension(),
            vec![0u8; 8],
        );
        protocol::write_frame(&mut w, &data).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(!pipe.is_running());
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chunk_for_unknown_mission_is_ignored() {
        let (read_half, mut w) = duplex_half();
        let (_sink_read, sink_write) = duplex_half();
        let pipe = Pipe::new(read_half, sink_write);

        let stray = Frame::new(
            FrameTag::Data { extension: "zzzzzz".into() }.to_extension(),
            vec![1, 2, 3],
        );
        protocol::write_frame(&mut w, &stray).unwrap();
        // A well-formed mission afterwards still works.
        let announce = Announce { extension: "ok1234".into(), length: 2, info: json!({}) };
        protocol::write_frame(
            &mut w,
            &Frame::new(FrameTag::Mission.to_extension(), serde_json::to_vec(&announce).unwrap()),
        )
        .unwrap();
        protocol::write_frame(
            &mut w,
            &Frame::new(FrameTag::Data { extension: "ok1234".into() }.to_extension(), vec![5, 6]),
        )
        .unwrap();

        let (data, _) = pipe.recv_timeout(Duration::from_secs(5)).expect("mission arrives");
        assert_eq!(data, vec![5, 6]);
        assert!(pipe.is_running());
    }
}
