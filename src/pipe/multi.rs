//! MultiPipe: several pipes behind one endpoint.
//!
//! Aggregates N child [`Pipe`]s into a single inbound queue. Every message is
//! stamped with the `pipe_safe_code` of the pipe it arrived on, so a response
//! can be routed back out the same transport it came in on — the invariant
//! the endpoint runtime relies on when one logical endpoint spans several
//! concurrent connections.
//!
//! The MultiPipe owns its children: closing it closes them all.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::ident;

use super::{Pipe, PipeError, PipeMessage};

/// Length of an auto-allocated pipe safe-code.
const SAFE_CODE_LEN: usize = 6;

struct MultiInner {
    pipes: Mutex<Vec<(String, Arc<Pipe>)>>,
    agg_tx: Mutex<Option<mpsc::Sender<PipeMessage>>>,
}

/// A fan-in over several pipes. See the module docs.
pub struct MultiPipe {
    inner: Arc<MultiInner>,
    agg_rx: Mutex<mpsc::Receiver<PipeMessage>>,
}

impl std::fmt::Debug for MultiPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.pipes.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("MultiPipe").field("pipes", &count).finish_non_exhaustive()
    }
}

impl Default for MultiPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiPipe {
    /// An empty MultiPipe; add transports with [`MultiPipe::add_pipe`].
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(MultiInner {
                pipes: Mutex::new(Vec::new()),
                agg_tx: Mutex::new(Some(tx)),
            }),
            agg_rx: Mutex::new(rx),
        }
    }

    /// Register a pipe under `code` (random 6-char code when `None`).
    ///
    /// Spawns a reader thread that tags every inbound message with
    /// `pipe_safe_code` before it reaches the aggregated queue. Returns the
    /// safe-code in use.
    pub fn add_pipe(&self, pipe: Pipe, code: Option<String>) -> String {
        let code = code.unwrap_or_else(|| ident::safe_code(SAFE_CODE_LEN));
        let pipe = Arc::new(pipe);
        self.inner
            .pipes
            .lock()
            .expect("pipes lock poisoned")
            .push((code.clone(), Arc::clone(&pipe)));

        let inner = Arc::clone(&self.inner);
        let tag = code.clone();
        thread::spawn(move || {
            while let Some((data, info)) = pipe.recv() {
                let info = stamp(info, &tag);
                let guard = inner.agg_tx.lock().expect("agg tx poisoned");
                let Some(tx) = &*guard else { break };
                if tx.send((data, info)).is_err() {
                    break;
                }
            }
            log::debug!("[multipipe] reader for pipe {tag} finished");
        });
        code
    }

    /// Send on the named pipe, or the first registered one when `code` is
    /// `None`. Returns `(safe_code, mission_id)`.
    pub fn send(
        &self,
        data: Vec<u8>,
        info: Value,
        code: Option<&str>,
    ) -> Result<(String, String), PipeError> {
        let (code, pipe) = self.pick(code)?;
        let mission = pipe.create_mission(data, info)?;
        Ok((code, mission))
    }

    /// Cancel a mission on the named pipe, or on whichever pipe knows it.
    pub fn cancel_mission(&self, mission: &str, code: Option<&str>) -> bool {
        match code {
            Some(code) => self
                .get(code)
                .map(|pipe| pipe.cancel_mission(mission))
                .unwrap_or(false),
            None => {
                let pipes = self.inner.pipes.lock().expect("pipes lock poisoned");
                pipes.iter().any(|(_, pipe)| pipe.cancel_mission(mission))
            }
        }
    }

    /// Blocking receive from the aggregated queue.
    pub fn recv(&self) -> Option<PipeMessage> {
        self.agg_rx.lock().expect("agg rx poisoned").recv().ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<PipeMessage> {
        self.agg_rx.lock().expect("agg rx poisoned").try_recv().ok()
    }

    /// Receive with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PipeMessage> {
        self.agg_rx.lock().expect("agg rx poisoned").recv_timeout(timeout).ok()
    }

    /// Safe-codes of the registered pipes, in registration order.
    pub fn codes(&self) -> Vec<String> {
        self.inner
            .pipes
            .lock()
            .expect("pipes lock poisoned")
            .iter()
            .map(|(code, _)| code.clone())
            .collect()
    }

    /// The child pipe registered under `code`.
    pub fn get(&self, code: &str) -> Option<Arc<Pipe>> {
        self.inner
            .pipes
            .lock()
            .expect("pipes lock poisoned")
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, pipe)| Arc::clone(pipe))
    }

    /// Close every child pipe and the aggregated queue.
    pub fn close(&self) {
        let pipes = self.inner.pipes.lock().expect("pipes lock poisoned");
        for (_, pipe) in pipes.iter() {
            pipe.close();
        }
        drop(pipes);
        self.inner.agg_tx.lock().expect("agg tx poisoned").take();
    }

    fn pick(&self, code: Option<&str>) -> Result<(String, Arc<Pipe>), PipeError> {
        let pipes = self.inner.pipes.lock().expect("pipes lock poisoned");
        match code {
            Some(code) => pipes
                .iter()
                .find(|(c, _)| c == code)
                .map(|(c, p)| (c.clone(), Arc::clone(p)))
                .ok_or_else(|| PipeError::UnknownPipe(code.to_string())),
            None => pipes
                .first()
                .map(|(c, p)| (c.clone(), Arc::clone(p)))
                .ok_or(PipeError::NoPipes),
        }
    }
}

/// Stamp `pipe_safe_code` into an info object, wrapping non-object info.
fn stamp(info: Value, code: &str) -> Value {
    match info {
        Value::Object(mut map) => {
            map.insert("pipe_safe_code".into(), Value::String(code.to_string()));
            Value::Object(map)
        }
        other => serde_json::json!({ "_info": other, "pipe_safe_code": code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wait_recv(multi: &MultiPipe) -> PipeMessage {
        multi.recv_timeout(Duration::from_secs(5)).expect("message within deadline")
    }

    #[test]
    fn inbound_is_tagged_with_safe_code() {
        let multi = MultiPipe::new();
        let (local, remote) = Pipe::pair();
        let code = multi.add_pipe(local, Some("pipeXY".into()));
        assert_eq!(code, "pipeXY");

        remote.create_mission(b"hi".to_vec(), json!({"route": "r"})).unwrap();
        let (data, info) = wait_recv(&multi);
        assert_eq!(data, b"hi");
        assert_eq!(info["pipe_safe_code"], "pipeXY");
        assert_eq!(info["route"], "r");
    }

    #[test]
    fn auto_allocated_code_is_six_chars() {
        let multi = MultiPipe::new();
        let (local, _remote) = Pipe::pair();
        let code = multi.add_pipe(local, None);
        assert_eq!(code.len(), 6);
        assert_eq!(multi.codes(), vec![code]);
    }

    #[test]
    fn send_picks_named_pipe() {
        let multi = MultiPipe::new();
        let (local_a, remote_a) = Pipe::pair();
        let (local_b, remote_b) = Pipe::pair();
        multi.add_pipe(local_a, Some("aaaaaa".into()));
        multi.add_pipe(local_b, Some("bbbbbb".into()));

        multi.send(b"to-b".to_vec(), json!({}), Some("bbbbbb")).unwrap();
        let (data, _) = remote_b.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(data, b"to-b");
        assert!(remote_a.try_recv().is_none());
    }

    #[test]
    fn send_defaults_to_first_pipe() {
        let multi = MultiPipe::new();
        let (local_a, remote_a) = Pipe::pair();
        multi.add_pipe(local_a, Some("firstp".into()));

        let (code, mission) = multi.send(b"x".to_vec(), json!({}), None).unwrap();
        assert_eq!(code, "firstp");
        assert_eq!(mission.len(), 6);
        let (data, _) = remote_a.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(data, b"x");
    }

    #[test]
    fn unknown_code_and_empty_multi_error() {
        let multi = MultiPipe::new();
        assert!(matches!(
            multi.send(vec![], json!({}), None),
            Err(PipeError::NoPipes)
        ));
        let (local, _remote) = Pipe::pair();
        multi.add_pipe(local, Some("known0".into()));
        assert!(matches!(
            multi.send(vec![], json!({}), Some("nope")),
            Err(PipeError::UnknownPipe(_))
        ));
    }

    #[test]
    fn messages_from_all_pipes_reach_one_queue() {
        let multi = MultiPipe::new();
        let (local_a, remote_a) = Pipe::pair();
        let (local_b, remote_b) = Pipe::pair();
        multi.add_pipe(local_a, Some("aaaaaa".into()));
        multi.add_pipe(local_b, Some("bbbbbb".into()));

        remote_a.create_mission(b"from-a".to_vec(), json!({})).unwrap();
        remote_b.create_mission(b"from-b".to_vec(), json!({})).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (data, info) = wait_recv(&multi);
            seen.push((data, info["pipe_safe_code"].as_str().unwrap().to_string()));
        }
        seen.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(seen[0], (b"from-a".to_vec(), "aaaaaa".to_string()));
        assert_eq!(seen[1], (b"from-b".to_vec(), "bbbbbb".to_string()));
    }

    #[test]
    fn close_closes_children() {
        let multi = MultiPipe::new();
        let (local, remote) = Pipe::pair();
        multi.add_pipe(local, None);
        multi.close();
        std::thread::sleep(Duration::from_millis(100));
        assert!(multi.recv().is_none());
        // The remote side observes the closed transport once its writes hit
        // the dead duplex.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while remote.is_running() && std::time::Instant::now() < deadline {
            let _ = remote.create_mission(b"x".to_vec(), json!({}));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!remote.is_running());
    }
}
