//! Synchronous event emitter.
//!
//! Named events with plain listeners: `on` / `once` / `off` / `emit`. A
//! listener returning an error is logged and never aborts the emit — the
//! remaining listeners still run.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

type ListenerFn = std::sync::Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

struct Listener {
    id: u64,
    f: ListenerFn,
}

#[derive(Default)]
struct Registry {
    events: HashMap<String, Vec<Listener>>,
    once_events: HashMap<String, Vec<Listener>>,
    next_id: u64,
}

/// Handle for removing a specific listener via [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// See the module docs.
#[derive(Default)]
pub struct EventEmitter {
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// An emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `event`. The listener runs on every emit until removed.
    pub fn on(
        &self,
        event: &str,
        listener: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let mut reg = self.registry.lock().expect("event registry poisoned");
        let id = reg.next_id;
        reg.next_id += 1;
        reg.events
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, f: std::sync::Arc::new(listener) });
        ListenerId(id)
    }

    /// Subscribe to the next emit of `event` only.
    pub fn once(
        &self,
        event: &str,
        listener: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let mut reg = self.registry.lock().expect("event registry poisoned");
        let id = reg.next_id;
        reg.next_id += 1;
        reg.once_events
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, f: std::sync::Arc::new(listener) });
        ListenerId(id)
    }

    /// Remove one listener, or every listener for `event` when `id` is `None`.
    pub fn off(&self, event: &str, id: Option<ListenerId>) {
        let mut reg = self.registry.lock().expect("event registry poisoned");
        match id {
            None => {
                reg.events.remove(event);
                reg.once_events.remove(event);
            }
            Some(ListenerId(id)) => {
                if let Some(list) = reg.events.get_mut(event) {
                    list.retain(|l| l.id != id);
                }
                if let Some(list) = reg.once_events.get_mut(event) {
                    list.retain(|l| l.id != id);
                }
            }
        }
    }

    /// Fire `event`. Listener errors are logged; all listeners run.
    ///
    /// The listener lists are snapshotted before any listener runs, so a
    /// listener may register or remove listeners (the change takes effect on
    /// the next emit) without deadlocking.
    pub fn emit(&self, event: &str, payload: &Value) {
        let (snapshot, once): (Vec<ListenerFn>, Vec<Listener>) = {
            let mut reg = self.registry.lock().expect("event registry poisoned");
            let snapshot = reg
                .events
                .get(event)
                .map(|list| list.iter().map(|l| ListenerFn::clone(&l.f)).collect())
                .unwrap_or_default();
            let once = reg.once_events.remove(event).unwrap_or_default();
            (snapshot, once)
        };

        for listener in snapshot {
            if let Err(err) = listener(payload) {
                log::error!("[event] listener for '{event}' failed: {err}");
            }
        }
        for listener in once {
            if let Err(err) = (listener.f)(payload) {
                log::error!("[event] once listener for '{event}' failed: {err}");
            }
        }
    }
}
