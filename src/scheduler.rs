//! Timer / scheduler wheel.
//!
//! A min-heap of `(next_fire, task)` driven by a single thread with a
//! sub-second poll. Periodic tasks re-arm themselves at `now + interval`
//! after each run — drift is deliberately uncorrected; this is a tick
//! source, not a cron.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Poll granularity of the scheduler thread.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type TaskFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct Entry {
    at: Instant,
    id: u64,
    interval: Option<Duration>,
    task: TaskFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    running: AtomicBool,
}

/// See the module docs.
pub struct Scheduler {
    inner: Arc<Inner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A stopped scheduler; call [`Scheduler::start`] to begin ticking.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the scheduler thread. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || run_loop(&inner));
        *self.handle.lock().expect("scheduler handle poisoned") = Some(handle);
    }

    /// Stop the scheduler and join its thread. Pending tasks are dropped.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.cv.notify_all();
        let handle = self.handle.lock().expect("scheduler handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Schedule `task` to run after `delay`; with `interval`, re-run every
    /// `interval` thereafter. Task errors are logged, never fatal.
    pub fn schedule(
        &self,
        task: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
        delay: Duration,
        interval: Option<Duration>,
    ) -> TaskId {
        let mut state = self.inner.state.lock().expect("scheduler state poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse(Entry {
            at: Instant::now() + delay,
            id,
            interval,
            task: Arc::new(task),
        }));
        drop(state);
        self.inner.cv.notify_all();
        TaskId(id)
    }

    /// Cancel a task. A periodic task stops after its current run, if any.
    pub fn cancel(&self, id: TaskId) {
        let mut state = self.inner.state.lock().expect("scheduler state poisoned");
        state.cancelled.insert(id.0);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(inner: &Arc<Inner>) {
    let mut state = inner.state.lock().expect("scheduler state poisoned");
    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut due: Vec<Entry> = Vec::new();
        while let Some(Reverse(head)) = state.heap.peek() {
            if head.at > now {
                break;
            }
            let Reverse(entry) = state.heap.pop().expect("peeked entry present");
            if state.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(entry);
        }

        if due.is_empty() {
            let (next, _) = inner
                .cv
                .wait_timeout(state, POLL_INTERVAL)
                .expect("scheduler state poisoned");
            state = next;
            continue;
        }

        drop(state);
        let mut rearm = Vec::new();
        for entry in due {
            if let Err(err) = (entry.task)() {
                log::error!("[scheduler] task failed: {err}");
            }
            if let Some(interval) = entry.interval {
                rearm.push(Entry {
                    at: Instant::now() + interval,
                    id: entry.id,
                    interval: Some(interval),
                    task: entry.task,
                });
            }
        }
        state = inner.state.lock().expect("scheduler state poisoned");
        for entry in rearm {
            // Re-check cancellation raised while the task was running.
            if state.cancelled.remove(&entry.id) {
                continue;
            }
            state.heap.push(Reverse(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn one_shot_runs_once_after_delay() {
        let sched = Scheduler::new();
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        sched.schedule(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(50),
            None,
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(wait_until(Duration::from_secs(3), || count.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_task_re_arms() {
        let sched = Scheduler::new();
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        sched.schedule(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(10),
            Some(Duration::from_millis(30)),
        );
        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 3));
    }

    #[test]
    fn cancel_prevents_future_runs() {
        let sched = Scheduler::new();
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = sched.schedule(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_secs(60),
            None,
        );
        sched.cancel(id);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_task_does_not_kill_scheduler() {
        let sched = Scheduler::new();
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule(|| anyhow::bail!("boom"), Duration::from_millis(10), None);
        let c = Arc::clone(&count);
        sched.schedule(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(50),
            None,
        );
        assert!(wait_until(Duration::from_secs(3), || count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn due_order_is_soonest_first() {
        let sched = Scheduler::new();
        sched.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 120u64), ("early", 30)] {
            let order = Arc::clone(&order);
            sched.schedule(
                move || {
                    order.lock().unwrap().push(label);
                    Ok(())
                },
                Duration::from_millis(delay),
                None,
            );
        }
        assert!(wait_until(Duration::from_secs(3), || order.lock().unwrap().len() == 2));
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn stop_joins_thread() {
        let sched = Scheduler::new();
        sched.start();
        sched.stop();
        // Stopping again is a no-op.
        sched.stop();
    }
}
