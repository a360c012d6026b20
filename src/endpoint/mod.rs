//! Endpoint runtime: named handlers over a multiplex pipe.
//!
//! An [`Endpoint`] drains one pipe (or a [`MultiPipe`]) and dispatches each
//! envelope through a worker pool:
//!
//! 1. an envelope whose `message_id` matches an outstanding send resolves
//!    that send (blocking slot or callback, at most once);
//! 2. otherwise the `route` handler runs, wrapped by before-hooks, the
//!    middleware chain, and after-hooks;
//! 3. otherwise the default handler runs, if registered.
//!
//! Handlers return `Ok(Some(Response))` to answer the requester on the same
//! pipe with the same message id. Handler errors go to the registered error
//! handler, or are logged — nothing crosses the wire uninvited.
//!
//! Registration (routes, middlewares, hooks, blueprints) happens before
//! [`Endpoint::start`]; the tables freeze there and middleware chains are
//! composed once, not per call.

mod blueprint;
mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::Cache;
use crate::event::EventEmitter;
use crate::ident;
use crate::pipe::{MultiPipe, Pipe, PipeError, PipeMessage};
use crate::scheduler::Scheduler;

pub use blueprint::Blueprint;
pub use request::{Payload, Request, Response};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// What a handler returns: an optional response, or an error routed to the
/// endpoint's error handler.
pub type HandlerResult = anyhow::Result<Option<Response>>;

/// A route handler.
pub type Handler = Arc<dyn Fn(&Request) -> HandlerResult + Send + Sync>;

/// A middleware: wraps a handler into a new handler. Composed once at
/// [`Endpoint::start`], first-registered outermost.
pub type MiddlewareFn = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Pre-handler hook; a `Some` return short-circuits the handler.
pub type BeforeHook = Arc<dyn Fn(&Request) -> Option<Response> + Send + Sync>;

/// Post-handler hook; a `Some` return replaces the response.
pub type AfterHook = Arc<dyn Fn(&Request, Option<Response>) -> Option<Response> + Send + Sync>;

/// Catch-all for handler errors.
pub type ErrorHandler = Arc<dyn Fn(&Request, &anyhow::Error) -> Option<Response> + Send + Sync>;

/// A one-shot response callback handed to [`Endpoint::send_with`].
pub type Callback = Box<dyn FnOnce(Request) + Send>;

/// Endpoint-level failures.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A blocking wait expired. Distinguishable from cancellation: a
    /// cancelled wait returns a request with `is_cancel = true` instead.
    #[error("blocking wait timed out")]
    Timeout,

    /// The endpoint (or its transport) has stopped.
    #[error("endpoint stopped")]
    Stopped,

    /// `start()` was called twice.
    #[error("endpoint already started")]
    AlreadyStarted,

    /// Underlying pipe failure.
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

// ─── Carrier ───────────────────────────────────────────────────────────────

/// The transport an endpoint drains: one pipe, or a MultiPipe fan-in.
enum Carrier {
    Single(Arc<Pipe>),
    Multi(Arc<MultiPipe>),
}

impl Carrier {
    /// Send; returns `(pipe_code_used, mission_id)`.
    fn send(
        &self,
        data: Vec<u8>,
        info: Value,
        code: Option<&str>,
    ) -> Result<(Option<String>, String), PipeError> {
        match self {
            Carrier::Single(pipe) => Ok((None, pipe.create_mission(data, info)?)),
            Carrier::Multi(multi) => {
                let (code, mission) = multi.send(data, info, code)?;
                Ok((Some(code), mission))
            }
        }
    }

    fn recv(&self) -> Option<PipeMessage> {
        match self {
            Carrier::Single(pipe) => pipe.recv(),
            Carrier::Multi(multi) => multi.recv(),
        }
    }

    fn cancel(&self, mission: &str, code: Option<&str>) -> bool {
        match self {
            Carrier::Single(pipe) => pipe.cancel_mission(mission),
            Carrier::Multi(multi) => multi.cancel_mission(mission, code),
        }
    }

    fn close(&self) {
        match self {
            Carrier::Single(pipe) => pipe.close(),
            Carrier::Multi(multi) => multi.close(),
        }
    }
}

// ─── Registration and dispatch tables ──────────────────────────────────────

/// Blueprint tables attached to the routes it contributed.
struct BpTables {
    middlewares: Vec<MiddlewareFn>,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    error: Option<ErrorHandler>,
}

struct RouteReg {
    handler: Handler,
    bp: Option<Arc<BpTables>>,
}

#[derive(Default)]
struct Registration {
    routes: HashMap<String, RouteReg>,
    default_handler: Option<Handler>,
    middlewares: Vec<MiddlewareFn>,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
    error_handler: Option<ErrorHandler>,
}

struct CompiledRoute {
    handler: Handler,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    error: Option<ErrorHandler>,
}

struct DispatchTable {
    routes: HashMap<String, CompiledRoute>,
    default_handler: Option<Handler>,
    error: Option<ErrorHandler>,
}

fn compose(reg: &Registration) -> DispatchTable {
    let mut routes = HashMap::new();
    for (route, rr) in &reg.routes {
        let mut chain: Vec<MiddlewareFn> = reg.middlewares.clone();
        let mut before = reg.before_hooks.clone();
        let mut after = reg.after_hooks.clone();
        let mut error = reg.error_handler.clone();
        if let Some(bp) = &rr.bp {
            chain.extend(bp.middlewares.iter().cloned());
            before.extend(bp.before.iter().cloned());
            after.extend(bp.after.iter().cloned());
            if error.is_none() {
                error = bp.error.clone();
            }
        }
        // First-registered middleware ends up outermost.
        let mut handler = Arc::clone(&rr.handler);
        for mw in chain.iter().rev() {
            handler = mw(handler);
        }
        routes.insert(route.clone(), CompiledRoute { handler, before, after, error });
    }
    DispatchTable {
        routes,
        default_handler: reg.default_handler.clone(),
        error: reg.error_handler.clone(),
    }
}

// ─── Correlator ────────────────────────────────────────────────────────────

enum Pending {
    Callback(Callback),
    Slot(mpsc::SyncSender<Request>),
    Quiet,
}

#[derive(Default)]
struct Correlator {
    pending: HashMap<String, Pending>,
    /// Outgoing mission extension → message id, for cancel propagation.
    ext_to_mid: HashMap<String, String>,
}

fn fire_pending(entry: Pending, req: Request) {
    match entry {
        Pending::Callback(cb) => cb(req),
        Pending::Slot(tx) => {
            let _ = tx.send(req);
        }
        Pending::Quiet => {}
    }
}

// ─── Endpoint ──────────────────────────────────────────────────────────────

enum Job {
    Dispatch(Vec<u8>, Value),
    Shutdown,
}

struct Inner {
    carrier: Carrier,
    registration: Mutex<Registration>,
    table: Mutex<Option<Arc<DispatchTable>>>,
    correlator: Mutex<Correlator>,
    running: AtomicBool,
    started: AtomicBool,
    max_workers: AtomicUsize,
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    event: EventEmitter,
    scheduler: Scheduler,
    cache: Cache<Value>,
}

/// See the module docs.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Options for [`Endpoint::send_with`].
#[derive(Default)]
pub struct SendOptions {
    /// Invoked at most once with the response (or a cancelled request).
    pub callback: Option<Callback>,
    /// Egress pipe for MultiPipe endpoints.
    pub pipe_code: Option<String>,
    /// Extra application headers merged into the envelope info.
    pub headers: Map<String, Value>,
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("has_callback", &self.callback.is_some())
            .field("pipe_code", &self.pipe_code)
            .finish_non_exhaustive()
    }
}

/// What a send hands back: enough to correlate and to cancel.
#[derive(Debug, Clone)]
pub struct SendTicket {
    /// Correlator for the eventual response.
    pub message_id: String,
    /// Underlying mission extension; pass to [`Endpoint::cancel_mission`].
    pub mission: String,
    /// Pipe the envelope left on (MultiPipe endpoints only).
    pub pipe_code: Option<String>,
}

impl Endpoint {
    /// An endpoint over a single pipe.
    pub fn new(pipe: Pipe) -> Self {
        Self::from_carrier(Carrier::Single(Arc::new(pipe)))
    }

    /// An endpoint spanning several pipes behind a [`MultiPipe`].
    pub fn with_multi(multi: MultiPipe) -> Self {
        Self::from_carrier(Carrier::Multi(Arc::new(multi)))
    }

    fn from_carrier(carrier: Carrier) -> Self {
        Self {
            inner: Arc::new(Inner {
                carrier,
                registration: Mutex::new(Registration::default()),
                table: Mutex::new(None),
                correlator: Mutex::new(Correlator::default()),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                max_workers: AtomicUsize::new(DEFAULT_WORKERS),
                job_tx: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                event: EventEmitter::new(),
                scheduler: Scheduler::new(),
                cache: Cache::new(),
            }),
        }
    }

    /// Worker pool size; takes effect at [`Endpoint::start`].
    pub fn set_max_workers(&self, workers: usize) {
        self.inner.max_workers.store(workers.max(1), Ordering::Release);
    }

    /// Register a handler under `route`. Re-registration replaces (logged).
    pub fn request(
        &self,
        route: &str,
        handler: impl Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    ) {
        if self.inner.started.load(Ordering::Acquire) {
            log::warn!("[endpoint] route '{route}' registered after start, ignored");
            return;
        }
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        if reg.routes.contains_key(route) {
            log::warn!("[endpoint] route '{route}' re-registered, replacing");
        }
        reg.routes
            .insert(route.to_string(), RouteReg { handler: Arc::new(handler), bp: None });
    }

    /// Register the fallback for envelopes with no route or an unknown one.
    pub fn default(
        &self,
        handler: impl Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    ) {
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        reg.default_handler = Some(Arc::new(handler));
    }

    /// Add a middleware. Applied to every route, first-registered outermost.
    pub fn middleware(
        &self,
        middleware: impl Fn(Handler) -> Handler + Send + Sync + 'static,
    ) {
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        reg.middlewares.push(Arc::new(middleware));
    }

    /// Add a pre-handler hook; a `Some` return short-circuits execution.
    pub fn before_request(
        &self,
        hook: impl Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    ) {
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        reg.before_hooks.push(Arc::new(hook));
    }

    /// Add a post-handler hook; a `Some` return replaces the response.
    pub fn after_request(
        &self,
        hook: impl Fn(&Request, Option<Response>) -> Option<Response> + Send + Sync + 'static,
    ) {
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        reg.after_hooks.push(Arc::new(hook));
    }

    /// Install the catch-all error handler.
    pub fn error_handle(
        &self,
        handler: impl Fn(&Request, &anyhow::Error) -> Option<Response> + Send + Sync + 'static,
    ) {
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        reg.error_handler = Some(Arc::new(handler));
    }

    /// Merge a blueprint's tables into this endpoint.
    pub fn register_blueprint(&self, bp: Blueprint) {
        let count = bp.routes.len();
        let name = bp.name.clone();
        let tables = Arc::new(BpTables {
            middlewares: bp.middlewares,
            before: bp.before_hooks,
            after: bp.after_hooks,
            error: bp.error_handler,
        });
        let mut reg = self.inner.registration.lock().expect("registration poisoned");
        for (route, handler) in bp.routes {
            if reg.routes.contains_key(&route) {
                log::warn!("[endpoint] blueprint '{name}' replaces route '{route}'");
            }
            reg.routes.insert(route, RouteReg { handler, bp: Some(Arc::clone(&tables)) });
        }
        if let Some(default) = bp.default_handler {
            if reg.default_handler.is_none() {
                reg.default_handler = Some(default);
            }
        }
        log::info!("[endpoint] registered blueprint '{name}' ({count} routes)");
    }

    /// Freeze the tables and start the dispatcher and worker threads.
    pub fn start(&self) -> Result<(), EndpointError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(EndpointError::AlreadyStarted);
        }
        {
            let reg = self.inner.registration.lock().expect("registration poisoned");
            *self.inner.table.lock().expect("table poisoned") = Some(Arc::new(compose(&reg)));
        }
        self.inner.running.store(true, Ordering::Release);

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        *self.inner.job_tx.lock().expect("job tx poisoned") = Some(job_tx.clone());
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = self.inner.max_workers.load(Ordering::Acquire);
        let mut handles = Vec::with_capacity(workers + 1);
        for n in 0..workers {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&job_rx);
            handles.push(thread::spawn(move || worker_loop(&inner, &rx, n)));
        }

        let inner = Arc::clone(&self.inner);
        handles.push(thread::spawn(move || dispatcher_loop(&inner, &job_tx)));

        *self.inner.threads.lock().expect("threads poisoned") = handles;
        self.inner.scheduler.start();
        self.inner.event.emit("start", &Value::Null);
        Ok(())
    }

    /// Whether the endpoint is dispatching.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop dispatching: close the transport, join workers (never the
    /// current thread into itself), purge pending entries, stop the
    /// scheduler.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.carrier.close();
        if let Some(tx) = &*self.inner.job_tx.lock().expect("job tx poisoned") {
            for _ in 0..self.inner.max_workers.load(Ordering::Acquire) {
                let _ = tx.send(Job::Shutdown);
            }
        }
        let handles = std::mem::take(&mut *self.inner.threads.lock().expect("threads poisoned"));
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        // Purge: outstanding entries are dropped without firing; blocking
        // waiters observe the dropped slot as `Stopped`.
        {
            let mut cor = self.inner.correlator.lock().expect("correlator poisoned");
            cor.pending.clear();
            cor.ext_to_mid.clear();
        }
        self.inner.job_tx.lock().expect("job tx poisoned").take();
        self.inner.scheduler.stop();
        self.inner.event.emit("stop", &Value::Null);
    }

    /// Fire-and-forget send (the response, if any, is dropped).
    pub fn send(
        &self,
        route: &str,
        data: impl Into<Payload>,
    ) -> Result<SendTicket, EndpointError> {
        self.send_with(route, data, SendOptions::default())
    }

    /// Send with a response callback, extra headers, or a pinned pipe.
    pub fn send_with(
        &self,
        route: &str,
        data: impl Into<Payload>,
        opts: SendOptions,
    ) -> Result<SendTicket, EndpointError> {
        let entry = match opts.callback {
            Some(cb) => Pending::Callback(cb),
            None => Pending::Quiet,
        };
        self.send_pending(route, data.into(), entry, opts.pipe_code, opts.headers)
    }

    /// Send and block until the response (or cancellation) arrives.
    ///
    /// A cancelled wait returns a request with `is_cancel = true`; an expired
    /// `timeout` returns [`EndpointError::Timeout`]; entries purged by
    /// [`Endpoint::stop`] surface as [`EndpointError::Stopped`].
    pub fn send_blocking(
        &self,
        route: &str,
        data: impl Into<Payload>,
        timeout: Option<Duration>,
    ) -> Result<Request, EndpointError> {
        let (slot_tx, slot_rx) = mpsc::sync_channel(1);
        let ticket = self.send_pending(
            route,
            data.into(),
            Pending::Slot(slot_tx),
            None,
            Map::new(),
        )?;
        let result = match timeout {
            Some(timeout) => slot_rx.recv_timeout(timeout).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => EndpointError::Timeout,
                mpsc::RecvTimeoutError::Disconnected => EndpointError::Stopped,
            }),
            None => slot_rx.recv().map_err(|_| EndpointError::Stopped),
        };
        if matches!(result, Err(EndpointError::Timeout)) {
            let mut cor = self.inner.correlator.lock().expect("correlator poisoned");
            cor.pending.remove(&ticket.message_id);
            cor.ext_to_mid.retain(|_, mid| mid != &ticket.message_id);
        }
        result
    }

    fn send_pending(
        &self,
        route: &str,
        data: Payload,
        entry: Pending,
        pipe_code: Option<String>,
        headers: Map<String, Value>,
    ) -> Result<SendTicket, EndpointError> {
        let message_id = ident::message_id();
        let mut info = headers;
        info.insert("route".into(), Value::String(route.to_string()));
        info.insert("message_id".into(), Value::String(message_id.clone()));

        // Registered before the bytes move: the response may race the return.
        self.inner
            .correlator
            .lock()
            .expect("correlator poisoned")
            .pending
            .insert(message_id.clone(), entry);

        match self.inner.carrier.send(
            data.into_bytes(),
            Value::Object(info),
            pipe_code.as_deref(),
        ) {
            Ok((code, mission)) => {
                self.inner
                    .correlator
                    .lock()
                    .expect("correlator poisoned")
                    .ext_to_mid
                    .insert(mission.clone(), message_id.clone());
                Ok(SendTicket { message_id, mission, pipe_code: code })
            }
            Err(err) => {
                self.inner
                    .correlator
                    .lock()
                    .expect("correlator poisoned")
                    .pending
                    .remove(&message_id);
                Err(err.into())
            }
        }
    }

    /// Answer `req` out of band (outside the handler-return path): same
    /// message id, same pipe.
    pub fn send_response(
        &self,
        data: impl Into<Payload>,
        req: &Request,
    ) -> Result<(), EndpointError> {
        let mut info = Map::new();
        info.insert("is_response".into(), Value::Bool(true));
        if let Some(mid) = req.message_id() {
            info.insert("message_id".into(), Value::String(mid.to_string()));
        }
        self.inner
            .carrier
            .send(data.into().into_bytes(), Value::Object(info), req.pipe_safe_code())?;
        Ok(())
    }

    /// Cancel an outgoing mission and wake any local waiter mapped to it
    /// with a cancelled request.
    pub fn cancel_mission(&self, mission: &str, pipe_code: Option<&str>) -> bool {
        let cancelled = self.inner.carrier.cancel(mission, pipe_code);
        let woken = {
            let mut cor = self.inner.correlator.lock().expect("correlator poisoned");
            cor.ext_to_mid
                .remove(mission)
                .and_then(|mid| cor.pending.remove(&mid).map(|entry| (mid, entry)))
        };
        if let Some((mid, entry)) = woken {
            fire_pending(entry, Request::cancelled(&mid, pipe_code));
        }
        cancelled
    }

    /// The endpoint's event bus (`start`, `stop`, `request`, `response`).
    pub fn event(&self) -> &EventEmitter {
        &self.inner.event
    }

    /// The endpoint's scheduler (started and stopped with the endpoint).
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The endpoint's TTL cache.
    pub fn cache(&self) -> &Cache<Value> {
        &self.inner.cache
    }
}

// ─── Dispatch ──────────────────────────────────────────────────────────────

fn dispatcher_loop(inner: &Arc<Inner>, job_tx: &mpsc::Sender<Job>) {
    loop {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        match inner.carrier.recv() {
            Some((data, info)) => {
                if job_tx.send(Job::Dispatch(data, info)).is_err() {
                    break;
                }
            }
            None => {
                if inner.running.load(Ordering::Acquire) {
                    log::warn!("[endpoint] transport closed, stopping dispatch");
                    inner.running.store(false, Ordering::Release);
                }
                break;
            }
        }
    }
    // Release the workers whichever path ended the loop, and wake blocked
    // senders: dropping their slots surfaces as `Stopped`.
    let workers = inner.max_workers.load(Ordering::Acquire);
    for _ in 0..workers {
        let _ = job_tx.send(Job::Shutdown);
    }
    let mut cor = inner.correlator.lock().expect("correlator poisoned");
    cor.pending.clear();
    cor.ext_to_mid.clear();
}

fn worker_loop(inner: &Arc<Inner>, rx: &Arc<Mutex<mpsc::Receiver<Job>>>, n: usize) {
    log::debug!("[endpoint] worker {n} up");
    loop {
        let job = {
            let rx = rx.lock().expect("job rx poisoned");
            rx.recv()
        };
        match job {
            Ok(Job::Dispatch(data, info)) => dispatch(inner, data, info),
            Ok(Job::Shutdown) | Err(_) => break,
        }
    }
    log::debug!("[endpoint] worker {n} down");
}

fn dispatch(inner: &Arc<Inner>, data: Vec<u8>, info: Value) {
    let req = Request::new(data, info);

    // Correlator first: a matching pending entry consumes the envelope.
    if let Some(mid) = req.message_id().map(str::to_string) {
        let entry = {
            let mut cor = inner.correlator.lock().expect("correlator poisoned");
            match cor.pending.remove(&mid) {
                Some(entry) => {
                    cor.ext_to_mid.retain(|_, v| v != &mid);
                    Some(entry)
                }
                None => None,
            }
        };
        if let Some(entry) = entry {
            fire_pending(entry, req);
            return;
        }
        if req.is_response() || req.is_cancel() {
            log::debug!("[endpoint] stray response for message {mid}");
            return;
        }
    }

    inner.event.emit("request", req.info());

    let table = inner.table.lock().expect("table poisoned").clone();
    let Some(table) = table else { return };

    let response = match req.route().and_then(|route| table.routes.get(route)) {
        Some(compiled) => run_route(compiled, &req),
        None => run_default(&table, &req),
    };

    if let Some(resp) = response {
        inner
            .event
            .emit("response", &serde_json::json!({ "route": resp.route }));
        let mut info = Map::new();
        info.insert("route".into(), Value::String(resp.route.clone()));
        info.insert("is_response".into(), Value::Bool(true));
        if let Some(mid) = req.message_id() {
            info.insert("message_id".into(), Value::String(mid.to_string()));
        }
        if let Err(err) = inner.carrier.send(
            resp.data.into_bytes(),
            Value::Object(info),
            req.pipe_safe_code(),
        ) {
            log::warn!("[endpoint] response send failed: {err}");
        }
    }
}

fn run_route(compiled: &CompiledRoute, req: &Request) -> Option<Response> {
    for hook in &compiled.before {
        if let Some(short) = hook(req) {
            return Some(short);
        }
    }
    let mut response = match (compiled.handler)(req) {
        Ok(response) => response,
        Err(err) => match &compiled.error {
            Some(handler) => handler(req, &err),
            None => {
                log::error!("[endpoint] handler for {:?} failed: {err}", req.route());
                None
            }
        },
    };
    for hook in &compiled.after {
        if let Some(replacement) = hook(req, response.clone()) {
            response = Some(replacement);
        }
    }
    response
}

fn run_default(table: &DispatchTable, req: &Request) -> Option<Response> {
    let Some(handler) = &table.default_handler else {
        log::debug!("[endpoint] no handler for route {:?}", req.route());
        return None;
    };
    match handler(req) {
        Ok(response) => response,
        Err(err) => match &table.error {
            Some(error_handler) => error_handler(req, &err),
            None => {
                log::error!("[endpoint] default handler failed: {err}");
                None
            }
        },
    }
}
