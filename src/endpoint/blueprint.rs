//! Blueprint: a reusable route group.
//!
//! A blueprint bundles routes under a prefix with its own middlewares,
//! hooks, error handler, and default entry. It does nothing on its own —
//! [`Endpoint::register_blueprint`](super::Endpoint::register_blueprint)
//! merges its tables into the endpoint:
//!
//! - routes land under `prefix` + name;
//! - blueprint middlewares run *inside* endpoint middlewares, for the
//!   blueprint's routes only;
//! - blueprint hooks run after the endpoint's, for its routes only;
//! - the blueprint error handler applies only when the endpoint has none;
//! - the blueprint default becomes the endpoint default only if none is set.

use std::sync::Arc;

use super::{AfterHook, BeforeHook, ErrorHandler, Handler, HandlerResult, MiddlewareFn, Request, Response};

/// See the module docs.
pub struct Blueprint {
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) routes: Vec<(String, Handler)>,
    pub(crate) default_handler: Option<Handler>,
    pub(crate) middlewares: Vec<MiddlewareFn>,
    pub(crate) before_hooks: Vec<BeforeHook>,
    pub(crate) after_hooks: Vec<AfterHook>,
    pub(crate) error_handler: Option<ErrorHandler>,
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl Blueprint {
    /// A blueprint whose routes are registered under `prefix`.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = prefix.into();
        log::debug!("[blueprint] created '{name}' with prefix '{prefix}'");
        Self {
            name,
            prefix,
            routes: Vec::new(),
            default_handler: None,
            middlewares: Vec::new(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            error_handler: None,
        }
    }

    /// Blueprint name, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler under `prefix` + `route`.
    pub fn request(
        &mut self,
        route: &str,
        handler: impl Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    ) -> &mut Self {
        let full = format!("{}{}", self.prefix, route);
        log::debug!("[blueprint] '{}' registered route '{full}'", self.name);
        self.routes.push((full, Arc::new(handler)));
        self
    }

    /// Register the blueprint's default handler.
    pub fn default(
        &mut self,
        handler: impl Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    ) -> &mut Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Add a middleware wrapping this blueprint's handlers.
    pub fn middleware(
        &mut self,
        middleware: impl Fn(Handler) -> Handler + Send + Sync + 'static,
    ) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Hook run before each of this blueprint's handlers; a `Some` return
    /// short-circuits the handler.
    pub fn before_request(
        &mut self,
        hook: impl Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    ) -> &mut Self {
        self.before_hooks.push(Arc::new(hook));
        self
    }

    /// Hook run after each of this blueprint's handlers; a `Some` return
    /// replaces the response.
    pub fn after_request(
        &mut self,
        hook: impl Fn(&Request, Option<Response>) -> Option<Response> + Send + Sync + 'static,
    ) -> &mut Self {
        self.after_hooks.push(Arc::new(hook));
        self
    }

    /// Error handler for this blueprint's routes, used only when the
    /// endpoint has none of its own.
    pub fn error_handle(
        &mut self,
        handler: impl Fn(&Request, &anyhow::Error) -> Option<Response> + Send + Sync + 'static,
    ) -> &mut Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}
