// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Request router.
//!
//! Routes are keyed by (method, path pattern). Lookup prefers an exact
//! key before scanning parameterized patterns (segments with a leading
//! colon capture into named parameters); among several matching patterns
//! the lexicographically smallest wins, so dispatch is deterministic
//! regardless of registration order.
//!
//! Paths are normalized on registration and lookup: duplicate and
//! trailing slashes collapse, so `/a//b` and `/a/b` address the same
//! route.
//!
//! Handlers receive the request plus a [`Context`] carrying extracted
//! path parameters, the response builder, and the capability surface of
//! the hosting application (typed helpers instead of open method
//! dispatch on a receiver object).

pub mod discovery;
pub mod middleware;
pub mod respond;

pub use middleware::{Chain, Middleware, Next};
pub use respond::{Body, Halt, HandlerResult, Responder};

use crate::bus::hooks::EventSink;
use crate::message::{Request, Response};
use crate::protocol::constants as c;
use crate::protocol::ProtocolRegistries;
use crate::ser::{SerError, SerRegistry};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// Synthetic method under which observable resources are registered.
pub const OBSERVE_METHOD: &str = "OBSERVE";

/// Extracted path parameters (`:name` segment captures).
pub type PathParams = HashMap<String, String>;

/// Route handler callback.
pub type Handler = Arc<dyn Fn(&Request, &Context<'_>) -> HandlerResult + Send + Sync>;

/// Typed capability surface handlers get instead of a receiver object.
pub trait Capabilities: Send + Sync {
    /// Publish a value on the event bus.
    fn publish(&self, address: &str, body: Value);

    /// Notify observers of an observable path.
    fn notify(&self, path: &str, value: Value);

    /// Last value notified for an observable path.
    fn observe_value(&self, path: &str) -> Option<Value>;

    /// Register the requester as an observer; returns the subscription's
    /// current sequence number.
    fn register_observer(&self, request: &Request) -> Option<u32>;

    /// Remove the requester's observe subscription.
    fn unregister_observer(&self, path: &str, token: &[u8]);
}

/// Capabilities for routers running without a hosting application.
pub struct NoCaps;

impl Capabilities for NoCaps {
    fn publish(&self, address: &str, _body: Value) {
        log::trace!("[Router] publish to {} dropped: no application", address);
    }

    fn notify(&self, _path: &str, _value: Value) {}

    fn observe_value(&self, _path: &str) -> Option<Value> {
        None
    }

    fn register_observer(&self, _request: &Request) -> Option<u32> {
        None
    }

    fn unregister_observer(&self, _path: &str, _token: &[u8]) {}
}

/// Per-dispatch handler context.
pub struct Context<'a> {
    params: PathParams,
    responder: Responder<'a>,
    formats: Vec<u16>,
    force_format: Option<u16>,
    caps: &'a dyn Capabilities,
}

impl<'a> Context<'a> {
    /// Build a context (dispatch and tests).
    pub fn new(
        params: PathParams,
        responder: Responder<'a>,
        formats: Vec<u16>,
        force_format: Option<u16>,
        caps: &'a dyn Capabilities,
    ) -> Self {
        Self {
            params,
            responder,
            formats,
            force_format,
            caps,
        }
    }

    /// A named path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// All extracted path parameters.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// The response builder.
    pub fn reply(&self) -> &Responder<'a> {
        &self.responder
    }

    /// The hosting application's capabilities.
    pub fn caps(&self) -> &dyn Capabilities {
        self.caps
    }

    /// `2.05 Content` negotiated against the route's allowed formats.
    pub fn content(&self, value: Value) -> Response {
        self.responder.respond(
            c::CODE_CONTENT,
            Body::Value(value),
            &self.formats,
            self.force_format,
        )
    }

    /// Decode the request payload via the serialization registry.
    pub fn payload_value(&self) -> Result<Value, SerError> {
        self.responder
            .request()
            .payload_value(self.responder.registry())
    }
}

/// CoRE Link Format attributes of a route (RFC 6690).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreAttrs {
    /// `rt` resource type.
    pub rt: Option<String>,
    /// `if` interface description (field renamed; `if` is reserved).
    pub interface: Option<String>,
    /// `ct` acceptable content formats.
    pub ct: Vec<u16>,
    /// `obs` observable marker.
    pub obs: bool,
    /// `sz` estimated size.
    pub sz: Option<u64>,
    /// `title` human-readable name.
    pub title: Option<String>,
}

/// Registration options beyond method and path.
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    /// Link-format metadata.
    pub attrs: CoreAttrs,
    /// Allowed response content formats (JSON when empty).
    pub formats: Vec<u16>,
    /// Format forced regardless of Accept.
    pub force_format: Option<u16>,
}

/// One registered route.
pub struct RouteEntry {
    /// Method string ("GET", "POST", ..., or [`OBSERVE_METHOD`]).
    pub method: String,
    /// Normalized path pattern.
    pub pattern: String,
    /// Handler callback.
    pub handler: Handler,
    /// Link-format metadata.
    pub attrs: CoreAttrs,
    /// Allowed response content formats.
    pub formats: Vec<u16>,
    /// Format forced regardless of Accept.
    pub force_format: Option<u16>,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("attrs", &self.attrs)
            .finish()
    }
}

/// Routing failure.
#[derive(Debug)]
pub enum RouterError {
    /// (method, path) already registered.
    Duplicate {
        /// Method of the conflicting registration.
        method: String,
        /// Normalized pattern of the conflicting registration.
        pattern: String,
    },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Duplicate { method, pattern } => {
                write!(f, "route {} {} is already registered", method, pattern)
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// Normalize a path or pattern: collapse duplicate and trailing slashes.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

fn match_pattern(pattern: &str, path: &str) -> Option<PathParams> {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = PathParams::new();
    for (pattern_segment, path_segment) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pattern_segment.strip_prefix(':') {
            params.insert(name.to_string(), (*path_segment).to_string());
        } else if pattern_segment != path_segment {
            return None;
        }
    }
    Some(params)
}

fn is_parametric(pattern: &str) -> bool {
    pattern
        .split('/')
        .any(|segment| segment.starts_with(':'))
}

/// The route table.
pub struct Router {
    routes: RwLock<HashMap<(String, String), Arc<RouteEntry>>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
}

impl Router {
    /// Empty router.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            sink: Mutex::new(None),
        }
    }

    /// Router with the built-in default routes (`GET /ping`, `POST /echo`,
    /// `GET /.well-known/core`).
    pub fn with_defaults() -> Arc<Self> {
        let router = Arc::new(Self::new());
        Self::install_defaults(&router);
        router
    }

    /// Attach the hook sink that receives `router_route_added` events.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        let mut slot = match self.sink.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        *slot = Some(sink);
    }

    /// Register a route with default options.
    pub fn route<F>(&self, method: &str, path: &str, handler: F) -> Result<(), RouterError>
    where
        F: Fn(&Request, &Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.route_with(method, path, RouteConfig::default(), handler)
    }

    /// Register a route with explicit options.
    pub fn route_with<F>(
        &self,
        method: &str,
        path: &str,
        config: RouteConfig,
        handler: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(&Request, &Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(method, path, config, Arc::new(handler))
    }

    fn insert(
        &self,
        method: &str,
        path: &str,
        config: RouteConfig,
        handler: Handler,
    ) -> Result<(), RouterError> {
        let pattern = normalize_path(path);
        let key = (method.to_string(), pattern.clone());
        let formats = if config.formats.is_empty() {
            vec![c::FORMAT_JSON]
        } else {
            config.formats
        };
        let entry = Arc::new(RouteEntry {
            method: method.to_string(),
            pattern: pattern.clone(),
            handler,
            attrs: config.attrs,
            formats,
            force_format: config.force_format,
        });

        {
            let mut routes = self.routes.write();
            if routes.contains_key(&key) {
                return Err(RouterError::Duplicate {
                    method: method.to_string(),
                    pattern,
                });
            }
            routes.insert(key, entry);
        }

        log::debug!("[Router] route added {} {}", method, pattern);
        let sink = {
            let slot = match self.sink.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            slot.clone()
        };
        if let Some(sink) = sink {
            sink.emit(
                "router_route_added",
                json!({ "method": method, "path": pattern }),
            );
        }
        Ok(())
    }

    /// Register an observable resource under the synthetic OBSERVE method.
    /// The handler serves the initial GET of a subscription with the last
    /// notified value.
    pub fn observable(&self, path: &str) -> Result<(), RouterError> {
        let pattern = normalize_path(path);
        let config = RouteConfig {
            attrs: CoreAttrs {
                rt: Some("core#observable".to_string()),
                interface: Some("takagi.observe".to_string()),
                obs: true,
                ..CoreAttrs::default()
            },
            ..RouteConfig::default()
        };
        let serve_path = pattern.clone();
        self.route_with(OBSERVE_METHOD, path, config, move |_req, ctx| {
            let value = ctx
                .caps()
                .observe_value(&serve_path)
                .unwrap_or(Value::Null);
            Ok(ctx.reply().json(value))
        })
    }

    /// Look up the route for (method, path); exact match wins over
    /// parameterized patterns, which tie-break lexicographically.
    pub fn lookup(&self, method: &str, path: &str) -> Option<(Arc<RouteEntry>, PathParams)> {
        let normalized = normalize_path(path);
        let routes = self.routes.read();

        if let Some(entry) = routes.get(&(method.to_string(), normalized.clone())) {
            return Some((Arc::clone(entry), PathParams::new()));
        }

        let mut best: Option<(&String, Arc<RouteEntry>, PathParams)> = None;
        for ((route_method, pattern), entry) in routes.iter() {
            if route_method != method || !is_parametric(pattern) {
                continue;
            }
            let Some(params) = match_pattern(pattern, &normalized) else {
                continue;
            };
            let better = match &best {
                Some((current, _, _)) => pattern < *current,
                None => true,
            };
            if better {
                best = Some((pattern, Arc::clone(entry), params));
            }
        }
        best.map(|(_, entry, params)| (entry, params))
    }

    /// True when (method, path) resolves to a route.
    pub fn has_route(&self, method: &str, path: &str) -> bool {
        self.lookup(method, path).is_some()
    }

    /// Snapshot of all route entries.
    pub fn snapshot(&self) -> Vec<Arc<RouteEntry>> {
        self.routes.read().values().cloned().collect()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// True when no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn install_defaults(router: &Arc<Router>) {
        let result = router.route("GET", "/ping", |_req, ctx| {
            Ok(ctx.reply().json(json!({ "message": "Pong" })))
        });
        if let Err(e) = result {
            log::warn!("[Router] default route skipped: {}", e);
        }

        let result = router.route("POST", "/echo", |_req, ctx| {
            let body = ctx.payload_value().unwrap_or(Value::Null);
            let echoed = body.get("message").cloned().unwrap_or(Value::Null);
            Ok(ctx.reply().json(json!({ "echo": echoed })))
        });
        if let Err(e) = result {
            log::warn!("[Router] default route skipped: {}", e);
        }

        let weak: Weak<Router> = Arc::downgrade(router);
        let config = RouteConfig {
            attrs: CoreAttrs {
                rt: Some("core.discovery".to_string()),
                ct: vec![c::FORMAT_LINK_FORMAT],
                ..CoreAttrs::default()
            },
            formats: vec![c::FORMAT_LINK_FORMAT],
            force_format: Some(c::FORMAT_LINK_FORMAT),
        };
        let result = router.route_with("GET", "/.well-known/core", config, move |_req, ctx| {
            let Some(router) = weak.upgrade() else {
                return Ok(ctx.reply().internal_server_error());
            };
            let body = discovery::link_format(&router.snapshot());
            Ok(ctx.reply().respond(
                c::CODE_CONTENT,
                Body::Bytes(body.into_bytes()),
                &[c::FORMAT_LINK_FORMAT],
                Some(c::FORMAT_LINK_FORMAT),
            ))
        });
        if let Err(e) = result {
            log::warn!("[Router] default route skipped: {}", e);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("len", &self.len()).finish()
    }
}

// ============================================================================
// Terminal dispatch
// ============================================================================

/// Terminal of the middleware chain: method resolution, route lookup,
/// handler invocation, observe registration, and error mapping.
pub struct Dispatcher {
    router: Arc<Router>,
    ser: Arc<SerRegistry>,
    registries: Arc<ProtocolRegistries>,
    caps: Arc<dyn Capabilities>,
}

impl Dispatcher {
    /// Build the terminal dispatch.
    pub fn new(
        router: Arc<Router>,
        ser: Arc<SerRegistry>,
        registries: Arc<ProtocolRegistries>,
        caps: Arc<dyn Capabilities>,
    ) -> Self {
        Self {
            router,
            ser,
            registries,
            caps,
        }
    }

    fn invoke(&self, entry: &RouteEntry, request: &Request, params: PathParams) -> Response {
        let responder = Responder::new(request, &self.ser);
        let context = Context::new(
            params,
            Responder::new(request, &self.ser),
            entry.formats.clone(),
            entry.force_format,
            &*self.caps,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(request, &context)));
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(Halt(response))) => response,
            Err(_) => {
                log::error!(
                    "[Router] handler for {} {} panicked",
                    entry.method,
                    entry.pattern
                );
                responder.internal_server_error()
            }
        }
    }

    fn dispatch_observe(&self, request: &Request) -> Option<Response> {
        let path = request.path();
        let (entry, params) = self.router.lookup(OBSERVE_METHOD, &path)?;

        if request.is_observe_deregister() {
            self.caps.unregister_observer(&entry.pattern, request.token());
            return Some(self.invoke(&entry, request, params));
        }

        let sequence = self.caps.register_observer(request).unwrap_or(0);
        let mut response = self.invoke(&entry, request, params);
        response.set_observe(sequence);
        Some(response)
    }
}

impl Next for Dispatcher {
    fn run(&self, request: &Request) -> Response {
        let responder = Responder::new(request, &self.ser);

        if request.is_observe_register() || request.is_observe_deregister() {
            if let Some(response) = self.dispatch_observe(request) {
                return response;
            }
            // No observable resource: fall through to a plain GET.
        }

        let Some(method) = self.registries.method_name(request.code()) else {
            log::debug!("[Router] unknown method code {}", request.code());
            return responder.method_not_allowed();
        };

        match self.router.lookup(&method, &request.path()) {
            Some((entry, params)) => self.invoke(&entry, request, params),
            None => responder.not_found(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageType};
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "192.0.2.1:5683".parse().unwrap()
    }

    fn get(path: &str) -> Request {
        let mut msg = Message::udp(MessageType::Con, c::METHOD_GET, 1, vec![0x01]);
        msg.set_path(path);
        Request::new(msg, peer())
    }

    fn ok_handler(_req: &Request, ctx: &Context<'_>) -> HandlerResult {
        Ok(ctx.reply().json(json!({ "ok": true })))
    }

    #[test]
    fn test_exact_beats_parametric() {
        let router = Router::new();
        router.route("GET", "/x", ok_handler).unwrap();
        router.route("GET", "/:y", ok_handler).unwrap();

        let (entry, params) = router.lookup("GET", "/x").unwrap();
        assert_eq!(entry.pattern, "/x");
        assert!(params.is_empty());

        let (entry, params) = router.lookup("GET", "/z").unwrap();
        assert_eq!(entry.pattern, "/:y");
        assert_eq!(params.get("y").map(String::as_str), Some("z"));
    }

    #[test]
    fn test_nested_parameter_extraction() {
        let router = Router::new();
        router.route("GET", "/users/:id/posts/:pid", ok_handler).unwrap();

        let (_, params) = router.lookup("GET", "/users/7/posts/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("7"));
        assert_eq!(params.get("pid").map(String::as_str), Some("42"));
        assert!(router.lookup("GET", "/users/7/posts").is_none());
    }

    #[test]
    fn test_slash_normalization() {
        let router = Router::new();
        router.route("GET", "/a/b", ok_handler).unwrap();
        assert!(router.has_route("GET", "/a//b"));
        assert!(router.has_route("GET", "/a/b/"));
        assert!(!router.has_route("GET", "/a/b/c"));
    }

    #[test]
    fn test_ambiguous_patterns_pick_lexicographic() {
        // Registered in both orders the dispatch must be identical.
        for flipped in [false, true] {
            let router = Router::new();
            let first: (&str, &str) = ("/:a/x", "/:b/:c");
            let (one, two) = if flipped {
                (first.1, first.0)
            } else {
                first
            };
            router.route("GET", one, ok_handler).unwrap();
            router.route("GET", two, ok_handler).unwrap();

            let (entry, _) = router.lookup("GET", "/q/x").unwrap();
            assert_eq!(entry.pattern, "/:a/x", "flipped={}", flipped);
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = Router::new();
        router.route("GET", "/dup", ok_handler).unwrap();
        assert!(matches!(
            router.route("GET", "/dup", ok_handler),
            Err(RouterError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_method_isolation() {
        let router = Router::new();
        router.route("GET", "/thing", ok_handler).unwrap();
        assert!(router.lookup("POST", "/thing").is_none());
    }

    #[test]
    fn test_observable_registers_synthetic_method() {
        let router = Router::new();
        router.observable("/sensors/temp").unwrap();
        let (entry, _) = router.lookup(OBSERVE_METHOD, "/sensors/temp").unwrap();
        assert!(entry.attrs.obs);
        assert_eq!(entry.attrs.rt.as_deref(), Some("core#observable"));
        assert_eq!(entry.attrs.interface.as_deref(), Some("takagi.observe"));
    }

    #[test]
    fn test_dispatcher_not_found() {
        let router = Arc::new(Router::new());
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(SerRegistry::with_defaults()),
            Arc::new(ProtocolRegistries::with_defaults()),
            Arc::new(NoCaps),
        );
        let response = dispatcher.run(&get("/missing"));
        assert_eq!(response.code(), c::CODE_NOT_FOUND);
    }

    #[test]
    fn test_dispatcher_runs_default_routes() {
        let router = Router::with_defaults();
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(SerRegistry::with_defaults()),
            Arc::new(ProtocolRegistries::with_defaults()),
            Arc::new(NoCaps),
        );
        let response = dispatcher.run(&get("/ping"));
        assert_eq!(response.code(), c::CODE_CONTENT);
        assert_eq!(response.payload(), br#"{"message":"Pong"}"#);
    }

    #[test]
    fn test_dispatcher_converts_panic_to_500() {
        let router = Arc::new(Router::new());
        router
            .route("GET", "/boom", |_req, _ctx| -> HandlerResult {
                panic!("handler exploded")
            })
            .unwrap();
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(SerRegistry::with_defaults()),
            Arc::new(ProtocolRegistries::with_defaults()),
            Arc::new(NoCaps),
        );
        let response = dispatcher.run(&get("/boom"));
        assert_eq!(response.code(), c::CODE_INTERNAL_SERVER_ERROR);
        assert_eq!(response.payload(), br#"{"error":"Internal Server Error"}"#);
    }

    #[test]
    fn test_halt_surfaces_response() {
        let router = Arc::new(Router::new());
        router
            .route("GET", "/guarded", |_req, ctx| {
                Err(ctx.reply().halt(ctx.reply().forbidden("nope")))?;
                Ok(ctx.reply().json(json!({ "unreachable": true })))
            })
            .unwrap();
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(SerRegistry::with_defaults()),
            Arc::new(ProtocolRegistries::with_defaults()),
            Arc::new(NoCaps),
        );
        let response = dispatcher.run(&get("/guarded"));
        assert_eq!(response.code(), c::CODE_FORBIDDEN);
    }
}
