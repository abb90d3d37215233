// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Plugin manager.
//!
//! Plugins register against the manager and are enabled explicitly (or
//! recursively, as dependencies of another plugin). Enabling runs the
//! full lifecycle: framework-version check, dependency resolution,
//! config-schema validation, optional route-prefix wrapping, then
//! `before_apply` / `apply` / `after_apply` bracketed by the
//! `plugin_enabling` / `plugin_enabled` hooks. Failures emit
//! `plugin_error` and propagate to the caller.

pub mod schema;

pub use schema::{ConfigSchema, FieldSpec, FieldType};

use crate::bus::hooks::EventSink;
use crate::bus::EventBus;
use crate::protocol::ProtocolRegistries;
use crate::router::{normalize_path, Context, HandlerResult, RouteConfig, Router, RouterError};
use crate::message::Request;
use crate::ser::SerRegistry;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Plugin lifecycle failure.
#[derive(Debug)]
pub enum PluginError {
    /// No plugin registered under the name.
    NotRegistered(String),
    /// The framework is older than the plugin requires.
    VersionConflict {
        /// Plugin that stated the requirement.
        plugin: String,
        /// Minimum framework version required.
        requires: String,
        /// Version actually running.
        available: String,
    },
    /// A declared dependency is not registered or too old.
    MissingDependency {
        /// Plugin that declared the dependency.
        plugin: String,
        /// The missing or outdated dependency.
        dependency: String,
    },
    /// An option failed schema validation.
    ConfigError {
        /// Plugin whose options were rejected.
        plugin: String,
        /// Offending option key.
        key: String,
        /// What went wrong.
        message: String,
    },
    /// The plugin's `apply` failed.
    ApplyFailed {
        /// Plugin that failed.
        plugin: String,
        /// Failure description.
        message: String,
    },
    /// Route registration made by the plugin failed.
    Route(RouterError),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::NotRegistered(name) => write!(f, "plugin '{}' is not registered", name),
            PluginError::VersionConflict {
                plugin,
                requires,
                available,
            } => write!(
                f,
                "plugin '{}' requires framework {} but {} is running",
                plugin, requires, available
            ),
            PluginError::MissingDependency { plugin, dependency } => {
                write!(f, "plugin '{}' depends on unavailable '{}'", plugin, dependency)
            }
            PluginError::ConfigError {
                plugin,
                key,
                message,
            } => write!(f, "plugin '{}' option '{}' {}", plugin, key, message),
            PluginError::ApplyFailed { plugin, message } => {
                write!(f, "plugin '{}' failed to apply: {}", plugin, message)
            }
            PluginError::Route(e) => write!(f, "plugin route registration failed: {}", e),
        }
    }
}

impl std::error::Error for PluginError {}

impl From<RouterError> for PluginError {
    fn from(e: RouterError) -> Self {
        PluginError::Route(e)
    }
}

/// A dependency on another plugin.
#[derive(Debug, Clone)]
pub struct PluginDependency {
    /// Name of the required plugin.
    pub name: String,
    /// Minimum version, when one matters.
    pub min_version: Option<String>,
}

impl PluginDependency {
    /// Dependency on any version.
    pub fn any(name: &str) -> Self {
        Self {
            name: name.to_string(),
            min_version: None,
        }
    }

    /// Dependency with a minimum version.
    pub fn at_least(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            min_version: Some(version.to_string()),
        }
    }
}

/// What the hosting application exposes to plugins.
pub trait PluginHost: Send + Sync {
    /// The route table.
    fn router(&self) -> &Router;
    /// The protocol-constant registries.
    fn registries(&self) -> &ProtocolRegistries;
    /// The event bus.
    fn bus(&self) -> &EventBus;
    /// The payload codec registry.
    fn ser(&self) -> &SerRegistry;
}

/// Host view handed to a plugin, applying its route prefix.
pub struct PluginContext<'a> {
    host: &'a dyn PluginHost,
    prefix: Option<String>,
}

impl<'a> PluginContext<'a> {
    fn new(host: &'a dyn PluginHost, prefix: Option<String>) -> Self {
        Self { host, prefix }
    }

    fn prefixed(&self, path: &str) -> String {
        match &self.prefix {
            Some(prefix) => normalize_path(&format!("{}/{}", prefix, path)),
            None => normalize_path(path),
        }
    }

    /// Register a route (the plugin's prefix is applied).
    pub fn route<F>(&self, method: &str, path: &str, handler: F) -> Result<(), PluginError>
    where
        F: Fn(&Request, &Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.host
            .router()
            .route(method, &self.prefixed(path), handler)?;
        Ok(())
    }

    /// Register a route with explicit options (prefix applied).
    pub fn route_with<F>(
        &self,
        method: &str,
        path: &str,
        config: RouteConfig,
        handler: F,
    ) -> Result<(), PluginError>
    where
        F: Fn(&Request, &Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.host
            .router()
            .route_with(method, &self.prefixed(path), config, handler)?;
        Ok(())
    }

    /// Register an observable resource (prefix applied).
    pub fn observable(&self, path: &str) -> Result<(), PluginError> {
        self.host.router().observable(&self.prefixed(path))?;
        Ok(())
    }

    /// The protocol registries (for registering new constants).
    pub fn registries(&self) -> &ProtocolRegistries {
        self.host.registries()
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        self.host.bus()
    }

    /// The payload codec registry.
    pub fn ser(&self) -> &SerRegistry {
        self.host.ser()
    }
}

/// A plugin module.
pub trait Plugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Minimum framework version, when one matters.
    fn requires(&self) -> Option<&str> {
        None
    }

    /// Plugins that must be enabled first.
    fn dependencies(&self) -> Vec<PluginDependency> {
        Vec::new()
    }

    /// Prefix applied to every route the plugin registers.
    fn route_prefix(&self) -> Option<&str> {
        None
    }

    /// Schema validated against the enable options.
    fn config_schema(&self) -> Option<ConfigSchema> {
        None
    }

    /// Called right before `apply`.
    fn before_apply(&self, _ctx: &PluginContext<'_>) {}

    /// Install the plugin.
    fn apply(&self, ctx: &PluginContext<'_>, options: &Map<String, Value>)
        -> Result<(), PluginError>;

    /// Called right after a successful `apply`.
    fn after_apply(&self, _ctx: &PluginContext<'_>) {}

    /// Undo `apply` on disable.
    fn unapply(&self, _ctx: &PluginContext<'_>) {}
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
}

/// Registry and lifecycle driver for plugins.
pub struct PluginManager {
    plugins: Mutex<HashMap<String, Registered>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    framework_version: &'static str,
}

impl PluginManager {
    /// Manager for the running framework version.
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            framework_version: crate::VERSION,
        }
    }

    /// Attach the hook sink.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        *lock_recovering(&self.sink) = Some(sink);
    }

    fn emit(&self, event: &str, payload: Value) {
        let sink = lock_recovering(&self.sink).clone();
        if let Some(sink) = sink {
            sink.emit(event, payload);
        }
    }

    /// Register a plugin.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        log::info!("[Plugin] registered {} {}", name, plugin.version());
        lock_recovering(&self.plugins).insert(
            name.clone(),
            Registered {
                plugin,
                enabled: false,
            },
        );
        self.emit("plugin_registered", json!({ "plugin": name }));
    }

    /// True when the plugin is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        lock_recovering(&self.plugins)
            .get(name)
            .is_some_and(|r| r.enabled)
    }

    /// Enable a plugin (idempotent). Dependencies enable recursively with
    /// empty options.
    pub fn enable(
        &self,
        host: &dyn PluginHost,
        name: &str,
        options: Map<String, Value>,
    ) -> Result<(), PluginError> {
        let plugin = {
            let plugins = lock_recovering(&self.plugins);
            let Some(registered) = plugins.get(name) else {
                return Err(PluginError::NotRegistered(name.to_string()));
            };
            if registered.enabled {
                return Ok(());
            }
            Arc::clone(&registered.plugin)
        };

        match self.enable_inner(host, &plugin, options) {
            Ok(()) => {
                if let Some(registered) = lock_recovering(&self.plugins).get_mut(name) {
                    registered.enabled = true;
                }
                self.emit("plugin_enabled", json!({ "plugin": name }));
                log::info!("[Plugin] enabled {}", name);
                Ok(())
            }
            Err(e) => {
                self.emit(
                    "plugin_error",
                    json!({ "plugin": name, "error": e.to_string() }),
                );
                log::error!("[Plugin] enabling {} failed: {}", name, e);
                Err(e)
            }
        }
    }

    fn enable_inner(
        &self,
        host: &dyn PluginHost,
        plugin: &Arc<dyn Plugin>,
        mut options: Map<String, Value>,
    ) -> Result<(), PluginError> {
        let name = plugin.name().to_string();

        if let Some(requires) = plugin.requires() {
            if !version_ge(self.framework_version, requires) {
                return Err(PluginError::VersionConflict {
                    plugin: name,
                    requires: requires.to_string(),
                    available: self.framework_version.to_string(),
                });
            }
        }

        for dependency in plugin.dependencies() {
            let state = {
                let plugins = lock_recovering(&self.plugins);
                plugins
                    .get(&dependency.name)
                    .map(|r| (r.plugin.version().to_string(), r.enabled))
            };
            let Some((dep_version, dep_enabled)) = state else {
                return Err(PluginError::MissingDependency {
                    plugin: name,
                    dependency: dependency.name,
                });
            };
            if let Some(min) = &dependency.min_version {
                if !version_ge(&dep_version, min) {
                    return Err(PluginError::MissingDependency {
                        plugin: name,
                        dependency: format!("{} >= {}", dependency.name, min),
                    });
                }
            }
            if !dep_enabled {
                self.enable(host, &dependency.name, Map::new())?;
            }
        }

        if let Some(schema) = plugin.config_schema() {
            schema.apply(&name, &mut options)?;
        }

        self.emit("plugin_enabling", json!({ "plugin": name }));
        let ctx = PluginContext::new(host, plugin.route_prefix().map(str::to_string));
        plugin.before_apply(&ctx);
        plugin.apply(&ctx, &options)?;
        plugin.after_apply(&ctx);
        Ok(())
    }

    /// Disable a plugin (idempotent).
    pub fn disable(&self, host: &dyn PluginHost, name: &str) -> Result<(), PluginError> {
        let plugin = {
            let mut plugins = lock_recovering(&self.plugins);
            let Some(registered) = plugins.get_mut(name) else {
                return Err(PluginError::NotRegistered(name.to_string()));
            };
            if !registered.enabled {
                return Ok(());
            }
            registered.enabled = false;
            Arc::clone(&registered.plugin)
        };

        let ctx = PluginContext::new(host, plugin.route_prefix().map(str::to_string));
        plugin.unapply(&ctx);
        self.emit("plugin_disabled", json!({ "plugin": name }));
        log::info!("[Plugin] disabled {}", name);
        Ok(())
    }

    /// Names of all registered plugins.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_recovering(&self.plugins).keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare dotted versions numerically; non-numeric parts count as zero.
fn version_ge(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let lhs = parse(version);
    let rhs = parse(minimum);
    for i in 0..lhs.len().max(rhs.len()) {
        let a = lhs.get(i).copied().unwrap_or(0);
        let b = rhs.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[Plugin] lock poisoned, recovering");
            e.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestHost {
        router: Router,
        registries: ProtocolRegistries,
        bus: EventBus,
        ser: SerRegistry,
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                router: Router::new(),
                registries: ProtocolRegistries::with_defaults(),
                bus: EventBus::new(),
                ser: SerRegistry::with_defaults(),
            }
        }
    }

    impl PluginHost for TestHost {
        fn router(&self) -> &Router {
            &self.router
        }
        fn registries(&self) -> &ProtocolRegistries {
            &self.registries
        }
        fn bus(&self) -> &EventBus {
            &self.bus
        }
        fn ser(&self) -> &SerRegistry {
            &self.ser
        }
    }

    struct RoutesPlugin {
        applied: AtomicUsize,
    }

    impl Plugin for RoutesPlugin {
        fn name(&self) -> &str {
            "routes"
        }

        fn version(&self) -> &str {
            "1.2.0"
        }

        fn route_prefix(&self) -> Option<&str> {
            Some("/ext")
        }

        fn apply(
            &self,
            ctx: &PluginContext<'_>,
            _options: &Map<String, Value>,
        ) -> Result<(), PluginError> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            ctx.route("GET", "/status", |_req, c| {
                Ok(c.reply().json(json!({ "ok": true })))
            })
        }
    }

    struct NeedsHost;

    impl Plugin for NeedsHost {
        fn name(&self) -> &str {
            "mqtt-bridge"
        }

        fn config_schema(&self) -> Option<ConfigSchema> {
            Some(ConfigSchema::new().field("host", FieldSpec::new().required()))
        }

        fn apply(
            &self,
            _ctx: &PluginContext<'_>,
            _options: &Map<String, Value>,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct Dependent;

    impl Plugin for Dependent {
        fn name(&self) -> &str {
            "dependent"
        }

        fn dependencies(&self) -> Vec<PluginDependency> {
            vec![PluginDependency::at_least("routes", "1.0.0")]
        }

        fn apply(
            &self,
            _ctx: &PluginContext<'_>,
            _options: &Map<String, Value>,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_enable_applies_route_prefix() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        manager.register(Arc::new(RoutesPlugin {
            applied: AtomicUsize::new(0),
        }));

        manager.enable(&host, "routes", Map::new()).unwrap();
        assert!(manager.is_enabled("routes"));
        assert!(host.router.has_route("GET", "/ext/status"));
        assert!(!host.router.has_route("GET", "/status"));
        host.bus.shutdown();
    }

    #[test]
    fn test_enable_is_idempotent() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        let plugin = Arc::new(RoutesPlugin {
            applied: AtomicUsize::new(0),
        });
        manager.register(Arc::clone(&plugin) as Arc<dyn Plugin>);

        manager.enable(&host, "routes", Map::new()).unwrap();
        manager.enable(&host, "routes", Map::new()).unwrap();
        assert_eq!(plugin.applied.load(Ordering::SeqCst), 1);
        host.bus.shutdown();
    }

    #[test]
    fn test_missing_required_option_names_plugin_and_key() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        manager.register(Arc::new(NeedsHost));

        let err = manager.enable(&host, "mqtt-bridge", Map::new()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("mqtt-bridge"), "{}", text);
        assert!(text.contains("host"), "{}", text);
        assert!(!manager.is_enabled("mqtt-bridge"));
        host.bus.shutdown();
    }

    #[test]
    fn test_dependencies_enable_recursively() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        manager.register(Arc::new(RoutesPlugin {
            applied: AtomicUsize::new(0),
        }));
        manager.register(Arc::new(Dependent));

        manager.enable(&host, "dependent", Map::new()).unwrap();
        assert!(manager.is_enabled("routes"));
        assert!(manager.is_enabled("dependent"));
        host.bus.shutdown();
    }

    #[test]
    fn test_missing_dependency_fails() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        manager.register(Arc::new(Dependent));

        let err = manager.enable(&host, "dependent", Map::new()).unwrap_err();
        assert!(matches!(err, PluginError::MissingDependency { .. }));
        host.bus.shutdown();
    }

    #[test]
    fn test_unknown_plugin() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        let err = manager.enable(&host, "ghost", Map::new()).unwrap_err();
        assert!(matches!(err, PluginError::NotRegistered(_)));
        host.bus.shutdown();
    }

    #[test]
    fn test_version_compare() {
        assert!(version_ge("1.2.3", "1.2.3"));
        assert!(version_ge("1.10.0", "1.9.9"));
        assert!(!version_ge("0.3.0", "1.0.0"));
        assert!(version_ge("2.0", "1.9.9"));
    }

    #[test]
    fn test_disable_is_symmetric() {
        let host = TestHost::new();
        let manager = PluginManager::new();
        manager.register(Arc::new(RoutesPlugin {
            applied: AtomicUsize::new(0),
        }));
        manager.enable(&host, "routes", Map::new()).unwrap();
        manager.disable(&host, "routes").unwrap();
        assert!(!manager.is_enabled("routes"));
        host.bus.shutdown();
    }
}
