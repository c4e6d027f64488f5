//! Lazy, factory-based service registry.
//!
//! Services are registered under a name together with a typed factory and the
//! names of the services it depends on. Nothing is built until the first
//! [`ServiceRegistry::get`]; singletons are memoized after that.
//!
//! ```
//! use std::sync::Arc;
//! use round_client::registry::{RegisterOptions, Service, ServiceRegistry};
//!
//! struct Clock;
//! impl Service for Clock {}
//!
//! struct Scheduler {
//!     clock: Arc<Clock>,
//! }
//! impl Service for Scheduler {}
//!
//! let registry = ServiceRegistry::new();
//! registry
//!     .register("clock", RegisterOptions::default(), |_, _| Ok(Arc::new(Clock)))
//!     .register(
//!         "scheduler",
//!         RegisterOptions::default().with_dependencies(["clock"]),
//!         |deps, _| Ok(Arc::new(Scheduler { clock: deps.get("clock")? })),
//!     );
//!
//! let scheduler = registry.get::<Scheduler>("scheduler").unwrap();
//! let clock = registry.get::<Clock>("clock").unwrap();
//! assert!(Arc::ptr_eq(&scheduler.clock, &clock));
//! ```

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::HandlerError;

// ── Service hooks ───────────────────────────────────────────────────

/// Lifecycle hooks for anything stored in a [`ServiceRegistry`].
pub trait Service: Send + Sync + 'static {
    /// Called by [`ServiceRegistry::remove`] and [`ServiceRegistry::clear`].
    fn teardown(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// `Some(healthy)` to override the registry's default health report.
    fn health(&self) -> Option<bool> {
        None
    }
}

/// Health of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not constructed yet.
    Unknown,
    Healthy,
    Unhealthy,
}

/// Errors raised while resolving services.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' is not registered")]
    NotRegistered(String),

    #[error("service '{name}' depends on unregistered service '{dependency}'")]
    MissingDependency { name: String, dependency: String },

    #[error("circular dependency detected at '{origin}': {}", .path.join(" -> "))]
    CircularDependency { origin: String, path: Vec<String> },

    #[error("failed to construct service '{name}': {source}")]
    Construction {
        name: String,
        #[source]
        source: HandlerError,
    },

    #[error("service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

// ── Registration ────────────────────────────────────────────────────

/// Options for [`ServiceRegistry::register`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Build once and reuse. Defaults to `true`.
    pub singleton: bool,
    /// Services resolved and handed to the factory, in order.
    pub dependencies: Vec<String>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            singleton: true,
            dependencies: Vec::new(),
        }
    }
}

impl RegisterOptions {
    /// Rebuild the service on every [`ServiceRegistry::get`].
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.singleton = false;
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone)]
struct Instance {
    any: Arc<dyn Any + Send + Sync>,
    hooks: Arc<dyn Service>,
}

impl Instance {
    fn downcast<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        Arc::clone(&self.any)
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }
}

type Factory =
    Arc<dyn Fn(&Dependencies, &ServiceRegistry) -> Result<Instance, HandlerError> + Send + Sync>;

struct Registration {
    factory: Factory,
    singleton: bool,
    dependencies: Vec<String>,
    instance: Option<Instance>,
    health: HealthStatus,
}

/// Resolved dependencies handed to a factory, in declaration order.
pub struct Dependencies {
    resolved: Vec<(String, Instance)>,
}

impl Dependencies {
    /// Fetch a resolved dependency by name.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.resolved
            .iter()
            .find(|(dep, _)| dep == name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
            .and_then(|(dep, instance)| instance.downcast(dep))
    }

    /// Fetch a resolved dependency by its position in the declared list.
    pub fn at<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>, RegistryError> {
        self.resolved
            .get(index)
            .ok_or_else(|| RegistryError::NotRegistered(format!("#{index}")))
            .and_then(|(dep, instance)| instance.downcast(dep))
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resolved.iter().map(|(name, _)| name.as_str())
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    registrations: HashMap<String, Registration>,
    /// Singletons in construction order, for teardown in reverse.
    built: Vec<String>,
}

/// Dependency-injection container with lazy singletons and cycle detection.
///
/// Resolution is meant to happen from one task at a time; two tasks building
/// the same singleton concurrently may both observe it as in progress.
#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<State>,
    resolving: Mutex<Vec<String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. Chainable.
    ///
    /// Registering a name twice replaces the earlier registration and tears
    /// down its instance, if one was built.
    pub fn register<T, F>(&self, name: &str, options: RegisterOptions, factory: F) -> &Self
    where
        T: Service,
        F: Fn(&Dependencies, &ServiceRegistry) -> Result<Arc<T>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let factory: Factory = Arc::new(move |deps: &Dependencies, registry: &ServiceRegistry| {
            let service = factory(deps, registry)?;
            let any: Arc<dyn Any + Send + Sync> = service.clone();
            Ok(Instance {
                any,
                hooks: service,
            })
        });
        let registration = Registration {
            factory,
            singleton: options.singleton,
            dependencies: options.dependencies,
            instance: None,
            health: HealthStatus::Unknown,
        };

        let replaced = {
            let mut state = self.state.lock();
            state.built.retain(|built| built != name);
            state.registrations.insert(name.to_string(), registration)
        };
        if let Some(old) = replaced {
            warn!(service = name, "registry: replacing existing registration");
            if let Some(instance) = old.instance {
                teardown(name, &instance);
            }
        }
        self
    }

    /// Resolve `name`, building it (and its dependencies) if needed.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.resolve(name)?.downcast(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.state.lock().registrations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().registrations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove `name`, running its teardown hook first. Teardown failures are
    /// logged, not returned. Returns `true` if `name` was registered.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.built.retain(|built| built != name);
            state.registrations.remove(name)
        };
        match removed {
            Some(registration) => {
                if let Some(instance) = registration.instance {
                    teardown(name, &instance);
                }
                debug!(service = name, "registry: removed");
                true
            }
            None => false,
        }
    }

    /// Remove everything, tearing singletons down in reverse build order.
    pub fn clear(&self) {
        let (mut registrations, built) = {
            let mut state = self.state.lock();
            let state = std::mem::take(&mut *state);
            (state.registrations, state.built)
        };
        for name in built.iter().rev() {
            if let Some(instance) = registrations.get_mut(name).and_then(|r| r.instance.take()) {
                teardown(name, &instance);
            }
        }
        debug!(count = registrations.len(), "registry: cleared");
    }

    /// Health of one service.
    pub fn check_health(&self, name: &str) -> Result<HealthStatus, RegistryError> {
        let state = self.state.lock();
        let registration = state
            .registrations
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        Ok(health_of(registration))
    }

    /// Health of every registered service.
    pub fn health_status(&self) -> BTreeMap<String, HealthStatus> {
        let state = self.state.lock();
        state
            .registrations
            .iter()
            .map(|(name, registration)| (name.clone(), health_of(registration)))
            .collect()
    }

    /// Check the declared graph without building anything: every dependency
    /// must be registered and there must be no cycles.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let graph: BTreeMap<String, Vec<String>> = {
            let state = self.state.lock();
            state
                .registrations
                .iter()
                .map(|(name, r)| (name.clone(), r.dependencies.clone()))
                .collect()
        };

        for (name, dependencies) in &graph {
            if let Some(missing) = dependencies.iter().find(|dep| !graph.contains_key(*dep)) {
                return Err(RegistryError::MissingDependency {
                    name: name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut finished: Vec<&str> = Vec::new();
        for name in graph.keys() {
            let mut path = Vec::new();
            visit(&graph, name, &mut path, &mut finished)?;
        }
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn resolve(&self, name: &str) -> Result<Instance, RegistryError> {
        let (factory, dependencies, singleton) = {
            let state = self.state.lock();
            let registration = state
                .registrations
                .get(name)
                .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
            if let Some(instance) = &registration.instance {
                return Ok(instance.clone());
            }
            (
                Arc::clone(&registration.factory),
                registration.dependencies.clone(),
                registration.singleton,
            )
        };

        let _guard = self.enter(name)?;
        let built = self.build(name, &factory, &dependencies);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(registration) = state.registrations.get_mut(name) else {
            // Removed while building.
            return built;
        };
        match &built {
            Ok(instance) => {
                registration.health = HealthStatus::Healthy;
                if singleton {
                    if let Some(existing) = &registration.instance {
                        return Ok(existing.clone());
                    }
                    registration.instance = Some(instance.clone());
                    state.built.push(name.to_string());
                }
            }
            Err(err) => {
                registration.health = HealthStatus::Unhealthy;
                warn!(service = name, "registry: construction failed: {err}");
            }
        }
        built
    }

    fn build(
        &self,
        name: &str,
        factory: &Factory,
        dependencies: &[String],
    ) -> Result<Instance, RegistryError> {
        let mut resolved = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let instance = self.resolve(dependency).map_err(|err| match err {
                RegistryError::NotRegistered(missing) if &missing == dependency => {
                    RegistryError::MissingDependency {
                        name: name.to_string(),
                        dependency: missing,
                    }
                }
                other => other,
            })?;
            resolved.push((dependency.clone(), instance));
        }

        debug!(service = name, "registry: constructing");
        factory(&Dependencies { resolved }, self).map_err(|source| RegistryError::Construction {
            name: name.to_string(),
            source,
        })
    }

    /// Mark `name` as being built, failing if it already is.
    fn enter(&self, name: &str) -> Result<ResolvingGuard<'_>, RegistryError> {
        let mut resolving = self.resolving.lock();
        if let Some(start) = resolving.iter().position(|n| n == name) {
            let mut path: Vec<String> = resolving.iter().skip(start).cloned().collect();
            path.push(name.to_string());
            return Err(RegistryError::CircularDependency {
                origin: name.to_string(),
                path,
            });
        }
        resolving.push(name.to_string());
        Ok(ResolvingGuard {
            registry: self,
            name: name.to_string(),
        })
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

/// Clears the in-progress mark when construction ends, however it ends.
struct ResolvingGuard<'a> {
    registry: &'a ServiceRegistry,
    name: String,
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        let mut resolving = self.registry.resolving.lock();
        if let Some(index) = resolving.iter().rposition(|n| *n == self.name) {
            resolving.remove(index);
        }
    }
}

fn health_of(registration: &Registration) -> HealthStatus {
    match (&registration.instance, registration.health) {
        (Some(instance), HealthStatus::Healthy) => match instance.hooks.health() {
            Some(true) | None => HealthStatus::Healthy,
            Some(false) => HealthStatus::Unhealthy,
        },
        (_, status) => status,
    }
}

fn teardown(name: &str, instance: &Instance) {
    if let Err(err) = instance.hooks.teardown() {
        warn!(service = name, "registry: teardown failed: {err}");
    }
}

fn visit<'g>(
    graph: &'g BTreeMap<String, Vec<String>>,
    name: &'g str,
    path: &mut Vec<&'g str>,
    finished: &mut Vec<&'g str>,
) -> Result<(), RegistryError> {
    if finished.contains(&name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = path.iter().skip(start).map(|n| n.to_string()).collect();
        cycle.push(name.to_string());
        return Err(RegistryError::CircularDependency {
            origin: name.to_string(),
            path: cycle,
        });
    }
    path.push(name);
    for dependency in graph.get(name).into_iter().flatten() {
        visit(graph, dependency, path, finished)?;
    }
    path.pop();
    finished.push(name);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Leaf;
    impl Service for Leaf {}

    #[derive(Debug)]
    struct Node {
        deps: Vec<Arc<Node>>,
    }
    impl Service for Node {}

    fn node(registry: &ServiceRegistry, name: &str, deps: &[&str]) {
        let owned: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        let names = owned.clone();
        registry.register(
            name,
            RegisterOptions::default().with_dependencies(owned),
            move |resolved, _| {
                let deps = names
                    .iter()
                    .map(|n| resolved.get::<Node>(n))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(Node { deps }))
            },
        );
    }

    #[test]
    fn singleton_is_memoized() {
        let registry = ServiceRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        registry.register("leaf", RegisterOptions::default(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Leaf))
        });

        let a = registry.get::<Leaf>("leaf").unwrap();
        let b = registry.get::<Leaf>("leaf").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_rebuilds_every_call() {
        let registry = ServiceRegistry::new();
        registry.register("leaf", RegisterOptions::default().transient(), |_, _| {
            Ok(Arc::new(Leaf))
        });
        let a = registry.get::<Leaf>("leaf").unwrap();
        let b = registry.get::<Leaf>("leaf").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dependency_is_the_shared_singleton() {
        let registry = ServiceRegistry::new();
        node(&registry, "A", &[]);
        node(&registry, "B", &["A"]);

        let b = registry.get::<Node>("B").unwrap();
        let a = registry.get::<Node>("A").unwrap();
        assert!(Arc::ptr_eq(&b.deps[0], &a));
    }

    #[test]
    fn cycles_of_any_length_are_detected() {
        for length in [2usize, 3, 7] {
            let registry = ServiceRegistry::new();
            let names: Vec<String> = (0..length).map(|i| format!("s{i}")).collect();
            for (i, name) in names.iter().enumerate() {
                let next = names[(i + 1) % length].clone();
                node(&registry, name, &[next.as_str()]);
            }
            node(&registry, "independent", &[]);

            let err = registry.get::<Node>("s0").err().unwrap();
            match err {
                RegistryError::CircularDependency { origin, path } => {
                    assert_eq!(origin, "s0");
                    assert_eq!(path.len(), length + 1);
                    assert_eq!(path.first(), path.last());
                }
                other => panic!("expected cycle, got {other:?}"),
            }

            // Nothing partial was memoized and the registry is not stuck.
            for name in &names {
                assert_ne!(registry.check_health(name).unwrap(), HealthStatus::Healthy);
            }
            assert!(registry.get::<Node>("independent").is_ok());
            assert!(matches!(
                registry.get::<Node>("s1"),
                Err(RegistryError::CircularDependency { .. })
            ));
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = ServiceRegistry::new();
        node(&registry, "me", &["me"]);
        assert!(matches!(
            registry.get::<Node>("me"),
            Err(RegistryError::CircularDependency { .. })
        ));
    }

    #[test]
    fn missing_dependency_names_both_sides() {
        let registry = ServiceRegistry::new();
        node(&registry, "B", &["ghost"]);
        match registry.get::<Node>("B") {
            Err(RegistryError::MissingDependency { name, dependency }) => {
                assert_eq!(name, "B");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
        assert!(matches!(
            registry.get::<Node>("nope"),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[test]
    fn failed_construction_can_be_retried() {
        let registry = ServiceRegistry::new();
        let fail = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&fail);
        registry.register("flaky", RegisterOptions::default(), move |_, _| {
            if flag.load(Ordering::SeqCst) {
                return Err("not yet".into());
            }
            Ok(Arc::new(Leaf))
        });

        assert!(matches!(
            registry.get::<Leaf>("flaky"),
            Err(RegistryError::Construction { .. })
        ));
        assert_eq!(
            registry.check_health("flaky").unwrap(),
            HealthStatus::Unhealthy
        );

        fail.store(false, Ordering::SeqCst);
        assert!(registry.get::<Leaf>("flaky").is_ok());
        assert_eq!(registry.check_health("flaky").unwrap(), HealthStatus::Healthy);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let registry = ServiceRegistry::new();
        registry.register("leaf", RegisterOptions::default(), |_, _| Ok(Arc::new(Leaf)));
        assert!(matches!(
            registry.get::<Node>("leaf"),
            Err(RegistryError::TypeMismatch { .. })
        ));
    }

    struct Tracked {
        torn_down: Arc<AtomicBool>,
        fail: bool,
        healthy: Arc<AtomicBool>,
    }

    impl Service for Tracked {
        fn teardown(&self) -> Result<(), HandlerError> {
            self.torn_down.store(true, Ordering::SeqCst);
            if self.fail {
                return Err("teardown exploded".into());
            }
            Ok(())
        }

        fn health(&self) -> Option<bool> {
            Some(self.healthy.load(Ordering::SeqCst))
        }
    }

    fn tracked(registry: &ServiceRegistry, name: &str, fail: bool) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        let torn_down = Arc::new(AtomicBool::new(false));
        let healthy = Arc::new(AtomicBool::new(true));
        let (t, h) = (Arc::clone(&torn_down), Arc::clone(&healthy));
        registry.register(name, RegisterOptions::default(), move |_, _| {
            Ok(Arc::new(Tracked {
                torn_down: Arc::clone(&t),
                fail,
                healthy: Arc::clone(&h),
            }))
        });
        (torn_down, healthy)
    }

    #[test]
    fn remove_runs_teardown_and_swallows_failure() {
        let registry = ServiceRegistry::new();
        let (ok_down, _) = tracked(&registry, "ok", false);
        let (bad_down, _) = tracked(&registry, "bad", true);
        registry.get::<Tracked>("ok").unwrap();
        registry.get::<Tracked>("bad").unwrap();

        assert!(registry.remove("ok"));
        assert!(registry.remove("bad"));
        assert!(!registry.remove("bad"));
        assert!(ok_down.load(Ordering::SeqCst));
        assert!(bad_down.load(Ordering::SeqCst));
        assert!(!registry.has("ok"));
    }

    #[test]
    fn clear_tears_down_everything() {
        let registry = ServiceRegistry::new();
        let (down, _) = tracked(&registry, "svc", false);
        registry.get::<Tracked>("svc").unwrap();
        registry.clear();
        assert!(down.load(Ordering::SeqCst));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn health_delegates_to_instance() {
        let registry = ServiceRegistry::new();
        let (_, healthy) = tracked(&registry, "svc", false);
        registry.register("leaf", RegisterOptions::default(), |_, _| Ok(Arc::new(Leaf)));

        assert_eq!(registry.check_health("svc").unwrap(), HealthStatus::Unknown);
        registry.get::<Tracked>("svc").unwrap();
        registry.get::<Leaf>("leaf").unwrap();
        assert_eq!(registry.check_health("svc").unwrap(), HealthStatus::Healthy);

        healthy.store(false, Ordering::SeqCst);
        let report = registry.health_status();
        assert_eq!(report["svc"], HealthStatus::Unhealthy);
        assert_eq!(report["leaf"], HealthStatus::Healthy);
    }

    #[test]
    fn validate_checks_graph_without_building() {
        let registry = ServiceRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        registry.register("a", RegisterOptions::default(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Leaf))
        });
        node(&registry, "b", &["a"]);
        assert!(registry.validate().is_ok());

        node(&registry, "c", &["d"]);
        assert!(matches!(
            registry.validate(),
            Err(RegistryError::MissingDependency { .. })
        ));

        node(&registry, "d", &["c"]);
        assert!(matches!(
            registry.validate(),
            Err(RegistryError::CircularDependency { .. })
        ));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn factory_receives_registry() {
        let registry = ServiceRegistry::new();
        registry
            .register("leaf", RegisterOptions::default(), |_, _| Ok(Arc::new(Leaf)))
            .register("lookup", RegisterOptions::default(), |deps, registry| {
                assert!(deps.is_empty());
                let _leaf: Arc<Leaf> = registry.get("leaf")?;
                Ok(Arc::new(Leaf))
            });
        assert!(registry.get::<Leaf>("lookup").is_ok());
    }
}
