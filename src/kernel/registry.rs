//! Module registry with dependency-ordered lifecycle.
//!
//! Modules are registered with a manifest naming the modules they require.
//! The registry resolves those edges into a topological order and drives
//! `init`/`start` along it, and `stop` along its exact reverse.
//!
//! The registry lock is never held across a module hook or an emission.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::recovery::with_recovery_async;
use super::types::{Module, ModuleInfo, ModuleManifest, ModuleStatus, StopReport};
use crate::eventbus::{topics, EventBus};
use crate::types::{Error, LifecyclePhase, Result};

/// Source recorded on registry events.
const REGISTRY_SOURCE: &str = "registry";

struct ModuleEntry {
    instance: Arc<dyn Module>,
    manifest: ModuleManifest,
    status: ModuleStatus,
    last_error: Option<String>,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    modules: HashMap<String, ModuleEntry>,
    /// Registration order; the DFS roots are visited in this order.
    order: Vec<String>,
    /// required id -> ids that require it
    dependents: HashMap<String, HashSet<String>>,
    resolved: Option<Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Gray,
    Black,
}

/// Registry of hosted modules.
pub struct ModuleRegistry {
    bus: Arc<EventBus>,
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ModuleRegistry")
            .field("modules", &state.order)
            .field("resolved", &state.resolved)
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a module under `id`.
    pub fn register(&self, id: &str, instance: Arc<dyn Module>, manifest: ModuleManifest) -> Result<()> {
        if id.is_empty() {
            return Err(Error::validation("module id cannot be empty"));
        }
        {
            let mut state = self.state.write();
            if state.modules.contains_key(id) {
                return Err(Error::DuplicateModule(id.to_string()));
            }
            for required in &manifest.requires {
                state
                    .dependents
                    .entry(required.clone())
                    .or_default()
                    .insert(id.to_string());
            }
            let now = Utc::now();
            state.modules.insert(
                id.to_string(),
                ModuleEntry {
                    instance,
                    manifest: manifest.clone(),
                    status: ModuleStatus::Registered,
                    last_error: None,
                    registered_at: now,
                    updated_at: now,
                },
            );
            state.order.push(id.to_string());
            state.resolved = None;
        }

        self.bus.register_module(id, manifest.rooms.iter().cloned());
        tracing::info!(
            "module_registered: module={}, version={}, requires={:?}",
            id,
            manifest.version,
            manifest.requires
        );
        self.emit(
            topics::MODULE_REGISTERED,
            json!({ "moduleId": id, "version": manifest.version }),
        );
        Ok(())
    }

    /// Remove a module. Refuses while another module requires it or while it runs.
    pub fn unregister(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let entry = state
                .modules
                .get(id)
                .ok_or_else(|| Error::not_found(format!("unknown module: {}", id)))?;
            if entry.status.is_running() {
                return Err(Error::state_transition(format!(
                    "cannot unregister module {}: status is {}",
                    id, entry.status
                )));
            }
            let requires = entry.manifest.requires.clone();

            let mut dependents: Vec<String> = state
                .dependents
                .get(id)
                .map(|deps| {
                    deps.iter()
                        .filter(|dep| state.modules.contains_key(*dep))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if !dependents.is_empty() {
                dependents.sort();
                return Err(Error::ModuleInUse {
                    module: id.to_string(),
                    dependents,
                });
            }

            state.modules.remove(id);
            state.order.retain(|m| m != id);
            for required in requires {
                if let Some(set) = state.dependents.get_mut(&required) {
                    set.remove(id);
                    if set.is_empty() {
                        state.dependents.remove(&required);
                    }
                }
            }
            state.resolved = None;
        }

        self.bus.unregister_module(id);
        tracing::info!("module_unregistered: module={}", id);
        self.emit(topics::MODULE_UNREGISTERED, json!({ "moduleId": id }));
        Ok(())
    }

    // =========================================================================
    // Dependency resolution
    // =========================================================================

    /// Resolve the dependency graph into a topological order.
    ///
    /// Dependencies always precede their dependents. Roots are visited in
    /// registration order, so independent modules keep that order.
    pub fn resolve_dependencies(&self) -> Result<Vec<String>> {
        let resolved = {
            let state = self.state.read();
            let mut marks: HashMap<&str, Mark> = HashMap::new();
            let mut path: Vec<&str> = Vec::new();
            let mut resolved = Vec::with_capacity(state.order.len());
            for id in &state.order {
                visit(&state, id, &mut marks, &mut path, &mut resolved)?;
            }
            resolved
        };
        tracing::debug!("dependencies_resolved: order={:?}", resolved);
        self.state.write().resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// Last successfully resolved order.
    pub fn resolved_order(&self) -> Option<Vec<String>> {
        self.state.read().resolved.clone()
    }

    // =========================================================================
    // Bulk lifecycle
    // =========================================================================

    /// Initialize every module in dependency order. Stops at the first failure.
    pub async fn initialize_modules(&self) -> Result<()> {
        let order = self.resolve_dependencies()?;
        for id in &order {
            self.init_module(id).await?;
        }
        tracing::info!("modules_initialized: count={}", order.len());
        Ok(())
    }

    /// Start every module in dependency order. Stops at the first failure.
    pub async fn start_modules(&self) -> Result<()> {
        let order = match self.resolved_order() {
            Some(order) => order,
            None => self.resolve_dependencies()?,
        };
        for id in &order {
            self.start_module(id).await?;
        }
        tracing::info!("modules_started: count={}", order.len());
        Ok(())
    }

    /// Stop every started module in reverse dependency order.
    ///
    /// Individual failures are collected and do not halt the sequence.
    pub async fn stop_modules(&self) -> StopReport {
        let order = match self.resolved_order() {
            Some(order) => order,
            None => match self.resolve_dependencies() {
                Ok(order) => order,
                Err(err) => {
                    tracing::warn!(
                        "stop_order_unresolved: error={}, falling back to registration order",
                        err
                    );
                    self.state.read().order.clone()
                }
            },
        };

        let mut report = StopReport::default();
        for id in order.iter().rev() {
            if self.status(id) != Some(ModuleStatus::Started) {
                continue;
            }
            match self.stop_module(id).await {
                Ok(()) => report.stopped.push(id.clone()),
                Err(err) => report.failures.push((id.clone(), err)),
            }
        }
        tracing::info!(
            "modules_stopped: stopped={}, failed={}",
            report.stopped.len(),
            report.failures.len()
        );
        report
    }

    // =========================================================================
    // Per-module lifecycle
    // =========================================================================

    /// Initialize one module. No-op if already initialized or further along.
    pub async fn init_module(&self, id: &str) -> Result<()> {
        let current = self.require_status(id)?;
        if matches!(
            current,
            ModuleStatus::Initializing
                | ModuleStatus::Initialized
                | ModuleStatus::Starting
                | ModuleStatus::Started
        ) {
            return Ok(());
        }
        if !current.can_initialize() {
            return Err(Error::state_transition(format!(
                "cannot initialize module {}: status is {}",
                id, current
            )));
        }

        let instance = self.transition(id, ModuleStatus::Initializing, None)?;
        match with_recovery_async(|| async move { instance.init().await }, "module init").await {
            Ok(()) => {
                self.transition(id, ModuleStatus::Initialized, None)?;
                tracing::info!("module_initialized: module={}", id);
                self.emit(topics::MODULE_INITIALIZED, json!({ "moduleId": id }));
                Ok(())
            }
            Err(err) => Err(self.fail(id, LifecyclePhase::Init, err)),
        }
    }

    /// Start one module. It must be initialized. No-op if already started.
    pub async fn start_module(&self, id: &str) -> Result<()> {
        let current = self.require_status(id)?;
        match current {
            ModuleStatus::Starting | ModuleStatus::Started => return Ok(()),
            ModuleStatus::Initialized => {}
            other => {
                return Err(Error::state_transition(format!(
                    "cannot start module {}: status is {}, expected initialized",
                    id, other
                )))
            }
        }

        let instance = self.transition(id, ModuleStatus::Starting, None)?;
        match with_recovery_async(|| async move { instance.start().await }, "module start").await {
            Ok(()) => {
                self.transition(id, ModuleStatus::Started, None)?;
                tracing::info!("module_started: module={}", id);
                self.emit(topics::MODULE_STARTED, json!({ "moduleId": id }));
                Ok(())
            }
            Err(err) => Err(self.fail(id, LifecyclePhase::Start, err)),
        }
    }

    /// Stop one module. No-op unless it is started.
    pub async fn stop_module(&self, id: &str) -> Result<()> {
        let current = self.require_status(id)?;
        if current != ModuleStatus::Started {
            return Ok(());
        }

        let instance = self.transition(id, ModuleStatus::Stopping, None)?;
        match with_recovery_async(|| async move { instance.stop().await }, "module stop").await {
            Ok(()) => {
                self.transition(id, ModuleStatus::Stopped, None)?;
                tracing::info!("module_stopped: module={}", id);
                self.emit(topics::MODULE_STOPPED, json!({ "moduleId": id }));
                Ok(())
            }
            Err(err) => Err(self.fail(id, LifecyclePhase::Stop, err)),
        }
    }

    fn fail(&self, id: &str, phase: LifecyclePhase, err: Error) -> Error {
        tracing::error!("module_lifecycle_failed: module={}, phase={}, error={}", id, phase, err);
        if let Err(transition_err) = self.transition(id, ModuleStatus::Error, Some(err.to_string())) {
            tracing::warn!("module_error_transition_failed: module={}, error={}", id, transition_err);
        }
        Error::lifecycle(id, phase, err)
    }

    /// Apply a status transition and emit `module:status-changed`.
    fn transition(&self, id: &str, to: ModuleStatus, error: Option<String>) -> Result<Arc<dyn Module>> {
        let (from, instance) = {
            let mut state = self.state.write();
            let entry = state
                .modules
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("unknown module: {}", id)))?;
            let from = entry.status;
            if !from.can_transition_to(to) {
                return Err(Error::state_transition(format!(
                    "module {}: invalid transition {} -> {}",
                    id, from, to
                )));
            }
            entry.status = to;
            entry.updated_at = Utc::now();
            if error.is_some() {
                entry.last_error = error.clone();
            }
            (from, Arc::clone(&entry.instance))
        };

        let mut payload = json!({ "moduleId": id, "from": from, "to": to });
        if let (Some(message), Value::Object(map)) = (error, &mut payload) {
            map.insert("error".to_string(), json!(message));
        }
        self.emit(topics::MODULE_STATUS_CHANGED, payload);
        Ok(instance)
    }

    fn emit(&self, event: &str, payload: Value) {
        let outcome = self.bus.emit_from(REGISTRY_SOURCE, event, payload);
        if let Some(trip) = outcome.trip() {
            tracing::debug!("registry_event_blocked: event={}, trip={:?}", event, trip);
        }
    }

    fn require_status(&self, id: &str) -> Result<ModuleStatus> {
        self.status(id)
            .ok_or_else(|| Error::not_found(format!("unknown module: {}", id)))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn status(&self, id: &str) -> Option<ModuleStatus> {
        self.state.read().modules.get(id).map(|e| e.status)
    }

    pub fn manifest(&self, id: &str) -> Option<ModuleManifest> {
        self.state.read().modules.get(id).map(|e| e.manifest.clone())
    }

    pub fn instance(&self, id: &str) -> Option<Arc<dyn Module>> {
        self.state
            .read()
            .modules
            .get(id)
            .map(|e| Arc::clone(&e.instance))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().modules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().modules.is_empty()
    }

    /// Module snapshots in registration order.
    pub fn list(&self) -> Vec<ModuleInfo> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| {
                state.modules.get(id).map(|e| ModuleInfo {
                    id: id.clone(),
                    manifest: e.manifest.clone(),
                    status: e.status,
                    last_error: e.last_error.clone(),
                    registered_at: e.registered_at,
                    updated_at: e.updated_at,
                })
            })
            .collect()
    }

    /// Registered modules that require `id`, sorted.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let state = self.state.read();
        let mut dependents: Vec<String> = state
            .dependents
            .get(id)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| state.modules.contains_key(*dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        dependents.sort();
        dependents
    }

    /// First module, in registration order, that provides `capability`.
    pub fn find_provider(&self, capability: &str) -> Option<String> {
        let state = self.state.read();
        state
            .order
            .iter()
            .find(|id| {
                state
                    .modules
                    .get(*id)
                    .map(|e| e.manifest.provides.iter().any(|p| p == capability))
                    .unwrap_or(false)
            })
            .cloned()
    }
}

/// Three-colour DFS post-order visit.
fn visit<'a>(
    state: &'a RegistryState,
    id: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    resolved: &mut Vec<String>,
) -> Result<()> {
    match marks.get(id) {
        Some(Mark::Black) => return Ok(()),
        Some(Mark::Gray) => {
            let start = path.iter().position(|m| *m == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|m| m.to_string()).collect();
            cycle.push(id.to_string());
            return Err(Error::DependencyCycle(cycle));
        }
        None => {}
    }

    let Some(entry) = state.modules.get(id) else {
        return Err(Error::not_found(format!("unknown module: {}", id)));
    };

    marks.insert(id, Mark::Gray);
    path.push(id);

    for required in &entry.manifest.requires {
        if !state.modules.contains_key(required) {
            return Err(Error::MissingDependency {
                module: id.to_string(),
                requires: required.clone(),
            });
        }
        visit(state, required, marks, path, resolved)?;
    }
    for optional in &entry.manifest.optional_requires {
        if state.modules.contains_key(optional) {
            visit(state, optional, marks, path, resolved)?;
        }
    }

    path.pop();
    marks.insert(id, Mark::Black);
    resolved.push(id.to_string());
    Ok(())
}
