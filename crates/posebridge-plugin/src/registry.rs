//! Plugin registry: published plugins, their lifecycle and the selection.
//!
//! A plugin becomes visible here only once its `on_load` hook succeeded.
//! Which device is the base, which devices override it and which endpoint
//! receives trackers is the selection. It can only change while holding a
//! [`FrameGuard`], and every change is published as an immutable snapshot
//! so readers never need the update lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::actions::{ActionDispatcher, ActionRegistry};
use crate::context::{PluginContext, PluginModule};
use crate::contract::{Capability, ServiceEndpoint, TrackingDevice};
use crate::error::{LoadStatus, PluginError};
use crate::frame::{FrameGuard, Selection, UpdateLock};
use crate::host::HostFacade;
use crate::loader::{CandidateModule, LoadedPlugin, PluginLoader};
use crate::manifest::{PluginKind, PluginManifest};
use crate::sync::{lock, read, write};
use crate::tracker::TrackedJoint;

// ─── Load state ─────────────────────────────────────────────────────────

/// Lifecycle state of a plugin.
///
/// `Discovered`, `Loading`, `Rejected` and a failed `on_load` hook are held
/// for candidates that never got published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Discovered,
    Loading,
    Loaded,
    Rejected(String),
    LoadFailed(String),
    Initialized,
    ShutdownFailed(String),
}

// ─── Managed plugin ─────────────────────────────────────────────────────

/// A published plugin together with its context and lifecycle state.
///
/// Lifecycle hooks and per-frame calls are serialised through one call
/// lock, so a shutdown waits for an update that is already running.
pub struct ManagedPlugin {
    manifest: PluginManifest,
    module: PluginModule,
    facade: Arc<HostFacade>,
    context: Mutex<Box<dyn PluginContext>>,
    state: RwLock<LoadState>,
    calls: Mutex<()>,
    retired: AtomicBool,
}

impl std::fmt::Debug for ManagedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedPlugin")
            .field("guid", &self.guid())
            .finish_non_exhaustive()
    }
}

impl ManagedPlugin {
    fn new(loaded: LoadedPlugin, facade: Arc<HostFacade>) -> Self {
        Self {
            manifest: loaded.manifest,
            module: loaded.module,
            facade,
            context: Mutex::new(loaded.context),
            state: RwLock::new(LoadState::Loaded),
            calls: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn guid(&self) -> &str {
        self.manifest.guid()
    }

    pub fn name(&self) -> &str {
        self.manifest.name()
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn kind(&self) -> PluginKind {
        self.module.kind()
    }

    pub fn module(&self) -> &PluginModule {
        &self.module
    }

    pub fn device(&self) -> Option<&Arc<dyn TrackingDevice>> {
        self.module.as_device()
    }

    pub fn endpoint(&self) -> Option<&Arc<dyn ServiceEndpoint>> {
        self.module.as_endpoint()
    }

    pub fn facade(&self) -> &Arc<HostFacade> {
        &self.facade
    }

    pub fn state(&self) -> LoadState {
        read(&self.state).clone()
    }

    pub fn is_initialized(&self) -> bool {
        *read(&self.state) == LoadState::Initialized
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match &self.module {
            PluginModule::Device(device) => device.capabilities().supports(capability),
            PluginModule::Endpoint(endpoint) => endpoint.capabilities().supports(capability),
        }
    }

    /// Initialize the plugin. Idempotent once initialized; a plugin whose
    /// initialization or shutdown failed before is not retried.
    pub fn initialize(&self) -> Result<(), PluginError> {
        let _calls = lock(&self.calls);
        if self.is_retired() {
            return Err(PluginError::ShutDown(self.guid().to_string()));
        }

        match self.state() {
            LoadState::Initialized => return Ok(()),
            LoadState::Loaded => {}
            other => {
                return Err(PluginError::Lifecycle(format!(
                    "plugin {} cannot be initialized from state {other:?}",
                    self.guid()
                )))
            }
        }

        let result = match &self.module {
            PluginModule::Device(device) => device.initialize(),
            PluginModule::Endpoint(endpoint) => endpoint.initialize(),
        };

        match result {
            Ok(()) => {
                *write(&self.state) = LoadState::Initialized;
                tracing::info!(plugin = %self.guid(), "plugin initialized");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                *write(&self.state) = LoadState::LoadFailed(reason.clone());
                tracing::error!(plugin = %self.guid(), "plugin initialization failed: {reason}");
                Err(PluginError::Lifecycle(reason))
            }
        }
    }

    /// Shut the plugin down. Waits for an in-flight call and does nothing
    /// when the plugin is not initialized.
    pub fn shutdown(&self) -> Result<(), PluginError> {
        let _calls = lock(&self.calls);
        if !self.is_initialized() {
            return Ok(());
        }

        let result = match &self.module {
            PluginModule::Device(device) => device.shutdown(),
            PluginModule::Endpoint(endpoint) => endpoint.shutdown(),
        };

        match result {
            Ok(()) => {
                *write(&self.state) = LoadState::Loaded;
                tracing::info!(plugin = %self.guid(), "plugin shut down");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                *write(&self.state) = LoadState::ShutdownFailed(reason.clone());
                tracing::error!(plugin = %self.guid(), "plugin shutdown failed: {reason}");
                Err(PluginError::Lifecycle(reason))
            }
        }
    }

    /// Shut down for good and release the load context. Later calls are refused.
    pub fn retire(&self) -> Result<(), PluginError> {
        let result = self.shutdown();
        if !self.retired.swap(true, Ordering::AcqRel) {
            lock(&self.context).unload();
        }
        result
    }

    /// Run `f` under the call lock, refusing when not initialized.
    pub fn call<R>(&self, f: impl FnOnce(&PluginModule) -> R) -> Result<R, PluginError> {
        let _calls = lock(&self.calls);
        if self.is_retired() {
            return Err(PluginError::ShutDown(self.guid().to_string()));
        }
        if !self.is_initialized() {
            return Err(PluginError::NotInitialized(self.guid().to_string()));
        }
        Ok(f(&self.module))
    }

    /// Per-frame device update.
    pub fn update(&self) -> Result<(), PluginError> {
        self.call(|module| match module {
            PluginModule::Device(device) => device.update(),
            PluginModule::Endpoint(_) => Ok(()),
        })?
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Central plugin registry.
pub struct PluginRegistry {
    /// Published plugins in publication order.
    plugins: RwLock<Vec<Arc<ManagedPlugin>>>,
    /// States of candidates that are not published.
    candidates: RwLock<HashMap<String, LoadState>>,
    update_lock: UpdateLock,
    selection: RwLock<Arc<Selection>>,
    /// Last joint list read from each device.
    joints: RwLock<HashMap<String, Arc<Vec<TrackedJoint>>>>,
    actions: Arc<ActionRegistry>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            candidates: RwLock::new(HashMap::new()),
            update_lock: UpdateLock::new(),
            selection: RwLock::new(Arc::new(Selection::default())),
            joints: RwLock::new(HashMap::new()),
            actions: Arc::new(ActionRegistry::new()),
        }
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    // ── Publication ──────────────────────────────────────────────────

    /// Run the plugin's `on_load` hook and, when it succeeds, make the
    /// plugin visible and declare its input actions.
    pub fn publish(
        &self,
        loaded: LoadedPlugin,
        facade: Arc<HostFacade>,
    ) -> Result<Arc<ManagedPlugin>, PluginError> {
        let guid = loaded.manifest.guid().to_string();
        if self.get(&guid).is_some() {
            return Err(PluginError::AlreadyExists(guid));
        }

        // The table is not held across `on_load`; the insert re-checks the guid.
        let hook = match &loaded.module {
            PluginModule::Device(device) => device.on_load(Arc::clone(&facade)),
            PluginModule::Endpoint(endpoint) => endpoint.on_load(Arc::clone(&facade)),
        };
        if let Err(e) = hook {
            let mut context = loaded.context;
            context.unload();
            tracing::error!(plugin = %guid, "on_load failed: {e}");
            let reason = format!("on_load failed: {e}");
            self.set_candidate_state(&guid, LoadState::LoadFailed(reason.clone()));
            return Err(PluginError::Lifecycle(reason));
        }

        let plugin = Arc::new(ManagedPlugin::new(loaded, facade));
        {
            let mut plugins = write(&self.plugins);
            if plugins.iter().any(|p| p.guid() == guid) {
                drop(plugins);
                lock(&plugin.context).unload();
                return Err(PluginError::AlreadyExists(guid));
            }
            plugins.push(Arc::clone(&plugin));
        }
        write(&self.candidates).remove(&guid);
        self.refresh(&guid);

        tracing::info!(
            plugin = %guid,
            name = %plugin.name(),
            kind = plugin.kind().label(),
            "plugin published"
        );
        Ok(plugin)
    }

    pub fn get(&self, guid: &str) -> Option<Arc<ManagedPlugin>> {
        read(&self.plugins).iter().find(|p| p.guid() == guid).cloned()
    }

    pub fn plugins(&self) -> Vec<Arc<ManagedPlugin>> {
        read(&self.plugins).clone()
    }

    pub fn plugins_of_kind(&self, kind: PluginKind) -> Vec<Arc<ManagedPlugin>> {
        read(&self.plugins)
            .iter()
            .filter(|p| p.kind() == kind && !p.is_retired())
            .cloned()
            .collect()
    }

    /// State of a published plugin, or of a candidate that never made it.
    pub fn state_of(&self, guid: &str) -> Option<LoadState> {
        self.get(guid)
            .map(|p| p.state())
            .or_else(|| read(&self.candidates).get(guid).cloned())
    }

    // ── Candidates ───────────────────────────────────────────────────

    /// Load candidates in order through `loader`, tracking each one as
    /// `Discovered`, then `Loading`, then `Rejected` when the loader turns
    /// it down. Loaded plugins keep `Loading` until they are published.
    pub fn load_candidates(
        &self,
        loader: &PluginLoader,
        candidates: Vec<CandidateModule>,
    ) -> Vec<LoadedPlugin> {
        {
            let mut states = write(&self.candidates);
            for candidate in &candidates {
                let guid = candidate.manifest().guid();
                if self.get(guid).is_none() {
                    states.entry(guid.to_string()).or_insert(LoadState::Discovered);
                }
            }
        }

        // guids a plugin loaded in this pass already owns
        let mut owned = HashSet::new();
        let mut loaded = Vec::new();
        for candidate in candidates {
            let guid = candidate.manifest().guid().to_string();
            let taken = owned.contains(&guid) || self.get(&guid).is_some();
            if !taken {
                self.set_candidate_state(&guid, LoadState::Loading);
            }

            match loader.load(candidate) {
                Ok(plugin) => {
                    owned.insert(guid);
                    loaded.push(plugin);
                }
                Err(e) if taken && e.status == LoadStatus::BadOrDuplicateGuid => {
                    tracing::debug!(plugin = %guid, "duplicate candidate left the owner's state alone");
                }
                Err(e) => self.set_candidate_state(&guid, LoadState::Rejected(e.to_string())),
            }
        }
        loaded
    }

    fn set_candidate_state(&self, guid: &str, state: LoadState) {
        write(&self.candidates).insert(guid.to_string(), state);
    }

    fn expect_kind(&self, guid: &str, kind: PluginKind) -> Result<Arc<ManagedPlugin>, PluginError> {
        let plugin = self
            .get(guid)
            .ok_or_else(|| PluginError::NotFound(guid.to_string()))?;
        if plugin.kind() != kind {
            return Err(PluginError::WrongKind {
                guid: guid.to_string(),
                expected: kind.label(),
            });
        }
        Ok(plugin)
    }

    // ── Derived caches ───────────────────────────────────────────────

    /// Re-read the plugin's joints and re-declare its input actions.
    pub fn refresh(&self, guid: &str) {
        let Some(plugin) = self.get(guid) else {
            return;
        };

        match plugin.module() {
            PluginModule::Device(device) => {
                let joints = device.tracked_joints();
                let dispatcher: Arc<dyn ActionDispatcher> = plugin.facade().clone();
                let weak: Weak<dyn ActionDispatcher> = Arc::downgrade(&dispatcher);
                self.actions.declare_device(guid, &joints, &weak);
                write(&self.joints).insert(guid.to_string(), Arc::new(joints));
            }
            PluginModule::Endpoint(endpoint) => {
                self.actions
                    .declare_endpoint(guid, endpoint.supported_input_actions());
            }
        }
    }

    /// Re-read a device's joint list without touching its declarations.
    pub(crate) fn snapshot_joints(&self, guid: &str) {
        if let Some(device) = self.get(guid).as_ref().and_then(|p| p.device().cloned()) {
            write(&self.joints).insert(guid.to_string(), Arc::new(device.tracked_joints()));
        }
    }

    pub(crate) fn joint_snapshot(&self, guid: &str) -> Arc<Vec<TrackedJoint>> {
        read(&self.joints).get(guid).cloned().unwrap_or_default()
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// The selection as last published.
    pub fn selection(&self) -> Arc<Selection> {
        Arc::clone(&read(&self.selection))
    }

    pub fn base_device(&self) -> Option<String> {
        self.selection().base_device.clone()
    }

    pub fn is_base(&self, guid: &str) -> bool {
        self.selection().base_device.as_deref() == Some(guid)
    }

    pub fn is_override(&self, guid: &str) -> bool {
        self.selection().overrides.iter().any(|g| g == guid)
    }

    pub fn current_service_endpoint(&self) -> Option<String> {
        self.selection().service_endpoint.clone()
    }

    /// Copy of the device's joint list as of the last frame.
    pub fn tracked_joints_of(&self, guid: &str) -> Vec<TrackedJoint> {
        self.joint_snapshot(guid).as_ref().clone()
    }

    pub fn supports_capability(&self, guid: &str, capability: Capability) -> bool {
        self.get(guid).is_some_and(|p| p.supports(capability))
    }

    /// Ask a device to identify one of its joints, e.g. by blinking it.
    pub fn signal_joint(&self, guid: &str, joint_index: usize) -> Result<(), PluginError> {
        let plugin = self.expect_kind(guid, PluginKind::TrackingDevice)?;
        plugin.call(|module| {
            if let PluginModule::Device(device) = module {
                device.signal_joint(joint_index);
            }
        })
    }

    // ── Update lock ──────────────────────────────────────────────────

    /// Take the update lock. Fails instead of deadlocking when the calling
    /// thread already holds it.
    pub fn lock_frame(&self) -> Result<FrameGuard<'_>, PluginError> {
        self.update_lock.lock()
    }

    pub fn try_lock_frame(&self) -> Option<FrameGuard<'_>> {
        self.update_lock.try_lock()
    }

    fn check_guard(&self, frame: &FrameGuard<'_>) -> Result<(), PluginError> {
        if frame.belongs_to(&self.update_lock) {
            Ok(())
        } else {
            Err(PluginError::Lifecycle(
                "frame guard belongs to another registry".into(),
            ))
        }
    }

    fn publish_selection(&self, selection: Selection) {
        *write(&self.selection) = Arc::new(selection);
    }

    fn release_if_unused(&self, selection: &Selection, guid: &str) {
        if selection.holds(guid) {
            return;
        }
        if let Some(plugin) = self.get(guid) {
            if let Err(e) = plugin.shutdown() {
                tracing::warn!(plugin = %guid, "previous holder failed to shut down: {e}");
            }
        }
        self.refresh(guid);
    }

    // ── Selection ────────────────────────────────────────────────────

    /// Make `guid` the base device.
    pub fn select_base_device(
        &self,
        frame: &mut FrameGuard<'_>,
        guid: &str,
    ) -> Result<(), PluginError> {
        self.check_guard(frame)?;
        let plugin = self.expect_kind(guid, PluginKind::TrackingDevice)?;
        if frame.selection().base_device.as_deref() == Some(guid) {
            return Ok(());
        }

        plugin.initialize()?;

        let selection = frame.selection_mut();
        let previous = selection.base_device.replace(guid.to_string());
        selection.overrides.retain(|g| g != guid);
        let snapshot = selection.clone();

        if let Some(previous) = previous {
            self.release_if_unused(&snapshot, &previous);
        }
        self.refresh(guid);
        self.publish_selection(snapshot);

        tracing::info!(plugin = %guid, "base device selected");
        Ok(())
    }

    /// Add `guid` to the override devices.
    pub fn add_override(&self, frame: &mut FrameGuard<'_>, guid: &str) -> Result<(), PluginError> {
        self.check_guard(frame)?;
        let plugin = self.expect_kind(guid, PluginKind::TrackingDevice)?;
        let selection = frame.selection();
        if selection.base_device.as_deref() == Some(guid) {
            return Err(PluginError::AlreadyExists(format!(
                "{guid} is already the base device"
            )));
        }
        if selection.overrides.iter().any(|g| g == guid) {
            return Ok(());
        }

        plugin.initialize()?;

        let selection = frame.selection_mut();
        selection.overrides.push(guid.to_string());
        let snapshot = selection.clone();
        self.refresh(guid);
        self.publish_selection(snapshot);

        tracing::info!(plugin = %guid, "override device added");
        Ok(())
    }

    /// Remove `guid` from the override devices.
    pub fn remove_override(&self, frame: &mut FrameGuard<'_>, guid: &str) -> Result<(), PluginError> {
        self.check_guard(frame)?;
        let selection = frame.selection_mut();
        let before = selection.overrides.len();
        selection.overrides.retain(|g| g != guid);
        if selection.overrides.len() == before {
            return Ok(());
        }
        let snapshot = selection.clone();

        self.release_if_unused(&snapshot, guid);
        self.publish_selection(snapshot);

        tracing::info!(plugin = %guid, "override device removed");
        Ok(())
    }

    /// Make `guid` the active service endpoint.
    pub fn select_service_endpoint(
        &self,
        frame: &mut FrameGuard<'_>,
        guid: &str,
    ) -> Result<(), PluginError> {
        self.check_guard(frame)?;
        let plugin = self.expect_kind(guid, PluginKind::ServiceEndpoint)?;
        if frame.selection().service_endpoint.as_deref() == Some(guid) {
            return Ok(());
        }

        plugin.initialize()?;

        let selection = frame.selection_mut();
        let previous = selection.service_endpoint.replace(guid.to_string());
        let snapshot = selection.clone();

        if let Some(previous) = previous {
            self.release_if_unused(&snapshot, &previous);
        }
        self.refresh(guid);
        self.publish_selection(snapshot);

        tracing::info!(plugin = %guid, "service endpoint selected");
        Ok(())
    }

    /// Drop `guid` from every role, shut it down and release its context.
    pub fn disable(&self, frame: &mut FrameGuard<'_>, guid: &str) -> Result<(), PluginError> {
        self.check_guard(frame)?;
        let plugin = self
            .get(guid)
            .ok_or_else(|| PluginError::NotFound(guid.to_string()))?;

        let selection = frame.selection_mut();
        if selection.base_device.as_deref() == Some(guid) {
            selection.base_device = None;
        }
        if selection.service_endpoint.as_deref() == Some(guid) {
            selection.service_endpoint = None;
        }
        selection.overrides.retain(|g| g != guid);
        let snapshot = selection.clone();
        self.publish_selection(snapshot);

        self.actions.forget(guid);
        write(&self.joints).remove(guid);
        plugin.retire()
    }

    /// Shut every plugin down, newest first. Safe to call more than once.
    pub fn shutdown_all(&self) {
        let mut guard = match self.lock_frame() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("shutting down without the update lock: {e}");
                None
            }
        };
        if let Some(guard) = guard.as_mut() {
            *guard.selection_mut() = Selection::default();
        }
        self.publish_selection(Selection::default());

        for plugin in self.plugins().iter().rev() {
            if plugin.is_retired() {
                continue;
            }
            if let Err(e) = plugin.retire() {
                tracing::warn!(plugin = %plugin.guid(), "shutdown failed: {e}");
            }
        }
    }
}
