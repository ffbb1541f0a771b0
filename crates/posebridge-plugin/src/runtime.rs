//! Host runtime: configuration, startup, the update thread and host events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::error::{CrashCategory, PluginError};
use crate::frame::ComposedTracker;
use crate::host::{CrashReporter, HostCore, HostEvent};
use crate::loader::{CandidateModule, LoaderConfig, PluginLoader};
use crate::localization::Localization;
use crate::manifest::PluginKind;
use crate::registry::PluginRegistry;
use crate::sandbox::SandboxConfig;
use crate::settings::SettingsStore;
use crate::tracker::{PhysicsEstimator, TrackerBase, TrackerRole, TrackingState};

/// Default update rate of the pose loop.
const DEFAULT_UPDATE_HZ: u32 = 60;

const INTERFACE_CHANNEL_CAPACITY: usize = 32;

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub plugin_dirs: Vec<PathBuf>,
    pub shared_dir: Option<PathBuf>,
    pub state_file: PathBuf,
    pub strings_dir: Option<PathBuf>,
    pub update_hz: u32,
    pub sandbox: SandboxConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: vec![PathBuf::from("plugins")],
            shared_dir: None,
            state_file: PathBuf::from("posebridge-state.json"),
            strings_dir: None,
            update_hz: DEFAULT_UPDATE_HZ,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            plugin_dirs: std::env::var_os("POSEBRIDGE_PLUGIN_DIRS")
                .map(|dirs| std::env::split_paths(&dirs).collect())
                .unwrap_or(defaults.plugin_dirs),
            shared_dir: std::env::var_os("POSEBRIDGE_SHARED_DIR").map(PathBuf::from),
            state_file: std::env::var_os("POSEBRIDGE_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            strings_dir: std::env::var_os("POSEBRIDGE_STRINGS_DIR").map(PathBuf::from),
            update_hz: std::env::var("POSEBRIDGE_UPDATE_HZ")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|hz| *hz > 0)
                .unwrap_or(defaults.update_hz),
            sandbox: SandboxConfig::from_env(),
        }
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.update_hz.max(1)))
    }
}

// ─── Update loop ────────────────────────────────────────────────────────

/// What one frame did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub devices_updated: usize,
    pub trackers: Vec<TrackerBase>,
    pub states_pushed: bool,
    pub poses_accepted: usize,
}

type StateKey = (String, TrackerRole, bool, TrackingState);

/// Per-frame work of the update thread.
pub struct UpdateLoop {
    core: Arc<HostCore>,
    physics: PhysicsEstimator,
    published: Option<Vec<StateKey>>,
}

impl UpdateLoop {
    pub fn new(core: Arc<HostCore>) -> Self {
        Self {
            core,
            physics: PhysicsEstimator::new(),
            published: None,
        }
    }

    /// Run one frame under the update lock.
    pub fn tick(&mut self) -> Result<FrameReport, PluginError> {
        let registry: &PluginRegistry = self.core.registry();
        let frame = registry.begin_frame()?;

        let devices_updated = frame.update_devices();
        let composed = self
            .core
            .settings()
            .read(|state| frame.compose(&state.trackers, &state.calibration));

        let trackers: Vec<TrackerBase> = composed
            .into_iter()
            .map(|ComposedTracker { mut tracker, timestamp }| {
                self.physics.fill(&mut tracker, timestamp);
                tracker
            })
            .collect();

        frame.heartbeat();

        let states: Vec<StateKey> = trackers
            .iter()
            .map(|t| (t.serial.clone(), t.role, t.connection_state, t.tracking_state))
            .collect();
        let mut states_pushed = false;
        if self.published.as_ref() != Some(&states) {
            if let Some(results) = frame.push_tracker_states(&trackers) {
                for (tracker, ok) in &results {
                    if !ok {
                        tracing::warn!(serial = %tracker.serial, "endpoint rejected tracker state");
                    }
                }
                self.published = Some(states);
                states_pushed = true;
            }
        }

        let poses_accepted = frame
            .push_poses(&trackers)
            .map(|results| results.iter().filter(|(_, ok)| *ok).count())
            .unwrap_or(0);

        Ok(FrameReport {
            devices_updated,
            trackers,
            states_pushed,
            poses_accepted,
        })
    }
}

fn spawn_update_thread(
    core: Arc<HostCore>,
    running: Arc<AtomicBool>,
    period: Duration,
) -> Result<JoinHandle<()>, PluginError> {
    let handle = thread::Builder::new()
        .name("posebridge-update".into())
        .spawn(move || {
            let mut update = UpdateLoop::new(core);
            while running.load(Ordering::Acquire) {
                let started = Instant::now();
                if let Err(e) = update.tick() {
                    tracing::warn!("update frame skipped: {e}");
                }
                thread::sleep(period.saturating_sub(started.elapsed()));
            }
            tracing::debug!("update thread stopped");
        })?;
    Ok(handle)
}

// ─── Runtime ────────────────────────────────────────────────────────────

/// Why the runtime stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    PluginRequested {
        guid: String,
        message: String,
        fatal: bool,
    },
    EventsClosed,
}

pub struct HostRuntime {
    config: HostConfig,
    core: Arc<HostCore>,
    loader: Arc<PluginLoader>,
    events: Option<mpsc::UnboundedReceiver<HostEvent>>,
    interface: broadcast::Sender<String>,
    running: Arc<AtomicBool>,
    update_thread: Option<JoinHandle<()>>,
}

impl HostRuntime {
    pub fn new(config: HostConfig, crash_reporter: Arc<dyn CrashReporter>) -> Result<Self, PluginError> {
        let settings = Arc::new(SettingsStore::load(&config.state_file)?);
        Self::with_settings(config, settings, crash_reporter)
    }

    pub fn with_settings(
        config: HostConfig,
        settings: Arc<SettingsStore>,
        crash_reporter: Arc<dyn CrashReporter>,
    ) -> Result<Self, PluginError> {
        let state = settings.snapshot();
        let localization = Localization::new(config.strings_dir.as_deref(), &state.language);
        let (core, events) = HostCore::new(settings, localization, crash_reporter);
        let loader = PluginLoader::new(
            LoaderConfig {
                sandbox: config.sandbox.clone(),
                shared_dir: config.shared_dir.clone(),
            },
            state.disabled_plugins,
        );
        let (interface, _) = broadcast::channel(INTERFACE_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            core,
            loader: Arc::new(loader),
            events: Some(events),
            interface,
            running: Arc::new(AtomicBool::new(false)),
            update_thread: None,
        })
    }

    pub fn core(&self) -> &Arc<HostCore> {
        &self.core
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Guids of plugins that asked for an interface refresh.
    pub fn subscribe_interface(&self) -> broadcast::Receiver<String> {
        self.interface.subscribe()
    }

    /// Load `builtin` plugins plus everything found in the plugin folders,
    /// publish them, restore the selection and start the update thread.
    pub async fn start(&mut self, builtin: Vec<CandidateModule>) -> Result<(), PluginError> {
        let loader = Arc::clone(&self.loader);
        let core = Arc::clone(&self.core);
        let roots = self.config.plugin_dirs.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut candidates = builtin;
            candidates.extend(loader.discover(&roots));
            core.registry().load_candidates(&loader, candidates)
        })
        .await
        .map_err(|e| PluginError::Lifecycle(format!("plugin loading task failed: {e}")))?;

        for plugin in loaded {
            let guid = plugin.manifest.guid().to_string();
            if let Err(e) = self.core.publish(plugin) {
                tracing::error!(plugin = %guid, "plugin not published: {e}");
            }
        }

        self.restore_selection()?;
        self.core.persist_selection()?;

        self.running.store(true, Ordering::Release);
        self.update_thread = Some(spawn_update_thread(
            Arc::clone(&self.core),
            Arc::clone(&self.running),
            self.config.frame_period(),
        )?);
        tracing::info!(hz = self.config.update_hz, "host runtime started");
        Ok(())
    }

    /// Select the saved base device, overrides and endpoint, falling back
    /// to the first plugin of each kind that initializes.
    pub fn restore_selection(&self) -> Result<(), PluginError> {
        let state = self.core.settings().snapshot();
        let registry = self.core.registry();
        let mut frame = registry.lock_frame()?;

        let devices = registry.plugins_of_kind(PluginKind::TrackingDevice);
        let base = state
            .base_device
            .iter()
            .map(String::as_str)
            .chain(devices.iter().map(|p| p.guid()))
            .find(|guid| match registry.select_base_device(&mut frame, guid) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(plugin = %guid, "cannot use as base device: {e}");
                    false
                }
            });
        if base.is_none() {
            drop(frame);
            return Err(self.no_provider("base device"));
        }

        for guid in &state.override_devices {
            if let Err(e) = registry.add_override(&mut frame, guid) {
                tracing::warn!(plugin = %guid, "override device not restored: {e}");
            }
        }

        let endpoints = registry.plugins_of_kind(PluginKind::ServiceEndpoint);
        let endpoint = state
            .service_endpoint
            .iter()
            .map(String::as_str)
            .chain(endpoints.iter().map(|p| p.guid()))
            .find(|guid| match registry.select_service_endpoint(&mut frame, guid) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(plugin = %guid, "cannot use as service endpoint: {e}");
                    false
                }
            });
        if endpoint.is_none() {
            drop(frame);
            return Err(self.no_provider("service endpoint"));
        }
        Ok(())
    }

    fn no_provider(&self, role: &'static str) -> PluginError {
        let message = format!("no plugin could be initialized as the {role}");
        self.core
            .report_crash(CrashCategory::NoDeviceForCriticalRole, None, &message);
        PluginError::NoProvider(role)
    }

    /// Handle one host event. Returns the exit reason for exit requests.
    pub fn handle_event(&self, event: HostEvent) -> Option<ExitReason> {
        match event {
            HostEvent::RefreshRequested { guid } => {
                let registry = self.core.registry();
                match registry.try_lock_frame() {
                    Some(guard) => {
                        registry.refresh(&guid);
                        drop(guard);
                    }
                    None => tracing::debug!(plugin = %guid, "frame in progress, caches kept"),
                }
                // no subscribers is fine
                let _ = self.interface.send(guid);
                None
            }
            HostEvent::ExitRequested {
                guid,
                message,
                fatal,
            } => Some(ExitReason::PluginRequested {
                guid,
                message,
                fatal,
            }),
        }
    }

    /// Process host events until a plugin asks the host to exit.
    pub async fn run(&mut self) -> Result<ExitReason, PluginError> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| PluginError::Lifecycle("runtime is already running".into()))?;
        while let Some(event) = events.recv().await {
            if let Some(reason) = self.handle_event(event) {
                return Ok(reason);
            }
        }
        Ok(ExitReason::EventsClosed)
    }

    /// Stop the update thread, shut every plugin down and save the state.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.update_thread.take() {
            if handle.join().is_err() {
                self.core
                    .report_crash(CrashCategory::HostFailure, None, "update thread panicked");
            }
        }
        self.core.registry().shutdown_all();
        if let Err(e) = self.core.settings().save() {
            tracing::error!("failed to save host state: {e}");
        }
        tracing::info!("host runtime stopped");
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}
