//! The host side plugins talk to.
//!
//! [`HostCore`] owns the registry, the router, the persisted state and the
//! string tables. Every plugin gets its own [`HostFacade`], which carries
//! the plugin's guid and only a weak reference back to the core. No facade
//! method takes the update lock, so all of them are safe to call from
//! inside a frame.

use std::path::Path;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::actions::{ActionDispatcher, ActionPayload, InputAction};
use crate::error::{CrashCategory, PluginError, RoutingError};
use crate::loader::LoadedPlugin;
use crate::localization::{Localization, FALLBACK_LANGUAGE};
use crate::registry::{ManagedPlugin, PluginRegistry};
use crate::router::{ActionSource, InputActionRouter};
use crate::settings::SettingsStore;
use crate::tracker::{hook_joint, transform_joint, JointPose, JointRole, TrackerRole};

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strip control characters (except newline/tab) and truncate.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Requests the host handles outside the caller's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    RefreshRequested { guid: String },
    ExitRequested {
        guid: String,
        message: String,
        fatal: bool,
    },
}

// ─── Crash reporting ────────────────────────────────────────────────────

/// Receives fatal failures before the host exits.
pub trait CrashReporter: Send + Sync {
    fn report(&self, category: CrashCategory, plugin: Option<&str>, message: &str);
}

/// Crash reporter that only logs.
#[derive(Debug, Default)]
pub struct LogCrashReporter;

impl CrashReporter for LogCrashReporter {
    fn report(&self, category: CrashCategory, plugin: Option<&str>, message: &str) {
        tracing::error!(
            category = %category,
            plugin = plugin.unwrap_or("host"),
            "fatal failure: {message}"
        );
    }
}

// ─── Core ───────────────────────────────────────────────────────────────

pub struct HostCore {
    registry: Arc<PluginRegistry>,
    router: InputActionRouter,
    settings: Arc<SettingsStore>,
    localization: Localization,
    crash_reporter: Arc<dyn CrashReporter>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl HostCore {
    /// Build the core and restore persisted bindings. The receiver yields
    /// refresh and exit requests raised by plugins.
    pub fn new(
        settings: Arc<SettingsStore>,
        localization: Localization,
        crash_reporter: Arc<dyn CrashReporter>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(PluginRegistry::new());
        let router = InputActionRouter::new(Arc::clone(&registry));
        router.restore(settings.read(|state| state.bindings.clone()));

        let core = Arc::new(Self {
            registry,
            router,
            settings,
            localization,
            crash_reporter,
            events,
        });
        (core, receiver)
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &InputActionRouter {
        &self.router
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn localization(&self) -> &Localization {
        &self.localization
    }

    pub fn facade_for(self: &Arc<Self>, guid: &str) -> Arc<HostFacade> {
        Arc::new(HostFacade {
            guid: guid.to_string(),
            core: Arc::downgrade(self),
        })
    }

    /// Publish a loaded plugin with a facade of its own.
    pub fn publish(self: &Arc<Self>, loaded: LoadedPlugin) -> Result<Arc<ManagedPlugin>, PluginError> {
        let facade = self.facade_for(loaded.manifest.guid());
        self.registry.publish(loaded, facade)
    }

    // ── Poses ────────────────────────────────────────────────────────

    /// Head joint of `guid`, else its first joint, else identity.
    pub fn hook_joint_pose(&self, guid: &str, calibrated: bool) -> JointPose {
        let pose = hook_joint(&self.registry.tracked_joints_of(guid));
        self.calibrate(guid, pose, calibrated)
    }

    /// SpineWaist joint of `guid`, else its first joint, else identity.
    pub fn transform_joint_pose(&self, guid: &str, calibrated: bool) -> JointPose {
        let pose = transform_joint(&self.registry.tracked_joints_of(guid));
        self.calibrate(guid, pose, calibrated)
    }

    fn calibrate(&self, guid: &str, pose: JointPose, calibrated: bool) -> JointPose {
        if !calibrated {
            return pose;
        }
        self.settings
            .read(|state| state.calibration.frame(guid))
            .apply(pose)
    }

    // ── Bindings ─────────────────────────────────────────────────────

    /// Bind through the router and persist the binding table.
    pub fn bind(
        &self,
        endpoint: &str,
        role: TrackerRole,
        source: ActionSource,
        target: Option<&str>,
    ) -> Result<(), RoutingError> {
        self.router.bind(endpoint, role, source, target)?;
        self.persist_bindings();
        Ok(())
    }

    pub fn unbind(&self, endpoint: &str, role: TrackerRole, source: &ActionSource) -> bool {
        let removed = self.router.unbind(endpoint, role, source);
        if removed {
            self.persist_bindings();
        }
        removed
    }

    fn persist_bindings(&self) {
        let records = self.router.records();
        if let Err(e) = self.settings.update(|state| state.bindings = records) {
            tracing::error!("failed to persist bindings: {e}");
        }
    }

    /// Write the current selection into the host state.
    pub fn persist_selection(&self) -> Result<(), PluginError> {
        let selection = self.registry.selection();
        self.settings.update(|state| {
            state.base_device = selection.base_device.clone();
            state.override_devices = selection.overrides.clone();
            state.service_endpoint = selection.service_endpoint.clone();
        })
    }

    /// Disable a plugin now and on every later start.
    pub fn disable_plugin(&self, guid: &str) -> Result<(), PluginError> {
        let mut frame = self.registry.lock_frame()?;
        self.registry.disable(&mut frame, guid)?;
        drop(frame);

        self.localization.forget_plugin(guid);
        self.settings.update(|state| {
            state.disabled_plugins.insert(guid.to_string());
        })?;
        self.persist_selection()
    }

    /// Switch the interface language and remember it for the next start.
    /// Every plugin is asked to refresh its status interface.
    pub fn set_language(&self, language: &str) -> Result<(), PluginError> {
        self.localization.set_language(language);
        self.settings
            .update(|state| state.language = language.to_string())?;
        for plugin in self.registry.plugins() {
            self.send(HostEvent::RefreshRequested {
                guid: plugin.guid().to_string(),
            });
        }
        Ok(())
    }

    pub fn report_crash(&self, category: CrashCategory, plugin: Option<&str>, message: &str) {
        self.crash_reporter.report(category, plugin, message);
    }

    fn send(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("host event dropped, nobody is listening");
        }
    }
}

// ─── Facade ─────────────────────────────────────────────────────────────

/// A plugin's handle on the host.
pub struct HostFacade {
    guid: String,
    core: Weak<HostCore>,
}

impl std::fmt::Debug for HostFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFacade").field("guid", &self.guid).finish()
    }
}

impl HostFacade {
    pub fn guid(&self) -> &str {
        &self.guid
    }

    fn core(&self) -> Option<Arc<HostCore>> {
        self.core.upgrade()
    }

    pub fn log(&self, message: &str, severity: LogSeverity) {
        let msg = sanitize_log_message(message);
        match severity {
            LogSeverity::Info => tracing::info!(plugin = %self.guid, "{msg}"),
            LogSeverity::Warning => tracing::warn!(plugin = %self.guid, "{msg}"),
            LogSeverity::Error => tracing::error!(plugin = %self.guid, "{msg}"),
            LogSeverity::Fatal => tracing::error!(plugin = %self.guid, fatal = true, "{msg}"),
        }
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn setting(&self, key: &str) -> Option<Value> {
        self.core()?.settings.plugin_setting(&self.guid, key)
    }

    pub fn set_setting(&self, key: &str, value: Value) -> Result<(), PluginError> {
        let core = self
            .core()
            .ok_or_else(|| PluginError::ShutDown("host".into()))?;
        core.settings.set_plugin_setting(&self.guid, key, value)
    }

    // ── Localization ─────────────────────────────────────────────────

    pub fn language_code(&self) -> String {
        self.core()
            .map(|core| core.localization.language())
            .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string())
    }

    pub fn request_localized_string(&self, key: &str) -> String {
        self.core()
            .map(|core| core.localization.lookup(&self.guid, key))
            .unwrap_or_default()
    }

    pub fn set_localization_resources_root(&self, root: &Path) -> Result<(), PluginError> {
        let core = self
            .core()
            .ok_or_else(|| PluginError::ShutDown("host".into()))?;
        core.localization.set_plugin_root(&self.guid, root)
    }

    // ── Poses ────────────────────────────────────────────────────────

    /// Hook joint pose of the base device; identity without one.
    pub fn hook_joint_pose(&self, calibrated: bool) -> JointPose {
        self.core()
            .and_then(|core| {
                let base = core.registry.base_device()?;
                Some(core.hook_joint_pose(&base, calibrated))
            })
            .unwrap_or(JointPose::IDENTITY)
    }

    /// Transform joint pose of the base device; identity without one.
    pub fn transform_joint_pose(&self, calibrated: bool) -> JointPose {
        self.core()
            .and_then(|core| {
                let base = core.registry.base_device()?;
                Some(core.transform_joint_pose(&base, calibrated))
            })
            .unwrap_or(JointPose::IDENTITY)
    }

    /// Whether an enabled tracker is fed by `joint` of the base device.
    pub fn is_tracked_joint_valid(&self, joint: JointRole) -> bool {
        self.core().is_some_and(|core| {
            core.settings.read(|state| {
                state
                    .trackers
                    .iter()
                    .any(|slot| slot.enabled && slot.source_joint() == Some(joint))
            })
        })
    }

    // ── Host requests ────────────────────────────────────────────────

    pub fn refresh_status_interface(&self) {
        if let Some(core) = self.core() {
            core.send(HostEvent::RefreshRequested {
                guid: self.guid.clone(),
            });
        }
    }

    /// Ask the host to exit. A fatal exit is handed to the crash reporter
    /// before the request is queued.
    pub fn request_exit(&self, message: &str, fatal: bool) {
        let message = sanitize_log_message(message);
        let Some(core) = self.core() else {
            tracing::warn!(plugin = %self.guid, "exit requested after host shutdown");
            return;
        };
        if fatal {
            core.report_crash(CrashCategory::PluginFatal, Some(&self.guid), &message);
        }
        tracing::warn!(plugin = %self.guid, fatal, "plugin requested exit: {message}");
        core.send(HostEvent::ExitRequested {
            guid: self.guid.clone(),
            message,
            fatal,
        });
    }
}

impl ActionDispatcher for HostFacade {
    fn dispatch(&self, action: &dyn InputAction, payload: ActionPayload) {
        if let Some(core) = self.core() {
            core.router.dispatch(&self.guid, action, payload);
        }
    }

    fn is_action_used(&self, action: &dyn InputAction) -> bool {
        self.core()
            .is_some_and(|core| core.router.is_used(&self.guid, action.guid()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::calibration::CalibrationFrame;
    use crate::context::StaticContext;
    use crate::contract::TrackingDevice;
    use crate::loader::{LoaderConfig, PluginLoader};
    use crate::settings::HostState;
    use crate::tracker::TrackedJoint;
    use glam::{Quat, Vec3};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub reports: Mutex<Vec<(CrashCategory, Option<String>, String)>>,
    }

    impl CrashReporter for RecordingReporter {
        fn report(&self, category: CrashCategory, plugin: Option<&str>, message: &str) {
            self.reports.lock().unwrap().push((
                category,
                plugin.map(str::to_string),
                message.to_string(),
            ));
        }
    }

    pub(crate) fn test_core() -> (Arc<HostCore>, mpsc::UnboundedReceiver<HostEvent>) {
        HostCore::new(
            Arc::new(SettingsStore::in_memory(HostState::default())),
            Localization::new(None, "en"),
            Arc::new(LogCrashReporter),
        )
    }

    struct Skeleton {
        joints: Vec<TrackedJoint>,
    }

    impl TrackingDevice for Skeleton {
        fn tracked_joints(&self) -> Vec<TrackedJoint> {
            self.joints.clone()
        }

        fn is_initialized(&self) -> bool {
            true
        }

        fn initialize(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn update(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn shutdown(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn joint(role: JointRole, x: f32) -> TrackedJoint {
        let mut joint = TrackedJoint::new(format!("{role:?}"), role);
        joint.set_position(Vec3::new(x, 0.0, 0.0));
        joint
    }

    fn core_with_device(roles: &[(JointRole, f32)]) -> Arc<HostCore> {
        let (core, _events) = test_core();
        let joints: Vec<_> = roles.iter().map(|(role, x)| joint(*role, *x)).collect();
        let candidate = StaticContext::device("DEV", "Skeleton", move || Skeleton {
            joints: joints.clone(),
        });
        let loaded = PluginLoader::new(LoaderConfig::default(), BTreeSet::new())
            .load(candidate.into())
            .unwrap();
        core.publish(loaded).unwrap();

        let mut frame = core.registry().lock_frame().unwrap();
        core.registry().select_base_device(&mut frame, "DEV").unwrap();
        drop(frame);
        core
    }

    // ── Logging ──────────────────────────────────────────────────────

    #[test]
    fn test_sanitize_log_message() {
        assert_eq!(sanitize_log_message("ok\tline\n"), "ok\tline\n");
        assert_eq!(sanitize_log_message("bell\x07 cr\r"), "bell cr");
        let long = "x".repeat(MAX_LOG_MESSAGE_LEN + 10);
        assert!(sanitize_log_message(&long).ends_with("(truncated)"));
    }

    // ── Poses ────────────────────────────────────────────────────────

    #[test]
    fn test_hook_joint_prefers_head() {
        let core = core_with_device(&[
            (JointRole::Head, 1.0),
            (JointRole::SpineWaist, 2.0),
            (JointRole::FootLeft, 3.0),
        ]);
        assert_eq!(core.hook_joint_pose("DEV", false).position.x, 1.0);
        assert_eq!(core.transform_joint_pose("DEV", false).position.x, 2.0);
    }

    #[test]
    fn test_hook_joint_falls_back_to_first() {
        let core = core_with_device(&[(JointRole::SpineWaist, 2.0), (JointRole::FootLeft, 3.0)]);
        assert_eq!(core.hook_joint_pose("DEV", false).position.x, 2.0);
    }

    #[test]
    fn test_hook_joint_without_joints_is_identity() {
        let core = core_with_device(&[]);
        assert_eq!(core.hook_joint_pose("DEV", true), JointPose::IDENTITY);
        assert_eq!(core.hook_joint_pose("UNKNOWN", true), JointPose::IDENTITY);
    }

    #[test]
    fn test_uncalibrated_device_passes_through() {
        let core = core_with_device(&[(JointRole::Head, 4.0)]);
        assert_eq!(
            core.hook_joint_pose("DEV", true),
            core.hook_joint_pose("DEV", false)
        );
    }

    #[test]
    fn test_calibrated_hook_pose() {
        let core = core_with_device(&[(JointRole::Head, 2.0)]);
        core.settings()
            .update(|state| {
                state.calibration.set_frame(
                    "DEV",
                    CalibrationFrame {
                        origin: Vec3::X,
                        rotation: Quat::from_rotation_y(std::f32::consts::PI),
                        translation: Vec3::Y,
                    },
                )
            })
            .unwrap();

        let pose = core.hook_joint_pose("DEV", true);
        assert!(pose.position.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-5));

        let facade = core.facade_for("OTHER");
        assert!(facade.hook_joint_pose(true).position.abs_diff_eq(pose.position, 1e-6));
    }

    // ── Facade ───────────────────────────────────────────────────────

    #[test]
    fn test_facade_settings_are_namespaced() {
        let (core, _events) = test_core();
        let a = core.facade_for("A");
        let b = core.facade_for("B");
        a.set_setting("port", serde_json::json!(9000)).unwrap();
        assert_eq!(a.setting("port"), Some(serde_json::json!(9000)));
        assert_eq!(b.setting("port"), None);
    }

    #[test]
    fn test_facade_after_core_dropped() {
        let (core, _events) = test_core();
        let facade = core.facade_for("A");
        drop(core);
        assert_eq!(facade.setting("x"), None);
        assert!(facade.set_setting("x", Value::Null).is_err());
        assert_eq!(facade.language_code(), "en");
        assert_eq!(facade.hook_joint_pose(true), JointPose::IDENTITY);
        facade.refresh_status_interface();
    }

    #[test]
    fn test_tracked_joint_validity_follows_slots() {
        let (core, _events) = test_core();
        let facade = core.facade_for("A");
        let waist = TrackerRole::Waist.default_joint().unwrap();
        assert!(facade.is_tracked_joint_valid(waist));
        assert!(!facade.is_tracked_joint_valid(JointRole::ThumbLeft));
    }

    #[test]
    fn test_refresh_request_is_queued() {
        let (core, mut events) = test_core();
        core.facade_for("A").refresh_status_interface();
        assert_eq!(
            events.try_recv().unwrap(),
            HostEvent::RefreshRequested { guid: "A".into() }
        );
    }

    #[test]
    fn test_fatal_exit_reports_crash_first() {
        let reporter = Arc::new(RecordingReporter::default());
        let (core, mut events) = HostCore::new(
            Arc::new(SettingsStore::in_memory(HostState::default())),
            Localization::new(None, "en"),
            reporter.clone(),
        );
        core.facade_for("A").request_exit("sensor lost", true);

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, CrashCategory::PluginFatal);
        assert_eq!(reports[0].1.as_deref(), Some("A"));
        assert!(matches!(
            events.try_recv().unwrap(),
            HostEvent::ExitRequested { fatal: true, .. }
        ));
    }

    #[test]
    fn test_non_fatal_exit_skips_crash_reporter() {
        let reporter = Arc::new(RecordingReporter::default());
        let (core, mut events) = HostCore::new(
            Arc::new(SettingsStore::in_memory(HostState::default())),
            Localization::new(None, "en"),
            reporter.clone(),
        );
        core.facade_for("A").request_exit("bye", false);
        assert!(reporter.reports.lock().unwrap().is_empty());
        assert!(events.try_recv().is_ok());
    }
}
