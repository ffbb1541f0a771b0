// Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use glam::{Quat, Vec3};
use posebridge_plugin::contract::{ConnectionStatus, PluginStatus};
use posebridge_plugin::error::CrashCategory;
use posebridge_plugin::{
    CandidateModule, CrashReporter, HostCore, HostEvent, HostState, InputActionTarget,
    JointRole, KeyInputAction, Localization, PluginError, PluginKind, PluginManifest,
    PluginModule, ServiceEndpoint, SettingsStore, StaticContext, TrackedJoint, TrackerBase,
    TrackerRole, TrackingDevice, TrackingState,
};
use tokio::sync::mpsc;

// ─── Devices ────────────────────────────────────────────────────────────

/// Device whose joints tests move by hand.
pub struct MockDevice {
    joints: Mutex<Vec<TrackedJoint>>,
    pub trigger: Arc<KeyInputAction<bool>>,
    pub fail_initialize: bool,
    pub updates: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockDevice {
    /// The trigger action hangs off the first joint.
    pub fn new(roles: &[JointRole]) -> Arc<Self> {
        Arc::new(Self::build(roles, false))
    }

    pub fn failing(roles: &[JointRole]) -> Arc<Self> {
        Arc::new(Self::build(roles, true))
    }

    fn build(roles: &[JointRole], fail_initialize: bool) -> Self {
        let trigger = Arc::new(KeyInputAction::<bool>::new("Trigger"));
        let joints = roles
            .iter()
            .enumerate()
            .map(|(i, role)| {
                let mut joint = TrackedJoint::new(format!("{role:?}"), *role);
                joint.tracking_state = TrackingState::Tracked;
                if i == 0 {
                    joint = joint.with_actions([trigger.clone().into()]);
                }
                joint
            })
            .collect();
        Self {
            joints: Mutex::new(joints),
            trigger,
            fail_initialize,
            updates: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn move_joint(&self, role: JointRole, position: Vec3) {
        if let Some(joint) = self.joints.lock().unwrap().iter_mut().find(|j| j.role == role) {
            joint.set_position(position);
        }
    }

    pub fn turn_joint(&self, role: JointRole, orientation: Quat) {
        if let Some(joint) = self.joints.lock().unwrap().iter_mut().find(|j| j.role == role) {
            joint.set_orientation(orientation);
        }
    }
}

impl TrackingDevice for MockDevice {
    fn tracked_joints(&self) -> Vec<TrackedJoint> {
        self.joints.lock().unwrap().clone()
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn initialize(&self) -> Result<(), PluginError> {
        if self.fail_initialize {
            return Err(PluginError::Lifecycle("device unplugged".into()));
        }
        Ok(())
    }

    fn update(&self) -> Result<(), PluginError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn device_candidate(guid: &str, device: Arc<MockDevice>) -> CandidateModule {
    let manifest = PluginManifest::in_process(guid, guid, PluginKind::TrackingDevice);
    StaticContext::new(manifest, move || Ok(PluginModule::Device(device.clone()))).into()
}

pub fn broken_candidate(guid: &str) -> CandidateModule {
    let manifest = PluginManifest::in_process(guid, guid, PluginKind::TrackingDevice);
    StaticContext::new(manifest, || {
        Err(PluginError::MissingDependency {
            plugin: "broken".into(),
            dependency: "driver.wasm".into(),
        })
    })
    .into()
}

// ─── Endpoints ──────────────────────────────────────────────────────────

pub type Received = Arc<Mutex<Vec<(TrackerRole, bool)>>>;

/// Endpoint recording everything it is sent. Accepts a boolean `GRAB`
/// action on both hands.
#[derive(Default)]
pub struct MockEndpoint {
    pub received: Received,
    pub states: Mutex<Vec<Vec<TrackerBase>>>,
    pub poses: Mutex<Vec<Vec<TrackerBase>>>,
    pub heartbeats: AtomicUsize,
    pub extra_roles: BTreeSet<TrackerRole>,
}

impl MockEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serving(roles: &[TrackerRole]) -> Arc<Self> {
        Arc::new(Self {
            extra_roles: roles.iter().copied().collect(),
            ..Self::default()
        })
    }

    pub fn last_poses(&self) -> Vec<TrackerBase> {
        self.poses.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl ServiceEndpoint for MockEndpoint {
    fn status(&self) -> PluginStatus {
        PluginStatus::ok("Success!")
    }

    fn additional_tracker_roles(&self) -> BTreeSet<TrackerRole> {
        self.extra_roles.clone()
    }

    fn supported_input_actions(&self) -> BTreeMap<TrackerRole, Vec<InputActionTarget>> {
        let grab = Arc::new(KeyInputAction::<bool>::with_guid("GRAB", "Grab"));
        let mut targets = BTreeMap::new();
        for role in [TrackerRole::LeftHand, TrackerRole::RightHand] {
            let received = self.received.clone();
            targets.insert(
                role,
                vec![InputActionTarget::new(grab.clone(), move |_, value: &bool, role| {
                    received.lock().unwrap().push((role, *value));
                })],
            );
        }
        targets
    }

    fn initialize(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    fn set_tracker_states(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)> {
        self.states.lock().unwrap().push(trackers.to_vec());
        trackers.iter().cloned().map(|t| (t, true)).collect()
    }

    fn update_tracker_poses(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)> {
        self.poses.lock().unwrap().push(trackers.to_vec());
        trackers.iter().cloned().map(|t| (t, true)).collect()
    }

    fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            status: 0,
            message: "connected".into(),
            ping_ms: 1,
        }
    }
}

pub fn endpoint_candidate(guid: &str, endpoint: Arc<MockEndpoint>) -> CandidateModule {
    let manifest = PluginManifest::in_process(guid, guid, PluginKind::ServiceEndpoint);
    StaticContext::new(manifest, move || Ok(PluginModule::Endpoint(endpoint.clone()))).into()
}

// ─── Host ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(CrashCategory, Option<String>, String)>>,
}

impl CrashReporter for RecordingReporter {
    fn report(&self, category: CrashCategory, plugin: Option<&str>, message: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((category, plugin.map(str::to_string), message.to_string()));
    }
}

pub fn test_core(state: HostState) -> (Arc<HostCore>, mpsc::UnboundedReceiver<HostEvent>) {
    HostCore::new(
        Arc::new(SettingsStore::in_memory(state)),
        Localization::new(None, "en"),
        Arc::new(RecordingReporter::default()),
    )
}
