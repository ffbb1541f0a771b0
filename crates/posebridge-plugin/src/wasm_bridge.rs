//! Adapters exposing WASM modules through the plugin contract.
//!
//! All calls exchange JSON. Vectors travel as `[x, y, z]` and quaternions
//! as `[x, y, z, w]`. Any response may carry `host_requests`, which are
//! executed through the plugin's host facade once the call has returned.
//! Actions declared by WASM plugins carry `serde_json::Value` payloads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use glam::{Quat, Vec3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::actions::{ActionHandle, InputAction, InputActionTarget, KeyInputAction};
use crate::contract::{
    ConnectionStatus, DeviceCapabilities, EndpointCapabilities, PluginStatus, ServiceEndpoint,
    TrackingDevice,
};
use crate::error::PluginError;
use crate::host::{HostFacade, LogSeverity};
use crate::sandbox::PluginSandbox;
use crate::sync::{lock, read, write};
use crate::tracker::{JointPose, JointRole, TrackedJoint, TrackerBase, TrackerRole, TrackingState};

// ─── Wire types ─────────────────────────────────────────────────────────

/// A host function request returned by a plugin.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HostRequest {
    function: String,
    #[serde(default)]
    args: Value,
}

/// Envelope shared by lifecycle responses.
#[derive(Debug, Default, Deserialize)]
struct PluginResponse {
    #[serde(default)]
    status: Option<PluginStatus>,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionDeclaration {
    guid: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    image: Option<String>,
}

impl ActionDeclaration {
    fn build(&self) -> KeyInputAction<Value> {
        let action = KeyInputAction::with_guid(&self.guid, &self.name)
            .with_description(&self.description);
        match &self.image {
            Some(image) => action.with_image(image),
            None => action,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JointDeclaration {
    name: String,
    role: JointRole,
    #[serde(default)]
    actions: Vec<ActionDeclaration>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceDescription {
    #[serde(default)]
    capabilities: DeviceCapabilities,
    #[serde(default)]
    joints: Vec<JointDeclaration>,
}

/// Pose of one declared joint, addressed by its declaration index.
#[derive(Debug, Clone, Deserialize)]
struct JointReport {
    index: usize,
    position: Vec3,
    orientation: Quat,
    #[serde(default)]
    tracking_state: TrackingState,
    #[serde(default)]
    velocity: Option<Vec3>,
    #[serde(default)]
    acceleration: Option<Vec3>,
    #[serde(default)]
    angular_velocity: Option<Vec3>,
    #[serde(default)]
    angular_acceleration: Option<Vec3>,
}

#[derive(Debug, Clone, Deserialize)]
struct FiredAction {
    action: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceFrame {
    #[serde(default)]
    joints: Vec<JointReport>,
    #[serde(default)]
    skeleton_tracked: Option<bool>,
    #[serde(default)]
    fired_actions: Vec<FiredAction>,
    #[serde(default)]
    status: Option<PluginStatus>,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

#[derive(Debug, Deserialize)]
struct RoleActions {
    tracker: TrackerRole,
    actions: Vec<ActionDeclaration>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointDescription {
    #[serde(default)]
    capabilities: EndpointCapabilities,
    #[serde(default)]
    additional_trackers: Vec<TrackerRole>,
    #[serde(default)]
    actions: Vec<RoleActions>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackerResults {
    #[serde(default)]
    results: Vec<bool>,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

#[derive(Debug, Default, Deserialize)]
struct HeadsetResponse {
    #[serde(default)]
    pose: Option<JointPose>,
}

#[derive(Debug, Serialize)]
struct KeyInputEnvelope<'a> {
    action: &'a str,
    data: &'a Value,
    receiver: TrackerRole,
}

// ─── Shared helpers ─────────────────────────────────────────────────────

type SharedSandbox = Arc<Mutex<PluginSandbox>>;
type HostSlot = Arc<OnceLock<Arc<HostFacade>>>;

/// Call `function` if the module exports it; missing functions behave like
/// an empty response. The sandbox lock is released before returning.
fn invoke<I: Serialize, O: DeserializeOwned + Default>(
    sandbox: &Mutex<PluginSandbox>,
    function: &str,
    input: &I,
) -> Result<O, PluginError> {
    let mut sandbox = lock(sandbox);
    if !sandbox.has_function(function) {
        return Ok(O::default());
    }
    sandbox.call_json(function, input)
}

/// Execute host requests on behalf of a plugin.
pub(crate) fn process_host_requests(host: Option<&HostFacade>, requests: Vec<HostRequest>) {
    let Some(host) = host else {
        if !requests.is_empty() {
            tracing::warn!(count = requests.len(), "host requests before on_load, ignoring");
        }
        return;
    };

    for req in requests {
        let text = |field: &str| req.args[field].as_str().unwrap_or_default().to_string();
        let result = match req.function.as_str() {
            "log_info" => {
                host.log(&text("message"), LogSeverity::Info);
                Ok(())
            }
            "log_warn" => {
                host.log(&text("message"), LogSeverity::Warning);
                Ok(())
            }
            "log_error" => {
                host.log(&text("message"), LogSeverity::Error);
                Ok(())
            }
            "set_setting" => host.set_setting(&text("key"), req.args["value"].clone()),
            "refresh_status_interface" => {
                host.refresh_status_interface();
                Ok(())
            }
            "request_exit" => {
                host.request_exit(&text("message"), req.args["fatal"].as_bool().unwrap_or(false));
                Ok(())
            }
            other => {
                tracing::warn!(
                    plugin = %host.guid(),
                    function = %other,
                    "unknown host function request, ignoring"
                );
                continue;
            }
        };

        if let Err(e) = result {
            tracing::error!(
                plugin = %host.guid(),
                function = %req.function,
                "host function request failed: {e}"
            );
        }
    }
}

fn apply_reports(joints: &mut [TrackedJoint], reports: Vec<JointReport>) {
    for report in reports {
        let Some(joint) = joints.get_mut(report.index) else {
            tracing::trace!(index = report.index, "pose for undeclared joint dropped");
            continue;
        };
        joint.set_pose(JointPose::new(report.position, report.orientation));
        joint.tracking_state = report.tracking_state;
        joint.velocity = report.velocity;
        joint.acceleration = report.acceleration;
        joint.angular_velocity = report.angular_velocity;
        joint.angular_acceleration = report.angular_acceleration;
    }
}

fn zip_results(trackers: &[TrackerBase], results: Vec<bool>) -> Vec<(TrackerBase, bool)> {
    trackers
        .iter()
        .cloned()
        .zip(results.into_iter().chain(std::iter::repeat(false)))
        .collect()
}

// ─── Tracking device ────────────────────────────────────────────────────

/// A tracking device implemented by a WASM module.
pub struct WasmTrackingDevice {
    guid: String,
    sandbox: SharedSandbox,
    capabilities: DeviceCapabilities,
    joints: RwLock<Vec<TrackedJoint>>,
    actions: HashMap<String, Arc<KeyInputAction<Value>>>,
    status: RwLock<PluginStatus>,
    initialized: AtomicBool,
    skeleton_tracked: AtomicBool,
    host: HostSlot,
}

impl WasmTrackingDevice {
    /// Ask the module to describe itself and build the joint list.
    pub fn new(guid: &str, sandbox: PluginSandbox) -> Result<Self, PluginError> {
        let sandbox = Arc::new(Mutex::new(sandbox));
        let description: DeviceDescription = invoke(&sandbox, "device_describe", &())?;

        let mut actions = HashMap::new();
        let joints = description
            .joints
            .into_iter()
            .map(|decl| {
                let handles: Vec<ActionHandle> = decl
                    .actions
                    .iter()
                    .map(|action| {
                        let action = Arc::new(action.build());
                        actions.insert(action.guid().to_string(), Arc::clone(&action));
                        ActionHandle::from(action)
                    })
                    .collect();
                TrackedJoint::new(decl.name, decl.role).with_actions(handles)
            })
            .collect();

        Ok(Self {
            guid: guid.to_string(),
            sandbox,
            capabilities: description.capabilities,
            joints: RwLock::new(joints),
            actions,
            status: RwLock::new(PluginStatus::default()),
            initialized: AtomicBool::new(false),
            skeleton_tracked: AtomicBool::new(false),
            host: Arc::new(OnceLock::new()),
        })
    }

    fn lifecycle(&self, function: &str) -> Result<(), PluginError> {
        let response: PluginResponse = invoke(&self.sandbox, function, &())?;
        if let Some(status) = response.status {
            *write(&self.status) = status;
        }
        process_host_requests(self.host.get().map(Arc::as_ref), response.host_requests);
        Ok(())
    }
}

impl TrackingDevice for WasmTrackingDevice {
    fn tracked_joints(&self) -> Vec<TrackedJoint> {
        read(&self.joints).clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_skeleton_tracked(&self) -> bool {
        self.skeleton_tracked.load(Ordering::Acquire)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn status(&self) -> PluginStatus {
        read(&self.status).clone()
    }

    fn on_load(&self, host: Arc<HostFacade>) -> Result<(), PluginError> {
        let _ = self.host.set(host);
        Ok(())
    }

    fn initialize(&self) -> Result<(), PluginError> {
        self.lifecycle("device_initialize")?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn update(&self) -> Result<(), PluginError> {
        let frame: DeviceFrame = invoke(&self.sandbox, "device_update", &())?;

        apply_reports(&mut write(&self.joints), frame.joints);
        if let Some(tracked) = frame.skeleton_tracked {
            self.skeleton_tracked.store(tracked, Ordering::Release);
        }
        if let Some(status) = frame.status {
            *write(&self.status) = status;
        }

        for fired in frame.fired_actions {
            match self.actions.get(&fired.action) {
                Some(action) => action.invoke(fired.data),
                None => tracing::warn!(
                    plugin = %self.guid,
                    action = %fired.action,
                    "plugin fired an undeclared action"
                ),
            }
        }

        process_host_requests(self.host.get().map(Arc::as_ref), frame.host_requests);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        self.initialized.store(false, Ordering::Release);
        self.lifecycle("device_shutdown")
    }

    fn signal_joint(&self, joint_index: usize) {
        if let Err(e) = invoke::<_, PluginResponse>(&self.sandbox, "device_signal_joint", &joint_index) {
            tracing::warn!(plugin = %self.guid, "signal_joint failed: {e}");
        }
    }
}

// ─── Service endpoint ───────────────────────────────────────────────────

/// A service endpoint implemented by a WASM module.
pub struct WasmServiceEndpoint {
    guid: String,
    sandbox: SharedSandbox,
    capabilities: EndpointCapabilities,
    additional_trackers: BTreeSet<TrackerRole>,
    targets: BTreeMap<TrackerRole, Vec<InputActionTarget>>,
    status: RwLock<PluginStatus>,
    host: HostSlot,
}

impl WasmServiceEndpoint {
    pub fn new(guid: &str, sandbox: PluginSandbox) -> Result<Self, PluginError> {
        let sandbox = Arc::new(Mutex::new(sandbox));
        let host: HostSlot = Arc::new(OnceLock::new());
        let description: EndpointDescription = invoke(&sandbox, "endpoint_describe", &())?;

        let mut targets: BTreeMap<TrackerRole, Vec<InputActionTarget>> = BTreeMap::new();
        for role_actions in description.actions {
            let entry = targets.entry(role_actions.tracker).or_default();
            for decl in role_actions.actions {
                entry.push(key_input_target(guid, &decl, &sandbox, &host));
            }
        }

        Ok(Self {
            guid: guid.to_string(),
            sandbox,
            capabilities: description.capabilities,
            additional_trackers: description.additional_trackers.into_iter().collect(),
            targets,
            status: RwLock::new(PluginStatus::default()),
            host,
        })
    }

    fn host(&self) -> Option<&HostFacade> {
        self.host.get().map(Arc::as_ref)
    }

    fn push_trackers(&self, function: &str, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)> {
        match invoke::<_, TrackerResults>(&self.sandbox, function, &trackers) {
            Ok(response) => {
                process_host_requests(self.host(), response.host_requests);
                zip_results(trackers, response.results)
            }
            Err(e) => {
                tracing::warn!(plugin = %self.guid, function = %function, "tracker push failed: {e}");
                zip_results(trackers, Vec::new())
            }
        }
    }

    fn lifecycle(&self, function: &str) -> Result<(), PluginError> {
        let response: PluginResponse = invoke(&self.sandbox, function, &())?;
        if let Some(status) = response.status {
            *write(&self.status) = status;
        }
        process_host_requests(self.host(), response.host_requests);
        Ok(())
    }
}

fn key_input_target(
    endpoint: &str,
    decl: &ActionDeclaration,
    sandbox: &SharedSandbox,
    host: &HostSlot,
) -> InputActionTarget {
    let sandbox = Arc::clone(sandbox);
    let host = Arc::clone(host);
    let endpoint = endpoint.to_string();
    InputActionTarget::new(
        Arc::new(decl.build()),
        move |action: &KeyInputAction<Value>, data: &Value, receiver: TrackerRole| {
            let guid = action.guid().to_string();
            let envelope = KeyInputEnvelope {
                action: &guid,
                data,
                receiver,
            };
            match invoke::<_, PluginResponse>(&sandbox, "endpoint_process_key_input", &envelope) {
                Ok(response) => {
                    process_host_requests(host.get().map(Arc::as_ref), response.host_requests)
                }
                Err(e) => tracing::warn!(
                    plugin = %endpoint,
                    action = %guid,
                    "key input handler failed: {e}"
                ),
            }
        },
    )
}

impl ServiceEndpoint for WasmServiceEndpoint {
    fn status(&self) -> PluginStatus {
        read(&self.status).clone()
    }

    fn capabilities(&self) -> EndpointCapabilities {
        self.capabilities
    }

    fn additional_tracker_roles(&self) -> BTreeSet<TrackerRole> {
        self.additional_trackers.clone()
    }

    fn supported_input_actions(&self) -> BTreeMap<TrackerRole, Vec<InputActionTarget>> {
        self.targets.clone()
    }

    fn headset_pose(&self) -> Option<JointPose> {
        if !self.capabilities.headset_pose_supported {
            return None;
        }
        invoke::<_, HeadsetResponse>(&self.sandbox, "endpoint_headset_pose", &())
            .map_err(|e| tracing::debug!(plugin = %self.guid, "headset pose unavailable: {e}"))
            .ok()
            .and_then(|response| response.pose)
    }

    fn on_load(&self, host: Arc<HostFacade>) -> Result<(), PluginError> {
        let _ = self.host.set(host);
        Ok(())
    }

    fn initialize(&self) -> Result<(), PluginError> {
        self.lifecycle("endpoint_initialize")
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        self.lifecycle("endpoint_shutdown")
    }

    fn heartbeat(&self) {
        if let Err(e) = self.lifecycle("endpoint_heartbeat") {
            tracing::debug!(plugin = %self.guid, "heartbeat failed: {e}");
        }
    }

    fn set_tracker_states(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)> {
        self.push_trackers("endpoint_set_tracker_states", trackers)
    }

    fn update_tracker_poses(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)> {
        self.push_trackers("endpoint_update_tracker_poses", trackers)
    }

    fn test_connection(&self) -> ConnectionStatus {
        let started = std::time::Instant::now();
        match invoke::<_, Option<ConnectionStatus>>(&self.sandbox, "endpoint_test_connection", &()) {
            Ok(Some(status)) => status,
            Ok(None) => ConnectionStatus {
                status: -1,
                message: "endpoint does not implement connection tests".into(),
                ping_ms: 0,
            },
            Err(e) => ConnectionStatus {
                status: -1,
                message: e.to_string(),
                ping_ms: started.elapsed().as_millis() as i64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_description_parsing() {
        let json = r#"{
            "capabilities": {"self_update": true},
            "joints": [
                {"name": "Head", "role": "head"},
                {"name": "Left hand", "role": "hand_left",
                 "actions": [{"guid": "A1", "name": "Trigger"}]}
            ]
        }"#;
        let description: DeviceDescription = serde_json::from_str(json).unwrap();
        assert!(description.capabilities.self_update);
        assert_eq!(description.joints.len(), 2);
        assert_eq!(description.joints[1].role, JointRole::HandLeft);
        assert_eq!(description.joints[1].actions[0].guid, "A1");
    }

    #[test]
    fn test_device_frame_parsing() {
        let json = r#"{
            "joints": [{"index": 0, "position": [1.0, 2.0, 3.0],
                        "orientation": [0.0, 0.0, 0.0, 1.0], "tracking_state": "tracked"}],
            "fired_actions": [{"action": "A1", "data": true}],
            "host_requests": [{"function": "log_info", "args": {"message": "hi"}}]
        }"#;
        let frame: DeviceFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.joints[0].position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(frame.joints[0].tracking_state, TrackingState::Tracked);
        assert_eq!(frame.fired_actions[0].data, Value::Bool(true));
        assert_eq!(frame.host_requests[0].function, "log_info");
    }

    #[test]
    fn test_apply_reports_updates_declared_joints_only() {
        let mut joints = vec![TrackedJoint::new("Head", JointRole::Head)];
        let reports: Vec<JointReport> = serde_json::from_str(
            r#"[{"index": 0, "position": [0.0, 1.7, 0.0], "orientation": [0.0, 0.0, 0.0, 1.0]},
                {"index": 4, "position": [9.0, 9.0, 9.0], "orientation": [0.0, 0.0, 0.0, 1.0]}]"#,
        )
        .unwrap();
        apply_reports(&mut joints, reports);
        assert_eq!(joints[0].position(), Vec3::new(0.0, 1.7, 0.0));
        assert!(joints[0].pose_timestamp() > 0);
    }

    #[test]
    fn test_endpoint_description_parsing() {
        let json = r#"{
            "additional_trackers": ["left_knee", "chest"],
            "actions": [{"tracker": "left_hand",
                         "actions": [{"guid": "T1", "name": "Menu"}]}]
        }"#;
        let description: EndpointDescription = serde_json::from_str(json).unwrap();
        assert_eq!(
            description.additional_trackers,
            vec![TrackerRole::LeftKnee, TrackerRole::Chest]
        );
        assert_eq!(description.actions[0].tracker, TrackerRole::LeftHand);
    }

    #[test]
    fn test_zip_results_pads_missing_flags() {
        let trackers = vec![
            TrackerBase::new("A", TrackerRole::Waist),
            TrackerBase::new("B", TrackerRole::LeftFoot),
        ];
        let zipped = zip_results(&trackers, vec![true]);
        assert_eq!(zipped.len(), 2);
        assert!(zipped[0].1);
        assert!(!zipped[1].1);
    }

    #[test]
    fn test_host_requests_without_host_are_dropped() {
        let requests: Vec<HostRequest> =
            serde_json::from_str(r#"[{"function": "log_info", "args": {"message": "x"}}]"#)
                .unwrap();
        process_host_requests(None, requests);
    }
}
