//! The two plugin capabilities: tracking devices and service endpoints.
//!
//! Both traits take `&self` everywhere; plugins keep their own interior
//! mutability. The host serialises lifecycle and per-frame calls per plugin,
//! but input action handlers may run on other threads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actions::{ActionPayload, InputActionTarget};
use crate::error::{PluginError, RoutingError};
use crate::host::HostFacade;
use crate::tracker::{JointPose, TrackedJoint, TrackerBase, TrackerRole, MANDATORY_TRACKER_ROLES};

// ─── Status ─────────────────────────────────────────────────────────────

/// Numeric status plus a three-line message (`title\ncode\ndescription`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub code: i32,
    pub message: String,
}

impl PluginStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Split the message into title, code name and description.
    pub fn parts(&self) -> (&str, &str, &str) {
        let mut lines = self.message.splitn(3, '\n');
        (
            lines.next().unwrap_or_default(),
            lines.next().unwrap_or_default(),
            lines.next().unwrap_or_default(),
        )
    }
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self {
            code: -1,
            message: "Not Defined\nE_NOT_DEFINED\nStatus message not defined!".to_string(),
        }
    }
}

/// Result of probing the endpoint's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: i32,
    pub message: String,
    /// Round trip in milliseconds.
    pub ping_ms: i64,
}

// ─── Capabilities ───────────────────────────────────────────────────────

/// Capability flags a tracking device reports once it is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    /// The device updates its joints on its own thread; the host never calls `update`.
    pub self_update: bool,
    pub flip_supported: bool,
    pub app_orientation_supported: bool,
    /// Joint physics come from the device instead of being derived by the host.
    pub physics_override: bool,
    pub blocks_position_filtering: bool,
    pub settings_supported: bool,
}

/// Capability flags a service endpoint reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointCapabilities {
    pub settings_supported: bool,
    pub restart_on_changes: bool,
    pub headset_pose_supported: bool,
}

/// A single capability that can be asked about through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SelfUpdate,
    FlipSupported,
    AppOrientationSupported,
    PhysicsOverride,
    BlocksPositionFiltering,
    SettingsSupported,
    RestartOnChanges,
    HeadsetPose,
}

impl DeviceCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::SelfUpdate => self.self_update,
            Capability::FlipSupported => self.flip_supported,
            Capability::AppOrientationSupported => self.app_orientation_supported,
            Capability::PhysicsOverride => self.physics_override,
            Capability::BlocksPositionFiltering => self.blocks_position_filtering,
            Capability::SettingsSupported => self.settings_supported,
            Capability::RestartOnChanges | Capability::HeadsetPose => false,
        }
    }
}

impl EndpointCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::SettingsSupported => self.settings_supported,
            Capability::RestartOnChanges => self.restart_on_changes,
            Capability::HeadsetPose => self.headset_pose_supported,
            _ => false,
        }
    }
}

// ─── Tracking device ────────────────────────────────────────────────────

/// A plugin that produces joint poses.
pub trait TrackingDevice: Send + Sync {
    /// Copy of the current joint list.
    fn tracked_joints(&self) -> Vec<TrackedJoint>;

    fn is_initialized(&self) -> bool;

    fn is_skeleton_tracked(&self) -> bool {
        true
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    fn status(&self) -> PluginStatus {
        PluginStatus::default()
    }

    /// Called once, right after the plugin is instantiated.
    fn on_load(&self, host: Arc<HostFacade>) -> Result<(), PluginError> {
        let _ = host;
        Ok(())
    }

    fn initialize(&self) -> Result<(), PluginError>;

    /// Refresh joint poses. Not called for self-updating devices.
    fn update(&self) -> Result<(), PluginError>;

    fn shutdown(&self) -> Result<(), PluginError>;

    /// Signal the joint at `joint_index`, e.g. flash a controller LED.
    fn signal_joint(&self, joint_index: usize) {
        let _ = joint_index;
    }
}

// ─── Service endpoint ───────────────────────────────────────────────────

/// A plugin that consumes composed trackers.
pub trait ServiceEndpoint: Send + Sync {
    fn status(&self) -> PluginStatus;

    fn capabilities(&self) -> EndpointCapabilities {
        EndpointCapabilities::default()
    }

    /// Tracker roles accepted on top of [`MANDATORY_TRACKER_ROLES`].
    fn additional_tracker_roles(&self) -> BTreeSet<TrackerRole> {
        BTreeSet::new()
    }

    /// Actions the endpoint can receive, per tracker role.
    fn supported_input_actions(&self) -> BTreeMap<TrackerRole, Vec<InputActionTarget>> {
        BTreeMap::new()
    }

    fn headset_pose(&self) -> Option<JointPose> {
        None
    }

    fn on_load(&self, host: Arc<HostFacade>) -> Result<(), PluginError> {
        let _ = host;
        Ok(())
    }

    fn initialize(&self) -> Result<(), PluginError>;

    fn shutdown(&self) -> Result<(), PluginError>;

    /// Called once per frame before poses are pushed.
    fn heartbeat(&self) {}

    /// Spawn or update trackers. Returns each tracker with a success flag.
    fn set_tracker_states(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)>;

    fn update_tracker_poses(&self, trackers: &[TrackerBase]) -> Vec<(TrackerBase, bool)>;

    fn test_connection(&self) -> ConnectionStatus;

    /// Deliver a routed action. The default hands the payload to the
    /// target's handler unchanged.
    fn process_key_input(
        &self,
        target: &InputActionTarget,
        payload: &ActionPayload,
        receiver: TrackerRole,
    ) -> Result<(), RoutingError> {
        target.invoke(payload, receiver)
    }
}

/// Every tracker role `endpoint` accepts, mandatory ones included.
pub fn supported_tracker_roles(endpoint: &dyn ServiceEndpoint) -> BTreeSet<TrackerRole> {
    let mut roles = endpoint.additional_tracker_roles();
    roles.extend(MANDATORY_TRACKER_ROLES);
    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_not_defined() {
        let status = PluginStatus::default();
        assert!(!status.is_ok());
        assert_eq!(
            status.parts(),
            ("Not Defined", "E_NOT_DEFINED", "Status message not defined!")
        );
    }

    #[test]
    fn test_status_parts_with_short_message() {
        let status = PluginStatus::ok("Success!");
        assert!(status.is_ok());
        assert_eq!(status.parts(), ("Success!", "", ""));
    }

    #[test]
    fn test_device_capability_lookup() {
        let caps = DeviceCapabilities {
            self_update: true,
            ..Default::default()
        };
        assert!(caps.supports(Capability::SelfUpdate));
        assert!(!caps.supports(Capability::PhysicsOverride));
        assert!(!caps.supports(Capability::HeadsetPose));
    }

    #[test]
    fn test_capabilities_deserialize_with_defaults() {
        let caps: DeviceCapabilities =
            serde_json::from_str(r#"{"flip_supported": true}"#).unwrap();
        assert!(caps.flip_supported);
        assert!(!caps.self_update);
    }
}
