//! The update lock, the selection it protects, and per-frame composition.

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationFrame, CalibrationStore};
use crate::context::PluginModule;
use crate::contract::{supported_tracker_roles, Capability, ServiceEndpoint};
use crate::error::PluginError;
use crate::registry::PluginRegistry;
use crate::sync::lock;
use crate::tracker::{
    JointRole, TrackedJoint, TrackerBase, TrackerRole, MANDATORY_TRACKER_ROLES,
};

// ─── Selection ──────────────────────────────────────────────────────────

/// Which plugins currently fill the host's roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub base_device: Option<String>,
    #[serde(default)]
    pub overrides: Vec<String>,
    pub service_endpoint: Option<String>,
}

impl Selection {
    /// Whether `guid` fills any role.
    pub fn holds(&self, guid: &str) -> bool {
        self.base_device.as_deref() == Some(guid)
            || self.service_endpoint.as_deref() == Some(guid)
            || self.overrides.iter().any(|g| g == guid)
    }

    /// Devices updated each frame, base first.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.base_device
            .as_deref()
            .into_iter()
            .chain(self.overrides.iter().map(String::as_str))
    }
}

// ─── Update lock ────────────────────────────────────────────────────────

/// Lock held for a whole update frame and for every selection change.
///
/// Records its owner thread so a plugin calling back into the host from
/// inside a frame gets an error instead of a deadlock.
pub struct UpdateLock {
    selection: Mutex<Selection>,
    owner: Mutex<Option<ThreadId>>,
}

impl Default for UpdateLock {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateLock {
    pub fn new() -> Self {
        Self {
            selection: Mutex::new(Selection::default()),
            owner: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> Result<FrameGuard<'_>, PluginError> {
        if self.held_by_current_thread() {
            return Err(PluginError::Reentrant);
        }
        let selection = lock(&self.selection);
        Ok(self.guard(selection))
    }

    /// `None` when another frame is in progress or the caller already holds it.
    pub fn try_lock(&self) -> Option<FrameGuard<'_>> {
        if self.held_by_current_thread() {
            return None;
        }
        let selection = match self.selection.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(self.guard(selection))
    }

    pub fn held_by_current_thread(&self) -> bool {
        *lock(&self.owner) == Some(thread::current().id())
    }

    fn guard<'a>(&'a self, selection: MutexGuard<'a, Selection>) -> FrameGuard<'a> {
        *lock(&self.owner) = Some(thread::current().id());
        FrameGuard {
            lock: self,
            selection,
        }
    }
}

/// Proof that the update lock is held.
pub struct FrameGuard<'a> {
    lock: &'a UpdateLock,
    selection: MutexGuard<'a, Selection>,
}

impl FrameGuard<'_> {
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub(crate) fn selection_mut(&mut self) -> &mut Selection {
        &mut self.selection
    }

    pub(crate) fn belongs_to(&self, lock: &UpdateLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.lock.owner) = None;
    }
}

// ─── Tracker slots ──────────────────────────────────────────────────────

fn enabled() -> bool {
    true
}

/// Host-side configuration of one tracker sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSlot {
    pub serial: String,
    pub role: TrackerRole,
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Base device joint feeding this tracker; the role's default when unset.
    #[serde(default)]
    pub joint: Option<JointRole>,
    #[serde(default)]
    pub override_device: Option<String>,
    #[serde(default)]
    pub override_joint: Option<JointRole>,
    #[serde(default)]
    pub override_position: bool,
    #[serde(default)]
    pub override_orientation: bool,
}

impl TrackerSlot {
    pub fn new(role: TrackerRole) -> Self {
        Self {
            serial: role.default_serial(),
            role,
            enabled: true,
            joint: None,
            override_device: None,
            override_joint: None,
            override_position: false,
            override_orientation: false,
        }
    }

    /// The trackers every host starts with.
    pub fn defaults() -> Vec<Self> {
        MANDATORY_TRACKER_ROLES.iter().copied().map(Self::new).collect()
    }

    pub fn source_joint(&self) -> Option<JointRole> {
        self.joint.or_else(|| self.role.default_joint())
    }

    /// Route part of this tracker through an override device.
    pub fn with_override(
        mut self,
        device: impl Into<String>,
        joint: Option<JointRole>,
        position: bool,
        orientation: bool,
    ) -> Self {
        self.override_device = Some(device.into());
        self.override_joint = joint;
        self.override_position = position;
        self.override_orientation = orientation;
        self
    }
}

/// A tracker composed this frame and the newest pose timestamp behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTracker {
    pub tracker: TrackerBase,
    pub timestamp: i64,
}

fn find_joint(joints: &[TrackedJoint], role: Option<JointRole>) -> Option<&TrackedJoint> {
    let role = role?;
    joints.iter().find(|joint| joint.role == role)
}

fn apply_joint(
    tracker: &mut TrackerBase,
    joint: &TrackedJoint,
    frame: CalibrationFrame,
    position: bool,
    orientation: bool,
    physics: bool,
) {
    let pose = frame.apply(joint.pose());
    if position {
        tracker.position = pose.position;
        if physics {
            tracker.velocity = joint.velocity;
            tracker.acceleration = joint.acceleration;
        } else {
            tracker.velocity = None;
            tracker.acceleration = None;
        }
    }
    if orientation {
        tracker.orientation = pose.orientation;
        if physics {
            tracker.angular_velocity = joint.angular_velocity;
            tracker.angular_acceleration = joint.angular_acceleration;
        } else {
            tracker.angular_velocity = None;
            tracker.angular_acceleration = None;
        }
    }
    if position || orientation {
        tracker.tracking_state = joint.tracking_state;
    }
}

// ─── Frame ──────────────────────────────────────────────────────────────

/// One update frame. Holds the update lock until dropped.
pub struct FrameContext<'a> {
    registry: &'a PluginRegistry,
    guard: FrameGuard<'a>,
}

impl PluginRegistry {
    /// Start an update frame.
    pub fn begin_frame(&self) -> Result<FrameContext<'_>, PluginError> {
        let guard = self.lock_frame()?;
        Ok(FrameContext {
            registry: self,
            guard,
        })
    }
}

impl<'a> FrameContext<'a> {
    pub fn selection(&self) -> &Selection {
        self.guard.selection()
    }

    /// Selection changes are allowed from inside a frame.
    pub fn guard(&mut self) -> &mut FrameGuard<'a> {
        &mut self.guard
    }

    /// Update every selected device that does not update itself and
    /// re-read its joints. Returns how many devices were updated.
    pub fn update_devices(&self) -> usize {
        let mut updated = 0;
        for guid in self.selection().devices() {
            let Some(plugin) = self.registry.get(guid) else {
                continue;
            };
            if !plugin.supports(Capability::SelfUpdate) {
                match plugin.update() {
                    Ok(()) => updated += 1,
                    Err(e) => tracing::warn!(plugin = %guid, "device update failed: {e}"),
                }
            }
            self.registry.snapshot_joints(guid);
        }
        updated
    }

    /// Compose the enabled trackers from the base device, then let override
    /// devices replace the pose components they are configured for. Slots in
    /// a role the selected endpoint does not serve are left out.
    pub fn compose(
        &self,
        slots: &[TrackerSlot],
        calibration: &CalibrationStore,
    ) -> Vec<ComposedTracker> {
        let selection = self.selection();
        let Some(base) = selection.base_device.as_deref() else {
            return Vec::new();
        };
        let base_joints = self.registry.joint_snapshot(base);
        let base_frame = calibration.frame(base);
        let base_physics = self
            .registry
            .supports_capability(base, Capability::PhysicsOverride);

        let served = selection
            .service_endpoint
            .as_deref()
            .and_then(|guid| self.registry.get(guid))
            .and_then(|plugin| plugin.endpoint().map(|e| supported_tracker_roles(e.as_ref())));

        let mut composed = Vec::new();
        for slot in slots.iter().filter(|slot| {
            slot.enabled && served.as_ref().map_or(true, |roles| roles.contains(&slot.role))
        }) {
            let mut tracker = TrackerBase::new(slot.serial.clone(), slot.role);
            tracker.connection_state = true;
            let mut timestamp = 0;

            if let Some(joint) = find_joint(&base_joints, slot.source_joint()) {
                apply_joint(&mut tracker, joint, base_frame, true, true, base_physics);
                timestamp = joint.pose_timestamp();
            }

            let override_device = slot
                .override_device
                .as_deref()
                .filter(|guid| selection.overrides.iter().any(|o| o == guid));
            if let Some(device) = override_device {
                let joints = self.registry.joint_snapshot(device);
                let role = slot.override_joint.or_else(|| slot.source_joint());
                if let Some(joint) = find_joint(&joints, role) {
                    apply_joint(
                        &mut tracker,
                        joint,
                        calibration.frame(device),
                        slot.override_position,
                        slot.override_orientation,
                        self.registry
                            .supports_capability(device, Capability::PhysicsOverride),
                    );
                    timestamp = timestamp.max(joint.pose_timestamp());
                }
            }

            composed.push(ComposedTracker { tracker, timestamp });
        }
        composed
    }

    fn with_endpoint<R>(
        &self,
        f: impl FnOnce(&dyn ServiceEndpoint) -> R,
    ) -> Option<R> {
        let guid = self.selection().service_endpoint.as_deref()?;
        let plugin = self.registry.get(guid)?;
        match plugin.call(|module| match module {
            PluginModule::Endpoint(endpoint) => Some(f(endpoint.as_ref())),
            PluginModule::Device(_) => None,
        }) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(plugin = %guid, "service endpoint unavailable: {e}");
                None
            }
        }
    }

    pub fn heartbeat(&self) {
        self.with_endpoint(|endpoint| endpoint.heartbeat());
    }

    /// Send tracker states to the endpoint; `None` without one.
    pub fn push_tracker_states(&self, trackers: &[TrackerBase]) -> Option<Vec<(TrackerBase, bool)>> {
        self.with_endpoint(|endpoint| endpoint.set_tracker_states(trackers))
    }

    /// Send tracker poses to the endpoint; `None` without one.
    pub fn push_poses(&self, trackers: &[TrackerBase]) -> Option<Vec<(TrackerBase, bool)>> {
        self.with_endpoint(|endpoint| endpoint.update_tracker_poses(trackers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackingState;
    use std::sync::Arc;

    // ── Update lock ──────────────────────────────────────────────────

    #[test]
    fn test_lock_reports_reentrance() {
        let lock = UpdateLock::new();
        let guard = lock.lock().unwrap();
        assert!(lock.held_by_current_thread());
        assert!(matches!(lock.lock(), Err(PluginError::Reentrant)));
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.held_by_current_thread());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_try_lock_from_other_thread_while_held() {
        let lock = Arc::new(UpdateLock::new());
        let guard = lock.lock().unwrap();
        let other = Arc::clone(&lock);
        let acquired = std::thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(!acquired);
        drop(guard);
    }

    #[test]
    fn test_guard_exposes_selection() {
        let lock = UpdateLock::new();
        let mut guard = lock.lock().unwrap();
        guard.selection_mut().base_device = Some("DEV".into());
        drop(guard);
        let guard = lock.lock().unwrap();
        assert!(guard.selection().holds("DEV"));
        assert!(guard.belongs_to(&lock));
    }

    // ── Selection ────────────────────────────────────────────────────

    #[test]
    fn test_selection_devices_base_first() {
        let selection = Selection {
            base_device: Some("BASE".into()),
            overrides: vec!["O1".into(), "O2".into()],
            service_endpoint: Some("EP".into()),
        };
        let devices: Vec<_> = selection.devices().collect();
        assert_eq!(devices, vec!["BASE", "O1", "O2"]);
        assert!(selection.holds("EP"));
        assert!(!selection.holds("OTHER"));
    }

    // ── Slots ────────────────────────────────────────────────────────

    #[test]
    fn test_default_slots_are_mandatory_roles() {
        let slots = TrackerSlot::defaults();
        let roles: Vec<_> = slots.iter().map(|s| s.role).collect();
        assert_eq!(roles, MANDATORY_TRACKER_ROLES.to_vec());
        assert!(slots.iter().all(|s| s.enabled));
        assert_eq!(slots[0].source_joint(), TrackerRole::Waist.default_joint());
    }

    #[test]
    fn test_slot_deserializes_with_defaults() {
        let slot: TrackerSlot =
            serde_json::from_str(r#"{"serial":"X","role":"left_foot"}"#).unwrap();
        assert!(slot.enabled);
        assert!(slot.override_device.is_none());
        assert!(!slot.override_position);
    }

    #[test]
    fn test_apply_joint_respects_component_flags() {
        let mut joint = TrackedJoint::new("Foot", JointRole::FootLeft);
        joint.set_position(glam::Vec3::new(1.0, 2.0, 3.0));
        joint.velocity = Some(glam::Vec3::X);

        let mut tracker = TrackerBase::new("T", TrackerRole::LeftFoot);
        tracker.orientation = glam::Quat::from_rotation_y(1.0);
        let before = tracker.orientation;

        apply_joint(&mut tracker, &joint, CalibrationFrame::IDENTITY, true, false, true);
        assert_eq!(tracker.position, glam::Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(tracker.orientation, before);
        assert_eq!(tracker.velocity, Some(glam::Vec3::X));

        apply_joint(&mut tracker, &joint, CalibrationFrame::IDENTITY, true, false, false);
        assert_eq!(tracker.velocity, None);
    }

    #[test]
    fn test_apply_joint_without_components_keeps_tracking_state() {
        let mut joint = TrackedJoint::new("Foot", JointRole::FootLeft);
        joint.tracking_state = TrackingState::NotTracked;
        joint.set_position(glam::Vec3::ONE);

        let mut tracker = TrackerBase::new("T", TrackerRole::LeftFoot);
        tracker.tracking_state = TrackingState::Tracked;

        apply_joint(&mut tracker, &joint, CalibrationFrame::IDENTITY, false, false, true);
        assert_eq!(tracker.tracking_state, TrackingState::Tracked);
        assert_eq!(tracker.position, glam::Vec3::ZERO);

        apply_joint(&mut tracker, &joint, CalibrationFrame::IDENTITY, false, true, true);
        assert_eq!(tracker.tracking_state, TrackingState::NotTracked);
    }
}
