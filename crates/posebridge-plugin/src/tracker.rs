//! Canonical joint and tracker data model.
//!
//! Devices report [`TrackedJoint`]s, the host composes them into
//! [`TrackerBase`]s and hands those to the service endpoint. Poses use
//! `glam` vectors and quaternions throughout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::actions::ActionHandle;

/// Length of one pose clock tick in seconds (100 ns).
pub const TICK_SECONDS: f32 = 1.0e-7;

// ─── Roles and states ───────────────────────────────────────────────────

/// Anatomical joint a device can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointRole {
    Head,
    Neck,
    SpineShoulder,
    ShoulderLeft,
    ElbowLeft,
    WristLeft,
    HandLeft,
    HandTipLeft,
    ThumbLeft,
    ShoulderRight,
    ElbowRight,
    WristRight,
    HandRight,
    HandTipRight,
    ThumbRight,
    SpineMiddle,
    SpineWaist,
    HipLeft,
    KneeLeft,
    FootLeft,
    FootTipLeft,
    HipRight,
    KneeRight,
    FootRight,
    FootTipRight,
    /// Joint with no anatomical meaning, picked manually by the user.
    Manual,
}

/// Slot a composed tracker occupies on the service endpoint side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerRole {
    Handed,
    LeftFoot,
    RightFoot,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftKnee,
    RightKnee,
    Waist,
    Chest,
    Camera,
    Keyboard,
    Head,
    LeftHand,
    RightHand,
}

/// Roles every service endpoint is expected to accept.
pub const MANDATORY_TRACKER_ROLES: [TrackerRole; 3] =
    [TrackerRole::Waist, TrackerRole::LeftFoot, TrackerRole::RightFoot];

impl TrackerRole {
    /// Joint a tracker in this role is fed from unless configured otherwise.
    pub fn default_joint(self) -> Option<JointRole> {
        match self {
            Self::LeftFoot => Some(JointRole::FootLeft),
            Self::RightFoot => Some(JointRole::FootRight),
            Self::LeftShoulder => Some(JointRole::ShoulderLeft),
            Self::RightShoulder => Some(JointRole::ShoulderRight),
            Self::LeftElbow => Some(JointRole::ElbowLeft),
            Self::RightElbow => Some(JointRole::ElbowRight),
            Self::LeftKnee => Some(JointRole::KneeLeft),
            Self::RightKnee => Some(JointRole::KneeRight),
            Self::Waist => Some(JointRole::SpineWaist),
            Self::Chest => Some(JointRole::SpineShoulder),
            Self::Head => Some(JointRole::Head),
            Self::LeftHand => Some(JointRole::HandLeft),
            Self::RightHand => Some(JointRole::HandRight),
            Self::Handed | Self::Camera | Self::Keyboard => None,
        }
    }

    /// Serial used for host-created trackers in this role.
    pub fn default_serial(self) -> String {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        format!("POSEBRIDGE-{}", name.replace('_', "-").to_uppercase())
    }
}

/// Tracking confidence reported for a joint or tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    NotTracked,
    Inferred,
    Tracked,
}

// ─── Pose ───────────────────────────────────────────────────────────────

/// Position and orientation pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointPose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl JointPose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }
}

impl Default for JointPose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn clock_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Next value of the process-wide pose clock.
///
/// Strictly increasing across all joints and threads, even when two writes
/// land in the same tick.
pub fn next_pose_timestamp() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);

    let now = i64::try_from(clock_origin().elapsed().as_nanos() / 100).unwrap_or(i64::MAX);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

// ─── Tracked joint ──────────────────────────────────────────────────────

/// A joint as reported by a tracking device.
///
/// Pose fields are private: every write snapshots the previous value so the
/// previous/current pair always describes two consecutive frames, and
/// position writes advance the pose timestamp.
#[derive(Debug, Clone)]
pub struct TrackedJoint {
    pub name: String,
    pub role: JointRole,
    pub tracking_state: TrackingState,
    position: Vec3,
    orientation: Quat,
    previous_position: Vec3,
    previous_orientation: Quat,
    pose_timestamp: i64,
    previous_pose_timestamp: i64,
    pub velocity: Option<Vec3>,
    pub acceleration: Option<Vec3>,
    pub angular_velocity: Option<Vec3>,
    pub angular_acceleration: Option<Vec3>,
    pub supported_input_actions: Vec<ActionHandle>,
}

impl TrackedJoint {
    pub fn new(name: impl Into<String>, role: JointRole) -> Self {
        Self {
            name: name.into(),
            role,
            tracking_state: TrackingState::NotTracked,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            previous_position: Vec3::ZERO,
            previous_orientation: Quat::IDENTITY,
            pose_timestamp: 0,
            previous_pose_timestamp: 0,
            velocity: None,
            acceleration: None,
            angular_velocity: None,
            angular_acceleration: None,
            supported_input_actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = ActionHandle>) -> Self {
        self.supported_input_actions.extend(actions);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn previous_position(&self) -> Vec3 {
        self.previous_position
    }

    pub fn previous_orientation(&self) -> Quat {
        self.previous_orientation
    }

    pub fn pose_timestamp(&self) -> i64 {
        self.pose_timestamp
    }

    pub fn previous_pose_timestamp(&self) -> i64 {
        self.previous_pose_timestamp
    }

    pub fn pose(&self) -> JointPose {
        JointPose::new(self.position, self.orientation)
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.previous_position = self.position;
        self.previous_pose_timestamp = self.pose_timestamp;
        self.position = position;
        self.pose_timestamp = next_pose_timestamp();
    }

    pub fn set_orientation(&mut self, orientation: Quat) {
        self.previous_orientation = self.orientation;
        self.orientation = orientation;
    }

    pub fn set_pose(&mut self, pose: JointPose) {
        self.set_orientation(pose.orientation);
        self.set_position(pose.position);
    }
}

/// Pose of the Head joint, else the first joint, else identity.
pub fn hook_joint(joints: &[TrackedJoint]) -> JointPose {
    anchor_joint(joints, JointRole::Head)
}

/// Pose of the SpineWaist joint, else the first joint, else identity.
pub fn transform_joint(joints: &[TrackedJoint]) -> JointPose {
    anchor_joint(joints, JointRole::SpineWaist)
}

fn anchor_joint(joints: &[TrackedJoint], preferred: JointRole) -> JointPose {
    joints
        .iter()
        .find(|joint| joint.role == preferred)
        .or_else(|| joints.first())
        .map(TrackedJoint::pose)
        .unwrap_or(JointPose::IDENTITY)
}

// ─── Tracker ────────────────────────────────────────────────────────────

/// A composed tracker as sent to the service endpoint.
///
/// `None` physics means the host derives them from pose deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerBase {
    pub serial: String,
    pub role: TrackerRole,
    pub connection_state: bool,
    pub tracking_state: TrackingState,
    pub position: Vec3,
    pub orientation: Quat,
    #[serde(default)]
    pub velocity: Option<Vec3>,
    #[serde(default)]
    pub acceleration: Option<Vec3>,
    #[serde(default)]
    pub angular_velocity: Option<Vec3>,
    #[serde(default)]
    pub angular_acceleration: Option<Vec3>,
}

impl TrackerBase {
    pub fn new(serial: impl Into<String>, role: TrackerRole) -> Self {
        Self {
            serial: serial.into(),
            role,
            connection_state: false,
            tracking_state: TrackingState::NotTracked,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            velocity: None,
            acceleration: None,
            angular_velocity: None,
            angular_acceleration: None,
        }
    }

    pub fn pose(&self) -> JointPose {
        JointPose::new(self.position, self.orientation)
    }
}

// ─── Physics ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct MotionSample {
    position: Vec3,
    orientation: Quat,
    velocity: Vec3,
    angular_velocity: Vec3,
    timestamp: i64,
}

/// Derives missing tracker physics from consecutive poses, per serial.
#[derive(Debug, Default)]
pub struct PhysicsEstimator {
    history: HashMap<String, MotionSample>,
}

impl PhysicsEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill every `None` physics field of `tracker` from the pose observed
    /// at `timestamp` (pose clock ticks). Supplied fields are left alone.
    pub fn fill(&mut self, tracker: &mut TrackerBase, timestamp: i64) {
        let previous = self.history.get(&tracker.serial).copied();

        let (velocity, acceleration, angular_velocity, angular_acceleration) = match previous {
            Some(prev) if timestamp > prev.timestamp => {
                let dt = (timestamp - prev.timestamp) as f32 * TICK_SECONDS;
                let velocity = (tracker.position - prev.position) / dt;
                let angular_velocity =
                    angular_velocity_between(prev.orientation, tracker.orientation, dt);
                (
                    velocity,
                    (velocity - prev.velocity) / dt,
                    angular_velocity,
                    (angular_velocity - prev.angular_velocity) / dt,
                )
            }
            Some(prev) => (prev.velocity, Vec3::ZERO, prev.angular_velocity, Vec3::ZERO),
            None => (Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO),
        };

        let velocity = *tracker.velocity.get_or_insert(velocity);
        tracker.acceleration.get_or_insert(acceleration);
        let angular_velocity = *tracker.angular_velocity.get_or_insert(angular_velocity);
        tracker.angular_acceleration.get_or_insert(angular_acceleration);

        self.history.insert(
            tracker.serial.clone(),
            MotionSample {
                position: tracker.position,
                orientation: tracker.orientation,
                velocity,
                angular_velocity,
                timestamp: timestamp.max(previous.map_or(timestamp, |p| p.timestamp)),
            },
        );
    }

    /// Forget the history of one tracker, e.g. after its source changed.
    pub fn reset(&mut self, serial: &str) {
        self.history.remove(serial);
    }
}

fn angular_velocity_between(from: Quat, to: Quat, dt: f32) -> Vec3 {
    let mut delta = (to * from.inverse()).normalize();
    if delta.w < 0.0 {
        delta = -delta;
    }
    let (axis, angle) = delta.to_axis_angle();
    if angle.abs() < f32::EPSILON {
        Vec3::ZERO
    } else {
        axis * angle / dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint_at(role: JointRole, x: f32) -> TrackedJoint {
        let mut joint = TrackedJoint::new(format!("{role:?}"), role);
        joint.set_position(Vec3::new(x, 0.0, 0.0));
        joint
    }

    // ── Pose clock ────────────────────────────────────────────────────

    #[test]
    fn test_pose_clock_strictly_increasing() {
        let mut last = next_pose_timestamp();
        for _ in 0..10_000 {
            let next = next_pose_timestamp();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_pose_clock_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| (0..1000).map(|_| next_pose_timestamp()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "timestamps must never repeat");
    }

    // ── Tracked joint ─────────────────────────────────────────────────

    #[test]
    fn test_set_position_snapshots_previous() {
        let mut joint = TrackedJoint::new("Head", JointRole::Head);
        joint.set_position(Vec3::new(1.0, 2.0, 3.0));
        let first_stamp = joint.pose_timestamp();
        joint.set_position(Vec3::new(4.0, 5.0, 6.0));

        assert_eq!(joint.previous_position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(joint.position(), Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(joint.previous_pose_timestamp(), first_stamp);
        assert!(joint.previous_pose_timestamp() < joint.pose_timestamp());
    }

    #[test]
    fn test_timestamps_increase_on_every_write() {
        let mut joint = TrackedJoint::new("Waist", JointRole::SpineWaist);
        for i in 0..100 {
            joint.set_position(Vec3::splat(i as f32));
            assert!(joint.previous_pose_timestamp() < joint.pose_timestamp());
        }
    }

    #[test]
    fn test_set_orientation_snapshots_previous() {
        let mut joint = TrackedJoint::new("Head", JointRole::Head);
        let turned = Quat::from_rotation_y(1.0);
        joint.set_orientation(turned);
        assert_eq!(joint.previous_orientation(), Quat::IDENTITY);
        assert_eq!(joint.orientation(), turned);
    }

    // ── Anchors ───────────────────────────────────────────────────────

    #[test]
    fn test_hook_joint_prefers_head() {
        let joints = vec![
            joint_at(JointRole::SpineWaist, 1.0),
            joint_at(JointRole::Head, 2.0),
            joint_at(JointRole::FootLeft, 3.0),
        ];
        assert_eq!(hook_joint(&joints).position.x, 2.0);
        assert_eq!(transform_joint(&joints).position.x, 1.0);
    }

    #[test]
    fn test_hook_joint_falls_back_to_first() {
        let joints = vec![
            joint_at(JointRole::SpineWaist, 1.0),
            joint_at(JointRole::FootLeft, 3.0),
        ];
        assert_eq!(hook_joint(&joints).position.x, 1.0);
    }

    #[test]
    fn test_transform_joint_falls_back_to_first() {
        let joints = vec![joint_at(JointRole::Head, 5.0)];
        assert_eq!(transform_joint(&joints).position.x, 5.0);
    }

    #[test]
    fn test_anchor_of_empty_list_is_identity() {
        assert_eq!(hook_joint(&[]), JointPose::IDENTITY);
        assert_eq!(transform_joint(&[]), JointPose::IDENTITY);
    }

    // ── Roles ─────────────────────────────────────────────────────────

    #[test]
    fn test_default_joint_mapping() {
        assert_eq!(TrackerRole::Waist.default_joint(), Some(JointRole::SpineWaist));
        assert_eq!(TrackerRole::LeftFoot.default_joint(), Some(JointRole::FootLeft));
        assert_eq!(TrackerRole::Keyboard.default_joint(), None);
    }

    #[test]
    fn test_default_serial() {
        assert_eq!(TrackerRole::LeftFoot.default_serial(), "POSEBRIDGE-LEFT-FOOT");
        assert_eq!(TrackerRole::Waist.default_serial(), "POSEBRIDGE-WAIST");
    }

    #[test]
    fn test_tracker_base_serialization_keeps_missing_physics() {
        let tracker = TrackerBase::new("S", TrackerRole::Waist);
        let json = serde_json::to_value(&tracker).unwrap();
        assert!(json["velocity"].is_null());
        let back: TrackerBase = serde_json::from_value(json).unwrap();
        assert_eq!(back, tracker);
    }

    // ── Physics ───────────────────────────────────────────────────────

    #[test]
    fn test_physics_first_sample_is_at_rest() {
        let mut estimator = PhysicsEstimator::new();
        let mut tracker = TrackerBase::new("S", TrackerRole::Waist);
        estimator.fill(&mut tracker, 100);
        assert_eq!(tracker.velocity, Some(Vec3::ZERO));
        assert_eq!(tracker.angular_velocity, Some(Vec3::ZERO));
    }

    #[test]
    fn test_physics_velocity_from_delta() {
        let mut estimator = PhysicsEstimator::new();
        let mut tracker = TrackerBase::new("S", TrackerRole::Waist);
        estimator.fill(&mut tracker, 0);

        let mut moved = TrackerBase::new("S", TrackerRole::Waist);
        moved.position = Vec3::new(1.0, 0.0, 0.0);
        // one second later
        estimator.fill(&mut moved, 10_000_000);
        let velocity = moved.velocity.unwrap();
        assert!(velocity.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-4));
    }

    #[test]
    fn test_physics_keeps_supplied_values() {
        let mut estimator = PhysicsEstimator::new();
        let mut tracker = TrackerBase::new("S", TrackerRole::Waist);
        tracker.velocity = Some(Vec3::new(9.0, 9.0, 9.0));
        estimator.fill(&mut tracker, 5);
        assert_eq!(tracker.velocity, Some(Vec3::new(9.0, 9.0, 9.0)));
        assert!(tracker.acceleration.is_some());
    }

    #[test]
    fn test_angular_velocity_about_y() {
        let w = angular_velocity_between(Quat::IDENTITY, Quat::from_rotation_y(0.5), 0.5);
        assert!(w.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-4));
    }
}
