//! Per-device coordinate frame calibration.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::tracker::JointPose;

/// Rigid transform mapping one device's space into the shared space.
///
/// Rotation pivots around `origin`, then `translation` is added.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFrame {
    pub origin: Vec3,
    pub rotation: Quat,
    pub translation: Vec3,
}

impl CalibrationFrame {
    pub const IDENTITY: Self = Self {
        origin: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn apply_position(&self, position: Vec3) -> Vec3 {
        self.rotation * (position - self.origin) + self.translation + self.origin
    }

    pub fn apply_orientation(&self, orientation: Quat) -> Quat {
        self.rotation * orientation
    }

    pub fn apply(&self, pose: JointPose) -> JointPose {
        JointPose::new(
            self.apply_position(pose.position),
            self.apply_orientation(pose.orientation),
        )
    }
}

impl Default for CalibrationFrame {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Calibration components of every device, keyed by plugin guid.
///
/// The three components are stored independently; a missing one resolves
/// to its identity value, so an uncalibrated device passes through as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default)]
    origins: BTreeMap<String, Vec3>,
    #[serde(default)]
    rotations: BTreeMap<String, Quat>,
    #[serde(default)]
    translations: BTreeMap<String, Vec3>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self, guid: &str) -> CalibrationFrame {
        CalibrationFrame {
            origin: self.origins.get(guid).copied().unwrap_or(Vec3::ZERO),
            rotation: self.rotations.get(guid).copied().unwrap_or(Quat::IDENTITY),
            translation: self.translations.get(guid).copied().unwrap_or(Vec3::ZERO),
        }
    }

    pub fn set_frame(&mut self, guid: &str, frame: CalibrationFrame) {
        self.origins.insert(guid.to_string(), frame.origin);
        self.rotations.insert(guid.to_string(), frame.rotation);
        self.translations.insert(guid.to_string(), frame.translation);
    }

    pub fn set_origin(&mut self, guid: &str, origin: Vec3) {
        self.origins.insert(guid.to_string(), origin);
    }

    pub fn set_rotation(&mut self, guid: &str, rotation: Quat) {
        self.rotations.insert(guid.to_string(), rotation);
    }

    pub fn set_translation(&mut self, guid: &str, translation: Vec3) {
        self.translations.insert(guid.to_string(), translation);
    }

    pub fn is_calibrated(&self, guid: &str) -> bool {
        self.origins.contains_key(guid)
            || self.rotations.contains_key(guid)
            || self.translations.contains_key(guid)
    }

    /// Drop every component stored for `guid`.
    pub fn remove(&mut self, guid: &str) {
        self.origins.remove(guid);
        self.rotations.remove(guid);
        self.translations.remove(guid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_identity_is_passthrough() {
        let pose = JointPose::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_x(0.3));
        let out = CalibrationFrame::IDENTITY.apply(pose);
        assert!(out.position.abs_diff_eq(pose.position, 1e-6));
        assert!(out.orientation.abs_diff_eq(pose.orientation, 1e-6));
    }

    #[test]
    fn test_rotation_pivots_around_origin() {
        let frame = CalibrationFrame {
            origin: Vec3::new(1.0, 0.0, 0.0),
            rotation: Quat::from_rotation_y(PI),
            translation: Vec3::new(0.0, 1.0, 0.0),
        };
        let out = frame.apply_position(Vec3::new(2.0, 0.0, 0.0));
        assert!(
            out.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-5),
            "got {out:?}"
        );
    }

    #[test]
    fn test_orientation_is_left_multiplied() {
        let frame = CalibrationFrame {
            rotation: Quat::from_rotation_z(0.5),
            ..CalibrationFrame::IDENTITY
        };
        let q = Quat::from_rotation_x(0.25);
        assert!(frame
            .apply_orientation(q)
            .abs_diff_eq(Quat::from_rotation_z(0.5) * q, 1e-6));
    }

    #[test]
    fn test_missing_entries_resolve_to_identity() {
        let store = CalibrationStore::new();
        assert_eq!(store.frame("UNKNOWN"), CalibrationFrame::IDENTITY);
        assert!(!store.is_calibrated("UNKNOWN"));
    }

    #[test]
    fn test_components_are_independent() {
        let mut store = CalibrationStore::new();
        store.set_translation("DEV", Vec3::new(0.0, 0.5, 0.0));
        let frame = store.frame("DEV");
        assert_eq!(frame.origin, Vec3::ZERO);
        assert_eq!(frame.rotation, Quat::IDENTITY);
        assert_eq!(frame.translation, Vec3::new(0.0, 0.5, 0.0));
        assert!(store.is_calibrated("DEV"));
    }

    #[test]
    fn test_remove_clears_all_components() {
        let mut store = CalibrationStore::new();
        store.set_frame(
            "DEV",
            CalibrationFrame {
                origin: Vec3::ONE,
                rotation: Quat::from_rotation_y(1.0),
                translation: Vec3::ONE,
            },
        );
        store.remove("DEV");
        assert_eq!(store.frame("DEV"), CalibrationFrame::IDENTITY);
    }

    #[test]
    fn test_store_serialization() {
        let mut store = CalibrationStore::new();
        store.set_origin("DEV", Vec3::new(1.0, 2.0, 3.0));
        let json = serde_json::to_string(&store).unwrap();
        let back: CalibrationStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
