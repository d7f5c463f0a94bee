//! Camera pose and smoothing

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::constants::MIN_SMOOTHING;

/// Position and orientation of the streamed viewpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Exponential ease-in-out over `t` in `0..=1`.
///
/// Small steps move much less than linearly while large ones catch up fast.
pub fn expo_ease_in_out(t: f32) -> f32 {
    if t <= 0.0 {
        0.0
    } else if t >= 1.0 {
        1.0
    } else if t < 0.5 {
        0.5 * 2f32.powf(20.0 * t - 10.0)
    } else {
        1.0 - 0.5 * 2f32.powf(10.0 - 20.0 * t)
    }
}

/// Eases the viewpoint toward a target pose once per tick
#[derive(Debug, Default)]
pub struct PoseSmoother {
    current: Option<Pose>,
}

impl PoseSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick toward `target`.
    ///
    /// The first step and any step with `smoothing` below [`MIN_SMOOTHING`]
    /// snap straight to the target.
    pub fn step(&mut self, target: Pose, dt: f32, smoothing: f32) -> Pose {
        let next = match self.current {
            Some(current) if smoothing >= MIN_SMOOTHING => {
                let t = (dt * 2.0 / smoothing).clamp(0.0, 1.0);
                Pose {
                    position: current
                        .position
                        .lerp(target.position, expo_ease_in_out(t)),
                    rotation: current.rotation.slerp(target.rotation, t).normalize(),
                }
            }
            _ => target,
        };
        self.current = Some(next);
        next
    }

    /// Jump to `pose` without easing
    pub fn set(&mut self, pose: Pose) {
        self.current = Some(pose);
    }

    pub fn current(&self) -> Option<Pose> {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
