//! Viewer-driven camera control
//!
//! With remote control enabled the head pose is ignored and the viewpoint
//! flies around from the viewers' keyboard and mouse input. Clicks and
//! scrolling are carried on the wire but do not steer the camera.

use glam::{EulerRot, Quat, Vec3};

use crate::protocol::InputPacket;

/// Mouse movement is divided by this before it becomes degrees of rotation
const MOUSE_SCALE: f32 = 4.0;

/// Units per second at full key press
const MOVE_SPEED: f32 = 2.0;

/// Buffered remote input state
#[derive(Debug, Default, Clone)]
pub struct RemoteControl {
    forward: Vec3,
    backward: Vec3,
    /// Degrees
    pitch: f32,
    yaw: f32,
}

impl RemoteControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one input packet into the state
    pub fn apply(&mut self, input: &InputPacket) {
        self.mouse_move(input.dx, input.dy);
        for key in &input.keys_down {
            self.set_key(key, 1.0);
        }
        for key in &input.keys_up {
            self.set_key(key, 0.0);
        }
    }

    fn mouse_move(&mut self, dx: f32, dy: f32) {
        self.pitch -= dy / MOUSE_SCALE;
        self.yaw += dx / MOUSE_SCALE;
    }

    fn set_key(&mut self, key: &str, value: f32) {
        let mut chars = key.chars();
        let single = match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c.to_ascii_uppercase()),
            _ => None,
        };

        let axis = match (single, key) {
            (Some('W'), _) => &mut self.forward.z,
            (Some('D'), _) => &mut self.forward.x,
            (Some('E'), _) | (Some(' '), _) => &mut self.forward.y,
            (Some('S'), _) => &mut self.backward.z,
            (Some('A'), _) => &mut self.backward.x,
            (Some('Q'), _) | (None, "Shift") => &mut self.backward.y,
            _ => return,
        };
        *axis = value;
    }

    /// Current look rotation
    pub fn rotation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.yaw.to_radians(),
            self.pitch.to_radians(),
            0.0,
        )
    }

    /// Local-space movement for a tick of `dt` seconds
    pub fn movement(&self, dt: f32) -> Vec3 {
        (self.forward - self.backward) * (dt * MOVE_SPEED)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
