//! Hardware layer
//!
//! Device capability traits ([`capabilities`]), their synthetic implementations
//! ([`synthetic`]), the waveform-backed devices ([`galvo`], [`remote_focus`], [`daq`]),
//! the tag-to-driver factory ([`registry`]) and the connection retry helper ([`retry`]).
//!
//! The shared value types used across those modules live here.

pub mod capabilities;
pub mod daq;
pub mod galvo;
pub mod registry;
pub mod remote_focus;
pub mod retry;
pub mod synthetic;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A motorized stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Lateral x
    X,
    /// Lateral y
    Y,
    /// Optical axis
    Z,
    /// Rotation
    Theta,
    /// Focus (detection objective)
    F,
}

impl Axis {
    /// Every axis, in canonical order.
    pub const ALL: [Axis; 5] = [Axis::X, Axis::Y, Axis::Z, Axis::Theta, Axis::F];

    /// Lowercase axis name as used in configuration keys.
    pub fn name(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::Theta => "theta",
            Axis::F => "f",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `(x, y, z, theta, f)` stage coordinate.
///
/// Used both for reported stage positions and for entries of the multi-position table.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// Lateral x
    #[serde(default)]
    pub x: f64,
    /// Lateral y
    #[serde(default)]
    pub y: f64,
    /// Optical axis
    #[serde(default)]
    pub z: f64,
    /// Rotation
    #[serde(default)]
    pub theta: f64,
    /// Focus
    #[serde(default)]
    pub f: f64,
}

impl StagePosition {
    /// Create a position from all five coordinates.
    pub fn new(x: f64, y: f64, z: f64, theta: f64, f: f64) -> Self {
        Self { x, y, z, theta, f }
    }

    /// Coordinate of one axis.
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::Theta => self.theta,
            Axis::F => self.f,
        }
    }

    /// Overwrite the coordinate of one axis.
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::Theta => self.theta = value,
            Axis::F => self.f = value,
        }
    }

    /// Apply every target in `targets`.
    pub fn apply(&mut self, targets: &BTreeMap<Axis, f64>) {
        for (axis, value) in targets {
            self.set(*axis, *value);
        }
    }
}

/// Single camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Index of the trigger that produced this frame, starting at 0
    pub frame_id: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel data
    pub buffer: Vec<u16>,
    /// Time the exposure completed
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Frame stamped with the current time.
    pub fn new(frame_id: u64, width: u32, height: u32, buffer: Vec<u16>) -> Self {
        Self {
            frame_id,
            width,
            height,
            buffer,
            timestamp: Utc::now(),
        }
    }
}
