//! Acquisition event log and run summary.
//!
//! The microscope records one [`AcquisitionEvent`] for every externally visible action
//! of the signal side. Tests assert on the sequence; the CLI prints the summary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Externally visible action taken while an acquisition runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AcquisitionEvent {
    /// Lateral move to a new position origin
    MovePosition {
        /// Target x
        x: f64,
        /// Target y
        y: f64,
        /// Target theta
        theta: f64,
    },
    /// Focus step: z and the shared focus plane (channel defocus excluded)
    MoveZ {
        /// Target z
        z: f64,
        /// Focus plane
        f: f64,
    },
    /// Hardware switched to another channel
    ChangeChannel {
        /// Channel id now active
        channel: usize,
    },
    /// Acknowledged trigger
    Trigger {
        /// Frame id assigned to the trigger
        frame_id: u64,
        /// Channel active during the exposure
        channel: Option<usize>,
        /// Stage z at trigger time
        z: f64,
        /// Focus plane at trigger time
        f: f64,
    },
    /// Stage returned to where the stack started
    Restore {
        /// Restored z
        z: f64,
        /// Restored focus
        f: f64,
    },
    /// A stage move was rejected; the rest of the position was skipped
    PositionAborted {
        /// Index into the position list
        position: usize,
        /// Channel active when the move failed
        channel: Option<usize>,
        /// Z-steps completed at that position
        step: u32,
    },
}

/// Summary of one finished acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionReport {
    /// Unique acquisition id
    pub id: Uuid,
    /// Start time
    pub started: DateTime<Utc>,
    /// End time
    pub finished: DateTime<Utc>,
    /// Acknowledged triggers
    pub frames_triggered: u64,
    /// Frames handed to the data sink
    pub frames_written: u64,
    /// Every signal-side action, in order
    pub events: Vec<AcquisitionEvent>,
}

impl AcquisitionReport {
    /// Trigger events only, in order.
    pub fn triggers(&self) -> impl Iterator<Item = &AcquisitionEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, AcquisitionEvent::Trigger { .. }))
    }

    /// `(z, f, channel)` of every trigger.
    pub fn trigger_coordinates(&self) -> Vec<(f64, f64, Option<usize>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AcquisitionEvent::Trigger { z, f, channel, .. } => Some((*z, *f, *channel)),
                _ => None,
            })
            .collect()
    }

    /// Channel ids of every hardware channel switch, in order.
    pub fn channel_changes(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AcquisitionEvent::ChangeChannel { channel } => Some(*channel),
                _ => None,
            })
            .collect()
    }

    /// Wall-clock duration.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished - self.started
    }
}
