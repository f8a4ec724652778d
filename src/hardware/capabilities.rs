//! Atomic Hardware Capabilities
//!
//! One trait per device role of the microscope. The acquisition engine only ever talks
//! to these traits, so the synthetic devices in [`crate::hardware::synthetic`] and any
//! vendor driver are interchangeable.
//!
//! # Design Principles
//!
//! - **Async-first**: operations that wait on hardware are `async`
//! - **Thread-safe**: all traits require `Send + Sync`
//! - **Interior mutability**: every method takes `&self`
//! - **Bounded waits**: "set state" operations take a `wait_until_done` flag and return
//!   once the device reports completion or its own timeout elapses
//! - **No silent retries**: operational calls surface their error; only connection
//!   establishment is retried (see [`crate::hardware::retry`])
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step_focus(stage: &dyn Stage, z: f64) -> AppResult<bool> {
//!     let targets = BTreeMap::from([(Axis::Z, z)]);
//!     stage.move_absolute(&targets, true).await
//! }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::ChannelSettings;
use crate::error::AppResult;
use crate::hardware::{Axis, Frame, StagePosition};
use crate::waveforms::{ChannelTimes, WaveformDescriptor, WaveformMap, WaveformSet};

// =============================================================================
// Imaging
// =============================================================================

/// Capability: Triggered Camera
///
/// # Contract
/// - `arm()` opens an image series with the given exposure; triggers before `arm()` fail
/// - every `trigger()` produces exactly one frame, ids counting up from 0 per series
/// - `read_available_frames()` returns ids not yet reported, in acquisition order
/// - `take_frame()` hands over the buffer of a reported id exactly once
#[async_trait]
pub trait Camera: Send + Sync {
    /// Open an image series with `exposure_time` seconds per frame.
    async fn arm(&self, exposure_time: f64) -> AppResult<()>;

    /// Change the exposure of the open series (channel switch).
    async fn set_exposure(&self, exposure_time: f64) -> AppResult<()>;

    /// Expose one frame.
    async fn trigger(&self) -> AppResult<()>;

    /// Whether an image series is open.
    fn is_acquiring(&self) -> bool;

    /// Ids of frames completed since the last call.
    async fn read_available_frames(&self) -> AppResult<Vec<u64>>;

    /// Remove and return a completed frame.
    async fn take_frame(&self, frame_id: u64) -> AppResult<Frame>;

    /// Close the image series and drop any unread frames.
    async fn close_image_series(&self) -> AppResult<()>;

    /// Sensor resolution `(width, height)` in pixels.
    fn resolution(&self) -> (u32, u32);
}

// =============================================================================
// Motion
// =============================================================================

/// Capability: Multi-axis Stage
///
/// # Contract
/// - `move_absolute()` checks every target against the configured inclusive
///   `[min, max]` of its axis before moving
/// - an out-of-range target rejects the whole move: `Ok(false)`, nothing moves,
///   nothing is clamped
/// - `Err` is reserved for communication failures
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move the given axes to absolute targets.
    ///
    /// # Returns
    /// - `Ok(true)` if the move was issued (and completed when `wait_until_done`)
    /// - `Ok(false)` if any target lies outside its axis limits
    async fn move_absolute(&self, targets: &BTreeMap<Axis, f64>, wait_until_done: bool) -> AppResult<bool>;

    /// Current position of every axis.
    async fn report_position(&self) -> AppResult<StagePosition>;

    /// Halt motion.
    ///
    /// # Default Implementation
    /// Does nothing; devices that move instantly have nothing to stop.
    async fn stop(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Capability: Zoom Servo
#[async_trait]
pub trait Zoom: Send + Sync {
    /// Move to a named zoom.
    ///
    /// Fails with `UnknownZoom` before any movement when `name` is not configured.
    async fn set_zoom(&self, name: &str, wait_until_done: bool) -> AppResult<()>;

    /// Name of the current zoom.
    async fn zoom(&self) -> String;
}

/// Capability: Filter Wheel
#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Rotate to a named filter.
    ///
    /// Fails with `UnknownFilter` before any I/O when `name` is not configured;
    /// never falls through to a default slot.
    async fn set_filter(&self, name: &str, wait_until_done: bool) -> AppResult<()>;

    /// Current wheel slot.
    async fn filter_position(&self) -> u32;
}

// =============================================================================
// Illumination
// =============================================================================

/// Capability: Shutter
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Open the shutter.
    async fn open_shutter(&self) -> AppResult<()>;

    /// Close the shutter.
    async fn close_shutter(&self) -> AppResult<()>;

    /// Whether the shutter is open.
    fn is_open(&self) -> bool;
}

/// Capability: Laser Line
///
/// # Contract
/// - power is a percentage; values outside `0..=100` are clamped and logged
/// - `turn_on`/`turn_off` are idempotent
#[async_trait]
pub trait Laser: Send + Sync {
    /// Wavelength label channels refer to (e.g. "488nm").
    fn wavelength(&self) -> &str;

    /// Set output power in percent.
    async fn set_power(&self, percent: f64) -> AppResult<()>;

    /// Current output power in percent.
    async fn power(&self) -> f64;

    /// Enable emission.
    async fn turn_on(&self) -> AppResult<()>;

    /// Disable emission.
    async fn turn_off(&self) -> AppResult<()>;

    /// Whether the laser is emitting.
    fn is_on(&self) -> bool;
}

// =============================================================================
// Waveform-driven devices
// =============================================================================

/// Capability: Galvo Scanner
///
/// `adjust()` is a pure function of configuration and timing, kept synchronous so it
/// can run on the hot acquisition path without awaiting.
#[async_trait]
pub trait Galvo: Send + Sync {
    /// Index of this galvo in the configuration.
    fn index(&self) -> usize;

    /// Per-channel waveforms for every selected channel.
    ///
    /// An unrecognized waveform shape returns the previous map unchanged.
    fn adjust(
        &self,
        channels: &[ChannelSettings],
        exposure_times: &ChannelTimes,
        sweep_times: &ChannelTimes,
    ) -> AppResult<WaveformMap>;

    /// Output a waveform.
    async fn apply(&self, waveform: &WaveformDescriptor) -> AppResult<()>;

    /// Drive the output to 0 V.
    async fn turn_off(&self) -> AppResult<()>;
}

/// Capability: Remote Focus (ETL)
#[async_trait]
pub trait RemoteFocus: Send + Sync {
    /// Per-channel ramps for every selected channel.
    fn adjust(
        &self,
        channels: &[ChannelSettings],
        exposure_times: &ChannelTimes,
        sweep_times: &ChannelTimes,
    ) -> AppResult<WaveformMap>;

    /// Output a waveform.
    async fn apply(&self, waveform: &WaveformDescriptor) -> AppResult<()>;

    /// Drive the output to 0 V.
    async fn turn_off(&self) -> AppResult<()>;
}

/// Capability: DAQ Board
///
/// Owns the master trigger and the hardware task handle.
///
/// # Contract
/// - `load_waveforms()` replaces every per-channel buffer
/// - `prepare(channel)` selects the buffers the next `run_acquisition()` outputs
/// - `run_acquisition()` outputs one sweep and returns once it has completed
/// - `close_tasks()` is synchronous so it can run from `Drop`; it must be safe to call
///   on an already closed board
#[async_trait]
pub trait Daq: Send + Sync {
    /// Analog output sample rate in Hz.
    fn sample_rate(&self) -> f64;

    /// Replace the waveform buffers.
    async fn load_waveforms(&self, waveforms: WaveformSet) -> AppResult<()>;

    /// Select the channel output by the next sweep.
    async fn prepare(&self, channel: usize) -> AppResult<()>;

    /// Open the hardware tasks.
    async fn start_tasks(&self) -> AppResult<()>;

    /// Output one sweep; the camera trigger line fires within it.
    async fn run_acquisition(&self) -> AppResult<()>;

    /// Stop output, keeping the tasks allocated.
    async fn stop_tasks(&self) -> AppResult<()>;

    /// Release the task handle.
    fn close_tasks(&self);

    /// Whether a task handle is held.
    fn tasks_open(&self) -> bool;
}
