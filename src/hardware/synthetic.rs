//! Synthetic Hardware Implementations
//!
//! Simulated devices that honor every capability contract without physical hardware.
//! They are registered like any other driver (see [`crate::hardware::registry`]) and are
//! what the test suite and the CLI run against.
//!
//! All synthetic devices use async-safe waits (`tokio::time::sleep`, never
//! `std::thread::sleep`).
//!
//! # Available Devices
//!
//! - `SyntheticCamera` - frame-per-trigger camera with test-pattern buffers
//! - `SyntheticStage` - five-axis stage with inclusive travel limits
//! - `SyntheticFilterWheel` - named slots with a per-slot settle time
//! - `SyntheticZoom` - named servo positions
//! - `SyntheticShutter` - open/close flag
//! - `SyntheticLaser` - power and emission state

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::{
    AxisLimits, CameraSettings, FilterWheelSettings, LaserSettings, StageSettings, ZoomSettings,
};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Camera, FilterWheel, Laser, Shutter, Stage, Zoom};
use crate::hardware::{Axis, Frame, StagePosition};

// =============================================================================
// SyntheticCamera - Triggered Camera
// =============================================================================

/// Synthetic camera producing one frame per trigger.
///
/// Frames carry a ramp test pattern plus a little noise so downstream writers have
/// real buffers to handle.
///
/// # Example
///
/// ```rust,ignore
/// let camera = SyntheticCamera::new(64, 64);
/// camera.arm(0.01).await?;
/// camera.trigger().await?;
/// assert_eq!(camera.read_available_frames().await?, vec![0]);
/// ```
pub struct SyntheticCamera {
    resolution: (u32, u32),
    exposure_s: RwLock<f64>,
    acquiring: AtomicBool,
    next_frame_id: AtomicU64,
    unread: Mutex<VecDeque<u64>>,
    frames: Mutex<BTreeMap<u64, Frame>>,
}

impl SyntheticCamera {
    /// Create a camera with the given resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: (width, height),
            exposure_s: RwLock::new(0.01),
            acquiring: AtomicBool::new(false),
            next_frame_id: AtomicU64::new(0),
            unread: Mutex::new(VecDeque::new()),
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create from the `[camera]` section.
    pub fn from_settings(settings: &CameraSettings) -> Self {
        Self::new(settings.width, settings.height)
    }

    /// Frames triggered in the current series.
    pub fn frames_triggered(&self) -> u64 {
        self.next_frame_id.load(Ordering::SeqCst)
    }

    /// Current exposure in seconds.
    pub async fn exposure(&self) -> f64 {
        *self.exposure_s.read().await
    }

    fn render(&self, frame_id: u64) -> Frame {
        let (width, height) = self.resolution;
        let mut rng = rand::thread_rng();
        let buffer = (0..width * height)
            .map(|i| {
                let pattern = (i as u64 + frame_id) % 4096;
                pattern as u16 + rng.gen_range(0..16)
            })
            .collect();
        Frame::new(frame_id, width, height, buffer)
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new(32, 32)
    }
}

#[async_trait]
impl Camera for SyntheticCamera {
    async fn arm(&self, exposure_time: f64) -> AppResult<()> {
        self.set_exposure(exposure_time).await?;
        self.next_frame_id.store(0, Ordering::SeqCst);
        self.unread.lock().clear();
        self.frames.lock().clear();
        self.acquiring.store(true, Ordering::SeqCst);
        debug!(exposure_time, "SyntheticCamera: image series opened");
        Ok(())
    }

    async fn set_exposure(&self, exposure_time: f64) -> AppResult<()> {
        if exposure_time.is_nan() || exposure_time <= 0.0 {
            return Err(DaqError::Instrument(format!(
                "SyntheticCamera: exposure must be positive, got {exposure_time}"
            )));
        }
        *self.exposure_s.write().await = exposure_time;
        Ok(())
    }

    async fn trigger(&self) -> AppResult<()> {
        if !self.is_acquiring() {
            return Err(DaqError::Instrument(
                "SyntheticCamera: cannot trigger, no image series open".into(),
            ));
        }
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
        let frame = self.render(frame_id);
        self.frames.lock().insert(frame_id, frame);
        self.unread.lock().push_back(frame_id);
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    async fn read_available_frames(&self) -> AppResult<Vec<u64>> {
        Ok(self.unread.lock().drain(..).collect())
    }

    async fn take_frame(&self, frame_id: u64) -> AppResult<Frame> {
        self.frames.lock().remove(&frame_id).ok_or_else(|| {
            DaqError::Instrument(format!("SyntheticCamera: frame {frame_id} not available"))
        })
    }

    async fn close_image_series(&self) -> AppResult<()> {
        self.acquiring.store(false, Ordering::SeqCst);
        let dropped = self.frames.lock().len();
        self.frames.lock().clear();
        self.unread.lock().clear();
        if dropped > 0 {
            warn!(dropped, "SyntheticCamera: unread frames dropped on close");
        }
        debug!("SyntheticCamera: image series closed");
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

// =============================================================================
// SyntheticStage - Five-axis Stage
// =============================================================================

/// Synthetic stage with inclusive per-axis travel limits.
///
/// Every accepted move is counted so tests can assert that rejected moves never
/// reached the hardware.
pub struct SyntheticStage {
    position: Arc<RwLock<StagePosition>>,
    limits: AxisLimits,
    settle: Duration,
    moves: AtomicU64,
}

impl SyntheticStage {
    /// Create a stage at `initial` with the given limits.
    pub fn new(initial: StagePosition, limits: AxisLimits) -> Self {
        Self {
            position: Arc::new(RwLock::new(initial)),
            limits,
            settle: Duration::ZERO,
            moves: AtomicU64::new(0),
        }
    }

    /// Create from the `[stage]` section.
    pub fn from_settings(settings: &StageSettings) -> Self {
        Self::new(settings.initial, settings.limits)
    }

    /// Settle time applied when a move waits for completion.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Moves accepted so far.
    pub fn moves_issued(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    fn out_of_range(&self, targets: &BTreeMap<Axis, f64>) -> Option<(Axis, f64, f64, f64)> {
        targets.iter().find_map(|(axis, value)| {
            let (min, max) = self.limits.bounds(*axis);
            // NaN fails both comparisons and is rejected as well
            if *value >= min && *value <= max {
                None
            } else {
                Some((*axis, *value, min, max))
            }
        })
    }
}

impl Default for SyntheticStage {
    fn default() -> Self {
        Self::new(StagePosition::default(), AxisLimits::default())
    }
}

#[async_trait]
impl Stage for SyntheticStage {
    async fn move_absolute(&self, targets: &BTreeMap<Axis, f64>, wait_until_done: bool) -> AppResult<bool> {
        if let Some((axis, value, min, max)) = self.out_of_range(targets) {
            warn!(
                axis = %axis,
                value,
                min,
                max,
                "Stage target outside travel limits, move rejected"
            );
            return Ok(false);
        }

        self.position.write().await.apply(targets);
        self.moves.fetch_add(1, Ordering::SeqCst);

        if wait_until_done && !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        Ok(true)
    }

    async fn report_position(&self) -> AppResult<StagePosition> {
        Ok(*self.position.read().await)
    }
}

// =============================================================================
// SyntheticFilterWheel - Named Filter Slots
// =============================================================================

/// Synthetic filter wheel.
///
/// Waiting for completion sleeps `|Δslot| × settle_per_slot`.
pub struct SyntheticFilterWheel {
    filters: BTreeMap<String, u32>,
    settle_per_slot: Duration,
    position: RwLock<u32>,
    commands: AtomicU64,
}

impl SyntheticFilterWheel {
    /// Create from the `[filter_wheel]` section, parked at slot 0.
    pub fn from_settings(settings: &FilterWheelSettings) -> Self {
        Self {
            filters: settings.filters.clone(),
            settle_per_slot: Duration::from_millis(settings.settle_per_slot_ms),
            position: RwLock::new(0),
            commands: AtomicU64::new(0),
        }
    }

    /// Rotation commands sent so far.
    pub fn commands_sent(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterWheel for SyntheticFilterWheel {
    async fn set_filter(&self, name: &str, wait_until_done: bool) -> AppResult<()> {
        let target = *self
            .filters
            .get(name)
            .ok_or_else(|| DaqError::UnknownFilter {
                name: name.to_string(),
                available: self.filters.keys().cloned().collect(),
            })?;

        let mut position = self.position.write().await;
        if *position == target {
            return Ok(());
        }
        let delta = position.abs_diff(target);
        self.commands.fetch_add(1, Ordering::SeqCst);
        if wait_until_done && !self.settle_per_slot.is_zero() {
            sleep(self.settle_per_slot * delta).await;
        }
        debug!(filter = name, from = *position, to = target, "Filter wheel moved");
        *position = target;
        Ok(())
    }

    async fn filter_position(&self) -> u32 {
        *self.position.read().await
    }
}

// =============================================================================
// SyntheticZoom - Zoom Servo
// =============================================================================

/// Synthetic zoom servo.
pub struct SyntheticZoom {
    positions: BTreeMap<String, f64>,
    current: RwLock<String>,
    servo_position: RwLock<f64>,
}

impl SyntheticZoom {
    /// Create from the `[zoom]` section, parked at the default zoom.
    pub fn from_settings(settings: &ZoomSettings) -> Self {
        let servo = settings
            .positions
            .get(&settings.default)
            .copied()
            .unwrap_or_default();
        Self {
            positions: settings.positions.clone(),
            current: RwLock::new(settings.default.clone()),
            servo_position: RwLock::new(servo),
        }
    }

    /// Current servo position.
    pub async fn servo_position(&self) -> f64 {
        *self.servo_position.read().await
    }
}

#[async_trait]
impl Zoom for SyntheticZoom {
    async fn set_zoom(&self, name: &str, _wait_until_done: bool) -> AppResult<()> {
        let servo = *self
            .positions
            .get(name)
            .ok_or_else(|| DaqError::UnknownZoom(name.to_string()))?;
        *self.servo_position.write().await = servo;
        *self.current.write().await = name.to_string();
        info!(zoom = name, servo, "Zoom changed");
        Ok(())
    }

    async fn zoom(&self) -> String {
        self.current.read().await.clone()
    }
}

// =============================================================================
// SyntheticShutter
// =============================================================================

/// Synthetic shutter.
#[derive(Default)]
pub struct SyntheticShutter {
    open: AtomicBool,
}

impl SyntheticShutter {
    /// Create a closed shutter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Shutter for SyntheticShutter {
    async fn open_shutter(&self) -> AppResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_shutter(&self) -> AppResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// =============================================================================
// SyntheticLaser
// =============================================================================

/// Synthetic laser line.
pub struct SyntheticLaser {
    wavelength: String,
    max_power_mw: f64,
    power_percent: RwLock<f64>,
    on: AtomicBool,
}

impl SyntheticLaser {
    /// Create from one `[[lasers]]` entry, off at 0 %.
    pub fn from_settings(settings: &LaserSettings) -> Self {
        Self {
            wavelength: settings.wavelength.clone(),
            max_power_mw: settings.max_power,
            power_percent: RwLock::new(0.0),
            on: AtomicBool::new(false),
        }
    }

    /// Output power in mW.
    pub async fn power_mw(&self) -> f64 {
        *self.power_percent.read().await / 100.0 * self.max_power_mw
    }
}

#[async_trait]
impl Laser for SyntheticLaser {
    fn wavelength(&self) -> &str {
        &self.wavelength
    }

    async fn set_power(&self, percent: f64) -> AppResult<()> {
        if percent.is_nan() {
            return Err(DaqError::Instrument(format!(
                "Laser {}: power is not a number",
                self.wavelength
            )));
        }
        let bounded = percent.clamp(0.0, 100.0);
        if bounded != percent {
            warn!(
                laser = %self.wavelength,
                requested = percent,
                applied = bounded,
                "Laser power clamped to 0..=100 %"
            );
        }
        *self.power_percent.write().await = bounded;
        Ok(())
    }

    async fn power(&self) -> f64 {
        *self.power_percent.read().await
    }

    async fn turn_on(&self) -> AppResult<()> {
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_off(&self) -> AppResult<()> {
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_camera_frames_per_trigger() {
        let camera = SyntheticCamera::new(4, 4);
        assert!(camera.trigger().await.is_err());

        camera.arm(0.01).await.unwrap();
        camera.trigger().await.unwrap();
        camera.trigger().await.unwrap();

        assert_eq!(camera.read_available_frames().await.unwrap(), vec![0, 1]);
        assert!(camera.read_available_frames().await.unwrap().is_empty());

        let frame = camera.take_frame(1).await.unwrap();
        assert_eq!(frame.buffer.len(), 16);
        assert!(camera.take_frame(1).await.is_err());

        camera.close_image_series().await.unwrap();
        assert!(!camera.is_acquiring());
    }

    #[tokio::test]
    async fn test_stage_rejects_whole_move() {
        let stage = SyntheticStage::default();
        let targets = BTreeMap::from([(Axis::X, 5.0), (Axis::Theta, 400.0)]);

        assert!(!stage.move_absolute(&targets, true).await.unwrap());
        let position = stage.report_position().await.unwrap();
        assert_eq!(position.x, 0.0);
        assert_eq!(stage.moves_issued(), 0);
    }

    #[tokio::test]
    async fn test_filter_wheel_same_slot_sends_nothing() {
        let wheel = SyntheticFilterWheel::from_settings(&FilterWheelSettings::default());
        wheel.set_filter("Empty", true).await.unwrap();
        assert_eq!(wheel.commands_sent(), 0);

        wheel.set_filter("RFP", true).await.unwrap();
        assert_eq!(wheel.filter_position().await, 2);
        assert_eq!(wheel.commands_sent(), 1);
    }

    #[test]
    fn test_zoom_unknown_name() {
        let zoom = SyntheticZoom::from_settings(&ZoomSettings::default());
        let err = tokio_test::block_on(zoom.set_zoom("16x", true)).unwrap_err();
        assert!(matches!(err, DaqError::UnknownZoom(name) if name == "16x"));
        assert_eq!(tokio_test::block_on(zoom.zoom()), "1x");
    }

    #[tokio::test]
    async fn test_laser_power_clamped() {
        let laser = SyntheticLaser::from_settings(&LaserSettings {
            kind: "SyntheticLaser".into(),
            wavelength: "488nm".into(),
            max_power: 50.0,
        });
        laser.set_power(140.0).await.unwrap();
        assert_eq!(laser.power().await, 100.0);
        assert_eq!(laser.power_mw().await, 50.0);

        laser.set_power(-3.0).await.unwrap();
        assert_eq!(laser.power().await, 0.0);
    }
}
