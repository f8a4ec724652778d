//! Microscope configuration using Figment
//!
//! Strongly-typed configuration for one microscope and its current experiment.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `LIGHTSHEET_DAQ_`, nested keys split on `__`)
//!
//! The loaded [`Settings`] is an immutable snapshot. Components receive it as
//! `Arc<Settings>` at construction and never write back to it; experiment changes made
//! while the microscope is running go through `Microscope::update_state`.
//!
//! # Example
//! ```no_run
//! use lightsheet_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/microscope.toml")?;
//! settings.validate_all()?;
//! println!("Sample rate: {} Hz", settings.daq.sample_rate);
//! # Ok::<(), lightsheet_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::{Axis, StagePosition};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one microscope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logging settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// DAQ board settings
    #[serde(default)]
    pub daq: DaqSettings,
    /// Camera settings
    #[serde(default)]
    pub camera: CameraSettings,
    /// Galvo settings, one entry per galvo output
    #[serde(default = "default_galvos")]
    pub galvo: Vec<GalvoSettings>,
    /// Remote focus (ETL) settings
    #[serde(default)]
    pub remote_focus: RemoteFocusSettings,
    /// Filter wheel settings
    #[serde(default)]
    pub filter_wheel: FilterWheelSettings,
    /// Zoom servo settings
    #[serde(default)]
    pub zoom: ZoomSettings,
    /// Stage settings
    #[serde(default)]
    pub stage: StageSettings,
    /// Shutter settings
    #[serde(default)]
    pub shutter: ShutterSettings,
    /// Lasers, keyed by their wavelength label
    #[serde(default = "default_lasers")]
    pub lasers: Vec<LaserSettings>,
    /// Handshake timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Connection retry policy
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Current experiment
    #[serde(default)]
    pub experiment: ExperimentSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            daq: DaqSettings::default(),
            camera: CameraSettings::default(),
            galvo: default_galvos(),
            remote_focus: RemoteFocusSettings::default(),
            filter_wheel: FilterWheelSettings::default(),
            zoom: ZoomSettings::default(),
            stage: StageSettings::default(),
            shutter: ShutterSettings::default(),
            lasers: default_lasers(),
            timeouts: TimeoutSettings::default(),
            connection: ConnectionSettings::default(),
            experiment: ExperimentSettings::default(),
        }
    }
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// DAQ board settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqSettings {
    /// Driver tag (e.g. "SyntheticDaq")
    #[serde(default = "default_daq_kind")]
    pub kind: String,
    /// Analog output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Simulated trigger round-trip for the synthetic board, in milliseconds
    #[serde(default = "default_trigger_latency")]
    pub trigger_latency_ms: u64,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            kind: default_daq_kind(),
            sample_rate: default_sample_rate(),
            trigger_latency_ms: default_trigger_latency(),
        }
    }
}

/// Camera settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Driver tag (e.g. "SyntheticCamera")
    #[serde(default = "default_camera_kind")]
    pub kind: String,
    /// Frame width in pixels
    #[serde(default = "default_frame_size")]
    pub width: u32,
    /// Frame height in pixels
    #[serde(default = "default_frame_size")]
    pub height: u32,
    /// Sensor readout time in seconds
    #[serde(default)]
    pub readout_time: f64,
    /// Delay between sweep start and exposure start, percent of exposure time
    #[serde(default = "default_camera_delay_percent")]
    pub delay_percent: f64,
    /// Time the sensor needs to settle after a frame, in milliseconds
    #[serde(default)]
    pub settle_duration_ms: f64,
    /// Lower bound of the trigger output voltage
    #[serde(default)]
    pub min_voltage: f64,
    /// Upper bound of the trigger output voltage
    #[serde(default = "default_ttl_voltage")]
    pub max_voltage: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            kind: default_camera_kind(),
            width: default_frame_size(),
            height: default_frame_size(),
            readout_time: 0.0,
            delay_percent: default_camera_delay_percent(),
            settle_duration_ms: 0.0,
            min_voltage: 0.0,
            max_voltage: default_ttl_voltage(),
        }
    }
}

impl CameraSettings {
    /// Camera delay in seconds for a given exposure time in seconds.
    pub fn delay_seconds(&self, exposure_time: f64) -> f64 {
        self.delay_percent / 100.0 * exposure_time
    }
}

/// Galvo output settings.
///
/// `waveform` stays a free-form string: an unrecognized shape is logged and skipped
/// on the acquisition path instead of failing configuration load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalvoSettings {
    /// Driver tag (e.g. "SyntheticGalvo")
    #[serde(default = "default_galvo_kind")]
    pub kind: String,
    /// Waveform shape: "sawtooth", "sine", "halfsaw"
    #[serde(default = "default_galvo_waveform")]
    pub waveform: String,
    /// Half peak-to-peak amplitude in volts
    #[serde(default = "default_galvo_amplitude")]
    pub amplitude: f64,
    /// Offset in volts
    #[serde(default)]
    pub offset: f64,
    /// Sweeps per exposure
    #[serde(default = "default_galvo_frequency")]
    pub frequency: f64,
    /// Sawtooth duty cycle in percent
    #[serde(default = "default_duty_cycle")]
    pub duty_cycle: f64,
    /// Phase in radians (sine shape only)
    #[serde(default)]
    pub phase: f64,
    /// Lower hardware voltage limit
    #[serde(default = "default_galvo_min_voltage")]
    pub min_voltage: f64,
    /// Upper hardware voltage limit
    #[serde(default = "default_galvo_max_voltage")]
    pub max_voltage: f64,
}

impl Default for GalvoSettings {
    fn default() -> Self {
        Self {
            kind: default_galvo_kind(),
            waveform: default_galvo_waveform(),
            amplitude: default_galvo_amplitude(),
            offset: 0.0,
            frequency: default_galvo_frequency(),
            duty_cycle: default_duty_cycle(),
            phase: 0.0,
            min_voltage: default_galvo_min_voltage(),
            max_voltage: default_galvo_max_voltage(),
        }
    }
}

/// Remote focus ramp variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RampKind {
    /// Single rising ramp with a falling flyback
    #[default]
    Ramp,
    /// Rising then falling ramp (bidirectional readout)
    Triangular,
}

/// Per-laser remote focus constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct RampConstants {
    /// Half peak-to-peak amplitude in volts
    #[serde(default)]
    pub amplitude: f64,
    /// Offset in volts
    #[serde(default)]
    pub offset: f64,
}

/// Remote focus (ETL) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFocusSettings {
    /// Driver tag (e.g. "SyntheticRemoteFocus")
    #[serde(default = "default_remote_focus_kind")]
    pub kind: String,
    /// Ramp variant
    #[serde(default)]
    pub ramp: RampKind,
    /// Delay before the ramp starts, percent of exposure time
    #[serde(default = "default_remote_focus_delay_percent")]
    pub delay_percent: f64,
    /// Flyback duration, percent of exposure time
    #[serde(default = "default_ramp_falling_percent")]
    pub ramp_falling_percent: f64,
    /// Settle time after the flyback, in milliseconds
    #[serde(default)]
    pub settle_duration_ms: f64,
    /// Moving-average smoothing in percent of the waveform length; also pads the sweep
    #[serde(default)]
    pub percent_smoothing: f64,
    /// Amplitude/offset per laser wavelength label
    #[serde(default)]
    pub lasers: BTreeMap<String, RampConstants>,
    /// Lower hardware voltage limit
    #[serde(default)]
    pub min_voltage: f64,
    /// Upper hardware voltage limit
    #[serde(default = "default_ttl_voltage")]
    pub max_voltage: f64,
}

impl Default for RemoteFocusSettings {
    fn default() -> Self {
        Self {
            kind: default_remote_focus_kind(),
            ramp: RampKind::Ramp,
            delay_percent: default_remote_focus_delay_percent(),
            ramp_falling_percent: default_ramp_falling_percent(),
            settle_duration_ms: 0.0,
            percent_smoothing: 0.0,
            lasers: BTreeMap::new(),
            min_voltage: 0.0,
            max_voltage: default_ttl_voltage(),
        }
    }
}

/// Filter wheel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelSettings {
    /// Driver tag (e.g. "SyntheticFilterWheel")
    #[serde(default = "default_filter_wheel_kind")]
    pub kind: String,
    /// Filter name to wheel slot
    #[serde(default = "default_filters")]
    pub filters: BTreeMap<String, u32>,
    /// Settle time per slot travelled, in milliseconds
    #[serde(default)]
    pub settle_per_slot_ms: u64,
}

impl Default for FilterWheelSettings {
    fn default() -> Self {
        Self {
            kind: default_filter_wheel_kind(),
            filters: default_filters(),
            settle_per_slot_ms: 0,
        }
    }
}

/// Zoom servo settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoomSettings {
    /// Driver tag (e.g. "SyntheticZoom")
    #[serde(default = "default_zoom_kind")]
    pub kind: String,
    /// Zoom name to servo position
    #[serde(default = "default_zoom_positions")]
    pub positions: BTreeMap<String, f64>,
    /// Zoom applied at startup
    #[serde(default = "default_zoom_name")]
    pub default: String,
}

impl Default for ZoomSettings {
    fn default() -> Self {
        Self {
            kind: default_zoom_kind(),
            positions: default_zoom_positions(),
            default: default_zoom_name(),
        }
    }
}

/// Inclusive travel limits for every stage axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AxisLimits {
    /// Lower x limit
    pub x_min: f64,
    /// Upper x limit
    pub x_max: f64,
    /// Lower y limit
    pub y_min: f64,
    /// Upper y limit
    pub y_max: f64,
    /// Lower z limit
    pub z_min: f64,
    /// Upper z limit
    pub z_max: f64,
    /// Lower theta limit
    pub theta_min: f64,
    /// Upper theta limit
    pub theta_max: f64,
    /// Lower focus limit
    pub f_min: f64,
    /// Upper focus limit
    pub f_max: f64,
}

impl Default for AxisLimits {
    fn default() -> Self {
        Self {
            x_min: -10_000.0,
            x_max: 10_000.0,
            y_min: -10_000.0,
            y_max: 10_000.0,
            z_min: -10_000.0,
            z_max: 10_000.0,
            theta_min: 0.0,
            theta_max: 360.0,
            f_min: -10_000.0,
            f_max: 10_000.0,
        }
    }
}

impl AxisLimits {
    /// `(min, max)` for one axis.
    pub fn bounds(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => (self.x_min, self.x_max),
            Axis::Y => (self.y_min, self.y_max),
            Axis::Z => (self.z_min, self.z_max),
            Axis::Theta => (self.theta_min, self.theta_max),
            Axis::F => (self.f_min, self.f_max),
        }
    }
}

/// Stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Driver tag (e.g. "SyntheticStage")
    #[serde(default = "default_stage_kind")]
    pub kind: String,
    /// Travel limits
    #[serde(default)]
    pub limits: AxisLimits,
    /// Position reported at connection
    #[serde(default)]
    pub initial: StagePosition,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            kind: default_stage_kind(),
            limits: AxisLimits::default(),
            initial: StagePosition::default(),
        }
    }
}

/// Shutter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutterSettings {
    /// Driver tag (e.g. "SyntheticShutter")
    #[serde(default = "default_shutter_kind")]
    pub kind: String,
}

impl Default for ShutterSettings {
    fn default() -> Self {
        Self {
            kind: default_shutter_kind(),
        }
    }
}

/// One laser line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserSettings {
    /// Driver tag (e.g. "SyntheticLaser")
    #[serde(default = "default_laser_kind")]
    pub kind: String,
    /// Wavelength label channels refer to (e.g. "488nm")
    pub wavelength: String,
    /// Maximum output power in mW
    #[serde(default = "default_max_power")]
    pub max_power: f64,
}

/// Handshake timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Maximum wait for a trigger acknowledgment, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_ms: u64,
    /// Maximum wait inside the device layer for new frames, in milliseconds
    #[serde(default = "default_data_poll")]
    pub data_poll_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ack_ms: default_ack_timeout(),
            data_poll_ms: default_data_poll(),
        }
    }
}

impl TimeoutSettings {
    /// Acknowledgment timeout.
    pub fn ack(&self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }

    /// Frame poll timeout.
    pub fn data_poll(&self) -> Duration {
        Duration::from_millis(self.data_poll_ms)
    }
}

/// Device connection retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Attempts before giving up
    #[serde(default = "default_n_tries")]
    pub n_tries: u32,
    /// Delay between attempts (initial delay when exponential), in milliseconds
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    /// Double the delay after every failed attempt
    #[serde(default)]
    pub exponential: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            n_tries: default_n_tries(),
            backoff_ms: default_backoff(),
            exponential: false,
        }
    }
}

/// Ordering of channel switches relative to z-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CyclingMode {
    /// Every selected channel at each z-step
    PerZ,
    /// The full z range for one channel before the next
    #[default]
    PerStack,
}

/// One imaging channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSettings {
    /// Stable channel id
    pub id: usize,
    /// Whether the channel takes part in the acquisition
    #[serde(default)]
    pub is_selected: bool,
    /// Laser wavelength label
    pub laser: String,
    /// Filter name
    pub filter: String,
    /// Camera exposure in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub camera_exposure_time: f64,
    /// Laser power in percent
    #[serde(default = "default_laser_power")]
    pub laser_power: f64,
    /// Interval between repeats, in seconds
    #[serde(default)]
    pub interval_time: f64,
    /// Focus offset added to the shared focus position for this channel
    #[serde(default)]
    pub defocus: f64,
}

/// Z-stack bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZStackSettings {
    /// First z, relative to the position origin
    #[serde(default)]
    pub start_position: f64,
    /// Last z, relative to the position origin
    #[serde(default = "default_end_position")]
    pub end_position: f64,
    /// Distance between z-steps
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Number of z-steps per stack
    #[serde(default = "default_z_steps")]
    pub number_z_steps: u32,
    /// First focus, relative to the position origin
    #[serde(default)]
    pub start_focus: f64,
    /// Last focus, relative to the position origin
    #[serde(default)]
    pub end_focus: f64,
}

impl Default for ZStackSettings {
    fn default() -> Self {
        Self {
            start_position: 0.0,
            end_position: default_end_position(),
            step_size: default_step_size(),
            number_z_steps: default_z_steps(),
            start_focus: 0.0,
            end_focus: 0.0,
        }
    }
}

/// Multi-position table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MultiPositionSettings {
    /// Use the table instead of the current stage position
    #[serde(default)]
    pub enabled: bool,
    /// Stage targets, visited in order
    #[serde(default)]
    pub positions: Vec<StagePosition>,
}

/// Experiment parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSettings {
    /// Channel table
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelSettings>,
    /// Channel/z interleaving
    #[serde(default)]
    pub cycling_mode: CyclingMode,
    /// Z-stack bounds
    #[serde(default)]
    pub z_stack: ZStackSettings,
    /// Multi-position table
    #[serde(default)]
    pub multiposition: MultiPositionSettings,
    /// Zoom used for the acquisition
    #[serde(default = "default_zoom_name")]
    pub zoom: String,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            cycling_mode: CyclingMode::PerStack,
            z_stack: ZStackSettings::default(),
            multiposition: MultiPositionSettings::default(),
            zoom: default_zoom_name(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_daq_kind() -> String {
    "SyntheticDaq".to_string()
}

fn default_sample_rate() -> f64 {
    100_000.0
}

fn default_trigger_latency() -> u64 {
    1
}

fn default_camera_kind() -> String {
    "SyntheticCamera".to_string()
}

fn default_frame_size() -> u32 {
    32
}

fn default_camera_delay_percent() -> f64 {
    10.0
}

fn default_ttl_voltage() -> f64 {
    5.0
}

fn default_galvo_kind() -> String {
    "SyntheticGalvo".to_string()
}

fn default_galvo_waveform() -> String {
    "sawtooth".to_string()
}

fn default_galvo_amplitude() -> f64 {
    1.0
}

fn default_galvo_frequency() -> f64 {
    1.0
}

fn default_duty_cycle() -> f64 {
    50.0
}

fn default_galvo_min_voltage() -> f64 {
    -5.0
}

fn default_galvo_max_voltage() -> f64 {
    5.0
}

fn default_galvos() -> Vec<GalvoSettings> {
    vec![GalvoSettings::default()]
}

fn default_remote_focus_kind() -> String {
    "SyntheticRemoteFocus".to_string()
}

fn default_remote_focus_delay_percent() -> f64 {
    5.0
}

fn default_ramp_falling_percent() -> f64 {
    10.0
}

fn default_filter_wheel_kind() -> String {
    "SyntheticFilterWheel".to_string()
}

fn default_filters() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("Empty".to_string(), 0),
        ("GFP".to_string(), 1),
        ("RFP".to_string(), 2),
        ("Cy5".to_string(), 3),
    ])
}

fn default_zoom_kind() -> String {
    "SyntheticZoom".to_string()
}

fn default_zoom_positions() -> BTreeMap<String, f64> {
    BTreeMap::from([("1x".to_string(), 0.0), ("2x".to_string(), 1000.0)])
}

fn default_zoom_name() -> String {
    "1x".to_string()
}

fn default_stage_kind() -> String {
    "SyntheticStage".to_string()
}

fn default_shutter_kind() -> String {
    "SyntheticShutter".to_string()
}

fn default_laser_kind() -> String {
    "SyntheticLaser".to_string()
}

fn default_max_power() -> f64 {
    100.0
}

fn default_lasers() -> Vec<LaserSettings> {
    ["488nm", "561nm", "642nm"]
        .into_iter()
        .map(|wavelength| LaserSettings {
            kind: default_laser_kind(),
            wavelength: wavelength.to_string(),
            max_power: default_max_power(),
        })
        .collect()
}

fn default_ack_timeout() -> u64 {
    1000
}

fn default_data_poll() -> u64 {
    20
}

fn default_n_tries() -> u32 {
    10
}

fn default_backoff() -> u64 {
    500
}

fn default_exposure_ms() -> f64 {
    10.0
}

fn default_laser_power() -> f64 {
    20.0
}

fn default_end_position() -> f64 {
    9.0
}

fn default_step_size() -> f64 {
    1.0
}

fn default_z_steps() -> u32 {
    10
}

fn default_channels() -> Vec<ChannelSettings> {
    [(1, "488nm", "GFP"), (2, "561nm", "RFP"), (3, "642nm", "Cy5")]
        .into_iter()
        .map(|(id, laser, filter)| ChannelSettings {
            id,
            is_selected: id == 1,
            laser: laser.to_string(),
            filter: filter.to_string(),
            camera_exposure_time: default_exposure_ms(),
            laser_power: default_laser_power(),
            interval_time: 0.0,
            defocus: 0.0,
        })
        .collect()
}

impl Settings {
    /// Load configuration from a TOML file and environment variables
    ///
    /// Environment variables override file values with prefix `LIGHTSHEET_DAQ_`.
    /// Example: `LIGHTSHEET_DAQ_DAQ__SAMPLE_RATE=200000`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LIGHTSHEET_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let settings: Settings = Figment::new().merge(Toml::string(content)).extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.daq.sample_rate.is_nan() || self.daq.sample_rate <= 0.0 {
            return Err(format!(
                "Invalid sample_rate {}. Must be positive",
                self.daq.sample_rate
            ));
        }

        check_voltage_range("camera", self.camera.min_voltage, self.camera.max_voltage)?;
        check_voltage_range(
            "remote_focus",
            self.remote_focus.min_voltage,
            self.remote_focus.max_voltage,
        )?;
        for (index, galvo) in self.galvo.iter().enumerate() {
            check_voltage_range(&format!("galvo {index}"), galvo.min_voltage, galvo.max_voltage)?;
        }

        for axis in Axis::ALL {
            let (min, max) = self.stage.limits.bounds(axis);
            if min > max {
                return Err(format!("Stage axis {axis} has min {min} above max {max}"));
            }
        }

        if self.timeouts.ack_ms == 0 || self.timeouts.data_poll_ms == 0 {
            return Err("Timeouts must be non-zero".to_string());
        }

        if self.connection.n_tries == 0 {
            return Err("connection.n_tries must be at least 1".to_string());
        }

        if !self.zoom.positions.contains_key(&self.zoom.default) {
            return Err(format!("Default zoom '{}' is not configured", self.zoom.default));
        }

        let mut wavelengths = HashSet::new();
        for laser in &self.lasers {
            if !wavelengths.insert(laser.wavelength.as_str()) {
                return Err(format!("Duplicate laser wavelength: {}", laser.wavelength));
            }
        }

        self.check_experiment(&self.experiment)
    }

    /// Validate and convert the error into the application error type.
    pub fn validate_all(&self) -> AppResult<()> {
        self.validate().map_err(DaqError::Configuration)
    }

    /// Check an experiment against this microscope's devices.
    ///
    /// Used at load time and whenever the running microscope receives a new experiment.
    pub fn check_experiment(&self, experiment: &ExperimentSettings) -> Result<(), String> {
        let mut ids = HashSet::new();
        for channel in &experiment.channels {
            if !ids.insert(channel.id) {
                return Err(format!("Duplicate channel id: {}", channel.id));
            }
            if !channel.is_selected {
                continue;
            }
            if !self.filter_wheel.filters.contains_key(&channel.filter) {
                return Err(format!(
                    "Channel {} uses unknown filter '{}'",
                    channel.id, channel.filter
                ));
            }
            if !self.lasers.iter().any(|l| l.wavelength == channel.laser) {
                return Err(format!(
                    "Channel {} uses unknown laser '{}'",
                    channel.id, channel.laser
                ));
            }
            if channel.camera_exposure_time.is_nan() || channel.camera_exposure_time <= 0.0 {
                return Err(format!(
                    "Channel {} has non-positive exposure {}",
                    channel.id, channel.camera_exposure_time
                ));
            }
        }

        if experiment.z_stack.number_z_steps == 0 {
            return Err("z_stack.number_z_steps must be at least 1".to_string());
        }

        if !self.zoom.positions.contains_key(&experiment.zoom) {
            return Err(format!("Experiment zoom '{}' is not configured", experiment.zoom));
        }

        Ok(())
    }
}

fn check_voltage_range(device: &str, min: f64, max: f64) -> Result<(), String> {
    if min >= max {
        return Err(format!(
            "Invalid voltage range for {device}: min {min} must be below max {max}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.experiment.channels.len(), 3);
        assert_eq!(settings.galvo.len(), 1);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_channel_ids() {
        let mut settings = Settings::default();
        let duplicate = settings.experiment.channels[0].clone();
        settings.experiment.channels.push(duplicate);
        assert!(settings.validate().unwrap_err().contains("Duplicate channel id"));
    }

    #[test]
    fn test_selected_channel_with_unknown_filter() {
        let mut settings = Settings::default();
        settings.experiment.channels[0].filter = "Missing".to_string();
        assert!(settings.validate().is_err());

        // Unselected channels are not checked
        settings.experiment.channels[0].is_selected = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_inverted_voltage_range() {
        let mut settings = Settings::default();
        settings.galvo[0].min_voltage = 5.0;
        settings.galvo[0].max_voltage = -5.0;
        let err = settings.validate_all().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [daq]
            sample_rate = 50000.0

            [experiment]
            cycling_mode = "per_z"

            [[experiment.channels]]
            id = 1
            is_selected = true
            laser = "488nm"
            filter = "GFP"
            defocus = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(settings.daq.sample_rate, 50000.0);
        assert_eq!(settings.experiment.cycling_mode, CyclingMode::PerZ);
        assert_eq!(settings.experiment.channels.len(), 1);
        assert_eq!(settings.experiment.channels[0].defocus, 1.5);
        assert_eq!(settings.experiment.channels[0].camera_exposure_time, 10.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_axis_limits_lookup() {
        let limits = AxisLimits::default();
        assert_eq!(limits.bounds(Axis::Theta), (0.0, 360.0));
        assert_eq!(limits.bounds(Axis::Z), (-10_000.0, 10_000.0));
    }
}
