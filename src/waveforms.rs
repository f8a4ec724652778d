//! Waveform synthesis
//!
//! Pure functions that turn timing parameters into sampled voltage sequences, plus the
//! [`WaveformDescriptor`] that carries a finished, clipped waveform to a device.
//!
//! All shapes are sampled on `t = linspace(0, sweep_time, samples)`. Sample counts use
//! [`sample_count`] (rounded) for whole sweeps; sub-segments (delays, ramps, flyback)
//! truncate like the hardware task timing they mirror, and are then fitted to the sweep
//! length so every waveform for a channel has the same number of samples.
//!
//! Nothing here iterates unordered containers: identical inputs give bit-identical output.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use tracing::warn;

/// Amplitude of the camera trigger pulse in volts.
pub const CAMERA_TRIGGER_VOLTAGE: f64 = 5.0;

/// Physical signal a waveform drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SignalKind {
    /// Camera exposure trigger
    Camera,
    /// Remote focus (ETL) drive
    RemoteFocus,
    /// Galvo drive, by galvo index
    Galvo(usize),
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Camera => f.write_str("camera"),
            SignalKind::RemoteFocus => f.write_str("remote_focus"),
            SignalKind::Galvo(index) => write!(f, "galvo_{index}"),
        }
    }
}

/// Bounded, sampled voltage sequence for one device/channel pair.
///
/// Only constructed through [`WaveformDescriptor::bounded`], which clamps every sample
/// into `[min_voltage, max_voltage]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveformDescriptor {
    /// Channel id the waveform belongs to
    pub channel: usize,
    /// Driven signal
    pub signal: SignalKind,
    /// Voltage samples
    pub samples: Vec<f64>,
    /// Lower device limit
    pub min_voltage: f64,
    /// Upper device limit
    pub max_voltage: f64,
}

impl WaveformDescriptor {
    /// Clamp `samples` to the device limits and wrap them.
    ///
    /// Clamped samples are counted and logged; none are dropped.
    pub fn bounded(
        channel: usize,
        signal: SignalKind,
        mut samples: Vec<f64>,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Self {
        let clamped = clip(&mut samples, min_voltage, max_voltage);
        if clamped > 0 {
            warn!(
                channel,
                signal = %signal,
                clamped,
                min_voltage,
                max_voltage,
                "Waveform samples clamped to device limits"
            );
        }
        Self {
            channel,
            signal,
            samples,
            min_voltage,
            max_voltage,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the waveform has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether every sample lies within the device limits.
    pub fn is_within_bounds(&self) -> bool {
        self.samples
            .iter()
            .all(|v| *v >= self.min_voltage && *v <= self.max_voltage)
    }

    /// Largest sample, or `None` when empty.
    pub fn peak(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }
}

/// Waveforms of one device, keyed by channel id.
pub type WaveformMap = BTreeMap<usize, WaveformDescriptor>;

/// Every waveform of one acquisition: camera trigger, remote focus and each galvo.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaveformSet {
    /// Camera trigger pulses
    pub camera: WaveformMap,
    /// Remote focus ramps
    pub remote_focus: WaveformMap,
    /// Galvo waveforms, indexed like the galvo configuration
    pub galvos: Vec<WaveformMap>,
}

impl WaveformSet {
    /// Channel ids with a camera waveform.
    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.camera.keys().copied()
    }

    /// Every descriptor output for one channel.
    pub fn for_channel(&self, channel: usize) -> Vec<&WaveformDescriptor> {
        self.camera
            .get(&channel)
            .into_iter()
            .chain(self.remote_focus.get(&channel))
            .chain(self.galvos.iter().filter_map(|map| map.get(&channel)))
            .collect()
    }

    /// Every descriptor in the set.
    pub fn iter(&self) -> impl Iterator<Item = &WaveformDescriptor> {
        self.camera
            .values()
            .chain(self.remote_focus.values())
            .chain(self.galvos.iter().flat_map(|map| map.values()))
    }
}

/// Per-channel timing table in seconds, keyed by channel id.
pub type ChannelTimes = BTreeMap<usize, f64>;

/// `(exposure_time, sweep_time)` for one channel.
///
/// Every channel must appear in both tables; a key present in only one is a
/// registration defect and is reported, never skipped.
pub fn channel_timing(
    channel: usize,
    exposure_times: &ChannelTimes,
    sweep_times: &ChannelTimes,
) -> AppResult<(f64, f64)> {
    let exposure = exposure_times
        .get(&channel)
        .copied()
        .ok_or(DaqError::MissingChannelTiming {
            channel,
            missing: "exposure_times",
        })?;
    let sweep = sweep_times
        .get(&channel)
        .copied()
        .ok_or(DaqError::MissingChannelTiming {
            channel,
            missing: "sweep_times",
        })?;
    Ok((exposure, sweep))
}

/// Fail on any channel registered in one timing table but not the other.
pub fn check_timing_tables(exposure_times: &ChannelTimes, sweep_times: &ChannelTimes) -> AppResult<()> {
    if let Some(channel) = exposure_times.keys().find(|k| !sweep_times.contains_key(k)) {
        return Err(DaqError::MissingChannelTiming {
            channel: *channel,
            missing: "sweep_times",
        });
    }
    if let Some(channel) = sweep_times.keys().find(|k| !exposure_times.contains_key(k)) {
        return Err(DaqError::MissingChannelTiming {
            channel: *channel,
            missing: "exposure_times",
        });
    }
    Ok(())
}

/// Samples in one sweep: `round(sweep_time * sample_rate)`.
pub fn sample_count(sample_rate: f64, sweep_time: f64) -> usize {
    let samples = (sample_rate * sweep_time).round();
    if samples.is_finite() && samples > 0.0 {
        samples as usize
    } else {
        0
    }
}

/// Samples covering `duration` seconds, truncated.
///
/// Products landing a hair below an integer (0.05 s at 1 kHz) count as that integer.
fn segment(sample_rate: f64, duration: f64) -> usize {
    let samples = (sample_rate * duration + 1e-6).floor();
    if samples.is_finite() && samples > 0.0 {
        samples as usize
    } else {
        0
    }
}

/// `n` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Clamp every sample into `[min, max]`, returning how many were changed.
pub fn clip(samples: &mut [f64], min: f64, max: f64) -> usize {
    let mut clamped = 0;
    for sample in samples.iter_mut() {
        let bounded = sample.clamp(min, max);
        if bounded != *sample {
            *sample = bounded;
            clamped += 1;
        }
    }
    clamped
}

/// Pad with the final value, or truncate, to exactly `len` samples.
fn fit_length(mut samples: Vec<f64>, len: usize, fill: f64) -> Vec<f64> {
    samples.resize(len, fill);
    samples
}

/// 5 V camera trigger: high from `camera_delay` for `exposure` seconds.
pub fn camera_exposure(sample_rate: f64, sweep_time: f64, exposure: f64, camera_delay: f64) -> Vec<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let mut waveform = vec![0.0; samples];
    let start = segment(sample_rate, camera_delay).min(samples);
    let end = (start + segment(sample_rate, exposure)).min(samples);
    waveform[start..end].fill(CAMERA_TRIGGER_VOLTAGE);
    waveform
}

/// Single pulse with delay and width given in percent of the sweep.
pub fn single_pulse(
    sample_rate: f64,
    sweep_time: f64,
    delay_percent: f64,
    width_percent: f64,
    amplitude: f64,
    offset: f64,
) -> Vec<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let mut waveform = vec![offset; samples];
    let start = ((samples as f64 * delay_percent / 100.0) as usize).min(samples);
    let width = (samples as f64 * width_percent / 100.0) as usize;
    let end = (start + width).min(samples);
    waveform[start..end].fill(amplitude);
    waveform
}

/// Timing and scaling of a remote focus ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampParams {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Exposure in seconds
    pub exposure_time: f64,
    /// Sweep in seconds
    pub sweep_time: f64,
    /// Delay before the ramp, in seconds
    pub delay: f64,
    /// Camera delay, in seconds
    pub camera_delay: f64,
    /// Flyback duration, in seconds
    pub fall: f64,
    /// Half peak-to-peak amplitude
    pub amplitude: f64,
    /// Center voltage
    pub offset: f64,
}

impl RampParams {
    fn ramp_samples(&self) -> usize {
        segment(
            self.sample_rate,
            self.exposure_time + self.camera_delay - self.delay,
        )
    }
}

/// Remote focus sawtooth: hold low for the delay, rise linearly through the exposure,
/// fall back during `fall`, and hold low for the rest of the sweep.
pub fn remote_focus_ramp(params: &RampParams) -> Vec<f64> {
    let low = params.offset - params.amplitude;
    let high = params.offset + params.amplitude;
    let total = sample_count(params.sample_rate, params.sweep_time);

    let delay_samples = segment(params.sample_rate, params.delay);
    let mut waveform = vec![low; delay_samples];
    waveform.extend(linspace(low, high, params.ramp_samples()));
    waveform.extend(linspace(high, low, segment(params.sample_rate, params.fall)));
    fit_length(waveform, total, low)
}

/// Triangular remote focus ramp for bidirectional readout.
///
/// Covers two sweeps: one rising and one falling (or the reverse when `rising` is false).
pub fn remote_focus_ramp_triangular(params: &RampParams, rising: bool) -> Vec<f64> {
    let low = params.offset - params.amplitude;
    let high = params.offset + params.amplitude;
    let sweep = sample_count(params.sample_rate, params.sweep_time);
    let delay_samples = segment(params.sample_rate, params.delay);
    let ramp_samples = params.ramp_samples();
    let settle_samples = sweep.saturating_sub(delay_samples + ramp_samples);

    let half = |from: f64, to: f64| {
        let mut part = vec![from; delay_samples];
        part.extend(linspace(from, to, ramp_samples));
        part.extend(std::iter::repeat(to).take(settle_samples));
        part
    };

    let (first, second) = if rising {
        (half(low, high), half(high, low))
    } else {
        (half(high, low), half(low, high))
    };
    let mut waveform = first;
    waveform.extend(second);
    let fill = waveform.last().copied().unwrap_or(params.offset);
    fit_length(waveform, 2 * sweep, fill)
}

/// Unit sawtooth with the same conventions as `scipy.signal.sawtooth`.
///
/// Rises from -1 to 1 over `width * 2π`, then falls back to -1.
fn sawtooth_unit(x: f64, width: f64) -> f64 {
    let tmod = x.rem_euclid(2.0 * PI);
    if tmod < width * 2.0 * PI {
        tmod / (PI * width) - 1.0
    } else {
        (PI * (width + 1.0) - tmod) / (PI * (1.0 - width))
    }
}

/// Galvo sawtooth.
///
/// `duty_cycle` is in percent, `phase` is a time shift in seconds.
pub fn sawtooth(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    duty_cycle: f64,
    phase: f64,
) -> Vec<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let width = (duty_cycle / 100.0).clamp(0.0, 1.0);
    linspace(0.0, sweep_time, samples)
        .into_iter()
        .map(|t| amplitude * sawtooth_unit(2.0 * PI * frequency * (t - phase), width) + offset)
        .collect()
}

/// Sawtooth held at `-offset` until its first extremum.
pub fn halfsaw(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    phase: f64,
) -> Vec<f64> {
    let mut waveform = sawtooth(sample_rate, sweep_time, frequency, amplitude, offset, 50.0, phase);
    let extremum = if amplitude > 0.0 {
        index_of(&waveform, |a, b| a > b)
    } else {
        index_of(&waveform, |a, b| a < b)
    };
    waveform[..extremum].fill(-offset);
    waveform
}

/// Index of the first sample that wins every `better` comparison.
fn index_of(samples: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = 0;
    for (i, v) in samples.iter().enumerate() {
        if better(*v, samples[best]) {
            best = i;
        }
    }
    best
}

/// Sine wave; `phase` is in radians and subtracted from the argument.
pub fn sine_wave(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    phase: f64,
) -> Vec<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    linspace(0.0, sweep_time, samples)
        .into_iter()
        .map(|t| amplitude * (2.0 * PI * frequency * t - phase).sin() + offset)
        .collect()
}

/// Square wave with `duty_cycle` in percent and `phase` in radians.
pub fn square(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    duty_cycle: f64,
    phase: f64,
) -> Vec<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let duty = (duty_cycle / 100.0).clamp(0.0, 1.0);
    linspace(0.0, sweep_time, samples)
        .into_iter()
        .map(|t| {
            let tmod = (2.0 * PI * frequency * t + phase).rem_euclid(2.0 * PI);
            let level = if tmod < duty * 2.0 * PI { 1.0 } else { -1.0 };
            amplitude * level + offset
        })
        .collect()
}

/// Constant output for a whole sweep.
pub fn dc_value(sample_rate: f64, sweep_time: f64, amplitude: f64) -> Vec<f64> {
    vec![amplitude; sample_count(sample_rate, sweep_time)]
}

/// Moving-average smoothing over `percent_smoothing` percent of the waveform.
///
/// The input is edge-padded by one window on both sides; the result keeps the input length.
pub fn smooth_waveform(waveform: &[f64], percent_smoothing: f64) -> Vec<f64> {
    let len = waveform.len();
    let window = (len as f64 * percent_smoothing / 100.0).ceil();
    if len == 0 || !window.is_finite() || window < 1.0 {
        return waveform.to_vec();
    }
    let window = window as usize;

    let first = waveform[0];
    let last = waveform[len - 1];
    let padded: Vec<f64> = std::iter::repeat(first)
        .take(window)
        .chain(waveform.iter().copied())
        .chain(std::iter::repeat(last).take(window))
        .collect();

    let mut sum: f64 = padded[..window].iter().sum();
    let mut smoothed = Vec::with_capacity(len);
    smoothed.push(sum / window as f64);
    for i in 1..len {
        sum += padded[i + window - 1] - padded[i - 1];
        smoothed.push(sum / window as f64);
    }
    smoothed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_sample_count_rounds() {
        assert_eq!(sample_count(100_000.0, 0.2), 20_000);
        assert_eq!(sample_count(1000.0, 0.0125), 13);
        assert_eq!(sample_count(1000.0, -1.0), 0);
    }

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(-1.0, 1.0, 5);
        assert_eq!(values, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_camera_exposure_pulse_window() {
        // 1 kHz, 100 ms sweep, pulse from 10 ms for 50 ms
        let waveform = camera_exposure(1000.0, 0.1, 0.05, 0.01);
        assert_eq!(waveform.len(), 100);
        assert_eq!(waveform[9], 0.0);
        assert_eq!(waveform[10], CAMERA_TRIGGER_VOLTAGE);
        assert_eq!(waveform[59], CAMERA_TRIGGER_VOLTAGE);
        assert_eq!(waveform[60], 0.0);
    }

    #[test]
    fn test_camera_exposure_longer_than_sweep_is_truncated() {
        let waveform = camera_exposure(1000.0, 0.01, 0.05, 0.005);
        assert_eq!(waveform.len(), 10);
        assert_eq!(waveform[9], CAMERA_TRIGGER_VOLTAGE);
    }

    #[test]
    fn test_single_pulse_percentages() {
        let waveform = single_pulse(1000.0, 0.1, 10.0, 20.0, 3.0, 0.5);
        assert_eq!(waveform[9], 0.5);
        assert_eq!(waveform[10], 3.0);
        assert_eq!(waveform[29], 3.0);
        assert_eq!(waveform[30], 0.5);
    }

    #[test]
    fn test_remote_focus_ramp_shape() {
        let params = RampParams {
            sample_rate: 1000.0,
            exposure_time: 0.05,
            sweep_time: 0.1,
            delay: 0.005,
            camera_delay: 0.005,
            fall: 0.01,
            amplitude: 1.0,
            offset: 2.0,
        };
        let waveform = remote_focus_ramp(&params);
        assert_eq!(waveform.len(), 100);
        // Delay holds low
        assert!((waveform[0] - 1.0).abs() < EPS);
        // Ramp of 50 samples peaks at offset + amplitude at its end
        assert!((waveform[54] - 3.0).abs() < EPS);
        // Flyback returns low, then the remainder holds low
        assert!((waveform[64] - 1.0).abs() < EPS);
        assert!((waveform[99] - 1.0).abs() < EPS);
    }

    #[test]
    fn test_triangular_ramp_covers_two_sweeps() {
        let params = RampParams {
            sample_rate: 1000.0,
            exposure_time: 0.05,
            sweep_time: 0.08,
            delay: 0.0,
            camera_delay: 0.0,
            fall: 0.0,
            amplitude: 1.0,
            offset: 0.0,
        };
        let waveform = remote_focus_ramp_triangular(&params, true);
        assert_eq!(waveform.len(), 160);
        assert!((waveform[0] + 1.0).abs() < EPS);
        assert!((waveform[49] - 1.0).abs() < EPS);
        assert!((waveform[80] - 1.0).abs() < EPS);
        assert!((waveform[129] + 1.0).abs() < EPS);
    }

    #[test]
    fn test_sawtooth_matches_reference_points() {
        // Symmetric width: triangle from -1 through 1 back to -1
        assert!((sawtooth_unit(0.0, 0.5) + 1.0).abs() < EPS);
        assert!((sawtooth_unit(PI, 0.5) - 1.0).abs() < EPS);
        assert!((sawtooth_unit(PI / 2.0, 0.5)).abs() < EPS);
        // Full width: rising ramp only
        assert!((sawtooth_unit(PI, 1.0)).abs() < EPS);
        // Zero width: falling ramp only
        assert!((sawtooth_unit(0.0, 0.0) - 1.0).abs() < EPS);
    }

    #[test]
    fn test_sawtooth_scaling() {
        let waveform = sawtooth(1000.0, 0.1, 10.0, 2.0, 0.5, 50.0, 0.0);
        assert_eq!(waveform.len(), 100);
        let max = waveform.iter().copied().fold(f64::MIN, f64::max);
        let min = waveform.iter().copied().fold(f64::MAX, f64::min);
        assert!(max <= 2.5 + EPS);
        assert!(min >= -1.5 - EPS);
    }

    #[test]
    fn test_halfsaw_holds_until_peak() {
        let waveform = halfsaw(1000.0, 0.1, 10.0, 1.0, 0.25, 0.0);
        assert_eq!(waveform[0], -0.25);
        let peak = index_of(&waveform, |a, b| a > b);
        assert!(peak > 0);
        assert!(waveform[..peak].iter().all(|v| *v == -0.25));
    }

    #[test]
    fn test_sine_wave_quarter_period() {
        let waveform = sine_wave(1001.0, 1.0, 1.0, 2.0, 0.0, 0.0);
        assert_eq!(waveform.len(), 1001);
        assert!((waveform[250] - 2.0).abs() < 1e-3);
        assert!((waveform[500]).abs() < 1e-3);
    }

    #[test]
    fn test_square_duty_cycle() {
        let waveform = square(1000.0, 1.0, 1.0, 1.0, 0.0, 25.0, 0.0);
        let high = waveform.iter().filter(|v| **v > 0.0).count();
        assert!((240..=260).contains(&high), "high samples: {high}");
    }

    #[test]
    fn test_dc_value() {
        assert_eq!(dc_value(1000.0, 0.005, 1.2), vec![1.2; 5]);
    }

    #[test]
    fn test_smooth_waveform_keeps_length_and_constants() {
        let flat = vec![1.5; 40];
        assert_eq!(smooth_waveform(&flat, 10.0), flat);

        let step: Vec<f64> = (0..40).map(|i| if i < 20 { 0.0 } else { 1.0 }).collect();
        let smoothed = smooth_waveform(&step, 10.0);
        assert_eq!(smoothed.len(), 40);
        assert!(smoothed.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(smoothed.windows(2).all(|w| w[1] >= w[0] - EPS));
    }

    #[test]
    fn test_smooth_waveform_zero_percent_is_identity() {
        let values = vec![0.0, 1.0, 0.0];
        assert_eq!(smooth_waveform(&values, 0.0), values);
    }

    #[test]
    fn test_timing_tables_must_agree() {
        let exposures = ChannelTimes::from([(1, 0.01), (2, 0.02)]);
        let sweeps = ChannelTimes::from([(1, 0.015)]);

        assert_eq!(channel_timing(1, &exposures, &sweeps).unwrap(), (0.01, 0.015));
        assert!(matches!(
            channel_timing(2, &exposures, &sweeps),
            Err(DaqError::MissingChannelTiming {
                channel: 2,
                missing: "sweep_times"
            })
        ));
        assert!(check_timing_tables(&exposures, &sweeps).is_err());
        assert!(check_timing_tables(&sweeps, &sweeps).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_bounded_descriptor_clamps() {
        let descriptor = WaveformDescriptor::bounded(
            1,
            SignalKind::Galvo(0),
            vec![-7.0, 0.0, 7.0],
            -5.0,
            5.0,
        );
        assert_eq!(descriptor.samples, vec![-5.0, 0.0, 5.0]);
        assert!(descriptor.is_within_bounds());
        assert_eq!(descriptor.peak(), Some(5.0));
        assert!(logs_contain("Waveform samples clamped"));
    }
}
