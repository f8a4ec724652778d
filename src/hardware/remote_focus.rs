//! Remote focus (ETL) ramps.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ChannelSettings, RampConstants, RampKind, RemoteFocusSettings};
use crate::error::AppResult;
use crate::hardware::capabilities::RemoteFocus;
use crate::waveforms::{
    channel_timing, remote_focus_ramp, remote_focus_ramp_triangular, sample_count,
    smooth_waveform, ChannelTimes, RampParams, SignalKind, WaveformDescriptor, WaveformMap,
};

/// Ramps for every selected channel.
///
/// Delay and flyback are percentages of the channel's exposure time. Amplitude and
/// offset come from the per-laser table; a laser without an entry gets a flat ramp at
/// 0 V. Smoothing, when enabled, keeps the unsmoothed sample count.
pub fn remote_focus_waveforms(
    settings: &RemoteFocusSettings,
    sample_rate: f64,
    camera_delay_percent: f64,
    channels: &[ChannelSettings],
    exposure_times: &ChannelTimes,
    sweep_times: &ChannelTimes,
) -> AppResult<WaveformMap> {
    let mut map = WaveformMap::new();
    for channel in channels.iter().filter(|c| c.is_selected) {
        let (exposure, sweep) = channel_timing(channel.id, exposure_times, sweep_times)?;
        let constants = settings.lasers.get(&channel.laser).copied().unwrap_or_else(|| {
            debug!(laser = %channel.laser, "No remote focus constants for laser, using 0 V");
            RampConstants::default()
        });

        let params = RampParams {
            sample_rate,
            exposure_time: exposure,
            sweep_time: sweep,
            delay: settings.delay_percent / 100.0 * exposure,
            camera_delay: camera_delay_percent / 100.0 * exposure,
            fall: settings.ramp_falling_percent / 100.0 * exposure,
            amplitude: constants.amplitude,
            offset: constants.offset,
        };

        let (mut samples, expected_len) = match settings.ramp {
            RampKind::Ramp => (remote_focus_ramp(&params), sample_count(sample_rate, sweep)),
            RampKind::Triangular => (
                remote_focus_ramp_triangular(&params, true),
                2 * sample_count(sample_rate, sweep),
            ),
        };
        if settings.percent_smoothing > 0.0 {
            samples = smooth_waveform(&samples, settings.percent_smoothing);
            samples.truncate(expected_len);
        }

        map.insert(
            channel.id,
            WaveformDescriptor::bounded(
                channel.id,
                SignalKind::RemoteFocus,
                samples,
                settings.min_voltage,
                settings.max_voltage,
            ),
        );
    }
    Ok(map)
}

/// Remote focus without hardware.
pub struct SyntheticRemoteFocus {
    settings: RemoteFocusSettings,
    sample_rate: f64,
    camera_delay_percent: f64,
    output: Mutex<Option<WaveformDescriptor>>,
}

impl SyntheticRemoteFocus {
    /// Create from the `[remote_focus]` section.
    pub fn new(settings: RemoteFocusSettings, sample_rate: f64, camera_delay_percent: f64) -> Self {
        Self {
            settings,
            sample_rate,
            camera_delay_percent,
            output: Mutex::new(None),
        }
    }

    /// Waveform currently output, if any.
    pub fn current_output(&self) -> Option<WaveformDescriptor> {
        self.output.lock().clone()
    }
}

#[async_trait]
impl RemoteFocus for SyntheticRemoteFocus {
    fn adjust(
        &self,
        channels: &[ChannelSettings],
        exposure_times: &ChannelTimes,
        sweep_times: &ChannelTimes,
    ) -> AppResult<WaveformMap> {
        remote_focus_waveforms(
            &self.settings,
            self.sample_rate,
            self.camera_delay_percent,
            channels,
            exposure_times,
            sweep_times,
        )
    }

    async fn apply(&self, waveform: &WaveformDescriptor) -> AppResult<()> {
        *self.output.lock() = Some(waveform.clone());
        Ok(())
    }

    async fn turn_off(&self) -> AppResult<()> {
        *self.output.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentSettings;
    use std::collections::BTreeMap;

    fn settings() -> RemoteFocusSettings {
        RemoteFocusSettings {
            lasers: BTreeMap::from([(
                "488nm".to_string(),
                RampConstants {
                    amplitude: 2.0,
                    offset: 2.5,
                },
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn test_ramp_within_limits_and_sweep_length() {
        let channels = ExperimentSettings::default().channels;
        let exposures = ChannelTimes::from([(1, 0.02)]);
        let sweeps = ChannelTimes::from([(1, 0.025)]);

        let map = remote_focus_waveforms(&settings(), 10_000.0, 10.0, &channels, &exposures, &sweeps).unwrap();
        let ramp = &map[&1];
        assert_eq!(ramp.len(), 250);
        assert!(ramp.is_within_bounds());
        assert!((ramp.peak().unwrap() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_triangular_ramp_is_two_sweeps() {
        let mut settings = settings();
        settings.ramp = RampKind::Triangular;
        settings.percent_smoothing = 5.0;
        let channels = ExperimentSettings::default().channels;
        let exposures = ChannelTimes::from([(1, 0.02)]);
        let sweeps = ChannelTimes::from([(1, 0.025)]);

        let map = remote_focus_waveforms(&settings, 10_000.0, 10.0, &channels, &exposures, &sweeps).unwrap();
        assert_eq!(map[&1].len(), 500);
    }
}
