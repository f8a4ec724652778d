//! Galvo scanners.
//!
//! [`galvo_waveforms`] is the waveform computation shared by every galvo driver;
//! [`SyntheticGalvo`] keeps the last output in memory.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{ChannelSettings, GalvoSettings};
use crate::error::AppResult;
use crate::hardware::capabilities::Galvo;
use crate::waveforms::{
    self, channel_timing, ChannelTimes, SignalKind, WaveformDescriptor, WaveformMap,
};

/// Galvo waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalvoShape {
    /// Sawtooth shifted by the camera delay
    Sawtooth,
    /// Sine with the configured phase
    Sine,
    /// Sawtooth held at `-offset` until its first extremum
    Halfsaw,
}

impl GalvoShape {
    /// Parse a configured shape name; `None` for anything unrecognized.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sawtooth" => Some(GalvoShape::Sawtooth),
            "sine" => Some(GalvoShape::Sine),
            "halfsaw" => Some(GalvoShape::Halfsaw),
            _ => None,
        }
    }
}

/// Waveforms for every selected channel.
///
/// The configured `frequency` counts sweeps per exposure, so the output frequency is
/// `frequency / exposure_time`. Returns `Ok(None)` when the shape is not recognized.
pub fn galvo_waveforms(
    index: usize,
    settings: &GalvoSettings,
    sample_rate: f64,
    camera_delay_percent: f64,
    channels: &[ChannelSettings],
    exposure_times: &ChannelTimes,
    sweep_times: &ChannelTimes,
) -> AppResult<Option<WaveformMap>> {
    let Some(shape) = GalvoShape::parse(&settings.waveform) else {
        return Ok(None);
    };

    let mut map = WaveformMap::new();
    for channel in channels.iter().filter(|c| c.is_selected) {
        let (exposure, sweep) = channel_timing(channel.id, exposure_times, sweep_times)?;
        let frequency = settings.frequency / exposure;
        let camera_delay = camera_delay_percent / 100.0 * exposure;

        let samples = match shape {
            GalvoShape::Sawtooth => waveforms::sawtooth(
                sample_rate,
                sweep,
                frequency,
                settings.amplitude,
                settings.offset,
                settings.duty_cycle,
                camera_delay,
            ),
            GalvoShape::Sine => waveforms::sine_wave(
                sample_rate,
                sweep,
                frequency,
                settings.amplitude,
                settings.offset,
                settings.phase,
            ),
            GalvoShape::Halfsaw => waveforms::halfsaw(
                sample_rate,
                sweep,
                frequency,
                settings.amplitude,
                settings.offset,
                camera_delay,
            ),
        };

        map.insert(
            channel.id,
            WaveformDescriptor::bounded(
                channel.id,
                SignalKind::Galvo(index),
                samples,
                settings.min_voltage,
                settings.max_voltage,
            ),
        );
    }
    Ok(Some(map))
}

/// Galvo without hardware; remembers its last computed map and last output.
pub struct SyntheticGalvo {
    index: usize,
    settings: GalvoSettings,
    sample_rate: f64,
    camera_delay_percent: f64,
    last: Mutex<WaveformMap>,
    output: Mutex<Option<WaveformDescriptor>>,
}

impl SyntheticGalvo {
    /// Create galvo `index` from its settings.
    pub fn new(index: usize, settings: GalvoSettings, sample_rate: f64, camera_delay_percent: f64) -> Self {
        Self {
            index,
            settings,
            sample_rate,
            camera_delay_percent,
            last: Mutex::new(WaveformMap::new()),
            output: Mutex::new(None),
        }
    }

    /// Waveform currently output, if any.
    pub fn current_output(&self) -> Option<WaveformDescriptor> {
        self.output.lock().clone()
    }
}

#[async_trait]
impl Galvo for SyntheticGalvo {
    fn index(&self) -> usize {
        self.index
    }

    fn adjust(
        &self,
        channels: &[ChannelSettings],
        exposure_times: &ChannelTimes,
        sweep_times: &ChannelTimes,
    ) -> AppResult<WaveformMap> {
        match galvo_waveforms(
            self.index,
            &self.settings,
            self.sample_rate,
            self.camera_delay_percent,
            channels,
            exposure_times,
            sweep_times,
        )? {
            Some(map) => {
                *self.last.lock() = map.clone();
                Ok(map)
            }
            None => {
                warn!(
                    galvo = self.index,
                    waveform = %self.settings.waveform,
                    "Unknown galvo waveform, keeping previous waveforms"
                );
                Ok(self.last.lock().clone())
            }
        }
    }

    async fn apply(&self, waveform: &WaveformDescriptor) -> AppResult<()> {
        debug!(galvo = self.index, channel = waveform.channel, samples = waveform.len(), "Galvo output");
        *self.output.lock() = Some(waveform.clone());
        Ok(())
    }

    async fn turn_off(&self) -> AppResult<()> {
        *self.output.lock() = None;
        Ok(())
    }
}
