//! DAQ board: camera trigger waveforms, task lifecycle and the synthetic board.
//!
//! The board owns the hardware task handle. [`TaskGuard`] scopes it to one acquisition:
//! it opens the tasks on creation and closes them on every exit path, including early
//! returns and unwinding.
//!
//! ```rust,ignore
//! let guard = TaskGuard::start(daq.clone()).await?;
//! daq.prepare(channel).await?;
//! daq.run_acquisition().await?;
//! guard.release().await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{CameraSettings, ChannelSettings, DaqSettings};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Daq;
use crate::waveforms::{
    camera_exposure, channel_timing, ChannelTimes, SignalKind, WaveformDescriptor, WaveformMap,
    WaveformSet,
};

/// Camera trigger pulses for every selected channel.
///
/// The pulse starts after the camera delay and stays high for the channel's exposure.
pub fn camera_waveforms(
    camera: &CameraSettings,
    sample_rate: f64,
    channels: &[ChannelSettings],
    exposure_times: &ChannelTimes,
    sweep_times: &ChannelTimes,
) -> AppResult<WaveformMap> {
    let mut map = WaveformMap::new();
    for channel in channels.iter().filter(|c| c.is_selected) {
        let (exposure, sweep) = channel_timing(channel.id, exposure_times, sweep_times)?;
        let samples = camera_exposure(sample_rate, sweep, exposure, camera.delay_seconds(exposure));
        map.insert(
            channel.id,
            WaveformDescriptor::bounded(
                channel.id,
                SignalKind::Camera,
                samples,
                camera.min_voltage,
                camera.max_voltage,
            ),
        );
    }
    Ok(map)
}

// =============================================================================
// Task scoping
// =============================================================================

/// Scoped ownership of the DAQ task handle.
pub struct TaskGuard {
    daq: Arc<dyn Daq>,
    released: bool,
}

impl TaskGuard {
    /// Open the board's tasks.
    pub async fn start(daq: Arc<dyn Daq>) -> AppResult<Self> {
        daq.start_tasks().await?;
        Ok(Self {
            daq,
            released: false,
        })
    }

    /// Stop output and close the tasks.
    ///
    /// The handle is closed even when stopping fails; the stop error is returned.
    pub async fn release(mut self) -> AppResult<()> {
        self.released = true;
        let stopped = self.daq.stop_tasks().await;
        self.daq.close_tasks();
        stopped
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!("DAQ tasks released without an orderly stop");
            self.daq.close_tasks();
        }
    }
}

// =============================================================================
// SyntheticDaq
// =============================================================================

/// DAQ board without hardware.
///
/// A sweep takes `trigger_latency`; every board call is counted.
pub struct SyntheticDaq {
    sample_rate: f64,
    trigger_latency: Duration,
    waveforms: Mutex<WaveformSet>,
    active_channel: Mutex<Option<usize>>,
    tasks_open: AtomicBool,
    sweeps: AtomicU64,
    calls: AtomicU64,
}

impl SyntheticDaq {
    /// Create from the `[daq]` section.
    pub fn from_settings(settings: &DaqSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            trigger_latency: Duration::from_millis(settings.trigger_latency_ms),
            waveforms: Mutex::new(WaveformSet::default()),
            active_channel: Mutex::new(None),
            tasks_open: AtomicBool::new(false),
            sweeps: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Sweeps output so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Board calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Channel selected for the next sweep.
    pub fn active_channel(&self) -> Option<usize> {
        *self.active_channel.lock()
    }

    /// Copy of the loaded waveforms.
    pub fn loaded_waveforms(&self) -> WaveformSet {
        self.waveforms.lock().clone()
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Daq for SyntheticDaq {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    async fn load_waveforms(&self, waveforms: WaveformSet) -> AppResult<()> {
        self.count();
        *self.waveforms.lock() = waveforms;
        Ok(())
    }

    async fn prepare(&self, channel: usize) -> AppResult<()> {
        self.count();
        if !self.waveforms.lock().camera.contains_key(&channel) {
            return Err(DaqError::UnknownChannel(channel));
        }
        *self.active_channel.lock() = Some(channel);
        debug!(channel, "DAQ prepared channel");
        Ok(())
    }

    async fn start_tasks(&self) -> AppResult<()> {
        self.count();
        self.tasks_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_acquisition(&self) -> AppResult<()> {
        self.count();
        if !self.tasks_open() {
            return Err(DaqError::Instrument("DAQ tasks are not open".into()));
        }
        if self.active_channel().is_none() {
            return Err(DaqError::Instrument("No channel prepared for output".into()));
        }
        sleep(self.trigger_latency).await;
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_tasks(&self) -> AppResult<()> {
        self.count();
        Ok(())
    }

    fn close_tasks(&self) {
        self.tasks_open.store(false, Ordering::SeqCst);
        *self.active_channel.lock() = None;
    }

    fn tasks_open(&self) -> bool {
        self.tasks_open.load(Ordering::SeqCst)
    }
}
