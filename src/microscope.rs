//! Microscope orchestrator.
//!
//! [`Microscope`] owns the connected [`DeviceSet`], the active experiment and the
//! acquisition-scoped state the feature tree works against: the channel cycle, the
//! tracked stage position, the focus plane and the event log.
//!
//! Feature nodes never touch devices directly; they go through the methods here so that
//! every stage move and channel switch is tracked and recorded.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = Arc::new(Settings::load_from("config/microscope.toml")?);
//! let mut scope = Microscope::connect(settings).await?;
//! let report = scope
//!     .run_acquisition(&[FeatureSpec::node("ZStackAcquisition")], &FeatureRegistry::with_builtins(), Box::new(MemorySink::new()))
//!     .await?;
//! println!("{} frames", report.frames_written);
//! ```

use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ChannelSettings, ExperimentSettings, Settings};
use crate::engine::{self, FrameCounters};
use crate::error::{AppResult, DaqError};
use crate::features::{build_trees, FeatureContext, FeatureRegistry, FeatureSpec};
use crate::hardware::daq::{camera_waveforms, TaskGuard};
use crate::hardware::registry::{DeviceRegistry, DeviceSet};
use crate::hardware::{Axis, StagePosition};
use crate::report::{AcquisitionEvent, AcquisitionReport};
use crate::sink::DataSink;
use crate::waveforms::{check_timing_tables, ChannelTimes, WaveformSet};

/// Requests cancellation of a running acquisition from another task.
#[derive(Clone)]
pub struct AbortHandle(Arc<watch::Sender<bool>>);

impl AbortHandle {
    /// Stop the acquisition at the start of its next tick.
    ///
    /// A trigger already in flight still completes.
    pub fn abort(&self) {
        self.0.send_replace(true);
    }
}

/// The microscope and its acquisition state.
pub struct Microscope {
    settings: Arc<Settings>,
    experiment: ExperimentSettings,
    devices: DeviceSet,
    selected: Vec<usize>,
    cycle_index: Option<usize>,
    current_channel: Option<usize>,
    position: StagePosition,
    central_focus: f64,
    focus_plane: f64,
    skip_trigger: bool,
    waveforms: WaveformSet,
    task_guard: Option<TaskGuard>,
    abort: Arc<watch::Sender<bool>>,
    counters: Arc<FrameCounters>,
    events: Vec<AcquisitionEvent>,
}

impl Microscope {
    /// Wrap an already connected device set.
    pub fn new(settings: Arc<Settings>, devices: DeviceSet) -> Self {
        let experiment = settings.experiment.clone();
        let selected = selected_ids(&experiment.channels);
        let (abort, _) = watch::channel(false);
        Self {
            settings,
            experiment,
            devices,
            selected,
            cycle_index: None,
            current_channel: None,
            position: StagePosition::default(),
            central_focus: 0.0,
            focus_plane: 0.0,
            skip_trigger: false,
            waveforms: WaveformSet::default(),
            task_guard: None,
            abort: Arc::new(abort),
            counters: Arc::default(),
            events: Vec::new(),
        }
    }

    /// Validate the settings, then connect every configured device.
    pub async fn connect(settings: Arc<Settings>) -> AppResult<Self> {
        settings.validate_all()?;
        let devices = DeviceRegistry::new(settings.clone()).build().await?;
        let mut scope = Self::new(settings, devices);
        scope.position = scope.devices.stage.report_position().await?;
        Ok(scope)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Static settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Active experiment.
    pub fn experiment(&self) -> &ExperimentSettings {
        &self.experiment
    }

    /// Connected devices.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Selected channel ids in ascending order.
    pub fn selected_channels(&self) -> &[usize] {
        &self.selected
    }

    /// Channel the hardware is configured for.
    pub fn current_channel(&self) -> Option<usize> {
        self.current_channel
    }

    /// Last commanded stage position.
    pub fn position(&self) -> StagePosition {
        self.position
    }

    /// Focus captured when the acquisition started.
    pub fn central_focus(&self) -> f64 {
        self.central_focus
    }

    /// Shared focus plane; each channel adds its defocus on top.
    pub fn focus_plane(&self) -> f64 {
        self.focus_plane
    }

    /// Waveforms computed by the last [`Self::calculate_all_waveforms`].
    pub fn waveforms(&self) -> &WaveformSet {
        &self.waveforms
    }

    /// Events recorded since the acquisition started.
    pub fn events(&self) -> &[AcquisitionEvent] {
        &self.events
    }

    /// Frame counters of the running (or last) acquisition.
    pub fn frame_counters(&self) -> Arc<FrameCounters> {
        self.counters.clone()
    }

    /// Handle for cancelling acquisitions from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    pub(crate) fn abort_receiver(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    /// Replace the experiment.
    ///
    /// The new experiment is checked against the configured devices first; on error
    /// the previous experiment stays active.
    pub fn update_state(&mut self, experiment: ExperimentSettings) -> AppResult<()> {
        self.settings
            .check_experiment(&experiment)
            .map_err(DaqError::Configuration)?;
        self.selected = selected_ids(&experiment.channels);
        self.experiment = experiment;
        self.reset_channel_cycle();
        info!(selected = ?self.selected, "Experiment updated");
        Ok(())
    }

    /// Select or deselect one channel.
    pub fn update_channel_selection(&mut self, channel: usize, selected: bool) -> AppResult<()> {
        let mut experiment = self.experiment.clone();
        let entry = experiment
            .channels
            .iter_mut()
            .find(|c| c.id == channel)
            .ok_or(DaqError::UnknownChannel(channel))?;
        entry.is_selected = selected;
        self.update_state(experiment)
    }

    fn channel(&self, id: usize) -> AppResult<&ChannelSettings> {
        self.experiment
            .channels
            .iter()
            .find(|c| c.id == id)
            .ok_or(DaqError::UnknownChannel(id))
    }

    fn current_defocus(&self) -> f64 {
        self.current_channel
            .and_then(|id| self.channel(id).ok())
            .map_or(0.0, |c| c.defocus)
    }

    // =========================================================================
    // Waveforms
    // =========================================================================

    /// Exposure and sweep time for every selected channel, in seconds.
    ///
    /// The sweep covers the exposure, the camera readout and the longest of: remote
    /// focus flyback plus settle, camera settle, camera delay. A non-zero smoothing
    /// percentage stretches it so the smoothed edges still fit.
    pub fn calculate_exposure_sweep_times(&self) -> (ChannelTimes, ChannelTimes) {
        let camera = &self.settings.camera;
        let remote_focus = &self.settings.remote_focus;
        let mut exposure_times = ChannelTimes::new();
        let mut sweep_times = ChannelTimes::new();

        for channel in self.experiment.channels.iter().filter(|c| c.is_selected) {
            let exposure = channel.camera_exposure_time / 1000.0;
            let camera_delay = camera.delay_percent / 100.0 * exposure;
            let flyback =
                remote_focus.ramp_falling_percent / 100.0 * exposure + remote_focus.settle_duration_ms / 1000.0;
            let camera_settle = camera.settle_duration_ms / 1000.0;

            let mut sweep = exposure + camera.readout_time + flyback.max(camera_settle).max(camera_delay);
            if remote_focus.percent_smoothing > 0.0 {
                sweep *= 1.0 + remote_focus.percent_smoothing / 100.0;
            }

            exposure_times.insert(channel.id, exposure + camera.readout_time);
            sweep_times.insert(channel.id, sweep);
        }
        (exposure_times, sweep_times)
    }

    /// Compute the camera, remote focus and galvo waveforms of every selected channel.
    pub fn calculate_all_waveforms(&mut self) -> AppResult<WaveformSet> {
        let (exposure_times, sweep_times) = self.calculate_exposure_sweep_times();
        check_timing_tables(&exposure_times, &sweep_times)?;

        let channels = &self.experiment.channels;
        let camera = camera_waveforms(
            &self.settings.camera,
            self.devices.daq.sample_rate(),
            channels,
            &exposure_times,
            &sweep_times,
        )?;
        let remote_focus = self.devices.remote_focus.adjust(channels, &exposure_times, &sweep_times)?;
        let galvos = self
            .devices
            .galvos
            .iter()
            .map(|galvo| galvo.adjust(channels, &exposure_times, &sweep_times))
            .collect::<AppResult<Vec<_>>>()?;

        self.waveforms = WaveformSet {
            camera,
            remote_focus,
            galvos,
        };
        debug!(channels = self.waveforms.camera.len(), "Waveforms computed");
        Ok(self.waveforms.clone())
    }

    // =========================================================================
    // Signal-side actions
    // =========================================================================

    /// Forget the channel cycle; the next switch goes to the first selected channel.
    pub fn reset_channel_cycle(&mut self) {
        self.cycle_index = None;
    }

    /// Advance the channel cycle and configure the hardware for the new channel.
    ///
    /// Returns the new index within the selected channels. When the cycle lands on the
    /// channel already active nothing is sent to the hardware. Otherwise the filter is
    /// set first, so an unknown filter fails before any other device is touched.
    pub async fn prepare_next_channel(&mut self) -> AppResult<usize> {
        if self.selected.is_empty() {
            return Err(DaqError::Configuration("No channel selected".into()));
        }
        let index = self.cycle_index.map_or(0, |i| (i + 1) % self.selected.len());
        self.cycle_index = Some(index);
        let id = self.selected[index];
        if self.current_channel == Some(id) {
            return Ok(index);
        }

        let channel = self.channel(id)?.clone();
        self.devices.filter_wheel.set_filter(&channel.filter, true).await?;
        self.devices
            .camera
            .set_exposure(channel.camera_exposure_time / 1000.0)
            .await?;

        for (wavelength, laser) in &self.devices.lasers {
            if *wavelength == channel.laser {
                laser.set_power(channel.laser_power).await?;
                laser.turn_on().await?;
            } else if laser.is_on() {
                laser.turn_off().await?;
            }
        }

        for (galvo, map) in self.devices.galvos.iter().zip(&self.waveforms.galvos) {
            if let Some(waveform) = map.get(&id) {
                galvo.apply(waveform).await?;
            }
        }
        if let Some(waveform) = self.waveforms.remote_focus.get(&id) {
            self.devices.remote_focus.apply(waveform).await?;
        }
        self.devices.daq.prepare(id).await?;

        self.current_channel = Some(id);
        let focus = BTreeMap::from([(Axis::F, self.focus_plane + channel.defocus)]);
        if !self.move_stage(&focus, true).await? {
            warn!(channel = id, "Defocus move rejected, keeping current focus");
        }

        info!(channel = id, filter = %channel.filter, laser = %channel.laser, "Channel changed");
        self.record(AcquisitionEvent::ChangeChannel { channel: id });
        Ok(index)
    }

    /// Move the stage and track the new position. `Ok(false)` when the move was rejected.
    pub async fn move_stage(&mut self, targets: &BTreeMap<Axis, f64>, wait_until_done: bool) -> AppResult<bool> {
        let accepted = self.devices.stage.move_absolute(targets, wait_until_done).await?;
        if accepted {
            self.position.apply(targets);
        }
        Ok(accepted)
    }

    /// Lateral move to a position origin (x, y, theta).
    pub async fn move_to_position(&mut self, target: &StagePosition) -> AppResult<bool> {
        let targets = BTreeMap::from([
            (Axis::X, target.x),
            (Axis::Y, target.y),
            (Axis::Theta, target.theta),
        ]);
        let accepted = self.move_stage(&targets, true).await?;
        if accepted {
            self.record(AcquisitionEvent::MovePosition {
                x: target.x,
                y: target.y,
                theta: target.theta,
            });
        }
        Ok(accepted)
    }

    /// Move z and set the focus plane; the current channel's defocus is added to f.
    pub async fn move_focus(&mut self, z: f64, focus_plane: f64) -> AppResult<bool> {
        let targets = BTreeMap::from([(Axis::Z, z), (Axis::F, focus_plane + self.current_defocus())]);
        let accepted = self.move_stage(&targets, true).await?;
        if accepted {
            self.focus_plane = focus_plane;
            self.record(AcquisitionEvent::MoveZ { z, f: focus_plane });
        }
        Ok(accepted)
    }

    /// Return z and f to where a stack started, without waiting for the move.
    pub async fn restore_focus(&mut self, z: f64, f: f64) -> AppResult<bool> {
        let targets = BTreeMap::from([(Axis::Z, z), (Axis::F, f)]);
        let accepted = self.move_stage(&targets, false).await?;
        if accepted {
            self.focus_plane = f;
            self.record(AcquisitionEvent::Restore { z, f });
        }
        Ok(accepted)
    }

    /// Move the zoom servo.
    pub async fn set_zoom(&mut self, name: &str) -> AppResult<()> {
        self.devices.zoom.set_zoom(name, true).await
    }

    /// Suppress the trigger of the current tick.
    pub fn skip_trigger(&mut self) {
        self.skip_trigger = true;
    }

    pub(crate) fn take_skip_trigger(&mut self) -> bool {
        std::mem::take(&mut self.skip_trigger)
    }

    /// Append an event to the log.
    pub fn record(&mut self, event: AcquisitionEvent) {
        self.events.push(event);
    }

    pub(crate) fn record_trigger(&mut self, frame_id: u64) {
        let event = AcquisitionEvent::Trigger {
            frame_id,
            channel: self.current_channel,
            z: self.position.z,
            f: self.focus_plane,
        };
        self.record(event);
    }

    // =========================================================================
    // Acquisition lifecycle
    // =========================================================================

    /// Bring the hardware into the armed state.
    ///
    /// Caches the starting stage position and focus, moves the zoom, loads the
    /// waveforms, arms the camera, opens the DAQ tasks and the shutter.
    pub async fn prepare_acquisition(&mut self) -> AppResult<()> {
        let first = *self
            .selected
            .first()
            .ok_or_else(|| DaqError::Configuration("No channel selected".into()))?;

        self.events.clear();
        self.skip_trigger = false;
        self.abort.send_replace(false);
        self.reset_channel_cycle();
        self.current_channel = None;

        self.position = self.devices.stage.report_position().await?;
        self.central_focus = self.position.f;
        self.focus_plane = self.central_focus;

        let zoom = self.experiment.zoom.clone();
        self.set_zoom(&zoom).await?;

        let waveforms = self.calculate_all_waveforms()?;
        self.devices.daq.load_waveforms(waveforms).await?;

        let exposure = self.channel(first)?.camera_exposure_time / 1000.0;
        self.devices.camera.arm(exposure).await?;
        self.task_guard = Some(TaskGuard::start(self.devices.daq.clone()).await?);
        self.devices.shutter.open_shutter().await?;

        info!(
            channels = ?self.selected,
            central_focus = self.central_focus,
            "Acquisition prepared"
        );
        Ok(())
    }

    /// Return the hardware to idle.
    ///
    /// Every step runs even when an earlier one fails; the first error is returned.
    pub async fn end_acquisition(&mut self) -> AppResult<()> {
        let mut first_error: Option<DaqError> = None;
        let mut keep = |result: AppResult<()>| {
            if let Err(e) = result {
                warn!(error = %e, "Error while ending acquisition");
                first_error.get_or_insert(e);
            }
        };

        if let Some(guard) = self.task_guard.take() {
            keep(guard.release().await);
        }

        let focus = BTreeMap::from([(Axis::F, self.central_focus)]);
        match self.move_stage(&focus, false).await {
            Ok(true) => {}
            Ok(false) => warn!(f = self.central_focus, "Could not return to the central focus"),
            Err(e) => keep(Err(e)),
        }

        keep(self.devices.camera.close_image_series().await);
        keep(self.devices.shutter.close_shutter().await);
        keep(
            try_join_all(self.devices.lasers.values().map(|laser| laser.turn_off()))
                .await
                .map(|_| ()),
        );
        for galvo in &self.devices.galvos {
            keep(galvo.turn_off().await);
        }
        keep(self.devices.remote_focus.turn_off().await);

        self.current_channel = None;
        self.reset_channel_cycle();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one acquisition described by `features`.
    ///
    /// The feature trees are built before any hardware is touched. Once the hardware is
    /// prepared, [`Self::end_acquisition`] runs on every exit path.
    pub async fn run_acquisition(
        &mut self,
        features: &[FeatureSpec],
        registry: &FeatureRegistry,
        sink: Box<dyn DataSink>,
    ) -> AppResult<AcquisitionReport> {
        let id = Uuid::new_v4();
        let span = info_span!("acquisition", %id);

        async move {
            let started = Utc::now();
            let context = FeatureContext {
                settings: &self.settings,
                experiment: &self.experiment,
            };
            let (signal, data) = build_trees(features, registry, &context)?;

            let outcome = match self.prepare_acquisition().await {
                Ok(()) => engine::run(self, signal, data, sink).await,
                Err(e) => Err(e),
            };
            let ended = self.end_acquisition().await;
            let outcome = outcome?;
            ended?;

            let report = AcquisitionReport {
                id,
                started,
                finished: Utc::now(),
                frames_triggered: outcome.frames_triggered,
                frames_written: outcome.frames_written,
                events: self.events.clone(),
            };
            info!(
                frames = report.frames_written,
                elapsed_ms = report.elapsed().num_milliseconds(),
                "Acquisition finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

fn selected_ids(channels: &[ChannelSettings]) -> Vec<usize> {
    let mut ids: Vec<usize> = channels.iter().filter(|c| c.is_selected).map(|c| c.id).collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scope_with(settings: Settings) -> Microscope {
        Microscope::connect(Arc::new(settings)).await.unwrap()
    }

    fn two_channels() -> Settings {
        let mut settings = Settings::default();
        settings.experiment.channels[1].is_selected = true;
        settings
    }

    #[tokio::test]
    async fn test_sweep_time_includes_readout_and_delay() {
        let mut settings = Settings::default();
        settings.camera.readout_time = 0.002;
        let scope = scope_with(settings).await;

        let (exposures, sweeps) = scope.calculate_exposure_sweep_times();
        // 10 ms exposure + 2 ms readout + 1 ms flyback
        assert!((exposures[&1] - 0.012).abs() < 1e-12);
        assert!((sweeps[&1] - 0.013).abs() < 1e-12);
        assert!(!sweeps.contains_key(&2));
    }

    #[tokio::test]
    async fn test_smoothing_stretches_sweep() {
        let mut settings = Settings::default();
        settings.remote_focus.percent_smoothing = 10.0;
        let scope = scope_with(settings).await;
        let (_, sweeps) = scope.calculate_exposure_sweep_times();
        assert!((sweeps[&1] - 0.011 * 1.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_channel_cycle_wraps_in_ascending_order() {
        let mut scope = scope_with(two_channels()).await;
        scope.prepare_acquisition().await.unwrap();

        assert_eq!(scope.prepare_next_channel().await.unwrap(), 0);
        assert_eq!(scope.current_channel(), Some(1));
        assert_eq!(scope.prepare_next_channel().await.unwrap(), 1);
        assert_eq!(scope.current_channel(), Some(2));
        assert_eq!(scope.prepare_next_channel().await.unwrap(), 0);
        assert_eq!(scope.current_channel(), Some(1));
        assert_eq!(scope.events().len(), 3);

        scope.end_acquisition().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_channel_is_not_reapplied() {
        let mut scope = scope_with(Settings::default()).await;
        scope.prepare_acquisition().await.unwrap();

        scope.prepare_next_channel().await.unwrap();
        scope.prepare_next_channel().await.unwrap();
        assert_eq!(scope.events(), &[AcquisitionEvent::ChangeChannel { channel: 1 }]);

        scope.end_acquisition().await.unwrap();
    }

    #[tokio::test]
    async fn test_defocus_is_added_to_focus_plane() {
        let mut settings = two_channels();
        settings.experiment.channels[1].defocus = 5.0;
        let mut scope = scope_with(settings).await;
        scope.prepare_acquisition().await.unwrap();

        scope.prepare_next_channel().await.unwrap();
        assert_eq!(scope.position().f, 0.0);
        scope.prepare_next_channel().await.unwrap();
        assert_eq!(scope.position().f, 5.0);
        assert_eq!(scope.focus_plane(), 0.0);

        scope.end_acquisition().await.unwrap();
        assert_eq!(scope.position().f, 0.0);
    }

    #[tokio::test]
    async fn test_update_state_rejects_unknown_filter() {
        let mut scope = scope_with(Settings::default()).await;
        let mut experiment = scope.experiment().clone();
        experiment.channels[0].filter = "Cy7".into();

        assert!(scope.update_state(experiment).is_err());
        assert_eq!(scope.experiment().channels[0].filter, "GFP");
    }

    #[tokio::test]
    async fn test_channel_selection() {
        let mut scope = scope_with(Settings::default()).await;
        scope.update_channel_selection(3, true).unwrap();
        assert_eq!(scope.selected_channels(), &[1, 3]);
        assert!(matches!(
            scope.update_channel_selection(9, true),
            Err(DaqError::UnknownChannel(9))
        ));
    }

    #[tokio::test]
    async fn test_end_acquisition_releases_hardware() {
        let mut scope = scope_with(Settings::default()).await;
        scope.prepare_acquisition().await.unwrap();
        scope.prepare_next_channel().await.unwrap();
        assert!(scope.devices().daq.tasks_open());
        assert!(scope.devices().shutter.is_open());

        scope.end_acquisition().await.unwrap();
        assert!(!scope.devices().daq.tasks_open());
        assert!(!scope.devices().shutter.is_open());
        assert!(!scope.devices().camera.is_acquiring());
        assert!(scope.devices().lasers.values().all(|l| !l.is_on()));
    }
}
