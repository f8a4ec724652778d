//! Waveform computation through the microscope and the devices that consume it.

use lightsheet_daq::config::{RampKind, Settings};
use lightsheet_daq::hardware::capabilities::Stage;
use lightsheet_daq::hardware::synthetic::SyntheticStage;
use lightsheet_daq::hardware::{Axis, StagePosition};
use lightsheet_daq::waveforms::{check_timing_tables, ChannelTimes, SignalKind};
use lightsheet_daq::{DaqError, Microscope};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn scope_with(settings: Settings) -> Microscope {
    Microscope::connect(Arc::new(settings)).await.unwrap()
}

fn all_channels() -> Settings {
    let mut settings = Settings::default();
    for channel in &mut settings.experiment.channels {
        channel.is_selected = true;
    }
    settings.experiment.channels[2].camera_exposure_time = 50.0;
    settings
}

#[tokio::test]
async fn test_recomputing_is_bit_identical() {
    let mut settings = all_channels();
    settings.remote_focus.percent_smoothing = 7.5;
    let mut scope = scope_with(settings).await;

    let first = scope.calculate_all_waveforms().unwrap();
    let second = scope.calculate_all_waveforms().unwrap();

    let bits = |set: &lightsheet_daq::waveforms::WaveformSet| -> Vec<Vec<u64>> {
        set.iter().map(|w| w.samples.iter().map(|s| s.to_bits()).collect()).collect()
    };
    assert_eq!(bits(&first), bits(&second));
}

#[tokio::test]
async fn test_every_sample_within_device_limits() {
    let mut settings = all_channels();
    // Ask for far more swing than the devices allow
    settings.galvo[0].amplitude = 20.0;
    settings.remote_focus.max_voltage = 3.0;
    settings.remote_focus.ramp = RampKind::Triangular;
    let mut scope = scope_with(settings).await;

    let waveforms = scope.calculate_all_waveforms().unwrap();
    assert!(waveforms.iter().count() >= 9);
    for waveform in waveforms.iter() {
        assert!(
            waveform.is_within_bounds(),
            "{} for channel {} leaves [{}, {}]",
            waveform.signal,
            waveform.channel,
            waveform.min_voltage,
            waveform.max_voltage
        );
    }
    let galvo_peak = waveforms.galvos[0][&1].peak().unwrap();
    assert_eq!(galvo_peak, 5.0);
}

#[tokio::test]
async fn test_unselected_channels_get_no_waveforms() {
    let mut settings = Settings::default();
    settings.experiment.channels[2].is_selected = true;
    let mut scope = scope_with(settings).await;

    let waveforms = scope.calculate_all_waveforms().unwrap();
    assert_eq!(waveforms.channels().collect::<Vec<_>>(), vec![1, 3]);
    assert!(waveforms.for_channel(2).is_empty());
    assert!(waveforms
        .for_channel(3)
        .iter()
        .any(|w| w.signal == SignalKind::Camera));
}

#[tokio::test]
async fn test_longer_exposure_gives_longer_sweep() {
    let scope = scope_with(all_channels()).await;
    let (exposures, sweeps) = scope.calculate_exposure_sweep_times();

    assert_eq!(exposures.keys().collect::<Vec<_>>(), vec![&1, &2, &3]);
    assert!(sweeps[&3] > sweeps[&1]);
    for (channel, exposure) in &exposures {
        assert!(sweeps[channel] >= *exposure);
    }
}

#[test]
fn test_mismatched_timing_tables_are_an_error() {
    let exposures = ChannelTimes::from([(1, 0.01), (2, 0.02)]);
    let sweeps = ChannelTimes::from([(1, 0.012)]);
    assert!(matches!(
        check_timing_tables(&exposures, &sweeps),
        Err(DaqError::MissingChannelTiming { channel: 2, .. })
    ));
}

#[tokio::test]
async fn test_stage_limit_is_inclusive() {
    let settings = Settings::default();
    let stage = SyntheticStage::from_settings(&settings.stage);
    let max = settings.stage.limits.x_max;

    assert!(stage
        .move_absolute(&BTreeMap::from([(Axis::X, max)]), true)
        .await
        .unwrap());
    assert_eq!(stage.report_position().await.unwrap().x, max);

    let beyond = f64::from_bits(max.to_bits() + 1);
    assert!(!stage
        .move_absolute(&BTreeMap::from([(Axis::X, beyond), (Axis::Z, 1.0)]), true)
        .await
        .unwrap());
    let position = stage.report_position().await.unwrap();
    assert_eq!(position, StagePosition::new(max, 0.0, 0.0, 0.0, 0.0));
    assert_eq!(stage.moves_issued(), 1);
}
