//! Acquisitions that stop early: trigger timeouts, device faults, feature errors,
//! failing sinks and external aborts. Each must leave the hardware idle.

use async_trait::async_trait;
use lightsheet_daq::config::Settings;
use lightsheet_daq::features::{
    Feature, FeatureRegistry, FeatureSpec, NodeType, PassThrough, SignalFeature,
};
use lightsheet_daq::hardware::capabilities::Daq;
use lightsheet_daq::hardware::daq::SyntheticDaq;
use lightsheet_daq::hardware::registry::{DeviceRegistry, DeviceSet};
use lightsheet_daq::hardware::synthetic::SyntheticFilterWheel;
use lightsheet_daq::hardware::{Frame, StagePosition};
use lightsheet_daq::report::AcquisitionEvent;
use lightsheet_daq::sink::{DataSink, MemorySink};
use lightsheet_daq::waveforms::WaveformSet;
use lightsheet_daq::{AppResult, DaqError, Microscope};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy)]
enum Fault {
    /// Sweeps never return
    Hang,
    /// Sweeps fail once `n` sweeps have completed
    FailAfter(u64),
}

/// Synthetic DAQ with an injected sweep fault.
struct FaultyDaq {
    inner: SyntheticDaq,
    fault: Fault,
    sweeps: AtomicU64,
}

impl FaultyDaq {
    fn new(settings: &Settings, fault: Fault) -> Self {
        Self {
            inner: SyntheticDaq::from_settings(&settings.daq),
            fault,
            sweeps: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Daq for FaultyDaq {
    fn sample_rate(&self) -> f64 {
        self.inner.sample_rate()
    }

    async fn load_waveforms(&self, waveforms: WaveformSet) -> AppResult<()> {
        self.inner.load_waveforms(waveforms).await
    }

    async fn prepare(&self, channel: usize) -> AppResult<()> {
        self.inner.prepare(channel).await
    }

    async fn start_tasks(&self) -> AppResult<()> {
        self.inner.start_tasks().await
    }

    async fn run_acquisition(&self) -> AppResult<()> {
        match self.fault {
            Fault::Hang => std::future::pending::<AppResult<()>>().await,
            Fault::FailAfter(n) => {
                if self.sweeps.fetch_add(1, Ordering::SeqCst) >= n {
                    return Err(DaqError::Instrument("analog output underrun".into()));
                }
                self.inner.run_acquisition().await
            }
        }
    }

    async fn stop_tasks(&self) -> AppResult<()> {
        self.inner.stop_tasks().await
    }

    fn close_tasks(&self) {
        self.inner.close_tasks();
    }

    fn tasks_open(&self) -> bool {
        self.inner.tasks_open()
    }
}

fn settings(steps: u32) -> Settings {
    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    settings.timeouts.ack_ms = 50;
    settings.experiment.z_stack.number_z_steps = steps;
    settings
}

async fn devices(settings: &Arc<Settings>) -> DeviceSet {
    DeviceRegistry::new(settings.clone())
        .build()
        .await
        .expect("Failed to build synthetic devices")
}

fn assert_idle(scope: &Microscope) {
    let devices = scope.devices();
    assert!(!devices.daq.tasks_open(), "DAQ tasks left open");
    assert!(!devices.shutter.is_open(), "Shutter left open");
    assert!(!devices.camera.is_acquiring(), "Camera left armed");
    assert!(devices.lasers.values().all(|l| !l.is_on()), "Laser left on");
}

fn z_stack() -> Vec<FeatureSpec> {
    vec![FeatureSpec::node("ZStackAcquisition")]
}

#[tokio::test]
async fn test_unacknowledged_trigger_times_out() {
    let settings = Arc::new(settings(5));
    let mut set = devices(&settings).await;
    set.daq = Arc::new(FaultyDaq::new(&settings, Fault::Hang));
    let mut scope = Microscope::new(settings, set);

    let sink = MemorySink::new();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        scope.run_acquisition(&z_stack(), &FeatureRegistry::with_builtins(), Box::new(sink.clone())),
    )
    .await
    .expect("Acquisition hung past the acknowledgement timeout");

    match result {
        Err(DaqError::AckTimeout { frame_id, timeout }) => {
            assert_eq!(frame_id, 0);
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected an acknowledgement timeout, got {other:?}"),
    }

    // The stack start was restored by cleanup and no frame was recorded
    assert_eq!(
        scope.events().last(),
        Some(&AcquisitionEvent::Restore { z: 0.0, f: 0.0 })
    );
    assert!(!scope.events().iter().any(|e| matches!(e, AcquisitionEvent::Trigger { .. })));
    assert!(sink.is_empty());
    assert!(sink.is_closed());
    assert_idle(&scope);
}

#[tokio::test]
async fn test_device_fault_stops_acquisition() {
    let settings = Arc::new(settings(10));
    let mut set = devices(&settings).await;
    set.daq = Arc::new(FaultyDaq::new(&settings, Fault::FailAfter(3)));
    let mut scope = Microscope::new(settings, set);

    let sink = MemorySink::new();
    let result = scope
        .run_acquisition(&z_stack(), &FeatureRegistry::with_builtins(), Box::new(sink.clone()))
        .await;

    assert!(matches!(result, Err(DaqError::Instrument(_))));
    let triggers = scope
        .events()
        .iter()
        .filter(|e| matches!(e, AcquisitionEvent::Trigger { .. }))
        .count();
    assert_eq!(triggers, 3);
    // Frames of acknowledged triggers still reach the sink
    assert_eq!(sink.len(), 3);
    assert_idle(&scope);
}

/// Single-step feature that fails on its `calls`-th visit and records its cleanup.
struct FailOnVisit {
    calls: u64,
    seen: u64,
    cleaned: Arc<AtomicBool>,
}

#[async_trait]
impl SignalFeature for FailOnVisit {
    async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        self.seen += 1;
        if self.seen >= self.calls {
            return Err(DaqError::Feature {
                feature: "FailOnVisit".into(),
                message: format!("failed on visit {}", self.seen),
            });
        }
        Ok(true)
    }

    async fn cleanup(&mut self, _scope: &mut Microscope) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_feature_error_cleans_up() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let mut registry = FeatureRegistry::with_builtins();
    let flag = cleaned.clone();
    registry.register("FailOnVisit", move |_context, args| {
        let calls = args.get("calls").and_then(serde_json::Value::as_u64).unwrap_or(1);
        Ok(Feature::new(
            "FailOnVisit",
            NodeType::SingleStep,
            false,
            Box::new(FailOnVisit {
                calls,
                seen: 0,
                cleaned: flag.clone(),
            }),
            Box::new(PassThrough),
        ))
    });

    let settings = settings(1);
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();
    let features = vec![FeatureSpec::looped(vec![
        FeatureSpec::node("Snap"),
        FeatureSpec::node_with("FailOnVisit", json!({"calls": 3})),
        FeatureSpec::node_with("LoopByCount", json!({"steps": 10})),
    ])];

    let sink = MemorySink::new();
    let result = scope
        .run_acquisition(&features, &registry, Box::new(sink.clone()))
        .await;

    match result {
        Err(DaqError::Feature { feature, .. }) => assert_eq!(feature, "FailOnVisit"),
        other => panic!("expected a feature error, got {other:?}"),
    }
    assert!(cleaned.load(Ordering::SeqCst));
    assert_eq!(sink.len(), 3);
    assert_idle(&scope);
}

#[tokio::test]
async fn test_unknown_feature_touches_no_hardware() {
    let settings = Arc::new(settings(3));
    let mut set = devices(&settings).await;
    let wheel = Arc::new(SyntheticFilterWheel::from_settings(&settings.filter_wheel));
    set.filter_wheel = wheel.clone();
    let mut scope = Microscope::new(settings, set);

    let result = scope
        .run_acquisition(
            &[FeatureSpec::node("Teleport")],
            &FeatureRegistry::with_builtins(),
            Box::new(MemorySink::new()),
        )
        .await;

    match result {
        Err(DaqError::Configuration(message)) => assert!(message.contains("Teleport")),
        other => panic!("expected a configuration error, got {other:?}"),
    }
    assert_eq!(wheel.commands_sent(), 0);
    assert!(scope.events().is_empty());
    assert_idle(&scope);
}

#[tokio::test]
async fn test_abort_stops_after_current_frame() {
    let mut settings = settings(2000);
    settings.daq.trigger_latency_ms = 1;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();

    let abort = scope.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.abort();
    });

    let sink = MemorySink::new();
    let report = scope
        .run_acquisition(&z_stack(), &FeatureRegistry::with_builtins(), Box::new(sink.clone()))
        .await
        .expect("An aborted acquisition still reports");

    assert!(report.frames_triggered > 0);
    assert!(report.frames_triggered < 2000);
    // Every acknowledged frame was drained before the data loop stopped
    assert_eq!(report.frames_written, report.frames_triggered);
    assert_eq!(sink.len() as u64, report.frames_triggered);
    assert_eq!(
        report.events.last(),
        Some(&AcquisitionEvent::Restore { z: 0.0, f: 0.0 })
    );
    assert_idle(&scope);
}

/// Sink that fails once it has stored `capacity` frames.
struct FullDisk {
    capacity: usize,
    stored: Arc<AtomicU64>,
}

impl DataSink for FullDisk {
    fn write(&mut self, _frame: &Frame, _position: &StagePosition) -> AppResult<()> {
        if self.stored.load(Ordering::SeqCst) as usize >= self.capacity {
            return Err(std::io::Error::other("no space left on device").into());
        }
        self.stored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_sink_stops_triggering() {
    let mut settings = settings(2000);
    settings.daq.trigger_latency_ms = 1;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();

    let stored = Arc::new(AtomicU64::new(0));
    let sink = FullDisk {
        capacity: 1,
        stored: stored.clone(),
    };
    let result = scope
        .run_acquisition(&z_stack(), &FeatureRegistry::with_builtins(), Box::new(sink))
        .await;

    match result {
        Err(DaqError::Io(e)) => assert_eq!(e.to_string(), "no space left on device"),
        other => panic!("expected the sink error, got {other:?}"),
    }
    assert_eq!(stored.load(Ordering::SeqCst), 1);
    let triggered = scope.frame_counters().frame_id();
    assert!(triggered >= 2);
    assert!(triggered < 100, "{triggered} triggers after the sink failed");
    assert_eq!(
        scope.events().last(),
        Some(&AcquisitionEvent::Restore { z: 0.0, f: 0.0 })
    );
    assert_idle(&scope);
}
