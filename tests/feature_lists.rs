//! Acquisitions described by JSON feature lists.

use async_trait::async_trait;
use lightsheet_daq::config::Settings;
use lightsheet_daq::features::common::{autofocus_with_metric, FocusMetric};
use lightsheet_daq::features::{
    DataFeature, Feature, FeatureRegistry, FeatureSpec, NodeType, SignalFeature,
};
use lightsheet_daq::hardware::{Frame, StagePosition};
use lightsheet_daq::report::AcquisitionEvent;
use lightsheet_daq::sink::{JsonLinesSink, MemorySink};
use lightsheet_daq::{AppResult, DaqError, Microscope};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn settings_with_positions() -> Settings {
    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    settings.experiment.multiposition.positions = vec![
        StagePosition::new(0.0, 0.0, 5.0, 0.0, 0.0),
        StagePosition::new(100.0, 50.0, 5.0, 0.0, 0.0),
        StagePosition::new(200.0, 50.0, 5.0, 90.0, 0.0),
    ];
    settings
}

fn load_features(json: &serde_json::Value) -> Vec<FeatureSpec> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{json}").unwrap();
    let content = std::fs::read_to_string(file.path()).unwrap();
    serde_json::from_str(&content).expect("Feature list should deserialize")
}

#[tokio::test]
async fn test_position_tour_from_json() {
    let features = load_features(&json!([
        {"type": "node", "name": "ChangeZoom", "args": {"name": "2x"}},
        {"type": "node", "name": "PrepareNextChannel"},
        {"type": "loop", "items": [
            {"type": "node", "name": "MoveToNextPosition"},
            {"type": "node", "name": "Snap"},
            {"type": "node", "name": "LoopByCount", "args": {"steps": 3}}
        ]}
    ]));

    let mut scope = Microscope::connect(Arc::new(settings_with_positions())).await.unwrap();
    let sink = MemorySink::new();
    let report = scope
        .run_acquisition(&features, &FeatureRegistry::with_builtins(), Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(report.frames_triggered, 3);
    let visited: Vec<(f64, f64, f64)> = sink.records().iter().map(|r| (r.x, r.y, r.theta)).collect();
    assert_eq!(
        visited,
        vec![(0.0, 0.0, 0.0), (100.0, 50.0, 0.0), (200.0, 50.0, 90.0)]
    );
    assert!(sink.records().iter().all(|r| r.z == 5.0));
    assert_eq!(scope.devices().zoom.zoom().await, "2x");
}

#[tokio::test]
async fn test_loop_over_selected_channels() {
    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    for channel in &mut settings.experiment.channels {
        channel.is_selected = true;
    }
    let features = load_features(&json!([
        {"type": "loop", "items": [
            {"type": "node", "name": "PrepareNextChannel"},
            {"type": "node", "name": "Snap"},
            {"type": "node", "name": "LoopByCount", "args": {"steps": "selected_channels"}}
        ]}
    ]));

    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();
    let report = scope
        .run_acquisition(&features, &FeatureRegistry::with_builtins(), Box::new(MemorySink::new()))
        .await
        .unwrap();

    assert_eq!(report.channel_changes(), vec![1, 2, 3]);
    let channels: Vec<Option<usize>> = report.trigger_coordinates().into_iter().map(|(_, _, c)| c).collect();
    assert_eq!(channels, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_empty_position_table_is_a_feature_error() {
    let mut settings = settings_with_positions();
    settings.experiment.multiposition.positions.clear();
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();

    let features = vec![
        FeatureSpec::node("PrepareNextChannel"),
        FeatureSpec::node("MoveToNextPosition"),
        FeatureSpec::node("Snap"),
    ];
    let result = scope
        .run_acquisition(&features, &FeatureRegistry::with_builtins(), Box::new(MemorySink::new()))
        .await;

    assert!(matches!(
        result,
        Err(DaqError::Feature { ref feature, .. }) if feature == "MoveToNextPosition"
    ));
    assert!(!scope.devices().daq.tasks_open());
    assert!(!scope
        .events()
        .iter()
        .any(|e| matches!(e, AcquisitionEvent::Trigger { .. })));
}

#[tokio::test]
async fn test_bad_arguments_rejected_before_hardware() {
    let mut scope = Microscope::connect(Arc::new(Settings::default())).await.unwrap();
    let registry = FeatureRegistry::with_builtins();

    for features in [
        vec![FeatureSpec::node_with("StackPause", json!({"seconds": -2.0}))],
        vec![FeatureSpec::node_with("ChangeZoom", json!({"name": "40x"}))],
        vec![FeatureSpec::looped(vec![
            FeatureSpec::node("Snap"),
            FeatureSpec::node_with("LoopByCount", json!({"steps": 0})),
        ])],
        vec![],
    ] {
        let result = scope
            .run_acquisition(&features, &registry, Box::new(MemorySink::new()))
            .await;
        assert!(result.is_err(), "{features:?} should be rejected");
        assert!(!scope.devices().shutter.is_open());
    }
}

#[tokio::test]
async fn test_frames_written_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.jsonl");
    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    settings.experiment.z_stack.number_z_steps = 4;
    settings.experiment.z_stack.step_size = 0.5;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();

    let report = scope
        .run_acquisition(
            &[FeatureSpec::node("ZStackAcquisition")],
            &FeatureRegistry::with_builtins(),
            Box::new(JsonLinesSink::create(&path).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(report.frames_written, 4);

    let content = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let z: Vec<f64> = records.iter().map(|r| r["z"].as_f64().unwrap()).collect();
    assert_eq!(z, vec![0.0, 0.5, 1.0, 1.5]);
    assert!(records.iter().all(|r| r["width"] == 32 && r["height"] == 32));
}

/// Multi-step node lasting `ticks` ticks; counts its responses and logs its frames.
struct TickLog {
    ticks: u64,
    seen: u64,
    responses: Arc<AtomicU64>,
}

#[async_trait]
impl SignalFeature for TickLog {
    async fn init(&mut self, _scope: &mut Microscope) -> AppResult<()> {
        self.seen = 0;
        Ok(())
    }

    async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        Ok(true)
    }

    async fn end(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        self.seen += 1;
        Ok(self.seen >= self.ticks)
    }

    async fn response(&mut self, _scope: &mut Microscope) -> AppResult<()> {
        self.responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FrameLog {
    ticks: usize,
    ids: Arc<Mutex<Vec<u64>>>,
    seen: usize,
}

impl DataFeature for FrameLog {
    fn init(&mut self) {
        self.seen = 0;
    }

    fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
        self.ids.lock().extend(frames.iter().map(|f| f.frame_id));
        self.seen += frames.len();
        Ok(true)
    }

    fn end(&mut self) -> bool {
        self.seen >= self.ticks
    }
}

#[tokio::test]
async fn test_parallel_group_shares_triggers() {
    let responses = Arc::new(AtomicU64::new(0));
    let ids = Arc::new(Mutex::new(Vec::new()));
    let mut registry = FeatureRegistry::with_builtins();
    {
        let (responses, ids) = (responses.clone(), ids.clone());
        registry.register("TickLog", move |_context, args| {
            let ticks = args.get("ticks").and_then(serde_json::Value::as_u64).unwrap_or(1);
            Ok(Feature::new(
                "TickLog",
                NodeType::MultiStep,
                true,
                Box::new(TickLog {
                    ticks,
                    seen: 0,
                    responses: responses.clone(),
                }),
                Box::new(FrameLog {
                    ticks: ticks as usize,
                    ids: ids.clone(),
                    seen: 0,
                }),
            ))
        });
    }

    let features = load_features(&json!([
        {"type": "parallel", "items": [
            {"type": "node", "name": "ZStackAcquisition"},
            {"type": "node", "name": "TickLog", "args": {"ticks": 3}}
        ]}
    ]));

    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    settings.experiment.z_stack.number_z_steps = 3;
    settings.experiment.z_stack.step_size = 1.0;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();
    let sink = MemorySink::new();
    let report = scope
        .run_acquisition(&features, &registry, Box::new(sink.clone()))
        .await
        .unwrap();

    // One trigger per tick, seen by both members
    assert_eq!(report.frames_triggered, 3);
    assert_eq!(sink.len(), 3);
    assert_eq!(*ids.lock(), vec![0, 1, 2]);
    assert_eq!(responses.load(Ordering::SeqCst), 3);
    let z: Vec<f64> = report.trigger_coordinates().iter().map(|(z, _, _)| *z).collect();
    assert_eq!(z, vec![0.0, 1.0, 2.0]);
}

/// Scores only the frame with the given id.
struct SharpestAt(u64);

impl FocusMetric for SharpestAt {
    fn score(&self, frame: &Frame) -> f64 {
        if frame.frame_id == self.0 {
            10.0
        } else {
            1.0
        }
    }
}

#[tokio::test]
async fn test_autofocus_moves_to_sharpest_plane() {
    let mut registry = FeatureRegistry::with_builtins();
    registry.register("Autofocus", |context, args| {
        autofocus_with_metric(context, args, Arc::new(SharpestAt(3)))
    });

    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();
    let features = vec![
        FeatureSpec::node("PrepareNextChannel"),
        FeatureSpec::node_with("Autofocus", json!({"steps": 5, "range": 4.0})),
    ];
    let report = scope
        .run_acquisition(&features, &registry, Box::new(MemorySink::new()))
        .await
        .unwrap();

    assert_eq!(report.frames_triggered, 5);
    let swept: Vec<f64> = report.trigger_coordinates().iter().map(|(_, f, _)| *f).collect();
    assert_eq!(swept, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);

    let last_focus = report.events.iter().rev().find_map(|e| match e {
        AcquisitionEvent::MoveZ { z, f } => Some((*z, *f)),
        _ => None,
    });
    assert_eq!(last_focus, Some((0.0, 1.0)));
}

#[tokio::test]
async fn test_autofocus_single_plane_stays_put() {
    let mut settings = Settings::default();
    settings.daq.trigger_latency_ms = 0;
    let mut scope = Microscope::connect(Arc::new(settings)).await.unwrap();
    let report = scope
        .run_acquisition(
            &[
                FeatureSpec::node("PrepareNextChannel"),
                FeatureSpec::node_with("Autofocus", json!({"steps": 1})),
            ],
            &FeatureRegistry::with_builtins(),
            Box::new(MemorySink::new()),
        )
        .await
        .unwrap();

    assert_eq!(report.frames_triggered, 1);
    assert_eq!(report.trigger_coordinates()[0].1, 0.0);
}
