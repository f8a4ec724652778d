//! Built-in features.
//!
//! | Name | Node | Device | Purpose |
//! |------|------|--------|---------|
//! | `ZStackAcquisition` | multi-step | yes | z-stacks over every position and channel |
//! | `PrepareNextChannel` | single-step | no | advance the channel cycle |
//! | `LoopByCount` | single-step | no | close a loop after `steps` iterations |
//! | `MoveToNextPosition` | single-step | no | step through the multi-position table |
//! | `Snap` | single-step | yes | one frame |
//! | `StackPause` | single-step | no | bounded sleep |
//! | `ChangeZoom` | single-step | no | move the zoom servo |
//! | `Autofocus` | multi-step | yes | sweep the focus plane and keep the sharpest |

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CyclingMode;
use crate::error::{AppResult, DaqError};
use crate::features::{DataFeature, Feature, FeatureContext, NodeType, PassThrough, SignalFeature};
use crate::hardware::{Frame, StagePosition};
use crate::microscope::Microscope;
use crate::report::AcquisitionEvent;

/// Longest pause `StackPause` accepts.
pub const MAX_PAUSE: Duration = Duration::from_secs(3600);

fn parse_args<T: DeserializeOwned + Default>(feature: &str, args: &serde_json::Value) -> AppResult<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args.clone())
        .map_err(|e| DaqError::Configuration(format!("Invalid arguments for {feature}: {e}")))
}

// =============================================================================
// ZStackAcquisition
// =============================================================================

/// Constructor for `ZStackAcquisition`.
pub fn z_stack_acquisition(_context: &FeatureContext<'_>, _args: &serde_json::Value) -> AppResult<Feature> {
    let expected = Arc::new(AtomicU64::new(u64::MAX));
    Ok(Feature::new(
        "ZStackAcquisition",
        NodeType::MultiStep,
        true,
        Box::new(ZStack::new(expected.clone())),
        Box::new(ZStackFrames { expected, received: 0 }),
    ))
}

/// Signal side of a z-stack over every position.
///
/// Per position the stack starts at `start_position + origin.z` and takes
/// `number_z_steps` steps of `step_size`; the focus plane moves linearly from
/// `start_focus` to `end_focus` (relative to `origin.f`) over the same steps.
///
/// With `per_z` cycling every selected channel is imaged at a z before the stage moves;
/// with `per_stack` the whole stack is taken per channel, and the switch to the next
/// channel waits for the following tick so the last z-step keeps its channel. A
/// rejected stage move skips the rest of the position.
struct ZStack {
    expected: Arc<AtomicU64>,
    cycling: CyclingMode,
    n_steps: u32,
    start_z: f64,
    step_size: f64,
    start_focus: f64,
    focus_step: f64,
    channel_count: usize,
    positions: Vec<StagePosition>,
    position_index: usize,
    z: f64,
    focus: f64,
    moved: u32,
    stacks_done: usize,
    frames_at_position: u64,
    switch_channel_pending: bool,
    need_new_position: bool,
    need_z_move: bool,
    aborted: bool,
    restore: (f64, f64),
    restore_pending: bool,
    restored: bool,
}

impl ZStack {
    fn new(expected: Arc<AtomicU64>) -> Self {
        Self {
            expected,
            cycling: CyclingMode::PerStack,
            n_steps: 1,
            start_z: 0.0,
            step_size: 0.0,
            start_focus: 0.0,
            focus_step: 0.0,
            channel_count: 0,
            positions: Vec::new(),
            position_index: 0,
            z: 0.0,
            focus: 0.0,
            moved: 0,
            stacks_done: 0,
            frames_at_position: 0,
            switch_channel_pending: false,
            need_new_position: true,
            need_z_move: true,
            aborted: false,
            restore: (0.0, 0.0),
            restore_pending: false,
            restored: true,
        }
    }

    fn frames_per_position(&self) -> u64 {
        self.channel_count as u64 * u64::from(self.n_steps)
    }

    fn reset_to_origin(&mut self) {
        let origin = self.positions[self.position_index];
        self.z = self.start_z + origin.z;
        self.focus = self.start_focus + origin.f;
    }

    fn finished(&mut self) -> bool {
        if self.position_index >= self.positions.len() {
            self.restore_pending = true;
            return true;
        }
        false
    }

    /// Skip whatever is left of the current position.
    async fn abort_position(&mut self, scope: &mut Microscope) -> AppResult<()> {
        let remaining = self.frames_per_position().saturating_sub(self.frames_at_position);
        let _ = self
            .expected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(remaining)));

        warn!(
            position = self.position_index,
            channel = ?scope.current_channel(),
            step = self.moved,
            skipped_frames = remaining,
            "Stage move rejected, skipping the rest of this position"
        );
        scope.record(AcquisitionEvent::PositionAborted {
            position: self.position_index,
            channel: scope.current_channel(),
            step: self.moved,
        });
        scope.skip_trigger();

        self.aborted = true;
        self.moved = 0;
        self.stacks_done = 0;
        self.switch_channel_pending = false;
        self.frames_at_position = 0;
        self.position_index += 1;
        self.need_new_position = true;
        self.need_z_move = true;

        if self.position_index < self.positions.len() {
            scope.reset_channel_cycle();
            scope.prepare_next_channel().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SignalFeature for ZStack {
    async fn init(&mut self, scope: &mut Microscope) -> AppResult<()> {
        let experiment = scope.experiment();
        let z_stack = &experiment.z_stack;
        self.cycling = experiment.cycling_mode;
        self.n_steps = z_stack.number_z_steps.max(1);
        self.start_z = z_stack.start_position;
        self.step_size = z_stack.step_size;
        self.start_focus = z_stack.start_focus;
        self.focus_step = (z_stack.end_focus - z_stack.start_focus) / f64::from(self.n_steps);
        self.positions = if experiment.multiposition.enabled && !experiment.multiposition.positions.is_empty() {
            experiment.multiposition.positions.clone()
        } else {
            vec![scope.position()]
        };
        self.channel_count = scope.selected_channels().len();

        let here = scope.position();
        self.restore = (here.z, here.f);
        self.restore_pending = false;
        self.restored = false;
        self.position_index = 0;
        self.moved = 0;
        self.stacks_done = 0;
        self.frames_at_position = 0;
        self.switch_channel_pending = false;
        self.need_new_position = true;
        self.need_z_move = true;
        self.aborted = false;

        let expected = self.frames_per_position() * self.positions.len() as u64;
        self.expected.store(expected, Ordering::SeqCst);
        info!(
            positions = self.positions.len(),
            steps = self.n_steps,
            channels = self.channel_count,
            cycling = ?self.cycling,
            expected,
            "Starting z-stack"
        );

        scope.reset_channel_cycle();
        scope.prepare_next_channel().await?;
        Ok(())
    }

    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        // Deferred from the previous tick so its frame kept the old channel
        if std::mem::take(&mut self.switch_channel_pending) {
            scope.prepare_next_channel().await?;
        }
        if self.need_new_position {
            self.need_new_position = false;
            self.reset_to_origin();
            let origin = self.positions[self.position_index];
            debug!(position = self.position_index, ?origin, "Moving to position");
            if !scope.move_to_position(&origin).await? {
                self.abort_position(scope).await?;
                return Ok(true);
            }
        }
        if self.need_z_move && !scope.move_focus(self.z, self.focus).await? {
            self.abort_position(scope).await?;
        }
        Ok(true)
    }

    async fn end(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        if std::mem::take(&mut self.aborted) {
            return Ok(self.finished());
        }
        self.frames_at_position += 1;

        self.need_z_move = match self.cycling {
            CyclingMode::PerZ => scope.prepare_next_channel().await? == 0,
            CyclingMode::PerStack => true,
        };
        if self.need_z_move {
            self.z += self.step_size;
            self.focus += self.focus_step;
            self.moved += 1;
        }

        if self.moved >= self.n_steps {
            self.moved = 0;
            self.reset_to_origin();
            self.need_new_position = match self.cycling {
                CyclingMode::PerStack => {
                    self.stacks_done += 1;
                    self.switch_channel_pending = true;
                    self.stacks_done >= self.channel_count
                }
                CyclingMode::PerZ => true,
            };
            if self.need_new_position {
                self.stacks_done = 0;
                self.position_index += 1;
                self.frames_at_position = 0;
            }
        }
        Ok(self.finished())
    }

    async fn response(&mut self, scope: &mut Microscope) -> AppResult<()> {
        if std::mem::take(&mut self.restore_pending) {
            let (z, f) = self.restore;
            if !scope.restore_focus(z, f).await? {
                warn!(z, f, "Could not restore the stack start position");
            }
            self.restored = true;
        }
        Ok(())
    }

    async fn cleanup(&mut self, scope: &mut Microscope) {
        if self.restored {
            return;
        }
        let (z, f) = self.restore;
        match scope.restore_focus(z, f).await {
            Ok(_) => self.restored = true,
            Err(e) => warn!(error = %e, "Could not restore the stack start position during cleanup"),
        }
    }
}

/// Data side of `ZStackAcquisition`: complete once every expected frame arrived.
struct ZStackFrames {
    expected: Arc<AtomicU64>,
    received: u64,
}

impl DataFeature for ZStackFrames {
    fn init(&mut self) {
        self.received = 0;
    }

    fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
        self.received += frames.len() as u64;
        Ok(true)
    }

    fn end(&mut self) -> bool {
        self.received >= self.expected.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Channel and loop control
// =============================================================================

/// Constructor for `PrepareNextChannel`.
pub fn prepare_next_channel(_context: &FeatureContext<'_>, _args: &serde_json::Value) -> AppResult<Feature> {
    Ok(Feature::new(
        "PrepareNextChannel",
        NodeType::SingleStep,
        false,
        Box::new(NextChannel),
        Box::new(PassThrough),
    ))
}

struct NextChannel;

#[async_trait]
impl SignalFeature for NextChannel {
    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        scope.prepare_next_channel().await?;
        Ok(true)
    }
}

/// Iteration count of a `LoopByCount` node.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepCount {
    /// Fixed count
    Fixed(u64),
    /// `"selected_channels"`: one iteration per selected channel
    Named(String),
}

#[derive(Debug, Deserialize)]
struct LoopArgs {
    steps: StepCount,
}

impl Default for LoopArgs {
    fn default() -> Self {
        Self {
            steps: StepCount::Fixed(1),
        }
    }
}

/// Constructor for `LoopByCount`.
///
/// `{"steps": 5}` runs the enclosing loop five times; `{"steps": "selected_channels"}`
/// once per channel selected when the acquisition starts.
pub fn loop_by_count(context: &FeatureContext<'_>, args: &serde_json::Value) -> AppResult<Feature> {
    let parsed: LoopArgs = parse_args("LoopByCount", args)?;
    let steps = match parsed.steps {
        StepCount::Fixed(n) => n,
        StepCount::Named(name) if name == "selected_channels" => {
            context.experiment.channels.iter().filter(|c| c.is_selected).count() as u64
        }
        StepCount::Named(name) => {
            return Err(DaqError::Configuration(format!(
                "LoopByCount: unknown step count '{name}'"
            )))
        }
    };
    if steps == 0 {
        return Err(DaqError::Configuration("LoopByCount: steps must be at least 1".into()));
    }
    Ok(Feature::new(
        "LoopByCount",
        NodeType::SingleStep,
        false,
        Box::new(LoopCounter::new(steps)),
        Box::new(LoopCounter::new(steps)),
    ))
}

/// Returns true `steps - 1` times, then false and starts over.
struct LoopCounter {
    steps: u64,
    count: u64,
}

impl LoopCounter {
    fn new(steps: u64) -> Self {
        Self { steps, count: 0 }
    }

    fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.steps {
            self.count = 0;
            return false;
        }
        true
    }
}

#[async_trait]
impl SignalFeature for LoopCounter {
    async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        Ok(self.tick())
    }
}

impl DataFeature for LoopCounter {
    fn main(&mut self, _frames: &[Frame]) -> AppResult<bool> {
        Ok(self.tick())
    }
}

// =============================================================================
// Autofocus
// =============================================================================

/// Sharpness score of a frame; higher is sharper.
pub trait FocusMetric: Send + Sync {
    /// Score one frame.
    fn score(&self, frame: &Frame) -> f64;
}

/// Pixel variance divided by the mean intensity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedVariance;

impl FocusMetric for NormalizedVariance {
    fn score(&self, frame: &Frame) -> f64 {
        if frame.buffer.is_empty() {
            return 0.0;
        }
        let n = frame.buffer.len() as f64;
        let mean = frame.buffer.iter().map(|&p| f64::from(p)).sum::<f64>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = frame
            .buffer
            .iter()
            .map(|&p| (f64::from(p) - mean).powi(2))
            .sum::<f64>()
            / n;
        variance / mean
    }
}

#[derive(Debug, Deserialize)]
struct AutofocusArgs {
    #[serde(default = "default_autofocus_steps")]
    steps: u32,
    /// Swept focus range in µm, centred on the current focus plane
    #[serde(default = "default_autofocus_range")]
    range: f64,
}

fn default_autofocus_steps() -> u32 {
    5
}

fn default_autofocus_range() -> f64 {
    10.0
}

impl Default for AutofocusArgs {
    fn default() -> Self {
        Self {
            steps: default_autofocus_steps(),
            range: default_autofocus_range(),
        }
    }
}

/// Constructor for `Autofocus` with the [`NormalizedVariance`] metric.
///
/// `{"steps": 7, "range": 20.0}` images 7 focus planes spread over 20 µm around the
/// current plane, then moves to the plane whose frame scored highest.
pub fn autofocus(context: &FeatureContext<'_>, args: &serde_json::Value) -> AppResult<Feature> {
    autofocus_with_metric(context, args, Arc::new(NormalizedVariance))
}

/// Constructor for `Autofocus` scoring frames with `metric`.
pub fn autofocus_with_metric(
    context: &FeatureContext<'_>,
    args: &serde_json::Value,
    metric: Arc<dyn FocusMetric>,
) -> AppResult<Feature> {
    let parsed: AutofocusArgs = parse_args("Autofocus", args)?;
    if parsed.steps == 0 {
        return Err(DaqError::Configuration("Autofocus: steps must be at least 1".into()));
    }
    if !parsed.range.is_finite() || parsed.range < 0.0 {
        return Err(DaqError::Configuration(format!(
            "Autofocus: range must be a non-negative number, got {}",
            parsed.range
        )));
    }

    let (best_tx, best_rx) = mpsc::unbounded_channel();
    Ok(Feature::new(
        "Autofocus",
        NodeType::MultiStep,
        true,
        Box::new(FocusSweep {
            steps: parsed.steps,
            range: parsed.range,
            wait: context.settings.timeouts.ack(),
            planes: Vec::new(),
            next: 0,
            z: 0.0,
            center: 0.0,
            settled: false,
            best: best_rx,
        }),
        Box::new(FocusScores {
            metric,
            steps: parsed.steps as usize,
            scores: Vec::new(),
            best: best_tx,
        }),
    ))
}

/// Evenly spaced planes over `range` centred on `center`.
fn sweep_planes(center: f64, range: f64, steps: u32) -> Vec<f64> {
    if steps == 1 {
        return vec![center];
    }
    let start = center - range / 2.0;
    let spacing = range / f64::from(steps - 1);
    (0..steps).map(|k| start + spacing * f64::from(k)).collect()
}

/// Signal side of `Autofocus`: one plane per tick, then the move to the best plane
/// once the data side has scored the sweep.
struct FocusSweep {
    steps: u32,
    range: f64,
    wait: Duration,
    planes: Vec<f64>,
    next: usize,
    z: f64,
    center: f64,
    settled: bool,
    best: mpsc::UnboundedReceiver<usize>,
}

impl FocusSweep {
    fn sweep_error(message: String) -> DaqError {
        DaqError::Feature {
            feature: "Autofocus".into(),
            message,
        }
    }
}

#[async_trait]
impl SignalFeature for FocusSweep {
    async fn init(&mut self, scope: &mut Microscope) -> AppResult<()> {
        // Results of an interrupted earlier sweep
        while self.best.try_recv().is_ok() {}
        self.center = scope.focus_plane();
        self.z = scope.position().z;
        self.planes = sweep_planes(self.center, self.range, self.steps);
        self.next = 0;
        self.settled = false;
        info!(center = self.center, range = self.range, steps = self.steps, "Starting autofocus sweep");
        Ok(())
    }

    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        let plane = self.planes[self.next];
        if !scope.move_focus(self.z, plane).await? {
            return Err(Self::sweep_error(format!("focus plane {plane} is outside the stage limits")));
        }
        Ok(true)
    }

    async fn end(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        self.next += 1;
        Ok(self.next >= self.planes.len())
    }

    async fn response(&mut self, scope: &mut Microscope) -> AppResult<()> {
        if self.next < self.planes.len() {
            return Ok(());
        }
        let index = match tokio::time::timeout(self.wait, self.best.recv()).await {
            Ok(Some(index)) => index,
            Ok(None) => return Err(Self::sweep_error("focus scores are no longer reported".into())),
            Err(_) => {
                return Err(Self::sweep_error(format!(
                    "no focus score within {} ms",
                    self.wait.as_millis()
                )))
            }
        };
        let plane = self.planes.get(index).copied().unwrap_or(self.center);
        info!(plane, index, "Autofocus found the sharpest plane");
        if !scope.move_focus(self.z, plane).await? {
            return Err(Self::sweep_error(format!("focus plane {plane} is outside the stage limits")));
        }
        self.settled = true;
        Ok(())
    }

    async fn cleanup(&mut self, scope: &mut Microscope) {
        if self.settled {
            return;
        }
        if let Err(e) = scope.move_focus(self.z, self.center).await {
            warn!(error = %e, "Could not return to the focus plane before autofocus");
        }
    }
}

/// Data side of `Autofocus`: scores every frame and reports the best index.
struct FocusScores {
    metric: Arc<dyn FocusMetric>,
    steps: usize,
    scores: Vec<f64>,
    best: mpsc::UnboundedSender<usize>,
}

impl DataFeature for FocusScores {
    fn init(&mut self) {
        self.scores.clear();
    }

    fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
        self.scores.extend(frames.iter().map(|f| self.metric.score(f)));
        Ok(true)
    }

    fn end(&mut self) -> bool {
        if self.scores.len() < self.steps {
            return false;
        }
        // First maximum wins; NaN never compares greater
        let mut best = 0;
        let mut top = f64::NEG_INFINITY;
        for (i, &score) in self.scores.iter().enumerate() {
            if score > top {
                best = i;
                top = score;
            }
        }
        debug!(best, scores = ?self.scores, "Autofocus scores");
        if self.best.send(best).is_err() {
            warn!("Autofocus sweep no longer waiting for its result");
        }
        true
    }
}

// =============================================================================
// Stage, camera, pause, zoom
// =============================================================================

/// Constructor for `MoveToNextPosition`.
pub fn move_to_next_position(_context: &FeatureContext<'_>, _args: &serde_json::Value) -> AppResult<Feature> {
    Ok(Feature::new(
        "MoveToNextPosition",
        NodeType::SingleStep,
        false,
        Box::new(NextPosition { next: 0 }),
        Box::new(PassThrough),
    ))
}

/// Moves all five axes to the next multi-position entry, wrapping at the end.
///
/// `main` returns whether the stage accepted the move.
struct NextPosition {
    next: usize,
}

#[async_trait]
impl SignalFeature for NextPosition {
    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        let positions = &scope.experiment().multiposition.positions;
        if positions.is_empty() {
            return Err(DaqError::Feature {
                feature: "MoveToNextPosition".into(),
                message: "multi-position table is empty".into(),
            });
        }
        let index = self.next % positions.len();
        let target = positions[index];
        self.next = index + 1;

        let accepted = scope.move_to_position(&target).await? && scope.move_focus(target.z, target.f).await?;
        if !accepted {
            warn!(position = index, "Stage rejected multi-position entry");
        }
        Ok(accepted)
    }
}

/// Constructor for `Snap`.
pub fn snap(_context: &FeatureContext<'_>, _args: &serde_json::Value) -> AppResult<Feature> {
    Ok(Feature::new(
        "Snap",
        NodeType::SingleStep,
        true,
        Box::new(SnapSignal),
        Box::new(SnapData),
    ))
}

struct SnapSignal;

#[async_trait]
impl SignalFeature for SnapSignal {
    async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        Ok(true)
    }
}

struct SnapData;

impl DataFeature for SnapData {
    fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
        debug!(frame_id = ?frames.first().map(|f| f.frame_id), "Snap frame received");
        Ok(true)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PauseArgs {
    #[serde(default)]
    seconds: f64,
}

/// Constructor for `StackPause`: `{"seconds": 2.5}`.
pub fn stack_pause(_context: &FeatureContext<'_>, args: &serde_json::Value) -> AppResult<Feature> {
    let parsed: PauseArgs = parse_args("StackPause", args)?;
    if parsed.seconds.is_nan() || parsed.seconds < 0.0 || parsed.seconds > MAX_PAUSE.as_secs_f64() {
        return Err(DaqError::Configuration(format!(
            "StackPause: seconds must be within 0..={}, got {}",
            MAX_PAUSE.as_secs(),
            parsed.seconds
        )));
    }
    Ok(Feature::new(
        "StackPause",
        NodeType::SingleStep,
        false,
        Box::new(Pause(Duration::from_secs_f64(parsed.seconds))),
        Box::new(PassThrough),
    ))
}

struct Pause(Duration);

#[async_trait]
impl SignalFeature for Pause {
    async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        debug!(pause_ms = self.0.as_millis() as u64, "Pausing");
        tokio::time::sleep(self.0).await;
        Ok(true)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZoomArgs {
    #[serde(default)]
    name: String,
}

/// Constructor for `ChangeZoom`: `{"name": "2x"}`. Unknown names fail at build time.
pub fn change_zoom(context: &FeatureContext<'_>, args: &serde_json::Value) -> AppResult<Feature> {
    let parsed: ZoomArgs = parse_args("ChangeZoom", args)?;
    if !context.settings.zoom.positions.contains_key(&parsed.name) {
        return Err(DaqError::UnknownZoom(parsed.name));
    }
    Ok(Feature::new(
        "ChangeZoom",
        NodeType::SingleStep,
        false,
        Box::new(SetZoom(parsed.name)),
        Box::new(PassThrough),
    ))
}

struct SetZoom(String);

#[async_trait]
impl SignalFeature for SetZoom {
    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool> {
        scope.set_zoom(&self.0).await?;
        Ok(true)
    }
}
