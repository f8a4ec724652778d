//! Signal and data trees.
//!
//! Both trees share one compiled program: a flat list of node visits plus conditional
//! back-jumps for loops. A visit covers one node or a parallel group of nodes that run
//! in the same tick. The signal tree advances in passes around each trigger:
//!
//! - [`SignalTree::run`] (before the trigger) runs visits until it reaches a
//!   device-related one, runs `main` and `end` of every member still running, and stops.
//! - [`SignalTree::run_response`] (after the acknowledgement) calls `response` on those
//!   members, then runs the non-device visits that follow, stopping at the next
//!   device visit or loop back-jump.
//!
//! The data tree walks the same program, consuming one frame per device visit and
//! handing that frame to every member of the visit.

use std::ops::Range;
use tracing::{debug, error, trace};

use crate::error::{AppResult, DaqError};
use crate::features::{
    DataFeature, Feature, FeatureContext, FeatureRegistry, FeatureSpec, NodeType, SignalFeature,
};
use crate::hardware::Frame;
use crate::microscope::Microscope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// Visit a node
    Node(usize),
    /// Visit the nodes `start..end` in the same tick
    Parallel { start: usize, end: usize },
    /// Jump back to `target` when `node`'s last `main` returned true
    JumpIf { target: usize, node: usize },
}

struct Slot<F: ?Sized> {
    name: String,
    node_type: NodeType,
    device_related: bool,
    initialized: bool,
    visited: bool,
    /// Completed within the current visit of its group
    done: bool,
    /// Ran in the pass awaiting a response
    ran: bool,
    last_result: bool,
    feature: Box<F>,
}

impl<F: ?Sized> Slot<F> {
    fn new(name: String, node_type: NodeType, device_related: bool, feature: Box<F>) -> Self {
        Self {
            name,
            node_type,
            device_related,
            initialized: false,
            visited: false,
            done: false,
            ran: false,
            last_result: false,
            feature,
        }
    }

    fn reset(&mut self) {
        self.initialized = false;
        self.visited = false;
        self.done = false;
        self.ran = false;
        self.last_result = false;
    }
}

fn is_device_visit<F: ?Sized>(slots: &[Slot<F>], members: &Range<usize>) -> bool {
    slots[members.clone()].iter().any(|s| s.device_related)
}

fn finish_visit<F: ?Sized>(slots: &mut [Slot<F>], members: Range<usize>) {
    for slot in &mut slots[members] {
        slot.initialized = false;
        slot.done = false;
    }
}

/// Compile `specs` into a signal tree and a data tree of identical shape.
///
/// Every node is constructed here, so unknown feature names and bad arguments fail
/// before the hardware is touched.
pub fn build_trees(
    specs: &[FeatureSpec],
    registry: &FeatureRegistry,
    context: &FeatureContext<'_>,
) -> AppResult<(SignalTree, DataTree)> {
    let mut signal_slots = Vec::new();
    let mut data_slots = Vec::new();
    let mut ops = Vec::new();

    compile(specs, registry, context, &mut ops, &mut |feature: Feature| {
        signal_slots.push(Slot::new(
            feature.name.clone(),
            feature.node_type,
            feature.device_related,
            feature.signal,
        ));
        data_slots.push(Slot::new(
            feature.name,
            feature.node_type,
            feature.device_related,
            feature.data,
        ));
        signal_slots.len() - 1
    })?;

    if ops.is_empty() {
        return Err(DaqError::Configuration("Acquisition has no features".into()));
    }

    Ok((
        SignalTree {
            slots: signal_slots,
            ops: ops.clone(),
            cursor: 0,
            awaiting: None,
            end_flag: false,
        },
        DataTree {
            slots: data_slots,
            ops,
            cursor: 0,
            end_flag: false,
        },
    ))
}

fn compile(
    specs: &[FeatureSpec],
    registry: &FeatureRegistry,
    context: &FeatureContext<'_>,
    ops: &mut Vec<Op>,
    add: &mut dyn FnMut(Feature) -> usize,
) -> AppResult<()> {
    for spec in specs {
        match spec {
            FeatureSpec::Node { name, args } => {
                let feature = registry.build(name, context, args)?;
                let index = add(feature);
                ops.push(Op::Node(index));
            }
            FeatureSpec::Sequence { items } => compile(items, registry, context, ops, add)?,
            FeatureSpec::Parallel { items } => {
                if items.is_empty() {
                    return Err(DaqError::Configuration("A parallel group needs at least one node".into()));
                }
                let mut members: Option<Range<usize>> = None;
                for item in items {
                    let FeatureSpec::Node { name, args } = item else {
                        return Err(DaqError::Configuration(
                            "A parallel group may only hold feature nodes".into(),
                        ));
                    };
                    let index = add(registry.build(name, context, args)?);
                    members = Some(match members {
                        Some(range) => range.start..index + 1,
                        None => index..index + 1,
                    });
                }
                if let Some(range) = members {
                    ops.push(Op::Parallel {
                        start: range.start,
                        end: range.end,
                    });
                }
            }
            FeatureSpec::Loop { items } => {
                if !matches!(items.last(), Some(FeatureSpec::Node { .. })) {
                    return Err(DaqError::Configuration(
                        "A loop must end with a feature node".into(),
                    ));
                }
                let target = ops.len();
                compile(items, registry, context, ops, add)?;
                let Some(&Op::Node(node)) = ops.last() else {
                    return Err(DaqError::Configuration(
                        "A loop must end with a feature node".into(),
                    ));
                };
                ops.push(Op::JumpIf { target, node });
            }
        }
    }
    Ok(())
}

// =============================================================================
// Signal tree
// =============================================================================

/// Signal side of an acquisition.
pub struct SignalTree {
    slots: Vec<Slot<dyn SignalFeature>>,
    ops: Vec<Op>,
    cursor: usize,
    awaiting: Option<Range<usize>>,
    end_flag: bool,
}

impl SignalTree {
    /// Rewind to the first node.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.awaiting = None;
        self.end_flag = false;
        self.slots.iter_mut().for_each(Slot::reset);
    }

    /// Whether the tree has completed or was stopped.
    pub fn is_finished(&self) -> bool {
        self.end_flag
    }

    /// Whether the last [`Self::run`] stopped at a device-related visit.
    pub fn awaiting_response(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Stop the tree; the next [`Self::run`] does nothing.
    pub fn force_end(&mut self) {
        self.end_flag = true;
    }

    /// Names of the nodes in program order.
    pub fn feature_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    /// Pass before the trigger.
    ///
    /// On a feature error every visited node is cleaned up, the tree is stopped and the
    /// error is returned.
    pub async fn run(&mut self, scope: &mut Microscope) -> AppResult<()> {
        match self.advance(scope).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(scope, e).await),
        }
    }

    /// Pass after the trigger was acknowledged or skipped.
    pub async fn run_response(&mut self, scope: &mut Microscope) -> AppResult<()> {
        match self.respond(scope).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(scope, e).await),
        }
    }

    /// Call `cleanup` on every node visited since the last reset.
    pub async fn cleanup(&mut self, scope: &mut Microscope) {
        for slot in self.slots.iter_mut().filter(|s| s.visited) {
            debug!(feature = %slot.name, "Cleaning up feature");
            slot.feature.cleanup(scope).await;
        }
    }

    async fn fail(&mut self, scope: &mut Microscope, err: DaqError) -> DaqError {
        error!(error = %err, "Signal tree stopped");
        self.cleanup(scope).await;
        self.awaiting = None;
        self.end_flag = true;
        err
    }

    /// Members of the visit under the cursor; `None` after a jump or at a taken branch.
    fn next_visit(&mut self) -> Option<Range<usize>> {
        while !self.end_flag {
            let Some(&op) = self.ops.get(self.cursor) else {
                self.end_flag = true;
                break;
            };
            match op {
                Op::Node(i) => return Some(i..i + 1),
                Op::Parallel { start, end } => return Some(start..end),
                Op::JumpIf { target, node } => {
                    if self.slots[node].last_result {
                        self.cursor = target;
                        return None;
                    }
                    self.cursor += 1;
                }
            }
        }
        None
    }

    async fn advance(&mut self, scope: &mut Microscope) -> AppResult<()> {
        self.awaiting = None;
        while let Some(members) = self.next_visit() {
            let done = self.step_visit(members.clone(), scope).await?;
            if is_device_visit(&self.slots, &members) {
                self.awaiting = Some(members.clone());
                if done {
                    self.complete(members);
                }
                return Ok(());
            }
            if !done {
                return Ok(());
            }
            self.complete(members);
        }
        Ok(())
    }

    async fn respond(&mut self, scope: &mut Microscope) -> AppResult<()> {
        let Some(awaited) = self.awaiting.take() else {
            return Ok(());
        };
        for i in awaited {
            if std::mem::take(&mut self.slots[i].ran) {
                self.slots[i].feature.response(scope).await?;
            }
        }

        while let Some(members) = self.next_visit() {
            if is_device_visit(&self.slots, &members) {
                return Ok(());
            }
            if !self.step_visit(members.clone(), scope).await? {
                return Ok(());
            }
            self.complete(members);
        }
        Ok(())
    }

    /// Run every member that has not completed; `Ok(true)` once all have.
    async fn step_visit(&mut self, members: Range<usize>, scope: &mut Microscope) -> AppResult<bool> {
        let mut all_done = true;
        for i in members {
            if self.slots[i].done {
                continue;
            }
            let done = self.step(i, scope).await?;
            let slot = &mut self.slots[i];
            slot.ran = slot.device_related || slot.ran;
            slot.done = done;
            all_done &= done;
        }
        Ok(all_done)
    }

    /// Run one node; `Ok(true)` when it completed.
    async fn step(&mut self, i: usize, scope: &mut Microscope) -> AppResult<bool> {
        let slot = &mut self.slots[i];
        if !slot.initialized {
            trace!(feature = %slot.name, "init");
            slot.feature.init(scope).await?;
            slot.initialized = true;
            slot.visited = true;
        }
        slot.last_result = slot.feature.main(scope).await?;
        match slot.node_type {
            NodeType::SingleStep => Ok(true),
            NodeType::MultiStep => slot.feature.end(scope).await,
        }
    }

    fn complete(&mut self, members: Range<usize>) {
        finish_visit(&mut self.slots, members);
        self.cursor += 1;
    }
}

// =============================================================================
// Data tree
// =============================================================================

/// Data side of an acquisition.
pub struct DataTree {
    slots: Vec<Slot<dyn DataFeature>>,
    ops: Vec<Op>,
    cursor: usize,
    end_flag: bool,
}

impl DataTree {
    /// Whether every node has completed.
    pub fn is_finished(&self) -> bool {
        self.end_flag
    }

    /// Feed a batch of frames.
    ///
    /// Device visits take one frame each; the walk pauses at a device visit once the
    /// batch is used up and resumes there with the next batch.
    pub fn run(&mut self, frames: &[Frame]) -> AppResult<()> {
        self.advance(frames).inspect_err(|e| {
            error!(error = %e, "Data tree stopped");
            self.cleanup();
            self.end_flag = true;
        })
    }

    /// Call `cleanup` on every visited node.
    pub fn cleanup(&mut self) {
        for slot in self.slots.iter_mut().filter(|s| s.visited) {
            slot.feature.cleanup();
        }
    }

    fn advance(&mut self, frames: &[Frame]) -> AppResult<()> {
        let mut pending = frames;
        while !self.end_flag {
            let Some(&op) = self.ops.get(self.cursor) else {
                self.end_flag = true;
                break;
            };
            let members = match op {
                Op::Node(i) => i..i + 1,
                Op::Parallel { start, end } => start..end,
                Op::JumpIf { target, node } => {
                    if self.slots[node].last_result {
                        self.cursor = target;
                    } else {
                        self.cursor += 1;
                    }
                    continue;
                }
            };
            if is_device_visit(&self.slots, &members) {
                let Some((frame, rest)) = pending.split_first() else {
                    return Ok(());
                };
                pending = rest;
                if self.step_visit(members.clone(), std::slice::from_ref(frame))? {
                    self.complete(members);
                }
            } else {
                if !self.step_visit(members.clone(), pending)? {
                    return Ok(());
                }
                self.complete(members);
            }
        }
        if !pending.is_empty() {
            debug!(unclaimed = pending.len(), "Frames arrived after the data tree finished");
        }
        Ok(())
    }

    fn step_visit(&mut self, members: Range<usize>, frames: &[Frame]) -> AppResult<bool> {
        let mut all_done = true;
        for i in members {
            if self.slots[i].done {
                continue;
            }
            let done = self.step(i, frames)?;
            self.slots[i].done = done;
            all_done &= done;
        }
        Ok(all_done)
    }

    fn step(&mut self, i: usize, frames: &[Frame]) -> AppResult<bool> {
        let slot = &mut self.slots[i];
        if !slot.initialized {
            slot.feature.init();
            slot.initialized = true;
            slot.visited = true;
        }
        slot.last_result = slot.feature.main(frames)?;
        Ok(match slot.node_type {
            NodeType::SingleStep => true,
            NodeType::MultiStep => slot.feature.end(),
        })
    }

    fn complete(&mut self, members: Range<usize>) {
        finish_visit(&mut self.slots, members);
        self.cursor += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::features::PassThrough;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn frames(ids: &[u64]) -> Vec<Frame> {
        ids.iter().map(|&id| Frame::new(id, 1, 1, vec![0])).collect()
    }

    struct Counter {
        seen: Arc<AtomicU64>,
        frames_per_visit: u64,
        visits: u64,
    }

    impl DataFeature for Counter {
        fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
            self.seen.fetch_add(frames.len() as u64, Ordering::SeqCst);
            self.visits += 1;
            Ok(true)
        }

        fn end(&mut self) -> bool {
            self.visits >= self.frames_per_visit
        }
    }

    struct Noop;

    #[async_trait::async_trait]
    impl SignalFeature for Noop {
        async fn main(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
            Ok(true)
        }
    }

    fn registry_with_counter(seen: Arc<AtomicU64>) -> FeatureRegistry {
        let mut registry = FeatureRegistry::with_builtins();
        registry.register("Count", move |_ctx, args| {
            let frames = args.get("frames").and_then(|v| v.as_u64()).unwrap_or(1);
            Ok(Feature::new(
                "Count",
                NodeType::MultiStep,
                true,
                Box::new(Noop),
                Box::new(Counter {
                    seen: seen.clone(),
                    frames_per_visit: frames,
                    visits: 0,
                }),
            ))
        });
        registry
    }

    fn build(specs: &[FeatureSpec], registry: &FeatureRegistry) -> AppResult<(SignalTree, DataTree)> {
        let settings = Settings::default();
        let context = FeatureContext {
            settings: &settings,
            experiment: &settings.experiment,
        };
        build_trees(specs, registry, &context)
    }

    #[test]
    fn test_data_tree_consumes_one_frame_per_visit() {
        let seen = Arc::new(AtomicU64::new(0));
        let registry = registry_with_counter(seen.clone());
        let specs = [FeatureSpec::node_with("Count", json!({"frames": 3}))];
        let (_, mut data) = build(&specs, &registry).unwrap();

        data.run(&frames(&[0, 1])).unwrap();
        assert!(!data.is_finished());
        data.run(&frames(&[2])).unwrap();
        assert!(data.is_finished());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_data_loop_resumes_at_device_node() {
        let seen = Arc::new(AtomicU64::new(0));
        let registry = registry_with_counter(seen.clone());
        let specs = [FeatureSpec::looped(vec![
            FeatureSpec::node("PrepareNextChannel"),
            FeatureSpec::node_with("Count", json!({"frames": 1})),
            FeatureSpec::node_with("LoopByCount", json!({"steps": 3})),
        ])];
        let (_, mut data) = build(&specs, &registry).unwrap();

        data.run(&frames(&[0])).unwrap();
        data.run(&frames(&[1, 2])).unwrap();
        assert!(data.is_finished());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_loop_must_end_with_node() {
        let registry = FeatureRegistry::with_builtins();
        let specs = [FeatureSpec::looped(vec![FeatureSpec::sequence(vec![FeatureSpec::node("Snap")])])];
        assert!(matches!(build(&specs, &registry), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_unknown_feature_fails_at_build() {
        let registry = FeatureRegistry::with_builtins();
        let specs = [FeatureSpec::node("Teleport")];
        assert!(matches!(build(&specs, &registry), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_nested_sequence_flattens() {
        let registry = FeatureRegistry::with_builtins();
        let specs = [
            FeatureSpec::node("PrepareNextChannel"),
            FeatureSpec::sequence(vec![FeatureSpec::node("Snap"), FeatureSpec::node("Snap")]),
        ];
        let (signal, _) = build(&specs, &registry).unwrap();
        assert_eq!(signal.feature_names(), vec!["PrepareNextChannel", "Snap", "Snap"]);
    }

    #[test]
    fn test_pass_through_accepts_batches() {
        let mut node = PassThrough;
        assert!(node.main(&frames(&[1, 2, 3])).unwrap());
    }

    /// Records every frame id it is handed, completing after `frames` visits.
    struct Recorder {
        ids: Arc<Mutex<Vec<u64>>>,
        frames: usize,
        visits: usize,
    }

    impl DataFeature for Recorder {
        fn init(&mut self) {
            self.visits = 0;
        }

        fn main(&mut self, frames: &[Frame]) -> AppResult<bool> {
            self.ids.lock().extend(frames.iter().map(|f| f.frame_id));
            self.visits += 1;
            Ok(true)
        }

        fn end(&mut self) -> bool {
            self.visits >= self.frames
        }
    }

    fn registry_with_recorders(first: Arc<Mutex<Vec<u64>>>, second: Arc<Mutex<Vec<u64>>>) -> FeatureRegistry {
        let mut registry = FeatureRegistry::with_builtins();
        for (name, ids) in [("RecordA", first), ("RecordB", second)] {
            registry.register(name, move |_ctx, args| {
                let frames = args.get("frames").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                Ok(Feature::new(
                    name,
                    NodeType::MultiStep,
                    true,
                    Box::new(Noop),
                    Box::new(Recorder {
                        ids: ids.clone(),
                        frames,
                        visits: 0,
                    }),
                ))
            });
        }
        registry
    }

    #[test]
    fn test_parallel_members_share_each_frame() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_recorders(first.clone(), second.clone());
        let specs = [
            FeatureSpec::parallel(vec![
                FeatureSpec::node_with("RecordA", json!({"frames": 3})),
                FeatureSpec::node_with("RecordB", json!({"frames": 1})),
            ]),
            FeatureSpec::node_with("RecordB", json!({"frames": 2})),
        ];
        let (signal, mut data) = build(&specs, &registry).unwrap();
        assert_eq!(signal.feature_names(), vec!["RecordA", "RecordB", "RecordB"]);

        data.run(&frames(&[0, 1, 2, 3, 4])).unwrap();
        assert!(data.is_finished());

        // The group takes frames 0..=2, its short member only the first one
        assert_eq!(*first.lock(), vec![0, 1, 2]);
        assert_eq!(*second.lock(), vec![0, 3, 4]);
    }

    #[test]
    fn test_parallel_group_holds_only_nodes() {
        let registry = FeatureRegistry::with_builtins();
        let nested = [FeatureSpec::parallel(vec![FeatureSpec::looped(vec![FeatureSpec::node("Snap")])])];
        assert!(matches!(build(&nested, &registry), Err(DaqError::Configuration(_))));
        let empty = [FeatureSpec::parallel(vec![])];
        assert!(matches!(build(&empty, &registry), Err(DaqError::Configuration(_))));
    }
}
