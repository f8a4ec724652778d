//! Feature nodes and the acquisition trees built from them.
//!
//! An acquisition is described as a list of [`FeatureSpec`]s. Each named node is
//! looked up in a [`FeatureRegistry`] and produces a [`Feature`]: a signal half that
//! drives hardware and a data half that consumes frames. [`build_trees`] compiles the
//! list into a [`SignalTree`] and a [`DataTree`] with identical shape.
//!
//! # Node types
//!
//! - **Single-step** nodes run once and complete.
//! - **Multi-step** nodes run until their `end` hook reports completion. They are always
//!   device-related.
//! - **Device-related** nodes cause a camera trigger on the signal side and consume one
//!   frame per tick on the data side.
//!
//! Nodes in a [`FeatureSpec::Parallel`] group run in the same tick: they share one
//! trigger and the data side hands every member the same frame.
//!
//! # Example
//!
//! ```rust,ignore
//! // Every selected channel at one z, ten times
//! let features = vec![FeatureSpec::looped(vec![
//!     FeatureSpec::node("PrepareNextChannel"),
//!     FeatureSpec::node("Snap"),
//!     FeatureSpec::node_with("LoopByCount", json!({"steps": 10})),
//! ])];
//! let report = scope.run_acquisition(&features, &FeatureRegistry::with_builtins(), sink).await?;
//! ```

pub mod common;
pub mod registry;
pub mod tree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ExperimentSettings, Settings};
use crate::error::AppResult;
use crate::hardware::Frame;
use crate::microscope::Microscope;

pub use registry::{FeatureConstructor, FeatureRegistry};
pub use tree::{build_trees, DataTree, SignalTree};

/// Lifetime of a node within the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Runs once per visit
    SingleStep,
    /// Runs every tick until `end` returns true
    MultiStep,
}

/// Signal half of a feature.
///
/// Hooks run on the signal loop with exclusive access to the microscope. `main`'s
/// return value feeds loop decisions: a loop whose last node returned `true` runs
/// again.
#[async_trait]
pub trait SignalFeature: Send {
    /// Called the first time the node is reached on each visit.
    async fn init(&mut self, _scope: &mut Microscope) -> AppResult<()> {
        Ok(())
    }

    /// Main action, called once per tick while the node is current.
    async fn main(&mut self, scope: &mut Microscope) -> AppResult<bool>;

    /// Multi-step nodes only: called after `main`; `true` completes the node.
    async fn end(&mut self, _scope: &mut Microscope) -> AppResult<bool> {
        Ok(true)
    }

    /// Device-related nodes only: called after the trigger of this node's tick was
    /// acknowledged (or skipped).
    async fn response(&mut self, _scope: &mut Microscope) -> AppResult<()> {
        Ok(())
    }

    /// Called when the acquisition stops abnormally.
    async fn cleanup(&mut self, _scope: &mut Microscope) {}
}

/// Data half of a feature.
pub trait DataFeature: Send {
    /// Called the first time the node is reached on each visit.
    fn init(&mut self) {}

    /// Process frames. Device-related nodes receive exactly one frame per call.
    fn main(&mut self, frames: &[Frame]) -> AppResult<bool>;

    /// Multi-step nodes only: `true` completes the node.
    fn end(&mut self) -> bool {
        true
    }

    /// Called when the acquisition stops abnormally.
    fn cleanup(&mut self) {}
}

/// Data half for nodes that ignore frames.
pub struct PassThrough;

impl DataFeature for PassThrough {
    fn main(&mut self, _frames: &[Frame]) -> AppResult<bool> {
        Ok(true)
    }
}

/// A constructed feature: both halves plus the node properties the trees need.
pub struct Feature {
    /// Registry name
    pub name: String,
    /// Single- or multi-step
    pub node_type: NodeType,
    /// Whether the node triggers the camera
    pub device_related: bool,
    /// Signal half
    pub signal: Box<dyn SignalFeature>,
    /// Data half
    pub data: Box<dyn DataFeature>,
}

impl Feature {
    /// Assemble a feature. Multi-step nodes are always device-related.
    pub fn new(
        name: impl Into<String>,
        node_type: NodeType,
        device_related: bool,
        signal: Box<dyn SignalFeature>,
        data: Box<dyn DataFeature>,
    ) -> Self {
        Self {
            name: name.into(),
            node_type,
            device_related: device_related || node_type == NodeType::MultiStep,
            signal,
            data,
        }
    }
}

/// What feature constructors may read while the trees are built.
pub struct FeatureContext<'a> {
    /// Static settings
    pub settings: &'a Settings,
    /// Experiment the acquisition starts with
    pub experiment: &'a ExperimentSettings,
}

/// Declarative acquisition description.
///
/// Deserializes from JSON such as
/// `[{"type": "loop", "items": [{"type": "node", "name": "Snap"}, ...]}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureSpec {
    /// A registered feature
    Node {
        /// Registry name
        name: String,
        /// Constructor arguments
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Items run in order
    Sequence {
        /// Child specs
        items: Vec<FeatureSpec>,
    },
    /// Nodes run within the same tick; the group completes once every member has
    Parallel {
        /// Member nodes
        items: Vec<FeatureSpec>,
    },
    /// Items run in order, repeated while the last item's `main` returns true
    Loop {
        /// Child specs; the last one must be a node
        items: Vec<FeatureSpec>,
    },
}

impl FeatureSpec {
    /// Node without arguments.
    pub fn node(name: &str) -> Self {
        FeatureSpec::Node {
            name: name.to_string(),
            args: serde_json::Value::Null,
        }
    }

    /// Node with constructor arguments.
    pub fn node_with(name: &str, args: serde_json::Value) -> Self {
        FeatureSpec::Node {
            name: name.to_string(),
            args,
        }
    }

    /// Ordered group.
    pub fn sequence(items: Vec<FeatureSpec>) -> Self {
        FeatureSpec::Sequence { items }
    }

    /// Nodes sharing each tick.
    pub fn parallel(items: Vec<FeatureSpec>) -> Self {
        FeatureSpec::Parallel { items }
    }

    /// Repeating group.
    pub fn looped(items: Vec<FeatureSpec>) -> Self {
        FeatureSpec::Loop { items }
    }
}
