//! Name-to-constructor lookup for feature nodes.

use std::collections::BTreeMap;

use crate::error::{AppResult, DaqError};
use crate::features::common;
use crate::features::{Feature, FeatureContext};

/// Builds a feature from the build context and its JSON arguments.
pub type FeatureConstructor =
    Box<dyn Fn(&FeatureContext<'_>, &serde_json::Value) -> AppResult<Feature> + Send + Sync>;

/// Registered feature constructors.
pub struct FeatureRegistry {
    constructors: BTreeMap<String, FeatureConstructor>,
}

impl FeatureRegistry {
    /// Registry without any features.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in features.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ZStackAcquisition", common::z_stack_acquisition);
        registry.register("PrepareNextChannel", common::prepare_next_channel);
        registry.register("LoopByCount", common::loop_by_count);
        registry.register("MoveToNextPosition", common::move_to_next_position);
        registry.register("Snap", common::snap);
        registry.register("StackPause", common::stack_pause);
        registry.register("ChangeZoom", common::change_zoom);
        registry.register("Autofocus", common::autofocus);
        registry
    }

    /// Add or replace a constructor.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&FeatureContext<'_>, &serde_json::Value) -> AppResult<Feature> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Box::new(constructor));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the feature registered under `name`.
    pub fn build(
        &self,
        name: &str,
        context: &FeatureContext<'_>,
        args: &serde_json::Value,
    ) -> AppResult<Feature> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            DaqError::Configuration(format!(
                "Unknown feature '{name}' (registered: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        constructor(context, args)
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
