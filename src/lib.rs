//! # Light-Sheet DAQ Core Library
//!
//! Acquisition synchronization for light-sheet microscopes: the crate computes the
//! analog waveforms that drive the camera trigger, the galvos and the remote focus,
//! and runs acquisitions as trees of feature nodes against a set of devices.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration (`Settings`), including the
//!   experiment (channels, z-stack, positions).
//! - **`error`**: the `DaqError` enum used across the crate.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`waveforms`**: pure waveform generators and the per-channel descriptor types.
//! - **`hardware`**: capability traits per device role, synthetic devices, the device
//!   registry and connection retry.
//! - **`microscope`**: the orchestrator owning devices and acquisition state.
//! - **`features`**: feature nodes, the registry, and the signal/data trees.
//! - **`engine`**: signal and data loops with the trigger/frame handshake.
//! - **`sink`**: frame destinations.
//! - **`report`**: acquisition events and the run summary.

pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod hardware;
pub mod logging;
pub mod microscope;
pub mod report;
pub mod sink;
pub mod waveforms;

pub use error::{AppResult, DaqError};
pub use microscope::Microscope;
