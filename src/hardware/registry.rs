//! Device Registry
//!
//! Maps the driver tag of every configuration section (`kind = "SyntheticCamera"`) to a
//! concrete type implementing the role's capability trait, and connects the full
//! [`DeviceSet`] of one microscope.
//!
//! - Tags are resolved before any connection attempt, so an unknown tag fails fast with
//!   `UnknownDevice` instead of burning through the retry policy.
//! - Every connection goes through [`connect_with_retry`]; the first device that
//!   exhausts its attempts aborts the whole build. A microscope never starts with a
//!   partial device set.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = Arc::new(Settings::load_from("config/microscope.toml")?);
//! let devices = DeviceRegistry::new(settings.clone()).build().await?;
//! devices.filter_wheel.set_filter("GFP", true).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::ready;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    Camera, Daq, FilterWheel, Galvo, Laser, RemoteFocus, Shutter, Stage, Zoom,
};
use crate::hardware::daq::SyntheticDaq;
use crate::hardware::galvo::SyntheticGalvo;
use crate::hardware::remote_focus::SyntheticRemoteFocus;
use crate::hardware::retry::{connect_with_retry, RetryPolicy};
use crate::hardware::synthetic::{
    SyntheticCamera, SyntheticFilterWheel, SyntheticLaser, SyntheticShutter, SyntheticStage,
    SyntheticZoom,
};

// =============================================================================
// Driver Types
// =============================================================================

/// Device role within the microscope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Imaging camera
    Camera,
    /// Sample stage
    Stage,
    /// Emission filter wheel
    FilterWheel,
    /// Zoom servo
    Zoom,
    /// Laser shutter
    Shutter,
    /// Laser line
    Laser,
    /// Galvo scanner
    Galvo,
    /// Remote focus (ETL)
    RemoteFocus,
    /// DAQ board
    Daq,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceRole::Camera => "camera",
            DeviceRole::Stage => "stage",
            DeviceRole::FilterWheel => "filter_wheel",
            DeviceRole::Zoom => "zoom",
            DeviceRole::Shutter => "shutter",
            DeviceRole::Laser => "laser",
            DeviceRole::Galvo => "galvo",
            DeviceRole::RemoteFocus => "remote_focus",
            DeviceRole::Daq => "daq",
        };
        f.write_str(name)
    }
}

/// Registered driver types, one variant per configuration tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// [`SyntheticCamera`]
    SyntheticCamera,
    /// [`SyntheticStage`]
    SyntheticStage,
    /// [`SyntheticFilterWheel`]
    SyntheticFilterWheel,
    /// [`SyntheticZoom`]
    SyntheticZoom,
    /// [`SyntheticShutter`]
    SyntheticShutter,
    /// [`SyntheticLaser`]
    SyntheticLaser,
    /// [`SyntheticGalvo`]
    SyntheticGalvo,
    /// [`SyntheticRemoteFocus`]
    SyntheticRemoteFocus,
    /// [`SyntheticDaq`]
    SyntheticDaq,
}

impl DeviceKind {
    /// Role this driver fills.
    pub fn role(&self) -> DeviceRole {
        match self {
            DeviceKind::SyntheticCamera => DeviceRole::Camera,
            DeviceKind::SyntheticStage => DeviceRole::Stage,
            DeviceKind::SyntheticFilterWheel => DeviceRole::FilterWheel,
            DeviceKind::SyntheticZoom => DeviceRole::Zoom,
            DeviceKind::SyntheticShutter => DeviceRole::Shutter,
            DeviceKind::SyntheticLaser => DeviceRole::Laser,
            DeviceKind::SyntheticGalvo => DeviceRole::Galvo,
            DeviceKind::SyntheticRemoteFocus => DeviceRole::RemoteFocus,
            DeviceKind::SyntheticDaq => DeviceRole::Daq,
        }
    }

    /// Configuration tag.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DeviceKind::SyntheticCamera => "SyntheticCamera",
            DeviceKind::SyntheticStage => "SyntheticStage",
            DeviceKind::SyntheticFilterWheel => "SyntheticFilterWheel",
            DeviceKind::SyntheticZoom => "SyntheticZoom",
            DeviceKind::SyntheticShutter => "SyntheticShutter",
            DeviceKind::SyntheticLaser => "SyntheticLaser",
            DeviceKind::SyntheticGalvo => "SyntheticGalvo",
            DeviceKind::SyntheticRemoteFocus => "SyntheticRemoteFocus",
            DeviceKind::SyntheticDaq => "SyntheticDaq",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SyntheticCamera" => Ok(DeviceKind::SyntheticCamera),
            "SyntheticStage" => Ok(DeviceKind::SyntheticStage),
            "SyntheticFilterWheel" => Ok(DeviceKind::SyntheticFilterWheel),
            "SyntheticZoom" => Ok(DeviceKind::SyntheticZoom),
            "SyntheticShutter" => Ok(DeviceKind::SyntheticShutter),
            "SyntheticLaser" => Ok(DeviceKind::SyntheticLaser),
            "SyntheticGalvo" => Ok(DeviceKind::SyntheticGalvo),
            "SyntheticRemoteFocus" => Ok(DeviceKind::SyntheticRemoteFocus),
            "SyntheticDaq" => Ok(DeviceKind::SyntheticDaq),
            other => Err(DaqError::UnknownDevice(other.to_string())),
        }
    }
}

// =============================================================================
// Device Set
// =============================================================================

/// Every connected device of one microscope.
///
/// Fields are public so tests can assemble a set from hand-built devices.
#[derive(Clone)]
pub struct DeviceSet {
    /// Camera
    pub camera: Arc<dyn Camera>,
    /// Stage
    pub stage: Arc<dyn Stage>,
    /// Filter wheel
    pub filter_wheel: Arc<dyn FilterWheel>,
    /// Zoom servo
    pub zoom: Arc<dyn Zoom>,
    /// Shutter
    pub shutter: Arc<dyn Shutter>,
    /// Lasers keyed by wavelength label
    pub lasers: BTreeMap<String, Arc<dyn Laser>>,
    /// Galvos in configuration order
    pub galvos: Vec<Arc<dyn Galvo>>,
    /// Remote focus
    pub remote_focus: Arc<dyn RemoteFocus>,
    /// DAQ board
    pub daq: Arc<dyn Daq>,
}

impl DeviceSet {
    /// Laser by wavelength label.
    pub fn laser(&self, wavelength: &str) -> AppResult<&Arc<dyn Laser>> {
        self.lasers
            .get(wavelength)
            .ok_or_else(|| DaqError::Configuration(format!("No laser with wavelength '{wavelength}'")))
    }
}

/// A connected device of any role.
enum DeviceHandle {
    Camera(Arc<dyn Camera>),
    Stage(Arc<dyn Stage>),
    FilterWheel(Arc<dyn FilterWheel>),
    Zoom(Arc<dyn Zoom>),
    Shutter(Arc<dyn Shutter>),
    Laser(Arc<dyn Laser>),
    Galvo(Arc<dyn Galvo>),
    RemoteFocus(Arc<dyn RemoteFocus>),
    Daq(Arc<dyn Daq>),
}

fn role_mismatch(expected: DeviceRole) -> DaqError {
    DaqError::Configuration(format!("Driver does not provide a {expected}"))
}

// =============================================================================
// Registry
// =============================================================================

/// Builds the [`DeviceSet`] described by a settings snapshot.
pub struct DeviceRegistry {
    settings: Arc<Settings>,
    policy: RetryPolicy,
}

impl DeviceRegistry {
    /// Registry using the `[connection]` retry policy.
    pub fn new(settings: Arc<Settings>) -> Self {
        let policy = RetryPolicy::from_settings(&settings.connection);
        Self { settings, policy }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve a tag and check it fills `role`.
    pub fn resolve(tag: &str, role: DeviceRole) -> AppResult<DeviceKind> {
        let kind: DeviceKind = tag.parse()?;
        if kind.role() != role {
            return Err(DaqError::Configuration(format!(
                "Driver '{tag}' is a {} driver, configured as {role}",
                kind.role()
            )));
        }
        Ok(kind)
    }

    /// Connect every configured device.
    pub async fn build(&self) -> AppResult<DeviceSet> {
        let s = &self.settings;

        // Resolve every tag before the first connection attempt
        let camera_kind = Self::resolve(&s.camera.kind, DeviceRole::Camera)?;
        let stage_kind = Self::resolve(&s.stage.kind, DeviceRole::Stage)?;
        let wheel_kind = Self::resolve(&s.filter_wheel.kind, DeviceRole::FilterWheel)?;
        let zoom_kind = Self::resolve(&s.zoom.kind, DeviceRole::Zoom)?;
        let shutter_kind = Self::resolve(&s.shutter.kind, DeviceRole::Shutter)?;
        let remote_focus_kind = Self::resolve(&s.remote_focus.kind, DeviceRole::RemoteFocus)?;
        let daq_kind = Self::resolve(&s.daq.kind, DeviceRole::Daq)?;
        let laser_kinds = s
            .lasers
            .iter()
            .map(|l| Self::resolve(&l.kind, DeviceRole::Laser))
            .collect::<AppResult<Vec<_>>>()?;
        let galvo_kinds = s
            .galvo
            .iter()
            .map(|g| Self::resolve(&g.kind, DeviceRole::Galvo))
            .collect::<AppResult<Vec<_>>>()?;

        let DeviceHandle::Daq(daq) = self.connect("daq", daq_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::Daq));
        };
        let DeviceHandle::Camera(camera) = self.connect("camera", camera_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::Camera));
        };
        let DeviceHandle::Stage(stage) = self.connect("stage", stage_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::Stage));
        };
        let DeviceHandle::FilterWheel(filter_wheel) = self.connect("filter_wheel", wheel_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::FilterWheel));
        };
        let DeviceHandle::Zoom(zoom) = self.connect("zoom", zoom_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::Zoom));
        };
        let DeviceHandle::Shutter(shutter) = self.connect("shutter", shutter_kind, 0).await? else {
            return Err(role_mismatch(DeviceRole::Shutter));
        };
        let DeviceHandle::RemoteFocus(remote_focus) =
            self.connect("remote_focus", remote_focus_kind, 0).await?
        else {
            return Err(role_mismatch(DeviceRole::RemoteFocus));
        };

        let mut lasers = BTreeMap::new();
        for (index, kind) in laser_kinds.into_iter().enumerate() {
            let DeviceHandle::Laser(laser) = self.connect("laser", kind, index).await? else {
                return Err(role_mismatch(DeviceRole::Laser));
            };
            lasers.insert(laser.wavelength().to_string(), laser);
        }

        let mut galvos = Vec::with_capacity(galvo_kinds.len());
        for (index, kind) in galvo_kinds.into_iter().enumerate() {
            let DeviceHandle::Galvo(galvo) = self.connect("galvo", kind, index).await? else {
                return Err(role_mismatch(DeviceRole::Galvo));
            };
            galvos.push(galvo);
        }

        info!(
            lasers = lasers.len(),
            galvos = galvos.len(),
            "Device set connected"
        );

        Ok(DeviceSet {
            camera,
            stage,
            filter_wheel,
            zoom,
            shutter,
            lasers,
            galvos,
            remote_focus,
            daq,
        })
    }

    async fn connect(&self, device: &str, kind: DeviceKind, index: usize) -> AppResult<DeviceHandle> {
        connect_with_retry(device, &self.policy, || ready(self.instantiate(kind, index))).await
    }

    /// Construct one driver. `index` selects the entry of list sections (lasers, galvos).
    fn instantiate(&self, kind: DeviceKind, index: usize) -> AppResult<DeviceHandle> {
        let s = &self.settings;
        let handle = match kind {
            DeviceKind::SyntheticCamera => {
                DeviceHandle::Camera(Arc::new(SyntheticCamera::from_settings(&s.camera)))
            }
            DeviceKind::SyntheticStage => {
                DeviceHandle::Stage(Arc::new(SyntheticStage::from_settings(&s.stage)))
            }
            DeviceKind::SyntheticFilterWheel => DeviceHandle::FilterWheel(Arc::new(
                SyntheticFilterWheel::from_settings(&s.filter_wheel),
            )),
            DeviceKind::SyntheticZoom => {
                DeviceHandle::Zoom(Arc::new(SyntheticZoom::from_settings(&s.zoom)))
            }
            DeviceKind::SyntheticShutter => DeviceHandle::Shutter(Arc::new(SyntheticShutter::new())),
            DeviceKind::SyntheticLaser => {
                let laser = s.lasers.get(index).ok_or_else(|| {
                    DaqError::Configuration(format!("No laser entry at index {index}"))
                })?;
                DeviceHandle::Laser(Arc::new(SyntheticLaser::from_settings(laser)))
            }
            DeviceKind::SyntheticGalvo => {
                let galvo = s.galvo.get(index).ok_or_else(|| {
                    DaqError::Configuration(format!("No galvo entry at index {index}"))
                })?;
                DeviceHandle::Galvo(Arc::new(SyntheticGalvo::new(
                    index,
                    galvo.clone(),
                    s.daq.sample_rate,
                    s.camera.delay_percent,
                )))
            }
            DeviceKind::SyntheticRemoteFocus => DeviceHandle::RemoteFocus(Arc::new(
                SyntheticRemoteFocus::new(
                    s.remote_focus.clone(),
                    s.daq.sample_rate,
                    s.camera.delay_percent,
                ),
            )),
            DeviceKind::SyntheticDaq => {
                DeviceHandle::Daq(Arc::new(SyntheticDaq::from_settings(&s.daq)))
            }
        };
        Ok(handle)
    }
}
