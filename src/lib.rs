//! Camera-Session: lifecycle management for a machine-vision camera.
//!
//! A [`CameraController`] owns one device driver and moves it through
//! `disconnected → connecting → connected ⇄ streaming`. Frames are pulled on a
//! dedicated acquisition thread, the frame rate is sampled on another, and
//! observers receive [`CameraEvent`]s over channels. Drivers plug in through
//! the [`DeviceDriver`] trait: a V4L2 driver for real hardware and a simulated
//! camera for development are built in.

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod fps;
pub mod logging;
pub mod parameters;
pub mod simulated;
pub mod state;
pub mod traits;
pub mod validation;

pub use acquisition::Timing;
pub use config::Config;
pub use controller::{CameraController, ControllerOptions, StatusSummary};
pub use device::{DefaultDriverProvider, V4l2Driver};
pub use error::{CameraError, Result};
pub use events::{CameraEvent, EventBus, EventSink};
pub use fps::FpsMeter;
pub use parameters::{ParamKey, ParamValue, ParameterCache, ParameterSet, TriggerMode};
pub use simulated::{SimulatedCamera, TestPattern};
pub use state::CameraState;
pub use traits::{
    DeviceDescriptor, DeviceDriver, DriverProvider, FourCC, Frame, FrameMetadata, Roi,
};
