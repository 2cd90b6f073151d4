//! Error type shared by drivers and the camera controller.

use crate::parameters::{ParamKey, TriggerMode};
use crate::state::CameraState;

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Enumeration returned no devices to auto-select from.
    #[error("no camera devices available")]
    NoDevices,
    /// The driver refused to open the device.
    #[error("failed to open device {device_id}")]
    OpenFailed {
        /// Device the connection was attempted on.
        device_id: String,
    },
    /// A connection to another device is already active.
    #[error("already connected to {current}, cannot connect to {requested}")]
    AlreadyConnected {
        /// Device currently connected.
        current: String,
        /// Device that was requested.
        requested: String,
    },
    /// The command needs an open device.
    #[error("camera is not connected")]
    NotConnected,
    /// Parameters can only be applied while not streaming.
    #[error("stop streaming before applying parameters")]
    StreamingActive,
    /// The command is not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Command that was rejected.
        operation: &'static str,
        /// State at the time of the command.
        state: CameraState,
    },
    /// A requested parameter failed validation.
    #[error("invalid value for {key}: {reason}")]
    InvalidParameter {
        /// Offending parameter.
        key: ParamKey,
        /// Why the value was rejected.
        reason: String,
    },
    /// The driver reported failure by returning `false`.
    #[error("driver rejected {operation}")]
    DriverRejected {
        /// Driver call that failed.
        operation: &'static str,
    },
    /// The driver raised an unexpected fault.
    #[error("driver fault during {operation}: {message}")]
    DriverFault {
        /// Driver call that failed.
        operation: &'static str,
        /// Fault description from the driver.
        message: String,
    },
    /// A detached acquisition thread from the previous stream is still alive.
    #[error("previous acquisition thread has not exited yet")]
    AcquisitionBusy,
    /// A software trigger was requested outside software trigger mode.
    #[error("software trigger needs software trigger mode, camera is in {0} mode")]
    SoftwareTriggerUnavailable(TriggerMode),
    /// Some parameters could not be written; the rest were applied.
    #[error("failed to apply parameters: {}", join_keys(.0))]
    ParametersRejected(Vec<ParamKey>),
    /// Error during a streaming operation inside a driver.
    #[error("stream error: {0}")]
    StreamError(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_keys(keys: &[ParamKey]) -> String {
    keys.iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
