//! Asynchronous notifications from the controller to its observers.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::parameters::ParameterSet;
use crate::traits::{DeviceDescriptor, Frame};

/// Notification published by the controller.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// A device was opened or closed.
    ConnectionStatusChanged {
        /// Whether a device is now open.
        connected: bool,
        /// Device the change applies to.
        device_id: String,
    },
    /// The acquisition loop started or stopped.
    StreamingStatusChanged {
        /// Whether frames are now being produced.
        streaming: bool,
    },
    /// Result of an enumeration.
    DeviceListUpdated(Vec<DeviceDescriptor>),
    /// The driver was rebuilt for or against the synthetic device.
    SimulationModeChanged(bool),
    /// A frame was pulled from the device.
    NewFrameAvailable(Arc<Frame>),
    /// Frames per second over the last sampling interval.
    FpsUpdated(f64),
    /// Confirmed parameters after a read-back.
    ParametersUpdated(ParameterSet),
    /// A command failed.
    ErrorOccurred {
        /// Short summary of what failed.
        title: String,
        /// Error detail.
        message: String,
    },
    /// Informational text for a status bar.
    StatusMessage(String),
}

impl CameraEvent {
    /// Event name, for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStatusChanged { .. } => "connection_status_changed",
            Self::StreamingStatusChanged { .. } => "streaming_status_changed",
            Self::DeviceListUpdated(_) => "device_list_updated",
            Self::SimulationModeChanged(_) => "simulation_mode_changed",
            Self::NewFrameAvailable(_) => "new_frame_available",
            Self::FpsUpdated(_) => "fps_updated",
            Self::ParametersUpdated(_) => "parameters_updated",
            Self::ErrorOccurred { .. } => "error_occurred",
            Self::StatusMessage(_) => "status_message",
        }
    }
}

/// Destination for controller events.
///
/// Implementations must not block: `publish` is called while the controller
/// holds its device-access lock and from the acquisition thread.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn publish(&self, event: CameraEvent);
}

impl EventSink for Sender<CameraEvent> {
    fn publish(&self, event: CameraEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Fan-out of events to any number of channel subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CameraEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; it sees every event published from now on.
    pub fn subscribe(&self) -> Receiver<CameraEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: CameraEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
