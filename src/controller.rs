//! Connection manager: the camera state machine and every command the UI issues.
//!
//! All transitions run while holding the device-access lock, which also
//! serializes every call into the driver. Events are published under the same
//! lock, so observers see them in transition order. The latest frame and the
//! status snapshot live behind separate locks and can be read at any time
//! without waiting on hardware I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::acquisition::{StreamSession, Timing};
use crate::error::{CameraError, Result};
use crate::events::{CameraEvent, EventSink};
use crate::fps::{FpsMeter, FpsSampler};
use crate::parameters::{ParamKey, ParamValue, ParameterCache, ParameterSet, TriggerMode};
use crate::state::{CameraState, StateMachine};
use crate::traits::{DeviceDescriptor, DeviceDriver, DriverProvider, Frame, Roi};

/// Construction options for [`CameraController`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    /// Start with the synthetic device instead of real hardware.
    pub simulation: bool,
    /// Lock, pull, join and sampling intervals.
    pub timing: Timing,
}

/// Point-in-time view of the controller, readable without touching the device.
#[derive(Debug, Clone)]
pub struct StatusSummary {
    /// Current state.
    pub state: CameraState,
    /// Whether a device is open.
    pub is_connected: bool,
    /// Whether the acquisition loop is running.
    pub is_streaming: bool,
    /// Whether the synthetic device is in use.
    pub is_simulation_mode: bool,
    /// Open device, if any.
    pub current_device_id: Option<String>,
    /// Confirmed parameters from the last read-back.
    pub parameters: ParameterSet,
    /// Rate from the last FPS sample.
    pub fps: f64,
    /// Number of devices found by the last enumeration.
    pub available_devices: usize,
}

/// Everything guarded by the device-access lock.
pub(crate) struct DeviceSlot {
    pub(crate) driver: Box<dyn DeviceDriver>,
    machine: StateMachine,
    device_id: Option<String>,
    params: ParameterCache,
    simulation: bool,
    devices: Vec<DeviceDescriptor>,
    session: Option<StreamSession>,
    detached: Option<StreamSession>,
}

impl DeviceSlot {
    pub(crate) const fn state(&self) -> CameraState {
        self.machine.state()
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    state: CameraState,
    device_id: Option<String>,
    simulation: bool,
    parameters: ParameterSet,
    available_devices: usize,
}

/// State shared between the controller and its worker threads.
pub(crate) struct Shared {
    pub(crate) device: Mutex<DeviceSlot>,
    pub(crate) latest_frame: Mutex<Option<Arc<Frame>>>,
    snapshot: RwLock<Snapshot>,
    pub(crate) streaming_active: Arc<AtomicBool>,
    pub(crate) fps: Arc<FpsMeter>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) timing: Timing,
    pub(crate) workers: AtomicUsize,
}

/// Owns the camera driver and drives it through its lifecycle.
///
/// Commands are synchronous and meant to be called from the UI thread. Each
/// failure is returned to the caller and also published as
/// [`CameraEvent::ErrorOccurred`].
pub struct CameraController {
    shared: Arc<Shared>,
    provider: Arc<dyn DriverProvider>,
    fps_sampler: Option<FpsSampler>,
}

impl CameraController {
    /// Build a controller; the driver is created right away from `provider`.
    pub fn new(
        provider: Arc<dyn DriverProvider>,
        events: Arc<dyn EventSink>,
        options: ControllerOptions,
    ) -> Result<Self> {
        let driver = provider.create(options.simulation)?;
        let streaming_active = Arc::new(AtomicBool::new(false));
        let fps = Arc::new(FpsMeter::new());

        let fps_sampler = if options.timing.fps_interval.is_zero() {
            None
        } else {
            Some(FpsSampler::spawn(
                Arc::clone(&fps),
                Arc::clone(&streaming_active),
                Arc::clone(&events),
                options.timing.fps_interval,
            )?)
        };

        let shared = Arc::new(Shared {
            device: Mutex::new(DeviceSlot {
                driver,
                machine: StateMachine::new(),
                device_id: None,
                params: ParameterCache::default(),
                simulation: options.simulation,
                devices: Vec::new(),
                session: None,
                detached: None,
            }),
            latest_frame: Mutex::new(None),
            snapshot: RwLock::new(Snapshot {
                simulation: options.simulation,
                ..Snapshot::default()
            }),
            streaming_active,
            fps,
            events,
            timing: options.timing,
            workers: AtomicUsize::new(0),
        });

        Ok(Self {
            shared,
            provider,
            fps_sampler,
        })
    }

    /// Ask the driver for connectable devices and publish the list.
    pub fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut slot = self.shared.device.lock();
        self.enumerate_locked(&mut slot)
    }

    /// Switch between real hardware and the synthetic device.
    ///
    /// Only accepted while disconnected. The driver is rebuilt and the device
    /// list refreshed.
    pub fn set_simulation_mode(&self, enabled: bool) -> Result<()> {
        let mut slot = self.shared.device.lock();
        if slot.simulation == enabled {
            return Ok(());
        }
        let state = slot.state();
        if state != CameraState::Disconnected {
            return Err(self.report(
                "Simulation mode unchanged",
                CameraError::InvalidState {
                    operation: "change simulation mode",
                    state,
                },
            ));
        }

        let driver = self
            .provider
            .create(enabled)
            .map_err(|err| self.report("Simulation mode unchanged", err))?;
        slot.driver = driver;
        slot.simulation = enabled;
        slot.devices.clear();
        self.sync_snapshot(&slot);

        info!(enabled, "simulation mode changed");
        self.publish(CameraEvent::SimulationModeChanged(enabled));
        self.enumerate_locked(&mut slot).map(|_| ())
    }

    /// Open `device_id`; an empty id picks the first enumerated device.
    ///
    /// Connecting again to the open device is a no-op.
    pub fn connect(&self, device_id: &str) -> Result<()> {
        let mut slot = self.shared.device.lock();

        if slot.state().is_connected() {
            let current = slot.device_id.clone().unwrap_or_default();
            if device_id.is_empty() || device_id == current {
                debug!(device_id = %current, "already connected");
                return Ok(());
            }
            return Err(self.report(
                "Connection refused",
                CameraError::AlreadyConnected {
                    current,
                    requested: device_id.to_owned(),
                },
            ));
        }

        let target = if device_id.is_empty() {
            self.auto_select(&mut slot)?
        } else {
            device_id.to_owned()
        };

        self.transition(&mut slot, CameraState::Connecting)?;
        info!(device_id = %target, "connecting");

        if let Err(err) = expect_success("open", slot.driver.open(&target)) {
            self.transition(&mut slot, CameraState::Disconnected)?;
            let err = match err {
                CameraError::DriverRejected { .. } => CameraError::OpenFailed {
                    device_id: target.clone(),
                },
                other => other,
            };
            return Err(self.report(&format!("Failed to connect to {target}"), err));
        }

        slot.device_id = Some(target.clone());
        if self.read_back(&mut slot).is_err() {
            warn!(device_id = %target, "connected without confirmed parameters");
        }

        self.transition(&mut slot, CameraState::Connected)?;
        info!(device_id = %target, "camera connected");
        self.publish(CameraEvent::ConnectionStatusChanged {
            connected: true,
            device_id: target.clone(),
        });
        self.publish(CameraEvent::StatusMessage(format!("Connected to {target}")));
        Ok(())
    }

    /// Close the device, stopping the stream first.
    ///
    /// Always ends in [`CameraState::Disconnected`]; an error only reports
    /// that the driver did not shut down cleanly.
    pub fn disconnect(&self) -> Result<()> {
        let mut slot = self.shared.device.lock();
        let state = slot.state();
        if !state.is_connected() {
            return Ok(());
        }

        let mut outcome = Ok(());
        if state == CameraState::Streaming {
            outcome = self.stop_locked(&mut slot);
        }

        let device_id = slot.device_id.take().unwrap_or_default();
        if let Err(err) = expect_success("close", slot.driver.close()) {
            let err = self.report("Disconnect incomplete", err);
            warn!(device_id = %device_id, "discarding driver after failed close");
            match self.provider.create(slot.simulation) {
                Ok(driver) => slot.driver = driver,
                Err(create_err) => error!(error = %create_err, "failed to rebuild driver"),
            }
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }

        slot.params.clear();
        self.shared.latest_frame.lock().take();
        self.transition(&mut slot, CameraState::Disconnected)?;
        info!(device_id = %device_id, "camera disconnected");
        self.publish(CameraEvent::ConnectionStatusChanged {
            connected: false,
            device_id: device_id.clone(),
        });
        self.publish(CameraEvent::StatusMessage(format!(
            "Disconnected from {device_id}"
        )));
        outcome
    }

    /// Start grabbing and spawn the acquisition loop.
    ///
    /// A second call while streaming is a no-op. A non-continuous trigger
    /// mode is left as configured. Refused while a worker detached by an
    /// earlier stop is still running.
    pub fn start_streaming(&self) -> Result<()> {
        let mut slot = self.shared.device.lock();
        match slot.state() {
            CameraState::Streaming => return Ok(()),
            CameraState::Connected => {}
            _ => {
                return Err(self.report("Cannot start streaming", CameraError::NotConnected));
            }
        }

        if let Some(detached) = slot.detached.take() {
            slot.detached = detached.join(self.shared.timing.join_timeout);
        }
        if slot.detached.is_some() || self.shared.workers.load(Ordering::SeqCst) > 0 {
            warn!("previous acquisition thread still running");
            return Err(self.report("Cannot start streaming", CameraError::AcquisitionBusy));
        }

        if let Some(mode) = slot
            .params
            .confirmed()
            .trigger_mode()
            .filter(|mode| *mode != TriggerMode::Continuous)
        {
            info!(%mode, "streaming with non-continuous trigger mode");
            self.publish(CameraEvent::StatusMessage(format!(
                "Streaming in {mode} trigger mode, frames arrive per trigger"
            )));
        }

        expect_success("start grab", slot.driver.start_grab())
            .map_err(|err| self.report("Failed to start streaming", err))?;

        self.shared.fps.reset();
        self.shared.streaming_active.store(true, Ordering::Release);
        let device_id = slot.device_id.clone().unwrap_or_default();
        match StreamSession::start(&self.shared, device_id) {
            Ok(session) => slot.session = Some(session),
            Err(err) => {
                self.shared.streaming_active.store(false, Ordering::Release);
                if let Err(stop_err) = expect_success("stop grab", slot.driver.stop_grab()) {
                    warn!(error = %stop_err, "stop grab after failed spawn");
                }
                return Err(self.report("Failed to start streaming", err.into()));
            }
        }

        self.transition(&mut slot, CameraState::Streaming)?;
        info!("streaming started");
        self.publish(CameraEvent::StreamingStatusChanged { streaming: true });
        Ok(())
    }

    /// Stop the acquisition loop and grabbing.
    ///
    /// A no-op when not streaming. Always ends in [`CameraState::Connected`]
    /// when it was streaming; an error reports a failed `stop_grab`.
    pub fn stop_streaming(&self) -> Result<()> {
        let mut slot = self.shared.device.lock();
        if slot.state() != CameraState::Streaming {
            return Ok(());
        }
        self.stop_locked(&mut slot)
    }

    /// Write `requested` to the device, then read everything back.
    ///
    /// Rejected while streaming. Individual write failures do not stop the
    /// remaining keys; the confirmed set reflects the last successful read-back.
    pub fn apply_parameters(&self, requested: &ParameterSet) -> Result<()> {
        let mut slot = self.shared.device.lock();
        match slot.state() {
            CameraState::Connected => {}
            CameraState::Streaming => {
                return Err(self.report("Parameters not applied", CameraError::StreamingActive));
            }
            _ => return Err(self.report("Parameters not applied", CameraError::NotConnected)),
        }
        requested
            .validate()
            .map_err(|err| self.report("Parameters not applied", err))?;

        slot.params.request(requested);
        let mut failed = Vec::new();

        for (key, value) in requested.iter().filter(|(key, _)| !key.is_roi()) {
            match expect_success("set parameter", slot.driver.set_parameter(key, value)) {
                Ok(()) => debug!(%key, %value, "parameter written"),
                Err(err) => {
                    warn!(%key, %value, error = %err, "parameter write failed");
                    failed.push(key);
                }
            }
        }

        let roi_keys: Vec<ParamKey> = requested.keys().filter(|key| key.is_roi()).collect();
        if !roi_keys.is_empty() {
            let roi = merged_roi(slot.params.confirmed(), requested);
            if let Err(err) = expect_success("set roi", slot.driver.set_roi(roi)) {
                warn!(?roi, error = %err, "roi write failed");
                failed.extend(roi_keys);
            }
        }

        let read_back = self.read_back(&mut slot);
        let adjusted = slot.params.adjusted();
        if read_back.is_ok() && !adjusted.is_empty() {
            info!(keys = ?adjusted, "device adjusted requested parameters");
        }
        if !failed.is_empty() {
            return Err(self.report(
                "Some parameters were not applied",
                CameraError::ParametersRejected(failed),
            ));
        }
        read_back
    }

    /// Restore the full capture area, then read everything back.
    ///
    /// Rejected while streaming, like any other parameter change.
    pub fn reset_roi(&self) -> Result<()> {
        let mut slot = self.shared.device.lock();
        match slot.state() {
            CameraState::Connected => {}
            CameraState::Streaming => {
                return Err(self.report("ROI not reset", CameraError::StreamingActive));
            }
            _ => return Err(self.report("ROI not reset", CameraError::NotConnected)),
        }

        let outcome = expect_success("reset roi", slot.driver.reset_roi())
            .map_err(|err| self.report("ROI not reset", err));
        let read_back = self.read_back(&mut slot);
        outcome?;
        info!(roi = ?slot.params.confirmed().roi(), "roi reset");
        read_back
    }

    /// Fire one software trigger.
    ///
    /// Needs an open device whose confirmed trigger mode is software.
    pub fn trigger_software(&self) -> Result<()> {
        let mut slot = self.shared.device.lock();
        if !slot.state().is_connected() {
            return Err(self.report("Software trigger failed", CameraError::NotConnected));
        }
        let mode = slot.params.confirmed().trigger_mode().unwrap_or_default();
        if mode != TriggerMode::Software {
            return Err(self.report(
                "Software trigger ignored",
                CameraError::SoftwareTriggerUnavailable(mode),
            ));
        }

        expect_success("trigger once", slot.driver.trigger_once())
            .map_err(|err| self.report("Software trigger failed", err))?;
        debug!("software trigger sent");
        self.publish(CameraEvent::StatusMessage(
            "Software trigger sent".to_owned(),
        ));
        Ok(())
    }

    /// Driver-reported information about the open device.
    pub fn device_info(&self) -> Result<BTreeMap<String, String>> {
        let mut slot = self.shared.device.lock();
        if !slot.state().is_connected() {
            return Err(CameraError::NotConnected);
        }
        slot.driver
            .device_info()
            .map_err(|err| driver_fault("device info", &err))
    }

    /// Snapshot of state, device, parameters and rate.
    pub fn status_summary(&self) -> StatusSummary {
        let snapshot = self.shared.snapshot.read();
        StatusSummary {
            state: snapshot.state,
            is_connected: snapshot.state.is_connected(),
            is_streaming: snapshot.state == CameraState::Streaming,
            is_simulation_mode: snapshot.simulation,
            current_device_id: snapshot.device_id.clone(),
            parameters: snapshot.parameters.clone(),
            fps: self.shared.fps.current(),
            available_devices: snapshot.available_devices,
        }
    }

    /// Most recent frame of the current or last stream.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest_frame.lock().clone()
    }

    /// Current state.
    pub fn state(&self) -> CameraState {
        self.shared.snapshot.read().state
    }

    /// States visited, oldest first.
    pub fn state_history(&self) -> Vec<CameraState> {
        self.shared.device.lock().machine.history()
    }

    /// Whether a device handle is held and the driver reports it open.
    pub fn is_open(&self) -> bool {
        let slot = self.shared.device.lock();
        slot.device_id.is_some() && slot.driver.is_open()
    }

    /// Number of acquisition threads currently alive.
    pub fn active_workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    fn enumerate_locked(&self, slot: &mut DeviceSlot) -> Result<Vec<DeviceDescriptor>> {
        let devices = slot
            .driver
            .enumerate()
            .map_err(|err| self.report("Device enumeration failed", driver_fault("enumerate", &err)))?;

        info!(count = devices.len(), "devices enumerated");
        slot.devices.clone_from(&devices);
        self.sync_snapshot(slot);
        self.publish(CameraEvent::DeviceListUpdated(devices.clone()));
        self.publish(CameraEvent::StatusMessage(format!(
            "Found {} device(s)",
            devices.len()
        )));
        Ok(devices)
    }

    fn auto_select(&self, slot: &mut DeviceSlot) -> Result<String> {
        if slot.devices.is_empty() {
            self.enumerate_locked(slot)?;
        }
        match slot.devices.first() {
            Some(device) => Ok(device.device_id.clone()),
            None => Err(self.report("Connection failed", CameraError::NoDevices)),
        }
    }

    fn stop_locked(&self, slot: &mut DeviceSlot) -> Result<()> {
        self.shared.streaming_active.store(false, Ordering::Release);
        if let Some(session) = slot.session.take() {
            slot.detached = session.stop(self.shared.timing.join_timeout);
        }

        let outcome = expect_success("stop grab", slot.driver.stop_grab());
        self.transition(slot, CameraState::Connected)?;
        info!("streaming stopped");
        self.publish(CameraEvent::StreamingStatusChanged { streaming: false });
        outcome.map_err(|err| self.report("Failed to stop streaming cleanly", err))
    }

    /// Read every parameter back into the confirmed set and publish it once.
    ///
    /// A failed read-back is reported and leaves the confirmed set as it was;
    /// no `parameters_updated` is published for it.
    fn read_back(&self, slot: &mut DeviceSlot) -> Result<()> {
        let read_back = slot.driver.read_parameters().map_err(|err| {
            self.report(
                "Parameter read-back failed",
                driver_fault("read parameters", &err),
            )
        })?;
        slot.params.confirm(read_back);
        self.sync_snapshot(slot);
        self.publish(CameraEvent::ParametersUpdated(
            slot.params.confirmed().clone(),
        ));
        Ok(())
    }

    fn transition(&self, slot: &mut DeviceSlot, to: CameraState) -> Result<()> {
        slot.machine.transition(to)?;
        self.sync_snapshot(slot);
        Ok(())
    }

    fn sync_snapshot(&self, slot: &DeviceSlot) {
        let mut snapshot = self.shared.snapshot.write();
        snapshot.state = slot.state();
        snapshot.device_id.clone_from(&slot.device_id);
        snapshot.simulation = slot.simulation;
        snapshot.parameters = slot.params.confirmed().clone();
        snapshot.available_devices = slot.devices.len();
    }

    fn publish(&self, event: CameraEvent) {
        self.shared.events.publish(event);
    }

    fn report(&self, title: &str, err: CameraError) -> CameraError {
        error!(title, error = %err, "camera command failed");
        self.publish(CameraEvent::ErrorOccurred {
            title: title.to_owned(),
            message: err.to_string(),
        });
        err
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!(error = %err, "disconnect during shutdown reported an error");
        }
        self.fps_sampler.take();
    }
}

/// Map a `Result<bool>` driver outcome onto the error taxonomy.
fn expect_success(operation: &'static str, outcome: Result<bool>) -> Result<()> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(CameraError::DriverRejected { operation }),
        Err(err) => Err(driver_fault(operation, &err)),
    }
}

fn driver_fault(operation: &'static str, err: &CameraError) -> CameraError {
    error!(operation, error = %err, "driver fault");
    CameraError::DriverFault {
        operation,
        message: err.to_string(),
    }
}

fn merged_roi(confirmed: &ParameterSet, requested: &ParameterSet) -> Roi {
    let base = confirmed.roi().unwrap_or_default();
    let pick = |key, fallback: u32| {
        requested
            .get(key)
            .and_then(ParamValue::as_i64)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(fallback)
    };
    Roi::new(
        pick(ParamKey::RoiX, base.x),
        pick(ParamKey::RoiY, base.y),
        pick(ParamKey::RoiWidth, base.width),
        pick(ParamKey::RoiHeight, base.height),
    )
}
