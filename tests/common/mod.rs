//! Scripted driver for controller tests.
//!
//! Every `ScriptedDriver` created by [`provider`] shares one [`Script`], so a
//! test can change outcomes and inspect calls after handing the driver over.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camera_session::{
    CameraController, CameraError, CameraEvent, ControllerOptions, DeviceDescriptor,
    DeviceDriver, DriverProvider, EventBus, FourCC, Frame, FrameMetadata, ParamKey, ParamValue,
    ParameterSet, Result, Roi, Timing, TriggerMode,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

/// Shared, test-controlled driver behaviour.
pub struct Script {
    /// Devices returned by `enumerate`.
    pub devices: Vec<DeviceDescriptor>,
    /// When set, every `Result<bool>` call reports failure.
    pub always_false: bool,
    /// Keys whose writes report failure.
    pub reject: Vec<ParamKey>,
    /// Frames handed out by `get_frame`, in order.
    pub frames: VecDeque<Frame>,
    /// Number of upcoming `get_frame` calls that fault before any frame.
    pub pull_faults: usize,
    /// Number of upcoming `read_parameters` calls that fault.
    pub read_faults: usize,
    /// Device-side parameter values.
    pub params: ParameterSet,
    /// Maps a written value to what the device stores.
    pub quantize: fn(ParamKey, &ParamValue) -> ParamValue,
    /// How long `get_frame` blocks when no frame is queued.
    pub idle_wait: Duration,
    /// Call counts by driver method name.
    pub calls: BTreeMap<&'static str, usize>,
    /// Whether a device is open.
    pub open: bool,
}

impl Default for Script {
    fn default() -> Self {
        let mut params = ParameterSet::new()
            .with(ParamKey::ExposureTime, ParamValue::Float(10_000.0))
            .with(ParamKey::Gain, ParamValue::Float(0.0))
            .with(ParamKey::TriggerMode, ParamValue::Trigger(TriggerMode::Continuous));
        params.set_roi(Roi::new(0, 0, 640, 480));
        Self {
            devices: vec![device("cam-0"), device("cam-1")],
            always_false: false,
            reject: Vec::new(),
            frames: VecDeque::new(),
            pull_faults: 0,
            read_faults: 0,
            params,
            quantize: |_, value| value.clone(),
            idle_wait: Duration::from_millis(2),
            calls: BTreeMap::new(),
            open: false,
        }
    }
}

impl Script {
    /// Number of recorded calls to `method`.
    pub fn count(&self, method: &str) -> usize {
        self.calls.get(method).copied().unwrap_or(0)
    }
}

/// Handle shared by the test and every driver it creates.
pub type SharedScript = Arc<Mutex<Script>>;

/// Driver whose behaviour is read from a [`Script`].
pub struct ScriptedDriver {
    script: SharedScript,
}

impl ScriptedDriver {
    fn call(&self, method: &'static str) -> bool {
        let mut script = self.script.lock();
        *script.calls.entry(method).or_default() += 1;
        !script.always_false
    }

    fn write(&self, key: ParamKey, value: &ParamValue) -> bool {
        if !self.call("set_parameter") {
            return false;
        }
        let mut script = self.script.lock();
        if script.reject.contains(&key) {
            return false;
        }
        let stored = (script.quantize)(key, value);
        script.params.insert(key, stored);
        true
    }
}

impl DeviceDriver for ScriptedDriver {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>> {
        self.call("enumerate");
        Ok(self.script.lock().devices.clone())
    }

    fn open(&mut self, _device_id: &str) -> Result<bool> {
        let ok = self.call("open");
        self.script.lock().open = ok;
        Ok(ok)
    }

    fn close(&mut self) -> Result<bool> {
        let ok = self.call("close");
        if ok {
            self.script.lock().open = false;
        }
        Ok(ok)
    }

    fn is_open(&self) -> bool {
        self.script.lock().open
    }

    fn start_grab(&mut self) -> Result<bool> {
        Ok(self.call("start_grab"))
    }

    fn stop_grab(&mut self) -> Result<bool> {
        Ok(self.call("stop_grab"))
    }

    fn get_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let (next, wait) = {
            let mut script = self.script.lock();
            *script.calls.entry("get_frame").or_default() += 1;
            if script.pull_faults > 0 {
                script.pull_faults -= 1;
                return Err(scripted_fault("get frame"));
            }
            (script.frames.pop_front(), script.idle_wait.min(timeout))
        };
        if next.is_none() {
            thread::sleep(wait);
        }
        Ok(next)
    }

    fn trigger_once(&mut self) -> Result<bool> {
        Ok(self.call("trigger_once"))
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<bool> {
        Ok(self.write(ParamKey::TriggerMode, &ParamValue::Trigger(mode)))
    }

    fn set_exposure(&mut self, exposure_us: f64) -> Result<bool> {
        Ok(self.write(ParamKey::ExposureTime, &ParamValue::Float(exposure_us)))
    }

    fn exposure(&mut self) -> Result<f64> {
        self.script
            .lock()
            .params
            .get_f64(ParamKey::ExposureTime)
            .ok_or(CameraError::NotConnected)
    }

    fn set_gain(&mut self, gain_db: f64) -> Result<bool> {
        Ok(self.write(ParamKey::Gain, &ParamValue::Float(gain_db)))
    }

    fn gain(&mut self) -> Result<f64> {
        self.script
            .lock()
            .params
            .get_f64(ParamKey::Gain)
            .ok_or(CameraError::NotConnected)
    }

    fn set_roi(&mut self, roi: Roi) -> Result<bool> {
        if !self.call("set_roi") {
            return Ok(false);
        }
        let mut script = self.script.lock();
        if script.reject.iter().any(|key| key.is_roi()) {
            return Ok(false);
        }
        script.params.set_roi(roi);
        Ok(true)
    }

    fn roi(&mut self) -> Result<Roi> {
        self.script
            .lock()
            .params
            .roi()
            .ok_or(CameraError::NotConnected)
    }

    fn reset_roi(&mut self) -> Result<bool> {
        if !self.call("reset_roi") {
            return Ok(false);
        }
        self.script.lock().params.set_roi(FULL_SENSOR);
        Ok(true)
    }

    fn set_parameter(&mut self, key: ParamKey, value: &ParamValue) -> Result<bool> {
        Ok(self.write(key, value))
    }

    fn read_parameters(&mut self) -> Result<ParameterSet> {
        self.call("read_parameters");
        let mut script = self.script.lock();
        if script.read_faults > 0 {
            script.read_faults -= 1;
            return Err(scripted_fault("read parameters"));
        }
        Ok(script.params.clone())
    }

    fn device_info(&mut self) -> Result<BTreeMap<String, String>> {
        self.call("device_info");
        Ok(BTreeMap::from([("vendor".to_owned(), "scripted".to_owned())]))
    }
}

/// Capture area restored by `reset_roi`.
pub const FULL_SENSOR: Roi = Roi::new(0, 0, 1280, 1024);

fn scripted_fault(operation: &'static str) -> CameraError {
    CameraError::DriverFault {
        operation,
        message: "scripted fault".to_owned(),
    }
}

/// Descriptor for a test device.
pub fn device(id: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        device_id: id.to_owned(),
        model_name: "Scripted".to_owned(),
        serial_number: format!("SN-{id}"),
        ip: None,
    }
}

/// A small YUYV frame carrying `counter`.
pub fn frame(counter: u64) -> Frame {
    Frame {
        data: vec![128; 8 * 4 * 2],
        width: 8,
        height: 4,
        pixel_format: FourCC::YUYV,
        device_id: String::new(),
        metadata: FrameMetadata {
            counter,
            timestamp: Duration::from_millis(counter),
            bytes_used: 64,
        },
    }
}

/// Provider creating drivers that share `script`; counts creations.
pub fn provider(script: &SharedScript) -> Arc<dyn DriverProvider> {
    let script = Arc::clone(script);
    Arc::new(move |_simulation: bool| -> Result<Box<dyn DeviceDriver>> {
        *script.lock().calls.entry("create").or_default() += 1;
        Ok(Box::new(ScriptedDriver {
            script: Arc::clone(&script),
        }))
    })
}

/// Short timeouts so tests run fast; the FPS sampler is off.
pub fn fast_timing() -> Timing {
    Timing {
        lock_timeout: Duration::from_millis(5),
        lock_retry: Duration::from_millis(1),
        frame_timeout: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
        join_timeout: Duration::from_secs(1),
        fps_interval: Duration::ZERO,
    }
}

/// Controller over a fresh script, plus an event subscription.
pub fn setup() -> (CameraController, SharedScript, Receiver<CameraEvent>) {
    setup_with(Script::default(), fast_timing())
}

/// Controller over `script` with `timing`.
pub fn setup_with(
    script: Script,
    timing: Timing,
) -> (CameraController, SharedScript, Receiver<CameraEvent>) {
    let script = Arc::new(Mutex::new(script));
    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe();
    let controller = CameraController::new(
        provider(&script),
        bus,
        ControllerOptions {
            simulation: false,
            timing,
        },
    )
    .expect("controller");
    (controller, script, events)
}

/// Names of every event received so far.
pub fn drain(events: &Receiver<CameraEvent>) -> Vec<&'static str> {
    events.try_iter().map(|event| event.name()).collect()
}

/// Collect events until `n` frames arrived or `timeout` passed.
pub fn collect_frames(
    events: &Receiver<CameraEvent>,
    n: usize,
    timeout: Duration,
) -> Vec<Arc<Frame>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut frames = Vec::new();
    while frames.len() < n {
        let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) else {
            break;
        };
        match events.recv_timeout(remaining) {
            Ok(CameraEvent::NewFrameAvailable(frame)) => frames.push(frame),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    frames
}
