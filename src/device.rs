//! V4L2 driver using the v4l crate, plus the default driver provider.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::parameters::{ParamKey, ParamValue, ParameterSet, TriggerMode};
use crate::simulated::SimulatedCamera;
use crate::traits::{
    DeviceDescriptor, DeviceDriver, DriverProvider, FourCC, Frame, FrameMetadata, Roi,
};

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_GAIN: u32 = 0x0098_0913;
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_WHITE_BALANCE_TEMPERATURE: u32 = 0x0098_091a;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;
/// `V4L2_CID_EXPOSURE_ABSOLUTE` counts in 100 µs units.
const EXPOSURE_UNIT_US: f64 = 100.0;

/// Number of mmap buffers per stream.
const BUFFER_COUNT: u32 = 4;

/// V4L2 capture device driven through the [`DeviceDriver`] seam.
///
/// Device ids are node paths such as `/dev/video0`. Only continuous trigger
/// mode exists on V4L2; ROI changes and software triggers are reported as
/// unsupported.
pub struct V4l2Driver {
    device: Option<Device>,
    device_id: Option<String>,
    stream: Option<Stream<'static>>,
    format: Option<v4l::Format>,
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Driver {
    /// Create a driver with no device open.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            device: None,
            device_id: None,
            stream: None,
            format: None,
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(CameraError::NotConnected)
    }

    fn control(&self, id: u32) -> Result<Option<i64>> {
        match self.device()?.control(id) {
            Ok(control) => Ok(match control.value {
                Value::Integer(value) => Some(value),
                Value::Boolean(flag) => Some(i64::from(flag)),
                _ => None,
            }),
            Err(err) => {
                debug!(id = format_args!("{id:#x}"), error = %err, "control not readable");
                Ok(None)
            }
        }
    }

    fn set_control(&self, id: u32, value: Value) -> Result<bool> {
        match self.device()?.set_control(Control { id, value }) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(id = format_args!("{id:#x}"), error = %err, "control write failed");
                Ok(false)
            }
        }
    }

    /// Change one field of the capture format. Not allowed while grabbing.
    fn update_format<F: FnOnce(&mut v4l::Format)>(&mut self, change: F) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(false);
        }
        let device = self.device()?;
        let mut format = device.format()?;
        change(&mut format);
        match device.set_format(&format) {
            Ok(actual) => {
                self.format = Some(actual);
                Ok(true)
            }
            Err(err) => {
                warn!(error = %err, "format change rejected");
                Ok(false)
            }
        }
    }

    fn frame_rate(&self) -> Result<Option<f64>> {
        let params = self.device()?.params()?;
        let interval = params.interval;
        if interval.numerator == 0 {
            return Ok(None);
        }
        Ok(Some(
            f64::from(interval.denominator) / f64::from(interval.numerator),
        ))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn set_frame_rate(&self, fps: f64) -> Result<bool> {
        let requested = fps.round().max(1.0) as u32;
        match self.device()?.set_params(&Parameters::with_fps(requested)) {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(fps = requested, error = %err, "frame rate rejected");
                Ok(false)
            }
        }
    }
}

fn describe(device: &Device, device_id: String) -> Option<DeviceDescriptor> {
    let caps = device.query_caps().ok()?;
    if !caps
        .capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
    {
        return None;
    }
    Some(DeviceDescriptor {
        device_id,
        model_name: caps.card,
        serial_number: caps.bus,
        ip: None,
    })
}

impl DeviceDriver for V4l2Driver {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        Ok(nodes
            .iter()
            .filter_map(|node| {
                let device_id = node.path().display().to_string();
                let device = Device::with_path(node.path()).ok()?;
                describe(&device, device_id)
            })
            .collect())
    }

    fn open(&mut self, device_id: &str) -> Result<bool> {
        if self.device.is_some() {
            self.close()?;
        }
        let device = match Device::with_path(device_id) {
            Ok(device) => device,
            Err(err) => {
                warn!(device_id, error = %err, "failed to open V4L2 device");
                return Ok(false);
            }
        };
        if describe(&device, device_id.to_owned()).is_none() {
            warn!(device_id, "device has no capture capability");
            return Ok(false);
        }
        self.format = Some(device.format()?);
        self.device = Some(device);
        self.device_id = Some(device_id.to_owned());
        Ok(true)
    }

    fn close(&mut self) -> Result<bool> {
        self.stream.take();
        self.format.take();
        self.device_id.take();
        Ok(self.device.take().is_some())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn start_grab(&mut self) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(true);
        }
        let device = self.device()?;
        let stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        self.format = Some(device.format()?);
        self.stream = Some(stream);
        Ok(true)
    }

    fn stop_grab(&mut self) -> Result<bool> {
        // Dropping the stream issues STREAMOFF and unmaps the buffers.
        self.stream.take();
        Ok(true)
    }

    fn get_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let (Some(stream), Some(format)) = (self.stream.as_mut(), self.format.as_ref()) else {
            return Err(CameraError::StreamError("not grabbing".to_owned()));
        };
        stream.set_timeout(timeout);

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(CameraError::StreamError(err.to_string())),
        };

        // V4L2 timestamps are non-negative in practice.
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
        let data = buf.get(..meta.bytesused as usize).unwrap_or(buf).to_vec();

        Ok(Some(Frame {
            data,
            width: format.width,
            height: format.height,
            pixel_format: FourCC::from(format.fourcc),
            device_id: self.device_id.clone().unwrap_or_default(),
            metadata: FrameMetadata {
                counter: u64::from(meta.sequence),
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        }))
    }

    fn trigger_once(&mut self) -> Result<bool> {
        self.device()?;
        Ok(false)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<bool> {
        self.device()?;
        Ok(mode == TriggerMode::Continuous)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_exposure(&mut self, exposure_us: f64) -> Result<bool> {
        if !self.set_control(CID_EXPOSURE_AUTO, Value::Integer(EXPOSURE_MANUAL))? {
            return Ok(false);
        }
        let units = (exposure_us / EXPOSURE_UNIT_US).round().max(1.0) as i64;
        self.set_control(CID_EXPOSURE_ABSOLUTE, Value::Integer(units))
    }

    #[allow(clippy::cast_precision_loss)]
    fn exposure(&mut self) -> Result<f64> {
        self.control(CID_EXPOSURE_ABSOLUTE)?
            .map(|units| units as f64 * EXPOSURE_UNIT_US)
            .ok_or_else(|| CameraError::StreamError("exposure not readable".to_owned()))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_gain(&mut self, gain_db: f64) -> Result<bool> {
        self.set_control(CID_GAIN, Value::Integer(gain_db.round() as i64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn gain(&mut self) -> Result<f64> {
        self.control(CID_GAIN)?
            .map(|gain| gain as f64)
            .ok_or_else(|| CameraError::StreamError("gain not readable".to_owned()))
    }

    fn set_roi(&mut self, roi: Roi) -> Result<bool> {
        self.device()?;
        debug!(?roi, "V4L2 capture has no ROI support");
        Ok(false)
    }

    fn roi(&mut self) -> Result<Roi> {
        let format = self.device()?.format()?;
        Ok(Roi::new(0, 0, format.width, format.height))
    }

    fn reset_roi(&mut self) -> Result<bool> {
        // Capture always covers the whole negotiated format.
        let roi = self.roi()?;
        debug!(?roi, "roi reset to current format");
        Ok(true)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_parameter(&mut self, key: ParamKey, value: &ParamValue) -> Result<bool> {
        match (key, value) {
            (ParamKey::ExposureTime, ParamValue::Float(us)) => self.set_exposure(*us),
            (ParamKey::Gain, ParamValue::Float(db)) => self.set_gain(*db),
            (ParamKey::TriggerMode, ParamValue::Trigger(mode)) => self.set_trigger_mode(*mode),
            (ParamKey::WhiteBalanceKelvin, ParamValue::Float(k)) => self.set_control(
                CID_WHITE_BALANCE_TEMPERATURE,
                Value::Integer(k.round() as i64),
            ),
            (ParamKey::FrameRate, ParamValue::Float(fps)) => self.set_frame_rate(*fps),
            (ParamKey::AutoExposure, ParamValue::Bool(on)) => {
                let mode = if *on {
                    EXPOSURE_APERTURE_PRIORITY
                } else {
                    EXPOSURE_MANUAL
                };
                self.set_control(CID_EXPOSURE_AUTO, Value::Integer(mode))
            }
            (ParamKey::AutoGain, ParamValue::Bool(on)) => {
                self.set_control(CID_AUTOGAIN, Value::Boolean(*on))
            }
            (ParamKey::AutoWhiteBalance, ParamValue::Bool(on)) => {
                self.set_control(CID_AUTO_WHITE_BALANCE, Value::Boolean(*on))
            }
            (ParamKey::Width, ParamValue::Int(width)) => match u32::try_from(*width) {
                Ok(width) => self.update_format(|format| format.width = width),
                Err(_) => Ok(false),
            },
            (ParamKey::Height, ParamValue::Int(height)) => match u32::try_from(*height) {
                Ok(height) => self.update_format(|format| format.height = height),
                Err(_) => Ok(false),
            },
            (ParamKey::PixelFormat, ParamValue::PixelFormat(code)) => {
                let code = *code;
                self.update_format(|format| format.fourcc = code.into())
            }
            _ => {
                debug!(%key, %value, "parameter not supported by V4L2 driver");
                Ok(false)
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn read_parameters(&mut self) -> Result<ParameterSet> {
        let format = self.device()?.format()?;
        let mut params = ParameterSet::new()
            .with(ParamKey::TriggerMode, ParamValue::Trigger(TriggerMode::Continuous))
            .with(ParamKey::Width, ParamValue::Int(format.width.into()))
            .with(ParamKey::Height, ParamValue::Int(format.height.into()))
            .with(
                ParamKey::PixelFormat,
                ParamValue::PixelFormat(FourCC::from(format.fourcc)),
            );
        params.set_roi(Roi::new(0, 0, format.width, format.height));

        // Controls the device lacks are left out of the snapshot.
        if let Some(units) = self.control(CID_EXPOSURE_ABSOLUTE)? {
            params.insert(
                ParamKey::ExposureTime,
                ParamValue::Float(units as f64 * EXPOSURE_UNIT_US),
            );
        }
        if let Some(mode) = self.control(CID_EXPOSURE_AUTO)? {
            params.insert(ParamKey::AutoExposure, ParamValue::Bool(mode != EXPOSURE_MANUAL));
        }
        if let Some(gain) = self.control(CID_GAIN)? {
            params.insert(ParamKey::Gain, ParamValue::Float(gain as f64));
        }
        if let Some(on) = self.control(CID_AUTOGAIN)? {
            params.insert(ParamKey::AutoGain, ParamValue::Bool(on != 0));
        }
        if let Some(kelvin) = self.control(CID_WHITE_BALANCE_TEMPERATURE)? {
            params.insert(ParamKey::WhiteBalanceKelvin, ParamValue::Float(kelvin as f64));
        }
        if let Some(on) = self.control(CID_AUTO_WHITE_BALANCE)? {
            params.insert(ParamKey::AutoWhiteBalance, ParamValue::Bool(on != 0));
        }
        match self.frame_rate() {
            Ok(Some(fps)) => {
                params.insert(ParamKey::FrameRate, ParamValue::Float(fps));
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "frame rate not readable"),
        }
        Ok(params)
    }

    fn device_info(&mut self) -> Result<BTreeMap<String, String>> {
        let device = self.device()?;
        let caps = device.query_caps()?;
        let format = device.format()?;

        let mut info = BTreeMap::new();
        info.insert("driver".to_owned(), caps.driver);
        info.insert("card".to_owned(), caps.card);
        info.insert("bus".to_owned(), caps.bus);
        info.insert(
            "format".to_owned(),
            format!("{}x{} {}", format.width, format.height, FourCC::from(format.fourcc)),
        );
        info.insert(
            "streaming".to_owned(),
            caps.capabilities
                .contains(v4l::capability::Flags::STREAMING)
                .to_string(),
        );
        if let Some(device_id) = &self.device_id {
            info.insert("path".to_owned(), device_id.clone());
        }
        Ok(info)
    }
}

/// Builds the simulated camera in simulation mode and a [`V4l2Driver`] otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDriverProvider;

impl DriverProvider for DefaultDriverProvider {
    fn create(&self, simulation: bool) -> Result<Box<dyn DeviceDriver>> {
        if simulation {
            Ok(Box::new(SimulatedCamera::new()))
        } else {
            Ok(Box::new(V4l2Driver::new()))
        }
    }
}
