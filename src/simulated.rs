//! Synthetic camera used in simulation mode.
//!
//! Behaves like a small industrial camera: frames are paced by the frame rate,
//! software triggers release one frame each, and settings are quantized the way
//! real sensors do it, so a read-back can legitimately differ from a request.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CameraError, Result};
use crate::parameters::{ParamKey, ParamValue, ParameterSet, TriggerMode};
use crate::traits::{DeviceDescriptor, DeviceDriver, FourCC, Frame, FrameMetadata, Roi};

/// Sensor resolution of the synthetic camera.
pub const SENSOR_WIDTH: u32 = 1280;
/// Sensor height of the synthetic camera.
pub const SENSOR_HEIGHT: u32 = 1024;

const GAIN_MAX_DB: f64 = 24.0;
const FRAME_RATE_RANGE: (f64, f64) = (1.0, 120.0);
const WHITE_BALANCE_RANGE: (f64, f64) = (2000.0, 12_000.0);

/// Test pattern types for synthetic frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    #[default]
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Debug, Clone)]
struct Settings {
    exposure_us: f64,
    gain_db: f64,
    white_balance_k: f64,
    frame_rate: f64,
    trigger: TriggerMode,
    auto_exposure: bool,
    auto_gain: bool,
    auto_wb: bool,
    roi: Roi,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exposure_us: 10_000.0,
            gain_db: 0.0,
            white_balance_k: 5000.0,
            frame_rate: 30.0,
            trigger: TriggerMode::Continuous,
            auto_exposure: false,
            auto_gain: false,
            auto_wb: false,
            roi: Roi::new(0, 0, 640, 480),
        }
    }
}

/// Driver backed by generated frames instead of hardware.
#[derive(Debug)]
pub struct SimulatedCamera {
    devices: Vec<DeviceDescriptor>,
    open: Option<String>,
    grabbing: bool,
    settings: Settings,
    pattern: TestPattern,
    counter: u64,
    started: Instant,
    next_due: Instant,
    pending_triggers: u32,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    /// Create a camera exposing the two built-in synthetic devices.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            devices: vec![
                DeviceDescriptor {
                    device_id: "SIM-GIGE-0".to_owned(),
                    model_name: "Simulated GigE Camera".to_owned(),
                    serial_number: "SIM00001".to_owned(),
                    ip: Some("192.168.10.20".to_owned()),
                },
                DeviceDescriptor {
                    device_id: "SIM-USB-1".to_owned(),
                    model_name: "Simulated USB3 Camera".to_owned(),
                    serial_number: "SIM00002".to_owned(),
                    ip: None,
                },
            ],
            open: None,
            grabbing: false,
            settings: Settings::default(),
            pattern: TestPattern::default(),
            counter: 0,
            started: now,
            next_due: now,
            pending_triggers: 0,
        }
    }

    /// Set the pattern rendered into every frame.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    fn require_open(&self) -> Result<&str> {
        self.open.as_deref().ok_or(CameraError::NotConnected)
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.settings.frame_rate)
    }

    fn render(&mut self) -> Frame {
        let roi = self.settings.roi;
        let data = generate_pattern(roi.width, roi.height, self.pattern);
        let counter = self.counter;
        self.counter += 1;

        Frame {
            data,
            width: roi.width,
            height: roi.height,
            pixel_format: FourCC::YUYV,
            device_id: self.open.clone().unwrap_or_default(),
            metadata: FrameMetadata {
                counter,
                timestamp: self.started.elapsed(),
                bytes_used: u32::try_from(data_len(roi)).unwrap_or(u32::MAX),
            },
        }
    }

    fn apply_roi(&mut self, roi: Roi) -> bool {
        // YUYV packs two pixels per macropixel.
        let width = roi.width & !1;
        let fits = width >= 2
            && roi.height >= 1
            && roi.x.checked_add(width).is_some_and(|right| right <= SENSOR_WIDTH)
            && roi.y.checked_add(roi.height).is_some_and(|bottom| bottom <= SENSOR_HEIGHT);
        if fits {
            self.settings.roi = Roi { width, ..roi };
        } else {
            warn!(?roi, "roi outside sensor");
        }
        fits
    }
}

fn data_len(roi: Roi) -> usize {
    roi.width as usize * roi.height as usize * 2
}

impl DeviceDriver for SimulatedCamera {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }

    fn open(&mut self, device_id: &str) -> Result<bool> {
        if !self.devices.iter().any(|d| d.device_id == device_id) {
            warn!(device_id, "unknown simulated device");
            return Ok(false);
        }
        self.open = Some(device_id.to_owned());
        self.grabbing = false;
        self.settings = Settings::default();
        self.counter = 0;
        self.pending_triggers = 0;
        self.started = Instant::now();
        debug!(device_id, "simulated device opened");
        Ok(true)
    }

    fn close(&mut self) -> Result<bool> {
        self.grabbing = false;
        Ok(self.open.take().is_some())
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn start_grab(&mut self) -> Result<bool> {
        self.require_open()?;
        self.grabbing = true;
        self.pending_triggers = 0;
        self.next_due = Instant::now();
        Ok(true)
    }

    fn stop_grab(&mut self) -> Result<bool> {
        self.require_open()?;
        self.grabbing = false;
        Ok(true)
    }

    fn get_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        if !self.grabbing {
            return Err(CameraError::StreamError("not grabbing".to_owned()));
        }

        match self.settings.trigger {
            TriggerMode::Continuous => {
                let now = Instant::now();
                if self.next_due > now {
                    let wait = self.next_due - now;
                    if wait > timeout {
                        thread::sleep(timeout);
                        return Ok(None);
                    }
                    thread::sleep(wait);
                }
                // Do not accumulate a backlog after a long pause.
                self.next_due = (self.next_due + self.frame_period()).max(Instant::now());
                Ok(Some(self.render()))
            }
            TriggerMode::Software if self.pending_triggers > 0 => {
                self.pending_triggers -= 1;
                Ok(Some(self.render()))
            }
            TriggerMode::Software | TriggerMode::Hardware => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn trigger_once(&mut self) -> Result<bool> {
        self.require_open()?;
        if self.settings.trigger != TriggerMode::Software || !self.grabbing {
            return Ok(false);
        }
        self.pending_triggers += 1;
        Ok(true)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<bool> {
        self.require_open()?;
        self.settings.trigger = mode;
        self.pending_triggers = 0;
        Ok(true)
    }

    fn set_exposure(&mut self, exposure_us: f64) -> Result<bool> {
        self.require_open()?;
        if !exposure_us.is_finite() || exposure_us <= 0.0 {
            return Ok(false);
        }
        self.settings.exposure_us = exposure_us.round().max(1.0);
        Ok(true)
    }

    fn exposure(&mut self) -> Result<f64> {
        self.require_open()?;
        Ok(self.settings.exposure_us)
    }

    fn set_gain(&mut self, gain_db: f64) -> Result<bool> {
        self.require_open()?;
        if !gain_db.is_finite() {
            return Ok(false);
        }
        self.settings.gain_db = (gain_db.clamp(0.0, GAIN_MAX_DB) * 10.0).round() / 10.0;
        Ok(true)
    }

    fn gain(&mut self) -> Result<f64> {
        self.require_open()?;
        Ok(self.settings.gain_db)
    }

    fn set_roi(&mut self, roi: Roi) -> Result<bool> {
        self.require_open()?;
        Ok(self.apply_roi(roi))
    }

    fn roi(&mut self) -> Result<Roi> {
        self.require_open()?;
        Ok(self.settings.roi)
    }

    fn reset_roi(&mut self) -> Result<bool> {
        self.require_open()?;
        Ok(self.apply_roi(Roi::new(0, 0, SENSOR_WIDTH, SENSOR_HEIGHT)))
    }

    fn set_parameter(&mut self, key: ParamKey, value: &ParamValue) -> Result<bool> {
        self.require_open()?;
        let accepted = match (key, value) {
            (ParamKey::ExposureTime, ParamValue::Float(us)) => return self.set_exposure(*us),
            (ParamKey::Gain, ParamValue::Float(db)) => return self.set_gain(*db),
            (ParamKey::TriggerMode, ParamValue::Trigger(mode)) => {
                return self.set_trigger_mode(*mode)
            }
            (ParamKey::WhiteBalanceKelvin, ParamValue::Float(k)) => {
                let (min, max) = WHITE_BALANCE_RANGE;
                self.settings.white_balance_k = (k.clamp(min, max) / 10.0).round() * 10.0;
                true
            }
            (ParamKey::FrameRate, ParamValue::Float(fps)) => {
                let (min, max) = FRAME_RATE_RANGE;
                self.settings.frame_rate = fps.clamp(min, max);
                true
            }
            (ParamKey::AutoExposure, ParamValue::Bool(on)) => {
                self.settings.auto_exposure = *on;
                true
            }
            (ParamKey::AutoGain, ParamValue::Bool(on)) => {
                self.settings.auto_gain = *on;
                true
            }
            (ParamKey::AutoWhiteBalance, ParamValue::Bool(on)) => {
                self.settings.auto_wb = *on;
                true
            }
            (ParamKey::Width | ParamKey::Height, ParamValue::Int(size)) => {
                let Ok(size) = u32::try_from(*size) else {
                    return Ok(false);
                };
                let mut roi = self.settings.roi;
                if key == ParamKey::Width {
                    roi.width = size;
                } else {
                    roi.height = size;
                }
                self.apply_roi(roi)
            }
            (ParamKey::PixelFormat, ParamValue::PixelFormat(code)) => *code == FourCC::YUYV,
            _ => {
                debug!(%key, %value, "parameter not supported by simulated camera");
                false
            }
        };
        Ok(accepted)
    }

    fn read_parameters(&mut self) -> Result<ParameterSet> {
        self.require_open()?;
        let s = &self.settings;
        let mut params = ParameterSet::new()
            .with(ParamKey::ExposureTime, ParamValue::Float(s.exposure_us))
            .with(ParamKey::Gain, ParamValue::Float(s.gain_db))
            .with(ParamKey::WhiteBalanceKelvin, ParamValue::Float(s.white_balance_k))
            .with(ParamKey::FrameRate, ParamValue::Float(s.frame_rate))
            .with(ParamKey::TriggerMode, ParamValue::Trigger(s.trigger))
            .with(ParamKey::AutoExposure, ParamValue::Bool(s.auto_exposure))
            .with(ParamKey::AutoGain, ParamValue::Bool(s.auto_gain))
            .with(ParamKey::AutoWhiteBalance, ParamValue::Bool(s.auto_wb))
            .with(ParamKey::Width, ParamValue::Int(s.roi.width.into()))
            .with(ParamKey::Height, ParamValue::Int(s.roi.height.into()))
            .with(ParamKey::PixelFormat, ParamValue::PixelFormat(FourCC::YUYV));
        params.set_roi(s.roi);
        Ok(params)
    }

    fn device_info(&mut self) -> Result<BTreeMap<String, String>> {
        let device_id = self.require_open()?;
        let mut info = BTreeMap::new();
        if let Some(device) = self.devices.iter().find(|d| d.device_id == device_id) {
            info.insert("model".to_owned(), device.model_name.clone());
            info.insert("serial".to_owned(), device.serial_number.clone());
            if let Some(ip) = &device.ip {
                info.insert("ip".to_owned(), ip.clone());
            }
        }
        info.insert("vendor".to_owned(), "camera-session".to_owned());
        info.insert("firmware".to_owned(), "sim-1.0".to_owned());
        info.insert(
            "sensor".to_owned(),
            format!("{SENSOR_WIDTH}x{SENSOR_HEIGHT}"),
        );
        info.insert("frames_generated".to_owned(), self.counter.to_string());
        Ok(info)
    }
}

/// Render `pattern` into a YUYV buffer of `width` x `height`.
#[must_use]
pub fn generate_pattern(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; width as usize * height as usize * 2];
    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, width),
        TestPattern::Gradient => generate_gradient(&mut data, width),
        TestPattern::Solid(y, u, v) => generate_solid(&mut data, y, u, v),
    }
    data
}

/// YUYV color bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS_YUV: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn generate_color_bars(data: &mut [u8], width: u32) {
    let bar_width = (width / 8).max(1);
    for row in data.chunks_exact_mut(width as usize * 2) {
        for (pair, macropixel) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = pair as u32 * 2;
            let (y, u, v) = BARS_YUV[((x / bar_width) as usize).min(7)];
            macropixel.copy_from_slice(&[y, u, y, v]);
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32) {
    for row in data.chunks_exact_mut(width as usize * 2) {
        for (pair, macropixel) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let luma = ((pair as u32 * 2 * 255) / width) as u8;
            macropixel.copy_from_slice(&[luma, 128, luma, 128]);
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for macropixel in data.chunks_exact_mut(4) {
        macropixel.copy_from_slice(&[y, u, y, v]);
    }
}
