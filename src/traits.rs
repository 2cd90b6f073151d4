//! Device driver seam and the data types that cross it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::parameters::{ParamKey, ParamValue, ParameterSet, TriggerMode};

/// Pixel format representation (e.g., YUYV, MJPG, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// 8-bit monochrome.
    pub const GREY: Self = Self::new(b"GREY");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Sensor sub-rectangle the driver captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// Create a region from its offset and size.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A connectable camera reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Identifier passed to [`DeviceDriver::open`].
    pub device_id: String,
    /// Vendor model name.
    pub model_name: String,
    /// Serial number, or bus location when the device has none.
    pub serial_number: String,
    /// Network address for GigE devices.
    pub ip: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (SN:{})",
            self.device_id, self.model_name, self.serial_number
        )?;
        if let Some(ip) = &self.ip {
            write!(f, " - {ip}")?;
        }
        Ok(())
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Monotonically non-decreasing frame counter assigned by the driver.
    pub counter: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// An owned, immutable copy of a decoded frame.
///
/// Drivers copy out of their internal buffers before returning a frame, so a
/// `Frame` never aliases memory the driver may reuse.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout of `data`.
    pub pixel_format: FourCC,
    /// Device the frame came from.
    pub device_id: String,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Get RGB values for a pixel of a YUYV frame.
    ///
    /// Returns `None` for other pixel formats or coordinates outside the frame.
    /// Odd x coordinates use the second luma sample of the pair with the shared
    /// chroma values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if self.pixel_format != FourCC::YUYV || x >= self.width || y >= self.height {
            return None;
        }

        // [Y0 U Y1 V] per pixel pair
        let pair_x = usize::try_from(x & !1).ok()?;
        let row = usize::try_from(y)
            .ok()?
            .checked_mul(usize::try_from(self.width).ok()?)?;
        let offset = row.checked_add(pair_x)?.checked_mul(2)?;
        let pair = self.data.get(offset..offset.checked_add(4)?)?;

        let [y0, u, y1, v] = <[u8; 4]>::try_from(pair).ok()?;
        let luma = if x % 2 == 0 { y0 } else { y1 };

        Some(yuv_to_rgb(luma, u, v))
    }
}

/// Convert YUV values to RGB using the ITU-R BT.601 formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

/// Capability set of a camera driver.
///
/// Calls that return `Result<bool>` follow one convention: `Ok(false)` means the
/// driver reported a failure, `Err` means an unexpected fault in the native
/// layer. Callers treat both as recoverable.
pub trait DeviceDriver: Send {
    /// List the devices this driver can open.
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a device by id.
    fn open(&mut self, device_id: &str) -> Result<bool>;

    /// Close the open device.
    fn close(&mut self) -> Result<bool>;

    /// Whether a device is currently open.
    fn is_open(&self) -> bool;

    /// Start acquisition on the device.
    fn start_grab(&mut self) -> Result<bool>;

    /// Stop acquisition on the device.
    fn stop_grab(&mut self) -> Result<bool>;

    /// Wait up to `timeout` for the next frame; `None` when none arrived.
    fn get_frame(&mut self, timeout: Duration) -> Result<Option<Frame>>;

    /// Fire one software trigger.
    fn trigger_once(&mut self) -> Result<bool>;

    /// Select the acquisition policy.
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<bool>;

    /// Set exposure time in microseconds.
    fn set_exposure(&mut self, exposure_us: f64) -> Result<bool>;

    /// Exposure time in microseconds.
    fn exposure(&mut self) -> Result<f64>;

    /// Set analog gain in dB.
    fn set_gain(&mut self, gain_db: f64) -> Result<bool>;

    /// Analog gain in dB.
    fn gain(&mut self) -> Result<f64>;

    /// Restrict capture to a sensor sub-rectangle.
    fn set_roi(&mut self, roi: Roi) -> Result<bool>;

    /// Current capture rectangle.
    fn roi(&mut self) -> Result<Roi>;

    /// Restore the full capture area.
    fn reset_roi(&mut self) -> Result<bool>;

    /// Write one parameter.
    ///
    /// The default implementation routes exposure, gain and trigger mode to the
    /// dedicated setters and reports every other key as unsupported. Drivers
    /// with a generic feature interface override it.
    fn set_parameter(&mut self, key: ParamKey, value: &ParamValue) -> Result<bool> {
        match (key, value) {
            (ParamKey::ExposureTime, ParamValue::Float(us)) => self.set_exposure(*us),
            (ParamKey::Gain, ParamValue::Float(db)) => self.set_gain(*db),
            (ParamKey::TriggerMode, ParamValue::Trigger(mode)) => self.set_trigger_mode(*mode),
            _ => {
                tracing::debug!(%key, %value, "parameter not supported by driver");
                Ok(false)
            }
        }
    }

    /// Read back every setting the device exposes.
    fn read_parameters(&mut self) -> Result<ParameterSet>;

    /// Free-form device information (vendor, firmware, ...).
    fn device_info(&mut self) -> Result<BTreeMap<String, String>>;
}

/// Builds drivers for the controller.
///
/// Resolved once when the controller is constructed, and asked again whenever
/// the simulation flag changes or a driver instance has to be discarded.
pub trait DriverProvider: Send + Sync {
    /// Create a driver; `simulation` selects the synthetic device.
    fn create(&self, simulation: bool) -> Result<Box<dyn DeviceDriver>>;
}

impl<F> DriverProvider for F
where
    F: Fn(bool) -> Result<Box<dyn DeviceDriver>> + Send + Sync,
{
    fn create(&self, simulation: bool) -> Result<Box<dyn DeviceDriver>> {
        self(simulation)
    }
}
