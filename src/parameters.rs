//! Camera parameters, their validation, and the desired/confirmed cache.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CameraError, Result};
use crate::traits::{FourCC, Roi};

/// Acquisition policy of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Free-running acquisition.
    #[default]
    Continuous,
    /// One frame per software trigger.
    Software,
    /// One frame per hardware line edge.
    Hardware,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continuous => "continuous",
            Self::Software => "software",
            Self::Hardware => "hardware",
        })
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" | "off" => Ok(Self::Continuous),
            "software" => Ok(Self::Software),
            "hardware" => Ok(Self::Hardware),
            other => Err(format!("unknown trigger mode '{other}'")),
        }
    }
}

/// Name of a camera parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    /// Exposure time in microseconds.
    ExposureTime,
    /// Analog gain in dB.
    Gain,
    /// White balance colour temperature.
    WhiteBalanceKelvin,
    /// Acquisition frame rate in frames per second.
    FrameRate,
    /// Acquisition policy.
    TriggerMode,
    /// Automatic exposure enabled.
    AutoExposure,
    /// Automatic gain enabled.
    AutoGain,
    /// Automatic white balance enabled.
    AutoWhiteBalance,
    /// ROI left edge.
    RoiX,
    /// ROI top edge.
    RoiY,
    /// ROI width.
    RoiWidth,
    /// ROI height.
    RoiHeight,
    /// Output image width.
    Width,
    /// Output image height.
    Height,
    /// Output pixel format.
    PixelFormat,
}

impl ParamKey {
    /// Every key, in map order.
    pub const ALL: [Self; 15] = [
        Self::ExposureTime,
        Self::Gain,
        Self::WhiteBalanceKelvin,
        Self::FrameRate,
        Self::TriggerMode,
        Self::AutoExposure,
        Self::AutoGain,
        Self::AutoWhiteBalance,
        Self::RoiX,
        Self::RoiY,
        Self::RoiWidth,
        Self::RoiHeight,
        Self::Width,
        Self::Height,
        Self::PixelFormat,
    ];

    /// Wire name of the key.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExposureTime => "exposure_time",
            Self::Gain => "gain",
            Self::WhiteBalanceKelvin => "white_balance_kelvin",
            Self::FrameRate => "frame_rate",
            Self::TriggerMode => "trigger_mode",
            Self::AutoExposure => "auto_exposure",
            Self::AutoGain => "auto_gain",
            Self::AutoWhiteBalance => "auto_wb",
            Self::RoiX => "roi_x",
            Self::RoiY => "roi_y",
            Self::RoiWidth => "roi_width",
            Self::RoiHeight => "roi_height",
            Self::Width => "width",
            Self::Height => "height",
            Self::PixelFormat => "pixel_format",
        }
    }

    /// Whether the key is one of the four ROI components.
    pub const fn is_roi(self) -> bool {
        matches!(
            self,
            Self::RoiX | Self::RoiY | Self::RoiWidth | Self::RoiHeight
        )
    }

    /// Parse a textual value into the type this key expects.
    pub fn parse_value(self, raw: &str) -> Result<ParamValue> {
        let raw = raw.trim();
        let invalid = |reason: String| CameraError::InvalidParameter { key: self, reason };
        let value = match self {
            Self::ExposureTime | Self::Gain | Self::WhiteBalanceKelvin | Self::FrameRate => {
                ParamValue::Float(raw.parse().map_err(|_| invalid(format!("'{raw}' is not a number")))?)
            }
            Self::TriggerMode => ParamValue::Trigger(raw.parse().map_err(invalid)?),
            Self::AutoExposure | Self::AutoGain | Self::AutoWhiteBalance => {
                ParamValue::Bool(raw.parse().map_err(|_| invalid(format!("'{raw}' is not a boolean")))?)
            }
            Self::RoiX | Self::RoiY | Self::RoiWidth | Self::RoiHeight | Self::Width | Self::Height => {
                ParamValue::Int(raw.parse().map_err(|_| invalid(format!("'{raw}' is not an integer")))?)
            }
            Self::PixelFormat => {
                let code: [u8; 4] = raw
                    .as_bytes()
                    .try_into()
                    .map_err(|_| invalid(format!("'{raw}' is not a four character code")))?;
                ParamValue::PixelFormat(FourCC::new(&code))
            }
        };
        Ok(value)
    }

    fn check(self, value: &ParamValue) -> std::result::Result<(), String> {
        match (self, value) {
            (Self::ExposureTime, ParamValue::Float(us)) => {
                in_range(*us, 0.0, 10_000_000.0, false, "µs")
            }
            (Self::Gain, ParamValue::Float(db)) => in_range(*db, 0.0, 48.0, true, "dB"),
            (Self::WhiteBalanceKelvin, ParamValue::Float(k)) => {
                in_range(*k, 1000.0, 20_000.0, true, "K")
            }
            (Self::FrameRate, ParamValue::Float(fps)) => in_range(*fps, 0.0, 1000.0, false, "fps"),
            (Self::TriggerMode, ParamValue::Trigger(_))
            | (Self::AutoExposure | Self::AutoGain | Self::AutoWhiteBalance, ParamValue::Bool(_))
            | (Self::PixelFormat, ParamValue::PixelFormat(_)) => Ok(()),
            (Self::RoiX | Self::RoiY, ParamValue::Int(offset)) => {
                if *offset >= 0 && u32::try_from(*offset).is_ok() {
                    Ok(())
                } else {
                    Err(format!("offset {offset} must be a non-negative pixel index"))
                }
            }
            (Self::RoiWidth | Self::RoiHeight | Self::Width | Self::Height, ParamValue::Int(size)) => {
                if *size >= 1 && u32::try_from(*size).is_ok() {
                    Ok(())
                } else {
                    Err(format!("size {size} must be at least one pixel"))
                }
            }
            (_, other) => Err(format!("unexpected {} value", other.kind())),
        }
    }
}

fn in_range(
    value: f64,
    min: f64,
    max: f64,
    min_inclusive: bool,
    unit: &str,
) -> std::result::Result<(), String> {
    let above_min = if min_inclusive { value >= min } else { value > min };
    if value.is_finite() && above_min && value <= max {
        Ok(())
    } else {
        let open = if min_inclusive { '[' } else { '(' };
        Err(format!("{value} outside {open}{min}, {max}] {unit}"))
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ParamKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("unknown parameter '{s}'"))
    }
}

/// Typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Floating point quantity.
    Float(f64),
    /// Integer quantity (pixels).
    Int(i64),
    /// Switch.
    Bool(bool),
    /// Trigger policy.
    Trigger(TriggerMode),
    /// Pixel layout.
    PixelFormat(FourCC),
}

impl ParamValue {
    /// Numeric view of the value.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer view of the value.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of the value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Trigger(_) => "trigger mode",
            Self::PixelFormat(_) => "pixel format",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Trigger(mode) => write!(f, "{mode}"),
            Self::PixelFormat(code) => write!(f, "{code}"),
        }
    }
}

/// Mapping from parameter name to value.
///
/// Used both for full device snapshots and for partial requests.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSet(BTreeMap<ParamKey, ParamValue>);

impl ParameterSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: ParamKey, value: ParamValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: ParamKey, value: ParamValue) -> Option<ParamValue> {
        self.0.insert(key, value)
    }

    /// Value for `key`.
    pub fn get(&self, key: ParamKey) -> Option<&ParamValue> {
        self.0.get(&key)
    }

    /// Numeric value for `key`.
    pub fn get_f64(&self, key: ParamKey) -> Option<f64> {
        self.get(key).and_then(ParamValue::as_f64)
    }

    /// Trigger mode, if present.
    pub fn trigger_mode(&self) -> Option<TriggerMode> {
        match self.get(ParamKey::TriggerMode) {
            Some(ParamValue::Trigger(mode)) => Some(*mode),
            _ => None,
        }
    }

    /// The four ROI components, if all are present.
    pub fn roi(&self) -> Option<Roi> {
        let part = |key| {
            self.get(key)
                .and_then(ParamValue::as_i64)
                .and_then(|v| u32::try_from(v).ok())
        };
        Some(Roi::new(
            part(ParamKey::RoiX)?,
            part(ParamKey::RoiY)?,
            part(ParamKey::RoiWidth)?,
            part(ParamKey::RoiHeight)?,
        ))
    }

    /// Store the four ROI components.
    pub fn set_roi(&mut self, roi: Roi) {
        self.insert(ParamKey::RoiX, ParamValue::Int(roi.x.into()));
        self.insert(ParamKey::RoiY, ParamValue::Int(roi.y.into()));
        self.insert(ParamKey::RoiWidth, ParamValue::Int(roi.width.into()));
        self.insert(ParamKey::RoiHeight, ParamValue::Int(roi.height.into()));
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, &ParamValue)> {
        self.0.iter().map(|(key, value)| (*key, value))
    }

    /// Keys in key order.
    pub fn keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.0.keys().copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite entries with those of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }

    /// Check every entry against its key's type and range.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.iter() {
            key.check(value)
                .map_err(|reason| CameraError::InvalidParameter { key, reason })?;
        }
        Ok(())
    }
}

impl FromIterator<(ParamKey, ParamValue)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (ParamKey, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Last requested values next to the last values read back from the device.
#[derive(Debug, Clone, Default)]
pub struct ParameterCache {
    desired: ParameterSet,
    confirmed: ParameterSet,
}

impl ParameterCache {
    /// Values most recently read back.
    pub const fn confirmed(&self) -> &ParameterSet {
        &self.confirmed
    }

    /// Record a user request on top of the confirmed values.
    pub fn request(&mut self, requested: &ParameterSet) {
        self.desired = self.confirmed.clone();
        self.desired.merge(requested);
    }

    /// Replace the confirmed set with a read-back snapshot.
    pub fn confirm(&mut self, read_back: ParameterSet) {
        self.confirmed = read_back;
    }

    /// Keys whose requested value the device did not take verbatim.
    ///
    /// Covers rejected writes as well as values the device clamped or
    /// quantized.
    pub fn adjusted(&self) -> Vec<ParamKey> {
        self.desired
            .iter()
            .filter(|(key, value)| self.confirmed.get(*key) != Some(*value))
            .map(|(key, _)| key)
            .collect()
    }

    /// Forget everything, used after a disconnect.
    pub fn clear(&mut self) {
        self.desired = ParameterSet::new();
        self.confirmed = ParameterSet::new();
    }
}
