//! Frame validation for test patterns and stream continuity.
//!
//! Used by the integration tests against the simulated camera and the vivid
//! virtual V4L2 driver.

use crate::error::{CameraError, Result};
use crate::traits::Frame;

/// Expected RGB values for SMPTE color bars after YUV conversion.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235),
    (235, 235, 11),
    (12, 236, 237),
    (13, 237, 13),
    (237, 13, 237),
    (238, 14, 13),
    (15, 15, 239),
    (16, 16, 16),
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

fn invalid(message: String) -> CameraError {
    CameraError::StreamError(message)
}

/// Check that a YUYV frame shows the eight SMPTE color bars.
///
/// Samples the center of each bar on the middle row.
///
/// # Errors
///
/// `StreamError` when a sample is out of the frame or a bar's color is off by
/// more than the tolerance.
pub fn validate_color_bars(frame: &Frame) -> Result<()> {
    let bar_width = frame.width / 8;
    let center_y = frame.height / 2;

    for (bar_idx, expected) in (0u32..).zip(SMPTE_COLOR_BARS) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual = frame
            .pixel_at(sample_x, center_y)
            .ok_or_else(|| invalid(format!("no pixel at ({sample_x}, {center_y})")))?;

        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(invalid(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }
    Ok(())
}

/// Check that luminance rises from left to right along the middle row.
///
/// # Errors
///
/// `StreamError` when luminance drops between samples or the overall change
/// is too small to be a gradient.
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let center_y = frame.height / 2;
    let mut samples = Vec::new();

    for x in (0..frame.width).step_by(10) {
        let (r, g, b) = frame
            .pixel_at(x, center_y)
            .ok_or_else(|| invalid(format!("no pixel at ({x}, {center_y})")))?;
        // Rec. 601 luma.
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );
        if let Some(&prev) = samples.last() {
            if luminance < prev - 1.0 {
                return Err(invalid(format!(
                    "gradient decreases at x={x}: {luminance} < {prev}"
                )));
            }
        }
        samples.push(luminance);
    }

    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if last - first >= 50.0 => Ok(()),
        (Some(first), Some(last)) => Err(invalid(format!(
            "insufficient luminance change for gradient: {}",
            last - first
        ))),
        _ => Err(invalid("frame too narrow for gradient check".to_owned())),
    }
}

/// Check that frames come from one device with counters increasing by one.
///
/// # Errors
///
/// `StreamError` for an empty slice, a counter gap or reorder, or a frame
/// from a different device.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    let Some(first) = frames.first() else {
        return Err(invalid("cannot validate empty frame sequence".to_owned()));
    };

    for (index, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        if curr.device_id != first.device_id {
            return Err(invalid(format!(
                "frame {} from {} in a stream of {}",
                index + 1,
                curr.device_id,
                first.device_id
            )));
        }
        let expected = prev.metadata.counter + 1;
        if curr.metadata.counter != expected {
            return Err(invalid(format!(
                "frame counter gap at index {}: expected {expected}, got {}",
                index + 1,
                curr.metadata.counter
            )));
        }
    }
    Ok(())
}

fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let diff = |a: u8, e: u8| u32::from(a.abs_diff(e));
    diff(actual.0, expected.0) <= tolerance
        && diff(actual.1, expected.1) <= tolerance
        && diff(actual.2, expected.2) <= tolerance
}
