//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded via: `./scripts/dev-setup.sh load-vivid`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration (set by `dev-setup.sh`):
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_session::validation::{validate_color_bars, validate_frame_sequence, validate_gradient};
use camera_session::{
    CameraController, CameraEvent, CameraState, ControllerOptions, DefaultDriverProvider,
    DeviceDriver, EventBus, FourCC, Frame, ParamKey, ParamValue, Roi, V4l2Driver,
};
use serial_test::serial;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check the driver name before opening, so real cameras are
/// never touched. Returns device node paths.
fn find_vivid_devices() -> Vec<String> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let path = format!("/dev/video{index}");
        let mut driver = V4l2Driver::new();
        if driver.open(&path).unwrap_or(false) {
            devices.push(path);
        }
    }
    devices
}

/// Fail the test if vivid is not available; returns the first device path.
///
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().cloned() {
            Some(path) => path,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: ./scripts/dev-setup.sh load-vivid\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Returns (gradient device, colorbar device) paths.
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        if devices.len() < 2 {
            panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: ./scripts/dev-setup.sh load-vivid\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            );
        }
        (devices[0].clone(), devices[1].clone())
    }};
}

/// Open `path` at 640x480 YUYV.
fn open_vga(path: &str) -> V4l2Driver {
    let mut driver = V4l2Driver::new();
    assert!(driver.open(path).expect("open"), "failed to open {path}");
    for (key, value) in [
        (ParamKey::Width, ParamValue::Int(640)),
        (ParamKey::Height, ParamValue::Int(480)),
        (ParamKey::PixelFormat, ParamValue::PixelFormat(FourCC::YUYV)),
    ] {
        assert!(
            driver.set_parameter(key, &value).expect("set format"),
            "{key} rejected"
        );
    }
    driver
}

fn capture(driver: &mut V4l2Driver, count: usize) -> Vec<Frame> {
    assert!(driver.start_grab().expect("start grab"));
    let frames = (0..count)
        .map(|_| {
            driver
                .get_frame(FRAME_TIMEOUT)
                .expect("pull")
                .expect("frame before timeout")
        })
        .collect();
    driver.stop_grab().expect("stop grab");
    frames
}

#[test]
#[serial]
fn test_vivid_enumerated() {
    let path = require_vivid!();
    let mut driver = V4l2Driver::new();
    let devices = driver.enumerate().expect("enumerate");

    let vivid = devices
        .iter()
        .find(|d| d.device_id == path)
        .expect("vivid device enumerated");
    println!("Enumerated: {vivid}");
    assert!(vivid.ip.is_none());
}

#[test]
#[serial]
fn test_vivid_device_info() {
    let path = require_vivid!();
    let mut driver = V4l2Driver::new();
    assert!(driver.open(&path).expect("open"));
    let info = driver.device_info().expect("device info");

    for (key, value) in &info {
        println!("  {key}: {value}");
    }
    assert!(
        info.get("driver").is_some_and(|d| d.contains("vivid")),
        "Expected vivid driver"
    );
    assert_eq!(info.get("streaming").map(String::as_str), Some("true"));
}

#[test]
#[serial]
fn test_vivid_set_format_reads_back() {
    let path = require_vivid!();
    let mut driver = open_vga(&path);
    let params = driver.read_parameters().expect("read back");

    assert_eq!(params.get(ParamKey::Width), Some(&ParamValue::Int(640)));
    assert_eq!(params.get(ParamKey::Height), Some(&ParamValue::Int(480)));
    assert_eq!(
        params.get(ParamKey::PixelFormat),
        Some(&ParamValue::PixelFormat(FourCC::YUYV))
    );
    assert!(params.validate().is_ok(), "read back {params:?}");
}

#[test]
#[serial]
fn test_vivid_reset_roi_keeps_format() {
    let path = require_vivid!();
    let mut driver = open_vga(&path);
    assert!(driver.reset_roi().expect("reset roi"));
    assert_eq!(driver.roi().expect("roi"), Roi::new(0, 0, 640, 480));
}

#[test]
#[serial]
fn test_vivid_capture_single_frame() {
    let path = require_vivid!();
    let mut driver = open_vga(&path);
    let frames = capture(&mut driver, 1);
    let frame = &frames[0];

    println!("Captured frame:");
    println!("  Counter: {}", frame.metadata.counter);
    println!("  Timestamp: {:?}", frame.metadata.timestamp);
    println!("  Bytes used: {}", frame.metadata.bytes_used);

    assert_eq!((frame.width, frame.height), (640, 480));
    assert!(frame.data.len() >= 640 * 480 * 2, "frame data too small");
    assert_eq!(frame.device_id, path);
    assert!(frame.pixel_at(320, 240).is_some());
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let path = require_vivid!();
    let mut driver = open_vga(&path);
    let frames = capture(&mut driver, 10);

    let result = validate_frame_sequence(&frames);
    assert!(
        result.is_ok(),
        "Frame sequence validation failed: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient_device, _) = require_vivid_pair!();
    let mut driver = open_vga(&gradient_device);
    let frames = capture(&mut driver, 1);

    let result = validate_gradient(&frames[0]);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar_device) = require_vivid_pair!();
    let mut driver = open_vga(&colorbar_device);
    let frames = capture(&mut driver, 1);

    let result = validate_color_bars(&frames[0]);
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern (test_pattern=1).\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_software_trigger_unsupported() {
    let path = require_vivid!();
    let mut driver = open_vga(&path);
    assert!(!driver.trigger_once().expect("trigger"));
    assert!(!driver
        .set_parameter(
            ParamKey::TriggerMode,
            &ParamValue::Trigger(camera_session::TriggerMode::Software)
        )
        .expect("trigger mode"));
}

#[test]
#[serial]
fn test_vivid_controller_session() {
    let path = require_vivid!();
    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe();
    let controller = CameraController::new(
        Arc::new(DefaultDriverProvider),
        bus,
        ControllerOptions::default(),
    )
    .expect("controller");

    controller.connect(&path).expect("connect");
    controller.start_streaming().expect("start");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut frames = Vec::new();
    while frames.len() < 5 && Instant::now() < deadline {
        if let Ok(CameraEvent::NewFrameAvailable(frame)) =
            events.recv_timeout(Duration::from_millis(200))
        {
            frames.push((*frame).clone());
        }
    }
    controller.stop_streaming().expect("stop");
    controller.disconnect().expect("disconnect");

    assert_eq!(frames.len(), 5, "expected five frames");
    assert!(validate_frame_sequence(&frames).is_ok());
    assert_eq!(controller.state(), CameraState::Disconnected);
}
