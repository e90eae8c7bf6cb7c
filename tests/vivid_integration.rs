//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded with two capture devices
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration:
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use camgrab::validation::{validate_color_bars, validate_frame_sequence, validate_gradient};
use camgrab::{
    ConversionRegistry, DeviceSession, FourCC, Frame, IoStrategy, Resolution, SessionConfig,
    SessionState, V4L2Device, VideoDevice,
};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};

/// Find all available vivid virtual camera device nodes.
///
/// Uses sysfs to check the device name before opening, avoiding
/// unnecessary device opens on real cameras.
fn find_vivid_devices() -> Vec<PathBuf> {
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

        // Only capture nodes; vivid also creates output and metadata nodes.
        let path = PathBuf::from(format!("/dev/video{index}"));
        if V4L2Device::open(&path).is_ok_and(|device| device.capabilities().can_capture) {
            devices.push(path);
        }
    }
    devices
}

/// Fail the test if vivid is not available; returns the first device node.
///
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().cloned() {
            Some(path) => path,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Both vivid devices as (gradient device, colorbar device).
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        match devices.as_slice() {
            [gradient, colorbar, ..] => (gradient.clone(), colorbar.clone()),
            _ => panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            ),
        }
    }};
}

fn config(path: PathBuf) -> SessionConfig {
    SessionConfig::default()
        .with_device(path)
        .with_pixel_format(Some(FourCC::YUYV))
        .with_resolution(640, 480)
}

fn open(config: &SessionConfig) -> DeviceSession<V4L2Device> {
    DeviceSession::open(config, &ConversionRegistry::with_builtin())
        .expect("Failed to open vivid device")
}

#[test]
#[serial]
fn test_vivid_session_open() {
    let session = open(&config(require_vivid!()));
    let caps = session.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");
    assert_eq!(session.state(), SessionState::Configured);

    println!("Opened vivid device:");
    println!("  Driver: {}", caps.driver);
    println!("  Card: {}", caps.card);
    println!("  Bus: {}", caps.bus_info);
}

#[test]
#[serial]
fn test_vivid_catalog_and_controls() {
    let session = open(&config(require_vivid!()));

    let yuyv = session
        .catalog()
        .get(FourCC::YUYV)
        .expect("vivid lists YUYV");
    assert!(!yuyv.sizes.is_empty(), "YUYV should list frame sizes");
    assert!(!session.controls().is_empty(), "vivid exposes user controls");

    for control in session.controls().iter() {
        println!("  {:#x} {}", control.descriptor.id, control.descriptor.name);
    }
}

#[test]
#[serial]
fn test_vivid_negotiates_requested_format() {
    let session = open(&config(require_vivid!()));

    assert_eq!(session.pixel_format(), FourCC::YUYV);
    assert_eq!(session.resolution(), Resolution::new(640, 480));
    assert!(session.format().stride >= 640 * 2);
    println!("Frame rate: {:?}", session.frame_rate());
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let mut session = open(&config(require_vivid!()));
    session.start().expect("Failed to start streaming");

    let frames: Vec<Frame> = (0..10)
        .map(|_| session.next_frame().expect("Failed to capture frame"))
        .collect();

    for frame in &frames {
        assert_eq!(frame.image.dimensions(), (640, 480));
        assert!(frame.metadata.bytes_used > 0, "Bytes used should be positive");
    }
    let result = validate_frame_sequence(&frames);
    assert!(result.is_ok(), "Frame sequence validation failed: {:?}", result.err());
    session.close().expect("Failed to close session");
}

#[test]
#[serial]
fn test_vivid_io_strategies() {
    let path = require_vivid!();

    for strategy in [IoStrategy::MemoryMap, IoStrategy::UserPointer, IoStrategy::Read] {
        let mut session = open(&config(path.clone()).with_io_strategy(strategy));
        session.start().expect("Failed to start streaming");
        let frame = session.next_frame().expect("Failed to capture frame");
        assert_eq!(frame.image.dimensions(), (640, 480), "{strategy:?}");
        session.close().expect("Failed to close session");
    }
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient_device, _) = require_vivid_pair!();

    let mut session = open(&config(gradient_device));
    session.start().expect("Failed to start streaming");
    let frame = session.next_frame().expect("Failed to capture frame");

    // First vivid device should be configured with Gray Ramp (test_pattern=20)
    let result = validate_gradient(&frame.image);
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

    let mut session = open(&config(colorbar_device));
    session.start().expect("Failed to start streaming");
    let frame = session.next_frame().expect("Failed to capture frame");

    // Second vivid device should be configured with 100% Colorbar (test_pattern=1)
    let result = validate_color_bars(&frame.image);
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
fn test_vivid_reconfigure_and_gray() {
    let path = require_vivid!();
    let mut session = open(&config(path.clone()));

    session
        .reconfigure(&config(path).with_resolution(320, 240))
        .expect("Failed to reconfigure");
    assert_eq!(session.resolution(), Resolution::new(320, 240));

    session.start().expect("Failed to start streaming");
    let frame = session.next_gray_frame().expect("Failed to capture frame");
    assert_eq!(frame.image.dimensions(), (320, 240));
    session.stop().expect("Failed to stop");
    assert_eq!(session.state(), SessionState::Configured);
}
