//! Camgrab binary for testing camera capture.
//!
//! Usage: `camgrab [DEVICE] [FRAMES]`. Set `RUST_LOG=camgrab=debug` for
//! negotiation and buffer details.

use std::env;

use camgrab::{CaptureError, ConversionRegistry, DeviceSession, ErrorKind, SessionConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u32 = 30;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> camgrab::Result<()> {
    let mut args = env::args().skip(1);
    let mut config = SessionConfig::default().with_resolution(1280, 720);
    if let Some(device) = args.next() {
        config = config.with_device(device);
    }
    let frames = args
        .next()
        .and_then(|count| count.parse().ok())
        .unwrap_or(DEFAULT_FRAMES);

    let mut session = DeviceSession::open(&config, &ConversionRegistry::with_builtin())?;

    println!("Device: {}", session.capabilities().card);
    println!("Driver: {}", session.capabilities().driver);
    println!(
        "Format: {} {} via {}",
        session.resolution(),
        session.pixel_format(),
        session.converter_name()
    );
    match session.frame_rate() {
        Some(fps) => println!("Frame rate: {fps:.2} fps"),
        None => println!("Frame rate: driver default"),
    }
    println!("Buffers: {}", session.queue_depth());

    session.start()?;
    for _ in 0..frames {
        match session.next_frame() {
            Ok(frame) => println!(
                "Frame {}: {}x{}, {} bytes, timestamp: {:?}",
                frame.metadata.sequence,
                frame.image.width(),
                frame.image.height(),
                frame.metadata.bytes_used,
                frame.metadata.timestamp
            ),
            Err(err @ (CaptureError::PartialFrame { .. } | CaptureError::Timeout { .. })) => {
                println!("Skipped: {err}");
            }
            Err(err) if err.kind() == ErrorKind::Transient => println!("Skipped: {err}"),
            Err(err) => return Err(err),
        }
    }

    session.close()
}
