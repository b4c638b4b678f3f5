//! # SMU RS
//!
//! A Rust library for controlling and streaming from two-channel USB
//! source-measure units.
//!
//! This library discovers supported devices, manages one or more of them as
//! a joint capture session, configures per-channel sourcing/measurement
//! modes, and streams analog samples to and from the hardware at a
//! configurable rate. It also covers device calibration storage and
//! firmware recovery through the SAM-BA bootloader.
//!
//! ## Features
//!
//! - **Device discovery & hotplug**: scan the bus for supported units and
//!   track attach/detach while a session is alive
//! - **Synchronized capture**: a start/run/cancel/end state machine driven
//!   across all added devices in lockstep, with USB-frame alignment when
//!   several devices stream together
//! - **Backpressure you can see**: bounded per-device sample queues where
//!   inbound overflow and outbound underflow are reported as distinct
//!   faults instead of silent data loss
//! - **Calibration management**: read/write the per-signal calibration
//!   triples stored in device EEPROM, with a textual calibration-file
//!   format for operators
//! - **Firmware recovery**: flash a device that is in (or is forced into)
//!   bootloader mode
//!
//! ## Examples
//!
//! ### Capture a bounded run from every attached device
//!
//! ```rust,no_run
//! use smu_rs::{Mode, Session};
//! use std::time::Duration;
//!
//! let session = Session::new()?;
//! session.add_all()?;
//!
//! for device in session.devices() {
//!     device.set_mode(0, Mode::SourceVoltage)?;
//! }
//! session.configure(100_000)?;
//! session.start(10_000)?;
//!
//! let mut rows = Vec::new();
//! for device in session.devices() {
//!     let n = device.read(&mut rows, 10_000, Duration::from_millis(200))?;
//!     println!("{}: {} rows", device.serial(), n);
//! }
//! session.end();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Hotplug notifications
//!
//! ```rust,no_run
//! use smu_rs::Session;
//!
//! let session = Session::new()?;
//! session.set_hotplug_attach_callback(|device| {
//!     println!("attached: {}", device.serial());
//! });
//! session.set_hotplug_detach_callback(|device| {
//!     println!("detached: {}", device.serial());
//! });
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Calibration files
//!
//! ```rust
//! use smu_rs::{CalPoint, CalibrationFile};
//!
//! let block = vec![
//!     CalPoint { measured: 0.0, reference: 0.0 },
//!     CalPoint { measured: 2.5, reference: 2.5 },
//! ];
//! let file = CalibrationFile::from_blocks(vec![block; 8])?;
//! let triples = file.triples()?;
//! assert_eq!(triples.len(), 8);
//! # Ok::<(), smu_rs::CalibrationError>(())
//! ```

pub mod calibration;
pub mod device;
pub mod flasher;
mod m1000;
mod sample_queue;
pub mod session;
pub mod signal;
mod transport;

// Re-export the main types for convenience
pub use calibration::{
    CalPoint, CalibrationError, CalibrationFile, CalibrationTriple, BLOCK_LABELS, CAL_BLOCKS,
};

pub use device::{
    CaptureState, ChannelInfo, Device, DeviceError, DeviceInfo, OutputConfig, StreamError,
    CHANNEL_COUNT, DEFAULT_QUEUE_SIZE, SIGNALS_PER_CHANNEL,
};

pub use flasher::FlashError;

pub use m1000::Revision;

pub use session::{Session, SessionError};

pub use signal::{Mode, Signal, SignalInfo};

/// Supported devices as (vendor ID, product ID) pairs.
pub const SUPPORTED_DEVICES: [(u16, u16); 2] = [
    (0x0456, 0xcee2), // old
    (0x064b, 0x784c), // new
];

/// Devices already in SAM-BA bootloader mode as (vendor ID, product ID)
/// pairs. These show up as CDC devices.
pub const SAMBA_DEVICES: [(u16, u16); 1] = [(0x03eb, 0x6124)];
