//! One physical two-channel source-measure unit.
//!
//! The device owns its sample queues, counters and capture state; the
//! session drives the `pub(crate)` lifecycle (claim, configure, on/run,
//! cancel, off) while caller threads stream through [`Device::read`] and
//! [`Device::write`]. Hardware-revision specifics live in the `m1000`
//! module; this one is transfer and state logic only.

use crate::calibration::{
    decode_blob, encode_blob, CalibrationError, CalibrationFile, CalibrationTriple, CAL_BLOB_LEN,
    CAL_BLOCKS,
};
use crate::m1000::{self, Revision};
use crate::sample_queue::{InboundQueue, OutboundQueue};
use crate::signal::{Mode, Signal, SignalInfo};
use crate::transport::CTRL_TIMEOUT;
use rusb::{Context, DeviceHandle};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Channels per device.
pub const CHANNEL_COUNT: usize = 2;
/// Signals per channel: voltage and current.
pub const SIGNALS_PER_CHANNEL: usize = 2;

/// Default depth of the per-device sample queues, roughly 100 ms of data at
/// the default rate.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Timeout for one bulk transfer inside the event-thread pump. Short so the
/// loop latency stays bounded with several devices streaming.
const IO_TIMEOUT: Duration = Duration::from_millis(2);
/// Bulk packets submitted per direction per pump pass.
const MAX_PACKETS_PER_PASS: usize = 4;

/// Static device descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub label: &'static str,
    pub channel_count: usize,
}

/// Static channel descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ChannelInfo {
    pub label: &'static str,
    pub mode_count: usize,
    pub signal_count: usize,
}

const DEVICE_INFO: DeviceInfo = DeviceInfo {
    label: "ADALM1000",
    channel_count: CHANNEL_COUNT,
};

const CHANNEL_INFOS: [ChannelInfo; CHANNEL_COUNT] = [
    ChannelInfo {
        label: "A",
        mode_count: 3,
        signal_count: SIGNALS_PER_CHANNEL,
    },
    ChannelInfo {
        label: "B",
        mode_count: 3,
        signal_count: SIGNALS_PER_CHANNEL,
    },
];

const VOLTAGE_SIGNAL: SignalInfo = SignalInfo {
    label: "Voltage",
    input_modes: Mode::SourceCurrent.bit() | Mode::Disabled.bit(),
    output_modes: Mode::SourceVoltage.bit(),
    min: 0.0,
    max: 5.0,
    resolution: 5.0 / 65536.0,
};

const CURRENT_SIGNAL: SignalInfo = SignalInfo {
    label: "Current",
    input_modes: Mode::SourceVoltage.bit(),
    output_modes: Mode::SourceCurrent.bit(),
    min: -0.2,
    max: 0.2,
    resolution: 0.4 / 65536.0,
};

/// Capture state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Configured,
    Running,
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Channel {channel} does not exist")]
    InvalidChannel { channel: usize },

    #[error("Mode '{mode}' is not supported on channel {channel}")]
    UnsupportedMode { channel: usize, mode: Mode },

    #[error("Sample rate {rate} Hz is out of range (1..={max})")]
    UnsupportedRate { rate: u64, max: u64 },

    #[error("Operation not permitted while the device is capturing")]
    Busy,

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}

/// Data-flow faults reported by [`Device::read`] / [`Device::write`].
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Inbound sample queue overflowed; samples were dropped")]
    Overflow,

    #[error("Outbound sample queue ran dry; stale values were sourced")]
    Underflow,

    #[error("Channel {channel} does not exist")]
    InvalidChannel { channel: usize },
}

/// Per-channel output settings, mutable concurrently with an active capture.
///
/// Obtained through [`Device::output`]; the mutex guard is the device state
/// lock. Hold it only briefly and never across a blocking call.
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    constants: [f32; CHANNEL_COUNT],
}

impl OutputConfig {
    /// Fallback level sourced on `channel` while its outbound queue has
    /// never been fed.
    pub fn set_constant(&mut self, channel: usize, value: f32) {
        if let Some(slot) = self.constants.get_mut(channel) {
            *slot = value;
        }
    }

    pub fn constant(&self, channel: usize) -> f32 {
        self.constants.get(channel).copied().unwrap_or(0.0)
    }
}

/// Sample-queue handles, swapped as a set when the capture is reconfigured.
struct IoState {
    inbound: Arc<InboundQueue>,
    outbound: [Arc<OutboundQueue>; CHANNEL_COUNT],
    sample_rate: u64,
    last_out: [f32; CHANNEL_COUNT],
}

/// Outcome of one event-thread pump pass over a device.
pub(crate) enum PumpStatus {
    /// Not part of a running capture.
    Inactive,
    /// Streaming, not finished yet.
    Active,
    Completed,
    Cancelled,
    Errored(rusb::Error),
}

/// One physical instrument.
pub struct Device {
    revision: Revision,
    serial: String,
    fw_version: String,
    hw_version: String,
    usb: DeviceHandle<Context>,
    bus: u8,
    address: u8,
    signals: [[Signal; SIGNALS_PER_CHANNEL]; CHANNEL_COUNT],

    state: Mutex<CaptureState>,
    modes: Mutex<[Mode; CHANNEL_COUNT]>,
    output: Mutex<OutputConfig>,
    io: Mutex<IoState>,
    cal: Mutex<[CalibrationTriple; CAL_BLOCKS]>,
    sof_start: Mutex<Option<u16>>,

    requested_sampleno: AtomicU64,
    in_sampleno: AtomicU64,
    out_sampleno: AtomicU64,
    claimed: AtomicBool,
}

impl Device {
    /// Probe a USB device against the supported allow-list.
    ///
    /// `Ok(None)` means the device is not ours; errors mean a supported
    /// device that could not be brought up.
    pub(crate) fn probe(usb_dev: &rusb::Device<Context>) -> Result<Option<Arc<Self>>, DeviceError> {
        let desc = usb_dev.device_descriptor()?;
        let Some(revision) = Revision::from_ids(desc.vendor_id(), desc.product_id()) else {
            return Ok(None);
        };
        let handle = usb_dev.open()?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                log::debug!("Detaching kernel driver from interface 0");
                if let Err(e) = handle.detach_kernel_driver(0) {
                    log::warn!("Failed to detach kernel driver: {}", e);
                }
            }
        }
        if let Err(e) = handle.set_active_configuration(1) {
            log::debug!("Failed to set configuration (may already be set): {}", e);
        }

        let serial = handle
            .read_serial_number_string_ascii(&desc)
            .unwrap_or_else(|_| format!("{:03}:{:03}", usb_dev.bus_number(), usb_dev.address()));
        let fw_version = read_fw_version(&handle)?;
        let hw_version = revision.hw_label().to_string();

        let cal = match read_cal_blob(&handle) {
            Ok(Some(triples)) => triples,
            Ok(None) => [CalibrationTriple::default(); CAL_BLOCKS],
            Err(e) => {
                log::warn!("device {}: calibration read failed: {}", serial, e);
                [CalibrationTriple::default(); CAL_BLOCKS]
            }
        };

        log::debug!(
            "Probed {} serial {} (fw {}, hw rev {})",
            DEVICE_INFO.label,
            serial,
            fw_version,
            hw_version
        );

        Ok(Some(Arc::new(Self {
            revision,
            serial,
            fw_version,
            hw_version,
            bus: usb_dev.bus_number(),
            address: usb_dev.address(),
            usb: handle,
            signals: [
                [Signal::new(VOLTAGE_SIGNAL), Signal::new(CURRENT_SIGNAL)],
                [Signal::new(VOLTAGE_SIGNAL), Signal::new(CURRENT_SIGNAL)],
            ],
            state: Mutex::new(CaptureState::Idle),
            modes: Mutex::new([Mode::Disabled; CHANNEL_COUNT]),
            output: Mutex::new(OutputConfig {
                constants: [0.0; CHANNEL_COUNT],
            }),
            io: Mutex::new(IoState {
                inbound: Arc::new(InboundQueue::new(DEFAULT_QUEUE_SIZE)),
                outbound: [
                    Arc::new(OutboundQueue::new(DEFAULT_QUEUE_SIZE)),
                    Arc::new(OutboundQueue::new(DEFAULT_QUEUE_SIZE)),
                ],
                sample_rate: u64::from(revision.default_rate()),
                last_out: [0.0; CHANNEL_COUNT],
            }),
            cal: Mutex::new(cal),
            sof_start: Mutex::new(None),
            requested_sampleno: AtomicU64::new(0),
            in_sampleno: AtomicU64::new(0),
            out_sampleno: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
        })))
    }

    /// Static descriptor of the device.
    pub fn info(&self) -> &'static DeviceInfo {
        &DEVICE_INFO
    }

    /// Static descriptor of one channel.
    pub fn channel_info(&self, channel: usize) -> Option<&'static ChannelInfo> {
        CHANNEL_INFOS.get(channel)
    }

    /// One signal of one channel.
    pub fn signal(&self, channel: usize, signal: usize) -> Option<&Signal> {
        self.signals.get(channel).and_then(|sigs| sigs.get(signal))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn fwver(&self) -> &str {
        &self.fw_version
    }

    pub fn hwver(&self) -> &str {
        &self.hw_version
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Nominal default sample rate in Hz.
    pub fn default_rate(&self) -> u32 {
        self.revision.default_rate()
    }

    /// Configured sample rate in Hz.
    pub fn sample_rate(&self) -> u64 {
        self.io.lock().unwrap().sample_rate
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap()
    }

    /// Samples requested for the current capture (0 = continuous).
    pub fn requested_sampleno(&self) -> u64 {
        self.requested_sampleno.load(Ordering::Acquire)
    }

    /// Samples received from the hardware so far.
    pub fn in_sampleno(&self) -> u64 {
        self.in_sampleno.load(Ordering::Acquire)
    }

    /// Samples transmitted to the hardware so far.
    pub fn out_sampleno(&self) -> u64 {
        self.out_sampleno.load(Ordering::Acquire)
    }

    pub(crate) fn bus_address(&self) -> (u8, u8) {
        (self.bus, self.address)
    }

    /// Switch a channel between disabled, source-voltage and source-current.
    pub fn set_mode(&self, channel: usize, mode: Mode) -> Result<(), DeviceError> {
        if channel >= CHANNEL_COUNT {
            return Err(DeviceError::InvalidChannel { channel });
        }
        if self.is_running() {
            return Err(DeviceError::Busy);
        }
        self.vendor_out(m1000::REQ_SET_MODE, channel as u16, mode_code(mode), &[])?;
        self.modes.lock().unwrap()[channel] = mode;
        let mut state = self.state.lock().unwrap();
        if *state == CaptureState::Idle {
            *state = CaptureState::Configured;
        }
        Ok(())
    }

    /// Drain up to `samples` rows of {measured, sourced} pairs per channel.
    ///
    /// A zero timeout returns immediately with whatever is queued; a
    /// positive one blocks up to that long for the first row. An overflow
    /// since the previous read is reported (and cleared) instead of data.
    pub fn read(
        &self,
        buf: &mut Vec<[f32; 4]>,
        samples: usize,
        timeout: Duration,
    ) -> Result<usize, StreamError> {
        let inbound = self.io.lock().unwrap().inbound.clone();
        if inbound.take_overflow() {
            return Err(StreamError::Overflow);
        }
        Ok(inbound.pop_into(buf, samples, timeout))
    }

    /// Queue outbound samples for `channel`, mirroring [`Device::read`]'s
    /// timeout semantics. An underflow since the previous write is reported
    /// (and cleared) before any new data is queued.
    pub fn write(
        &self,
        samples: &[f32],
        channel: usize,
        timeout: Duration,
    ) -> Result<usize, StreamError> {
        if channel >= CHANNEL_COUNT {
            return Err(StreamError::InvalidChannel { channel });
        }
        let outbound = self.io.lock().unwrap().outbound[channel].clone();
        if outbound.take_underflow() {
            return Err(StreamError::Underflow);
        }
        Ok(outbound.push_from(samples, timeout))
    }

    /// Raw control transfer on the underlying USB device; the transport's
    /// result is passed through unmodified.
    pub fn ctrl_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        if request_type & rusb::constants::LIBUSB_ENDPOINT_IN != 0 {
            self.usb
                .read_control(request_type, request, value, index, data, timeout)
        } else {
            self.usb
                .write_control(request_type, request, value, index, data, timeout)
        }
    }

    /// Reboot the device into its SAM-BA bootloader personality.
    ///
    /// The device drops off the bus right after acknowledging; it will
    /// re-enumerate under the bootloader USB identity.
    pub fn samba_mode(&self) -> Result<(), DeviceError> {
        self.vendor_out(m1000::REQ_SAMBA, 0, 0, &[])?;
        Ok(())
    }

    /// Prepare multi-device synchronization: read the device's current
    /// microframe counter and schedule a shared start-of-frame in the near
    /// future. The next `run()` starts sampling on that frame.
    pub fn sync(&self) -> Result<(), DeviceError> {
        let mut data = [0u8; 2];
        self.vendor_in(m1000::REQ_GET_FRAME, 0, 0, &mut data)?;
        let frame = u16::from_le_bytes(data);
        let start = frame.wrapping_add(m1000::SYNC_LEAD_FRAMES) & m1000::FRAME_MASK;
        *self.sof_start.lock().unwrap() = Some(start);
        Ok(())
    }

    /// The device's output-configuration lock.
    ///
    /// The guard serializes output mutation against the transfer pump. Hold
    /// it briefly while changing signal settings, never across a blocking
    /// call.
    pub fn output(&self) -> &Mutex<OutputConfig> {
        &self.output
    }

    /// Parse a calibration file and persist it to the device EEPROM;
    /// `None` resets to factory defaults.
    ///
    /// The file is validated completely before anything is written, and the
    /// EEPROM image is replaced in a single transfer: a malformed file
    /// leaves the stored calibration untouched.
    pub fn write_calibration(&self, cal_file: Option<&Path>) -> Result<(), DeviceError> {
        let triples = match cal_file {
            None => [CalibrationTriple::default(); CAL_BLOCKS],
            Some(path) => CalibrationFile::load(path)?.triples()?,
        };
        let blob = encode_blob(&triples);
        self.vendor_out(m1000::REQ_EEPROM_WRITE, 0, 0, &blob)?;
        *self.cal.lock().unwrap() = triples;
        log::info!("device {}: calibration updated", self.serial);
        Ok(())
    }

    /// Read the stored calibration triples back from the EEPROM, in the
    /// fixed {channel, signal} enumeration order.
    pub fn calibration(&self) -> Result<[CalibrationTriple; CAL_BLOCKS], DeviceError> {
        let triples = read_cal_blob(&self.usb)?
            .unwrap_or_else(|| [CalibrationTriple::default(); CAL_BLOCKS]);
        *self.cal.lock().unwrap() = triples;
        Ok(triples)
    }

    // --- session-driven lifecycle -------------------------------------

    /// Claim USB resources when a session adds this device.
    pub(crate) fn added(&self) -> Result<(), DeviceError> {
        if self.claimed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.usb.claim_interface(0)?;
        self.claimed.store(true, Ordering::Release);
        Ok(())
    }

    /// Release USB resources when a session removes this device.
    pub(crate) fn removed(&self) -> Result<(), DeviceError> {
        if self.claimed.swap(false, Ordering::AcqRel) {
            self.usb.release_interface(0)?;
        }
        Ok(())
    }

    /// Configure the sampling rate and rebuild the sample queues.
    pub(crate) fn configure(&self, rate: u64, queue_size: usize) -> Result<(), DeviceError> {
        if self.is_running() {
            return Err(DeviceError::Busy);
        }
        let max = self.revision.max_rate();
        if rate == 0 || rate > max {
            return Err(DeviceError::UnsupportedRate { rate, max });
        }
        self.vendor_out(m1000::REQ_CONFIGURE, 0, 0, &(rate as u32).to_le_bytes())?;
        {
            let mut io = self.io.lock().unwrap();
            io.sample_rate = rate;
            io.inbound = Arc::new(InboundQueue::new(queue_size));
            io.outbound = [
                Arc::new(OutboundQueue::new(queue_size)),
                Arc::new(OutboundQueue::new(queue_size)),
            ];
            io.last_out = [0.0; CHANNEL_COUNT];
        }
        *self.state.lock().unwrap() = CaptureState::Configured;
        Ok(())
    }

    /// Turn on the power supplies and reset the sampling state.
    ///
    /// Stale measurements from a previous capture are dropped; outbound
    /// data queued ahead of the capture is kept to be sourced.
    pub(crate) fn on(&self) -> Result<(), DeviceError> {
        self.vendor_out(m1000::REQ_POWER, 1, 0, &[])?;
        self.requested_sampleno.store(0, Ordering::Release);
        self.in_sampleno.store(0, Ordering::Release);
        self.out_sampleno.store(0, Ordering::Release);
        let constants = {
            let output = self.output.lock().unwrap();
            [output.constant(0), output.constant(1)]
        };
        let mut io = self.io.lock().unwrap();
        io.inbound.clear();
        for outbound in &io.outbound {
            // Drop a leftover fault from the previous capture.
            outbound.take_underflow();
        }
        io.last_out = constants;
        Ok(())
    }

    /// Stop sampling and put the outputs into high impedance.
    pub(crate) fn off(&self) -> Result<(), DeviceError> {
        let stop = self.vendor_out(m1000::REQ_STOP, 0, 0, &[]);
        let power = self.vendor_out(m1000::REQ_POWER, 0, 0, &[]);
        *self.state.lock().unwrap() = CaptureState::Idle;
        *self.sof_start.lock().unwrap() = None;
        stop?;
        power?;
        Ok(())
    }

    /// Start streaming `samples` rows (0 = continuous).
    pub(crate) fn run(&self, samples: u64) -> Result<(), DeviceError> {
        self.requested_sampleno.store(samples, Ordering::Release);
        self.in_sampleno.store(0, Ordering::Release);
        self.out_sampleno.store(0, Ordering::Release);
        let sof = self.sof_start.lock().unwrap().take().unwrap_or(0);
        self.vendor_out(m1000::REQ_RUN, sof, 0, &[])?;
        *self.state.lock().unwrap() = CaptureState::Running;
        log::debug!(
            "device {}: capture started ({} samples, sof {})",
            self.serial,
            samples,
            sof
        );
        Ok(())
    }

    /// Ask the hardware to abort sampling. The state transition happens on
    /// the event thread once the pump observes the session flag.
    pub(crate) fn cancel(&self) {
        if let Err(e) = self.vendor_out(m1000::REQ_STOP, 0, 0, &[]) {
            log::debug!("device {}: stop request failed: {}", self.serial, e);
        }
    }

    /// Mark a running capture as failed (device detached mid-capture).
    /// Returns whether the device was actually running.
    pub(crate) fn fail_capture(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == CaptureState::Running {
            *state = CaptureState::Errored;
            true
        } else {
            false
        }
    }

    /// One event-thread pass: submit outbound packets, reap inbound ones,
    /// observing the session cancellation flag before any submission.
    pub(crate) fn pump(&self, cancel_requested: bool) -> PumpStatus {
        if !self.is_running() {
            return PumpStatus::Inactive;
        }
        if cancel_requested {
            self.cancel();
            *self.state.lock().unwrap() = CaptureState::Cancelled;
            return PumpStatus::Cancelled;
        }
        match self.pump_io() {
            Ok(false) => PumpStatus::Active,
            Ok(true) => {
                *self.state.lock().unwrap() = CaptureState::Completed;
                PumpStatus::Completed
            }
            Err(e) => {
                *self.state.lock().unwrap() = CaptureState::Errored;
                PumpStatus::Errored(e)
            }
        }
    }

    fn pump_io(&self) -> Result<bool, rusb::Error> {
        let (inbound, outbound, mut last_out) = {
            let io = self.io.lock().unwrap();
            (
                io.inbound.clone(),
                [io.outbound[0].clone(), io.outbound[1].clone()],
                io.last_out,
            )
        };
        let modes = *self.modes.lock().unwrap();
        let cal = *self.cal.lock().unwrap();
        let constants = {
            let output = self.output.lock().unwrap();
            [output.constant(0), output.constant(1)]
        };
        let requested = self.requested_sampleno.load(Ordering::Acquire);

        // Outbound side: keep the device fed, at most a few packets per pass.
        for _ in 0..MAX_PACKETS_PER_PASS {
            let sent = self.out_sampleno.load(Ordering::Acquire);
            let rows = if requested == 0 {
                m1000::PACKET_ROWS
            } else {
                (requested.saturating_sub(sent)).min(m1000::PACKET_ROWS as u64) as usize
            };
            if rows == 0 {
                break;
            }
            let mut packet = Vec::with_capacity(rows * m1000::OUT_ROW_BYTES);
            for _ in 0..rows {
                let mut values = [0.0f32; CHANNEL_COUNT];
                for channel in 0..CHANNEL_COUNT {
                    match outbound[channel].pop() {
                        Some(value) => {
                            values[channel] = value;
                            last_out[channel] = value;
                        }
                        None => {
                            values[channel] = if outbound[channel].is_primed() {
                                last_out[channel]
                            } else {
                                constants[channel]
                            };
                            if modes[channel] != Mode::Disabled {
                                outbound[channel].mark_underflow();
                            }
                        }
                    }
                }
                packet.extend_from_slice(&m1000::encode_out_row(values, modes, &cal));
            }
            match self.usb.write_bulk(m1000::EP_OUT, &packet, IO_TIMEOUT) {
                Ok(written) => {
                    let rows_written = (written / m1000::OUT_ROW_BYTES) as u64;
                    self.out_sampleno.fetch_add(rows_written, Ordering::AcqRel);
                }
                Err(rusb::Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        // Inbound side.
        let mut buf = vec![0u8; m1000::PACKET_ROWS * m1000::IN_ROW_BYTES];
        for _ in 0..MAX_PACKETS_PER_PASS {
            let received = self.in_sampleno.load(Ordering::Acquire);
            if requested != 0 && received >= requested {
                break;
            }
            match self.usb.read_bulk(m1000::EP_IN, &mut buf, IO_TIMEOUT) {
                Ok(len) => {
                    let mut rows = len / m1000::IN_ROW_BYTES;
                    if requested != 0 {
                        rows = rows.min((requested - received) as usize);
                    }
                    if rows == 0 {
                        break;
                    }
                    for chunk in buf[..rows * m1000::IN_ROW_BYTES].chunks_exact(m1000::IN_ROW_BYTES)
                    {
                        inbound.push(m1000::decode_in_row(chunk, modes, &cal));
                    }
                    self.in_sampleno.fetch_add(rows as u64, Ordering::AcqRel);
                }
                Err(rusb::Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        self.io.lock().unwrap().last_out = last_out;

        let done = requested != 0
            && self.in_sampleno.load(Ordering::Acquire) >= requested
            && self.out_sampleno.load(Ordering::Acquire) >= requested;
        Ok(done)
    }

    fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == CaptureState::Running
    }

    fn vendor_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> rusb::Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.usb
            .write_control(request_type, request, value, index, data, CTRL_TIMEOUT)
    }

    fn vendor_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> rusb::Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.usb
            .read_control(request_type, request, value, index, data, CTRL_TIMEOUT)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("revision", &self.revision)
            .field("fw_version", &self.fw_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.claimed.load(Ordering::Acquire) {
            if let Err(e) = self.usb.release_interface(0) {
                log::debug!("Failed to release USB interface: {}", e);
            }
        }
    }
}

fn mode_code(mode: Mode) -> u16 {
    match mode {
        Mode::Disabled => 0,
        Mode::SourceVoltage => 1,
        Mode::SourceCurrent => 2,
    }
}

fn read_fw_version(handle: &DeviceHandle<Context>) -> rusb::Result<String> {
    let request_type = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    );
    let mut buf = [0u8; 32];
    let n = handle.read_control(request_type, m1000::REQ_FW_VERSION, 0, 0, &mut buf, CTRL_TIMEOUT)?;
    Ok(String::from_utf8_lossy(&buf[..n])
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

fn read_cal_blob(
    handle: &DeviceHandle<Context>,
) -> rusb::Result<Option<[CalibrationTriple; CAL_BLOCKS]>> {
    let request_type = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    );
    let mut blob = [0u8; CAL_BLOB_LEN];
    handle.read_control(
        request_type,
        m1000::REQ_EEPROM_READ,
        0,
        0,
        &mut blob,
        CTRL_TIMEOUT,
    )?;
    Ok(decode_blob(&blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_and_signal_tables() {
        assert_eq!(DEVICE_INFO.channel_count, 2);
        assert_eq!(CHANNEL_INFOS[0].label, "A");
        assert_eq!(CHANNEL_INFOS[1].label, "B");
        for info in CHANNEL_INFOS {
            assert_eq!(info.mode_count, 3);
            assert_eq!(info.signal_count, SIGNALS_PER_CHANNEL);
        }
    }

    #[test]
    fn test_signal_tables_cover_all_modes() {
        // Every non-disabled mode measures exactly one of the two signals
        // and sources the other.
        for mode in [Mode::SourceVoltage, Mode::SourceCurrent] {
            let measured = [VOLTAGE_SIGNAL, CURRENT_SIGNAL]
                .iter()
                .filter(|s| s.input_modes & mode.bit() != 0)
                .count();
            let sourced = [VOLTAGE_SIGNAL, CURRENT_SIGNAL]
                .iter()
                .filter(|s| s.output_modes & mode.bit() != 0)
                .count();
            assert_eq!(measured, 1);
            assert_eq!(sourced, 1);
        }
    }

    #[test]
    fn test_output_config_ignores_invalid_channel() {
        let mut cfg = OutputConfig {
            constants: [0.0; CHANNEL_COUNT],
        };
        cfg.set_constant(0, 2.5);
        cfg.set_constant(7, 9.9);
        assert_eq!(cfg.constant(0), 2.5);
        assert_eq!(cfg.constant(7), 0.0);
    }

    #[test]
    fn test_mode_codes_are_stable() {
        assert_eq!(mode_code(Mode::Disabled), 0);
        assert_eq!(mode_code(Mode::SourceVoltage), 1);
        assert_eq!(mode_code(Mode::SourceCurrent), 2);
    }
}
