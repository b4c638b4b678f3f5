//! Hardware-revision specifics: USB identifiers, vendor requests and the
//! bulk wire codec.
//!
//! Both supported revisions speak the same protocol; they differ in USB
//! identity and reported hardware version. All raw/physical conversions and
//! the calibration arithmetic live here so the device module stays transport
//! logic only.

use crate::calibration::{CalibrationTriple, CAL_BLOCKS};
use crate::signal::Mode;
use crate::SUPPORTED_DEVICES;

/// Bulk endpoint carrying measured samples to the host.
pub(crate) const EP_IN: u8 = 0x81;
/// Bulk endpoint carrying to-source samples to the device.
pub(crate) const EP_OUT: u8 = 0x02;

// Vendor control requests.
pub(crate) const REQ_EEPROM_READ: u8 = 0x01;
pub(crate) const REQ_EEPROM_WRITE: u8 = 0x02;
pub(crate) const REQ_FW_VERSION: u8 = 0x30;
pub(crate) const REQ_SET_MODE: u8 = 0x53;
pub(crate) const REQ_GET_FRAME: u8 = 0x6F;
pub(crate) const REQ_SAMBA: u8 = 0xBB;
pub(crate) const REQ_CONFIGURE: u8 = 0xC2;
pub(crate) const REQ_RUN: u8 = 0xC5;
pub(crate) const REQ_STOP: u8 = 0xC6;
pub(crate) const REQ_POWER: u8 = 0xC7;

/// Sample rows per bulk packet in either direction.
pub(crate) const PACKET_ROWS: usize = 256;
/// Bytes per inbound row: four u16 lanes (A-V, A-I, B-V, B-I).
pub(crate) const IN_ROW_BYTES: usize = 8;
/// Bytes per outbound row: one u16 per channel.
pub(crate) const OUT_ROW_BYTES: usize = 4;

/// Microframe counter wraps at 14 bits on the device.
pub(crate) const FRAME_MASK: u16 = 0x3FFF;
/// Scheduling lead applied by `sync()` so every device can arm before the
/// shared start-of-frame arrives.
pub(crate) const SYNC_LEAD_FRAMES: u16 = 0xFF;

const VOLTAGE_FULL_SCALE: f32 = 5.0;
const CURRENT_FULL_SCALE: f32 = 0.2;

/// Hardware revision, selected at discovery time by (VID, PID).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// Original production run.
    RevA,
    /// Current production run.
    RevF,
}

impl Revision {
    /// Match a USB identity against the supported allow-list.
    pub(crate) fn from_ids(vid: u16, pid: u16) -> Option<Self> {
        if (vid, pid) == SUPPORTED_DEVICES[0] {
            Some(Self::RevA)
        } else if (vid, pid) == SUPPORTED_DEVICES[1] {
            Some(Self::RevF)
        } else {
            None
        }
    }

    pub(crate) const fn hw_label(self) -> &'static str {
        match self {
            Self::RevA => "A",
            Self::RevF => "F",
        }
    }

    /// Nominal default sample rate in Hz.
    pub(crate) const fn default_rate(self) -> u32 {
        100_000
    }

    /// Highest sample rate the revision accepts.
    pub(crate) const fn max_rate(self) -> u64 {
        100_000
    }
}

/// Calibration table index for {channel, lane}.
const fn cal_index(channel: usize, lane: CalLane) -> usize {
    channel * 4 + lane as usize
}

#[derive(Clone, Copy)]
enum CalLane {
    MeasureV = 0,
    MeasureI = 1,
    SourceV = 2,
    SourceI = 3,
}

fn apply_measured(cal: &CalibrationTriple, value: f32) -> f32 {
    let corrected = value + cal.offset;
    if corrected < 0.0 {
        corrected * cal.gain_neg
    } else {
        corrected * cal.gain_pos
    }
}

fn apply_sourced(cal: &CalibrationTriple, value: f32) -> f32 {
    let gain = if value < 0.0 {
        cal.gain_neg
    } else {
        cal.gain_pos
    };
    if gain == 0.0 {
        value - cal.offset
    } else {
        value / gain - cal.offset
    }
}

fn raw_to_volts(raw: u16) -> f32 {
    f32::from(raw) / f32::from(u16::MAX) * VOLTAGE_FULL_SCALE
}

fn raw_to_amps(raw: u16) -> f32 {
    (f32::from(raw) / f32::from(u16::MAX) - 0.5) * 2.0 * CURRENT_FULL_SCALE
}

fn volts_to_raw(volts: f32) -> u16 {
    let norm = (volts / VOLTAGE_FULL_SCALE).clamp(0.0, 1.0);
    (norm * f32::from(u16::MAX)).round() as u16
}

fn amps_to_raw(amps: f32) -> u16 {
    let norm = (amps / (2.0 * CURRENT_FULL_SCALE) + 0.5).clamp(0.0, 1.0);
    (norm * f32::from(u16::MAX)).round() as u16
}

/// Decode one inbound row into {measured, sourced} pairs per channel.
///
/// The wire carries voltage and current lanes for both channels; which lane
/// is "measured" and which is "sourced" depends on the channel mode.
pub(crate) fn decode_in_row(
    chunk: &[u8],
    modes: [Mode; 2],
    cal: &[CalibrationTriple; CAL_BLOCKS],
) -> [f32; 4] {
    let lane = |i: usize| u16::from_le_bytes([chunk[2 * i], chunk[2 * i + 1]]);
    let mut row = [0.0f32; 4];
    for channel in 0..2 {
        let volts = raw_to_volts(lane(channel * 2));
        let amps = raw_to_amps(lane(channel * 2 + 1));
        let cal_v = &cal[cal_index(channel, CalLane::MeasureV)];
        let cal_i = &cal[cal_index(channel, CalLane::MeasureI)];
        let (measured, sourced) = match modes[channel] {
            // Sourcing voltage: the measurement of interest is current.
            Mode::SourceVoltage => (apply_measured(cal_i, amps), apply_measured(cal_v, volts)),
            Mode::SourceCurrent => (apply_measured(cal_v, volts), apply_measured(cal_i, amps)),
            // High impedance still samples the voltage lane.
            Mode::Disabled => (apply_measured(cal_v, volts), 0.0),
        };
        row[channel * 2] = measured;
        row[channel * 2 + 1] = sourced;
    }
    row
}

/// Encode one outbound row (one to-source value per channel).
pub(crate) fn encode_out_row(
    values: [f32; 2],
    modes: [Mode; 2],
    cal: &[CalibrationTriple; CAL_BLOCKS],
) -> [u8; OUT_ROW_BYTES] {
    let mut out = [0u8; OUT_ROW_BYTES];
    for channel in 0..2 {
        let raw = match modes[channel] {
            Mode::SourceVoltage => {
                let cal = &cal[cal_index(channel, CalLane::SourceV)];
                volts_to_raw(apply_sourced(cal, values[channel]))
            }
            Mode::SourceCurrent => {
                let cal = &cal[cal_index(channel, CalLane::SourceI)];
                amps_to_raw(apply_sourced(cal, values[channel]))
            }
            Mode::Disabled => 0,
        };
        out[channel * 2..channel * 2 + 2].copy_from_slice(&raw.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTriple;

    const IDENTITY: [CalibrationTriple; CAL_BLOCKS] = [CalibrationTriple {
        offset: 0.0,
        gain_pos: 1.0,
        gain_neg: 1.0,
    }; CAL_BLOCKS];

    #[test]
    fn test_revision_from_allow_list() {
        assert_eq!(Revision::from_ids(0x0456, 0xcee2), Some(Revision::RevA));
        assert_eq!(Revision::from_ids(0x064b, 0x784c), Some(Revision::RevF));
        assert_eq!(Revision::from_ids(0x1d50, 0x60a1), None);
        // The bootloader identity is disjoint from the normal-mode list.
        assert_eq!(Revision::from_ids(0x03eb, 0x6124), None);
    }

    #[test]
    fn test_voltage_conversion_end_points() {
        assert!(raw_to_volts(0).abs() < 1e-6);
        assert!((raw_to_volts(u16::MAX) - 5.0).abs() < 1e-6);
        assert_eq!(volts_to_raw(0.0), 0);
        assert_eq!(volts_to_raw(5.0), u16::MAX);
        // Out-of-range requests clamp instead of wrapping.
        assert_eq!(volts_to_raw(7.5), u16::MAX);
        assert_eq!(volts_to_raw(-1.0), 0);
    }

    #[test]
    fn test_current_conversion_is_centered() {
        assert!((raw_to_amps(u16::MAX / 2) - 0.0).abs() < 1e-4);
        assert!((raw_to_amps(u16::MAX) - 0.2).abs() < 1e-4);
        assert!((raw_to_amps(0) + 0.2).abs() < 1e-4);
        let mid = amps_to_raw(0.0);
        assert!((f32::from(mid) - f32::from(u16::MAX) / 2.0).abs() < 1.0);
    }

    #[test]
    fn test_decode_lane_mapping_follows_mode() {
        // Channel A at 2.5 V / +0.1 A, channel B at 1.0 V / -0.1 A.
        let mut chunk = [0u8; IN_ROW_BYTES];
        chunk[0..2].copy_from_slice(&volts_to_raw(2.5).to_le_bytes());
        chunk[2..4].copy_from_slice(&amps_to_raw(0.1).to_le_bytes());
        chunk[4..6].copy_from_slice(&volts_to_raw(1.0).to_le_bytes());
        chunk[6..8].copy_from_slice(&amps_to_raw(-0.1).to_le_bytes());

        let row = decode_in_row(
            &chunk,
            [Mode::SourceVoltage, Mode::SourceCurrent],
            &IDENTITY,
        );
        // A sources voltage, so it measures current.
        assert!((row[0] - 0.1).abs() < 1e-3);
        assert!((row[1] - 2.5).abs() < 1e-3);
        // B sources current, so it measures voltage.
        assert!((row[2] - 1.0).abs() < 1e-3);
        assert!((row[3] + 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_source_round_trip_with_calibration() {
        let mut cal = IDENTITY;
        cal[2] = CalibrationTriple {
            offset: -0.05,
            gain_pos: 1.02,
            gain_neg: 1.02,
        };
        let encoded = encode_out_row([2.5, 0.0], [Mode::SourceVoltage, Mode::Disabled], &cal);
        let raw = u16::from_le_bytes([encoded[0], encoded[1]]);
        let produced = raw_to_volts(raw);
        // Encoding pre-distorts so the calibrated hardware lands on 2.5 V.
        let corrected = (produced + cal[2].offset) * cal[2].gain_pos;
        assert!((corrected - 2.5).abs() < 1e-2);
        // Disabled channel sources the zero level.
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 0);
    }
}
