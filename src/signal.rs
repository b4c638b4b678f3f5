//! Signal descriptors: the measurable and sourceable quantities of a channel.

use std::fmt;

/// Operating mode of one source/measure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Channel outputs are high impedance, nothing is sourced.
    Disabled,
    /// Source voltage, measure current.
    SourceVoltage,
    /// Source current, measure voltage.
    SourceCurrent,
}

impl Mode {
    /// Bit used in [`SignalInfo`] mode masks.
    pub const fn bit(self) -> u32 {
        match self {
            Self::Disabled => 1 << 0,
            Self::SourceVoltage => 1 << 1,
            Self::SourceCurrent => 1 << 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SourceVoltage => "source voltage",
            Self::SourceCurrent => "source current",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalInfo {
    /// Signal label.
    pub label: &'static str,
    /// Mask of modes for which this signal is measured.
    pub input_modes: u32,
    /// Mask of modes for which this signal is sourced.
    pub output_modes: u32,
    /// Minimum possible value for the signal.
    pub min: f64,
    /// Maximum possible value for the signal.
    pub max: f64,
    /// Signal resolution.
    pub resolution: f64,
}

/// One measurable or controllable quantity on a channel.
///
/// Signals are owned by their [`Device`](crate::Device) and live exactly as
/// long as it; one instance exists per {channel, signal} pair.
#[derive(Debug)]
pub struct Signal {
    info: SignalInfo,
}

impl Signal {
    pub(crate) const fn new(info: SignalInfo) -> Self {
        Self { info }
    }

    /// Get the descriptor of the signal.
    pub const fn info(&self) -> &SignalInfo {
        &self.info
    }

    /// Whether this signal is measured while the channel is in `mode`.
    pub const fn is_input_in(&self, mode: Mode) -> bool {
        self.info.input_modes & mode.bit() != 0
    }

    /// Whether this signal is sourced while the channel is in `mode`.
    pub const fn is_output_in(&self, mode: Mode) -> bool {
        self.info.output_modes & mode.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOLTAGE: SignalInfo = SignalInfo {
        label: "Voltage",
        input_modes: Mode::SourceCurrent.bit(),
        output_modes: Mode::SourceVoltage.bit(),
        min: 0.0,
        max: 5.0,
        resolution: 5.0 / 65536.0,
    };

    #[test]
    fn test_mode_bits_are_disjoint() {
        assert_eq!(Mode::Disabled.bit() & Mode::SourceVoltage.bit(), 0);
        assert_eq!(Mode::SourceVoltage.bit() & Mode::SourceCurrent.bit(), 0);
    }

    #[test]
    fn test_signal_mode_membership() {
        let sig = Signal::new(VOLTAGE);
        assert!(sig.is_output_in(Mode::SourceVoltage));
        assert!(sig.is_input_in(Mode::SourceCurrent));
        assert!(!sig.is_input_in(Mode::SourceVoltage));
        assert!(!sig.is_output_in(Mode::Disabled));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::SourceVoltage.to_string(), "source voltage");
        assert_eq!(Mode::Disabled.as_str(), "disabled");
    }
}
