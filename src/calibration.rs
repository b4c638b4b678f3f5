//! Calibration data: the textual calibration file and the EEPROM image.
//!
//! A calibration file holds eight blocks, one per {channel, signal} in the
//! fixed enumeration order of [`BLOCK_LABELS`]. Each block is delimited by
//! `</>` and `<\>` marker lines and carries two to three lines of
//! `measured, reference` float pairs at four-decimal precision. Lines
//! starting with `#` are labels for human readers and are ignored.
//!
//! The first pair of a block is the zero point and yields the offset; the
//! remaining pairs yield the positive and negative gain. The parsed file is
//! reduced to eight `(offset, gain_pos, gain_neg)` triples which are written
//! to the device EEPROM as a single image: the write either replaces the
//! stored calibration completely or rejects the file, it never applies a
//! partial update.

use std::fmt;
use std::fs;
use std::path::Path;

/// Number of calibrated signals: 2 channels x {measured, sourced} x {V, I}.
pub const CAL_BLOCKS: usize = 8;

/// Block labels in enumeration order.
pub const BLOCK_LABELS: [&str; CAL_BLOCKS] = [
    "Channel A, measure V",
    "Channel A, measure I",
    "Channel A, source V",
    "Channel A, source I",
    "Channel B, measure V",
    "Channel B, measure I",
    "Channel B, source V",
    "Channel B, source I",
];

const BLOCK_START: &str = "</>";
const BLOCK_END: &str = "<\\>";

/// Magic word marking a valid calibration image in the EEPROM.
const CAL_MAGIC: u32 = 0x534D_5543;

/// Size of the EEPROM calibration image in bytes.
pub(crate) const CAL_BLOB_LEN: usize = 4 + CAL_BLOCKS * 3 * 4;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: expected two comma-separated values, got '{content}'")]
    MalformedPair { line: usize, content: String },

    #[error("Calibration block {block} has {count} value lines, expected 2 to 3")]
    BadBlockSize { block: usize, count: usize },

    #[error("Expected {CAL_BLOCKS} calibration blocks, found {found}")]
    WrongBlockCount { found: usize },

    #[error("Unterminated calibration block starting at line {line}")]
    UnterminatedBlock { line: usize },

    #[error("Calibration block {block} has a degenerate gain point")]
    DegeneratePoint { block: usize },
}

/// One `measured, reference` calibration point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalPoint {
    /// Value reported by the uncalibrated device.
    pub measured: f64,
    /// True value from the external reference meter.
    pub reference: f64,
}

/// One signal's stored calibration: offset plus per-polarity gains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationTriple {
    pub offset: f32,
    pub gain_pos: f32,
    pub gain_neg: f32,
}

impl Default for CalibrationTriple {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gain_pos: 1.0,
            gain_neg: 1.0,
        }
    }
}

/// A parsed calibration file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationFile {
    blocks: Vec<Vec<CalPoint>>,
}

impl CalibrationFile {
    /// Build a file from eight blocks of 2-3 points each.
    pub fn from_blocks(blocks: Vec<Vec<CalPoint>>) -> Result<Self, CalibrationError> {
        if blocks.len() != CAL_BLOCKS {
            return Err(CalibrationError::WrongBlockCount {
                found: blocks.len(),
            });
        }
        for (block, points) in blocks.iter().enumerate() {
            if !(2..=3).contains(&points.len()) {
                return Err(CalibrationError::BadBlockSize {
                    block,
                    count: points.len(),
                });
            }
        }
        Ok(Self { blocks })
    }

    /// Read and parse a calibration file from disk.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse the textual calibration format.
    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let mut blocks: Vec<Vec<CalPoint>> = Vec::new();
        let mut points: Vec<CalPoint> = Vec::new();
        let mut in_block = false;
        let mut block_start = 0;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = idx + 1;
            if !in_block {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if line == BLOCK_START {
                    in_block = true;
                    block_start = lineno;
                    points.clear();
                } else {
                    return Err(CalibrationError::MalformedPair {
                        line: lineno,
                        content: line.to_string(),
                    });
                }
            } else if line == BLOCK_END {
                if !(2..=3).contains(&points.len()) {
                    return Err(CalibrationError::BadBlockSize {
                        block: blocks.len(),
                        count: points.len(),
                    });
                }
                blocks.push(std::mem::take(&mut points));
                in_block = false;
            } else {
                points.push(parse_pair(line, lineno)?);
            }
        }

        if in_block {
            return Err(CalibrationError::UnterminatedBlock { line: block_start });
        }
        if blocks.len() != CAL_BLOCKS {
            return Err(CalibrationError::WrongBlockCount {
                found: blocks.len(),
            });
        }
        Ok(Self { blocks })
    }

    /// Write the textual format to disk.
    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Points of one block, in enumeration order.
    pub fn block(&self, index: usize) -> Option<&[CalPoint]> {
        self.blocks.get(index).map(Vec::as_slice)
    }

    /// Reduce the file to the eight EEPROM triples.
    ///
    /// The first point is the zero point (`offset = reference - measured`);
    /// every further point contributes `gain = reference / (measured +
    /// offset)` to the polarity matching its reference sign. A missing
    /// polarity inherits the other one's gain.
    pub fn triples(&self) -> Result<[CalibrationTriple; CAL_BLOCKS], CalibrationError> {
        let mut out = [CalibrationTriple::default(); CAL_BLOCKS];
        for (block, points) in self.blocks.iter().enumerate() {
            let zero = points[0];
            let offset = zero.reference - zero.measured;
            let mut gain_pos = None;
            let mut gain_neg = None;
            for point in &points[1..] {
                let corrected = point.measured + offset;
                if corrected.abs() < f64::EPSILON || !corrected.is_finite() {
                    return Err(CalibrationError::DegeneratePoint { block });
                }
                let gain = point.reference / corrected;
                if point.reference < 0.0 {
                    gain_neg = Some(gain);
                } else {
                    gain_pos = Some(gain);
                }
            }
            let gain_pos = gain_pos.or(gain_neg).unwrap_or(1.0);
            let gain_neg = gain_neg.unwrap_or(gain_pos);
            out[block] = CalibrationTriple {
                offset: offset as f32,
                gain_pos: gain_pos as f32,
                gain_neg: gain_neg as f32,
            };
        }
        Ok(out)
    }
}

impl fmt::Display for CalibrationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (block, points) in self.blocks.iter().enumerate() {
            writeln!(f, "# {}", BLOCK_LABELS[block])?;
            writeln!(f, "{BLOCK_START}")?;
            for point in points {
                writeln!(f, "{:.4}, {:.4}", point.measured, point.reference)?;
            }
            writeln!(f, "{BLOCK_END}")?;
        }
        Ok(())
    }
}

fn parse_pair(line: &str, lineno: usize) -> Result<CalPoint, CalibrationError> {
    let malformed = || CalibrationError::MalformedPair {
        line: lineno,
        content: line.to_string(),
    };
    let (measured, reference) = line.split_once(',').ok_or_else(|| malformed())?;
    let measured: f64 = measured.trim().parse().map_err(|_| malformed())?;
    let reference: f64 = reference.trim().parse().map_err(|_| malformed())?;
    if !measured.is_finite() || !reference.is_finite() {
        return Err(malformed());
    }
    Ok(CalPoint {
        measured,
        reference,
    })
}

/// Serialize triples into the EEPROM image.
pub(crate) fn encode_blob(triples: &[CalibrationTriple; CAL_BLOCKS]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(CAL_BLOB_LEN);
    blob.extend_from_slice(&CAL_MAGIC.to_le_bytes());
    for triple in triples {
        blob.extend_from_slice(&triple.offset.to_le_bytes());
        blob.extend_from_slice(&triple.gain_pos.to_le_bytes());
        blob.extend_from_slice(&triple.gain_neg.to_le_bytes());
    }
    blob
}

/// Deserialize an EEPROM image; `None` when no valid image is stored
/// (erased EEPROM, factory state).
pub(crate) fn decode_blob(blob: &[u8]) -> Option<[CalibrationTriple; CAL_BLOCKS]> {
    if blob.len() < CAL_BLOB_LEN {
        return None;
    }
    let magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if magic != CAL_MAGIC {
        return None;
    }
    let mut triples = [CalibrationTriple::default(); CAL_BLOCKS];
    let mut at = 4;
    for triple in &mut triples {
        let mut next = || {
            let v = f32::from_le_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]]);
            at += 4;
            v
        };
        triple.offset = next();
        triple.gain_pos = next();
        triple.gain_neg = next();
    }
    Some(triples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_file() -> CalibrationFile {
        let block = vec![
            CalPoint {
                measured: 0.0,
                reference: 0.0,
            },
            CalPoint {
                measured: 2.5,
                reference: 2.5,
            },
        ];
        CalibrationFile::from_blocks(vec![block; CAL_BLOCKS]).unwrap()
    }

    #[test]
    fn test_identity_file_yields_default_triples() {
        let triples = identity_file().triples().unwrap();
        for triple in triples {
            assert_eq!(triple, CalibrationTriple::default());
        }
    }

    #[test]
    fn test_text_round_trip() {
        let file = identity_file();
        let parsed = CalibrationFile::parse(&file.to_string()).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn test_offset_and_gains() {
        let block = vec![
            CalPoint {
                measured: 0.1,
                reference: 0.0,
            },
            CalPoint {
                measured: 2.4,
                reference: 2.5,
            },
            CalPoint {
                measured: -2.6,
                reference: -2.5,
            },
        ];
        let mut blocks = vec![block];
        blocks.resize(
            CAL_BLOCKS,
            vec![
                CalPoint {
                    measured: 0.0,
                    reference: 0.0,
                },
                CalPoint {
                    measured: 1.0,
                    reference: 1.0,
                },
            ],
        );
        let triples = CalibrationFile::from_blocks(blocks)
            .unwrap()
            .triples()
            .unwrap();
        let t = triples[0];
        assert!((t.offset - (-0.1)).abs() < 1e-6);
        assert!((t.gain_pos - (2.5 / 2.3)).abs() < 1e-6);
        assert!((t.gain_neg - (-2.5 / -2.7)).abs() < 1e-6);
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        assert!(matches!(
            CalibrationFile::parse("foo"),
            Err(CalibrationError::MalformedPair { line: 1, .. })
        ));
    }

    #[test]
    fn test_wrong_block_count_is_rejected() {
        let one_block = "</>\n0.0, 0.0\n1.0, 1.0\n<\\>\n";
        assert!(matches!(
            CalibrationFile::parse(one_block),
            Err(CalibrationError::WrongBlockCount { found: 1 })
        ));
    }

    #[test]
    fn test_unterminated_block_is_rejected() {
        let text = "</>\n0.0, 0.0\n";
        assert!(matches!(
            CalibrationFile::parse(text),
            Err(CalibrationError::UnterminatedBlock { line: 1 })
        ));
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let text = "</>\n0.0, 0.0\n1.0, 1.0\n2.0, 2.0\n3.0, 3.0\n<\\>\n";
        assert!(matches!(
            CalibrationFile::parse(text),
            Err(CalibrationError::BadBlockSize { block: 0, count: 4 })
        ));
    }

    #[test]
    fn test_blob_round_trip() {
        let mut triples = [CalibrationTriple::default(); CAL_BLOCKS];
        triples[3] = CalibrationTriple {
            offset: -0.025,
            gain_pos: 1.01,
            gain_neg: 0.99,
        };
        let blob = encode_blob(&triples);
        assert_eq!(blob.len(), CAL_BLOB_LEN);
        assert_eq!(decode_blob(&blob), Some(triples));
    }

    #[test]
    fn test_erased_eeprom_decodes_to_none() {
        assert_eq!(decode_blob(&[0xFF; CAL_BLOB_LEN]), None);
        assert_eq!(decode_blob(&[]), None);
    }
}
