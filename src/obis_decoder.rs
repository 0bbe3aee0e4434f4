//! Extracts the five readings of an ISKRA MT175 from a complete SML frame.
//!
//! The meter always sends the list entries in the same layout, so the value
//! of each entry sits at a fixed distance from its OBIS identifier. Offsets
//! and widths below are counted in hex characters of the frame dump.

use crate::frame_assembler::{find_aligned, RawFrame};
use crate::reading::{Quantity, Reading};
use std::fmt;

/// Where and how a quantity is stored in the frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObisField {
    pub quantity: Quantity,
    /// Octet string header (0x07) followed by the 6 byte OBIS code
    pub identifier: &'static str,
    /// Distance from the identifier to the first value character
    pub value_offset: usize,
    /// Width of the big endian value
    pub value_width: usize,
    pub divisor: f64,
}

/// All fields this meter model transmits
pub const OBIS_FIELDS: [ObisField; 5] = [
    // 1-0:1.8.0*255 - positive active energy, 1/10 Wh resolution
    ObisField {
        quantity: Quantity::ElectricityMeter,
        identifier: "070100010800ff",
        value_offset: 36,
        value_width: 16,
        divisor: 1e4,
    },
    // 1-0:16.7.0*255 - sum of active instantaneous power L1, L2, L3
    ObisField {
        quantity: Quantity::Overall,
        identifier: "070100100700ff",
        value_offset: 28,
        value_width: 8,
        divisor: 1.0,
    },
    // 1-0:36.7.0*255
    ObisField {
        quantity: Quantity::Phase1,
        identifier: "070100240700ff",
        value_offset: 28,
        value_width: 8,
        divisor: 1.0,
    },
    // 1-0:56.7.0*255
    ObisField {
        quantity: Quantity::Phase2,
        identifier: "070100380700ff",
        value_offset: 28,
        value_width: 8,
        divisor: 1.0,
    },
    // 1-0:76.7.0*255
    ObisField {
        quantity: Quantity::Phase3,
        identifier: "0701004c0700ff",
        value_offset: 28,
        value_width: 8,
        divisor: 1.0,
    },
];

/// Why a quantity could not be decoded from a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeDiagnostic {
    /// The OBIS identifier does not occur in the frame
    MissingIdentifier { quantity: Quantity },
    /// The identifier was found but the frame ends before its value does
    TruncatedValue {
        quantity: Quantity,
        position: usize,
        available: usize,
    },
    /// The value characters are not valid hex
    UnparsableValue { quantity: Quantity, raw: String },
}

impl DecodeDiagnostic {
    pub fn quantity(&self) -> Quantity {
        match self {
            DecodeDiagnostic::MissingIdentifier { quantity }
            | DecodeDiagnostic::TruncatedValue { quantity, .. }
            | DecodeDiagnostic::UnparsableValue { quantity, .. } => *quantity,
        }
    }
}

impl fmt::Display for DecodeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeDiagnostic::MissingIdentifier { quantity } => {
                write!(f, "{quantity}: OBIS identifier not found in frame")
            }
            DecodeDiagnostic::TruncatedValue {
                quantity,
                position,
                available,
            } => write!(
                f,
                "{quantity}: frame truncated, value at {position} but only {available} characters available"
            ),
            DecodeDiagnostic::UnparsableValue { quantity, raw } => {
                write!(f, "{quantity}: value '{raw}' is not a hex number")
            }
        }
    }
}

/// A decoded frame together with the reasons for any absent measurement
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub reading: Reading,
    pub diagnostics: Vec<DecodeDiagnostic>,
}

impl DecodedFrame {
    /// True when every field was found and parsed
    pub fn is_complete(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Decodes the five fixed OBIS fields.
///
/// Never fails: a field that can't be decoded stays absent in the reading
/// and a diagnostic explains why.
pub fn decode(frame: &RawFrame) -> DecodedFrame {
    let data = frame.as_hex();
    let mut reading = Reading::empty();
    let mut diagnostics = Vec::new();

    for field in &OBIS_FIELDS {
        match decode_field(data, field) {
            Ok(value) => reading.set(field.quantity, Some(value)),
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }

    DecodedFrame {
        reading,
        diagnostics,
    }
}

fn decode_field(data: &str, field: &ObisField) -> Result<f64, DecodeDiagnostic> {
    let quantity = field.quantity;
    let pos = find_aligned(data, field.identifier, 0)
        .ok_or(DecodeDiagnostic::MissingIdentifier { quantity })?;

    let start = pos + field.value_offset;
    let raw = data
        .get(start..start + field.value_width)
        .ok_or(DecodeDiagnostic::TruncatedValue {
            quantity,
            position: start,
            available: data.len(),
        })?;

    let value = u64::from_str_radix(raw, 16).map_err(|_| DecodeDiagnostic::UnparsableValue {
        quantity,
        raw: raw.to_string(),
    })?;

    Ok(value as f64 / field.divisor)
}
