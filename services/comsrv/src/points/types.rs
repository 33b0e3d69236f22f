//! Core point and sample types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Logical category of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    /// Analog input
    Telemetry,
    /// Digital input
    Signal,
    /// Digital output
    Control,
    /// Analog output
    Setpoint,
}

impl PointKind {
    /// Single-letter tag used in store keys.
    pub fn tag(self) -> &'static str {
        match self {
            PointKind::Telemetry => "m",
            PointKind::Signal => "s",
            PointKind::Control => "c",
            PointKind::Setpoint => "a",
        }
    }

    /// Inputs are polled; outputs are written on command.
    pub fn is_input(self) -> bool {
        matches!(self, PointKind::Telemetry | PointKind::Signal)
    }
}

/// Scalar representation of a point value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
}

impl ScalarType {
    pub fn bits(self) -> u16 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int16 | ScalarType::Uint16 => 16,
            ScalarType::Int32 | ScalarType::Uint32 | ScalarType::Float32 => 32,
        }
    }

    /// Holding/input registers occupied by one value.
    pub fn registers(self) -> u16 {
        match self {
            ScalarType::Bool => 0,
            ScalarType::Int16 | ScalarType::Uint16 => 1,
            ScalarType::Int32 | ScalarType::Uint32 | ScalarType::Float32 => 2,
        }
    }
}

/// Byte permutation across multi-register scalars.
///
/// `Abcd` is plain big-endian; `Cdab` swaps word order only; `Badc` swaps
/// bytes within each word; `Dcba` reverses all four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    #[default]
    Abcd,
    Badc,
    Cdab,
    Dcba,
}

impl std::str::FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ABCD" => Ok(ByteOrder::Abcd),
            "BADC" => Ok(ByteOrder::Badc),
            "CDAB" => Ok(ByteOrder::Cdab),
            "DCBA" => Ok(ByteOrder::Dcba),
            other => Err(format!("invalid byte order: {other}")),
        }
    }
}

/// Confidence tag attached to every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Good,
    /// Decoded fine but outside the configured validity range
    Range,
    /// Value is older than its refresh deadline; assigned by consumers,
    /// carried here so the full taxonomy round-trips through the store
    Stale,
    /// The read transaction failed after retries
    CommFail,
    /// The point's kind/function-code combination is unsupported
    NotImplemented,
}

impl Quality {
    pub fn tag(self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Range => "RANGE",
            Quality::Stale => "STALE",
            Quality::CommFail => "COMM_FAIL",
            Quality::NotImplemented => "NOT_IMPLEMENTED",
        }
    }

    /// Whether the sample carries a usable decoded value.
    pub fn has_value(self) -> bool {
        matches!(self, Quality::Good | Quality::Range | Quality::Stale)
    }
}

/// Monotonic + wall-clock capture instant.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    pub monotonic: Instant,
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// One decoded reading, produced by the driver+decoder and consumed by the
/// publisher.
#[derive(Debug, Clone)]
pub struct Sample {
    pub channel_id: u16,
    pub point_id: u32,
    pub kind: PointKind,
    pub scalar: ScalarType,
    /// Promoted raw register value (bit pattern for floats)
    pub raw: u64,
    /// Engineering value after scale and offset
    pub value: f64,
    pub timestamp: Timestamp,
    pub quality: Quality,
}

impl Sample {
    /// Scalar string written to the store: `"0"`/`"1"` for booleans,
    /// six-decimal fixed for numerics.
    pub fn format_value(&self) -> bytes::Bytes {
        if self.scalar == ScalarType::Bool {
            comsrv_rtdb::numfmt::bool_str(self.value != 0.0)
        } else {
            comsrv_rtdb::numfmt::fixed6(self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags() {
        assert_eq!(PointKind::Telemetry.tag(), "m");
        assert_eq!(PointKind::Signal.tag(), "s");
        assert_eq!(PointKind::Control.tag(), "c");
        assert_eq!(PointKind::Setpoint.tag(), "a");
    }

    #[test]
    fn scalar_sizes() {
        assert_eq!(ScalarType::Bool.bits(), 1);
        assert_eq!(ScalarType::Int16.bits(), 16);
        assert_eq!(ScalarType::Float32.bits(), 32);
        assert_eq!(ScalarType::Float32.registers(), 2);
    }

    #[test]
    fn byte_order_parses_case_insensitively() {
        assert_eq!("cdab".parse::<ByteOrder>().unwrap(), ByteOrder::Cdab);
        assert!("ACBD".parse::<ByteOrder>().is_err());
    }

    #[test]
    fn quality_value_bearing() {
        assert!(Quality::Good.has_value());
        assert!(Quality::Range.has_value());
        assert!(!Quality::CommFail.has_value());
        assert!(!Quality::NotImplemented.has_value());
    }

    #[test]
    fn sample_formatting() {
        let mut sample = Sample {
            channel_id: 1001,
            point_id: 10001,
            kind: PointKind::Telemetry,
            scalar: ScalarType::Uint16,
            raw: 25,
            value: 2.5,
            timestamp: Timestamp::now(),
            quality: Quality::Good,
        };
        assert_eq!(&sample.format_value()[..], b"2.500000");

        sample.scalar = ScalarType::Bool;
        sample.value = 1.0;
        assert_eq!(&sample.format_value()[..], b"1");
    }
}
