//! Point model
//!
//! Typed mapping between logical data points and protocol addresses:
//! definitions, read planning, and value decoding/encoding.

pub mod decode;
pub mod model;
pub mod point;
pub mod types;

pub use decode::{decode_group, encode_output_registers, fail_group};
pub use model::{PointModel, ReadGroup};
pub use point::{ModbusAddress, Point};
pub use types::{ByteOrder, PointKind, Quality, Sample, ScalarType, Timestamp};
