//! Sample decoding and command value encoding
//!
//! Decode pipeline per point: extract registers at the point's offset in
//! the group payload, combine bytes per byte order, interpret the scalar,
//! apply the linear transform, then range-check. The encode path runs the
//! same steps in reverse for setpoint writes.

use tracing::warn;

use super::model::ReadGroup;
use super::point::Point;
use super::types::{ByteOrder, Quality, Sample, ScalarType, Timestamp};
use super::PointModel;
use crate::error::{ComSrvError, Result};
use crate::protocol::ReadPayload;

/// Apply the byte-order permutation to four wire bytes. All four layouts
/// are involutions, so the same permutation maps wire order to canonical
/// big-endian and back.
fn permute4(bytes: [u8; 4], order: ByteOrder) -> [u8; 4] {
    let [a, b, c, d] = bytes;
    match order {
        ByteOrder::Abcd => [a, b, c, d],
        ByteOrder::Badc => [b, a, d, c],
        ByteOrder::Cdab => [c, d, a, b],
        ByteOrder::Dcba => [d, c, b, a],
    }
}

/// Apply the byte-order permutation to a single register's bytes.
fn permute2(bytes: [u8; 2], order: ByteOrder) -> [u8; 2] {
    let [a, b] = bytes;
    match order {
        ByteOrder::Abcd | ByteOrder::Cdab => [a, b],
        ByteOrder::Badc | ByteOrder::Dcba => [b, a],
    }
}

/// Combine wire registers into the canonical (big-endian) integer value.
pub fn combine_registers(registers: &[u16], order: ByteOrder) -> Result<u64> {
    match registers {
        [r] => {
            let bytes = permute2(r.to_be_bytes(), order);
            Ok(u64::from(u16::from_be_bytes(bytes)))
        },
        [hi, lo] => {
            let hi = hi.to_be_bytes();
            let lo = lo.to_be_bytes();
            let bytes = permute4([hi[0], hi[1], lo[0], lo[1]], order);
            Ok(u64::from(u32::from_be_bytes(bytes)))
        },
        other => Err(ComSrvError::internal(format!(
            "cannot combine {} registers",
            other.len()
        ))),
    }
}

/// Split a canonical integer into wire registers.
pub fn split_registers(canonical: u64, scalar: ScalarType, order: ByteOrder) -> Result<Vec<u16>> {
    match scalar.registers() {
        1 => {
            let bytes = permute2((canonical as u16).to_be_bytes(), order);
            Ok(vec![u16::from_be_bytes(bytes)])
        },
        2 => {
            let bytes = permute4((canonical as u32).to_be_bytes(), order);
            Ok(vec![
                u16::from_be_bytes([bytes[0], bytes[1]]),
                u16::from_be_bytes([bytes[2], bytes[3]]),
            ])
        },
        _ => Err(ComSrvError::NotImplemented(format!(
            "register encoding for {scalar:?}"
        ))),
    }
}

/// Interpret a canonical integer as the point's scalar type.
fn interpret(canonical: u64, scalar: ScalarType) -> f64 {
    match scalar {
        ScalarType::Bool => {
            if canonical != 0 {
                1.0
            } else {
                0.0
            }
        },
        ScalarType::Int16 => f64::from(canonical as u16 as i16),
        ScalarType::Uint16 => f64::from(canonical as u16),
        ScalarType::Int32 => f64::from(canonical as u32 as i32),
        ScalarType::Uint32 => f64::from(canonical as u32),
        ScalarType::Float32 => f64::from(f32::from_bits(canonical as u32)),
    }
}

/// Decode one point out of a group payload into `(raw, engineering)`.
fn decode_point(point: &Point, group: &ReadGroup, payload: &ReadPayload) -> Result<(u64, f64)> {
    let offset = usize::from(point.address.address - group.start);
    match payload {
        ReadPayload::Registers(registers) => {
            let span = usize::from(point.address.register_span());
            let slice = registers.get(offset..offset + span).ok_or_else(|| {
                ComSrvError::Malformed(format!(
                    "payload too short for point {} at offset {offset}",
                    point.id
                ))
            })?;
            let raw = combine_registers(slice, point.byte_order)?;
            Ok((raw, interpret(raw, point.scalar)))
        },
        ReadPayload::Coils(bits) => {
            let bit = bits.get(offset).copied().ok_or_else(|| {
                ComSrvError::Malformed(format!(
                    "payload too short for point {} at offset {offset}",
                    point.id
                ))
            })?;
            let raw = u64::from(bit);
            Ok((raw, interpret(raw, ScalarType::Bool)))
        },
    }
}

/// Decode every member of a successfully read group into samples. A point
/// whose own decode fails is reported with quality COMM_FAIL; the rest of
/// the group is unaffected.
pub fn decode_group(
    channel_id: u16,
    model: &PointModel,
    group: &ReadGroup,
    payload: &ReadPayload,
) -> Vec<Sample> {
    let timestamp = Timestamp::now();
    let mut samples = Vec::with_capacity(group.point_ids.len());
    for &point_id in &group.point_ids {
        let Some(point) = model.get(point_id) else {
            // Point removed by a hot reload while this group was in flight.
            continue;
        };
        let sample = match decode_point(point, group, payload) {
            Ok((raw, raw_value)) => {
                let value = point.to_engineering(raw_value);
                let quality = if point.in_range(value) {
                    Quality::Good
                } else {
                    Quality::Range
                };
                Sample {
                    channel_id,
                    point_id,
                    kind: point.kind,
                    scalar: point.scalar,
                    raw,
                    value,
                    timestamp,
                    quality,
                }
            },
            Err(e) => {
                warn!(channel_id, point_id, "decode failed: {e}");
                Sample {
                    channel_id,
                    point_id,
                    kind: point.kind,
                    scalar: point.scalar,
                    raw: 0,
                    value: 0.0,
                    timestamp,
                    quality: Quality::CommFail,
                }
            },
        };
        samples.push(sample);
    }
    samples
}

/// Mark every member of a failed group with the given quality.
pub fn fail_group(
    channel_id: u16,
    model: &PointModel,
    group: &ReadGroup,
    quality: Quality,
) -> Vec<Sample> {
    let timestamp = Timestamp::now();
    group
        .point_ids
        .iter()
        .filter_map(|&point_id| {
            let point = model.get(point_id)?;
            Some(Sample {
                channel_id,
                point_id,
                kind: point.kind,
                scalar: point.scalar,
                raw: 0,
                value: 0.0,
                timestamp,
                quality,
            })
        })
        .collect()
}

/// Encode a setpoint engineering value into wire registers.
pub fn encode_output_registers(point: &Point, engineering: f64) -> Result<Vec<u16>> {
    let raw = point.to_raw(engineering)?;
    let canonical: u64 = match point.scalar {
        ScalarType::Float32 => u64::from((raw as f32).to_bits()),
        ScalarType::Int16 => {
            let v = raw.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
            u64::from(v as u16)
        },
        ScalarType::Uint16 => {
            let v = raw.round().clamp(0.0, f64::from(u16::MAX)) as u16;
            u64::from(v)
        },
        ScalarType::Int32 => {
            let v = raw.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
            u64::from(v as u32)
        },
        ScalarType::Uint32 => {
            let v = raw.round().clamp(0.0, f64::from(u32::MAX)) as u32;
            u64::from(v)
        },
        ScalarType::Bool => {
            return Err(ComSrvError::NotImplemented(
                "register encoding for bool points".to_string(),
            ))
        },
    };
    split_registers(canonical, point.scalar, point.byte_order)
}
