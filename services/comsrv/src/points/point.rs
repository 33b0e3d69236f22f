//! Point definitions and validation

use serde::{Deserialize, Serialize};

use super::types::{ByteOrder, PointKind, ScalarType};
use crate::config::PointRow;
use crate::error::{ComSrvError, Result};
use crate::protocol::FunctionCode;

/// Protocol address record for a Modbus point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusAddress {
    pub unit_id: u8,
    pub function_code: FunctionCode,
    pub address: u16,
    pub bit_length: u16,
}

impl ModbusAddress {
    /// Registers spanned by this address (zero for bit addressing).
    pub fn register_span(&self) -> u16 {
        if self.function_code.is_bit_addressed() {
            0
        } else {
            self.bit_length.div_ceil(16)
        }
    }
}

/// One logical data point belonging to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: u32,
    pub kind: PointKind,
    pub scalar: ScalarType,
    pub byte_order: ByteOrder,
    pub scale: f64,
    pub offset: f64,
    pub unit: Option<String>,
    /// Validity window; values outside are still reported, tagged RANGE
    pub range: Option<(f64, f64)>,
    pub description: String,
    pub address: ModbusAddress,
}

impl Point {
    /// Engineering value from a promoted raw value.
    pub fn to_engineering(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// Raw value from an engineering value (inverse transform).
    pub fn to_raw(&self, engineering: f64) -> Result<f64> {
        if self.scale == 0.0 {
            return Err(ComSrvError::config(format!(
                "point {}: scale is zero, cannot invert transform",
                self.id
            )));
        }
        Ok((engineering - self.offset) / self.scale)
    }

    /// Whether `engineering` falls inside the configured validity window.
    pub fn in_range(&self, engineering: f64) -> bool {
        match self.range {
            Some((min, max)) => engineering >= min && engineering <= max,
            None => true,
        }
    }

    /// Enforce the kind/function-code and bit-length invariants.
    pub fn validate(&self) -> Result<()> {
        let fc = self.address.function_code;
        let legal = match self.kind {
            PointKind::Telemetry => matches!(
                fc,
                FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
            ),
            PointKind::Signal => matches!(
                fc,
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
            ),
            PointKind::Control => matches!(
                fc,
                FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils
            ),
            PointKind::Setpoint => matches!(
                fc,
                FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters
            ),
        };
        if !legal {
            return Err(ComSrvError::config(format!(
                "point {}: function code 0x{:02X} not legal for kind {:?}",
                self.id,
                u8::from(fc),
                self.kind
            )));
        }

        if self.scalar == ScalarType::Bool {
            if !fc.is_bit_addressed() {
                return Err(ComSrvError::config(format!(
                    "point {}: bool scalar requires a coil/discrete function code",
                    self.id
                )));
            }
        } else {
            if fc.is_bit_addressed() {
                return Err(ComSrvError::config(format!(
                    "point {}: scalar {:?} requires a register function code",
                    self.id, self.scalar
                )));
            }
            if self.address.bit_length != self.scalar.bits() {
                return Err(ComSrvError::config(format!(
                    "point {}: bit_length {} does not match scalar {:?}",
                    self.id, self.address.bit_length, self.scalar
                )));
            }
            // Function 0x06 writes one register; 32-bit setpoints need 0x10.
            if fc == FunctionCode::WriteSingleRegister && self.scalar.registers() > 1 {
                return Err(ComSrvError::config(format!(
                    "point {}: {:?} spans two registers, use function 0x10",
                    self.id, self.scalar
                )));
            }
        }

        if let Some((min, max)) = self.range {
            if min > max {
                return Err(ComSrvError::config(format!(
                    "point {}: range minimum {min} exceeds maximum {max}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

fn parse_kind(raw: &str) -> Result<PointKind> {
    match raw.to_ascii_lowercase().as_str() {
        "telemetry" => Ok(PointKind::Telemetry),
        "signal" => Ok(PointKind::Signal),
        "control" => Ok(PointKind::Control),
        "setpoint" => Ok(PointKind::Setpoint),
        other => Err(ComSrvError::config(format!("invalid point kind: {other}"))),
    }
}

fn parse_scalar(raw: &str) -> Result<ScalarType> {
    match raw.to_ascii_lowercase().as_str() {
        "bool" => Ok(ScalarType::Bool),
        "int16" => Ok(ScalarType::Int16),
        "uint16" => Ok(ScalarType::Uint16),
        "int32" => Ok(ScalarType::Int32),
        "uint32" => Ok(ScalarType::Uint32),
        "float32" => Ok(ScalarType::Float32),
        other => Err(ComSrvError::config(format!("invalid scalar type: {other}"))),
    }
}

impl TryFrom<&PointRow> for Point {
    type Error = ComSrvError;

    fn try_from(row: &PointRow) -> Result<Self> {
        let kind = parse_kind(&row.kind)
            .map_err(|e| ComSrvError::config(format!("point {}: {e}", row.id)))?;
        let scalar = parse_scalar(&row.scalar_type)
            .map_err(|e| ComSrvError::config(format!("point {}: {e}", row.id)))?;
        let byte_order = match &row.byte_order {
            Some(raw) => raw
                .parse::<ByteOrder>()
                .map_err(|e| ComSrvError::config(format!("point {}: {e}", row.id)))?,
            None => ByteOrder::default(),
        };
        let function_code = FunctionCode::try_from(row.function_code).map_err(|_| {
            ComSrvError::config(format!(
                "point {}: invalid function code {}",
                row.id, row.function_code
            ))
        })?;
        let range = match (row.min, row.max) {
            (Some(min), Some(max)) => Some((min, max)),
            (None, None) => None,
            _ => {
                return Err(ComSrvError::config(format!(
                    "point {}: range requires both min and max",
                    row.id
                )))
            },
        };
        let point = Point {
            id: row.id,
            kind,
            scalar,
            byte_order,
            scale: row.scale.unwrap_or(1.0),
            offset: row.offset.unwrap_or(0.0),
            unit: row.unit.clone(),
            range,
            description: row.description.clone().unwrap_or_default(),
            address: ModbusAddress {
                unit_id: row.unit_id,
                function_code,
                address: row.address,
                bit_length: row.bit_length.unwrap_or_else(|| scalar.bits()),
            },
        };
        point.validate()?;
        Ok(point)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::input_point;
    use super::*;

    #[test]
    fn transform_roundtrip() {
        let mut p = input_point(1, PointKind::Telemetry, FunctionCode::ReadHoldingRegisters, 0);
        p.scale = 0.1;
        p.offset = 10.0;
        let eng = p.to_engineering(250.0);
        assert!((eng - 35.0).abs() < 1e-9);
        let raw = p.to_raw(eng).unwrap();
        assert!((raw - 250.0).abs() < 1e-9);
    }

    #[test]
    fn zero_scale_cannot_invert() {
        let mut p = input_point(1, PointKind::Telemetry, FunctionCode::ReadHoldingRegisters, 0);
        p.scale = 0.0;
        assert!(p.to_raw(1.0).is_err());
    }

    #[test]
    fn kind_function_legality() {
        let p = input_point(1, PointKind::Telemetry, FunctionCode::ReadCoils, 0);
        assert!(p.validate().is_err());

        let p = input_point(2, PointKind::Signal, FunctionCode::ReadDiscreteInputs, 0);
        p.validate().unwrap();

        let p = input_point(3, PointKind::Control, FunctionCode::ReadHoldingRegisters, 0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn bit_length_must_match_scalar() {
        let mut p = input_point(1, PointKind::Telemetry, FunctionCode::ReadHoldingRegisters, 0);
        p.scalar = ScalarType::Float32;
        p.address.bit_length = 16;
        assert!(p.validate().is_err());
        p.address.bit_length = 32;
        p.validate().unwrap();
    }

    #[test]
    fn single_register_write_rejects_wide_scalars() {
        let mut p = input_point(1, PointKind::Setpoint, FunctionCode::WriteSingleRegister, 0);
        p.kind = PointKind::Setpoint;
        p.scalar = ScalarType::Float32;
        p.address.bit_length = 32;
        assert!(p.validate().is_err());
    }

    #[test]
    fn row_conversion_applies_defaults() {
        let row = PointRow {
            id: 10001,
            kind: "telemetry".to_string(),
            scalar_type: "uint16".to_string(),
            byte_order: None,
            scale: None,
            offset: None,
            unit: None,
            min: None,
            max: None,
            description: None,
            unit_id: 1,
            function_code: 3,
            address: 100,
            bit_length: None,
        };
        let point = Point::try_from(&row).unwrap();
        assert_eq!(point.byte_order, ByteOrder::Abcd);
        assert_eq!(point.scale, 1.0);
        assert_eq!(point.offset, 0.0);
        assert_eq!(point.address.bit_length, 16);
    }

    #[test]
    fn row_with_half_range_rejected() {
        let row = PointRow {
            id: 1,
            kind: "telemetry".to_string(),
            scalar_type: "uint16".to_string(),
            byte_order: None,
            scale: None,
            offset: None,
            unit: None,
            min: Some(0.0),
            max: None,
            description: None,
            unit_id: 1,
            function_code: 3,
            address: 0,
            bit_length: None,
        };
        assert!(Point::try_from(&row).is_err());
    }
}
