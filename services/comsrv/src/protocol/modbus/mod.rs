//! Modbus protocol implementation
//!
//! RTU and TCP framing over the standard master function codes. The PDU
//! layer is shared between both framings; the master drives the
//! request/response state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolError;

pub mod frame;
pub mod master;
pub mod pdu;

/// Registers per read request (functions 0x03/0x04).
pub const MAX_READ_REGISTERS: u16 = 125;
/// Coils or discrete inputs per read request (functions 0x01/0x02).
pub const MAX_READ_BITS: u16 = 2000;
/// Registers per write request (function 0x10).
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Coils per write request (function 0x0F).
pub const MAX_WRITE_BITS: u16 = 1968;

/// Modbus function codes supported by this master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// True for coil/discrete (bit) addressing, false for registers.
    pub fn is_bit_addressed(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }

    /// Read function covering the same address space as a write function,
    /// used for best-effort command confirmation.
    pub fn paired_read(self) -> Option<FunctionCode> {
        match self {
            FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils => {
                Some(FunctionCode::ReadCoils)
            },
            FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
                Some(FunctionCode::ReadHoldingRegisters)
            },
            _ => None,
        }
    }

    /// Per-request span limit for this function.
    pub fn max_span(self) -> u16 {
        match self {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => MAX_READ_BITS,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                MAX_READ_REGISTERS
            },
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 1,
            FunctionCode::WriteMultipleCoils => MAX_WRITE_BITS,
            FunctionCode::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(ProtocolError::Malformed(format!(
                "invalid function code 0x{other:02X}"
            ))),
        }
    }
}

/// Exception code from a device exception response, surfaced verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionCode(pub u8);

impl ExceptionCode {
    pub fn description(self) -> &'static str {
        match self.0 {
            0x01 => "illegal function",
            0x02 => "illegal data address",
            0x03 => "illegal data value",
            0x04 => "slave device failure",
            0x05 => "acknowledge",
            0x06 => "slave device busy",
            0x07 => "negative acknowledge",
            0x08 => "memory parity error",
            0x0A => "gateway path unavailable",
            0x0B => "gateway target failed to respond",
            _ => "unknown exception",
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        code.0
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_roundtrip() {
        for raw in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            let fc = FunctionCode::try_from(raw).unwrap();
            assert_eq!(u8::from(fc), raw);
        }
        assert!(FunctionCode::try_from(0x2B).is_err());
    }

    #[test]
    fn paired_reads() {
        assert_eq!(
            FunctionCode::WriteSingleCoil.paired_read(),
            Some(FunctionCode::ReadCoils)
        );
        assert_eq!(
            FunctionCode::WriteMultipleRegisters.paired_read(),
            Some(FunctionCode::ReadHoldingRegisters)
        );
        assert_eq!(FunctionCode::ReadCoils.paired_read(), None);
    }

    #[test]
    fn exception_descriptions() {
        assert_eq!(ExceptionCode(2).description(), "illegal data address");
        assert_eq!(ExceptionCode(0x42).description(), "unknown exception");
        assert_eq!(format!("{}", ExceptionCode(1)), "0x01 (illegal function)");
    }
}
