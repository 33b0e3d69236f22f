//! Modbus PDU construction and response parsing
//!
//! Master-side only: request builders and response payload parsers for the
//! eight supported function codes. Register quantities are in big-endian
//! byte order on the wire; coil bits are packed LSB-first.

use super::super::ProtocolError;
use super::{ExceptionCode, FunctionCode};

/// Coil ON value for function 0x05.
const COIL_ON: u16 = 0xFF00;

/// Build a read request PDU (functions 0x01..0x04).
pub fn read_request(function_code: FunctionCode, start: u16, count: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

/// Build a single-write request PDU (functions 0x05/0x06). For coils the
/// value must already be `0xFF00`/`0x0000`; use [`coil_value`].
pub fn write_single_request(function_code: FunctionCode, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Wire encoding of a coil state for function 0x05.
pub fn coil_value(on: bool) -> u16 {
    if on {
        COIL_ON
    } else {
        0
    }
}

/// Build a write-multiple-registers request PDU (function 0x10).
pub fn write_multiple_registers_request(start: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FunctionCode::WriteMultipleRegisters.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Build a write-multiple-coils request PDU (function 0x0F).
pub fn write_multiple_coils_request(start: u16, values: &[bool]) -> Vec<u8> {
    let packed = pack_bits(values);
    let mut pdu = Vec::with_capacity(6 + packed.len());
    pdu.push(FunctionCode::WriteMultipleCoils.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

/// Pack bit values LSB-first into bytes.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &bit) in values.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bit values LSB-first from bytes.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] >> (i % 8) & 1 != 0)
        .collect()
}

/// Inspect the leading function code of a response PDU; surfaces device
/// exceptions and function mismatches.
pub fn check_function(expected: FunctionCode, pdu: &[u8]) -> Result<(), ProtocolError> {
    let Some(&found) = pdu.first() else {
        return Err(ProtocolError::Malformed("empty PDU".to_string()));
    };
    let expected_raw = u8::from(expected);
    if found == expected_raw | 0x80 {
        let code = pdu
            .get(1)
            .copied()
            .ok_or_else(|| ProtocolError::Malformed("truncated exception response".to_string()))?;
        return Err(ProtocolError::Exception(ExceptionCode(code)));
    }
    if found != expected_raw {
        return Err(ProtocolError::UnexpectedFunction {
            expected: expected_raw,
            found,
        });
    }
    Ok(())
}

/// Parse a register read response PDU into quantities.
pub fn parse_register_response(
    expected: FunctionCode,
    pdu: &[u8],
    count: u16,
) -> Result<Vec<u16>, ProtocolError> {
    check_function(expected, pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ProtocolError::Malformed("missing byte count".to_string()))? as usize;
    let data = &pdu[2..];
    if data.len() < byte_count || byte_count != usize::from(count) * 2 {
        return Err(ProtocolError::Malformed(format!(
            "register payload: expected {} bytes, got {byte_count}",
            count * 2
        )));
    }
    Ok(data[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parse a coil/discrete read response PDU into `count` bits.
pub fn parse_bit_response(
    expected: FunctionCode,
    pdu: &[u8],
    count: u16,
) -> Result<Vec<bool>, ProtocolError> {
    check_function(expected, pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ProtocolError::Malformed("missing byte count".to_string()))? as usize;
    let data = &pdu[2..];
    if data.len() < byte_count || byte_count < usize::from(count).div_ceil(8) {
        return Err(ProtocolError::Malformed(format!(
            "bit payload: {byte_count} bytes cannot hold {count} bits"
        )));
    }
    Ok(unpack_bits(&data[..byte_count], usize::from(count)))
}

/// Validate a write acknowledgement PDU (echo of address/value or
/// address/quantity).
pub fn parse_write_ack(expected: FunctionCode, pdu: &[u8]) -> Result<(), ProtocolError> {
    check_function(expected, pdu)?;
    if pdu.len() < 5 {
        return Err(ProtocolError::Malformed(format!(
            "write ack too short: {} bytes",
            pdu.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_layout() {
        let pdu = read_request(FunctionCode::ReadHoldingRegisters, 0x0001, 0x000A);
        assert_eq!(pdu, vec![0x03, 0x00, 0x01, 0x00, 0x0A]);
    }

    #[test]
    fn write_single_coil_layout() {
        let pdu = write_single_request(FunctionCode::WriteSingleCoil, 0x0013, coil_value(true));
        assert_eq!(pdu, vec![0x05, 0x00, 0x13, 0xFF, 0x00]);
        let pdu = write_single_request(FunctionCode::WriteSingleCoil, 0x0013, coil_value(false));
        assert_eq!(pdu, vec![0x05, 0x00, 0x13, 0x00, 0x00]);
    }

    #[test]
    fn write_multiple_registers_layout() {
        let pdu = write_multiple_registers_request(0x00C8, &[0x4048, 0xF5C3]);
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0xC8, 0x00, 0x02, 0x04, 0x40, 0x48, 0xF5, 0xC3]
        );
    }

    #[test]
    fn write_multiple_coils_layout() {
        let pdu = write_multiple_coils_request(0x0013, &[true, false, true, true]);
        assert_eq!(pdu, vec![0x0F, 0x00, 0x13, 0x00, 0x04, 0x01, 0x0D]);
    }

    #[test]
    fn bit_packing_roundtrip() {
        let bits = vec![true, false, true, false, false, true, false, true, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0xA5, 0x01]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn register_response_parses() {
        let pdu = [0x03, 0x04, 0x00, 0x19, 0x12, 0x34];
        let regs =
            parse_register_response(FunctionCode::ReadHoldingRegisters, &pdu, 2).unwrap();
        assert_eq!(regs, vec![0x0019, 0x1234]);
    }

    #[test]
    fn register_response_count_mismatch_is_malformed() {
        let pdu = [0x03, 0x02, 0x00, 0x19];
        assert!(matches!(
            parse_register_response(FunctionCode::ReadHoldingRegisters, &pdu, 2),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn bit_response_parses_a5() {
        let pdu = [0x02, 0x01, 0xA5];
        let bits = parse_bit_response(FunctionCode::ReadDiscreteInputs, &pdu, 8).unwrap();
        let expected: Vec<bool> = [1u8, 0, 1, 0, 0, 1, 0, 1].iter().map(|&b| b != 0).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn exception_response_surfaces_code() {
        let pdu = [0x83, 0x02];
        match parse_register_response(FunctionCode::ReadHoldingRegisters, &pdu, 1) {
            Err(ProtocolError::Exception(code)) => assert_eq!(code.0, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn function_mismatch_detected() {
        let pdu = [0x04, 0x02, 0x00, 0x19];
        assert!(matches!(
            parse_register_response(FunctionCode::ReadHoldingRegisters, &pdu, 1),
            Err(ProtocolError::UnexpectedFunction { .. })
        ));
    }
}
