//! Modbus TCP protocol constants
//!
//! Frame sizes and quantity limits from the Modbus Application Protocol.
//! The PDU limit of 253 bytes is inherited from the serial line ADU
//! (256 bytes minus slave address and CRC) and applies to TCP too.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Bytes that precede the length-delimited part of an MBAP frame:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_PREFIX_LEN: usize = 6;

/// Full MBAP header length including the Unit ID byte
pub const MBAP_HEADER_LEN: usize = MBAP_PREFIX_LEN + 1;

/// Maximum PDU (function code + data) size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Smallest meaningful MBAP length field (Unit ID + function code)
pub const MIN_MBAP_LENGTH: usize = 2;

/// Largest complete Modbus TCP frame on the wire
pub const MAX_ADU_SIZE: usize = MBAP_PREFIX_LEN + MAX_MBAP_LENGTH;

/// Protocol identifier carried by every Modbus TCP frame
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Wire value of an ON coil for FC05
pub const COIL_ON: u16 = 0xFF00;
/// Wire value of an OFF coil for FC05
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Quantity Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: FC(1) + byte count(1) + N*2 <= 253, so N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16
///
/// Request PDU: FC(1) + address(2) + quantity(2) + byte count(1) + N*2 <= 253,
/// so N <= 123.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum number of bits for FC01/FC02
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum number of coils for FC15 (0x7B0)
pub const MAX_WRITE_COILS: u16 = 1968;

/// Human readable name of a function code, exception bit ignored
pub fn function_code_name(fc: u8) -> &'static str {
    match fc & !EXCEPTION_FLAG {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_COIL => "Write Single Coil",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}
