//! Request/response PDU codec
//!
//! Builds request PDUs for FC01-06/15/16 and parses the matching responses.
//! Response parsing always happens against the request that produced it, so
//! echo fields and byte counts can be checked.

use crate::constants::*;
use crate::error::{ExceptionCode, ProtocolError, Result};
use crate::pdu::{pack_bits, unpack_bits, ModbusPdu, PduBuilder};

/// A Modbus request, without addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

/// A successfully parsed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    DiscreteInputs(Vec<bool>),
    HoldingRegisters(Vec<u16>),
    InputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, quantity: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
}

impl Request {
    /// Build a read request from a raw function code (FC01-04)
    pub fn read(function_code: u8, address: u16, quantity: u16) -> Result<Self> {
        let request = match function_code {
            FC_READ_COILS => Request::ReadCoils { address, quantity },
            FC_READ_DISCRETE_INPUTS => Request::ReadDiscreteInputs { address, quantity },
            FC_READ_HOLDING_REGISTERS => Request::ReadHoldingRegisters { address, quantity },
            FC_READ_INPUT_REGISTERS => Request::ReadInputRegisters { address, quantity },
            other => return Err(ProtocolError::UnsupportedFunction(other)),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => FC_READ_COILS,
            Request::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            Request::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            Request::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            Request::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Request::ReadCoils { address, .. }
            | Request::ReadDiscreteInputs { address, .. }
            | Request::ReadHoldingRegisters { address, .. }
            | Request::ReadInputRegisters { address, .. }
            | Request::WriteSingleCoil { address, .. }
            | Request::WriteSingleRegister { address, .. }
            | Request::WriteMultipleCoils { address, .. }
            | Request::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of bits or registers addressed
    pub fn quantity(&self) -> u16 {
        match self {
            Request::ReadCoils { quantity, .. }
            | Request::ReadDiscreteInputs { quantity, .. }
            | Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => *quantity,
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => 1,
            Request::WriteMultipleCoils { values, .. } => values.len() as u16,
            Request::WriteMultipleRegisters { values, .. } => values.len() as u16,
        }
    }

    pub fn is_write(&self) -> bool {
        self.function_code() >= FC_WRITE_SINGLE_COIL
    }

    /// Check quantity limits and the address range
    pub fn validate(&self) -> Result<()> {
        let fc = self.function_code();
        let (count, max) = match self {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                (*quantity as usize, MAX_READ_BITS)
            },
            Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => {
                (*quantity as usize, MAX_READ_REGISTERS)
            },
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => return Ok(()),
            Request::WriteMultipleCoils { values, .. } => (values.len(), MAX_WRITE_COILS),
            Request::WriteMultipleRegisters { values, .. } => (values.len(), MAX_WRITE_REGISTERS),
        };

        if count == 0 || count > max as usize {
            return Err(ProtocolError::InvalidQuantity {
                function_code: fc,
                quantity: count,
                max,
            });
        }

        let address = self.address();
        if address as usize + count > 0x1_0000 {
            return Err(ProtocolError::AddressOverflow {
                address,
                quantity: count as u16,
            });
        }
        Ok(())
    }

    /// Encode as a request PDU
    pub fn to_pdu(&self) -> Result<ModbusPdu> {
        self.validate()?;
        let builder = PduBuilder::new()
            .function_code(self.function_code())?
            .u16(self.address())?;

        let pdu = match self {
            Request::ReadCoils { quantity, .. }
            | Request::ReadDiscreteInputs { quantity, .. }
            | Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => builder.u16(*quantity)?.build(),
            Request::WriteSingleCoil { value, .. } => builder
                .u16(if *value { COIL_ON } else { COIL_OFF })?
                .build(),
            Request::WriteSingleRegister { value, .. } => builder.u16(*value)?.build(),
            Request::WriteMultipleCoils { values, .. } => builder
                .u16(values.len() as u16)?
                .packed_bits(values)?
                .build(),
            Request::WriteMultipleRegisters { values, .. } => builder
                .u16(values.len() as u16)?
                .registers(values)?
                .build(),
        };
        Ok(pdu)
    }

    /// Decode a request PDU (server side)
    pub fn from_pdu(pdu: &ModbusPdu) -> Result<Self> {
        let fc = pdu.function_code().ok_or(ProtocolError::EmptyPdu)?;
        let field = |offset: usize| {
            pdu.payload_u16(offset).ok_or_else(|| {
                ProtocolError::MalformedResponse(format!("request FC{:02X} truncated", fc))
            })
        };
        let address = field(0)?;

        let request = match fc {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS => return Request::read(fc, address, field(2)?),
            FC_WRITE_SINGLE_COIL => Request::WriteSingleCoil {
                address,
                value: match field(2)? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ProtocolError::MalformedResponse(format!(
                            "invalid coil value {:04X}",
                            other
                        )))
                    },
                },
            },
            FC_WRITE_SINGLE_REGISTER => Request::WriteSingleRegister {
                address,
                value: field(2)?,
            },
            FC_WRITE_MULTIPLE_COILS => {
                let quantity = field(2)? as usize;
                let data = counted_bytes(pdu.payload(), 4, quantity.div_ceil(8))?;
                Request::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, quantity),
                }
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let quantity = field(2)? as usize;
                let data = counted_bytes(pdu.payload(), 4, quantity * 2)?;
                Request::WriteMultipleRegisters {
                    address,
                    values: be_registers(data),
                }
            },
            other => return Err(ProtocolError::UnsupportedFunction(other)),
        };
        request.validate()?;
        Ok(request)
    }

    /// Parse the response PDU returned for this request
    pub fn parse_response(&self, pdu: &ModbusPdu) -> Result<Response> {
        let expected = self.function_code();
        let fc = pdu.function_code().ok_or(ProtocolError::EmptyPdu)?;

        if fc == expected | EXCEPTION_FLAG {
            let exception = pdu.exception_code().ok_or_else(|| {
                ProtocolError::MalformedResponse("exception response without code".to_string())
            })?;
            return Err(ProtocolError::Exception {
                function_code: expected,
                exception,
            });
        }
        if fc != expected {
            return Err(ProtocolError::FunctionMismatch {
                expected,
                actual: fc,
            });
        }

        let payload = pdu.payload();
        match self {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                let count = *quantity as usize;
                let data = counted_bytes(payload, 0, count.div_ceil(8))?;
                let bits = unpack_bits(data, count);
                Ok(if expected == FC_READ_COILS {
                    Response::Coils(bits)
                } else {
                    Response::DiscreteInputs(bits)
                })
            },
            Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => {
                let data = counted_bytes(payload, 0, *quantity as usize * 2)?;
                let registers = be_registers(data);
                Ok(if expected == FC_READ_HOLDING_REGISTERS {
                    Response::HoldingRegisters(registers)
                } else {
                    Response::InputRegisters(registers)
                })
            },
            Request::WriteSingleCoil { address, value } => {
                let (echo_addr, echo_value) = echo_fields(pdu)?;
                check_echo("address", *address, echo_addr)?;
                check_echo("value", if *value { COIL_ON } else { COIL_OFF }, echo_value)?;
                Ok(Response::WriteSingleCoil {
                    address: *address,
                    value: *value,
                })
            },
            Request::WriteSingleRegister { address, value } => {
                let (echo_addr, echo_value) = echo_fields(pdu)?;
                check_echo("address", *address, echo_addr)?;
                check_echo("value", *value, echo_value)?;
                Ok(Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                })
            },
            Request::WriteMultipleCoils { address, values } => {
                let (echo_addr, echo_qty) = echo_fields(pdu)?;
                check_echo("address", *address, echo_addr)?;
                check_echo("quantity", values.len() as u16, echo_qty)?;
                Ok(Response::WriteMultipleCoils {
                    address: *address,
                    quantity: echo_qty,
                })
            },
            Request::WriteMultipleRegisters { address, values } => {
                let (echo_addr, echo_qty) = echo_fields(pdu)?;
                check_echo("address", *address, echo_addr)?;
                check_echo("quantity", values.len() as u16, echo_qty)?;
                Ok(Response::WriteMultipleRegisters {
                    address: *address,
                    quantity: echo_qty,
                })
            },
        }
    }
}

impl Response {
    pub fn function_code(&self) -> u8 {
        match self {
            Response::Coils(_) => FC_READ_COILS,
            Response::DiscreteInputs(_) => FC_READ_DISCRETE_INPUTS,
            Response::HoldingRegisters(_) => FC_READ_HOLDING_REGISTERS,
            Response::InputRegisters(_) => FC_READ_INPUT_REGISTERS,
            Response::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            Response::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            Response::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            Response::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Register values of a FC03/FC04 response
    pub fn registers(&self) -> Option<&[u16]> {
        match self {
            Response::HoldingRegisters(regs) | Response::InputRegisters(regs) => Some(regs),
            _ => None,
        }
    }

    /// Bit values of a FC01/FC02 response
    pub fn bits(&self) -> Option<&[bool]> {
        match self {
            Response::Coils(bits) | Response::DiscreteInputs(bits) => Some(bits),
            _ => None,
        }
    }

    /// Encode as a response PDU (server side)
    pub fn to_pdu(&self) -> Result<ModbusPdu> {
        let builder = PduBuilder::new().function_code(self.function_code())?;
        let pdu = match self {
            Response::Coils(bits) | Response::DiscreteInputs(bits) => {
                builder.packed_bits(bits)?.build()
            },
            Response::HoldingRegisters(regs) | Response::InputRegisters(regs) => {
                builder.registers(regs)?.build()
            },
            Response::WriteSingleCoil { address, value } => builder
                .u16(*address)?
                .u16(if *value { COIL_ON } else { COIL_OFF })?
                .build(),
            Response::WriteSingleRegister { address, value } => {
                builder.u16(*address)?.u16(*value)?.build()
            },
            Response::WriteMultipleCoils { address, quantity }
            | Response::WriteMultipleRegisters { address, quantity } => {
                builder.u16(*address)?.u16(*quantity)?.build()
            },
        };
        Ok(pdu)
    }
}

/// Exception response PDU for `function_code`
pub fn exception_pdu(function_code: u8, exception: ExceptionCode) -> Result<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(function_code | EXCEPTION_FLAG)?
        .byte(exception.code())?
        .build())
}

/// Byte-count prefixed data starting at `offset`, checked against `expected` bytes
fn counted_bytes(payload: &[u8], offset: usize, expected: usize) -> Result<&[u8]> {
    let byte_count = *payload.get(offset).ok_or_else(|| {
        ProtocolError::MalformedResponse("missing byte count".to_string())
    })? as usize;

    if byte_count != expected {
        return Err(ProtocolError::MalformedResponse(format!(
            "byte count {} does not match expected {}",
            byte_count, expected
        )));
    }

    let data = &payload[offset + 1..];
    if data.len() != byte_count {
        return Err(ProtocolError::MalformedResponse(format!(
            "byte count {} but {} data bytes",
            byte_count,
            data.len()
        )));
    }
    Ok(data)
}

fn be_registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect()
}

fn echo_fields(pdu: &ModbusPdu) -> Result<(u16, u16)> {
    if pdu.payload().len() != 4 {
        return Err(ProtocolError::MalformedResponse(format!(
            "write response payload is {} bytes, expected 4",
            pdu.payload().len()
        )));
    }
    // Length checked above
    Ok((
        pdu.payload_u16(0).unwrap_or_default(),
        pdu.payload_u16(2).unwrap_or_default(),
    ))
}

fn check_echo(field: &str, expected: u16, actual: u16) -> Result<()> {
    if expected != actual {
        return Err(ProtocolError::MalformedResponse(format!(
            "echoed {} {:04X} does not match request {:04X}",
            field, actual, expected
        )));
    }
    Ok(())
}
