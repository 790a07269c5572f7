//! Modbus TCP framing
//!
//! ```text
//! | Transaction ID (2) | Protocol ID (2) | Length (2) | Unit ID (1) | PDU (N) |
//!                                         \________ Length = 1 + N ________/
//! ```
//!
//! [`MbapFramer`] only cuts the byte stream into frames using the length
//! field. [`Adu::decode`] then validates the frame contents, so a bad frame
//! can be dropped without losing stream synchronisation.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::constants::{
    MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MBAP_PREFIX_LEN, MIN_MBAP_LENGTH, MODBUS_PROTOCOL_ID,
};
use crate::error::{ProtocolError, Result};
use crate::pdu::ModbusPdu;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Unit ID + PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the first 7 bytes of a frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort {
                len: data.len(),
                min: MBAP_HEADER_LEN,
            });
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }
}

/// Application data unit: MBAP addressing + PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl Adu {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    pub fn header(&self) -> MbapHeader {
        MbapHeader {
            transaction_id: self.transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (self.pdu.len() + 1) as u16,
            unit_id: self.unit_id,
        }
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        MBAP_HEADER_LEN + self.pdu.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.header().write(dst);
        dst.put_slice(self.pdu.as_slice());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        debug!(
            "Building TCP frame: trans_id={:04X}, unit_id={}, FC={:02X}, PDU_len={}",
            self.transaction_id,
            self.unit_id,
            self.pdu.function_code().unwrap_or(0),
            self.pdu.len()
        );
        buf.freeze()
    }

    /// Decode one complete frame, validating the MBAP header against its contents
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = MbapHeader::parse(frame)?;

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ProtocolError::InvalidProtocolId(header.protocol_id));
        }

        let declared = header.length as usize;
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&declared) {
            return Err(ProtocolError::InvalidLength(declared));
        }

        let actual = frame.len() - MBAP_PREFIX_LEN;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        let pdu = ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN..])?;
        if pdu.is_empty() {
            return Err(ProtocolError::EmptyPdu);
        }

        Ok(Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu,
        })
    }

    /// Check the responding unit against the unit the request was sent to
    pub fn expect_unit(&self, unit_id: u8) -> Result<()> {
        if self.unit_id != unit_id {
            return Err(ProtocolError::UnitMismatch {
                expected: unit_id,
                actual: self.unit_id,
            });
        }
        Ok(())
    }
}

/// Splits a TCP byte stream into complete MBAP frames
///
/// A length field outside `2..=254` cannot belong to a valid frame, which
/// means the stream lost synchronisation. That is reported as an I/O error
/// so the connection gets re-established.
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapFramer;

impl Decoder for MbapFramer {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < MBAP_PREFIX_LEN {
            src.reserve(MBAP_PREFIX_LEN - src.len());
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[4], src[5]]) as usize;
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::InvalidLength(length),
            ));
        }

        let total = MBAP_PREFIX_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for MbapFramer {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
