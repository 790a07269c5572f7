//! Modbus TCP framing and codec
//!
//! Protocol core used by the gateway service:
//!
//! ```text
//! ems-modbus
//!     ├── MbapFramer   (byte stream -> complete MBAP frames, tokio-util codec)
//!     ├── Adu          (MBAP header + PDU encode/decode and validation)
//!     ├── Request      (FC01-06/15/16 request PDUs, response parsing)
//!     └── ModbusPdu    (stack allocated PDU buffer + builder)
//! ```
//!
//! Connection handling and transaction bookkeeping live in the service; this
//! crate does no I/O.

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod pdu;

pub use codec::{exception_pdu, Request, Response};
pub use error::{ExceptionCode, ProtocolError, Result};
pub use frame::{Adu, MbapFramer, MbapHeader};
pub use pdu::{ModbusPdu, PduBuilder};

pub use constants::{MAX_ADU_SIZE, MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN};
