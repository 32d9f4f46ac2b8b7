//! Request dispatch against the shared register store.
//!
//! Supported function codes:
//! - Read Holding Registers (Function 0x03)
//! - Write Single Register (Function 0x06)
//! - Write Multiple Registers (Function 0x10)
//!
//! Every other function code is answered with Illegal Function (0x01).
//! Each frame produces exactly one reply, and any register mutation is
//! applied before the reply is composed.

use crate::frame::{Frame, MbapHeader};
use crate::store::{RegisterStore, Word};
use mbtcp_common::config::CompatConfig;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Most registers a single Read Holding Registers request may ask for.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Most registers a single Write Multiple Registers request may carry.
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// Bit set in the function code of an exception reply.
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes served by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Parse a function code from a byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// Modbus exception codes produced by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
}

impl ExceptionCode {
    /// Parse an exception code from a byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            _ => None,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
        }
    }
}

/// Layout of exception replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionFraming {
    /// Full MBAP prefix (transaction id echoed, protocol 0, length 3) before the exception bytes.
    #[default]
    Mbap,
    /// Only unit id, flagged function code and exception code, as legacy servers send.
    Bare,
}

/// Wire behavior switches for the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// How exception replies are framed.
    pub exception_framing: ExceptionFraming,
    /// Exception returned when a Write Multiple Registers byte count disagrees with its quantity.
    pub byte_count_mismatch: ExceptionCode,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            exception_framing: ExceptionFraming::Mbap,
            byte_count_mismatch: ExceptionCode::IllegalDataAddress,
        }
    }
}

impl From<&CompatConfig> for DispatchOptions {
    fn from(compat: &CompatConfig) -> Self {
        Self {
            exception_framing: if compat.bare_exception_frames {
                ExceptionFraming::Bare
            } else {
                ExceptionFraming::Mbap
            },
            byte_count_mismatch: if compat.conventional_exception_codes {
                ExceptionCode::IllegalDataValue
            } else {
                ExceptionCode::IllegalDataAddress
            },
        }
    }
}

/// A request PDU decoded into its function-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// 0x03: read `quantity` registers from `start`.
    ReadHoldingRegisters {
        /// First register.
        start: u16,
        /// Number of registers.
        quantity: u16,
    },
    /// 0x06: write `value` to `address`.
    WriteSingleRegister {
        /// Target register.
        address: u16,
        /// New value.
        value: Word,
    },
    /// 0x10: write `quantity` registers from `start`.
    WriteMultipleRegisters {
        /// First register.
        start: u16,
        /// Number of registers.
        quantity: u16,
        /// Declared number of value bytes.
        byte_count: u8,
        /// Value bytes as received (may be shorter than `byte_count` on a truncated frame).
        data: &'a [u8],
    },
    /// Any other function code.
    Unsupported(u8),
}

impl<'a> Request<'a> {
    /// Decode a PDU (function code first).
    ///
    /// # Errors
    ///
    /// Returns [`ExceptionCode::IllegalDataValue`] if a supported function's
    /// fixed fields are missing.
    pub fn parse(pdu: &'a [u8]) -> Result<Self, ExceptionCode> {
        let Some((&function_code, body)) = pdu.split_first() else {
            return Err(ExceptionCode::IllegalDataValue);
        };

        let Some(function) = FunctionCode::from_byte(function_code) else {
            return Ok(Self::Unsupported(function_code));
        };

        if body.len() < 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let first = u16::from_be_bytes([body[0], body[1]]);
        let second = u16::from_be_bytes([body[2], body[3]]);

        match function {
            FunctionCode::ReadHoldingRegisters => Ok(Self::ReadHoldingRegisters {
                start: first,
                quantity: second,
            }),
            FunctionCode::WriteSingleRegister => Ok(Self::WriteSingleRegister {
                address: first,
                value: second,
            }),
            FunctionCode::WriteMultipleRegisters => {
                let (&byte_count, data) = body[4..]
                    .split_first()
                    .ok_or(ExceptionCode::IllegalDataValue)?;
                Ok(Self::WriteMultipleRegisters {
                    start: first,
                    quantity: second,
                    byte_count,
                    data,
                })
            }
        }
    }
}

/// Encoded reply for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Bytes to write to the connection.
    pub bytes: Vec<u8>,
    /// Exception carried by the reply, if any.
    pub exception: Option<ExceptionCode>,
}

enum Outcome {
    /// Reply with this PDU behind a fresh MBAP header.
    Pdu(Vec<u8>),
    /// Reply with the request frame unchanged.
    Echo,
}

/// Executes request frames against a shared [`RegisterStore`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<RegisterStore>,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Create a dispatcher over `store`.
    #[must_use]
    pub fn new(store: Arc<RegisterStore>, options: DispatchOptions) -> Self {
        Self { store, options }
    }

    /// The store requests are executed against.
    #[must_use]
    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    /// Process one frame and produce its reply.
    #[must_use]
    pub fn dispatch(&self, frame: &Frame) -> Reply {
        let header = frame.header();
        let function_code = frame.function_code();

        if header.protocol_id != 0 {
            debug!(
                transaction_id = header.transaction_id,
                protocol_id = header.protocol_id,
                "Non-Modbus protocol id accepted"
            );
        }

        let outcome = Request::parse(frame.pdu()).and_then(|request| self.execute(&request));

        match outcome {
            Ok(Outcome::Echo) => Reply {
                bytes: frame.as_bytes().to_vec(),
                exception: None,
            },
            Ok(Outcome::Pdu(pdu)) => {
                let resp_header = MbapHeader::for_pdu(
                    header.transaction_id,
                    header.protocol_id,
                    header.unit_id,
                    pdu.len(),
                );
                let mut bytes = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
                bytes.extend_from_slice(&resp_header.to_bytes());
                bytes.extend_from_slice(&pdu);
                Reply {
                    bytes,
                    exception: None,
                }
            }
            Err(code) => {
                debug!(
                    transaction_id = header.transaction_id,
                    function_code,
                    exception = %code,
                    "Request rejected"
                );
                Reply {
                    bytes: self.exception_frame(&header, function_code, code),
                    exception: Some(code),
                }
            }
        }
    }

    fn execute(&self, request: &Request<'_>) -> Result<Outcome, ExceptionCode> {
        trace!(?request, "Executing request");
        match *request {
            Request::ReadHoldingRegisters { start, quantity } => self
                .read_holding_registers(start, quantity)
                .map(Outcome::Pdu),
            Request::WriteSingleRegister { address, value } => self
                .write_single_register(address, value)
                .map(|()| Outcome::Echo),
            Request::WriteMultipleRegisters {
                start,
                quantity,
                byte_count,
                data,
            } => self
                .write_multiple_registers(start, quantity, byte_count, data)
                .map(Outcome::Pdu),
            Request::Unsupported(_) => Err(ExceptionCode::IllegalFunction),
        }
    }

    fn range_fits(&self, start: u16, quantity: u16) -> bool {
        usize::from(start) + usize::from(quantity) <= self.store.len()
    }

    /// Handle Read Holding Registers (0x03).
    fn read_holding_registers(&self, start: u16, quantity: u16) -> Result<Vec<u8>, ExceptionCode> {
        if !self.range_fits(start, quantity) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        if quantity == 0 || quantity > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let registers = self
            .store
            .read_range(usize::from(start), usize::from(quantity))
            .ok_or(ExceptionCode::IllegalDataAddress)?;

        let byte_count = registers.len() * 2;
        let mut pdu = Vec::with_capacity(2 + byte_count);
        pdu.push(FunctionCode::ReadHoldingRegisters as u8);
        // quantity <= 125, so the byte count fits in one byte
        #[allow(clippy::cast_possible_truncation)]
        pdu.push(byte_count as u8);
        for reg in registers {
            pdu.extend_from_slice(&reg.to_be_bytes());
        }
        Ok(pdu)
    }

    /// Handle Write Single Register (0x06).
    fn write_single_register(&self, address: u16, value: Word) -> Result<(), ExceptionCode> {
        self.store
            .set(usize::from(address), value)
            .map_err(|_| ExceptionCode::IllegalDataAddress)
    }

    /// Handle Write Multiple Registers (0x10).
    fn write_multiple_registers(
        &self,
        start: u16,
        quantity: u16,
        byte_count: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, ExceptionCode> {
        if !self.range_fits(start, quantity) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        if usize::from(byte_count) != usize::from(quantity) * 2 {
            return Err(self.options.byte_count_mismatch);
        }
        if quantity == 0 || quantity > MAX_WRITE_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let Some(data) = data.get(..usize::from(byte_count)) else {
            return Err(ExceptionCode::IllegalDataValue);
        };

        let values: Vec<Word> = data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.store
            .write_range(usize::from(start), &values)
            .map_err(|_| ExceptionCode::IllegalDataAddress)?;

        // Response: function code, start address, quantity
        let mut pdu = Vec::with_capacity(5);
        pdu.push(FunctionCode::WriteMultipleRegisters as u8);
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        Ok(pdu)
    }

    fn exception_frame(&self, header: &MbapHeader, function_code: u8, code: ExceptionCode) -> Vec<u8> {
        let body = [header.unit_id, function_code | EXCEPTION_FLAG, code as u8];
        match self.options.exception_framing {
            ExceptionFraming::Bare => body.to_vec(),
            ExceptionFraming::Mbap => {
                let resp_header = MbapHeader::for_pdu(header.transaction_id, 0, header.unit_id, 2);
                let mut bytes = Vec::with_capacity(MbapHeader::SIZE + 2);
                bytes.extend_from_slice(&resp_header.to_bytes());
                bytes.extend_from_slice(&body[1..]);
                bytes
            }
        }
    }
}
