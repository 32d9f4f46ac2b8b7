//! MBAP framing.
//!
//! A Modbus/TCP frame is a 6-byte prefix (transaction id, protocol id,
//! length) followed by `length` bytes: the unit id and the PDU.
//!
//! ```text
//! 0      2      4      6    7
//! +------+------+------+----+-----------------+
//! | txid | prot | len  | uid| function | data |
//! +------+------+------+----+-----------------+
//! ```

use crate::connection::Connection;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::trace;

/// Bytes before the unit id: transaction id, protocol id, length.
pub const PREFIX_LEN: usize = 6;

/// Smallest usable length field: unit id plus function code.
pub const MIN_LENGTH: u16 = 2;

/// Largest length field: unit id plus the 253-byte maximum PDU.
pub const MAX_LENGTH: u16 = 254;

/// Largest complete frame on the wire.
pub const MAX_FRAME_LEN: usize = PREFIX_LEN + MAX_LENGTH as usize;

/// Reasons a frame could not be produced. Every variant ends the session.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed the stream, possibly in the middle of a frame.
    #[error("connection closed by peer")]
    Closed,

    /// Server stop was requested while waiting for data.
    #[error("server stop requested")]
    Stopped,

    /// Length field outside `MIN_LENGTH..=MAX_LENGTH`.
    #[error("invalid MBAP length field {0} (allowed 2..=254)")]
    InvalidLength(u16),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier (echoed by the server).
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    pub protocol_id: u16,
    /// Number of bytes following the length field.
    pub length: u16,
    /// Unit identifier.
    pub unit_id: u8,
}

impl MbapHeader {
    /// MBAP header size in bytes, including the unit id.
    pub const SIZE: usize = 7;

    /// Header announcing a PDU of `pdu_len` bytes.
    ///
    /// `pdu_len` never exceeds the 253-byte PDU limit in this crate.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_pdu(transaction_id: u16, protocol_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id,
            length: (pdu_len + 1) as u16, // +1 for unit_id
            unit_id,
        }
    }

    /// Parse a header from the first [`MbapHeader::SIZE`] bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Serialize the header to bytes (big-endian).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }
}

/// One complete request frame: prefix, unit id and PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes, checking that the length field matches the byte count.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidLength`] if the length field is out of
    /// range or disagrees with `bytes.len()`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FrameError> {
        if bytes.len() < PREFIX_LEN {
            return Err(FrameError::InvalidLength(0));
        }
        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        if !(MIN_LENGTH..=MAX_LENGTH).contains(&length)
            || bytes.len() != PREFIX_LEN + usize::from(length)
        {
            return Err(FrameError::InvalidLength(length));
        }
        Ok(Self { bytes })
    }

    /// Assemble a frame from header fields and a PDU.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidLength`] for an empty or oversized PDU.
    pub fn build(
        transaction_id: u16,
        protocol_id: u16,
        unit_id: u8,
        pdu: &[u8],
    ) -> Result<Self, FrameError> {
        let header = MbapHeader::for_pdu(transaction_id, protocol_id, unit_id, pdu.len());
        let mut bytes = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(pdu);
        Self::from_bytes(bytes)
    }

    /// Decoded MBAP header.
    #[must_use]
    pub fn header(&self) -> MbapHeader {
        // A validated frame always holds at least PREFIX_LEN + MIN_LENGTH bytes.
        MbapHeader {
            transaction_id: u16::from_be_bytes([self.bytes[0], self.bytes[1]]),
            protocol_id: u16::from_be_bytes([self.bytes[2], self.bytes[3]]),
            length: u16::from_be_bytes([self.bytes[4], self.bytes[5]]),
            unit_id: self.bytes[6],
        }
    }

    /// Function code plus payload.
    #[must_use]
    pub fn pdu(&self) -> &[u8] {
        &self.bytes[MbapHeader::SIZE..]
    }

    /// First PDU byte.
    #[must_use]
    pub fn function_code(&self) -> u8 {
        self.bytes[MbapHeader::SIZE]
    }

    /// The whole frame as received.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the frame, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read one complete frame from `conn`.
///
/// Reads the 6-byte prefix, validates the length field, then reads exactly
/// that many more bytes. Read timeouts are retried until `stop` is set; the
/// buffer position survives them, so no bytes are lost.
///
/// # Errors
///
/// See [`FrameError`]. A partial frame is never returned.
pub fn read_frame<C>(conn: &mut C, stop: &AtomicBool) -> Result<Frame, FrameError>
where
    C: Connection + ?Sized,
{
    let mut prefix = [0u8; PREFIX_LEN];
    read_exact(conn, &mut prefix, stop)?;

    let length = u16::from_be_bytes([prefix[4], prefix[5]]);
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return Err(FrameError::InvalidLength(length));
    }

    let mut bytes = vec![0u8; PREFIX_LEN + usize::from(length)];
    bytes[..PREFIX_LEN].copy_from_slice(&prefix);
    read_exact(conn, &mut bytes[PREFIX_LEN..], stop)?;

    trace!(
        transaction_id = u16::from_be_bytes([prefix[0], prefix[1]]),
        length,
        "Frame received"
    );

    Ok(Frame { bytes })
}

fn read_exact<C>(conn: &mut C, buf: &mut [u8], stop: &AtomicBool) -> Result<(), FrameError>
where
    C: Connection + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match conn.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if stop.load(Ordering::SeqCst) {
                    return Err(FrameError::Stopped);
                }
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}
