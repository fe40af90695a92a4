//! # Wire Protocol Codec
//!
//! Binary little-endian framed request/response.
//!
//! Request header (10 bytes): `cmd:u8, flags:u8, id:u32, param_size:u32`,
//! followed by `param_size` bytes of command-specific payload.
//! Response header (10 bytes): `cmd:u8` (echoed), `id:u32` (echoed),
//! `result:u8` (ok=0, fail=1), `result_size:u32`, followed by
//! `result_size` bytes.
//!
//! An addr travels as `segment:u16, offset:u16`.

use mnema_core::Addr;

// =============================================================================
// COMMAND CODES
// =============================================================================

pub const CMD_CHECK_ELEMENT: u8 = 0x01;
pub const CMD_GET_ELEMENT_TYPE: u8 = 0x02;
pub const CMD_ERASE_ELEMENT: u8 = 0x03;
pub const CMD_CREATE_NODE: u8 = 0x04;
pub const CMD_CREATE_LINK: u8 = 0x05;
pub const CMD_CREATE_ARC: u8 = 0x06;
pub const CMD_GET_LINK_CONTENT: u8 = 0x07;
pub const CMD_SET_LINK_CONTENT: u8 = 0x08;
pub const CMD_FIND_LINKS: u8 = 0x09;
pub const CMD_FIND_ELEMENT_BY_SYSIDTF: u8 = 0x0A;
pub const CMD_SET_SYSIDTF: u8 = 0x0B;
pub const CMD_SHUTDOWN: u8 = 0xFE;

pub const RESULT_OK: u8 = 0;
pub const RESULT_FAIL: u8 = 1;

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

/// Errors that terminate command processing on a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// The request header did not arrive within the read deadline.
    CmdHeaderReadTimeout,
    /// The parameter body did not arrive within the read deadline.
    CmdParamReadTimeout,
    /// The peer closed the stream or the socket failed.
    Io(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CmdHeaderReadTimeout => write!(f, "command header read timeout"),
            Self::CmdParamReadTimeout => write!(f, "command params read timeout"),
            Self::Io(e) => write!(f, "socket error: {e}"),
        }
    }
}

// =============================================================================
// HEADERS
// =============================================================================

/// Fixed-size request preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub cmd: u8,
    pub flags: u8,
    pub id: u32,
    pub param_size: u32,
}

impl RequestHeader {
    pub const SIZE: usize = 10;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.cmd;
        bytes[1] = self.flags;
        bytes[2..6].copy_from_slice(&self.id.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.param_size.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            cmd: bytes[0],
            flags: bytes[1],
            id: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            param_size: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

/// Fixed-size response preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cmd: u8,
    pub id: u32,
    pub result: u8,
    pub result_size: u32,
}

impl ResponseHeader {
    pub const SIZE: usize = 10;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.cmd;
        bytes[1..5].copy_from_slice(&self.id.to_le_bytes());
        bytes[5] = self.result;
        bytes[6..10].copy_from_slice(&self.result_size.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            cmd: bytes[0],
            id: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            result: bytes[5],
            result_size: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

// =============================================================================
// PARAMETER READER
// =============================================================================

/// Cursor over a request's parameter bytes. Truncated parameters fail the
/// command rather than the connection.
pub struct ParamReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ParamReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_addr(&mut self) -> Option<Addr> {
        let segment = self.read_u16()?;
        let offset = self.read_u16()?;
        Some(Addr::new(segment, offset))
    }

    /// A length-prefixed byte string: `len:u32, bytes[len]`.
    pub fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

/// Append an addr in wire order.
pub fn push_addr(out: &mut Vec<u8>, addr: Addr) {
    out.extend_from_slice(&addr.segment.to_le_bytes());
    out.extend_from_slice(&addr.offset.to_le_bytes());
}

// =============================================================================
// TESTS
// =============================================================================
