//! IPMI v1.5 LAN packet handling
//!
//! An IPMI-over-LAN datagram nests three layers:
//!
//! ```text
//! +----------+------------------------------+--------------------+
//! | RMCP (4) | session header (10 or 26)    | IPMI message (len) |
//! +----------+------------------------------+--------------------+
//! ```
//!
//! Session fields are little-endian. The IPMI message carries two
//! two's-complement checksums: one over the target address and netfn byte,
//! one over everything after it.

use crate::error::{IpmiError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// RMCP version 1.0
pub const RMCP_VERSION: u8 = 0x06;

/// RMCP sequence number meaning "no RMCP ACK"
pub const RMCP_SEQ_NO_ACK: u8 = 0xff;

/// RMCP message class for IPMI
pub const RMCP_CLASS_IPMI: u8 = 0x07;

/// Slave address of the BMC
pub const BMC_ADDRESS: u8 = 0x20;

/// Software ID used by remote consoles
pub const REMOTE_CONSOLE_ADDRESS: u8 = 0x81;

/// Width of the session auth code field
pub const AUTH_CODE_LEN: usize = 16;

/// Network function codes
pub mod netfn {
    pub const CHASSIS: u8 = 0x00;
    pub const APP: u8 = 0x06;
}

/// Command codes handled by the listener
pub mod cmd {
    // netfn App
    pub const GET_DEVICE_ID: u8 = 0x01;
    pub const COLD_RESET: u8 = 0x02;
    pub const GET_CHANNEL_AUTH_CAPABILITIES: u8 = 0x38;
    pub const GET_SESSION_CHALLENGE: u8 = 0x39;
    pub const ACTIVATE_SESSION: u8 = 0x3a;
    pub const SET_SESSION_PRIVILEGE_LEVEL: u8 = 0x3b;
    pub const CLOSE_SESSION: u8 = 0x3c;

    // netfn Chassis
    pub const GET_CHASSIS_STATUS: u8 = 0x01;
    pub const CHASSIS_CONTROL: u8 = 0x02;
    pub const SET_SYSTEM_BOOT_OPTIONS: u8 = 0x08;
    pub const GET_SYSTEM_BOOT_OPTIONS: u8 = 0x09;
}

/// Session authentication type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    /// No authentication (pre-session commands only)
    None = 0x00,
    /// MD2 (recognised, never offered)
    Md2 = 0x01,
    /// MD5
    Md5 = 0x02,
    /// Straight password / key
    Password = 0x04,
    /// OEM proprietary (recognised, never offered)
    Oem = 0x05,
}

impl AuthType {
    /// Bit for this type in the Get Channel Authentication Capabilities mask
    pub fn support_bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl TryFrom<u8> for AuthType {
    type Error = IpmiError;

    fn try_from(value: u8) -> Result<Self> {
        match value & 0x0f {
            0x00 => Ok(AuthType::None),
            0x01 => Ok(AuthType::Md2),
            0x02 => Ok(AuthType::Md5),
            0x04 => Ok(AuthType::Password),
            0x05 => Ok(AuthType::Oem),
            // 0x06 is the RMCP+ (IPMI v2.0) payload format
            other => Err(IpmiError::UnsupportedAuthType(other)),
        }
    }
}

/// Session privilege level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Privilege {
    Callback = 0x01,
    User = 0x02,
    Operator = 0x03,
    Administrator = 0x04,
}

impl TryFrom<u8> for Privilege {
    type Error = IpmiError;

    fn try_from(value: u8) -> Result<Self> {
        match value & 0x0f {
            0x01 => Ok(Privilege::Callback),
            0x02 => Ok(Privilege::User),
            0x03 => Ok(Privilege::Operator),
            0x04 => Ok(Privilege::Administrator),
            other => Err(IpmiError::InvalidPacket(format!(
                "unknown privilege level: {}",
                other
            ))),
        }
    }
}

/// IPMI completion code (first byte of every response)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const NORMAL: Self = Self(0x00);
    /// Command-specific; for boot options "parameter not supported"
    pub const PARAMETER_NOT_SUPPORTED: Self = Self(0x80);
    pub const NODE_BUSY: Self = Self(0xc0);
    pub const INVALID_COMMAND: Self = Self(0xc1);
    pub const REQUEST_DATA_LENGTH_INVALID: Self = Self(0xc7);
    pub const PARAMETER_OUT_OF_RANGE: Self = Self(0xc9);
    pub const INVALID_DATA_FIELD: Self = Self(0xcc);
    pub const INSUFFICIENT_PRIVILEGE: Self = Self(0xd4);
    pub const NOT_SUPPORTED_IN_PRESENT_STATE: Self = Self(0xd5);
    pub const UNSPECIFIED_ERROR: Self = Self(0xff);

    /// Whether this code signals success
    pub fn is_success(self) -> bool {
        self == Self::NORMAL
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Two's-complement checksum over `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    sum(bytes).wrapping_neg()
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// An IPMI message (request or response)
///
/// For requests the target is the BMC and the source the remote console;
/// responses swap the two and carry the completion code as the first data
/// byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiMessage {
    pub target_address: u8,
    pub netfn: u8,
    pub target_lun: u8,
    pub source_address: u8,
    pub sequence: u8,
    pub source_lun: u8,
    pub command: u8,
    pub data: Bytes,
}

impl IpmiMessage {
    /// Build a request addressed to the BMC
    pub fn request(netfn: u8, command: u8, sequence: u8, data: impl Into<Bytes>) -> Self {
        Self {
            target_address: BMC_ADDRESS,
            netfn,
            target_lun: 0,
            source_address: REMOTE_CONSOLE_ADDRESS,
            sequence,
            source_lun: 0,
            command,
            data: data.into(),
        }
    }

    /// Parse a message, verifying both checksums
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(IpmiError::InvalidPacket(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        if sum(&data[..3]) != 0 {
            return Err(IpmiError::ChecksumMismatch("message header"));
        }
        if sum(&data[3..]) != 0 {
            return Err(IpmiError::ChecksumMismatch("message body"));
        }

        Ok(Self {
            target_address: data[0],
            netfn: data[1] >> 2,
            target_lun: data[1] & 0x03,
            source_address: data[3],
            sequence: data[4] >> 2,
            source_lun: data[4] & 0x03,
            command: data[5],
            data: Bytes::copy_from_slice(&data[6..data.len() - 1]),
        })
    }

    /// Encode the message with checksums
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7 + self.data.len());
        buf.put_u8(self.target_address);
        buf.put_u8((self.netfn << 2) | (self.target_lun & 0x03));
        let header_checksum = checksum(&buf[..2]);
        buf.put_u8(header_checksum);

        let body_start = buf.len();
        buf.put_u8(self.source_address);
        buf.put_u8((self.sequence << 2) | (self.source_lun & 0x03));
        buf.put_u8(self.command);
        buf.put_slice(&self.data);
        let body_checksum = checksum(&buf[body_start..]);
        buf.put_u8(body_checksum);

        buf.freeze()
    }

    /// Build the response to this request
    pub fn reply(&self, code: CompletionCode, data: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(1 + data.len());
        body.put_u8(code.0);
        body.put_slice(data);

        Self {
            target_address: self.source_address,
            netfn: self.netfn | 0x01,
            target_lun: self.source_lun,
            source_address: self.target_address,
            sequence: self.sequence,
            source_lun: self.target_lun,
            command: self.command,
            data: body.freeze(),
        }
    }

    /// Whether this is a response (odd netfn)
    pub fn is_response(&self) -> bool {
        self.netfn & 0x01 == 0x01
    }

    /// Completion code of a response
    pub fn completion_code(&self) -> Option<CompletionCode> {
        if !self.is_response() {
            return None;
        }
        self.data.first().copied().map(CompletionCode)
    }

    /// Response data following the completion code
    pub fn response_data(&self) -> &[u8] {
        if self.is_response() && !self.data.is_empty() {
            &self.data[1..]
        } else {
            &[]
        }
    }
}

/// IPMI v1.5 session header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub auth_type: AuthType,
    pub sequence: u32,
    pub session_id: u32,
    pub auth_code: Option<[u8; AUTH_CODE_LEN]>,
}

impl SessionHeader {
    /// Header used outside of any session
    pub fn sessionless() -> Self {
        Self {
            auth_type: AuthType::None,
            sequence: 0,
            session_id: 0,
            auth_code: None,
        }
    }
}

/// A complete RMCP / IPMI v1.5 datagram
///
/// `message` is kept as raw bytes because auth codes are computed over the
/// encoded message.
#[derive(Debug, Clone)]
pub struct LanPacket {
    pub session: SessionHeader,
    pub message: Bytes,
}

impl LanPacket {
    /// Wrap an encoded message
    pub fn new(session: SessionHeader, message: Bytes) -> Self {
        Self { session, message }
    }

    /// Parse a datagram
    ///
    /// Trailing bytes after the message (the legacy pad byte some consoles
    /// append) are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 5 {
            return Err(IpmiError::InvalidPacket("packet too short".to_string()));
        }

        let version = buf.get_u8();
        if version != RMCP_VERSION {
            return Err(IpmiError::InvalidPacket(format!(
                "unsupported RMCP version: {:#04x}",
                version
            )));
        }
        let _reserved = buf.get_u8();
        let _rmcp_sequence = buf.get_u8();
        let class = buf.get_u8();
        if class & 0x1f != RMCP_CLASS_IPMI {
            return Err(IpmiError::InvalidPacket(format!(
                "unsupported RMCP class: {:#04x}",
                class
            )));
        }

        let auth_type = AuthType::try_from(buf.get_u8())?;
        if buf.remaining() < 8 {
            return Err(IpmiError::InvalidPacket("truncated session header".to_string()));
        }
        let sequence = buf.get_u32_le();
        let session_id = buf.get_u32_le();

        let auth_code = if auth_type == AuthType::None {
            None
        } else {
            if buf.remaining() < AUTH_CODE_LEN {
                return Err(IpmiError::InvalidPacket("truncated auth code".to_string()));
            }
            let mut code = [0u8; AUTH_CODE_LEN];
            buf.copy_to_slice(&mut code);
            Some(code)
        };

        if buf.remaining() < 1 {
            return Err(IpmiError::InvalidPacket("missing message length".to_string()));
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(IpmiError::InvalidPacket(format!(
                "truncated message: expected {} bytes, got {}",
                len,
                buf.remaining()
            )));
        }

        Ok(Self {
            session: SessionHeader {
                auth_type,
                sequence,
                session_id,
                auth_code,
            },
            message: Bytes::copy_from_slice(&buf[..len]),
        })
    }

    /// Encode the datagram
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 26 + self.message.len());
        buf.put_u8(RMCP_VERSION);
        buf.put_u8(0x00);
        buf.put_u8(RMCP_SEQ_NO_ACK);
        buf.put_u8(RMCP_CLASS_IPMI);

        buf.put_u8(self.session.auth_type as u8);
        buf.put_u32_le(self.session.sequence);
        buf.put_u32_le(self.session.session_id);
        if let Some(code) = &self.session.auth_code {
            buf.put_slice(code);
        }
        buf.put_u8(self.message.len() as u8);
        buf.put_slice(&self.message);

        buf.freeze()
    }
}
