//! The fixed-size bodies of non-stream FastCGI records.
//!
//! BeginRequest, EndRequest, and UnknownType all carry exactly 8 bytes of
//! content, so each body type also knows how to wrap itself into a complete
//! 16-byte record via `to_record`.

use super::Error as ProtocolError;
use super::{wire, ProtocolStatus, RawHeader, RecordType, RequestFlags, Role};


/// The number of content bytes in each fixed-size record body.
pub const LEN: usize = 8;

/// A fixed-size body together with its record header and (zero) padding.
pub type FixedRecord = [u8; RawHeader::LEN + LEN];

#[must_use]
fn fixed_record(rtype: RecordType, request_id: u16, body: [u8; LEN]) -> FixedRecord {
    // LEN is a multiple of 8, so for_record never adds padding here
    let head = RawHeader::for_record(rtype, request_id, LEN as u16);
    let mut rec = [0; RawHeader::LEN + LEN];
    rec[..RawHeader::LEN].copy_from_slice(&head.to_bytes());
    rec[RawHeader::LEN..].copy_from_slice(&body);
    rec
}


/// The body of a BeginRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BeginRequest {
    /// The role the application is asked to play for this request.
    pub role: Role,
    /// The control flags for this request.
    pub flags: RequestFlags,
}

impl BeginRequest {
    /// Parses the input bytes into a [`BeginRequest`] body.
    ///
    /// # Errors
    /// Returns an error if the role identifier is unknown. Unknown flag bits
    /// are reserved for protocol extensions and ignored.
    pub fn from_bytes(data: [u8; LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            role: Role::try_from(wire::get_u16(&data))?,
            flags: RequestFlags::from(data[2]),
        })
    }

    /// Encodes the body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; LEN] {
        let mut buf = [0; LEN];
        wire::put_u16(&mut buf, self.role.into());
        buf[2] = self.flags.into();
        buf
    }

    /// Encodes a complete BeginRequest record for the given request ID.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> FixedRecord {
        fixed_record(RecordType::BeginRequest, request_id, self.to_bytes())
    }
}


/// The body of an EndRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndRequest {
    /// The application's exit status for the request.
    pub app_status: u32,
    /// The protocol-level completion status.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// Parses the input bytes into an [`EndRequest`] body.
    ///
    /// # Errors
    /// Returns an error if the protocol status is unknown.
    pub fn from_bytes(data: [u8; LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: wire::get_u32(&data),
            protocol_status: ProtocolStatus::try_from(data[4])?,
        })
    }

    /// Encodes the body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; LEN] {
        let mut buf = [0; LEN];
        wire::put_u32(&mut buf, self.app_status);
        buf[4] = self.protocol_status.into();
        buf
    }

    /// Encodes a complete EndRequest record for the given request ID.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> FixedRecord {
        fixed_record(RecordType::EndRequest, request_id, self.to_bytes())
    }
}


/// The body of an UnknownType record, acknowledging an unrecognised
/// record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnknownType {
    /// The type byte of the record that was not understood.
    pub rtype: u8,
}

impl UnknownType {
    /// Parses the input bytes into an [`UnknownType`] body.
    #[inline]
    #[must_use]
    pub fn from_bytes(data: [u8; LEN]) -> Self {
        Self { rtype: data[0] }
    }

    /// Encodes the body into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; LEN] {
        let mut buf = [0; LEN];
        buf[0] = self.rtype;
        buf
    }

    /// Encodes a complete UnknownType record. Always addressed to the
    /// management request ID per the protocol.
    #[inline]
    #[must_use]
    pub fn to_record(self) -> FixedRecord {
        fixed_record(RecordType::Unknown, super::MANAGEMENT_REQUEST_ID, self.to_bytes())
    }
}
