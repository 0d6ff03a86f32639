//! Wire-format types for the FastCGI 1.0 record protocol.
//!
//! Framing in FastCGI is length-delimited and can always be carved out of a
//! byte stream, so [`RawHeader`] decodes infallibly and keeps the version and
//! record type as raw bytes. Semantic validation (known type, known role,
//! sane body length) happens where the record is interpreted, via the
//! [`TryFrom`] impls on the field enums.
//
// See the FastCGI specification, especially section 3:
// https://fastcgi-archives.github.io/FastCGI_Specification.html

pub mod body;
pub mod nv;
pub mod wire;


/// The fixed FastCGI request ID addressing the connection itself.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// The largest payload a single FastCGI record can carry.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;


/// Error types for invalid FastCGI protocol fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The version field specifies an unknown protocol version.
    #[error("unknown FastCGI protocol version {0}")]
    UnknownVersion(u8),
    /// The record type field specifies an unknown record type.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// The role field of a BeginRequest body specifies an unknown role.
    #[error("unknown FastCGI role {0}")]
    UnknownRole(u16),
    /// The protocol status field of an EndRequest body is unknown.
    #[error("unknown FastCGI protocol status {0}")]
    UnknownStatus(u8),
    /// A name-value pair declares more bytes than its buffer holds.
    #[error("FastCGI name-value pair exceeds its segment by {missing} bytes")]
    SegmentViolation {
        /// How many declared bytes were absent from the buffer.
        missing: usize,
    },
    /// A length does not fit the name-value codec's 31-bit limit.
    #[error("length is too large for the FastCGI name-value encoding")]
    OversizedLength,
}


/// A validated FastCGI version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// FastCGI version 1, the only published revision.
    V1 = 1,
}

impl TryFrom<u8> for Version {
    type Error = Error;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(Self::V1),
            _ => Err(Error::UnknownVersion(v)),
        }
    }
}

impl From<Version> for u8 {
    #[inline]
    fn from(v: Version) -> Self {
        v as Self
    }
}


/// A validated FastCGI record type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(Self::BeginRequest),
            2 => Ok(Self::AbortRequest),
            3 => Ok(Self::EndRequest),
            4 => Ok(Self::Params),
            5 => Ok(Self::Stdin),
            6 => Ok(Self::Stdout),
            7 => Ok(Self::Stderr),
            8 => Ok(Self::Data),
            9 => Ok(Self::GetValues),
            10 => Ok(Self::GetValuesResult),
            11 => Ok(Self::Unknown),
            _ => Err(Error::UnknownRecordType(v)),
        }
    }
}

impl From<RecordType> for u8 {
    #[inline]
    fn from(v: RecordType) -> Self {
        v as Self
    }
}

impl RecordType {
    /// Tests whether this [`RecordType`] addresses the connection rather than
    /// a request.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        use RecordType::*;
        matches!(self, GetValues | GetValuesResult | Unknown)
    }

    /// Tests whether this [`RecordType`] carries input stream data from the
    /// FastCGI client.
    #[inline]
    #[must_use]
    pub fn is_input_stream(self) -> bool {
        use RecordType::*;
        matches!(self, Params | Stdin | Data)
    }
}


/// A validated FastCGI role identifier.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl TryFrom<u16> for Role {
    type Error = Error;

    #[inline]
    fn try_from(v: u16) -> Result<Self, Error> {
        match v {
            1 => Ok(Self::Responder),
            2 => Ok(Self::Authorizer),
            3 => Ok(Self::Filter),
            _ => Err(Error::UnknownRole(v)),
        }
    }
}

impl From<Role> for u16 {
    #[inline]
    fn from(v: Role) -> Self {
        v as Self
    }
}


bitflags::bitflags! {
    /// The control flags of a BeginRequest body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// Keep the connection open after this request finishes.
        const KEEP_CONN = 1;
    }
}

impl From<u8> for RequestFlags {
    /// Converts raw flag bits, ignoring bits this implementation does not
    /// know. The FastCGI specification reserves them for extensions.
    #[inline]
    fn from(v: u8) -> Self {
        Self::from_bits_truncate(v)
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}


/// A validated FastCGI response protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ProtocolStatus {
    /// The request completed normally.
    RequestComplete = 0,
    /// A multiplexed request was rejected by a non-multiplexing application.
    CantMpxConn = 1,
    /// The application is out of request capacity.
    Overloaded = 2,
    /// The application does not implement the requested role.
    UnknownRole = 3,
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = Error;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Self::RequestComplete),
            1 => Ok(Self::CantMpxConn),
            2 => Ok(Self::Overloaded),
            3 => Ok(Self::UnknownRole),
            _ => Err(Error::UnknownStatus(v)),
        }
    }
}

impl From<ProtocolStatus> for u8 {
    #[inline]
    fn from(v: ProtocolStatus) -> Self {
        v as Self
    }
}


/// An unvalidated FastCGI record header, as carved out of the byte stream.
///
/// Framing fields (`request_id`, `content_length`, `padding_length`) are
/// decoded so the stream can always be advanced past the record. `version`
/// and `rtype` stay raw; interpreting them is the dispatcher's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHeader {
    /// The FastCGI version byte, unvalidated.
    pub version: u8,
    /// The record type byte, unvalidated.
    pub rtype: u8,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of the record's payload.
    pub content_length: u16,
    /// The number of padding bytes following the payload.
    pub padding_length: u8,
}

impl RawHeader {
    /// The number of bytes in the wire format of a record header.
    pub const LEN: usize = 8;

    /// Creates a header for an outgoing record with the recommended padding.
    ///
    /// Up to 7 padding bytes are added so that `content_length +
    /// padding_length` is a multiple of 8, as the FastCGI specification
    /// recommends for alignment.
    #[must_use]
    pub fn for_record(rtype: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: Version::V1.into(),
            rtype: rtype.into(),
            request_id,
            content_length,
            padding_length: (content_length.wrapping_neg() % 8) as u8,
        }
    }

    /// Decodes the input bytes. Framing cannot fail; see the type docs.
    #[must_use]
    pub fn from_bytes(data: [u8; Self::LEN]) -> Self {
        Self {
            version: data[0],
            rtype: data[1],
            request_id: wire::get_u16(&data[2..]),
            content_length: wire::get_u16(&data[4..]),
            padding_length: data[6],
        }
    }

    /// Encodes the header into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.version;
        buf[1] = self.rtype;
        wire::put_u16(&mut buf[2..], self.request_id);
        wire::put_u16(&mut buf[4..], self.content_length);
        buf[6] = self.padding_length;
        buf
    }

    /// Returns a slice of `self.padding_length` zero bytes.
    #[inline]
    #[must_use]
    pub fn padding_bytes(self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..self.padding_length.into()]
    }

    /// Tests whether this header addresses the connection rather than
    /// a request.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        self.request_id == MANAGEMENT_REQUEST_ID
    }
}


/// Appends a complete record (header, payload, padding) to `out`.
///
/// Payloads above [`MAX_CONTENT_LEN`] are split across as many records as
/// needed; every record gets its own aligned padding. An empty payload emits
/// a single zero-length record, the protocol's end-of-stream marker.
pub fn encode_record(rtype: RecordType, request_id: u16, payload: &[u8], out: &mut Vec<u8>) {
    let mut rest = payload;
    loop {
        let take = rest.len().min(MAX_CONTENT_LEN);
        #[allow(clippy::cast_possible_truncation)]
        let head = RawHeader::for_record(rtype, request_id, take as u16);
        out.extend_from_slice(&head.to_bytes());
        out.extend_from_slice(&rest[..take]);
        out.extend_from_slice(head.padding_bytes());
        rest = &rest[take..];
        if rest.is_empty() {
            return;
        }
    }
}
