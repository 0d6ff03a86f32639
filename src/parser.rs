//! Incremental framing of FastCGI records out of a byte stream.
//!
//! [`RecordParser`] is a per-connection state machine with three phases:
//! header, content, padding. Input arrives in arbitrary slices; a slice may
//! end mid-phase and may also cover several records. Framing never fails —
//! the header is fixed-size and the body is length-delimited — so semantic
//! validation is left entirely to the dispatcher.

use crate::protocol::RawHeader;


/// A complete record as reassembled from the byte stream.
///
/// `content` holds exactly `header.content_length` bytes; padding has
/// already been skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The raw record header.
    pub header: RawHeader,
    /// The record payload, padding excluded.
    pub content: Vec<u8>,
}

#[derive(Debug)]
enum Phase {
    Header { buf: [u8; RawHeader::LEN], filled: usize },
    Content { header: RawHeader, buf: Vec<u8> },
    Padding { header: RawHeader, content: Vec<u8>, remaining: u8 },
}

impl Phase {
    #[inline]
    fn start() -> Self {
        Self::Header { buf: [0; RawHeader::LEN], filled: 0 }
    }
}


/// A resumable record-framing state machine.
#[derive(Debug)]
pub struct RecordParser {
    phase: Phase,
}

impl Default for RecordParser {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    /// Creates a parser positioned at a record boundary.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { phase: Phase::start() }
    }

    /// Tests whether the parser is stopped exactly between two records.
    #[inline]
    #[must_use]
    pub fn is_record_boundary(&self) -> bool {
        matches!(self.phase, Phase::Header { filled: 0, .. })
    }

    /// Advances the state machine over `input`.
    ///
    /// Returns the number of input bytes consumed and, if a record was
    /// completed, the record. The caller should invoke `feed` again with the
    /// unconsumed remainder until it is empty, dispatching each completed
    /// record in between; a single slice may hold many records.
    pub fn feed(&mut self, input: &[u8]) -> (usize, Option<Record>) {
        let mut consumed = 0;
        loop {
            let rest = &input[consumed..];
            match &mut self.phase {
                Phase::Header { buf, filled } => {
                    if rest.is_empty() {
                        return (consumed, None);
                    }
                    let take = rest.len().min(RawHeader::LEN - *filled);
                    buf[*filled..(*filled + take)].copy_from_slice(&rest[..take]);
                    *filled += take;
                    consumed += take;
                    if *filled == RawHeader::LEN {
                        let header = RawHeader::from_bytes(*buf);
                        let buf = Vec::with_capacity(header.content_length.into());
                        self.phase = Phase::Content { header, buf };
                    }
                },

                Phase::Content { header, buf } => {
                    let need = usize::from(header.content_length) - buf.len();
                    if need > 0 {
                        if rest.is_empty() {
                            return (consumed, None);
                        }
                        let take = rest.len().min(need);
                        buf.extend_from_slice(&rest[..take]);
                        consumed += take;
                        if take < need {
                            return (consumed, None);
                        }
                    }
                    // A zero-length record may still carry padding
                    self.phase = Phase::Padding {
                        header: *header,
                        content: std::mem::take(buf),
                        remaining: header.padding_length,
                    };
                },

                Phase::Padding { header, content, remaining } => {
                    if *remaining > 0 {
                        if rest.is_empty() {
                            return (consumed, None);
                        }
                        let take = rest.len().min((*remaining).into());
                        consumed += take;
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            *remaining -= take as u8;
                        }
                        if *remaining > 0 {
                            return (consumed, None);
                        }
                    }
                    let record = Record { header: *header, content: std::mem::take(content) };
                    self.phase = Phase::start();
                    return (consumed, Some(record));
                },
            }
        }
    }
}
