//! One FastCGI transport connection.
//!
//! The connection task owns the socket's read half, the record parser, and
//! the table of active requests. Completed records are dispatched by type:
//! management records are answered directly, BeginRequest creates a request,
//! stream records feed a request's input streams, AbortRequest triggers the
//! handler's abort hook. One bad record invalidates the whole connection,
//! not just the offending request.
//!
//! Outbound records from any thread funnel through [`WireTx`]: each record
//! (header, content, padding) is assembled under the write mutex and queued
//! as one frame, so handlers on different worker threads can never
//! interleave bytes on the wire. The connection task drains the queue onto
//! the socket between reads.

use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex, PoisonError};

use compact_str::{CompactString, ToCompactString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::handler::Registry;
use crate::parser::{Record, RecordParser};
use crate::protocol::{self as fcgi, body, nv, ProtocolStatus, RecordType};
use crate::request::{Request, RequestState};
use crate::worker::WorkQueue;
use crate::{Config, Error};


/// Stack buffer size for socket reads.
const READ_BUF_LEN: usize = 1024;


/// Violations of FastCGI record semantics or protocol ordering.
///
/// Any of these invalidates the connection they occur on; the FastCGI
/// client opens a fresh connection if it still has requests to place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// A record declared a FastCGI version other than 1.
    #[error("record with unsupported FastCGI version {0}")]
    UnknownVersion(u8),
    /// BeginRequest reused the ID of a request that is still active.
    #[error("BeginRequest for already active request {0}")]
    DuplicateRequest(u16),
    /// A fixed-size record body had the wrong content length.
    #[error("record type {rtype} has invalid content length {length}")]
    BadBodyLength {
        /// The raw record type.
        rtype: u8,
        /// The declared content length.
        length: u16,
    },
    /// A record arrived for a request or state that cannot accept it, e.g.
    /// STDIN before PARAMS closed or PARAMS after it closed.
    #[error("record type {rtype} not acceptable for request {request_id} in its current state")]
    UnexpectedRecord {
        /// The raw record type.
        rtype: u8,
        /// The addressed request ID.
        request_id: u16,
    },
    /// A protocol field or name-value segment was malformed.
    #[error("malformed protocol data: {0}")]
    Field(#[from] fcgi::Error),
}


/// A fully serialized outbound message.
#[derive(Debug)]
pub(crate) enum WireMsg {
    /// One or more complete records to put on the wire.
    Frame(Vec<u8>),
    /// Flush and close the transport once prior frames are out.
    Close,
}

#[derive(Debug)]
struct WireShared {
    tx: mpsc::UnboundedSender<WireMsg>,
    /// Serializes record assembly so one logical emission (including a
    /// multi-record split) reaches the queue as a unit.
    write_lock: Mutex<()>,
}

/// A cloneable handle emitting records onto a connection.
///
/// Held by the connection itself, by every request created on it, and
/// transitively by the output streams handlers write to.
#[derive(Debug, Clone)]
pub(crate) struct WireTx {
    shared: Arc<WireShared>,
}

impl WireTx {
    /// Creates a sender together with the receiver the connection drains.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<WireMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WireShared { tx, write_lock: Mutex::new(()) });
        (Self { shared }, rx)
    }

    fn send(&self, msg: WireMsg) -> Result<(), Error> {
        self.shared.tx.send(msg).map_err(|_| Error::StreamClosed)
    }

    /// Emits a stream record, splitting oversized payloads.
    ///
    /// An empty payload emits the zero-length end-of-stream record.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] if the connection is gone.
    pub(crate) fn send_stream(
        &self,
        rtype: RecordType,
        request_id: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let _wire = self.shared.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut frame = Vec::with_capacity(payload.len() + 2 * fcgi::RawHeader::LEN);
        fcgi::encode_record(rtype, request_id, payload, &mut frame);
        crate::macros::trace!(?rtype, request_id, bytes = payload.len(), "record emitted");
        self.send(WireMsg::Frame(frame))
    }

    /// Emits a preassembled fixed-size record (EndRequest, UnknownType).
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] if the connection is gone.
    pub(crate) fn send_fixed(&self, record: body::FixedRecord) -> Result<(), Error> {
        let _wire = self.shared.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.send(WireMsg::Frame(record.to_vec()))
    }

    /// Asks the connection to close once queued frames are written.
    pub(crate) fn send_close(&self) {
        let _ = self.send(WireMsg::Close);
    }
}


/// Per-connection multiplexer state.
struct Connection {
    requests: HashMap<u16, Arc<Request>>,
    wire: WireTx,
    registry: Arc<Registry>,
    queue: Arc<WorkQueue>,
    config: Arc<Config>,
}

impl Connection {
    /// Feeds raw socket bytes through the record parser, dispatching every
    /// completed record. A single read may complete several records.
    fn ingest(&mut self, parser: &mut RecordParser, mut input: &[u8]) -> Result<(), ProtocolViolation> {
        while !input.is_empty() {
            let (used, record) = parser.feed(input);
            input = &input[used..];
            if let Some(record) = record {
                self.dispatch(&record)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, record: &Record) -> Result<(), ProtocolViolation> {
        crate::macros::trace!(header = ?record.header, "record received");
        if record.header.version != u8::from(fcgi::Version::V1) {
            return Err(ProtocolViolation::UnknownVersion(record.header.version));
        }

        let Ok(rtype) = RecordType::try_from(record.header.rtype) else {
            // Acknowledge instead of dropping the connection
            tracing::info!(rtype = record.header.rtype, "unknown record type acknowledged");
            let unk = body::UnknownType { rtype: record.header.rtype };
            let _ = self.wire.send_fixed(unk.to_record());
            return Ok(());
        };

        if record.header.is_management() {
            if rtype == RecordType::GetValues {
                return self.get_values(&record.content);
            }
            // Management records we don't understand are dropped silently
            crate::macros::trace!(?rtype, "management record ignored");
            return Ok(());
        }

        match rtype {
            RecordType::BeginRequest => self.begin_request(record),
            RecordType::Params | RecordType::Stdin | RecordType::Data => {
                self.stream_record(record, rtype)
            },
            RecordType::AbortRequest => {
                self.abort_request(record.header.request_id);
                Ok(())
            },
            // Response-direction types have no business arriving here
            _ => Err(ProtocolViolation::UnexpectedRecord {
                rtype: rtype.into(),
                request_id: record.header.request_id,
            }),
        }
    }

    /// Answers GET_VALUES with one GET_VALUES_RESULT record.
    ///
    /// Multiplexing is supported and advertised; requested names this
    /// implementation does not know are echoed with empty values.
    fn get_values(&mut self, content: &[u8]) -> Result<(), ProtocolViolation> {
        let mut names = Vec::new();
        nv::decode_pairs(content, |name, _| names.push(name))?;

        let max_conns = self.config.max_conns.to_compact_string();
        let mut payload = Vec::with_capacity(content.len() + 64);
        for name in names {
            let value: &str = match name {
                b"FCGI_MPXS_CONNS" => "1",
                b"FCGI_MAX_CONNS" | b"FCGI_MAX_REQS" => &max_conns,
                unknown => {
                    tracing::debug!(
                        name = %CompactString::from_utf8_lossy(unknown),
                        "unknown GET_VALUES variable echoed empty",
                    );
                    ""
                },
            };
            if payload.len() + nv::encoded_len(name.len(), value.len()) > fcgi::MAX_CONTENT_LEN {
                tracing::warn!("GET_VALUES response exceeds one record, truncating");
                break;
            }
            nv::write_pair(name, value.as_bytes(), &mut payload)?;
        }

        let _ = self.wire.send_stream(
            RecordType::GetValuesResult,
            fcgi::MANAGEMENT_REQUEST_ID,
            &payload,
        );
        Ok(())
    }

    fn begin_request(&mut self, record: &Record) -> Result<(), ProtocolViolation> {
        let id = record.header.request_id;
        if record.header.content_length != body::LEN as u16 {
            return Err(ProtocolViolation::BadBodyLength {
                rtype: record.header.rtype,
                length: record.header.content_length,
            });
        }
        if let Some(existing) = self.requests.get(&id) {
            if !existing.is_finished() {
                return Err(ProtocolViolation::DuplicateRequest(id));
            }
        }

        let raw: [u8; body::LEN] =
            record.content[..].try_into().expect("content length checked above");
        let begin = match body::BeginRequest::from_bytes(raw) {
            Ok(b) => b,
            Err(fcgi::Error::UnknownRole(role)) => {
                self.reject_role(id, role);
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };

        let role_code = u16::from(begin.role);
        let Some(factory) = self.registry.find(role_code) else {
            self.reject_role(id, role_code);
            return Ok(());
        };

        let keep_conn = begin.flags.contains(fcgi::RequestFlags::KEEP_CONN);
        let nz_id = NonZeroU16::new(id).expect("management records are routed separately");
        let request = Arc::new(Request::new(
            nz_id,
            begin.role,
            keep_conn,
            self.wire.clone(),
            self.config.chunk_size,
        ));
        request.attach_handler(factory.create(&request));
        self.requests.insert(id, request);
        tracing::debug!(request_id = id, role = ?begin.role, keep_conn, "request begun");
        Ok(())
    }

    /// Rejects a role nobody serves. The connection stays usable.
    fn reject_role(&self, id: u16, role: u16) {
        tracing::info!(request_id = id, role, "unknown role rejected");
        let end = body::EndRequest {
            app_status: 0,
            protocol_status: ProtocolStatus::UnknownRole,
        };
        let _ = self.wire.send_fixed(end.to_record(id));
    }

    fn stream_record(&mut self, record: &Record, rtype: RecordType) -> Result<(), ProtocolViolation> {
        let id = record.header.request_id;
        let unexpected = ProtocolViolation::UnexpectedRecord { rtype: rtype.into(), request_id: id };
        let Some(request) = self.requests.get(&id) else {
            return Err(unexpected);
        };
        let request = Arc::clone(request);

        if rtype == RecordType::Params {
            return match request.state() {
                RequestState::Init | RequestState::ParamsOpen => {
                    if record.content.is_empty() {
                        request.close_params()?;
                        self.enqueue_step(&request);
                    } else {
                        request.append_params(&record.content);
                    }
                    Ok(())
                },
                // PARAMS after its end-of-stream record
                RequestState::Ready | RequestState::Finished => Err(unexpected),
            };
        }

        match request.state() {
            RequestState::Ready => {
                let stream = request.input_stream(rtype);
                if record.content.is_empty() {
                    stream.close();
                } else if stream.append_chunk(&record.content).is_err() {
                    // Data past the stream's end-of-stream record
                    return Err(unexpected);
                }
                request.notify_data(rtype, &record.content);
                Ok(())
            },
            // The request already answered; late stream data is dropped
            RequestState::Finished => {
                crate::macros::trace!(request_id = id, ?rtype, "stream data after finish ignored");
                Ok(())
            },
            // STDIN/DATA must not precede the end of PARAMS
            RequestState::Init | RequestState::ParamsOpen => Err(unexpected),
        }
    }

    fn abort_request(&mut self, id: u16) {
        if let Some(request) = self.requests.get(&id) {
            if !request.is_finished() {
                request.abort();
                return;
            }
        }
        // Already finished or never known: nothing to abort
        crate::macros::trace!(request_id = id, "abort for inactive request ignored");
    }

    /// Hands the request's next handler step to the worker pool.
    fn enqueue_step(&self, request: &Arc<Request>) {
        let request = Arc::clone(request);
        self.queue.push(Box::new(move || request.run_step()));
    }

    /// Drops table entries for requests that have finished.
    fn sweep(&mut self) {
        let before = self.requests.len();
        self.requests.retain(|_, request| !request.is_finished());
        let dropped = before - self.requests.len();
        if dropped > 0 {
            tracing::debug!(dropped, active = self.requests.len(), "request table swept");
        }
    }

    /// Severs all remaining requests from the connection.
    fn abandon(&mut self) {
        for request in self.requests.values() {
            request.abandon();
        }
        self.requests.clear();
    }
}


/// Serves one established transport connection until it closes.
///
/// Reads, parsing, dispatch, and all read-side request mutation happen on
/// this task; worker threads only touch the write path through [`WireTx`]
/// and the per-request stream locks.
pub(crate) async fn run<R, W>(
    mut reader: R,
    mut writer: W,
    config: Arc<Config>,
    registry: Arc<Registry>,
    queue: Arc<WorkQueue>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (wire, mut rx) = WireTx::channel();
    let mut conn = Connection {
        requests: HashMap::new(),
        wire,
        registry,
        queue,
        config: Arc::clone(&config),
    };
    let mut parser = RecordParser::new();
    let mut buf = [0; READ_BUF_LEN];
    let mut gc = tokio::time::interval(config.gc_interval);
    gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(WireMsg::Frame(frame)) => {
                    if let Err(error) = writer.write_all(&frame).await {
                        tracing::warn!(%error, "connection write failed");
                        break;
                    }
                },
                Some(WireMsg::Close) => {
                    let _ = writer.shutdown().await;
                    tracing::debug!("connection closed after final request");
                    break;
                },
                // All senders gone; nothing further can be emitted
                None => break,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("connection closed by remote");
                    break;
                },
                Ok(n) => {
                    if let Err(error) = conn.ingest(&mut parser, &buf[..n]) {
                        tracing::error!(%error, "protocol violation, dropping connection");
                        break;
                    }
                },
                Err(error) => {
                    tracing::warn!(%error, "connection read failed");
                    break;
                },
            },
            _ = gc.tick() => conn.sweep(),
        }
    }

    // Best effort: put already-queued responses on the wire before teardown
    while let Ok(WireMsg::Frame(frame)) = rx.try_recv() {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
    conn.abandon();
}


#[cfg(test)]
mod tests {
    use crate::protocol::Role;
    use super::*;

    fn test_conn() -> (Connection, mpsc::UnboundedReceiver<WireMsg>) {
        let mut registry = Registry::new();
        registry.register(crate::handler::FnFactory::responder(|_| Box::new(NopHandler)));
        let (wire, rx) = WireTx::channel();
        let conn = Connection {
            requests: HashMap::new(),
            wire,
            registry: Arc::new(registry),
            queue: Arc::new(WorkQueue::new()),
            config: Arc::new(Config::new("127.0.0.1:9800")),
        };
        (conn, rx)
    }

    struct NopHandler;
    impl crate::handler::Handler for NopHandler {
        fn step(&mut self, request: &Request) -> bool {
            request.finish(0);
            true
        }
    }

    fn record(rtype: RecordType, request_id: u16, content: &[u8]) -> Record {
        Record {
            header: fcgi::RawHeader::for_record(rtype, request_id, content.len() as u16),
            content: content.to_vec(),
        }
    }

    fn begin_record(request_id: u16, keep: bool) -> Record {
        let body = body::BeginRequest {
            role: Role::Responder,
            flags: if keep { fcgi::RequestFlags::KEEP_CONN } else { fcgi::RequestFlags::empty() },
        };
        record(RecordType::BeginRequest, request_id, &body.to_bytes())
    }

    fn reply_records(rx: &mut mpsc::UnboundedReceiver<WireMsg>) -> Vec<Record> {
        let mut parser = RecordParser::new();
        let mut records = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let WireMsg::Frame(frame) = msg else { continue };
            let mut rest = &frame[..];
            while !rest.is_empty() {
                let (used, rec) = parser.feed(rest);
                rest = &rest[used..];
                records.extend(rec);
            }
        }
        records
    }

    #[test]
    fn get_values_answers_known_and_unknown() {
        let (mut conn, mut rx) = test_conn();
        let mut query = Vec::new();
        nv::write_pair(b"FCGI_MPXS_CONNS", b"", &mut query).unwrap();
        nv::write_pair(b"X_NOT_A_VAR", b"", &mut query).unwrap();

        conn.dispatch(&record(RecordType::GetValues, 0, &query)).unwrap();
        let records = reply_records(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.rtype, u8::from(RecordType::GetValuesResult));
        assert_eq!(records[0].header.request_id, 0);

        let mut pairs = Vec::new();
        nv::decode_pairs(&records[0].content, |n, v| pairs.push((n.to_vec(), v.to_vec()))).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (b"FCGI_MPXS_CONNS".to_vec(), b"1".to_vec()));
        assert_eq!(pairs[1], (b"X_NOT_A_VAR".to_vec(), b"".to_vec()));
    }

    #[test]
    fn nonzero_get_values_is_violation() {
        let (mut conn, _rx) = test_conn();
        let res = conn.dispatch(&record(RecordType::GetValues, 5, b""));
        assert!(matches!(res, Err(ProtocolViolation::UnexpectedRecord { .. })));
    }

    #[test]
    fn management_records_other_than_get_values_dropped() {
        let (mut conn, mut rx) = test_conn();
        conn.dispatch(&record(RecordType::BeginRequest, 0, &[0; 8])).unwrap();
        conn.dispatch(&record(RecordType::AbortRequest, 0, b"")).unwrap();
        assert!(reply_records(&mut rx).is_empty());
        assert!(conn.requests.is_empty());
    }

    #[test]
    fn unknown_record_type_acknowledged() {
        let (mut conn, mut rx) = test_conn();
        let rec = Record {
            header: fcgi::RawHeader {
                version: 1,
                rtype: 0xa7,
                request_id: 0x4943,
                content_length: 0,
                padding_length: 0,
            },
            content: Vec::new(),
        };
        conn.dispatch(&rec).unwrap();

        let records = reply_records(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.rtype, u8::from(RecordType::Unknown));
        assert_eq!(records[0].content[0], 0xa7);
    }

    #[test]
    fn bad_version_is_violation() {
        let (mut conn, _rx) = test_conn();
        let mut rec = begin_record(1, true);
        rec.header.version = 0xc5;
        let res = conn.dispatch(&rec);
        assert!(matches!(res, Err(ProtocolViolation::UnknownVersion(0xc5))));
    }

    #[test]
    fn begin_request_wrong_length_is_violation() {
        let (mut conn, _rx) = test_conn();
        let res = conn.dispatch(&record(RecordType::BeginRequest, 1, &[0; 5]));
        assert!(matches!(res, Err(ProtocolViolation::BadBodyLength { length: 5, .. })));
    }

    #[test]
    fn duplicate_begin_is_violation() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        let res = conn.dispatch(&begin_record(1, true));
        assert!(matches!(res, Err(ProtocolViolation::DuplicateRequest(1))));
    }

    #[test]
    fn finished_id_may_be_reused() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        conn.requests[&1].finish(0);
        conn.dispatch(&begin_record(1, true)).unwrap();
        assert_eq!(conn.requests.len(), 1);
        assert!(!conn.requests[&1].is_finished());
    }

    #[test]
    fn unknown_role_rejected_without_request() {
        let (mut conn, mut rx) = test_conn();
        let mut content = [0; 8];
        fcgi::wire::put_u16(&mut content, 99);
        conn.dispatch(&record(RecordType::BeginRequest, 7, &content)).unwrap();

        assert!(conn.requests.is_empty());
        let records = reply_records(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.rtype, u8::from(RecordType::EndRequest));
        assert_eq!(records[0].header.request_id, 7);
        let end = body::EndRequest::from_bytes(records[0].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.protocol_status, ProtocolStatus::UnknownRole);
        assert_eq!(end.app_status, 0);
    }

    #[test]
    fn unregistered_role_rejected() {
        let (mut conn, mut rx) = test_conn();
        let body = body::BeginRequest {
            role: Role::Authorizer,
            flags: fcgi::RequestFlags::empty(),
        };
        conn.dispatch(&record(RecordType::BeginRequest, 3, &body.to_bytes())).unwrap();
        assert!(conn.requests.is_empty());
        let records = reply_records(&mut rx);
        let end = body::EndRequest::from_bytes(records[0].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.protocol_status, ProtocolStatus::UnknownRole);
    }

    #[test]
    fn stdin_before_params_close_is_violation() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        let res = conn.dispatch(&record(RecordType::Stdin, 1, b"early"));
        assert!(matches!(res, Err(ProtocolViolation::UnexpectedRecord { .. })));
    }

    #[test]
    fn params_after_close_is_violation() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        conn.dispatch(&record(RecordType::Params, 1, b"")).unwrap();
        assert_eq!(conn.requests[&1].state(), RequestState::Ready);
        let res = conn.dispatch(&record(RecordType::Params, 1, b"\x01\x01ab"));
        assert!(matches!(res, Err(ProtocolViolation::UnexpectedRecord { .. })));
    }

    #[test]
    fn stream_for_unknown_request_is_violation() {
        let (mut conn, _rx) = test_conn();
        let res = conn.dispatch(&record(RecordType::Params, 42, b""));
        assert!(matches!(
            res,
            Err(ProtocolViolation::UnexpectedRecord { request_id: 42, .. }),
        ));
    }

    #[test]
    fn malformed_params_is_violation() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        conn.dispatch(&record(RecordType::Params, 1, b"\x7f\x01xy")).unwrap();
        let res = conn.dispatch(&record(RecordType::Params, 1, b""));
        assert!(matches!(res, Err(ProtocolViolation::Field(_))));
    }

    #[test]
    fn ready_request_accepts_stdin_then_close() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        conn.dispatch(&record(RecordType::Params, 1, b"\x0b\x02SERVER_PORT80")).unwrap();
        conn.dispatch(&record(RecordType::Params, 1, b"")).unwrap();
        conn.dispatch(&record(RecordType::Stdin, 1, b"post body")).unwrap();
        conn.dispatch(&record(RecordType::Stdin, 1, b"")).unwrap();

        let request = &conn.requests[&1];
        assert!(request.stdin().is_ready());
        let mut buf = [0; 16];
        let n = request.stdin().read(&mut buf);
        assert_eq!(&buf[..n], b"post body");
        assert_eq!(conn.queue.len(), 1, "ready request enqueued exactly one job");
    }

    #[test]
    fn filter_role_data_routed_to_data_stream() {
        struct Idle;
        impl crate::handler::Handler for Idle {
            fn step(&mut self, _: &Request) -> bool {
                false
            }
        }

        let mut registry = Registry::new();
        registry.register(crate::handler::FnFactory::new(
            |role| role == u16::from(Role::Filter),
            |_| Box::new(Idle),
        ));
        let (wire, _rx) = WireTx::channel();
        let mut conn = Connection {
            requests: HashMap::new(),
            wire,
            registry: Arc::new(registry),
            queue: Arc::new(WorkQueue::new()),
            config: Arc::new(Config::new("127.0.0.1:9800")),
        };

        let begin = body::BeginRequest {
            role: Role::Filter,
            flags: fcgi::RequestFlags::KEEP_CONN,
        };
        conn.dispatch(&record(RecordType::BeginRequest, 6, &begin.to_bytes())).unwrap();
        conn.dispatch(&record(RecordType::Params, 6, b"")).unwrap();
        conn.dispatch(&record(RecordType::Stdin, 6, b"")).unwrap();
        conn.dispatch(&record(RecordType::Data, 6, b"upstream file")).unwrap();
        conn.dispatch(&record(RecordType::Data, 6, b"")).unwrap();

        let request = &conn.requests[&6];
        assert_eq!(request.role(), Role::Filter);
        assert!(request.stdin().is_ready());
        assert!(request.data().is_ready());
        // DATA bytes land in the DATA stream, not in STDIN
        assert_eq!(request.stdin().total_len(), 0);
        let mut buf = [0; 32];
        let n = request.data().read(&mut buf);
        assert_eq!(&buf[..n], b"upstream file");
    }

    #[test]
    fn abort_unknown_request_ignored() {
        let (mut conn, mut rx) = test_conn();
        conn.dispatch(&record(RecordType::AbortRequest, 9, b"")).unwrap();
        assert!(reply_records(&mut rx).is_empty());
    }

    #[test]
    fn sweep_drops_finished() {
        let (mut conn, _rx) = test_conn();
        conn.dispatch(&begin_record(1, true)).unwrap();
        conn.dispatch(&begin_record(2, true)).unwrap();
        conn.requests[&1].finish(0);
        conn.sweep();
        assert_eq!(conn.requests.len(), 1);
        assert!(conn.requests.contains_key(&2));
    }
}
