//! A logical FastCGI request multiplexed onto one connection.
//!
//! A [`Request`] is created by the dispatcher on BeginRequest and shared as
//! an [`Arc`](std::sync::Arc) between the connection task (which feeds its
//! input streams)
//! and the worker threads (which drive its handler). Whoever holds the last
//! reference frees it; the connection's garbage collection merely drops its
//! own table entry once the request has finished.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU16;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use compact_str::CompactString;
use once_cell::sync::OnceCell;
use smallvec::SmallVec;

use crate::conn::WireTx;
use crate::handler::Handler;
use crate::protocol::{self as fcgi, body, nv, ProtocolStatus, RecordType, Role};
use crate::stream::{InputStream, OutputStream};
use crate::Error;


/// Inline-capacity storage for one parameter value.
///
/// Typical CGI values (ports, methods, short paths) fit inline; long ones
/// spill to the heap.
pub type ParamValue = SmallVec<[u8; 22]>;

/// The environment parsed from a request's PARAMS stream.
pub type ParamsMap = HashMap<CompactString, ParamValue>;


/// The lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Created; no PARAMS data received yet.
    Init = 0,
    /// PARAMS records are being accumulated.
    ParamsOpen = 1,
    /// PARAMS is closed and parsed; the handler is running.
    Ready = 2,
    /// END_REQUEST has been emitted (or the connection is gone).
    Finished = 3,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::ParamsOpen,
            2 => Self::Ready,
            _ => Self::Finished,
        }
    }
}


/// One multiplexed request and the state shared about it.
pub struct Request {
    id: NonZeroU16,
    role: Role,
    keep_conn: bool,
    wire: WireTx,
    state: AtomicU8,
    aborted: AtomicBool,
    params: OnceCell<ParamsMap>,
    param_stream: InputStream,
    stdin_stream: InputStream,
    data_stream: InputStream,
    stdout: OutputStream,
    stderr: OutputStream,
    handler: Mutex<Option<Box<dyn Handler>>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("keep_conn", &self.keep_conn)
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Request {
    pub(crate) fn new(
        id: NonZeroU16,
        role: Role,
        keep_conn: bool,
        wire: WireTx,
        chunk_size: usize,
    ) -> Self {
        let raw_id = id.get();
        Self {
            id,
            role,
            keep_conn,
            stdout: OutputStream::new(wire.clone(), RecordType::Stdout, raw_id, chunk_size),
            stderr: OutputStream::new(wire.clone(), RecordType::Stderr, raw_id, chunk_size),
            wire,
            state: AtomicU8::new(RequestState::Init as u8),
            aborted: AtomicBool::new(false),
            params: OnceCell::new(),
            param_stream: InputStream::new(),
            stdin_stream: InputStream::new(),
            data_stream: InputStream::new(),
            handler: Mutex::new(None),
        }
    }

    /// The request's nonzero ID, unique on its connection.
    #[inline]
    #[must_use]
    pub fn id(&self) -> NonZeroU16 {
        self.id
    }

    /// The role the application plays for this request.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the FastCGI client asked to keep the connection open after
    /// this request finishes.
    #[inline]
    #[must_use]
    pub fn keep_connection(&self) -> bool {
        self.keep_conn
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Tests whether the client aborted this request.
    ///
    /// Handlers should check this between cooperative steps and wind down
    /// promptly when set.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Tests whether the request has finished.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    /// The parsed PARAMS environment, available once the request is ready.
    #[must_use]
    pub fn params(&self) -> Option<&ParamsMap> {
        self.params.get()
    }

    /// Looks up one environment variable by exact name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.get()?.get(name).map(AsRef::as_ref)
    }

    /// Looks up one environment variable, requiring a UTF-8 value.
    #[must_use]
    pub fn param_str(&self, name: &str) -> Option<&str> {
        std::str::from_utf8(self.param(name)?).ok()
    }

    /// The request's STDIN stream.
    #[inline]
    #[must_use]
    pub fn stdin(&self) -> &InputStream {
        &self.stdin_stream
    }

    /// The request's DATA stream (meaningful for the Filter role).
    #[inline]
    #[must_use]
    pub fn data(&self) -> &InputStream {
        &self.data_stream
    }

    /// The request's STDOUT stream.
    #[inline]
    #[must_use]
    pub fn stdout(&self) -> &OutputStream {
        &self.stdout
    }

    /// The request's STDERR stream.
    #[inline]
    #[must_use]
    pub fn stderr(&self) -> &OutputStream {
        &self.stderr
    }

    /// Writes a response message to STDOUT.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] once the request has finished or its
    /// connection is gone.
    #[inline]
    pub fn send(&self, message: &[u8]) -> Result<(), Error> {
        self.stdout.write(message)
    }

    /// Writes a diagnostic message to STDERR.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] once the request has finished or its
    /// connection is gone.
    #[inline]
    pub fn send_err(&self, message: &[u8]) -> Result<(), Error> {
        self.stderr.write(message)
    }

    /// Completes the request with the given application status.
    ///
    /// Open output streams are flushed and closed (emitting their
    /// end-of-stream records), END_REQUEST goes out, and — unless the client
    /// requested keep-connection — the connection is told to close once the
    /// record is on the wire. Finishing twice is a no-op.
    pub fn finish(&self, app_status: u32) {
        let prev = self.state.swap(RequestState::Finished as u8, Ordering::AcqRel);
        if prev == RequestState::Finished as u8 {
            return;
        }
        self.stdout.close();
        self.stderr.close();

        let end = body::EndRequest {
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        };
        let _ = self.wire.send_fixed(end.to_record(self.id.get()));
        if !self.keep_conn {
            self.wire.send_close();
        }
        tracing::debug!(
            request_id = self.id.get(),
            app_status,
            keep_connection = self.keep_conn,
            "request finished",
        );
    }

    fn handler_guard(&self) -> MutexGuard<'_, Option<Box<dyn Handler>>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach_handler(&self, handler: Box<dyn Handler>) {
        *self.handler_guard() = Some(handler);
    }

    /// Accepts a PARAMS payload chunk.
    pub(crate) fn append_params(&self, chunk: &[u8]) {
        self.state.store(RequestState::ParamsOpen as u8, Ordering::Release);
        // The dispatcher only routes PARAMS here before the stream closes
        let _ = self.param_stream.append_chunk(chunk);
    }

    /// Closes the PARAMS stream and parses it into the environment map.
    ///
    /// # Errors
    /// Forwards the name-value codec's error for malformed data; the caller
    /// treats it as a protocol violation.
    pub(crate) fn close_params(&self) -> Result<(), fcgi::Error> {
        self.param_stream.close();
        let raw = self.param_stream.copy_to_vec();
        let mut map = ParamsMap::with_capacity(32);
        nv::decode_pairs(&raw, |name, value| {
            map.insert(
                CompactString::from_utf8_lossy(name),
                ParamValue::from_slice(value),
            );
        })?;

        let vars = map.len();
        let _ = self.params.set(map);
        self.state.store(RequestState::Ready as u8, Ordering::Release);
        tracing::debug!(request_id = self.id.get(), vars, "request ready");
        Ok(())
    }

    /// Returns the input stream fed by the given record type.
    pub(crate) fn input_stream(&self, rtype: RecordType) -> &InputStream {
        match rtype {
            RecordType::Params => &self.param_stream,
            RecordType::Data => &self.data_stream,
            _ => &self.stdin_stream,
        }
    }

    /// Forwards a data-arrival notification to the handler.
    ///
    /// Runs on the I/O task; a panicking hook must abort only this request,
    /// never the connection carrying it.
    pub(crate) fn notify_data(&self, rtype: RecordType, chunk: &[u8]) {
        let mut guard = self.handler_guard();
        let Some(handler) = guard.as_mut() else { return };
        if catch_unwind(AssertUnwindSafe(|| handler.on_receive_data(self, rtype, chunk))).is_err() {
            *guard = None;
            drop(guard);
            tracing::error!(request_id = self.id.get(), "handler data notification panicked");
            let _ = self.send_err(b"unhandled error in request handler\n");
            self.finish(1);
        }
    }

    /// Marks the request aborted and runs the handler's abort hook.
    ///
    /// Runs on the I/O task; a panicking hook is contained like in
    /// [`Request::notify_data`], falling back to the default abort outcome.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        tracing::debug!(request_id = self.id.get(), "request aborted by client");
        let mut guard = self.handler_guard();
        let Some(handler) = guard.as_mut() else {
            drop(guard);
            self.finish(1);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| handler.on_abort(self))).is_err() {
            *guard = None;
            drop(guard);
            tracing::error!(request_id = self.id.get(), "handler abort hook panicked");
            self.finish(1);
        }
    }

    /// Detaches the request from a dying connection.
    ///
    /// No further records can be sent; pending worker steps observe the
    /// finished state and retire without output.
    pub(crate) fn abandon(&self) {
        self.aborted.store(true, Ordering::Release);
        self.state.store(RequestState::Finished as u8, Ordering::Release);
    }

    /// Runs one handler step on a worker thread.
    ///
    /// Returns `true` when the job is complete and must not be re-enqueued.
    pub(crate) fn run_step(&self) -> bool {
        if self.is_finished() {
            *self.handler_guard() = None;
            return true;
        }
        let mut guard = self.handler_guard();
        let Some(handler) = guard.as_mut() else { return true };

        match catch_unwind(AssertUnwindSafe(|| handler.step(self))) {
            Ok(false) => false,
            Ok(true) => {
                *guard = None;
                drop(guard);
                // Handlers normally finish themselves; make sure END_REQUEST
                // is not lost if one forgot.
                self.finish(0);
                true
            },
            Err(_) => {
                *guard = None;
                drop(guard);
                tracing::error!(request_id = self.id.get(), "handler step panicked");
                let _ = self.send_err(b"unhandled error in request handler\n");
                self.finish(1);
                true
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::conn::{WireMsg, WireTx};
    use crate::parser::{Record, RecordParser};
    use super::*;

    fn test_request(keep_conn: bool) -> (Arc<Request>, tokio::sync::mpsc::UnboundedReceiver<WireMsg>) {
        let (wire, rx) = WireTx::channel();
        let id = NonZeroU16::new(1).unwrap();
        (Arc::new(Request::new(id, Role::Responder, keep_conn, wire, 4086)), rx)
    }

    fn drain_records(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WireMsg>) -> (Vec<Record>, bool) {
        let mut parser = RecordParser::new();
        let mut records = Vec::new();
        let mut closed = false;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                WireMsg::Frame(frame) => {
                    let mut rest = &frame[..];
                    while !rest.is_empty() {
                        let (used, rec) = parser.feed(rest);
                        rest = &rest[used..];
                        records.extend(rec);
                    }
                },
                WireMsg::Close => closed = true,
            }
        }
        (records, closed)
    }

    struct Hello;
    impl Handler for Hello {
        fn step(&mut self, request: &Request) -> bool {
            request.send(b"hello").unwrap();
            request.finish(0);
            true
        }
    }

    #[test]
    fn params_lifecycle() {
        let (req, _rx) = test_request(true);
        assert_eq!(req.state(), RequestState::Init);

        req.append_params(b"\x0b\x02SERVER_PORT80");
        assert_eq!(req.state(), RequestState::ParamsOpen);
        assert!(req.params().is_none());

        req.close_params().unwrap();
        assert_eq!(req.state(), RequestState::Ready);
        assert_eq!(req.param("SERVER_PORT"), Some(b"80".as_slice()));
        assert_eq!(req.param_str("SERVER_PORT"), Some("80"));
        assert!(req.param("MISSING").is_none());
    }

    #[test]
    fn params_split_across_records() {
        let (req, _rx) = test_request(true);
        // One pair split mid-name across two PARAMS payloads
        req.append_params(b"\x11\x07GATEWAY_INT");
        req.append_params(b"ERFACECGI/1.1");
        req.close_params().unwrap();
        assert_eq!(req.param_str("GATEWAY_INTERFACE"), Some("CGI/1.1"));
    }

    #[test]
    fn malformed_params_rejected() {
        let (req, _rx) = test_request(true);
        req.append_params(b"\x7f\x01no");
        assert!(req.close_params().is_err());
    }

    #[test]
    fn step_emits_and_finishes() {
        let (req, mut rx) = test_request(true);
        req.attach_handler(Box::new(Hello));
        assert!(req.run_step());
        assert!(req.is_finished());

        let (records, closed) = drain_records(&mut rx);
        assert!(!closed, "keep-connection request must not close the wire");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].header.rtype, u8::from(RecordType::Stdout));
        assert_eq!(records[0].content, b"hello");
        assert_eq!(records[1].content, b"", "stdout end-of-stream marker");
        assert_eq!(records[2].header.rtype, u8::from(RecordType::EndRequest));
        let end = body::EndRequest::from_bytes(records[2].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.app_status, 0);
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);
    }

    #[test]
    fn finish_without_keep_closes_wire() {
        let (req, mut rx) = test_request(false);
        req.finish(7);
        let (records, closed) = drain_records(&mut rx);
        assert!(closed);
        assert_eq!(records.len(), 1, "untouched streams stay silent");
        let end = body::EndRequest::from_bytes(records[0].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.app_status, 7);
    }

    #[test]
    fn finish_is_idempotent() {
        let (req, mut rx) = test_request(true);
        req.send(b"x").unwrap();
        req.finish(0);
        req.finish(3);
        assert!(matches!(req.send(b"late"), Err(Error::StreamClosed)));

        let (records, _) = drain_records(&mut rx);
        // STDOUT data + EOF + exactly one END_REQUEST
        assert_eq!(records.len(), 3);
        let ends = records
            .iter()
            .filter(|r| r.header.rtype == u8::from(RecordType::EndRequest))
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn default_abort_finishes_with_one() {
        struct Lingering;
        impl Handler for Lingering {
            fn step(&mut self, _: &Request) -> bool {
                false
            }
        }

        let (req, mut rx) = test_request(true);
        req.attach_handler(Box::new(Lingering));
        assert!(!req.run_step());

        req.abort();
        assert!(req.is_aborted());
        assert!(req.is_finished());
        assert!(req.run_step(), "aborted request retires its job");

        let (records, _) = drain_records(&mut rx);
        assert_eq!(records.len(), 1);
        let end = body::EndRequest::from_bytes(records[0].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.app_status, 1);
    }

    #[test]
    fn panicking_handler_reports_failure() {
        struct Exploding;
        impl Handler for Exploding {
            fn step(&mut self, _: &Request) -> bool {
                panic!("boom");
            }
        }

        let (req, mut rx) = test_request(true);
        req.attach_handler(Box::new(Exploding));
        assert!(req.run_step());
        assert!(req.is_finished());

        let (records, _) = drain_records(&mut rx);
        let stderr: Vec<_> = records
            .iter()
            .filter(|r| r.header.rtype == u8::from(RecordType::Stderr))
            .collect();
        assert_eq!(stderr.len(), 2, "stderr note plus end-of-stream");
        assert!(!stderr[0].content.is_empty());
        let end = records.last().unwrap();
        assert_eq!(end.header.rtype, u8::from(RecordType::EndRequest));
        let end = body::EndRequest::from_bytes(end.content[..].try_into().unwrap()).unwrap();
        assert_ne!(end.app_status, 0);
    }

    #[test]
    fn panicking_data_hook_aborts_only_the_request() {
        struct BadNotify;
        impl Handler for BadNotify {
            fn step(&mut self, _: &Request) -> bool {
                false
            }
            fn on_receive_data(&mut self, _: &Request, _: RecordType, _: &[u8]) {
                panic!("notification boom");
            }
        }

        let (req, mut rx) = test_request(true);
        req.attach_handler(Box::new(BadNotify));
        // Must return normally instead of unwinding into the caller
        req.notify_data(RecordType::Stdin, b"chunk");
        assert!(req.is_finished());

        let (records, _) = drain_records(&mut rx);
        let end = records.last().unwrap();
        assert_eq!(end.header.rtype, u8::from(RecordType::EndRequest));
        let end = body::EndRequest::from_bytes(end.content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.app_status, 1);

        // The handler is gone; further notifications are a no-op
        req.notify_data(RecordType::Stdin, b"more");
        assert!(drain_records(&mut rx).0.is_empty());
    }

    #[test]
    fn panicking_abort_hook_still_finishes() {
        struct BadAbort;
        impl Handler for BadAbort {
            fn step(&mut self, _: &Request) -> bool {
                false
            }
            fn on_abort(&mut self, _: &Request) {
                panic!("abort boom");
            }
        }

        let (req, mut rx) = test_request(true);
        req.attach_handler(Box::new(BadAbort));
        req.abort();
        assert!(req.is_aborted());
        assert!(req.is_finished());

        let (records, _) = drain_records(&mut rx);
        assert_eq!(records.len(), 1);
        let end = body::EndRequest::from_bytes(records[0].content[..].try_into().unwrap()).unwrap();
        assert_eq!(end.app_status, 1);
    }
}
