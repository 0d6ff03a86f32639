//! A multiplexing FastCGI application server core.
//!
//! `fcgi_mux` speaks the FastCGI 1.0 wire protocol towards an HTTP reverse
//! proxy: it frames records out of the byte stream, multiplexes many logical
//! requests over each transport connection, dispatches every request to a
//! user-registered [`Handler`], and streams the handler's output back as
//! STDOUT/STDERR records. I/O runs on a single-threaded reactor; handlers
//! run as cooperative steps on a pool of worker threads.
//!
//! The pieces, bottom-up:
//! - [`protocol`] — record headers, fixed bodies, and the name-value codec.
//! - [`parser`] — the incremental record-framing state machine.
//! - [`stream`] — per-request input buffers and chunked output emitters.
//! - [`request`] — the multiplexed request and its lifecycle.
//! - [`handler`] — the application-facing trait and the role registry.
//! - [`worker`] — the step-callback queue and worker threads.
//! - [`conn`] — per-connection dispatch and the serialized write path.
//! - [`server`] — bind grammar, accept loop, garbage collection, shutdown.
//!
//! HTTP itself is out of scope: the proxy delivers the request environment
//! pre-parsed in PARAMS records, and TLS stays on the proxy side.

#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious)]
#![deny(clippy::exit, clippy::semicolon_inside_block)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

use std::num::NonZeroUsize;
use std::time::Duration;

use compact_str::CompactString;

pub mod conn;
pub mod handler;
mod macros;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod server;
pub mod stream;
pub mod worker;

pub use conn::ProtocolViolation;
pub use handler::{Handler, HandlerFactory, Registry};
pub use request::Request;
pub use server::{BindAddr, Server, DEFAULT_PORT};


/// The default output stream chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4086;

/// The default garbage-collection interval.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10);


/// Server configuration, as recognised at the process boundary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where to listen: `unix:PATH`, `HOST:PORT`, or `HOST` (default port
    /// [`DEFAULT_PORT`]).
    pub bind: String,
    /// Number of worker threads; 0 selects the available hardware
    /// parallelism.
    pub worker_threads: usize,
    /// How often finished requests and dead connections are swept.
    pub gc_interval: Duration,
    /// Output stream chunk size; each filled chunk leaves as one record.
    pub chunk_size: usize,
    /// Connection capacity advertised through GET_VALUES.
    pub max_conns: NonZeroUsize,
}

impl Config {
    /// Creates a configuration with defaults for everything but the
    /// (required) bind address.
    #[must_use]
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            worker_threads: 0,
            gc_interval: DEFAULT_GC_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_conns: NonZeroUsize::MIN.saturating_add(63),
        }
    }

    /// Checks option values; called by [`Server::new`].
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the offending option.
    pub fn validate(&self) -> Result<(), Error> {
        self.bind.parse::<BindAddr>()?;
        if self.chunk_size == 0 {
            return Err(Error::Config("output chunk size must be nonzero".into()));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::Config("garbage-collection interval must be nonzero".into()));
        }
        Ok(())
    }
}


/// The error taxonomy at the library boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A socket-level read, write, or bind failure. Aborts the affected
    /// connection; the listener itself keeps running.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed record or a protocol ordering violation. Aborts the
    /// connection it occurred on.
    #[error("FastCGI protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A write to a closed stream, or a stream whose connection is gone.
    #[error("stream is closed")]
    StreamClosed,

    /// A random-access read on an input stream that is still receiving.
    #[error("stream has not been fully received yet")]
    StreamNotReady,

    /// An invalid option value or bind string. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(CompactString),
}
