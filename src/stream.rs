//! Per-request stream buffers.
//!
//! [`InputStream`] collects the chunks of a PARAMS, STDIN, or DATA stream as
//! they arrive on the connection task and hands them to the handler on a
//! worker thread. [`OutputStream`] buffers handler output in a fixed-size
//! chunk and emits STDOUT/STDERR records through the connection's serialized
//! writer on overflow, flush, and close.
//!
//! Both sides are plain lock-protected buffers: appends happen on the I/O
//! task, reads and writes on whichever worker currently runs the handler.

use std::sync::{Mutex, PoisonError};

use crate::conn::WireTx;
use crate::protocol::RecordType;
use crate::Error;


#[derive(Debug, Default)]
struct InputInner {
    chunks: Vec<Box<[u8]>>,
    /// Cursor: index of the chunk being read and the offset inside it.
    chunk: usize,
    offset: usize,
    total: usize,
    closed: bool,
}

/// An ordered sequence of received byte chunks with a closed flag.
///
/// The stream is closed by the zero-length record of its type; only then is
/// it *ready* and may be repositioned with [`InputStream::seek`]. Reads
/// before that point drain whatever has arrived so far and return 0 when no
/// data is currently buffered.
#[derive(Debug, Default)]
pub struct InputStream {
    inner: Mutex<InputInner>,
}

impl InputStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InputInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a received chunk.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] if the end-of-stream record was
    /// already received.
    pub(crate) fn append_chunk(&self, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::StreamClosed);
        }
        inner.total += data.len();
        inner.chunks.push(data.into());
        Ok(())
    }

    /// Marks the end of the stream. Closing twice is a no-op.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    /// Tests whether the stream has been fully received.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().closed
    }

    /// The number of bytes received so far.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.lock().total
    }

    /// Reads the next bytes into `buf`, advancing the stream position.
    ///
    /// Returns the number of bytes read. 0 means either end-of-stream (if
    /// [`InputStream::is_ready`]) or that no data has arrived yet; handlers
    /// are expected to yield and retry in the latter case.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut read = 0;
        while read < buf.len() && inner.chunk < inner.chunks.len() {
            let chunk = &inner.chunks[inner.chunk];
            let avail = &chunk[inner.offset..];
            let take = avail.len().min(buf.len() - read);
            buf[read..(read + take)].copy_from_slice(&avail[..take]);
            read += take;
            inner.offset += take;
            if inner.offset == chunk.len() {
                inner.chunk += 1;
                inner.offset = 0;
            }
        }
        read
    }

    /// Repositions the stream to an absolute byte offset.
    ///
    /// # Errors
    /// Returns [`Error::StreamNotReady`] before the stream is closed; random
    /// access is only defined once all chunks are present. Seeking past the
    /// end positions the stream at end-of-stream.
    pub fn seek(&self, pos: usize) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.closed {
            return Err(Error::StreamNotReady);
        }
        let mut rem = pos;
        inner.chunk = 0;
        inner.offset = 0;
        while inner.chunk < inner.chunks.len() {
            let len = inner.chunks[inner.chunk].len();
            if rem < len {
                inner.offset = rem;
                return Ok(());
            }
            rem -= len;
            inner.chunk += 1;
        }
        Ok(())
    }

    /// Copies the entire stream contents into one buffer, ignoring the
    /// current read position.
    pub(crate) fn copy_to_vec(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = Vec::with_capacity(inner.total);
        for chunk in &inner.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}


#[derive(Debug)]
struct OutputInner {
    chunk: Vec<u8>,
    dirty: bool,
    closed: bool,
}

/// A write-through chunked emitter for one output stream of one request.
///
/// Data accumulates in a chunk of the configured size and leaves as a
/// STDOUT/STDERR record whenever the chunk fills, on [`flush`], and finally
/// on [`close`]. Closing emits the protocol's zero-length end-of-stream
/// record, at most once, and only if the stream ever carried data.
///
/// [`flush`]: OutputStream::flush
/// [`close`]: OutputStream::close
#[derive(Debug)]
pub struct OutputStream {
    wire: WireTx,
    rtype: RecordType,
    request_id: u16,
    chunk_size: usize,
    inner: Mutex<OutputInner>,
}

impl OutputStream {
    pub(crate) fn new(wire: WireTx, rtype: RecordType, request_id: u16, chunk_size: usize) -> Self {
        Self {
            wire,
            rtype,
            request_id,
            chunk_size,
            inner: Mutex::new(OutputInner {
                chunk: Vec::with_capacity(chunk_size),
                dirty: false,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, inner: &mut OutputInner) -> Result<(), Error> {
        if inner.chunk.is_empty() {
            return Ok(());
        }
        self.wire.send_stream(self.rtype, self.request_id, &inner.chunk)?;
        inner.chunk.clear();
        Ok(())
    }

    /// Appends `data` to the stream, emitting records as the chunk fills.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] after [`OutputStream::close`], or if
    /// the owning connection is gone.
    pub fn write(&self, mut data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::StreamClosed);
        }
        inner.dirty |= !data.is_empty();
        while !data.is_empty() {
            let space = self.chunk_size - inner.chunk.len();
            let take = space.min(data.len());
            inner.chunk.extend_from_slice(&data[..take]);
            data = &data[take..];
            if inner.chunk.len() == self.chunk_size {
                self.emit(&mut inner)?;
            }
        }
        Ok(())
    }

    /// Emits any buffered partial chunk as a record.
    ///
    /// # Errors
    /// Returns [`Error::StreamClosed`] after [`OutputStream::close`], or if
    /// the owning connection is gone.
    pub fn flush(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::StreamClosed);
        }
        self.emit(&mut inner)
    }

    /// Flushes and emits the end-of-stream record, marking the stream closed.
    ///
    /// Closing an already-closed stream is a no-op, and a stream that never
    /// carried data closes silently (no record appears on the wire).
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        if !inner.dirty {
            return;
        }
        // Best effort: the connection may already be torn down
        if self.emit(&mut inner).is_ok() {
            let _ = self.wire.send_stream(self.rtype, self.request_id, &[]);
        }
    }

    /// Tests whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
