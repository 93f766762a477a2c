//! Encoder output as seen by a packetizer.
//!
//! Two shapes exist:
//!
//! - [`BufferSource`]: discrete encoded buffers with presentation times,
//!   handed over through a bounded channel ([`buffer_channel`]).
//! - [`ReaderSource`]: an unframed byte pipe wrapping any [`Read`].
//!
//! Both carry a [`CloseHandle`]. Closing it makes every pending and future
//! read fail with a "source closed" error, which the packetizer treats as a
//! normal stop. A pipe read that is already blocked only returns once the
//! pipe itself is shut, so piped sources register a shutdown hook with
//! [`ReaderSource::with_shutdown`].

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use parking_lot::Mutex;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Whether a source delivers framed buffers or a raw pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Buffered,
    Piped,
}

/// Encoded bitstream consumed by a packetizer worker.
pub trait MediaSource: Send {
    /// Read up to `buf.len()` bytes. Blocks until data is available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bytes left in the current buffer. Always 0 for piped sources.
    fn available(&self) -> usize;

    /// Presentation time of the buffer currently being read, in microseconds.
    fn presentation_time_us(&self) -> u64;

    fn kind(&self) -> SourceKind;

    fn close_handle(&self) -> CloseHandle;
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Shared closed flag for a source, plus the hooks that unblock a read
/// already waiting on the underlying pipe.
#[derive(Clone, Default)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
    hooks: Arc<Mutex<Vec<ShutdownHook>>>,
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` on close, or right away if already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.is_closed() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Mark the source closed and run the shutdown hooks once.
    pub fn close(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Payload of the error returned by reads on a closed source.
#[derive(Debug, thiserror::Error)]
#[error("source closed")]
pub struct SourceClosed;

/// Error returned by reads on a closed source.
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, SourceClosed)
}

/// Whether `e` came from [`closed_error`]. Other broken pipes are failures.
pub fn is_closed_error(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<SourceClosed>())
}

struct EncodedBuffer {
    data: Vec<u8>,
    pts_us: u64,
}

/// Producer half of [`buffer_channel`], held by the encoder.
pub struct BufferSink {
    tx: SyncSender<EncodedBuffer>,
    closed: CloseHandle,
}

impl BufferSink {
    /// Hand one encoded buffer to the packetizer. Blocks while the channel
    /// is full; fails once the consumer is closed or gone.
    pub fn push(&self, data: Vec<u8>, pts_us: u64) -> io::Result<()> {
        if self.closed.is_closed() {
            return Err(closed_error());
        }
        self.tx
            .send(EncodedBuffer { data, pts_us })
            .map_err(|_| closed_error())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Consumer half of [`buffer_channel`].
pub struct BufferSource {
    rx: Receiver<EncodedBuffer>,
    current: Vec<u8>,
    pos: usize,
    pts_us: u64,
    closed: CloseHandle,
}

/// Bounded handoff of encoded buffers from an encoder to a packetizer.
pub fn buffer_channel(depth: usize) -> (BufferSink, BufferSource) {
    let (tx, rx) = mpsc::sync_channel(depth);
    let closed = CloseHandle::new();
    (
        BufferSink {
            tx,
            closed: closed.clone(),
        },
        BufferSource {
            rx,
            current: Vec::new(),
            pos: 0,
            pts_us: 0,
            closed,
        },
    )
}

impl MediaSource for BufferSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.closed.is_closed() {
                return Err(closed_error());
            }
            if self.pos < self.current.len() {
                let n = buf.len().min(self.current.len() - self.pos);
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(next) => {
                    self.current = next.data;
                    self.pos = 0;
                    self.pts_us = next.pts_us;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "encoder finished",
                    ));
                }
            }
        }
    }

    fn available(&self) -> usize {
        self.current.len() - self.pos
    }

    fn presentation_time_us(&self) -> u64 {
        self.pts_us
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Buffered
    }

    fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }
}

/// An unframed byte pipe.
pub struct ReaderSource<R> {
    inner: R,
    closed: CloseHandle,
}

impl<R: Read + Send> ReaderSource<R> {
    /// A pipe whose reads always return on their own, such as a file or
    /// an in-memory buffer.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            closed: CloseHandle::new(),
        }
    }

    /// A pipe that can block indefinitely. `shutdown` runs on close and
    /// must make a pending read return, for example by dropping the write
    /// end, killing the producing process or shutting down a socket.
    pub fn with_shutdown(inner: R, shutdown: impl FnOnce() + Send + 'static) -> Self {
        let source = Self::new(inner);
        source.closed.on_close(shutdown);
        source
    }
}

impl<R: Read + Send> MediaSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.is_closed() {
            return Err(closed_error());
        }
        let result = self.inner.read(buf);
        // A close that raced with the read wins over whatever the pipe
        // reported.
        if self.closed.is_closed() {
            return Err(closed_error());
        }
        match result {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed by encoder",
            )),
            other => other,
        }
    }

    fn available(&self) -> usize {
        0
    }

    fn presentation_time_us(&self) -> u64 {
        0
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Piped
    }

    fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }
}

/// Fill `buf` completely from `source`.
pub fn read_exact(source: &mut dyn MediaSource, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        filled += source.read(&mut buf[filled..])?;
    }
    Ok(())
}

/// Discard everything up to and including the `mdat` box tag.
///
/// Recorders that wrap their output in an MP4 container write the header
/// first; the elementary stream starts right after the tag.
pub fn skip_mp4_header(source: &mut dyn MediaSource) -> io::Result<()> {
    let mut window = [0u8; 4];
    let mut byte = [0u8; 1];
    loop {
        read_exact(source, &mut byte)?;
        window.rotate_left(1);
        window[3] = byte[0];
        if &window == b"mdat" {
            tracing::debug!("skipped mp4 header");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;

    #[test]
    fn buffer_source_reports_available_and_pts() {
        let (sink, mut source) = buffer_channel(4);
        sink.push(vec![1, 2, 3, 4, 5], 1_000).unwrap();
        sink.push(vec![6, 7], 2_000).unwrap();

        let mut head = [0u8; 2];
        read_exact(&mut source, &mut head).unwrap();
        assert_eq!(head, [1, 2]);
        assert_eq!(source.available(), 3);
        assert_eq!(source.presentation_time_us(), 1_000);

        let mut rest = [0u8; 3];
        read_exact(&mut source, &mut rest).unwrap();
        assert_eq!(source.available(), 0);

        let mut next = [0u8; 1];
        read_exact(&mut source, &mut next).unwrap();
        assert_eq!(next, [6]);
        assert_eq!(source.presentation_time_us(), 2_000);
    }

    #[test]
    fn closing_unblocks_a_waiting_reader() {
        let (_sink, mut source) = buffer_channel(1);
        let handle = source.close_handle();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 1];
            source.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        handle.close();
        let err = reader.join().unwrap().unwrap_err();
        assert!(is_closed_error(&err));
    }

    #[test]
    fn closing_shuts_a_quiet_pipe() {
        let (reader, writer) = io::pipe().unwrap();
        let writer = Mutex::new(Some(writer));
        let mut source = ReaderSource::with_shutdown(reader, move || drop(writer.lock().take()));
        let handle = source.close_handle();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 1];
            let _ = tx.send(source.read(&mut buf));
        });
        thread::sleep(Duration::from_millis(50));
        handle.close();
        let err = rx.recv_timeout(Duration::from_secs(3)).unwrap().unwrap_err();
        assert!(is_closed_error(&err));
    }

    #[test]
    fn hook_registered_after_close_runs_at_once() {
        let handle = CloseHandle::new();
        handle.close();
        let (tx, rx) = mpsc::channel();
        handle.on_close(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn only_the_close_sentinel_is_a_close() {
        assert!(is_closed_error(&closed_error()));
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "encoder crashed");
        assert!(!is_closed_error(&broken));
        assert!(!is_closed_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn dropped_sink_is_end_of_stream() {
        let (sink, mut source) = buffer_channel(1);
        drop(sink);
        let mut buf = [0u8; 1];
        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn skips_container_header() {
        let mut data = b"\0\0\0\x18ftypisom....moov....\0\0\0\0mdat".to_vec();
        data.extend_from_slice(&[0xAB, 0xCD]);
        let mut source = ReaderSource::new(Cursor::new(data));
        skip_mp4_header(&mut source).unwrap();
        let mut next = [0u8; 2];
        read_exact(&mut source, &mut next).unwrap();
        assert_eq!(next, [0xAB, 0xCD]);
    }
}
