//! Framed duplex transport.
//!
//! Every message is a 12-byte header of three i32 fields (tag, id, size)
//! followed by exactly `size` payload bytes. Header integers travel in
//! canonical big-endian order and are only swapped on little-endian hosts;
//! payload bytes are opaque and never swapped. A zero-size frame is sent as
//! the header alone.
//!
//! Two channel flavours implement [`MessageChannel`]:
//!
//! - [`Channel`]: cooperative, single-threaded. Sockets are non-blocking;
//!   `try_recv` reports [`Received::Empty`] when nothing is pending and the
//!   blocking calls wait for readiness before reading.
//! - [`ThreadedChannel`]: one background thread per direction, each owning a
//!   mutex + condvar FIFO. Senders only hold the queue lock long enough to
//!   push; `recv` genuinely blocks on the condvar.
//!
//! Both keep messages in FIFO order per direction. Any I/O error other than
//! would-block or interrupted is returned as a [`TransportError`] and the
//! channel must be treated as dead.

use crate::protocol::tags::Tag;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Whether the canonical wire order is big-endian.
const CANONICAL_BIG_ENDIAN: bool = true;

/// Transport failures. All of them are fatal for the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("malformed frame header: negative size {0}")]
    NegativeSize(i32),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("payload of {0} bytes cannot be framed")]
    PayloadTooLarge(usize),

    #[error("peer closed the channel in the middle of a frame")]
    TruncatedFrame,

    #[error("channel worker thread has stopped")]
    WorkerGone,
}

fn io_err(op: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::Io { op, source }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: i32,
    pub id: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: Tag, id: i32, payload: Vec<u8>) -> Self {
        Self {
            tag: tag as i32,
            id,
            payload,
        }
    }

    /// Payload size as carried in the header.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Decoded tag, or the raw value if this build does not know it.
    pub fn tag(&self) -> Result<Tag, i32> {
        Tag::try_from(self.tag)
    }
}

/// Outcome of a non-blocking receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Frame(Frame),
    /// Nothing pending right now. Not an error.
    Empty,
    /// The peer closed the channel cleanly between frames.
    Closed,
}

#[inline]
fn to_wire_order(v: i32) -> i32 {
    if cfg!(target_endian = "big") == CANONICAL_BIG_ENDIAN {
        v
    } else {
        v.swap_bytes()
    }
}

/// Encode a frame header in canonical order.
pub fn encode_header(tag: i32, id: i32, size: i32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&to_wire_order(tag).to_ne_bytes());
    out[4..8].copy_from_slice(&to_wire_order(id).to_ne_bytes());
    out[8..12].copy_from_slice(&to_wire_order(size).to_ne_bytes());
    out
}

/// Decode a canonical-order frame header into (tag, id, size).
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> (i32, i32, i32) {
    let field = |i: usize| {
        let raw = i32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        // Swapping is its own inverse.
        to_wire_order(raw)
    };
    (field(0), field(4), field(8))
}

/// A byte stream the transport can drive: readable, writable, pollable.
pub trait WireStream: Read + Write + Send + Sized + 'static {
    /// Wait until the stream is readable (or hung up). `false` on timeout.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Wait until the stream accepts more bytes. `false` on timeout.
    fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool>;

    fn try_clone_stream(&self) -> io::Result<Self>;

    fn set_nonblocking_mode(&self, nonblocking: bool) -> io::Result<()>;

    fn shutdown_stream(&self, how: Shutdown) -> io::Result<()>;
}

#[cfg(unix)]
mod unix {
    use super::WireStream;
    use std::io;
    use std::net::{Shutdown, TcpStream};
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        loop {
            // SAFETY: `pfd` is a valid pollfd for the duration of the call and
            // nfds is 1.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }

    macro_rules! impl_wire_stream {
        ($ty:ty) => {
            impl WireStream for $ty {
                fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
                    poll_fd(self.as_raw_fd(), libc::POLLIN, timeout)
                }

                fn wait_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
                    poll_fd(self.as_raw_fd(), libc::POLLOUT, timeout)
                }

                fn try_clone_stream(&self) -> io::Result<Self> {
                    self.try_clone()
                }

                fn set_nonblocking_mode(&self, nonblocking: bool) -> io::Result<()> {
                    self.set_nonblocking(nonblocking)
                }

                fn shutdown_stream(&self, how: Shutdown) -> io::Result<()> {
                    self.shutdown(how)
                }
            }
        };
    }

    impl_wire_stream!(UnixStream);
    impl_wire_stream!(TcpStream);
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Receive half: decodes frames from a stream.
pub struct FrameReader<S> {
    stream: S,
    max_frame: usize,
}

impl<S: WireStream> FrameReader<S> {
    pub fn new(stream: S, max_frame: usize) -> Self {
        Self { stream, max_frame }
    }

    /// Read into `buf` until full, waiting for readiness between attempts.
    fn read_full(&mut self, mut buf: &mut [u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.stream.read(buf) {
                Ok(0) => return Err(TransportError::TruncatedFrame),
                Ok(n) => buf = &mut buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stream
                        .wait_readable(None)
                        .map_err(io_err("poll for read"))?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io { op: "read", source: e }),
            }
        }
        Ok(())
    }

    /// Non-blocking receive.
    ///
    /// Returns `Empty` if no header byte is available, `Closed` on a clean
    /// EOF. Once the first header byte arrives the rest of the frame is read
    /// with retries.
    pub fn try_recv(&mut self) -> Result<Received, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        let first = loop {
            match self.stream.read(&mut header) {
                Ok(0) => return Ok(Received::Closed),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Empty),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io { op: "read", source: e }),
            }
        };
        self.read_full(&mut header[first..])?;

        let (tag, id, size) = decode_header(&header);
        if size < 0 {
            return Err(TransportError::NegativeSize(size));
        }
        let size = size as usize;
        if size > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame,
            });
        }

        let mut payload = vec![0u8; size];
        self.read_full(&mut payload)?;
        Ok(Received::Frame(Frame { tag, id, payload }))
    }

    /// Blocking receive. `None` means the peer closed the channel.
    pub fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.try_recv()? {
                Received::Frame(frame) => return Ok(Some(frame)),
                Received::Closed => return Ok(None),
                Received::Empty => {
                    self.stream
                        .wait_readable(None)
                        .map_err(io_err("poll for read"))?;
                }
            }
        }
    }

    /// Wait up to `timeout` for a frame; `Empty` if none arrived.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Received, TransportError> {
        match self.try_recv()? {
            Received::Empty => {
                let ready = self
                    .stream
                    .wait_readable(Some(timeout))
                    .map_err(io_err("poll for read"))?;
                if ready {
                    self.try_recv()
                } else {
                    Ok(Received::Empty)
                }
            }
            other => Ok(other),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

/// Send half: encodes frames onto a stream.
pub struct FrameWriter<S> {
    stream: S,
}

impl<S: WireStream> FrameWriter<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    fn write_full(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(TransportError::Io {
                        op: "write",
                        source: io::Error::from(io::ErrorKind::WriteZero),
                    })
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stream
                        .wait_writable(None)
                        .map_err(io_err("poll for write"))?;
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) => return Err(TransportError::Io { op: "write", source: e }),
            }
        }
        Ok(())
    }

    /// Write header then payload, retrying until both are fully written.
    pub fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let size = i32::try_from(frame.payload.len())
            .map_err(|_| TransportError::PayloadTooLarge(frame.payload.len()))?;
        let header = encode_header(frame.tag, frame.id, size);
        self.write_full(&header)?;
        if size > 0 {
            self.write_full(&frame.payload)?;
        }
        Ok(())
    }
}

/// Application-facing message channel.
pub trait MessageChannel: Send {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Non-blocking receive.
    fn try_recv(&mut self) -> Result<Received, TransportError>;

    /// Blocking receive. `None` once the peer has closed the channel.
    fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Wait up to `timeout`; `Empty` when nothing arrived in time.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Received, TransportError>;

    /// No-op for cooperative channels, a wake-up for the background writer.
    fn flush(&mut self) -> Result<(), TransportError>;
}

/// How a channel performs its I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    Cooperative,
    Threaded,
}

/// Open a channel of the requested flavour over `stream`.
pub fn open_channel<S: WireStream>(
    stream: S,
    mode: ChannelMode,
    max_frame: usize,
) -> Result<Box<dyn MessageChannel>, TransportError> {
    Ok(match mode {
        ChannelMode::Cooperative => Box::new(Channel::new(stream, max_frame)?),
        ChannelMode::Threaded => Box::new(ThreadedChannel::new(stream, max_frame)?),
    })
}

/// Cooperative single-threaded channel.
pub struct Channel<S> {
    reader: FrameReader<S>,
    writer: FrameWriter<S>,
}

impl<S: WireStream> Channel<S> {
    /// Switch `stream` to non-blocking mode and wrap it.
    pub fn new(stream: S, max_frame: usize) -> Result<Self, TransportError> {
        stream
            .set_nonblocking_mode(true)
            .map_err(io_err("set non-blocking"))?;
        let write_half = stream.try_clone_stream().map_err(io_err("clone stream"))?;
        Ok(Self {
            reader: FrameReader::new(stream, max_frame),
            writer: FrameWriter::new(write_half),
        })
    }
}

impl<S: WireStream> MessageChannel for Channel<S> {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.send(&frame)
    }

    fn try_recv(&mut self) -> Result<Received, TransportError> {
        self.reader.try_recv()
    }

    fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        self.reader.recv()
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Received, TransportError> {
        self.reader.recv_timeout(timeout)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
    error: Option<TransportError>,
}

/// Mutex + condvar guarded FIFO shared with a worker thread.
struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: false,
                error: None,
            }),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A worker that panicked while holding the lock leaves the queue
        // contents intact; keep using them.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self, error: Option<TransportError>) {
        let mut state = self.lock();
        state.closed = true;
        if state.error.is_none() {
            state.error = error;
        }
        drop(state);
        self.ready.notify_all();
    }
}

/// Channel backed by one reader and one writer thread.
pub struct ThreadedChannel<S: WireStream> {
    inbound: Arc<FrameQueue>,
    outbound: Arc<FrameQueue>,
    control: S,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl<S: WireStream> ThreadedChannel<S> {
    pub fn new(stream: S, max_frame: usize) -> Result<Self, TransportError> {
        stream
            .set_nonblocking_mode(true)
            .map_err(io_err("set non-blocking"))?;
        let read_half = stream.try_clone_stream().map_err(io_err("clone stream"))?;
        let write_half = stream.try_clone_stream().map_err(io_err("clone stream"))?;

        let inbound = FrameQueue::new();
        let outbound = FrameQueue::new();

        let reader = {
            let queue = inbound.clone();
            std::thread::Builder::new()
                .name("toolgear-reader".to_string())
                .spawn(move || reader_loop(FrameReader::new(read_half, max_frame), queue))
                .map_err(io_err("spawn reader thread"))?
        };
        let writer = {
            let queue = outbound.clone();
            std::thread::Builder::new()
                .name("toolgear-writer".to_string())
                .spawn(move || writer_loop(FrameWriter::new(write_half), queue))
                .map_err(io_err("spawn writer thread"))?
        };

        Ok(Self {
            inbound,
            outbound,
            control: stream,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    fn pop_inbound(state: &mut QueueState) -> Option<Result<Received, TransportError>> {
        if let Some(frame) = state.frames.pop_front() {
            return Some(Ok(Received::Frame(frame)));
        }
        if state.closed {
            return Some(match state.error.take() {
                Some(e) => Err(e),
                None => Ok(Received::Closed),
            });
        }
        None
    }
}

fn reader_loop<S: WireStream>(mut reader: FrameReader<S>, queue: Arc<FrameQueue>) {
    loop {
        match reader.recv() {
            Ok(Some(frame)) => {
                queue.lock().frames.push_back(frame);
                queue.ready.notify_all();
            }
            Ok(None) => {
                debug!("reader thread: peer closed channel");
                queue.close(None);
                return;
            }
            Err(e) => {
                warn!("reader thread stopping: {}", e);
                queue.close(Some(e));
                return;
            }
        }
    }
}

fn writer_loop<S: WireStream>(mut writer: FrameWriter<S>, queue: Arc<FrameQueue>) {
    loop {
        let batch: Vec<Frame> = {
            let mut state = queue.lock();
            while state.frames.is_empty() && !state.closed {
                state = queue
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.frames.is_empty() {
                return;
            }
            state.frames.drain(..).collect()
        };
        for frame in &batch {
            if let Err(e) = writer.send(frame) {
                warn!("writer thread stopping: {}", e);
                queue.close(Some(e));
                return;
            }
        }
    }
}

impl<S: WireStream> MessageChannel for ThreadedChannel<S> {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut state = self.outbound.lock();
        if state.closed {
            return Err(state.error.take().unwrap_or(TransportError::WorkerGone));
        }
        state.frames.push_back(frame);
        drop(state);
        self.outbound.ready.notify_one();
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Received, TransportError> {
        let mut state = self.inbound.lock();
        Self::pop_inbound(&mut state).unwrap_or(Ok(Received::Empty))
    }

    fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let mut state = self.inbound.lock();
        loop {
            if let Some(outcome) = Self::pop_inbound(&mut state) {
                return match outcome? {
                    Received::Frame(frame) => Ok(Some(frame)),
                    _ => Ok(None),
                };
            }
            state = self
                .inbound
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Received, TransportError> {
        let state = self.inbound.lock();
        let (mut state, _) = self
            .inbound
            .ready
            .wait_timeout_while(state, timeout, |s| s.frames.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::pop_inbound(&mut state).unwrap_or(Ok(Received::Empty))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.outbound.ready.notify_all();
        Ok(())
    }
}

impl<S: WireStream> Drop for ThreadedChannel<S> {
    fn drop(&mut self) {
        // Let the writer drain what is queued, then unblock the reader.
        self.outbound.close(None);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        let _ = self.control.shutdown_stream(Shutdown::Read);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn frame(tag: Tag, id: i32, payload: &[u8]) -> Frame {
        Frame::new(tag, id, payload.to_vec())
    }

    #[test]
    fn test_header_is_canonical_big_endian() {
        let header = encode_header(0x0102_0304, -2, 7);
        assert_eq!(&header[0..4], &[1, 2, 3, 4]);
        assert_eq!(&header[4..8], &(-2i32).to_be_bytes());
        assert_eq!(&header[8..12], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_header_written_by_big_endian_host_decodes() {
        // What a big-endian sender writes natively, no swapping involved.
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&101i32.to_be_bytes());
        bytes[4..8].copy_from_slice(&77i32.to_be_bytes());
        bytes[8..12].copy_from_slice(&4096i32.to_be_bytes());
        assert_eq!(decode_header(&bytes), (101, 77, 4096));
    }

    #[test]
    fn test_round_trip_including_empty_payload() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Channel::new(a, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();

        let sent = vec![
            frame(Tag::DbInsertFile, 0, b"\x00\x00\x00\x03a.c"),
            frame(Tag::GuiHeartbeat, 0, b""),
            frame(Tag::DbFileContents, 42, &[0xff; 300]),
        ];
        for f in &sent {
            tx.send(f.clone()).unwrap();
        }
        for expected in &sent {
            let got = rx.recv().unwrap().unwrap();
            assert_eq!(&got, expected);
            assert_eq!(got.size(), expected.payload.len());
        }
    }

    #[test]
    fn test_empty_then_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Received::Empty);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)).unwrap(),
            Received::Empty
        );
        drop(a);
        assert_eq!(rx.try_recv().unwrap(), Received::Closed);
    }

    #[test]
    fn test_header_split_across_writes() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();

        let header = encode_header(Tag::DbStatus as i32, 5, 3);
        let writer = std::thread::spawn(move || {
            a.write_all(&header[..5]).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            a.write_all(&header[5..]).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            a.write_all(b"xyz").unwrap();
            a
        });

        let got = rx.recv().unwrap().unwrap();
        assert_eq!(got.tag(), Ok(Tag::DbStatus));
        assert_eq!(got.id, 5);
        assert_eq!(got.payload, b"xyz");
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_negative_size_is_fatal() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();
        a.write_all(&encode_header(101, 0, -1)).unwrap();
        assert!(matches!(
            rx.recv(),
            Err(TransportError::NegativeSize(-1))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut rx = Channel::new(b, 16).unwrap();
        a.write_all(&encode_header(101, 0, 17)).unwrap();
        assert!(matches!(
            rx.recv(),
            Err(TransportError::FrameTooLarge { size: 17, limit: 16 })
        ));
    }

    #[test]
    fn test_eof_mid_frame_is_truncation() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();
        a.write_all(&encode_header(101, 0, 10)).unwrap();
        a.write_all(b"abc").unwrap();
        drop(a);
        assert!(matches!(rx.recv(), Err(TransportError::TruncatedFrame)));
    }

    #[test]
    fn test_threaded_channel_preserves_order() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = ThreadedChannel::new(a, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let mut rx = ThreadedChannel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();

        for i in 0..200 {
            tx.send(frame(Tag::DbStatus, i, &i.to_be_bytes())).unwrap();
        }
        tx.flush().unwrap();

        for i in 0..200 {
            let got = rx.recv().unwrap().unwrap();
            assert_eq!(got.id, i);
            assert_eq!(got.payload, i.to_be_bytes());
        }
        assert_eq!(rx.try_recv().unwrap(), Received::Empty);
    }

    #[test]
    fn test_threaded_to_cooperative_interop() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = ThreadedChannel::new(a, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let mut rx = Channel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();

        tx.send(frame(Tag::GuiQuit, 0, b"")).unwrap();
        tx.flush().unwrap();
        let got = rx.recv().unwrap().unwrap();
        assert_eq!(got.tag(), Ok(Tag::GuiQuit));

        drop(tx);
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn test_threaded_recv_reports_close() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut rx = ThreadedChannel::new(b, DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)).unwrap(),
            Received::Empty
        );
        drop(a);
        assert_eq!(rx.recv().unwrap(), None);
    }
}
