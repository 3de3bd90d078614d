//! Byte-channel abstraction and the buffered endpoint built on top of it.
//!
//! A [`Channel`] is an already-opened bidirectional byte pipe: a TTY, a USB
//! CDC-ACM endpoint, a socket, or a virtual pipe such as a mux DLC. The
//! [`Endpoint`] owns one channel exclusively, buffers reads into a ring
//! buffer, and tracks the conditions that count as a hard disconnect.
//!
//! The endpoint is deliberately passive: a driver (see [`crate::pump`])
//! calls [`Endpoint::process_readable`] when the channel is readable, and
//! the owning protocol layer lexes out of [`Endpoint::rbuf`] afterwards.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};

use crate::ring::RingBuffer;

const READ_BUFFER_SIZE: usize = 8192;

/// A non-blocking bidirectional byte pipe.
///
/// `recv` and `send` follow `std::io` conventions: a dry read returns
/// `Err(WouldBlock)`, a zero-byte `Ok` means the peer hung up. Implementors
/// backed by a blocking descriptor should return `false` from
/// [`nonblocking`](Channel::nonblocking) so the endpoint limits itself to a
/// single read per wakeup.
pub trait Channel {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn nonblocking(&self) -> bool {
        true
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn nonblocking(&self) -> bool {
        (**self).nonblocking()
    }
}

/// Outcome of one read wakeup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadOutcome {
    /// New bytes were buffered; the read handler should run.
    Data,
    /// Nothing to do.
    Idle,
    /// The channel is dead: hangup, hard error, or ring-buffer overflow.
    Disconnected,
}

/// Direction tag used by the traffic recorder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    In,
    Out,
}

/// Owns a [`Channel`] plus the read-side ring buffer.
///
/// Created from a caller-supplied channel; the caller cedes ownership on
/// construction. Dropping the endpoint drops the channel.
pub struct Endpoint<C: Channel> {
    channel: C,
    rbuf: RingBuffer,
    max_read_attempts: u32,
    disconnected: bool,
    wants_write: bool,
    write_done: Option<Box<dyn FnOnce()>>,
    record: Option<Box<dyn Write>>,
}

impl<C: Channel> Endpoint<C> {
    pub fn new(channel: C) -> Self {
        let max_read_attempts = if channel.nonblocking() { 3 } else { 1 };

        Self {
            channel,
            rbuf: RingBuffer::new(READ_BUFFER_SIZE),
            max_read_attempts,
            disconnected: false,
            wants_write: false,
            write_done: None,
            record: None,
        }
    }

    /// The buffered read side. Protocol layers lex directly out of this
    /// and `drain` what they consumed.
    pub fn rbuf(&mut self) -> &mut RingBuffer {
        &mut self.rbuf
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Pulls bytes from the channel into the ring buffer.
    ///
    /// Up to three reads are attempted per call on non-blocking channels to
    /// amortise syscall cost; a single read otherwise. Returns
    /// [`ReadOutcome::Data`] at most once per call no matter how many reads
    /// fired, so the owner invokes its read handling exactly once.
    pub fn process_readable(&mut self) -> ReadOutcome {
        if self.disconnected {
            return ReadOutcome::Disconnected;
        }

        let mut total = 0usize;

        for _ in 0..self.max_read_attempts {
            let span = self.rbuf.writable_slice();
            if span.is_empty() {
                break;
            }

            match self.channel.recv(span) {
                Ok(0) => {
                    // Zero-byte read outside of EAGAIN means hangup.
                    self.disconnected = true;
                    break;
                }
                Ok(n) => {
                    self.trace_incoming(n);
                    self.rbuf.write_advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.disconnected = true;
                    break;
                }
            }
        }

        // Overflow: reader stopped draining, shut the channel down.
        if self.rbuf.avail() == 0 {
            self.disconnected = true;
        }

        if self.disconnected && total == 0 {
            ReadOutcome::Disconnected
        } else if total > 0 {
            ReadOutcome::Data
        } else {
            ReadOutcome::Idle
        }
    }

    /// Writes `data` to the channel, returning how many bytes left. A hard
    /// error marks the endpoint disconnected and reports zero.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if self.disconnected {
            return 0;
        }

        match self.channel.send(data) {
            Ok(n) => {
                if n > 0 {
                    log::trace!("< {:02x?}", &data[..n]);
                    if let Some(sink) = self.record.as_mut() {
                        record_frame(sink, Direction::Out, &data[..n]);
                    }
                }
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(_) => {
                self.disconnected = true;
                0
            }
        }
    }

    /// Marks whether the owner has pending output. Clearing the flag fires
    /// the write-done callback exactly once, which is how PPP serialises
    /// "suspend only after the final Terminate-Ack left the wire".
    pub fn set_wants_write(&mut self, wants: bool) {
        self.wants_write = wants;

        if !wants {
            if let Some(done) = self.write_done.take() {
                done();
            }
        }
    }

    pub fn wants_write(&self) -> bool {
        self.wants_write
    }

    /// Registers a one-shot callback for the moment the write watch is
    /// dropped (all queued output has left).
    pub fn set_write_done(&mut self, done: Box<dyn FnOnce()>) {
        self.write_done = Some(done);
    }

    /// Starts recording raw traffic into `sink` using the timestamped
    /// binary format of the original implementation, or stops when `None`.
    pub fn set_recording(&mut self, sink: Option<Box<dyn Write>>) {
        self.record = sink;
    }

    /// Logs and records the `n` bytes just read into the writable span,
    /// before `write_advance` commits them.
    fn trace_incoming(&mut self, n: usize) {
        if self.record.is_none() && !log::log_enabled!(log::Level::Trace) {
            return;
        }

        let data: Vec<u8> = self.rbuf.writable_slice()[..n].to_vec();
        log::trace!("> {:02x?}", &data);
        if let Some(sink) = self.record.as_mut() {
            record_frame(sink, Direction::In, &data);
        }
    }

    /// Consumes the endpoint, handing the raw channel back. Used when a
    /// layer transfers the pipe to another owner (chat to mux, server to
    /// PPP).
    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

fn record_frame(sink: &mut Box<dyn Write>, dir: Direction, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut hdr = Vec::with_capacity(8);
    let _ = hdr.write_u8(0x07);
    let _ = hdr.write_u32::<BigEndian>(ts);
    let _ = hdr.write_u8(match dir {
        Direction::In => 0x02,
        Direction::Out => 0x01,
    });
    let _ = hdr.write_u16::<BigEndian>(data.len() as u16);

    let _ = sink.write_all(&hdr);
    let _ = sink.write_all(data);
}

/// Shared handle over one channel, for the layers that trade a pipe back
/// and forth (the DUN emulator's AT server and its PPP instance). Clones
/// talk to the same underlying channel; single-threaded.
pub struct SharedChannel<C: Channel> {
    inner: std::rc::Rc<std::cell::RefCell<C>>,
}

impl<C: Channel> SharedChannel<C> {
    pub fn new(channel: C) -> Self {
        Self {
            inner: std::rc::Rc::new(std::cell::RefCell::new(channel)),
        }
    }
}

impl<C: Channel> Clone for SharedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> Channel for SharedChannel<C> {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.borrow_mut().recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().send(buf)
    }

    fn nonblocking(&self) -> bool {
        self.inner.borrow().nonblocking()
    }
}

/// In-memory channel pair for composing layers without an OS pipe.
///
/// `MemChannel::pair()` returns two ends; bytes sent on one are received on
/// the other. Single-threaded, used by tests and loopback setups.
pub struct MemChannel {
    rx: std::rc::Rc<std::cell::RefCell<std::collections::VecDeque<u8>>>,
    tx: std::rc::Rc<std::cell::RefCell<std::collections::VecDeque<u8>>>,
    peer_closed: std::rc::Rc<std::cell::Cell<bool>>,
    closed: std::rc::Rc<std::cell::Cell<bool>>,
}

impl MemChannel {
    pub fn pair() -> (MemChannel, MemChannel) {
        use std::cell::{Cell, RefCell};
        use std::collections::VecDeque;
        use std::rc::Rc;

        let a = Rc::new(RefCell::new(VecDeque::new()));
        let b = Rc::new(RefCell::new(VecDeque::new()));
        let a_closed = Rc::new(Cell::new(false));
        let b_closed = Rc::new(Cell::new(false));

        (
            MemChannel {
                rx: a.clone(),
                tx: b.clone(),
                peer_closed: b_closed.clone(),
                closed: a_closed.clone(),
            },
            MemChannel {
                rx: b,
                tx: a,
                peer_closed: a_closed,
                closed: b_closed,
            },
        )
    }
}

impl Drop for MemChannel {
    fn drop(&mut self) {
        self.closed.set(true);
    }
}

impl Channel for MemChannel {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = self.rx.borrow_mut();

        if q.is_empty() {
            if self.peer_closed.get() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut n = 0;
        while n < buf.len() {
            match q.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.peer_closed.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx.borrow_mut().extend(buf.iter().copied());
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_buffers_reads() {
        let (a, mut b) = MemChannel::pair();
        let mut ep = Endpoint::new(a);

        b.send(b"ATD123;\r").unwrap();

        assert_eq!(ep.process_readable(), ReadOutcome::Data);
        assert_eq!(ep.rbuf().readable_slice(), b"ATD123;\r");

        assert_eq!(ep.process_readable(), ReadOutcome::Idle);
    }

    #[test]
    fn hangup_reports_disconnect() {
        let (a, b) = MemChannel::pair();
        let mut ep = Endpoint::new(a);

        drop(b);

        assert_eq!(ep.process_readable(), ReadOutcome::Disconnected);
        assert!(ep.is_disconnected());
    }

    #[test]
    fn data_before_hangup_is_delivered_first() {
        let (a, mut b) = MemChannel::pair();
        let mut ep = Endpoint::new(a);

        b.send(b"OK\r\n").unwrap();
        drop(b);

        // The buffered bytes come through on the first wakeup; the
        // disconnect surfaces on the next.
        assert_eq!(ep.process_readable(), ReadOutcome::Data);
        assert_eq!(ep.process_readable(), ReadOutcome::Disconnected);
    }

    #[test]
    fn write_done_fires_once_when_watch_clears() {
        use std::cell::Cell;
        use std::rc::Rc;

        let (a, _b) = MemChannel::pair();
        let mut ep = Endpoint::new(a);

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        ep.set_write_done(Box::new(move || f.set(f.get() + 1)));

        ep.set_wants_write(true);
        assert_eq!(fired.get(), 0);

        ep.set_wants_write(false);
        assert_eq!(fired.get(), 1);

        ep.set_wants_write(false);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn send_round_trips_through_pair() {
        let (a, b) = MemChannel::pair();
        let mut ep_a = Endpoint::new(a);
        let mut ep_b = Endpoint::new(b);

        assert_eq!(ep_a.send(b"ping"), 4);
        assert_eq!(ep_b.process_readable(), ReadOutcome::Data);
        assert_eq!(ep_b.rbuf().readable_slice(), b"ping");
    }
}
