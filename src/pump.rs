//! Async composition root: drives the synchronous protocol engines from a
//! tokio stream.
//!
//! The engines never touch the runtime; they are fed through a
//! [`QueueChannel`] whose inbox and outbox the pump moves bytes in and
//! out of. One [`run`] call owns one stream and one engine, selecting
//! over stream readability, queued output and the engine's earliest timer
//! deadline. The engine types are `Rc`-based and single-threaded, so the
//! pump is meant for a current-thread runtime or a `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chat::Chat;
use crate::emulator::Emulator;
use crate::mux::Mux;
use crate::ppp::Ppp;
use crate::server::Server;
use crate::transport::Channel;

/// Idle tick used when no protocol timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(3600);

struct Queues {
    inbox: RefCell<VecDeque<u8>>,
    outbox: RefCell<VecDeque<u8>>,
    hup: Cell<bool>,
}

/// The engine-side half: a [`Channel`] over the shared queues.
pub struct QueueChannel {
    queues: Rc<Queues>,
}

/// The pump-side half.
pub struct QueueHandle {
    queues: Rc<Queues>,
}

/// Creates the channel/handle pair that links an engine to a pump.
pub fn queue_channel() -> (QueueChannel, QueueHandle) {
    let queues = Rc::new(Queues {
        inbox: RefCell::new(VecDeque::new()),
        outbox: RefCell::new(VecDeque::new()),
        hup: Cell::new(false),
    });

    (
        QueueChannel {
            queues: queues.clone(),
        },
        QueueHandle { queues },
    )
}

impl Channel for QueueChannel {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbox = self.queues.inbox.borrow_mut();

        if inbox.is_empty() {
            if self.queues.hup.get() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut n = 0;
        while n < buf.len() {
            match inbox.pop_front() {
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
        self.queues.outbox.borrow_mut().extend(buf.iter().copied());
        Ok(buf.len())
    }
}

impl QueueHandle {
    fn push_inbox(&self, bytes: &[u8]) {
        self.queues.inbox.borrow_mut().extend(bytes.iter().copied());
    }

    fn set_hup(&self) {
        self.queues.hup.set(true);
    }

    fn take_outbox(&self) -> Vec<u8> {
        self.queues.outbox.borrow_mut().drain(..).collect()
    }
}

/// Anything the pump can drive: the protocol engines implement this.
pub trait Pumpable {
    /// Channel became readable; returns `false` on disconnect.
    fn on_readable(&mut self, now: Instant) -> bool;
    /// Drains one unit of pending output; returns `true` while more
    /// remains.
    fn on_writable(&mut self, now: Instant) -> bool;
    fn on_timeout(&mut self, now: Instant);
    fn next_deadline(&self) -> Option<Instant>;
}

impl Pumpable for Chat<QueueChannel> {
    fn on_readable(&mut self, _now: Instant) -> bool {
        self.process_readable()
    }

    fn on_writable(&mut self, now: Instant) -> bool {
        self.process_writable(now)
    }

    fn on_timeout(&mut self, now: Instant) {
        self.handle_timeout(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        Chat::next_deadline(self)
    }
}

impl Pumpable for Server<QueueChannel> {
    fn on_readable(&mut self, _now: Instant) -> bool {
        self.process_readable()
    }

    fn on_writable(&mut self, _now: Instant) -> bool {
        self.process_writable()
    }

    fn on_timeout(&mut self, _now: Instant) {}

    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

impl Pumpable for Mux<QueueChannel> {
    fn on_readable(&mut self, _now: Instant) -> bool {
        self.process_readable()
    }

    fn on_writable(&mut self, _now: Instant) -> bool {
        self.process_writable()
    }

    fn on_timeout(&mut self, _now: Instant) {}

    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

impl Pumpable for Ppp<QueueChannel> {
    fn on_readable(&mut self, now: Instant) -> bool {
        self.process_readable(now)
    }

    fn on_writable(&mut self, _now: Instant) -> bool {
        self.process_writable()
    }

    fn on_timeout(&mut self, now: Instant) {
        self.handle_timeout(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        Ppp::next_deadline(self)
    }
}

impl Pumpable for Emulator<QueueChannel> {
    fn on_readable(&mut self, now: Instant) -> bool {
        self.process_readable(now)
    }

    fn on_writable(&mut self, now: Instant) -> bool {
        self.process_writable(now)
    }

    fn on_timeout(&mut self, now: Instant) {
        self.handle_timeout(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        Emulator::next_deadline(self)
    }
}

/// Drives `engine` against `stream` until the link disconnects or the
/// stream errors.
pub async fn run<S, P>(mut stream: S, queues: QueueHandle, engine: &mut P) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Pumpable,
{
    let mut buf = [0u8; 4096];

    loop {
        let now = Instant::now();

        // Let the engine stage whatever it wants to say, then push it
        // down the stream before waiting again.
        while engine.on_writable(now) {}

        loop {
            let chunk = queues.take_outbox();
            if chunk.is_empty() {
                break;
            }
            stream.write_all(&chunk).await?;
        }

        let deadline = engine
            .next_deadline()
            .unwrap_or_else(|| now + IDLE_TICK);
        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));

        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;

                if n == 0 {
                    queues.set_hup();
                } else {
                    queues.push_inbox(&buf[..n]);
                }

                if !engine.on_readable(Instant::now()) {
                    // Disconnected: flush whatever the teardown queued.
                    let chunk = queues.take_outbox();
                    if !chunk.is_empty() {
                        let _ = stream.write_all(&chunk).await;
                    }
                    return Ok(());
                }
            }
            _ = sleep => {
                engine.on_timeout(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(flavor = "current_thread")]
    async fn chat_command_over_duplex() {
        let (stream, mut modem) = tokio::io::duplex(256);
        let (channel, queues) = queue_channel();

        let mut chat = Chat::new(channel);
        let ok = Rc::new(Cell::new(false));
        let flag = ok.clone();
        chat.send("AT+CGMI", &[], Box::new(move |okay, _| flag.set(okay)));

        let script = async move {
            let mut buf = [0u8; 64];
            let n = modem.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AT+CGMI\r");

            modem.write_all(b"\r\nOK\r\n").await.unwrap();

            // Give the pump a beat to process, then hang up.
            tokio::task::yield_now().await;
            drop(modem);
        };

        let (result, ()) = tokio::join!(run(stream, queues, &mut chat), script);
        result.unwrap();
        assert!(ok.get());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn server_answers_over_duplex() {
        let (stream, mut te) = tokio::io::duplex(256);
        let (channel, queues) = queue_channel();

        let mut server = Server::new(channel);
        server.set_echo(false);

        let script = async move {
            te.write_all(b"AT\r").await.unwrap();

            let mut buf = [0u8; 64];
            let n = te.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"\r\nOK\r\n");

            drop(te);
        };

        let (result, ()) = tokio::join!(run(stream, queues, &mut server), script);
        result.unwrap();
    }
}
