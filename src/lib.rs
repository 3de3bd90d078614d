//! A serial-line modem transport stack written in Rust.
//!
//! `modemlink` sits between a raw byte pipe (a TTY, a USB CDC-ACM
//! endpoint, a socket) and higher-level telephony logic. It speaks the
//! protocols a cellular modem expects on that pipe:
//!
//! * an **AT chat** client with command queueing, unsolicited-result
//!   dispatch, wake-up handling and terminator disambiguation;
//! * a **V.250 AT server** with S-registers and async command handlers;
//! * a **GSM 07.10 multiplexer** (basic and advanced framing) carrying up
//!   to 61 logical channels over one physical link, each usable as an
//!   independent byte pipe;
//! * a **PPP** stack (RFC 1662 HDLC framing, the RFC 1661 LCP machine,
//!   IPCP, IPv6CP, CHAP-MD5 and PAP) producing a configured TUN network
//!   interface on Linux;
//! * a **raw-IP bridge** for modems that hand over IP frames without PPP;
//! * a **telephony emulator** exposing the DUN and HFP personalities over
//!   the AT server.
//!
//! # Getting started
//!
//! The protocol engines are synchronous state machines over a
//! [`Channel`]: feed them bytes, drain their output. That keeps them
//! testable and runtime-agnostic. The [`pump`] module wires an engine to
//! a tokio stream:
//!
//! ```no_run
//! use modemlink::{pump, Chat};
//!
//! # async fn demo(port: tokio::net::UnixStream) -> std::io::Result<()> {
//! let (channel, queues) = pump::queue_channel();
//! let mut chat = Chat::new(channel);
//!
//! chat.send(
//!     "AT+CGMI",
//!     &["+CGMI:"],
//!     Box::new(|ok, resp| {
//!         println!("ok={ok} final={}", resp.final_response());
//!     }),
//! );
//!
//! pump::run(port, queues, &mut chat).await
//! # }
//! ```
//!
//! Layers stack by channel: a [`mux::Dlc`] implements [`Channel`], so a
//! [`Chat`] or a [`Ppp`] instance runs over a mux channel exactly as over
//! the raw port.

pub mod chat;
pub mod emulator;
pub mod hdlc;
pub mod mux;
pub mod ppp;
pub mod pump;
pub mod rawip;
pub mod result;
pub mod ring;
pub mod server;
pub mod syntax;
pub mod transport;

pub use chat::{Chat, ChatHandle, CommandFlags, Terminator};
pub use emulator::{DunSettings, Emulator, EmulatorType};
pub use hdlc::Hdlc;
pub use mux::{Dlc, Framing, Mux};
pub use ppp::{DisconnectReason, Phase, Ppp, PppEvent, TunConfig};
pub use rawip::RawIp;
pub use result::{Response, ResponseIter};
pub use ring::RingBuffer;
pub use server::{RequestType, Server, ServerResult};
pub use transport::{Channel, Endpoint, MemChannel, SharedChannel};
