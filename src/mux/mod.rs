//! GSM 07.10 multiplexer: one physical channel carrying up to 61 logical
//! DLCs, each exposed as an independent byte pipe.
//!
//! The engine owns the physical [`Endpoint`]; [`Dlc`] handles implement
//! [`Channel`], so a [`crate::chat::Chat`], a [`crate::server::Server`] or
//! a PPP instance runs over a DLC exactly as it would over a TTY. DLC 0 is
//! the control channel: modem-status commands arriving there are
//! acknowledged and drive per-DLC flow control, test commands are echoed.

pub mod frame;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::result::Response;
use crate::ring::RingBuffer;
use crate::transport::{Channel, Endpoint, ReadOutcome};

use frame::{Frame, CTRL_DISC, CTRL_SABM, CTRL_UA_ACK, CTRL_UA_SET, CTRL_UI, CTRL_UIH};

/// 62 and 63 are reserved by 27.010 as frame delimiters, so 61 usable
/// channels remain besides the control channel.
pub const MAX_CHANNELS: usize = 61;

const DLC_BUFFER_SIZE: usize = 4096;
/// Largest frame payload plus worst-case framing overhead.
fn frame_buf_len(frame_size: usize) -> usize {
    2 * frame_size + 7
}

bitflags::bitflags! {
    /// V.24 signal bits carried by a modem-status command. Only RTR takes
    /// part in flow control; the rest are exposed for consumers with their
    /// own mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DlcStatus: u8 {
        const RTC = 0x02;
        const RTR = 0x04;
        const IC  = 0x40;
        const DV  = 0x80;
    }
}

/// Framing option negotiated through `AT+CMUX`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Framing {
    Basic,
    Advanced,
}

impl Framing {
    fn fill(self, out: &mut [u8], dlc: u8, control: u8, data: &[u8]) -> usize {
        match self {
            Framing::Basic => frame::fill_basic(out, dlc, control, data),
            Framing::Advanced => frame::fill_advanced(out, dlc, control, data),
        }
    }

    fn extract(self, buf: &[u8]) -> frame::Extracted {
        match self {
            Framing::Basic => frame::extract_basic(buf),
            Framing::Advanced => frame::extract_advanced(buf),
        }
    }
}

/// Events surfaced to the driver after a read round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MuxEvent {
    /// The DLC's receive buffer went non-empty.
    Readable(u8),
    /// The DLC was unthrottled; blocked writers may retry.
    Writable(u8),
}

struct DlcState {
    buffer: RingBuffer,
    throttled: bool,
    closed: bool,
}

struct MuxShared {
    framing: Framing,
    frame_size: usize,
    dlcs: Vec<Option<DlcState>>,
    /// Encoded frames waiting for the physical channel.
    out: VecDeque<u8>,
}

impl MuxShared {
    fn write_frame(&mut self, dlc: u8, control: u8, data: &[u8]) {
        let mut buf = vec![0u8; frame_buf_len(self.frame_size.max(data.len()))];
        let n = self.framing.fill(&mut buf, dlc, control, data);
        self.out.extend(&buf[..n]);
    }

    /// Splits `data` into maximum-payload UIH frames on `dlc`.
    fn write_data(&mut self, dlc: u8, data: &[u8]) {
        for chunk in data.chunks(self.frame_size) {
            self.write_frame(dlc, CTRL_UIH, chunk);
        }
    }
}

/// A virtual byte channel over one DLC.
///
/// Reading drains the per-DLC receive buffer; writing encodes UIH frames
/// into the mux output queue. A throttled DLC reports `WouldBlock` on
/// write until the peer raises RTR again.
pub struct Dlc {
    dlc: u8,
    shared: Rc<RefCell<MuxShared>>,
}

impl Dlc {
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Sends DISC on this channel and releases the slot for reuse.
    pub fn close(self) {
        let mut shared = self.shared.borrow_mut();
        shared.write_frame(self.dlc, CTRL_DISC, &[]);
        shared.dlcs[self.dlc as usize - 1] = None;
    }
}

impl Channel for Dlc {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        let state = shared.dlcs[self.dlc as usize - 1]
            .as_mut()
            .ok_or(io::ErrorKind::NotConnected)?;

        if state.closed {
            return Ok(0);
        }

        let n = state.buffer.read(buf);
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        let state = shared.dlcs[self.dlc as usize - 1]
            .as_mut()
            .ok_or(io::ErrorKind::NotConnected)?;

        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        if state.throttled {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        shared.write_data(self.dlc, buf);
        Ok(buf.len())
    }
}

/// The multiplexer engine.
pub struct Mux<C: Channel> {
    io: Endpoint<C>,
    shared: Rc<RefCell<MuxShared>>,
    stage: Vec<u8>,
    events: Vec<MuxEvent>,
    started: bool,
    disconnect: Option<Box<dyn FnOnce()>>,
}

impl<C: Channel> Mux<C> {
    pub fn new(channel: C, framing: Framing, frame_size: usize) -> Self {
        let mut dlcs = Vec::with_capacity(MAX_CHANNELS);
        dlcs.resize_with(MAX_CHANNELS, || None);

        Self {
            io: Endpoint::new(channel),
            shared: Rc::new(RefCell::new(MuxShared {
                framing,
                frame_size,
                dlcs,
                out: VecDeque::new(),
            })),
            stage: Vec::new(),
            events: Vec::new(),
            started: false,
            disconnect: None,
        }
    }

    pub fn set_disconnect_handler(&mut self, f: Box<dyn FnOnce()>) {
        self.disconnect = Some(f);
    }

    /// Opens the control channel. Must run before any DLC is created.
    pub fn start(&mut self) {
        if self.started {
            return;
        }

        self.shared.borrow_mut().write_frame(0, CTRL_SABM, &[]);
        self.started = true;
        self.io.set_wants_write(true);
    }

    /// Closes every DLC and the control channel.
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }

        {
            let mut shared = self.shared.borrow_mut();

            for i in 0..MAX_CHANNELS {
                if shared.dlcs[i].is_some() {
                    shared.write_frame(i as u8 + 1, CTRL_DISC, &[]);
                    shared.dlcs[i] = None;
                }
            }

            shared.write_frame(0, CTRL_DISC, &[]);
        }

        self.started = false;
        self.io.set_wants_write(true);
    }

    /// Opens the lowest free DLC, sending SABM on it.
    pub fn create_dlc(&mut self) -> Option<Dlc> {
        let mut shared = self.shared.borrow_mut();

        let slot = (0..MAX_CHANNELS).find(|&i| shared.dlcs[i].is_none())?;
        let dlc = slot as u8 + 1;

        shared.write_frame(dlc, CTRL_SABM, &[]);
        shared.dlcs[slot] = Some(DlcState {
            buffer: RingBuffer::new(DLC_BUFFER_SIZE),
            throttled: false,
            closed: false,
        });

        drop(shared);
        self.io.set_wants_write(true);

        Some(Dlc {
            dlc,
            shared: self.shared.clone(),
        })
    }

    /// Sends a modem-status command for `dlc` carrying `status`.
    pub fn send_status(&mut self, dlc: u8, status: DlcStatus) {
        let data = [
            CTRL_UA_SET,
            0x03,
            (dlc << 2) | 0x03,
            status.bits(),
        ];
        self.shared.borrow_mut().write_frame(0, CTRL_UIH, &data);
        self.io.set_wants_write(true);
    }

    /// Events recorded since the last call, in arrival order.
    pub fn take_events(&mut self) -> Vec<MuxEvent> {
        std::mem::take(&mut self.events)
    }

    /// `true` while encoded frames wait for the physical channel.
    pub fn has_pending_output(&self) -> bool {
        !self.shared.borrow().out.is_empty()
    }

    /// Flushes queued frames to the physical channel. Returns `true`
    /// while output remains.
    pub fn process_writable(&mut self) -> bool {
        loop {
            let chunk: Vec<u8> = {
                let shared = self.shared.borrow();
                shared.out.iter().take(4096).copied().collect()
            };

            if chunk.is_empty() {
                self.io.set_wants_write(false);
                return false;
            }

            let written = self.io.send(&chunk);
            let mut shared = self.shared.borrow_mut();
            shared.out.drain(..written);

            if written < chunk.len() {
                return !shared.out.is_empty();
            }
        }
    }

    /// Drives the physical endpoint and dispatches complete frames.
    /// Returns `false` once the transport has disconnected.
    pub fn process_readable(&mut self) -> bool {
        match self.io.process_readable() {
            ReadOutcome::Disconnected => {
                if let Some(cb) = self.disconnect.take() {
                    cb();
                }
                return false;
            }
            ReadOutcome::Idle => return true,
            ReadOutcome::Data => {}
        }

        // Move everything buffered into the contiguous staging area the
        // extractors scan.
        loop {
            let span = self.io.rbuf().readable_slice().to_vec();
            if span.is_empty() {
                break;
            }
            let n = span.len();
            self.stage.extend_from_slice(&span);
            self.io.rbuf().drain(n);
        }

        self.feed_data();

        if self.io.is_disconnected() {
            if let Some(cb) = self.disconnect.take() {
                cb();
            }
            return false;
        }

        true
    }

    fn feed_data(&mut self) {
        let framing = self.shared.borrow().framing;
        let mut consumed_total = 0;

        loop {
            let (consumed, extracted) = framing.extract(&self.stage[consumed_total..]);
            consumed_total += consumed;

            let Some(frame) = extracted else {
                break;
            };

            self.dispatch_frame(frame);
        }

        self.stage.drain(..consumed_total);

        if self.has_pending_output() {
            self.io.set_wants_write(true);
        }
    }

    fn dispatch_frame(&mut self, frame: Frame) {
        let Frame { dlc, control, data } = frame;

        match control {
            CTRL_UIH | CTRL_UI => {
                if (1..=MAX_CHANNELS as u8).contains(&dlc) {
                    self.feed_dlc_data(dlc, &data);
                } else if dlc == 0 {
                    self.control_message(&data);
                }
            }
            _ => {
                // SABM/DISC/UA acknowledgements need no action in this
                // role; status changes ride on UIH frames.
                log::debug!("mux: control frame {control:#04x} on dlc {dlc}");
            }
        }
    }

    /// An embedded command or response on the control channel.
    fn control_message(&mut self, data: &[u8]) {
        if data.len() >= 2 && data[0] == CTRL_UA_SET && data[1] == 0x03 {
            // Modem status: apply it, then mirror the payload back with
            // the ACK code.
            let msg = &data[2..];

            if msg.len() >= 2 {
                let dlc = (msg[0] & 0xFC) >> 2;
                let status = DlcStatus::from_bits_truncate(msg[1]);
                self.set_dlc_status(dlc, status);
            }

            let len = msg.len().min(31);
            let mut resp = Vec::with_capacity(len + 2);
            resp.push(CTRL_UA_ACK);
            resp.push(((len as u8) << 1) | 0x01);
            resp.extend_from_slice(&msg[..len]);

            log::debug!("mux: acking modem status");
            self.shared.borrow_mut().write_frame(0, CTRL_UIH, &resp);
        } else if data.len() >= 2 && data[0] == 0x43 {
            // Test command: echo the payload with the C/R bit cleared.
            let mut resp = data.to_vec();
            resp[0] = 0x41;
            self.shared.borrow_mut().write_frame(0, CTRL_UIH, &resp);
        }
    }

    fn feed_dlc_data(&mut self, dlc: u8, data: &[u8]) {
        let mut shared = self.shared.borrow_mut();

        let Some(state) = shared.dlcs[dlc as usize - 1].as_mut() else {
            return;
        };

        let was_empty = state.buffer.is_empty();
        state.buffer.write(data);

        if was_empty && !data.is_empty() {
            self.events.push(MuxEvent::Readable(dlc));
        }
    }

    fn set_dlc_status(&mut self, dlc: u8, status: DlcStatus) {
        if !(1..=MAX_CHANNELS as u8).contains(&dlc) {
            return;
        }

        let mut shared = self.shared.borrow_mut();
        let Some(state) = shared.dlcs[dlc as usize - 1].as_mut() else {
            return;
        };

        if status.contains(DlcStatus::RTR) {
            if state.throttled {
                state.throttled = false;
                self.events.push(MuxEvent::Writable(dlc));
            }
        } else {
            state.throttled = true;
        }
    }
}

/// Parameters for `AT+CMUX=...`, derived from the `+CMUX: ...` support
/// report.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CmuxConfig {
    pub framing: Framing,
    pub frame_size: usize,
    pub speed: Option<i32>,
}

/// Parses a `+CMUX: (modes),(subsets)[,(speeds)],(frame sizes),...`
/// support report, preferring advanced framing and the default frame size
/// for the chosen mode (31 basic, 64 advanced).
pub fn parse_cmux_support(resp: &Response) -> Option<CmuxConfig> {
    let mut iter = resp.iter();

    if !iter.next_line("+CMUX:") {
        return None;
    }

    // Mode.
    if !iter.open_list() {
        return None;
    }
    let (min, max) = iter.next_range()?;
    if !iter.close_list() {
        return None;
    }

    let framing = if min <= 1 && 1 <= max {
        Framing::Advanced
    } else if min <= 0 && 0 <= max {
        Framing::Basic
    } else {
        return None;
    };

    // Subset: only 0 is usable.
    if !iter.open_list() {
        return None;
    }
    let (min, _) = iter.next_range()?;
    if !iter.close_list() {
        return None;
    }
    if min > 0 {
        return None;
    }

    // Port speed is optional; pick the highest offered.
    let speed = if iter.open_list() {
        let (_, max) = iter.next_range()?;
        if !iter.close_list() {
            return None;
        }
        Some(max)
    } else {
        if !iter.skip_next() {
            return None;
        }
        None
    };

    // Frame size: insist on the mode's default.
    if !iter.open_list() {
        return None;
    }
    let (min, max) = iter.next_range()?;
    if !iter.close_list() {
        return None;
    }

    let frame_size = match framing {
        Framing::Basic => 31,
        Framing::Advanced => 64,
    };

    if min > frame_size as i32 || max < frame_size as i32 {
        return None;
    }

    Some(CmuxConfig {
        framing,
        frame_size,
        speed,
    })
}

/// The `AT+CMUX` set command for a parsed configuration.
pub fn cmux_set_command(cfg: &CmuxConfig) -> String {
    let mode = match cfg.framing {
        Framing::Basic => 0,
        Framing::Advanced => 1,
    };

    match cfg.speed {
        Some(speed) => format!("AT+CMUX={},0,{},{}", mode, speed, cfg.frame_size),
        None => format!("AT+CMUX={},0,,{}", mode, cfg.frame_size),
    }
}
