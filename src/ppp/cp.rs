//! Generic RFC 1661 control-protocol state machine.
//!
//! One [`Pppcp`] instance drives one control protocol (LCP, IPCP, IPv6CP)
//! through the ten-state automaton of RFC 1661 §4.1. The transition table
//! is encoded exactly as the specification lays it out: a cell is a set of
//! action bits plus the next state in the low nibble.
//!
//! Option semantics live entirely in the [`CpDriver`]; the machine itself
//! only knows codes, identifiers and restart counters. Outbound packets
//! and link-level consequences are collected as values and drained by the
//! owning [`super::Ppp`] after every stimulus, which keeps the layers'
//! borrows disjoint.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

pub const CODE_CONFIGURE_REQUEST: u8 = 1;
pub const CODE_CONFIGURE_ACK: u8 = 2;
pub const CODE_CONFIGURE_NAK: u8 = 3;
pub const CODE_CONFIGURE_REJECT: u8 = 4;
pub const CODE_TERMINATE_REQUEST: u8 = 5;
pub const CODE_TERMINATE_ACK: u8 = 6;
pub const CODE_CODE_REJECT: u8 = 7;
pub const CODE_PROTOCOL_REJECT: u8 = 8;
pub const CODE_ECHO_REQUEST: u8 = 9;
pub const CODE_ECHO_REPLY: u8 = 10;
pub const CODE_DISCARD_REQUEST: u8 = 11;

/// Builds a supported-codes mask out of code numbers.
pub const fn code_mask(codes: &[u8]) -> u16 {
    let mut mask = 0u16;
    let mut i = 0;
    while i < codes.len() {
        mask |= 1 << codes[i];
        i += 1;
    }
    mask
}

const CP_HEADER_SZ: usize = 4;

const INITIAL_RESTART_INTERVAL: Duration = Duration::from_secs(3);
const MAX_TERMINATE: u32 = 2;
const MAX_CONFIGURE: u32 = 10;
const MAX_FAILURE: u32 = 5;

/// RFC 1661 automaton states, in table order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum State {
    Initial = 0,
    Starting = 1,
    Closed = 2,
    Stopped = 3,
    Closing = 4,
    Stopping = 5,
    ReqSent = 6,
    AckRcvd = 7,
    AckSent = 8,
    Opened = 9,
}

impl State {
    fn from_index(i: u32) -> State {
        match i {
            0 => State::Initial,
            1 => State::Starting,
            2 => State::Closed,
            3 => State::Stopped,
            4 => State::Closing,
            5 => State::Stopping,
            6 => State::ReqSent,
            7 => State::AckRcvd,
            8 => State::AckSent,
            _ => State::Opened,
        }
    }
}

/// Automaton events, in table order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum Event {
    Up = 0,
    Down = 1,
    Open = 2,
    Close = 3,
    ToPlus = 4,
    ToMinus = 5,
    RcrPlus = 6,
    RcrMinus = 7,
    Rca = 8,
    Rcn = 9,
    Rtr = 10,
    Rta = 11,
    Ruc = 12,
    RxjPlus = 13,
    RxjMinus = 14,
    Rxr = 15,
}

// Action bits. The low nibble of a table cell is the next state.
const INV: u32 = 0x10;
const IRC: u32 = 0x20;
const ZRC: u32 = 0x40;
const TLU: u32 = 0x100;
const TLD: u32 = 0x200;
const TLS: u32 = 0x400;
const TLF: u32 = 0x800;
const SCR: u32 = 0x1000;
const SCA: u32 = 0x2000;
const SCN: u32 = 0x4000;
const STR: u32 = 0x8000;
const STA: u32 = 0x10000;
const SCJ: u32 = 0x20000;
const SER: u32 = 0x40000;

/// Transition table straight from RFC 1661 Section 4.1; rows are events,
/// columns are states.
static TRANSITIONS: [[u32; 10]; 16] = [
    /* Up */
    [2, IRC | SCR | 6, INV, INV, INV, INV, INV, INV, INV, INV],
    /* Down */
    [INV, INV, 0, TLS | 1, 0, 1, 1, 1, 1, TLD | 1],
    /* Open */
    [TLS | 1, 1, IRC | SCR | 6, 3, 5, 5, 6, 7, 8, 9],
    /* Close */
    [0, TLF | 0, 2, 2, 4, 4, IRC | STR | 4, IRC | STR | 4, IRC | STR | 4, TLD | IRC | STR | 4],
    /* TO+ */
    [INV, INV, INV, INV, STR | 4, STR | 5, SCR | 6, SCR | 6, SCR | 8, INV],
    /* TO- */
    [INV, INV, INV, INV, TLF | 2, TLF | 3, TLF | 3, TLF | 3, TLF | 3, INV],
    /* RCR+ */
    [INV, INV, STA | 2, IRC | SCR | SCA | 8, 4, 5, SCA | 8, SCA | TLU | 9, SCA | 8, TLD | SCR | SCA | 8],
    /* RCR- */
    [INV, INV, STA | 2, IRC | SCR | SCN | 6, 4, 5, SCN | 6, SCN | 7, SCN | 6, TLD | SCR | SCN | 6],
    /* RCA */
    [INV, INV, STA | 2, STA | 3, 4, 5, IRC | 7, SCR | 6, IRC | TLU | 9, TLD | SCR | 6],
    /* RCN */
    [INV, INV, STA | 2, STA | 3, 4, 5, IRC | SCR | 6, SCR | 6, IRC | SCR | 8, TLD | SCR | 6],
    /* RTR */
    [INV, INV, STA | 2, STA | 3, STA | 4, STA | 5, STA | 6, STA | 6, STA | 6, TLD | ZRC | STA | 5],
    /* RTA */
    [INV, INV, 2, 3, TLF | 2, TLF | 3, 6, 6, 8, TLD | SCR | 6],
    /* RUC */
    [INV, INV, SCJ | 2, SCJ | 3, SCJ | 4, SCJ | 5, SCJ | 6, SCJ | 7, SCJ | 8, SCJ | 9],
    /* RXJ+ */
    [INV, INV, 2, 3, 4, 5, 6, 6, 8, 9],
    /* RXJ- */
    [INV, INV, TLF | 2, TLF | 3, TLF | 2, TLF | 3, TLF | 3, TLF | 3, TLF | 3, TLD | IRC | STR | 5],
    /* RXR */
    [INV, INV, 2, 3, 4, 5, 6, 7, 8, SER | 9],
];

/// Consequences a control protocol imposes on the link, drained by the
/// PPP driver after each stimulus.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LinkEvent {
    RecvAccm(u32),
    XmitAccm(u32),
    Mtu(u16),
    /// Peer demands authentication: protocol number plus method byte.
    AuthRequired(u16, u8),
    XmitAcfc,
    XmitPfc,
    LcpUp,
    LcpDown,
    LcpFinished,
    IpcpUp {
        local: Ipv4Addr,
        peer: Ipv4Addr,
        dns1: Ipv4Addr,
        dns2: Ipv4Addr,
    },
    IpcpDown,
    IpcpFinished,
    Ipv6cpUp {
        local_iid: u64,
        peer_iid: u64,
    },
}

/// Driver verdict on a peer Configure-Request.
pub enum RcrResult {
    Accept,
    /// Counter-proposals for the offending options.
    Nak(Vec<u8>),
    /// Options to bounce back in a Configure-Reject.
    Reject(Vec<u8>),
}

/// Parsed view of one control-protocol packet.
pub struct CpPacket<'a> {
    pub code: u8,
    pub identifier: u8,
    /// Everything after the four-byte header.
    pub data: &'a [u8],
}

impl<'a> CpPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<CpPacket<'a>> {
        if buf.len() < CP_HEADER_SZ {
            return None;
        }

        let length = BigEndian::read_u16(&buf[2..4]) as usize;
        if length < CP_HEADER_SZ || length > buf.len() {
            return None;
        }

        Some(CpPacket {
            code: buf[0],
            identifier: buf[1],
            data: &buf[CP_HEADER_SZ..length],
        })
    }

    pub fn options(&self) -> OptionIter<'a> {
        OptionIter {
            data: self.data,
            pos: 0,
        }
    }
}

/// Iterator over type-length-value configuration options.
pub struct OptionIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for OptionIter<'a> {
    /// Option type and its value bytes.
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        let rest = &self.data[self.pos.min(self.data.len())..];

        if rest.len() < 2 {
            return None;
        }

        let opt_len = rest[1] as usize;
        if opt_len < 2 || opt_len > rest.len() {
            return None;
        }

        let item = (rest[0], &rest[2..opt_len]);
        self.pos += opt_len;
        Some(item)
    }
}

/// Appends one option to an option buffer.
pub fn push_option(buf: &mut Vec<u8>, opt_type: u8, value: &[u8]) {
    buf.push(opt_type);
    buf.push(value.len() as u8 + 2);
    buf.extend_from_slice(value);
}

fn build_packet(code: u8, identifier: u8, data: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(CP_HEADER_SZ + data.len());
    pkt.push(code);
    pkt.push(identifier);
    pkt.extend_from_slice(&((CP_HEADER_SZ + data.len()) as u16).to_be_bytes());
    pkt.extend_from_slice(data);
    pkt
}

/// Per-protocol policy plugged into the generic machine.
pub trait CpDriver {
    const PROTO: u16;
    const NAME: &'static str;
    const SUPPORTED_CODES: u16;

    fn this_layer_up(&mut self, ctx: &mut CpContext) {
        let _ = ctx;
    }
    fn this_layer_down(&mut self, ctx: &mut CpContext) {
        let _ = ctx;
    }
    fn this_layer_started(&mut self, ctx: &mut CpContext) {
        let _ = ctx;
    }
    fn this_layer_finished(&mut self, ctx: &mut CpContext) {
        let _ = ctx;
    }

    /// Peer acked our request: apply the options locally.
    fn rca(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        let _ = (packet, ctx);
    }

    /// Peer suggested alternatives: absorb them and regenerate the
    /// request options.
    fn rcn_nak(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        let _ = (packet, ctx);
    }

    /// Peer rejected options: drop them from the request set.
    fn rcn_rej(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        let _ = (packet, ctx);
    }

    /// Classify a peer Configure-Request.
    fn rcr(&mut self, packet: &CpPacket, ctx: &mut CpContext) -> RcrResult {
        let _ = (packet, ctx);
        RcrResult::Accept
    }
}

/// Mutable surface handed to driver callbacks.
pub struct CpContext<'a> {
    /// The request options the machine sends in Configure-Requests.
    pub local_options: &'a mut Vec<u8>,
    /// Link consequences for the PPP driver.
    pub link: &'a mut Vec<LinkEvent>,
}

struct TimerData {
    restart_counter: u32,
    interval: Duration,
    max_counter: u32,
    deadline: Option<Instant>,
}

impl TimerData {
    fn new(max_counter: u32) -> Self {
        Self {
            restart_counter: 0,
            interval: INITIAL_RESTART_INTERVAL,
            max_counter,
            deadline: None,
        }
    }

    fn stop(&mut self) {
        self.deadline = None;
    }

    fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// The counter is decremented on every transmission, the first one
    /// included, so a fresh request is recognisable by a full counter.
    fn is_first_request(&self) -> bool {
        self.restart_counter == self.max_counter
    }
}

/// The generic control-protocol machine.
pub struct Pppcp<D: CpDriver> {
    driver: D,
    state: State,

    config_timer: TimerData,
    terminate_timer: TimerData,
    max_failure: u32,
    failure_counter: u32,

    config_identifier: u8,
    terminate_identifier: u8,
    reject_identifier: u8,

    local_options: Vec<u8>,
    peer_options: Vec<u8>,
    send_reject: bool,

    /// Complete CP packets awaiting transmission under `D::PROTO`.
    out: Vec<Vec<u8>>,
    link: Vec<LinkEvent>,
}

impl<D: CpDriver> Pppcp<D> {
    /// A dormant machine starts in `Stopped` and waits for the peer; used
    /// by server-side LCP.
    pub fn new(driver: D, dormant: bool, max_failure: u32) -> Self {
        Self {
            driver,
            state: if dormant { State::Stopped } else { State::Initial },
            config_timer: TimerData::new(MAX_CONFIGURE),
            terminate_timer: TimerData::new(MAX_TERMINATE),
            max_failure: if max_failure > 0 { max_failure } else { MAX_FAILURE },
            failure_counter: 0,
            config_identifier: 0,
            terminate_identifier: 0,
            reject_identifier: 0,
            local_options: Vec::new(),
            peer_options: Vec::new(),
            send_reject: false,
            out: Vec::new(),
            link: Vec::new(),
        }
    }

    pub fn proto(&self) -> u16 {
        D::PROTO
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Runs `f` with the driver and the request-option buffer, for
    /// configuration surfaces that regenerate the options.
    pub fn with_options<R>(&mut self, f: impl FnOnce(&mut D, &mut Vec<u8>) -> R) -> R {
        f(&mut self.driver, &mut self.local_options)
    }

    pub fn set_local_options(&mut self, options: Vec<u8>) {
        self.local_options = options;
    }

    /// Drains packets generated since the last call.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.out)
    }

    /// Drains link events generated since the last call.
    pub fn take_link_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.link)
    }

    pub fn signal_up(&mut self, now: Instant) {
        self.generate_event(Event::Up, None, now);
    }

    pub fn signal_down(&mut self, now: Instant) {
        self.generate_event(Event::Down, None, now);
    }

    pub fn signal_open(&mut self, now: Instant) {
        self.generate_event(Event::Open, None, now);
    }

    pub fn signal_close(&mut self, now: Instant) {
        self.generate_event(Event::Close, None, now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.config_timer.deadline, self.terminate_timer.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires whichever restart timer has expired.
    pub fn handle_timeout(&mut self, now: Instant) {
        for which in [true, false] {
            let timer = if which {
                &mut self.config_timer
            } else {
                &mut self.terminate_timer
            };

            let expired = matches!(timer.deadline, Some(d) if now >= d);
            if !expired {
                continue;
            }

            timer.deadline = None;
            let event = if timer.restart_counter > 0 {
                Event::ToPlus
            } else {
                Event::ToMinus
            };

            self.generate_event(event, None, now);
        }
    }

    /// Parses one received packet and feeds the corresponding event into
    /// the machine.
    pub fn process_packet(&mut self, buf: &[u8], now: Instant) {
        let Some(packet) = CpPacket::parse(buf) else {
            return;
        };

        if D::SUPPORTED_CODES & (1u16 << packet.code.min(15)) == 0 {
            self.generate_event(Event::Ruc, Some(buf), now);
            return;
        }

        let event = match packet.code {
            CODE_CONFIGURE_REQUEST => Some(self.process_configure_request(&packet)),
            CODE_CONFIGURE_ACK => self.process_configure_ack(&packet),
            CODE_CONFIGURE_NAK => self.process_configure_nak(&packet),
            CODE_CONFIGURE_REJECT => self.process_configure_reject(&packet),
            CODE_TERMINATE_REQUEST => Some(Event::Rtr),
            // A Terminate-Ack is handled even when unelicited.
            CODE_TERMINATE_ACK => Some(Event::Rta),
            // Any rejected code or protocol is catastrophic here: only the
            // bare minimum needed to function is implemented.
            CODE_CODE_REJECT => Some(Event::RxjMinus),
            CODE_PROTOCOL_REJECT => Some(Event::RxjMinus),
            CODE_ECHO_REQUEST => Some(Event::Rxr),
            CODE_ECHO_REPLY | CODE_DISCARD_REQUEST => None,
            _ => None,
        };

        if let Some(event) = event {
            self.generate_event(event, Some(buf), now);
        }
    }

    fn process_configure_request(&mut self, packet: &CpPacket) -> Event {
        if self.failure_counter >= self.max_failure {
            return Event::RcrMinus;
        }

        let mut ctx = CpContext {
            local_options: &mut self.local_options,
            link: &mut self.link,
        };

        match self.driver.rcr(packet, &mut ctx) {
            RcrResult::Accept => Event::RcrPlus,
            RcrResult::Nak(options) => {
                self.peer_options = options;
                self.send_reject = false;
                Event::RcrMinus
            }
            RcrResult::Reject(options) => {
                self.peer_options = options;
                self.send_reject = true;
                Event::RcrMinus
            }
        }
    }

    fn process_configure_ack(&mut self, packet: &CpPacket) -> Option<Event> {
        // A mismatched identifier is silently discarded, and the acked
        // options must equal the sent options byte for byte.
        if packet.identifier != self.config_identifier {
            return None;
        }

        if packet.data != &self.local_options[..] {
            return None;
        }

        let mut ctx = CpContext {
            local_options: &mut self.local_options,
            link: &mut self.link,
        };
        self.driver.rca(packet, &mut ctx);

        Some(Event::Rca)
    }

    fn process_configure_nak(&mut self, packet: &CpPacket) -> Option<Event> {
        if packet.identifier != self.config_identifier {
            return None;
        }

        let mut ctx = CpContext {
            local_options: &mut self.local_options,
            link: &mut self.link,
        };
        self.driver.rcn_nak(packet, &mut ctx);

        Some(Event::Rcn)
    }

    fn process_configure_reject(&mut self, packet: &CpPacket) -> Option<Event> {
        if packet.identifier != self.config_identifier {
            return None;
        }

        let mut ctx = CpContext {
            local_options: &mut self.local_options,
            link: &mut self.link,
        };
        self.driver.rcn_rej(packet, &mut ctx);

        Some(Event::Rcn)
    }

    /// Bounces an entire unknown-protocol frame back inside a
    /// Protocol-Reject. Only legal in the `Opened` state.
    pub fn send_protocol_reject(&mut self, rejected: &[u8]) {
        if self.state != State::Opened {
            return;
        }

        if rejected.len() < 2 {
            return;
        }

        self.reject_identifier = self.reject_identifier.wrapping_add(1);
        let pkt = build_packet(CODE_PROTOCOL_REJECT, self.reject_identifier, rejected);
        self.out.push(pkt);
    }

    // --- actions --------------------------------------------------------

    fn send_configure_request(&mut self, now: Instant) {
        // A fresh request gets a new identifier; retransmissions reuse
        // the previous one.
        if self.config_timer.is_first_request() {
            self.config_identifier = self.config_identifier.wrapping_add(1);
        }

        let pkt = build_packet(
            CODE_CONFIGURE_REQUEST,
            self.config_identifier,
            &self.local_options,
        );
        self.out.push(pkt);

        self.config_timer.restart_counter =
            self.config_timer.restart_counter.saturating_sub(1);
        self.config_timer.start(now);
    }

    fn send_configure_ack(&mut self, request: &[u8]) {
        let Some(req) = CpPacket::parse(request) else {
            return;
        };

        self.failure_counter = 0;

        let pkt = build_packet(CODE_CONFIGURE_ACK, req.identifier, req.data);
        self.out.push(pkt);
    }

    fn send_configure_nak(&mut self, request: &[u8]) {
        let Some(req) = CpPacket::parse(request) else {
            return;
        };

        // Past Max-Failure every remaining disagreement turns into a
        // whole-request Reject.
        let pkt = if self.failure_counter >= self.max_failure {
            build_packet(CODE_CONFIGURE_REJECT, req.identifier, req.data)
        } else {
            let code = if self.send_reject {
                CODE_CONFIGURE_REJECT
            } else {
                self.failure_counter += 1;
                CODE_CONFIGURE_NAK
            };
            build_packet(code, req.identifier, &self.peer_options)
        };

        self.out.push(pkt);
        self.peer_options.clear();
    }

    fn send_terminate_request(&mut self, now: Instant) {
        if self.terminate_timer.is_first_request() {
            self.terminate_identifier = self.terminate_identifier.wrapping_add(1);
        }

        let pkt = build_packet(CODE_TERMINATE_REQUEST, self.terminate_identifier, &[]);
        self.out.push(pkt);

        self.terminate_timer.restart_counter =
            self.terminate_timer.restart_counter.saturating_sub(1);
        self.terminate_timer.start(now);
    }

    fn send_terminate_ack(&mut self, request: Option<&[u8]>, now: Instant) {
        let identifier = request
            .and_then(CpPacket::parse)
            .map(|p| p.identifier)
            .unwrap_or(0);

        let pkt = build_packet(CODE_TERMINATE_ACK, identifier, &[]);
        self.out.push(pkt);

        self.terminate_timer.start(now);
    }

    fn send_code_reject(&mut self, rejected: &[u8]) {
        self.reject_identifier = self.reject_identifier.wrapping_add(1);
        let pkt = build_packet(CODE_CODE_REJECT, self.reject_identifier, rejected);
        self.out.push(pkt);
    }

    fn send_echo_reply(&mut self, request: &[u8]) {
        let Some(req) = CpPacket::parse(request) else {
            return;
        };

        // The magic number is always zero: we never negotiate one.
        let pkt = build_packet(CODE_ECHO_REPLY, req.identifier, &[0, 0, 0, 0]);
        self.out.push(pkt);
    }

    fn transition(&mut self, new_state: State) {
        match new_state {
            State::Initial
            | State::Starting
            | State::Closed
            | State::Stopped
            | State::Opened => {
                self.config_timer.stop();
                self.terminate_timer.stop();
            }
            State::Closing
            | State::Stopping
            | State::ReqSent
            | State::AckRcvd
            | State::AckSent => {}
        }

        self.state = new_state;
    }

    fn generate_event(&mut self, event: Event, packet: Option<&[u8]>, now: Instant) {
        let actions = TRANSITIONS[event as usize][self.state as usize];
        let new_state = State::from_index(actions & 0xf);

        log::debug!(
            "{}: event {:?} in {:?} -> {:?} (actions {:#x})",
            D::NAME,
            event,
            self.state,
            new_state,
            actions
        );

        if actions & INV != 0 {
            log::debug!("{}: illegal event {:?} in {:?}", D::NAME, event, self.state);
            return;
        }

        if actions & IRC != 0 {
            let timer = if new_state == State::Closing || new_state == State::Stopping {
                &mut self.terminate_timer
            } else {
                &mut self.config_timer
            };
            timer.restart_counter = timer.max_counter;
        } else if actions & ZRC != 0 {
            self.terminate_timer.restart_counter = 0;
        }

        if actions & SCR != 0 {
            self.send_configure_request(now);
        }

        if actions & SCA != 0 {
            if let Some(packet) = packet {
                self.send_configure_ack(packet);
            }
        } else if actions & SCN != 0 {
            if let Some(packet) = packet {
                self.send_configure_nak(packet);
            }
        }

        if actions & STR != 0 {
            self.send_terminate_request(now);
        } else if actions & STA != 0 {
            self.send_terminate_ack(packet, now);
        }

        if actions & SCJ != 0 {
            if let Some(packet) = packet {
                self.send_code_reject(packet);
            }
        }

        if actions & SER != 0 {
            if let Some(packet) = packet {
                self.send_echo_reply(packet);
            }
        }

        self.transition(new_state);

        let mut ctx = CpContext {
            local_options: &mut self.local_options,
            link: &mut self.link,
        };

        if actions & TLS != 0 {
            self.driver.this_layer_started(&mut ctx);
        } else if actions & TLU != 0 {
            self.driver.this_layer_up(&mut ctx);
        } else if actions & TLD != 0 {
            self.driver.this_layer_down(&mut ctx);
        } else if actions & TLF != 0 {
            self.driver.this_layer_finished(&mut ctx);
        }
    }
}
