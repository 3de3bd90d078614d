//! PPP link driver: phase machine, protocol dispatch and the transmit
//! paths with their ACCM/ACFC/PFC rules.
//!
//! A [`Ppp`] owns its HDLC codec and endpoint plus one control-protocol
//! machine per negotiated protocol. Incoming frames are unstuffed by HDLC,
//! dispatched by protocol number and filtered by phase; outgoing control
//! packets always travel before anything the phase change they cause might
//! queue, because every stimulus drains the control machines' output
//! immediately.

pub mod auth;
pub mod cp;
pub mod ipcp;
pub mod ipv6cp;
pub mod lcp;
#[cfg(target_os = "linux")]
pub mod net;

use std::cell::Cell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::hdlc::Hdlc;
use crate::transport::{Channel, Endpoint, ReadOutcome};

use auth::{Chap, Pap, PapTimeout};
use cp::{LinkEvent, Pppcp};
use ipcp::Ipcp;
use ipv6cp::Ipv6cp;
use lcp::Lcp;

pub const LCP_PROTOCOL: u16 = 0xC021;
pub const PAP_PROTOCOL: u16 = 0xC023;
pub const CHAP_PROTOCOL: u16 = 0xC223;
pub const IPCP_PROTOCOL: u16 = 0x8021;
pub const IPV6CP_PROTOCOL: u16 = 0x8057;
pub const PPP_IP_PROTOCOL: u16 = 0x0021;

/// CHAP algorithm identifier for MD5.
pub const MD5: u8 = 5;

const PPP_ADDR_FIELD: u8 = 0xFF;
const PPP_CTRL: u8 = 0x03;

const DEFAULT_MRU: u16 = 1500;
const DEFAULT_MTU: u16 = 1500;

/// Silence around the outgoing `+++` escape.
const SUSPEND_GUARD: Duration = Duration::from_millis(1500);

/// Link phases. Transitions are driven by LCP, authentication and IPCP
/// events; data only flows in `LinkUp`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Dead,
    Establishment,
    Authentication,
    Network,
    LinkUp,
    Termination,
}

/// Why the link came down.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DisconnectReason {
    Unknown,
    AuthFail,
    IpcpFail,
    PeerClosed,
    LinkDead,
    LocalClose,
    NetFail,
}

/// Where IP packets go once IPCP is up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TunConfig {
    /// No kernel interface: IP packets surface as [`PppEvent::IpPacket`]
    /// and are injected with [`Ppp::send_ip_packet`].
    Disabled,
    /// Open `/dev/net/tun` and create a `ppp%d` interface.
    #[cfg(target_os = "linux")]
    Create,
    /// Adopt a pre-opened TUN descriptor; ownership transfers on IPCP-Up.
    #[cfg(target_os = "linux")]
    Fd(std::os::fd::RawFd),
}

/// Notifications surfaced to the owner of the link.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PppEvent {
    /// IPCP finished: addresses are live and the interface (when a TUN is
    /// attached) is configured.
    Connect {
        interface: Option<String>,
        local: Ipv4Addr,
        peer: Ipv4Addr,
        dns1: Ipv4Addr,
        dns2: Ipv4Addr,
    },
    /// IPv6CP finished.
    Ipv6Connect { local_iid: u64, peer_iid: u64 },
    /// The link reached `Dead` and all output has drained.
    Disconnect(DisconnectReason),
    /// A received IP packet with no TUN attached.
    IpPacket(Vec<u8>),
    /// The escape sequence completed; the owner may reuse the channel in
    /// command mode.
    Suspended,
}

enum SuspendStage {
    /// Waiting out the guard before sending `+++`.
    Before(Instant),
    /// `+++` sent, waiting out the trailing guard.
    After(Instant),
}

/// One PPP link over a byte channel.
pub struct Ppp<C: Channel> {
    io: Endpoint<C>,
    hdlc: Hdlc,

    phase: Phase,
    lcp: Pppcp<Lcp>,
    ipcp: Pppcp<Ipcp>,
    ipv6cp: Option<Pppcp<Ipv6cp>>,
    chap: Option<Chap>,
    pap: Option<Pap>,

    #[cfg(target_os = "linux")]
    net: Option<net::PppNet>,

    username: String,
    password: String,

    mru: u16,
    mtu: u16,
    xmit_acfc: bool,
    xmit_pfc: bool,

    tun: TunConfig,
    is_server: bool,
    suspended: bool,
    suspend_stage: Option<SuspendStage>,

    disconnect_reason: DisconnectReason,
    sta_pending: bool,
    sta_done: Rc<Cell<bool>>,
    dead_notified: bool,

    events: Vec<PppEvent>,
}

impl<C: Channel> Ppp<C> {
    /// Client-side link.
    pub fn new(channel: C) -> Self {
        Self::init(channel, false, Ipv4Addr::UNSPECIFIED)
    }

    /// Server-side link offering `local` as its own address.
    pub fn server(channel: C, local: Ipv4Addr) -> Self {
        Self::init(channel, true, local)
    }

    fn init(channel: C, is_server: bool, local: Ipv4Addr) -> Self {
        Self {
            io: Endpoint::new(channel),
            hdlc: Hdlc::new(),
            phase: Phase::Dead,
            lcp: lcp::new_lcp(is_server),
            ipcp: ipcp::new_ipcp(is_server, local),
            ipv6cp: None,
            chap: None,
            pap: None,
            #[cfg(target_os = "linux")]
            net: None,
            username: String::new(),
            password: String::new(),
            mru: DEFAULT_MRU,
            mtu: DEFAULT_MTU,
            xmit_acfc: false,
            xmit_pfc: false,
            tun: TunConfig::Disabled,
            is_server,
            suspended: true,
            suspend_stage: None,
            disconnect_reason: DisconnectReason::Unknown,
            sta_pending: false,
            sta_done: Rc::new(Cell::new(false)),
            dead_notified: false,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Negotiated transmit MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Our receive MRU; the default unless a consumer overrides it.
    pub fn mru(&self) -> u16 {
        self.mru
    }

    pub fn tun_config(&self) -> TunConfig {
        self.tun
    }

    pub fn set_credentials(&mut self, username: &str, password: &str) -> bool {
        if username.len() > 255 || password.len() > 255 {
            return false;
        }

        self.username = username.to_string();
        self.password = password.to_string();
        true
    }

    pub fn set_tun(&mut self, tun: TunConfig) {
        self.tun = tun;
    }

    /// Server-side peer address and DNS info handed out over IPCP.
    pub fn set_server_info(&mut self, peer: Ipv4Addr, dns1: Ipv4Addr, dns2: Ipv4Addr) {
        self.ipcp
            .with_options(|driver, _| driver.set_server_info(peer, dns1, dns2));
    }

    pub fn set_acfc_enabled(&mut self, enabled: bool) {
        self.lcp
            .with_options(|driver, options| driver.set_acfc_enabled(enabled, options));
    }

    pub fn set_pfc_enabled(&mut self, enabled: bool) {
        self.lcp
            .with_options(|driver, options| driver.set_pfc_enabled(enabled, options));
    }

    /// Enables IPv6CP with the configured interface identifiers.
    pub fn enable_ipv6(&mut self, local_iid: u64, peer_iid: u64) {
        self.ipv6cp = Some(ipv6cp::new_ipv6cp(self.is_server, local_iid, peer_iid));
    }

    pub fn take_events(&mut self) -> Vec<PppEvent> {
        std::mem::take(&mut self.events)
    }

    /// Administrative open: starts LCP negotiation as the initiator.
    pub fn open(&mut self, now: Instant) {
        self.suspended = false;
        self.hdlc.set_no_carrier_detect(true);
        self.hdlc.set_suspend_enabled(true);

        self.lcp.signal_up(now);
        self.lcp.signal_open(now);
        self.enter_phase(Phase::Establishment);
        self.flush_lcp(now);
    }

    /// Passive open: the dormant LCP machine sits in `Stopped` and waits
    /// for the peer's Configure-Request.
    pub fn listen(&mut self, now: Instant) {
        self.suspended = false;
        self.hdlc.set_suspend_enabled(true);

        self.enter_phase(Phase::Establishment);
        self.flush_lcp(now);
    }

    /// Administrative close: sends LCP Terminate-Request; the disconnect
    /// is reported only after the final ack has left the wire.
    pub fn shutdown(&mut self, now: Instant) {
        if self.phase == Phase::Dead || self.phase == Phase::Termination {
            return;
        }

        self.disconnect_reason = DisconnectReason::LocalClose;
        self.lcp.signal_close(now);
        self.flush_lcp(now);
    }

    /// Begins the `+++` dance to drop into command mode.
    pub fn suspend(&mut self, now: Instant) {
        self.suspended = true;
        #[cfg(target_os = "linux")]
        if let Some(net) = self.net.as_mut() {
            net.suspend();
        }
        self.suspend_stage = Some(SuspendStage::Before(now + SUSPEND_GUARD));
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        self.suspend_stage = None;
        #[cfg(target_os = "linux")]
        if let Some(net) = self.net.as_mut() {
            net.resume();
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.io.is_disconnected()
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint<C> {
        &mut self.io
    }

    // --- timers ---------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;

        let mut fold = |d: Option<Instant>| {
            deadline = match (deadline, d) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };

        fold(self.lcp.next_deadline());
        fold(self.ipcp.next_deadline());
        if let Some(cp) = &self.ipv6cp {
            fold(cp.next_deadline());
        }
        if let Some(pap) = &self.pap {
            fold(pap.next_deadline());
        }
        fold(self.hdlc.next_deadline());
        fold(match &self.suspend_stage {
            Some(SuspendStage::Before(d)) | Some(SuspendStage::After(d)) => Some(*d),
            None => None,
        });

        deadline
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.lcp.handle_timeout(now);
        self.flush_lcp(now);

        self.ipcp.handle_timeout(now);
        self.flush_ipcp(now);

        if let Some(cp) = self.ipv6cp.as_mut() {
            cp.handle_timeout(now);
            self.flush_ipv6cp(now);
        }

        if let Some(pap) = self.pap.as_mut() {
            match pap.handle_timeout(now) {
                PapTimeout::Resend(pkt) => self.transmit(PAP_PROTOCOL, &pkt),
                PapTimeout::Failed => self.auth_notify(false, now),
                PapTimeout::Idle => {}
            }
        }

        // Incoming +++ completed its trailing guard.
        if self.hdlc.handle_timeout(self.io.rbuf(), now) {
            self.suspended = true;
            #[cfg(target_os = "linux")]
            if let Some(net) = self.net.as_mut() {
                net.suspend();
            }
            self.events.push(PppEvent::Suspended);
        }

        match self.suspend_stage.take() {
            Some(SuspendStage::Before(d)) if now >= d => {
                self.io.send(b"+++");
                self.suspend_stage = Some(SuspendStage::After(now + SUSPEND_GUARD));
            }
            Some(SuspendStage::After(d)) if now >= d => {
                self.events.push(PppEvent::Suspended);
            }
            other => self.suspend_stage = other,
        }
    }

    // --- receive --------------------------------------------------------

    /// Drives the endpoint and the HDLC decoder. Returns `false` once the
    /// transport is dead.
    pub fn process_readable(&mut self, now: Instant) -> bool {
        match self.io.process_readable() {
            ReadOutcome::Disconnected => {
                self.link_dead(now);
                return false;
            }
            ReadOutcome::Idle => return true,
            ReadOutcome::Data => {}
        }

        if self.suspended {
            return true;
        }

        let frames = self.hdlc.feed(self.io.rbuf(), now);
        for frame in frames {
            self.receive(&frame, now);
        }

        if self.io.is_disconnected() {
            self.link_dead(now);
            return false;
        }

        true
    }

    fn link_dead(&mut self, now: Instant) {
        if self.phase == Phase::Dead {
            return;
        }

        self.disconnect_reason = DisconnectReason::LinkDead;
        self.lcp.signal_down(now);
        self.lcp.signal_close(now);
        self.flush_lcp(now);
    }

    fn drop_packet(&self, protocol: u16) -> bool {
        match self.phase {
            Phase::Establishment | Phase::Termination => protocol != LCP_PROTOCOL,
            Phase::Authentication => {
                protocol != LCP_PROTOCOL
                    && protocol != CHAP_PROTOCOL
                    && protocol != PAP_PROTOCOL
            }
            Phase::Dead => true,
            Phase::Network => {
                protocol != LCP_PROTOCOL
                    && protocol != CHAP_PROTOCOL
                    && protocol != PAP_PROTOCOL
                    && protocol != IPCP_PROTOCOL
                    && protocol != IPV6CP_PROTOCOL
            }
            Phase::LinkUp => false,
        }
    }

    fn receive(&mut self, frame: &[u8], now: Instant) {
        let mut offset = 0;

        if frame.len() >= 2 && frame[0] == PPP_ADDR_FIELD && frame[1] == PPP_CTRL {
            offset = 2;
        }

        if frame.len() < offset + 1 {
            return;
        }

        // RFC 1661: the LSB of each protocol octet marks the last one, so
        // a set LSB on the first byte means a compressed one-byte field.
        let protocol;
        if frame[offset] & 0x1 != 0 {
            protocol = frame[offset] as u16;
            offset += 1;
        } else {
            if frame.len() < offset + 2 {
                return;
            }
            protocol = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
            offset += 2;
        }

        if self.drop_packet(protocol) {
            return;
        }

        let info = &frame[offset..];

        match protocol {
            PPP_IP_PROTOCOL => self.receive_ip(info),
            LCP_PROTOCOL => {
                self.lcp.process_packet(info, now);
                self.flush_lcp(now);
            }
            IPCP_PROTOCOL => {
                self.ipcp.process_packet(info, now);
                self.flush_ipcp(now);
            }
            IPV6CP_PROTOCOL if self.ipv6cp.is_some() => {
                if let Some(cp) = self.ipv6cp.as_mut() {
                    cp.process_packet(info, now);
                }
                self.flush_ipv6cp(now);
            }
            CHAP_PROTOCOL if self.chap.is_some() => {
                let outcome = self.chap.as_mut().unwrap().process_packet(info);

                if let Some(response) = outcome.response {
                    self.transmit(CHAP_PROTOCOL, &response);
                }
                if let Some(ok) = outcome.result {
                    self.auth_notify(ok, now);
                }
            }
            PAP_PROTOCOL if self.pap.is_some() => {
                let outcome = self.pap.as_mut().unwrap().process_packet(info);

                if let Some(ok) = outcome.result {
                    self.auth_notify(ok, now);
                }
            }
            _ => {
                // Unknown protocol: bounce protocol number and info back
                // in an LCP Protocol-Reject.
                let mut rejected = protocol.to_be_bytes().to_vec();
                rejected.extend_from_slice(info);
                self.lcp.send_protocol_reject(&rejected);
                self.flush_lcp(now);
            }
        }
    }

    fn receive_ip(&mut self, info: &[u8]) {
        #[cfg(target_os = "linux")]
        if let Some(net) = self.net.as_mut() {
            net.process_packet(info);
            return;
        }

        self.events.push(PppEvent::IpPacket(info.to_vec()));
    }

    /// Injects one IP packet into the link; the path TUN reads take.
    pub fn send_ip_packet(&mut self, packet: &[u8]) {
        if self.phase != Phase::LinkUp {
            return;
        }

        self.transmit(PPP_IP_PROTOCOL, packet);
    }

    // --- transmit -------------------------------------------------------

    fn transmit(&mut self, protocol: u16, info: &[u8]) {
        if protocol == LCP_PROTOCOL {
            self.send_lcp_frame(info);
            return;
        }

        let hi = (protocol >> 8) as u8;
        let lo = protocol as u8;

        let mut frame = Vec::with_capacity(info.len() + 4);

        // Address/control go out unless the peer agreed to ACFC; the
        // protocol field shrinks to one byte under PFC when its upper
        // byte is zero.
        if hi == 0 {
            match (self.xmit_acfc, self.xmit_pfc) {
                (true, true) => frame.push(lo),
                (true, false) => {
                    frame.push(hi);
                    frame.push(lo);
                }
                (false, true) => {
                    frame.extend_from_slice(&[PPP_ADDR_FIELD, PPP_CTRL, lo]);
                }
                (false, false) => {
                    frame.extend_from_slice(&[PPP_ADDR_FIELD, PPP_CTRL, hi, lo]);
                }
            }
        } else if self.xmit_acfc {
            frame.push(hi);
            frame.push(lo);
        } else {
            frame.extend_from_slice(&[PPP_ADDR_FIELD, PPP_CTRL, hi, lo]);
        }

        frame.extend_from_slice(info);

        if !self.hdlc.send(&frame) {
            log::debug!("ppp: failed to queue a frame");
            return;
        }

        self.io.set_wants_write(true);
    }

    fn send_lcp_frame(&mut self, info: &[u8]) {
        let code = info.first().copied().unwrap_or(0);

        // Link configuration, termination and code-reject packets always
        // use the default sending ACCM.
        let lcp_config = (1..8).contains(&code);
        let sta = code == cp::CODE_TERMINATE_ACK;

        let saved_accm = self.hdlc.xmit_accm();
        if lcp_config {
            self.hdlc.set_xmit_accm(!0);
        }

        let mut frame = Vec::with_capacity(info.len() + 4);
        frame.extend_from_slice(&[PPP_ADDR_FIELD, PPP_CTRL]);
        frame.extend_from_slice(&LCP_PROTOCOL.to_be_bytes());
        frame.extend_from_slice(info);

        if self.hdlc.send(&frame) {
            if sta {
                // Hold the disconnect report until the ack drains.
                self.sta_pending = true;
                self.sta_done.set(false);
                let flag = self.sta_done.clone();
                self.io.set_write_done(Box::new(move || flag.set(true)));
            }
            self.io.set_wants_write(true);
        } else {
            log::debug!("ppp: failed to queue an lcp frame");
        }

        if lcp_config {
            self.hdlc.set_xmit_accm(saved_accm);
        }
    }

    /// Flushes the HDLC write queue. Returns `true` while output remains.
    pub fn process_writable(&mut self) -> bool {
        let more = self.hdlc.process_writable(&mut self.io);

        if self.sta_done.get() {
            self.sta_done.set(false);
            self.sta_pending = false;

            if self.phase == Phase::Dead {
                self.notify_dead();
            }
        }

        more
    }

    // --- phase machine --------------------------------------------------

    fn enter_phase(&mut self, phase: Phase) {
        log::debug!("ppp: phase {:?}", phase);
        self.phase = phase;

        if phase == Phase::Dead && !self.sta_pending {
            self.notify_dead();
        }
    }

    fn notify_dead(&mut self) {
        if self.dead_notified {
            return;
        }

        self.dead_notified = true;
        self.events.push(PppEvent::Disconnect(self.disconnect_reason));
    }

    fn auth_notify(&mut self, success: bool, now: Instant) {
        if !success {
            self.disconnect_reason = DisconnectReason::AuthFail;
            self.lcp.signal_close(now);
            self.flush_lcp(now);
            return;
        }

        self.enter_phase(Phase::Network);

        self.ipcp.signal_open(now);
        self.ipcp.signal_up(now);
        self.flush_ipcp(now);

        if self.ipv6cp.is_some() {
            if let Some(cp) = self.ipv6cp.as_mut() {
                cp.signal_open(now);
                cp.signal_up(now);
            }
            self.flush_ipv6cp(now);
        }
    }

    fn flush_lcp(&mut self, now: Instant) {
        loop {
            let packets = self.lcp.take_output();
            let events = self.lcp.take_link_events();

            if packets.is_empty() && events.is_empty() {
                break;
            }

            for packet in packets {
                self.transmit(LCP_PROTOCOL, &packet);
            }

            for event in events {
                self.handle_link_event(event, now);
            }
        }
    }

    fn flush_ipcp(&mut self, now: Instant) {
        loop {
            let packets = self.ipcp.take_output();
            let events = self.ipcp.take_link_events();

            if packets.is_empty() && events.is_empty() {
                break;
            }

            for packet in packets {
                self.transmit(IPCP_PROTOCOL, &packet);
            }

            for event in events {
                self.handle_link_event(event, now);
            }
        }
    }

    fn flush_ipv6cp(&mut self, now: Instant) {
        loop {
            let (packets, events) = match self.ipv6cp.as_mut() {
                Some(cp) => (cp.take_output(), cp.take_link_events()),
                None => return,
            };

            if packets.is_empty() && events.is_empty() {
                break;
            }

            for packet in packets {
                self.transmit(IPV6CP_PROTOCOL, &packet);
            }

            for event in events {
                self.handle_link_event(event, now);
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::RecvAccm(accm) => self.hdlc.set_recv_accm(accm),
            LinkEvent::XmitAccm(accm) => self.hdlc.set_xmit_accm(accm),
            LinkEvent::Mtu(mtu) => self.mtu = mtu,
            LinkEvent::XmitAcfc => self.xmit_acfc = true,
            LinkEvent::XmitPfc => self.xmit_pfc = true,

            LinkEvent::AuthRequired(proto, method) => match proto {
                CHAP_PROTOCOL => {
                    self.chap = Chap::new(method, &self.username, &self.password);
                    if self.chap.is_none() {
                        log::debug!("ppp: unusable chap method {method}");
                    }
                }
                PAP_PROTOCOL => {
                    self.pap = Some(Pap::new(&self.username, &self.password));
                }
                _ => log::debug!("ppp: unknown authentication protocol {proto:#x}"),
            },

            LinkEvent::LcpUp => {
                if self.chap.is_some() {
                    // Wait for the peer's challenge.
                    self.enter_phase(Phase::Authentication);
                } else if self.pap.is_some() {
                    self.enter_phase(Phase::Authentication);
                    let pkt = self.pap.as_mut().unwrap().start(now);
                    self.transmit(PAP_PROTOCOL, &pkt);
                } else {
                    self.auth_notify(true, now);
                }
            }

            LinkEvent::LcpDown => {
                if self.phase == Phase::Network || self.phase == Phase::LinkUp {
                    self.ipcp.signal_down(now);
                    self.flush_ipcp(now);

                    if self.ipv6cp.is_some() {
                        if let Some(cp) = self.ipv6cp.as_mut() {
                            cp.signal_down(now);
                        }
                        self.flush_ipv6cp(now);
                    }
                }

                if self.disconnect_reason == DisconnectReason::Unknown {
                    self.disconnect_reason = DisconnectReason::PeerClosed;
                }

                self.enter_phase(Phase::Termination);
            }

            LinkEvent::LcpFinished => {
                self.enter_phase(Phase::Dead);
            }

            LinkEvent::IpcpUp {
                local,
                peer,
                dns1,
                dns2,
            } => {
                let interface = self.bring_up_interface();

                #[allow(unused_mut)]
                let mut net_failed = false;
                #[cfg(target_os = "linux")]
                if !matches!(self.tun, TunConfig::Disabled) && self.net.is_none() {
                    net_failed = true;
                }

                if net_failed {
                    self.disconnect_reason = DisconnectReason::NetFail;
                    self.lcp.signal_close(now);
                    self.flush_lcp(now);
                    return;
                }

                self.enter_phase(Phase::LinkUp);
                self.events.push(PppEvent::Connect {
                    interface,
                    local,
                    peer,
                    dns1,
                    dns2,
                });
            }

            LinkEvent::IpcpDown => {
                #[cfg(target_os = "linux")]
                {
                    self.net = None;
                }
            }

            LinkEvent::IpcpFinished => {
                if self.phase == Phase::Network {
                    // Our parameter negotiation failed.
                    self.disconnect_reason = DisconnectReason::IpcpFail;
                    self.ipcp.signal_close(now);
                    self.flush_ipcp(now);
                    self.lcp.signal_close(now);
                    self.flush_lcp(now);
                }
            }

            LinkEvent::Ipv6cpUp {
                local_iid,
                peer_iid,
            } => {
                self.events.push(PppEvent::Ipv6Connect {
                    local_iid,
                    peer_iid,
                });
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn bring_up_interface(&mut self) -> Option<String> {
        match self.tun {
            TunConfig::Disabled => None,
            TunConfig::Create => match net::PppNet::create() {
                Ok(net) => {
                    let name = net.interface_name().to_string();
                    let mut net = net;
                    if !net.set_mtu(self.mtu) {
                        log::debug!("ppp: unable to set mtu");
                    }
                    self.net = Some(net);
                    Some(name)
                }
                Err(e) => {
                    log::debug!("ppp: tun creation failed: {e}");
                    None
                }
            },
            TunConfig::Fd(fd) => match net::PppNet::adopt(fd) {
                Ok(net) => {
                    let name = net.interface_name().to_string();
                    let mut net = net;
                    if !net.set_mtu(self.mtu) {
                        log::debug!("ppp: unable to set mtu");
                    }
                    self.net = Some(net);
                    Some(name)
                }
                Err(e) => {
                    log::debug!("ppp: tun adoption failed: {e}");
                    None
                }
            },
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn bring_up_interface(&mut self) -> Option<String> {
        None
    }

    /// Reads any packets the kernel queued on the TUN side and pushes
    /// them down the link.
    #[cfg(target_os = "linux")]
    pub fn process_tun_readable(&mut self) {
        if self.phase != Phase::LinkUp {
            return;
        }

        let packets = match self.net.as_mut() {
            Some(net) => net.read_packets(self.mtu),
            None => return,
        };

        for packet in packets {
            self.transmit(PPP_IP_PROTOCOL, &packet);
        }
    }

    #[cfg(target_os = "linux")]
    pub fn tun_fd(&self) -> Option<std::os::fd::RawFd> {
        self.net.as_ref().map(|n| n.fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemChannel;

    /// Test-side peer: HDLC codec plus a wire end.
    struct Peer {
        hdlc: Hdlc,
        wire: MemChannel,
    }

    impl Peer {
        fn new(wire: MemChannel) -> Self {
            Self {
                hdlc: Hdlc::new(),
                wire,
            }
        }

        /// Collects the PPP frames the client has sent.
        fn read_frames(&mut self, now: Instant) -> Vec<Vec<u8>> {
            let mut rbuf = crate::ring::RingBuffer::new(8192);
            let mut buf = [0u8; 4096];
            while let Ok(n) = self.wire.recv(&mut buf) {
                if n == 0 {
                    break;
                }
                rbuf.write(&buf[..n]);
            }
            self.hdlc.feed(&mut rbuf, now)
        }

        /// HDLC-encodes and injects one PPP frame (with address/control
        /// and two-byte protocol).
        fn send(&mut self, protocol: u16, info: &[u8]) {
            let mut frame = vec![PPP_ADDR_FIELD, PPP_CTRL];
            frame.extend_from_slice(&protocol.to_be_bytes());
            frame.extend_from_slice(info);

            self.wire.send(&hdlc_encode(&frame)).unwrap();
        }
    }

    /// Byte-stuffs one frame with the default ACCM, the way a modem-side
    /// peer would.
    fn hdlc_encode(frame: &[u8]) -> Vec<u8> {
        fn push_escaped(out: &mut Vec<u8>, b: u8) {
            if b < 0x20 || b == 0x7E || b == 0x7D {
                out.push(0x7D);
                out.push(b ^ 0x20);
            } else {
                out.push(b);
            }
        }

        let mut out = vec![0x7E];
        for &b in frame {
            push_escaped(&mut out, b);
        }

        let check = crate::hdlc::fcs(frame) ^ 0xFFFF;
        push_escaped(&mut out, check as u8);
        push_escaped(&mut out, (check >> 8) as u8);
        out.push(0x7E);
        out
    }

    fn frame_protocol(frame: &[u8]) -> u16 {
        u16::from_be_bytes([frame[2], frame[3]])
    }

    fn cp_packet(frame: &[u8]) -> &[u8] {
        &frame[4..]
    }

    fn lcp_ack_for(frame: &[u8]) -> Vec<u8> {
        // Echo the request back as an ack.
        let mut pkt = cp_packet(frame).to_vec();
        pkt[0] = cp::CODE_CONFIGURE_ACK;
        pkt
    }

    fn setup() -> (Ppp<MemChannel>, Peer, Instant) {
        let (a, b) = MemChannel::pair();
        let ppp = Ppp::new(a);
        (ppp, Peer::new(b), Instant::now())
    }

    fn negotiate_lcp(ppp: &mut Ppp<MemChannel>, peer: &mut Peer, now: Instant) {
        ppp.open(now);
        while ppp.process_writable() {}

        let frames = peer.read_frames(now);
        assert_eq!(frame_protocol(&frames[0]), LCP_PROTOCOL);

        // Ack the client's request and send our own empty one.
        peer.send(LCP_PROTOCOL, &lcp_ack_for(&frames[0]));
        peer.send(LCP_PROTOCOL, &[cp::CODE_CONFIGURE_REQUEST, 1, 0, 4]);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}
    }

    #[test]
    fn open_sends_lcp_configure_request() {
        let (mut ppp, mut peer, now) = setup();

        ppp.open(now);
        assert_eq!(ppp.phase(), Phase::Establishment);
        while ppp.process_writable() {}

        let frames = peer.read_frames(now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frame_protocol(&frames[0]), LCP_PROTOCOL);
        assert_eq!(cp_packet(&frames[0])[0], cp::CODE_CONFIGURE_REQUEST);
    }

    #[test]
    fn lcp_up_without_auth_starts_ipcp() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);

        assert_eq!(ppp.phase(), Phase::Network);

        let frames = peer.read_frames(now);
        // The LCP ack for the peer's request, then the IPCP request.
        assert!(frames
            .iter()
            .any(|f| frame_protocol(f) == IPCP_PROTOCOL
                && cp_packet(f)[0] == cp::CODE_CONFIGURE_REQUEST));
    }

    #[test]
    fn full_ipcp_negotiation_emits_connect_once() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);

        let frames = peer.read_frames(now);
        let ipcp_req = frames
            .iter()
            .find(|f| frame_protocol(f) == IPCP_PROTOCOL)
            .unwrap()
            .clone();
        let id = cp_packet(&ipcp_req)[1];

        // Nak the zeroed request with real addresses.
        let mut opts = Vec::new();
        cp::push_option(&mut opts, 3, &[10, 0, 0, 2]);
        cp::push_option(&mut opts, 129, &[10, 11, 12, 13]);
        cp::push_option(&mut opts, 131, &[10, 11, 12, 14]);
        cp::push_option(&mut opts, 130, &[0, 0, 0, 0]);
        cp::push_option(&mut opts, 132, &[0, 0, 0, 0]);

        let mut nak = vec![cp::CODE_CONFIGURE_NAK, id, 0, 0];
        nak.extend_from_slice(&opts);
        let len = nak.len() as u16;
        nak[2..4].copy_from_slice(&len.to_be_bytes());
        peer.send(IPCP_PROTOCOL, &nak);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        // Client regenerates; ack it verbatim.
        let frames = peer.read_frames(now);
        let revised = frames
            .iter()
            .find(|f| frame_protocol(f) == IPCP_PROTOCOL)
            .unwrap()
            .clone();

        let mut ack = cp_packet(&revised).to_vec();
        ack[0] = cp::CODE_CONFIGURE_ACK;
        peer.send(IPCP_PROTOCOL, &ack);

        // Peer requests its own address.
        let mut opts = Vec::new();
        cp::push_option(&mut opts, 3, &[10, 0, 0, 1]);
        let mut req = vec![cp::CODE_CONFIGURE_REQUEST, 9, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());
        peer.send(IPCP_PROTOCOL, &req);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        assert_eq!(ppp.phase(), Phase::LinkUp);

        let connects: Vec<_> = ppp
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, PppEvent::Connect { .. }))
            .collect();
        assert_eq!(connects.len(), 1);

        match &connects[0] {
            PppEvent::Connect {
                local,
                peer: remote,
                dns1,
                dns2,
                ..
            } => {
                assert_eq!(*local, Ipv4Addr::new(10, 0, 0, 2));
                assert_eq!(*remote, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(*dns1, Ipv4Addr::new(10, 11, 12, 13));
                assert_eq!(*dns2, Ipv4Addr::new(10, 11, 12, 14));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_protocol_draws_protocol_reject() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);
        peer.read_frames(now);

        // Finish IPCP quickly.
        finish_ipcp(&mut ppp, &mut peer, now);
        assert_eq!(ppp.phase(), Phase::LinkUp);
        peer.read_frames(now);

        // CCP is not implemented here.
        peer.send(0x80FD, &[1, 1, 0, 4]);
        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        let frames = peer.read_frames(now);
        let reject = frames
            .iter()
            .find(|f| frame_protocol(f) == LCP_PROTOCOL)
            .unwrap();
        let pkt = cp_packet(reject);
        assert_eq!(pkt[0], cp::CODE_PROTOCOL_REJECT);
        assert_eq!(&pkt[4..6], &0x80FDu16.to_be_bytes());
    }

    fn finish_ipcp(ppp: &mut Ppp<MemChannel>, peer: &mut Peer, now: Instant) {
        let frames = peer.read_frames(now);
        let ipcp_req = frames
            .iter()
            .find(|f| frame_protocol(f) == IPCP_PROTOCOL)
            .cloned()
            .unwrap_or_else(|| {
                // Output already drained by an earlier read; resend by
                // timeout.
                let deadline = ppp.next_deadline().unwrap();
                ppp.handle_timeout(deadline);
                while ppp.process_writable() {}
                peer.read_frames(now)
                    .into_iter()
                    .find(|f| frame_protocol(f) == IPCP_PROTOCOL)
                    .expect("ipcp request")
            });

        let mut ack = cp_packet(&ipcp_req).to_vec();
        ack[0] = cp::CODE_CONFIGURE_ACK;
        peer.send(IPCP_PROTOCOL, &ack);

        let mut opts = Vec::new();
        cp::push_option(&mut opts, 3, &[10, 0, 0, 1]);
        let mut req = vec![cp::CODE_CONFIGURE_REQUEST, 5, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());
        peer.send(IPCP_PROTOCOL, &req);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}
    }

    #[test]
    fn chap_challenge_response_success_flow() {
        let (mut ppp, mut peer, now) = setup();
        ppp.set_credentials("user", "secret");

        ppp.open(now);
        while ppp.process_writable() {}
        let frames = peer.read_frames(now);

        // Peer requires CHAP-MD5 in its Configure-Request.
        peer.send(LCP_PROTOCOL, &lcp_ack_for(&frames[0]));

        let mut opts = Vec::new();
        cp::push_option(&mut opts, 3, &[0xC2, 0x23, MD5]);
        let mut req = vec![cp::CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());
        peer.send(LCP_PROTOCOL, &req);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}
        assert_eq!(ppp.phase(), Phase::Authentication);
        peer.read_frames(now);

        // Challenge -> response.
        let challenge = [1u8, 9, 0, 9, 4, 0xDE, 0xAD, 0xBE, 0xEF];
        peer.send(CHAP_PROTOCOL, &challenge);
        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        let frames = peer.read_frames(now);
        let response = frames
            .iter()
            .find(|f| frame_protocol(f) == CHAP_PROTOCOL)
            .unwrap();
        assert_eq!(cp_packet(response)[0], 2);
        assert_eq!(cp_packet(response)[1], 9);

        // Success moves the link into Network and IPCP starts.
        peer.send(CHAP_PROTOCOL, &[3, 9, 0, 4]);
        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}
        assert_eq!(ppp.phase(), Phase::Network);
    }

    #[test]
    fn chap_failure_terminates_with_auth_fail() {
        let (mut ppp, mut peer, now) = setup();
        ppp.set_credentials("user", "secret");

        ppp.open(now);
        while ppp.process_writable() {}
        let frames = peer.read_frames(now);

        peer.send(LCP_PROTOCOL, &lcp_ack_for(&frames[0]));
        let mut opts = Vec::new();
        cp::push_option(&mut opts, 3, &[0xC2, 0x23, MD5]);
        let mut req = vec![cp::CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());
        peer.send(LCP_PROTOCOL, &req);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        peer.send(CHAP_PROTOCOL, &[4, 1, 0, 4]);
        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        assert_eq!(ppp.phase(), Phase::Termination);

        // Peer acks the terminate request; the link dies as AuthFail.
        let frames = peer.read_frames(now);
        let term = frames
            .iter()
            .find(|f| {
                frame_protocol(f) == LCP_PROTOCOL
                    && cp_packet(f)[0] == cp::CODE_TERMINATE_REQUEST
            })
            .unwrap();
        let id = cp_packet(term)[1];
        peer.send(LCP_PROTOCOL, &[cp::CODE_TERMINATE_ACK, id, 0, 4]);

        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        assert!(ppp
            .take_events()
            .contains(&PppEvent::Disconnect(DisconnectReason::AuthFail)));
    }

    #[test]
    fn shutdown_reports_local_close_after_drain() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);
        peer.read_frames(now);

        ppp.shutdown(now);
        while ppp.process_writable() {}

        let frames = peer.read_frames(now);
        let term = frames
            .iter()
            .find(|f| {
                frame_protocol(f) == LCP_PROTOCOL
                    && cp_packet(f)[0] == cp::CODE_TERMINATE_REQUEST
            })
            .unwrap();
        let id = cp_packet(term)[1];

        peer.send(LCP_PROTOCOL, &[cp::CODE_TERMINATE_ACK, id, 0, 4]);
        assert!(ppp.process_readable(now));
        while ppp.process_writable() {}

        assert_eq!(ppp.phase(), Phase::Dead);
        assert!(ppp
            .take_events()
            .contains(&PppEvent::Disconnect(DisconnectReason::LocalClose)));
    }

    #[test]
    fn ip_packets_surface_as_events_without_tun() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);
        finish_ipcp(&mut ppp, &mut peer, now);
        assert_eq!(ppp.phase(), Phase::LinkUp);

        let ip = [0x45, 0x00, 0x00, 0x14, 0, 0, 0, 0, 64, 1, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2];
        peer.send(PPP_IP_PROTOCOL, &ip);
        assert!(ppp.process_readable(now));

        let events = ppp.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PppEvent::IpPacket(p) if p.as_slice() == ip
        )));
    }

    #[test]
    fn ip_packets_are_dropped_before_link_up() {
        let (mut ppp, mut peer, now) = setup();
        negotiate_lcp(&mut ppp, &mut peer, now);
        assert_eq!(ppp.phase(), Phase::Network);

        peer.send(PPP_IP_PROTOCOL, &[0x45, 0, 0, 4]);
        assert!(ppp.process_readable(now));

        assert!(ppp
            .take_events()
            .iter()
            .all(|e| !matches!(e, PppEvent::IpPacket(_))));
    }
}
