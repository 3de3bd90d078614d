//! Telephony emulator: an AT server tuned to the DUN and HFP
//! personalities.
//!
//! DUN accepts `ATD` and swaps the channel over to a PPP server against a
//! caller-configured private network; `ATH` tears the call down, `ATO`
//! re-enters data mode after a `+++` escape. HFP publishes the standard
//! indicator table and implements the service-level-connection bootstrap
//! (`+BRSF`, `+CIND`, `+CMER`) plus `+CLIP`, `+CCWA`, `+CMEE` and `+BIA`.
//!
//! Until the SLC is established, handlers registered by the consumer
//! answer `ERROR`; indicator events (`+CIEV`) raised while a command is
//! being processed are deferred and flushed right after its final result.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::ppp::{Ppp, PppEvent, TunConfig};
use crate::result::Response;
use crate::server::{Handler, RequestType, Server, ServerResult};
use crate::transport::{Channel, SharedChannel};

/// Cadence of RING while an incoming call is pending.
const RING_TIMEOUT: Duration = Duration::from_secs(3);

/// Standard HFP indicator names.
pub const IND_SERVICE: &str = "service";
pub const IND_CALL: &str = "call";
pub const IND_CALLSETUP: &str = "callsetup";
pub const IND_CALLHELD: &str = "callheld";
pub const IND_SIGNAL: &str = "signal";
pub const IND_ROAMING: &str = "roam";
pub const IND_BATTERY: &str = "battchg";

/// `callsetup` values.
pub const CALLSETUP_NONE: i32 = 0;
pub const CALLSETUP_INCOMING: i32 = 1;
pub const CALLSETUP_OUTGOING: i32 = 2;
pub const CALLSETUP_ALERTING: i32 = 3;

/// `call` values.
pub const CALL_INACTIVE: i32 = 0;
pub const CALL_ACTIVE: i32 = 1;

bitflags::bitflags! {
    /// HFP AG feature bits advertised through `+BRSF`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AgFeatures: i32 {
        const THREE_WAY        = 0x001;
        const REJECT_CALL      = 0x020;
        const ENHANCED_STATUS  = 0x040;
        const ENHANCED_CONTROL = 0x080;
        const EXTENDED_RES     = 0x100;
    }
}

/// Which personality the server speaks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EmulatorType {
    Dun,
    Hfp,
}

/// Caller identity attached to RING / CCWA notifications.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CallerId {
    Valid { number: String, kind: i32 },
    Withheld,
    Unavailable,
}

/// Typed final results for consumer handlers, mapped per the CMEE mode.
pub enum FinalResult {
    Ok,
    Failure,
    Cme(u8, &'static str),
    Cms(u16),
}

/// Private-network settings the DUN personality serves.
#[derive(Clone, Debug)]
pub struct DunSettings {
    pub server_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub primary_dns: Ipv4Addr,
    pub secondary_dns: Ipv4Addr,
    pub tun: TunConfig,
}

struct Indicator {
    name: &'static str,
    value: i32,
    min: i32,
    max: i32,
    deferred: bool,
    active: bool,
    mandatory: bool,
}

/// State shared between the emulator and its command handlers.
struct EmState {
    em_type: EmulatorType,
    slc: bool,
    l_features: AgFeatures,
    r_features: i32,
    events_mode: i32,
    events_ind: i32,
    cmee_mode: i32,
    clip: bool,
    ccwa: bool,
    indicators: Vec<Indicator>,

    /// Identity of the incoming or waiting call, if the owner told us.
    caller: Option<CallerId>,

    // Requests raised from handlers, applied by the emulator.
    dial_request: Option<String>,
    hangup_request: bool,
    resume_request: bool,
    notify_ccwa_now: bool,
    ppp_active: bool,
}

impl EmState {
    fn find(&self, name: &str) -> Option<usize> {
        self.indicators.iter().position(|i| i.name == name)
    }

    fn value(&self, name: &str) -> i32 {
        self.find(name)
            .map(|i| self.indicators[i].value)
            .unwrap_or(0)
    }

    fn reporting(&self) -> bool {
        self.events_mode == 3 && self.events_ind != 0 && self.slc
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EmMode {
    Command,
    /// CONNECT queued; data mode starts once it has drained.
    ConnectPending { resume: bool },
    Data,
}

/// The emulator facade.
pub struct Emulator<C: Channel> {
    server: Server<SharedChannel<C>>,
    channel: SharedChannel<C>,
    state: Rc<RefCell<EmState>>,
    ppp: Option<Ppp<SharedChannel<C>>>,
    mode: EmMode,
    ring_deadline: Option<Instant>,
    dun: Option<DunSettings>,
}

impl<C: Channel + 'static> Emulator<C> {
    pub fn new(channel: C, em_type: EmulatorType) -> Self {
        let channel = SharedChannel::new(channel);
        let server = Server::new(channel.clone());

        let state = Rc::new(RefCell::new(EmState {
            em_type,
            slc: false,
            l_features: AgFeatures::THREE_WAY
                | AgFeatures::REJECT_CALL
                | AgFeatures::ENHANCED_STATUS
                | AgFeatures::ENHANCED_CONTROL
                | AgFeatures::EXTENDED_RES,
            r_features: 0,
            events_mode: 3, // forward events by default
            events_ind: 0,
            cmee_mode: 0,
            clip: false,
            ccwa: false,
            indicators: Vec::new(),
            caller: None,
            dial_request: None,
            hangup_request: false,
            resume_request: false,
            notify_ccwa_now: false,
            ppp_active: false,
        }));

        let mut em = Self {
            server,
            channel,
            state,
            ppp: None,
            mode: EmMode::Command,
            ring_deadline: None,
            dun: None,
        };

        em.install_finish_callback();

        match em_type {
            EmulatorType::Dun => em.register_dun_commands(),
            EmulatorType::Hfp => {
                em.server.set_echo(false);
                em.register_hfp();
            }
        }

        em
    }

    pub fn server_mut(&mut self) -> &mut Server<SharedChannel<C>> {
        &mut self.server
    }

    /// Configures the network the DUN personality hands out.
    pub fn set_dun_settings(&mut self, settings: DunSettings) {
        self.dun = Some(settings);
    }

    /// Identity reported in `+CLIP` / `+CCWA` notifications.
    pub fn set_caller_id(&mut self, caller: Option<CallerId>) {
        self.state.borrow_mut().caller = caller;
    }

    pub fn is_slc_established(&self) -> bool {
        self.state.borrow().slc
    }

    /// Feature bits the hands-free unit reported through `AT+BRSF`.
    pub fn remote_features(&self) -> i32 {
        self.state.borrow().r_features
    }

    // --- consumer surface -----------------------------------------------

    /// Registers a consumer handler. On an HFP emulator the handler
    /// answers `ERROR` until the SLC is established.
    pub fn add_handler(&mut self, prefix: &str, handler: Handler<SharedChannel<C>>) -> bool {
        let state = self.state.clone();

        let gated = move |server: &mut Server<SharedChannel<C>>,
                          req: RequestType,
                          result: &Response| {
            let blocked = {
                let state = state.borrow();
                state.em_type == EmulatorType::Hfp && !state.slc
            };

            if blocked {
                server.send_final(ServerResult::Error);
                return;
            }

            (handler.borrow_mut())(server, req, result);
        };

        self.server.register(prefix, Rc::new(RefCell::new(gated)))
    }

    pub fn remove_handler(&mut self, prefix: &str) -> bool {
        self.server.unregister(prefix)
    }

    pub fn send_unsolicited(&mut self, result: &str) {
        self.server.send_unsolicited(result);
    }

    pub fn send_intermediate(&mut self, result: &str) {
        self.server.send_intermediate(result);
    }

    pub fn send_info(&mut self, line: &str, last: bool) {
        self.server.send_info(line, last);
    }

    /// Finishes the current command with a typed result, honouring the
    /// negotiated CMEE verbosity.
    pub fn send_final(&mut self, result: FinalResult) {
        match result {
            FinalResult::Ok => self.server.send_final(ServerResult::Ok),
            FinalResult::Failure => self.server.send_final(ServerResult::Error),
            FinalResult::Cms(code) => {
                self.server.send_ext_final(&format!("+CMS ERROR: {code}"));
            }
            FinalResult::Cme(code, text) => {
                let mode = self.state.borrow().cmee_mode;
                match mode {
                    1 => self.server.send_ext_final(&format!("+CME ERROR: {code}")),
                    2 => self.server.send_ext_final(&format!("+CME ERROR: {text}")),
                    _ => self.server.send_final(ServerResult::Error),
                }
            }
        }
    }

    /// Adds one indicator row; the HFP constructor installs the standard
    /// table itself.
    pub fn add_indicator(
        &mut self,
        name: &'static str,
        min: i32,
        max: i32,
        default: i32,
        mandatory: bool,
    ) {
        self.state.borrow_mut().indicators.push(Indicator {
            name,
            value: default,
            min,
            max,
            deferred: false,
            active: true,
            mandatory,
        });
    }

    /// Updates an indicator, raising `+CIEV` (deferred while a command is
    /// in flight), `+CCWA` for call-waiting, and driving the RING cadence.
    pub fn set_indicator(&mut self, name: &str, value: i32, now: Instant) {
        let (idx, call_value, callsetup_value) = {
            let state = self.state.borrow();
            let Some(idx) = state.find(name) else { return };
            let ind = &state.indicators[idx];

            if ind.value == value || value < ind.min || value > ind.max {
                return;
            }

            (idx, state.value(IND_CALL), state.value(IND_CALLSETUP))
        };

        let is_call = name == IND_CALL;
        let is_callsetup = name == IND_CALLSETUP;

        // A callsetup going to Incoming beside an active call is a
        // waiting call: +CCWA precedes the +CIEV.
        let waiting =
            is_callsetup && value == CALLSETUP_INCOMING && call_value == CALL_ACTIVE;

        self.state.borrow_mut().indicators[idx].value = value;

        if waiting {
            self.notify_ccwa();
        }

        self.raise_ciev(idx);

        if waiting {
            return;
        }

        // Start ringing on a fresh incoming call, or when the active call
        // drops while another is still incoming; stop on anything else.
        let start_ring = (is_call
            && value == CALL_INACTIVE
            && callsetup_value == CALLSETUP_INCOMING)
            || (is_callsetup && value == CALLSETUP_INCOMING);

        if is_callsetup && value != CALLSETUP_INCOMING {
            self.ring_deadline = None;
            return;
        }

        if start_ring {
            self.notify_ring();
            self.ring_deadline = Some(now + RING_TIMEOUT);
        }
    }

    /// Like [`set_indicator`](Self::set_indicator) but without the
    /// call-state side effects; repeated values are re-announced.
    pub fn set_indicator_forced(&mut self, name: &str, value: i32) {
        let idx = {
            let state = self.state.borrow();
            let Some(idx) = state.find(name) else { return };
            let ind = &state.indicators[idx];

            if value < ind.min || value > ind.max {
                return;
            }
            idx
        };

        self.state.borrow_mut().indicators[idx].value = value;
        self.raise_ciev(idx);
    }

    fn raise_ciev(&mut self, idx: usize) {
        let (announce, text) = {
            let state = self.state.borrow();
            let ind = &state.indicators[idx];

            if !(state.reporting() && ind.active) {
                return;
            }

            (
                !self.server.command_pending(),
                format!("+CIEV: {},{}", idx + 1, ind.value),
            )
        };

        if announce {
            self.server.send_unsolicited(&text);
        } else {
            self.state.borrow_mut().indicators[idx].deferred = true;
        }
    }

    fn notify_ring(&mut self) {
        {
            let state = self.state.borrow();
            if state.em_type == EmulatorType::Hfp && !state.slc {
                return;
            }
        }

        self.server.send_unsolicited("RING");

        let (clip, caller) = {
            let state = self.state.borrow();
            (state.clip, state.caller.clone())
        };

        if !clip {
            return;
        }

        match caller {
            Some(CallerId::Valid { number, kind }) => {
                self.server
                    .send_unsolicited(&format!("+CLIP: \"{number}\",{kind}"));
            }
            Some(CallerId::Withheld) => {
                self.server.send_unsolicited("+CLIP: \"\",128");
            }
            _ => {}
        }
    }

    fn notify_ccwa(&mut self) {
        let (enabled, caller) = {
            let state = self.state.borrow();
            let blocked = state.em_type == EmulatorType::Hfp && !state.slc;
            (!blocked && state.ccwa, state.caller.clone())
        };

        if !enabled {
            return;
        }

        match caller {
            Some(CallerId::Valid { number, kind }) => {
                self.server
                    .send_unsolicited(&format!("+CCWA: \"{number}\",{kind}"));
            }
            _ => self.server.send_unsolicited("+CCWA: \"\",128"),
        }
    }

    // --- pump surface ---------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        let ppp_deadline = self.ppp.as_ref().and_then(|p| p.next_deadline());

        match (self.ring_deadline, ppp_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.ring_deadline {
            if now >= deadline {
                self.notify_ring();
                self.ring_deadline = Some(now + RING_TIMEOUT);
            }
        }

        if let Some(ppp) = self.ppp.as_mut() {
            ppp.handle_timeout(now);
        }
        self.apply_ppp_events();
    }

    /// Drives whichever layer currently owns the channel. Returns `false`
    /// once the transport has disconnected.
    pub fn process_readable(&mut self, now: Instant) -> bool {
        let alive = match self.mode {
            EmMode::Command | EmMode::ConnectPending { .. } => self.server.process_readable(),
            EmMode::Data => match self.ppp.as_mut() {
                Some(ppp) => ppp.process_readable(now),
                None => self.server.process_readable(),
            },
        };

        self.apply_requests();
        self.apply_ppp_events();
        alive
    }

    /// Flushes pending output. Returns `true` while any remains.
    pub fn process_writable(&mut self, now: Instant) -> bool {
        let more = match self.mode {
            EmMode::Command | EmMode::ConnectPending { .. } => self.server.process_writable(),
            EmMode::Data => match self.ppp.as_mut() {
                Some(ppp) => ppp.process_writable(),
                None => self.server.process_writable(),
            },
        };

        // CONNECT has fully left the wire: switch the channel to PPP.
        if !more {
            if let EmMode::ConnectPending { resume } = self.mode {
                self.enter_data_mode(resume, now);
            }
        }

        more
    }

    fn enter_data_mode(&mut self, resume: bool, now: Instant) {
        let Some(ppp) = self.ppp.as_mut() else {
            self.mode = EmMode::Command;
            return;
        };

        self.mode = EmMode::Data;

        if resume {
            ppp.resume();
        } else {
            ppp.listen(now);
        }

        // Let PPP's queued output (none yet for a passive open) flow.
        while self
            .ppp
            .as_mut()
            .map(|p| p.process_writable())
            .unwrap_or(false)
        {}
    }

    fn apply_requests(&mut self) {
        let (dial, hangup, resume, ccwa_now) = {
            let mut state = self.state.borrow_mut();
            (
                state.dial_request.take(),
                std::mem::take(&mut state.hangup_request),
                std::mem::take(&mut state.resume_request),
                std::mem::take(&mut state.notify_ccwa_now),
            )
        };

        if ccwa_now {
            self.notify_ccwa();
        }

        if let Some(dial_str) = dial {
            self.start_dial(&dial_str);
        }

        if hangup {
            self.ppp = None;
            self.state.borrow_mut().ppp_active = false;
            self.mode = EmMode::Command;
        }

        if resume {
            self.server.abort_pending();
            self.server.send_intermediate("CONNECT");
            self.mode = EmMode::ConnectPending { resume: true };
        }
    }

    fn start_dial(&mut self, dial_str: &str) {
        let first = dial_str.chars().next().unwrap_or('\0');
        let routable = matches!(first, '*' | '#' | 'T' | 't');

        let Some(settings) = self.dun.clone().filter(|_| routable) else {
            self.server.send_final(ServerResult::Error);
            return;
        };

        let mut ppp = Ppp::server(self.channel.clone(), settings.server_ip);
        ppp.set_server_info(
            settings.peer_ip,
            settings.primary_dns,
            settings.secondary_dns,
        );
        ppp.set_acfc_enabled(true);
        ppp.set_pfc_enabled(true);
        ppp.set_credentials("", "");
        ppp.set_tun(settings.tun);

        self.ppp = Some(ppp);
        self.state.borrow_mut().ppp_active = true;

        self.server.send_intermediate("CONNECT");
        self.mode = EmMode::ConnectPending { resume: false };
    }

    fn apply_ppp_events(&mut self) {
        let events = match self.ppp.as_mut() {
            Some(ppp) => ppp.take_events(),
            None => return,
        };

        for event in events {
            match event {
                PppEvent::Suspended => {
                    // The peer escaped to command mode; the server takes
                    // the channel back, dial command forgotten.
                    self.mode = EmMode::Command;
                    self.server.abort_pending();
                }
                PppEvent::Disconnect(reason) => {
                    log::debug!("emulator: data call ended: {reason:?}");
                    self.cleanup_ppp();
                }
                PppEvent::Connect {
                    interface,
                    local,
                    peer,
                    dns1,
                    dns2,
                } => {
                    log::info!(
                        "emulator: data call up: if={:?} {local} <-> {peer} dns {dns1} {dns2}",
                        interface
                    );
                }
                _ => {}
            }
        }
    }

    fn cleanup_ppp(&mut self) {
        self.ppp = None;
        self.state.borrow_mut().ppp_active = false;
        self.mode = EmMode::Command;
        self.server.send_final_now(ServerResult::NoCarrier);
    }

    // --- built-in command set -------------------------------------------

    fn install_finish_callback(&mut self) {
        let state = self.state.clone();

        self.server.set_finish_callback(Rc::new(RefCell::new(
            move |server: &mut Server<SharedChannel<C>>| {
                // Flush indicator events deferred while the command ran.
                let mut pending = Vec::new();
                {
                    let mut state = state.borrow_mut();
                    let reporting = state.reporting();

                    for (i, ind) in state.indicators.iter_mut().enumerate() {
                        if !ind.deferred {
                            continue;
                        }
                        if reporting && ind.active {
                            pending.push(format!("+CIEV: {},{}", i + 1, ind.value));
                        }
                        ind.deferred = false;
                    }
                }

                for text in pending {
                    server.send_unsolicited(&text);
                }
            },
        )));
    }

    fn register_dun_commands(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "D",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    if req != RequestType::Set {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    let busy = state.borrow().ppp_active;
                    if busy {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    // No final here: CONNECT or ERROR arrives once the
                    // network side resolves.
                    state.borrow_mut().dial_request = Some(r.lines()[0].clone());
                },
            )),
        );

        let state = self.state.clone();
        self.server.register(
            "H",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    let valid = match req {
                        RequestType::Set => {
                            let mut iter = r.iter();
                            iter.next_line("");
                            iter.next_number() == Some(0)
                        }
                        RequestType::CommandOnly => true,
                        _ => false,
                    };

                    if !valid || !state.borrow().ppp_active {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    state.borrow_mut().hangup_request = true;
                    server.send_final(ServerResult::Ok);
                },
            )),
        );

        let state = self.state.clone();
        self.server.register(
            "O",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    let valid = match req {
                        RequestType::Set => {
                            let mut iter = r.iter();
                            iter.next_line("");
                            iter.next_number() == Some(0)
                        }
                        RequestType::CommandOnly => true,
                        _ => false,
                    };

                    if !valid || !state.borrow().ppp_active {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    // CONNECT goes out from the request applier.
                    state.borrow_mut().resume_request = true;
                },
            )),
        );
    }

    fn register_hfp(&mut self) {
        self.add_indicator(IND_SERVICE, 0, 1, 0, false);
        self.add_indicator(IND_CALL, 0, 1, 0, true);
        self.add_indicator(IND_CALLSETUP, 0, 3, 0, true);
        self.add_indicator(IND_CALLHELD, 0, 2, 0, true);
        self.add_indicator(IND_SIGNAL, 0, 5, 0, false);
        self.add_indicator(IND_ROAMING, 0, 1, 0, false);
        self.add_indicator(IND_BATTERY, 0, 5, 5, false);

        self.register_brsf();
        self.register_cind();
        self.register_cmer();
        self.register_clip();
        self.register_ccwa();
        self.register_cmee();
        self.register_bia();
    }

    fn register_brsf(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+BRSF",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    if req != RequestType::Set {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    let mut iter = r.iter();
                    iter.next_line("");

                    let Some(val) = iter.next_number() else {
                        server.send_final(ServerResult::Error);
                        return;
                    };

                    if !(0..=127).contains(&val) {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    let features = {
                        let mut state = state.borrow_mut();
                        state.r_features = val;
                        state.l_features.bits()
                    };

                    server.send_info(&format!("+BRSF: {features}"), true);
                    server.send_final(ServerResult::Ok);
                },
            )),
        );
    }

    fn register_cind(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+CIND",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, _r: &Response| {
                    match req {
                        RequestType::Query => {
                            let state = state.borrow();
                            let values: Vec<String> = state
                                .indicators
                                .iter()
                                .map(|i| i.value.to_string())
                                .collect();

                            server.send_info(&format!("+CIND: {}", values.join(",")), true);
                            server.send_final(ServerResult::Ok);
                        }

                        RequestType::Support => {
                            let state = state.borrow();
                            let specs: Vec<String> = state
                                .indicators
                                .iter()
                                .map(|i| {
                                    let sep = if i.max - i.min == 1 { ',' } else { '-' };
                                    format!("(\"{}\",({}{}{}))", i.name, i.min, sep, i.max)
                                })
                                .collect();

                            server.send_info(&format!("+CIND: {}", specs.join(",")), true);
                            server.send_final(ServerResult::Ok);
                        }

                        _ => server.send_final(ServerResult::Error),
                    }
                },
            )),
        );
    }

    fn register_cmer(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+CMER",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    match req {
                        RequestType::Query => {
                            let state = state.borrow();
                            server.send_info(
                                &format!("+CMER: {},0,0,{},0", state.events_mode, state.events_ind),
                                true,
                            );
                            server.send_final(ServerResult::Ok);
                        }

                        RequestType::Support => {
                            server.send_info("+CMER: (0,3),(0),(0),(0,1),(0)", true);
                            server.send_final(ServerResult::Ok);
                        }

                        RequestType::Set => {
                            let (mode_now, ind_now) = {
                                let state = state.borrow();
                                (state.events_mode, state.events_ind)
                            };

                            match parse_cmer_set(r, mode_now, ind_now) {
                                Some((mode, ind)) => {
                                    let mut state = state.borrow_mut();
                                    state.events_mode = mode;
                                    state.events_ind = ind;

                                    server.send_final(ServerResult::Ok);

                                    // The first successful CMER set
                                    // establishes the SLC.
                                    state.slc = true;
                                }
                                None => server.send_final(ServerResult::Error),
                            }
                        }

                        _ => server.send_final(ServerResult::Error),
                    }
                },
            )),
        );
    }

    fn register_clip(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+CLIP",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    if !state.borrow().slc || req != RequestType::Set {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    let mut iter = r.iter();
                    iter.next_line("");

                    match iter.next_number() {
                        Some(v @ (0 | 1)) if !iter.skip_next() => {
                            state.borrow_mut().clip = v == 1;
                            server.send_final(ServerResult::Ok);
                        }
                        _ => server.send_final(ServerResult::Error),
                    }
                },
            )),
        );
    }

    fn register_ccwa(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+CCWA",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    if !state.borrow().slc || req != RequestType::Set {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    let mut iter = r.iter();
                    iter.next_line("");

                    match iter.next_number() {
                        Some(v @ (0 | 1)) if !iter.skip_next() => {
                            let enable = v == 1;

                            {
                                let mut state = state.borrow_mut();

                                // A waiting call that predates the enable
                                // is announced immediately.
                                if enable
                                    && !state.ccwa
                                    && state.value(IND_CALLSETUP) == CALLSETUP_INCOMING
                                    && state.value(IND_CALL) == CALL_ACTIVE
                                {
                                    state.notify_ccwa_now = true;
                                }

                                state.ccwa = enable;
                            }

                            server.send_final(ServerResult::Ok);
                        }
                        _ => server.send_final(ServerResult::Error),
                    }
                },
            )),
        );
    }

    fn register_cmee(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+CMEE",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    match req {
                        RequestType::Set => {
                            let mut iter = r.iter();
                            iter.next_line("");

                            match iter.next_number() {
                                Some(v @ (0 | 1)) => {
                                    state.borrow_mut().cmee_mode = v;
                                    server.send_final(ServerResult::Ok);
                                }
                                _ => server.send_final(ServerResult::Error),
                            }
                        }

                        RequestType::Query => {
                            let mode = state.borrow().cmee_mode;
                            server.send_info(&format!("+CMEE: {mode}"), true);
                            server.send_final(ServerResult::Ok);
                        }

                        RequestType::Support => {
                            // HFP supports only modes 0 and 1.
                            server.send_info("+CMEE: (0,1)", true);
                            server.send_final(ServerResult::Ok);
                        }

                        _ => server.send_final(ServerResult::Error),
                    }
                },
            )),
        );
    }

    fn register_bia(&mut self) {
        let state = self.state.clone();
        self.server.register(
            "+BIA",
            Rc::new(RefCell::new(
                move |server: &mut Server<SharedChannel<C>>, req: RequestType, r: &Response| {
                    if req != RequestType::Set {
                        server.send_final(ServerResult::Error);
                        return;
                    }

                    // Validate: every present field is 0 or 1 and nothing
                    // else trails.
                    {
                        let mut iter = r.iter();
                        iter.next_line("");

                        loop {
                            match iter.next_number_default(0) {
                                Some(0) | Some(1) => continue,
                                Some(_) => {
                                    server.send_final(ServerResult::Error);
                                    return;
                                }
                                None => break,
                            }
                        }

                        if iter.skip_next() {
                            server.send_final(ServerResult::Error);
                            return;
                        }
                    }

                    let mut state = state.borrow_mut();
                    let mut iter = r.iter();
                    iter.next_line("");

                    for ind in state.indicators.iter_mut() {
                        let Some(v) = iter.next_number_default(ind.active as i32) else {
                            break;
                        };

                        if ind.mandatory {
                            continue;
                        }

                        ind.active = v != 0;
                    }

                    server.send_final(ServerResult::Ok);
                },
            )),
        );
    }
}

/// Parses the `+CMER=` argument list: mode and ind may change, keyp, disp
/// and bfr must be zero, anything non-numeric fails, anything omitted
/// keeps its old value.
fn parse_cmer_set(r: &Response, mode_now: i32, ind_now: i32) -> Option<(i32, i32)> {
    let mut iter = r.iter();
    iter.next_line("");

    let mode = iter.next_number_default(mode_now)?;
    if mode != 0 && mode != 3 {
        return None;
    }

    // keyp
    match iter.next_number_default(0) {
        None => return Some((mode, ind_now)),
        Some(0) => {}
        Some(_) => return None,
    }

    // disp
    match iter.next_number_default(0) {
        None => return Some((mode, ind_now)),
        Some(0) => {}
        Some(_) => return None,
    }

    // ind
    let ind = match iter.next_number_default(ind_now) {
        None => return Some((mode, ind_now)),
        Some(v @ (0 | 1)) => v,
        Some(_) => return None,
    };

    // bfr
    match iter.next_number_default(0) {
        None => return Some((mode, ind)),
        Some(0) => {}
        Some(_) => return None,
    }

    // bfr must be the last parameter.
    let mut trailing = iter;
    if trailing.skip_next() {
        return None;
    }

    Some((mode, ind))
}
