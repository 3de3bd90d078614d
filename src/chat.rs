//! Full-duplex AT command client.
//!
//! Commands are queued and written one terminator-delimited segment at a
//! time; response lines are matched against the head command's accepted
//! prefixes and a table of final-result terminators. Lines that match no
//! command are offered to registered unsolicited-notification prefixes.
//!
//! Callbacks run while the engine is mutably borrowed, so anything a
//! callback wants to do to the engine itself (send a follow-up command,
//! register or cancel) goes through a [`ChatHandle`], which enqueues the
//! operation; the engine applies pending operations as soon as the dispatch
//! frame unwinds.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::result::Response;
use crate::syntax::{Hint, LexResult, Lexer};
use crate::transport::{Channel, Endpoint, ReadOutcome};

const CTRL_Z: u8 = 0x1a;

bitflags! {
    /// Behaviour flags attached to a queued command.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct CommandFlags: u8 {
        /// Responses matching a prefix are two-line: header then PDU.
        const EXPECT_PDU = 0x01;
        /// The modem answers intermediate segments with a bare `> `.
        const EXPECT_SHORT_PROMPT = 0x02;
    }
}

/// Completion callback: success flag plus the collected response.
pub type FinishFn = Box<dyn FnOnce(bool, Response)>;
/// Streaming per-line callback for listing commands.
pub type ListingFn = Box<dyn FnMut(&Response)>;
/// Unsolicited notification callback.
pub type NotifyFn = Rc<RefCell<dyn FnMut(&Response)>>;

/// Built-in final-result terminators, in table order. The order is part of
/// the interface: [`Chat::blacklist_terminator`] masks by this index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum Terminator {
    Ok = 0,
    Error,
    NoDialtone,
    Busy,
    NoCarrier,
    Connect,
    NoAnswer,
    CmsError,
    CmeError,
    ExtError,
}

struct TerminatorInfo {
    token: &'static str,
    /// `None` compares the whole line, `Some(n)` the first n bytes.
    len: Option<usize>,
    success: bool,
}

static TERMINATOR_TABLE: [TerminatorInfo; 10] = [
    TerminatorInfo { token: "OK", len: None, success: true },
    TerminatorInfo { token: "ERROR", len: None, success: false },
    TerminatorInfo { token: "NO DIALTONE", len: None, success: false },
    TerminatorInfo { token: "BUSY", len: None, success: false },
    TerminatorInfo { token: "NO CARRIER", len: None, success: false },
    TerminatorInfo { token: "CONNECT", len: Some(7), success: true },
    TerminatorInfo { token: "NO ANSWER", len: None, success: false },
    TerminatorInfo { token: "+CMS ERROR:", len: Some(11), success: false },
    TerminatorInfo { token: "+CME ERROR:", len: Some(11), success: false },
    TerminatorInfo { token: "+EXT ERROR:", len: Some(11), success: false },
];

struct CustomTerminator {
    token: String,
    len: Option<usize>,
    success: bool,
}

fn terminator_matches(token: &str, len: Option<usize>, line: &str) -> bool {
    match len {
        None => line == token,
        Some(n) => line.len() >= n && line.as_bytes()[..n] == token.as_bytes()[..n],
    }
}

struct Command {
    bytes: Vec<u8>,
    prefixes: Vec<String>,
    flags: CommandFlags,
    id: u32,
    gid: u32,
    callback: Option<FinishFn>,
    listing: Option<ListingFn>,
    wakeup: bool,
}

impl Command {
    fn new(
        gid: u32,
        cmd: &str,
        prefixes: &[&str],
        flags: CommandFlags,
        listing: Option<ListingFn>,
        callback: Option<FinishFn>,
        wakeup: bool,
    ) -> Self {
        let mut bytes = cmd.as_bytes().to_vec();

        // An embedded CR means this is a prompt dialogue; such commands are
        // finished off with Ctrl-Z. Wake-up strings go out verbatim.
        if !wakeup {
            if cmd.contains('\r') {
                bytes.push(CTRL_Z);
            } else {
                bytes.push(b'\r');
            }
        }

        Self {
            bytes,
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            flags,
            id: 0,
            gid,
            callback,
            listing,
            wakeup,
        }
    }

    fn matches_prefix(&self, line: &str) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        self.prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }
}

struct NotifyNode {
    id: u32,
    gid: u32,
    callback: NotifyFn,
    removed: Cell<bool>,
}

struct NotifyEntry {
    prefix: String,
    pdu: bool,
    nodes: Vec<NotifyNode>,
}

struct WakeupConfig {
    cmd: String,
    /// How long to wait for any response to the wake-up string.
    response_timeout: Duration,
    /// Idle period after which the modem is assumed asleep again.
    inactivity: Duration,
}

enum Op {
    Send {
        gid: u32,
        cmd: String,
        prefixes: Vec<String>,
        flags: CommandFlags,
        listing: Option<ListingFn>,
        callback: Option<FinishFn>,
        id: u32,
    },
    Register {
        prefix: String,
        pdu: bool,
        gid: u32,
        callback: NotifyFn,
        id: u32,
    },
    Unregister(u32),
    UnregisterGroup(u32),
    Cancel(u32),
    CancelGroup(u32),
}

struct Shared {
    ops: RefCell<VecDeque<Op>>,
    next_cmd_id: Cell<u32>,
    next_notify_id: Cell<u32>,
}

impl Shared {
    fn alloc_cmd_id(&self) -> u32 {
        let id = self.next_cmd_id.get();
        self.next_cmd_id.set(id + 1);
        id
    }

    fn alloc_notify_id(&self) -> u32 {
        let id = self.next_notify_id.get();
        self.next_notify_id.set(id + 1);
        id
    }
}

/// Deferred-operation handle onto a [`Chat`].
///
/// Cloneable and cheap; safe to use from inside chat callbacks. Operations
/// take effect when the current dispatch finishes (or on the next pump
/// iteration when used from outside).
#[derive(Clone)]
pub struct ChatHandle {
    shared: Rc<Shared>,
}

impl ChatHandle {
    pub fn send(&self, cmd: &str, prefixes: &[&str], callback: FinishFn) -> u32 {
        self.send_full(0, cmd, prefixes, CommandFlags::empty(), None, Some(callback))
    }

    pub fn send_full(
        &self,
        gid: u32,
        cmd: &str,
        prefixes: &[&str],
        flags: CommandFlags,
        listing: Option<ListingFn>,
        callback: Option<FinishFn>,
    ) -> u32 {
        let id = self.shared.alloc_cmd_id();
        self.shared.ops.borrow_mut().push_back(Op::Send {
            gid,
            cmd: cmd.to_string(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            flags,
            listing,
            callback,
            id,
        });
        id
    }

    pub fn register(&self, prefix: &str, callback: NotifyFn, pdu: bool) -> u32 {
        self.register_in_group(0, prefix, callback, pdu)
    }

    pub fn register_in_group(
        &self,
        gid: u32,
        prefix: &str,
        callback: NotifyFn,
        pdu: bool,
    ) -> u32 {
        let id = self.shared.alloc_notify_id();
        self.shared.ops.borrow_mut().push_back(Op::Register {
            prefix: prefix.to_string(),
            pdu,
            gid,
            callback,
            id,
        });
        id
    }

    pub fn unregister(&self, id: u32) {
        self.shared.ops.borrow_mut().push_back(Op::Unregister(id));
    }

    pub fn unregister_group(&self, gid: u32) {
        self.shared.ops.borrow_mut().push_back(Op::UnregisterGroup(gid));
    }

    pub fn cancel(&self, id: u32) {
        self.shared.ops.borrow_mut().push_back(Op::Cancel(id));
    }

    pub fn cancel_group(&self, gid: u32) {
        self.shared.ops.borrow_mut().push_back(Op::CancelGroup(gid));
    }
}

/// A chat running over a type-erased channel; the shape secondary (slave)
/// chats take, e.g. a chat attached to a mux DLC for data-call teardown.
pub type SlaveChat = Chat<Box<dyn Channel>>;

/// AT command engine over one byte channel.
pub struct Chat<C: Channel> {
    io: Endpoint<C>,
    lexer: Lexer,
    shared: Rc<Shared>,

    queue: VecDeque<Command>,
    cmd_bytes_written: usize,
    response_lines: Vec<String>,
    pdu_header: Option<String>,

    notify: Vec<NotifyEntry>,
    in_notify: bool,

    custom_terminators: Vec<CustomTerminator>,
    terminator_blacklist: u16,

    wakeup: Option<WakeupConfig>,
    /// Instant of the last completed command segment, for the idle check.
    last_submit: Option<Instant>,
    wakeup_deadline: Option<Instant>,

    next_gid: u32,
    suspended: bool,
    read_so_far: usize,

    disconnect: Option<Box<dyn FnOnce()>>,
    slave: Option<Box<SlaveChat>>,
}

impl<C: Channel> Chat<C> {
    pub fn new(channel: C) -> Self {
        Self::from_endpoint(Endpoint::new(channel))
    }

    pub fn from_endpoint(io: Endpoint<C>) -> Self {
        Self {
            io,
            lexer: Lexer::new(),
            shared: Rc::new(Shared {
                ops: RefCell::new(VecDeque::new()),
                next_cmd_id: Cell::new(1),
                next_notify_id: Cell::new(1),
            }),
            queue: VecDeque::new(),
            cmd_bytes_written: 0,
            response_lines: Vec::new(),
            pdu_header: None,
            notify: Vec::new(),
            in_notify: false,
            custom_terminators: Vec::new(),
            terminator_blacklist: 0,
            wakeup: None,
            last_submit: None,
            wakeup_deadline: None,
            next_gid: 1,
            suspended: false,
            read_so_far: 0,
            disconnect: None,
            slave: None,
        }
    }

    /// Deferred-operation handle for use inside callbacks.
    pub fn handle(&self) -> ChatHandle {
        ChatHandle {
            shared: self.shared.clone(),
        }
    }

    /// Allocates a fresh command/notification group, the equivalent of
    /// cloning the engine handle.
    pub fn new_group(&mut self) -> u32 {
        let gid = self.next_gid;
        self.next_gid += 1;
        gid
    }

    pub fn set_slave(&mut self, slave: SlaveChat) {
        self.slave = Some(Box::new(slave));
    }

    pub fn slave_mut(&mut self) -> Option<&mut SlaveChat> {
        self.slave.as_deref_mut()
    }

    pub fn take_slave(&mut self) -> Option<SlaveChat> {
        self.slave.take().map(|b| *b)
    }

    pub fn set_disconnect_handler(&mut self, f: Box<dyn FnOnce()>) {
        self.disconnect = Some(f);
    }

    pub fn set_wakeup_command(&mut self, cmd: &str, response_timeout: Duration, inactivity: Duration) {
        self.wakeup = Some(WakeupConfig {
            cmd: cmd.to_string(),
            response_timeout,
            inactivity,
        });
    }

    /// Appends a custom final-response terminator.
    pub fn add_terminator(&mut self, token: &str, len: Option<usize>, success: bool) {
        self.custom_terminators.push(CustomTerminator {
            token: token.to_string(),
            len,
            success,
        });
    }

    /// Disables one of the built-in terminators.
    pub fn blacklist_terminator(&mut self, t: Terminator) {
        self.terminator_blacklist |= 1 << (t as u16);
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        if !self.queue.is_empty() {
            self.io.set_wants_write(true);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.io.is_disconnected()
    }

    /// Hands the raw channel back, e.g. to transfer it into a mux. Pending
    /// commands are dropped unanswered.
    pub fn into_channel(self) -> C {
        self.io.into_channel()
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint<C> {
        &mut self.io
    }

    // --- submission -----------------------------------------------------

    pub fn send(&mut self, cmd: &str, prefixes: &[&str], callback: FinishFn) -> u32 {
        self.send_full(0, cmd, prefixes, CommandFlags::empty(), None, Some(callback))
    }

    pub fn send_full(
        &mut self,
        gid: u32,
        cmd: &str,
        prefixes: &[&str],
        flags: CommandFlags,
        listing: Option<ListingFn>,
        callback: Option<FinishFn>,
    ) -> u32 {
        let id = self.shared.alloc_cmd_id();
        self.enqueue_command(gid, cmd, prefixes, flags, listing, callback, id);
        id
    }

    fn enqueue_command(
        &mut self,
        gid: u32,
        cmd: &str,
        prefixes: &[&str],
        flags: CommandFlags,
        listing: Option<ListingFn>,
        callback: Option<FinishFn>,
        id: u32,
    ) {
        let mut command = Command::new(gid, cmd, prefixes, flags, listing, callback, false);
        command.id = id;

        self.queue.push_back(command);

        if self.queue.len() == 1 && !self.suspended {
            self.io.set_wants_write(true);
        }
    }

    pub fn register(&mut self, prefix: &str, callback: NotifyFn, pdu: bool) -> u32 {
        let id = self.shared.alloc_notify_id();
        self.insert_notify(prefix, pdu, 0, callback, id);
        id
    }

    pub fn register_in_group(
        &mut self,
        gid: u32,
        prefix: &str,
        callback: NotifyFn,
        pdu: bool,
    ) -> u32 {
        let id = self.shared.alloc_notify_id();
        self.insert_notify(prefix, pdu, gid, callback, id);
        id
    }

    fn insert_notify(&mut self, prefix: &str, pdu: bool, gid: u32, callback: NotifyFn, id: u32) {
        if prefix.is_empty() {
            return;
        }

        let node = NotifyNode {
            id,
            gid,
            callback,
            removed: Cell::new(false),
        };

        if let Some(entry) = self
            .notify
            .iter_mut()
            .find(|e| e.prefix == prefix && e.pdu == pdu)
        {
            entry.nodes.push(node);
            return;
        }

        self.notify.push(NotifyEntry {
            prefix: prefix.to_string(),
            pdu,
            nodes: vec![node],
        });
    }

    pub fn unregister(&mut self, id: u32) -> bool {
        let mark_only = self.in_notify;
        let mut found = false;

        for entry in self.notify.iter_mut() {
            if let Some(pos) = entry.nodes.iter().position(|n| n.id == id) {
                if mark_only {
                    entry.nodes[pos].removed.set(true);
                } else {
                    entry.nodes.remove(pos);
                }
                found = true;
                break;
            }
        }

        if !mark_only {
            self.notify.retain(|e| !e.nodes.is_empty());
        }

        found
    }

    pub fn unregister_group(&mut self, gid: u32) {
        let mark_only = self.in_notify;

        for entry in self.notify.iter_mut() {
            if mark_only {
                for node in entry.nodes.iter().filter(|n| n.gid == gid) {
                    node.removed.set(true);
                }
            } else {
                entry.nodes.retain(|n| n.gid != gid);
            }
        }

        if !mark_only {
            self.notify.retain(|e| !e.nodes.is_empty());
        }
    }

    pub fn unregister_all(&mut self) {
        if self.in_notify {
            for entry in self.notify.iter() {
                for node in entry.nodes.iter() {
                    node.removed.set(true);
                }
            }
        } else {
            self.notify.clear();
        }
    }

    /// Removes a queued command. A command that has begun transmitting
    /// cannot be unqueued; its callback is nulled out instead and the
    /// response is consumed silently. Wake-up commands are untouchable.
    pub fn cancel(&mut self, id: u32) -> bool {
        if id == 0 {
            return false;
        }

        let Some(pos) = self.queue.iter().position(|c| c.id == id) else {
            return false;
        };

        if pos == 0 && self.cmd_bytes_written > 0 {
            self.queue[0].callback = None;
            self.queue[0].listing = None;
        } else {
            self.queue.remove(pos);
        }

        true
    }

    pub fn cancel_group(&mut self, gid: u32) {
        let mut pos = 0;
        while pos < self.queue.len() {
            let c = &self.queue[pos];

            if c.id == 0 || c.gid != gid {
                pos += 1;
                continue;
            }

            if pos == 0 && self.cmd_bytes_written > 0 {
                self.queue[0].callback = None;
                self.queue[0].listing = None;
                pos += 1;
            } else {
                self.queue.remove(pos);
            }
        }
    }

    pub fn cancel_all(&mut self) {
        let gids: Vec<u32> = self.queue.iter().map(|c| c.gid).collect();
        for gid in gids {
            self.cancel_group(gid);
        }
    }

    // --- deferred ops ---------------------------------------------------

    /// Applies operations queued through [`ChatHandle`]s.
    pub fn apply_pending(&mut self) {
        loop {
            let op = self.shared.ops.borrow_mut().pop_front();
            let Some(op) = op else { break };

            match op {
                Op::Send {
                    gid,
                    cmd,
                    prefixes,
                    flags,
                    listing,
                    callback,
                    id,
                } => {
                    let refs: Vec<&str> = prefixes.iter().map(String::as_str).collect();
                    self.enqueue_command(gid, &cmd, &refs, flags, listing, callback, id);
                }
                Op::Register {
                    prefix,
                    pdu,
                    gid,
                    callback,
                    id,
                } => self.insert_notify(&prefix, pdu, gid, callback, id),
                Op::Unregister(id) => {
                    self.unregister(id);
                }
                Op::UnregisterGroup(gid) => self.unregister_group(gid),
                Op::Cancel(id) => {
                    self.cancel(id);
                }
                Op::CancelGroup(gid) => self.cancel_group(gid),
            }
        }
    }

    // --- write path -----------------------------------------------------

    /// Writes at most one segment of the head command. Returns `true` when
    /// the endpoint should stay write-watched (a partial write happened).
    ///
    /// Does nothing unless the write watch is armed: after a complete
    /// segment the engine waits for the response (or prompt) before the
    /// next byte leaves the wire.
    pub fn process_writable(&mut self, now: Instant) -> bool {
        self.apply_pending();

        if !self.io.wants_write() {
            return false;
        }

        if self.suspended {
            self.io.set_wants_write(false);
            return false;
        }

        let Some(head) = self.queue.front() else {
            self.io.set_wants_write(false);
            return false;
        };

        let len = head.bytes.len();

        if self.cmd_bytes_written >= len {
            // Entire command is out; we are waiting on the response.
            self.io.set_wants_write(false);
            return false;
        }

        // An idle modem needs the wake-up string first.
        if self.cmd_bytes_written == 0 && !head.wakeup {
            if let Some(w) = &self.wakeup {
                let idle = match self.last_submit {
                    None => true,
                    Some(t) => now.duration_since(t) > w.inactivity,
                };

                if idle {
                    let cmd = Command::new(0, &w.cmd, &[], CommandFlags::empty(), None, None, true);
                    self.wakeup_deadline = Some(now + w.response_timeout);
                    self.queue.push_front(cmd);
                }
            }
        }

        let head = self.queue.front().expect("head checked above");
        let len = head.bytes.len();
        let remaining = &head.bytes[self.cmd_bytes_written..];

        let towrite = match remaining.iter().position(|&b| b == b'\r') {
            Some(idx) => idx + 1,
            None => remaining.len(),
        };

        let chunk = remaining[..towrite].to_vec();
        let written = self.io.send(&chunk);
        self.cmd_bytes_written += written;

        if written == 0 {
            self.io.set_wants_write(false);
            return false;
        }

        if written < towrite {
            // Partial segment: keep the write watch armed.
            return true;
        }

        let head = self.queue.front().expect("head still queued");
        if head.flags.contains(CommandFlags::EXPECT_SHORT_PROMPT) && self.cmd_bytes_written < len {
            self.lexer.set_hint(Hint::ShortPrompt);
        }

        if self.wakeup.is_some() {
            self.last_submit = Some(now);
        }

        // Segment complete: wait for the response or prompt.
        self.io.set_wants_write(false);
        false
    }

    // --- timers ---------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        self.wakeup_deadline
    }

    /// Fires the wake-up response timeout if it has expired: the head
    /// command fails with a synthetic failure and the wake-up string is
    /// requeued at the head.
    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(deadline) = self.wakeup_deadline else {
            return;
        };

        if now < deadline {
            return;
        }

        log::debug!("wakeup got no response");

        if self.queue.is_empty() {
            self.wakeup_deadline = None;
            return;
        }

        self.finish_command(false, None);

        let Some(w) = &self.wakeup else {
            self.wakeup_deadline = None;
            return;
        };

        let cmd = Command::new(0, &w.cmd, &[], CommandFlags::empty(), None, None, true);
        self.queue.push_front(cmd);
        self.cmd_bytes_written = 0;
        self.wakeup_deadline = Some(now + w.response_timeout);
        self.io.set_wants_write(true);
    }

    // --- read path ------------------------------------------------------

    /// Drives the endpoint and lexes whatever arrived. Returns `false`
    /// once the transport is dead and the disconnect handling has run.
    pub fn process_readable(&mut self) -> bool {
        match self.io.process_readable() {
            ReadOutcome::Disconnected => {
                self.on_disconnect();
                return false;
            }
            ReadOutcome::Idle => return true,
            ReadOutcome::Data => {}
        }

        self.feed_lexer();

        if self.io.is_disconnected() {
            self.on_disconnect();
            return false;
        }

        true
    }

    fn on_disconnect(&mut self) {
        // Fail everything in flight with a synthetic failure, then tell
        // the owner.
        while !self.queue.is_empty() {
            self.finish_command(false, None);
        }

        if let Some(cb) = self.disconnect.take() {
            cb();
        }
    }

    fn feed_lexer(&mut self) {
        while !self.suspended {
            let span = {
                let rbuf = self.io.rbuf();
                if self.read_so_far >= rbuf.len() {
                    break;
                }
                rbuf.readable_slice_from(self.read_so_far).to_vec()
            };

            let (consumed, result) = self.lexer.feed(&span);
            self.read_so_far += consumed;

            match result {
                LexResult::Unsure => {
                    if consumed == 0 {
                        break;
                    }
                }
                LexResult::Line | LexResult::Multiline => {
                    let line = self.extract_line();
                    if let Some(line) = line {
                        self.have_line(line);
                    }
                }
                LexResult::Pdu => {
                    let pdu = self.extract_line();
                    self.have_pdu(pdu);
                }
                LexResult::Prompt => {
                    self.io.rbuf().drain(self.read_so_far);
                    self.read_so_far = 0;
                    self.io.set_wants_write(true);
                }
            }
        }
    }

    /// Pulls the current lexer unit out of the ring buffer: leading CR/LF
    /// stripped, terminator dropped.
    fn extract_line(&mut self) -> Option<String> {
        let unit_len = self.read_so_far;
        self.read_so_far = 0;

        let mut unit = vec![0u8; unit_len];
        let n = self.io.rbuf().read(&mut unit);
        unit.truncate(n);

        let start = unit
            .iter()
            .position(|&b| b != b'\r' && b != b'\n')
            .unwrap_or(unit.len());

        let mut end = start;
        let mut in_string = false;
        while end < unit.len() {
            let b = unit[end];
            if b == b'"' {
                in_string = !in_string;
            } else if !in_string && (b == b'\r' || b == b'\n') {
                break;
            }
            end += 1;
        }

        if end <= start {
            return None;
        }

        Some(String::from_utf8_lossy(&unit[start..end]).into_owned())
    }

    fn have_line(&mut self, line: String) {
        // Echo should be off, but be paranoid about it.
        if line.starts_with("AT") {
            return;
        }

        let head_engaged = self
            .queue
            .front()
            .map(|_| self.cmd_bytes_written > 0)
            .unwrap_or(false);

        if head_engaged {
            let last = self.queue.front().unwrap().bytes[self.cmd_bytes_written - 1];

            // Only a submitted terminator can elicit a final response.
            if (last == b'\r' || last == CTRL_Z) && self.handle_command_response(line.clone()) {
                return;
            }
        }

        self.match_notify(line);
    }

    /// Returns `true` when the line was consumed by the head command.
    fn handle_command_response(&mut self, line: String) -> bool {
        let verdict = TERMINATOR_TABLE
            .iter()
            .enumerate()
            .filter(|(i, _)| self.terminator_blacklist & (1 << i) == 0)
            .find(|(_, info)| terminator_matches(info.token, info.len, &line))
            .map(|(_, info)| info.success)
            .or_else(|| {
                self.custom_terminators
                    .iter()
                    .find(|t| terminator_matches(&t.token, t.len, &line))
                    .map(|t| t.success)
            });

        if let Some(ok) = verdict {
            self.finish_command(ok, Some(line));
            return true;
        }

        let head = self.queue.front_mut().expect("head engaged");

        if !head.matches_prefix(&line) {
            return false;
        }

        let expect_pdu = head.flags.contains(CommandFlags::EXPECT_PDU) && head.listing.is_some();

        self.lexer.set_hint(if expect_pdu {
            Hint::Pdu
        } else {
            Hint::Multiline
        });

        if expect_pdu {
            self.pdu_header = Some(line);
            return true;
        }

        if head.listing.is_some() {
            let response = Response::from_line(line);
            let listing = head.listing.as_mut().unwrap();
            listing(&response);
            self.apply_pending();
            return true;
        }

        self.response_lines.push(line);
        true
    }

    fn finish_command(&mut self, ok: bool, final_line: Option<String>) {
        let Some(cmd) = self.queue.pop_front() else {
            return;
        };

        self.cmd_bytes_written = 0;

        if cmd.wakeup {
            if ok {
                log::debug!("modem is awake");
                self.wakeup_deadline = None;
            }
            self.response_lines.clear();
            if !self.queue.is_empty() && !self.suspended {
                self.io.set_wants_write(true);
            }
            return;
        }

        if !self.queue.is_empty() && !self.suspended {
            self.io.set_wants_write(true);
        }

        let lines = std::mem::take(&mut self.response_lines);

        if let Some(callback) = cmd.callback {
            let response = Response::new(lines, final_line);
            callback(ok, response);
            self.apply_pending();
        }
    }

    fn match_notify(&mut self, line: String) {
        // First matching prefix wins.
        let Some(idx) = self
            .notify
            .iter()
            .position(|e| line.starts_with(e.prefix.as_str()))
        else {
            return;
        };

        if self.notify[idx].pdu {
            self.pdu_header = Some(line);
            self.lexer.set_hint(Hint::Pdu);
            return;
        }

        let response = Response::from_line(line);

        self.in_notify = true;
        for node in self.notify[idx].nodes.iter() {
            if node.removed.get() {
                continue;
            }
            (node.callback.borrow_mut())(&response);
        }
        self.in_notify = false;

        self.sweep_removed();
        self.apply_pending();
    }

    fn sweep_removed(&mut self) {
        for entry in self.notify.iter_mut() {
            entry.nodes.retain(|n| !n.removed.get());
        }
        self.notify.retain(|e| !e.nodes.is_empty());
    }

    fn have_pdu(&mut self, pdu: Option<String>) {
        let header = self.pdu_header.take();

        let (Some(header), Some(pdu)) = (header, pdu) else {
            return;
        };

        let head_listing = self
            .queue
            .front()
            .map(|c| {
                c.flags.contains(CommandFlags::EXPECT_PDU)
                    && self.cmd_bytes_written > 0
                    && c.bytes[self.cmd_bytes_written - 1] == b'\r'
            })
            .unwrap_or(false);

        let response = Response::new(vec![header.clone()], Some(pdu));

        if head_listing {
            let head = self.queue.front_mut().unwrap();
            if let Some(listing) = head.listing.as_mut() {
                listing(&response);
            }
            self.lexer.set_hint(Hint::Multiline);
            self.apply_pending();
            return;
        }

        // Unsolicited PDU: every PDU-expecting registration whose prefix
        // matches the held header line.
        self.in_notify = true;
        for entry in self.notify.iter() {
            if !entry.pdu || !header.starts_with(entry.prefix.as_str()) {
                continue;
            }
            for node in entry.nodes.iter() {
                if node.removed.get() {
                    continue;
                }
                (node.callback.borrow_mut())(&response);
            }
        }
        self.in_notify = false;

        self.sweep_removed();
        self.apply_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemChannel;

    fn pump<C: Channel>(chat: &mut Chat<C>, now: Instant) {
        // One writer pass plus a read pass, the way the event loop drives
        // the engine.
        while chat.process_writable(now) {}
        chat.process_readable();
    }

    fn ok_flag() -> (Rc<Cell<Option<bool>>>, FinishFn) {
        let flag = Rc::new(Cell::new(None));
        let f = flag.clone();
        let cb: FinishFn = Box::new(move |ok, _| f.set(Some(ok)));
        (flag, cb)
    }

    #[test]
    fn ok_terminator_finishes_command() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag, cb) = ok_flag();
        chat.send("AT+CFUN=1", &[], cb);
        pump(&mut chat, now);

        // The command reached the wire with its terminator.
        let mut buf = [0u8; 32];
        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+CFUN=1\r");

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(flag.get(), Some(true));
    }

    #[test]
    fn final_carries_result_line() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let final_line = Rc::new(RefCell::new(String::new()));
        let f = final_line.clone();
        chat.send(
            "AT+CPIN?",
            &["+CPIN:"],
            Box::new(move |ok, resp| {
                assert!(ok);
                *f.borrow_mut() = resp.final_response().to_string();
            }),
        );
        pump(&mut chat, now);

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(&*final_line.borrow(), "OK");
    }

    #[test]
    fn cme_error_fails_command() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag, cb) = ok_flag();
        chat.send("AT+CPIN?", &["+CPIN:"], cb);
        pump(&mut chat, now);

        modem.send(b"\r\n+CME ERROR: 10\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(flag.get(), Some(false));
    }

    #[test]
    fn prefixed_lines_are_collected() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let lines = Rc::new(RefCell::new(Vec::new()));
        let l = lines.clone();
        chat.send(
            "AT+COPS=?",
            &["+COPS:"],
            Box::new(move |_, resp| {
                *l.borrow_mut() = resp.lines().to_vec();
            }),
        );
        pump(&mut chat, now);

        modem.send(b"\r\n+COPS: (2,\"A\")\r\n\r\nOK\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(lines.borrow().as_slice(), &["+COPS: (2,\"A\")".to_string()]);
    }

    #[test]
    fn unsolicited_notification_dispatch() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        chat.register(
            "+CREG:",
            Rc::new(RefCell::new(move |resp: &Response| {
                s.borrow_mut().push(resp.lines()[0].clone());
            })),
            false,
        );

        modem.send(b"\r\n+CREG: 1,\"1A2B\"\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(seen.borrow().as_slice(), &["+CREG: 1,\"1A2B\"".to_string()]);
    }

    #[test]
    fn pdu_notification_two_line_form() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        chat.register(
            "+CMT:",
            Rc::new(RefCell::new(move |resp: &Response| {
                s.borrow_mut()
                    .push((resp.lines()[0].clone(), resp.pdu().unwrap().to_string()));
            })),
            true,
        );

        modem.send(b"\r\n+CMT: ,24\r\n07914400000000F0040B\r\n").unwrap();
        pump(&mut chat, now);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "+CMT: ,24");
        assert_eq!(seen[0].1, "07914400000000F0040B");
    }

    #[test]
    fn prompt_dialogue_writes_second_segment() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag, cb) = ok_flag();
        chat.send_full(
            0,
            "AT+CMGS=24\r07914400000000F0040B",
            &[],
            CommandFlags::empty(),
            None,
            Some(cb),
        );
        pump(&mut chat, now);

        let mut buf = [0u8; 64];
        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+CMGS=24\r");

        // Modem answers with the prompt; the PDU tail goes out, Ctrl-Z
        // terminated.
        modem.send(b"\r\n> ").unwrap();
        pump(&mut chat, now);
        pump(&mut chat, now);

        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"07914400000000F0040B\x1a");

        modem.send(b"\r\n+CMGS: 1\r\n\r\nOK\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(flag.get(), Some(true));
    }

    #[test]
    fn cancel_before_transmit_removes_command() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag1, cb1) = ok_flag();
        let (flag2, cb2) = ok_flag();
        chat.send("AT+FIRST", &[], cb1);
        let second = chat.send("AT+SECOND", &[], cb2);

        // Second command never started transmitting: clean removal.
        assert!(chat.cancel(second));

        pump(&mut chat, now);

        let mut buf = [0u8; 32];
        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+FIRST\r");

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(flag1.get(), Some(true));
        assert_eq!(flag2.get(), None);

        // Nothing further goes out.
        assert!(modem.recv(&mut buf).is_err());
    }

    #[test]
    fn cancel_in_flight_consumes_response_silently() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag, cb) = ok_flag();
        let id = chat.send("AT+SLOW", &[], cb);
        pump(&mut chat, now);

        assert!(chat.cancel(id));

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);

        assert_eq!(flag.get(), None);
    }

    #[test]
    fn custom_terminator_and_blacklist() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        chat.blacklist_terminator(Terminator::Connect);
        chat.add_terminator("DIALING", None, true);

        let (flag, cb) = ok_flag();
        chat.send("ATD123", &[], cb);
        pump(&mut chat, now);

        // CONNECT is blacklisted so it is not a final here; it falls
        // through to (absent) notifications and is dropped.
        modem.send(b"\r\nCONNECT\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(flag.get(), None);

        modem.send(b"\r\nDIALING\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(flag.get(), Some(true));
    }

    #[test]
    fn wakeup_inserted_before_first_command() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        chat.set_wakeup_command("\r", Duration::from_millis(500), Duration::from_secs(1));

        let (flag, cb) = ok_flag();
        chat.send("AT+CFUN?", &[], cb);

        pump(&mut chat, now);
        let mut buf = [0u8; 32];
        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\r");

        // Wake-up elicits a response; engine moves on to the real command.
        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);
        pump(&mut chat, now);

        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+CFUN?\r");

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(flag.get(), Some(true));
    }

    #[test]
    fn wakeup_timeout_requeues_wakeup() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let t0 = Instant::now();

        chat.set_wakeup_command("\r", Duration::from_millis(500), Duration::from_secs(1));

        let (flag, cb) = ok_flag();
        chat.send("AT+CFUN?", &[], cb);
        pump(&mut chat, t0);

        let mut buf = [0u8; 32];
        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\r");

        // No response within the timeout; the wake-up is retried.
        chat.handle_timeout(t0 + Duration::from_secs(1));
        pump(&mut chat, t0 + Duration::from_secs(1));

        let n = modem.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\r");
        assert!(chat.next_deadline().is_some());
        assert_eq!(flag.get(), None);
    }

    #[test]
    fn handle_send_from_callback_is_deferred() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let handle = chat.handle();
        let (flag2, cb2) = ok_flag();
        let cb2 = RefCell::new(Some(cb2));

        chat.send(
            "AT+FIRST",
            &[],
            Box::new(move |ok, _| {
                assert!(ok);
                handle.send("AT+CHAIN", &[], cb2.borrow_mut().take().unwrap());
            }),
        );
        pump(&mut chat, now);

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);
        pump(&mut chat, now);

        let mut buf = [0u8; 32];
        let n = modem.recv(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"AT+CHAIN"));

        modem.send(b"\r\nOK\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(flag2.get(), Some(true));
    }

    #[test]
    fn unregister_inside_notify_is_marked_not_freed() {
        let (a, mut modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let handle = chat.handle();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();

        let id = Rc::new(Cell::new(0u32));
        let id_for_cb = id.clone();

        let reg = chat.register(
            "+CRING:",
            Rc::new(RefCell::new(move |_: &Response| {
                c.set(c.get() + 1);
                handle.unregister(id_for_cb.get());
            })),
            false,
        );
        id.set(reg);

        modem.send(b"\r\n+CRING: VOICE\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(count.get(), 1);

        // Second delivery finds the registration gone.
        modem.send(b"\r\n+CRING: VOICE\r\n").unwrap();
        pump(&mut chat, now);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn disconnect_fails_pending_commands() {
        let (a, modem) = MemChannel::pair();
        let mut chat = Chat::new(a);
        let now = Instant::now();

        let (flag, cb) = ok_flag();
        chat.send("AT+ANY", &[], cb);
        pump(&mut chat, now);

        drop(modem);
        assert!(!chat.process_readable());
        assert_eq!(flag.get(), Some(false));
    }

    #[test]
    fn group_cancel_skips_other_groups() {
        let (a, _modem) = MemChannel::pair();
        let mut chat = Chat::new(a);

        let g1 = chat.new_group();
        let g2 = chat.new_group();

        let (f1, cb1) = ok_flag();
        let (f2, cb2) = ok_flag();
        chat.send_full(g1, "AT+ONE", &[], CommandFlags::empty(), None, Some(cb1));
        chat.send_full(g2, "AT+TWO", &[], CommandFlags::empty(), None, Some(cb2));

        chat.cancel_group(g1);

        assert_eq!(chat.queue.len(), 1);
        assert_eq!(chat.queue[0].gid, g2);
        let _ = (f1, f2);
    }
}
