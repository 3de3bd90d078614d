//! V.250 AT command server.
//!
//! Parses a command stream byte by byte (echoing when `E1`), splits command
//! lines into basic and extended commands, and dispatches them to handlers
//! registered by prefix. The stock V.250 commands (S-registers, `E Q V X
//! &C &D L M T P Z &F`) are installed at construction.
//!
//! A handler must emit exactly one final result per command. `OK` finals
//! are withheld until the whole command line has run; any other final
//! aborts the remainder of the line. A handler that cannot answer
//! synchronously simply returns without sending a final: the parser pauses
//! and resumes when the final eventually arrives.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::cell::RefCell;

use crate::result::Response;
use crate::ring::RingBuffer;
use crate::transport::{Channel, Endpoint, ReadOutcome};

const BUF_SIZE: usize = 4096;
/// CR + LF + longest information text + CR + LF.
const MAX_TEXT_SIZE: usize = 2048;

/// V.250 final result codes with their numeric (`V0`) values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerResult {
    Ok = 0,
    Connect = 1,
    Ring = 2,
    NoCarrier = 3,
    Error = 4,
    NoDialtone = 6,
    Busy = 7,
    NoAnswer = 8,
    ExtError = 9,
}

impl ServerResult {
    fn as_str(self) -> &'static str {
        match self {
            ServerResult::Ok => "OK",
            ServerResult::Connect => "CONNECT",
            ServerResult::Ring => "RING",
            ServerResult::NoCarrier => "NO CARRIER",
            ServerResult::Error => "ERROR",
            ServerResult::NoDialtone => "NO DIALTONE",
            ServerResult::Busy => "BUSY",
            ServerResult::NoAnswer => "NO ANSWER",
            ServerResult::ExtError => "ERROR",
        }
    }
}

/// How the command was written, per V.250 5.3/5.4.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestType {
    CommandOnly,
    Query,
    Support,
    Set,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ParserState {
    Idle,
    A,
    Command,
    Garbage,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ParserResult {
    Command,
    EmptyCommand,
    RepeatLast,
    Garbage,
    Unsure,
}

/// Basic V.250 parameters, set by their eponymous commands.
pub struct V250 {
    pub s0: u8,
    pub s3: u8,
    pub s4: u8,
    pub s5: u8,
    pub s6: i32,
    pub s7: i32,
    pub s8: i32,
    pub s10: i32,
    pub echo: i32,
    pub quiet: i32,
    pub is_v1: i32,
    pub res_format: i32,
    pub c109: i32,
    pub c108: i32,
    pub l: u8,
    pub m: u8,
    pub dial_mode: u8,
}

impl Default for V250 {
    fn default() -> Self {
        Self {
            s0: 0,
            s3: b'\r',
            s4: b'\n',
            s5: 8,
            s6: 2,
            s7: 50,
            s8: 2,
            s10: 2,
            echo: 1,
            quiet: 0,
            is_v1: 1,
            res_format: 0,
            c109: 1,
            c108: 0,
            l: 0,
            m: 1,
            dial_mode: b'T',
        }
    }
}

/// Command handler: receives the server itself, so it can emit results and
/// re-enter the registration surface.
pub type Handler<C> = Rc<RefCell<dyn FnMut(&mut Server<C>, RequestType, &Response)>>;

type FinishFn<C> = Rc<RefCell<dyn FnMut(&mut Server<C>)>>;

/// The AT server engine.
pub struct Server<C: Channel> {
    io: Endpoint<C>,
    pub v250: V250,
    handlers: HashMap<String, Handler<C>>,

    write_queue: VecDeque<RingBuffer>,
    parser_state: ParserState,
    read_so_far: usize,

    last_line: Option<String>,
    cur_pos: usize,
    last_result: ServerResult,
    final_sent: bool,
    final_async: bool,

    finishf: Option<FinishFn<C>>,
    disconnect: Option<Box<dyn FnOnce()>>,
}

impl<C: Channel> Server<C> {
    pub fn new(channel: C) -> Self {
        Self::from_endpoint(Endpoint::new(channel))
    }

    pub fn from_endpoint(io: Endpoint<C>) -> Self {
        let mut write_queue = VecDeque::new();
        write_queue.push_back(RingBuffer::new(BUF_SIZE));

        let mut server = Self {
            io,
            v250: V250::default(),
            handlers: HashMap::new(),
            write_queue,
            parser_state: ParserState::Idle,
            read_so_far: 0,
            last_line: None,
            cur_pos: 0,
            last_result: ServerResult::Ok,
            final_sent: false,
            final_async: false,
            finishf: None,
            disconnect: None,
        };

        server.register_basic_commands();
        server
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint<C> {
        &mut self.io
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.v250.echo = echo as i32;
    }

    pub fn set_disconnect_handler(&mut self, f: Box<dyn FnOnce()>) {
        self.disconnect = Some(f);
    }

    /// Callback invoked after every final result, used to flush deferred
    /// unsolicited notifications.
    pub fn set_finish_callback(&mut self, f: FinishFn<C>) {
        self.finishf = Some(f);
    }

    /// `true` while an asynchronous handler still owes a final result.
    pub fn command_pending(&self) -> bool {
        self.final_async
    }

    /// Forgets a pending asynchronous command without answering it. Used
    /// when the channel leaves command mode mid-command (the DUN dial
    /// handing over to PPP) so the next command line parses cleanly.
    pub fn abort_pending(&mut self) {
        self.final_async = false;
    }

    /// Emits a final result regardless of command bookkeeping; the DUN
    /// emulator reports `NO CARRIER` through this when a data call ends.
    pub fn send_final_now(&mut self, result: ServerResult) {
        self.final_sent = true;
        self.last_result = result;
        self.emit_final_numeric(result);
    }

    pub fn register(&mut self, prefix: &str, handler: Handler<C>) -> bool {
        if prefix.is_empty() {
            return false;
        }
        self.handlers.insert(prefix.to_string(), handler);
        true
    }

    pub fn unregister(&mut self, prefix: &str) -> bool {
        self.handlers.remove(prefix).is_some()
    }

    // --- output ---------------------------------------------------------

    fn send_common(&mut self, buf: &[u8]) {
        let mut written = 0;

        while written < buf.len() {
            let tail = self.write_queue.back_mut().expect("queue never empty");
            written += tail.write(&buf[written..]);

            if written < buf.len() {
                self.write_queue.push_back(RingBuffer::new(BUF_SIZE));
            }
        }

        self.io.set_wants_write(true);
    }

    fn send_result_common(&mut self, result: &str) {
        if self.v250.quiet != 0 {
            return;
        }

        if result.len() > MAX_TEXT_SIZE {
            return;
        }

        let t = self.v250.s3 as char;
        let r = self.v250.s4 as char;

        let line = if self.v250.is_v1 != 0 {
            format!("{t}{r}{result}{t}{r}")
        } else {
            format!("{result}{t}")
        };

        self.send_common(line.as_bytes());
    }

    fn emit_final_numeric(&mut self, result: ServerResult) {
        let text = if self.v250.is_v1 != 0 {
            result.as_str().to_string()
        } else {
            format!("{}", result as i32)
        };

        self.send_result_common(&text);
        self.final_async = false;
        self.run_finish_callback();
    }

    fn run_finish_callback(&mut self) {
        if let Some(f) = self.finishf.clone() {
            (f.borrow_mut())(self);
        }
    }

    /// Finishes the current command. An `OK` is withheld until the whole
    /// command line has been processed; other results go out immediately
    /// and abort the rest of the line.
    pub fn send_final(&mut self, result: ServerResult) {
        if self.final_sent {
            return;
        }

        self.final_sent = true;
        self.last_result = result;

        if result == ServerResult::Ok {
            if self.final_async {
                self.parse_line();
            }
            return;
        }

        self.emit_final_numeric(result);
    }

    /// Finishes with an extended error (`+CME ERROR: ...`) line.
    pub fn send_ext_final(&mut self, result: &str) {
        self.final_sent = true;
        self.last_result = ServerResult::ExtError;
        self.send_result_common(result);
        self.final_async = false;
        self.run_finish_callback();
    }

    pub fn send_intermediate(&mut self, result: &str) {
        self.send_result_common(result);
    }

    pub fn send_unsolicited(&mut self, result: &str) {
        self.send_result_common(result);
    }

    /// Sends an information-text line; `last` closes it with CR LF.
    pub fn send_info(&mut self, line: &str, last: bool) {
        if line.len() > MAX_TEXT_SIZE {
            return;
        }

        let t = self.v250.s3 as char;
        let r = self.v250.s4 as char;

        let text = if last {
            format!("{t}{r}{line}{t}{r}")
        } else {
            format!("{t}{r}{line}")
        };

        self.send_common(text.as_bytes());
    }

    /// Flushes one contiguous span from the head write buffer. Returns
    /// `true` while output remains queued.
    pub fn process_writable(&mut self) -> bool {
        let head = self.write_queue.front_mut().expect("queue never empty");

        let span = head.readable_slice().to_vec();
        if span.is_empty() {
            self.io.set_wants_write(false);
            return false;
        }

        let written = self.io.send(&span);
        let head = self.write_queue.front_mut().expect("queue never empty");
        head.drain(written);

        if written == 0 {
            self.io.set_wants_write(false);
            return false;
        }

        if head.is_empty() && self.write_queue.len() > 1 {
            self.write_queue.pop_front();
        }

        let more = self.write_queue.front().map(|b| !b.is_empty()).unwrap_or(false);
        if !more {
            self.io.set_wants_write(false);
        }
        more
    }

    // --- input ----------------------------------------------------------

    /// Drives the endpoint and the V.250 parser. Returns `false` once the
    /// transport has disconnected.
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

        // Command abortion is unsupported: ignore input while a handler
        // still owes its final.
        if self.final_async {
            let len = self.io.rbuf().len();
            self.io.rbuf().drain(len);
            return true;
        }

        self.feed_parser();

        if self.io.is_disconnected() {
            if let Some(cb) = self.disconnect.take() {
                cb();
            }
            return false;
        }

        true
    }

    fn feed_parser(&mut self) {
        loop {
            let span = {
                let rbuf = self.io.rbuf();
                if self.read_so_far >= rbuf.len() {
                    break;
                }
                rbuf.readable_slice_from(self.read_so_far).to_vec()
            };

            let (consumed, result) = self.parser_feed(&span);

            if self.v250.echo != 0 {
                self.send_common(&span[..consumed]);
            }

            self.read_so_far += consumed;

            match result {
                ParserResult::Unsure => {
                    if consumed == 0 {
                        break;
                    }
                    continue;
                }

                ParserResult::EmptyCommand => {
                    // V.250 5.2.4: empty command lines are answered OK.
                    let n = self.read_so_far;
                    self.io.rbuf().drain(n);
                    self.read_so_far = 0;
                    self.emit_final_numeric(ServerResult::Ok);
                }

                ParserResult::Command => {
                    self.last_line = self.extract_line();
                    self.cur_pos = 0;
                    self.read_so_far = 0;

                    if self.last_line.is_some() {
                        self.parse_line();
                    } else {
                        self.finish_with_error();
                    }
                }

                ParserResult::RepeatLast => {
                    let n = self.read_so_far;
                    self.io.rbuf().drain(n);
                    self.read_so_far = 0;
                    self.cur_pos = 0;

                    if self.last_line.is_some() {
                        self.parse_line();
                    } else {
                        self.emit_final_numeric(ServerResult::Ok);
                    }
                }

                ParserResult::Garbage => {
                    let n = self.read_so_far;
                    self.io.rbuf().drain(n);
                    self.read_so_far = 0;
                }
            }

            // Two command lines in one read imply the earlier one was
            // aborted; drop whatever follows a processed command.
            if result != ParserResult::Garbage && result != ParserResult::Unsure {
                let rest = self.io.rbuf().len();
                self.io.rbuf().drain(rest);
                break;
            }
        }
    }

    fn parser_feed(&mut self, bytes: &[u8]) -> (usize, ParserResult) {
        let s3 = self.v250.s3;
        let mut i = 0;

        while i < bytes.len() {
            let byte = bytes[i];

            match self.parser_state {
                ParserState::Idle => {
                    if byte == s3 {
                        i += 1;
                        return (i, ParserResult::EmptyCommand);
                    } else if byte == b'\n' {
                        i += 1;
                        return (i, ParserResult::Garbage);
                    } else if byte == b'A' || byte == b'a' {
                        self.parser_state = ParserState::A;
                    } else if byte != b' ' && byte != b'\t' {
                        self.parser_state = ParserState::Garbage;
                    }
                }

                ParserState::A => {
                    if byte == s3 {
                        self.parser_state = ParserState::Idle;
                        i += 1;
                        return (i, ParserResult::Garbage);
                    } else if byte == b'/' {
                        self.parser_state = ParserState::Idle;
                        i += 1;
                        return (i, ParserResult::RepeatLast);
                    } else if byte == b'T' || byte == b't' {
                        self.parser_state = ParserState::Command;
                    } else {
                        self.parser_state = ParserState::Garbage;
                    }
                }

                ParserState::Command => {
                    if byte == s3 {
                        self.parser_state = ParserState::Idle;
                        i += 1;
                        return (i, ParserResult::Command);
                    }
                }

                ParserState::Garbage => {
                    // A CR ends the garbage run; so does the HDLC flag,
                    // which hands the line over to PPP gracefully.
                    if byte == s3 || byte == b'~' {
                        self.parser_state = ParserState::Idle;
                        i += 1;
                        return (i, ParserResult::Garbage);
                    }
                }
            }

            i += 1;
        }

        (i, ParserResult::Unsure)
    }

    /// Extracts the command body out of the ring buffer: leading blanks,
    /// the `AT` prefix and the trailing S3 are stripped; S5 acts as
    /// backspace; blanks outside quoted strings are dropped.
    fn extract_line(&mut self) -> Option<String> {
        let unit_len = self.read_so_far;

        let mut unit = vec![0u8; unit_len];
        let n = self.io.rbuf().read(&mut unit);
        unit.truncate(n);

        let s3 = self.v250.s3;
        let s5 = self.v250.s5;

        let start = unit
            .iter()
            .position(|&b| b != b' ' && b != b'\t')
            .unwrap_or(unit.len());

        // The parser guaranteed the body starts with A T.
        if unit.len() < start + 2 {
            return None;
        }

        let mut line: Vec<u8> = Vec::with_capacity(unit.len());
        let mut in_string = false;

        for &b in &unit[start + 2..] {
            if b == b'"' {
                in_string = !in_string;
                line.push(b);
            } else if b == s5 {
                line.pop();
            } else if (b == b' ' || b == b'\t') && !in_string {
                // Stripped.
            } else if b != s3 {
                line.push(b);
            }
        }

        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn finish_with_error(&mut self) {
        self.final_sent = true;
        self.last_result = ServerResult::Error;
        self.emit_final_numeric(ServerResult::Error);
    }

    fn parse_line(&mut self) {
        let line = match &self.last_line {
            Some(l) => l.clone(),
            None => return,
        };

        let len = line.len();
        let mut pos = self.cur_pos;

        while pos < len {
            self.final_sent = false;
            self.final_async = false;

            let rest = &line[pos..];
            let first = rest.as_bytes()[0];

            let consumed = if is_extended_prefix(first) {
                self.parse_extended_command(rest)
            } else {
                self.parse_basic_command(rest)
            };

            if consumed == 0 {
                self.finish_with_error();
                return;
            }

            pos += consumed;
            self.cur_pos = pos;

            // The handler has not answered yet: pause here and let the
            // eventual final resume the line.
            if !self.final_sent {
                self.final_async = true;
                return;
            }

            if self.last_result != ServerResult::Ok {
                return;
            }
        }

        self.emit_final_numeric(ServerResult::Ok);
    }

    fn notify_command(&mut self, command: &str, prefix: &str, req: RequestType) {
        let Some(handler) = self.handlers.get(prefix).cloned() else {
            self.send_final(ServerResult::Error);
            return;
        };

        let response = Response::from_line(command.to_string());
        (handler.borrow_mut())(self, req, &response);
    }

    /// Parses one extended-format command (`+CMD?`, `+CMD=...`, ...)
    /// starting at `buf`. Returns the number of bytes consumed, zero on a
    /// malformed command.
    fn parse_extended_command(&mut self, buf: &str) -> usize {
        const VALID: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!%-./:_";

        let bytes = buf.as_bytes();
        let prefix_len = bytes
            .iter()
            .position(|&b| b == b';' || b == b'?' || b == b'=')
            .unwrap_or(bytes.len());

        if !(2..=17).contains(&prefix_len) {
            return 0;
        }

        let prefix: String = buf[..prefix_len].to_uppercase();

        if !prefix[1..].chars().all(|c| VALID.contains(c)) {
            return 0;
        }

        // V.250 5.4.1: the first character after the prefix marker is
        // alphabetic.
        let second = prefix.as_bytes()[1];
        if !second.is_ascii_uppercase() {
            return 0;
        }

        let mut req = RequestType::CommandOnly;
        let mut cmd_start = prefix_len;
        let mut seen_equals = false;
        let mut in_string = false;
        let mut i = prefix_len;

        while i < bytes.len() && !(bytes[i] == b';' && !in_string) {
            let b = bytes[i];

            if b == b'"' {
                in_string = !in_string;
            } else if !in_string {
                if b == b'?' {
                    if seen_equals && bytes[i - 1] != b'=' {
                        return 0;
                    }

                    match bytes.get(i + 1) {
                        None => {}
                        Some(&b';') => {}
                        Some(_) => return 0,
                    }

                    req = if seen_equals {
                        RequestType::Support
                    } else {
                        RequestType::Query
                    };
                    cmd_start += 1;
                } else if b == b'=' {
                    if seen_equals {
                        return 0;
                    }

                    seen_equals = true;
                    req = RequestType::Set;
                    cmd_start += 1;
                }
            }

            i += 1;
        }

        let command = &buf[cmd_start..i];
        self.notify_command(command, &prefix, req);

        // The terminating ';' (or end of line) is consumed too.
        i + 1
    }

    /// Parses one basic-format command (`E1`, `S0=5`, `D123;`, `&F`).
    fn parse_basic_command(&mut self, buf: &str) -> usize {
        let bytes = buf.as_bytes();

        let prefix_size = basic_prefix_size(bytes);
        if prefix_size == 0 {
            return 0;
        }

        let mut i = prefix_size;
        let mut cmd_start = prefix_size;
        let first = bytes[0].to_ascii_uppercase();

        let req;

        if first == b'D' {
            req = RequestType::Set;

            // Everything up to ';' or end of line is part of the call.
            while i < bytes.len() && bytes[i] != b';' {
                i += 1;
            }
            if i < bytes.len() {
                i += 1;
            }
        } else {
            let mut seen_equals = false;
            let mut r = RequestType::CommandOnly;

            if bytes.get(i) == Some(&b'=') {
                seen_equals = true;
                i += 1;
                cmd_start += 1;
            }

            if bytes.get(i) == Some(&b'?') {
                i += 1;
                cmd_start += 1;
                r = if seen_equals {
                    RequestType::Support
                } else {
                    RequestType::Query
                };
            } else {
                let before = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i > before || seen_equals {
                    r = RequestType::Set;
                }
            }

            req = r;
        }

        if prefix_size <= 3 {
            let prefix: String = buf[..prefix_size].to_uppercase();
            let command = &buf[cmd_start..i];
            self.notify_command(command, &prefix, req);
        } else {
            // S-parameters with three or more digits are out of range.
            self.send_final(ServerResult::Error);
        }

        // ATA, ATZ and ATD swallow the remainder of the line.
        if first == b'A' || first == b'Z' || first == b'D' {
            return buf.len();
        }

        if bytes.get(i) == Some(&b';') {
            i += 1;
        }

        i
    }

    // --- stock V.250 command set ----------------------------------------

    fn register_basic_commands(&mut self) {
        self.register_s_reg("S0", |v| &mut v.s0, 0, 7);
        self.register_s_reg("S3", |v| &mut v.s3, 0, 127);
        self.register_s_reg("S4", |v| &mut v.s4, 0, 127);
        self.register_s_reg("S5", |v| &mut v.s5, 0, 127);
        self.register_s_reg("L", |v| &mut v.l, 0, 3);
        self.register_s_reg("M", |v| &mut v.m, 0, 2);

        self.register_value("E", |v| &mut v.echo, 0, 1, 1);
        self.register_value("Q", |v| &mut v.quiet, 0, 1, 0);
        self.register_value("V", |v| &mut v.is_v1, 0, 1, 1);
        self.register_value("X", |v| &mut v.res_format, 0, 4, 4);
        self.register_value("S6", |v| &mut v.s6, 0, 1, 1);
        self.register_value("S7", |v| &mut v.s7, 1, 255, 50);
        self.register_value("S8", |v| &mut v.s8, 1, 255, 2);
        self.register_value("S10", |v| &mut v.s10, 1, 254, 2);
        self.register_value("&C", |v| &mut v.c109, 0, 1, 1);
        self.register_value("&D", |v| &mut v.c108, 0, 2, 2);

        self.register_dial_mode("T", b'T');
        self.register_dial_mode("P", b'P');

        self.register_reset("Z", false);
        self.register_reset("&F", true);
    }

    fn register_s_reg(
        &mut self,
        prefix: &'static str,
        sel: fn(&mut V250) -> &mut u8,
        min: i32,
        max: i32,
    ) {
        let handler = move |server: &mut Server<C>, req: RequestType, result: &Response| {
            match req {
                RequestType::Set => match result_value(result, min, max) {
                    Some(v) => {
                        *sel(&mut server.v250) = v as u8;
                        server.send_final(ServerResult::Ok);
                    }
                    None => server.send_final(ServerResult::Error),
                },
                RequestType::Query => {
                    let v = *sel(&mut server.v250);
                    server.send_info(&format!("{v:03}"), true);
                    server.send_final(ServerResult::Ok);
                }
                RequestType::Support => {
                    server.send_info(&format!("{prefix}: ({min}-{max})"), true);
                    server.send_final(ServerResult::Ok);
                }
                _ => server.send_final(ServerResult::Error),
            }
        };

        self.register(prefix, Rc::new(RefCell::new(handler)));
    }

    fn register_value(
        &mut self,
        prefix: &'static str,
        sel: fn(&mut V250) -> &mut i32,
        min: i32,
        max: i32,
        default: i32,
    ) {
        let handler = move |server: &mut Server<C>, req: RequestType, result: &Response| {
            match req {
                RequestType::Set => match result_value(result, min, max) {
                    Some(v) => {
                        *sel(&mut server.v250) = v;
                        server.send_final(ServerResult::Ok);
                    }
                    None => server.send_final(ServerResult::Error),
                },
                RequestType::Query => {
                    let v = *sel(&mut server.v250);
                    server.send_info(&format!("{prefix}: {v}"), true);
                    server.send_final(ServerResult::Ok);
                }
                RequestType::Support => {
                    server.send_info(&format!("{prefix}: ({min}-{max})"), true);
                    server.send_final(ServerResult::Ok);
                }
                RequestType::CommandOnly => {
                    *sel(&mut server.v250) = default;
                    server.send_final(ServerResult::Ok);
                }
            }
        };

        self.register(prefix, Rc::new(RefCell::new(handler)));
    }

    fn register_dial_mode(&mut self, prefix: &'static str, mode: u8) {
        // Mandatory per V.250 6.3.2/6.3.3, a no-op without pulse dialling.
        let handler = move |server: &mut Server<C>, req: RequestType, _: &Response| match req {
            RequestType::CommandOnly => {
                server.v250.dial_mode = mode;
                server.send_final(ServerResult::Ok);
            }
            _ => server.send_final(ServerResult::Error),
        };

        self.register(prefix, Rc::new(RefCell::new(handler)));
    }

    fn register_reset(&mut self, prefix: &'static str, allow_set: bool) {
        let handler = move |server: &mut Server<C>, req: RequestType, result: &Response| {
            let ok = match req {
                RequestType::CommandOnly => true,
                RequestType::Set if allow_set => result_value(result, 0, 0).is_some(),
                _ => false,
            };

            if ok {
                server.v250 = V250::default();
                server.send_final(ServerResult::Ok);
            } else {
                server.send_final(ServerResult::Error);
            }
        };

        self.register(prefix, Rc::new(RefCell::new(handler)));
    }
}

fn result_value(result: &Response, min: i32, max: i32) -> Option<i32> {
    let mut iter = result.iter();

    if !iter.next_line("") {
        return None;
    }

    let v = iter.next_number()?;
    if v < min || v > max {
        return None;
    }

    Some(v)
}

fn is_extended_prefix(c: u8) -> bool {
    matches!(c, b'+' | b'*' | b'!' | b'%')
}

fn basic_prefix_size(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }

    if bytes[0].is_ascii_alphabetic() {
        if bytes[0].to_ascii_uppercase() == b'S' {
            let mut size = 1;
            while size < bytes.len() && bytes[size].is_ascii_digit() {
                size += 1;
            }

            // Reject bare S and leading-zero registers like S01.
            if size == 1 {
                return 0;
            }
            if size > 2 && bytes[1] == b'0' {
                return 0;
            }

            return size;
        }

        return 1;
    }

    if bytes[0] == b'&' {
        if bytes.len() < 2 || !bytes[1].is_ascii_alphabetic() {
            return 0;
        }
        return 2;
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemChannel;

    fn new_server() -> (Server<MemChannel>, MemChannel) {
        let (a, b) = MemChannel::pair();
        let mut server = Server::new(a);
        server.set_echo(false);
        (server, b)
    }

    fn pump(server: &mut Server<MemChannel>) {
        server.process_readable();
        while server.process_writable() {}
    }

    fn read_out(te: &mut MemChannel) -> String {
        let mut buf = [0u8; 1024];
        match te.recv(&mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            Err(_) => String::new(),
        }
    }

    #[test]
    fn empty_command_gets_ok() {
        let (mut server, mut te) = new_server();

        te.send(b"AT\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }

    #[test]
    fn unknown_command_gets_error() {
        let (mut server, mut te) = new_server();

        te.send(b"AT+BOGUS\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "\r\nERROR\r\n");
    }

    #[test]
    fn garbage_is_swallowed() {
        let (mut server, mut te) = new_server();

        te.send(b"zzz\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "");
    }

    #[test]
    fn echo_reflects_input() {
        let (mut server, mut te) = new_server();
        server.set_echo(true);

        te.send(b"AT\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "AT\r\r\nOK\r\n");
    }

    #[test]
    fn s_register_set_query_support() {
        let (mut server, mut te) = new_server();

        te.send(b"ATS0=3\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
        assert_eq!(server.v250.s0, 3);

        te.send(b"ATS0?\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "\r\n003\r\n\r\nOK\r\n");

        te.send(b"ATS0=?\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "\r\nS0: (0-7)\r\n\r\nOK\r\n");
    }

    #[test]
    fn basic_commands_chain_on_one_line() {
        let (mut server, mut te) = new_server();

        te.send(b"ATE0Q0V1\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
        assert_eq!(server.v250.echo, 0);
        assert_eq!(server.v250.quiet, 0);
        assert_eq!(server.v250.is_v1, 1);
    }

    #[test]
    fn v0_numeric_result() {
        let (mut server, mut te) = new_server();

        te.send(b"ATV0\r").unwrap();
        pump(&mut server);

        // The V0 setting takes effect for its own final result.
        assert_eq!(read_out(&mut te), "0\r");

        te.send(b"AT+NOPE\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "4\r");
    }

    #[test]
    fn quiet_suppresses_results() {
        let (mut server, mut te) = new_server();

        te.send(b"ATQ1\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "");

        te.send(b"AT\r").unwrap();
        pump(&mut server);
        assert_eq!(read_out(&mut te), "");
    }

    #[test]
    fn extended_command_dispatch_types() {
        let (mut server, mut te) = new_server();

        let seen: Rc<RefCell<Vec<(RequestType, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();

        server.register(
            "+TEST",
            Rc::new(RefCell::new(
                move |server: &mut Server<MemChannel>, req, result: &Response| {
                    s.borrow_mut().push((req, result.lines()[0].clone()));
                    server.send_final(ServerResult::Ok);
                },
            )),
        );

        te.send(b"AT+TEST\r").unwrap();
        pump(&mut server);
        te.send(b"AT+TEST?\r").unwrap();
        pump(&mut server);
        te.send(b"AT+TEST=?\r").unwrap();
        pump(&mut server);
        te.send(b"AT+TEST=1,2\r").unwrap();
        pump(&mut server);

        let seen = seen.borrow();
        assert_eq!(seen[0], (RequestType::CommandOnly, String::new()));
        assert_eq!(seen[1], (RequestType::Query, String::new()));
        assert_eq!(seen[2], (RequestType::Support, String::new()));
        assert_eq!(seen[3], (RequestType::Set, "1,2".to_string()));
    }

    #[test]
    fn semicolon_splits_commands_and_error_aborts() {
        let (mut server, mut te) = new_server();

        let count = Rc::new(std::cell::Cell::new(0));
        let c = count.clone();
        server.register(
            "+GOOD",
            Rc::new(RefCell::new(
                move |server: &mut Server<MemChannel>, _req, _r: &Response| {
                    c.set(c.get() + 1);
                    server.send_final(ServerResult::Ok);
                },
            )),
        );

        te.send(b"AT+GOOD;+BAD;+GOOD\r").unwrap();
        pump(&mut server);

        // ERROR from +BAD aborts the rest; one OK never appears.
        assert_eq!(count.get(), 1);
        assert_eq!(read_out(&mut te), "\r\nERROR\r\n");
    }

    #[test]
    fn single_ok_for_whole_line() {
        let (mut server, mut te) = new_server();

        te.send(b"ATE0;S0=2\r").unwrap();
        pump(&mut server);

        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
        assert_eq!(server.v250.s0, 2);
    }

    #[test]
    fn dial_string_reaches_handler() {
        let (mut server, mut te) = new_server();

        let dial = Rc::new(RefCell::new(String::new()));
        let d = dial.clone();
        server.register(
            "D",
            Rc::new(RefCell::new(
                move |server: &mut Server<MemChannel>, req, r: &Response| {
                    assert_eq!(req, RequestType::Set);
                    *d.borrow_mut() = r.lines()[0].clone();
                    server.send_final(ServerResult::Ok);
                },
            )),
        );

        te.send(b"ATD*99***1#\r").unwrap();
        pump(&mut server);

        assert_eq!(&*dial.borrow(), "*99***1#");
        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }

    #[test]
    fn repeat_last_line() {
        let (mut server, mut te) = new_server();

        let count = Rc::new(std::cell::Cell::new(0));
        let c = count.clone();
        server.register(
            "+CNT",
            Rc::new(RefCell::new(
                move |server: &mut Server<MemChannel>, _req, _r: &Response| {
                    c.set(c.get() + 1);
                    server.send_final(ServerResult::Ok);
                },
            )),
        );

        te.send(b"AT+CNT\r").unwrap();
        pump(&mut server);
        assert_eq!(count.get(), 1);

        te.send(b"A/").unwrap();
        pump(&mut server);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn async_handler_pauses_line() {
        let (mut server, mut te) = new_server();

        server.register(
            "+SLOW",
            Rc::new(RefCell::new(
                move |_server: &mut Server<MemChannel>, _req, _r: &Response| {
                    // No final: the command stays pending.
                },
            )),
        );

        te.send(b"AT+SLOW;S0=5\r").unwrap();
        pump(&mut server);

        assert!(server.command_pending());
        assert_eq!(read_out(&mut te), "");
        assert_eq!(server.v250.s0, 0);

        // The deferred final resumes the remaining sub-command.
        server.send_final(ServerResult::Ok);
        while server.process_writable() {}

        assert!(!server.command_pending());
        assert_eq!(server.v250.s0, 5);
        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }

    #[test]
    fn backspace_edits_command_line() {
        let (mut server, mut te) = new_server();

        te.send(b"ATS4=55\x08\x089\r").unwrap();
        pump(&mut server);

        // S4=55 edited into S4=9.
        assert_eq!(server.v250.s4, 9);
        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }

    #[test]
    fn amp_f_resets_settings() {
        let (mut server, mut te) = new_server();

        te.send(b"ATE0\r").unwrap();
        pump(&mut server);
        read_out(&mut te);
        assert_eq!(server.v250.echo, 0);

        te.send(b"AT&F\r").unwrap();
        pump(&mut server);
        assert_eq!(server.v250.echo, 1);
        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }

    #[test]
    fn garbage_ended_by_hdlc_flag() {
        let (mut server, mut te) = new_server();

        // Garbage then a frame flag; the next command parses cleanly.
        te.send(b"\x55\x55~AT\r").unwrap();
        pump(&mut server);
        pump(&mut server);

        assert_eq!(read_out(&mut te), "\r\nOK\r\n");
    }
}
