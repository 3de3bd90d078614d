//! HDLC-like framing per RFC 1662: `7E` flags, `7D` transparency with
//! XOR `0x20`, CCITT-16 FCS, and ACCM-driven escaping in both directions.
//!
//! The codec also watches for the GSM 07.07 `+++` escape: three plus signs
//! framed by at least a second of silence on each side. When a suspend
//! watcher is enabled and the guard expires, the owner is told to drop the
//! data path and return to command mode without tearing the link down.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::ring::RingBuffer;
use crate::transport::{Channel, Endpoint};

const BUFFER_SIZE: usize = 2 * 2048;
/// Maximum number of in-flight write buffers.
const MAX_BUFFERS: usize = 64;
/// Rough estimate of the framing overhead of one frame.
const HDLC_OVERHEAD: usize = 256;

const HDLC_FLAG: u8 = 0x7E;
const HDLC_ESCAPE: u8 = 0x7D;
const HDLC_TRANS: u8 = 0x20;

const HDLC_INITFCS: u16 = 0xFFFF;
const HDLC_GOODFCS: u16 = 0xF0B8;

/// Pause required before and after the `+++` sequence.
const GUARD_TIMEOUT: Duration = Duration::from_millis(1000);

/// FCS lookup table from RFC 1662.
static FCS_TABLE: [u16; 256] = [
    0x0000, 0x1189, 0x2312, 0x329b, 0x4624, 0x57ad, 0x6536, 0x74bf,
    0x8c48, 0x9dc1, 0xaf5a, 0xbed3, 0xca6c, 0xdbe5, 0xe97e, 0xf8f7,
    0x1081, 0x0108, 0x3393, 0x221a, 0x56a5, 0x472c, 0x75b7, 0x643e,
    0x9cc9, 0x8d40, 0xbfdb, 0xae52, 0xdaed, 0xcb64, 0xf9ff, 0xe876,
    0x2102, 0x308b, 0x0210, 0x1399, 0x6726, 0x76af, 0x4434, 0x55bd,
    0xad4a, 0xbcc3, 0x8e58, 0x9fd1, 0xeb6e, 0xfae7, 0xc87c, 0xd9f5,
    0x3183, 0x200a, 0x1291, 0x0318, 0x77a7, 0x662e, 0x54b5, 0x453c,
    0xbdcb, 0xac42, 0x9ed9, 0x8f50, 0xfbef, 0xea66, 0xd8fd, 0xc974,
    0x4204, 0x538d, 0x6116, 0x709f, 0x0420, 0x15a9, 0x2732, 0x36bb,
    0xce4c, 0xdfc5, 0xed5e, 0xfcd7, 0x8868, 0x99e1, 0xab7a, 0xbaf3,
    0x5285, 0x430c, 0x7197, 0x601e, 0x14a1, 0x0528, 0x37b3, 0x263a,
    0xdecd, 0xcf44, 0xfddf, 0xec56, 0x98e9, 0x8960, 0xbbfb, 0xaa72,
    0x6306, 0x728f, 0x4014, 0x519d, 0x2522, 0x34ab, 0x0630, 0x17b9,
    0xef4e, 0xfec7, 0xcc5c, 0xddd5, 0xa96a, 0xb8e3, 0x8a78, 0x9bf1,
    0x7387, 0x620e, 0x5095, 0x411c, 0x35a3, 0x242a, 0x16b1, 0x0738,
    0xffcf, 0xee46, 0xdcdd, 0xcd54, 0xb9eb, 0xa862, 0x9af9, 0x8b70,
    0x8408, 0x9581, 0xa71a, 0xb693, 0xc22c, 0xd3a5, 0xe13e, 0xf0b7,
    0x0840, 0x19c9, 0x2b52, 0x3adb, 0x4e64, 0x5fed, 0x6d76, 0x7cff,
    0x9489, 0x8500, 0xb79b, 0xa612, 0xd2ad, 0xc324, 0xf1bf, 0xe036,
    0x18c1, 0x0948, 0x3bd3, 0x2a5a, 0x5ee5, 0x4f6c, 0x7df7, 0x6c7e,
    0xa50a, 0xb483, 0x8618, 0x9791, 0xe32e, 0xf2a7, 0xc03c, 0xd1b5,
    0x2942, 0x38cb, 0x0a50, 0x1bd9, 0x6f66, 0x7eef, 0x4c74, 0x5dfd,
    0xb58b, 0xa402, 0x9699, 0x8710, 0xf3af, 0xe226, 0xd0bd, 0xc134,
    0x39c3, 0x284a, 0x1ad1, 0x0b58, 0x7fe7, 0x6e6e, 0x5cf5, 0x4d7c,
    0xc60c, 0xd785, 0xe51e, 0xf497, 0x8028, 0x91a1, 0xa33a, 0xb2b3,
    0x4a44, 0x5bcd, 0x6956, 0x78df, 0x0c60, 0x1de9, 0x2f72, 0x3efb,
    0xd68d, 0xc704, 0xf59f, 0xe416, 0x90a9, 0x8120, 0xb3bb, 0xa232,
    0x5ac5, 0x4b4c, 0x79d7, 0x685e, 0x1ce1, 0x0d68, 0x3ff3, 0x2e7a,
    0xe70e, 0xf687, 0xc41c, 0xd595, 0xa12a, 0xb0a3, 0x8238, 0x93b1,
    0x6b46, 0x7acf, 0x4854, 0x59dd, 0x2d62, 0x3ceb, 0x0e70, 0x1ff9,
    0xf78f, 0xe606, 0xd49d, 0xc514, 0xb1ab, 0xa022, 0x92b9, 0x8330,
    0x7bc7, 0x6a4e, 0x58d5, 0x495c, 0x3de3, 0x2c6a, 0x1ef1, 0x0f78,
];

#[inline]
pub fn fcs_byte(fcs: u16, c: u8) -> u16 {
    (fcs >> 8) ^ FCS_TABLE[((fcs ^ c as u16) & 0xff) as usize]
}

/// Computes the complete FCS over `data`, starting from the initial value.
pub fn fcs(data: &[u8]) -> u16 {
    data.iter().fold(HDLC_INITFCS, |f, &c| fcs_byte(f, c))
}

/// HDLC codec with its transmit queue and receive state.
pub struct Hdlc {
    write_queue: VecDeque<RingBuffer>,

    decode_buf: Vec<u8>,
    decode_fcs: u16,
    decode_escape: bool,

    xmit_accm: [u32; 8],
    recv_accm: u32,

    wakeup_sent: bool,
    start_frame_marker: bool,
    no_carrier_detect: bool,

    suspend_enabled: bool,
    /// Instant of the last receive activity, for the `+++` guard.
    guard_timer: Option<Instant>,
    num_plus: u32,
    suspend_deadline: Option<Instant>,
}

impl Default for Hdlc {
    fn default() -> Self {
        Self::new()
    }
}

impl Hdlc {
    pub fn new() -> Self {
        let mut write_queue = VecDeque::new();
        write_queue.push_back(RingBuffer::new(BUFFER_SIZE));

        let mut xmit_accm = [0u32; 8];
        xmit_accm[0] = !0;
        xmit_accm[3] = 0x6000_0000; // 0x7d, 0x7e

        Self {
            write_queue,
            decode_buf: Vec::with_capacity(BUFFER_SIZE),
            decode_fcs: HDLC_INITFCS,
            decode_escape: false,
            xmit_accm,
            recv_accm: !0,
            wakeup_sent: false,
            start_frame_marker: false,
            no_carrier_detect: false,
            suspend_enabled: false,
            guard_timer: None,
            num_plus: 0,
            suspend_deadline: None,
        }
    }

    pub fn set_xmit_accm(&mut self, accm: u32) {
        self.xmit_accm[0] = accm;
    }

    pub fn xmit_accm(&self) -> u32 {
        self.xmit_accm[0]
    }

    pub fn set_recv_accm(&mut self, accm: u32) {
        self.recv_accm = accm;
    }

    pub fn recv_accm(&self) -> u32 {
        self.recv_accm
    }

    /// Emit the opening `7E` on every frame rather than only as a wakeup
    /// character before the first one.
    pub fn set_start_frame_marker(&mut self, marker: bool) {
        self.start_frame_marker = marker;
    }

    /// Stop decoding when a bare CR arrives where a frame should begin;
    /// that is how a dropped carrier shows up on a modem line.
    pub fn set_no_carrier_detect(&mut self, detect: bool) {
        self.no_carrier_detect = detect;
    }

    /// Enables `+++` escape detection.
    pub fn set_suspend_enabled(&mut self, enabled: bool) {
        self.suspend_enabled = enabled;

        if enabled {
            self.guard_timer = None;
        } else {
            self.suspend_deadline = None;
            self.num_plus = 0;
        }
    }

    #[inline]
    fn need_escape(&self, c: u8) -> bool {
        self.xmit_accm[(c >> 5) as usize] & (1 << (c & 0x1f)) != 0
    }

    /// Byte-stuffs one frame into the write queue. Fails when the queue
    /// has hit its buffer cap.
    pub fn send(&mut self, data: &[u8]) -> bool {
        let mut frame = Vec::with_capacity(data.len() + HDLC_OVERHEAD);

        if self.start_frame_marker {
            // Protocol requires the opening flag on every frame.
            frame.push(HDLC_FLAG);
        } else if !self.wakeup_sent {
            // A single leading flag doubles as the wakeup character.
            frame.push(HDLC_FLAG);
            self.wakeup_sent = true;
        }

        let mut fcs = HDLC_INITFCS;

        for &b in data {
            fcs = fcs_byte(fcs, b);
            if self.need_escape(b) {
                frame.push(HDLC_ESCAPE);
                frame.push(b ^ HDLC_TRANS);
            } else {
                frame.push(b);
            }
        }

        let fcs = fcs ^ 0xFFFF;
        for b in [fcs as u8, (fcs >> 8) as u8] {
            if self.need_escape(b) {
                frame.push(HDLC_ESCAPE);
                frame.push(b ^ HDLC_TRANS);
            } else {
                frame.push(b);
            }
        }

        frame.push(HDLC_FLAG);

        self.queue_bytes(&frame)
    }

    fn queue_bytes(&mut self, bytes: &[u8]) -> bool {
        let tail = self.write_queue.back_mut().expect("queue never empty");

        if tail.avail() < bytes.len() {
            if self.write_queue.len() > MAX_BUFFERS {
                return false; // too many pending buffers
            }

            let mut fresh = RingBuffer::new(BUFFER_SIZE.max(bytes.len()));
            fresh.write(bytes);
            self.write_queue.push_back(fresh);
            return true;
        }

        tail.write(bytes);
        true
    }

    pub fn has_pending_output(&self) -> bool {
        self.write_queue.iter().any(|b| !b.is_empty())
    }

    /// Flushes one contiguous span towards the channel. Returns `true`
    /// while output remains queued.
    pub fn process_writable<C: Channel>(&mut self, io: &mut Endpoint<C>) -> bool {
        let head = self.write_queue.front_mut().expect("queue never empty");

        let span = head.readable_slice().to_vec();
        if span.is_empty() {
            io.set_wants_write(false);
            return false;
        }

        let written = io.send(&span);
        let head = self.write_queue.front_mut().expect("queue never empty");
        head.drain(written);

        if written == 0 {
            io.set_wants_write(false);
            return false;
        }

        if head.is_empty() && self.write_queue.len() > 1 {
            self.write_queue.pop_front();
        }

        let more = self.has_pending_output();
        if !more {
            io.set_wants_write(false);
        }
        more
    }

    /// Feeds buffered receive bytes through the decoder, returning every
    /// complete, FCS-valid frame (address/control and FCS included in the
    /// checks, FCS stripped from the output).
    ///
    /// When `+++` detection is armed and the buffer holds nothing but
    /// plus signs after a guard period, the bytes are left in place until
    /// the trailing guard either expires (see
    /// [`handle_timeout`](Self::handle_timeout)) or more data arrives.
    pub fn feed(&mut self, rbuf: &mut RingBuffer, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        if self.suspend_deadline.take().is_some() {
            // More data cancelled a pending suspend; the plus signs were
            // payload after all.
            self.guard_timer = Some(now);
        } else if self.suspend_enabled {
            let escaping = self.check_escape(rbuf, now);
            self.guard_timer = Some(now);

            if escaping {
                return frames;
            }
        }

        let len = rbuf.len();
        let mut pos = 0;

        while pos < len {
            let b = rbuf.peek(pos).expect("pos < len");

            // A CR where the address or protocol field belongs means the
            // carrier dropped and text results follow.
            if self.no_carrier_detect && self.decode_buf.is_empty() && b == b'\r' {
                break;
            }

            if self.decode_escape {
                let val = b ^ HDLC_TRANS;
                self.decode_buf.push(val);
                self.decode_fcs = fcs_byte(self.decode_fcs, val);
                self.decode_escape = false;
            } else if b == HDLC_ESCAPE {
                self.decode_escape = true;
            } else if b == HDLC_FLAG {
                if self.decode_buf.len() > 2 && self.decode_fcs == HDLC_GOODFCS {
                    let body_len = self.decode_buf.len() - 2;
                    frames.push(self.decode_buf[..body_len].to_vec());
                }

                self.decode_fcs = HDLC_INITFCS;
                self.decode_buf.clear();
            } else if b >= 0x20 || (self.recv_accm & (1 << b)) == 0 {
                self.decode_buf.push(b);
                self.decode_fcs = fcs_byte(self.decode_fcs, b);
            }

            pos += 1;
        }

        rbuf.drain(pos);
        frames
    }

    /// All-plus-sign check for the suspend sequence. Returns `true` when
    /// the buffered bytes should be withheld from the decoder.
    fn check_escape(&mut self, rbuf: &RingBuffer, now: Instant) -> bool {
        let len = rbuf.len();

        let guard_elapsed = match self.guard_timer {
            Some(t) => now.duration_since(t) >= GUARD_TIMEOUT,
            None => true,
        };

        let mut num_plus = 0;
        while num_plus < len && num_plus < 3 {
            if rbuf.peek(num_plus) != Some(b'+') {
                break;
            }
            num_plus += 1;
        }

        if num_plus != len {
            return false;
        }

        // Plus signs, but no leading guard silence.
        if !guard_elapsed && self.num_plus == 0 {
            return false;
        }

        if num_plus != 3 {
            self.num_plus = num_plus as u32;
            return true;
        }

        self.num_plus = 0;
        self.suspend_deadline = Some(now + GUARD_TIMEOUT);
        true
    }

    /// Deadline for the pending `+++` trailing guard, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.suspend_deadline
    }

    /// Fires the trailing guard. Returns `true` when the escape sequence
    /// completed: the plus signs are drained and the owner should drop
    /// into command mode.
    pub fn handle_timeout(&mut self, rbuf: &mut RingBuffer, now: Instant) -> bool {
        match self.suspend_deadline {
            Some(deadline) if now >= deadline => {
                self.suspend_deadline = None;
                rbuf.drain(3);
                true
            }
            _ => false,
        }
    }
}
