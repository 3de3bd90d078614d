//! LCP option negotiation over the generic control-protocol machine.

use super::cp::{
    code_mask, push_option, CpContext, CpDriver, CpPacket, Pppcp, RcrResult,
    CODE_CONFIGURE_ACK, CODE_CONFIGURE_NAK, CODE_CONFIGURE_REJECT, CODE_CONFIGURE_REQUEST,
    CODE_CODE_REJECT, CODE_DISCARD_REQUEST, CODE_ECHO_REPLY, CODE_ECHO_REQUEST,
    CODE_PROTOCOL_REJECT, CODE_TERMINATE_ACK, CODE_TERMINATE_REQUEST,
};
use super::cp::LinkEvent;
use super::{CHAP_PROTOCOL, MD5};

use byteorder::{BigEndian, ByteOrder};

const OPT_MRU: u8 = 1;
const OPT_ACCM: u8 = 2;
const OPT_AUTH_PROTO: u8 = 3;
const OPT_MAGIC_NUMBER: u8 = 5;
const OPT_PFC: u8 = 7;
const OPT_ACFC: u8 = 8;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct ReqOptions: u8 {
        const ACCM = 0x1;
        const MRU  = 0x2;
        const ACFC = 0x4;
        const PFC  = 0x8;
    }
}

/// LCP policy: negotiates ACCM, MRU, the compression flags, and insists on
/// CHAP-MD5 when the peer wants authentication at all.
pub struct Lcp {
    req_options: ReqOptions,
    accm: u32,
    mru: u16,
}

impl Lcp {
    fn generate_config_options(&self, out: &mut Vec<u8>) {
        out.clear();

        if self.req_options.contains(ReqOptions::ACCM) {
            push_option(out, OPT_ACCM, &self.accm.to_be_bytes());
        }

        if self.req_options.contains(ReqOptions::MRU) {
            push_option(out, OPT_MRU, &self.mru.to_be_bytes());
        }

        if self.req_options.contains(ReqOptions::ACFC) {
            push_option(out, OPT_ACFC, &[]);
        }

        if self.req_options.contains(ReqOptions::PFC) {
            push_option(out, OPT_PFC, &[]);
        }
    }

    fn reset_config_options(&mut self, out: &mut Vec<u8>) {
        // Request an all-clear ACCM; the rest joins on demand.
        self.req_options &= ReqOptions::ACFC | ReqOptions::PFC;
        self.req_options |= ReqOptions::ACCM;
        self.accm = 0;
        self.generate_config_options(out);
    }

    pub fn set_acfc_enabled(&mut self, enabled: bool, options: &mut Vec<u8>) {
        let old = self.req_options;
        self.req_options.set(ReqOptions::ACFC, enabled);

        if self.req_options != old {
            self.generate_config_options(options);
        }
    }

    pub fn set_pfc_enabled(&mut self, enabled: bool, options: &mut Vec<u8>) {
        let old = self.req_options;
        self.req_options.set(ReqOptions::PFC, enabled);

        if self.req_options != old {
            self.generate_config_options(options);
        }
    }
}

impl CpDriver for Lcp {
    const PROTO: u16 = super::LCP_PROTOCOL;
    const NAME: &'static str = "lcp";
    const SUPPORTED_CODES: u16 = code_mask(&[
        CODE_CONFIGURE_REQUEST,
        CODE_CONFIGURE_ACK,
        CODE_CONFIGURE_NAK,
        CODE_CONFIGURE_REJECT,
        CODE_TERMINATE_REQUEST,
        CODE_TERMINATE_ACK,
        CODE_CODE_REJECT,
        CODE_PROTOCOL_REJECT,
        CODE_ECHO_REQUEST,
        CODE_ECHO_REPLY,
        CODE_DISCARD_REQUEST,
    ]);

    fn this_layer_up(&mut self, ctx: &mut CpContext) {
        ctx.link.push(LinkEvent::LcpUp);
    }

    fn this_layer_down(&mut self, ctx: &mut CpContext) {
        self.reset_config_options(ctx.local_options);
        ctx.link.push(LinkEvent::LcpDown);
    }

    fn this_layer_finished(&mut self, ctx: &mut CpContext) {
        ctx.link.push(LinkEvent::LcpFinished);
    }

    fn rca(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        for (opt_type, data) in packet.options() {
            match opt_type {
                OPT_ACCM if data.len() >= 4 => {
                    // RFC 1662 7.1: the option tells the peer which
                    // control characters must stay mapped towards us.
                    ctx.link
                        .push(LinkEvent::RecvAccm(BigEndian::read_u32(data)));
                }
                _ => {}
            }
        }
    }

    fn rcn_nak(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        for (opt_type, data) in packet.options() {
            if opt_type == OPT_MRU && data.len() >= 2 {
                let mru = BigEndian::read_u16(data);

                if mru < 2048 {
                    self.mru = mru;
                    self.req_options |= ReqOptions::MRU;
                }
            }
        }

        self.generate_config_options(ctx.local_options);
    }

    fn rcn_rej(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        for (opt_type, _) in packet.options() {
            match opt_type {
                OPT_ACCM => self.req_options.remove(ReqOptions::ACCM),
                OPT_MRU => self.req_options.remove(ReqOptions::MRU),
                OPT_ACFC => self.req_options.remove(ReqOptions::ACFC),
                OPT_PFC => self.req_options.remove(ReqOptions::PFC),
                _ => {}
            }
        }

        self.generate_config_options(ctx.local_options);
    }

    fn rcr(&mut self, packet: &CpPacket, ctx: &mut CpContext) -> RcrResult {
        // First pass: find anything we cannot live with.
        for (opt_type, data) in packet.options() {
            match opt_type {
                OPT_AUTH_PROTO => {
                    if data.len() >= 3 {
                        let proto = BigEndian::read_u16(data);
                        let method = data[2];

                        if proto == CHAP_PROTOCOL && method == MD5 {
                            continue;
                        }
                    }

                    // Suggest CHAP with MD5 instead.
                    let mut counter = Vec::with_capacity(5);
                    let mut value = [0u8; 3];
                    BigEndian::write_u16(&mut value, CHAP_PROTOCOL);
                    value[2] = MD5;
                    push_option(&mut counter, OPT_AUTH_PROTO, &value);

                    return RcrResult::Nak(counter);
                }

                OPT_ACCM | OPT_PFC | OPT_ACFC | OPT_MRU => {}

                OPT_MAGIC_NUMBER => {
                    if data.len() < 4 || BigEndian::read_u32(data) == 0 {
                        let mut rejected = Vec::new();
                        push_option(&mut rejected, OPT_MAGIC_NUMBER, data);
                        return RcrResult::Reject(rejected);
                    }
                }

                _ => {
                    let mut rejected = Vec::new();
                    push_option(&mut rejected, opt_type, data);
                    return RcrResult::Reject(rejected);
                }
            }
        }

        // Everything was acceptable: apply and ack.
        for (opt_type, data) in packet.options() {
            match opt_type {
                OPT_ACCM if data.len() >= 4 => {
                    ctx.link
                        .push(LinkEvent::XmitAccm(BigEndian::read_u32(data)));
                }
                OPT_AUTH_PROTO if data.len() >= 3 => {
                    ctx.link
                        .push(LinkEvent::AuthRequired(BigEndian::read_u16(data), data[2]));
                }
                OPT_MRU if data.len() >= 2 => {
                    ctx.link.push(LinkEvent::Mtu(BigEndian::read_u16(data)));
                }
                OPT_PFC => {
                    if self.req_options.contains(ReqOptions::PFC) {
                        ctx.link.push(LinkEvent::XmitPfc);
                    }
                }
                OPT_ACFC => {
                    if self.req_options.contains(ReqOptions::ACFC) {
                        ctx.link.push(LinkEvent::XmitAcfc);
                    }
                }
                _ => {}
            }
        }

        RcrResult::Accept
    }
}

/// Creates the LCP machine; a server instance starts dormant and waits
/// for the peer's Configure-Request.
pub fn new_lcp(is_server: bool) -> Pppcp<Lcp> {
    let mut lcp = Lcp {
        req_options: ReqOptions::empty(),
        accm: 0,
        mru: 0,
    };

    let mut options = Vec::new();
    lcp.reset_config_options(&mut options);

    let mut pppcp = Pppcp::new(lcp, is_server, 0);
    pppcp.set_local_options(options);
    pppcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppp::cp::State;
    use std::time::Instant;

    fn opts_of(pkt: &[u8]) -> &[u8] {
        &pkt[4..]
    }

    #[test]
    fn initial_request_carries_accm_zero() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);

        lcp.signal_up(now);
        lcp.signal_open(now);

        let out = lcp.take_output();
        assert_eq!(opts_of(&out[0]), &[OPT_ACCM, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn peer_request_with_chap_md5_is_accepted() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        lcp.take_output();

        // Peer asks for CHAP-MD5 auth and an ACCM of zero.
        let mut opts = Vec::new();
        push_option(&mut opts, OPT_AUTH_PROTO, &[0xC2, 0x23, MD5]);
        push_option(&mut opts, OPT_ACCM, &[0, 0, 0, 0]);

        let mut req = vec![CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&req, now);

        let out = lcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_ACK);

        let events = lcp.take_link_events();
        assert!(events.contains(&LinkEvent::AuthRequired(CHAP_PROTOCOL, MD5)));
        assert!(events.contains(&LinkEvent::XmitAccm(0)));
    }

    #[test]
    fn other_auth_is_naked_with_chap_md5() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        lcp.take_output();

        // PAP proposed: counter with CHAP-MD5.
        let mut opts = Vec::new();
        push_option(&mut opts, OPT_AUTH_PROTO, &[0xC0, 0x23]);

        let mut req = vec![CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&req, now);

        let out = lcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_NAK);
        assert_eq!(opts_of(&out[0]), &[OPT_AUTH_PROTO, 5, 0xC2, 0x23, MD5]);
    }

    #[test]
    fn zero_magic_number_is_rejected() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        lcp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_MAGIC_NUMBER, &[0, 0, 0, 0]);

        let mut req = vec![CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&req, now);

        let out = lcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REJECT);
        assert_eq!(opts_of(&out[0]), &[OPT_MAGIC_NUMBER, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        lcp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, 0x0D, &[0x01]); // callback option

        let mut req = vec![CODE_CONFIGURE_REQUEST, 1, 0, 0];
        req.extend_from_slice(&opts);
        let len = req.len() as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&req, now);

        let out = lcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REJECT);
        assert_eq!(opts_of(&out[0]), &[0x0D, 3, 0x01]);
    }

    #[test]
    fn mru_nak_updates_request() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        let id = lcp.take_output()[0][1];

        // Peer naks with MRU 296.
        let mut opts = Vec::new();
        push_option(&mut opts, OPT_MRU, &[0x01, 0x28]);

        let mut nak = vec![CODE_CONFIGURE_NAK, id, 0, 0];
        nak.extend_from_slice(&opts);
        let len = nak.len() as u16;
        nak[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&nak, now);

        let out = lcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REQUEST);
        // Regenerated options now include MRU 296.
        let opts = opts_of(&out[0]);
        assert!(opts
            .windows(4)
            .any(|w| w == [OPT_MRU, 4, 0x01, 0x28]));
    }

    #[test]
    fn ack_applies_recv_accm_and_opens() {
        let now = Instant::now();
        let mut lcp = new_lcp(false);
        lcp.signal_up(now);
        lcp.signal_open(now);
        let out = lcp.take_output();
        let id = out[0][1];

        // Ack must echo our exact options.
        let mut ack = vec![CODE_CONFIGURE_ACK, id, 0, 0];
        ack.extend_from_slice(opts_of(&out[0]));
        let len = ack.len() as u16;
        ack[2..4].copy_from_slice(&len.to_be_bytes());

        lcp.process_packet(&ack, now);
        assert_eq!(lcp.state(), State::AckRcvd);

        let events = lcp.take_link_events();
        assert!(events.contains(&LinkEvent::RecvAccm(0)));

        // Peer's own request completes the exchange.
        lcp.process_packet(&[CODE_CONFIGURE_REQUEST, 9, 0, 4], now);
        assert_eq!(lcp.state(), State::Opened);
        assert!(lcp.take_link_events().contains(&LinkEvent::LcpUp));
    }

    #[test]
    fn server_lcp_starts_dormant() {
        let lcp = new_lcp(true);
        assert_eq!(lcp.state(), State::Stopped);
    }
}
