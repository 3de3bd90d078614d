//! IPCP (RFC 1332) option negotiation.
//!
//! A client requests its address plus DNS and NBNS servers with zero
//! values and absorbs whatever the peer naks back. A server negotiates
//! only `IP-Address` and naks any peer proposal other than its configured
//! peer address; the DNS options peers commonly request are answered from
//! the configured server info.

use std::net::Ipv4Addr;

use super::cp::{
    code_mask, push_option, CpContext, CpDriver, CpPacket, LinkEvent, Pppcp, RcrResult,
    CODE_CODE_REJECT, CODE_CONFIGURE_ACK, CODE_CONFIGURE_NAK, CODE_CONFIGURE_REJECT,
    CODE_CONFIGURE_REQUEST, CODE_TERMINATE_ACK, CODE_TERMINATE_REQUEST,
};

const OPT_IP_ADDRESS: u8 = 3;
const OPT_PRIMARY_DNS: u8 = 129;
const OPT_PRIMARY_NBNS: u8 = 130;
const OPT_SECONDARY_DNS: u8 = 131;
const OPT_SECONDARY_NBNS: u8 = 132;

/// Some 3G modems stall via repeated IPCP NAKs while fetching the client
/// address, so the NAK allowance is far above the RFC default.
const MAX_IPCP_FAILURE: u32 = 100;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct ReqOptions: u8 {
        const IPADDR = 0x01;
        const DNS1   = 0x02;
        const DNS2   = 0x04;
        const NBNS1  = 0x08;
        const NBNS2  = 0x10;
    }
}

fn addr_of(data: &[u8]) -> Option<Ipv4Addr> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(Ipv4Addr::from(bytes))
}

pub struct Ipcp {
    req_options: ReqOptions,
    is_server: bool,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    dns1: Ipv4Addr,
    dns2: Ipv4Addr,
    nbns1: Ipv4Addr,
    nbns2: Ipv4Addr,
}

impl Ipcp {
    fn generate_config_options(&self, out: &mut Vec<u8>) {
        out.clear();

        let table = [
            (ReqOptions::IPADDR, OPT_IP_ADDRESS, self.local),
            (ReqOptions::DNS1, OPT_PRIMARY_DNS, self.dns1),
            (ReqOptions::DNS2, OPT_SECONDARY_DNS, self.dns2),
            (ReqOptions::NBNS1, OPT_PRIMARY_NBNS, self.nbns1),
            (ReqOptions::NBNS2, OPT_SECONDARY_NBNS, self.nbns2),
        ];

        for (flag, opt, addr) in table {
            if self.req_options.contains(flag) {
                push_option(out, opt, &addr.octets());
            }
        }
    }

    fn reset_client_config_options(&mut self, out: &mut Vec<u8>) {
        self.req_options = ReqOptions::all();
        self.local = Ipv4Addr::UNSPECIFIED;
        self.peer = Ipv4Addr::UNSPECIFIED;
        self.dns1 = Ipv4Addr::UNSPECIFIED;
        self.dns2 = Ipv4Addr::UNSPECIFIED;
        self.nbns1 = Ipv4Addr::UNSPECIFIED;
        self.nbns2 = Ipv4Addr::UNSPECIFIED;

        self.generate_config_options(out);
    }

    fn reset_server_config_options(&mut self, out: &mut Vec<u8>) {
        if !self.local.is_unspecified() {
            self.req_options = ReqOptions::IPADDR;
        } else {
            self.req_options = ReqOptions::empty();
        }

        self.generate_config_options(out);
    }

    pub fn set_server_info(&mut self, peer: Ipv4Addr, dns1: Ipv4Addr, dns2: Ipv4Addr) {
        self.peer = peer;
        self.dns1 = dns1;
        self.dns2 = dns2;
    }

    fn server_rcr(&mut self, packet: &CpPacket) -> RcrResult {
        let mut nak_options = Vec::new();
        let mut rej_options = Vec::new();

        for (opt_type, data) in packet.options() {
            match opt_type {
                OPT_IP_ADDRESS => {
                    let addr = addr_of(data).unwrap_or(Ipv4Addr::UNSPECIFIED);
                    if addr != self.peer || addr.is_unspecified() {
                        push_option(&mut nak_options, opt_type, &self.peer.octets());
                    }
                }
                OPT_PRIMARY_DNS => {
                    let addr = addr_of(data).unwrap_or(Ipv4Addr::UNSPECIFIED);
                    if addr != self.dns1 || addr.is_unspecified() {
                        push_option(&mut nak_options, opt_type, &self.dns1.octets());
                    }
                }
                OPT_SECONDARY_DNS => {
                    let addr = addr_of(data).unwrap_or(Ipv4Addr::UNSPECIFIED);
                    if addr != self.dns2 || addr.is_unspecified() {
                        push_option(&mut nak_options, opt_type, &self.dns2.octets());
                    }
                }
                _ => push_option(&mut rej_options, opt_type, data),
            }
        }

        if !rej_options.is_empty() {
            RcrResult::Reject(rej_options)
        } else if !nak_options.is_empty() {
            RcrResult::Nak(nak_options)
        } else {
            RcrResult::Accept
        }
    }

    fn client_rcr(&mut self, packet: &CpPacket) -> RcrResult {
        let mut rej_options = Vec::new();

        for (opt_type, data) in packet.options() {
            let acceptable = match opt_type {
                OPT_IP_ADDRESS => {
                    let addr = addr_of(data).unwrap_or(Ipv4Addr::UNSPECIFIED);
                    self.peer = addr;

                    // A zero address means the peer expects us to assign
                    // its address, which we cannot do.
                    !addr.is_unspecified()
                }
                _ => false,
            };

            if !acceptable {
                push_option(&mut rej_options, opt_type, data);
            }
        }

        if !rej_options.is_empty() {
            RcrResult::Reject(rej_options)
        } else {
            RcrResult::Accept
        }
    }
}

impl CpDriver for Ipcp {
    const PROTO: u16 = super::IPCP_PROTOCOL;
    const NAME: &'static str = "ipcp";
    const SUPPORTED_CODES: u16 = code_mask(&[
        CODE_CONFIGURE_REQUEST,
        CODE_CONFIGURE_ACK,
        CODE_CONFIGURE_NAK,
        CODE_CONFIGURE_REJECT,
        CODE_TERMINATE_REQUEST,
        CODE_TERMINATE_ACK,
        CODE_CODE_REJECT,
    ]);

    fn this_layer_up(&mut self, ctx: &mut CpContext) {
        ctx.link.push(LinkEvent::IpcpUp {
            local: self.local,
            peer: self.peer,
            dns1: self.dns1,
            dns2: self.dns2,
        });
    }

    fn this_layer_down(&mut self, ctx: &mut CpContext) {
        if self.is_server {
            self.reset_server_config_options(ctx.local_options);
        } else {
            self.reset_client_config_options(ctx.local_options);
        }

        ctx.link.push(LinkEvent::IpcpDown);
    }

    fn this_layer_finished(&mut self, ctx: &mut CpContext) {
        ctx.link.push(LinkEvent::IpcpFinished);
    }

    fn rca(&mut self, packet: &CpPacket, _ctx: &mut CpContext) {
        if self.is_server {
            return;
        }

        for (opt_type, data) in packet.options() {
            let Some(addr) = addr_of(data) else { continue };

            match opt_type {
                OPT_IP_ADDRESS => self.local = addr,
                OPT_PRIMARY_DNS => self.dns1 = addr,
                OPT_SECONDARY_DNS => self.dns2 = addr,
                OPT_PRIMARY_NBNS => self.nbns1 = addr,
                OPT_SECONDARY_NBNS => self.nbns2 = addr,
                _ => {}
            }
        }
    }

    fn rcn_nak(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        if self.is_server {
            return;
        }

        for (opt_type, data) in packet.options() {
            let Some(addr) = addr_of(data) else { continue };

            match opt_type {
                OPT_IP_ADDRESS => {
                    self.req_options |= ReqOptions::IPADDR;
                    self.local = addr;
                }
                OPT_PRIMARY_DNS => {
                    self.req_options |= ReqOptions::DNS1;
                    self.dns1 = addr;
                }
                OPT_SECONDARY_DNS => {
                    self.req_options |= ReqOptions::DNS2;
                    self.dns2 = addr;
                }
                OPT_PRIMARY_NBNS => {
                    self.req_options |= ReqOptions::NBNS1;
                    self.nbns1 = addr;
                }
                OPT_SECONDARY_NBNS => {
                    self.req_options |= ReqOptions::NBNS2;
                    self.nbns2 = addr;
                }
                _ => {}
            }
        }

        self.generate_config_options(ctx.local_options);
    }

    fn rcn_rej(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        for (opt_type, _) in packet.options() {
            match opt_type {
                OPT_IP_ADDRESS => self.req_options.remove(ReqOptions::IPADDR),
                OPT_PRIMARY_DNS => self.req_options.remove(ReqOptions::DNS1),
                OPT_SECONDARY_DNS => self.req_options.remove(ReqOptions::DNS2),
                OPT_PRIMARY_NBNS => self.req_options.remove(ReqOptions::NBNS1),
                OPT_SECONDARY_NBNS => self.req_options.remove(ReqOptions::NBNS2),
                _ => {}
            }
        }

        self.generate_config_options(ctx.local_options);
    }

    fn rcr(&mut self, packet: &CpPacket, _ctx: &mut CpContext) -> RcrResult {
        if self.is_server {
            self.server_rcr(packet)
        } else {
            self.client_rcr(packet)
        }
    }
}

/// Creates the IPCP machine. A server supplies its own address here and
/// the peer-facing info via [`Ipcp::set_server_info`].
pub fn new_ipcp(is_server: bool, local: Ipv4Addr) -> Pppcp<Ipcp> {
    let mut ipcp = Ipcp {
        req_options: ReqOptions::empty(),
        is_server,
        local,
        peer: Ipv4Addr::UNSPECIFIED,
        dns1: Ipv4Addr::UNSPECIFIED,
        dns2: Ipv4Addr::UNSPECIFIED,
        nbns1: Ipv4Addr::UNSPECIFIED,
        nbns2: Ipv4Addr::UNSPECIFIED,
    };

    let mut options = Vec::new();
    if is_server {
        ipcp.reset_server_config_options(&mut options);
    } else {
        ipcp.reset_client_config_options(&mut options);
    }

    let mut pppcp = Pppcp::new(ipcp, false, MAX_IPCP_FAILURE);
    pppcp.set_local_options(options);
    pppcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppp::cp::State;
    use std::time::Instant;

    fn request(id: u8, options: &[u8]) -> Vec<u8> {
        let mut pkt = vec![CODE_CONFIGURE_REQUEST, id, 0, 0];
        pkt.extend_from_slice(options);
        let len = pkt.len() as u16;
        pkt[2..4].copy_from_slice(&len.to_be_bytes());
        pkt
    }

    #[test]
    fn client_requests_all_five_zeroed() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(false, Ipv4Addr::UNSPECIFIED);
        ipcp.signal_open(now);
        ipcp.signal_up(now);

        let out = ipcp.take_output();
        let opts = &out[0][4..];

        for opt in [
            OPT_IP_ADDRESS,
            OPT_PRIMARY_DNS,
            OPT_SECONDARY_DNS,
            OPT_PRIMARY_NBNS,
            OPT_SECONDARY_NBNS,
        ] {
            assert!(
                opts.windows(6).any(|w| w == [opt, 6, 0, 0, 0, 0]),
                "option {opt} missing"
            );
        }
    }

    #[test]
    fn client_absorbs_nak_values() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(false, Ipv4Addr::UNSPECIFIED);
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        let id = ipcp.take_output()[0][1];

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_IP_ADDRESS, &[10, 0, 0, 2]);
        push_option(&mut opts, OPT_PRIMARY_DNS, &[8, 8, 8, 8]);

        let mut nak = vec![crate::ppp::cp::CODE_CONFIGURE_NAK, id, 0, 0];
        nak.extend_from_slice(&opts);
        let len = nak.len() as u16;
        nak[2..4].copy_from_slice(&len.to_be_bytes());

        ipcp.process_packet(&nak, now);

        let out = ipcp.take_output();
        let opts = &out[0][4..];
        assert!(opts.windows(6).any(|w| w == [OPT_IP_ADDRESS, 6, 10, 0, 0, 2]));
        assert!(opts.windows(6).any(|w| w == [OPT_PRIMARY_DNS, 6, 8, 8, 8, 8]));
    }

    #[test]
    fn client_drops_rejected_options() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(false, Ipv4Addr::UNSPECIFIED);
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        let id = ipcp.take_output()[0][1];

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_PRIMARY_NBNS, &[0, 0, 0, 0]);
        push_option(&mut opts, OPT_SECONDARY_NBNS, &[0, 0, 0, 0]);

        let mut rej = vec![CODE_CONFIGURE_REJECT, id, 0, 0];
        rej.extend_from_slice(&opts);
        let len = rej.len() as u16;
        rej[2..4].copy_from_slice(&len.to_be_bytes());

        ipcp.process_packet(&rej, now);

        let out = ipcp.take_output();
        let opts = &out[0][4..];
        assert!(!opts.iter().any(|&b| b == OPT_PRIMARY_NBNS));
        assert!(opts.windows(2).any(|w| w[0] == OPT_IP_ADDRESS));
    }

    #[test]
    fn client_rejects_zero_peer_address() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(false, Ipv4Addr::UNSPECIFIED);
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        ipcp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_IP_ADDRESS, &[0, 0, 0, 0]);
        let req = request(5, &opts);

        ipcp.process_packet(&req, now);

        let out = ipcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REJECT);
    }

    #[test]
    fn server_naks_wrong_peer_address() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(true, Ipv4Addr::new(192, 168, 1, 1));
        ipcp.driver_mut().set_server_info(
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(10, 0, 0, 53),
            Ipv4Addr::new(10, 0, 0, 54),
        );
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        ipcp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_IP_ADDRESS, &[0, 0, 0, 0]);
        let req = request(1, &opts);
        ipcp.process_packet(&req, now);

        let out = ipcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_NAK);
        assert_eq!(&out[0][4..], &[OPT_IP_ADDRESS, 6, 192, 168, 1, 2]);
    }

    #[test]
    fn server_rejects_unknown_options() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(true, Ipv4Addr::new(192, 168, 1, 1));
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        ipcp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, 2, &[0, 0x2d]); // VJ compression
        let req = request(1, &opts);
        ipcp.process_packet(&req, now);

        let out = ipcp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REJECT);
        assert_eq!(&out[0][4..], &[2, 4, 0, 0x2d]);
    }

    #[test]
    fn full_client_negotiation_reaches_opened() {
        let now = Instant::now();
        let mut ipcp = new_ipcp(false, Ipv4Addr::UNSPECIFIED);
        ipcp.signal_open(now);
        ipcp.signal_up(now);
        let out = ipcp.take_output();
        let id = out[0][1];
        let our_opts = out[0][4..].to_vec();

        // Peer acks our request verbatim.
        let mut ack = vec![CODE_CONFIGURE_ACK, id, 0, 0];
        ack.extend_from_slice(&our_opts);
        let len = ack.len() as u16;
        ack[2..4].copy_from_slice(&len.to_be_bytes());
        ipcp.process_packet(&ack, now);

        // Peer requests its own non-zero address.
        let mut opts = Vec::new();
        push_option(&mut opts, OPT_IP_ADDRESS, &[10, 0, 0, 1]);
        ipcp.process_packet(&request(3, &opts), now);

        assert_eq!(ipcp.state(), State::Opened);

        let events = ipcp.take_link_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::IpcpUp { peer, .. } if *peer == Ipv4Addr::new(10, 0, 0, 1))));
    }
}
