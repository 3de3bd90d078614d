//! IPv6CP (RFC 5072): a single option, the 64-bit interface identifier.

use super::cp::{
    code_mask, push_option, CpContext, CpDriver, CpPacket, LinkEvent, Pppcp, RcrResult,
    CODE_CODE_REJECT, CODE_CONFIGURE_ACK, CODE_CONFIGURE_NAK, CODE_CONFIGURE_REJECT,
    CODE_CONFIGURE_REQUEST, CODE_TERMINATE_ACK, CODE_TERMINATE_REQUEST,
};

use byteorder::{BigEndian, ByteOrder};

const OPT_INTERFACE_ID: u8 = 1;
const MAX_IPV6CP_FAILURE: u32 = 3;

fn iid_of(data: &[u8]) -> Option<u64> {
    if data.len() < 8 {
        return None;
    }
    Some(BigEndian::read_u64(data))
}

pub struct Ipv6cp {
    request_iid: bool,
    is_server: bool,
    local_iid: u64,
    peer_iid: u64,
}

impl Ipv6cp {
    fn generate_config_options(&self, out: &mut Vec<u8>) {
        out.clear();

        if self.request_iid {
            push_option(out, OPT_INTERFACE_ID, &self.local_iid.to_be_bytes());
        }
    }

    fn reset_config_options(&mut self, out: &mut Vec<u8>) {
        self.request_iid = true;
        self.generate_config_options(out);
    }

    fn server_rcr(&mut self, packet: &CpPacket) -> RcrResult {
        let mut nak_options = Vec::new();
        let mut rej_options = Vec::new();

        for (opt_type, data) in packet.options() {
            match opt_type {
                OPT_INTERFACE_ID => {
                    let iid = iid_of(data).unwrap_or(0);
                    if iid != self.peer_iid || iid == 0 {
                        push_option(
                            &mut nak_options,
                            opt_type,
                            &self.peer_iid.to_be_bytes(),
                        );
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
                OPT_INTERFACE_ID => {
                    let iid = iid_of(data).unwrap_or(0);
                    self.peer_iid = iid;
                    // A zero interface identifier is meaningless.
                    iid != 0
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

impl CpDriver for Ipv6cp {
    const PROTO: u16 = super::IPV6CP_PROTOCOL;
    const NAME: &'static str = "ipv6cp";
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
        ctx.link.push(LinkEvent::Ipv6cpUp {
            local_iid: self.local_iid,
            peer_iid: self.peer_iid,
        });
    }

    fn this_layer_down(&mut self, ctx: &mut CpContext) {
        self.reset_config_options(ctx.local_options);
    }

    fn rca(&mut self, packet: &CpPacket, _ctx: &mut CpContext) {
        if self.is_server {
            return;
        }

        for (opt_type, data) in packet.options() {
            if opt_type == OPT_INTERFACE_ID {
                if let Some(iid) = iid_of(data) {
                    self.local_iid = iid;
                }
            }
        }
    }

    fn rcn_nak(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        if self.is_server {
            return;
        }

        for (opt_type, data) in packet.options() {
            if opt_type == OPT_INTERFACE_ID {
                if let Some(iid) = iid_of(data) {
                    self.request_iid = true;
                    self.local_iid = iid;
                }
            }
        }

        self.generate_config_options(ctx.local_options);
    }

    fn rcn_rej(&mut self, packet: &CpPacket, ctx: &mut CpContext) {
        for (opt_type, _) in packet.options() {
            if opt_type == OPT_INTERFACE_ID {
                self.request_iid = false;
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

/// Creates the IPv6CP machine with the configured interface identifiers
/// (either may be zero when unknown).
pub fn new_ipv6cp(is_server: bool, local_iid: u64, peer_iid: u64) -> Pppcp<Ipv6cp> {
    let mut ipv6cp = Ipv6cp {
        request_iid: false,
        is_server,
        local_iid,
        peer_iid,
    };

    let mut options = Vec::new();
    ipv6cp.reset_config_options(&mut options);

    let mut pppcp = Pppcp::new(ipv6cp, false, MAX_IPV6CP_FAILURE);
    pppcp.set_local_options(options);
    pppcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn request(id: u8, options: &[u8]) -> Vec<u8> {
        let mut pkt = vec![CODE_CONFIGURE_REQUEST, id, 0, 0];
        pkt.extend_from_slice(options);
        let len = pkt.len() as u16;
        pkt[2..4].copy_from_slice(&len.to_be_bytes());
        pkt
    }

    #[test]
    fn client_requests_configured_iid() {
        let now = Instant::now();
        let mut cp = new_ipv6cp(false, 0x0001_0203_0405_0607, 0);
        cp.signal_open(now);
        cp.signal_up(now);

        let out = cp.take_output();
        assert_eq!(
            &out[0][4..],
            &[OPT_INTERFACE_ID, 10, 0, 1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn zero_interface_id_is_rejected() {
        let now = Instant::now();
        let mut cp = new_ipv6cp(false, 1, 0);
        cp.signal_open(now);
        cp.signal_up(now);
        cp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_INTERFACE_ID, &[0; 8]);
        cp.process_packet(&request(2, &opts), now);

        let out = cp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REJECT);
    }

    #[test]
    fn server_naks_mismatched_iid() {
        let now = Instant::now();
        let mut cp = new_ipv6cp(true, 0x10, 0x20);
        cp.signal_open(now);
        cp.signal_up(now);
        cp.take_output();

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_INTERFACE_ID, &0x99u64.to_be_bytes());
        cp.process_packet(&request(1, &opts), now);

        let out = cp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_NAK);
        assert_eq!(&out[0][6..], &0x20u64.to_be_bytes());
    }

    #[test]
    fn nak_absorbs_suggested_iid() {
        let now = Instant::now();
        let mut cp = new_ipv6cp(false, 0, 0);
        cp.signal_open(now);
        cp.signal_up(now);
        let id = cp.take_output()[0][1];

        let mut opts = Vec::new();
        push_option(&mut opts, OPT_INTERFACE_ID, &0xAAu64.to_be_bytes());

        let mut nak = vec![CODE_CONFIGURE_NAK, id, 0, 0];
        nak.extend_from_slice(&opts);
        let len = nak.len() as u16;
        nak[2..4].copy_from_slice(&len.to_be_bytes());
        cp.process_packet(&nak, now);

        let out = cp.take_output();
        assert_eq!(out[0][0], CODE_CONFIGURE_REQUEST);
        assert_eq!(&out[0][6..], &0xAAu64.to_be_bytes());
    }
}
