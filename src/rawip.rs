//! Raw-IP bridge: a byte-for-byte pump between a modem channel and a TUN
//! interface, for modems that deliver IP frames without PPP framing.
//!
//! No parsing, no state machine; two directions of ring-buffered copying.
//! Packet hex dumps are emitted at trace level when the
//! `MODEMLINK_IP_DEBUG` environment variable is set.

use crate::transport::{Channel, Endpoint, ReadOutcome};

/// The generic two-endpoint pump. On Linux, [`RawIp::open`] creates the
/// `gprs%d` TUN side itself; any pair of byte channels works for loopback
/// setups.
pub struct RawIp<M: Channel, T: Channel> {
    io: Endpoint<M>,
    tun_io: Option<Endpoint<T>>,
    ifname: Option<String>,
    debug: bool,
}

impl<M: Channel, T: Channel> RawIp<M, T> {
    pub fn new(channel: M) -> Self {
        Self {
            io: Endpoint::new(channel),
            tun_io: None,
            ifname: None,
            debug: std::env::var_os("MODEMLINK_IP_DEBUG").is_some(),
        }
    }

    /// Starts bridging towards a caller-supplied channel.
    pub fn open_with(&mut self, tun: T, ifname: Option<String>) {
        self.tun_io = Some(Endpoint::new(tun));
        self.ifname = ifname;
    }

    /// Stops bridging and drops the TUN side.
    pub fn shutdown(&mut self) {
        self.tun_io = None;
        self.ifname = None;
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.ifname.as_deref()
    }

    fn dump(&self, dir: &str, data: &[u8]) {
        if self.debug {
            log::trace!("rawip {dir} {:02x?}", data);
        }
    }

    /// Modem bytes towards the TUN. Returns `false` on modem disconnect.
    pub fn process_modem_readable(&mut self) -> bool {
        match self.io.process_readable() {
            ReadOutcome::Disconnected => return false,
            ReadOutcome::Idle => return true,
            ReadOutcome::Data => {}
        }

        let Some(tun_io) = self.tun_io.as_mut() else {
            return true;
        };

        loop {
            let span = self.io.rbuf().readable_slice().to_vec();
            if span.is_empty() {
                break;
            }

            let written = tun_io.send(&span);
            if written == 0 {
                break;
            }

            if self.debug {
                log::trace!("rawip > {:02x?}", &span[..written]);
            }
            self.io.rbuf().drain(written);
        }

        true
    }

    /// TUN packets towards the modem.
    pub fn process_tun_readable(&mut self) -> bool {
        let Some(tun_io) = self.tun_io.as_mut() else {
            return true;
        };

        match tun_io.process_readable() {
            ReadOutcome::Disconnected => return false,
            ReadOutcome::Idle => return true,
            ReadOutcome::Data => {}
        }

        loop {
            let span = {
                let tun_io = self.tun_io.as_mut().expect("checked above");
                tun_io.rbuf().readable_slice().to_vec()
            };

            if span.is_empty() {
                break;
            }

            let written = self.io.send(&span);
            if written == 0 {
                break;
            }

            self.dump("<", &span[..written]);
            self.tun_io
                .as_mut()
                .expect("checked above")
                .rbuf()
                .drain(written);
        }

        true
    }
}

#[cfg(target_os = "linux")]
impl<M: Channel> RawIp<M, crate::ppp::net::Tun> {
    /// Creates a fresh `gprs%d` TUN interface and starts bridging.
    pub fn open(&mut self) -> std::io::Result<()> {
        let tun = crate::ppp::net::Tun::create("gprs%d")?;
        let name = tun.name().to_string();
        self.open_with(tun, Some(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemChannel;

    #[test]
    fn modem_bytes_reach_tun_side() {
        let (modem_a, mut modem_b) = MemChannel::pair();
        let (tun_a, mut tun_b) = MemChannel::pair();

        let mut bridge = RawIp::new(modem_a);
        bridge.open_with(tun_a, Some("gprs0".into()));

        let packet = [0x45u8, 0x00, 0x00, 0x14, 1, 2, 3, 4];
        modem_b.send(&packet).unwrap();

        assert!(bridge.process_modem_readable());

        let mut out = [0u8; 64];
        let n = tun_b.recv(&mut out).unwrap();
        assert_eq!(&out[..n], &packet);
    }

    #[test]
    fn tun_bytes_reach_modem_side() {
        let (modem_a, mut modem_b) = MemChannel::pair();
        let (tun_a, mut tun_b) = MemChannel::pair();

        let mut bridge = RawIp::new(modem_a);
        bridge.open_with(tun_a, None);

        let packet = [0x45u8, 0x00, 0x00, 0x1C, 9, 9, 9, 9];
        tun_b.send(&packet).unwrap();

        assert!(bridge.process_tun_readable());

        let mut out = [0u8; 64];
        let n = modem_b.recv(&mut out).unwrap();
        assert_eq!(&out[..n], &packet);
    }

    #[test]
    fn shutdown_stops_the_pump() {
        let (modem_a, mut modem_b) = MemChannel::pair();
        let (tun_a, mut tun_b) = MemChannel::pair();

        let mut bridge = RawIp::new(modem_a);
        bridge.open_with(tun_a, None);
        bridge.shutdown();

        modem_b.send(&[1, 2, 3]).unwrap();
        assert!(bridge.process_modem_readable());

        // Nothing crosses once the TUN side is gone.
        let mut out = [0u8; 8];
        assert!(tun_b.recv(&mut out).is_err());
    }

    #[test]
    fn modem_disconnect_is_reported() {
        let (modem_a, modem_b) = MemChannel::pair();
        let (tun_a, _tun_b) = MemChannel::pair();

        let mut bridge = RawIp::new(modem_a);
        bridge.open_with(tun_a, None);

        drop(modem_b);
        assert!(!bridge.process_modem_readable());
    }
}
