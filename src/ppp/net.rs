//! Kernel TUN plumbing for the PPP network phase (Linux).
//!
//! Owns the TUN descriptor, copies IP packets between the PPP info field
//! and the kernel, and issues the MTU ioctl. The descriptor is read
//! non-blocking; the composition root polls it alongside the modem
//! channel.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use byteorder::{BigEndian, ByteOrder};

use crate::transport::Channel;

const MAX_PACKET: usize = 1500;

/// A TUN device created with `IFF_TUN | IFF_NO_PI`, or adopted from a
/// caller-supplied descriptor.
pub struct Tun {
    file: File,
    name: String,
}

fn ifreq_name(ifr: &libc::ifreq) -> String {
    let cstr = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) };
    cstr.to_string_lossy().into_owned()
}

impl Tun {
    /// Opens `/dev/net/tun` and creates an interface named after
    /// `pattern` (`ppp%d`, `gprs%d`).
    pub fn create(pattern: &str) -> io::Result<Tun> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(pattern.bytes()) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Tun {
            name: ifreq_name(&ifr),
            file,
        })
    }

    /// Adopts a pre-opened TUN descriptor; the caller cedes ownership.
    pub fn adopt(fd: RawFd) -> io::Result<Tun> {
        let file = unsafe { File::from_raw_fd(fd) };

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags >= 0 {
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::ioctl(fd, libc::TUNGETIFF, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Tun {
            name: ifreq_name(&ifr),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Sets the interface MTU via `SIOCSIFMTU`.
    pub fn set_mtu(&self, mtu: u16) -> bool {
        if mtu as usize > MAX_PACKET {
            return false;
        }

        let sk = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sk < 0 {
            return false;
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(self.name.bytes()) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_mtu = mtu as libc::c_int;

        let ret = unsafe { libc::ioctl(sk, libc::SIOCSIFMTU, &ifr) };
        unsafe { libc::close(sk) };

        ret >= 0
    }
}

impl Channel for Tun {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
}

/// Bounds an IPv4 packet by the total-length field in its header, so a
/// short frame never writes stale trailing bytes to the kernel.
pub(crate) fn ipv4_bounded_len(packet: &[u8]) -> Option<usize> {
    if packet.len() < 4 {
        return None;
    }

    let total = BigEndian::read_u16(&packet[2..4]) as usize;
    Some(total.min(packet.len()))
}

/// The PPP-facing wrapper: a TUN device plus the reusable transmit buffer
/// pre-seeded with the address/control and IPv4 protocol fields.
pub struct PppNet {
    tun: Tun,
    suspended: bool,
}

impl PppNet {
    pub fn create() -> io::Result<PppNet> {
        Ok(PppNet {
            tun: Tun::create("ppp%d")?,
            suspended: false,
        })
    }

    pub fn adopt(fd: RawFd) -> io::Result<PppNet> {
        Ok(PppNet {
            tun: Tun::adopt(fd)?,
            suspended: false,
        })
    }

    pub fn interface_name(&self) -> &str {
        self.tun.name()
    }

    pub fn fd(&self) -> RawFd {
        self.tun.fd()
    }

    pub fn set_mtu(&mut self, mtu: u16) -> bool {
        self.tun.set_mtu(mtu)
    }

    /// IP packet from the link towards the kernel.
    pub fn process_packet(&mut self, packet: &[u8]) {
        let Some(len) = ipv4_bounded_len(packet) else {
            return;
        };

        let _ = self.tun.send(&packet[..len]);
    }

    /// Drains the packets queued on the kernel side, each at most `mtu`
    /// bytes.
    pub fn read_packets(&mut self, mtu: u16) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if self.suspended {
            return packets;
        }

        let mut buf = vec![0u8; (mtu as usize).min(MAX_PACKET)];

        loop {
            match self.tun.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => packets.push(buf[..n].to_vec()),
                Err(_) => break,
            }
        }

        packets
    }

    /// Detaches the kernel side without dropping the descriptor.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_length_bounds_short_frames() {
        // Header claims 100 bytes but only 24 arrived.
        let mut packet = vec![0x45, 0x00, 0x00, 100];
        packet.resize(24, 0);
        assert_eq!(ipv4_bounded_len(&packet), Some(24));
    }

    #[test]
    fn ipv4_length_trims_padding() {
        // 20-byte packet padded out to 32 by the link layer.
        let mut packet = vec![0x45, 0x00, 0x00, 20];
        packet.resize(32, 0);
        assert_eq!(ipv4_bounded_len(&packet), Some(20));
    }

    #[test]
    fn runt_frames_are_dropped() {
        assert_eq!(ipv4_bounded_len(&[0x45, 0x00]), None);
    }
}
