use std::{
    fs::{File, OpenOptions},
    io::{IoSlice, Read, Write},
    mem::size_of,
    os::fd::{AsRawFd, RawFd},
};

use ioctl_gen::{ioc, iow};
use libc::{__c_anonymous_ifr_ifru, ifreq, ioctl, IF_NAMESIZE};

use crate::{Error, Family};

/// Size of the per-packet family prefix (`struct tun_pi` on Linux, an
/// address-family word on BSD).
const PREFIX_LEN: usize = 4;

/// A TUN device in multi-family mode
pub struct Tun {
    /// Internal file descriptor for the TUN device
    fd: File,
    /// Device name
    name: String,
}

impl Tun {
    /// Opens a TUN device and attaches to it. A `%d` in the name lets the
    /// kernel pick a free index.
    #[cfg(target_os = "linux")]
    pub fn open(dev: &str) -> Result<Self, Error> {
        log::trace!("Opening /dev/net/tun");
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        // IFF_TUN without IFF_NO_PI: we want the family prefix on every packet
        let mut ifr = ifreq {
            ifr_name: padded_name(dev),
            ifr_ifru: __c_anonymous_ifr_ifru {
                ifru_flags: libc::IFF_TUN as i16,
            },
        };
        let rc = unsafe {
            ioctl(
                fd.as_raw_fd(),
                iow!('T', 202, size_of::<libc::c_int>()) as u64,
                &mut ifr,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // Read the name back; the kernel may have expanded a pattern
        let name = unsafe { std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::trace!("Attached TUN device: {}", name);

        Ok(Self { fd, name })
    }

    /// Opens a TUN device with the given name and attaches to it.
    #[cfg(target_os = "freebsd")]
    pub fn open(dev: &str) -> Result<Self, Error> {
        let path = format!("/dev/{dev}");
        log::trace!("Opening {}", path);
        let fd = OpenOptions::new().read(true).write(true).open(path)?;

        // Enable multi-AF mode so each packet carries its family word
        let mut multi_af: libc::c_int = 1;
        let rc = unsafe {
            ioctl(
                fd.as_raw_fd(),
                iow!('t', 96, size_of::<libc::c_int>()) as u64,
                &mut multi_af,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        log::info!("Multi-AF mode set on {}", dev);

        Ok(Self {
            fd,
            name: dev.to_string(),
        })
    }

    /// Get the name of the TUN device
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set or clear the persist flag, detaching the interface lifetime
    /// from this file descriptor.
    #[cfg(target_os = "linux")]
    pub fn set_persistent(&self, persistent: bool) -> Result<(), Error> {
        let rc = unsafe {
            ioctl(
                self.fd.as_raw_fd(),
                iow!('T', 203, size_of::<libc::c_int>()) as u64,
                libc::c_int::from(persistent),
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// On FreeBSD a tun device outlives its descriptor by default;
    /// clearing persistence destroys the interface.
    #[cfg(target_os = "freebsd")]
    pub fn set_persistent(&self, persistent: bool) -> Result<(), Error> {
        if persistent {
            return Ok(());
        }
        let sock = ControlSocket::open()?;
        let mut ifr = self.name_ifreq();
        let rc = unsafe {
            ioctl(
                sock.0,
                iow!('i', 121, size_of::<ifreq>()) as u64, // SIOCIFDESTROY
                &mut ifr,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Hand a persistent interface to an unprivileged owner.
    #[cfg(target_os = "linux")]
    pub fn set_owner(&self, uid: u32, gid: u32) -> Result<(), Error> {
        for (op, id) in [(204u32, uid), (206, gid)] {
            let rc = unsafe {
                ioctl(
                    self.fd.as_raw_fd(),
                    ioc!(1, 'T', op, size_of::<libc::c_int>()) as u64,
                    id as libc::c_int,
                )
            };
            if rc < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    #[cfg(target_os = "freebsd")]
    pub fn set_owner(&self, _uid: u32, _gid: u32) -> Result<(), Error> {
        Ok(())
    }

    /// Query the interface MTU from the kernel.
    #[allow(clippy::cast_sign_loss)]
    pub fn mtu(&self) -> Result<u32, Error> {
        let sock = ControlSocket::open()?;
        let mut ifr = self.name_ifreq();
        let rc = unsafe { ioctl(sock.0, libc::SIOCGIFMTU as u64, &mut ifr) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mtu = unsafe { ifr.ifr_ifru.ifru_mtu };
        Ok(mtu as u32)
    }

    /// Switch the descriptor to nonblocking mode.
    pub fn set_nonblocking(&self) -> Result<(), Error> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Read one datagram. Returns `Ok(None)` when the descriptor is
    /// nonblocking and no datagram is queued.
    pub fn recv<'a>(&self, buf: &'a mut [u8]) -> Result<Option<(Family, &'a [u8])>, Error> {
        let len = match (&self.fd).read(buf) {
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if len < PREFIX_LEN {
            return Err(Error::FrameTooShort(len));
        }
        let family = parse_prefix(&buf[..PREFIX_LEN])?;
        Ok(Some((family, &buf[PREFIX_LEN..len])))
    }

    /// Write one datagram with its family prefix.
    pub fn send(&self, family: Family, packet: &[u8]) -> Result<(), Error> {
        let prefix = build_prefix(family);
        let iov = [IoSlice::new(&prefix), IoSlice::new(packet)];
        let written = (&self.fd).write_vectored(&iov)?;
        if written != PREFIX_LEN + packet.len() {
            return Err(Error::ShortWrite {
                written,
                expected: PREFIX_LEN + packet.len(),
            });
        }
        Ok(())
    }

    fn name_ifreq(&self) -> ifreq {
        ifreq {
            ifr_name: padded_name(&self.name),
            ifr_ifru: __c_anonymous_ifr_ifru { ifru_mtu: 0 },
        }
    }
}

/// An interface name as a NUL-padded `ifr_name` buffer. Over-long names
/// are truncated, keeping the final NUL.
fn padded_name(name: &str) -> [libc::c_char; IF_NAMESIZE] {
    let mut buf = [0 as libc::c_char; IF_NAMESIZE];
    for (slot, byte) in buf.iter_mut().take(IF_NAMESIZE - 1).zip(name.as_bytes()) {
        *slot = *byte as libc::c_char;
    }
    buf
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Short-lived `AF_INET` datagram socket for interface ioctls.
struct ControlSocket(RawFd);

impl ControlSocket {
    fn open() -> Result<Self, Error> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self(fd))
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

#[cfg(target_os = "linux")]
fn parse_prefix(prefix: &[u8]) -> Result<Family, Error> {
    // struct tun_pi: u16 flags, u16 proto (network order EtherType)
    match u16::from_be_bytes([prefix[2], prefix[3]]) {
        0x0800 => Ok(Family::Ipv4),
        0x86dd => Ok(Family::Ipv6),
        other => Err(Error::UnknownFamily(u32::from(other))),
    }
}

#[cfg(target_os = "linux")]
fn build_prefix(family: Family) -> [u8; PREFIX_LEN] {
    let proto: u16 = match family {
        Family::Ipv4 => 0x0800,
        Family::Ipv6 => 0x86dd,
    };
    let proto = proto.to_be_bytes();
    [0, 0, proto[0], proto[1]]
}

#[cfg(target_os = "freebsd")]
fn parse_prefix(prefix: &[u8]) -> Result<Family, Error> {
    match u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) {
        af if af == libc::AF_INET as u32 => Ok(Family::Ipv4),
        af if af == libc::AF_INET6 as u32 => Ok(Family::Ipv6),
        other => Err(Error::UnknownFamily(other)),
    }
}

#[cfg(target_os = "freebsd")]
fn build_prefix(family: Family) -> [u8; PREFIX_LEN] {
    let af: u32 = match family {
        Family::Ipv4 => libc::AF_INET as u32,
        Family::Ipv6 => libc::AF_INET6 as u32,
    };
    af.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_prefix_round_trip() {
        for family in [Family::Ipv4, Family::Ipv6] {
            assert_eq!(parse_prefix(&build_prefix(family)).unwrap(), family);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_prefix_rejects_unknown_ethertype() {
        // 0x0806 is ARP, which never crosses a TUN device
        assert!(matches!(
            parse_prefix(&[0, 0, 0x08, 0x06]),
            Err(Error::UnknownFamily(0x0806))
        ));
    }
}
