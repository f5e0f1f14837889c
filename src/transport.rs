use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::constants::IPV4_HEADER_LEN;

/// One datagram handed back by [`Transport::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    /// Number of ICMP bytes written into the caller's buffer.
    pub len: usize,
    /// TTL or hop limit observed on the datagram, 0 if unavailable.
    pub ttl: u8,
    /// Source address of the datagram.
    pub source: IpAddr,
}

/// The capability a session needs from the network.
///
/// A session owns its transport for the duration of a run; implementations
/// must tolerate `send` and `recv` being called from different tasks.
/// `recv` blocks for at most `read_deadline` and reports an elapsed
/// deadline as [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
pub trait Transport: Send + Sync {
    fn send(&self, packet: &[u8], dst: &SocketAddr) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8], read_deadline: Duration) -> io::Result<Inbound>;
}

/// The four combinations of address family and privilege, named after the
/// conventional network strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Ipv4Raw,
    Ipv4Datagram,
    Ipv6Raw,
    Ipv6Datagram,
}

impl Network {
    pub fn for_target(ipv4: bool, privileged: bool) -> Self {
        match (ipv4, privileged) {
            (true, true) => Self::Ipv4Raw,
            (true, false) => Self::Ipv4Datagram,
            (false, true) => Self::Ipv6Raw,
            (false, false) => Self::Ipv6Datagram,
        }
    }

    pub fn is_ipv4(self) -> bool {
        matches!(self, Self::Ipv4Raw | Self::Ipv4Datagram)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ipv4Raw => "ip4:icmp",
            Self::Ipv4Datagram => "udp4",
            Self::Ipv6Raw => "ip6:ipv6-icmp",
            Self::Ipv6Datagram => "udp6",
        };
        f.write_str(name)
    }
}

/// A [`Transport`] over an ICMP socket: raw for privileged sessions,
/// datagram-oriented otherwise.
#[derive(Debug)]
pub struct IcmpTransport {
    socket: Socket,
    network: Network,
}

impl IcmpTransport {
    /// Opens the socket for `network` and applies the outbound TTL or hop
    /// limit. Opening a raw network requires elevated privileges.
    pub fn open(network: Network, ttl: u32) -> io::Result<Self> {
        let socket = match network {
            Network::Ipv4Raw => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?,
            Network::Ipv4Datagram => Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?,
            Network::Ipv6Raw => Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?,
            Network::Ipv6Datagram => Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))?,
        };
        if network.is_ipv4() {
            socket.set_ttl(ttl)?;
        } else {
            socket.set_unicast_hops_v6(ttl)?;
        }
        Ok(Self { socket, network })
    }
}

impl Transport for IcmpTransport {
    fn send(&self, packet: &[u8], dst: &SocketAddr) -> io::Result<usize> {
        self.socket.send_to(packet, &SockAddr::from(*dst))
    }

    fn recv(&self, buf: &mut [u8], read_deadline: Duration) -> io::Result<Inbound> {
        self.socket.set_read_timeout(Some(read_deadline))?;
        let mut raw = [MaybeUninit::<u8>::uninit(); 2048];
        let (len, addr) = self.socket.recv_from(&mut raw)?;
        // recv_from initialized the first `len` bytes.
        let datagram = unsafe { std::slice::from_raw_parts(raw.as_ptr().cast::<u8>(), len) };

        // A raw IPv4 socket hands over the IP header as well; skip it and
        // keep its TTL. Datagram and IPv6 sockets deliver bare ICMP.
        let (start, ttl) = match self.network {
            Network::Ipv4Raw if len > IPV4_HEADER_LEN => {
                let header_len = usize::from(datagram[0] & 0x0f) * 4;
                if (IPV4_HEADER_LEN..len).contains(&header_len) {
                    (header_len, datagram[8])
                } else {
                    (0, 0)
                }
            }
            _ => (0, 0),
        };

        let body = &datagram[start..];
        let copied = body.len().min(buf.len());
        buf[..copied].copy_from_slice(&body[..copied]);
        let source = addr
            .as_socket()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |socket| socket.ip());
        Ok(Inbound {
            len: copied,
            ttl,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_selection_matches_family_and_privilege() {
        assert_eq!(Network::for_target(true, true), Network::Ipv4Raw);
        assert_eq!(Network::for_target(true, false), Network::Ipv4Datagram);
        assert_eq!(Network::for_target(false, true), Network::Ipv6Raw);
        assert_eq!(Network::for_target(false, false), Network::Ipv6Datagram);
    }

    #[test]
    fn network_names_follow_convention() {
        assert_eq!(Network::Ipv4Raw.to_string(), "ip4:icmp");
        assert_eq!(Network::Ipv4Datagram.to_string(), "udp4");
        assert_eq!(Network::Ipv6Raw.to_string(), "ip6:ipv6-icmp");
        assert_eq!(Network::Ipv6Datagram.to_string(), "udp6");
    }
}
