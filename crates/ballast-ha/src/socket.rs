//! Raw VRRP socket
//!
//! Protocol-112 raw socket joined to the VRRP multicast group. Requires
//! CAP_NET_RAW. Receive validates the outer TTL/hop limit: RFC 5798
//! demands advertisements arrive undecremented (255), which proves the
//! sender is on the local link. IPv4 raw sockets deliver the IP header,
//! so the TTL is read from it; IPv6 sockets use the hop-limit ancillary
//! data instead.

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::packet::{VRRP_MCAST_V4, VRRP_MCAST_V6, VRRP_PROTOCOL, VRRP_TTL};
use crate::Result;

/// A received advertisement payload with its outer-header metadata
#[derive(Debug, Clone)]
pub struct ReceivedAdvert {
    pub payload: Vec<u8>,
    pub src: IpAddr,
    pub ttl: u8,
}

pub struct VrrpSocket {
    fd: AsyncFd<Socket>,
    local: IpAddr,
    dst: IpAddr,
}

impl VrrpSocket {
    /// Multicast destination for this node's address family.
    pub fn multicast_addr(local: IpAddr) -> IpAddr {
        match local {
            IpAddr::V4(_) => VRRP_MCAST_V4.parse().unwrap(),
            IpAddr::V6(_) => VRRP_MCAST_V6.parse().unwrap(),
        }
    }

    pub fn open(local: IpAddr, interface: &str) -> Result<Self> {
        let socket = match local {
            IpAddr::V4(local_v4) => {
                let socket = Socket::new(
                    Domain::IPV4,
                    Type::RAW,
                    Some(Protocol::from(VRRP_PROTOCOL)),
                )?;
                socket.set_ttl(VRRP_TTL as u32)?;
                socket.set_multicast_ttl_v4(VRRP_TTL as u32)?;
                socket.set_multicast_if_v4(&local_v4)?;
                socket.join_multicast_v4(&VRRP_MCAST_V4.parse().unwrap(), &local_v4)?;
                socket
            }
            IpAddr::V6(_) => {
                let index = nix::net::if_::if_nametoindex(interface)
                    .map_err(|err| io::Error::other(err))?;
                let socket = Socket::new(
                    Domain::IPV6,
                    Type::RAW,
                    Some(Protocol::from(VRRP_PROTOCOL)),
                )?;
                socket.set_unicast_hops_v6(VRRP_TTL as u32)?;
                socket.set_multicast_hops_v6(VRRP_TTL as u32)?;
                socket.set_multicast_if_v6(index)?;
                socket.join_multicast_v6(&VRRP_MCAST_V6.parse().unwrap(), index)?;
                nix::sys::socket::setsockopt(
                    &socket,
                    nix::sys::socket::sockopt::Ipv6RecvHopLimit,
                    &true,
                )
                .map_err(|err| io::Error::other(err))?;
                socket
            }
        };
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
            local,
            dst: Self::multicast_addr(local),
        })
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    pub fn destination(&self) -> IpAddr {
        self.dst
    }

    /// Transmit one advertisement payload to the multicast group.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let dst = SocketAddr::new(self.dst, 0).into();
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(payload, &dst)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one advertisement. Packets arriving with a decremented
    /// TTL/hop limit are surfaced with their actual value; the caller
    /// discards anything below 255.
    pub async fn recv(&self) -> Result<ReceivedAdvert> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_one(inner.get_ref(), self.local)) {
                Ok(result) => match result? {
                    Some(advert) => return Ok(advert),
                    None => continue,
                },
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_one(socket: &Socket, local: IpAddr) -> io::Result<Option<ReceivedAdvert>> {
    let mut buf = [0u8; 512];
    let (len, hop_limit, src) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buf = nix::cmsg_space!(nix::libc::c_int);
        let msg = recvmsg::<SockaddrStorage>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let mut hop_limit: Option<u8> = None;
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::Ipv6HopLimit(hops) = cmsg {
                    hop_limit = Some(hops as u8);
                }
            }
        }
        let src = msg.address.as_ref().and_then(sockaddr_ip);
        (msg.bytes, hop_limit, src)
    };
    let data = &buf[..len];

    match local {
        IpAddr::V4(_) => {
            // Raw IPv4 sockets deliver the IP header; pull TTL and source
            // out of it and strip it off.
            if len < 20 {
                debug!(len, "Runt IPv4 datagram");
                return Ok(None);
            }
            let ihl = usize::from(data[0] & 0x0f) * 4;
            if ihl < 20 || len < ihl {
                debug!(ihl, len, "Bad IPv4 header length");
                return Ok(None);
            }
            let ttl = data[8];
            let src = IpAddr::from([data[12], data[13], data[14], data[15]]);
            Ok(Some(ReceivedAdvert {
                payload: data[ihl..].to_vec(),
                src,
                ttl,
            }))
        }
        IpAddr::V6(_) => {
            let Some(src) = src else {
                debug!("IPv6 datagram without source address");
                return Ok(None);
            };
            let Some(ttl) = hop_limit else {
                debug!("IPv6 datagram without hop-limit ancillary data");
                return Ok(None);
            };
            Ok(Some(ReceivedAdvert {
                payload: data.to_vec(),
                src,
                ttl,
            }))
        }
    }
}

fn sockaddr_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(v4.ip()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Some(IpAddr::V6(v6.ip()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_destination_per_family() {
        assert_eq!(
            VrrpSocket::multicast_addr("192.0.2.10".parse().unwrap()),
            "224.0.0.18".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            VrrpSocket::multicast_addr("fe80::1".parse().unwrap()),
            "ff02::12".parse::<IpAddr>().unwrap()
        );
    }
}
