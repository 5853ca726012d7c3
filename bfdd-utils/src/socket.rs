//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;

// Normal build: re-export standard socket types.
#[cfg(not(feature = "testing"))]
pub use {socket2::Socket, tokio::net::UdpSocket};

// Test build: export mock sockets.
#[cfg(feature = "testing")]
pub use crate::socket::mock::UdpSocket;

// Maximum TTL for IPv4 or Hop Limit for IPv6.
pub const TTL_MAX: u8 = 255;

// Useful type definition.
type Result<T> = std::io::Result<T>;

// Extension methods for all socket types.
pub trait SocketExt: Sized + AsRawFd {
    // Sets the value of the IP_TOS option for this socket.
    fn set_ipv4_tos(&self, tos: u8) -> Result<()> {
        let optval = tos as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IP_TTL option for this socket.
    fn set_ipv4_ttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TTL,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IP_MINTTL option for this socket.
    fn set_ipv4_minttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_MINTTL,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IP_RECVTTL option for this socket.
    fn set_ipv4_recvttl(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_TCLASS option for this socket.
    fn set_ipv6_tclass(&self, dscp: u8) -> Result<()> {
        let optval = dscp as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_TCLASS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_UNICAST_HOPS option for this socket.
    fn set_ipv6_unicast_hops(&self, hops: u8) -> Result<()> {
        let optval = hops as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_MINHOPCOUNT option for this socket.
    fn set_ipv6_min_hopcount(&self, hopcount: u8) -> Result<()> {
        let optval = hopcount as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_MINHOPCOUNT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_RECVHOPLIMIT option for this socket.
    fn set_ipv6_recvhoplimit(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the SO_BINDTODEVICE option for this socket.
    fn bind_device(&self, ifname: Option<&[u8]>) -> Result<()> {
        let (optval, optlen) = match ifname {
            Some(ifname) => (ifname.as_ptr(), ifname.len()),
            None => (std::ptr::null(), 0),
        };

        setsockopt(
            self,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            optval as *const libc::c_void,
            optlen as libc::socklen_t,
        )
    }
}

// Extension methods for UdpSocket.
pub trait UdpSocketExt: SocketExt {
    // Creates a UDP socket from the given address.
    //
    // This is the same as [`UdpSocket::bind`], except that the `SO_REUSEADDR`
    // option is set before binding.
    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket>;

    // Sets the value of the IP_PKTINFO option for this socket.
    fn set_ipv4_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_RECVPKTINFO option for this socket.
    fn set_ipv6_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // Sets the value of the UDP_NO_CHECK6_RX option for this socket.
    //
    // When enabled, incoming IPv6 UDP datagrams with a zero checksum are
    // accepted instead of dropped.
    fn set_udp_no_check6_rx(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::SOL_UDP,
            libc::UDP_NO_CHECK6_RX,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }
}

// ===== impl UdpSocket =====

#[cfg(not(feature = "testing"))]
impl SocketExt for UdpSocket {}

#[cfg(not(feature = "testing"))]
impl UdpSocketExt for UdpSocket {
    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket> {
        use socket2::{Domain, Type};

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }
}

// ===== helper functions =====

#[allow(unsafe_code)]
fn setsockopt<F: AsRawFd>(
    socket: &F,
    level: c_int,
    optname: c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(socket.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// ===== Mock sockets for unit testing =====

#[cfg(feature = "testing")]
pub mod mock {
    use std::net::SocketAddr;

    #[derive(Debug, Default)]
    pub struct UdpSocket {}

    impl UdpSocket {
        pub async fn send_to(
            &self,
            _buf: &[u8],
            _target: SocketAddr,
        ) -> std::io::Result<usize> {
            Ok(0)
        }
    }
}
