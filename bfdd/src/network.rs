//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::io::IoSliceMut;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
};
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};

use bfdd_utils::Sender;
use bfdd_utils::bfd::PathType;
use bfdd_utils::ip::{AddressFamily, IpAddrExt};
use bfdd_utils::socket::{SocketExt, TTL_MAX, UdpSocket, UdpSocketExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
#[cfg(not(feature = "testing"))]
use {
    nix::sys::socket::{self, ControlMessageOwned},
    tokio::sync::mpsc::error::SendError,
};

use crate::auth::AuthEncodeCtx;
use crate::config::SessionAuth;
use crate::error::{Error, IoError};
use crate::packet::Packet;
use crate::tasks::messages::input::UdpRxPacketMsg;

pub const PORT_DST_SINGLE_HOP: u16 = 3784;
pub const PORT_DST_MULTIHOP: u16 = 4784;
pub const PORT_SRC_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

// Ancillary data about a received packet.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub enum PacketInfo {
    IpSingleHop {
        src: SocketAddr,
        ifindex: u32,
        ttl: u8,
    },
    IpMultihop {
        src: IpAddr,
        dst: IpAddr,
        ttl: u8,
    },
}

// Creates a shared UDP Rx socket for the given path type and address family.
pub(crate) fn socket_rx(
    path_type: PathType,
    af: AddressFamily,
    zero_udp6_checksum_rx: bool,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        let port = match path_type {
            PathType::IpSingleHop => PORT_DST_SINGLE_HOP,
            PathType::IpMultihop => PORT_DST_MULTIHOP,
        };
        let addr = IpAddr::unspecified(af);
        let sockaddr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        socket_rx_options(&socket, path_type, af, zero_udp6_checksum_rx)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(UdpSocket {})
    }
}

// Creates a UDP Rx socket strictly bound to the given local address and
// interface.
pub(crate) fn socket_rx_bound(
    local: IpAddr,
    ifname: Option<&str>,
    path_type: PathType,
    zero_udp6_checksum_rx: bool,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        let port = match path_type {
            PathType::IpSingleHop => PORT_DST_SINGLE_HOP,
            PathType::IpMultihop => PORT_DST_MULTIHOP,
        };
        let sockaddr = SocketAddr::from((local, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        if let Some(ifname) = ifname {
            socket.bind_device(Some(ifname.as_bytes()))?;
        }

        let af = local.address_family();
        socket_rx_options(&socket, path_type, af, zero_udp6_checksum_rx)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(UdpSocket {})
    }
}

#[cfg(not(feature = "testing"))]
fn socket_rx_options(
    socket: &UdpSocket,
    path_type: PathType,
    af: AddressFamily,
    zero_udp6_checksum_rx: bool,
) -> Result<(), std::io::Error> {
    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_pktinfo(true)?;
            socket.set_ipv4_recvttl(true)?;
            if path_type == PathType::IpSingleHop {
                // GTSM: the kernel drops packets below the maximum TTL.
                socket.set_ipv4_minttl(TTL_MAX)?;
            }
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_pktinfo(true)?;
            socket.set_ipv6_recvhoplimit(true)?;
            if path_type == PathType::IpSingleHop {
                socket.set_ipv6_min_hopcount(TTL_MAX)?;
            }
            if zero_udp6_checksum_rx {
                socket.set_udp_no_check6_rx(true)?;
            }
        }
    }

    Ok(())
}

// Creates the UDP Tx socket used by an interface binding.
pub(crate) fn socket_tx(
    ifname: Option<&str>,
    af: AddressFamily,
    addr: IpAddr,
    ttl: u8,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        // The source port MUST be in the range 49152 through 65535, and the
        // same source port MUST be used for all BFD Control packets
        // associated with a particular session. Use the first port of the
        // range for all sessions; the remote peer matches incoming packets
        // to sessions regardless of the source port number.
        let port = *PORT_SRC_RANGE.start();
        let sockaddr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        // Bind to interface.
        if let Some(ifname) = ifname {
            socket.bind_device(Some(ifname.as_bytes()))?;
        }

        // Set socket options.
        match af {
            AddressFamily::Ipv4 => {
                socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv4_ttl(ttl)?;
            }
            AddressFamily::Ipv6 => {
                socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv6_unicast_hops(ttl)?;
            }
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(UdpSocket {})
    }
}

// Encodes and sends a single BFD control packet.
#[cfg(not(feature = "testing"))]
pub(crate) async fn send_packet(
    socket: Arc<UdpSocket>,
    sockaddr: SocketAddr,
    packet: Packet,
    auth: Option<SessionAuth>,
    seq: u32,
    tx_packet_count: Arc<AtomicU64>,
    tx_error_count: Arc<AtomicU64>,
) {
    // Encode packet, appending the authentication section if configured.
    let buf = match &auth {
        Some(auth) => {
            let Some(key) = auth.keychain.key_lookup_send() else {
                IoError::UdpSendError(std::io::Error::other(
                    "no usable authentication key",
                ))
                .log();
                tx_error_count.fetch_add(1, atomic::Ordering::Relaxed);
                return;
            };
            let ctx = AuthEncodeCtx::new(auth.auth_type, key, seq);
            packet.encode(Some(&ctx))
        }
        None => packet.encode(None),
    };

    // Send packet.
    match socket.send_to(&buf, sockaddr).await {
        Ok(_) => {
            tx_packet_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
        Err(error) => {
            IoError::UdpSendError(error).log();
            tx_error_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(not(feature = "testing"))]
fn get_packet_src(sa: Option<&socket::SockaddrStorage>) -> Option<SocketAddr> {
    sa.and_then(|sa| {
        sa.as_sockaddr_in()
            .map(|sa| SocketAddrV4::from(*sa).into())
            .or_else(|| {
                sa.as_sockaddr_in6()
                    .map(|sa| SocketAddrV6::from(*sa).into())
            })
    })
}

// Packet metadata delivered through control messages.
#[cfg(not(feature = "testing"))]
#[derive(Default)]
struct PacketAncillary {
    dst: Option<IpAddr>,
    ifindex: Option<u32>,
    ttl: Option<u8>,
}

#[cfg(not(feature = "testing"))]
fn get_packet_ancillary(cmsgs: socket::CmsgIterator<'_>) -> PacketAncillary {
    let mut data = PacketAncillary::default();
    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                data.dst = Some(
                    Ipv4Addr::from(pktinfo.ipi_spec_dst.s_addr.to_be()).into(),
                );
                data.ifindex = Some(pktinfo.ipi_ifindex as u32);
            }
            ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                data.dst =
                    Some(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr).into());
                data.ifindex = Some(pktinfo.ipi6_ifindex);
            }
            ControlMessageOwned::Ipv4Ttl(ttl) => {
                data.ttl = Some(ttl as u8);
            }
            ControlMessageOwned::Ipv6HopLimit(hoplimit) => {
                data.ttl = Some(hoplimit as u8);
            }
            _ => {}
        }
    }

    data
}

// Receives packets from the given socket, decoding them and relaying them to
// the session task.
#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<UdpSocket>,
    path_type: PathType,
    udp_packet_rxp: Sender<UdpRxPacketMsg>,
) -> Result<(), SendError<UdpRxPacketMsg>> {
    let mut buf = [0; 1024];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in6_pktinfo, libc::c_int);

    loop {
        // Receive data from the network.
        match socket
            .async_io(tokio::io::Interest::READABLE, || {
                match socket::recvmsg::<socket::SockaddrStorage>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        // Retrieve source address and ancillary data.
                        let src = get_packet_src(msg.address.as_ref());
                        let ancillary =
                            get_packet_ancillary(msg.cmsgs().unwrap());
                        Ok((src, ancillary, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, ancillary, bytes)) => {
                let src = match src {
                    Some(addr) => addr,
                    None => {
                        IoError::UdpRecvMissingSourceAddr.log();
                        continue;
                    }
                };
                let (dst, ifindex, ttl) = match (
                    ancillary.dst,
                    ancillary.ifindex,
                    ancillary.ttl,
                ) {
                    (Some(dst), Some(ifindex), Some(ttl)) => {
                        (dst, ifindex, ttl)
                    }
                    _ => {
                        IoError::UdpRecvMissingAncillaryData.log();
                        continue;
                    }
                };

                // Validate packet's source address.
                if !src.ip().is_usable() {
                    Error::UdpInvalidSourceAddr(src.ip()).log();
                    continue;
                }

                // Decode packet, discarding malformed ones.
                let data = Bytes::copy_from_slice(&iov[0].deref()[0..bytes]);
                let packet = match Packet::decode(&data) {
                    Ok(packet) => packet,
                    Err(_) => continue,
                };

                // Notify the session task about the received packet.
                let packet_info = match path_type {
                    PathType::IpSingleHop => PacketInfo::IpSingleHop {
                        src,
                        ifindex,
                        ttl,
                    },
                    PathType::IpMultihop => PacketInfo::IpMultihop {
                        src: src.ip(),
                        dst,
                        ttl,
                    },
                };
                let msg = UdpRxPacketMsg {
                    packet_info,
                    packet,
                    data,
                };
                udp_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::UdpRecvError(error).log();
            }
        }
    }
}
