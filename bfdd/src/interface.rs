//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;

use bfdd_utils::Sender;
use bfdd_utils::bfd::{IfaceId, PathType};
use bfdd_utils::ip::IpAddrExt;
use bfdd_utils::socket::{TTL_MAX, UdpSocket};
use bfdd_utils::task::Task;
use generational_arena::{Arena, Index};

use crate::config::{EngineCfg, IfaceCfg};
use crate::error::IoError;
use crate::tasks::messages::input::UdpRxPacketMsg;
use crate::{network, tasks};

pub type InterfaceIndex = Index;

// A `(local address, interface)` socket binding, shared by all sessions with
// an equal tuple.
//
// Bindings are created on demand when the first session needs one and freed
// when the reference count drops to zero.
#[derive(Debug)]
pub struct Interface {
    pub local: IpAddr,
    pub ifindex: u32,
    pub ifname: Option<String>,
    pub config: IfaceCfg,
    pub socket_tx: Option<Arc<UdpSocket>>,
    // Strict-bind Rx task, owning its dedicated socket.
    _rx_task: Option<Task<()>>,
    pub refcnt: u32,
    // Marked during reconfiguration when the interface configuration
    // changed; sessions on marked bindings get re-merged.
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct Interfaces {
    arena: Arena<Interface>,
}

// ===== impl Interfaces =====

impl Interfaces {
    // Returns a binding for the given `(local address, interface)` tuple,
    // either by bumping the reference count of an existing one or by
    // creating it.
    pub(crate) fn get_iface(
        &mut self,
        local: IpAddr,
        iface: Option<&IfaceId>,
        config: &EngineCfg,
        udp_packet_rxp: &Sender<UdpRxPacketMsg>,
    ) -> InterfaceIndex {
        let ifindex = iface.map(|iface| iface.ifindex).unwrap_or(0);

        if let Some((iface_idx, iface)) = self
            .arena
            .iter_mut()
            .find(|(_, ifa)| ifa.local == local && ifa.ifindex == ifindex)
        {
            iface.refcnt += 1;
            return iface_idx;
        }

        let ifname = iface.map(|iface| iface.name.clone());
        let iface_cfg = config.find_iface_config(ifname.as_deref()).clone();
        let path_type = if ifindex != 0 {
            PathType::IpSingleHop
        } else {
            PathType::IpMultihop
        };

        // Single-hop packets always leave with the maximum TTL (GTSM);
        // multihop sessions may configure a lower one.
        let ttl = match path_type {
            PathType::IpSingleHop => TTL_MAX,
            PathType::IpMultihop => iface_cfg.tx_ttl.unwrap_or(TTL_MAX),
        };
        let af = local.address_family();
        let socket_tx =
            match network::socket_tx(ifname.as_deref(), af, local, ttl) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(error) => {
                    IoError::UdpSocketError(error).log();
                    None
                }
            };

        // In strict-bind mode each binding gets a dedicated Rx socket.
        let mut rx_task = None;
        if config.strict_bind {
            match network::socket_rx_bound(
                local,
                ifname.as_deref(),
                path_type,
                config.zero_udp6_checksum_rx,
            ) {
                Ok(socket) => {
                    rx_task =
                        Some(tasks::udp_rx(socket, path_type, udp_packet_rxp));
                }
                Err(error) => {
                    IoError::UdpSocketError(error).log();
                }
            }
        }

        self.arena.insert(Interface {
            local,
            ifindex,
            ifname,
            config: iface_cfg,
            socket_tx,
            _rx_task: rx_task,
            refcnt: 1,
            changed: false,
        })
    }

    // Releases a binding, freeing its sockets when the last reference is
    // gone.
    pub(crate) fn free_iface(&mut self, iface_idx: InterfaceIndex) {
        let iface = &mut self.arena[iface_idx];
        iface.refcnt -= 1;
        if iface.refcnt == 0 {
            self.arena.remove(iface_idx);
        }
    }

    // Returns an iterator visiting all bindings mutably.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (InterfaceIndex, &'_ mut Interface)> + '_ {
        self.arena.iter_mut()
    }
}

impl std::ops::Index<InterfaceIndex> for Interfaces {
    type Output = Interface;

    fn index(&self, index: InterfaceIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<InterfaceIndex> for Interfaces {
    fn index_mut(&mut self, index: InterfaceIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
