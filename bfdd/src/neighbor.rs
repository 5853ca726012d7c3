//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bfdd_utils::bfd::IfaceId;
use bfdd_utils::ip::IpAddrExt;
use derive_new::new;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::requests::{EngineId, ManagerInner, RequestId};

// A statically configured BFD neighbor.
//
// Multihop neighbors (no interface) produce a session subscription as soon
// as the owning engine starts. Single-hop neighbors wait until neighbor
// discovery reports the address reachable on the configured interface.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct NeighborCfg {
    pub addr: IpAddr,
    pub local: Option<IpAddr>,
    pub iface: Option<IfaceId>,
}

#[derive(Debug, new)]
pub(crate) struct NeighborState {
    pub(crate) cfg: NeighborCfg,
    #[new(default)]
    pub(crate) active: bool,
    #[new(default)]
    pub(crate) req: Option<RequestId>,
}

// ===== impl NeighborCfg =====

impl NeighborCfg {
    pub fn multihop(&self) -> bool {
        self.iface.is_none()
    }

    fn local_addr(&self) -> IpAddr {
        self.local
            .unwrap_or_else(|| IpAddr::unspecified(self.addr.address_family()))
    }
}

// ===== global functions =====

// Starts the engine's not-yet-active neighbors.
//
// Multihop neighbors get their subscription immediately; single-hop ones
// only register interest and wait for a reachability report.
pub(crate) fn start_neighbors(inner: &mut ManagerInner, engine_id: EngineId) {
    let Some(pos) =
        inner.engines.iter().position(|engine| engine.id == engine_id)
    else {
        return;
    };

    let pending = inner.engines[pos]
        .neighbors
        .iter()
        .enumerate()
        .filter(|(_, neighbor)| !neighbor.active)
        .map(|(nidx, _)| nidx)
        .collect::<Vec<_>>();

    for nidx in pending {
        let engine = &mut inner.engines[pos];
        engine.neighbors[nidx].active = true;
        let cfg = engine.neighbors[nidx].cfg.clone();
        let vrf = engine.config.vrf.clone();

        if !cfg.multihop() {
            debug!(addr = %cfg.addr, "waiting for neighbor to become reachable");
            continue;
        }

        let (req_id, _) = inner.add_request(
            cfg.addr,
            cfg.local_addr(),
            None,
            vrf,
            Default::default(),
            None,
        );
        inner.engines[pos].neighbors[nidx].req = Some(req_id);
    }
}

// Handles a reachability report from neighbor discovery, starting or
// stopping the subscriptions of matching single-hop neighbors.
pub(crate) fn neighbor_update(
    inner: &mut ManagerInner,
    addr: IpAddr,
    ifindex: u32,
    up: bool,
) {
    for eidx in 0..inner.engines.len() {
        for nidx in 0..inner.engines[eidx].neighbors.len() {
            let neighbor = &inner.engines[eidx].neighbors[nidx];
            if !neighbor.active {
                continue;
            }
            let Some(iface) = &neighbor.cfg.iface else {
                continue;
            };
            if neighbor.cfg.addr != addr || iface.ifindex != ifindex {
                continue;
            }

            let cfg = neighbor.cfg.clone();
            let req = neighbor.req;
            if up && req.is_none() {
                let vrf = inner.engines[eidx].config.vrf.clone();
                let (req_id, _) = inner.add_request(
                    addr,
                    cfg.local_addr(),
                    cfg.iface.clone(),
                    vrf,
                    Default::default(),
                    None,
                );
                inner.engines[eidx].neighbors[nidx].req = Some(req_id);
            } else if !up
                && let Some(req_id) = req
            {
                inner.engines[eidx].neighbors[nidx].req = None;
                inner.release_request(req_id);
            }
        }
    }
}

// Matches the engine's old neighbor list against the new configuration,
// carrying live subscriptions over on an exact match and starting or
// stopping the rest.
pub(crate) fn reconfigure_neighbors(
    inner: &mut ManagerInner,
    pos: usize,
    new_cfgs: Vec<NeighborCfg>,
) {
    let old = std::mem::take(&mut inner.engines[pos].neighbors);
    let mut new_states =
        new_cfgs.into_iter().map(NeighborState::new).collect::<Vec<_>>();

    let mut to_release = Vec::new();
    for old_state in old {
        match new_states
            .iter_mut()
            .find(|neighbor| neighbor.cfg == old_state.cfg)
        {
            Some(neighbor) => {
                neighbor.req = old_state.req;
                neighbor.active = old_state.active;
            }
            None => {
                if let Some(req_id) = old_state.req {
                    to_release.push(req_id);
                }
            }
        }
    }
    inner.engines[pos].neighbors = new_states;

    for req_id in to_release {
        inner.release_request(req_id);
    }

    // Start the neighbors added by the new configuration.
    let engine_id = inner.engines[pos].id;
    start_neighbors(inner, engine_id);
}
