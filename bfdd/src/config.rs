//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::Arc;

use bfdd_utils::keychain::Keychain;
use serde::{Deserialize, Serialize};

use crate::neighbor::NeighborCfg;
use crate::packet::AuthenticationType;

// Default session intervals (microseconds) and multiplier.
pub const DFLT_MIN_RX_INT: u32 = 10_000;
pub const DFLT_MIN_TX_INT: u32 = 100_000;
pub const DFLT_IDLE_TX_INT: u32 = 1_000_000;
pub const DFLT_MULTIPLIER: u8 = 5;

// Engine-level configuration.
//
// The `accept_*`, `strict_bind` and `zero_udp6_checksum_rx` options control
// socket setup and request admission and cannot be changed without an engine
// restart.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct EngineCfg {
    pub vrf: Option<String>,
    pub accept_ipv4: bool,
    pub accept_ipv6: bool,
    pub accept_direct: bool,
    pub accept_multihop: bool,
    pub strict_bind: bool,
    pub zero_udp6_checksum_rx: bool,
    // Session defaults, used when no per-interface (or multihop) block
    // matches.
    pub default: IfaceCfg,
    // Per-interface configuration, keyed by interface name.
    pub interfaces: BTreeMap<String, IfaceCfg>,
    // Configuration applied to multihop sessions.
    pub multihop: Option<IfaceCfg>,
    // Statically configured neighbors.
    pub neighbors: Vec<NeighborCfg>,
}

// Per-interface session configuration.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct IfaceCfg {
    pub min_rx_int: u32,
    pub min_tx_int: u32,
    pub idle_tx_int: u32,
    pub multiplier: u8,
    pub passive: bool,
    pub auth: Option<SessionAuth>,
    pub tx_ttl: Option<u8>,
    pub rx_ttl: Option<u8>,
}

// Per-request session options. Unset fields fall back to the interface
// configuration.
#[derive(Clone, Debug, Default, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SessionOptions {
    pub min_rx_int: Option<u32>,
    pub min_tx_int: Option<u32>,
    pub idle_tx_int: Option<u32>,
    pub multiplier: Option<u8>,
    pub passive: Option<bool>,
    pub auth: Option<SessionAuth>,
    pub rx_ttl: Option<u8>,
}

// Effective session configuration after merging the request options with the
// interface configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct SessionCfg {
    pub min_rx_int: u32,
    pub min_tx_int: u32,
    pub idle_tx_int: u32,
    pub multiplier: u8,
    pub passive: bool,
    pub auth: Option<SessionAuth>,
    pub rx_ttl: Option<u8>,
}

// Session authentication configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct SessionAuth {
    pub auth_type: AuthenticationType,
    pub keychain: Arc<Keychain>,
}

// ===== impl EngineCfg =====

impl EngineCfg {
    // Returns the interface configuration matching the given interface name,
    // the multihop block for sessions without an interface, or the engine
    // defaults.
    pub(crate) fn find_iface_config(&self, ifname: Option<&str>) -> &IfaceCfg {
        match ifname {
            Some(ifname) => {
                self.interfaces.get(ifname).unwrap_or(&self.default)
            }
            None => self.multihop.as_ref().unwrap_or(&self.default),
        }
    }

    // Checks whether the configuration can be changed without restarting the
    // engine.
    pub fn is_compatible(&self, new: &EngineCfg) -> bool {
        self.accept_ipv4 == new.accept_ipv4
            && self.accept_ipv6 == new.accept_ipv6
            && self.accept_direct == new.accept_direct
            && self.accept_multihop == new.accept_multihop
            && self.strict_bind == new.strict_bind
            && self.zero_udp6_checksum_rx == new.zero_udp6_checksum_rx
    }
}

impl Default for EngineCfg {
    fn default() -> EngineCfg {
        EngineCfg {
            vrf: None,
            accept_ipv4: true,
            accept_ipv6: true,
            accept_direct: true,
            accept_multihop: true,
            strict_bind: false,
            zero_udp6_checksum_rx: false,
            default: Default::default(),
            interfaces: Default::default(),
            multihop: None,
            neighbors: Default::default(),
        }
    }
}

// ===== impl IfaceCfg =====

impl Default for IfaceCfg {
    fn default() -> IfaceCfg {
        IfaceCfg {
            min_rx_int: DFLT_MIN_RX_INT,
            min_tx_int: DFLT_MIN_TX_INT,
            idle_tx_int: DFLT_IDLE_TX_INT,
            multiplier: DFLT_MULTIPLIER,
            passive: false,
            auth: None,
            tx_ttl: None,
            rx_ttl: None,
        }
    }
}

// ===== impl SessionAuth =====

impl PartialEq for SessionAuth {
    fn eq(&self, other: &SessionAuth) -> bool {
        self.auth_type == other.auth_type
            && Arc::ptr_eq(&self.keychain, &other.keychain)
    }
}

// ===== global functions =====

// Merges the per-request options with the interface configuration,
// field by field.
pub(crate) fn merge_options(
    cf: &IfaceCfg,
    opts: &SessionOptions,
) -> SessionCfg {
    SessionCfg {
        min_rx_int: opts.min_rx_int.unwrap_or(cf.min_rx_int),
        min_tx_int: opts.min_tx_int.unwrap_or(cf.min_tx_int),
        idle_tx_int: opts.idle_tx_int.unwrap_or(cf.idle_tx_int),
        multiplier: opts.multiplier.unwrap_or(cf.multiplier),
        passive: opts.passive.unwrap_or(cf.passive),
        auth: opts.auth.clone().or_else(|| cf.auth.clone()),
        rx_ttl: opts.rx_ttl.or(cf.rx_ttl),
    }
}
