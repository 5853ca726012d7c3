//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use derive_new::new;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// BFD path type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PathType {
    IpSingleHop,
    IpMultihop,
}

// BFD session key.
//
// An interface index of zero denotes a multihop session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct SessionKey {
    pub addr: IpAddr,
    pub ifindex: u32,
}

// BFD session state.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    AdminDown = 0,
    Down = 1,
    Init = 2,
    Up = 3,
}

// Network interface reference used when creating single-hop sessions.
#[derive(Clone, Debug, Eq, Hash, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct IfaceId {
    pub ifindex: u32,
    pub name: String,
}

// ===== impl PathType =====

impl std::fmt::Display for PathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathType::IpSingleHop => write!(f, "Direct"),
            PathType::IpMultihop => write!(f, "Multihop"),
        }
    }
}

// ===== impl SessionKey =====

impl SessionKey {
    pub fn path_type(&self) -> PathType {
        if self.ifindex != 0 {
            PathType::IpSingleHop
        } else {
            PathType::IpMultihop
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ifindex != 0 {
            write!(f, "{}%{}", self.addr, self.ifindex)
        } else {
            write!(f, "{}", self.addr)
        }
    }
}

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::AdminDown => write!(f, "AdminDown"),
            State::Down => write!(f, "Down"),
            State::Init => write!(f, "Init"),
            State::Up => write!(f, "Up"),
        }
    }
}
