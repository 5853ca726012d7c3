//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod auth;
pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod interface;
pub mod master;
pub mod neighbor;
pub mod network;
pub mod notify;
pub mod packet;
pub mod requests;
pub mod session;
pub mod tasks;
