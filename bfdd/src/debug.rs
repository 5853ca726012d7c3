//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::{SessionKey, State};
use tracing::{debug, debug_span};

use crate::requests::RequestId;

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a SessionKey),
    SessionDelete(&'a SessionKey),
    SessionReconfigure(&'a SessionKey),
    RequestAttach(&'a SessionKey, RequestId),
    RequestDetach(&'a SessionKey, RequestId),
    FsmTransition(&'a SessionKey, State, State),
    DetectionTimeExpiry(&'a SessionKey),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(sess_key)
            | Debug::SessionDelete(sess_key)
            | Debug::SessionReconfigure(sess_key) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::RequestAttach(sess_key, req_id)
            | Debug::RequestDetach(sess_key, req_id) => {
                debug_span!("session", key = %sess_key, request = %req_id)
                    .in_scope(|| {
                        debug!("{}", self);
                    });
            }
            Debug::FsmTransition(sess_key, old_state, new_state) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!(?old_state, ?new_state, "{}", self);
                });
            }
            Debug::DetectionTimeExpiry(sess_key) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::SessionReconfigure(..) => {
                write!(f, "session reconfigured")
            }
            Debug::RequestAttach(..) => {
                write!(f, "request attached")
            }
            Debug::RequestDetach(..) => {
                write!(f, "request detached")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
        }
    }
}
