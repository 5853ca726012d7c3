//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::Key;
use derive_new::new;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::config::SessionAuth;
use crate::packet::{AuthenticationType, Packet, PacketAuth};

// Context used to generate the authentication section of outgoing packets.
#[derive(Clone, Copy, Debug, new)]
pub struct AuthEncodeCtx<'a> {
    // Authentication type.
    pub auth_type: AuthenticationType,
    // Authentication key.
    pub key: &'a Key,
    // Authentication sequence number.
    pub seq: u32,
}

// BFD authentication errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AuthError {
    MissingSection,
    UnexpectedSection,
    TypeMismatch,
    KeyNotFound(u8),
    BadPassword,
    BadDigest,
    SequenceOutOfWindow(u32),
}

// ===== global functions =====

// Computes the message digest of the given data.
pub fn message_digest(data: &[u8], algo: CryptoAlgo) -> Vec<u8> {
    match algo {
        CryptoAlgo::Md5 => Md5::digest(data).to_vec(),
        CryptoAlgo::Sha1 => Sha1::digest(data).to_vec(),
        CryptoAlgo::ClearText => unreachable!(),
    }
}

// Checks whether a received Cryptographic Sequence Number falls within the
// acceptance window.
//
// The first sequence number received from a peer is always accepted. From
// then on, the received value must be within half the sequence space ahead
// of the last one, strictly ahead for the meticulous variants.
pub fn seq_window_accept(
    last: Option<u32>,
    received: u32,
    meticulous: bool,
) -> bool {
    match last {
        None => true,
        Some(last) => {
            let diff = received.wrapping_sub(last);
            let min = if meticulous { 1 } else { 0 };
            diff >= min && diff < (1 << 31)
        }
    }
}

// Verifies the authentication section of a received packet.
//
// `data` holds the raw packet bytes as received from the network. On success,
// returns the sequence number to latch as the last one received from the
// peer, if any.
pub fn verify(
    packet: &Packet,
    data: &[u8],
    auth: &SessionAuth,
    last_seq: Option<u32>,
) -> Result<Option<u32>, AuthError> {
    let Some(packet_auth) = &packet.auth else {
        return Err(AuthError::MissingSection);
    };
    if packet_auth.auth_type() != auth.auth_type {
        return Err(AuthError::TypeMismatch);
    }
    let key_id = packet_auth.key_id();
    let key = auth
        .keychain
        .key_lookup_accept(key_id)
        .ok_or(AuthError::KeyNotFound(key_id))?;

    match packet_auth {
        PacketAuth::Simple { password, .. } => {
            if key.string.as_slice() != password.as_ref() {
                return Err(AuthError::BadPassword);
            }
            Ok(None)
        }
        PacketAuth::CryptoSeq { seq, digest, .. } => {
            if !seq_window_accept(last_seq, *seq, auth.auth_type.is_meticulous())
            {
                return Err(AuthError::SequenceOutOfWindow(*seq));
            }

            // Recompute the MAC with the digest field replaced by the
            // null-padded key.
            let algo = auth.auth_type.algo();
            let digest_size = algo.digest_size() as usize;
            let plen = (Packet::MANDATORY_SECTION_LEN + Packet::AUTH_HDR_LEN)
                as usize
                + digest_size;
            if data.len() < plen {
                return Err(AuthError::BadDigest);
            }
            let mut buf = data[..plen].to_vec();
            let mut key = key.string.clone();
            key.resize(digest_size, 0);
            buf[plen - digest_size..].copy_from_slice(&key);
            if message_digest(&buf, algo).as_slice() != digest.as_ref() {
                return Err(AuthError::BadDigest);
            }
            Ok(Some(*seq))
        }
    }
}

// ===== impl AuthError =====

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingSection => {
                write!(f, "missing authentication section")
            }
            AuthError::UnexpectedSection => {
                write!(f, "unexpected authentication section")
            }
            AuthError::TypeMismatch => {
                write!(f, "authentication type mismatch")
            }
            AuthError::KeyNotFound(key_id) => {
                write!(f, "no usable key with ID {key_id}")
            }
            AuthError::BadPassword => {
                write!(f, "password mismatch")
            }
            AuthError::BadDigest => {
                write!(f, "digest mismatch")
            }
            AuthError::SequenceOutOfWindow(seq) => {
                write!(f, "sequence number outside acceptance window: {seq}")
            }
        }
    }
}

impl std::error::Error for AuthError {}
