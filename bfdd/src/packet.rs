//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::State;
use bfdd_utils::bytes::TLS_BUF;
use bfdd_utils::crypto::CryptoAlgo;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use derive_new::new;
use enum_as_inner::EnumAsInner;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::auth::{self, AuthEncodeCtx};

//
// Generic BFD Control Packet Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       My Discriminator                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                      Your Discriminator                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Desired Min TX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                   Required Min RX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Required Min Echo RX Interval                 |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// An optional Authentication Section follows when the A bit is set.
//
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Packet {
    #[new(value = "1")]
    pub version: u8,
    pub diag: u8,
    pub state: State,
    pub flags: PacketFlags,
    pub detect_mult: u8,
    pub my_discr: u32,
    pub your_discr: u32,
    pub desired_min_tx: u32,
    pub req_min_rx: u32,
    pub req_min_echo_rx: u32,
    #[new(default)]
    pub auth: Option<PacketAuth>,
}

// BFD Authentication Section.
//
// The MAC of the cryptographic variants is computed over the entire packet
// with the digest field pre-filled with the key (null-padded to the digest
// size).
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PacketAuth {
    Simple {
        key_id: u8,
        password: Bytes,
    },
    CryptoSeq {
        auth_type: AuthenticationType,
        key_id: u8,
        seq: u32,
        digest: Bytes,
    },
}

// BFD Diagnostic Codes.
//
// IANA registry:
// https://www.iana.org/assignments/bfd-parameters/bfd-parameters.xhtml#bfd-parameters-1
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DiagnosticCode {
    Nothing = 0,
    TimeExpired = 1,
    EchoFailed = 2,
    NbrDown = 3,
    FwdPlaneReset = 4,
    PathDown = 5,
    ConcatPathDown = 6,
    AdminDown = 7,
    RevConcatPathDown = 8,
    MisConnectivity = 9,
}

// BFD Authentication Types.
//
// IANA registry:
// https://www.iana.org/assignments/bfd-parameters/bfd-parameters.xhtml#bfd-parameters-2
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AuthenticationType {
    SimplePassword = 1,
    KeyedMd5 = 2,
    MeticulousKeyedMd5 = 3,
    KeyedSha1 = 4,
    MeticulousKeyedSha1 = 5,
}

// BFD packet flags.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PacketFlags: u8 {
        const P = 1 << 5;
        const F = 1 << 4;
        const C = 1 << 3;
        const A = 1 << 2;
        const D = 1 << 1;
        const M = 1 << 0;
    }
}

// BFD decode errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    IncompletePacket,
    InvalidVersion(u8),
    InvalidPacketLength(u8),
    InvalidAuthenticationLength(u8),
    InvalidDetectMult(u8),
    InvalidMyDiscriminator(u32),
    InvalidFlags(PacketFlags),
    InvalidAuthenticationType(u8),
    ReadOutOfBounds,
}

// ===== impl Packet =====

impl Packet {
    pub const VERSION: u8 = 1;
    pub const MANDATORY_SECTION_LEN: u8 = 24;
    pub const AUTH_HDR_LEN: u8 = 8;

    // Encodes BFD packet into a bytes buffer.
    //
    // When an authentication context is given, the corresponding
    // Authentication Section is appended and the A bit is set.
    pub fn encode(&self, auth: Option<&AuthEncodeCtx<'_>>) -> BytesMut {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            let mut flags = self.flags;
            if auth.is_some() {
                flags.insert(PacketFlags::A);
            }

            buf.put_u8((self.version << 5) | self.diag);
            buf.put_u8(((self.state as u8) << 6) | flags.bits());
            buf.put_u8(self.detect_mult);
            // The length will be initialized later.
            buf.put_u8(0);
            buf.put_u32(self.my_discr);
            buf.put_u32(self.your_discr);
            buf.put_u32(self.desired_min_tx);
            buf.put_u32(self.req_min_rx);
            buf.put_u32(self.req_min_echo_rx);

            // Optional authentication section.
            if let Some(auth) = auth {
                match auth.auth_type {
                    AuthenticationType::SimplePassword => {
                        let password = &auth.key.string;
                        buf.put_u8(auth.auth_type as u8);
                        buf.put_u8(3 + password.len() as u8);
                        buf.put_u8(auth.key.id);
                        buf.put_slice(password);

                        // Initialize packet length.
                        buf[3] = buf.len() as u8;
                    }
                    AuthenticationType::KeyedMd5
                    | AuthenticationType::MeticulousKeyedMd5
                    | AuthenticationType::KeyedSha1
                    | AuthenticationType::MeticulousKeyedSha1 => {
                        let algo = auth.auth_type.algo();
                        let digest_size = algo.digest_size() as usize;
                        buf.put_u8(auth.auth_type as u8);
                        buf.put_u8(Self::AUTH_HDR_LEN + algo.digest_size());
                        buf.put_u8(auth.key.id);
                        buf.put_u8(0);
                        buf.put_u32(auth.seq);

                        // Fill the digest field with the null-padded key
                        // before computing the MAC over the whole packet.
                        let mut key = auth.key.string.clone();
                        key.resize(digest_size, 0);
                        buf.put_slice(&key);
                        buf[3] = buf.len() as u8;
                        let digest = auth::message_digest(&buf, algo);
                        let offset = buf.len() - digest_size;
                        buf[offset..].copy_from_slice(&digest);
                    }
                }
            } else {
                // Initialize packet length.
                buf[3] = buf.len() as u8;
            }

            buf.clone()
        })
    }

    // Decodes BFD packet from a bytes buffer.
    //
    // The authentication section is parsed structurally only. Verifying the
    // password or MAC requires the per-session key material and happens at a
    // later stage.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(data);

        // Validate the packet length.
        if data.len() < Self::MANDATORY_SECTION_LEN as _ {
            return Err(DecodeError::IncompletePacket);
        }

        let first_byte = buf.try_get_u8()?;
        let sec_byte = buf.try_get_u8()?;
        let version = first_byte >> 5;
        if version != Self::VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let diag = first_byte & 0x1F;
        let state = State::from_u8(sec_byte >> 6).unwrap();
        let flags = PacketFlags::from_bits_truncate(sec_byte & 0x3F);
        let detect_mult = buf.try_get_u8()?;
        let length = buf.try_get_u8()?;
        if flags.contains(PacketFlags::A) {
            if length < Self::MANDATORY_SECTION_LEN + 2 {
                return Err(DecodeError::InvalidPacketLength(length));
            }
        } else if length < Self::MANDATORY_SECTION_LEN {
            return Err(DecodeError::InvalidPacketLength(length));
        }
        if length as usize > data.len() {
            return Err(DecodeError::InvalidPacketLength(length));
        }
        if detect_mult == 0 {
            return Err(DecodeError::InvalidDetectMult(detect_mult));
        }
        if flags.contains(PacketFlags::M) {
            return Err(DecodeError::InvalidFlags(flags));
        }
        let my_discr = buf.try_get_u32()?;
        if my_discr == 0 {
            return Err(DecodeError::InvalidMyDiscriminator(my_discr));
        }
        let your_discr = buf.try_get_u32()?;
        let desired_min_tx = buf.try_get_u32()?;
        let req_min_rx = buf.try_get_u32()?;
        let req_min_echo_rx = buf.try_get_u32()?;

        // Optional authentication section.
        let mut auth = None;
        if flags.contains(PacketFlags::A) {
            let auth_type = buf.try_get_u8()?;
            let auth_len = buf.try_get_u8()?;
            if Self::MANDATORY_SECTION_LEN as usize + auth_len as usize
                != length as usize
            {
                return Err(DecodeError::InvalidAuthenticationLength(auth_len));
            }
            let Some(auth_type) = AuthenticationType::from_u8(auth_type) else {
                return Err(DecodeError::InvalidAuthenticationType(auth_type));
            };
            let key_id = buf.try_get_u8()?;
            match auth_type {
                AuthenticationType::SimplePassword => {
                    if auth_len < 4 || auth_len > 19 {
                        return Err(DecodeError::InvalidAuthenticationLength(
                            auth_len,
                        ));
                    }
                    let password = buf.copy_to_bytes(auth_len as usize - 3);
                    auth = Some(PacketAuth::Simple { key_id, password });
                }
                AuthenticationType::KeyedMd5
                | AuthenticationType::MeticulousKeyedMd5
                | AuthenticationType::KeyedSha1
                | AuthenticationType::MeticulousKeyedSha1 => {
                    let digest_size = auth_type.algo().digest_size();
                    if auth_len != Self::AUTH_HDR_LEN + digest_size {
                        return Err(DecodeError::InvalidAuthenticationLength(
                            auth_len,
                        ));
                    }
                    let _reserved = buf.try_get_u8()?;
                    let seq = buf.try_get_u32()?;
                    let digest = buf.copy_to_bytes(digest_size as usize);
                    auth = Some(PacketAuth::CryptoSeq {
                        auth_type,
                        key_id,
                        seq,
                        digest,
                    });
                }
            }
        }
        let packet = Packet {
            version,
            diag,
            state,
            flags,
            detect_mult,
            my_discr,
            your_discr,
            desired_min_tx,
            req_min_rx,
            req_min_echo_rx,
            auth,
        };

        Ok(packet)
    }
}

// ===== impl PacketAuth =====

impl PacketAuth {
    pub fn auth_type(&self) -> AuthenticationType {
        match self {
            PacketAuth::Simple { .. } => AuthenticationType::SimplePassword,
            PacketAuth::CryptoSeq { auth_type, .. } => *auth_type,
        }
    }

    pub fn key_id(&self) -> u8 {
        match self {
            PacketAuth::Simple { key_id, .. }
            | PacketAuth::CryptoSeq { key_id, .. } => *key_id,
        }
    }
}

// ===== impl DiagnosticCode =====

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticCode::Nothing => write!(f, "None"),
            DiagnosticCode::TimeExpired => write!(f, "Time expired"),
            DiagnosticCode::EchoFailed => write!(f, "Echo failed"),
            DiagnosticCode::NbrDown => write!(f, "Neighbor down"),
            DiagnosticCode::FwdPlaneReset => write!(f, "Fwd plane reset"),
            DiagnosticCode::PathDown => write!(f, "Path down"),
            DiagnosticCode::ConcatPathDown => write!(f, "Concat path down"),
            DiagnosticCode::AdminDown => write!(f, "Admin down"),
            DiagnosticCode::RevConcatPathDown => {
                write!(f, "Rev concat path down")
            }
            DiagnosticCode::MisConnectivity => write!(f, "Misconnectivity"),
        }
    }
}

// ===== impl AuthenticationType =====

impl AuthenticationType {
    // Returns the digest algorithm of the authentication type.
    pub fn algo(&self) -> CryptoAlgo {
        match self {
            AuthenticationType::SimplePassword => CryptoAlgo::ClearText,
            AuthenticationType::KeyedMd5
            | AuthenticationType::MeticulousKeyedMd5 => CryptoAlgo::Md5,
            AuthenticationType::KeyedSha1
            | AuthenticationType::MeticulousKeyedSha1 => CryptoAlgo::Sha1,
        }
    }

    // Returns whether the authentication type requires a strictly
    // monotonically increasing sequence number.
    pub fn is_meticulous(&self) -> bool {
        matches!(
            self,
            AuthenticationType::MeticulousKeyedMd5
                | AuthenticationType::MeticulousKeyedSha1
        )
    }
}

impl std::fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthenticationType::SimplePassword => write!(f, "Simple"),
            AuthenticationType::KeyedMd5 => write!(f, "Keyed MD5"),
            AuthenticationType::MeticulousKeyedMd5 => {
                write!(f, "Meticulous keyed MD5")
            }
            AuthenticationType::KeyedSha1 => write!(f, "Keyed SHA1"),
            AuthenticationType::MeticulousKeyedSha1 => {
                write!(f, "Meticulous keyed SHA1")
            }
        }
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::IncompletePacket => {
                write!(f, "Incomplete packet")
            }
            DecodeError::InvalidVersion(version) => {
                write!(f, "Invalid BFD version: {version}")
            }
            DecodeError::InvalidPacketLength(len) => {
                write!(f, "Invalid packet length: {len}")
            }
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            DecodeError::InvalidDetectMult(detect_mult) => {
                write!(f, "Invalid Detect Mult: {detect_mult}")
            }
            DecodeError::InvalidMyDiscriminator(my_discr) => {
                write!(f, "Invalid My Discriminator: {my_discr}")
            }
            DecodeError::InvalidFlags(flags) => {
                write!(f, "Invalid Flags: {flags:?}")
            }
            DecodeError::InvalidAuthenticationType(auth_type) => {
                write!(f, "Invalid Authentication Type: {auth_type}")
            }
            DecodeError::InvalidAuthenticationLength(auth_len) => {
                write!(f, "Invalid Authentication Length: {auth_len}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}
