//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::LazyLock as Lazy;

use bfdd::auth::{self, AuthEncodeCtx};
use bfdd::config::SessionAuth;
use bfdd::packet::{
    AuthenticationType, DecodeError, Packet, PacketAuth, PacketFlags,
};
use bfdd_utils::bfd::State;
use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::{Key, Keychain, KeychainKey};
use bytes::Bytes;

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DecodeError>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode(None);
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

fn test_keychain(algo: CryptoAlgo, secret: &[u8]) -> Arc<Keychain> {
    let mut keychain = Keychain::new("test".to_owned());
    let key = Key::new(1, algo, secret.to_vec());
    keychain.keys.insert(1, KeychainKey::new(key));
    Arc::new(keychain)
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
                0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
                0x00, 0x00, 0xc3, 0x50,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Up,
                flags: PacketFlags::empty(),
                detect_mult: 3,
                my_discr: 0x9fb205d6,
                your_discr: 0x4a2357dc,
                desired_min_tx: 300000,
                req_min_rx: 300000,
                req_min_echo_rx: 50000,
                auth: None,
            }),
        )
    });

static PACKET2: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x23, 0x62, 0x05, 0x18, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x01, 0x86, 0xa0, 0x00, 0x00, 0x27, 0x10,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: 3,
                state: State::Down,
                flags: PacketFlags::P | PacketFlags::D,
                detect_mult: 5,
                my_discr: 42,
                your_discr: 0,
                desired_min_tx: 100000,
                req_min_rx: 10000,
                req_min_echo_rx: 0,
                auth: None,
            }),
        )
    });

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_incomplete() {
    let (ref bytes, _) = *PACKET1;
    assert_eq!(
        Packet::decode(&bytes[..20]),
        Err(DecodeError::IncompletePacket)
    );
}

#[test]
fn test_decode_bad_version() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[0] = (3 << 5) | (bytes[0] & 0x1F);
    assert_eq!(Packet::decode(&bytes), Err(DecodeError::InvalidVersion(3)));
}

#[test]
fn test_decode_bad_detect_mult() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[2] = 0;
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidDetectMult(0))
    );
}

#[test]
fn test_decode_multipoint_flag() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[1] |= 0x01;
    assert!(matches!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidFlags(_))
    ));
}

#[test]
fn test_decode_zero_my_discr() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[4..8].copy_from_slice(&[0; 4]);
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidMyDiscriminator(0))
    );
}

#[test]
fn test_decode_bad_length() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[3] = 23;
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidPacketLength(23))
    );
}

#[test]
fn test_auth_simple_round_trip() {
    let (_, ref packet) = *PACKET1;
    let mut packet = packet.as_ref().unwrap().clone();
    packet.flags.insert(PacketFlags::A);

    let keychain = test_keychain(CryptoAlgo::ClearText, b"sekrit");
    let key = keychain.key_lookup_send().unwrap();
    let ctx =
        AuthEncodeCtx::new(AuthenticationType::SimplePassword, key, 0);
    let bytes = packet.encode(Some(&ctx));

    // Mandatory section plus the 3-byte authentication header and the
    // password.
    assert_eq!(bytes.len(), 24 + 3 + 6);
    assert_eq!(bytes[3] as usize, bytes.len());

    let decoded = Packet::decode(&bytes).unwrap();
    packet.auth = Some(PacketAuth::Simple {
        key_id: 1,
        password: Bytes::copy_from_slice(b"sekrit"),
    });
    assert_eq!(packet, decoded);

    // Verification succeeds with the right password and fails otherwise.
    let auth_cfg = SessionAuth {
        auth_type: AuthenticationType::SimplePassword,
        keychain: keychain.clone(),
    };
    assert_eq!(auth::verify(&decoded, &bytes, &auth_cfg, None), Ok(None));

    let bad_keychain = test_keychain(CryptoAlgo::ClearText, b"other");
    let bad_cfg = SessionAuth {
        auth_type: AuthenticationType::SimplePassword,
        keychain: bad_keychain,
    };
    assert_eq!(
        auth::verify(&decoded, &bytes, &bad_cfg, None),
        Err(auth::AuthError::BadPassword)
    );
}

#[test]
fn test_auth_sha1_round_trip() {
    let (_, ref packet) = *PACKET1;
    let mut packet = packet.as_ref().unwrap().clone();
    packet.flags.insert(PacketFlags::A);

    let keychain = test_keychain(CryptoAlgo::Sha1, b"sekrit");
    let key = keychain.key_lookup_send().unwrap();
    let ctx = AuthEncodeCtx::new(AuthenticationType::KeyedSha1, key, 12345);
    let bytes = packet.encode(Some(&ctx));

    // Mandatory section plus the 28-byte SHA1 authentication section.
    assert_eq!(bytes.len(), 24 + 28);
    assert_eq!(bytes[3] as usize, bytes.len());

    let decoded = Packet::decode(&bytes).unwrap();
    let auth = decoded.auth.as_ref().unwrap();
    assert_eq!(auth.auth_type(), AuthenticationType::KeyedSha1);
    assert_eq!(auth.key_id(), 1);
    let (_, _, seq, _) = auth.as_crypto_seq().unwrap();
    assert_eq!(*seq, 12345);

    // The MAC verifies with the right key.
    let auth_cfg = SessionAuth {
        auth_type: AuthenticationType::KeyedSha1,
        keychain: keychain.clone(),
    };
    assert_eq!(
        auth::verify(&decoded, &bytes, &auth_cfg, None),
        Ok(Some(12345))
    );

    // A tampered packet is rejected.
    let mut tampered = bytes.to_vec();
    tampered[10] ^= 0xFF;
    let tampered_packet = Packet::decode(&tampered).unwrap();
    assert_eq!(
        auth::verify(&tampered_packet, &tampered, &auth_cfg, None),
        Err(auth::AuthError::BadDigest)
    );

    // A wrong key is rejected.
    let bad_cfg = SessionAuth {
        auth_type: AuthenticationType::KeyedSha1,
        keychain: test_keychain(CryptoAlgo::Sha1, b"wrong"),
    };
    assert_eq!(
        auth::verify(&decoded, &bytes, &bad_cfg, None),
        Err(auth::AuthError::BadDigest)
    );
}

#[test]
fn test_auth_md5_round_trip() {
    let (_, ref packet) = *PACKET1;
    let mut packet = packet.as_ref().unwrap().clone();
    packet.flags.insert(PacketFlags::A);

    let keychain = test_keychain(CryptoAlgo::Md5, b"sekrit");
    let key = keychain.key_lookup_send().unwrap();
    let ctx =
        AuthEncodeCtx::new(AuthenticationType::MeticulousKeyedMd5, key, 7);
    let bytes = packet.encode(Some(&ctx));

    // Mandatory section plus the 24-byte MD5 authentication section.
    assert_eq!(bytes.len(), 24 + 24);

    let decoded = Packet::decode(&bytes).unwrap();
    let auth_cfg = SessionAuth {
        auth_type: AuthenticationType::MeticulousKeyedMd5,
        keychain,
    };
    assert_eq!(auth::verify(&decoded, &bytes, &auth_cfg, None), Ok(Some(7)));
}

#[test]
fn test_auth_unknown_key_id() {
    let (_, ref packet) = *PACKET1;
    let mut packet = packet.as_ref().unwrap().clone();
    packet.flags.insert(PacketFlags::A);

    let keychain = test_keychain(CryptoAlgo::Sha1, b"sekrit");
    let key = keychain.key_lookup_send().unwrap();
    let ctx = AuthEncodeCtx::new(AuthenticationType::KeyedSha1, key, 1);
    let bytes = packet.encode(Some(&ctx));
    let decoded = Packet::decode(&bytes).unwrap();

    // A keychain without the packet's key ID rejects the packet.
    let mut other = Keychain::new("other".to_owned());
    let other_key = Key::new(2, CryptoAlgo::Sha1, b"sekrit".to_vec());
    other.keys.insert(2, KeychainKey::new(other_key));
    let auth_cfg = SessionAuth {
        auth_type: AuthenticationType::KeyedSha1,
        keychain: Arc::new(other),
    };
    assert_eq!(
        auth::verify(&decoded, &bytes, &auth_cfg, None),
        Err(auth::AuthError::KeyNotFound(1))
    );
}

#[test]
fn test_auth_length_mismatch() {
    let (_, ref packet) = *PACKET1;
    let mut packet = packet.as_ref().unwrap().clone();
    packet.flags.insert(PacketFlags::A);

    let keychain = test_keychain(CryptoAlgo::Sha1, b"sekrit");
    let key = keychain.key_lookup_send().unwrap();
    let ctx = AuthEncodeCtx::new(AuthenticationType::KeyedSha1, key, 1);
    let mut bytes = packet.encode(Some(&ctx)).to_vec();

    // Claim a MD5-sized section while carrying a SHA1 one.
    bytes[25] = 24;
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidAuthenticationLength(24))
    );
}

//
// Sequence number window.
//

#[test]
fn test_seq_window() {
    // The first sequence number is always accepted.
    assert!(auth::seq_window_accept(None, 0, true));
    assert!(auth::seq_window_accept(None, u32::MAX, false));

    // Non-meticulous: equal or ahead within half the sequence space.
    assert!(auth::seq_window_accept(Some(100), 100, false));
    assert!(auth::seq_window_accept(Some(100), 101, false));
    assert!(auth::seq_window_accept(Some(100), 100 + (1 << 31) - 1, false));
    assert!(!auth::seq_window_accept(Some(100), 100 + (1 << 31), false));
    assert!(!auth::seq_window_accept(Some(100), 99, false));

    // Meticulous: strictly ahead.
    assert!(!auth::seq_window_accept(Some(100), 100, true));
    assert!(auth::seq_window_accept(Some(100), 101, true));

    // Wrap-around.
    assert!(auth::seq_window_accept(Some(u32::MAX), 0, true));
    assert!(auth::seq_window_accept(Some(u32::MAX - 1), 10, true));
    assert!(!auth::seq_window_accept(Some(10), u32::MAX, false));
}
