//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bfdd::auth::AuthEncodeCtx;
use bfdd::config::{EngineCfg, IfaceCfg, SessionAuth, SessionOptions};
use bfdd::error::Error;
use bfdd::events;
use bfdd::master::{self, Master};
use bfdd::network::PacketInfo;
use bfdd::notify::{self, NotifyRx};
use bfdd::packet::{
    AuthenticationType, DiagnosticCode, Packet, PacketFlags,
};
use bfdd::session::{PollFlags, SessionSnapshot};
use bfdd::tasks::messages::control::{
    RequestAttachMsg, RequestUpdateMsg, SessionAdminMsg, ShowSessionsMsg,
};
use bfdd_utils::bfd::{IfaceId, SessionKey, State};
use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::{Key, Keychain, KeychainKey};
use tokio::sync::oneshot;

//
// Test harness: two engines wired back to back, packets carried by hand.
//

struct TestPeer {
    master: Master,
    notify_rx: NotifyRx,
    key: SessionKey,
}

fn build_peer(
    local: &str,
    peer: &str,
    config: EngineCfg,
    opts: SessionOptions,
) -> TestPeer {
    let (notify_tx, notify_rx) = notify::channel();
    let (input_tx, _input_rx) = master::input_channels();
    let mut master =
        Master::new("bfd1".to_owned(), config, notify_tx, input_tx);

    let addr: IpAddr = peer.parse().unwrap();
    let local: IpAddr = local.parse().unwrap();
    let iface = IfaceId::new(1, "eth0".to_owned());
    events::process_request_attach(
        &mut master,
        RequestAttachMsg {
            req_id: 1,
            addr,
            local,
            iface: Some(iface),
            opts,
        },
    )
    .unwrap();

    TestPeer {
        master,
        notify_rx,
        key: SessionKey::new(addr, 1),
    }
}

fn build_pair() -> (TestPeer, TestPeer) {
    let a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        Default::default(),
    );
    let b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        Default::default(),
    );
    (a, b)
}

// Carries one control packet from one engine to the other, applying any
// modification before it hits the wire.
fn xmit(
    from: &mut TestPeer,
    to: &mut TestPeer,
    mutate: impl FnOnce(&mut Packet),
) -> Result<(), Error> {
    let (_, sess) = from.master.sessions.get_by_key(&from.key).unwrap();
    let mut packet = sess.generate_packet();
    mutate(&mut packet);
    xmit_raw(to, packet, 255)
}

fn xmit_raw(
    to: &mut TestPeer,
    packet: Packet,
    ttl: u8,
) -> Result<(), Error> {
    let data = packet.encode(None).freeze();
    let packet_info = PacketInfo::IpSingleHop {
        src: SocketAddr::new(to.key.addr, 49152),
        ifindex: to.key.ifindex,
        ttl,
    };
    events::process_udp_packet(&mut to.master, packet_info, packet, data)
}

fn state(peer: &TestPeer) -> State {
    peer.master
        .sessions
        .get_by_key(&peer.key)
        .unwrap()
        .1
        .state
        .local_state
}

fn snapshot(peer: &mut TestPeer) -> SessionSnapshot {
    let (reply_tx, mut reply_rx) = oneshot::channel();
    events::process_show_sessions(
        &mut peer.master,
        ShowSessionsMsg {
            filter: Default::default(),
            reply_tx,
        },
    );
    reply_rx.try_recv().unwrap().remove(0)
}

// Runs the three-way handshake until both sessions are Up.
fn bring_up(a: &mut TestPeer, b: &mut TestPeer) {
    xmit(a, b, |_| ()).unwrap();
    xmit(b, a, |_| ()).unwrap();
    xmit(a, b, |_| ()).unwrap();
    assert_eq!(state(a), State::Up);
    assert_eq!(state(b), State::Up);
}

//
// Tests.
//

#[test]
fn test_session_bring_up() {
    let (mut a, mut b) = build_pair();

    // Sessions start Down with a running Tx task and no detection timer.
    assert_eq!(state(&a), State::Down);
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert_ne!(sess.state.local_discr, 0);
        assert!(sess.state.tx_interval.is_some());
        assert!(sess.state.detection_timer.is_none());
        // Below Up, packets advertise the idle Tx interval.
        assert_eq!(sess.state.des_min_tx_int, 1_000_000);
    }

    // A speaks first; B answers with Init and learns A's discriminator.
    xmit(&mut a, &mut b, |_| ()).unwrap();
    assert_eq!(state(&b), State::Init);
    {
        let sess = b.master.sessions.get_by_key(&b.key).unwrap().1;
        let a_discr = a
            .master
            .sessions
            .get_by_key(&a.key)
            .unwrap()
            .1
            .state
            .local_discr;
        assert_eq!(sess.state.remote.as_ref().unwrap().discr, a_discr);
    }

    // A leaves Down as soon as it hears a live peer.
    xmit(&mut b, &mut a, |_| ()).unwrap();
    assert_eq!(state(&a), State::Up);

    // One more round and B follows.
    xmit(&mut a, &mut b, |_| ()).unwrap();
    assert_eq!(state(&b), State::Up);

    // Entering Up switches to the fast Tx interval.
    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.des_min_tx_int, 100_000);
    assert!(sess.state.detection_timer.is_some());

    // Interval invariants.
    assert!(sess.state.des_min_tx_int <= sess.state.des_min_tx_new);
    assert!(sess.state.req_min_rx_int >= sess.state.req_min_rx_new);

    // Both engines published their transitions.
    assert!(!a.notify_rx.drain().is_empty());
    assert!(!b.notify_rx.drain().is_empty());
}

#[test]
fn test_detection_timeout() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    let sess_id = a.master.sessions.get_by_key(&a.key).unwrap().1.id;
    events::process_detection_timer(&mut a.master, sess_id).unwrap();

    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::TimeExpired);
    assert!(sess.state.remote.is_none());
    // Transmission resumes as if the peer had never been heard.
    assert!(sess.state.tx_interval.is_some());

    let published = sess.published.get();
    assert_eq!(published.local_state, State::Down);
    assert_eq!(published.local_diag, DiagnosticCode::TimeExpired);
}

#[test]
fn test_admin_down() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    events::process_session_admin(
        &mut a.master,
        SessionAdminMsg {
            key: a.key,
            admin_down: true,
        },
    )
    .unwrap();

    // Periodic transmission stops in AdminDown.
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert_eq!(sess.state.local_state, State::AdminDown);
        assert!(sess.state.tx_interval.is_none());
    }

    // The peer sees the administrative shutdown, not a connectivity loss.
    xmit(&mut a, &mut b, |_| ()).unwrap();
    {
        let sess = b.master.sessions.get_by_key(&b.key).unwrap().1;
        assert_eq!(sess.state.local_state, State::Down);
        assert_eq!(sess.state.local_diag, DiagnosticCode::NbrDown);
        assert_eq!(sess.published.get().remote_state, State::AdminDown);
    }

    // Incoming packets are ignored while AdminDown.
    xmit(&mut b, &mut a, |_| ()).unwrap();
    assert_eq!(state(&a), State::AdminDown);

    // Returning to service restarts from Down.
    events::process_session_admin(
        &mut a.master,
        SessionAdminMsg {
            key: a.key,
            admin_down: false,
        },
    )
    .unwrap();
    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.local_state, State::Down);
    assert!(sess.state.tx_interval.is_some());
}

#[test]
fn test_poll_sequence() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    // Entering Up lowered the Tx interval, which opened a Poll Sequence of
    // its own; close it first.
    xmit(&mut b, &mut a, |packet| {
        packet.flags.insert(PacketFlags::F);
    })
    .unwrap();
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert!(sess.state.poll_active.is_empty());
    }

    // Raise A's Required Min Rx Interval to one second. The increase takes
    // effect locally right away, but the peer must still confirm it.
    events::process_request_update(
        &mut a.master,
        RequestUpdateMsg {
            req_id: 1,
            key: a.key,
            opts: SessionOptions {
                min_rx_int: Some(1_000_000),
                ..Default::default()
            },
        },
    )
    .unwrap();
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert_eq!(sess.state.req_min_rx_int, 1_000_000);
        assert_eq!(sess.state.poll_active, PollFlags::RX);
    }

    // A polls with the new value; B honors it immediately for its own Tx
    // pacing.
    xmit(&mut a, &mut b, |packet| {
        assert_eq!(packet.req_min_rx, 1_000_000);
        packet.flags.insert(PacketFlags::P);
    })
    .unwrap();
    assert_eq!(snapshot(&mut b).tx_interval, Some(1_000_000));

    // B's Final terminates the sequence. No state transition occurred, and
    // subsequent detection timeouts reflect the slower rate.
    xmit(&mut b, &mut a, |packet| {
        packet.flags.insert(PacketFlags::F);
    })
    .unwrap();
    let snap = snapshot(&mut a);
    assert_eq!(snap.local_state, State::Up);
    assert_eq!(snap.detection_time, Some(5 * 1_000_000));

    // Lowering the interval back is postponed until the peer confirms it.
    events::process_request_update(
        &mut a.master,
        RequestUpdateMsg {
            req_id: 1,
            key: a.key,
            opts: SessionOptions {
                min_rx_int: Some(10_000),
                ..Default::default()
            },
        },
    )
    .unwrap();
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert_eq!(sess.state.req_min_rx_new, 10_000);
        assert_eq!(sess.state.req_min_rx_int, 1_000_000);
        assert!(sess.state.req_min_rx_int >= sess.state.req_min_rx_new);
    }

    // The Final commits the stashed value.
    xmit(&mut b, &mut a, |packet| {
        packet.flags.insert(PacketFlags::F);
    })
    .unwrap();
    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.req_min_rx_int, 10_000);
    assert!(sess.state.poll_active.is_empty());
}

#[test]
fn test_passive_session() {
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        SessionOptions {
            passive: Some(true),
            ..Default::default()
        },
    );
    let mut b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        Default::default(),
    );

    // A passive session does not transmit until the peer is heard.
    {
        let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
        assert!(sess.state.tx_interval.is_none());
    }

    // Once B speaks, the usual bring-up proceeds.
    xmit(&mut b, &mut a, |_| ()).unwrap();
    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.local_state, State::Init);
    assert!(sess.state.tx_interval.is_some());
}

#[test]
fn test_remote_min_rx_zero_stops_tx() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    xmit(&mut b, &mut a, |packet| {
        packet.req_min_rx = 0;
    })
    .unwrap();

    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert!(sess.state.tx_interval.is_none());
}

#[test]
fn test_remote_demand_mode_stops_tx() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    // The Final closes the Poll Sequence opened at bring-up; with both ends
    // Up and the peer asking for Demand mode, periodic transmission stops.
    xmit(&mut b, &mut a, |packet| {
        packet.flags.insert(PacketFlags::D | PacketFlags::F);
    })
    .unwrap();

    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    assert_eq!(sess.state.local_state, State::Up);
    assert!(sess.state.tx_interval.is_none());
}

#[test]
fn test_gtsm_ttl_check() {
    let (mut a, mut b) = build_pair();

    let (_, sess) = a.master.sessions.get_by_key(&a.key).unwrap();
    let packet = sess.generate_packet();
    assert!(matches!(
        xmit_raw(&mut b, packet, 254),
        Err(Error::UdpInvalidTtl(..))
    ));
    assert_eq!(state(&b), State::Down);
    assert_eq!(snapshot(&mut b).rx_error_count, 1);
}

#[test]
fn test_zero_your_discr_while_up() {
    let (mut a, mut b) = build_pair();
    bring_up(&mut a, &mut b);

    let result = xmit(&mut a, &mut b, |packet| {
        packet.your_discr = 0;
    });
    assert!(matches!(
        result,
        Err(Error::InvalidYourDiscriminator(0))
    ));
    assert_eq!(state(&b), State::Up);
}

#[test]
fn test_unknown_session_discarded() {
    let (a, mut b) = build_pair();

    let (_, sess) = a.master.sessions.get_by_key(&a.key).unwrap();
    let packet = sess.generate_packet();
    let data = packet.encode(None).freeze();
    let packet_info = PacketInfo::IpSingleHop {
        src: SocketAddr::new("192.0.2.99".parse().unwrap(), 49152),
        ifindex: 7,
        ttl: 255,
    };
    let result =
        events::process_udp_packet(&mut b.master, packet_info, packet, data);
    assert!(matches!(result, Err(Error::SessionNoMatch(..))));
}

#[test]
fn test_option_merge() {
    let mut config = EngineCfg::default();
    config.interfaces.insert(
        "eth0".to_owned(),
        IfaceCfg {
            min_rx_int: 50_000,
            multiplier: 4,
            ..Default::default()
        },
    );

    let a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        config,
        SessionOptions {
            min_tx_int: Some(200_000),
            ..Default::default()
        },
    );

    let sess = a.master.sessions.get_by_key(&a.key).unwrap().1;
    // Request options override the interface configuration, which overrides
    // the engine defaults.
    assert_eq!(sess.config.min_tx_int, 200_000);
    assert_eq!(sess.config.min_rx_int, 50_000);
    assert_eq!(sess.config.multiplier, 4);
    assert_eq!(sess.config.idle_tx_int, 1_000_000);
}

#[test]
fn test_request_detach_deletes_session() {
    let (mut a, _) = build_pair();

    // A second subscriber shares the session.
    events::process_request_attach(
        &mut a.master,
        RequestAttachMsg {
            req_id: 2,
            addr: a.key.addr,
            local: "10.0.0.1".parse().unwrap(),
            iface: Some(IfaceId::new(1, "eth0".to_owned())),
            opts: Default::default(),
        },
    )
    .unwrap();
    assert_eq!(
        a.master.sessions.get_by_key(&a.key).unwrap().1.requests.len(),
        2
    );

    // The session survives until the last subscriber goes away.
    events::process_request_detach(&mut a.master, 1, a.key).unwrap();
    assert!(a.master.sessions.get_by_key(&a.key).is_some());
    events::process_request_detach(&mut a.master, 2, a.key).unwrap();
    assert!(a.master.sessions.get_by_key(&a.key).is_none());
}

//
// Authentication.
//

fn test_keychain(algo: CryptoAlgo, secret: &[u8]) -> Arc<Keychain> {
    let mut keychain = Keychain::new("test".to_owned());
    let key = Key::new(1, algo, secret.to_vec());
    keychain.keys.insert(1, KeychainKey::new(key));
    Arc::new(keychain)
}

fn auth_opts(auth_type: AuthenticationType, secret: &[u8]) -> SessionOptions {
    SessionOptions {
        auth: Some(SessionAuth {
            auth_type,
            keychain: test_keychain(auth_type.algo(), secret),
        }),
        ..Default::default()
    }
}

// Carries one authenticated control packet between the engines.
fn xmit_auth(
    from: &mut TestPeer,
    to: &mut TestPeer,
    seq: u32,
) -> Result<(), Error> {
    let (_, sess) = from.master.sessions.get_by_key(&from.key).unwrap();
    let packet = sess.generate_packet();
    let auth = sess.config.auth.clone().unwrap();
    let key = auth.keychain.key_lookup_send().unwrap();
    let ctx = AuthEncodeCtx::new(auth.auth_type, key, seq);
    let data = packet.encode(Some(&ctx)).freeze();
    let packet = Packet::decode(&data).unwrap();

    let packet_info = PacketInfo::IpSingleHop {
        src: SocketAddr::new(to.key.addr, 49152),
        ifindex: to.key.ifindex,
        ttl: 255,
    };
    events::process_udp_packet(&mut to.master, packet_info, packet, data)
}

#[test]
fn test_auth_session_bring_up() {
    let auth_type = AuthenticationType::MeticulousKeyedSha1;
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );
    let mut b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );

    xmit_auth(&mut a, &mut b, 100).unwrap();
    assert_eq!(state(&b), State::Init);
    xmit_auth(&mut b, &mut a, 200).unwrap();
    assert_eq!(state(&a), State::Up);
    xmit_auth(&mut a, &mut b, 101).unwrap();
    assert_eq!(state(&b), State::Up);

    // The last accepted sequence number is latched.
    let sess = b.master.sessions.get_by_key(&b.key).unwrap().1;
    assert_eq!(sess.state.rx_seq, Some(101));
}

#[test]
fn test_auth_mac_mismatch() {
    let auth_type = AuthenticationType::KeyedSha1;
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );
    let mut b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        auth_opts(auth_type, b"mis-keyed"),
    );

    // B drops everything A says, and stays Down.
    assert!(matches!(
        xmit_auth(&mut a, &mut b, 1),
        Err(Error::Auth(_))
    ));
    assert_eq!(state(&b), State::Down);
    assert_eq!(snapshot(&mut b).rx_error_count, 1);
}

#[test]
fn test_auth_missing_section() {
    let auth_type = AuthenticationType::KeyedSha1;
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        Default::default(),
    );
    let mut b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );

    // An unauthenticated packet towards an authenticated session is dropped.
    assert!(matches!(
        xmit(&mut a, &mut b, |_| ()),
        Err(Error::Auth(_))
    ));
    assert_eq!(state(&b), State::Down);
}

#[test]
fn test_auth_meticulous_replay() {
    let auth_type = AuthenticationType::MeticulousKeyedSha1;
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );
    let mut b = build_peer(
        "10.0.0.2",
        "10.0.0.1",
        Default::default(),
        auth_opts(auth_type, b"sekrit"),
    );

    xmit_auth(&mut a, &mut b, 100).unwrap();
    xmit_auth(&mut b, &mut a, 200).unwrap();
    xmit_auth(&mut a, &mut b, 101).unwrap();
    assert_eq!(state(&b), State::Up);

    // A replayed sequence number is dropped for the meticulous variants.
    assert!(matches!(
        xmit_auth(&mut a, &mut b, 101),
        Err(Error::Auth(_))
    ));
    assert_eq!(state(&b), State::Up);
}

#[test]
fn test_multihop_rx_ttl() {
    let mut a = build_peer(
        "10.0.0.1",
        "10.0.0.2",
        Default::default(),
        Default::default(),
    );

    // A multihop session with a minimum TTL policy.
    let addr: IpAddr = "192.0.2.1".parse().unwrap();
    events::process_request_attach(
        &mut a.master,
        RequestAttachMsg {
            req_id: 7,
            addr,
            local: "10.0.0.1".parse().unwrap(),
            iface: None,
            opts: SessionOptions {
                rx_ttl: Some(10),
                ..Default::default()
            },
        },
    )
    .unwrap();

    let packet = Packet::new(
        DiagnosticCode::Nothing as u8,
        State::Down,
        PacketFlags::empty(),
        3,
        0x12345678,
        0,
        100_000,
        100_000,
        0,
    );
    let data = packet.encode(None).freeze();

    // Below the minimum hop count: dropped.
    let packet_info = PacketInfo::IpMultihop {
        src: addr,
        dst: "10.0.0.1".parse().unwrap(),
        ttl: 5,
    };
    assert!(matches!(
        events::process_udp_packet(
            &mut a.master,
            packet_info,
            packet.clone(),
            data.clone()
        ),
        Err(Error::UdpInvalidTtl(..))
    ));

    // At or above it: accepted.
    let packet_info = PacketInfo::IpMultihop {
        src: addr,
        dst: "10.0.0.1".parse().unwrap(),
        ttl: 10,
    };
    events::process_udp_packet(&mut a.master, packet_info, packet, data)
        .unwrap();
    let key = SessionKey::new(addr, 0);
    let sess = a.master.sessions.get_by_key(&key).unwrap().1;
    assert_eq!(sess.state.local_state, State::Init);
}
