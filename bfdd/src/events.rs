//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::{SessionKey, State};
use bfdd_utils::socket::TTL_MAX;
use bytes::Bytes;
use tracing::trace;

use crate::auth;
use crate::config::{self, EngineCfg};
use crate::debug::Debug;
use crate::error::Error;
use crate::master::Master;
use crate::network::PacketInfo;
use crate::packet::{DiagnosticCode, Packet, PacketFlags};
use crate::requests::RequestId;
use crate::session::{
    PollFlags, Session, SessionId, SessionIndex, SessionRemoteInfo,
    SessionRequest,
};
use crate::tasks::messages::control::{
    RequestAttachMsg, RequestUpdateMsg, SessionAdminMsg, ShowSessionsMsg,
};

// ===== UDP packet receipt =====

pub fn process_udp_packet(
    master: &mut Master,
    packet_info: PacketInfo,
    packet: Packet,
    data: Bytes,
) -> Result<(), Error> {
    trace!(?packet_info, ?packet, "received packet");

    // Session lookup varies depending on whether the Your Discriminator field
    // is zero or not.
    let Some((_, sess)) = (match packet.your_discr {
        0 => {
            let key = match &packet_info {
                PacketInfo::IpSingleHop { src, ifindex, .. } => {
                    SessionKey::new(src.ip(), *ifindex)
                }
                PacketInfo::IpMultihop { src, .. } => SessionKey::new(*src, 0),
            };
            master.sessions.get_mut_by_key(&key)
        }
        _ => master.sessions.get_mut_by_discr(packet.your_discr),
    }) else {
        // Discard the packet.
        return Err(Error::SessionNoMatch(packet_info, packet.your_discr));
    };

    // Update packet counter.
    sess.statistics.rx_packet_count += 1;

    // TTL policy: single-hop packets must arrive with the maximum TTL
    // (GTSM); multihop sessions may be configured with a minimum.
    match &packet_info {
        PacketInfo::IpSingleHop { src, ttl, .. } => {
            if *ttl != TTL_MAX {
                sess.statistics.rx_error_count += 1;
                return Err(Error::UdpInvalidTtl(src.ip(), *ttl));
            }
        }
        PacketInfo::IpMultihop { src, ttl, .. } => {
            if let Some(rx_ttl) = sess.config.rx_ttl
                && *ttl < rx_ttl
            {
                sess.statistics.rx_error_count += 1;
                return Err(Error::UdpInvalidTtl(*src, *ttl));
            }
        }
    }

    // Validation checks.
    if let Err(error) = validate_packet(&packet, sess) {
        sess.statistics.rx_error_count += 1;
        return Err(error);
    }

    // Authenticate the packet with the session's key material.
    if let Some(auth_cfg) = &sess.config.auth {
        match auth::verify(&packet, &data, auth_cfg, sess.state.rx_seq) {
            Ok(Some(seq)) => sess.state.rx_seq = Some(seq),
            Ok(None) => (),
            Err(error) => {
                sess.statistics.rx_error_count += 1;
                return Err(error.into());
            }
        }
    }

    // Update session's remote state.
    let old_des_min_tx = sess.state.des_min_tx_int;
    let old_remote_min_rx = sess.remote_min_rx_interval();
    let old_remote_discr = sess.remote_discr();
    let old_remote_demand = sess
        .state
        .remote
        .as_ref()
        .map(|remote| remote.demand_mode)
        .unwrap_or(false);
    sess.state.remote = Some(SessionRemoteInfo::new(
        packet.state,
        packet.my_discr,
        packet.diag,
        packet.detect_mult,
        packet.desired_min_tx,
        packet.req_min_rx,
        packet.flags.contains(PacketFlags::D),
    ));

    // If a Poll Sequence is being transmitted by the local system and the
    // Final (F) bit in the received packet is set, the Poll Sequence MUST be
    // terminated. The Final bit is processed before the Poll bit below, so
    // the reply that closes one sequence can open the next.
    if !sess.state.poll_active.is_empty()
        && packet.flags.contains(PacketFlags::F)
    {
        sess.terminate_poll();
    }

    // Update the transmit interval as described in RFC 5880 section 6.8.2.
    if sess.state.des_min_tx_int != old_des_min_tx
        || sess.remote_min_rx_interval() != old_remote_min_rx
        || sess.remote_discr() != old_remote_discr
        || packet.flags.contains(PacketFlags::D) != old_remote_demand
    {
        sess.update_tx_interval();
    }

    // Update the Detection Time as described in RFC 5880 section 6.8.4.
    sess.update_detection_time(true, &master.tx.detect_timer);

    // Invoke FSM event.
    let next_state = match (sess.state.local_state, packet.state) {
        (State::AdminDown, _) => {
            // Silently discard the packet.
            return Ok(());
        }
        (State::Init | State::Up, State::AdminDown) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        (State::Down, State::Down) => {
            Some((State::Init, DiagnosticCode::Nothing))
        }
        (State::Down, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Init, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Up, State::Down) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        _ => None,
    };
    if let Some((state, diag)) = next_state {
        // Effectively transition to the new FSM state.
        sess.state_update(state, diag, &master.notify);
    }

    // If the Poll (P) bit is set, send a BFD Control packet to the remote
    // system with the Poll (P) bit clear, and the Final (F) bit set.
    if packet.flags.contains(PacketFlags::P) {
        sess.send_tx_final();
    }

    Ok(())
}

// Checks whether the BFD packet is acceptable for the session.
fn validate_packet(packet: &Packet, sess: &Session) -> Result<(), Error> {
    if packet.version != Packet::VERSION {
        return Err(Error::VersionMismatch(packet.version));
    }
    if packet.detect_mult == 0 {
        return Err(Error::InvalidDetectMult(packet.detect_mult));
    }
    if packet.flags.contains(PacketFlags::M) {
        return Err(Error::InvalidFlags(packet.flags));
    }
    if packet.my_discr == 0 {
        return Err(Error::InvalidMyDiscriminator(packet.my_discr));
    }
    if packet.your_discr == 0
        && !matches!(
            sess.state.local_state,
            State::Down | State::AdminDown
        )
    {
        return Err(Error::InvalidYourDiscriminator(packet.your_discr));
    }
    // The presence of the authentication section must match the session
    // configuration.
    match (&sess.config.auth, packet.flags.contains(PacketFlags::A)) {
        (Some(_), false) => {
            return Err(Error::Auth(auth::AuthError::MissingSection));
        }
        (None, true) => {
            return Err(Error::Auth(auth::AuthError::UnexpectedSection));
        }
        _ => (),
    }

    Ok(())
}

// ===== Detection timeout =====

pub fn process_detection_timer(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    Debug::DetectionTimeExpiry(&sess.key).log();

    // Reset remote data since the peer is dead. Periodic transmission
    // resumes at the idle rate as if the peer had never been heard.
    sess.state.remote = None;
    sess.state.rx_seq = None;
    sess.state.last_rx = None;
    sess.state.detection_timer = None;
    sess.state.poll_active = PollFlags::empty();
    sess.state.poll_scheduled = PollFlags::empty();

    // Transition to the "Down" state.
    sess.state_update(
        State::Down,
        DiagnosticCode::TimeExpired,
        &master.notify,
    );
    sess.update_tx_interval();

    Ok(())
}

// ===== Request attachment =====

pub fn process_request_attach(
    master: &mut Master,
    msg: RequestAttachMsg,
) -> Result<(), Error> {
    let RequestAttachMsg {
        req_id,
        addr,
        local,
        iface,
        opts,
    } = msg;
    let key =
        SessionKey::new(addr, iface.as_ref().map(|i| i.ifindex).unwrap_or(0));

    Debug::RequestAttach(&key, req_id).log();

    let sess_idx = match master.sessions.get_mut_by_key(&key) {
        Some((sess_idx, _)) => sess_idx,
        None => {
            // Create the socket binding and the session itself.
            let iface_idx = master.interfaces.get_iface(
                local,
                iface.as_ref(),
                &master.config,
                &master.tx.udp_packet_rx,
            );
            let binding = &master.interfaces[iface_idx];
            let config = config::merge_options(&binding.config, &opts);
            let id = master.sessions.next_id();
            let discr = master.sessions.get_free_discr();
            let sess = Session::new(
                id,
                key,
                local,
                binding.ifname.clone(),
                iface_idx,
                binding.socket_tx.clone(),
                discr,
                config,
            );
            let sess_idx = master.sessions.insert(sess);

            // Start periodic transmission.
            master.sessions[sess_idx].update_tx_interval();

            sess_idx
        }
    };

    // Attach the request and deliver the current session state to the new
    // subscriber.
    let sess = &mut master.sessions[sess_idx];
    sess.requests.push(SessionRequest::new(req_id, opts));
    sess.publish(&master.notify);

    Ok(())
}

// ===== Request detachment =====

pub fn process_request_detach(
    master: &mut Master,
    req_id: RequestId,
    key: SessionKey,
) -> Result<(), Error> {
    if let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(&key) {
        Debug::RequestDetach(&key, req_id).log();

        sess.requests.retain(|request| request.id != req_id);

        // Remove the session once the last request is gone.
        if sess.requests.is_empty() {
            let sess = master.sessions.delete(sess_idx);
            master.interfaces.free_iface(sess.iface_idx);
        }
    }

    Ok(())
}

// ===== Request options update =====

pub fn process_request_update(
    master: &mut Master,
    msg: RequestUpdateMsg,
) -> Result<(), Error> {
    let RequestUpdateMsg { req_id, key, opts } = msg;

    if let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(&key) {
        if let Some(request) =
            sess.requests.iter_mut().find(|request| request.id == req_id)
        {
            request.opts = opts;
        }
        reconfigure_session(master, sess_idx);
    }

    Ok(())
}

// ===== Local administrative control =====

pub fn process_session_admin(
    master: &mut Master,
    msg: SessionAdminMsg,
) -> Result<(), Error> {
    let SessionAdminMsg { key, admin_down } = msg;

    if let Some((_, sess)) = master.sessions.get_mut_by_key(&key)
        && sess.state.admin_down != admin_down
    {
        sess.state.admin_down = admin_down;
        if admin_down {
            sess.state_update(
                State::AdminDown,
                DiagnosticCode::AdminDown,
                &master.notify,
            );
            // Periodic transmission stops in AdminDown; one last packet
            // tells the peer we are going away on purpose.
            sess.send_tx_single();
        } else {
            sess.state_update(
                State::Down,
                DiagnosticCode::Nothing,
                &master.notify,
            );
        }
    }

    Ok(())
}

// ===== Engine reconfiguration =====

pub fn process_reconfigure(
    master: &mut Master,
    config: EngineCfg,
) -> Result<(), Error> {
    master.config = config;

    // Refresh interface configurations, marking the changed bindings.
    for (_, iface) in master.interfaces.iter_mut() {
        let new = master
            .config
            .find_iface_config(iface.ifname.as_deref())
            .clone();
        iface.changed = iface.config != new;
        iface.config = new;
    }

    // Re-merge the options of every session on a marked binding.
    for sess_idx in master.sessions.indexes() {
        let iface_idx = master.sessions[sess_idx].iface_idx;
        if master.interfaces[iface_idx].changed {
            reconfigure_session(master, sess_idx);
        }
    }

    Ok(())
}

// Applies a new merged configuration to the session, resynchronizing the
// peer through a Poll Sequence where the intervals require it.
fn reconfigure_session(master: &mut Master, sess_idx: SessionIndex) {
    let iface_idx = master.sessions[sess_idx].iface_idx;
    let iface_cfg = master.interfaces[iface_idx].config.clone();

    let sess = &mut master.sessions[sess_idx];
    let Some(head) = sess.requests.first() else {
        return;
    };
    sess.config = config::merge_options(&iface_cfg, &head.opts);

    let min_tx = if sess.state.local_state == State::Up {
        sess.config.min_tx_int
    } else {
        sess.config.idle_tx_int
    };
    let min_rx = sess.config.min_rx_int;
    sess.set_min_tx(min_tx);
    sess.set_min_rx(min_rx, &master.tx.detect_timer);
    sess.state.detect_mult = sess.config.multiplier;
    sess.state.passive = sess.config.passive;
    sess.update_tx_interval();

    Debug::SessionReconfigure(&sess.key).log();
}

// ===== Session listing =====

pub fn process_show_sessions(master: &mut Master, msg: ShowSessionsMsg) {
    let ShowSessionsMsg { filter, reply_tx } = msg;

    let snapshots = master
        .sessions
        .iter()
        .filter(|sess| filter.matches(sess))
        .map(|sess| sess.snapshot())
        .collect();

    let _ = reply_tx.send(snapshots);
}
