//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bfdd_utils::Sender;
use bfdd_utils::bfd::PathType;
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::{IntervalTask, Task, TimeoutTask};
use tracing::Instrument;

use crate::config::SessionAuth;
use crate::network;
use crate::packet::{Packet, PacketFlags};
use crate::session::Session;

//
// BFD engine tasks diagram:
//
//                                +--------------+
//               requests/show -> |              | -> (Nx) notifier kick
//                 udp_rx (4x) -> |   session    | -> (Nx) udp_tx_interval
//        detection_timer (Nx) -> |     task     | -> (Nx) udp_tx_oneshot
//                                |              |
//                                +--------------+
//

// BFD inter-task message types.
pub mod messages {
    // Input messages (child task -> session task).
    pub mod input {
        use bytes::Bytes;
        use serde::{Deserialize, Serialize};

        use crate::network::PacketInfo;
        use crate::packet::Packet;
        use crate::session::SessionId;

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum EngineMsg {
            UdpRxPacket(UdpRxPacketMsg),
            DetectTimer(DetectTimerMsg),
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct UdpRxPacketMsg {
            pub packet_info: PacketInfo,
            pub packet: Packet,
            // Raw packet bytes, kept around for MAC verification.
            pub data: Bytes,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct DetectTimerMsg {
            pub sess_id: SessionId,
        }
    }

    // Control messages (control side -> session task).
    pub mod control {
        use std::net::IpAddr;

        use bfdd_utils::bfd::{IfaceId, SessionKey};
        use tokio::sync::oneshot;

        use crate::config::{EngineCfg, SessionOptions};
        use crate::requests::RequestId;
        use crate::session::{SessionFilter, SessionSnapshot};

        #[derive(Debug)]
        pub enum ControlMsg {
            RequestAttach(RequestAttachMsg),
            RequestDetach(RequestDetachMsg),
            RequestUpdate(RequestUpdateMsg),
            SessionAdmin(SessionAdminMsg),
            Reconfigure(ReconfigureMsg),
            ShowSessions(ShowSessionsMsg),
        }

        #[derive(Debug)]
        pub struct RequestAttachMsg {
            pub req_id: RequestId,
            pub addr: IpAddr,
            pub local: IpAddr,
            pub iface: Option<IfaceId>,
            pub opts: SessionOptions,
        }

        #[derive(Debug)]
        pub struct RequestDetachMsg {
            pub req_id: RequestId,
            pub key: SessionKey,
        }

        #[derive(Debug)]
        pub struct RequestUpdateMsg {
            pub req_id: RequestId,
            pub key: SessionKey,
            pub opts: SessionOptions,
        }

        #[derive(Debug)]
        pub struct SessionAdminMsg {
            pub key: SessionKey,
            pub admin_down: bool,
        }

        #[derive(Debug)]
        pub struct ReconfigureMsg {
            pub config: EngineCfg,
        }

        #[derive(Debug)]
        pub struct ShowSessionsMsg {
            pub filter: SessionFilter,
            pub reply_tx: oneshot::Sender<Vec<SessionSnapshot>>,
        }
    }
}

// ===== BFD tasks =====

// UDP Rx task.
pub(crate) fn udp_rx(
    socket: UdpSocket,
    path_type: PathType,
    udp_packet_rxp: &Sender<messages::input::UdpRxPacketMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let socket = Arc::new(socket);
        let udp_packet_rxp = udp_packet_rxp.clone();
        Task::spawn(
            async move {
                let _ =
                    network::read_loop(socket, path_type, udp_packet_rxp).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Sends periodic BFD control packets.
//
// Each transmission is scheduled between 75% and 90% of the negotiated
// interval after the previous one (RFC 5880 section 6.8.7; the upper bound is
// 90% rather than 100% because the local Detect Mult may be one).
pub(crate) fn udp_tx_interval(
    sess: &Session,
    interval: u32,
    socket: &Arc<UdpSocket>,
) -> IntervalTask {
    let low = Duration::from_micros((interval - interval / 4) as u64);
    let high = Duration::from_micros((interval - interval / 10) as u64);

    let packet = sess.generate_packet();
    let sockaddr = sess.state.sockaddr;
    let auth = sess.config.auth.clone();
    let meticulous = auth
        .as_ref()
        .map(|auth| auth.auth_type.is_meticulous())
        .unwrap_or(false);

    // Clone reference-counted pointers.
    let socket = socket.clone();
    let tx_poll = sess.state.tx_poll.clone();
    let tx_seq = sess.state.tx_seq.clone();
    let tx_packet_count = sess.statistics.tx_packet_count.clone();
    let tx_error_count = sess.statistics.tx_error_count.clone();

    IntervalTask::new(low, high, true, move || {
        // Clone reference-counted pointers.
        let socket = socket.clone();
        let auth = auth.clone();
        let tx_packet_count = tx_packet_count.clone();
        let tx_error_count = tx_error_count.clone();

        // Update the P-bit as necessary.
        let mut packet = packet.clone();
        if tx_poll.load(Ordering::Relaxed) {
            packet.flags.insert(PacketFlags::P);
        } else {
            packet.flags.remove(PacketFlags::P);
        }

        // The meticulous authentication variants advance the sequence number
        // on every transmitted packet.
        let seq = if meticulous {
            tx_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
        } else {
            tx_seq.load(Ordering::Relaxed)
        };

        send_packet_wrapper(
            socket,
            sockaddr,
            packet,
            auth,
            seq,
            tx_packet_count,
            tx_error_count,
        )
    })
}

// Sends a single BFD control packet, optionally with the F-bit set.
pub(crate) fn udp_tx_oneshot(
    sess: &Session,
    socket: &Arc<UdpSocket>,
    final_flag: bool,
) {
    #[cfg(not(feature = "testing"))]
    {
        let mut packet = sess.generate_packet();
        if final_flag {
            packet.flags.insert(PacketFlags::F);
        }
        let sockaddr = sess.state.sockaddr;
        let auth = sess.config.auth.clone();

        // One-off transmissions advance the sequence number for all
        // authentication variants.
        let seq = sess
            .state
            .tx_seq
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        // Clone reference-counted pointers.
        let socket = socket.clone();
        let tx_packet_count = sess.statistics.tx_packet_count.clone();
        let tx_error_count = sess.statistics.tx_error_count.clone();

        // Send the packet asynchronously.
        let mut task = Task::spawn(async move {
            network::send_packet(
                socket,
                sockaddr,
                packet,
                auth,
                seq,
                tx_packet_count,
                tx_error_count,
            )
            .await;
        });
        task.detach();
    }
}

// BFD session detection timer.
pub(crate) fn detection_timer(
    sess: &Session,
    timeout: Duration,
    detect_timerp: &Sender<messages::input::DetectTimerMsg>,
) -> TimeoutTask {
    let sess_id = sess.id;
    let detect_timerp = detect_timerp.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::DetectTimerMsg { sess_id };
        let _ = detect_timerp.send(msg).await;
    })
}

// ===== helper functions =====

async fn send_packet_wrapper(
    socket: Arc<UdpSocket>,
    sockaddr: SocketAddr,
    packet: Packet,
    auth: Option<SessionAuth>,
    seq: u32,
    tx_packet_count: Arc<AtomicU64>,
    tx_error_count: Arc<AtomicU64>,
) {
    #[cfg(not(feature = "testing"))]
    {
        network::send_packet(
            socket,
            sockaddr,
            packet,
            auth,
            seq,
            tx_packet_count,
            tx_error_count,
        )
        .await
    }
}
