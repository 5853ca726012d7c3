//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::PathType;
use bfdd_utils::ip::AddressFamily;
use bfdd_utils::task::Task;
use bfdd_utils::{Receiver, Sender, UnboundedReceiver};
use tokio::sync::mpsc;

use crate::config::EngineCfg;
use crate::error::IoError;
use crate::events;
use crate::interface::Interfaces;
use crate::network;
use crate::notify::NotifyTx;
use crate::session::Sessions;
use crate::tasks;
use crate::tasks::messages::control::ControlMsg;
use crate::tasks::messages::input::{
    DetectTimerMsg, EngineMsg, UdpRxPacketMsg,
};

// Per-engine state, owned by the session task.
#[derive(Debug)]
pub struct Master {
    // Engine name.
    pub name: String,
    // Engine configuration.
    pub config: EngineCfg,
    // BFD sessions.
    pub sessions: Sessions,
    // Socket bindings.
    pub interfaces: Interfaces,
    // Pending-notification list towards the control side.
    pub notify: NotifyTx,
    // Senders handed to child tasks.
    pub tx: InputChannelsTx,
    // Shared UDP Rx tasks (one per path type and address family).
    udp_rx_tasks: Vec<Task<()>>,
}

#[derive(Clone, Debug)]
pub struct InputChannelsTx {
    // UDP Rx event.
    pub udp_packet_rx: Sender<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Sender<DetectTimerMsg>,
}

#[derive(Debug)]
pub struct InputChannelsRx {
    // UDP Rx event.
    pub udp_packet_rx: Receiver<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Receiver<DetectTimerMsg>,
}

// Creates the channels for all engine input events.
pub fn input_channels() -> (InputChannelsTx, InputChannelsRx) {
    let (udp_packet_rxp, udp_packet_rxc) = mpsc::channel(4);
    let (detect_timerp, detect_timerc) = mpsc::channel(4);

    let tx = InputChannelsTx {
        udp_packet_rx: udp_packet_rxp,
        detect_timer: detect_timerp,
    };
    let rx = InputChannelsRx {
        udp_packet_rx: udp_packet_rxc,
        detect_timer: detect_timerc,
    };

    (tx, rx)
}

// ===== impl Master =====

impl Master {
    pub fn new(
        name: String,
        config: EngineCfg,
        notify: NotifyTx,
        tx: InputChannelsTx,
    ) -> Master {
        Master {
            name,
            config,
            sessions: Default::default(),
            interfaces: Default::default(),
            notify,
            tx,
            udp_rx_tasks: Default::default(),
        }
    }

    // Opens the shared Rx sockets allowed by the engine configuration.
    //
    // In strict-bind mode no shared sockets exist; each interface binding
    // opens its own instead.
    pub(crate) fn start(&mut self) {
        if self.config.strict_bind {
            return;
        }

        let path_types = [
            (PathType::IpSingleHop, self.config.accept_direct),
            (PathType::IpMultihop, self.config.accept_multihop),
        ];
        let afs = [
            (AddressFamily::Ipv4, self.config.accept_ipv4),
            (AddressFamily::Ipv6, self.config.accept_ipv6),
        ];
        for (path_type, _) in path_types.iter().filter(|(_, accept)| *accept)
        {
            for (af, _) in afs.iter().filter(|(_, accept)| *accept) {
                match network::socket_rx(
                    *path_type,
                    *af,
                    self.config.zero_udp6_checksum_rx,
                ) {
                    Ok(socket) => {
                        self.udp_rx_tasks.push(tasks::udp_rx(
                            socket,
                            *path_type,
                            &self.tx.udp_packet_rx,
                        ));
                    }
                    Err(error) => {
                        IoError::UdpSocketError(error).log();
                    }
                }
            }
        }
    }

    // Engine event loop.
    //
    // All session mutation happens here, one event at a time; the control
    // side joins in by sending messages rather than by taking locks.
    pub async fn run(
        mut self,
        mut input_rx: InputChannelsRx,
        mut control_rx: UnboundedReceiver<ControlMsg>,
    ) {
        self.start();

        loop {
            tokio::select! {
                msg = control_rx.recv() => {
                    match msg {
                        Some(msg) => self.process_control_msg(msg),
                        // All request and engine handles are gone.
                        None => break,
                    }
                }
                Some(msg) = input_rx.recv() => {
                    self.process_input_msg(msg);
                }
            }
        }
    }

    pub fn process_input_msg(&mut self, msg: EngineMsg) {
        let result = match msg {
            // Received UDP packet.
            EngineMsg::UdpRxPacket(msg) => events::process_udp_packet(
                self,
                msg.packet_info,
                msg.packet,
                msg.data,
            ),
            // Session detection timer expired.
            EngineMsg::DetectTimer(msg) => {
                events::process_detection_timer(self, msg.sess_id)
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }

    pub fn process_control_msg(&mut self, msg: ControlMsg) {
        let result = match msg {
            ControlMsg::RequestAttach(msg) => {
                events::process_request_attach(self, msg)
            }
            ControlMsg::RequestDetach(msg) => {
                events::process_request_detach(self, msg.req_id, msg.key)
            }
            ControlMsg::RequestUpdate(msg) => {
                events::process_request_update(self, msg)
            }
            ControlMsg::SessionAdmin(msg) => {
                events::process_session_admin(self, msg)
            }
            ControlMsg::Reconfigure(msg) => {
                events::process_reconfigure(self, msg.config)
            }
            ControlMsg::ShowSessions(msg) => {
                events::process_show_sessions(self, msg);
                Ok(())
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }
}

// ===== impl InputChannelsRx =====

impl InputChannelsRx {
    async fn recv(&mut self) -> Option<EngineMsg> {
        tokio::select! {
            msg = self.udp_packet_rx.recv() => {
                msg.map(EngineMsg::UdpRxPacket)
            }
            msg = self.detect_timer.recv() => {
                msg.map(EngineMsg::DetectTimer)
            }
        }
    }
}

