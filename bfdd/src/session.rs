//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bfdd_utils::Sender;
use bfdd_utils::bfd::{PathType, SessionKey, State};
use bfdd_utils::ip::{AddressFamily, IpAddrExt};
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::{IntervalTask, TimeoutTask};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_new::new;
use generational_arena::{Arena, Index};
use ipnetwork::IpNetwork;
use rand::RngCore;

use crate::config::{SessionCfg, SessionOptions};
use crate::debug::Debug;
use crate::error::Error;
use crate::interface::InterfaceIndex;
use crate::network;
use crate::notify::{NotifyTx, PublishedState, SessionPublished};
use crate::packet::{AuthenticationType, DiagnosticCode, Packet, PacketFlags};
use crate::requests::RequestId;
use crate::tasks;
use crate::tasks::messages::input::DetectTimerMsg;

pub type SessionId = usize;
pub type SessionIndex = Index;

// Interval changes synchronized through a Poll Sequence.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PollFlags: u8 {
        const TX = 1 << 0;
        const RX = 1 << 1;
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub local: IpAddr,
    pub ifname: Option<String>,
    pub iface_idx: InterfaceIndex,
    pub config: SessionCfg,
    pub state: SessionState,
    pub statistics: SessionStatistics,
    // Attached subscriptions; the head request drives reconfiguration.
    pub requests: Vec<SessionRequest>,
    pub published: Arc<SessionPublished>,
}

#[derive(Debug)]
pub struct SessionState {
    pub sockaddr: SocketAddr,
    pub socket_tx: Option<Arc<UdpSocket>>,
    pub local_state: State,
    pub local_diag: DiagnosticCode,
    pub local_discr: u32,
    pub detect_mult: u8,
    pub passive: bool,
    pub admin_down: bool,
    // Interval state. The invariants `des_min_tx_int <= des_min_tx_new` and
    // `req_min_rx_int >= req_min_rx_new` hold between Poll Sequences.
    pub des_min_tx_int: u32,
    pub des_min_tx_new: u32,
    pub req_min_rx_int: u32,
    pub req_min_rx_new: u32,
    pub poll_active: PollFlags,
    pub poll_scheduled: PollFlags,
    pub remote: Option<SessionRemoteInfo>,
    pub last_rx: Option<Instant>,
    // Authentication sequence numbers.
    pub rx_seq: Option<u32>,
    pub tx_seq: Arc<AtomicU32>,
    // P-bit state shared with the Tx task.
    pub tx_poll: Arc<AtomicBool>,
    pub tx_interval: Option<IntervalTask>,
    pub detection_timer: Option<TimeoutTask>,
}

#[derive(Clone, Copy, Debug, new)]
pub struct SessionRemoteInfo {
    pub state: State,
    pub discr: u32,
    pub diag: u8,
    pub multiplier: u8,
    pub min_tx: u32,
    pub min_rx: u32,
    pub demand_mode: bool,
}

#[derive(Debug, new)]
pub struct SessionRequest {
    pub id: RequestId,
    pub opts: SessionOptions,
}

#[derive(Debug)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_down_time: Option<DateTime<Utc>>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub down_count: u32,
    pub admin_down_count: u32,
    pub rx_packet_count: u64,
    pub tx_packet_count: Arc<AtomicU64>,
    pub rx_error_count: u64,
    pub tx_error_count: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
pub struct Sessions {
    // Session arena.
    arena: Arena<Session>,
    // Session hash table keyed by ID (1:1).
    id_tree: HashMap<SessionId, SessionIndex>,
    // Session binary tree keyed by session key (1:1).
    key_tree: BTreeMap<SessionKey, SessionIndex>,
    // Session hash table keyed by local discriminator (1:1).
    discr_tree: HashMap<u32, SessionIndex>,
    // Next available ID.
    next_id: SessionId,
}

// Filter applied when listing sessions.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub address: Option<IpNetwork>,
    pub ifname: Option<String>,
    pub af: Option<AddressFamily>,
    pub path_type: Option<PathType>,
}

// Point-in-time copy of a session, used by the session listing.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub ifname: Option<String>,
    pub path_type: PathType,
    pub local_state: State,
    pub remote_state: State,
    pub local_diag: DiagnosticCode,
    pub remote_diag: u8,
    pub local_discr: u32,
    pub remote_discr: u32,
    pub last_state_change: Option<DateTime<Utc>>,
    pub local_multiplier: u8,
    pub remote_multiplier: u8,
    pub demand_mode: bool,
    pub remote_demand_mode: bool,
    pub des_min_tx_int: u32,
    pub req_min_rx_int: u32,
    pub remote_min_tx_int: u32,
    pub remote_min_rx_int: u32,
    pub tx_interval: Option<u32>,
    pub tx_remaining: Option<Duration>,
    pub detection_time: Option<u32>,
    pub detection_remaining: Option<Duration>,
    pub auth_type: Option<AuthenticationType>,
    pub rx_seq: Option<u32>,
    pub tx_seq: u32,
    pub rx_packet_count: u64,
    pub tx_packet_count: u64,
    pub rx_error_count: u64,
    pub tx_error_count: u64,
}

// ===== impl Session =====

impl Session {
    // Creates a new BFD session with the state variables initialized as
    // described in RFC 5880 section 6.8.1.
    pub(crate) fn new(
        id: SessionId,
        key: SessionKey,
        local: IpAddr,
        ifname: Option<String>,
        iface_idx: InterfaceIndex,
        socket_tx: Option<Arc<UdpSocket>>,
        local_discr: u32,
        config: SessionCfg,
    ) -> Session {
        Debug::SessionCreate(&key).log();

        let port = match key.path_type() {
            PathType::IpSingleHop => network::PORT_DST_SINGLE_HOP,
            PathType::IpMultihop => network::PORT_DST_MULTIHOP,
        };
        let mut sockaddr = SocketAddr::new(key.addr, port);
        if let SocketAddr::V6(sockaddr) = &mut sockaddr {
            sockaddr.set_scope_id(key.ifindex);
        }

        let state = SessionState {
            sockaddr,
            socket_tx,
            local_state: State::Down,
            local_diag: DiagnosticCode::Nothing,
            local_discr,
            detect_mult: config.multiplier,
            passive: config.passive,
            admin_down: false,
            des_min_tx_int: config.idle_tx_int,
            des_min_tx_new: config.idle_tx_int,
            req_min_rx_int: config.min_rx_int,
            req_min_rx_new: config.min_rx_int,
            poll_active: PollFlags::empty(),
            poll_scheduled: PollFlags::empty(),
            remote: None,
            last_rx: None,
            rx_seq: None,
            tx_seq: Arc::new(AtomicU32::new(rand::rng().next_u32())),
            tx_poll: Arc::new(AtomicBool::new(false)),
            tx_interval: None,
            detection_timer: None,
        };

        Session {
            id,
            key,
            local,
            ifname,
            iface_idx,
            config,
            state,
            statistics: Default::default(),
            requests: Default::default(),
            published: SessionPublished::new(),
        }
    }

    // Updates the FSM state of the BFD session.
    pub(crate) fn state_update(
        &mut self,
        state: State,
        diag: DiagnosticCode,
        notify: &NotifyTx,
    ) {
        let old_state = self.state.local_state;
        if state == old_state {
            return;
        }

        Debug::FsmTransition(&self.key, old_state, state).log();

        self.state.local_state = state;
        self.state.local_diag = diag;

        // Update statistics.
        match state {
            State::AdminDown => {
                self.statistics.admin_down_count += 1;
            }
            State::Down => {
                self.statistics.last_down_time = Some(Utc::now());
                self.statistics.down_count += 1;
            }
            State::Up => {
                self.statistics.last_up_time = Some(Utc::now());
            }
            _ => {}
        }

        // Publish the new state and wake the notifier.
        self.publish(notify);

        // The non-meticulous authentication variants advance the sequence
        // number on state changes rather than on every packet.
        if let Some(auth) = &self.config.auth
            && !auth.auth_type.is_meticulous()
        {
            self.state.tx_seq.fetch_add(1, Ordering::Relaxed);
        }

        if state == State::Up {
            // Leave the idle Tx rate.
            self.set_min_tx(self.config.min_tx_int);
        }
        if old_state == State::Up {
            // Restore the idle Tx rate.
            self.set_min_tx(self.config.idle_tx_int);
        }

        // Synchronize the Tx task since the local state has changed.
        self.update_tx_interval();
    }

    // Copies the published session fields and links the session onto the
    // pending-notification list.
    pub(crate) fn publish(&self, notify: &NotifyTx) {
        self.published.set(PublishedState {
            local_state: self.state.local_state,
            remote_state: self.remote_state(),
            local_diag: self.state.local_diag,
            last_state_change: Some(Utc::now()),
        });
        notify.schedule(self.key, self.published.clone());
    }

    // Returns the last state received from the remote system.
    pub(crate) fn remote_state(&self) -> State {
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.state)
            .unwrap_or(State::Down)
    }

    // Returns the discriminator of the remote system (zero when unknown).
    pub(crate) fn remote_discr(&self) -> u32 {
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.discr)
            .unwrap_or(0)
    }

    // Returns the last value of Required Min Rx Interval received from the
    // remote system.
    //
    // If we haven't heard from our peer yet, return the initial value (1
    // microsecond).
    pub(crate) fn remote_min_rx_interval(&self) -> u32 {
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.min_rx)
            .unwrap_or(1)
    }

    // Returns the negotiated Tx interval for the session.
    //
    // A system MUST NOT periodically transmit BFD Control packets if
    // bfd.RemoteMinRxInterval is zero.
    pub(crate) fn negotiated_tx_interval(&self) -> Option<u32> {
        let remote_min_rx = self.remote_min_rx_interval();
        if remote_min_rx == 0 {
            return None;
        }

        Some(std::cmp::max(self.state.des_min_tx_int, remote_min_rx))
    }

    // Returns the negotiated detection time for the session.
    //
    // The Detection Time is the remote Detect Mult multiplied by the agreed
    // transmit interval of the remote system (the greater of
    // bfd.RequiredMinRxInterval and the last received Desired Min Tx
    // Interval).
    pub(crate) fn detection_time(&self) -> Option<u32> {
        self.state.remote.as_ref().map(|remote| {
            remote.multiplier as u32
                * std::cmp::max(self.state.req_min_rx_int, remote.min_tx)
        })
    }

    // Returns whether periodic transmission should be running.
    fn tx_should_run(&self) -> bool {
        if self.state.local_state == State::AdminDown {
            return false;
        }

        // A passive session does not speak until spoken to.
        if self.state.passive && self.remote_discr() == 0 {
            return false;
        }

        // Honor the remote system's Demand mode once both ends are Up and no
        // Poll Sequence is in progress.
        if let Some(remote) = &self.state.remote
            && remote.demand_mode
            && self.state.poll_active.is_empty()
            && self.state.local_state == State::Up
            && remote.state == State::Up
        {
            return false;
        }

        self.negotiated_tx_interval().is_some()
    }

    // (Re)starts or stops the periodic transmission of BFD packets.
    pub(crate) fn update_tx_interval(&mut self) {
        if let Some(socket_tx) = &self.state.socket_tx
            && self.tx_should_run()
        {
            // (Re)start the Tx task.
            let interval = self.negotiated_tx_interval().unwrap();
            let task = tasks::udp_tx_interval(self, interval, socket_tx);
            self.state.tx_interval = Some(task);
        } else {
            // Stop the Tx task.
            self.state.tx_interval = None;
        }
    }

    // Sends a single BFD control packet with the F-bit set.
    pub(crate) fn send_tx_final(&self) {
        if let Some(socket_tx) = &self.state.socket_tx {
            tasks::udp_tx_oneshot(self, socket_tx, true);
        }
    }

    // Sends a single BFD control packet reflecting the current state.
    pub(crate) fn send_tx_single(&self) {
        if let Some(socket_tx) = &self.state.socket_tx {
            tasks::udp_tx_oneshot(self, socket_tx, false);
        }
    }

    // (Re)sets the detection time (timeout) for this session.
    //
    // When `kick` is set the timeout restarts from the present moment (a
    // valid packet was just received); otherwise the existing deadline is
    // recomputed from the time of the last received packet.
    pub(crate) fn update_detection_time(
        &mut self,
        kick: bool,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        let Some(timeout) = self.detection_time() else {
            return;
        };
        let timeout = Duration::from_micros(timeout as u64);

        if kick {
            self.state.last_rx = Some(Instant::now());
            let task = tasks::detection_timer(self, timeout, detect_timerp);
            self.state.detection_timer = Some(task);
        } else if let Some(last_rx) = self.state.last_rx
            && let Some(timer) = &mut self.state.detection_timer
        {
            let deadline = last_rx + timeout;
            timer.reset(Some(
                deadline.saturating_duration_since(Instant::now()),
            ));
        }
    }

    // Updates the Desired Min Tx Interval.
    //
    // An increase is postponed until the Poll Sequence completes while the
    // session is Up; a decrease (and any change below Up) applies
    // immediately.
    pub(crate) fn set_min_tx(&mut self, val: u32) {
        if val == self.state.des_min_tx_new {
            return;
        }

        self.state.des_min_tx_new = val;

        if self.state.local_state != State::Up
            || val < self.state.des_min_tx_int
        {
            self.state.des_min_tx_int = val;
            self.update_tx_interval();
        }

        self.request_poll(PollFlags::TX);
    }

    // Updates the Required Min Rx Interval.
    //
    // A decrease is postponed until the Poll Sequence completes while the
    // session is Up; an increase (and any change below Up) applies
    // immediately.
    pub(crate) fn set_min_rx(
        &mut self,
        val: u32,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        if val == self.state.req_min_rx_new {
            return;
        }

        self.state.req_min_rx_new = val;

        if self.state.local_state != State::Up
            || val > self.state.req_min_rx_int
        {
            self.state.req_min_rx_int = val;
            self.update_detection_time(false, detect_timerp);
        }

        self.request_poll(PollFlags::RX);
    }

    // Initiates a Poll Sequence for the given interval change.
    //
    // If one is already in progress, the change is parked until the active
    // sequence completes.
    pub(crate) fn request_poll(&mut self, request: PollFlags) {
        // Polling a peer that never spoke to us has nothing to synchronize.
        if self.remote_discr() == 0 {
            return;
        }

        self.state.poll_scheduled |= request;

        if !self.state.poll_active.is_empty() {
            return;
        }

        self.state.poll_active = self.state.poll_scheduled;
        self.state.poll_scheduled = PollFlags::empty();
        self.sync_tx_poll();

        self.update_tx_interval();
    }

    // Terminates the active Poll Sequence, committing the interval changes it
    // carried and draining any parked changes into a fresh sequence.
    //
    // Timers are updated by the caller.
    pub(crate) fn terminate_poll(&mut self) {
        let poll_done = self.state.poll_active & !self.state.poll_scheduled;

        if poll_done.contains(PollFlags::TX) {
            self.state.des_min_tx_int = self.state.des_min_tx_new;
        }
        if poll_done.contains(PollFlags::RX) {
            self.state.req_min_rx_int = self.state.req_min_rx_new;
        }

        self.state.poll_active = self.state.poll_scheduled;
        self.state.poll_scheduled = PollFlags::empty();
        self.sync_tx_poll();
    }

    fn sync_tx_poll(&self) {
        self.state
            .tx_poll
            .store(!self.state.poll_active.is_empty(), Ordering::Relaxed);
    }

    // Generates a BFD Control packet according to the session's state and
    // configuration.
    pub fn generate_packet(&self) -> Packet {
        Packet {
            version: 1,
            diag: self.state.local_diag as u8,
            state: self.state.local_state,
            flags: PacketFlags::empty(),
            detect_mult: self.state.detect_mult,
            my_discr: self.state.local_discr,
            your_discr: self.remote_discr(),
            desired_min_tx: self.state.des_min_tx_new,
            req_min_rx: self.state.req_min_rx_new,
            req_min_echo_rx: 0,
            auth: None,
        }
    }

    // Produces a point-in-time copy of the session for the session listing.
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let published = self.published.get();
        let remote = self.state.remote.as_ref();

        SessionSnapshot {
            key: self.key,
            ifname: self.ifname.clone(),
            path_type: self.key.path_type(),
            local_state: self.state.local_state,
            remote_state: self.remote_state(),
            local_diag: self.state.local_diag,
            remote_diag: remote.map(|remote| remote.diag).unwrap_or(0),
            local_discr: self.state.local_discr,
            remote_discr: self.remote_discr(),
            last_state_change: published.last_state_change,
            local_multiplier: self.state.detect_mult,
            remote_multiplier: remote
                .map(|remote| remote.multiplier)
                .unwrap_or(0),
            demand_mode: false,
            remote_demand_mode: remote
                .map(|remote| remote.demand_mode)
                .unwrap_or(false),
            des_min_tx_int: self.state.des_min_tx_int,
            req_min_rx_int: self.state.req_min_rx_int,
            remote_min_tx_int: remote.map(|remote| remote.min_tx).unwrap_or(0),
            remote_min_rx_int: remote.map(|remote| remote.min_rx).unwrap_or(0),
            tx_interval: self.negotiated_tx_interval(),
            tx_remaining: self
                .state
                .tx_interval
                .as_ref()
                .map(|task| task.remaining()),
            detection_time: self.detection_time(),
            detection_remaining: self
                .state
                .detection_timer
                .as_ref()
                .map(|timer| timer.remaining()),
            auth_type: self.config.auth.as_ref().map(|auth| auth.auth_type),
            rx_seq: self.state.rx_seq,
            tx_seq: self.state.tx_seq.load(Ordering::Relaxed),
            rx_packet_count: self.statistics.rx_packet_count,
            tx_packet_count: self
                .statistics
                .tx_packet_count
                .load(Ordering::Relaxed),
            rx_error_count: self.statistics.rx_error_count,
            tx_error_count: self
                .statistics
                .tx_error_count
                .load(Ordering::Relaxed),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        Debug::SessionDelete(&self.key).log();
    }
}

// ===== impl SessionStatistics =====

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_down_time: None,
            last_up_time: None,
            down_count: 0,
            admin_down_count: 0,
            rx_packet_count: 0,
            tx_packet_count: Arc::new(AtomicU64::new(0)),
            rx_error_count: 0,
            tx_error_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ===== impl Sessions =====

impl Sessions {
    // Inserts a session into the arena, linking it to the lookup indexes.
    pub(crate) fn insert(&mut self, sess: Session) -> SessionIndex {
        let id = sess.id;
        let key = sess.key;
        let discr = sess.state.local_discr;
        let sess_idx = self.arena.insert(sess);
        self.id_tree.insert(id, sess_idx);
        self.key_tree.insert(key, sess_idx);
        self.discr_tree.insert(discr, sess_idx);
        sess_idx
    }

    // Removes a session from the arena and all lookup indexes.
    pub(crate) fn delete(&mut self, sess_idx: SessionIndex) -> Session {
        let sess = &self.arena[sess_idx];
        self.id_tree.remove(&sess.id);
        self.key_tree.remove(&sess.key);
        self.discr_tree.remove(&sess.state.local_discr);
        self.arena.remove(sess_idx).unwrap()
    }

    // Allocates an unused session ID.
    pub(crate) fn next_id(&mut self) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    // Draws a random free local discriminator. On collision, increment
    // (skipping zero) until a free slot is found.
    pub(crate) fn get_free_discr(&self) -> u32 {
        let mut discr = rand::rng().next_u32();
        loop {
            if discr != 0 && !self.discr_tree.contains_key(&discr) {
                return discr;
            }
            discr = discr.wrapping_add(1);
        }
    }

    // Returns a mutable reference to the session corresponding to the given
    // ID.
    pub(crate) fn get_mut_by_id(
        &mut self,
        id: SessionId,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
            .ok_or(Error::SessionIdNotFound(id))
    }

    // Returns a reference to the session corresponding to the given key.
    pub fn get_by_key(
        &self,
        key: &SessionKey,
    ) -> Option<(SessionIndex, &Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(|sess_idx| (sess_idx, &self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the given
    // key.
    pub(crate) fn get_mut_by_key(
        &mut self,
        key: &SessionKey,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the given
    // local discriminator.
    pub(crate) fn get_mut_by_discr(
        &mut self,
        discr: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns an iterator visiting all sessions.
    //
    // Sessions are ordered by their keys.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.key_tree
            .values()
            .map(|sess_idx| &self.arena[*sess_idx])
    }

    // Returns the indexes of all sessions.
    pub(crate) fn indexes(&self) -> Vec<SessionIndex> {
        self.key_tree.values().copied().collect()
    }
}

impl std::ops::Index<SessionIndex> for Sessions {
    type Output = Session;

    fn index(&self, index: SessionIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<SessionIndex> for Sessions {
    fn index_mut(&mut self, index: SessionIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}

// ===== impl SessionFilter =====

impl SessionFilter {
    // Checks whether the session matches the filter.
    pub(crate) fn matches(&self, sess: &Session) -> bool {
        if let Some(address) = &self.address
            && !address.contains(sess.key.addr)
        {
            return false;
        }
        if let Some(ifname) = &self.ifname
            && sess.ifname.as_deref() != Some(ifname.as_str())
        {
            return false;
        }
        if let Some(af) = &self.af
            && sess.key.addr.address_family() != *af
        {
            return false;
        }
        if let Some(path_type) = &self.path_type
            && sess.key.path_type() != *path_type
        {
            return false;
        }

        true
    }
}
