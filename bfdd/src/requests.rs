//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bfdd_utils::UnboundedSender;
use bfdd_utils::bfd::{IfaceId, SessionKey, State};
use bfdd_utils::task::Task;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::{EngineCfg, SessionOptions};
use crate::master::{self, Master};
use crate::neighbor::{self, NeighborState};
use crate::notify::{self, NotifyRx, PublishedState};
use crate::packet::DiagnosticCode;
use crate::session::{SessionFilter, SessionSnapshot};
use crate::tasks::messages::control::{
    ControlMsg, ReconfigureMsg, RequestAttachMsg, RequestDetachMsg,
    RequestUpdateMsg, SessionAdminMsg, ShowSessionsMsg,
};
use crate::error::Error;

pub type RequestId = u64;
pub type EngineId = u64;

// State transition delivered to a subscriber.
#[derive(Clone, Copy, Debug)]
pub struct RequestUpdate {
    pub state: State,
    pub diag: DiagnosticCode,
    pub old_state: State,
    // True for a loss-of-connectivity transition: the session left Up for
    // Down and the peer did not announce an administrative shutdown.
    pub down: bool,
}

// Subscriber callback.
pub type RequestHook = Arc<dyn Fn(RequestUpdate) + Send + Sync>;

// Owner handle for a session subscription. Dropping the handle releases the
// subscription.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    manager: BfdManager,
}

// Session listing of one engine.
#[derive(Clone, Debug)]
pub struct EngineSessions {
    pub name: String,
    pub sessions: Vec<SessionSnapshot>,
}

// Entry point to the BFD subsystem.
//
// Owns the running engines, the live subscriptions, and the wait list of
// subscriptions no engine has accepted yet.
#[derive(Clone, Debug, Default)]
pub struct BfdManager {
    inner: Arc<Mutex<ManagerInner>>,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerInner {
    pub(crate) engines: Vec<EngineRecord>,
    pub(crate) requests: HashMap<RequestId, RequestEntry>,
    // Request IDs attached to each session, mirroring the engine-side
    // attachment lists for notification dispatch.
    pub(crate) attachments: HashMap<(EngineId, SessionKey), Vec<RequestId>>,
    next_request_id: RequestId,
    next_engine_id: EngineId,
}

#[derive(Debug)]
pub(crate) struct EngineRecord {
    pub(crate) id: EngineId,
    pub(crate) name: String,
    pub(crate) config: EngineCfg,
    pub(crate) control_tx: UnboundedSender<ControlMsg>,
    pub(crate) neighbors: Vec<NeighborState>,
    _task: Task<()>,
    _notify_task: Task<()>,
}

pub(crate) struct RequestEntry {
    pub(crate) addr: IpAddr,
    pub(crate) local: IpAddr,
    pub(crate) iface: Option<IfaceId>,
    pub(crate) vrf: Option<String>,
    pub(crate) opts: SessionOptions,
    pub(crate) hook: Option<RequestHook>,
    // Last delivered state.
    pub(crate) state: State,
    pub(crate) diag: DiagnosticCode,
    pub(crate) old_state: State,
    pub(crate) down: bool,
    // Engine and session the request is attached to; `None` parks the
    // request on the wait list.
    pub(crate) binding: Option<(EngineId, SessionKey)>,
}

// A notification that must be delivered once the manager lock is dropped.
type DeferredNotify = (RequestHook, RequestUpdate);

// ===== impl BfdManager =====

impl BfdManager {
    pub fn new() -> BfdManager {
        Default::default()
    }

    // Starts a new BFD engine with the given configuration.
    //
    // Subscriptions waiting for an engine are adopted if the new engine
    // accepts them, and the engine's statically configured neighbors are
    // started.
    pub fn start_engine(
        &self,
        name: impl Into<String>,
        config: EngineCfg,
    ) -> EngineId {
        let name = name.into();

        let (notify_tx, notify_rx) = notify::channel();
        let (input_tx, input_rx) = master::input_channels();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let engine =
            Master::new(name.clone(), config.clone(), notify_tx, input_tx);
        let task = Task::spawn(engine.run(input_rx, control_rx));

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_engine_id;
        inner.next_engine_id += 1;

        let notify_task = spawn_notifier(self.clone(), id, notify_rx);
        let neighbors =
            config.neighbors.iter().cloned().map(NeighborState::new).collect();
        debug!(%name, engine = %id, "engine started");
        inner.engines.push(EngineRecord {
            id,
            name,
            config,
            control_tx,
            neighbors,
            _task: task,
            _notify_task: notify_task,
        });

        // Adopt subscriptions parked on the wait list.
        let mut deferred = Vec::new();
        let waiting = inner
            .requests
            .iter()
            .filter(|(_, request)| request.binding.is_none())
            .map(|(req_id, _)| *req_id)
            .collect::<Vec<_>>();
        for req_id in waiting {
            deferred.extend(inner.submit_request(req_id));
        }

        // Start statically configured neighbors.
        neighbor::start_neighbors(&mut inner, id);

        drop(inner);
        for (hook, update) in deferred {
            hook(update);
        }

        id
    }

    // Stops a BFD engine.
    //
    // Attached subscriptions are returned to submission; they re-park on the
    // wait list (with an AdminDown notification) if no other engine accepts
    // them.
    pub fn stop_engine(&self, id: EngineId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) =
            inner.engines.iter().position(|engine| engine.id == id)
        else {
            return;
        };
        let record = inner.engines.remove(pos);
        debug!(name = %record.name, engine = %id, "engine stopped");

        // Static neighbors go away with their engine.
        for neighbor in &record.neighbors {
            if let Some(req_id) = neighbor.req {
                inner.release_request(req_id);
            }
        }

        // Return the remaining subscriptions to submission.
        let req_ids = inner
            .attachments
            .iter()
            .filter(|((engine_id, _), _)| *engine_id == id)
            .flat_map(|(_, req_ids)| req_ids.iter().copied())
            .collect::<Vec<_>>();
        inner
            .attachments
            .retain(|(engine_id, _), _| *engine_id != id);

        let mut deferred = Vec::new();
        for req_id in req_ids {
            if let Some(request) = inner.requests.get_mut(&req_id) {
                request.binding = None;
                deferred.extend(inner.submit_request(req_id));
            }
        }

        // Dropping the record cancels the engine and notifier tasks, tearing
        // down all sessions and timers.
        drop(record);
        drop(inner);
        for (hook, update) in deferred {
            hook(update);
        }
    }

    // Applies a new configuration to a running engine.
    //
    // Changes to the `accept_*`, `strict_bind` or `zero_udp6_checksum_rx`
    // options require an engine restart and are refused.
    pub fn reconfigure_engine(
        &self,
        id: EngineId,
        config: EngineCfg,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) =
            inner.engines.iter().position(|engine| engine.id == id)
        else {
            return Err(Error::EngineNotFound(id));
        };
        if !inner.engines[pos].config.is_compatible(&config) {
            return Err(Error::NotReconfigurable);
        }

        let neighbors = config.neighbors.clone();
        inner.engines[pos].config = config.clone();
        let _ = inner.engines[pos]
            .control_tx
            .send(ControlMsg::Reconfigure(ReconfigureMsg { config }));

        neighbor::reconfigure_neighbors(&mut inner, pos, neighbors);

        Ok(())
    }

    // Creates a session subscription.
    //
    // The subscription outlives any particular engine: if no running engine
    // accepts it, it parks on the wait list in AdminDown state until one
    // does.
    pub fn request_session(
        &self,
        addr: IpAddr,
        local: IpAddr,
        iface: Option<IfaceId>,
        vrf: Option<String>,
        opts: SessionOptions,
        hook: impl Fn(RequestUpdate) + Send + Sync + 'static,
    ) -> RequestHandle {
        let (id, deferred) = {
            let mut inner = self.inner.lock().unwrap();
            inner.add_request(addr, local, iface, vrf, opts, Some(Arc::new(hook)))
        };
        if let Some((hook, update)) = deferred {
            hook(update);
        }

        RequestHandle {
            id,
            manager: self.clone(),
        }
    }

    // Updates the options of a subscription, reconfiguring the attached
    // session when they actually changed.
    pub fn update_request(
        &self,
        handle: &RequestHandle,
        opts: SessionOptions,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let Some(request) = inner.requests.get_mut(&handle.id) else {
            return;
        };
        if request.opts == opts {
            return;
        }
        request.opts = opts.clone();

        if let Some((engine_id, key)) = request.binding {
            let msg = ControlMsg::RequestUpdate(RequestUpdateMsg {
                req_id: handle.id,
                key,
                opts,
            });
            inner.engine_send(engine_id, msg);
        }
    }

    // Releases a subscription.
    //
    // Equivalent to dropping the handle; safe to call from within the
    // subscription's own callback.
    pub fn release(&self, handle: RequestHandle) {
        drop(handle);
    }

    // Reports a single-hop neighbor as reachable or gone, creating or
    // releasing the requests of matching statically configured neighbors.
    pub fn neighbor_update(&self, addr: IpAddr, ifindex: u32, up: bool) {
        let mut inner = self.inner.lock().unwrap();
        neighbor::neighbor_update(&mut inner, addr, ifindex, up);
    }

    // Puts a session administratively down (or back in service).
    pub fn session_admin_control(
        &self,
        id: EngineId,
        key: SessionKey,
        admin_down: bool,
    ) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        if !inner.engines.iter().any(|engine| engine.id == id) {
            return Err(Error::EngineNotFound(id));
        }
        let msg =
            ControlMsg::SessionAdmin(SessionAdminMsg { key, admin_down });
        inner.engine_send(id, msg);
        Ok(())
    }

    // Lists the sessions of all running engines.
    pub async fn show_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Vec<EngineSessions> {
        let targets = {
            let inner = self.inner.lock().unwrap();
            inner
                .engines
                .iter()
                .map(|engine| {
                    (engine.name.clone(), engine.control_tx.clone())
                })
                .collect::<Vec<_>>()
        };

        let mut output = Vec::new();
        for (name, control_tx) in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            let msg = ControlMsg::ShowSessions(ShowSessionsMsg {
                filter: filter.clone(),
                reply_tx,
            });
            if control_tx.send(msg).is_ok()
                && let Ok(sessions) = reply_rx.await
            {
                output.push(EngineSessions { name, sessions });
            }
        }

        output
    }

    // Delivers a published session state to every subscription attached to
    // the session.
    //
    // Callbacks run without the manager lock held, so a subscription may
    // release itself (or create new ones) from inside its own callback.
    pub(crate) fn dispatch_session_update(
        &self,
        engine_id: EngineId,
        key: SessionKey,
        published: PublishedState,
    ) {
        let req_ids = {
            let inner = self.inner.lock().unwrap();
            inner
                .attachments
                .get(&(engine_id, key))
                .cloned()
                .unwrap_or_default()
        };

        for req_id in req_ids {
            let deferred = {
                let mut inner = self.inner.lock().unwrap();
                let Some(request) = inner.requests.get_mut(&req_id) else {
                    // Released from a previous callback.
                    continue;
                };
                request_notify(
                    request,
                    published.local_state,
                    published.remote_state,
                    published.local_diag,
                )
            };
            if let Some((hook, update)) = deferred {
                hook(update);
            }
        }
    }

    fn release_request(&self, req_id: RequestId) {
        let mut inner = self.inner.lock().unwrap();
        inner.release_request(req_id);
    }
}

// ===== impl ManagerInner =====

impl ManagerInner {
    // Registers a new subscription and submits it to the running engines.
    pub(crate) fn add_request(
        &mut self,
        addr: IpAddr,
        local: IpAddr,
        iface: Option<IfaceId>,
        vrf: Option<String>,
        opts: SessionOptions,
        hook: Option<RequestHook>,
    ) -> (RequestId, Option<DeferredNotify>) {
        let req_id = self.next_request_id;
        self.next_request_id += 1;

        self.requests.insert(
            req_id,
            RequestEntry {
                addr,
                local,
                iface,
                vrf,
                opts,
                hook,
                state: State::AdminDown,
                diag: DiagnosticCode::Nothing,
                old_state: State::AdminDown,
                down: false,
                binding: None,
            },
        );

        let deferred = self.submit_request(req_id);
        (req_id, deferred)
    }

    // Walks the list of running engines and attaches the subscription to the
    // first that accepts it. A subscription nobody accepts parks on the wait
    // list and is reported administratively down.
    pub(crate) fn submit_request(
        &mut self,
        req_id: RequestId,
    ) -> Option<DeferredNotify> {
        let request = self.requests.get(&req_id)?;
        let target = self
            .engines
            .iter()
            .find(|engine| engine_accepts(&engine.config, request))
            .map(|engine| (engine.id, engine.control_tx.clone()));

        let request = self.requests.get_mut(&req_id).unwrap();
        match target {
            Some((engine_id, control_tx)) => {
                let key = SessionKey::new(
                    request.addr,
                    request.iface.as_ref().map(|i| i.ifindex).unwrap_or(0),
                );
                request.binding = Some((engine_id, key));
                let msg = ControlMsg::RequestAttach(RequestAttachMsg {
                    req_id,
                    addr: request.addr,
                    local: request.local,
                    iface: request.iface.clone(),
                    opts: request.opts.clone(),
                });
                self.attachments
                    .entry((engine_id, key))
                    .or_default()
                    .push(req_id);
                let _ = control_tx.send(msg);
                None
            }
            None => {
                request.binding = None;
                request_notify(
                    request,
                    State::AdminDown,
                    State::AdminDown,
                    DiagnosticCode::Nothing,
                )
            }
        }
    }

    // Removes a subscription, detaching it from its session.
    pub(crate) fn release_request(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.remove(&req_id) else {
            return;
        };
        if let Some((engine_id, key)) = request.binding {
            if let Some(req_ids) = self.attachments.get_mut(&(engine_id, key))
            {
                req_ids.retain(|id| *id != req_id);
                if req_ids.is_empty() {
                    self.attachments.remove(&(engine_id, key));
                }
            }
            let msg =
                ControlMsg::RequestDetach(RequestDetachMsg { req_id, key });
            self.engine_send(engine_id, msg);
        }
    }

    fn engine_send(&self, engine_id: EngineId, msg: ControlMsg) {
        if let Some(engine) =
            self.engines.iter().find(|engine| engine.id == engine_id)
        {
            let _ = engine.control_tx.send(msg);
        }
    }
}

impl std::fmt::Debug for RequestEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEntry")
            .field("addr", &self.addr)
            .field("local", &self.local)
            .field("iface", &self.iface)
            .field("vrf", &self.vrf)
            .field("state", &self.state)
            .field("diag", &self.diag)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

// ===== impl RequestHandle =====

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.manager.release_request(self.id);
    }
}

// ===== helper functions =====

// Checks whether the engine configuration accepts the subscription: the VRF
// must match, and the address family and path type must be admitted.
fn engine_accepts(config: &EngineCfg, request: &RequestEntry) -> bool {
    if config.vrf.is_some() && config.vrf != request.vrf {
        return false;
    }
    let af_ok = match request.addr {
        IpAddr::V4(_) => config.accept_ipv4,
        IpAddr::V6(_) => config.accept_ipv6,
    };
    let mode_ok = if request.iface.is_some() {
        config.accept_direct
    } else {
        config.accept_multihop
    };
    af_ok && mode_ok
}

// Records a state transition on the subscription, returning the callback to
// invoke when the state actually changed since the last delivery.
fn request_notify(
    request: &mut RequestEntry,
    state: State,
    remote: State,
    diag: DiagnosticCode,
) -> Option<DeferredNotify> {
    if state == request.state && diag == request.diag {
        return None;
    }

    let old_state = request.state;
    request.old_state = old_state;
    request.state = state;
    request.diag = diag;
    request.down = old_state == State::Up
        && state == State::Down
        && remote != State::AdminDown;

    let hook = request.hook.clone()?;
    let update = RequestUpdate {
        state,
        diag,
        old_state,
        down: request.down,
    };
    Some((hook, update))
}

// Notifier task: drains the engine's pending-notification list and invokes
// the attached subscription callbacks.
fn spawn_notifier(
    manager: BfdManager,
    engine_id: EngineId,
    mut notify_rx: NotifyRx,
) -> Task<()> {
    Task::spawn(async move {
        while let Some(entries) = notify_rx.recv().await {
            for entry in entries {
                let published = entry.published.get();
                manager.dispatch_session_update(
                    engine_id,
                    entry.key,
                    published,
                );
            }
        }
    })
}
