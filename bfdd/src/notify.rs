//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bfdd_utils::bfd::{SessionKey, State};
use bfdd_utils::{Receiver, Sender};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::packet::DiagnosticCode;

// Session fields published to the control side.
//
// The session task updates these on every state transition; the notifier and
// snapshot readers access them without entering the session task. The lock
// protects a handful of plain fields and is never held across a suspension
// point.
#[derive(Debug)]
pub struct SessionPublished {
    state: Mutex<PublishedState>,
    // Whether the session is linked on the pending-notification list.
    linked: AtomicBool,
}

#[derive(Clone, Copy, Debug)]
pub struct PublishedState {
    pub local_state: State,
    pub remote_state: State,
    pub local_diag: DiagnosticCode,
    pub last_state_change: Option<DateTime<Utc>>,
}

// A session scheduled for client notification.
#[derive(Debug)]
pub struct NotifyEntry {
    pub key: SessionKey,
    pub published: Arc<SessionPublished>,
}

// Sending half of the notification channel, owned by the session task.
#[derive(Clone, Debug)]
pub struct NotifyTx {
    pending: Arc<Mutex<Vec<NotifyEntry>>>,
    kick_tx: Sender<()>,
}

// Receiving half of the notification channel, owned by the notifier.
#[derive(Debug)]
pub struct NotifyRx {
    pending: Arc<Mutex<Vec<NotifyEntry>>>,
    kick_rx: Receiver<()>,
}

// Creates a new notification channel pair.
pub fn channel() -> (NotifyTx, NotifyRx) {
    let pending = Arc::new(Mutex::new(Vec::new()));
    let (kick_tx, kick_rx) = mpsc::channel(1);

    let tx = NotifyTx {
        pending: pending.clone(),
        kick_tx,
    };
    let rx = NotifyRx { pending, kick_rx };

    (tx, rx)
}

// ===== impl SessionPublished =====

impl SessionPublished {
    pub(crate) fn new() -> Arc<SessionPublished> {
        Arc::new(SessionPublished {
            state: Mutex::new(PublishedState {
                local_state: State::Down,
                remote_state: State::Down,
                local_diag: DiagnosticCode::Nothing,
                last_state_change: None,
            }),
            linked: AtomicBool::new(false),
        })
    }

    // Returns a copy of the published fields.
    pub fn get(&self) -> PublishedState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set(&self, state: PublishedState) {
        *self.state.lock().unwrap() = state;
    }
}

// ===== impl NotifyTx =====

impl NotifyTx {
    // Links the session onto the pending-notification list and wakes the
    // notifier.
    //
    // A session that is already linked is left in place, and the kick channel
    // being full coalesces duplicate wakeups.
    pub(crate) fn schedule(
        &self,
        key: SessionKey,
        published: Arc<SessionPublished>,
    ) {
        if published.linked.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending
            .lock()
            .unwrap()
            .push(NotifyEntry { key, published });
        let _ = self.kick_tx.try_send(());
    }
}

// ===== impl NotifyRx =====

impl NotifyRx {
    // Waits for a kick and splices the pending list.
    //
    // Returns `None` once the session task is gone and no notifications are
    // left.
    pub async fn recv(&mut self) -> Option<Vec<NotifyEntry>> {
        self.kick_rx.recv().await?;
        Some(self.drain())
    }

    // Splices the pending list, unlinking every session on it.
    pub fn drain(&mut self) -> Vec<NotifyEntry> {
        let entries = std::mem::take(&mut *self.pending.lock().unwrap());
        for entry in &entries {
            entry.published.linked.store(false, Ordering::Release);
        }
        entries
    }
}
