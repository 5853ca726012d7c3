//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_new::new;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio::{task, time};
use tracing::{Instrument, error};

/// A handle which can be used to manipulate the task created by the
/// [`Task::spawn`] function.
///
/// By default, dropping this handle cancels the task (unless [`Task::detach`]
/// is used).
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

/// A handle which can be used to manipulate the timeout task created by the
/// [`TimeoutTask::new`] function.
///
/// Dropping this handle cancels the timeout task.
#[derive(Debug)]
pub struct TimeoutTask {
    #[cfg(not(feature = "testing"))]
    inner: TimeoutTaskInner,
}

#[derive(Debug, new)]
struct TimeoutTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
    next: Arc<Mutex<Instant>>,
}

/// A handle which can be used to manipulate the interval task created by the
/// [`IntervalTask::new`] function.
///
/// Each tick is scheduled independently, at a uniformly random offset inside
/// `[low, high]` after the previous tick. Passing `low == high` yields a
/// plain fixed-interval timer.
///
/// Dropping this handle cancels the interval task.
#[derive(Debug)]
pub struct IntervalTask {
    #[cfg(not(feature = "testing"))]
    inner: IntervalTaskInner,
}

#[derive(Debug, new)]
struct IntervalTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
    next: Arc<Mutex<Instant>>,
}

#[derive(Debug)]
enum Message {
    Reset(Option<(Duration, Duration)>),
}

// Samples the delay until the next tick.
fn sample_interval(low: Duration, high: Duration) -> Duration {
    if high > low {
        rand::rng().random_range(low..=high)
    } else {
        low
    }
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    /// Detach the task, meaning it will no longer be canceled if its handle is
    /// dropped.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a new task that will call the provided async closure when the
    /// specified timeout expires.
    ///
    /// Returns a handle that can be used to manipulate the timeout task.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let next = Instant::now() + timeout;
        let next = Arc::new(Mutex::new(next));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let timeout_fut = tokio::time::sleep(timeout);
                tokio::pin!(timeout_fut);

                loop {
                    tokio::select! {
                        // Timeout has expired.
                        _ = &mut timeout_fut => {
                            (cb)().await;
                            break;
                        }
                        message = control_rx.recv() => {
                            match message {
                                // Timeout has been refreshed/updated.
                                Some(Message::Reset(None)) => {
                                    let next = Instant::now() + timeout;
                                    timeout_fut.as_mut().reset(next);
                                    *next_child.lock().unwrap() = next;
                                },
                                Some(Message::Reset(Some((new_timeout, _)))) => {
                                    let next = Instant::now() + new_timeout;
                                    timeout_fut.as_mut().reset(next);
                                    *next_child.lock().unwrap() = next;
                                },
                                // Timeout has been aborted.
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            inner: TimeoutTaskInner::new(task, control_tx, next),
        }
    }

    #[cfg(feature = "testing")]
    pub fn new<F, Fut>(_timeout: Duration, _cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        TimeoutTask {}
    }

    /// Resets the timeout, regardless if it has already expired or not.
    ///
    /// If a new timeout value isn't specified, the last value will be reused.
    pub fn reset(&mut self, timeout: Option<Duration>) {
        #[cfg(not(feature = "testing"))]
        {
            let timeout = timeout.map(|timeout| (timeout, timeout));
            if self.inner.control.send(Message::Reset(timeout)).is_err() {
                error!("failed to reset timeout");
            }
        }
    }

    /// Returns the remaining time before the timeout expires.
    pub fn remaining(&self) -> Duration {
        #[cfg(not(feature = "testing"))]
        {
            let next = self.inner.next.lock().unwrap();
            next.saturating_duration_since(Instant::now())
        }
        #[cfg(feature = "testing")]
        {
            Duration::ZERO
        }
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Spawns a new task that will call the provided async closure whenever
    /// the interval timer ticks. The delay before each tick is sampled
    /// uniformly from `[low, high]`.
    ///
    /// Returns a handle that can be used to manipulate the interval task.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(
        low: Duration,
        high: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let next = Instant::now() + sample_interval(low, high);
        let next = Arc::new(Mutex::new(next));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let mut low = low;
                let mut high = high;
                let mut next = if tick_on_start {
                    Instant::now()
                } else {
                    Instant::now() + sample_interval(low, high)
                };

                loop {
                    let sleep_fut = time::sleep_until(next);
                    tokio::pin!(sleep_fut);

                    tokio::select! {
                        // Interval timer has ticked.
                        _ = &mut sleep_fut => {
                            (cb)().await;
                            next = Instant::now() + sample_interval(low, high);
                            *next_child.lock().unwrap() = next;
                        }
                        message = control_rx.recv() => {
                            match message {
                                // Interval timer has been updated.
                                Some(Message::Reset(spec)) => {
                                    if let Some((new_low, new_high)) = spec {
                                        low = new_low;
                                        high = new_high;
                                    }
                                    next = Instant::now()
                                        + sample_interval(low, high);
                                    *next_child.lock().unwrap() = next;
                                },
                                // Interval timer has been aborted.
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        IntervalTask {
            inner: IntervalTaskInner::new(task, control_tx, next),
        }
    }

    #[cfg(feature = "testing")]
    pub fn new<F, Fut>(
        _low: Duration,
        _high: Duration,
        _tick_on_start: bool,
        _cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        IntervalTask {}
    }

    /// Resets the interval.
    ///
    /// If a new interval range isn't specified, the last one will be reused.
    pub fn reset(&mut self, spec: Option<(Duration, Duration)>) {
        #[cfg(not(feature = "testing"))]
        {
            if self.inner.control.send(Message::Reset(spec)).is_err() {
                error!("failed to reset interval");
            }
        }
    }

    /// Returns the remaining time before the next interval tick.
    pub fn remaining(&self) -> Duration {
        #[cfg(not(feature = "testing"))]
        {
            let next = self.inner.next.lock().unwrap();
            next.saturating_duration_since(Instant::now())
        }
        #[cfg(feature = "testing")]
        {
            Duration::ZERO
        }
    }
}
