//! Concurrency Gate: bounds the number of simultaneous runs.
//!
//! `running` and `capacity` live under one mutex, so the check and the
//! increment in [`ConcurrencyGate::try_acquire`] are a single step. Waiters
//! use a [`Notify`]; `release` wakes one, `set_capacity` and `close` wake all.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug)]
struct GateState {
    running: usize,
    capacity: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
    notify: Notify,
}

/// Result of a non-blocking admission check.
#[derive(Debug)]
pub enum Admission {
    Admitted(GatePermit),
    /// Every slot is taken.
    Skipped { running: usize, capacity: usize },
    /// The gate was closed for shutdown.
    Closed,
}

impl ConcurrencyGate {
    /// `capacity` below 1 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                running: 0,
                capacity: capacity.max(1),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot if one is free. No side effect on failure.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.running >= state.capacity {
            return false;
        }
        state.running += 1;
        true
    }

    /// Wait for a slot. Returns `false` if the gate is closed first.
    pub async fn acquire(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return false;
                }
                if state.running < state.capacity {
                    state.running += 1;
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Give a slot back and wake one waiter.
    pub fn release(&self) {
        {
            let mut state = self.lock();
            if state.running == 0 {
                warn!("concurrency gate released more often than acquired");
                return;
            }
            state.running -= 1;
        }
        self.notify.notify_one();
    }

    /// Change the capacity. In-flight runs above a lowered capacity keep
    /// their slots; new admissions wait until `running` drops below it.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        {
            let mut state = self.lock();
            if state.capacity == capacity {
                return;
            }
            info!(from = state.capacity, to = capacity, "concurrency capacity changed");
            state.capacity = capacity;
        }
        self.notify.notify_waiters();
    }

    /// Refuse every future admission and wake all waiters. Runs already
    /// admitted are unaffected.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Non-blocking admission that hands back an RAII permit.
    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.lock();
        if state.closed {
            return Admission::Closed;
        }
        if state.running >= state.capacity {
            return Admission::Skipped {
                running: state.running,
                capacity: state.capacity,
            };
        }
        state.running += 1;
        drop(state);
        Admission::Admitted(GatePermit {
            gate: Arc::clone(self),
        })
    }

    /// Wait for a slot and hand back a permit; `None` once closed.
    pub async fn acquire_owned(self: &Arc<Self>) -> Option<GatePermit> {
        if self.acquire().await {
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// One admitted slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
