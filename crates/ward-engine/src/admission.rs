//! Concurrency admission control.
//!
//! A single counter bounded by the configured capacity. Admission either
//! takes capacity immediately or fails immediately; there is no queue.
//! Capacity comes back through [`ConcurrencySlot::release`], which is
//! idempotent, or when the slot is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::model::ExecutionId;

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionRejected {
    /// Every slot is taken.
    #[error("concurrency limit reached (max {capacity} concurrent executions)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },
    /// The controller no longer admits anything.
    #[error("admission is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct AdmissionState {
    in_use: usize,
    closed: bool,
}

/// Bounded-capacity gate shared by every execution.
#[derive(Debug)]
pub struct AdmissionController {
    capacity: usize,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// A controller admitting at most `capacity` executions at once.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(AdmissionState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, AdmissionState> {
        // the counter stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically check and take one unit of capacity.
    pub fn try_admit(
        self: &Arc<Self>,
        execution_id: ExecutionId,
    ) -> Result<ConcurrencySlot, AdmissionRejected> {
        let mut state = self.state();
        if state.closed {
            return Err(AdmissionRejected::Closed);
        }
        if state.in_use >= self.capacity {
            tracing::debug!(
                execution_id = %execution_id,
                capacity = self.capacity,
                "admission rejected"
            );
            return Err(AdmissionRejected::Full {
                capacity: self.capacity,
            });
        }
        state.in_use += 1;
        drop(state);

        Ok(ConcurrencySlot {
            controller: Arc::clone(self),
            execution_id,
            released: AtomicBool::new(false),
        })
    }

    /// Refuse all further admissions. Slots already granted stay valid.
    pub fn close(&self) {
        self.state().closed = true;
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.state().in_use
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }

    fn give_back(&self) {
        let mut state = self.state();
        state.in_use = state.in_use.saturating_sub(1);
    }
}

/// Lease on one unit of capacity, held for an execution's whole run.
#[derive(Debug)]
pub struct ConcurrencySlot {
    controller: Arc<AdmissionController>,
    execution_id: ExecutionId,
    released: AtomicBool,
}

impl ConcurrencySlot {
    /// The execution holding this slot.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Return the capacity. Only the first call has an effect; it returns
    /// `true`, every later call returns `false`.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.controller.give_back();
        tracing::debug!(execution_id = %self.execution_id, "concurrency slot released");
        true
    }

    /// Whether the slot was already released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.release();
    }
}
