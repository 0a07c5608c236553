//! The single-flight operation scheduler
//!
//! The scheduler owns one ordered queue of pending operations and at most
//! one executing operation. Nothing here blocks: an executing operation sits
//! in its slot across many [`Scheduler::tick`] calls until the owner ends it
//! with a native reply, a timeout, or a displacement rule.
//!
//! Ending an operation never dequeues the next one directly. The scheduler
//! records whether the ending state allows immediate continuation, and the
//! owner calls [`Scheduler::pump`] once it has reacted to the completion.
//! `pump` honors the per-pass depth cap, so a cascade of operations that end
//! synchronously is spread across ticks instead of growing without bound.

use bytes::Bytes;
use gattmux_core::{OperationKind, OperationState, SchedulerConfig, Target, TimeoutConfig};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::compat::{self, Relation, Slot};
use crate::operation::{Completion, OpId, Operation};

/// Result of asking the executor to start an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// The native call was issued; wait for the reply
    Started,
    /// The desired outcome already holds
    Redundant,
    /// The transport refused the call
    FailedImmediately(Option<i32>),
}

/// Bridge between the scheduler and whatever owns device state and the
/// transport
pub trait Executor {
    /// Whether the operation's preconditions hold right now
    fn is_armable(&self, op: &Operation) -> bool;

    /// Issue the operation
    fn execute(&mut self, op: &Operation) -> Execution;
}

/// Priority queue plus a single executing slot
pub struct Scheduler {
    queue: VecDeque<Operation>,
    current: Option<Operation>,
    next_ordinal: u64,
    since_last_end: Duration,
    continue_now: bool,
    depth: usize,
    delay_between: Duration,
    max_depth: usize,
    timeouts: TimeoutConfig,
    completed: Vec<Completion>,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: &SchedulerConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            next_ordinal: 0,
            since_last_end: config.delay_between_operations,
            continue_now: false,
            depth: 0,
            delay_between: config.delay_between_operations,
            max_depth: config.max_dequeue_depth.max(1),
            timeouts,
            completed: Vec::new(),
        }
    }

    /// Insert an operation.
    ///
    /// Against the executing operation the compatibility table decides
    /// between cancelling it, interrupting it (it runs again right after the
    /// newcomer and keeps its callback), softly cancelling it, or leaving it
    /// alone. In the last case the newcomer goes in front of the first queued
    /// operation with a strictly lower priority, which keeps equal priorities
    /// in ordinal order.
    pub fn enqueue(&mut self, mut op: Operation) -> OpId {
        let id = OpId(op.assign_ordinal(&mut self.next_ordinal));
        op.set_state(OperationState::Queued);

        for queued in self.queue.iter_mut() {
            if compat::relation(Slot::Queued, &op, queued) == Relation::SoftlyCancels
                && !queued.is_softly_cancelled()
            {
                debug!(op = %queued, by = %op, "Marked queued operation redundant");
                queued.mark_soft_cancelled();
            }
        }

        let relation = self
            .current
            .as_ref()
            .map(|current| compat::relation(Slot::Executing, &op, current))
            .unwrap_or(Relation::Unrelated);

        match relation {
            Relation::Cancels => {
                self.end_current(OperationState::Cancelled, None, Bytes::new());
                debug!(op = %op, "Placed at front after cancelling executing operation");
                self.queue.push_front(op);
            }
            Relation::SoftlyCancels => {
                self.end_current(OperationState::SoftlyCancelled, None, Bytes::new());
                debug!(op = %op, "Placed at front after softly cancelling executing operation");
                self.queue.push_front(op);
            }
            Relation::Interrupts => {
                if let Some(mut current) = self.current.take() {
                    let resumed = current.resumption();
                    self.finish_executing(current, OperationState::Interrupted, None, Bytes::new());
                    debug!(op = %op, resumes = %resumed, "Interrupted executing operation");
                    self.queue.push_front(resumed);
                }
                self.queue.push_front(op);
            }
            Relation::Unrelated => {
                let position = self
                    .queue
                    .iter()
                    .position(|queued| queued.priority() < op.priority())
                    .unwrap_or(self.queue.len());
                trace!(op = %op, position, "Enqueued");
                self.queue.insert(position, op);
            }
        }

        id
    }

    /// Advance time.
    ///
    /// The executing operation accumulates `dt` and ends as TIMED_OUT once it
    /// exceeds its timeout. When the slot is free and the inter-operation
    /// delay has passed, the first armable queued operation is started.
    pub fn tick<E: Executor>(&mut self, dt: Duration, executor: &mut E) {
        self.begin_pass();

        if let Some(current) = self.current.as_mut() {
            current.advance(dt);
            let limit = self.timeouts.timeout_for(current.kind());
            if let Some(limit) = limit {
                if current.elapsed() >= limit {
                    warn!(op = %current, timeout = ?limit, "Operation timed out");
                    self.end_current(OperationState::TimedOut, None, Bytes::new());
                }
            }
            return;
        }

        self.since_last_end += dt;
        if !self.queue.is_empty() && self.since_last_end >= self.delay_between {
            self.depth += 1;
            self.dequeue(executor);
        }
    }

    /// Start a new cooperative pass; resets the dequeue depth counter
    pub fn begin_pass(&mut self) {
        self.depth = 0;
    }

    /// Dequeue the next operation if the last ending allowed immediate
    /// continuation. Returns whether anything was dequeued.
    pub fn pump<E: Executor>(&mut self, executor: &mut E) -> bool {
        if !self.continue_now {
            return false;
        }
        self.continue_now = false;

        if self.current.is_some() || self.queue.is_empty() {
            return false;
        }
        if self.depth >= self.max_depth {
            debug!(depth = self.depth, "Dequeue depth reached, deferring to next tick");
            return false;
        }

        self.depth += 1;
        self.dequeue(executor)
    }

    /// Whether [`pump`](Self::pump) would try to dequeue
    pub fn wants_pump(&self) -> bool {
        self.continue_now && self.current.is_none() && !self.queue.is_empty()
    }

    fn dequeue<E: Executor>(&mut self, executor: &mut E) -> bool {
        if let Some(current) = &self.current {
            error!(
                op = %current,
                "Invariant violated: dequeue while an operation is executing; failing it"
            );
            self.end_current(OperationState::Failed, None, Bytes::new());
        }

        let Some(index) = self.queue.iter().position(|op| executor.is_armable(op)) else {
            trace!(queued = self.queue.len(), "Nothing armable");
            return false;
        };
        let Some(mut op) = self.queue.remove(index) else {
            return false;
        };

        op.set_state(OperationState::Armed);
        let execution = executor.execute(&op);
        op.set_state(OperationState::Executing);
        debug!(op = %op, priority = %op.priority(), "Executing");
        self.current = Some(op);

        match execution {
            Execution::Started => {}
            Execution::Redundant => {
                self.end_current(OperationState::Redundant, None, Bytes::new());
            }
            Execution::FailedImmediately(status) => {
                self.end_current(OperationState::FailedImmediately, status, Bytes::new());
            }
        }
        true
    }

    /// End an operation by id, whether executing or queued.
    ///
    /// Returns `false` if no live operation has that id.
    pub fn end(
        &mut self,
        id: OpId,
        state: OperationState,
        native_status: Option<i32>,
        payload: Bytes,
    ) -> bool {
        if self.current.as_ref().and_then(|c| c.id()) == Some(id) {
            return self.end_current(state, native_status, payload).is_some();
        }

        match self.queue.iter().position(|op| op.id() == Some(id)) {
            Some(index) => {
                if let Some(op) = self.queue.remove(index) {
                    self.finish(op, state, native_status, payload);
                }
                true
            }
            None => {
                debug!(id = %id, "End requested for an operation that is no longer live");
                false
            }
        }
    }

    /// End the executing operation. Returns its id.
    pub fn end_current(
        &mut self,
        state: OperationState,
        native_status: Option<i32>,
        payload: Bytes,
    ) -> Option<OpId> {
        let Some(current) = self.current.take() else {
            warn!(state = %state, "End requested with no executing operation");
            return None;
        };
        let id = current.id();
        self.finish_executing(current, state, native_status, payload);
        id
    }

    /// End the executing operation if it matches `kind` and `target`, the
    /// way native replies are routed. Returns `false` for stale replies.
    pub fn end_matching(
        &mut self,
        kind: OperationKind,
        target: &Target,
        state: OperationState,
        native_status: Option<i32>,
        payload: Bytes,
    ) -> bool {
        if !self.is_current(kind, target) {
            debug!(kind = %kind, target = %target, "Reply does not match the executing operation");
            return false;
        }
        self.end_current(state, native_status, payload).is_some()
    }

    fn finish_executing(
        &mut self,
        op: Operation,
        state: OperationState,
        native_status: Option<i32>,
        payload: Bytes,
    ) {
        self.since_last_end = Duration::ZERO;
        let state = self.finish(op, state, native_status, payload);
        self.continue_now = state.can_continue_immediately() && self.delay_between.is_zero();
    }

    fn finish(
        &mut self,
        mut op: Operation,
        state: OperationState,
        native_status: Option<i32>,
        payload: Bytes,
    ) -> OperationState {
        let mut state = state;
        if !state.is_terminal() {
            error!(
                op = %op,
                state = %state,
                "Invariant violated: ending with a non-terminal state; treating as failed"
            );
            state = OperationState::Failed;
        }
        if state == OperationState::ClearedFromQueue && op.is_softly_cancelled() {
            state = OperationState::SoftlyCancelled;
        }

        op.set_state(state);
        let completion = op.completion(native_status, payload);
        if let Some(callback) = op.take_callback() {
            callback(&completion);
        }

        if state.is_failure() {
            warn!(op = %op, state = %state, status = ?native_status, "Operation failed");
        } else {
            debug!(op = %op, state = %state, "Operation ended");
        }

        self.completed.push(completion);
        state
    }

    /// Remove queued operations of `kind` on `target`. Softly cancelled ones
    /// report SOFTLY_CANCELLED, the rest CLEARED_FROM_QUEUE.
    pub fn clear_queue_of(&mut self, kind: OperationKind, target: &Target) -> usize {
        self.remove_queued(|op| op.matches(kind, target), OperationState::ClearedFromQueue)
    }

    /// Remove every queued operation the predicate selects
    pub fn clear_queue_matching<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&Operation) -> bool,
    {
        self.remove_queued(predicate, OperationState::ClearedFromQueue)
    }

    /// Remove queued operations of `kind` on `target`, reporting CANCELLED
    pub fn cancel_queued_of(&mut self, kind: OperationKind, target: &Target) -> usize {
        self.remove_queued(|op| op.matches(kind, target), OperationState::Cancelled)
    }

    fn remove_queued<P>(&mut self, predicate: P, state: OperationState) -> usize
    where
        P: Fn(&Operation) -> bool,
    {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        let mut removed = Vec::new();
        for op in self.queue.drain(..) {
            if predicate(&op) {
                removed.push(op);
            } else {
                kept.push_back(op);
            }
        }
        self.queue = kept;

        let count = removed.len();
        for op in removed {
            self.finish(op, state, None, Bytes::new());
        }
        count
    }

    // ----- introspection -----

    /// The executing operation
    pub fn current(&self) -> Option<&Operation> {
        self.current.as_ref()
    }

    /// The executing operation, if it has this kind and target
    pub fn current_of(&self, kind: OperationKind, target: &Target) -> Option<&Operation> {
        self.current.as_ref().filter(|op| op.matches(kind, target))
    }

    /// Whether the executing operation has this kind and target
    pub fn is_current(&self, kind: OperationKind, target: &Target) -> bool {
        self.current_of(kind, target).is_some()
    }

    /// Whether an operation of this kind and target is queued
    pub fn is_queued(&self, kind: OperationKind, target: &Target) -> bool {
        self.position_in_queue(kind, target).is_some()
    }

    /// Index of the first queued operation of this kind and target
    pub fn position_in_queue(&self, kind: OperationKind, target: &Target) -> Option<usize> {
        self.queue.iter().position(|op| op.matches(kind, target))
    }

    /// Whether this kind and target is executing or queued
    pub fn is_pending(&self, kind: OperationKind, target: &Target) -> bool {
        self.is_current(kind, target) || self.is_queued(kind, target)
    }

    /// Queued operations in execution order
    pub fn queued(&self) -> impl Iterator<Item = &Operation> {
        self.queue.iter()
    }

    /// Number of queued operations
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing executing and nothing queued
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Take the completions recorded since the last call
    pub fn take_completed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completed)
    }

    /// Whether completions are waiting to be taken
    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }
}
