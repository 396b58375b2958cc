//! Per-request timeout handling.
//!
//! A stuck I/O command first gets an abort. If it times out again, or if the stuck command is on
//! the admin queue, the controller is disabled and reset instead.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::command::Command;
use crate::device::Device;
use crate::error::NvmeError;
use crate::queue::QueueRole;
use crate::regs::Csts;
use crate::request::Request;
use crate::state::CtrlState;

/// What the caller of [`Device::handle_timeout`] should do with the request's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// The request has been completed or cancelled.
    Done,
    /// Keep waiting for the request with a fresh deadline.
    ResetTimer,
}

/// Device-wide bound on abort commands in flight.
#[derive(Debug)]
pub struct AbortBudget {
    available: AtomicI32,
}

impl AbortBudget {
    pub fn new(limit: u16) -> Self {
        Self {
            available: AtomicI32::new(limit as i32),
        }
    }

    /// Resets the budget to `limit` free slots. Called while no aborts are outstanding.
    pub fn set_limit(&self, limit: u16) {
        self.available.store(limit as i32, Ordering::Release);
    }

    pub fn available(&self) -> i32 {
        self.available.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> bool {
        if self.available.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.available.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

impl Device {
    fn should_reset(&self, csts: Csts) -> bool {
        // A reset already in progress is not restarted.
        if matches!(self.state(), CtrlState::Resetting | CtrlState::Connecting) {
            return false;
        }
        csts.contains(Csts::CFS)
    }

    /// Runs the timeout state machine for the request on `tag` of `role`'s queue.
    pub fn handle_timeout(&self, role: QueueRole, tag: u16) -> TimeoutAction {
        let qid = role.qid();
        let csts = self.csts();
        if self.should_reset(csts) {
            tracing::warn!(csts = format_args!("{:#x}", csts.bits()), "controller is down; will reset");
            self.disable(false);
            self.schedule_reset();
            return TimeoutAction::Done;
        }

        let Some(queue) = self.queue(role) else {
            return TimeoutAction::Done;
        };
        // Did we miss an interrupt?
        self.drain(role);
        if !queue.requests().is_outstanding(tag) {
            tracing::warn!(tag, qid, "I/O timeout, completion polled");
            return TimeoutAction::Done;
        }

        match self.state() {
            CtrlState::Connecting | CtrlState::Deleting => {
                self.change_state(CtrlState::Deleting);
                tracing::warn!(tag, qid, "I/O timeout, disable controller");
                self.disable(true);
                return TimeoutAction::Done;
            }
            CtrlState::Resetting => return TimeoutAction::ResetTimer,
            CtrlState::New | CtrlState::Live => {}
        }

        let aborted = queue
            .requests()
            .with_request(tag, |r| r.aborted)
            .unwrap_or(false);
        if role == QueueRole::Admin || aborted {
            tracing::warn!(tag, qid, "I/O timeout, reset controller");
            self.disable(false);
            self.schedule_reset();
            return TimeoutAction::Done;
        }

        if !self.abort_budget.try_acquire() {
            return TimeoutAction::ResetTimer;
        }
        queue.requests().with_request(tag, |r| r.aborted = true);
        tracing::warn!(tag, qid, "I/O timeout, aborting");

        let budget = Arc::clone(&self.abort_budget);
        let abort = Request::admin(Command::abort(qid, tag), Vec::new(), move |c| {
            tracing::warn!(tag, status = %c.status, "abort status");
            budget.release();
        });
        let submitted = self
            .queue(QueueRole::Admin)
            .ok_or(NvmeError::NotReady)
            .and_then(|admin| {
                let deadline = Instant::now() + self.config.admin_timeout();
                self.submit_to(&admin, abort, Some(deadline))
            });
        if let Err(err) = submitted {
            tracing::warn!(tag, error = %err, "abort not sent");
            self.abort_budget.release();
        }
        TimeoutAction::ResetTimer
    }

    /// Runs the timeout state machine for every request whose deadline is at or before `now`.
    /// Requests told to keep waiting get a new deadline measured from `now`. Returns the number of
    /// expired requests found.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let mut expired = 0;
        for role in [QueueRole::Admin, QueueRole::Io] {
            let Some(queue) = self.queue(role) else {
                continue;
            };
            let timeout = self.timeout_for(role);
            for tag in queue.requests().expired(now) {
                expired += 1;
                if self.handle_timeout(role, tag) == TimeoutAction::ResetTimer {
                    queue
                        .requests()
                        .with_request(tag, |r| r.deadline = Some(now + timeout));
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_and_recovers() {
        let budget = AbortBudget::new(2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.available(), 0);
        budget.release();
        assert!(budget.try_acquire());
    }

    #[test]
    fn set_limit_refills() {
        let budget = AbortBudget::new(4);
        assert!(budget.try_acquire());
        budget.set_limit(1);
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
    }
}
