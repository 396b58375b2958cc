//! Controller reset sequencing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::Device;
use crate::error::{NvmeError, Result};
use crate::state::CtrlState;

/// Pending-reset flag shared between schedulers and the reset worker.
#[derive(Debug, Default)]
pub struct ResetSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl ResetSignal {
    fn raise(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    fn take(&self) -> bool {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Waits up to `timeout` for a reset to be scheduled and consumes it.
    fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            pending = self
                .cv
                .wait_timeout(pending, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        std::mem::take(&mut *pending)
    }

    fn wake(&self) {
        self.cv.notify_all();
    }
}

impl Device {
    /// Moves the controller to `Resetting` and hands the reset to the worker. Returns `false` if a
    /// reset is already under way or the controller is being removed.
    pub fn schedule_reset(&self) -> bool {
        if !self.change_state(CtrlState::Resetting) {
            return false;
        }
        self.reset_signal.raise();
        true
    }

    /// Resets the controller synchronously and brings it back to `Live`.
    pub fn reset(&self) -> Result<()> {
        if !self.change_state(CtrlState::Resetting) {
            return Err(NvmeError::InvalidState {
                state: self.state(),
            });
        }
        self.run_reset()
    }

    /// Runs a reset scheduled by [`Device::schedule_reset`], if there is one.
    pub fn run_pending_reset(&self) -> Option<Result<()>> {
        if !self.reset_signal.take() {
            return None;
        }
        Some(self.run_reset())
    }

    fn run_reset(&self) -> Result<()> {
        let _serial = self
            .reset_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let res = self.reset_work();
        if let Err(err) = &res {
            tracing::warn!(error = %err, "removing after probe failure");
            self.remove_dead_ctrl();
        }
        res
    }

    fn reset_work(&self) -> Result<()> {
        let state = self.state();
        if state != CtrlState::Resetting {
            return Err(NvmeError::InvalidState { state });
        }
        // A live controller is shut down before it is brought back.
        if self.cc_enabled() {
            self.disable(false);
        }

        {
            let _guard = self
                .shutdown_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.enable()?;
            self.configure_admin_queue()?;
        }

        if !self.change_state(CtrlState::Connecting) {
            tracing::warn!(state = ?self.state(), "failed to mark controller connecting");
            return Err(NvmeError::InvalidState {
                state: self.state(),
            });
        }

        self.init_identify()?;
        self.setup_io_queues()?;

        if self.ioq_online.load(Ordering::Acquire) {
            self.frozen.store(false, Ordering::Release);
        } else {
            tracing::warn!("I/O queue not created; controller is admin-only");
        }

        if !self.change_state(CtrlState::Live) {
            tracing::warn!(state = ?self.state(), "failed to mark controller live");
            return Err(NvmeError::NoDevice);
        }
        if let Err(err) = self.submit_async_event() {
            tracing::warn!(error = %err, "async event request not armed");
        }
        tracing::info!(io = self.ioq_online.load(Ordering::Acquire), "controller live");
        Ok(())
    }

    fn setup_io_queues(&self) -> Result<()> {
        if self.set_queue_count(1)? == 0 {
            return Ok(());
        }
        self.create_io_queue()
    }

    /// Gives up on the controller: no request is admitted again.
    fn remove_dead_ctrl(&self) {
        self.change_state(CtrlState::Deleting);
        self.disable(false);
        self.killed.store(true, Ordering::Release);
    }
}

/// Background thread that runs scheduled resets.
pub struct ResetWorker {
    device: Arc<Device>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

const WORKER_TICK: Duration = Duration::from_millis(10);

impl ResetWorker {
    pub fn spawn(device: Arc<Device>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new().name("ans-nvme-reset".into()).spawn({
            let device = device.clone();
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    if !device.reset_signal.wait(WORKER_TICK) {
                        continue;
                    }
                    if let Err(err) = device.run_reset() {
                        tracing::debug!(error = %err, "scheduled reset failed");
                    }
                }
            }
        })?;
        Ok(Self {
            device,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for ResetWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.reset_signal.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_consumed_once() {
        let signal = ResetSignal::default();
        assert!(!signal.take());
        signal.raise();
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.wait(Duration::from_millis(1)));
    }
}
