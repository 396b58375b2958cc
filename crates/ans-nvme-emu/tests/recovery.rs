mod common;

use std::time::Duration;

use ans_nvme::command::opcode;
use ans_nvme::{CtrlState, DeviceConfig, NvmeError, QueueRole, ResetWorker, Status};
use ans_nvme_emu::{fast_config, EmuConfig, TestBed};
use common::{flush, init_tracing, past_deadline, WAIT};

fn io_timeout() -> Duration {
    fast_config().io_timeout()
}

#[test]
fn abort_reclaims_a_stuck_command() {
    init_tracing();
    let bed = TestBed::builder().start().unwrap();
    bed.ctrl.set_hold_io(true);
    let (req, rx) = flush();
    let tag = bed.device.submit(QueueRole::Io, req).unwrap();

    assert_eq!(bed.device.check_timeouts(past_deadline(io_timeout())), 1);
    assert_eq!(bed.ctrl.stats().aborts, 1);

    let done = bed.wait_completion(&rx, WAIT).unwrap();
    assert_eq!(done.tag, tag);
    assert_eq!(done.status, Status::ABORT_REQUESTED);
    // The abort's own completion hands its budget slot back.
    assert!(bed.wait_until(WAIT, || bed.device.abort_budget().available() == 4));
    assert_eq!(bed.device.state(), CtrlState::Live);
}

#[test]
fn second_timeout_after_abort_resets_the_controller() {
    init_tracing();
    let bed = TestBed::builder()
        .emu(EmuConfig {
            abort_completes_target: false,
            ..EmuConfig::default()
        })
        .start()
        .unwrap();
    let dev = &bed.device;
    bed.ctrl.set_hold_io(true);

    let (a, rx_a) = flush();
    let (b, rx_b) = flush();
    dev.submit(QueueRole::Io, a).unwrap();
    dev.submit(QueueRole::Io, b).unwrap();

    let first = past_deadline(io_timeout());
    assert_eq!(dev.check_timeouts(first), 2);
    assert_eq!(bed.ctrl.stats().aborts, 2);
    assert_eq!(dev.state(), CtrlState::Live);
    assert_eq!(dev.queue(QueueRole::Io).unwrap().requests().outstanding(), 2);
    // Drain the "not aborted" abort completions.
    assert!(bed.wait_until(WAIT, || dev.abort_budget().available() == 4));

    let second = first + io_timeout() + Duration::from_millis(50);
    assert!(dev.check_timeouts(second) >= 1);
    assert_eq!(dev.state(), CtrlState::Resetting);
    assert!(!dev.is_io_online());

    // Both commands finished exactly once, with an error.
    for rx in [&rx_a, &rx_b] {
        let c = rx.try_recv().expect("completion delivered during disable");
        assert!(!c.is_success(), "{:?}", c.status);
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(
        dev.submit(QueueRole::Io, flush().0).unwrap_err(),
        NvmeError::NotReady
    );

    bed.ctrl.set_hold_io(false);
    assert_eq!(dev.run_pending_reset(), Some(Ok(())));
    assert!(dev.run_pending_reset().is_none());
    assert_eq!(dev.state(), CtrlState::Live);
    assert!(bed.ctrl.stats().controller_resets >= 1);

    let (req, rx) = flush();
    dev.submit(QueueRole::Io, req).unwrap();
    assert!(bed.wait_completion(&rx, WAIT).unwrap().is_success());
}

#[test]
fn stuck_admin_command_resets_without_abort() {
    init_tracing();
    let bed = TestBed::builder().start().unwrap();
    let dev = &bed.device;
    bed.ctrl.hold_admin_opcode(opcode::SET_FEATURES);

    assert_eq!(dev.set_queue_count(1), Err(NvmeError::Timeout));
    assert_eq!(bed.ctrl.stats().aborts, 0);
    assert_eq!(dev.state(), CtrlState::Resetting);

    bed.ctrl.release_admin_opcode(opcode::SET_FEATURES);
    assert_eq!(dev.run_pending_reset(), Some(Ok(())));
    assert_eq!(dev.state(), CtrlState::Live);
    assert!(dev.is_io_online());
}

#[test]
fn exhausted_abort_budget_defers_to_the_next_timeout() {
    init_tracing();
    let bed = TestBed::builder()
        .config(DeviceConfig {
            abort_limit: 1,
            ..fast_config()
        })
        .start()
        .unwrap();
    let dev = &bed.device;
    bed.ctrl.set_hold_io(true);
    bed.ctrl.hold_admin_opcode(opcode::ABORT);

    let (a, rx_a) = flush();
    let (b, rx_b) = flush();
    dev.submit(QueueRole::Io, a).unwrap();
    dev.submit(QueueRole::Io, b).unwrap();

    assert_eq!(dev.check_timeouts(past_deadline(io_timeout())), 2);
    // Only one abort fits the budget, and the controller is sitting on it.
    assert_eq!(bed.ctrl.stats().admin_count(opcode::ABORT), 1);
    assert_eq!(dev.abort_budget().available(), 0);
    assert_eq!(dev.state(), CtrlState::Live);
    assert_eq!(dev.queue(QueueRole::Io).unwrap().requests().outstanding(), 2);
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());

    dev.remove();
    assert!(!rx_a.try_recv().unwrap().is_success());
    assert!(!rx_b.try_recv().unwrap().is_success());
    // The abort was cancelled too, which returns its budget slot.
    assert_eq!(dev.abort_budget().available(), 1);
}

#[test]
fn timeout_while_connecting_gives_up_on_the_controller() {
    init_tracing();
    let bed = TestBed::builder().probe().unwrap();
    bed.ctrl.hold_admin_opcode(opcode::IDENTIFY);

    assert_eq!(bed.device.reset(), Err(NvmeError::Timeout));
    assert_eq!(bed.device.state(), CtrlState::Deleting);
    assert_eq!(bed.ctrl.stats().shutdowns, 1);
    assert_eq!(
        bed.device.submit(QueueRole::Io, flush().0).unwrap_err(),
        NvmeError::NotReady
    );
    assert_eq!(bed.device.identify(), Err(NvmeError::NotReady));
    assert_eq!(
        bed.device.reset(),
        Err(NvmeError::InvalidState {
            state: CtrlState::Deleting
        })
    );
}

#[test]
fn fatal_status_is_recovered_by_the_reset_worker() {
    init_tracing();
    let bed = TestBed::builder().start().unwrap();
    let dev = &bed.device;
    let worker = ResetWorker::spawn(dev.clone()).unwrap();

    bed.ctrl.set_hold_io(true);
    let (req, rx) = flush();
    dev.submit(QueueRole::Io, req).unwrap();
    bed.ctrl.inject_fatal();
    bed.ctrl.set_hold_io(false);

    assert_eq!(dev.check_timeouts(past_deadline(io_timeout())), 1);
    let c = rx.try_recv().expect("cancelled during disable");
    assert_eq!(c.status, Status::HOST_ABORTED);
    assert_eq!(bed.ctrl.stats().aborts, 0);

    assert!(bed.wait_until(WAIT, || dev.state() == CtrlState::Live));
    assert!(dev.is_io_online());
    let (req, rx) = flush();
    dev.submit(QueueRole::Io, req).unwrap();
    assert!(bed.wait_completion(&rx, WAIT).unwrap().is_success());
    drop(worker);
}

#[test]
fn vanished_controller_fails_reset() {
    init_tracing();
    let bed = TestBed::builder().probe().unwrap();
    bed.ctrl.set_absent(true);
    assert_eq!(bed.device.reset(), Err(NvmeError::NoDevice));
    assert_eq!(bed.device.state(), CtrlState::Deleting);
}

#[test]
fn refused_queue_count_leaves_the_controller_admin_only() {
    init_tracing();
    let bed = TestBed::builder()
        .emu(EmuConfig {
            grant_io_queues: false,
            ..EmuConfig::default()
        })
        .start()
        .unwrap();
    let dev = &bed.device;
    assert_eq!(dev.state(), CtrlState::Live);
    assert!(!dev.is_io_online());
    assert!(!bed.ctrl.io_queue_exists());
    let err = dev.submit(QueueRole::Io, flush().0).unwrap_err();
    assert_eq!(err, NvmeError::NotReady);
    assert!(err.is_retryable());
    assert!(dev.identify().is_ok());
}

#[test]
fn timeout_scan_ignores_completed_work() {
    init_tracing();
    let bed = TestBed::builder().start().unwrap();
    let (req, rx) = flush();
    bed.device.submit(QueueRole::Io, req).unwrap();
    // Completed on the device but not yet reaped: the scan finds it and polls it in.
    assert_eq!(bed.device.check_timeouts(past_deadline(io_timeout())), 1);
    assert!(rx.try_recv().unwrap().is_success());
    assert_eq!(bed.ctrl.stats().aborts, 0);
    assert_eq!(bed.device.state(), CtrlState::Live);
}
