//! Bringing the ANS coprocessor up far enough that its NVMe registers respond.

use std::time::Duration;

use crate::config::DeviceConfig;
use crate::error::{NvmeError, Result};
use crate::regs::{
    poll_until, Mmio, ANS_BOOT_STATUS, ANS_BOOT_STATUS_OK, ANS_LINEAR_SQ_CTRL, ANS_LINEAR_SQ_EN,
    ANS_MAX_PEND_CMDS_CTRL, ANS_UNKNOWN_CTRL, ANS_UNKNOWN_CTRL_PRP_NULL_CHECK, NVMMU_NUM,
};
use crate::tags::MAX_QUEUE_DEPTH;
use crate::tcb::NUM_TCBS;

const BOOT_STATUS_POLL: Duration = Duration::from_micros(100);

/// Firmware loader for the controller's management processor.
pub trait Coprocessor: Send + Sync {
    /// Starts the coprocessor and waits until its firmware reports ready.
    fn boot_and_wait(&self, timeout: Duration) -> Result<()>;
}

/// Boots the coprocessor and applies the ANS2 register setup that must precede any queue
/// programming.
pub fn boot(regs: &dyn Mmio, coprocessor: &dyn Coprocessor, config: &DeviceConfig) -> Result<()> {
    if let Err(err) = coprocessor.boot_and_wait(config.boot_timeout()) {
        tracing::error!(error = %err, "coprocessor did not boot");
        return Err(NvmeError::BootFailed("coprocessor did not boot"));
    }
    wait_boot_status(regs, config.boot_status_timeout())?;
    init_linear_mode(regs);
    Ok(())
}

/// Polls the boot status register until the firmware writes its ready sentinel.
pub fn wait_boot_status(regs: &dyn Mmio, timeout: Duration) -> Result<()> {
    if poll_until(timeout, BOOT_STATUS_POLL, || {
        regs.read32(ANS_BOOT_STATUS) == ANS_BOOT_STATUS_OK
    }) {
        return Ok(());
    }
    let status = regs.read32(ANS_BOOT_STATUS);
    tracing::error!(status = format_args!("{status:#010x}"), "ANS did not boot");
    Err(NvmeError::BootFailed("boot status never became ready"))
}

fn init_linear_mode(regs: &dyn Mmio) {
    let pend = MAX_QUEUE_DEPTH as u32;
    regs.write32(ANS_MAX_PEND_CMDS_CTRL, pend | pend << 16);
    regs.write32(ANS_LINEAR_SQ_CTRL, ANS_LINEAR_SQ_EN);
    let ctrl = regs.read32(ANS_UNKNOWN_CTRL);
    regs.write32(ANS_UNKNOWN_CTRL, ctrl & !ANS_UNKNOWN_CTRL_PRP_NULL_CHECK);
    regs.write32(NVMMU_NUM, NUM_TCBS as u32 - 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingMmio;

    struct Boots(bool);

    impl Coprocessor for Boots {
        fn boot_and_wait(&self, _timeout: Duration) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(NvmeError::Timeout)
            }
        }
    }

    fn fast_config() -> DeviceConfig {
        DeviceConfig {
            boot_status_timeout_ms: 5,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn programs_linear_mode_after_sentinel() {
        let regs = RecordingMmio::default();
        regs.set(ANS_BOOT_STATUS, ANS_BOOT_STATUS_OK);
        regs.set(ANS_UNKNOWN_CTRL, 0xffff_ffff);
        boot(&regs, &Boots(true), &fast_config()).unwrap();

        assert_eq!(
            regs.writes(),
            vec![
                (ANS_MAX_PEND_CMDS_CTRL, 64 | 64 << 16),
                (ANS_LINEAR_SQ_CTRL, 1),
                (ANS_UNKNOWN_CTRL, 0xffff_f7ff),
                (NVMMU_NUM, 63),
            ]
        );
    }

    #[test]
    fn missing_sentinel_times_out_without_touching_queues() {
        let regs = RecordingMmio::default();
        let err = boot(&regs, &Boots(true), &fast_config()).unwrap_err();
        assert!(matches!(err, NvmeError::BootFailed(_)));
        assert!(regs.writes().is_empty());
    }

    #[test]
    fn coprocessor_failure_stops_probe() {
        let regs = RecordingMmio::default();
        regs.set(ANS_BOOT_STATUS, ANS_BOOT_STATUS_OK);
        let err = boot(&regs, &Boots(false), &fast_config()).unwrap_err();
        assert!(matches!(err, NvmeError::BootFailed(_)));
        assert!(regs.writes().is_empty());
    }
}
