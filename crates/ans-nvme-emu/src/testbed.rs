//! Wiring an engine instance to an emulated controller.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ans_nvme::{
    AddressFilter, Completion, Coprocessor, Device, DeviceConfig, DmaSegment, NoFilter, NvmeError,
    Platform, Result, Sart, SartRevision,
};

use crate::controller::{AnsController, EmuConfig};
use crate::memory::EmuMemory;
use crate::sart::EmuSart;

/// Management processor stand-in: booting it makes the controller's boot status read ready.
pub struct EmuCoprocessor {
    ctrl: Arc<AnsController>,
    fail: AtomicBool,
    boots: AtomicU32,
}

impl EmuCoprocessor {
    pub fn new(ctrl: Arc<AnsController>) -> Self {
        Self {
            ctrl,
            fail: AtomicBool::new(false),
            boots: AtomicU32::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn boots(&self) -> u32 {
        self.boots.load(Ordering::Acquire)
    }
}

impl Coprocessor for EmuCoprocessor {
    fn boot_and_wait(&self, _timeout: Duration) -> Result<()> {
        self.boots.fetch_add(1, Ordering::AcqRel);
        if self.fail.load(Ordering::Acquire) {
            return Err(NvmeError::Timeout);
        }
        self.ctrl.finish_boot();
        Ok(())
    }
}

/// Engine settings that keep recovery tests fast.
pub fn fast_config() -> DeviceConfig {
    DeviceConfig {
        io_timeout_ms: 200,
        admin_timeout_ms: 200,
        shutdown_timeout_ms: 100,
        boot_timeout_ms: 50,
        boot_status_timeout_ms: 50,
        ..DeviceConfig::default()
    }
}

pub struct TestBedBuilder {
    config: DeviceConfig,
    emu: EmuConfig,
    mem_size: usize,
    sart: Option<SartRevision>,
}

impl TestBedBuilder {
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn emu(mut self, emu: EmuConfig) -> Self {
        self.emu = emu;
        self
    }

    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.mem_size = bytes;
        self
    }

    /// Puts a SART of the given packing between the engine and memory.
    pub fn sart(mut self, revision: SartRevision) -> Self {
        self.sart = Some(revision);
        self
    }

    /// Boots the coprocessor and probes the engine, leaving it in `New`.
    pub fn probe(self) -> Result<TestBed> {
        let mem = Arc::new(EmuMemory::new(self.mem_size));
        let ctrl = Arc::new(AnsController::new(mem.clone(), self.emu));
        let sart = self.sart.map(|revision| Arc::new(EmuSart::new(revision)));
        let filter: Arc<dyn AddressFilter> = match (&sart, self.sart) {
            (Some(regs), Some(revision)) => {
                ctrl.attach_sart(regs.clone());
                Arc::new(Sart::probe(regs.clone(), revision))
            }
            _ => Arc::new(NoFilter),
        };
        let coprocessor = EmuCoprocessor::new(ctrl.clone());
        let platform = Platform {
            regs: ctrl.clone(),
            dma: mem.clone(),
            filter,
        };
        let device = Device::probe(platform, &coprocessor, self.config)?;
        Ok(TestBed {
            mem,
            ctrl,
            sart,
            device: Arc::new(device),
        })
    }

    /// Probes and resets the engine so it comes up `Live`.
    pub fn start(self) -> Result<TestBed> {
        let bed = self.probe()?;
        bed.device.reset()?;
        Ok(bed)
    }
}

/// An engine attached to an emulated controller over shared memory.
pub struct TestBed {
    pub mem: Arc<EmuMemory>,
    pub ctrl: Arc<AnsController>,
    pub sart: Option<Arc<EmuSart>>,
    pub device: Arc<Device>,
}

impl TestBed {
    pub fn builder() -> TestBedBuilder {
        TestBedBuilder {
            config: fast_config(),
            emu: EmuConfig::default(),
            mem_size: 8 << 20,
            sart: None,
        }
    }

    /// Allocates a data buffer outside the engine's own allocations.
    pub fn buffer(&self, len: usize) -> DmaSegment {
        self.mem
            .alloc_segment(len)
            .unwrap_or_else(|| panic!("test memory exhausted allocating {len} bytes"))
    }

    /// Polls the engine's interrupt path until a completion shows up on `rx`.
    pub fn wait_completion(&self, rx: &Receiver<Completion>, timeout: Duration) -> Option<Completion> {
        let deadline = Instant::now() + timeout;
        loop {
            self.device.handle_irq();
            if let Ok(c) = rx.recv_timeout(Duration::from_millis(1)) {
                return Some(c);
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Waits for `cond` while servicing interrupts.
    pub fn wait_until(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.device.handle_irq();
            if cond() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
