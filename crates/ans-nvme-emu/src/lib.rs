//! Software model of an Apple ANS2 storage controller.
//!
//! The model implements the engine's [`ans_nvme::Mmio`] and DMA traits so the host engine can be
//! exercised end to end without hardware: boot status, linear submission with tracking-table
//! checks, the completion ring with phase bits, queue management, aborts and asynchronous events.

pub mod controller;
pub mod memory;
pub mod sart;
pub mod testbed;

pub use controller::{AnsController, EmuConfig, EmuStats};
pub use memory::EmuMemory;
pub use sart::EmuSart;
pub use testbed::{fast_config, EmuCoprocessor, TestBed, TestBedBuilder};
