//! Host-side command engine for the Apple ANS2 NVMe controller.
//!
//! ANS2 speaks NVMe with a few twists: submission rings are indexed by command tag rather than by
//! a tail pointer, every command must be described by a tracking entry in an NVMMU table before
//! its doorbell is rung, and the tag space is shared between the admin and I/O queues. The
//! controller sits behind a coprocessor that must be booted first and, on some SoCs, a DMA
//! address filter (SART) that must be opened for every buffer the controller touches.
//!
//! [`Device`] ties the pieces together: probe, reset, submission, completion reaping and the
//! timeout/abort/reset recovery path.

pub mod boot;
pub mod command;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod filter;
pub mod prp;
pub mod queue;
pub mod regs;
pub mod request;
pub mod reset;
pub mod state;
pub mod tags;
pub mod tcb;
pub mod timeout;

#[cfg(test)]
mod testutil;

pub use boot::Coprocessor;
pub use command::{Command, CompletionEntry, ControllerIdentity, Status};
pub use config::DeviceConfig;
pub use device::{AsyncEvent, Device, Platform};
pub use dma::{DmaAllocator, DmaBuffer, DmaContext, DmaMemory, DmaPlatform, DmaSegment};
pub use error::{NvmeError, Result};
pub use filter::{AddressFilter, NoFilter, Sart, SartRevision};
pub use queue::{QueuePair, QueueRole, QueueState};
pub use regs::Mmio;
pub use request::{Completion, Request, RequestOp};
pub use reset::ResetWorker;
pub use state::CtrlState;
pub use timeout::{AbortBudget, TimeoutAction};
