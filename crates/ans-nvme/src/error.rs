use thiserror::Error;

use crate::state::CtrlState;

pub type Result<T> = std::result::Result<T, NvmeError>;

/// Errors surfaced by the host engine.
///
/// Per-request errors ([`NvmeError::NotReady`], [`NvmeError::ResourceExhausted`],
/// [`NvmeError::Io`]) are returned synchronously from submission and are never retried
/// internally. `NotReady` and `ResourceExhausted` are retryable; `Io` is not.
///
/// Device-level conditions (a fatal controller status, a stuck admin command) are handled by the
/// recovery state machine. They only reach callers of the lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvmeError {
    /// The target queue is suspended, the controller is resetting, or I/O is unavailable.
    #[error("queue is not ready")]
    NotReady,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Malformed request (bad fragment list, oversized transfer, geometry mismatch).
    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out waiting for the controller")]
    Timeout,

    #[error("controller fatal status (CSTS={csts:#010x})")]
    DeviceFatal { csts: u32 },

    #[error("no outstanding command for tag {tag} on queue {qid}")]
    NotFound { qid: u16, tag: u16 },

    #[error("tracking entry for tag {tag} is already armed")]
    TagBusy { tag: u16 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("operation not allowed in controller state {state:?}")]
    InvalidState { state: CtrlState },

    #[error("admin command {opcode:#04x} failed with status {status:#06x}")]
    CommandFailed { opcode: u8, status: u16 },

    #[error("DMA address filter rejected region {addr:#x}+{len:#x}")]
    FilterRejected { addr: u64, len: u64 },

    #[error("coprocessor boot failed: {0}")]
    BootFailed(&'static str),

    /// `CSTS` reads all-ones: the register window no longer decodes.
    #[error("controller is not present")]
    NoDevice,
}

impl NvmeError {
    /// Whether a caller may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NvmeError::NotReady | NvmeError::ResourceExhausted(_))
    }
}
