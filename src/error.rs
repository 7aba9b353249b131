//! Kernel error types.
//!
//! `KernelError` is fatal: it escapes to the host and panics the kernel.
//! `SyscallError` is scoped to one vat's crank.

use thiserror::Error;

use crate::slots::{ParseSlotError, VatId};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL entry corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown vat: {0}")]
    UnknownVat(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown bundle: {0}")]
    UnknownBundle(String),

    #[error("unknown promise: {0}")]
    UnknownPromise(String),

    #[error("promise {0} is still unresolved")]
    Unresolved(String),

    #[error("transcript divergence in {vat} at delivery {delivery}: {reason}")]
    TranscriptDivergence {
        vat: VatId,
        delivery: u64,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("vat loader failed: {0}")]
    Loader(String),

    #[error("kernel panic: {0}")]
    Panic(String),
}

impl From<ParseSlotError> for KernelError {
    fn from(e: ParseSlotError) -> Self {
        KernelError::InvalidData(e.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// A vat did something it isn't allowed to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error("unknown slot {slot} in {vat}")]
    UnknownSlot { vat: VatId, slot: String },

    #[error("illegal syscall: {0}")]
    Illegal(String),

    #[error("duplicate handler registration: {0}")]
    DuplicateHandler(String),

    /// A device refused the call. Reported to the vat, which survives.
    #[error("device error: {0}")]
    Device(String),
}

impl SyscallError {
    /// Whether the offending vat must be terminated.
    pub fn is_fatal_to_vat(&self) -> bool {
        !matches!(self, SyscallError::Device(_))
    }
}

impl From<ParseSlotError> for SyscallError {
    fn from(e: ParseSlotError) -> Self {
        SyscallError::Illegal(e.to_string())
    }
}

/// Either side of the syscall path can fail: the vat (scoped) or the kernel (fatal).
#[derive(Debug, Error)]
pub enum SyscallFailure {
    #[error(transparent)]
    Vat(#[from] SyscallError),

    #[error(transparent)]
    Fatal(#[from] KernelError),
}

pub type SyscallResult<T> = Result<T, SyscallFailure>;

/// Kernel-originated work (host calls, vat creation) has no vat to blame, so a
/// vat-scoped failure there is a kernel bug.
impl From<SyscallFailure> for KernelError {
    fn from(e: SyscallFailure) -> Self {
        match e {
            SyscallFailure::Fatal(k) => k,
            SyscallFailure::Vat(v) => KernelError::InvalidData(v.to_string()),
        }
    }
}
