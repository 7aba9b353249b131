//! Vats — the vat-side view of deliveries and syscalls.
//!
//! Everything here speaks vrefs. The kernel translates to and from krefs
//! through the vat's c-list before anything crosses this boundary.
//!
//! Vat code implements [`VatDispatch`] and runs on its own worker thread
//! (see `worker.rs`). During a delivery it reaches the kernel only through the
//! [`Syscall`] handle, one blocking request at a time.

pub mod loader;
pub mod manager;
pub mod pool;
pub mod transcript;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::capdata::{Message, VatCapData};
use crate::slots::VRef;

pub use loader::{NamedVatLoader, VatLoader};
pub use manager::VatManager;
pub use pool::WorkerPool;
pub use transcript::{SyscallRecord, TranscriptEntry};
pub use worker::Syscall;

/// Per-vat settings, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Terminating a critical vat panics the kernel.
    pub critical: bool,
    /// Deliveries between automatic `bringOutYourDead`s. Falls back to the kernel default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<u64>,
    /// Computron budget. `None` means unmetered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter: Option<u64>,
}

/// One promise settlement, vat-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    pub vpid: VRef,
    pub rejected: bool,
    pub data: VatCapData,
}

impl VatResolution {
    pub fn fulfill(vpid: VRef, data: VatCapData) -> Self {
        Self {
            vpid,
            rejected: false,
            data,
        }
    }

    pub fn reject(vpid: VRef, data: VatCapData) -> Self {
        Self {
            vpid,
            rejected: true,
            data,
        }
    }
}

/// Kernel → vat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    Message { target: VRef, msg: Message<VRef> },
    Notify { resolutions: Vec<VatResolution> },
    DropExports { vrefs: Vec<VRef> },
    RetireExports { vrefs: Vec<VRef> },
    RetireImports { vrefs: Vec<VRef> },
    StartVat { params: VatCapData },
    BringOutYourDead,
}

/// Vat → kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VRef,
        msg: Message<VRef>,
    },
    CallNow {
        target: VRef,
        method: String,
        args: VatCapData,
    },
    Subscribe {
        vpid: VRef,
    },
    Resolve {
        resolutions: Vec<VatResolution>,
    },
    Exit {
        failure: bool,
        info: VatCapData,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreGetNextKey {
        prior: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    DropImports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
}

impl VatDelivery {
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

impl VatSyscall {
    pub fn kind(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::CallNow { .. } => "callNow",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
        }
    }
}

/// Successful syscall results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SyscallOk {
    Null,
    Text(Option<String>),
    Data(VatCapData),
}

/// What the vat sees back from a syscall. Errors are plain strings; by the
/// time a vat sees one the kernel has already decided what happens to it.
pub type VatSyscallResult = Result<SyscallOk, String>;

/// How a delivery ended, from the vat's side.
pub type DeliveryResult = Result<(), String>;

/// Vat code.
///
/// `dispatch` runs on the vat's worker thread. Returning `Err` (or panicking)
/// is a vat-fatal fault: the crank is unwound and the vat terminated.
pub trait VatDispatch: Send + 'static {
    fn dispatch(&mut self, delivery: VatDelivery, syscall: &mut Syscall<'_>) -> DeliveryResult;
}
