//! vatkernel — an object-capability kernel for isolated, persistent vats.
//!
//! Vats talk only by sending messages to capabilities. The kernel owns the
//! translation tables (c-lists), the kernel object and promise tables, and a
//! single run queue it drains one crank at a time. Each crank commits
//! atomically to a WAL-backed store; vat transcripts make every vat
//! replayable after a restart.
//!
//! Entry point: [`Kernel::open`] with a [`KernelConfig`] and a [`VatLoader`].

pub mod capdata;
pub mod config;
pub mod devices;
pub mod error;
pub mod kernel;
pub mod slots;
pub mod store;
pub mod vat;

pub use capdata::{CapData, KernelCapData, Message, VatCapData};
pub use config::KernelConfig;
pub use error::{KernelError, KernelResult, SyscallError};
pub use kernel::{Kernel, PromiseState, RefCount};
pub use slots::{DeviceId, KRef, VRef, VatId};
pub use vat::{
    DeliveryResult, NamedVatLoader, Syscall, VatDelivery, VatDispatch, VatLoader, VatOptions,
    VatResolution,
};
