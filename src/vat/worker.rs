//! Vat worker — runs vat code on a blocking thread, talks to the kernel over channels.
//!
//! Protocol (strictly alternating, one outstanding request at a time):
//! ```text
//! kernel → worker   Deliver(d)
//! worker → kernel   Syscall(s)          (zero or more, each answered by)
//! kernel → worker   SyscallResult(r)
//! worker → kernel   Done(status)
//! ```
//! Dropping the kernel's end of the channels stops the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capdata::{Message, VatCapData};
use crate::slots::{VRef, VatId};

use super::{
    DeliveryResult, SyscallOk, VatDelivery, VatDispatch, VatResolution, VatSyscall,
    VatSyscallResult,
};

pub(crate) enum ToWorker {
    Deliver(VatDelivery),
    SyscallResult(VatSyscallResult),
}

pub(crate) enum FromWorker {
    Syscall(VatSyscall),
    Done(DeliveryResult),
}

const WORKER_GONE: &str = "kernel connection closed";

/// The vat's only way to reach the kernel during a delivery.
pub struct Syscall<'a> {
    to_kernel: &'a mpsc::Sender<FromWorker>,
    from_kernel: &'a mut mpsc::Receiver<ToWorker>,
}

impl Syscall<'_> {
    /// Issue a raw syscall and block until the kernel answers.
    pub fn call(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        if self
            .to_kernel
            .blocking_send(FromWorker::Syscall(syscall))
            .is_err()
        {
            return Err(WORKER_GONE.into());
        }
        match self.from_kernel.blocking_recv() {
            Some(ToWorker::SyscallResult(result)) => result,
            Some(ToWorker::Deliver(_)) => Err("delivery arrived mid-syscall".into()),
            None => Err(WORKER_GONE.into()),
        }
    }

    fn call_unit(&mut self, syscall: VatSyscall) -> Result<(), String> {
        self.call(syscall).map(|_| ())
    }

    fn call_text(&mut self, syscall: VatSyscall) -> Result<Option<String>, String> {
        match self.call(syscall)? {
            SyscallOk::Text(v) => Ok(v),
            SyscallOk::Null => Ok(None),
            other => Err(format!("unexpected syscall result {other:?}")),
        }
    }

    pub fn send(
        &mut self,
        target: VRef,
        method: &str,
        args: VatCapData,
        result: Option<VRef>,
    ) -> Result<(), String> {
        self.call_unit(VatSyscall::Send {
            target,
            msg: Message::new(method, args, result),
        })
    }

    pub fn subscribe(&mut self, vpid: VRef) -> Result<(), String> {
        self.call_unit(VatSyscall::Subscribe { vpid })
    }

    pub fn resolve(&mut self, resolutions: Vec<VatResolution>) -> Result<(), String> {
        self.call_unit(VatSyscall::Resolve { resolutions })
    }

    pub fn fulfill(&mut self, vpid: VRef, data: VatCapData) -> Result<(), String> {
        self.resolve(vec![VatResolution::fulfill(vpid, data)])
    }

    pub fn reject(&mut self, vpid: VRef, data: VatCapData) -> Result<(), String> {
        self.resolve(vec![VatResolution::reject(vpid, data)])
    }

    pub fn exit(&mut self, failure: bool, info: VatCapData) -> Result<(), String> {
        self.call_unit(VatSyscall::Exit { failure, info })
    }

    pub fn call_now(&mut self, target: VRef, method: &str, args: VatCapData) -> Result<VatCapData, String> {
        match self.call(VatSyscall::CallNow {
            target,
            method: method.to_string(),
            args,
        })? {
            SyscallOk::Data(data) => Ok(data),
            other => Err(format!("unexpected callNow result {other:?}")),
        }
    }

    pub fn vatstore_get(&mut self, key: &str) -> Result<Option<String>, String> {
        self.call_text(VatSyscall::VatstoreGet {
            key: key.to_string(),
        })
    }

    pub fn vatstore_next_key(&mut self, prior: &str) -> Result<Option<String>, String> {
        self.call_text(VatSyscall::VatstoreGetNextKey {
            prior: prior.to_string(),
        })
    }

    pub fn vatstore_set(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.call_unit(VatSyscall::VatstoreSet {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn vatstore_delete(&mut self, key: &str) -> Result<(), String> {
        self.call_unit(VatSyscall::VatstoreDelete {
            key: key.to_string(),
        })
    }

    pub fn drop_imports(&mut self, vrefs: Vec<VRef>) -> Result<(), String> {
        self.call_unit(VatSyscall::DropImports { vrefs })
    }

    pub fn retire_imports(&mut self, vrefs: Vec<VRef>) -> Result<(), String> {
        self.call_unit(VatSyscall::RetireImports { vrefs })
    }

    pub fn retire_exports(&mut self, vrefs: Vec<VRef>) -> Result<(), String> {
        self.call_unit(VatSyscall::RetireExports { vrefs })
    }
}

/// Kernel-side handle on a running worker.
pub struct VatWorker {
    pub(crate) to_worker: mpsc::Sender<ToWorker>,
    pub(crate) from_worker: mpsc::Receiver<FromWorker>,
    task: JoinHandle<()>,
}

impl VatWorker {
    /// Start a worker thread for `dispatch`. Must be called inside a tokio runtime.
    pub fn spawn(vat: VatId, dispatch: Box<dyn VatDispatch>) -> Self {
        let (to_worker, worker_rx) = mpsc::channel(1);
        let (worker_tx, from_worker) = mpsc::channel(1);
        let task = tokio::task::spawn_blocking(move || worker_loop(vat, dispatch, worker_rx, worker_tx));
        Self {
            to_worker,
            from_worker,
            task,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn worker_loop(
    vat: VatId,
    mut dispatch: Box<dyn VatDispatch>,
    mut from_kernel: mpsc::Receiver<ToWorker>,
    to_kernel: mpsc::Sender<FromWorker>,
) {
    while let Some(msg) = from_kernel.blocking_recv() {
        let delivery = match msg {
            ToWorker::Deliver(d) => d,
            ToWorker::SyscallResult(_) => {
                tracing::warn!("{vat} worker got a syscall result with no delivery in progress");
                continue;
            }
        };

        let mut syscall = Syscall {
            to_kernel: &to_kernel,
            from_kernel: &mut from_kernel,
        };
        let status = match catch_unwind(AssertUnwindSafe(|| dispatch.dispatch(delivery, &mut syscall))) {
            Ok(status) => status,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(format!("vat panicked: {reason}"))
            }
        };

        if to_kernel.blocking_send(FromWorker::Done(status)).is_err() {
            break;
        }
    }
    tracing::debug!("{vat} worker stopped");
}
