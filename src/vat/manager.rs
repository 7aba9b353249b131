//! VatManager — the kernel's side of one vat worker.
//!
//! `deliver` pushes a delivery into the worker and services its syscalls
//! through a caller-supplied handler until the worker reports done, building
//! the transcript entry along the way. `replay` does the same but answers
//! syscalls from a recorded entry instead of the kernel.

use crate::error::{KernelError, KernelResult};
use crate::slots::VatId;

use super::transcript::{ReplayCursor, SyscallRecord, TranscriptEntry};
use super::worker::{FromWorker, ToWorker, VatWorker};
use super::{VatDelivery, VatDispatch, VatSyscall, VatSyscallResult};

pub struct VatManager {
    vat: VatId,
    worker: VatWorker,
}

impl VatManager {
    /// Start a worker for freshly loaded vat code.
    pub fn spawn(vat: VatId, dispatch: Box<dyn VatDispatch>) -> Self {
        Self {
            vat,
            worker: VatWorker::spawn(vat, dispatch),
        }
    }

    pub fn vat(&self) -> VatId {
        self.vat
    }

    /// Run one delivery to completion. Never fails: a dead or crashing worker
    /// shows up as an `Err` status in the returned entry.
    pub async fn deliver<F>(&mut self, delivery: VatDelivery, mut handle_syscall: F) -> TranscriptEntry
    where
        F: FnMut(&VatSyscall) -> VatSyscallResult,
    {
        let mut entry = TranscriptEntry::new(delivery.clone());

        if self
            .worker
            .to_worker
            .send(ToWorker::Deliver(delivery))
            .await
            .is_err()
        {
            entry.status = Err("vat worker is gone".into());
            return entry;
        }

        loop {
            match self.worker.from_worker.recv().await {
                Some(FromWorker::Syscall(syscall)) => {
                    let result = handle_syscall(&syscall);
                    entry.syscalls.push(SyscallRecord {
                        syscall,
                        result: result.clone(),
                    });
                    if self
                        .worker
                        .to_worker
                        .send(ToWorker::SyscallResult(result))
                        .await
                        .is_err()
                    {
                        entry.status = Err("vat worker died mid-delivery".into());
                        return entry;
                    }
                }
                Some(FromWorker::Done(status)) => {
                    entry.status = status;
                    return entry;
                }
                None => {
                    entry.status = Err("vat worker exited mid-delivery".into());
                    return entry;
                }
            }
        }
    }

    /// Re-run a recorded delivery. Any difference from the recording is a
    /// fatal integrity error.
    pub async fn replay(&mut self, delivery_num: u64, recorded: &TranscriptEntry) -> KernelResult<()> {
        let mut cursor = ReplayCursor::new(recorded);
        let replayed = self
            .deliver(recorded.delivery.clone(), |sc| cursor.answer(sc))
            .await;
        cursor
            .finish(&recorded.status, &replayed.status)
            .map_err(|reason| KernelError::TranscriptDivergence {
                vat: self.vat,
                delivery: delivery_num,
                reason,
            })
    }
}
