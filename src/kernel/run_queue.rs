//! Run-queue events — the closed set of things a crank can process.
//!
//! `Send`, `Notify`, `StartVat`, `CreateVat`, `UpgradeVat` and `TerminateVat`
//! travel through the persisted run queue. The GC variants and
//! `BringOutYourDead` are synthesized from the GC action set and the reap queue
//! at the start of a crank, but share the enum so one `match` covers all.

use serde::{Deserialize, Serialize};

use crate::capdata::{KernelCapData, Message};
use crate::slots::{KRef, VatId};
use crate::vat::VatOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueEvent {
    Send {
        target: KRef,
        msg: Message<KRef>,
    },
    Notify {
        vat: VatId,
        kpid: KRef,
    },
    DropExports {
        vat: VatId,
        krefs: Vec<KRef>,
    },
    RetireExports {
        vat: VatId,
        krefs: Vec<KRef>,
    },
    RetireImports {
        vat: VatId,
        krefs: Vec<KRef>,
    },
    BringOutYourDead {
        vat: VatId,
    },
    StartVat {
        vat: VatId,
        params: KernelCapData,
    },
    #[serde(rename_all = "camelCase")]
    CreateVat {
        vat: VatId,
        bundle_id: String,
        params: KernelCapData,
        options: VatOptions,
    },
    #[serde(rename_all = "camelCase")]
    UpgradeVat {
        vat: VatId,
        upgrade_id: u64,
        bundle_id: String,
        params: KernelCapData,
        upgrade_message: String,
    },
    TerminateVat {
        vat: VatId,
        failure: bool,
        info: KernelCapData,
    },
    /// A GC batch whose every action had gone stale. Commits as a no-op.
    NegatedGcAction,
}

impl RunQueueEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueEvent::Send { .. } => "send",
            RunQueueEvent::Notify { .. } => "notify",
            RunQueueEvent::DropExports { .. } => "dropExports",
            RunQueueEvent::RetireExports { .. } => "retireExports",
            RunQueueEvent::RetireImports { .. } => "retireImports",
            RunQueueEvent::BringOutYourDead { .. } => "bringOutYourDead",
            RunQueueEvent::StartVat { .. } => "startVat",
            RunQueueEvent::CreateVat { .. } => "createVat",
            RunQueueEvent::UpgradeVat { .. } => "upgradeVat",
            RunQueueEvent::TerminateVat { .. } => "terminateVat",
            RunQueueEvent::NegatedGcAction => "negated-gc-action",
        }
    }

    /// The krefs this event holds references on while queued.
    pub fn krefs(&self) -> Vec<KRef> {
        match self {
            RunQueueEvent::Send { target, msg } => {
                std::iter::once(*target).chain(msg.slots().copied()).collect()
            }
            RunQueueEvent::Notify { kpid, .. } => vec![*kpid],
            RunQueueEvent::StartVat { params, .. }
            | RunQueueEvent::CreateVat { params, .. }
            | RunQueueEvent::UpgradeVat { params, .. } => params.slots.clone(),
            RunQueueEvent::TerminateVat { info, .. } => info.slots.clone(),
            RunQueueEvent::DropExports { .. }
            | RunQueueEvent::RetireExports { .. }
            | RunQueueEvent::RetireImports { .. }
            | RunQueueEvent::BringOutYourDead { .. }
            | RunQueueEvent::NegatedGcAction => Vec::new(),
        }
    }
}
