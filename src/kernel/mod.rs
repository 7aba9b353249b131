//! Kernel — vats, c-lists, kernel objects and promises, one crank at a time.
//!
//! All kernel state lives in a single key-value `Store` behind the
//! `KernelKeeper`, so one commit (or rollback) covers everything a crank did.
//!
//! Key layout:
//! ```text
//! crankNumber, activityhash, kernel.initialized
//! ko.nextID  kp.nextID  kd.nextID  vat.nextID  device.nextID  upgrade.nextID
//! vat.names  vat.live  vat.terminated  device.names
//! ko<N>.owner  ko<N>.refCount                     "reachable,recognizable"
//! kp<N>.state|decider|subscribers|queue|data|refCount
//! kd<N>.owner  d<N>.root  d<N>.deviceState
//! runQueue.head  runQueue.tail  runQueue.<i>
//! gcActions  reapQueue
//! v<N>.c.<kref> = "R <vref>" | "_ <vref>"         v<N>.c.<vref> = <kref>
//! v<N>.o.nextID|p.nextID|d.nextID
//! v<N>.source|options|incarnation|meter|reapDirt
//! v<N>.t.startPos|t.endPos                        transcript span
//! v<N>.vs.<key>                                   vatstore
//! ```
//!
//! The crank loop is in `crank.rs`, vat creation/upgrade/termination in
//! `lifecycle.rs`, and the embedder API in `host.rs`.

pub mod clist;
pub mod crank;
pub mod gc;
pub mod host;
pub mod keeper;
pub mod lifecycle;
pub mod run_queue;
pub mod syscall;
pub mod translate;

use crate::config::KernelConfig;
use crate::devices::Devices;
use crate::error::{KernelError, KernelResult};
use crate::store::Store;
use crate::vat::{VatLoader, WorkerPool};

use keeper::KernelKeeper;

pub use clist::{ClistEntry, MapOpts, VatSource};
pub use gc::{GcAction, GcActionKind, GcState};
pub use keeper::{PromiseState, RefCount};
pub use run_queue::RunQueueEvent;

pub struct Kernel {
    pub(crate) keeper: KernelKeeper,
    pub(crate) devices: Devices,
    /// Resident workers, at most `max_vats_online`. A vat without one gets it
    /// rebuilt from its transcript on its next delivery.
    pub(crate) workers: WorkerPool,
    pub(crate) loader: Box<dyn VatLoader>,
    pub(crate) config: KernelConfig,
    /// Set by the first fatal error; the kernel refuses to run after that.
    pub(crate) panic: Option<String>,
    pub(crate) commits_since_checkpoint: u64,
}

impl Kernel {
    /// Open (or create) a kernel. With `config.data_dir` set, committed state
    /// is recovered from the snapshot and WAL there; otherwise the kernel is
    /// in memory only.
    pub fn open(config: KernelConfig, loader: impl VatLoader + 'static) -> KernelResult<Self> {
        let store = match &config.data_dir {
            Some(dir) => Store::open(dir)?,
            None => Store::in_memory(),
        };
        let mut keeper = KernelKeeper::new(store);

        if keeper.is_initialized() {
            tracing::info!(
                "reopened kernel at crank {} ({} vats live)",
                keeper.crank_number()?,
                keeper.live_vats()?.len()
            );
        } else {
            Devices::install_standard(&mut keeper)?;
            keeper.mark_initialized();
            keeper.commit_crank()?;
            tracing::info!("initialized new kernel");
        }

        let devices = Devices::load(&keeper)?;
        Ok(Self {
            keeper,
            devices,
            workers: WorkerPool::new(config.max_vats_online),
            loader: Box::new(loader),
            config,
            panic: None,
            commits_since_checkpoint: 0,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Read-only view of the kernel tables.
    pub fn keeper(&self) -> &KernelKeeper {
        &self.keeper
    }

    /// The panic message, if a fatal error has stopped the kernel.
    pub fn panic_reason(&self) -> Option<&str> {
        self.panic.as_deref()
    }

    pub(crate) fn check_panic(&self) -> KernelResult<()> {
        match &self.panic {
            Some(reason) => Err(KernelError::Panic(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a fatal error. Uncommitted state is discarded and every worker
    /// is dropped.
    pub(crate) fn enter_panic(&mut self, err: &KernelError) {
        tracing::error!("kernel panic: {err}");
        self.keeper.abort_crank();
        self.workers.clear();
        if self.panic.is_none() {
            self.panic = Some(err.to_string());
        }
    }

    /// Commit the crank buffer, checkpointing every `checkpoint_interval` commits.
    pub(crate) fn commit(&mut self) -> KernelResult<()> {
        if let Some(hash) = self.keeper.commit_crank()? {
            tracing::debug!("committed crank hash {}", &hash[..12.min(hash.len())]);
            self.commits_since_checkpoint += 1;
        }
        let interval = self.config.checkpoint_interval;
        if interval > 0 && self.commits_since_checkpoint >= interval {
            self.keeper.store_mut().checkpoint()?;
            self.commits_since_checkpoint = 0;
        }
        Ok(())
    }
}
