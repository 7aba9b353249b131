//! Host API — what the embedder calls between cranks.
//!
//! Every mutating call is its own committed unit, just like a crank: it either
//! lands completely or (on error) not at all.

use crate::capdata::{CapData, KernelCapData, Message};
use crate::devices::{self, DeviceContext, Mailbox, Timer};
use crate::error::{KernelError, KernelResult};
use crate::slots::{KRef, VRef, VatId};
use crate::vat::VatOptions;

use super::clist::ClistEntry;
use super::gc::GcState;
use super::keeper::{PromiseState, RefCount, RefOpts};
use super::run_queue::RunQueueEvent;
use super::Kernel;

impl Kernel {
    fn host_commit<T>(&mut self, f: impl FnOnce(&mut Self) -> KernelResult<T>) -> KernelResult<T> {
        self.check_panic()?;
        let value = match f(self) {
            Ok(v) => v,
            Err(e) => {
                self.keeper.abort_crank();
                return Err(e);
            }
        };
        if let Err(e) = self.keeper.process_refcounts().and_then(|()| self.commit()) {
            self.enter_panic(&e);
            return Err(e);
        }
        Ok(value)
    }

    // ── Setup ──

    /// Store a bundle; returns its content-derived ID.
    pub fn install_bundle(&mut self, bytes: Vec<u8>) -> KernelResult<String> {
        self.host_commit(|k| Ok(k.keeper.store_mut().add_bundle(bytes)))
    }

    /// Create a static vat. Its `startVat` is queued; run the kernel to
    /// actually start it. The root object is held by the host for good.
    pub fn create_vat(
        &mut self,
        name: &str,
        bundle_id: &str,
        params: KernelCapData,
        mut options: VatOptions,
    ) -> KernelResult<VatId> {
        self.host_commit(|k| {
            if !k.keeper.store().has_bundle(bundle_id) {
                return Err(KernelError::UnknownBundle(bundle_id.to_string()));
            }
            if k.keeper.vat_names()?.contains_key(name) {
                return Err(KernelError::InvalidData(format!("vat name '{name}' in use")));
            }
            options.name = Some(name.to_string());
            let vat = k.keeper.allocate_vat_id()?;
            let root = k.initialize_vat(vat, bundle_id, &options)?;
            k.keeper.increment_refcount(root, RefOpts::default())?;

            let event = RunQueueEvent::StartVat { vat, params };
            k.keeper.incref_event(&event)?;
            k.keeper.enqueue_run_queue(&event)?;
            Ok(vat)
        })
    }

    // ── Messages ──

    /// Queue `target.method(args)` and return the result promise. The host
    /// keeps a reference to the promise so it can be polled later.
    pub fn queue_to_kref(&mut self, target: KRef, method: &str, args: KernelCapData) -> KernelResult<KRef> {
        self.host_commit(|k| {
            let known = match target {
                KRef::Object(_) => k.keeper.object_exists(target),
                KRef::Promise(_) => k.keeper.promise_exists(target),
                KRef::Device(_) => false,
            };
            if !known {
                return Err(KernelError::InvalidData(format!("cannot send to {target}")));
            }
            let kpid = k.keeper.add_kernel_promise()?;
            k.keeper.increment_refcount(kpid, RefOpts::default())?;

            let event = RunQueueEvent::Send {
                target,
                msg: Message::new(method, args, Some(kpid)),
            };
            k.keeper.incref_event(&event)?;
            k.keeper.enqueue_run_queue(&event)?;
            tracing::debug!("host queued {target}.{method} → {kpid}");
            Ok(kpid)
        })
    }

    /// `queue_to_kref` aimed at a named vat's root object.
    pub fn queue_to_vat_root(&mut self, vat_name: &str, method: &str, args: KernelCapData) -> KernelResult<KRef> {
        let vat = self
            .vat_id_by_name(vat_name)?
            .ok_or_else(|| KernelError::UnknownVat(vat_name.to_string()))?;
        let root = self.vat_root(vat)?;
        self.queue_to_kref(root, method, args)
    }

    pub fn kp_status(&self, kpid: KRef) -> KernelResult<PromiseState> {
        self.keeper.promise_state(kpid)
    }

    /// `(rejected, data)` of a settled promise.
    pub fn kp_resolution(&self, kpid: KRef) -> KernelResult<(bool, KernelCapData)> {
        match self.keeper.promise_resolution(kpid)? {
            (PromiseState::Unresolved, _) | (_, None) => Err(KernelError::Unresolved(kpid.to_string())),
            (state, Some(data)) => Ok((state == PromiseState::Rejected, data)),
        }
    }

    // ── Lifecycle requests ──

    /// Queue an upgrade of `vat` to `bundle_id`. Returns the upgrade ID the
    /// vat-admin handler will hear about.
    pub fn request_upgrade(
        &mut self,
        vat: VatId,
        bundle_id: &str,
        params: KernelCapData,
        upgrade_message: &str,
    ) -> KernelResult<u64> {
        self.host_commit(|k| {
            if !k.keeper.is_vat_alive(vat)? {
                return Err(KernelError::UnknownVat(vat.to_string()));
            }
            if !k.keeper.store().has_bundle(bundle_id) {
                return Err(KernelError::UnknownBundle(bundle_id.to_string()));
            }
            let upgrade_id = k.keeper.allocate_upgrade_id()?;
            let event = RunQueueEvent::UpgradeVat {
                vat,
                upgrade_id,
                bundle_id: bundle_id.to_string(),
                params,
                upgrade_message: upgrade_message.to_string(),
            };
            k.keeper.incref_event(&event)?;
            k.keeper.enqueue_run_queue(&event)?;
            Ok(upgrade_id)
        })
    }

    pub fn request_termination(&mut self, vat: VatId, reason: &str) -> KernelResult<()> {
        self.host_commit(|k| {
            if !k.keeper.is_vat_alive(vat)? {
                return Err(KernelError::UnknownVat(vat.to_string()));
            }
            let event = RunQueueEvent::TerminateVat {
                vat,
                failure: true,
                info: CapData::error(reason),
            };
            k.keeper.incref_event(&event)?;
            k.keeper.enqueue_run_queue(&event)
        })
    }

    /// Schedule a `bringOutYourDead` for every live vat.
    pub fn reap_all_vats(&mut self) -> KernelResult<()> {
        self.host_commit(|k| {
            for vat in k.keeper.live_vats()? {
                k.keeper.schedule_reap(vat)?;
            }
            Ok(())
        })
    }

    // ── Device input ──

    pub fn mailbox_deliver_inbound(&mut self, peer: &str, messages: &[(u64, String)], ack: u64) -> KernelResult<bool> {
        self.host_commit(|k| {
            let device = devices::device_id(&k.keeper, devices::MAILBOX)?;
            let mut ctx = DeviceContext::new(&mut k.keeper, device);
            Mailbox::deliver_inbound(&mut ctx, peer, messages, ack)
        })
    }

    /// Pending outbound messages for `peer`, plus our ack of its traffic.
    pub fn mailbox_outbox(&self, peer: &str) -> KernelResult<(Vec<(u64, String)>, u64)> {
        let device = devices::device_id(&self.keeper, devices::MAILBOX)?;
        Mailbox::outbox(&self.keeper, device, peer)
    }

    /// Advance the timer device to `now`. Returns the number of wakeups queued.
    pub fn timer_poll(&mut self, now: u64) -> KernelResult<usize> {
        self.host_commit(|k| {
            let device = devices::device_id(&k.keeper, devices::TIMER)?;
            let mut ctx = DeviceContext::new(&mut k.keeper, device);
            Timer::poll(&mut ctx, now)
        })
    }

    // ── Queries ──

    pub fn vat_root(&self, vat: VatId) -> KernelResult<KRef> {
        self.keeper
            .clist_kref(vat, VRef::root())?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub fn vat_id_by_name(&self, name: &str) -> KernelResult<Option<VatId>> {
        Ok(self.keeper.vat_names()?.get(name).copied())
    }

    pub fn vat_incarnation(&self, vat: VatId) -> KernelResult<u64> {
        self.keeper.vat_incarnation(vat)
    }

    pub fn is_vat_alive(&self, vat: VatId) -> KernelResult<bool> {
        self.keeper.is_vat_alive(vat)
    }

    pub fn clist_entries(&self, vat: VatId) -> KernelResult<Vec<ClistEntry>> {
        self.keeper.clist_entries(vat)
    }

    pub fn object_refcount(&self, kref: KRef) -> KernelResult<RefCount> {
        self.keeper.object_refcount(kref)
    }

    pub fn gc_state(&self, kref: KRef) -> KernelResult<GcState> {
        self.keeper.gc_state(kref)
    }

    /// Vats whose worker is currently resident.
    pub fn online_vats(&self) -> Vec<VatId> {
        self.workers.online()
    }

    pub fn run_queue_len(&self) -> KernelResult<u64> {
        self.keeper.run_queue_len()
    }

    pub fn crank_number(&self) -> KernelResult<u64> {
        self.keeper.crank_number()
    }

    /// Running hash over every committed crank's changes.
    pub fn activity_hash(&self) -> String {
        self.keeper.store().activity_hash().to_string()
    }

    /// The root node of a standard device (`"mailbox"`, `"timer"`, `"vatAdmin"`).
    pub fn device_kref(&self, name: &str) -> KernelResult<KRef> {
        let device = devices::device_id(&self.keeper, name)?;
        self.keeper
            .device_root(device)?
            .ok_or_else(|| KernelError::UnknownDevice(name.to_string()))
    }

    /// Snapshot the store and truncate the WAL.
    pub fn checkpoint(&mut self) -> KernelResult<()> {
        self.check_panic()?;
        self.keeper.store_mut().checkpoint()?;
        self.commits_since_checkpoint = 0;
        Ok(())
    }
}
