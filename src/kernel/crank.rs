//! The crank loop.
//!
//! One crank = one event, start to finish:
//! ```text
//! savepoint(Start) → pick event → savepoint(Deliver) → process
//!   → [abort: rollback, terminate vat] → process_refcounts → commit
//! ```
//! Events are picked in priority order: pending GC actions, then pending
//! reaps, then the run queue.

use std::collections::BTreeSet;

use crate::capdata::{CapData, KernelCapData, Message};
use crate::error::{KernelError, KernelResult};
use crate::slots::{KRef, VatId};
use crate::store::Savepoint;
use crate::vat::{TranscriptEntry, VatDelivery, VatManager};

use super::keeper::PromiseState;
use super::run_queue::RunQueueEvent;
use super::syscall::{ExitRequest, SyscallHandler};
use super::Kernel;

/// A vat that has to go once the crank's delivery is settled.
#[derive(Debug, Clone)]
pub(crate) struct Termination {
    pub vat: VatId,
    pub failure: bool,
    pub info: KernelCapData,
    /// Undo the delivery's effects before terminating.
    pub discard: bool,
}

impl Termination {
    fn failed(vat: VatId, reason: &str) -> Self {
        Self {
            vat,
            failure: true,
            info: CapData::error(reason),
            discard: true,
        }
    }
}

/// What a delivery did, as far as the crank is concerned.
#[derive(Debug, Default)]
pub(crate) struct DeliveryOutcome {
    pub illegal: Option<String>,
    pub error: Option<String>,
    pub meter_underflow: bool,
    pub exit: Option<ExitRequest>,
}

impl DeliveryOutcome {
    pub fn is_clean(&self) -> bool {
        self.illegal.is_none() && self.error.is_none() && !self.meter_underflow && self.exit.is_none()
    }

    /// Whether the delivery's effects must be thrown away.
    pub fn discards(&self) -> bool {
        self.illegal.is_some()
            || self.error.is_some()
            || self.meter_underflow
            || self.exit.as_ref().is_some_and(|x| x.failure)
    }

    /// Highest-priority problem first: illegal syscall, delivery error,
    /// meter underflow, then a requested exit.
    pub fn termination(&self, vat: VatId) -> Option<Termination> {
        if let Some(reason) = &self.illegal {
            return Some(Termination::failed(vat, &format!("illegal syscall: {reason}")));
        }
        if let Some(err) = &self.error {
            return Some(Termination::failed(vat, &format!("delivery failed: {err}")));
        }
        if self.meter_underflow {
            return Some(Termination::failed(vat, "meter underflow"));
        }
        self.exit.as_ref().map(|x| Termination {
            vat,
            failure: x.failure,
            info: x.info.clone(),
            discard: x.failure,
        })
    }

    pub fn describe(&self) -> String {
        match self.termination(VatId(0)) {
            Some(t) => t
                .info
                .error_message()
                .unwrap_or_else(|| format!("vat exited: {}", t.info.body)),
            None => "ok".into(),
        }
    }
}

enum Route {
    Deliver { vat: VatId, target: KRef },
    Queue(KRef),
    Splat(KernelCapData),
}

impl Kernel {
    /// Run one crank. `Ok(false)` means there was nothing to do.
    ///
    /// Any error is fatal: the kernel is panicked and every later call
    /// returns the same error.
    pub async fn step(&mut self) -> KernelResult<bool> {
        self.check_panic()?;
        match self.crank().await {
            Ok(did) => Ok(did),
            Err(e) => {
                self.enter_panic(&e);
                Err(e)
            }
        }
    }

    /// Run until idle. Returns the number of cranks.
    pub async fn run(&mut self) -> KernelResult<u64> {
        let mut cranks = 0;
        while self.step().await? {
            cranks += 1;
        }
        Ok(cranks)
    }

    async fn crank(&mut self) -> KernelResult<bool> {
        self.keeper.establish_savepoint(Savepoint::Start);
        let Some(event) = self.next_event()? else {
            self.keeper.abort_crank();
            return Ok(false);
        };
        tracing::debug!("crank {}: {}", self.keeper.crank_number()?, event.kind());
        self.keeper.establish_savepoint(Savepoint::Deliver);

        if let Some(t) = self.process_event(&event).await? {
            self.apply_termination(&event, t)?;
        }

        self.keeper.process_refcounts()?;
        self.keeper.increment_crank_number()?;
        self.commit()?;
        Ok(true)
    }

    fn next_event(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        if let Some(event) = self.keeper.next_gc_event(self.config.gc_batch_size)? {
            return Ok(Some(event));
        }
        if let Some(vat) = self.keeper.next_reap()? {
            return Ok(Some(RunQueueEvent::BringOutYourDead { vat }));
        }
        self.keeper.dequeue_run_queue()
    }

    async fn process_event(&mut self, event: &RunQueueEvent) -> KernelResult<Option<Termination>> {
        match event {
            RunQueueEvent::Send { target, msg } => self.process_send(event, *target, msg).await,
            RunQueueEvent::Notify { vat, kpid } => self.process_notify(event, *vat, *kpid).await,
            RunQueueEvent::DropExports { vat, krefs } => {
                if !self.keeper.is_vat_alive(*vat)? {
                    return Ok(None);
                }
                let vrefs = self.keeper.gc_vrefs(*vat, krefs)?;
                for kref in krefs {
                    self.keeper.clear_reachable_flag(*vat, *kref)?;
                }
                let outcome = self.deliver(*vat, VatDelivery::DropExports { vrefs }).await?;
                Ok(outcome.termination(*vat))
            }
            RunQueueEvent::RetireExports { vat, krefs } => {
                if !self.keeper.is_vat_alive(*vat)? {
                    return Ok(None);
                }
                let vrefs = self.keeper.gc_vrefs(*vat, krefs)?;
                for (kref, vref) in krefs.iter().zip(&vrefs) {
                    self.keeper.delete_clist_entry(*vat, *kref, *vref)?;
                    self.keeper.delete_object(*kref);
                }
                let outcome = self.deliver(*vat, VatDelivery::RetireExports { vrefs }).await?;
                Ok(outcome.termination(*vat))
            }
            RunQueueEvent::RetireImports { vat, krefs } => {
                if !self.keeper.is_vat_alive(*vat)? {
                    return Ok(None);
                }
                let vrefs = self.keeper.gc_vrefs(*vat, krefs)?;
                self.keeper.delete_clist_entries_for(*vat, krefs)?;
                let outcome = self.deliver(*vat, VatDelivery::RetireImports { vrefs }).await?;
                Ok(outcome.termination(*vat))
            }
            RunQueueEvent::BringOutYourDead { vat } => {
                if !self.keeper.is_vat_alive(*vat)? {
                    return Ok(None);
                }
                let outcome = self.deliver(*vat, VatDelivery::BringOutYourDead).await?;
                Ok(outcome.termination(*vat))
            }
            RunQueueEvent::StartVat { vat, params } => {
                if !self.keeper.is_vat_alive(*vat)? {
                    self.keeper.decref_event(event)?;
                    return Ok(None);
                }
                let params = self.keeper.capdata_inbound(*vat, params)?;
                let outcome = self.deliver(*vat, VatDelivery::StartVat { params }).await?;
                self.keeper.decref_event(event)?;
                Ok(outcome.termination(*vat))
            }
            RunQueueEvent::CreateVat {
                vat,
                bundle_id,
                params,
                options,
            } => {
                self.process_create_vat(event, *vat, bundle_id, params, options)
                    .await
            }
            RunQueueEvent::UpgradeVat {
                vat,
                upgrade_id,
                bundle_id,
                params,
                upgrade_message,
            } => {
                self.process_upgrade_vat(event, *vat, *upgrade_id, bundle_id, params, upgrade_message)
                    .await?;
                Ok(None)
            }
            RunQueueEvent::TerminateVat { vat, failure, info } => {
                self.terminate_vat(*vat, *failure, info)?;
                self.keeper.decref_event(event)?;
                Ok(None)
            }
            RunQueueEvent::NegatedGcAction => Ok(None),
        }
    }

    /// Roll back as needed, then terminate. A delivery that consumed its
    /// event keeps it consumed; anything else rewinds to before the pop.
    fn apply_termination(&mut self, event: &RunQueueEvent, t: Termination) -> KernelResult<()> {
        let mut info = t.info;
        if t.discard {
            let consumed = matches!(
                event,
                RunQueueEvent::Send { .. }
                    | RunQueueEvent::Notify { .. }
                    | RunQueueEvent::StartVat { .. }
                    | RunQueueEvent::CreateVat { .. }
            );
            // Slots in the info may have been created by the discarded delivery.
            if !info.slots.is_empty() {
                info = CapData::error(&info.error_message().unwrap_or_else(|| "vat failed".into()));
            }
            if consumed {
                self.keeper.rollback_to(Savepoint::Deliver);
                self.drop_consumed_event(event, &info)?;
            } else {
                self.keeper.rollback_to(Savepoint::Start);
            }
            self.workers.remove(&t.vat);
        }
        self.terminate_vat(t.vat, t.failure, &info)
    }

    fn drop_consumed_event(&mut self, event: &RunQueueEvent, reason: &KernelCapData) -> KernelResult<()> {
        if let RunQueueEvent::Send {
            msg: Message {
                result: Some(kpid), ..
            },
            ..
        } = event
        {
            if self.keeper.promise_state(*kpid)? == PromiseState::Unresolved {
                self.keeper.resolve_promise(None, *kpid, true, reason)?;
            }
        }
        self.keeper.decref_event(event)
    }

    // ── Sends ──

    fn route(&self, target: KRef) -> KernelResult<Route> {
        let mut target = target;
        let mut seen = BTreeSet::new();
        loop {
            if !seen.insert(target) {
                return Ok(Route::Splat(CapData::error("promise resolution cycle")));
            }
            match target {
                KRef::Object(_) => {
                    return Ok(match self.keeper.object_owner(target)? {
                        Some(vat) if self.keeper.is_vat_alive(vat)? => Route::Deliver { vat, target },
                        _ => Route::Splat(CapData::error("vat terminated")),
                    });
                }
                KRef::Device(_) => {
                    return Ok(Route::Splat(CapData::error("device nodes cannot receive messages")));
                }
                KRef::Promise(_) => {
                    let p = self.keeper.promise(target)?;
                    match (p.state, p.data) {
                        (PromiseState::Unresolved, _) => return Ok(Route::Queue(target)),
                        (PromiseState::Rejected, data) => {
                            return Ok(Route::Splat(data.unwrap_or_else(|| CapData::error("rejected"))));
                        }
                        (PromiseState::Fulfilled, Some(data)) => match data.single_slot() {
                            Some(next) if !next.is_device() => target = *next,
                            _ => return Ok(Route::Splat(CapData::error("data is not callable"))),
                        },
                        (PromiseState::Fulfilled, None) => {
                            return Err(KernelError::InvalidData(format!("{target} fulfilled without data")));
                        }
                    }
                }
            }
        }
    }

    async fn process_send(
        &mut self,
        event: &RunQueueEvent,
        target: KRef,
        msg: &Message<KRef>,
    ) -> KernelResult<Option<Termination>> {
        match self.route(target)? {
            Route::Deliver { vat, target: actual } => {
                let delivery = self.keeper.translate_send(vat, actual, msg)?;
                let outcome = self.deliver(vat, delivery).await?;
                self.keeper.decref_event(event)?;
                Ok(outcome.termination(vat))
            }
            Route::Queue(kpid) => {
                // The parked message holds the promise it waits on.
                if kpid != target {
                    self.keeper.increment_refcount(kpid, Default::default())?;
                    self.keeper.decrement_refcount(target, Default::default())?;
                }
                tracing::debug!("{target}.{} queued on {kpid}", msg.method);
                self.keeper.add_message_to_promise_queue(kpid, msg.clone())?;
                Ok(None)
            }
            Route::Splat(reason) => {
                tracing::debug!(
                    "{target}.{} splat: {}",
                    msg.method,
                    reason.error_message().unwrap_or_else(|| reason.body.clone())
                );
                if let Some(kpid) = msg.result {
                    if self.keeper.promise_state(kpid)? == PromiseState::Unresolved {
                        self.keeper.resolve_promise(None, kpid, true, &reason)?;
                    }
                }
                self.keeper.decref_event(event)?;
                Ok(None)
            }
        }
    }

    async fn process_notify(
        &mut self,
        event: &RunQueueEvent,
        vat: VatId,
        kpid: KRef,
    ) -> KernelResult<Option<Termination>> {
        if !self.keeper.is_vat_alive(vat)? {
            self.keeper.decref_event(event)?;
            return Ok(None);
        }
        let Some(delivery) = self.keeper.translate_notify(vat, kpid)? else {
            tracing::debug!("{vat} no longer knows {kpid}; notify skipped");
            self.keeper.decref_event(event)?;
            return Ok(None);
        };
        let outcome = self.deliver(vat, delivery).await?;
        if !outcome.discards() {
            // A resolved promise is retired from the vat's c-list once it has heard.
            self.keeper.delete_clist_entries_for(vat, &[kpid])?;
        }
        self.keeper.decref_event(event)?;
        Ok(outcome.termination(vat))
    }

    // ── Deliveries ──

    /// Deliver to a vat and settle the bookkeeping: metering, the transcript,
    /// reap dirt. A delivery whose effects will be discarded leaves no
    /// transcript entry and its worker is dropped.
    pub(crate) async fn deliver(&mut self, vat: VatId, delivery: VatDelivery) -> KernelResult<DeliveryOutcome> {
        let mut manager = self.take_worker(vat).await?;
        let kind = delivery.kind();
        let is_reap = matches!(delivery, VatDelivery::BringOutYourDead);
        tracing::debug!("{vat} ← {kind}");

        let mut handler = SyscallHandler::new(&mut self.keeper, &self.devices, vat);
        let entry = manager.deliver(delivery, |sc| handler.handle(sc)).await;
        let report = handler.finish()?;

        let mut outcome = DeliveryOutcome {
            illegal: report.illegal,
            error: entry.status.clone().err(),
            meter_underflow: false,
            exit: report.exit,
        };
        if let Some(remaining) = self.keeper.vat_meter(vat)? {
            let used = 1 + entry.syscalls.len() as u64;
            match remaining.checked_sub(used) {
                Some(left) => self.keeper.set_vat_meter(vat, left),
                None => outcome.meter_underflow = true,
            }
        }
        if let Some(err) = &outcome.error {
            tracing::warn!("{vat} {kind} failed: {err}");
        }

        if outcome.discards() {
            return Ok(outcome);
        }

        self.keeper.add_transcript_entry(vat, entry.to_json()?)?;
        if !is_reap {
            let interval = self
                .keeper
                .vat_options(vat)?
                .reap_interval
                .or(self.config.default_reap_interval);
            if self.keeper.add_reap_dirt(vat, interval)? {
                self.keeper.schedule_reap(vat)?;
            }
        }
        self.workers.insert(vat, manager);
        Ok(outcome)
    }

    /// The vat's running worker, rebuilt from the current incarnation's
    /// transcript if there isn't one.
    pub(crate) async fn take_worker(&mut self, vat: VatId) -> KernelResult<VatManager> {
        if let Some(manager) = self.workers.remove(&vat) {
            return Ok(manager);
        }
        let source = self.keeper.vat_source(vat)?;
        let mut manager = self.spawn_worker(vat, &source.bundle_id)?;
        let (start, end) = self.keeper.transcript_bounds(vat)?;
        let entries = self.keeper.store().read_transcript(vat, start, end)?;
        for (pos, json) in (start..end).zip(entries) {
            let entry = TranscriptEntry::from_json(&json)?;
            manager.replay(pos, &entry).await?;
        }
        if end > start {
            tracing::info!("{vat}: worker rebuilt from {} transcript entries", end - start);
        }
        Ok(manager)
    }

    /// Load `bundle_id` and start a fresh worker for it.
    pub(crate) fn spawn_worker(&self, vat: VatId, bundle_id: &str) -> KernelResult<VatManager> {
        let bytes = self
            .keeper
            .store()
            .get_bundle(bundle_id)
            .ok_or_else(|| KernelError::UnknownBundle(bundle_id.to_string()))?;
        let dispatch = self
            .loader
            .load(bundle_id, bytes)
            .map_err(KernelError::Loader)?;
        Ok(VatManager::spawn(vat, dispatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(failure: bool) -> Option<ExitRequest> {
        Some(ExitRequest {
            failure,
            info: CapData::data("\"bye\""),
        })
    }

    #[test]
    fn outcome_priority() {
        let v = VatId(4);
        let o = DeliveryOutcome {
            illegal: Some("bad slot".into()),
            error: Some("boom".into()),
            meter_underflow: true,
            exit: exit(false),
        };
        let t = o.termination(v).unwrap();
        assert!(t.failure && t.discard);
        assert!(o.describe().contains("bad slot"));

        let o = DeliveryOutcome {
            meter_underflow: true,
            exit: exit(false),
            ..Default::default()
        };
        assert_eq!(o.describe(), "meter underflow");

        let o = DeliveryOutcome {
            exit: exit(false),
            ..Default::default()
        };
        let t = o.termination(v).unwrap();
        assert!(!t.failure && !t.discard);
        assert!(!o.discards());
        assert!(!o.is_clean());

        let o = DeliveryOutcome {
            exit: exit(true),
            ..Default::default()
        };
        assert!(o.discards());

        assert!(DeliveryOutcome::default().termination(v).is_none());
        assert!(DeliveryOutcome::default().is_clean());
    }
}
