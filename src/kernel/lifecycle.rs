//! Vat lifecycle: creation, upgrade, termination.

use std::fmt;

use serde_json::{json, Value};

use crate::capdata::{CapData, KernelCapData};
use crate::devices::{self, vat_admin::VatAdmin, DeviceContext};
use crate::error::{KernelError, KernelResult};
use crate::slots::{KRef, VRef, VatId};
use crate::store::Savepoint;
use crate::vat::{VatDelivery, VatOptions};

use super::clist::{MapOpts, VatSource};
use super::crank::Termination;
use super::keeper::{json_capdata, PromiseState};
use super::run_queue::RunQueueEvent;
use super::Kernel;

/// Steps of an upgrade, for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradePhase {
    Reaping,
    Disconnecting,
    Loading,
    Starting,
    Done,
    RolledBack,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpgradePhase::Reaping => "reaping old incarnation",
            UpgradePhase::Disconnecting => "disconnecting promises",
            UpgradePhase::Loading => "loading new bundle",
            UpgradePhase::Starting => "starting new incarnation",
            UpgradePhase::Done => "done",
            UpgradePhase::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

impl Kernel {
    /// Kernel-side state for a new vat: c-list, options, name, root object.
    pub(crate) fn initialize_vat(
        &mut self,
        vat: VatId,
        bundle_id: &str,
        options: &VatOptions,
    ) -> KernelResult<KRef> {
        let source = VatSource {
            bundle_id: bundle_id.to_string(),
        };
        self.keeper.init_vat_state(vat, &source, options)?;
        self.keeper.add_live_vat(vat)?;
        if let Some(name) = &options.name {
            self.keeper.register_vat_name(name, vat)?;
        }
        let root = self.keeper.map_outbound(vat, VRef::root(), MapOpts::default())?;
        tracing::info!("{vat} initialized from {bundle_id} (root {root})");
        Ok(root)
    }

    pub(crate) async fn process_create_vat(
        &mut self,
        event: &RunQueueEvent,
        vat: VatId,
        bundle_id: &str,
        params: &KernelCapData,
        options: &VatOptions,
    ) -> KernelResult<Option<Termination>> {
        let root = self.initialize_vat(vat, bundle_id, options)?;
        // A failed startVat rolls back to here, keeping the vat's entry so it
        // can be terminated cleanly.
        self.keeper.establish_savepoint(Savepoint::Deliver);

        let manager = match self.spawn_worker(vat, bundle_id) {
            Ok(m) => m,
            Err(KernelError::Loader(reason)) => {
                tracing::warn!("{vat}: cannot load {bundle_id}: {reason}");
                self.keeper.decref_event(event)?;
                return Ok(Some(Termination {
                    vat,
                    failure: true,
                    info: CapData::error(&format!("vat creation failed: {reason}")),
                    discard: false,
                }));
            }
            Err(e) => return Err(e),
        };
        self.workers.insert(vat, manager);

        let params = self.keeper.capdata_inbound(vat, params)?;
        let outcome = self.deliver(vat, VatDelivery::StartVat { params }).await?;
        self.keeper.decref_event(event)?;
        if let Some(t) = outcome.termination(vat) {
            return Ok(Some(t));
        }
        self.vat_admin_notify(
            "newVatCallback",
            json_capdata(json!([vat.to_string(), {"@slot": 0}]), vec![root]),
        )?;
        Ok(None)
    }

    pub(crate) async fn process_upgrade_vat(
        &mut self,
        event: &RunQueueEvent,
        vat: VatId,
        upgrade_id: u64,
        bundle_id: &str,
        params: &KernelCapData,
        upgrade_message: &str,
    ) -> KernelResult<()> {
        if !self.keeper.is_vat_alive(vat)? {
            self.keeper.decref_event(event)?;
            return self.vat_admin_notify(
                "vatUpgradeCallback",
                CapData::from_json(&json!([upgrade_id, false, {"@error": format!("{vat} is not running")}])),
            );
        }

        match self.try_upgrade(vat, bundle_id, params, upgrade_message).await? {
            Ok(incarnation) => {
                tracing::info!("upgrade {upgrade_id} of {vat}: {}", UpgradePhase::Done);
                self.keeper.decref_event(event)?;
                self.vat_admin_notify(
                    "vatUpgradeCallback",
                    CapData::from_json(&json!([upgrade_id, true, incarnation])),
                )
            }
            Err(reason) => {
                tracing::warn!("upgrade {upgrade_id} of {vat} failed: {reason}");
                self.keeper.rollback_to(Savepoint::Deliver);
                self.workers.remove(&vat);
                tracing::info!("upgrade {upgrade_id} of {vat}: {}", UpgradePhase::RolledBack);
                self.keeper.decref_event(event)?;
                self.vat_admin_notify(
                    "vatUpgradeCallback",
                    CapData::from_json(&json!([upgrade_id, false, {"@error": reason}])),
                )
            }
        }
    }

    /// The upgrade proper. `Ok(Err(reason))` means the vat refused or failed
    /// and the caller must roll back.
    async fn try_upgrade(
        &mut self,
        vat: VatId,
        bundle_id: &str,
        params: &KernelCapData,
        upgrade_message: &str,
    ) -> KernelResult<Result<u64, String>> {
        tracing::debug!("upgrade {vat}: {}", UpgradePhase::Reaping);
        let outcome = self.deliver(vat, VatDelivery::BringOutYourDead).await?;
        if !outcome.is_clean() {
            return Ok(Err(outcome.describe()));
        }
        self.workers.remove(&vat);

        tracing::debug!("upgrade {vat}: {}", UpgradePhase::Disconnecting);
        let old_incarnation = self.keeper.vat_incarnation(vat)?;
        let disconnection = CapData::from_json(&json!({
            "@disconnection": {
                "name": "vatUpgraded",
                "upgradeMessage": upgrade_message,
                "incarnationNumber": old_incarnation,
            }
        }));
        self.reject_decided_promises(vat, &disconnection)?;
        let promises: Vec<KRef> = self
            .keeper
            .clist_entries(vat)?
            .into_iter()
            .filter(|e| e.kref.is_promise())
            .map(|e| e.kref)
            .collect();
        self.keeper.delete_clist_entries_for(vat, &promises)?;

        tracing::debug!("upgrade {vat}: {}", UpgradePhase::Loading);
        let incarnation = self.keeper.begin_new_incarnation(vat)?;
        self.keeper.set_vat_source(
            vat,
            &VatSource {
                bundle_id: bundle_id.to_string(),
            },
        )?;
        let manager = match self.spawn_worker(vat, bundle_id) {
            Ok(m) => m,
            Err(KernelError::Loader(reason)) => return Ok(Err(reason)),
            Err(e) => return Err(e),
        };
        self.workers.insert(vat, manager);

        tracing::debug!("upgrade {vat}: {}", UpgradePhase::Starting);
        let params = self.keeper.capdata_inbound(vat, params)?;
        let outcome = self.deliver(vat, VatDelivery::StartVat { params }).await?;
        if !outcome.is_clean() {
            return Ok(Err(outcome.describe()));
        }
        Ok(Ok(incarnation))
    }

    /// Remove a vat for good. Promises it decides are rejected with `info`,
    /// its exports are orphaned and retired, and every c-list entry and
    /// vatstore key goes. Terminating a critical vat panics the kernel.
    pub(crate) fn terminate_vat(&mut self, vat: VatId, failure: bool, info: &KernelCapData) -> KernelResult<()> {
        if !self.keeper.is_vat_alive(vat)? {
            tracing::debug!("{vat} already gone");
            return Ok(());
        }
        let options = self.keeper.vat_options(vat)?;
        let reason = info.error_message().unwrap_or_else(|| info.body.clone());
        if options.critical {
            return Err(KernelError::Panic(format!("critical vat {vat} terminated: {reason}")));
        }
        if failure {
            tracing::warn!("terminating {vat}: {reason}");
        } else {
            tracing::info!("{vat} exited: {reason}");
        }

        self.reject_decided_promises(vat, info)?;
        self.keeper.mark_vat_terminated(vat)?;

        for entry in self.keeper.clist_entries(vat)? {
            self.keeper.delete_clist_entry(vat, entry.kref, entry.vref)?;
            if entry.kref.is_object() && entry.vref.allocated_by_vat {
                self.keeper.retire_kernel_objects(&[entry.kref])?;
            }
        }
        self.keeper.delete_vatstore(vat);
        self.workers.remove(&vat);

        let details = info.body_json().unwrap_or(Value::Null);
        self.vat_admin_notify(
            "vatTerminated",
            json_capdata(json!([vat.to_string(), failure, details]), info.slots.clone()),
        )
    }

    fn reject_decided_promises(&mut self, vat: VatId, data: &KernelCapData) -> KernelResult<()> {
        for entry in self.keeper.clist_entries(vat)? {
            if !entry.kref.is_promise() {
                continue;
            }
            let p = self.keeper.promise(entry.kref)?;
            if p.state == PromiseState::Unresolved && p.decider == Some(vat) {
                self.keeper.resolve_promise(Some(vat), entry.kref, true, data)?;
            }
        }
        Ok(())
    }

    pub(crate) fn vat_admin_notify(&mut self, method: &str, args: KernelCapData) -> KernelResult<()> {
        let device = devices::device_id(&self.keeper, devices::VAT_ADMIN)?;
        let mut ctx = DeviceContext::new(&mut self.keeper, device);
        VatAdmin::notify(&mut ctx, method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_phases_read_well_in_logs() {
        assert_eq!(UpgradePhase::Disconnecting.to_string(), "disconnecting promises");
        assert_ne!(UpgradePhase::Done, UpgradePhase::RolledBack);
    }
}
