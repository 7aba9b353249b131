//! Vat-admin device — lets a privileged vat create, upgrade and terminate
//! vats. Each request becomes a run-queue event; outcomes come back to the
//! registered admin handler as send-only messages:
//!
//! - `newVatCallback(vatID, root)` after a dynamic vat starts
//! - `vatUpgradeCallback(upgradeID, success, incarnation | error)`
//! - `vatTerminated(vatID, isFailure, info)` on every termination

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capdata::{CapData, KernelCapData};
use crate::error::{KernelResult, SyscallError, SyscallResult};
use crate::kernel::run_queue::RunQueueEvent;
use crate::slots::{KRef, VatId};
use crate::vat::VatOptions;

use super::{unknown_method, Device, DeviceArgs, DeviceContext};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct VatAdminState {
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<KRef>,
}

pub struct VatAdmin;

fn live_vat(ctx: &DeviceContext<'_>, a: &DeviceArgs<'_>, index: usize) -> SyscallResult<VatId> {
    let vat: VatId = a
        .str(index)?
        .parse()
        .map_err(|e| SyscallError::Device(format!("{e}")))?;
    if !ctx.keeper.is_vat_alive(vat)? {
        return Err(SyscallError::Device(format!("{vat} is not running")).into());
    }
    Ok(vat)
}

fn known_bundle(ctx: &DeviceContext<'_>, a: &DeviceArgs<'_>, index: usize) -> SyscallResult<String> {
    let bundle_id = a.str(index)?;
    if !ctx.keeper.store().has_bundle(bundle_id) {
        return Err(SyscallError::Device(format!("unknown bundle {bundle_id}")).into());
    }
    Ok(bundle_id.to_string())
}

impl Device for VatAdmin {
    fn name(&self) -> &'static str {
        super::VAT_ADMIN
    }

    fn invoke(
        &self,
        method: &str,
        args: &KernelCapData,
        ctx: &mut DeviceContext<'_>,
    ) -> SyscallResult<KernelCapData> {
        let a = DeviceArgs::parse(method, args)?;
        let result = match method {
            "registerAdminHandler" => {
                let mut state: VatAdminState = ctx.load_state()?;
                if state.handler.is_some() {
                    return Err(SyscallError::DuplicateHandler("vat-admin handler".into()).into());
                }
                let handler = a.slot(0)?;
                ctx.retain(handler)?;
                state.handler = Some(handler);
                ctx.save_state(&state)?;
                Value::Null
            }
            "createVat" => {
                let bundle_id = known_bundle(ctx, &a, 0)?;
                let options: VatOptions = match a.value(1) {
                    None | Some(Value::Null) => VatOptions::default(),
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| SyscallError::Device(format!("bad vat options: {e}")))?,
                };
                if let Some(name) = &options.name {
                    if ctx.keeper.vat_names()?.contains_key(name) {
                        return Err(SyscallError::Device(format!("vat name '{name}' in use")).into());
                    }
                }
                let vat = ctx.keeper.allocate_vat_id()?;
                tracing::info!("vat-admin: creating {vat} from {bundle_id}");
                ctx.queue(RunQueueEvent::CreateVat {
                    vat,
                    bundle_id,
                    params: a.capdata(2),
                    options,
                })?;
                json!(vat.to_string())
            }
            "upgradeContract" => {
                let vat = live_vat(ctx, &a, 0)?;
                let bundle_id = known_bundle(ctx, &a, 1)?;
                let upgrade_message = a
                    .value(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let upgrade_id = ctx.keeper.allocate_upgrade_id()?;
                tracing::info!("vat-admin: upgrade {upgrade_id} of {vat} to {bundle_id}");
                ctx.queue(RunQueueEvent::UpgradeVat {
                    vat,
                    upgrade_id,
                    bundle_id,
                    params: a.capdata(2),
                    upgrade_message,
                })?;
                json!(upgrade_id)
            }
            "terminateWithFailure" => {
                let vat = live_vat(ctx, &a, 0)?;
                ctx.queue(RunQueueEvent::TerminateVat {
                    vat,
                    failure: true,
                    info: a.capdata(1),
                })?;
                Value::Null
            }
            "getBundleCap" => {
                let bundle_id = known_bundle(ctx, &a, 0)?;
                json!({ "bundleID": bundle_id })
            }
            other => return Err(unknown_method(self.name(), other).into()),
        };
        Ok(CapData::from_json(&result))
    }
}

impl VatAdmin {
    /// Tell the admin handler about a vat lifecycle change. Dropped (with a
    /// debug log) if no handler is registered.
    pub fn notify(ctx: &mut DeviceContext<'_>, method: &str, args: KernelCapData) -> KernelResult<()> {
        let state: VatAdminState = ctx.load_state()?;
        match state.handler {
            Some(handler) => ctx.send_only(handler, method, args),
            None => {
                tracing::debug!("vat-admin {method} with no handler registered");
                Ok(())
            }
        }
    }
}
