//! Devices — privileged, synchronous endpoints reached through `callNow`.
//!
//! A device never delivers into a vat directly. It keeps its own small state
//! under `<device>.deviceState` (so it commits and rolls back with the crank)
//! and talks to vats only by queueing send-only messages.
//!
//! Three devices are installed when a kernel is first created:
//! - `mailbox` (d1): sequence-numbered message exchange with remote peers
//! - `timer` (d2): wakeups and repeaters driven by host polls
//! - `vatAdmin` (d3): dynamic vat creation, upgrade and termination

pub mod mailbox;
pub mod timer;
pub mod vat_admin;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::capdata::{CapData, KernelCapData};
use crate::error::{KernelError, KernelResult, SyscallError, SyscallResult};
use crate::kernel::keeper::{KernelKeeper, RefOpts};
use crate::kernel::run_queue::RunQueueEvent;
use crate::slots::{DeviceId, KRef};

pub use mailbox::Mailbox;
pub use timer::Timer;
pub use vat_admin::VatAdmin;

pub const MAILBOX: &str = "mailbox";
pub const TIMER: &str = "timer";
pub const VAT_ADMIN: &str = "vatAdmin";

/// Device code. Implementations are stateless; everything persistent goes
/// through the context.
pub trait Device: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle a `callNow` from a vat. `args` is already in kernel space.
    fn invoke(
        &self,
        method: &str,
        args: &KernelCapData,
        ctx: &mut DeviceContext<'_>,
    ) -> SyscallResult<KernelCapData>;
}

/// What a device may touch while it runs.
pub struct DeviceContext<'a> {
    pub(crate) keeper: &'a mut KernelKeeper,
    pub(crate) device: DeviceId,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(keeper: &'a mut KernelKeeper, device: DeviceId) -> Self {
        Self { keeper, device }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn load_state<T: DeserializeOwned + Default>(&self) -> KernelResult<T> {
        device_state(self.keeper, self.device)
    }

    pub fn save_state<T: Serialize>(&mut self, state: &T) -> KernelResult<()> {
        self.keeper.set_json(&state_key(self.device), state)
    }

    /// Queue `method(args)` to `target` with no result promise.
    pub fn send_only(&mut self, target: KRef, method: &str, args: KernelCapData) -> KernelResult<()> {
        tracing::debug!("{} → {target}.{method}", self.device);
        self.keeper.queue_send_only(target, method, args)
    }

    /// Queue an arbitrary run-queue event, holding references for it.
    pub fn queue(&mut self, event: RunQueueEvent) -> KernelResult<()> {
        self.keeper.incref_event(&event)?;
        self.keeper.enqueue_run_queue(&event)
    }

    /// Hold a reference for as long as the device remembers `kref`.
    pub fn retain(&mut self, kref: KRef) -> KernelResult<()> {
        self.keeper.increment_refcount(kref, RefOpts::default())
    }

    pub fn release(&mut self, kref: KRef) -> KernelResult<()> {
        self.keeper.decrement_refcount(kref, RefOpts::default())
    }
}

fn state_key(device: DeviceId) -> String {
    format!("{device}.deviceState")
}

/// Read a device's state without a mutable context (host queries).
pub(crate) fn device_state<T: DeserializeOwned + Default>(
    keeper: &KernelKeeper,
    device: DeviceId,
) -> KernelResult<T> {
    Ok(keeper.get_json(&state_key(device))?.unwrap_or_default())
}

/// Positional arguments of a device call. Bodies are JSON arrays; a slot
/// argument is `{"@slot":N}`.
pub struct DeviceArgs<'a> {
    method: &'a str,
    args: &'a KernelCapData,
    items: Vec<Value>,
}

impl<'a> DeviceArgs<'a> {
    pub fn parse(method: &'a str, args: &'a KernelCapData) -> Result<Self, SyscallError> {
        let items = match args.body_json() {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(SyscallError::Device(format!(
                    "{method}: arguments must be a JSON array"
                )))
            }
        };
        Ok(Self {
            method,
            args,
            items,
        })
    }

    fn bad(&self, index: usize, want: &str) -> SyscallError {
        SyscallError::Device(format!("{}: argument {index} must be {want}", self.method))
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn str(&self, index: usize) -> Result<&str, SyscallError> {
        self.value(index)
            .and_then(Value::as_str)
            .ok_or_else(|| self.bad(index, "a string"))
    }

    pub fn u64(&self, index: usize) -> Result<u64, SyscallError> {
        self.value(index)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.bad(index, "a non-negative integer"))
    }

    pub fn slot(&self, index: usize) -> Result<KRef, SyscallError> {
        self.value(index)
            .and_then(|v| v.get("@slot"))
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| self.args.slots.get(n))
            .copied()
            .ok_or_else(|| self.bad(index, "a slot reference"))
    }

    /// Argument `index` re-wrapped as capdata. Slot numbering is preserved by
    /// carrying every slot of the call along.
    pub fn capdata(&self, index: usize) -> KernelCapData {
        let body = self.value(index).cloned().unwrap_or(Value::Null);
        CapData::new(body.to_string(), self.args.slots.clone())
    }
}

/// The devices of one kernel, by ID.
#[derive(Default)]
pub struct Devices {
    by_id: BTreeMap<DeviceId, Box<dyn Device>>,
}

fn standard_device(name: &str) -> Option<Box<dyn Device>> {
    match name {
        MAILBOX => Some(Box::new(Mailbox)),
        TIMER => Some(Box::new(Timer)),
        VAT_ADMIN => Some(Box::new(VatAdmin)),
        _ => None,
    }
}

impl Devices {
    /// Register the standard devices in a fresh kernel: allocate IDs, names
    /// and a root device node for each.
    pub fn install_standard(keeper: &mut KernelKeeper) -> KernelResult<()> {
        for name in [MAILBOX, TIMER, VAT_ADMIN] {
            let device = keeper.allocate_device_id()?;
            keeper.register_device_name(name, device)?;
            let root = keeper.add_device_node(device)?;
            keeper.set_device_root(device, root);
            tracing::debug!("installed device {name} as {device} (root {root})");
        }
        Ok(())
    }

    /// Rebuild the registry from persisted device names.
    pub fn load(keeper: &KernelKeeper) -> KernelResult<Self> {
        let mut by_id = BTreeMap::new();
        for (name, device) in keeper.device_names()? {
            let imp = standard_device(&name)
                .ok_or_else(|| KernelError::UnknownDevice(format!("{name} ({device})")))?;
            by_id.insert(device, imp);
        }
        Ok(Self { by_id })
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.by_id.keys().copied()
    }

    pub fn invoke(
        &self,
        keeper: &mut KernelKeeper,
        device: DeviceId,
        method: &str,
        args: &KernelCapData,
    ) -> SyscallResult<KernelCapData> {
        let imp = self
            .by_id
            .get(&device)
            .ok_or_else(|| KernelError::UnknownDevice(device.to_string()))?;
        tracing::debug!("callNow {}({device}).{method}", imp.name());
        let mut ctx = DeviceContext::new(keeper, device);
        imp.invoke(method, args, &mut ctx)
    }
}

/// Look up a standard device's ID by name.
pub(crate) fn device_id(keeper: &KernelKeeper, name: &str) -> KernelResult<DeviceId> {
    keeper
        .device_names()?
        .get(name)
        .copied()
        .ok_or_else(|| KernelError::UnknownDevice(name.to_string()))
}

/// Method not understood by a device. Reported to the calling vat.
pub(crate) fn unknown_method(device: &str, method: &str) -> SyscallError {
    SyscallError::Device(format!("{device} has no method '{method}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    #[test]
    fn standard_devices_get_stable_ids() {
        let mut k = KernelKeeper::new(Store::in_memory());
        Devices::install_standard(&mut k).unwrap();
        let names = k.device_names().unwrap();
        assert_eq!(names[MAILBOX], DeviceId(1));
        assert_eq!(names[TIMER], DeviceId(2));
        assert_eq!(names[VAT_ADMIN], DeviceId(3));
        assert_eq!(k.device_root(DeviceId(2)).unwrap(), Some(KRef::Device(2)));

        let devices = Devices::load(&k).unwrap();
        assert_eq!(devices.ids().count(), 3);
    }

    #[test]
    fn argument_parsing() {
        let args = CapData::new(
            json!(["peer", 7, {"@slot": 1}]).to_string(),
            vec![KRef::Object(4), KRef::Object(5)],
        );
        let a = DeviceArgs::parse("m", &args).unwrap();
        assert_eq!(a.str(0).unwrap(), "peer");
        assert_eq!(a.u64(1).unwrap(), 7);
        assert_eq!(a.slot(2).unwrap(), KRef::Object(5));
        assert!(a.u64(0).is_err());
        assert!(a.slot(1).is_err());
        assert_eq!(a.capdata(3).body, "null");

        let not_array = CapData::data("{}");
        assert!(DeviceArgs::parse("m", &not_array).is_err());
    }

    #[test]
    fn unknown_device_is_fatal() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let devices = Devices::default();
        let err = devices
            .invoke(&mut k, DeviceId(9), "x", &CapData::data("[]"))
            .unwrap_err();
        assert!(matches!(err, crate::error::SyscallFailure::Fatal(_)));
    }
}
