//! Syscall handling — one vat syscall in, table mutations and queue
//! insertions out.
//!
//! A `SyscallHandler` lives for one delivery. It answers each syscall
//! synchronously and remembers the things the crank needs afterwards: the
//! first protocol violation (which dooms the vat), an `exit` request, and any
//! fatal kernel error.

use std::collections::BTreeSet;

use crate::capdata::{KernelCapData, Message, VatCapData};
use crate::devices::Devices;
use crate::error::{KernelError, SyscallError, SyscallFailure, SyscallResult};
use crate::slots::{KRef, SlotKind, VRef, VatId};
use crate::vat::{SyscallOk, VatSyscall, VatSyscallResult};

use super::clist::MapOpts;
use super::keeper::{KernelKeeper, PromiseState};
use super::run_queue::RunQueueEvent;

/// A vat's request to stop, made through `exit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub failure: bool,
    pub info: KernelCapData,
}

/// What the crank learns from a delivery's syscalls.
#[derive(Debug, Default)]
pub struct SyscallReport {
    pub illegal: Option<String>,
    pub exit: Option<ExitRequest>,
}

pub struct SyscallHandler<'k> {
    keeper: &'k mut KernelKeeper,
    devices: &'k Devices,
    vat: VatId,
    illegal: Option<String>,
    exit: Option<ExitRequest>,
    fatal: Option<KernelError>,
}

impl<'k> SyscallHandler<'k> {
    pub fn new(keeper: &'k mut KernelKeeper, devices: &'k Devices, vat: VatId) -> Self {
        Self {
            keeper,
            devices,
            vat,
            illegal: None,
            exit: None,
            fatal: None,
        }
    }

    /// Answer one syscall. This is what the vat sees; it is also what the
    /// transcript records.
    pub fn handle(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        if self.fatal.is_some() {
            return Err("kernel panicked".into());
        }
        if let Some(reason) = &self.illegal {
            return Err(format!("vat is being terminated: {reason}"));
        }
        tracing::debug!("{} syscall {}", self.vat, syscall.kind());

        match self.dispatch(syscall) {
            Ok(ok) => Ok(ok),
            Err(SyscallFailure::Vat(e)) if e.is_fatal_to_vat() => {
                tracing::warn!("{} illegal {}: {e}", self.vat, syscall.kind());
                let msg = e.to_string();
                self.illegal = Some(msg.clone());
                Err(msg)
            }
            Err(SyscallFailure::Vat(e)) => Err(e.to_string()),
            Err(SyscallFailure::Fatal(e)) => {
                let msg = e.to_string();
                self.fatal = Some(e);
                Err(msg)
            }
        }
    }

    /// Consume the handler. A kernel error seen during the delivery escapes here.
    pub fn finish(self) -> Result<SyscallReport, KernelError> {
        if let Some(e) = self.fatal {
            return Err(e);
        }
        Ok(SyscallReport {
            illegal: self.illegal,
            exit: self.exit,
        })
    }

    fn dispatch(&mut self, syscall: &VatSyscall) -> SyscallResult<SyscallOk> {
        let vat = self.vat;
        match syscall {
            VatSyscall::Send { target, msg } => {
                self.send(*target, msg)?;
                Ok(SyscallOk::Null)
            }
            VatSyscall::CallNow {
                target,
                method,
                args,
            } => self.call_now(*target, method, args),
            VatSyscall::Subscribe { vpid } => {
                if !vpid.is_promise() {
                    return Err(SyscallError::Illegal(format!("subscribe to non-promise {vpid}")).into());
                }
                let kpid = self.keeper.map_outbound(vat, *vpid, MapOpts::default())?;
                if self.keeper.promise_state(kpid)? == PromiseState::Unresolved {
                    self.keeper.add_subscriber(kpid, vat)?;
                } else {
                    self.keeper.queue_notify(vat, kpid)?;
                }
                Ok(SyscallOk::Null)
            }
            VatSyscall::Resolve { resolutions } => {
                let mut resolved = Vec::with_capacity(resolutions.len());
                let mut seen = BTreeSet::new();
                for r in resolutions {
                    let kpid = self.keeper.outbound_decided_promise(vat, r.vpid)?;
                    if !seen.insert(kpid) {
                        return Err(SyscallError::Illegal(format!(
                            "resolve names {} ({kpid}) twice",
                            r.vpid
                        ))
                        .into());
                    }
                    let data = self.keeper.capdata_outbound(vat, &r.data)?;
                    resolved.push((kpid, r.rejected, data));
                }
                for (kpid, rejected, data) in &resolved {
                    self.keeper.resolve_promise(Some(vat), *kpid, *rejected, data)?;
                }
                let kpids: Vec<_> = resolved.iter().map(|(kpid, _, _)| *kpid).collect();
                self.keeper.delete_clist_entries_for(vat, &kpids)?;
                Ok(SyscallOk::Null)
            }
            VatSyscall::Exit { failure, info } => {
                let info = self.keeper.capdata_outbound(vat, info)?;
                tracing::info!("{vat} requested exit (failure: {failure})");
                self.exit = Some(ExitRequest {
                    failure: *failure,
                    info,
                });
                Ok(SyscallOk::Null)
            }
            VatSyscall::VatstoreGet { key } => Ok(SyscallOk::Text(self.keeper.vatstore_get(vat, key)?)),
            VatSyscall::VatstoreGetNextKey { prior } => {
                Ok(SyscallOk::Text(self.keeper.vatstore_next_key(vat, prior)?))
            }
            VatSyscall::VatstoreSet { key, value } => {
                self.keeper.vatstore_set(vat, key, value)?;
                Ok(SyscallOk::Null)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.keeper.vatstore_delete(vat, key)?;
                Ok(SyscallOk::Null)
            }
            VatSyscall::DropImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_import(*vref, "dropImports")?;
                    self.keeper.clear_reachable_flag(vat, kref)?;
                }
                Ok(SyscallOk::Null)
            }
            VatSyscall::RetireImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_import(*vref, "retireImports")?;
                    if self.keeper.reachable_flag(vat, kref)? == Some(true) {
                        return Err(SyscallError::Illegal(format!(
                            "retireImports of {vref}, which is still reachable"
                        ))
                        .into());
                    }
                    self.keeper.delete_clist_entry(vat, kref, *vref)?;
                }
                Ok(SyscallOk::Null)
            }
            VatSyscall::RetireExports { vrefs } => {
                for vref in vrefs {
                    if !(vref.is_object() && vref.allocated_by_vat) {
                        return Err(SyscallError::Illegal(format!(
                            "retireExports of {vref}, which is not an object export"
                        ))
                        .into());
                    }
                    let kref = self.keeper.map_outbound(vat, *vref, MapOpts::lookup())?;
                    if self.keeper.object_refcount(kref)?.reachable > 0 {
                        return Err(SyscallError::Illegal(format!(
                            "retireExports of {vref} ({kref}), which is still reachable"
                        ))
                        .into());
                    }
                    self.keeper.delete_clist_entry(vat, kref, *vref)?;
                    self.keeper.retire_kernel_objects(&[kref])?;
                }
                Ok(SyscallOk::Null)
            }
        }
    }

    fn object_import(&mut self, vref: VRef, op: &str) -> SyscallResult<KRef> {
        if !vref.is_object() || vref.allocated_by_vat {
            return Err(SyscallError::Illegal(format!("{op} of {vref}, which is not an object import")).into());
        }
        self.keeper.map_outbound(self.vat, vref, MapOpts::lookup())
    }

    fn send(&mut self, target: VRef, msg: &Message<VRef>) -> SyscallResult<()> {
        let vat = self.vat;
        let ktarget = self.keeper.map_outbound(vat, target, MapOpts::default())?;
        let args = self.keeper.capdata_outbound(vat, &msg.args)?;
        let result = match msg.result {
            Some(vpid) => {
                let kpid = self.keeper.outbound_decided_promise(vat, vpid)?;
                // Nobody decides a promise while its message is in flight.
                self.keeper.set_decider(kpid, None);
                Some(kpid)
            }
            None => None,
        };
        let event = RunQueueEvent::Send {
            target: ktarget,
            msg: Message::new(msg.method.clone(), args, result),
        };
        self.keeper.incref_event(&event)?;
        self.keeper.enqueue_run_queue(&event)?;
        Ok(())
    }

    fn call_now(&mut self, target: VRef, method: &str, args: &VatCapData) -> SyscallResult<SyscallOk> {
        let vat = self.vat;
        if target.kind != SlotKind::Device {
            return Err(SyscallError::Illegal(format!("callNow target {target} is not a device node")).into());
        }
        if let Some(p) = args.slots.iter().find(|s| s.is_promise()) {
            return Err(SyscallError::Illegal(format!("callNow arguments may not include promise {p}")).into());
        }
        let kd = self.keeper.map_outbound(vat, target, MapOpts::lookup())?;
        let device = self
            .keeper
            .device_node_owner(kd)?
            .ok_or_else(|| SyscallError::Illegal(format!("{kd} has no device")))?;
        let kargs = self.keeper.capdata_outbound(vat, args)?;
        let result = self.devices.invoke(&mut *self.keeper, device, method, &kargs)?;
        let result = self.keeper.capdata_inbound(vat, &result)?;
        Ok(SyscallOk::Data(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capdata::CapData;
    use crate::store::Store;

    const A: VatId = VatId(1);
    const B: VatId = VatId(2);

    fn setup() -> (KernelKeeper, Devices) {
        let mut k = KernelKeeper::new(Store::in_memory());
        Devices::install_standard(&mut k).unwrap();
        let devices = Devices::load(&k).unwrap();
        k.add_live_vat(A).unwrap();
        k.add_live_vat(B).unwrap();
        (k, devices)
    }

    #[test]
    fn send_queues_event_and_clears_decider() {
        let (mut k, devices) = setup();
        let target = k.map_outbound(B, VRef::export(0), MapOpts::default()).unwrap();
        let imported = k.map_inbound(A, target, true).unwrap();

        let mut h = SyscallHandler::new(&mut k, &devices, A);
        let r = h.handle(&VatSyscall::Send {
            target: imported,
            msg: Message::new("ping", CapData::data("[]"), Some(VRef::local_promise(1))),
        });
        assert_eq!(r, Ok(SyscallOk::Null));
        let report = h.finish().unwrap();
        assert!(report.illegal.is_none());

        let ev = k.dequeue_run_queue().unwrap().unwrap();
        let RunQueueEvent::Send { target: t, msg } = ev else {
            panic!("expected send");
        };
        assert_eq!(t, target);
        let kp = msg.result.unwrap();
        assert_eq!(k.promise(kp).unwrap().decider, None);
    }

    #[test]
    fn unknown_import_is_illegal_and_sticky() {
        let (mut k, devices) = setup();
        let mut h = SyscallHandler::new(&mut k, &devices, A);
        let r = h.handle(&VatSyscall::Send {
            target: VRef::import(99),
            msg: Message::new("x", CapData::data("[]"), None),
        });
        assert!(r.is_err());
        // Later syscalls fail too.
        assert!(h
            .handle(&VatSyscall::VatstoreGet { key: "k".into() })
            .is_err());
        let report = h.finish().unwrap();
        assert!(report.illegal.unwrap().contains("o-99"));
    }

    #[test]
    fn vatstore_syscalls() {
        let (mut k, devices) = setup();
        let mut h = SyscallHandler::new(&mut k, &devices, A);
        h.handle(&VatSyscall::VatstoreSet {
            key: "a".into(),
            value: "1".into(),
        })
        .unwrap();
        h.handle(&VatSyscall::VatstoreSet {
            key: "b".into(),
            value: "2".into(),
        })
        .unwrap();
        assert_eq!(
            h.handle(&VatSyscall::VatstoreGetNextKey { prior: "a".into() }),
            Ok(SyscallOk::Text(Some("b".into())))
        );
        assert_eq!(
            h.handle(&VatSyscall::VatstoreGetNextKey { prior: "b".into() }),
            Ok(SyscallOk::Text(None))
        );
        h.handle(&VatSyscall::VatstoreDelete { key: "a".into() }).unwrap();
        assert_eq!(
            h.handle(&VatSyscall::VatstoreGet { key: "a".into() }),
            Ok(SyscallOk::Text(None))
        );
        assert!(h
            .handle(&VatSyscall::VatstoreSet {
                key: "bad\0key".into(),
                value: String::new()
            })
            .is_err());
        assert!(h.finish().unwrap().illegal.is_some());
    }

    #[test]
    fn device_errors_are_not_fatal() {
        let (mut k, devices) = setup();
        let timer = k.device_root(crate::slots::DeviceId(2)).unwrap().unwrap();
        let d = k.map_inbound(A, timer, true).unwrap();

        let mut h = SyscallHandler::new(&mut k, &devices, A);
        let r = h.handle(&VatSyscall::CallNow {
            target: d,
            method: "noSuchMethod".into(),
            args: CapData::data("[]"),
        });
        assert!(r.is_err());
        let r = h.handle(&VatSyscall::CallNow {
            target: d,
            method: "getLastPolled".into(),
            args: CapData::data("[]"),
        });
        assert_eq!(r, Ok(SyscallOk::Data(CapData::data("0"))));
        assert!(h.finish().unwrap().illegal.is_none());
    }

    #[test]
    fn resolve_notifies_other_subscribers() {
        let (mut k, devices) = setup();
        let mut h = SyscallHandler::new(&mut k, &devices, A);
        h.handle(&VatSyscall::Subscribe {
            vpid: VRef::local_promise(1),
        })
        .unwrap();
        h.finish().unwrap();
        let kp = k.clist_kref(A, VRef::local_promise(1)).unwrap().unwrap();
        k.map_inbound(B, kp, true).unwrap();
        k.add_subscriber(kp, B).unwrap();

        let mut h = SyscallHandler::new(&mut k, &devices, A);
        h.handle(&VatSyscall::Resolve {
            resolutions: vec![crate::vat::VatResolution::fulfill(
                VRef::local_promise(1),
                CapData::data("42"),
            )],
        })
        .unwrap();
        h.finish().unwrap();

        assert_eq!(k.promise_state(kp).unwrap(), PromiseState::Fulfilled);
        assert!(!k.has_clist_entry(A, kp));
        assert_eq!(
            k.dequeue_run_queue().unwrap(),
            Some(RunQueueEvent::Notify { vat: B, kpid: kp })
        );
        assert_eq!(k.dequeue_run_queue().unwrap(), None);
    }

    #[test]
    fn duplicate_resolution_is_illegal_and_resolves_nothing() {
        let (mut k, devices) = setup();
        let p = VRef::local_promise(1);
        let mut h = SyscallHandler::new(&mut k, &devices, A);
        h.handle(&VatSyscall::Subscribe { vpid: p }).unwrap();
        let r = h.handle(&VatSyscall::Resolve {
            resolutions: vec![
                crate::vat::VatResolution::fulfill(p, CapData::data("1")),
                crate::vat::VatResolution::fulfill(p, CapData::data("2")),
            ],
        });
        assert!(r.is_err());
        let report = h.finish().unwrap();
        assert!(report.illegal.unwrap().contains("twice"));

        let kp = k.clist_kref(A, p).unwrap().unwrap();
        assert_eq!(k.promise_state(kp).unwrap(), PromiseState::Unresolved);
    }

    #[test]
    fn retire_exports_requires_unreachable() {
        let (mut k, devices) = setup();
        let o = VRef::export(1);
        let kref = k.map_outbound(A, o, MapOpts::default()).unwrap();
        let imported = k.map_inbound(B, kref, true).unwrap();

        let mut h = SyscallHandler::new(&mut k, &devices, A);
        assert!(h.handle(&VatSyscall::RetireExports { vrefs: vec![o] }).is_err());
        assert!(h.finish().unwrap().illegal.unwrap().contains("still reachable"));
        assert!(k.has_clist_entry(A, kref));

        // B drops it but still recognizes it; now A may retire.
        k.clear_reachable_flag(B, kref).unwrap();
        let mut h = SyscallHandler::new(&mut k, &devices, A);
        assert_eq!(
            h.handle(&VatSyscall::RetireExports { vrefs: vec![o] }),
            Ok(SyscallOk::Null)
        );
        assert!(h.finish().unwrap().illegal.is_none());

        assert!(!k.has_clist_entry(A, kref));
        assert_eq!(k.clist_kref(B, imported).unwrap(), Some(kref));
        let actions: Vec<String> = k.gc_actions().unwrap().iter().map(|a| a.to_string()).collect();
        assert_eq!(actions, vec![format!("{B} retireImport {kref}")]);
    }
}
