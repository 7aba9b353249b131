//! Kernel-space ⇄ vat-space translation.
//!
//! Inbound (kernel → vat) translation happens when a run-queue event becomes a
//! vat delivery. Outbound (vat → kernel) translation happens per syscall.
//! Both go through the vat's c-list and may allocate entries.

use crate::capdata::{KernelCapData, Message, VatCapData};
use crate::error::{KernelError, KernelResult, SyscallError, SyscallResult};
use crate::slots::{KRef, VRef, VatId};
use crate::vat::{VatDelivery, VatResolution};

use super::clist::MapOpts;
use super::keeper::{KernelKeeper, PromiseState};

impl KernelKeeper {
    // ── Inbound ──

    /// Every slot becomes reachable for the receiving vat.
    pub fn capdata_inbound(&mut self, vat: VatId, data: &KernelCapData) -> KernelResult<VatCapData> {
        data.map_slots(|kref| self.map_inbound(vat, *kref, true))
    }

    /// A message for `vat`. A result promise is handed to the vat to decide.
    pub fn translate_send(&mut self, vat: VatId, target: KRef, msg: &Message<KRef>) -> KernelResult<VatDelivery> {
        let target = self.map_inbound(vat, target, true)?;
        let args = self.capdata_inbound(vat, &msg.args)?;
        let result = match msg.result {
            Some(kp) => {
                let vpid = self.map_inbound(vat, kp, true)?;
                self.set_decider(kp, Some(vat));
                Some(vpid)
            }
            None => None,
        };
        Ok(VatDelivery::Message {
            target,
            msg: Message::new(msg.method.clone(), args, result),
        })
    }

    /// The resolution of `kpid` as seen by `vat`, or `None` if the vat no
    /// longer knows the promise.
    pub fn translate_notify(&mut self, vat: VatId, kpid: KRef) -> KernelResult<Option<VatDelivery>> {
        let Some((_, vpid)) = self.clist_vref(vat, kpid)? else {
            return Ok(None);
        };
        let p = self.promise(kpid)?;
        let data = match (p.state, p.data) {
            (PromiseState::Unresolved, _) | (_, None) => {
                return Err(KernelError::Unresolved(kpid.to_string()));
            }
            (_, Some(data)) => data,
        };
        let rejected = p.state == PromiseState::Rejected;
        let data = self.capdata_inbound(vat, &data)?;
        Ok(Some(VatDelivery::Notify {
            resolutions: vec![VatResolution {
                vpid,
                rejected,
                data,
            }],
        }))
    }

    /// Vrefs for a GC delivery. The vat must already hold every kref.
    pub fn gc_vrefs(&self, vat: VatId, krefs: &[KRef]) -> KernelResult<Vec<VRef>> {
        krefs
            .iter()
            .map(|kref| self.map_inbound_required(vat, *kref))
            .collect()
    }

    // ── Outbound ──

    pub fn capdata_outbound(&mut self, vat: VatId, data: &VatCapData) -> SyscallResult<KernelCapData> {
        data.map_slots(|vref| self.map_outbound(vat, *vref, MapOpts::default()))
    }

    /// A promise the vat names in `resolve`: it must be unresolved and decided
    /// by the vat.
    pub fn outbound_decided_promise(&mut self, vat: VatId, vpid: VRef) -> SyscallResult<KRef> {
        if !vpid.is_promise() {
            return Err(SyscallError::Illegal(format!("{vpid} is not a promise")).into());
        }
        let kpid = self.map_outbound(vat, vpid, MapOpts::default())?;
        let p = self.promise(kpid)?;
        if p.state != PromiseState::Unresolved {
            return Err(SyscallError::Illegal(format!("{vpid} ({kpid}) is already resolved")).into());
        }
        if p.decider != Some(vat) {
            return Err(SyscallError::Illegal(format!(
                "{vat} is not the decider of {vpid} ({kpid})"
            ))
            .into());
        }
        Ok(kpid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capdata::CapData;
    use crate::store::Store;

    const A: VatId = VatId(1);
    const B: VatId = VatId(2);

    #[test]
    fn send_remaps_through_receiver_clist() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let target = k.map_outbound(B, VRef::export(0), MapOpts::default()).unwrap();
        let arg = k.map_outbound(A, VRef::export(5), MapOpts::default()).unwrap();
        let kp = k.add_kernel_promise().unwrap();

        let msg = Message::new("hello", CapData::slot(arg), Some(kp));
        let d = k.translate_send(B, target, &msg).unwrap();
        match d {
            VatDelivery::Message { target, msg } => {
                assert_eq!(target, VRef::export(0));
                assert_eq!(msg.args.slots, vec![VRef::import(1)]);
                assert_eq!(msg.args.body, r#"{"@slot":0}"#);
                assert_eq!(msg.result, Some(VRef::remote_promise(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(k.promise(kp).unwrap().decider, Some(B));
    }

    #[test]
    fn notify_for_forgotten_promise_is_skipped() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let kp = k.add_kernel_promise().unwrap();
        assert_eq!(k.translate_notify(A, kp).unwrap(), None);

        k.map_inbound(A, kp, true).unwrap();
        assert!(matches!(k.translate_notify(A, kp), Err(KernelError::Unresolved(_))));

        k.resolve_kernel_promise(kp, true, &CapData::error("no")).unwrap();
        match k.translate_notify(A, kp).unwrap() {
            Some(VatDelivery::Notify { resolutions }) => {
                assert!(resolutions[0].rejected);
                assert_eq!(resolutions[0].vpid, VRef::remote_promise(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_the_decider_may_resolve() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let kp = k.add_kernel_promise_for_vat(B).unwrap();
        let vpid = k.map_inbound(A, kp, true).unwrap();
        assert!(k.outbound_decided_promise(A, vpid).is_err());
        assert!(k.outbound_decided_promise(A, VRef::import(1)).is_err());

        let own = k.outbound_decided_promise(A, VRef::local_promise(7)).unwrap();
        assert_eq!(k.promise(own).unwrap().decider, Some(A));
    }
}
