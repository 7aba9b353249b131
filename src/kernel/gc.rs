//! Garbage collection — reference counts plus the drop/retire handshake.
//!
//! At the end of every crank `process_refcounts` looks at each kref whose
//! count fell during the crank and turns it into GC actions:
//!
//! ```text
//! reachable == 0, owner flag set         → "<owner> dropExport <ko>"
//! reachable == 0, recognizable == 0      → "<owner> retireExport <ko>"
//! no owner, recognizable == 0            → delete the object now
//! promise, count == 0                    → release its resolution slots, delete
//! ```
//!
//! Ownerless objects that importers still recognize were already handed to
//! `retire_kernel_objects`, which queued a `retireImport` for each importer.
//! The object record goes away when the last importer has retired it.
//!
//! Actions sit in a sorted set and are re-validated when pulled; stale ones are
//! dropped. That makes every notice idempotent and safe to deliver late.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::slots::{KRef, VatId};

use super::keeper::{KernelKeeper, RefOpts};
use super::run_queue::RunQueueEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcActionKind {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }
}

/// One pending GC notice for one vat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GcAction {
    pub vat: VatId,
    pub kind: GcActionKind,
    pub kref: KRef,
}

impl GcAction {
    pub fn new(vat: VatId, kind: GcActionKind, kref: KRef) -> Self {
        Self { vat, kind, kref }
    }
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat, self.kind.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(' ').collect();
        let [vat, kind, kref] = parts.as_slice() else {
            return Err(KernelError::InvalidData(format!("gc action '{s}'")));
        };
        let kind = match *kind {
            "dropExport" => GcActionKind::DropExport,
            "retireExport" => GcActionKind::RetireExport,
            "retireImport" => GcActionKind::RetireImport,
            other => return Err(KernelError::InvalidData(format!("gc action kind '{other}'"))),
        };
        Ok(GcAction::new(vat.parse()?, kind, kref.parse()?))
    }
}

impl TryFrom<String> for GcAction {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GcAction> for String {
    fn from(a: GcAction) -> String {
        a.to_string()
    }
}

/// Where an object stands in the collection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcState {
    /// Some vat or queued message can still reach it.
    Reachable,
    /// Unreachable, but still recognizable by someone.
    Dropped,
    /// Nobody can recognize it, or its exporter is gone; holders are being told.
    Retiring,
    /// No longer in the kernel tables.
    Free,
}

impl KernelKeeper {
    pub fn gc_actions(&self) -> KernelResult<BTreeSet<GcAction>> {
        Ok(self.get_json("gcActions")?.unwrap_or_default())
    }

    fn set_gc_actions(&mut self, actions: &BTreeSet<GcAction>) -> KernelResult<()> {
        if actions.is_empty() {
            self.store.delete("gcActions");
            Ok(())
        } else {
            self.set_json("gcActions", actions)
        }
    }

    pub fn add_gc_actions(&mut self, new: impl IntoIterator<Item = GcAction>) -> KernelResult<()> {
        let mut actions = self.gc_actions()?;
        let before = actions.len();
        actions.extend(new);
        if actions.len() != before {
            self.set_gc_actions(&actions)?;
        }
        Ok(())
    }

    /// Derived protocol state of an object.
    pub fn gc_state(&self, kref: KRef) -> KernelResult<GcState> {
        if !self.object_exists(kref) {
            return Ok(GcState::Free);
        }
        let rc = self.object_refcount(kref)?;
        let owner = self.object_owner(kref)?;
        Ok(match (rc.reachable, rc.recognizable, owner) {
            (r, _, Some(_)) if r > 0 => GcState::Reachable,
            (_, c, Some(_)) if c > 0 => GcState::Dropped,
            _ => GcState::Retiring,
        })
    }

    /// Turn this crank's refcount changes into GC actions and deletions.
    pub fn process_refcounts(&mut self) -> KernelResult<()> {
        let mut actions = Vec::new();
        while let Some(kref) = self.maybe_free.pop_first() {
            match kref {
                KRef::Promise(_) => {
                    if !self.promise_exists(kref) {
                        continue;
                    }
                    let p = self.promise(kref)?;
                    if p.ref_count > 0 {
                        continue;
                    }
                    if let Some(data) = &p.data {
                        for slot in &data.slots {
                            self.decrement_refcount(*slot, RefOpts::default())?;
                        }
                    }
                    tracing::debug!("freeing promise {kref}");
                    self.delete_promise(kref);
                }
                KRef::Object(_) => {
                    if !self.object_exists(kref) {
                        continue;
                    }
                    let rc = self.object_refcount(kref)?;
                    if rc.reachable > 0 {
                        continue;
                    }
                    match self.object_owner(kref)? {
                        Some(owner) => {
                            if self.reachable_flag(owner, kref)? == Some(true) {
                                actions.push(GcAction::new(owner, GcActionKind::DropExport, kref));
                            }
                            if rc.recognizable == 0 {
                                actions.push(GcAction::new(owner, GcActionKind::RetireExport, kref));
                            }
                        }
                        None if rc.recognizable == 0 => {
                            tracing::debug!("freeing orphaned object {kref}");
                            self.delete_object(kref);
                        }
                        None => {}
                    }
                }
                KRef::Device(_) => {}
            }
        }
        if !actions.is_empty() {
            self.add_gc_actions(actions)?;
        }
        Ok(())
    }

    /// The exporter is gone or has retired these objects. Importers are told to
    /// retire their entries; objects nobody recognizes are deleted at once.
    pub fn retire_kernel_objects(&mut self, krefs: &[KRef]) -> KernelResult<()> {
        let mut actions = Vec::new();
        for &kref in krefs {
            if !self.object_exists(kref) {
                continue;
            }
            self.orphan_object(kref);
            for importer in self.importers_of(kref)? {
                actions.push(GcAction::new(importer, GcActionKind::RetireImport, kref));
            }
            if self.object_refcount(kref)?.recognizable == 0 {
                self.delete_object(kref);
            }
        }
        self.add_gc_actions(actions)
    }

    /// Whether an action still means something now.
    fn gc_action_is_live(&self, action: &GcAction) -> KernelResult<bool> {
        if !self.is_vat_alive(action.vat)? {
            return Ok(false);
        }
        let kref = action.kref;
        Ok(match action.kind {
            GcActionKind::DropExport => {
                self.object_exists(kref)
                    && self.object_refcount(kref)?.reachable == 0
                    && self.reachable_flag(action.vat, kref)? == Some(true)
            }
            GcActionKind::RetireExport => {
                self.object_exists(kref)
                    && self.object_refcount(kref)?.recognizable == 0
                    && self.has_clist_entry(action.vat, kref)
            }
            GcActionKind::RetireImport => self.has_clist_entry(action.vat, kref),
        })
    }

    /// Pull the next GC delivery out of the action set.
    ///
    /// Actions are grouped per (vat, kind) in the order dropExport,
    /// retireExport, retireImport; one group (up to `batch_limit` krefs) becomes
    /// one delivery. If every pending action turned out stale the set is
    /// emptied and `NegatedGcAction` is returned so the crank still commits.
    pub fn next_gc_event(&mut self, batch_limit: usize) -> KernelResult<Option<RunQueueEvent>> {
        let mut all = self.gc_actions()?;
        if all.is_empty() {
            return Ok(None);
        }

        let mut groups: BTreeMap<(VatId, GcActionKind), Vec<GcAction>> = BTreeMap::new();
        for action in &all {
            groups
                .entry((action.vat, action.kind))
                .or_default()
                .push(*action);
        }

        let limit = batch_limit.max(1);
        for ((vat, kind), actions) in groups {
            let mut krefs = Vec::new();
            for action in actions {
                if krefs.len() >= limit {
                    break;
                }
                all.remove(&action);
                if self.gc_action_is_live(&action)? {
                    krefs.push(action.kref);
                } else {
                    tracing::debug!("negated gc action: {action}");
                }
            }
            if !krefs.is_empty() {
                self.set_gc_actions(&all)?;
                return Ok(Some(match kind {
                    GcActionKind::DropExport => RunQueueEvent::DropExports { vat, krefs },
                    GcActionKind::RetireExport => RunQueueEvent::RetireExports { vat, krefs },
                    GcActionKind::RetireImport => RunQueueEvent::RetireImports { vat, krefs },
                }));
            }
        }

        self.set_gc_actions(&all)?;
        Ok(Some(RunQueueEvent::NegatedGcAction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clist::MapOpts;
    use crate::slots::VRef;
    use crate::store::Store;

    const EXPORTER: VatId = VatId(1);
    const IMPORTER: VatId = VatId(2);

    fn keeper_with_vats() -> KernelKeeper {
        let mut k = KernelKeeper::new(Store::in_memory());
        k.add_live_vat(EXPORTER).unwrap();
        k.add_live_vat(IMPORTER).unwrap();
        k
    }

    /// Exporter exports o+1, importer holds it reachably.
    fn shared_object(k: &mut KernelKeeper) -> KRef {
        let ko = k
            .map_outbound(EXPORTER, VRef::export(1), MapOpts::default())
            .unwrap();
        k.map_inbound(IMPORTER, ko, true).unwrap();
        ko
    }

    #[test]
    fn action_string_form() {
        let a = GcAction::new(VatId(3), GcActionKind::RetireImport, KRef::Object(9));
        assert_eq!(a.to_string(), "v3 retireImport ko9");
        assert_eq!("v3 retireImport ko9".parse::<GcAction>().unwrap(), a);
        assert!("v3 retire ko9".parse::<GcAction>().is_err());
    }

    #[test]
    fn drop_then_retire_handshake() {
        let mut k = keeper_with_vats();
        let ko = shared_object(&mut k);
        assert_eq!(k.gc_state(ko).unwrap(), GcState::Reachable);

        // importer drops
        k.clear_reachable_flag(IMPORTER, ko).unwrap();
        k.process_refcounts().unwrap();
        assert_eq!(k.gc_state(ko).unwrap(), GcState::Dropped);
        assert_eq!(
            k.next_gc_event(100).unwrap(),
            Some(RunQueueEvent::DropExports {
                vat: EXPORTER,
                krefs: vec![ko]
            })
        );
        // exporter hears about it
        k.clear_reachable_flag(EXPORTER, ko).unwrap();

        // importer retires
        let vref = k.map_inbound_required(IMPORTER, ko).unwrap();
        k.delete_clist_entry(IMPORTER, ko, vref).unwrap();
        k.process_refcounts().unwrap();
        assert_eq!(k.gc_state(ko).unwrap(), GcState::Retiring);
        assert_eq!(
            k.next_gc_event(100).unwrap(),
            Some(RunQueueEvent::RetireExports {
                vat: EXPORTER,
                krefs: vec![ko]
            })
        );
        assert_eq!(k.next_gc_event(100).unwrap(), None);
    }

    #[test]
    fn stale_actions_are_negated() {
        let mut k = keeper_with_vats();
        let ko = shared_object(&mut k);
        k.clear_reachable_flag(IMPORTER, ko).unwrap();
        k.process_refcounts().unwrap();
        // importer picks it back up before the drop notice goes out
        k.map_inbound(IMPORTER, ko, true).unwrap();
        assert_eq!(
            k.next_gc_event(100).unwrap(),
            Some(RunQueueEvent::NegatedGcAction)
        );
        assert!(k.gc_actions().unwrap().is_empty());
    }

    #[test]
    fn batch_limit_leaves_remainder() {
        let mut k = keeper_with_vats();
        let mut actions = Vec::new();
        for _ in 0..3 {
            let ko = k.add_kernel_object(EXPORTER).unwrap();
            k.map_inbound(IMPORTER, ko, false).unwrap();
            actions.push(GcAction::new(IMPORTER, GcActionKind::RetireImport, ko));
        }
        k.add_gc_actions(actions).unwrap();
        match k.next_gc_event(2).unwrap() {
            Some(RunQueueEvent::RetireImports { krefs, .. }) => assert_eq!(krefs.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(k.gc_actions().unwrap().len(), 1);
    }

    #[test]
    fn retiring_orphan_notifies_importers() {
        let mut k = keeper_with_vats();
        let ko = shared_object(&mut k);
        k.retire_kernel_objects(&[ko]).unwrap();
        assert_eq!(k.object_owner(ko).unwrap(), None);
        assert_eq!(k.gc_state(ko).unwrap(), GcState::Retiring);
        assert_eq!(
            k.next_gc_event(100).unwrap(),
            Some(RunQueueEvent::RetireImports {
                vat: IMPORTER,
                krefs: vec![ko]
            })
        );
        let vref = k.map_inbound_required(IMPORTER, ko).unwrap();
        k.delete_clist_entry(IMPORTER, ko, vref).unwrap();
        k.process_refcounts().unwrap();
        assert_eq!(k.gc_state(ko).unwrap(), GcState::Free);
    }

    #[test]
    fn unreferenced_promise_is_freed_with_its_data() {
        let mut k = keeper_with_vats();
        let ko = k.add_kernel_object(EXPORTER).unwrap();
        let kp = k.add_kernel_promise().unwrap();
        k.increment_refcount(kp, RefOpts::default()).unwrap();
        k.resolve_kernel_promise(kp, false, &crate::capdata::CapData::slot(ko))
            .unwrap();
        assert_eq!(k.object_refcount(ko).unwrap().reachable, 1);

        k.decrement_refcount(kp, RefOpts::default()).unwrap();
        k.process_refcounts().unwrap();
        assert!(!k.promise_exists(kp));
        assert_eq!(k.object_refcount(ko).unwrap().reachable, 0);
        // the object's retirement cascades in the same pass
        assert!(k
            .gc_actions()
            .unwrap()
            .contains(&GcAction::new(EXPORTER, GcActionKind::RetireExport, ko)));
    }
}
