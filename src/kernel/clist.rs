//! C-lists and per-vat state.
//!
//! Each c-list entry is stored twice so both directions are a single lookup:
//! ```text
//! v1.c.ko5  = "R o-3"    kref → reachable flag + vref
//! v1.c.o-3  = "ko5"      vref → kref
//! ```
//! The reachable flag (`R` / `_`) records whether the vat may still use the
//! slot as a reachable reference. Only object imports contribute to the
//! object's reachable count through it.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult, SyscallError, SyscallResult};
use crate::slots::{KRef, SlotKind, VRef, VatId};
use crate::vat::VatOptions;

use super::keeper::{KernelKeeper, RefOpts};

/// Options for `map_outbound`.
#[derive(Debug, Clone, Copy)]
pub struct MapOpts {
    pub set_reachable: bool,
    pub required: bool,
}

impl Default for MapOpts {
    fn default() -> Self {
        Self {
            set_reachable: true,
            required: false,
        }
    }
}

impl MapOpts {
    /// Lookup only: no allocation, no flag changes. Used by GC syscalls.
    pub fn lookup() -> Self {
        Self {
            set_reachable: false,
            required: true,
        }
    }
}

/// One row of a vat's c-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClistEntry {
    pub kref: KRef,
    pub vref: VRef,
    pub reachable: bool,
}

/// Where a vat's code came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatSource {
    pub bundle_id: String,
}

fn kernel_key(vat: VatId, kref: KRef) -> String {
    format!("{vat}.c.{kref}")
}

fn vat_key(vat: VatId, vref: VRef) -> String {
    format!("{vat}.c.{vref}")
}

fn parse_entry_value(value: &str) -> KernelResult<(bool, VRef)> {
    let (flag, vref) = value
        .split_once(' ')
        .ok_or_else(|| KernelError::InvalidData(format!("c-list value '{value}'")))?;
    let reachable = match flag {
        "R" => true,
        "_" => false,
        other => return Err(KernelError::InvalidData(format!("c-list flag '{other}'"))),
    };
    Ok((reachable, vref.parse()?))
}

fn entry_value(reachable: bool, vref: VRef) -> String {
    format!("{} {vref}", if reachable { "R" } else { "_" })
}

impl KernelKeeper {
    // ── Lookups ──

    pub fn clist_vref(&self, vat: VatId, kref: KRef) -> KernelResult<Option<(bool, VRef)>> {
        self.get(&kernel_key(vat, kref))
            .map(parse_entry_value)
            .transpose()
    }

    pub fn clist_kref(&self, vat: VatId, vref: VRef) -> KernelResult<Option<KRef>> {
        self.get(&vat_key(vat, vref))
            .map(|v| v.parse().map_err(KernelError::from))
            .transpose()
    }

    pub fn has_clist_entry(&self, vat: VatId, kref: KRef) -> bool {
        self.store.has(&kernel_key(vat, kref))
    }

    /// The vat's reachable flag for `kref`, if it has an entry at all.
    pub fn reachable_flag(&self, vat: VatId, kref: KRef) -> KernelResult<Option<bool>> {
        Ok(self.clist_vref(vat, kref)?.map(|(r, _)| r))
    }

    /// Every entry in a vat's c-list, ordered by kref.
    pub fn clist_entries(&self, vat: VatId) -> KernelResult<Vec<ClistEntry>> {
        let prefix = format!("{vat}.c.k");
        let mut entries = Vec::new();
        for key in self.store.keys_with_prefix(&prefix) {
            let kref: KRef = key[prefix.len() - 1..].parse()?;
            let (reachable, vref) = parse_entry_value(self.get_required(&key)?)?;
            entries.push(ClistEntry {
                kref,
                vref,
                reachable,
            });
        }
        entries.sort_by_key(|e| e.kref);
        Ok(entries)
    }

    /// Live vats holding `kref` as an import.
    pub fn importers_of(&self, kref: KRef) -> KernelResult<Vec<VatId>> {
        let mut importers = Vec::new();
        for vat in self.live_vats()? {
            if let Some((_, vref)) = self.clist_vref(vat, kref)? {
                if !vref.allocated_by_vat {
                    importers.push(vat);
                }
            }
        }
        Ok(importers)
    }

    // ── Reachable flag ──

    fn set_reachable_flag(&mut self, vat: VatId, kref: KRef) -> KernelResult<()> {
        let key = kernel_key(vat, kref);
        let (was_reachable, vref) = parse_entry_value(self.get_required(&key)?)?;
        self.store.set(key, entry_value(true, vref));
        if !was_reachable && kref.is_object() && !vref.allocated_by_vat {
            self.increment_reachable(kref)?;
        }
        Ok(())
    }

    pub fn clear_reachable_flag(&mut self, vat: VatId, kref: KRef) -> KernelResult<()> {
        let key = kernel_key(vat, kref);
        let (was_reachable, vref) = parse_entry_value(self.get_required(&key)?)?;
        self.store.set(key, entry_value(false, vref));
        if was_reachable && kref.is_object() && !vref.allocated_by_vat {
            self.decrement_reachable(kref)?;
        }
        Ok(())
    }

    // ── Mapping ──

    /// Kernel → vat. Allocates an import slot the first time `kref` reaches
    /// this vat, and optionally marks it reachable.
    pub fn map_inbound(&mut self, vat: VatId, kref: KRef, set_reachable: bool) -> KernelResult<VRef> {
        let vref = match self.clist_vref(vat, kref)? {
            Some((_, vref)) => vref,
            None => {
                let vref = match kref.kind() {
                    SlotKind::Object => VRef::import(self.next_id(&format!("{vat}.o.nextID"))?),
                    SlotKind::Promise => {
                        VRef::remote_promise(self.next_id(&format!("{vat}.p.nextID"))?)
                    }
                    SlotKind::Device => VRef::device(self.next_id(&format!("{vat}.d.nextID"))?),
                };
                self.increment_refcount(kref, RefOpts::recognizable())?;
                self.store.set(vat_key(vat, vref), kref.to_string());
                self.store.set(kernel_key(vat, kref), entry_value(false, vref));
                vref
            }
        };
        if set_reachable {
            self.set_reachable_flag(vat, kref)?;
        }
        Ok(vref)
    }

    /// Kernel → vat for slots the vat must already know (GC deliveries).
    pub fn map_inbound_required(&self, vat: VatId, kref: KRef) -> KernelResult<VRef> {
        self.clist_vref(vat, kref)?
            .map(|(_, vref)| vref)
            .ok_or_else(|| KernelError::InvalidData(format!("{vat} has no c-list entry for {kref}")))
    }

    /// Vat → kernel. A vat-allocated slot seen for the first time becomes a new
    /// kernel object or promise owned/decided by the vat; an unknown
    /// kernel-allocated slot is a protocol violation.
    pub fn map_outbound(&mut self, vat: VatId, vref: VRef, opts: MapOpts) -> SyscallResult<KRef> {
        let kref = match self.clist_kref(vat, vref)? {
            Some(kref) => kref,
            None if vref.allocated_by_vat && !opts.required => {
                let kref = match vref.kind {
                    SlotKind::Object => self.add_kernel_object(vat)?,
                    SlotKind::Promise => self.add_kernel_promise_for_vat(vat)?,
                    SlotKind::Device => {
                        return Err(SyscallError::Illegal(format!(
                            "{vat} may not export device node {vref}"
                        ))
                        .into())
                    }
                };
                self.increment_refcount(kref, RefOpts::export())?;
                self.store.set(vat_key(vat, vref), kref.to_string());
                self.store.set(kernel_key(vat, kref), entry_value(false, vref));
                kref
            }
            None => {
                return Err(SyscallError::UnknownSlot {
                    vat,
                    slot: vref.to_string(),
                }
                .into())
            }
        };

        if opts.set_reachable {
            if vref.allocated_by_vat {
                self.set_reachable_flag(vat, kref)?;
            } else if self.reachable_flag(vat, kref)? != Some(true) {
                return Err(SyscallError::UnknownSlot {
                    vat,
                    slot: format!("{vref} (unreachable import)"),
                }
                .into());
            }
        }
        Ok(kref)
    }

    /// Remove both halves of a c-list entry and release what it held.
    pub fn delete_clist_entry(&mut self, vat: VatId, kref: KRef, vref: VRef) -> KernelResult<()> {
        let reachable = self.reachable_flag(vat, kref)?.unwrap_or(false);
        self.decrement_refcount(
            kref,
            RefOpts {
                is_export: vref.allocated_by_vat,
                only_recognizable: !reachable,
            },
        )?;
        self.store.delete(&kernel_key(vat, kref));
        self.store.delete(&vat_key(vat, vref));
        Ok(())
    }

    /// Delete the entries (if present) for each kref.
    pub fn delete_clist_entries_for(&mut self, vat: VatId, krefs: &[KRef]) -> KernelResult<()> {
        for &kref in krefs {
            if let Some((_, vref)) = self.clist_vref(vat, kref)? {
                self.delete_clist_entry(vat, kref, vref)?;
            }
        }
        Ok(())
    }

    // ── Per-vat state ──

    pub fn init_vat_state(&mut self, vat: VatId, source: &VatSource, options: &VatOptions) -> KernelResult<()> {
        self.set_json(&format!("{vat}.source"), source)?;
        self.set_json(&format!("{vat}.options"), options)?;
        self.store.set(format!("{vat}.incarnation"), "0");
        self.store.set(format!("{vat}.t.startPos"), "0");
        self.store.set(format!("{vat}.t.endPos"), "0");
        self.store.set(format!("{vat}.reapDirt"), "0");
        if let Some(meter) = options.meter {
            self.store.set(format!("{vat}.meter"), meter.to_string());
        }
        Ok(())
    }

    pub fn vat_source(&self, vat: VatId) -> KernelResult<VatSource> {
        self.get_json(&format!("{vat}.source"))?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub fn set_vat_source(&mut self, vat: VatId, source: &VatSource) -> KernelResult<()> {
        self.set_json(&format!("{vat}.source"), source)
    }

    pub fn vat_options(&self, vat: VatId) -> KernelResult<VatOptions> {
        self.get_json(&format!("{vat}.options"))?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub fn vat_incarnation(&self, vat: VatId) -> KernelResult<u64> {
        self.get_u64(&format!("{vat}.incarnation"))?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    /// Bump the incarnation and start a fresh transcript span. Returns the new incarnation.
    pub fn begin_new_incarnation(&mut self, vat: VatId) -> KernelResult<u64> {
        let next = self.vat_incarnation(vat)? + 1;
        self.store.set(format!("{vat}.incarnation"), next.to_string());
        let (_, end) = self.transcript_bounds(vat)?;
        self.store.set(format!("{vat}.t.startPos"), end.to_string());
        Ok(next)
    }

    /// `[start, end)` positions of the current incarnation's transcript span.
    pub fn transcript_bounds(&self, vat: VatId) -> KernelResult<(u64, u64)> {
        let start = self.get_u64(&format!("{vat}.t.startPos"))?.unwrap_or(0);
        let end = self.get_u64(&format!("{vat}.t.endPos"))?.unwrap_or(0);
        Ok((start, end))
    }

    /// Append a transcript entry. Returns the delivery number it was stored under.
    pub fn add_transcript_entry(&mut self, vat: VatId, entry: String) -> KernelResult<u64> {
        let (_, end) = self.transcript_bounds(vat)?;
        self.store.append_transcript(vat, end, entry);
        self.store.set(format!("{vat}.t.endPos"), (end + 1).to_string());
        Ok(end)
    }

    /// Count one delivery against the reap interval. True when a reap is due.
    pub fn add_reap_dirt(&mut self, vat: VatId, interval: Option<u64>) -> KernelResult<bool> {
        let Some(interval) = interval.filter(|i| *i > 0) else {
            return Ok(false);
        };
        let key = format!("{vat}.reapDirt");
        let dirt = self.get_u64(&key)?.unwrap_or(0) + 1;
        if dirt >= interval {
            self.store.set(key, "0");
            Ok(true)
        } else {
            self.store.set(key, dirt.to_string());
            Ok(false)
        }
    }

    /// Remaining computrons, `None` if unmetered.
    pub fn vat_meter(&self, vat: VatId) -> KernelResult<Option<u64>> {
        self.get_u64(&format!("{vat}.meter"))
    }

    pub fn set_vat_meter(&mut self, vat: VatId, remaining: u64) {
        self.store.set(format!("{vat}.meter"), remaining.to_string());
    }

    // ── Vatstore ──

    fn vatstore_key(vat: VatId, key: &str) -> Result<String, SyscallError> {
        if key.contains('\0') {
            return Err(SyscallError::Illegal("vatstore key contains NUL".into()));
        }
        Ok(format!("{vat}.vs.{key}"))
    }

    pub fn vatstore_get(&self, vat: VatId, key: &str) -> Result<Option<String>, SyscallError> {
        Ok(self.get(&Self::vatstore_key(vat, key)?).map(str::to_string))
    }

    pub fn vatstore_set(&mut self, vat: VatId, key: &str, value: &str) -> Result<(), SyscallError> {
        let k = Self::vatstore_key(vat, key)?;
        self.store.set(k, value);
        Ok(())
    }

    pub fn vatstore_delete(&mut self, vat: VatId, key: &str) -> Result<(), SyscallError> {
        let k = Self::vatstore_key(vat, key)?;
        self.store.delete(&k);
        Ok(())
    }

    /// Smallest vatstore key strictly greater than `prior`.
    pub fn vatstore_next_key(&self, vat: VatId, prior: &str) -> Result<Option<String>, SyscallError> {
        let prefix = format!("{vat}.vs.");
        let start = Self::vatstore_key(vat, prior)?;
        Ok(self
            .store
            .next_key_after(&prefix, &start)
            .map(|k| k[prefix.len()..].to_string()))
    }

    /// Drop every vatstore key of a dead vat.
    pub fn delete_vatstore(&mut self, vat: VatId) {
        for key in self.store.keys_with_prefix(&format!("{vat}.vs.")) {
            self.store.delete(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyscallFailure;
    use crate::kernel::keeper::RefCount;
    use crate::store::Store;

    const A: VatId = VatId(1);
    const B: VatId = VatId(2);

    fn keeper() -> KernelKeeper {
        KernelKeeper::new(Store::in_memory())
    }

    #[test]
    fn export_then_import_round_trip() {
        let mut k = keeper();
        let ko = k.map_outbound(A, VRef::export(1), MapOpts::default()).unwrap();
        assert_eq!(k.object_owner(ko).unwrap(), Some(A));
        // Exports don't count.
        assert_eq!(k.object_refcount(ko).unwrap(), RefCount::default());

        let vref = k.map_inbound(B, ko, true).unwrap();
        assert_eq!(vref, VRef::import(1));
        assert_eq!(
            k.object_refcount(ko).unwrap(),
            RefCount {
                reachable: 1,
                recognizable: 1
            }
        );

        // Idempotent in both directions.
        assert_eq!(k.map_inbound(B, ko, true).unwrap(), vref);
        assert_eq!(k.map_outbound(B, vref, MapOpts::default()).unwrap(), ko);
        assert_eq!(k.map_outbound(A, VRef::export(1), MapOpts::default()).unwrap(), ko);
        assert_eq!(k.object_refcount(ko).unwrap().reachable, 1);
    }

    #[test]
    fn inbound_outbound_inverse_for_every_kind() {
        let mut k = keeper();
        let ko = k.add_kernel_object(A).unwrap();
        let kp = k.add_kernel_promise().unwrap();
        let kd = k.add_device_node(crate::slots::DeviceId(1)).unwrap();
        for kref in [ko, kp, kd] {
            let vref = k.map_inbound(B, kref, true).unwrap();
            assert_eq!(k.map_outbound(B, vref, MapOpts::default()).unwrap(), kref);
            assert_eq!(k.map_inbound(B, kref, true).unwrap(), vref);
        }
        assert_eq!(k.clist_entries(B).unwrap().len(), 3);
    }

    #[test]
    fn unknown_import_is_rejected() {
        let mut k = keeper();
        match k.map_outbound(A, VRef::import(7), MapOpts::default()) {
            Err(SyscallFailure::Vat(SyscallError::UnknownSlot { vat, .. })) => assert_eq!(vat, A),
            other => panic!("expected UnknownSlot, got {other:?}"),
        }
        assert!(matches!(
            k.map_outbound(A, VRef::new(SlotKind::Device, false, 1), MapOpts::default()),
            Err(SyscallFailure::Vat(SyscallError::UnknownSlot { .. }))
        ));
    }

    #[test]
    fn dropped_import_cannot_be_used() {
        let mut k = keeper();
        let ko = k.add_kernel_object(A).unwrap();
        let vref = k.map_inbound(B, ko, true).unwrap();
        k.clear_reachable_flag(B, ko).unwrap();
        assert_eq!(k.object_refcount(ko).unwrap().reachable, 0);
        assert!(k.maybe_free.contains(&ko));
        assert!(k.map_outbound(B, vref, MapOpts::default()).is_err());
        // but it can still be named for retirement
        assert_eq!(k.map_outbound(B, vref, MapOpts::lookup()).unwrap(), ko);
    }

    #[test]
    fn delete_entry_releases_counts() {
        let mut k = keeper();
        let ko = k.add_kernel_object(A).unwrap();
        let vref = k.map_inbound(B, ko, true).unwrap();
        k.delete_clist_entry(B, ko, vref).unwrap();
        assert_eq!(k.object_refcount(ko).unwrap(), RefCount::default());
        assert!(!k.has_clist_entry(B, ko));
        assert_eq!(k.clist_kref(B, vref).unwrap(), None);
    }

    #[test]
    fn promise_entries_count_for_both_sides() {
        let mut k = keeper();
        let kp = k.map_outbound(A, VRef::local_promise(1), MapOpts::default()).unwrap();
        assert_eq!(k.promise(kp).unwrap().decider, Some(A));
        assert_eq!(k.promise(kp).unwrap().ref_count, 1);
        k.map_inbound(B, kp, true).unwrap();
        assert_eq!(k.promise(kp).unwrap().ref_count, 2);
    }

    #[test]
    fn vatstore_iteration() {
        let mut k = keeper();
        k.vatstore_set(A, "b", "2").unwrap();
        k.vatstore_set(A, "a", "1").unwrap();
        k.vatstore_set(B, "a", "other").unwrap();
        assert_eq!(k.vatstore_get(A, "a").unwrap().as_deref(), Some("1"));
        assert_eq!(k.vatstore_next_key(A, "").unwrap().as_deref(), Some("a"));
        assert_eq!(k.vatstore_next_key(A, "a").unwrap().as_deref(), Some("b"));
        assert_eq!(k.vatstore_next_key(A, "b").unwrap(), None);
        assert!(k.vatstore_set(A, "bad\0key", "x").is_err());
        k.delete_vatstore(A);
        assert_eq!(k.vatstore_get(A, "a").unwrap(), None);
        assert_eq!(k.vatstore_get(B, "a").unwrap().as_deref(), Some("other"));
    }

    #[test]
    fn reap_dirt_threshold() {
        let mut k = keeper();
        assert!(!k.add_reap_dirt(A, Some(2)).unwrap());
        assert!(k.add_reap_dirt(A, Some(2)).unwrap());
        assert!(!k.add_reap_dirt(A, Some(2)).unwrap());
        assert!(!k.add_reap_dirt(A, None).unwrap());
    }
}
