//! KernelKeeper — typed access to kernel tables stored in the kv store.
//!
//! Every piece of kernel state lives in the `Store` under a string key (see the
//! key list in `mod.rs`), so a single commit/abort covers all of it. The
//! keeper adds typing, counters and reference counting on top.
//!
//! C-list and per-vat state accessors live in `clist.rs`; GC bookkeeping in
//! `gc.rs`. They are all `impl KernelKeeper` blocks over the same state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, KernelCapData, Message};
use crate::error::{KernelError, KernelResult};
use crate::slots::{DeviceId, KRef, VatId};
use crate::store::{Savepoint, Store};

use super::run_queue::RunQueueEvent;

/// Resolution state of a kernel promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    fn as_str(&self) -> &'static str {
        match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> KernelResult<Self> {
        match s {
            "unresolved" => Ok(PromiseState::Unresolved),
            "fulfilled" => Ok(PromiseState::Fulfilled),
            "rejected" => Ok(PromiseState::Rejected),
            other => Err(KernelError::InvalidData(format!("promise state '{other}'"))),
        }
    }
}

/// A kernel promise, as read out of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelPromise {
    pub state: PromiseState,
    pub decider: Option<VatId>,
    pub subscribers: BTreeSet<VatId>,
    pub queue: Vec<Message<KRef>>,
    pub data: Option<KernelCapData>,
    pub ref_count: u64,
}

/// (reachable, recognizable) counts of a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.reachable, self.recognizable)
    }
}

impl FromStr for RefCount {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KernelError::InvalidData(format!("refcount '{s}'"));
        let (r, c) = s.split_once(',').ok_or_else(bad)?;
        Ok(RefCount {
            reachable: r.parse().map_err(|_| bad())?,
            recognizable: c.parse().map_err(|_| bad())?,
        })
    }
}

/// How a reference-count change should be applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefOpts {
    /// The exporter's own c-list entry; doesn't count for objects.
    pub is_export: bool,
    /// Only touch the recognizable half.
    pub only_recognizable: bool,
}

impl RefOpts {
    pub fn export() -> Self {
        Self {
            is_export: true,
            only_recognizable: false,
        }
    }

    pub fn recognizable() -> Self {
        Self {
            is_export: false,
            only_recognizable: true,
        }
    }
}

pub struct KernelKeeper {
    pub(crate) store: Store,
    /// Krefs whose counts dropped this crank; examined by `process_refcounts`.
    pub(crate) maybe_free: BTreeSet<KRef>,
}

impl KernelKeeper {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            maybe_free: BTreeSet::new(),
        }
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Get a mutable reference to the underlying store.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.store.has("kernel.initialized")
    }

    pub fn mark_initialized(&mut self) {
        self.store.set("kernel.initialized", "true");
    }

    // ── Raw typed access ──

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key)
    }

    pub(crate) fn get_required(&self, key: &str) -> KernelResult<&str> {
        self.store
            .get(key)
            .ok_or_else(|| KernelError::InvalidData(format!("missing key '{key}'")))
    }

    pub(crate) fn get_u64(&self, key: &str) -> KernelResult<Option<u64>> {
        self.store
            .get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| KernelError::InvalidData(format!("key '{key}' is not a number: {v}")))
            })
            .transpose()
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        self.store
            .get(key)
            .map(|v| serde_json::from_str(v).map_err(KernelError::from))
            .transpose()
    }

    pub(crate) fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> KernelResult<()> {
        let encoded = serde_json::to_string(value)?;
        self.store.set(key, encoded);
        Ok(())
    }

    /// Bump a counter and return the value it held. Counters start at 1.
    pub(crate) fn next_id(&mut self, key: &str) -> KernelResult<u64> {
        let id = self.get_u64(key)?.unwrap_or(1);
        self.store.set(key, (id + 1).to_string());
        Ok(id)
    }

    // ── Crank transactions ──

    pub fn establish_savepoint(&mut self, sp: Savepoint) {
        self.store.establish_savepoint(sp);
    }

    pub fn rollback_to(&mut self, sp: Savepoint) {
        self.store.rollback_to(sp);
        self.maybe_free.clear();
    }

    pub fn abort_crank(&mut self) {
        self.store.abort();
        self.maybe_free.clear();
    }

    pub fn commit_crank(&mut self) -> KernelResult<Option<String>> {
        self.store.commit()
    }

    pub fn crank_number(&self) -> KernelResult<u64> {
        Ok(self.get_u64("crankNumber")?.unwrap_or(0))
    }

    pub fn increment_crank_number(&mut self) -> KernelResult<()> {
        let n = self.crank_number()?;
        self.store.set("crankNumber", (n + 1).to_string());
        Ok(())
    }

    // ── Kernel objects ──

    pub fn add_kernel_object(&mut self, owner: VatId) -> KernelResult<KRef> {
        let kref = KRef::Object(self.next_id("ko.nextID")?);
        self.store.set(format!("{kref}.owner"), owner.to_string());
        self.set_object_refcount(kref, RefCount::default());
        Ok(kref)
    }

    pub fn object_exists(&self, kref: KRef) -> bool {
        self.store.has(&format!("{kref}.refCount"))
    }

    /// Owning vat, or `None` once the object has been orphaned.
    pub fn object_owner(&self, kref: KRef) -> KernelResult<Option<VatId>> {
        self.get(&format!("{kref}.owner"))
            .map(|v| v.parse().map_err(KernelError::from))
            .transpose()
    }

    pub fn object_refcount(&self, kref: KRef) -> KernelResult<RefCount> {
        self.get_required(&format!("{kref}.refCount"))?.parse()
    }

    pub fn set_object_refcount(&mut self, kref: KRef, rc: RefCount) {
        self.store.set(format!("{kref}.refCount"), rc.to_string());
    }

    /// The owner is gone; importers keep the object until they retire it.
    pub fn orphan_object(&mut self, kref: KRef) {
        self.store.delete(&format!("{kref}.owner"));
    }

    pub fn delete_object(&mut self, kref: KRef) {
        self.store.delete(&format!("{kref}.owner"));
        self.store.delete(&format!("{kref}.refCount"));
    }

    // ── Device nodes ──

    pub fn add_device_node(&mut self, device: DeviceId) -> KernelResult<KRef> {
        let kref = KRef::Device(self.next_id("kd.nextID")?);
        self.store.set(format!("{kref}.owner"), device.to_string());
        Ok(kref)
    }

    pub fn device_node_owner(&self, kref: KRef) -> KernelResult<Option<DeviceId>> {
        self.get(&format!("{kref}.owner"))
            .map(|v| v.parse().map_err(KernelError::from))
            .transpose()
    }

    // ── Kernel promises ──

    /// A fresh unresolved promise with no decider (host or device owned).
    pub fn add_kernel_promise(&mut self) -> KernelResult<KRef> {
        let kpid = KRef::Promise(self.next_id("kp.nextID")?);
        self.store
            .set(format!("{kpid}.state"), PromiseState::Unresolved.as_str());
        self.store.set(format!("{kpid}.refCount"), "0");
        self.set_json(&format!("{kpid}.subscribers"), &Vec::<VatId>::new())?;
        self.set_json(&format!("{kpid}.queue"), &Vec::<Message<KRef>>::new())?;
        Ok(kpid)
    }

    pub fn add_kernel_promise_for_vat(&mut self, decider: VatId) -> KernelResult<KRef> {
        let kpid = self.add_kernel_promise()?;
        self.store.set(format!("{kpid}.decider"), decider.to_string());
        Ok(kpid)
    }

    pub fn promise_exists(&self, kpid: KRef) -> bool {
        self.store.has(&format!("{kpid}.state"))
    }

    pub fn promise(&self, kpid: KRef) -> KernelResult<KernelPromise> {
        let state = match self.get(&format!("{kpid}.state")) {
            Some(s) => PromiseState::parse(s)?,
            None => return Err(KernelError::UnknownPromise(kpid.to_string())),
        };
        let ref_count = self.get_u64(&format!("{kpid}.refCount"))?.unwrap_or(0);
        let decider = self
            .get(&format!("{kpid}.decider"))
            .map(|v| v.parse::<VatId>())
            .transpose()?;
        let subscribers: BTreeSet<VatId> = self
            .get_json::<Vec<VatId>>(&format!("{kpid}.subscribers"))?
            .unwrap_or_default()
            .into_iter()
            .collect();
        let queue = self
            .get_json(&format!("{kpid}.queue"))?
            .unwrap_or_default();
        let data = self.get_json(&format!("{kpid}.data"))?;
        Ok(KernelPromise {
            state,
            decider,
            subscribers,
            queue,
            data,
            ref_count,
        })
    }

    pub fn promise_state(&self, kpid: KRef) -> KernelResult<PromiseState> {
        match self.get(&format!("{kpid}.state")) {
            Some(s) => PromiseState::parse(s),
            None => Err(KernelError::UnknownPromise(kpid.to_string())),
        }
    }

    pub fn set_decider(&mut self, kpid: KRef, decider: Option<VatId>) {
        let key = format!("{kpid}.decider");
        match decider {
            Some(vat) => self.store.set(key, vat.to_string()),
            None => self.store.delete(&key),
        }
    }

    pub fn add_subscriber(&mut self, kpid: KRef, vat: VatId) -> KernelResult<()> {
        let key = format!("{kpid}.subscribers");
        let mut subs: BTreeSet<VatId> = self
            .get_json::<Vec<VatId>>(&key)?
            .unwrap_or_default()
            .into_iter()
            .collect();
        if subs.insert(vat) {
            self.set_json(&key, &subs.into_iter().collect::<Vec<_>>())?;
        }
        Ok(())
    }

    /// Park a message on an unresolved promise. The message keeps the refcounts
    /// it held on the run queue.
    pub fn add_message_to_promise_queue(&mut self, kpid: KRef, msg: Message<KRef>) -> KernelResult<()> {
        let key = format!("{kpid}.queue");
        let mut queue: Vec<Message<KRef>> = self.get_json(&key)?.unwrap_or_default();
        queue.push(msg);
        self.set_json(&key, &queue)
    }

    /// Settle a promise. Queued messages go back on the run queue aimed at the
    /// (now resolved) promise, and the resolution data takes references.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KRef,
        rejected: bool,
        data: &KernelCapData,
    ) -> KernelResult<()> {
        for slot in &data.slots {
            self.increment_refcount(*slot, RefOpts::default())?;
        }
        let queue: Vec<Message<KRef>> = self
            .get_json(&format!("{kpid}.queue"))?
            .unwrap_or_default();
        for msg in queue {
            self.enqueue_run_queue(&RunQueueEvent::Send { target: kpid, msg })?;
        }

        self.store.delete(&format!("{kpid}.decider"));
        self.store.delete(&format!("{kpid}.subscribers"));
        self.store.delete(&format!("{kpid}.queue"));
        let state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        self.store.set(format!("{kpid}.state"), state.as_str());
        self.set_json(&format!("{kpid}.data"), data)
    }

    /// Settle `kpid` and tell its subscribers. The resolver (if any) already
    /// knows, so it gets no notify.
    pub fn resolve_promise(
        &mut self,
        resolver: Option<VatId>,
        kpid: KRef,
        rejected: bool,
        data: &KernelCapData,
    ) -> KernelResult<()> {
        let p = self.promise(kpid)?;
        if p.state != PromiseState::Unresolved {
            return Err(KernelError::Panic(format!("{kpid} resolved twice")));
        }
        for sub in p.subscribers {
            if Some(sub) != resolver {
                self.queue_notify(sub, kpid)?;
            }
        }
        self.resolve_kernel_promise(kpid, rejected, data)
    }

    pub fn queue_notify(&mut self, vat: VatId, kpid: KRef) -> KernelResult<()> {
        let event = RunQueueEvent::Notify { vat, kpid };
        self.incref_event(&event)?;
        self.enqueue_run_queue(&event)
    }

    pub fn delete_promise(&mut self, kpid: KRef) {
        for field in ["state", "decider", "subscribers", "queue", "data", "refCount"] {
            self.store.delete(&format!("{kpid}.{field}"));
        }
    }

    // ── Reference counts ──

    pub fn increment_refcount(&mut self, kref: KRef, opts: RefOpts) -> KernelResult<()> {
        match kref {
            KRef::Promise(_) => {
                let key = format!("{kref}.refCount");
                let n = self.get_u64(&key)?.ok_or_else(|| {
                    KernelError::UnknownPromise(format!("incref of missing {kref}"))
                })?;
                self.store.set(key, (n + 1).to_string());
            }
            KRef::Object(_) if !opts.is_export => {
                let mut rc = self.object_refcount(kref)?;
                if !opts.only_recognizable {
                    rc.reachable += 1;
                }
                rc.recognizable += 1;
                self.set_object_refcount(kref, rc);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn decrement_refcount(&mut self, kref: KRef, opts: RefOpts) -> KernelResult<()> {
        match kref {
            KRef::Promise(_) => {
                let key = format!("{kref}.refCount");
                let n = self.get_u64(&key)?.ok_or_else(|| {
                    KernelError::UnknownPromise(format!("decref of missing {kref}"))
                })?;
                if n == 0 {
                    return Err(KernelError::Panic(format!("refcount underflow on {kref}")));
                }
                self.store.set(key, (n - 1).to_string());
                if n == 1 {
                    self.maybe_free.insert(kref);
                }
            }
            KRef::Object(_) if !opts.is_export && self.object_exists(kref) => {
                let mut rc = self.object_refcount(kref)?;
                if !opts.only_recognizable {
                    rc.reachable = rc.reachable.checked_sub(1).ok_or_else(|| {
                        KernelError::Panic(format!("reachable underflow on {kref}"))
                    })?;
                }
                rc.recognizable = rc.recognizable.checked_sub(1).ok_or_else(|| {
                    KernelError::Panic(format!("recognizable underflow on {kref}"))
                })?;
                if rc.reachable == 0 || rc.recognizable == 0 {
                    self.maybe_free.insert(kref);
                }
                self.set_object_refcount(kref, rc);
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn increment_reachable(&mut self, kref: KRef) -> KernelResult<()> {
        let mut rc = self.object_refcount(kref)?;
        rc.reachable += 1;
        self.set_object_refcount(kref, rc);
        Ok(())
    }

    pub(crate) fn decrement_reachable(&mut self, kref: KRef) -> KernelResult<()> {
        if !self.object_exists(kref) {
            return Ok(());
        }
        let mut rc = self.object_refcount(kref)?;
        rc.reachable = rc
            .reachable
            .checked_sub(1)
            .ok_or_else(|| KernelError::Panic(format!("reachable underflow on {kref}")))?;
        if rc.reachable == 0 {
            self.maybe_free.insert(kref);
        }
        self.set_object_refcount(kref, rc);
        Ok(())
    }

    /// Hold references for everything a queued event mentions.
    pub fn incref_event(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        for kref in event.krefs() {
            self.increment_refcount(kref, RefOpts::default())?;
        }
        Ok(())
    }

    /// Release what `incref_event` took.
    pub fn decref_event(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        for kref in event.krefs() {
            self.decrement_refcount(kref, RefOpts::default())?;
        }
        Ok(())
    }

    // ── Run queue ──

    pub fn enqueue_run_queue(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        let tail = self.get_u64("runQueue.tail")?.unwrap_or(0);
        self.set_json(&format!("runQueue.{tail}"), event)?;
        self.store.set("runQueue.tail", (tail + 1).to_string());
        Ok(())
    }

    pub fn dequeue_run_queue(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        let head = self.get_u64("runQueue.head")?.unwrap_or(0);
        let tail = self.get_u64("runQueue.tail")?.unwrap_or(0);
        if head >= tail {
            return Ok(None);
        }
        let key = format!("runQueue.{head}");
        let event = self
            .get_json(&key)?
            .ok_or_else(|| KernelError::InvalidData(format!("run queue hole at {head}")))?;
        self.store.delete(&key);
        self.store.set("runQueue.head", (head + 1).to_string());
        Ok(Some(event))
    }

    pub fn run_queue_len(&self) -> KernelResult<u64> {
        let head = self.get_u64("runQueue.head")?.unwrap_or(0);
        let tail = self.get_u64("runQueue.tail")?.unwrap_or(0);
        Ok(tail.saturating_sub(head))
    }

    // ── Reap queue ──

    pub fn schedule_reap(&mut self, vat: VatId) -> KernelResult<()> {
        let mut queue: Vec<VatId> = self.get_json("reapQueue")?.unwrap_or_default();
        if !queue.contains(&vat) {
            queue.push(vat);
            self.set_json("reapQueue", &queue)?;
        }
        Ok(())
    }

    pub fn next_reap(&mut self) -> KernelResult<Option<VatId>> {
        let mut queue: Vec<VatId> = self.get_json("reapQueue")?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(None);
        }
        let vat = queue.remove(0);
        self.set_json("reapQueue", &queue)?;
        Ok(Some(vat))
    }

    // ── Vat and device registries ──

    pub fn allocate_vat_id(&mut self) -> KernelResult<VatId> {
        let n = self.next_id("vat.nextID")?;
        u32::try_from(n)
            .map(VatId)
            .map_err(|_| KernelError::Panic("vat IDs exhausted".into()))
    }

    pub fn allocate_device_id(&mut self) -> KernelResult<DeviceId> {
        let n = self.next_id("device.nextID")?;
        u32::try_from(n)
            .map(DeviceId)
            .map_err(|_| KernelError::Panic("device IDs exhausted".into()))
    }

    pub fn allocate_upgrade_id(&mut self) -> KernelResult<u64> {
        self.next_id("upgrade.nextID")
    }

    pub fn live_vats(&self) -> KernelResult<BTreeSet<VatId>> {
        Ok(self.get_json("vat.live")?.unwrap_or_default())
    }

    pub fn is_vat_alive(&self, vat: VatId) -> KernelResult<bool> {
        Ok(self.live_vats()?.contains(&vat))
    }

    pub fn add_live_vat(&mut self, vat: VatId) -> KernelResult<()> {
        let mut live = self.live_vats()?;
        live.insert(vat);
        self.set_json("vat.live", &live)
    }

    /// Move a vat from the live set to the terminated set.
    pub fn mark_vat_terminated(&mut self, vat: VatId) -> KernelResult<()> {
        let mut live = self.live_vats()?;
        live.remove(&vat);
        self.set_json("vat.live", &live)?;
        let mut dead: BTreeSet<VatId> = self.get_json("vat.terminated")?.unwrap_or_default();
        dead.insert(vat);
        self.set_json("vat.terminated", &dead)
    }

    pub fn is_vat_terminated(&self, vat: VatId) -> KernelResult<bool> {
        let dead: BTreeSet<VatId> = self.get_json("vat.terminated")?.unwrap_or_default();
        Ok(dead.contains(&vat))
    }

    pub fn vat_names(&self) -> KernelResult<BTreeMap<String, VatId>> {
        Ok(self.get_json("vat.names")?.unwrap_or_default())
    }

    pub fn register_vat_name(&mut self, name: &str, vat: VatId) -> KernelResult<()> {
        let mut names = self.vat_names()?;
        names.insert(name.to_string(), vat);
        self.set_json("vat.names", &names)
    }

    pub fn device_names(&self) -> KernelResult<BTreeMap<String, DeviceId>> {
        Ok(self.get_json("device.names")?.unwrap_or_default())
    }

    pub fn register_device_name(&mut self, name: &str, device: DeviceId) -> KernelResult<()> {
        let mut names = self.device_names()?;
        names.insert(name.to_string(), device);
        self.set_json("device.names", &names)
    }

    pub fn device_root(&self, device: DeviceId) -> KernelResult<Option<KRef>> {
        self.get(&format!("{device}.root"))
            .map(|v| v.parse().map_err(KernelError::from))
            .transpose()
    }

    pub fn set_device_root(&mut self, device: DeviceId, kref: KRef) {
        self.store.set(format!("{device}.root"), kref.to_string());
    }

    /// Queue a message to `target` with no result promise. Used by devices and
    /// kernel notifications; takes references for the target and args.
    pub fn queue_send_only(
        &mut self,
        target: KRef,
        method: &str,
        args: KernelCapData,
    ) -> KernelResult<()> {
        let event = RunQueueEvent::Send {
            target,
            msg: Message::new(method, args, None),
        };
        self.incref_event(&event)?;
        self.enqueue_run_queue(&event)
    }

    /// Convenience for tests and host queries: a promise's resolution data.
    pub fn promise_resolution(&self, kpid: KRef) -> KernelResult<(PromiseState, Option<KernelCapData>)> {
        let p = self.promise(kpid)?;
        Ok((p.state, p.data))
    }
}

/// `CapData` built from a JSON value plus slots.
pub(crate) fn json_capdata(value: serde_json::Value, slots: Vec<KRef>) -> KernelCapData {
    CapData::new(value.to_string(), slots)
}
