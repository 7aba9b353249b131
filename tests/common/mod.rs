//! Shared fixtures: a scriptable vat and a kernel harness.
//!
//! `ScriptVat` reacts to method names. Every delivery it sees is appended to a
//! shared log tagged with the label passed in its `startVat` params, so tests
//! can look at exactly what each vat received (in vrefs).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use vatkernel::{
    CapData, DeliveryResult, Kernel, KernelCapData, KernelConfig, KRef, NamedVatLoader, Syscall,
    VRef, VatCapData, VatDelivery, VatDispatch, VatId, VatOptions, VatResolution,
};

pub type Log = Arc<Mutex<Vec<(String, VatDelivery)>>>;

/// How a `ScriptVat` build differs from the plain one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Plain,
    /// Upgraded code: identical behavior, different bundle.
    V2,
    /// Fails its `startVat`.
    BadStart,
    /// Writes different vatstore keys than `Plain` would.
    Divergent,
}

pub struct ScriptVat {
    flavor: Flavor,
    label: String,
    log: Log,
    next_promise: u64,
    next_export: u64,
    held: Vec<VRef>,
    imports: Vec<VRef>,
}

impl ScriptVat {
    pub fn new(flavor: Flavor, log: Log) -> Self {
        Self {
            flavor,
            label: String::new(),
            log,
            next_promise: 1,
            next_export: 1,
            held: Vec::new(),
            imports: Vec::new(),
        }
    }

    fn promise(&mut self) -> VRef {
        let p = VRef::local_promise(self.next_promise);
        self.next_promise += 1;
        p
    }

    fn export(&mut self) -> VRef {
        let o = VRef::export(self.next_export);
        self.next_export += 1;
        o
    }

    fn message(&mut self, method: &str, args: &VatCapData, result: Option<VRef>, sys: &mut Syscall<'_>) -> DeliveryResult {
        let body = args.body_json().unwrap_or(Value::Null);
        let reply = |sys: &mut Syscall<'_>, data: VatCapData| match result {
            Some(r) => sys.fulfill(r, data),
            None => Ok(()),
        };
        match method {
            "echo" => reply(sys, args.clone())?,
            "hold" => self.held.extend(result),
            "release" => {
                for r in std::mem::take(&mut self.held) {
                    sys.fulfill(r, CapData::from_json(&json!("released")))?;
                }
                reply(sys, CapData::null())?;
            }
            // [{"@slot":0}, method]: send `method` to slot 0 with a fresh export
            // as the argument, and subscribe to the answer.
            "relay" => {
                let target = args.slots[0];
                let verb = body[1].as_str().unwrap_or("echo").to_string();
                let arg = self.export();
                let p = self.promise();
                sys.send(target, &verb, CapData::slot(arg), Some(p))?;
                sys.subscribe(p)?;
                reply(sys, CapData::null())?;
            }
            "exportNew" => {
                let o = self.export();
                reply(sys, CapData::slot(o))?;
            }
            "forget" => {
                let imports = std::mem::take(&mut self.imports);
                sys.drop_imports(imports.clone())?;
                sys.retire_imports(imports)?;
                reply(sys, CapData::null())?;
            }
            // Drop reachability but keep recognizing the imports.
            "drop" => {
                sys.drop_imports(self.imports.clone())?;
                reply(sys, CapData::null())?;
            }
            // [n]: retire export o+n.
            "retireExport" => {
                let n = body[0].as_u64().unwrap_or(1);
                sys.retire_exports(vec![VRef::export(n)])?;
                reply(sys, CapData::null())?;
            }
            "resolveTwice" => {
                if let Some(r) = result {
                    sys.resolve(vec![
                        VatResolution::fulfill(r, CapData::null()),
                        VatResolution::fulfill(r, CapData::null()),
                    ])?;
                }
            }
            "store" => {
                let key = match self.flavor {
                    Flavor::Divergent => format!("other-{}", body[0].as_str().unwrap_or_default()),
                    _ => body[0].as_str().unwrap_or_default().to_string(),
                };
                sys.vatstore_set(&key, body[1].as_str().unwrap_or_default())?;
                reply(sys, CapData::null())?;
            }
            "load" => {
                let value = sys.vatstore_get(body[0].as_str().unwrap_or_default())?;
                reply(sys, CapData::from_json(&json!(value)))?;
            }
            "burn" => {
                for i in 0..body[0].as_u64().unwrap_or(1) {
                    sys.vatstore_set(&format!("burn{i}"), "x")?;
                }
                reply(sys, CapData::null())?;
            }
            // [{"@slot":0}, method, args]: callNow on the device in slot 0. The
            // vat's own root rides along as slot 0 of the device args.
            "useDevice" => {
                let device = args.slots[0];
                let verb = body[1].as_str().unwrap_or_default().to_string();
                let dargs = CapData::new(body[2].to_string(), vec![VRef::root()]);
                match sys.call_now(device, &verb, dargs) {
                    Ok(data) => reply(sys, data)?,
                    Err(e) => {
                        if let Some(r) = result {
                            sys.reject(r, CapData::error(&e))?;
                        }
                    }
                }
            }
            "fail" => return Err("boom".into()),
            "panic" => panic!("vat code panicked"),
            "illegal" => {
                let _ = sys.fulfill(VRef::remote_promise(99), CapData::null());
            }
            "exit" => {
                sys.exit(body[0].as_bool().unwrap_or(false), CapData::error("done"))?;
            }
            // Device callbacks and anything else are just logged.
            _ => {}
        }
        Ok(())
    }
}

impl VatDispatch for ScriptVat {
    fn dispatch(&mut self, delivery: VatDelivery, sys: &mut Syscall<'_>) -> DeliveryResult {
        if let VatDelivery::StartVat { params } = &delivery {
            if let Some(label) = params.body_json().and_then(|v| v["label"].as_str().map(str::to_string)) {
                self.label = label;
            }
        }
        self.log
            .lock()
            .unwrap()
            .push((self.label.clone(), delivery.clone()));

        match delivery {
            VatDelivery::StartVat { .. } if self.flavor == Flavor::BadStart => Err("refusing to start".into()),
            VatDelivery::Message { msg, .. } => self.message(&msg.method, &msg.args, msg.result, sys),
            VatDelivery::Notify { resolutions } => {
                for r in resolutions {
                    self.imports
                        .extend(r.data.slots.iter().filter(|s| s.is_object() && !s.allocated_by_vat));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub const PLAIN: &[u8] = b"scripted";
pub const V2: &[u8] = b"scripted-v2";
pub const BAD_START: &[u8] = b"scripted-bad-start";
pub const UNLOADABLE: &[u8] = b"not-a-registered-vat";

pub fn loader(log: &Log) -> NamedVatLoader {
    loader_with(log, Flavor::Plain)
}

/// Like `loader`, but the plain bundle builds `plain` vats.
pub fn loader_with(log: &Log, plain: Flavor) -> NamedVatLoader {
    let mut loader = NamedVatLoader::new();
    for (name, flavor) in [
        ("scripted", plain),
        ("scripted-v2", Flavor::V2),
        ("scripted-bad-start", Flavor::BadStart),
    ] {
        let log = log.clone();
        loader.register(name, move || -> Box<dyn VatDispatch> { Box::new(ScriptVat::new(flavor, log.clone())) });
    }
    loader
}

pub struct Harness {
    pub kernel: Kernel,
    pub log: Log,
}

impl Harness {
    pub fn new(config: KernelConfig) -> Self {
        let log = Log::default();
        let kernel = Kernel::open(config, loader(&log)).unwrap();
        Self { kernel, log }
    }

    pub fn in_memory() -> Self {
        Self::new(KernelConfig::in_memory())
    }

    pub fn bundle(&mut self, bytes: &[u8]) -> String {
        self.kernel.install_bundle(bytes.to_vec()).unwrap()
    }

    /// Create a plain static vat labelled `name` and run until idle.
    pub async fn vat(&mut self, name: &str) -> VatId {
        self.vat_with(name, VatOptions::default()).await
    }

    pub async fn vat_with(&mut self, name: &str, options: VatOptions) -> VatId {
        let bundle = self.bundle(PLAIN);
        let vat = self
            .kernel
            .create_vat(name, &bundle, params(name), options)
            .unwrap();
        self.kernel.run().await.unwrap();
        vat
    }

    pub fn root(&self, vat: VatId) -> KRef {
        self.kernel.vat_root(vat).unwrap()
    }

    pub fn send(&mut self, target: KRef, method: &str, body: Value, slots: Vec<KRef>) -> KRef {
        self.kernel
            .queue_to_kref(target, method, args(body, slots))
            .unwrap()
    }

    /// Everything `label` has received so far.
    pub fn deliveries(&self, label: &str) -> Vec<VatDelivery> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Messages `label` has received, as (method, args).
    pub fn messages(&self, label: &str) -> Vec<(String, VatCapData)> {
        self.deliveries(label)
            .into_iter()
            .filter_map(|d| match d {
                VatDelivery::Message { msg, .. } => Some((msg.method, msg.args)),
                _ => None,
            })
            .collect()
    }

    /// `(rejected, body)` of a settled promise.
    pub fn resolution(&self, kpid: KRef) -> (bool, String) {
        let (rejected, data) = self.kernel.kp_resolution(kpid).unwrap();
        (rejected, data.body)
    }
}

pub fn params(label: &str) -> KernelCapData {
    CapData::from_json(&json!({ "label": label }))
}

pub fn args(body: Value, slots: Vec<KRef>) -> KernelCapData {
    CapData::new(body.to_string(), slots)
}
