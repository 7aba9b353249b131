//! Vat loaders — turn an installed bundle into runnable vat code.
//!
//! The kernel stores bundles as opaque bytes under their content address and
//! hands them to the host's `VatLoader` whenever a worker has to be (re)built.

use std::collections::BTreeMap;

use super::VatDispatch;

pub trait VatLoader: Send + Sync {
    /// Build a fresh instance of the vat code in `bytes`.
    fn load(&self, bundle_id: &str, bytes: &[u8]) -> Result<Box<dyn VatDispatch>, String>;
}

type VatFactory = Box<dyn Fn() -> Box<dyn VatDispatch> + Send + Sync>;

/// Loader for bundles whose bytes are just a registered name.
///
/// Useful for embedding vats compiled into the host binary: install the
/// bundle `b"counter"` and register a factory under `"counter"`.
#[derive(Default)]
pub struct NamedVatLoader {
    factories: BTreeMap<String, VatFactory>,
}

impl NamedVatLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn VatDispatch> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn VatDispatch> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl VatLoader for NamedVatLoader {
    fn load(&self, bundle_id: &str, bytes: &[u8]) -> Result<Box<dyn VatDispatch>, String> {
        let name = std::str::from_utf8(bytes)
            .map_err(|_| format!("bundle {bundle_id} is not a vat name"))?;
        self.factories
            .get(name)
            .map(|make| make())
            .ok_or_else(|| format!("no vat registered as '{name}' (bundle {bundle_id})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vat::{DeliveryResult, Syscall, VatDelivery};

    struct Idle;

    impl VatDispatch for Idle {
        fn dispatch(&mut self, _: VatDelivery, _: &mut Syscall<'_>) -> DeliveryResult {
            Ok(())
        }
    }

    #[test]
    fn loads_registered_names() {
        let loader = NamedVatLoader::new().with("idle", || Box::new(Idle));
        assert!(loader.load("b1-x", b"idle").is_ok());
        assert!(loader
            .load("b1-x", b"missing")
            .err()
            .is_some_and(|e| e.contains("missing")));
        assert!(loader.load("b1-x", &[0xff, 0xfe]).is_err());
        assert_eq!(loader.names().collect::<Vec<_>>(), vec!["idle"]);
    }
}
