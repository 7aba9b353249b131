//! Capability data — the `{ body, slots }` envelope for every boundary crossing.
//!
//! `body` is an opaque JSON string; slot references inside it are positional
//! (`{"@slot":N}` indexes into `slots`). The kernel only ever rewrites `slots`,
//! never `body`, which is what keeps the envelope round-trip exact.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::slots::{KRef, VRef};

/// Serialized value plus the slots it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    pub slots: Vec<S>,
}

pub type KernelCapData = CapData<KRef>;
pub type VatCapData = CapData<VRef>;

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Pure data, no slots.
    pub fn data(body: impl Into<String>) -> Self {
        Self::new(body, Vec::new())
    }

    /// JSON `null`.
    pub fn null() -> Self {
        Self::data("null")
    }

    /// Serialize a JSON value as a slot-free body.
    pub fn from_json(value: &Value) -> Self {
        Self::data(value.to_string())
    }

    /// A bare reference to a single slot.
    pub fn slot(slot: S) -> Self {
        Self::new(json!({ "@slot": 0 }).to_string(), vec![slot])
    }

    /// An error value, as carried by rejections.
    pub fn error(message: &str) -> Self {
        Self::data(json!({ "@error": message }).to_string())
    }

    /// Rewrite every slot, keeping the body untouched.
    pub fn map_slots<T, E>(&self, mut f: impl FnMut(&S) -> Result<T, E>) -> Result<CapData<T>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }

    /// Parse the body as JSON. `None` if the body isn't valid JSON.
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// If this value is exactly one slot reference, return it.
    pub fn single_slot(&self) -> Option<&S> {
        if self.slots.len() != 1 {
            return None;
        }
        match self.body_json() {
            Some(v) if v == json!({ "@slot": 0 }) => self.slots.first(),
            _ => None,
        }
    }

    /// The message of an `{"@error": ..}` body, if that's what this is.
    pub fn error_message(&self) -> Option<String> {
        self.body_json()?
            .get("@error")?
            .as_str()
            .map(str::to_string)
    }
}

/// A method invocation: verb, arguments and optional result promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S> {
    pub method: String,
    pub args: CapData<S>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<S>,
}

impl<S> Message<S> {
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }

    /// Every slot the message mentions: args first, then the result.
    pub fn slots(&self) -> impl Iterator<Item = &S> {
        self.args.slots.iter().chain(self.result.iter())
    }
}
