//! Slot identifiers — kernel-wide krefs, vat-local vrefs, vat and device IDs.
//!
//! String forms:
//! ```text
//! kref:  ko12  kp7  kd1
//! vref:  o+0  o-4  p+3  p-9  d-1     (+ = allocated by the vat, - = by the kernel)
//! vat:   v3
//! device: d2
//! ```
//!
//! All of these are `Ord` so they can key `BTreeMap`s; iteration order must be
//! deterministic everywhere in the kernel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {kind} '{text}'")]
pub struct ParseSlotError {
    pub kind: &'static str,
    pub text: String,
}

impl ParseSlotError {
    fn new(kind: &'static str, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
        }
    }
}

fn parse_number(kind: &'static str, text: &str, digits: &str) -> Result<u64, ParseSlotError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseSlotError::new(kind, text));
    }
    digits.parse().map_err(|_| ParseSlotError::new(kind, text))
}

/// The three kinds of thing a slot can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    fn letter(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }
}

// ── VatId / DeviceId ──

macro_rules! numbered_id {
    ($name:ident, $prefix:literal, $kind:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseSlotError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s
                    .strip_prefix($prefix)
                    .ok_or_else(|| ParseSlotError::new($kind, s))?;
                let n = parse_number($kind, s, digits)?;
                u32::try_from(n)
                    .map($name)
                    .map_err(|_| ParseSlotError::new($kind, s))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseSlotError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}

numbered_id!(VatId, "v", "vat id");
numbered_id!(DeviceId, "d", "device id");

// ── KRef ──

/// A kernel-wide reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KRef {
    Object(u64),
    Promise(u64),
    Device(u64),
}

impl KRef {
    pub fn kind(&self) -> SlotKind {
        match self {
            KRef::Object(_) => SlotKind::Object,
            KRef::Promise(_) => SlotKind::Promise,
            KRef::Device(_) => SlotKind::Device,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, KRef::Object(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, KRef::Device(_))
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(n) => write!(f, "ko{n}"),
            KRef::Promise(n) => write!(f, "kp{n}"),
            KRef::Device(n) => write!(f, "kd{n}"),
        }
    }
}

impl FromStr for KRef {
    type Err = ParseSlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix('k').ok_or_else(|| ParseSlotError::new("kref", s))?;
        let mut chars = rest.chars();
        let ctor: fn(u64) -> KRef = match chars.next() {
            Some('o') => KRef::Object,
            Some('p') => KRef::Promise,
            Some('d') => KRef::Device,
            _ => return Err(ParseSlotError::new("kref", s)),
        };
        Ok(ctor(parse_number("kref", s, chars.as_str())?))
    }
}

impl TryFrom<String> for KRef {
    type Error = ParseSlotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KRef> for String {
    fn from(k: KRef) -> String {
        k.to_string()
    }
}

// ── VRef ──

/// A vat-local reference. `allocated_by_vat` is the `+`/`-` sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VRef {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub id: u64,
}

impl VRef {
    pub fn new(kind: SlotKind, allocated_by_vat: bool, id: u64) -> Self {
        Self {
            kind,
            allocated_by_vat,
            id,
        }
    }

    /// `o+N`: an object the vat exports.
    pub fn export(id: u64) -> Self {
        Self::new(SlotKind::Object, true, id)
    }

    /// `o-N`: an object the vat imported.
    pub fn import(id: u64) -> Self {
        Self::new(SlotKind::Object, false, id)
    }

    /// `p+N`: a promise the vat allocated (it is the initial decider).
    pub fn local_promise(id: u64) -> Self {
        Self::new(SlotKind::Promise, true, id)
    }

    /// `p-N`: a promise the kernel introduced.
    pub fn remote_promise(id: u64) -> Self {
        Self::new(SlotKind::Promise, false, id)
    }

    /// `d-N`: a device node.
    pub fn device(id: u64) -> Self {
        Self::new(SlotKind::Device, false, id)
    }

    /// `o+0`, the object a vat hands out as its root.
    pub fn root() -> Self {
        Self::export(0)
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }

    pub fn is_object(&self) -> bool {
        self.kind == SlotKind::Object
    }
}

impl fmt::Display for VRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}{}", self.kind.letter(), sign, self.id)
    }
}

impl FromStr for VRef {
    type Err = ParseSlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('o') => SlotKind::Object,
            Some('p') => SlotKind::Promise,
            Some('d') => SlotKind::Device,
            _ => return Err(ParseSlotError::new("vref", s)),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(ParseSlotError::new("vref", s)),
        };
        if kind == SlotKind::Device && allocated_by_vat {
            return Err(ParseSlotError::new("vref", s));
        }
        let id = parse_number("vref", s, chars.as_str())?;
        Ok(Self::new(kind, allocated_by_vat, id))
    }
}

impl TryFrom<String> for VRef {
    type Error = ParseSlotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VRef> for String {
    fn from(v: VRef) -> String {
        v.to_string()
    }
}
