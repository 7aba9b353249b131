//! Transcript entries — one per committed delivery.
//!
//! An entry records the vat-side delivery, every syscall the vat made with the
//! answer it got, and how the delivery ended. Replaying an incarnation's
//! entries against fresh vat code must produce exactly the same syscalls.

use serde::{Deserialize, Serialize};

use super::{DeliveryResult, VatDelivery, VatSyscall, VatSyscallResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    #[serde(rename = "s")]
    pub syscall: VatSyscall,
    #[serde(rename = "r")]
    pub result: VatSyscallResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(rename = "d")]
    pub delivery: VatDelivery,
    #[serde(rename = "sc")]
    pub syscalls: Vec<SyscallRecord>,
    #[serde(rename = "r")]
    pub status: DeliveryResult,
}

impl TranscriptEntry {
    pub fn new(delivery: VatDelivery) -> Self {
        Self {
            delivery,
            syscalls: Vec::new(),
            status: Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Answers a replayed delivery's syscalls from the recorded ones.
///
/// The first mismatch is remembered; every later syscall fails so the vat
/// winds down quickly. `finish` reports whether the replay matched.
pub struct ReplayCursor<'a> {
    expected: std::slice::Iter<'a, SyscallRecord>,
    divergence: Option<String>,
}

impl<'a> ReplayCursor<'a> {
    pub fn new(entry: &'a TranscriptEntry) -> Self {
        Self {
            expected: entry.syscalls.iter(),
            divergence: None,
        }
    }

    pub fn answer(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        if self.divergence.is_some() {
            return Err("replay diverged".into());
        }
        match self.expected.next() {
            Some(rec) if rec.syscall == *syscall => rec.result.clone(),
            Some(rec) => {
                self.divergence = Some(format!(
                    "expected syscall {:?}, vat made {:?}",
                    rec.syscall, syscall
                ));
                Err("replay diverged".into())
            }
            None => {
                self.divergence = Some(format!("vat made extra syscall {syscall:?}"));
                Err("replay diverged".into())
            }
        }
    }

    /// `Err(reason)` if the replay didn't match the recording.
    pub fn finish(mut self, recorded: &DeliveryResult, replayed: &DeliveryResult) -> Result<(), String> {
        if let Some(d) = self.divergence.take() {
            return Err(d);
        }
        if let Some(rec) = self.expected.next() {
            return Err(format!("vat skipped recorded syscall {:?}", rec.syscall));
        }
        if recorded.is_ok() != replayed.is_ok() {
            return Err(format!(
                "delivery status changed: recorded {recorded:?}, replayed {replayed:?}"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vat::SyscallOk;

    fn entry() -> TranscriptEntry {
        let mut e = TranscriptEntry::new(VatDelivery::BringOutYourDead);
        e.syscalls.push(SyscallRecord {
            syscall: VatSyscall::VatstoreGet { key: "k".into() },
            result: Ok(SyscallOk::Text(Some("v".into()))),
        });
        e
    }

    #[test]
    fn json_round_trip() {
        let e = entry();
        let json = e.to_json().unwrap();
        assert!(json.starts_with(r#"{"d":{"type":"bringOutYourDead"},"sc":[{"s":"#));
        assert_eq!(TranscriptEntry::from_json(&json).unwrap(), e);
    }

    #[test]
    fn cursor_matches_recording() {
        let e = entry();
        let mut c = ReplayCursor::new(&e);
        assert_eq!(
            c.answer(&VatSyscall::VatstoreGet { key: "k".into() }),
            Ok(SyscallOk::Text(Some("v".into())))
        );
        assert!(c.finish(&Ok(()), &Ok(())).is_ok());
    }

    #[test]
    fn cursor_detects_divergence() {
        let e = entry();
        let mut c = ReplayCursor::new(&e);
        assert!(c
            .answer(&VatSyscall::VatstoreGet { key: "other".into() })
            .is_err());
        assert!(c.finish(&Ok(()), &Ok(())).is_err());

        let c = ReplayCursor::new(&e);
        assert!(c.finish(&Ok(()), &Ok(())).unwrap_err().contains("skipped"));

        let mut c = ReplayCursor::new(&e);
        c.answer(&VatSyscall::VatstoreGet { key: "k".into() }).unwrap();
        assert!(c.finish(&Ok(()), &Err("boom".into())).is_err());
    }
}
