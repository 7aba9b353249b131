//! Mailbox device — sequence-numbered, at-least-once message exchange with
//! named remote peers.
//!
//! Outbound: a vat `add`s `(peer, seq, body)`; the host reads the outbox and
//! ships it. When the peer acknowledges `seq`, everything at or below it is
//! pruned. Inbound: the host hands over whatever it received (duplicates and
//! all); only sequence numbers above the highest already delivered reach the
//! handler, in increasing order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capdata::{CapData, KernelCapData};
use crate::error::{KernelResult, SyscallError, SyscallResult};
use crate::kernel::keeper::KernelKeeper;
use crate::slots::{DeviceId, KRef};

use super::{device_state, unknown_method, Device, DeviceArgs, DeviceContext};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerState {
    /// Outbound messages the peer hasn't acknowledged yet.
    pub outbox: BTreeMap<u64, String>,
    /// Highest outbound seq the peer has acknowledged.
    pub outbound_ack: u64,
    /// Highest inbound seq handed to the handler.
    pub highest_inbound: u64,
    /// Our acknowledgement of the peer's messages, as set by the handler vat.
    pub inbound_ack: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MailboxState {
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<KRef>,
    peers: BTreeMap<String, PeerState>,
}

pub struct Mailbox;

impl Device for Mailbox {
    fn name(&self) -> &'static str {
        super::MAILBOX
    }

    fn invoke(
        &self,
        method: &str,
        args: &KernelCapData,
        ctx: &mut DeviceContext<'_>,
    ) -> SyscallResult<KernelCapData> {
        let a = DeviceArgs::parse(method, args)?;
        let mut state: MailboxState = ctx.load_state()?;
        match method {
            "registerInboundHandler" => {
                if state.handler.is_some() {
                    return Err(SyscallError::DuplicateHandler("mailbox inbound handler".into()).into());
                }
                let handler = a.slot(0)?;
                ctx.retain(handler)?;
                state.handler = Some(handler);
            }
            "add" => {
                let (peer, seq, body) = (a.str(0)?, a.u64(1)?, a.str(2)?);
                let p = state.peers.entry(peer.to_string()).or_default();
                if seq > p.outbound_ack && !p.outbox.contains_key(&seq) {
                    p.outbox.insert(seq, body.to_string());
                }
            }
            "remove" => {
                let (peer, seq) = (a.str(0)?, a.u64(1)?);
                if let Some(p) = state.peers.get_mut(peer) {
                    p.outbox.remove(&seq);
                }
            }
            "ackInbound" => {
                let (peer, seq) = (a.str(0)?, a.u64(1)?);
                apply_outbound_ack(state.peers.entry(peer.to_string()).or_default(), seq);
            }
            "setAcknum" => {
                let (peer, seq) = (a.str(0)?, a.u64(1)?);
                state.peers.entry(peer.to_string()).or_default().inbound_ack = seq;
            }
            other => return Err(unknown_method(self.name(), other).into()),
        }
        ctx.save_state(&state)?;
        Ok(CapData::null())
    }
}

/// Prune the outbox through `ack`. False if the ack is old news.
fn apply_outbound_ack(peer: &mut PeerState, ack: u64) -> bool {
    if ack <= peer.outbound_ack {
        return false;
    }
    peer.outbound_ack = ack;
    peer.outbox = match ack.checked_add(1) {
        Some(next) => peer.outbox.split_off(&next),
        None => BTreeMap::new(),
    };
    true
}

impl Mailbox {
    /// Host input from `peer`: messages (possibly repeated) plus the peer's
    /// acknowledgement of our outbound traffic. Returns whether anything was
    /// queued to the handler.
    pub fn deliver_inbound(
        ctx: &mut DeviceContext<'_>,
        peer: &str,
        messages: &[(u64, String)],
        ack: u64,
    ) -> KernelResult<bool> {
        let mut state: MailboxState = ctx.load_state()?;
        let handler = state.handler;
        let p = state.peers.entry(peer.to_string()).or_default();
        let acked = apply_outbound_ack(p, ack);
        let Some(handler) = handler else {
            tracing::warn!("mailbox input from {peer} with no inbound handler; messages ignored");
            ctx.save_state(&state)?;
            return Ok(false);
        };

        let fresh: BTreeMap<u64, &str> = messages
            .iter()
            .filter(|(seq, _)| *seq > p.highest_inbound)
            .map(|(seq, body)| (*seq, body.as_str()))
            .collect();
        let mut queued = false;
        if let Some(&highest) = fresh.keys().next_back() {
            p.highest_inbound = highest;
            let batch: Vec<_> = fresh.iter().map(|(seq, body)| json!([seq, body])).collect();
            ctx.send_only(
                handler,
                "deliverInboundMessages",
                CapData::from_json(&json!([peer, batch])),
            )?;
            queued = true;
        }

        if acked {
            ctx.send_only(
                handler,
                "deliverInboundAck",
                CapData::from_json(&json!([peer, ack])),
            )?;
            queued = true;
        }

        ctx.save_state(&state)?;
        Ok(queued)
    }

    /// A peer's pending outbound messages and our current ack for it.
    pub fn outbox(keeper: &KernelKeeper, device: DeviceId, peer: &str) -> KernelResult<(Vec<(u64, String)>, u64)> {
        let state: MailboxState = device_state(keeper, device)?;
        Ok(state
            .peers
            .get(peer)
            .map(|p| {
                (
                    p.outbox.iter().map(|(s, b)| (*s, b.clone())).collect(),
                    p.inbound_ack,
                )
            })
            .unwrap_or_default())
    }

    pub fn peer_state(keeper: &KernelKeeper, device: DeviceId, peer: &str) -> KernelResult<PeerState> {
        let state: MailboxState = device_state(keeper, device)?;
        Ok(state.peers.get(peer).cloned().unwrap_or_default())
    }
}
