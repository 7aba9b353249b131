//! Timer device — one-shot wakeups and repeaters, driven by host polls.
//!
//! The kernel has no clock. The host calls `poll(now)`; every wakeup due at or
//! before `now` gets `wake(time)` queued to its handler. Time only moves
//! forward: a poll with an earlier time is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capdata::{CapData, KernelCapData};
use crate::error::{KernelResult, SyscallError, SyscallResult};
use crate::kernel::keeper::KernelKeeper;
use crate::slots::{DeviceId, KRef};

use super::{device_state, unknown_method, Device, DeviceArgs, DeviceContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Repeater {
    delay: u64,
    interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<KRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TimerState {
    now: u64,
    wakeups: BTreeMap<u64, Vec<KRef>>,
    repeaters: Vec<Option<Repeater>>,
}

pub struct Timer;

fn repeater_index(a: &DeviceArgs<'_>, state: &TimerState) -> Result<usize, SyscallError> {
    let index = a.u64(0)?;
    usize::try_from(index)
        .ok()
        .filter(|i| matches!(state.repeaters.get(*i), Some(Some(_))))
        .ok_or_else(|| SyscallError::Device(format!("no repeater {index}")))
}

impl Device for Timer {
    fn name(&self) -> &'static str {
        super::TIMER
    }

    fn invoke(
        &self,
        method: &str,
        args: &KernelCapData,
        ctx: &mut DeviceContext<'_>,
    ) -> SyscallResult<KernelCapData> {
        let a = DeviceArgs::parse(method, args)?;
        let mut state: TimerState = ctx.load_state()?;
        let result = match method {
            "setWakeup" => {
                let (when, handler) = (a.u64(0)?, a.slot(1)?);
                ctx.retain(handler)?;
                state.wakeups.entry(when).or_default().push(handler);
                json!(when)
            }
            "removeWakeup" => {
                let handler = a.slot(0)?;
                let mut removed = Vec::new();
                for (when, handlers) in state.wakeups.iter_mut() {
                    let before = handlers.len();
                    handlers.retain(|h| *h != handler);
                    for _ in handlers.len()..before {
                        removed.push(*when);
                    }
                }
                state.wakeups.retain(|_, handlers| !handlers.is_empty());
                for _ in &removed {
                    ctx.release(handler)?;
                }
                json!(removed)
            }
            "makeRepeater" => {
                let (delay, interval) = (a.u64(0)?, a.u64(1)?);
                if interval == 0 {
                    return Err(SyscallError::Device("repeater interval must be positive".into()).into());
                }
                state.repeaters.push(Some(Repeater {
                    delay,
                    interval,
                    handler: None,
                    next: None,
                }));
                json!(state.repeaters.len() - 1)
            }
            "schedule" => {
                let index = repeater_index(&a, &state)?;
                let handler = a.slot(1)?;
                let now = state.now;
                let Some(Some(r)) = state.repeaters.get_mut(index) else {
                    return Err(SyscallError::Device(format!("no repeater {index}")).into());
                };
                ctx.retain(handler)?;
                if let Some(old) = r.handler.replace(handler) {
                    ctx.release(old)?;
                }
                let next = now + if r.delay > 0 { r.delay } else { r.interval };
                r.next = Some(next);
                json!(next)
            }
            "deleteRepeater" => {
                let index = repeater_index(&a, &state)?;
                if let Some(Some(r)) = state.repeaters.get_mut(index).map(Option::take) {
                    if let Some(handler) = r.handler {
                        ctx.release(handler)?;
                    }
                }
                Value::Null
            }
            "getLastPolled" => json!(state.now),
            other => return Err(unknown_method(self.name(), other).into()),
        };
        ctx.save_state(&state)?;
        Ok(CapData::from_json(&result))
    }
}

impl Timer {
    /// Advance time to `now` and queue `wake` for everything due. Returns how
    /// many wakeups fired.
    pub fn poll(ctx: &mut DeviceContext<'_>, now: u64) -> KernelResult<usize> {
        let mut state: TimerState = ctx.load_state()?;
        if now < state.now {
            tracing::debug!("timer poll at {now} is before {}; ignored", state.now);
            return Ok(0);
        }
        state.now = now;

        let later = state.wakeups.split_off(&(now + 1));
        let due = std::mem::replace(&mut state.wakeups, later);
        let mut fired = 0;
        for (when, handlers) in due {
            for handler in handlers {
                ctx.send_only(handler, "wake", CapData::from_json(&json!([when])))?;
                ctx.release(handler)?;
                fired += 1;
            }
        }

        for r in state.repeaters.iter_mut().flatten() {
            let (Some(handler), Some(next)) = (r.handler, r.next) else {
                continue;
            };
            if next > now {
                continue;
            }
            ctx.send_only(handler, "wake", CapData::from_json(&json!([next])))?;
            fired += 1;
            let missed = (now - next) / r.interval + 1;
            r.next = Some(next + missed * r.interval);
        }

        ctx.save_state(&state)?;
        Ok(fired)
    }

    pub fn last_polled(keeper: &KernelKeeper, device: DeviceId) -> KernelResult<u64> {
        let state: TimerState = device_state(keeper, device)?;
        Ok(state.now)
    }

    /// Times with at least one pending one-shot wakeup.
    pub fn pending_wakeups(keeper: &KernelKeeper, device: DeviceId) -> KernelResult<Vec<u64>> {
        let state: TimerState = device_state(keeper, device)?;
        Ok(state.wakeups.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::keeper::RefCount;
    use crate::kernel::run_queue::RunQueueEvent;
    use crate::slots::VatId;
    use crate::store::Store;

    const D: DeviceId = DeviceId(2);

    fn call(k: &mut KernelKeeper, method: &str, body: Value, slots: Vec<KRef>) -> SyscallResult<KernelCapData> {
        let mut ctx = DeviceContext::new(k, D);
        Timer.invoke(method, &CapData::new(body.to_string(), slots), &mut ctx)
    }

    fn wakes(k: &mut KernelKeeper) -> Vec<(KRef, String)> {
        std::iter::from_fn(|| k.dequeue_run_queue().unwrap())
            .map(|ev| match ev {
                RunQueueEvent::Send { target, msg } => (target, msg.args.body),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn wakeups_fire_once_in_time_order() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let h = k.add_kernel_object(VatId(1)).unwrap();
        call(&mut k, "setWakeup", json!([20, {"@slot": 0}]), vec![h]).unwrap();
        call(&mut k, "setWakeup", json!([10, {"@slot": 0}]), vec![h]).unwrap();
        assert_eq!(k.object_refcount(h).unwrap().reachable, 2);

        let mut ctx = DeviceContext::new(&mut k, D);
        assert_eq!(Timer::poll(&mut ctx, 15).unwrap(), 1);
        assert_eq!(Timer::poll(&mut ctx, 5).unwrap(), 0);
        assert_eq!(Timer::poll(&mut ctx, 25).unwrap(), 1);
        assert_eq!(Timer::poll(&mut ctx, 30).unwrap(), 0);

        assert_eq!(
            wakes(&mut k),
            vec![(h, "[10]".to_string()), (h, "[20]".to_string())]
        );
        assert_eq!(Timer::last_polled(&k, D).unwrap(), 30);
        // The queued sends were taken off without delivery, so only the
        // device's holds were released.
        assert_eq!(
            k.object_refcount(h).unwrap(),
            RefCount {
                reachable: 2,
                recognizable: 2
            }
        );
    }

    #[test]
    fn remove_wakeup_releases_handler() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let h = k.add_kernel_object(VatId(1)).unwrap();
        call(&mut k, "setWakeup", json!([20, {"@slot": 0}]), vec![h]).unwrap();
        let removed = call(&mut k, "removeWakeup", json!([{"@slot": 0}]), vec![h]).unwrap();
        assert_eq!(removed.body, "[20]");
        assert_eq!(k.object_refcount(h).unwrap().reachable, 0);
        assert!(Timer::pending_wakeups(&k, D).unwrap().is_empty());
    }

    #[test]
    fn repeater_fires_every_interval() {
        let mut k = KernelKeeper::new(Store::in_memory());
        let h = k.add_kernel_object(VatId(1)).unwrap();
        let idx = call(&mut k, "makeRepeater", json!([5, 10]), vec![]).unwrap();
        assert_eq!(idx.body, "0");
        let next = call(&mut k, "schedule", json!([0, {"@slot": 0}]), vec![h]).unwrap();
        assert_eq!(next.body, "5");

        let mut ctx = DeviceContext::new(&mut k, D);
        assert_eq!(Timer::poll(&mut ctx, 4).unwrap(), 0);
        assert_eq!(Timer::poll(&mut ctx, 5).unwrap(), 1);
        assert_eq!(Timer::poll(&mut ctx, 16).unwrap(), 1);
        assert_eq!(
            wakes(&mut k),
            vec![(h, "[5]".to_string()), (h, "[15]".to_string())]
        );

        call(&mut k, "deleteRepeater", json!([0]), vec![]).unwrap();
        assert!(call(&mut k, "deleteRepeater", json!([0]), vec![]).is_err());
        assert!(call(&mut k, "makeRepeater", json!([1, 0]), vec![]).is_err());
    }
}
