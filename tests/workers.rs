//! Resident worker cap: evicted vats come back through transcript replay.

mod common;

use common::*;
use serde_json::json;
use vatkernel::KernelConfig;

#[tokio::test]
async fn evicted_vat_is_rebuilt_on_demand() {
    let config = KernelConfig {
        max_vats_online: 2,
        ..KernelConfig::in_memory()
    };
    let mut h = Harness::new(config);
    let alice = h.vat("alice").await;
    let a = h.root(alice);
    h.send(a, "store", json!(["k", "v"]), vec![]);
    h.kernel.run().await.unwrap();

    let bob = h.vat("bob").await;
    let carol = h.vat("carol").await;
    assert_eq!(h.kernel.online_vats(), vec![bob, carol]);

    let kp = h.send(a, "load", json!(["k"]), vec![]);
    h.kernel.run().await.unwrap();
    assert_eq!(h.resolution(kp), (false, r#""v""#.to_string()));
    assert!(h.kernel.is_vat_alive(alice).unwrap());

    // alice is back, so bob (least recently used) made room.
    assert_eq!(h.kernel.online_vats(), vec![alice, carol]);

    // Replay happened in a fresh worker: alice's log shows her earlier
    // deliveries twice.
    let stores = h
        .messages("alice")
        .into_iter()
        .filter(|(m, _)| m == "store")
        .count();
    assert_eq!(stores, 2);
}
