//! Message delivery between vats: c-list remapping, result promises,
//! promise queues, and rejections for undeliverable sends.

mod common;

use common::*;
use serde_json::json;
use vatkernel::{PromiseState, VRef, VatDelivery};

#[tokio::test]
async fn send_is_remapped_and_result_notifies_sender() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let bob = h.vat("bob").await;
    let alice_root = h.root(alice);
    let bob_root = h.root(bob);

    let kp = h.send(alice_root, "relay", json!([{"@slot": 0}, "echo"]), vec![bob_root]);

    // crank 1: alice relays; crank 2: bob gets the message.
    assert!(h.kernel.step().await.unwrap());
    assert!(h.messages("bob").is_empty());
    assert!(h.kernel.step().await.unwrap());
    let (method, bob_args) = h.messages("bob").pop().unwrap();
    assert_eq!(method, "echo");
    assert_eq!(bob_args.body, r#"{"@slot":0}"#);
    assert_eq!(bob_args.slots, vec![VRef::import(1)]);

    // Same kernel object on both sides.
    let alice_export = h
        .kernel
        .clist_entries(alice)
        .unwrap()
        .into_iter()
        .find(|e| e.vref == VRef::export(1))
        .unwrap();
    let bob_import = h
        .kernel
        .clist_entries(bob)
        .unwrap()
        .into_iter()
        .find(|e| e.vref == VRef::import(1))
        .unwrap();
    assert_eq!(alice_export.kref, bob_import.kref);

    h.kernel.run().await.unwrap();

    // Bob's answer comes back to alice as a notify, slots mapped home again.
    let notify = h
        .deliveries("alice")
        .into_iter()
        .find_map(|d| match d {
            VatDelivery::Notify { resolutions } => Some(resolutions),
            _ => None,
        })
        .unwrap();
    assert_eq!(notify.len(), 1);
    assert_eq!(notify[0].vpid, VRef::local_promise(1));
    assert!(!notify[0].rejected);
    assert_eq!(notify[0].data.slots, vec![VRef::export(1)]);

    // Alice forgets the settled promise.
    assert!(!h
        .kernel
        .clist_entries(alice)
        .unwrap()
        .iter()
        .any(|e| e.vref == VRef::local_promise(1)));

    assert_eq!(h.kernel.kp_status(kp).unwrap(), PromiseState::Fulfilled);
    assert_eq!(h.kernel.run_queue_len().unwrap(), 0);
}

#[tokio::test]
async fn messages_to_unresolved_promise_wait_for_resolution() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let root = h.root(alice);

    let kp1 = h.send(root, "exportNew", json!([]), vec![]);
    let kp2 = h.kernel.queue_to_kref(kp1, "echo", args(json!(["queued"]), vec![])).unwrap();
    h.kernel.run().await.unwrap();

    assert_eq!(h.resolution(kp2), (false, r#"["queued"]"#.to_string()));
    let target = h
        .deliveries("alice")
        .into_iter()
        .find_map(|d| match d {
            VatDelivery::Message { target, msg } if msg.method == "echo" => Some(target),
            _ => None,
        })
        .unwrap();
    assert_eq!(target, VRef::export(1));
}

#[tokio::test]
async fn parked_messages_follow_the_resolution() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let root = h.root(alice);

    let held = h.send(root, "hold", json!([]), vec![]);
    let waiting = h.kernel.queue_to_kref(held, "echo", args(json!([]), vec![])).unwrap();
    h.kernel.run().await.unwrap();
    assert_eq!(h.kernel.kp_status(waiting).unwrap(), PromiseState::Unresolved);
    assert_eq!(h.kernel.run_queue_len().unwrap(), 0);

    // Fulfilled with a string: the parked send has nowhere to go.
    h.send(root, "release", json!([]), vec![]);
    h.kernel.run().await.unwrap();
    assert_eq!(h.resolution(held), (false, r#""released""#.to_string()));
    let (rejected, body) = h.resolution(waiting);
    assert!(rejected);
    assert!(body.contains("data is not callable"), "{body}");
}

#[tokio::test]
async fn sending_to_plain_data_rejects() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let root = h.root(alice);

    let kp1 = h.send(root, "store", json!(["k", "v"]), vec![]);
    h.kernel.run().await.unwrap();
    let kp2 = h.kernel.queue_to_kref(kp1, "echo", args(json!([]), vec![])).unwrap();
    h.kernel.run().await.unwrap();

    let (rejected, body) = h.resolution(kp2);
    assert!(rejected);
    assert!(body.contains("data is not callable"), "{body}");
}

#[tokio::test]
async fn vatstore_is_per_vat() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let bob = h.vat("bob").await;
    let (a, b) = (h.root(alice), h.root(bob));

    h.send(a, "store", json!(["color", "red"]), vec![]);
    h.kernel.run().await.unwrap();
    let from_alice = h.send(a, "load", json!(["color"]), vec![]);
    let from_bob = h.send(b, "load", json!(["color"]), vec![]);
    h.kernel.run().await.unwrap();

    assert_eq!(h.resolution(from_alice), (false, r#""red""#.to_string()));
    assert_eq!(h.resolution(from_bob), (false, "null".to_string()));
}

#[tokio::test]
async fn unknown_targets_are_refused_by_the_host_api() {
    let mut h = Harness::in_memory();
    let alice = h.vat("alice").await;
    let missing = vatkernel::KRef::Object(9999);
    assert!(h.kernel.queue_to_kref(missing, "echo", args(json!([]), vec![])).is_err());
    assert!(h.kernel.queue_to_vat_root("nobody", "echo", args(json!([]), vec![])).is_err());

    // A refused call leaves no trace.
    assert_eq!(h.kernel.run_queue_len().unwrap(), 0);
    assert!(h.kernel.is_vat_alive(alice).unwrap());
    let kp = h.kernel.queue_to_vat_root("alice", "echo", args(json!([1]), vec![])).unwrap();
    h.kernel.run().await.unwrap();
    assert_eq!(h.resolution(kp), (false, "[1]".to_string()));
}
