//! Bus routing across connections

mod common;

use chanbridge::bus::Bus;
use chanbridge::config::{BusConfig, ReregistrationPolicy};
use chanbridge::error::BusError;
use common::{join, join_unix, within};
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn test_registered_address_receives_message() {
    let bus = Bus::new();
    let client1 = join_unix(&bus, "client-1").await;
    let client2 = join_unix(&bus, "client-2").await;

    let mut rx = client1.register("test-address-1").unwrap();
    let sender = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client2
            .message("test-address-1", &json!({"key": "any value"}))
            .unwrap();
        client2
    });

    let value: Value = within("receive", rx.receive()).await.unwrap();
    assert_eq!(value, json!({"key": "any value"}));
    drop(sender.await.unwrap());
}

#[tokio::test]
async fn test_distinct_addresses_do_not_interfere() {
    let bus = Bus::new();
    let alice = join(&bus, "alice").await;
    let bob = join(&bus, "bob").await;
    let sender = join(&bus, "sender").await;

    let (alice_rx, bob_rx) = tokio::join!(
        alice.register_exclusive("alice"),
        bob.register_exclusive("bob"),
    );
    let mut alice_rx = alice_rx.unwrap();
    let mut bob_rx = bob_rx.unwrap();

    let for_alice = json!("for alice");
    let for_bob = json!("for bob");
    let (a, b) = tokio::join!(
        sender.message_confirmed("alice", &for_alice),
        sender.message_confirmed("bob", &for_bob),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(within("alice", alice_rx.receive::<String>()).await.unwrap(), "for alice");
    assert_eq!(within("bob", bob_rx.receive::<String>()).await.unwrap(), "for bob");
    assert_eq!(bus.stats().routed, 2);
}

#[tokio::test]
async fn test_same_channel_preserves_order_per_sender() {
    let bus = Bus::new();
    let consumer = join(&bus, "consumer").await;
    let producer = join(&bus, "producer").await;
    let mut rx = consumer.register_exclusive("ordered").await.unwrap();

    for seq in 0..20 {
        producer.message_confirmed("ordered", &seq).await.unwrap();
    }
    for seq in 0..20 {
        assert_eq!(within("ordered", rx.receive::<u32>()).await.unwrap(), seq);
    }
}

#[tokio::test]
async fn test_unregistered_address_does_not_hang_or_crash() {
    let bus = Bus::new();
    let client = join(&bus, "client").await;

    // Fire-and-forget succeeds at the sender
    client.message("nobody", &json!({"key": "v"})).unwrap();
    // The confirmed variant reports the miss
    let err = within("confirmed", client.message_confirmed("nobody", &json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoRoute(ref a) if a == "nobody"));

    // Bus still routes afterwards
    let mut rx = client.register_exclusive("somebody").await.unwrap();
    client.message("somebody", &json!(42)).unwrap();
    assert_eq!(within("receive", rx.receive::<u32>()).await.unwrap(), 42);
    assert_eq!(bus.stats().missed, 2);
}

#[tokio::test]
async fn test_replace_policy_delivers_to_newest() {
    let bus = Bus::new();
    let first = join(&bus, "first").await;
    let second = join(&bus, "second").await;
    let sender = join(&bus, "sender").await;

    let mut old_rx = first.register_exclusive("svc").await.unwrap();
    let mut new_rx = second.register_exclusive("svc").await.unwrap();

    sender.message_confirmed("svc", &"hello").await.unwrap();
    assert_eq!(within("newest", new_rx.receive::<String>()).await.unwrap(), "hello");

    // The displaced registration is closed, so its holder is not left waiting
    assert!(within("displaced", old_rx.receive::<Value>()).await.is_err());
}

#[tokio::test]
async fn test_reject_policy_keeps_first() {
    let bus = Bus::with_config(BusConfig {
        reregistration: ReregistrationPolicy::Reject,
        ..Default::default()
    });
    let first = join(&bus, "first").await;
    let second = join(&bus, "second").await;
    let sender = join(&bus, "sender").await;

    let mut first_rx = first.register_exclusive("svc").await.unwrap();
    let err = second.register_exclusive("svc").await.unwrap_err();
    assert!(matches!(err, BusError::AddressInUse(ref a) if a == "svc"));

    // A plain registration is refused too; its receiver just ends
    let mut plain_rx = second.register("svc").unwrap();
    assert!(within("plain", plain_rx.receive::<Value>()).await.is_err());

    sender.message_confirmed("svc", &"still mine").await.unwrap();
    assert_eq!(
        within("first", first_rx.receive::<String>()).await.unwrap(),
        "still mine"
    );
    assert_eq!(bus.stats().rejected, 2);
}

#[tokio::test]
async fn test_closed_connection_leaves_others_routing() {
    let bus = Bus::new();
    let quitter = join(&bus, "quitter").await;
    let stayer = join(&bus, "stayer").await;
    let sender = join(&bus, "sender").await;

    let _gone_rx = quitter.register_exclusive("gone").await.unwrap();
    let mut rx = stayer.register_exclusive("here").await.unwrap();
    quitter.close();

    within("connection drop", async {
        while bus.connection_count().await > 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // The stale registration no longer delivers
    assert!(matches!(
        sender.message_confirmed("gone", &1).await,
        Err(BusError::NoRoute(_))
    ));
    sender.message_confirmed("here", &2).await.unwrap();
    assert_eq!(within("here", rx.receive::<u32>()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_bus_close_unblocks_receivers() {
    let bus = Bus::new();
    let client = join(&bus, "client").await;
    let mut rx = client.register_exclusive("a").await.unwrap();

    bus.close().await;
    assert!(within("receiver", rx.receive::<Value>()).await.is_err());
}
