//! Client-side routing across two apps serving the same service.

use std::collections::HashSet;

use crate::common::*;

fn two_echoes(fleet: &Fleet) -> (u16, u16) {
    let (p1, p2) = (free_port(), free_port());
    fleet.write_config(&format!(
        "  - name: echo-1\n    uri: grpc://127.0.0.1:{p1}\n    serve: true\n    services: [services.Echo]\n  - name: echo-2\n    uri: grpc://127.0.0.1:{p2}\n    serve: true\n    services: [services.Echo]\n"
    ));
    (p1, p2)
}

async fn origin(clients: &rpcfleet::Clients, payload: Value) -> String {
    let reply = clients
        .call("services.Echo", "WhoAmI", payload)
        .await
        .unwrap();
    reply["origin"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_round_robin_and_routed_calls() {
    let fleet = Fleet::new();
    let (_, p2) = two_echoes(&fleet);

    let one = fleet.runtime(echo_registry().0);
    let two = fleet.runtime(echo_registry().0);
    one.start(Some("echo-1")).await.unwrap();
    two.start(Some("echo-2")).await.unwrap();

    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();
    let clients = consumer.clients();

    let router = clients.router("services.Echo").await.unwrap();
    assert_eq!(router.live_addresses().len(), 2);

    // Without a route, consecutive calls cycle through both apps.
    let first = origin(&clients, json!({})).await;
    let second = origin(&clients, json!({})).await;
    let third = origin(&clients, json!({})).await;
    assert_ne!(first, second);
    assert_eq!(first, third);
    let seen: HashSet<_> = [first, second].into_iter().collect();
    assert_eq!(seen, HashSet::from(["echo-1".to_string(), "echo-2".to_string()]));

    // An app name or address as route pins the target.
    for _ in 0..3 {
        assert_eq!(origin(&clients, json!({"route": "echo-2"})).await, "echo-2");
        assert_eq!(
            origin(&clients, json!({"route": format!("127.0.0.1:{}", p2)})).await,
            "echo-2"
        );
    }

    // Any other route hashes to a stable target.
    let pinned = origin(&clients, json!({"route": "user-42"})).await;
    for _ in 0..3 {
        assert_eq!(origin(&clients, json!({"route": "user-42"})).await, pinned);
    }

    consumer.stop().await.unwrap();
    two.stop().await.unwrap();
    one.stop().await.unwrap();
}

#[tokio::test]
async fn test_removed_target_is_skipped() {
    let fleet = Fleet::new();
    let (p1, _) = two_echoes(&fleet);

    let one = fleet.runtime(echo_registry().0);
    let two = fleet.runtime(echo_registry().0);
    one.start(Some("echo-1")).await.unwrap();
    two.start(Some("echo-2")).await.unwrap();

    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();
    let clients = consumer.clients();

    let router = clients.router("services.Echo").await.unwrap();
    assert!(router.remove_target(&format!("127.0.0.1:{}", p1)));
    assert_eq!(router.live_addresses().len(), 1);
    for _ in 0..4 {
        assert_eq!(origin(&clients, json!({})).await, "echo-2");
    }

    consumer.stop().await.unwrap();
    two.stop().await.unwrap();
    one.stop().await.unwrap();
}
