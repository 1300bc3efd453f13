//! Operator commands relayed through the control channel.

use crate::common::*;

fn echo_app(port: u16) -> String {
    format!(
        "  - name: echo\n    uri: grpc://127.0.0.1:{}\n    serve: true\n    services: [services.Echo]\n",
        port
    )
}

#[tokio::test]
async fn test_reload_all_reaches_every_process() {
    let fleet = Fleet::new();
    let port = free_port();
    fleet.write_config(&echo_app(port));

    let (registry, counts) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();
    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();
    assert!(server.is_host().await);

    let reloads = Arc::new(AtomicUsize::new(0));
    let counter = reloads.clone();
    server.on_reload(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut results: Vec<String> = fleet
        .send(Command::Reload, None)
        .await
        .into_iter()
        .map(|reply| reply.result.unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec!["app [echo] reloaded", "clients reloaded"]);

    assert_eq!(reloads.load(Ordering::SeqCst), 1);
    // Every registration is replaced on reload.
    assert_eq!(counts.destroys(), 1);
    assert_eq!(counts.inits(), 2);

    // The unchanged listener kept serving throughout.
    assert_eq!(
        consumer
            .clients()
            .call("services.Echo", "Echo", json!({"v": 3}))
            .await
            .unwrap(),
        json!({"v": 3})
    );

    consumer.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_state() {
    let fleet = Fleet::new();
    let port = free_port();
    fleet.write_config(&echo_app(port));

    let (registry, counts) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();

    // Switch to TLS without a key: the reload must fail before anything is torn down.
    fleet.write_config(&format!(
        "  - name: echo\n    uri: grpcs://127.0.0.1:{}\n    serve: true\n    cert: {}\n    services: [services.Echo]\n",
        port,
        fleet.path().join("missing.crt").display()
    ));

    let replies = fleet.send(Command::Reload, Some("echo")).await;
    assert_eq!(replies.len(), 1);
    let error = replies[0].error.as_deref().unwrap();
    assert!(error.contains("key"), "unexpected error: {}", error);
    assert_eq!(counts.destroys(), 0);

    assert_eq!(
        server
            .clients()
            .call("services.Echo", "Echo", json!({"v": 4}))
            .await
            .unwrap(),
        json!({"v": 4})
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_all_stops_every_process() {
    let fleet = Fleet::new();
    fleet.write_config(&echo_app(free_port()));

    let (registry, counts) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();
    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();

    let stops = Arc::new(AtomicUsize::new(0));
    for runtime in [&server, &consumer] {
        let counter = stops.clone();
        runtime.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut results: Vec<String> = fleet
        .send(Command::Stop, None)
        .await
        .into_iter()
        .map(|reply| reply.result.unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec!["app [echo] stopped", "clients stopped"]);

    for runtime in [&server, &consumer] {
        tokio::time::timeout(Duration::from_secs(5), runtime.wait_stopped())
            .await
            .unwrap();
    }
    assert_eq!(stops.load(Ordering::SeqCst), 2);
    assert_eq!(counts.destroys(), 1);
    assert!(eventually(|| async { !fleet.path().join("fleet.sock").exists() }).await);
}

#[tokio::test]
async fn test_unknown_and_absent_apps() {
    let fleet = Fleet::new();
    fleet.write_config(&format!(
        "{}  - name: other\n    uri: grpc://127.0.0.1:{}\n    serve: true\n    services: [services.Echo]\n",
        echo_app(free_port()),
        free_port()
    ));

    let (registry, _) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();

    // Defined but not running.
    let replies = fleet.send(Command::Stop, Some("other")).await;
    assert_eq!(replies[0].error.as_deref(), Some("app [other] is not running"));
    assert!(server.is_running().await);

    // Not defined at all.
    assert!(
        AppRuntime::send_command(Command::Stop, Some("ghost"), Some(&fleet.config_path()))
            .await
            .is_err()
    );

    // A second process cannot claim the same app.
    let duplicate = fleet.runtime(echo_registry().0);
    assert!(duplicate.start(Some("echo")).await.is_err());
    assert!(!duplicate.is_running().await);

    server.stop().await.unwrap();
}
