//! Mutual TLS between a served app and its consumers.

use crate::common::*;
use rpcfleet::runtime::RuntimeError;
use rpcfleet::server::ServerError;
use rpcfleet::transport::TransportError;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/tls")
        .join(name)
}

#[tokio::test]
async fn test_grpcs_round_trip() {
    let fleet = Fleet::new();
    fleet.write_config(&format!(
        "  - name: secure\n    uri: grpcs://127.0.0.1:{}\n    serve: true\n    cert: {}\n    key: {}\n    services: [services.Echo]\n",
        free_port(),
        fixture("server.crt").display(),
        fixture("server.key").display(),
    ));

    let (registry, _) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("secure")).await.unwrap();

    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();
    assert_eq!(
        consumer
            .clients()
            .call("services.Echo", "Echo", json!({"v": 1}))
            .await
            .unwrap(),
        json!({"v": 1})
    );

    consumer.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_grpcs_without_key_is_refused() {
    let fleet = Fleet::new();
    fleet.write_config(&format!(
        "  - name: secure\n    uri: grpcs://127.0.0.1:{}\n    serve: true\n    cert: {}\n    services: [services.Echo]\n",
        free_port(),
        fixture("server.crt").display(),
    ));

    let (registry, counts) = echo_registry();
    let server = fleet.runtime(registry);
    let err = server.start(Some("secure")).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Server(ServerError::Transport(TransportError::MissingCredential { ref field, .. }))
            if *field == "key"
    ));
    assert_eq!(counts.inits(), 0);
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_unreadable_certificate_is_refused() {
    let fleet = Fleet::new();
    fleet.write_config(&format!(
        "  - name: secure\n    uri: https://127.0.0.1:{}\n    serve: true\n    cert: {}\n    key: {}\n    services: [services.Echo]\n",
        free_port(),
        fleet.path().join("absent.crt").display(),
        fixture("server.key").display(),
    ));

    let server = fleet.runtime(echo_registry().0);
    assert!(matches!(
        server.start(Some("secure")).await,
        Err(RuntimeError::Server(ServerError::Transport(TransportError::Credential { .. })))
    ));
}
