//! End-to-end: a served echo app, a consuming app and an operator.

use crate::common::*;
use rpcfleet::runtime::RuntimeError;
use rpcfleet::server::ServerError;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

fn echo_app(port: u16) -> String {
    format!(
        "  - name: echo\n    uri: grpc://127.0.0.1:{}\n    serve: true\n    services: [services.Echo]\n",
        port
    )
}

#[tokio::test]
async fn test_consumer_calls_served_echo_and_operator_stops_it() {
    let fleet = Fleet::new();
    let port = free_port();
    fleet.write_config(&echo_app(port));

    let (registry, counts) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();
    assert_eq!(counts.inits(), 1);

    let consumer = fleet.runtime(empty_registry());
    consumer.start(None).await.unwrap();

    let reply = consumer
        .clients()
        .call("services.Echo", "Echo", json!({"v": 1}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"v": 1}));

    // lowerCamel method names are accepted too
    let reply = consumer
        .clients()
        .service("services.Echo")
        .await
        .unwrap()
        .call("whoAmI", json!({}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"origin": "echo"}));

    let replies = fleet.send(Command::Stop, Some("echo")).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].result.as_deref(), Some("app [echo] stopped"));

    tokio::time::timeout(Duration::from_secs(5), server.wait_stopped())
        .await
        .unwrap();
    assert_eq!(counts.destroys(), 1);
    assert!(!server.is_running().await);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());

    assert!(consumer
        .clients()
        .call("services.Echo", "Echo", json!({"v": 2}))
        .await
        .is_err());

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_reports_serving() {
    let fleet = Fleet::new();
    let port = free_port();
    fleet.write_config(&echo_app(port));

    let (registry, _) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();

    let channel = tonic::transport::Endpoint::from_shared(format!("http://127.0.0.1:{}", port))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut health = HealthClient::new(channel);
    let status = health
        .check(HealthCheckRequest {
            service: "services.Echo".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .status;
    assert_eq!(status, ServingStatus::Serving as i32);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let fleet = Fleet::new();
    let sock = fleet.path().join("echo.sock");
    fleet.write_config(&format!(
        "  - name: echo\n    uri: unix://{}\n    serve: true\n    services: [services.Echo]\n",
        sock.display()
    ));

    let (registry, _) = echo_registry();
    let server = fleet.runtime(registry);
    server.start(Some("echo")).await.unwrap();
    assert!(sock.exists());

    let clients = server.clients();
    assert_eq!(
        clients
            .call("services.Echo", "Echo", json!({"v": 7}))
            .await
            .unwrap(),
        json!({"v": 7})
    );
    let err = clients
        .call("services.Echo", "Shout", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unimplemented);

    server.stop().await.unwrap();
    assert!(!sock.exists());
}

#[tokio::test]
async fn test_serving_a_client_only_app_fails() {
    let fleet = Fleet::new();
    fleet.write_config(
        "  - name: remote\n    uri: grpc://127.0.0.1:1\n    services: [services.Echo]\n  - name: mesh\n    uri: xds:///echo\n    serve: true\n    services: [services.Echo]\n",
    );

    let runtime = fleet.runtime(empty_registry());
    assert!(matches!(
        runtime.start(Some("remote")).await,
        Err(RuntimeError::Server(ServerError::NotServable(_)))
    ));
    assert!(matches!(
        runtime.start(Some("mesh")).await,
        Err(RuntimeError::Server(ServerError::UnsupportedServeProtocol { .. }))
    ));
    assert!(!runtime.is_running().await);
}

#[tokio::test]
async fn test_missing_config_names_absolute_path() {
    let runtime = AppRuntime::new(Some(Path::new("nowhere/fleet.yaml")), empty_registry());
    let message = runtime.start(None).await.unwrap_err().to_string();
    let expected = std::env::current_dir().unwrap().join("nowhere/fleet.yaml");
    assert_eq!(
        message,
        format!("unable to load config file: {}", expected.display())
    );
}
