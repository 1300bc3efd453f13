//! Shared fixtures for runtime integration tests.

pub use std::path::{Path, PathBuf};
pub use std::sync::atomic::{AtomicUsize, Ordering};
pub use std::sync::Arc;
pub use std::time::Duration;

pub use async_trait::async_trait;
pub use serde_json::{json, Value};
pub use tempfile::TempDir;
pub use tonic::Status;

pub use rpcfleet::{
    AppRuntime, Command, HookError, ImplementationRegistry, RpcService, ServiceContext,
    ServiceFactory,
};

pub const ECHO_PROTO: &str = r#"
syntax = "proto3";
package services;

message EchoMessage {
  int32 v = 1;
  string route = 2;
  string origin = 3;
}

service Echo {
  rpc Echo(EchoMessage) returns (EchoMessage);
  rpc WhoAmI(EchoMessage) returns (EchoMessage);
}
"#;

/// Lifecycle hook counters shared by every instance built by one registry.
#[derive(Debug, Default)]
pub struct HookCounts {
    pub init: AtomicUsize,
    pub destroy: AtomicUsize,
    pub calls: AtomicUsize,
}

impl HookCounts {
    pub fn inits(&self) -> usize {
        self.init.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroy.load(Ordering::SeqCst)
    }
}

/// Echoes `Echo` requests back; `WhoAmI` answers with the serving app's name.
pub struct EchoService {
    app: String,
    counts: Arc<HookCounts>,
}

#[async_trait]
impl RpcService for EchoService {
    async fn call(&self, method: &str, request: Value) -> Result<Value, Status> {
        self.counts.calls.fetch_add(1, Ordering::SeqCst);
        match method {
            "Echo" => Ok(request),
            "WhoAmI" => Ok(json!({ "origin": self.app })),
            other => Err(Status::unimplemented(other.to_string())),
        }
    }

    async fn init(&self) -> Result<(), HookError> {
        self.counts.init.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), HookError> {
        self.counts.destroy.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry providing `services.Echo`, plus the counters it reports to.
pub fn echo_registry() -> (Arc<ImplementationRegistry>, Arc<HookCounts>) {
    let counts = Arc::new(HookCounts::default());
    let registry = ImplementationRegistry::new();
    let shared = counts.clone();
    registry.register(
        "services.Echo",
        ServiceFactory::construct(move |ctx: &ServiceContext| {
            Arc::new(EchoService {
                app: ctx.app_name.clone(),
                counts: shared.clone(),
            }) as Arc<dyn RpcService>
        }),
    );
    (Arc::new(registry), counts)
}

/// Registry with no implementations, for pure clients.
pub fn empty_registry() -> Arc<ImplementationRegistry> {
    Arc::new(ImplementationRegistry::new())
}

/// A free loopback TCP port.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Temporary fleet directory with the echo interface compiled in.
pub struct Fleet {
    pub dir: TempDir,
}

impl Fleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let protos = dir.path().join("protos");
        std::fs::create_dir_all(&protos).unwrap();
        std::fs::write(protos.join("echo.proto"), ECHO_PROTO).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("fleet.yaml")
    }

    /// Write `fleet.yaml` with the given apps section (YAML list items).
    pub fn write_config(&self, apps: &str) {
        let yaml = format!(
            "package: services\nprotoDirs: [{protos}]\nsockFile: {sock}\ncommandTimeout: 2000\napps:\n{apps}",
            protos = self.path().join("protos").display(),
            sock = self.path().join("fleet.sock").display(),
            apps = apps,
        );
        std::fs::write(self.config_path(), yaml).unwrap();
    }

    pub fn runtime(&self, registry: Arc<ImplementationRegistry>) -> AppRuntime {
        AppRuntime::new(Some(&self.config_path()), registry)
    }

    pub async fn send(&self, command: Command, app: Option<&str>) -> Vec<rpcfleet::Reply> {
        AppRuntime::send_command(command, app, Some(&self.config_path()))
            .await
            .unwrap()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
