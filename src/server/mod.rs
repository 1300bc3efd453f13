//! Listener lifecycle for the app this runtime serves.
//!
//! `bind` validates the app, decides whether the listener must be rebuilt,
//! re-registers every service implementation and starts the listener when
//! needed. Everything that can fail on bad configuration (credentials,
//! addresses, interface resolution) is checked before any running state is
//! torn down.

mod dispatch;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use prost_reflect::ServiceDescriptor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{error, info, warn};

use crate::catalog::{CatalogError, ServiceCatalog};
use crate::codec::JsonMapping;
use crate::config::{AppSpec, Config, ConfigError, TransportOptions};
use crate::service::{HookError, ImplementationRegistry, RpcService, ServiceContext};
use crate::transport::{self, Address, BoundListener, TlsMaterial, TransportError};

use dispatch::{DynamicDispatch, RegistrationTable};

/// Time a closing listener gets to drain before its task is aborted.
const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// A service bound to the listener.
pub struct ServiceRegistration {
    pub name: String,
    pub descriptor: ServiceDescriptor,
    pub instance: Arc<dyn RpcService>,
    pub mapping: JsonMapping,
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of a successful bind.
#[derive(Debug, Default)]
pub struct BindOutcome {
    /// A fresh listener was started.
    pub new_listener: bool,
    /// Destroy hooks that failed while replacing the previous registrations.
    pub hook_errors: Vec<(String, HookError)>,
}

struct RunningListener {
    uri: String,
    options: TransportOptions,
    tls: Option<TlsMaterial>,
    address: Address,
    health: HealthReporter,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RunningListener {
    async fn force_close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(FORCE_CLOSE_GRACE, &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
            let _ = self.task.await;
        }
        info!(address = %self.address, "Listener closed");
    }
}

/// Owns the listening endpoint and service registrations of one app.
pub struct ServerLifecycle {
    catalog: Arc<ServiceCatalog>,
    implementations: Arc<ImplementationRegistry>,
    table: RegistrationTable,
    app_name: Option<String>,
    listener: Option<RunningListener>,
}

impl ServerLifecycle {
    pub fn new(catalog: Arc<ServiceCatalog>, implementations: Arc<ImplementationRegistry>) -> Self {
        Self {
            catalog,
            implementations,
            table: Arc::new(RwLock::new(HashMap::new())),
            app_name: None,
            listener: None,
        }
    }

    /// Bind (or rebind on reload) the named app.
    pub async fn bind(
        &mut self,
        config: &Config,
        app_name: &str,
        reload: bool,
        ctx: &ServiceContext,
    ) -> Result<BindOutcome, ServerError> {
        let app = config.app(app_name)?.clone();
        if !app.serve {
            return Err(ServerError::NotServable(app.name));
        }
        if app.scheme()?.is_discovery() {
            return Err(ServerError::UnsupportedServeProtocol {
                app: app.name,
                uri: app.uri,
            });
        }

        let tls = transport::load_tls_material(&app).await?;
        let address = transport::resolve_address(&app)?;
        let options = app.transport_options();

        let new_listener = match &self.listener {
            Some(current) if reload => {
                current.tls != tls || current.uri != app.uri || current.options != options
            }
            _ => true,
        };

        let snapshot = self
            .catalog
            .load(&config.proto_dirs, &config.proto_options, false)?;
        let descriptors = app
            .services
            .iter()
            .map(|name| snapshot.resolve(name).map(|d| (name.clone(), d)))
            .collect::<Result<Vec<_>, _>>()?;

        // A listener on a different socket is bound before anything running is
        // torn down. One that reuses the current socket can only bind after it
        // has been closed.
        let mut prepared = None;
        if new_listener {
            let builder = transport::server_builder(&options, tls.as_ref())?;
            let reuses_socket = self
                .listener
                .as_ref()
                .is_some_and(|current| shares_socket(&current.address, &address));
            let socket = if reuses_socket {
                None
            } else {
                Some(bind_socket(&address).await?)
            };
            prepared = Some((builder, socket));
        }

        let mut hook_errors = Vec::new();
        if reload && !self.registrations().is_empty() {
            let names: Vec<String> = self.registrations().iter().map(|r| r.name.clone()).collect();
            hook_errors = self.unregister_all().await;
            let stale = self.implementations.invalidate(names.iter().map(String::as_str));
            info!(app = %app.name, stale = stale.len(), "Invalidated service implementations");
        }

        if new_listener {
            if let Some(previous) = self.listener.take() {
                previous.force_close().await;
            }
        }

        let mut registered = Vec::new();
        {
            let mut table = self.table.write().map_err(|_| ServerError::Poisoned)?;
            for (name, descriptor) in descriptors {
                let Some(instance) = self.implementations.instantiate(&name, ctx) else {
                    error!(service = %name, "Service is not correctly implemented; skipping");
                    continue;
                };
                table.insert(
                    name.clone(),
                    Arc::new(ServiceRegistration {
                        name: name.clone(),
                        descriptor,
                        instance,
                        mapping: *snapshot.mapping(),
                    }),
                );
                registered.push(name);
            }
        }

        if let Some((builder, socket)) = prepared {
            let socket = match socket {
                Some(socket) => socket,
                None => bind_socket(&address).await?,
            };
            self.listener = Some(self.start_listener(&app, builder, socket, address, tls));
        }

        if let Some(listener) = &self.listener {
            let mut health = listener.health.clone();
            for name in &registered {
                health
                    .set_service_status(name, ServingStatus::Serving)
                    .await;
            }
        }

        self.app_name = Some(app.name);
        Ok(BindOutcome {
            new_listener,
            hook_errors,
        })
    }

    fn start_listener(
        &self,
        app: &AppSpec,
        builder: Server,
        listener: BoundListener,
        address: Address,
        tls: Option<TlsMaterial>,
    ) -> RunningListener {
        let options = app.transport_options();
        let local = listener.local_address().unwrap_or(address);

        let (health, health_service) = tonic_health::server::health_reporter();
        let dispatch = DynamicDispatch::new(
            self.table.clone(),
            options.max_receive_message_length,
            options.max_send_message_length,
        );
        let router = Routes::new(health_service)
            .into_axum_router()
            .fallback_service(dispatch);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app_name = app.name.clone();
        let task = tokio::spawn(async move {
            let signal = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) =
                transport::serve_routes(builder, Routes::from(router), listener, signal).await
            {
                error!(app = %app_name, error = %e, "Server error");
            }
        });

        info!(app = %app.name, uri = %app.uri, address = %local, "Server listening");

        RunningListener {
            uri: app.uri.clone(),
            options,
            tls,
            address: local,
            health,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Run `init` on every registered instance, in registration order of names.
    pub async fn run_init_hooks(&self) -> Result<(), ServerError> {
        for registration in self.registrations() {
            registration
                .instance
                .init()
                .await
                .map_err(|source| ServerError::InitHook {
                    service: registration.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run `destroy` on every registered instance and unregister it.
    ///
    /// Hook failures do not stop the unregistration; they are logged and returned.
    pub async fn unregister_all(&mut self) -> Vec<(String, HookError)> {
        let mut errors = Vec::new();
        for registration in self.registrations() {
            if let Err(e) = registration.instance.destroy().await {
                error!(service = %registration.name, error = %e, "destroy() failed");
                errors.push((registration.name.clone(), e));
            }
            if let Ok(mut table) = self.table.write() {
                table.remove(&registration.name);
            }
            if let Some(listener) = &self.listener {
                let mut health = listener.health.clone();
                health
                    .set_service_status(&registration.name, ServingStatus::NotServing)
                    .await;
            }
        }
        errors
    }

    /// Destroy every registration, then force-close the listener.
    pub async fn shutdown(&mut self) -> Vec<(String, HookError)> {
        let errors = self.unregister_all().await;
        self.close().await;
        errors
    }

    /// Force-close the listener without touching registrations.
    pub async fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.force_close().await;
        }
    }

    /// Current registrations, sorted by service name.
    pub fn registrations(&self) -> Vec<Arc<ServiceRegistration>> {
        let mut registrations: Vec<_> = self
            .table
            .read()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));
        registrations
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    /// Address the listener is bound to (actual port when bound to port 0).
    pub fn address(&self) -> Option<&Address> {
        self.listener.as_ref().map(|l| &l.address)
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }
}

async fn bind_socket(address: &Address) -> Result<BoundListener, ServerError> {
    BoundListener::bind(address)
        .await
        .map_err(|e| ServerError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Whether binding `next` needs the socket currently held at `current`.
fn shares_socket(current: &Address, next: &Address) -> bool {
    match (current, next) {
        (Address::Unix(a), Address::Unix(b)) => a == b,
        (Address::Tcp(a), Address::Tcp(b)) => match (port_of(a), port_of(b)) {
            (Some(a), Some(b)) => a == b && b != 0,
            _ => a == b,
        },
        _ => false,
    }
}

fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

impl Drop for ServerLifecycle {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            warn!(address = %listener.address, "Server dropped while listening");
            listener.task.abort();
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("app [{0}] is not intended to be served")]
    NotServable(String),

    #[error("app [{app}] cannot be served since it uses '{uri}'")]
    UnsupportedServeProtocol { app: String, uri: String },

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("init() of service '{service}' failed: {source}")]
    InitHook { service: String, source: HookError },

    #[error("Registration table lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
