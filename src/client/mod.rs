//! Outbound connections to the services of other apps.
//!
//! `ClientFleet` owns one connection entry per consumed service: a direct
//! channel when a single app provides it, or a [`RequestRouter`] when
//! several do. Callers reach services through the cloneable [`Clients`]
//! handle.

mod router;

pub use router::{route_of, string_hash, RequestRouter, Target};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use http::uri::PathAndQuery;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use serde_json::Value;
use tokio::sync::RwLock;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, ServiceCatalog};
use crate::codec::{DynamicCodec, JsonMapping};
use crate::config::{absolute, group_by_service, same_providers, AppSpec, Config};
use crate::transport::{self, TlsMaterial, TransportError};

/// How one service is reached.
#[derive(Debug, Clone)]
pub enum ConnectionEntry {
    Direct(Arc<Target>),
    Routed(Arc<RequestRouter>),
}

impl ConnectionEntry {
    fn select(&self, route: Option<&str>) -> Option<Arc<Target>> {
        match self {
            ConnectionEntry::Direct(target) if !target.is_shut_down() => Some(target.clone()),
            ConnectionEntry::Direct(_) => None,
            ConnectionEntry::Routed(router) => router.select(route),
        }
    }

    fn targets(&self) -> Vec<Arc<Target>> {
        match self {
            ConnectionEntry::Direct(target) => vec![target.clone()],
            ConnectionEntry::Routed(router) => router.targets(),
        }
    }

    fn close(&self) {
        match self {
            ConnectionEntry::Direct(target) => target.shut_down(),
            ConnectionEntry::Routed(router) => router.close(),
        }
    }
}

#[derive(Debug)]
struct ServiceEntry {
    descriptor: ServiceDescriptor,
    mapping: JsonMapping,
    connection: ConnectionEntry,
}

/// Cloneable handle to every consumed service.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    entries: Arc<RwLock<HashMap<String, Arc<ServiceEntry>>>>,
}

impl Clients {
    /// Client for a fully-qualified service name.
    pub async fn service(&self, name: &str) -> Result<ServiceClient, ClientError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::ServiceNotFound(name.to_string()))?;
        Ok(ServiceClient { entry })
    }

    /// Shorthand for `service(name)?.call(method, payload)`.
    pub async fn call(&self, service: &str, method: &str, payload: Value) -> Result<Value, Status> {
        self.service(service)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?
            .call(method, payload)
            .await
    }

    /// Names of all connected services.
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The request router of a service served by several apps.
    pub async fn router(&self, name: &str) -> Option<Arc<RequestRouter>> {
        match &self.entries.read().await.get(name)?.connection {
            ConnectionEntry::Routed(router) => Some(router.clone()),
            ConnectionEntry::Direct(_) => None,
        }
    }
}

/// Client for one service.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    entry: Arc<ServiceEntry>,
}

impl ServiceClient {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.entry.descriptor
    }

    /// Call a unary method with a JSON payload.
    ///
    /// The method may be named as declared (`Say`) or in lowerCamelCase (`say`).
    /// When the service is served by several apps, the payload's route value
    /// picks the target (see [`RequestRouter`]).
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, Status> {
        let method = self.method(method)?;
        let target = self
            .entry
            .connection
            .select(route_of(&payload))
            .ok_or_else(|| {
                Status::unavailable(format!(
                    "No live target for service '{}'",
                    self.entry.descriptor.full_name()
                ))
            })?;

        let request = self.entry.mapping.from_json(method.input(), payload)?;
        let path = PathAndQuery::try_from(format!(
            "/{}/{}",
            self.entry.descriptor.full_name(),
            method.name()
        ))
        .map_err(|e| Status::internal(format!("Invalid method path: {}", e)))?;

        let mut grpc = tonic::client::Grpc::new(target.channel());
        if let Some(limit) = target.options().max_receive_message_length {
            grpc = grpc.max_decoding_message_size(limit);
        }
        if let Some(limit) = target.options().max_send_message_length {
            grpc = grpc.max_encoding_message_size(limit);
        }
        grpc.ready().await.map_err(|e| {
            Status::unavailable(format!("{} is not ready: {}", target.address(), e))
        })?;

        debug!(
            service = %self.entry.descriptor.full_name(),
            method = %method.name(),
            address = %target.address(),
            "Calling"
        );
        let response = grpc
            .unary(
                tonic::Request::new(request),
                path,
                DynamicCodec::new(method.output()),
            )
            .await?;

        self.entry.mapping.to_json(response.get_ref())
    }

    fn method(&self, name: &str) -> Result<MethodDescriptor, Status> {
        self.entry
            .descriptor
            .methods()
            .find(|m| m.name() == name || lower_first(m.name()) == name)
            .ok_or_else(|| {
                Status::unimplemented(format!(
                    "Method '{}' not found in service '{}'",
                    name,
                    self.entry.descriptor.full_name()
                ))
            })
    }
}

fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Owner of all outbound connections of one runtime.
#[derive(Debug, Default)]
pub struct ClientFleet {
    clients: Clients,
    groups: BTreeMap<String, Vec<AppSpec>>,
}

impl ClientFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit handle to the connected services.
    pub fn handle(&self) -> Clients {
        self.clients.clone()
    }

    /// Connect to every service listed by any app.
    ///
    /// On reload, services whose providers are unchanged keep their channels
    /// and only pick up the refreshed descriptors; services that vanished are
    /// dropped. Every new entry is built before any existing one is replaced,
    /// so a failing reload leaves the previous connections in place.
    pub async fn connect_all(
        &mut self,
        config: &Config,
        catalog: &ServiceCatalog,
        reload: bool,
    ) -> Result<(), ClientError> {
        let snapshot = catalog.load(&config.proto_dirs, &config.proto_options, false)?;
        let credentials = preload_credentials(config).await?;
        let groups = group_by_service(config);

        let previous = self.clients.entries.read().await.clone();
        let mut next: HashMap<String, Arc<ServiceEntry>> = HashMap::new();
        let mut rebuilt = BTreeSet::new();

        for (service, apps) in &groups {
            let descriptor = match snapshot.resolve(service) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(service = %service, error = %e, "Skipping service without interface definition");
                    continue;
                }
            };

            let unchanged = reload
                && self
                    .groups
                    .get(service)
                    .is_some_and(|before| same_providers(before, apps));
            let connection = match previous.get(service) {
                Some(entry) if unchanged => entry.connection.clone(),
                _ => match build_connection(service, apps, &credentials)? {
                    Some(connection) => {
                        rebuilt.insert(service.clone());
                        connection
                    }
                    None => continue,
                },
            };

            next.insert(
                service.clone(),
                Arc::new(ServiceEntry {
                    descriptor,
                    mapping: *snapshot.mapping(),
                    connection,
                }),
            );
        }

        let mut entries = self.clients.entries.write().await;
        for (service, entry) in entries.iter() {
            if rebuilt.contains(service) || !next.contains_key(service) {
                debug!(service = %service, "Closing connection entry");
                entry.connection.close();
            }
        }
        *entries = next;
        drop(entries);

        self.groups = groups;
        info!(
            services = self.groups.len(),
            rebuilt = rebuilt.len(),
            reload,
            "Client connections ready"
        );
        Ok(())
    }

    /// Tear down every connection entry.
    pub async fn close(&mut self) {
        let mut entries = self.clients.entries.write().await;
        for entry in entries.values() {
            entry.connection.close();
        }
        entries.clear();
        self.groups.clear();
    }

    /// Addresses of every target of a service, for diagnostics.
    pub async fn addresses(&self, service: &str) -> Vec<String> {
        self.clients
            .entries
            .read()
            .await
            .get(service)
            .map(|entry| {
                entry
                    .connection
                    .targets()
                    .iter()
                    .map(|t| t.address().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Read every cert and key referenced by any app up front.
async fn preload_credentials(config: &Config) -> Result<HashMap<PathBuf, Vec<u8>>, ClientError> {
    let mut files = HashMap::new();
    let paths: Vec<&PathBuf> = config
        .apps
        .iter()
        .flat_map(|app| app.cert.iter().chain(app.key.iter()))
        .collect();
    for path in paths {
        let path = absolute(path);
        if !files.contains_key(&path) {
            let bytes = transport::read_credential(&path).await?;
            files.insert(path, bytes);
        }
    }
    Ok(files)
}

fn build_connection(
    service: &str,
    apps: &[AppSpec],
    credentials: &HashMap<PathBuf, Vec<u8>>,
) -> Result<Option<ConnectionEntry>, ClientError> {
    let mut targets = Vec::with_capacity(apps.len());
    for app in apps {
        match build_target(app, credentials) {
            Ok(target) => targets.push(Arc::new(target)),
            Err(TransportError::UnsupportedDiscovery { app, uri }) => {
                warn!(app = %app, uri = %uri, service = %service, "Skipping discovery target");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let entry = match targets.len() {
        0 => None,
        1 => targets.pop().map(ConnectionEntry::Direct),
        _ => Some(ConnectionEntry::Routed(Arc::new(RequestRouter::new(
            service, targets,
        )))),
    };
    Ok(entry)
}

fn build_target(
    app: &AppSpec,
    credentials: &HashMap<PathBuf, Vec<u8>>,
) -> Result<Target, TransportError> {
    let address = transport::resolve_address(app)?;
    let tls = match transport::tls_paths(app)? {
        Some((cert, key)) => Some(TlsMaterial {
            cert: credentials.get(&cert).cloned().unwrap_or_default(),
            key: credentials.get(&key).cloned().unwrap_or_default(),
        }),
        None => None,
    };
    let channel = transport::connect_lazy(app, &address, tls.as_ref())?;
    Ok(Target::new(
        app.name.clone(),
        app.uri.clone(),
        address.to_string(),
        channel,
        app.transport_options(),
    ))
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Service '{0}' is not connected")]
    ServiceNotFound(String),

    #[error("Connection setup failed: {0}")]
    Connect(#[from] TransportError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
