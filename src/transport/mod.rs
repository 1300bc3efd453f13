//! Transport layer for gRPC listeners and channels.
//!
//! The URI scheme of an app selects the transport:
//! - `grpc://` / `http://`: plaintext TCP (port 80 when unspecified)
//! - `grpcs://` / `https://`: TLS over TCP (port 443 when unspecified)
//! - `unix:`: Unix Domain Socket (local IPC)
//! - `xds:`: external discovery, only meaningful for consumers

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::service::Routes;
use tonic::transport::{
    Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Server, ServerTlsConfig, Uri,
};
use tower::service_fn;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{absolute, AppSpec, TransportOptions};

/// URI scheme of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Grpc,
    Http,
    Grpcs,
    Https,
    Unix,
    Xds,
}

impl Scheme {
    /// Parse the scheme prefix of a URI.
    pub fn of(uri: &str) -> Option<Self> {
        let (scheme, _) = uri.split_once(':')?;
        match scheme.to_ascii_lowercase().as_str() {
            "grpc" => Some(Scheme::Grpc),
            "http" => Some(Scheme::Http),
            "grpcs" => Some(Scheme::Grpcs),
            "https" => Some(Scheme::Https),
            "unix" => Some(Scheme::Unix),
            "xds" => Some(Scheme::Xds),
            _ => None,
        }
    }

    /// Whether the scheme requires TLS credentials.
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Grpcs | Scheme::Https)
    }

    /// Whether the scheme names an external discovery system.
    pub fn is_discovery(self) -> bool {
        matches!(self, Scheme::Xds)
    }

    fn default_port(self) -> Option<u16> {
        match self {
            Scheme::Grpc | Scheme::Http => Some(80),
            Scheme::Grpcs | Scheme::Https => Some(443),
            Scheme::Unix | Scheme::Xds => None,
        }
    }

    /// Scheme string as written in config.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Grpc => "grpc:",
            Scheme::Http => "http:",
            Scheme::Grpcs => "grpcs:",
            Scheme::Https => "https:",
            Scheme::Unix => "unix:",
            Scheme::Xds => "xds:",
        }
    }
}

/// Resolved network address of an app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// `host:port`.
    Tcp(String),
    /// Socket file.
    Unix(PathBuf),
    /// Discovery URI, passed through verbatim.
    Discovery(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => f.write_str(addr),
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
            Address::Discovery(uri) => f.write_str(uri),
        }
    }
}

/// Resolve the address an app listens on or is reached at.
pub fn resolve_address(app: &AppSpec) -> Result<Address, TransportError> {
    let scheme = Scheme::of(&app.uri).ok_or_else(|| invalid_address(app, "unknown scheme"))?;

    match scheme {
        Scheme::Xds => Ok(Address::Discovery(app.uri.clone())),
        Scheme::Unix => {
            let rest = &app.uri[scheme.as_str().len()..];
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(invalid_address(app, "missing socket path"));
            }
            Ok(Address::Unix(absolute(Path::new(path))))
        }
        _ => {
            let uri: http::Uri = app
                .uri
                .parse()
                .map_err(|e: http::uri::InvalidUri| invalid_address(app, &e.to_string()))?;
            let host = uri
                .host()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| invalid_address(app, "missing host"))?;
            let port = uri.port_u16().or(scheme.default_port()).unwrap_or(80);
            Ok(Address::Tcp(format!("{}:{}", host, port)))
        }
    }
}

fn invalid_address(app: &AppSpec, reason: &str) -> TransportError {
    TransportError::InvalidAddress {
        app: app.name.clone(),
        uri: app.uri.clone(),
        reason: reason.to_string(),
    }
}

/// PEM certificate and key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Return the cert and key paths of a TLS app, failing on whichever is missing.
///
/// Returns `None` for non-TLS schemes.
pub fn tls_paths(app: &AppSpec) -> Result<Option<(PathBuf, PathBuf)>, TransportError> {
    if !app.uses_tls() {
        return Ok(None);
    }
    let cert = app.cert.as_ref().ok_or_else(|| TransportError::MissingCredential {
        app: app.name.clone(),
        field: "cert",
    })?;
    let key = app.key.as_ref().ok_or_else(|| TransportError::MissingCredential {
        app: app.name.clone(),
        field: "key",
    })?;
    Ok(Some((absolute(cert), absolute(key))))
}

/// Read TLS material for an app.
///
/// Returns `None` for non-TLS schemes.
pub async fn load_tls_material(app: &AppSpec) -> Result<Option<TlsMaterial>, TransportError> {
    let Some((cert_path, key_path)) = tls_paths(app)? else {
        return Ok(None);
    };
    let cert = read_credential(&cert_path).await?;
    let key = read_credential(&key_path).await?;
    Ok(Some(TlsMaterial { cert, key }))
}

/// Read one credential file.
pub async fn read_credential(path: &Path) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::Credential {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// ============================================================================
// Server
// ============================================================================

/// A bound listening socket, ready to serve.
pub enum BoundListener {
    Tcp(TcpListener),
    Uds(UnixListener, UdsCleanupGuard),
}

impl BoundListener {
    /// Bind a listener at the given address.
    pub async fn bind(address: &Address) -> std::io::Result<Self> {
        match address {
            Address::Tcp(addr) => Ok(BoundListener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            Address::Unix(path) => {
                let guard = prepare_uds_socket(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(BoundListener::Uds(listener, guard))
            }
            Address::Discovery(uri) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("cannot listen on discovery address '{}'", uri),
            )),
        }
    }

    /// Actual local address (useful when binding port 0).
    pub fn local_address(&self) -> Option<Address> {
        match self {
            BoundListener::Tcp(l) => l.local_addr().ok().map(|a| Address::Tcp(a.to_string())),
            BoundListener::Uds(_, guard) => Some(Address::Unix(guard.path().to_path_buf())),
        }
    }
}

/// Build a server with the app's transport options and credentials.
pub fn server_builder(
    options: &TransportOptions,
    tls: Option<&TlsMaterial>,
) -> Result<Server, TransportError> {
    let mut builder = Server::builder();

    if let Some(tls) = tls {
        let identity = Identity::from_pem(&tls.cert, &tls.key);
        let config = ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(Certificate::from_pem(&tls.cert));
        builder = builder
            .tls_config(config)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    if let Some(ms) = options.keepalive_time_ms {
        builder = builder.http2_keepalive_interval(Some(Duration::from_millis(ms)));
    }
    if let Some(ms) = options.keepalive_timeout_ms {
        builder = builder.http2_keepalive_timeout(Some(Duration::from_millis(ms)));
    }
    if let Some(limit) = options.concurrency_limit {
        builder = builder.concurrency_limit_per_connection(limit);
    }

    Ok(builder)
}

/// Serve routes on a bound listener until the shutdown signal completes.
pub async fn serve_routes<F>(
    builder: Server,
    routes: Routes,
    listener: BoundListener,
    signal: F,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()> + Send,
{
    let router = builder.layer(grpc_trace_layer()).add_routes(routes);

    match listener {
        BoundListener::Tcp(listener) => {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                .await
        }
        BoundListener::Uds(listener, _guard) => {
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal)
                .await
        }
    }
}

/// RAII guard for cleaning up UDS socket files.
pub struct UdsCleanupGuard {
    path: PathBuf,
}

impl UdsCleanupGuard {
    /// Create a new cleanup guard for the given socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsCleanupGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up UDS socket"
                );
            } else {
                tracing::debug!(
                    path = %self.path.display(),
                    "Cleaned up UDS socket"
                );
            }
        }
    }
}

/// Prepare a UDS socket path for binding.
///
/// - Creates parent directories if needed
/// - Removes stale socket file if exists
/// - Returns a cleanup guard that removes the socket on drop
pub fn prepare_uds_socket(path: &Path) -> std::io::Result<UdsCleanupGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        info!(path = %path.display(), "Removing stale UDS socket");
        std::fs::remove_file(path)?;
    }

    Ok(UdsCleanupGuard::new(path))
}

// ============================================================================
// Client Connection
// ============================================================================

/// Open a lazily-connecting channel to an app.
///
/// No I/O happens here; the connection is established on first use and
/// re-established by the channel when it drops.
pub fn connect_lazy(
    app: &AppSpec,
    address: &Address,
    tls: Option<&TlsMaterial>,
) -> Result<Channel, TransportError> {
    let options = app.transport_options();

    match address {
        Address::Unix(path) => {
            let socket_path = path.clone();
            let endpoint = apply_endpoint_options(
                Endpoint::from_static("http://[::]:50051").connect_timeout(app.connect_timeout()),
                &options,
            );
            Ok(endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            })))
        }
        Address::Tcp(addr) => {
            let scheme = if tls.is_some() { "https" } else { "http" };
            let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, addr))
                .map_err(|e| invalid_address(app, &e.to_string()))?
                .connect_timeout(app.connect_timeout());
            endpoint = apply_endpoint_options(endpoint, &options);

            if let Some(tls) = tls {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let config = ClientTlsConfig::new()
                    .ca_certificate(Certificate::from_pem(&tls.cert))
                    .identity(Identity::from_pem(&tls.cert, &tls.key))
                    .domain_name(host.trim_start_matches('[').trim_end_matches(']'));
                endpoint = endpoint
                    .tls_config(config)
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            }

            Ok(endpoint.connect_lazy())
        }
        Address::Discovery(_) => Err(TransportError::UnsupportedDiscovery {
            app: app.name.clone(),
            uri: app.uri.clone(),
        }),
    }
}

fn apply_endpoint_options(mut endpoint: Endpoint, options: &TransportOptions) -> Endpoint {
    if let Some(ms) = options.keepalive_time_ms {
        endpoint = endpoint.http2_keep_alive_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = options.keepalive_timeout_ms {
        endpoint = endpoint.keep_alive_timeout(Duration::from_millis(ms));
    }
    if let Some(limit) = options.concurrency_limit {
        endpoint = endpoint.concurrency_limit(limit);
    }
    endpoint
}

/// Tower trace layer that extracts `x-correlation-id` from gRPC request headers.
///
/// Creates a tracing span per request with the correlation_id, enabling
/// all downstream tracing to inherit it automatically.
pub fn grpc_trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::GrpcErrorsAsFailures>,
    impl Fn(&http::Request<tonic::body::BoxBody>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_grpc().make_span_with(|request: &http::Request<tonic::body::BoxBody>| {
        let correlation_id = request
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path = request.uri().path();
        tracing::info_span!("grpc", %correlation_id, %path)
    })
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Missing '{field}' config for app [{app}]")]
    MissingCredential { app: String, field: &'static str },

    #[error("Failed to read credential file '{}': {reason}", path.display())]
    Credential { path: PathBuf, reason: String },

    #[error("Invalid address '{uri}' for app [{app}]: {reason}")]
    InvalidAddress {
        app: String,
        uri: String,
        reason: String,
    },

    #[error("app [{app}] uses discovery uri '{uri}' which requires an external resolver")]
    UnsupportedDiscovery { app: String, uri: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(uri: &str) -> AppSpec {
        AppSpec {
            name: "test".to_string(),
            uri: uri.to_string(),
            serve: true,
            services: vec![],
            cert: None,
            key: None,
            connect_timeout: None,
            options: None,
        }
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(Scheme::of("grpc://localhost"), Some(Scheme::Grpc));
        assert_eq!(Scheme::of("HTTPS://localhost"), Some(Scheme::Https));
        assert_eq!(Scheme::of("xds:///svc"), Some(Scheme::Xds));
        assert_eq!(Scheme::of("unix:/tmp/a.sock"), Some(Scheme::Unix));
        assert_eq!(Scheme::of("ftp://x"), None);
        assert_eq!(Scheme::of("localhost"), None);
    }

    #[test]
    fn test_resolve_address_default_ports() {
        assert_eq!(
            resolve_address(&app("grpc://localhost:6000")).unwrap(),
            Address::Tcp("localhost:6000".to_string())
        );
        assert_eq!(
            resolve_address(&app("grpc://localhost")).unwrap(),
            Address::Tcp("localhost:80".to_string())
        );
        assert_eq!(
            resolve_address(&app("grpcs://localhost")).unwrap(),
            Address::Tcp("localhost:443".to_string())
        );
        assert_eq!(
            resolve_address(&app("grpcs://localhost:6000")).unwrap(),
            Address::Tcp("localhost:6000".to_string())
        );
        assert_eq!(
            resolve_address(&app("http://127.0.0.1")).unwrap(),
            Address::Tcp("127.0.0.1:80".to_string())
        );
    }

    #[test]
    fn test_resolve_address_unix_and_discovery() {
        assert_eq!(
            resolve_address(&app("unix:/tmp/fleet/a.sock")).unwrap(),
            Address::Unix(PathBuf::from("/tmp/fleet/a.sock"))
        );
        assert_eq!(
            resolve_address(&app("unix:///tmp/fleet/a.sock")).unwrap(),
            Address::Unix(PathBuf::from("/tmp/fleet/a.sock"))
        );
        assert_eq!(
            resolve_address(&app("xds:///echo")).unwrap(),
            Address::Discovery("xds:///echo".to_string())
        );
        assert!(resolve_address(&app("unix:")).is_err());
    }

    #[test]
    fn test_tls_paths_names_missing_field() {
        let mut spec = app("grpcs://localhost:6000");
        match tls_paths(&spec) {
            Err(TransportError::MissingCredential { field, .. }) => assert_eq!(field, "cert"),
            other => panic!("unexpected: {other:?}"),
        }

        spec.cert = Some(PathBuf::from("server.crt"));
        match tls_paths(&spec) {
            Err(TransportError::MissingCredential { field, .. }) => assert_eq!(field, "key"),
            other => panic!("unexpected: {other:?}"),
        }

        spec.key = Some(PathBuf::from("server.key"));
        assert!(tls_paths(&spec).unwrap().is_some());
        assert!(tls_paths(&app("grpc://localhost")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_tls_material_missing_file() {
        let mut spec = app("grpcs://localhost:6000");
        spec.cert = Some(PathBuf::from("/nonexistent/server.crt"));
        spec.key = Some(PathBuf::from("/nonexistent/server.key"));
        assert!(matches!(
            load_tls_material(&spec).await,
            Err(TransportError::Credential { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_lazy_rejects_discovery() {
        let spec = app("xds:///echo");
        let address = resolve_address(&spec).unwrap();
        assert!(matches!(
            connect_lazy(&spec, &address, None),
            Err(TransportError::UnsupportedDiscovery { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_port_zero_reports_local_address() {
        let listener = BoundListener::bind(&Address::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        match listener.local_address() {
            Some(Address::Tcp(addr)) => assert!(addr.starts_with("127.0.0.1:")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_uds_cleanup_guard() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("test_cleanup.sock");

        std::fs::write(&socket_path, "test").unwrap();
        assert!(socket_path.exists());

        {
            let _guard = UdsCleanupGuard::new(&socket_path);
        }

        assert!(!socket_path.exists());
    }
}
