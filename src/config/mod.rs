//! Fleet configuration.
//!
//! A single declarative file describes every app in the fleet: where it
//! listens, which services it serves or consumes, and how the interface
//! definitions are found. The file may be YAML or JSON; the format is
//! picked from the extension.

mod diff;

pub use diff::{diff, group_by_service, same_providers, ConfigDiff};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::transport::Scheme;

/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "RPCFLEET_CONFIG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RPCFLEET_LOG";
/// Config files probed in the working directory, in priority order.
///
/// The `.local` variants let a developer override the shared file without
/// touching it.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "fleet.local.yaml",
    "fleet.local.json",
    "fleet.yaml",
    "fleet.json",
];
/// Default control socket path (relative to the working directory).
pub const DEFAULT_SOCK_FILE: &str = "fleet.sock";
/// Default client connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 120_000;
/// Default deadline for a relayed control command in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Root configuration value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root namespace of the services (e.g. `services`).
    #[serde(default)]
    pub package: String,
    /// Directories scanned recursively for `.proto` files.
    #[serde(default)]
    pub proto_dirs: Vec<PathBuf>,
    /// Interface compilation and JSON mapping options.
    #[serde(default)]
    pub proto_options: ProtoOptions,
    /// Fleet members.
    #[serde(default)]
    pub apps: Vec<AppSpec>,
    /// Control channel socket path.
    #[serde(default)]
    pub sock_file: Option<PathBuf>,
    /// Deadline for relayed control commands, in milliseconds.
    #[serde(default)]
    pub command_timeout: Option<u64>,
}

/// One member of the fleet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Unique app name.
    pub name: String,
    /// Connection URI; the scheme selects the transport.
    pub uri: String,
    /// Whether this app hosts the listed services.
    #[serde(default)]
    pub serve: bool,
    /// Fully-qualified service names served or depended on.
    #[serde(default)]
    pub services: Vec<String>,
    /// PEM certificate path (TLS schemes).
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// PEM private key path (TLS schemes).
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Client connect timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    /// Transport options.
    #[serde(default)]
    pub options: Option<TransportOptions>,
}

impl AppSpec {
    /// Parse the URI scheme.
    pub fn scheme(&self) -> Result<Scheme, ConfigError> {
        Scheme::of(&self.uri).ok_or_else(|| ConfigError::InvalidUri {
            app: self.name.clone(),
            uri: self.uri.clone(),
        })
    }

    /// Whether the URI scheme requires TLS.
    pub fn uses_tls(&self) -> bool {
        matches!(self.scheme(), Ok(scheme) if scheme.is_tls())
    }

    /// Client connect timeout, defaulting to two minutes.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    /// Transport options, or the defaults when unset.
    pub fn transport_options(&self) -> TransportOptions {
        self.options.clone().unwrap_or_default()
    }
}

/// How 64-bit integers are rendered in JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LongEncoding {
    /// Decimal strings (lossless).
    #[default]
    String,
    /// JSON numbers.
    Number,
}

/// How enum values are rendered in JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum EnumEncoding {
    /// Value names.
    #[default]
    String,
    /// Numeric values.
    Number,
}

/// Interface compilation and JSON mapping options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtoOptions {
    /// Keep field names as written in the `.proto` file instead of lowerCamelCase.
    pub keep_case: bool,
    /// Rendering of int64/uint64 fields.
    pub longs: LongEncoding,
    /// Rendering of enum fields.
    pub enums: EnumEncoding,
    /// Emit fields that hold their default value.
    pub defaults: bool,
    /// Extra import roots for the interface compiler.
    pub include_dirs: Vec<PathBuf>,
}

/// Transport-level options shared by listeners and channels.
///
/// Unknown keys are retained so that a change to any of them is noticed
/// when comparing configurations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportOptions {
    /// Maximum decoded message size in bytes.
    pub max_receive_message_length: Option<usize>,
    /// Maximum encoded message size in bytes.
    pub max_send_message_length: Option<usize>,
    /// HTTP/2 keepalive ping interval in milliseconds.
    pub keepalive_time_ms: Option<u64>,
    /// HTTP/2 keepalive ping timeout in milliseconds.
    pub keepalive_timeout_ms: Option<u64>,
    /// Concurrent request limit (per connection on servers, per channel on clients).
    pub concurrency_limit: Option<usize>,
    /// Anything else.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Source format of a config document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Resolution order:
    /// 1. `path` argument (if provided)
    /// 2. File named by `CONFIG_ENV_VAR` (if set)
    /// 3. First existing entry of `DEFAULT_CONFIG_FILES` in the working directory
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = resolve_config_path(path);
        let abs = absolute(&path);
        debug!(path = %abs.display(), "Loading config");

        let content = std::fs::read_to_string(&abs).map_err(|e| ConfigError::Load {
            path: abs.clone(),
            reason: e.to_string(),
        })?;

        Self::parse(&content, ConfigFormat::from_path(&abs)).map_err(|e| ConfigError::Load {
            path: abs,
            reason: e.to_string(),
        })
    }

    /// Parse and validate a config document.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Config = match format {
            ConfigFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apps.is_empty() {
            return Err(ConfigError::Invalid("no apps configured".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.apps {
            if app.name.is_empty() {
                return Err(ConfigError::Invalid("app name cannot be empty".to_string()));
            }
            if !seen.insert(app.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate app name '{}'",
                    app.name
                )));
            }
            app.scheme()?;
            if app.connect_timeout == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "connectTimeout of app [{}] must be positive",
                    app.name
                )));
            }
        }

        Ok(())
    }

    /// Look up an app by name.
    pub fn app(&self, name: &str) -> Result<&AppSpec, ConfigError> {
        self.apps
            .iter()
            .find(|app| app.name == name)
            .ok_or_else(|| ConfigError::AppNotFound(name.to_string()))
    }

    /// Whether an app with this name exists.
    pub fn has_app(&self, name: &str) -> bool {
        self.apps.iter().any(|app| app.name == name)
    }

    /// Absolute control socket path.
    pub fn sock_path(&self) -> PathBuf {
        absolute(
            self.sock_file
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_SOCK_FILE)),
        )
    }

    /// Deadline for relayed control commands.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS))
    }
}

/// Pick the config file to read.
fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("fleet.yaml"))
}

/// Resolve a path against the working directory.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to load config file: {}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid uri '{uri}' for app [{app}]")]
    InvalidUri { app: String, uri: String },

    #[error("app [{0}] doesn't exist in the config file")]
    AppNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
package: services
protoDirs:
  - proto
protoOptions:
  longs: Number
  enums: String
  keepCase: true
sockFile: /tmp/fleet-test.sock
commandTimeout: 5000
apps:
  - name: echo-server
    uri: grpc://localhost:4000
    serve: true
    services:
      - services.Echo
  - name: secure-server
    uri: grpcs://localhost:4001
    serve: true
    services:
      - services.Echo
    cert: certs/server.crt
    key: certs/server.key
    connectTimeout: 5000
    options:
      maxReceiveMessageLength: 1048576
      grpc.custom: 1
"#;

    #[test]
    fn test_parse_yaml() {
        let config = Config::parse(YAML, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.package, "services");
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.proto_options.longs, LongEncoding::Number);
        assert_eq!(config.proto_options.enums, EnumEncoding::String);
        assert!(config.proto_options.keep_case);
        assert_eq!(config.command_timeout(), Duration::from_millis(5000));
        assert_eq!(config.sock_path(), PathBuf::from("/tmp/fleet-test.sock"));

        let secure = config.app("secure-server").unwrap();
        assert!(secure.uses_tls());
        assert_eq!(secure.connect_timeout(), Duration::from_millis(5000));
        let options = secure.transport_options();
        assert_eq!(options.max_receive_message_length, Some(1_048_576));
        assert_eq!(
            options.extra.get("grpc.custom"),
            Some(&serde_json::json!(1))
        );
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "package": "services",
            "protoDirs": ["proto"],
            "apps": [{ "name": "a", "uri": "grpc://localhost:4000", "services": ["services.Echo"] }]
        }"#;
        let config = Config::parse(json, ConfigFormat::Json).unwrap();
        let app = config.app("a").unwrap();
        assert!(!app.serve);
        assert_eq!(
            app.connect_timeout(),
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        );
        assert_eq!(config.proto_options.longs, LongEncoding::String);
    }

    #[test]
    fn test_rejects_unknown_encoding_name() {
        let yaml = r#"
protoOptions:
  longs: Bignum
apps:
  - name: a
    uri: grpc://localhost:4000
"#;
        assert!(matches!(
            Config::parse(yaml, ConfigFormat::Yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_app_names() {
        let yaml = r#"
apps:
  - name: a
    uri: grpc://localhost:4000
  - name: a
    uri: grpc://localhost:4001
"#;
        let err = Config::parse(yaml, ConfigFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate app name 'a'"));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let yaml = r#"
apps:
  - name: a
    uri: ftp://localhost:4000
"#;
        assert!(matches!(
            Config::parse(yaml, ConfigFormat::Yaml),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_apps() {
        assert!(matches!(
            Config::parse("package: services\n", ConfigFormat::Yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.apps.is_empty());
    }

    #[test]
    fn test_load_missing_file_names_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");

        let err = Config::load(Some(&path)).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("unable to load config file: {}", path.display())
        );
        match err {
            ConfigError::Load { path: reported, .. } => assert!(reported.is_absolute()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_app_not_found() {
        let config = Config::parse(YAML, ConfigFormat::Yaml).unwrap();
        assert!(matches!(
            config.app("nope"),
            Err(ConfigError::AppNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("fleet.json")),
            ConfigFormat::Json
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("fleet.yml")),
            ConfigFormat::Yaml
        );
    }
}
