//! The app runtime: one process's view of the fleet.
//!
//! `start` binds the named app (if any), connects to every consumed service,
//! joins the control channel and only then runs the `init` hooks, so an
//! instance may call its peers from `init`. `reload` re-reads the config and
//! refreshes each part in the same order; `stop` tears it all down.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::catalog::{CatalogError, ServiceCatalog};
use crate::client::{ClientError, ClientFleet, Clients};
use crate::config::{diff, Config, ConfigError};
use crate::control::{self, Command, ControlError, ControlHandler, ControlPlane, Reply, Role};
use crate::server::{ServerError, ServerLifecycle};
use crate::service::{ImplementationRegistry, ServiceContext};
use crate::transport::Address;

type Callback = Box<dyn Fn() + Send + Sync>;

/// Where the runtime reads its config from on `start` and `reload`.
#[derive(Debug, Clone)]
enum ConfigSource {
    /// A file (or the default resolution when `None`).
    File(Option<PathBuf>),
    /// A value supplied by the embedding program.
    Memory(Box<Config>),
}

impl ConfigSource {
    fn read(&self) -> Result<Config, ConfigError> {
        match self {
            ConfigSource::File(path) => Config::load(path.as_deref()),
            ConfigSource::Memory(config) => {
                config.validate()?;
                Ok((**config).clone())
            }
        }
    }
}

/// Runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime is already running")]
    AlreadyRunning,

    #[error("runtime is not running")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Handle to a running (or startable) app.
#[derive(Clone)]
pub struct AppRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    source: ConfigSource,
    catalog: Arc<ServiceCatalog>,
    clients: Clients,
    state: tokio::sync::Mutex<RuntimeState>,
    on_reload: Mutex<Vec<Callback>>,
    on_stop: Mutex<Vec<Callback>>,
    /// Set once the `on_stop` callbacks have run for the current start.
    stop_notified: AtomicBool,
    stopped: watch::Sender<bool>,
}

struct RuntimeState {
    running: bool,
    app_name: Option<String>,
    config: Option<Config>,
    server: ServerLifecycle,
    fleet: ClientFleet,
    control: Option<ControlPlane>,
}

impl AppRuntime {
    /// Runtime reading its config from `config_path`, or from the default
    /// locations when `None`.
    pub fn new(config_path: Option<&Path>, implementations: Arc<ImplementationRegistry>) -> Self {
        Self::from_source(
            ConfigSource::File(config_path.map(Path::to_path_buf)),
            implementations,
        )
    }

    /// Runtime over an in-memory config; `reload` re-applies the same value.
    pub fn with_config(config: Config, implementations: Arc<ImplementationRegistry>) -> Self {
        Self::from_source(ConfigSource::Memory(Box::new(config)), implementations)
    }

    fn from_source(source: ConfigSource, implementations: Arc<ImplementationRegistry>) -> Self {
        let catalog = Arc::new(ServiceCatalog::new());
        let fleet = ClientFleet::new();
        let clients = fleet.handle();
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(RuntimeInner {
                source,
                catalog: catalog.clone(),
                clients,
                state: tokio::sync::Mutex::new(RuntimeState {
                    running: false,
                    app_name: None,
                    config: None,
                    server: ServerLifecycle::new(catalog, implementations),
                    fleet,
                    control: None,
                }),
                on_reload: Mutex::new(Vec::new()),
                on_stop: Mutex::new(Vec::new()),
                stop_notified: AtomicBool::new(false),
                stopped,
            }),
        }
    }

    /// Start as `app` (serving it) or as a pure client when `None`.
    pub async fn start(&self, app: Option<&str>) -> Result<Role, RuntimeError> {
        let handler: Weak<dyn ControlHandler> =
            Arc::downgrade(&self.inner) as Weak<dyn ControlHandler>;
        self.inner.start(app, handler).await
    }

    /// Stop locally: destroy every registration, close every connection and
    /// the listener, and leave the control channel.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let control = self.inner.teardown().await?;
        if let Some(plane) = control {
            plane.leave().await;
        }
        self.inner.notify_stopped();
        Ok(())
    }

    /// Re-read the config and refresh the server, the clients and the
    /// control channel's app table.
    pub async fn reload(&self) -> Result<(), RuntimeError> {
        self.inner.reload().await
    }

    /// Register a callback run after every successful reload.
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.inner.on_reload.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Register a callback run after every stop, local or remote.
    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.inner.on_stop.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Handle to the consumed services; stays valid across reloads.
    pub fn clients(&self) -> Clients {
        self.inner.clients.clone()
    }

    pub async fn app_name(&self) -> Option<String> {
        self.inner.state.lock().await.app_name.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Address the served app listens on.
    pub async fn server_address(&self) -> Option<Address> {
        self.inner.state.lock().await.server.address().cloned()
    }

    /// Whether this process currently hosts the control channel.
    pub async fn is_host(&self) -> bool {
        let control = self.inner.state.lock().await.control.clone();
        match control {
            Some(plane) => plane.is_host().await,
            None => false,
        }
    }

    /// Resolve once the runtime has stopped, locally or by remote command.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Send `reload` or `stop` to a running fleet without joining it.
    pub async fn send_command(
        command: Command,
        app: Option<&str>,
        config_path: Option<&Path>,
    ) -> Result<Vec<Reply>, RuntimeError> {
        let config = Config::load(config_path)?;
        if let Some(name) = app {
            config.app(name)?;
        }

        // The host answers within one command timeout per relayed command.
        let timeout = config.command_timeout() * 2;
        let replies = control::send_command(&config.sock_path(), command, app, timeout).await?;
        for reply in &replies {
            match (&reply.result, &reply.error) {
                (_, Some(e)) => error!(command = %command, error = %e, "Command failed"),
                (Some(result), None) => info!(command = %command, "{}", result),
                (None, None) => {}
            }
        }
        Ok(replies)
    }

    /// Start a throwaway pure-client app, run `f` with its clients, and stop
    /// it again. Failures are logged, never returned.
    pub async fn run_snippet<F, Fut, T, E>(
        config_path: Option<&Path>,
        implementations: Arc<ImplementationRegistry>,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce(Clients) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let runtime = AppRuntime::new(config_path, implementations);
        if let Err(e) = runtime.start(None).await {
            error!(error = %e, "Snippet runtime failed to start");
            return None;
        }

        let outcome = match f(runtime.clients()).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "Snippet failed");
                None
            }
        };

        if let Err(e) = runtime.stop().await {
            error!(error = %e, "Snippet runtime failed to stop");
        }
        outcome
    }
}

impl RuntimeInner {
    async fn start(
        &self,
        app: Option<&str>,
        handler: Weak<dyn ControlHandler>,
    ) -> Result<Role, RuntimeError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(RuntimeError::AlreadyRunning);
        }

        let config = self.source.read()?;
        if let Some(name) = app {
            config.app(name)?;
        }
        self.catalog
            .load(&config.proto_dirs, &config.proto_options, false)?;

        match self.start_parts(&mut state, &config, app, handler).await {
            Ok(role) => {
                state.running = true;
                state.app_name = app.map(str::to_string);
                state.config = Some(config);
                self.stop_notified.store(false, Ordering::SeqCst);
                self.stopped.send_replace(false);
                info!(app = app.unwrap_or("-"), role = ?role, "App started");
                Ok(role)
            }
            Err(e) => {
                error!(app = app.unwrap_or("-"), error = %e, "App failed to start");
                if let Some(plane) = state.control.take() {
                    plane.leave().await;
                }
                state.server.shutdown().await;
                state.fleet.close().await;
                Err(e)
            }
        }
    }

    async fn start_parts(
        &self,
        state: &mut RuntimeState,
        config: &Config,
        app: Option<&str>,
        handler: Weak<dyn ControlHandler>,
    ) -> Result<Role, RuntimeError> {
        if let Some(name) = app {
            let ctx = self.context(name);
            let outcome = state.server.bind(config, name, false, &ctx).await?;
            log_hook_errors(&outcome.hook_errors);
        }

        state.fleet.connect_all(config, &self.catalog, false).await?;

        let plane = ControlPlane::new(
            config.sock_path(),
            app.map(str::to_string),
            app_names(config),
            config.command_timeout(),
            handler,
        );
        let role = plane.join().await?;
        state.control = Some(plane);

        state.server.run_init_hooks().await?;
        Ok(role)
    }

    async fn reload(&self) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock().await;
            if !state.running {
                return Err(RuntimeError::NotRunning);
            }

            // Nothing running is touched until the new config is known good.
            let config = self.source.read()?;
            let app_name = state.app_name.clone();
            if let Some(name) = &app_name {
                config.app(name)?;
            }

            let changes = state
                .config
                .as_ref()
                .map(|old| diff(old, &config, app_name.as_deref()))
                .unwrap_or_default();
            info!(
                app = app_name.as_deref().unwrap_or("-"),
                server_changed = changes.server_changed,
                affected_services = ?changes.affected_services,
                "Reloading"
            );

            self.catalog
                .load(&config.proto_dirs, &config.proto_options, true)?;

            if let Some(name) = &app_name {
                let ctx = self.context(name);
                let outcome = state.server.bind(&config, name, true, &ctx).await?;
                log_hook_errors(&outcome.hook_errors);
            }
            state.fleet.connect_all(&config, &self.catalog, true).await?;
            if let Some(plane) = &state.control {
                plane.set_apps(app_names(&config)).await;
            }
            state.server.run_init_hooks().await?;
            state.config = Some(config);
        }

        run_callbacks(&self.on_reload);
        Ok(())
    }

    /// Tear down server and clients; returns the control plane for the
    /// caller to dispose of.
    async fn teardown(&self) -> Result<Option<ControlPlane>, RuntimeError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(RuntimeError::NotRunning);
        }

        let hook_errors = state.server.shutdown().await;
        log_hook_errors(&hook_errors);
        state.fleet.close().await;
        state.running = false;

        info!(app = state.app_name.as_deref().unwrap_or("-"), "App stopped");
        Ok(state.control.take())
    }

    fn notify_stopped(&self) {
        if self.stop_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        run_callbacks(&self.on_stop);
        self.stopped.send_replace(true);
    }

    fn context(&self, app_name: &str) -> ServiceContext {
        ServiceContext {
            app_name: app_name.to_string(),
            clients: self.clients.clone(),
        }
    }

    async fn describe(&self) -> String {
        match &self.state.lock().await.app_name {
            Some(name) => format!("app [{}]", name),
            None => "clients".to_string(),
        }
    }
}

#[async_trait]
impl ControlHandler for RuntimeInner {
    async fn handle(&self, command: Command) -> Result<String, String> {
        let who = self.describe().await;
        match command {
            Command::Reload => match self.reload().await {
                Ok(()) => Ok(format!("{} reloaded", who)),
                Err(e) => {
                    warn!(error = %e, "Remote reload failed");
                    Err(e.to_string())
                }
            },
            Command::Stop => match self.teardown().await {
                // The plane leaves the channel itself once the reply is out.
                Ok(_) => Ok(format!("{} stopped", who)),
                Err(e) => Err(e.to_string()),
            },
        }
    }

    async fn left(&self) {
        self.notify_stopped();
    }
}

fn app_names(config: &Config) -> HashSet<String> {
    config.apps.iter().map(|app| app.name.clone()).collect()
}

fn log_hook_errors(errors: &[(String, crate::service::HookError)]) {
    for (service, e) in errors {
        warn!(service = %service, error = %e, "destroy() failed during rebind");
    }
}

fn run_callbacks(callbacks: &Mutex<Vec<Callback>>) {
    if let Ok(callbacks) = callbacks.lock() {
        for callback in callbacks.iter() {
            callback();
        }
    }
}
