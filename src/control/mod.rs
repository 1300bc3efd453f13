//! Control channel between the processes of a fleet.
//!
//! Processes sharing a config meet on one unix socket. The first to arrive
//! binds it and becomes the host; every process (the host included) then
//! joins as a guest over its own connection. Operators send `reload` or
//! `stop` to the host, which relays it to one named app or to every guest
//! and streams the replies back before closing the operator's connection.
//!
//! When the host goes away, remaining guests race to bind the socket again
//! and one of them takes over.

mod guest;
mod host;
pub mod protocol;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::future::BoxFuture;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::utils::retry::socket_backoff;
use guest::Guest;
use host::{spawn_writer, Host, Outbound};
pub use host::PeerInfo;
pub use protocol::{Command, Message, Reply};

/// Errors raised on the control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("app [{0}] is not defined in the config")]
    InvalidAppName(String),

    #[error("app [{0}] is already running")]
    DuplicateApp(String),

    #[error("app [{0}] is not running")]
    AppNotRunning(String),

    #[error("invalid control message: {0}")]
    InvalidMessage(String),

    #[error("cannot bind control socket {path}: {reason}")]
    Bind { path: PathBuf, reason: String },

    #[error("cannot connect to control socket {path}: {reason}")]
    Connect { path: PathBuf, reason: String },

    #[error("no fleet is listening on {0}")]
    NoHost(PathBuf),

    #[error("host rejected connection: {0}")]
    Rejected(String),

    #[error("no answer within {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("control state lock poisoned")]
    Poisoned,

    #[error("control socket I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// How this process ended up on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

/// Receiver of commands relayed to this process.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Execute a command; the returned text becomes the reply's
    /// `result` or `error`.
    async fn handle(&self, command: Command) -> Result<String, String>;

    /// Called once the process has left the channel after a remote `stop`.
    async fn left(&self);
}

/// Membership of one process in the fleet's control channel.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<PlaneInner>,
}

pub(crate) struct PlaneInner {
    sock_path: PathBuf,
    app: Option<String>,
    apps: Mutex<HashSet<String>>,
    command_timeout: Duration,
    state: tokio::sync::Mutex<PlaneState>,
    left: AtomicBool,
    handler: Weak<dyn ControlHandler>,
}

#[derive(Default)]
struct PlaneState {
    host: Option<Host>,
    guest: Option<Guest>,
}

impl ControlPlane {
    /// `apps` is the set of app names guests may sign in as when this
    /// process hosts.
    pub fn new(
        sock_path: impl Into<PathBuf>,
        app: Option<String>,
        apps: HashSet<String>,
        command_timeout: Duration,
        handler: Weak<dyn ControlHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(PlaneInner {
                sock_path: sock_path.into(),
                app,
                apps: Mutex::new(apps),
                command_timeout,
                state: tokio::sync::Mutex::new(PlaneState::default()),
                left: AtomicBool::new(false),
                handler,
            }),
        }
    }

    /// Join the channel, hosting it if nobody else does.
    pub async fn join(&self) -> Result<Role, ControlError> {
        self.inner.left.store(false, Ordering::SeqCst);
        PlaneInner::join(self.inner.clone()).await
    }

    /// Leave the channel without telling anyone; closes the host if held.
    pub async fn leave(&self) {
        self.inner.left.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if let Some(guest) = state.guest.take() {
            guest.close();
        }
        if let Some(host) = state.host.take() {
            host.close();
        }
        debug!(sock = %self.inner.sock_path.display(), "Left control channel");
    }

    /// Update the app names accepted from guests after a config reload.
    pub async fn set_apps(&self, apps: HashSet<String>) {
        if let Ok(mut current) = self.inner.apps.lock() {
            *current = apps.clone();
        }
        if let Some(host) = &self.inner.state.lock().await.host {
            host.set_apps(apps);
        }
    }

    pub async fn is_host(&self) -> bool {
        self.inner.state.lock().await.host.is_some()
    }

    pub async fn is_joined(&self) -> bool {
        self.inner.state.lock().await.guest.is_some()
    }

    /// Guests signed in with this process's host, empty when not hosting.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .state
            .lock()
            .await
            .host
            .as_ref()
            .map(Host::peers)
            .unwrap_or_default()
    }

    pub fn sock_path(&self) -> &Path {
        &self.inner.sock_path
    }
}

impl PlaneInner {
    fn handler(&self) -> Option<Arc<dyn ControlHandler>> {
        self.handler.upgrade()
    }

    fn accepted_apps(&self) -> HashSet<String> {
        self.apps.lock().map(|apps| apps.clone()).unwrap_or_default()
    }

    fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    fn join(inner: Arc<Self>) -> BoxFuture<'static, Result<Role, ControlError>> {
        Box::pin(async move {
            let mut state = inner.state.lock().await;
            if let Some(guest) = state.guest.take() {
                guest.close();
            }

            let path = inner.sock_path.clone();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ControlError::Bind {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            }

            let (stream, role) = match UnixStream::connect(&path).await {
                Ok(stream) => (stream, Role::Guest),
                Err(e) if is_absent(&e) => match bind_host(&path) {
                    Ok(listener) => {
                        let apps = inner.accepted_apps();
                        state.host = Some(Host::start(listener, &path, apps, inner.command_timeout));
                        info!(sock = %path.display(), "Hosting control channel");
                        (connect(&path).await?, Role::Host)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                        (connect_with_backoff(&path).await?, Role::Guest)
                    }
                    Err(e) => {
                        return Err(ControlError::Bind {
                            path,
                            reason: e.to_string(),
                        })
                    }
                },
                Err(e) => {
                    return Err(ControlError::Connect {
                        path,
                        reason: e.to_string(),
                    })
                }
            };

            match Guest::sign_in(Arc::downgrade(&inner), stream).await {
                Ok(guest) => {
                    state.guest = Some(guest);
                    info!(
                        app = inner.app.as_deref().unwrap_or("-"),
                        role = ?role,
                        "Joined control channel"
                    );
                    Ok(role)
                }
                Err(e) => {
                    if let Some(host) = state.host.take() {
                        host.close();
                    }
                    Err(e)
                }
            }
        })
    }

    /// Tear down after a remote `stop` was answered. Runs on the guest's own
    /// reader task, so the guest handle is detached rather than aborted.
    async fn finish_remote_stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(guest) = state.guest.take() {
            guest.detach();
        }
        if let Some(host) = state.host.take() {
            host.settle(self.command_timeout).await;
            host.close();
        }
    }

    /// Rejoin in the background after losing the host.
    fn spawn_rejoin(inner: Arc<Self>) {
        tokio::spawn(async move {
            let mut backoff = crate::utils::retry::rejoin_backoff().build();
            loop {
                if inner.has_left() {
                    return;
                }
                match PlaneInner::join(inner.clone()).await {
                    Ok(role) => {
                        info!(role = ?role, "Rejoined control channel");
                        return;
                    }
                    Err(e) => match backoff.next() {
                        Some(delay) => {
                            warn!(error = %e, retry_in_ms = %delay.as_millis(), "Rejoin failed");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(error = %e, "Giving up on control channel");
                            return;
                        }
                    },
                }
            }
        });
    }
}

fn is_absent(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

/// Bind the socket, replacing a file left behind by a dead host.
fn bind_host(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

async fn connect(path: &Path) -> Result<UnixStream, ControlError> {
    UnixStream::connect(path)
        .await
        .map_err(|e| ControlError::Connect {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

async fn connect_with_backoff(path: &Path) -> Result<UnixStream, ControlError> {
    let mut backoff = socket_backoff().build();
    loop {
        match connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => match backoff.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}

/// Send one command to the fleet listening on `sock_path` and collect every
/// reply until the host closes the connection.
pub async fn send_command(
    sock_path: &Path,
    command: Command,
    app: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Reply>, ControlError> {
    let stream = UnixStream::connect(sock_path).await.map_err(|e| {
        if is_absent(&e) {
            ControlError::NoHost(sock_path.to_path_buf())
        } else {
            ControlError::Connect {
                path: sock_path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    })?;
    let (mut reader, writer) = stream.into_split();
    let (tx, _writer) = spawn_writer(writer);

    let message = Message::command(command, app.map(str::to_string), None);
    debug!(command = %command, app = app.unwrap_or("*"), "Sending control command");
    let _ = tx.send(Outbound::Frame(message));

    let mut replies = Vec::new();
    loop {
        let next = tokio::time::timeout(timeout, protocol::read_message(&mut reader))
            .await
            .map_err(|_| ControlError::Timeout(timeout))??;
        match next {
            Some(Message::Reply(reply)) => replies.push(reply),
            Some(other) => debug!(message = ?other, "Ignoring non-reply message"),
            None => break,
        }
    }
    let _ = tx.send(Outbound::Close);
    Ok(replies)
}
