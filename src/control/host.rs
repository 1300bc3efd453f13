//! Host side of the control channel: peer table, command relay and reply
//! correlation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, non_empty, Command, Message, Reply, CONNECTED, NO_APPS_RUNNING};
use super::ControlError;

pub(crate) type ConnId = u64;

/// Frames queued for one connection's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Message),
    /// Flush everything queued so far, then close the write side.
    Close,
}

pub(crate) type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// Spawn the writer half of a connection.
pub(crate) fn spawn_writer(
    mut writer: tokio::net::unix::OwnedWriteHalf,
) -> (OutboundTx, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(message) => {
                    if let Err(e) = protocol::write_message(&mut writer, &message).await {
                        debug!(error = %e, "Control write failed");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });
    (tx, task)
}

/// A connection that signed in with `connect`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: ConnId,
    pub app: Option<String>,
}

struct Pending {
    /// Connection waiting for the reply.
    reply_to: OutboundTx,
    /// Connection the command was sent to.
    target: ConnId,
    target_app: Option<String>,
    /// Replies still outstanding for the originating request.
    remaining: Arc<AtomicUsize>,
}

#[derive(Default)]
struct HostState {
    apps: HashSet<String>,
    connections: HashMap<ConnId, OutboundTx>,
    peers: HashMap<ConnId, Option<String>>,
    pending: HashMap<String, Pending>,
    next_id: ConnId,
}

/// A running host.
pub(crate) struct Host {
    state: Arc<Mutex<HostState>>,
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl Host {
    /// Start accepting guests on a freshly bound listener.
    pub(crate) fn start(
        listener: UnixListener,
        path: &Path,
        apps: HashSet<String>,
        command_timeout: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(HostState {
            apps,
            ..Default::default()
        }));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = accept_state.clone();
                        tokio::spawn(serve_connection(state, stream, command_timeout));
                    }
                    Err(e) => {
                        warn!(error = %e, "Control accept failed");
                        break;
                    }
                }
            }
        });

        Self {
            state,
            path: path.to_path_buf(),
            accept_task,
        }
    }

    /// Replace the set of app names guests may sign in as.
    pub(crate) fn set_apps(&self, apps: HashSet<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.apps = apps;
        }
    }

    pub(crate) fn peers(&self) -> Vec<PeerInfo> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut peers: Vec<PeerInfo> = state
            .peers
            .iter()
            .map(|(id, app)| PeerInfo {
                id: *id,
                app: app.clone(),
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Wait until every relayed command has been answered or timed out.
    pub(crate) async fn settle(&self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            let idle = self.state.lock().map(|s| s.pending.is_empty()).unwrap_or(true);
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        warn!("Closing host with commands still pending");
    }

    /// Stop accepting, flush and close every connection, and remove the socket file.
    pub(crate) fn close(self) {
        self.accept_task.abort();
        if let Ok(mut state) = self.state.lock() {
            for tx in state.connections.values() {
                let _ = tx.send(Outbound::Close);
            }
            state.connections.clear();
            state.peers.clear();
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove control socket"),
        }
        info!(path = %self.path.display(), "Host closed");
    }
}

async fn serve_connection(state: Arc<Mutex<HostState>>, stream: UnixStream, timeout: Duration) {
    let (mut reader, writer) = stream.into_split();
    let (tx, _writer_task) = spawn_writer(writer);

    let Some(id) = register_connection(&state, tx.clone()) else {
        return;
    };

    loop {
        match protocol::read_message(&mut reader).await {
            Ok(Some(message)) => {
                if let Err(e) = handle_message(&state, id, &tx, message, timeout) {
                    warn!(conn = id, error = %e, "Closing control connection");
                    let _ = tx.send(Outbound::Frame(Message::Reply(Reply::error(
                        None,
                        e.to_string(),
                    ))));
                    let _ = tx.send(Outbound::Close);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if matches!(e, ControlError::InvalidMessage(_)) {
                    let _ = tx.send(Outbound::Frame(Message::Reply(Reply::error(
                        None,
                        e.to_string(),
                    ))));
                }
                debug!(conn = id, error = %e, "Control connection failed");
                break;
            }
        }
    }

    disconnect(&state, id);
}

fn register_connection(state: &Arc<Mutex<HostState>>, tx: OutboundTx) -> Option<ConnId> {
    let mut state = state.lock().ok()?;
    state.next_id += 1;
    let id = state.next_id;
    state.connections.insert(id, tx);
    Some(id)
}

fn handle_message(
    state: &Arc<Mutex<HostState>>,
    id: ConnId,
    tx: &OutboundTx,
    message: Message,
    timeout: Duration,
) -> Result<(), ControlError> {
    match message {
        Message::Connect { app } => {
            let app = non_empty(&app).map(str::to_string);
            {
                let mut state = state.lock().map_err(|_| ControlError::Poisoned)?;
                if let Some(name) = &app {
                    if !state.apps.contains(name) {
                        return Err(ControlError::InvalidAppName(name.clone()));
                    }
                    if state.peers.values().any(|peer| peer.as_ref() == Some(name)) {
                        return Err(ControlError::DuplicateApp(name.clone()));
                    }
                }
                state.peers.insert(id, app.clone());
            }
            info!(conn = id, app = app.as_deref().unwrap_or("-"), "Guest connected");
            let _ = tx.send(Outbound::Frame(Message::Reply(Reply::ok(None, CONNECTED))));
            Ok(())
        }
        Message::Reply(reply) => {
            if let Some(msg_id) = non_empty(&reply.msg_id) {
                complete(state, msg_id, reply.clone());
            }
            Ok(())
        }
        command => {
            let Some((command, app, _)) = command.as_command() else {
                return Err(ControlError::InvalidMessage(format!("{:?}", command)));
            };
            relay(state, tx, command, app, timeout)
        }
    }
}

/// Forward a command to one named peer, or to every peer.
fn relay(
    state: &Arc<Mutex<HostState>>,
    reply_to: &OutboundTx,
    command: Command,
    app: Option<&str>,
    timeout: Duration,
) -> Result<(), ControlError> {
    let mut guard = state.lock().map_err(|_| ControlError::Poisoned)?;

    let targets: Vec<(ConnId, Option<String>)> = match app {
        Some(name) => {
            let target = guard
                .peers
                .iter()
                .find(|(_, peer)| peer.as_deref() == Some(name))
                .map(|(id, peer)| (*id, peer.clone()))
                .ok_or_else(|| ControlError::AppNotRunning(name.to_string()))?;
            vec![target]
        }
        None => guard
            .peers
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect(),
    };

    info!(
        command = %command,
        app = app.unwrap_or("*"),
        peers = targets.len(),
        "Relaying command"
    );

    if targets.is_empty() {
        let _ = reply_to.send(Outbound::Frame(Message::Reply(Reply::ok(None, NO_APPS_RUNNING))));
        let _ = reply_to.send(Outbound::Close);
        return Ok(());
    }

    let remaining = Arc::new(AtomicUsize::new(targets.len()));
    let mut ids = Vec::with_capacity(targets.len());
    for (target, target_app) in targets {
        let msg_id = uuid::Uuid::new_v4().simple().to_string();
        let Some(peer_tx) = guard.connections.get(&target).cloned() else {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = reply_to.send(Outbound::Close);
            }
            continue;
        };
        guard.pending.insert(
            msg_id.clone(),
            Pending {
                reply_to: reply_to.clone(),
                target,
                target_app,
                remaining: remaining.clone(),
            },
        );
        let _ = peer_tx.send(Outbound::Frame(Message::command(
            command,
            None,
            Some(msg_id.clone()),
        )));
        ids.push(msg_id);
    }
    drop(guard);

    for msg_id in ids {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let app = state
                .lock()
                .ok()
                .and_then(|s| s.pending.get(&msg_id).map(|p| p.target_app.clone()));
            if let Some(app) = app {
                let who = app.map(|a| format!("app [{}]", a)).unwrap_or_else(|| "peer".to_string());
                warn!(msg_id = %msg_id, "Command timed out");
                complete(
                    &state,
                    &msg_id,
                    Reply::error(
                        Some(msg_id.clone()),
                        format!("{} did not reply within {} ms", who, timeout.as_millis()),
                    ),
                );
            }
        });
    }

    Ok(())
}

/// Deliver a reply for a pending command and close the requester once every
/// reply it waits for has arrived.
fn complete(state: &Arc<Mutex<HostState>>, msg_id: &str, reply: Reply) {
    let Some(pending) = state.lock().ok().and_then(|mut s| s.pending.remove(msg_id)) else {
        debug!(msg_id = %msg_id, "Reply for unknown command");
        return;
    };

    let _ = pending.reply_to.send(Outbound::Frame(Message::Reply(reply)));
    if pending.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        let _ = pending.reply_to.send(Outbound::Close);
    }
}

/// Forget a connection and fail every command still waiting on it.
fn disconnect(state: &Arc<Mutex<HostState>>, id: ConnId) {
    let orphaned: Vec<(String, Option<String>)> = {
        let Ok(mut state) = state.lock() else {
            return;
        };
        if let Some(tx) = state.connections.remove(&id) {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(app) = state.peers.remove(&id) {
            debug!(conn = id, app = app.as_deref().unwrap_or("-"), "Guest disconnected");
        }
        state
            .pending
            .iter()
            .filter(|(_, pending)| pending.target == id)
            .map(|(msg_id, pending)| (msg_id.clone(), pending.target_app.clone()))
            .collect()
    };

    for (msg_id, app) in orphaned {
        let who = app.map(|a| format!("app [{}]", a)).unwrap_or_else(|| "peer".to_string());
        warn!(msg_id = %msg_id, "Peer disconnected with a pending command");
        complete(
            state,
            &msg_id,
            Reply::error(Some(msg_id.clone()), format!("{} disconnected", who)),
        );
    }
}
