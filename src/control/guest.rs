//! Guest side of the control channel: sign-in and command execution.

use std::sync::atomic::Ordering;
use std::sync::Weak;

use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::{spawn_writer, Outbound, OutboundTx};
use super::protocol::{self, Command, Message, Reply};
use super::{ControlError, PlaneInner};

/// This process's own connection to the host.
pub(crate) struct Guest {
    tx: OutboundTx,
    reader: JoinHandle<()>,
}

impl Guest {
    /// Send `connect`, wait for the host's acknowledgement, then start
    /// serving relayed commands.
    pub(crate) async fn sign_in(
        plane: Weak<PlaneInner>,
        stream: UnixStream,
    ) -> Result<Self, ControlError> {
        let (app, timeout) = match plane.upgrade() {
            Some(inner) => (inner.app.clone(), inner.command_timeout),
            None => return Err(ControlError::Rejected("control plane dropped".to_string())),
        };

        let (mut reader, writer) = stream.into_split();
        let (tx, _writer) = spawn_writer(writer);
        let _ = tx.send(Outbound::Frame(Message::Connect { app }));

        let ack = tokio::time::timeout(timeout, protocol::read_message(&mut reader))
            .await
            .map_err(|_| ControlError::Timeout(timeout))??;
        match ack {
            Some(Message::Reply(Reply { error: None, .. })) => {}
            Some(Message::Reply(Reply {
                error: Some(reason),
                ..
            })) => {
                let _ = tx.send(Outbound::Close);
                return Err(ControlError::Rejected(reason));
            }
            other => {
                let _ = tx.send(Outbound::Close);
                return Err(ControlError::Rejected(format!(
                    "unexpected answer to connect: {:?}",
                    other
                )));
            }
        }

        let reader = tokio::spawn(serve(plane, reader, tx.clone()));
        Ok(Self { tx, reader })
    }

    /// Drop the connection immediately.
    pub(crate) fn close(self) {
        self.reader.abort();
        let _ = self.tx.send(Outbound::Close);
    }

    /// Forget the handle without stopping the reader task.
    pub(crate) fn detach(self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

async fn serve(plane: Weak<PlaneInner>, mut reader: OwnedReadHalf, tx: OutboundTx) {
    loop {
        let message = match protocol::read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Control connection to host failed");
                break;
            }
        };

        let Some((command, _, msg_id)) = message.as_command() else {
            debug!(message = ?message, "Ignoring message from host");
            continue;
        };
        let msg_id = msg_id.map(str::to_string);

        let Some(inner) = plane.upgrade() else {
            return;
        };
        let Some(handler) = inner.handler() else {
            return;
        };

        info!(command = %command, "Received control command");
        let reply = match handler.handle(command).await {
            Ok(result) => Reply::ok(msg_id, result),
            Err(error) => Reply::error(msg_id, error),
        };
        let _ = tx.send(Outbound::Frame(Message::Reply(reply)));

        if command == Command::Stop {
            inner.left.store(true, Ordering::SeqCst);
            let _ = tx.send(Outbound::Close);
            // The host closes its side once it has seen ours close.
            let _ = tokio::time::timeout(inner.command_timeout, drain(&mut reader)).await;
            inner.finish_remote_stop().await;
            handler.left().await;
            return;
        }
    }

    let Some(inner) = plane.upgrade() else {
        return;
    };
    if inner.has_left() {
        return;
    }
    let hosting = inner.state.lock().await.host.is_some();
    if hosting {
        return;
    }
    warn!("Lost connection to control host, rejoining");
    PlaneInner::spawn_rejoin(inner);
}

async fn drain(reader: &mut OwnedReadHalf) {
    while let Ok(Some(_)) = protocol::read_message(reader).await {}
}
