//! Control channel wire format.
//!
//! Each message is a JSON object preceded by its length as a 4-byte
//! big-endian integer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ControlError;

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Result string the host acknowledges a `connect` with.
pub const CONNECTED: &str = "connected";

/// Result string for a broadcast that found nobody to relay to.
pub const NO_APPS_RUNNING: &str = "no apps running";

/// Operator command relayed through the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Reload,
    Stop,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Reload => "reload",
            Command::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reload" => Ok(Command::Reload),
            "stop" => Ok(Command::Stop),
            other => Err(ControlError::InvalidMessage(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

/// Outcome of one command on one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(msg_id: Option<String>, result: impl Into<String>) -> Self {
        Self {
            msg_id,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(msg_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            msg_id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A control channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Message {
    /// A guest signs in, naming the app it serves (if any).
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app: Option<String>,
    },
    Reload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app: Option<String>,
        #[serde(
            default,
            rename = "msgId",
            skip_serializing_if = "Option::is_none"
        )]
        msg_id: Option<String>,
    },
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app: Option<String>,
        #[serde(
            default,
            rename = "msgId",
            skip_serializing_if = "Option::is_none"
        )]
        msg_id: Option<String>,
    },
    Reply(Reply),
}

impl Message {
    /// Build a command message.
    pub fn command(command: Command, app: Option<String>, msg_id: Option<String>) -> Self {
        match command {
            Command::Reload => Message::Reload { app, msg_id },
            Command::Stop => Message::Stop { app, msg_id },
        }
    }

    /// Split a command message into its parts.
    pub fn as_command(&self) -> Option<(Command, Option<&str>, Option<&str>)> {
        match self {
            Message::Reload { app, msg_id } => {
                Some((Command::Reload, non_empty(app), non_empty(msg_id)))
            }
            Message::Stop { app, msg_id } => Some((Command::Stop, non_empty(app), non_empty(msg_id))),
            _ => None,
        }
    }
}

/// Treat an empty string the same as an absent one.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Encode a message into a length-prefixed frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ControlError> {
    let payload =
        serde_json::to_vec(message).map_err(|e| ControlError::InvalidMessage(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ControlError::InvalidMessage(format!(
            "message of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload (length prefix already stripped).
pub fn decode(payload: &[u8]) -> Result<Message, ControlError> {
    serde_json::from_slice(payload).map_err(|_| {
        ControlError::InvalidMessage(String::from_utf8_lossy(payload).into_owned())
    })
}

/// Write one message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message, buffering partial reads until the frame is complete.
///
/// Returns `None` when the stream ends cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ControlError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ControlError::InvalidMessage(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload).map(Some)
}
