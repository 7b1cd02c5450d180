use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::local_channel::ChannelError;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;
const FRAME_HEADER_BYTES: usize = 4;

/// Messages carried on the readiness channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    RequestServerInfo,
    ServerReady {
        port: u16,
        root_url: String,
    },
    #[serde(other)]
    Unknown,
}

/// Messages carried on the single-instance control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ShowUi,
    #[serde(other)]
    Unknown,
}

/// Writes one length-prefixed JSON frame: a big-endian `u32` byte count, then the body.
pub fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ChannelError>
where
    W: Write,
    M: Serialize,
{
    let body = serde_json::to_vec(message)
        .map_err(|error| ChannelError::Malformed(format!("encode failed: {error}")))?;
    if body.is_empty() || body.len() > MAX_FRAME_BYTES {
        return Err(ChannelError::Malformed(format!(
            "frame of {} bytes is out of bounds",
            body.len()
        )));
    }
    let header = (body.len() as u32).to_be_bytes();
    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(ChannelError::from_io)
}

/// Reads exactly one frame and decodes it.
///
/// A clean EOF before the header is `Disconnected`; EOF inside a frame is also
/// `Disconnected` because the peer vanished mid-message.
pub fn read_message<R, M>(reader: &mut R) -> Result<M, ChannelError>
where
    R: Read,
    M: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_BYTES];
    reader.read_exact(&mut header).map_err(ChannelError::from_io)?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(ChannelError::Malformed(format!(
            "frame length {len} is out of bounds"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(ChannelError::from_io)?;
    serde_json::from_slice(&body)
        .map_err(|error| ChannelError::Malformed(format!("invalid message body: {error}")))
}

pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
