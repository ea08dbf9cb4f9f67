//! Wire framing for the update-distribution socket.
//!
//! Every frame is `[cmdLen:4 BE][dataLen:4 BE][cmd][payload]`. The command
//! is a short UTF-8 string (`graphics x,y,w,h`, `clear`, `text`, ...); the
//! payload carries PNG bytes or JSON depending on the command.

use crate::error::{DisplayError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Mode negotiation: the first bytes a client sends after connecting.
pub const MODE_TOKEN_LEN: usize = 11;
const COMMAND_MODE_TOKEN: &str = "commandmode";

/// Commands never reach this; it guards against a corrupt or hostile
/// header claiming a multi-gigabyte frame.
const MAX_COMMAND_LEN: u32 = 1024;
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// What a connected client wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Structured command frames (`clear`, `draw`, `text`, patches).
    Command,
    /// Rendered `graphics` patches only.
    Graphic,
}

impl ClientMode {
    /// Classify the 11-byte token a client sends on connect. Anything
    /// other than the command-mode token means a graphic client.
    pub fn from_token(token: &[u8]) -> Self {
        if token.len() == MODE_TOKEN_LEN
            && std::str::from_utf8(token)
                .map(|t| t.eq_ignore_ascii_case(COMMAND_MODE_TOKEN))
                .unwrap_or(false)
        {
            ClientMode::Command
        } else {
            ClientMode::Graphic
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    /// A rendered patch covering the given native-orientation rectangle.
    pub fn graphics(x: i32, y: i32, width: u32, height: u32, png: Vec<u8>) -> Self {
        Self::new(format!("graphics {x},{y},{width},{height}"), png)
    }

    /// Keep-alive sent when a scheduled flush has nothing to deliver.
    pub fn heartbeat() -> Self {
        Self::new("heartbeat", Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let command = self.command.as_bytes();
        let mut buf = Vec::with_capacity(8 + command.len() + self.payload.len());
        buf.extend_from_slice(&(command.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(command);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Read one frame from a stream. `Ok(None)` means the peer closed
    /// cleanly at a frame boundary.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let cmd_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if cmd_len > MAX_COMMAND_LEN {
            return Err(DisplayError::Protocol(format!(
                "command length {cmd_len} exceeds limit"
            )));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(DisplayError::Protocol(format!(
                "payload length {payload_len} exceeds limit"
            )));
        }

        let mut command = vec![0u8; cmd_len as usize];
        reader.read_exact(&mut command).await?;
        let command = String::from_utf8(command)
            .map_err(|_| DisplayError::Protocol("command is not UTF-8".into()))?;
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Frame { command, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_two_lengths_then_bodies() {
        let frame = Frame::new("clear", b"{}".to_vec());
        let bytes = frame.encode();
        assert_eq!(&bytes[0..4], &5u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_be_bytes());
        assert_eq!(&bytes[8..13], b"clear");
        assert_eq!(&bytes[13..], b"{}");
    }

    #[tokio::test]
    async fn round_trip_through_a_stream() {
        let frame = Frame::graphics(10, 20, 30, 40, vec![1, 2, 3]);
        let bytes = frame.encode();
        let mut reader = bytes.as_slice();
        let back = Frame::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(back.command, "graphics 10,20,30,40");
        assert_eq!(back.payload, vec![1, 2, 3]);
        assert!(Frame::read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_header_is_a_protocol_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2048u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = bytes.as_slice();
        assert!(matches!(
            Frame::read(&mut reader).await,
            Err(DisplayError::Protocol(_))
        ));
    }

    #[test]
    fn mode_token_matching_is_case_insensitive() {
        assert_eq!(ClientMode::from_token(b"commandmode"), ClientMode::Command);
        assert_eq!(ClientMode::from_token(b"COMMANDMODE"), ClientMode::Command);
        assert_eq!(ClientMode::from_token(b"CommandMode"), ClientMode::Command);
        assert_eq!(ClientMode::from_token(b"graphicmode"), ClientMode::Graphic);
        assert_eq!(ClientMode::from_token(b"\0\0\0\0\0\0\0\0\0\0\0"), ClientMode::Graphic);
    }
}
