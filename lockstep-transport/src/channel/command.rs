//! Command and acknowledgement messages of the channel protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lockstep_core::ErrorCode;

use super::ChannelError;

/// Integer-coded command sent on the general tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelCommand {
    Shutdown = 0,
    Initialize = 1,
    RunStep = 2,
    GetDevices = 3,
    SendDevices = 4,
    None = 5,
}

impl TryFrom<u8> for ChannelCommand {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ChannelCommand::Shutdown,
            1 => ChannelCommand::Initialize,
            2 => ChannelCommand::RunStep,
            3 => ChannelCommand::GetDevices,
            4 => ChannelCommand::SendDevices,
            5 => ChannelCommand::None,
            other => {
                return Err(ChannelError::malformed("command", format!("unknown code {other}")));
            }
        })
    }
}

/// Argument of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInfo {
    Text(String),
    Float(f32),
    Int(i64),
}

const INFO_TEXT: u8 = 0;
const INFO_FLOAT: u8 = 1;
const INFO_INT: u8 = 2;

/// `{cmd, info}` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub command: ChannelCommand,
    pub info: CommandInfo,
}

impl CommandMessage {
    pub fn new(command: ChannelCommand, info: CommandInfo) -> Self {
        Self { command, info }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.command as u8);
        match &self.info {
            CommandInfo::Text(text) => {
                buf.put_u8(INFO_TEXT);
                buf.put_u32_le(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            CommandInfo::Float(value) => {
                buf.put_u8(INFO_FLOAT);
                buf.put_f32_le(*value);
            }
            CommandInfo::Int(value) => {
                buf.put_u8(INFO_INT);
                buf.put_i64_le(*value);
            }
        }
        buf.freeze()
    }

    /// # Errors
    ///
    /// - `ChannelError::Malformed` - Unknown command or info tag, or truncated message
    pub fn decode(mut buf: Bytes) -> Result<Self, ChannelError> {
        let truncated = || ChannelError::malformed("command", "truncated");
        if buf.remaining() < 2 {
            return Err(truncated());
        }
        let command = ChannelCommand::try_from(buf.get_u8())?;
        let info = match buf.get_u8() {
            INFO_TEXT => {
                if buf.remaining() < 4 {
                    return Err(truncated());
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(truncated());
                }
                let text = String::from_utf8(buf.split_to(len).to_vec())
                    .map_err(|e| ChannelError::malformed("command", e.to_string()))?;
                CommandInfo::Text(text)
            }
            INFO_FLOAT if buf.remaining() >= 4 => CommandInfo::Float(buf.get_f32_le()),
            INFO_INT if buf.remaining() >= 8 => CommandInfo::Int(buf.get_i64_le()),
            INFO_FLOAT | INFO_INT => return Err(truncated()),
            other => {
                return Err(ChannelError::malformed("command", format!("unknown info tag {other}")));
            }
        };
        if buf.has_remaining() {
            return Err(ChannelError::malformed(
                "command",
                format!("{} trailing bytes", buf.remaining()),
            ));
        }
        Ok(Self { command, info })
    }

    /// Integer argument, as carried by step and device-count commands.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Malformed` - Info is not an integer
    pub fn int(&self) -> Result<i64, ChannelError> {
        match self.info {
            CommandInfo::Int(value) => Ok(value),
            _ => Err(ChannelError::malformed(
                "command",
                format!("{:?} expects an integer argument", self.command),
            )),
        }
    }

    /// Text argument; other kinds read as empty.
    pub fn text(&self) -> &str {
        match &self.info {
            CommandInfo::Text(text) => text,
            _ => "",
        }
    }
}

/// Fixed-size reply to every command: a status code (0 is success) and one
/// integer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub code: i32,
    pub value: i64,
}

/// Encoded size of an [`Ack`].
pub const ACK_LEN: usize = 12;

impl Ack {
    pub fn ok(value: i64) -> Self {
        Self { code: 0, value }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code: i32::from(code.as_u8()),
            value: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Wire error code of a failed acknowledgement.
    pub fn error_code(&self) -> ErrorCode {
        u8::try_from(self.code).map_or(ErrorCode::Internal, ErrorCode::from_u8)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        buf.put_i32_le(self.code);
        buf.put_i64_le(self.value);
        buf.freeze()
    }

    /// # Errors
    ///
    /// - `ChannelError::Malformed` - Message is not exactly [`ACK_LEN`] bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, ChannelError> {
        if buf.len() != ACK_LEN {
            return Err(ChannelError::malformed(
                "ack",
                format!("expected {ACK_LEN} bytes, got {}", buf.len()),
            ));
        }
        Ok(Self {
            code: buf.get_i32_le(),
            value: buf.get_i64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kinds_decode() {
        for message in [
            CommandMessage::new(ChannelCommand::Initialize, CommandInfo::Text("{}".into())),
            CommandMessage::new(ChannelCommand::RunStep, CommandInfo::Int(1_000_000)),
            CommandMessage::new(ChannelCommand::None, CommandInfo::Float(0.5)),
        ] {
            assert_eq!(CommandMessage::decode(message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let err = CommandMessage::decode(Bytes::from_static(&[9, INFO_INT])).unwrap_err();
        assert!(matches!(err, ChannelError::Malformed { what: "command", .. }));
    }

    #[test]
    fn test_truncated_text_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(ChannelCommand::Shutdown as u8);
        buf.put_u8(INFO_TEXT);
        buf.put_u32_le(10);
        buf.put_slice(b"abc");
        assert!(CommandMessage::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_ack_is_fixed_size() {
        let ack = Ack::error(ErrorCode::OutOfOrder);
        let encoded = ack.encode();
        assert_eq!(encoded.len(), ACK_LEN);

        let decoded = Ack::decode(encoded).unwrap();
        assert!(!decoded.is_ok());
        assert_eq!(decoded.error_code(), ErrorCode::OutOfOrder);
        assert!(Ack::decode(Bytes::from_static(&[0; 8])).is_err());
    }

    #[test]
    fn test_int_argument_required() {
        let message =
            CommandMessage::new(ChannelCommand::GetDevices, CommandInfo::Text("2".into()));
        assert!(message.int().is_err());
        assert_eq!(message.text(), "2");
    }
}
