//! Channel request payloads in SSH wire format (RFC 4254).
//!
//! Each record is encoded as the request-specific data that follows the
//! `SSH_MSG_CHANNEL_REQUEST` header: `string` fields are a big-endian `u32`
//! length followed by the bytes, `uint32` is big-endian, `boolean` is one byte.
//! Decoding is strict: truncated payloads and trailing bytes are errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Request type names used on session channels.
pub const EXEC: &str = "exec";
pub const PTY_REQ: &str = "pty-req";
pub const WINDOW_CHANGE: &str = "window-change";
pub const ENV: &str = "env";
pub const SIGNAL: &str = "signal";
pub const SHELL: &str = "shell";
pub const SUBSYSTEM: &str = "subsystem";
pub const EXIT_STATUS: &str = "exit-status";
pub const EXIT_SIGNAL: &str = "exit-signal";

/// Errors produced while decoding a request payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before a field was complete.
    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    /// Bytes were left over after the last field.
    #[error("{0} unexpected trailing byte(s)")]
    TrailingBytes(usize),

    /// A text field was not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// A fixed-layout channel request payload.
pub trait WireMessage: Sized {
    fn encode_to(&self, buf: &mut BytesMut);

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader { buf: payload };
        let msg = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(msg)
    }
}

/// Cursor over a payload being decoded.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        if self.buf.remaining() < 4 {
            return Err(DecodeError::Truncated { field });
        }
        Ok(self.buf.get_u32())
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        if !self.buf.has_remaining() {
            return Err(DecodeError::Truncated { field });
        }
        Ok(self.buf.get_u8() != 0)
    }

    fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u32(field)? as usize;
        if self.buf.len() < len {
            return Err(DecodeError::Truncated { field });
        }
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(value)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// `exec`: the command line requested by the client. Bytes that are not
/// UTF-8 decode to U+FFFD so the request still reaches routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    pub command: String,
}

impl WireMessage for Exec {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.command.as_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            command: String::from_utf8_lossy(reader.bytes("command")?).into_owned(),
        })
    }
}

/// Raw `exec` payload for commands that are not guaranteed to be UTF-8.
pub fn encode_exec_raw(command: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + command.len());
    put_bytes(&mut buf, command);
    buf.freeze()
}

/// `pty-req`: terminal type, character and pixel dimensions, encoded modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: Bytes,
}

impl WireMessage for PtyRequest {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.term.as_bytes());
        buf.put_u32(self.cols);
        buf.put_u32(self.rows);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        put_bytes(buf, &self.modes);
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            term: reader.string("term")?,
            cols: reader.u32("cols")?,
            rows: reader.u32("rows")?,
            width: reader.u32("width")?,
            height: reader.u32("height")?,
            modes: Bytes::copy_from_slice(reader.bytes("modes")?),
        })
    }
}

/// Encode terminal modes as opcode/argument pairs terminated by `TTY_OP_END`.
pub fn encode_terminal_modes(modes: &[(u8, u32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(modes.len() * 5 + 1);
    for (opcode, arg) in modes {
        buf.put_u8(*opcode);
        buf.put_u32(*arg);
    }
    buf.put_u8(0);
    buf.freeze()
}

/// `window-change`: new terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl WireMessage for WindowChange {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cols);
        buf.put_u32(self.rows);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            cols: reader.u32("cols")?,
            rows: reader.u32("rows")?,
            width: reader.u32("width")?,
            height: reader.u32("height")?,
        })
    }
}

/// `env`: a single environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Env {
    pub name: String,
    pub value: String,
}

impl WireMessage for Env {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.name.as_bytes());
        put_bytes(buf, self.value.as_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name: reader.string("name")?,
            value: reader.string("value")?,
        })
    }
}

/// `signal`: signal name without the `SIG` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub signal: String,
}

impl WireMessage for Signal {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.signal.as_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            signal: reader.string("signal")?,
        })
    }
}

/// `subsystem`: name of the requested subsystem, e.g. `sftp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    pub name: String,
}

impl WireMessage for Subsystem {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.name.as_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name: reader.string("name")?,
        })
    }
}

/// `exit-status`: process exit code reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub status: u32,
}

impl WireMessage for ExitStatus {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.status);
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u32("status")?,
        })
    }
}

/// `exit-signal`: the process was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub signal: String,
    pub core_dumped: bool,
    pub error_message: String,
    pub language_tag: String,
}

impl WireMessage for ExitSignal {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.signal.as_bytes());
        buf.put_u8(self.core_dumped as u8);
        put_bytes(buf, self.error_message.as_bytes());
        put_bytes(buf, self.language_tag.as_bytes());
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            signal: reader.string("signal")?,
            core_dumped: reader.bool("core_dumped")?,
            error_message: reader.string("error_message")?,
            language_tag: reader.string("language_tag")?,
        })
    }
}

/// `direct-tcpip` / `forwarded-tcpip` channel open data. Forwarding is not
/// served; the record only describes refused attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarding {
    pub dest_addr: String,
    pub dest_port: u32,
    pub origin_addr: String,
    pub origin_port: u32,
}

impl WireMessage for Forwarding {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.dest_addr.as_bytes());
        buf.put_u32(self.dest_port);
        put_bytes(buf, self.origin_addr.as_bytes());
        buf.put_u32(self.origin_port);
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            dest_addr: reader.string("dest_addr")?,
            dest_port: reader.u32("dest_port")?,
            origin_addr: reader.string("origin_addr")?,
            origin_port: reader.u32("origin_port")?,
        })
    }
}

/// `tcpip-forward` global request data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    pub bind_addr: String,
    pub bind_port: u32,
}

impl WireMessage for RemoteForward {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.bind_addr.as_bytes());
        buf.put_u32(self.bind_port);
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            bind_addr: reader.string("bind_addr")?,
            bind_port: reader.u32("bind_port")?,
        })
    }
}
