//! Tagged-variant payload codec for commands, events and log entries.
//!
//! Payload layout: one tag byte followed by the variant body. Strings are
//! `u32_le` length prefixed UTF-8, ids and timestamps are `u64_le`, typed
//! field lists are `u32_le` counted with a one byte type tag per field.

use crate::error::ProtocolError;
use crate::logbus::{Field, Level, LogEntry};
use anyhow::Result;
use derive_builder::Builder;
use getset::Getters;

const TAG_BUILD: u8 = 0x01;
const TAG_BUILD_RESULT: u8 = 0x10;
const TAG_EXCEPTION: u8 = 0x11;
const TAG_MSG: u8 = 0x20;
const TAG_START_ACTIVITY: u8 = 0x21;
const TAG_STOP_ACTIVITY: u8 = 0x22;
const TAG_RESULT: u8 = 0x23;

const FIELD_INT: u8 = 0;
const FIELD_STRING: u8 = 1;

#[derive(Builder, Clone, Debug, Eq, Getters, PartialEq)]
#[builder(pattern = "owned", setter(into))]
/// Where and how the worker should deliver its bulk build log.
pub struct LogSettings {
    #[get = "pub"]
    /// Bearer token for the log socket.
    token: String,

    #[get = "pub"]
    /// Path component of the log socket endpoint.
    path: String,

    #[get = "pub"]
    /// Host of the log socket endpoint.
    host: String,
}

/// Messages sent to the worker. The build core sends exactly one `Build`
/// per worker spawn.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Realise one derivation.
    Build {
        drv_path: String,
        input_paths: Vec<String>,
        log_settings: LogSettings,
    },
}

/// Messages received from the worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Final verdict of the build. At most one per task.
    BuildResult(bool),
    /// Fatal worker-side failure.
    Exception(String),
    /// A forwarded build log record.
    Log(LogEntry),
}

impl Command {
    /// Encode the command into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::Build {
                drv_path,
                input_paths,
                log_settings,
            } => {
                buf.push(TAG_BUILD);
                put_str(&mut buf, drv_path);
                buf.extend_from_slice(&(input_paths.len() as u32).to_le_bytes());
                for path in input_paths {
                    put_str(&mut buf, path);
                }
                put_str(&mut buf, log_settings.token());
                put_str(&mut buf, log_settings.path());
                put_str(&mut buf, log_settings.host());
            }
        }
        buf
    }

    /// Decode a command from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Command> {
        let mut cursor = Cursor::new(payload);
        let command = match cursor.u8()? {
            TAG_BUILD => {
                let drv_path = cursor.str()?;
                let count = cursor.u32()?;
                let mut input_paths = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    input_paths.push(cursor.str()?);
                }
                let log_settings = LogSettings {
                    token: cursor.str()?,
                    path: cursor.str()?,
                    host: cursor.str()?,
                };
                Command::Build {
                    drv_path,
                    input_paths,
                    log_settings,
                }
            }
            tag => return Err(ProtocolError::UnknownTag(tag).into()),
        };
        cursor.finish()?;
        Ok(command)
    }
}

impl Event {
    /// Encode the event into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Event::BuildResult(success) => {
                buf.push(TAG_BUILD_RESULT);
                buf.push(*success as u8);
            }
            Event::Exception(text) => {
                buf.push(TAG_EXCEPTION);
                put_str(&mut buf, text);
            }
            Event::Log(entry) => encode_log_entry(entry, &mut buf),
        }
        buf
    }

    /// Decode an event from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Event> {
        let mut cursor = Cursor::new(payload);
        let event = match cursor.u8()? {
            TAG_BUILD_RESULT => Event::BuildResult(cursor.u8()? != 0),
            TAG_EXCEPTION => Event::Exception(cursor.str()?),
            tag @ TAG_MSG..=TAG_RESULT => Event::Log(decode_log_entry(tag, &mut cursor)?),
            tag => return Err(ProtocolError::UnknownTag(tag).into()),
        };
        cursor.finish()?;
        Ok(event)
    }
}

/// Encode a shipper batch: `u32_le` count followed by the encoded records.
pub(crate) fn encode_batch(entries: &[LogEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        encode_log_entry(entry, &mut buf);
    }
    buf
}

/// Decode a shipper batch. Used by tests exercising the remote wire format.
#[cfg(test)]
pub(crate) fn decode_batch(payload: &[u8]) -> Result<Vec<LogEntry>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = cursor.u8()?;
        entries.push(decode_log_entry(tag, &mut cursor)?);
    }
    cursor.finish()?;
    Ok(entries)
}

fn encode_log_entry(entry: &LogEntry, buf: &mut Vec<u8>) {
    match entry {
        LogEntry::Msg { level, ms, text } => {
            buf.push(TAG_MSG);
            buf.push(level.as_u8());
            buf.extend_from_slice(&ms.to_le_bytes());
            put_str(buf, text);
        }
        LogEntry::StartActivity {
            act_id,
            level,
            ms,
            kind,
            text,
            fields,
            parent,
        } => {
            buf.push(TAG_START_ACTIVITY);
            buf.extend_from_slice(&act_id.to_le_bytes());
            buf.push(level.as_u8());
            buf.extend_from_slice(&ms.to_le_bytes());
            buf.extend_from_slice(&kind.to_le_bytes());
            put_str(buf, text);
            put_fields(buf, fields);
            buf.extend_from_slice(&parent.to_le_bytes());
        }
        LogEntry::StopActivity { act_id, ms } => {
            buf.push(TAG_STOP_ACTIVITY);
            buf.extend_from_slice(&act_id.to_le_bytes());
            buf.extend_from_slice(&ms.to_le_bytes());
        }
        LogEntry::Result {
            act_id,
            ms,
            kind,
            fields,
        } => {
            buf.push(TAG_RESULT);
            buf.extend_from_slice(&act_id.to_le_bytes());
            buf.extend_from_slice(&ms.to_le_bytes());
            buf.extend_from_slice(&kind.to_le_bytes());
            put_fields(buf, fields);
        }
    }
}

fn decode_log_entry(tag: u8, cursor: &mut Cursor<'_>) -> Result<LogEntry> {
    let entry = match tag {
        TAG_MSG => LogEntry::Msg {
            level: cursor.level()?,
            ms: cursor.u64()?,
            text: cursor.str()?,
        },
        TAG_START_ACTIVITY => LogEntry::StartActivity {
            act_id: cursor.u64()?,
            level: cursor.level()?,
            ms: cursor.u64()?,
            kind: cursor.u64()?,
            text: cursor.str()?,
            fields: cursor.fields()?,
            parent: cursor.u64()?,
        },
        TAG_STOP_ACTIVITY => LogEntry::StopActivity {
            act_id: cursor.u64()?,
            ms: cursor.u64()?,
        },
        TAG_RESULT => LogEntry::Result {
            act_id: cursor.u64()?,
            ms: cursor.u64()?,
            kind: cursor.u64()?,
            fields: cursor.fields()?,
        },
        tag => return Err(ProtocolError::UnknownTag(tag).into()),
    };
    Ok(entry)
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_fields(buf: &mut Vec<u8>, fields: &[Field]) {
    buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in fields {
        match field {
            Field::Int(value) => {
                buf.push(FIELD_INT);
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Field::String(value) => {
                buf.push(FIELD_STRING);
                put_str(buf, value);
            }
        }
    }
}

/// A checked reader over a payload slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(ProtocolError::Truncated(len).into());
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8 string: {}", e)).into())
    }

    fn level(&mut self) -> Result<Level> {
        let value = self.u8()?;
        Level::from_u8(value)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown level {}", value)).into())
    }

    fn fields(&mut self) -> Result<Vec<Field>> {
        let count = self.u32()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let field = match self.u8()? {
                FIELD_INT => Field::Int(self.u64()?),
                FIELD_STRING => Field::String(self.str()?),
                tag => return Err(ProtocolError::UnknownTag(tag).into()),
            };
            fields.push(field);
        }
        Ok(fields)
    }

    /// Assert the payload is fully consumed.
    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.pos
            ))
            .into());
        }
        Ok(())
    }
}
