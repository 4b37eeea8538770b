// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Length-prefixed, self-describing serialization of rendezvous messages.
//
// Frame layout (all integers little-endian):
//   total_size : u64    -- whole frame, this field included
//   user_tag   : i64    -- opaque, echoed in replies (GET: wait timeout ms)
//   msg_type   : i16
//   key_count  : u64, then per key   { len: u64, bytes[len] }
//   value_count: u64, then per value { len: u64, bytes[len] }

use crate::error::{ErrCode, Result};

pub const MAX_KEY_COUNT: u64 = 10;
pub const MAX_KEY_SIZE: u64 = 2048;
pub const MAX_VALUE_COUNT: u64 = 10;
pub const MAX_VALUE_SIZE: u64 = 64 * 1024 * 1024;

/// Smallest possible frame: total_size + user_tag + key_count + value_count
/// (4 x u64) plus the i16 msg_type.
pub const BASE_FRAME_SIZE: usize = 4 * 8 + 2;

/// Key the rank-state watch request carries.
pub const WATCH_RANK_DOWN_KEY: &str = "WATCH_RANK_DOWN_KEY";

#[cfg(test)]
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;
#[cfg(not(test))]
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// Rendezvous opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum MsgType {
    Set = 0,
    Get = 1,
    Add = 2,
    Remove = 3,
    Append = 4,
    Cas = 5,
    Write = 6,
    WatchRankState = 7,
    Heartbeat = 8,
    Invalid = 9,
}

impl MsgType {
    pub fn from_i16(raw: i16) -> MsgType {
        match raw {
            0 => MsgType::Set,
            1 => MsgType::Get,
            2 => MsgType::Add,
            3 => MsgType::Remove,
            4 => MsgType::Append,
            5 => MsgType::Cas,
            6 => MsgType::Write,
            7 => MsgType::WatchRankState,
            8 => MsgType::Heartbeat,
            _ => MsgType::Invalid,
        }
    }
}

/// A rendezvous request or reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mt: MsgType,
    /// Opaque tag propagated in replies. GET uses it as the wait timeout in
    /// milliseconds (0 = no wait, negative = wait forever).
    pub user_tag: i64,
    pub keys: Vec<String>,
    pub values: Vec<Vec<u8>>,
}

impl Message {
    pub fn new(mt: MsgType) -> Message {
        Message {
            mt,
            user_tag: -1,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn with_key(mt: MsgType, key: impl Into<String>) -> Message {
        let mut m = Message::new(mt);
        m.keys.push(key.into());
        m
    }

    pub fn with_key_value(mt: MsgType, key: impl Into<String>, value: Vec<u8>) -> Message {
        let mut m = Message::with_key(mt, key);
        m.values.push(value);
        m
    }

    fn check_limits(&self) -> Result<()> {
        if self.keys.len() as u64 > MAX_KEY_COUNT || self.values.len() as u64 > MAX_VALUE_COUNT {
            return Err(ErrCode::InvalidMessage);
        }
        if self.keys.iter().any(|k| k.len() as u64 > MAX_KEY_SIZE) {
            return Err(ErrCode::InvalidMessage);
        }
        if self.values.iter().any(|v| v.len() as u64 > MAX_VALUE_SIZE) {
            return Err(ErrCode::InvalidMessage);
        }
        Ok(())
    }

    /// Serialize into a frame.
    pub fn pack(&self) -> Result<Vec<u8>> {
        self.check_limits()?;
        let mut total = BASE_FRAME_SIZE;
        for key in &self.keys {
            total += 8 + key.len();
        }
        for value in &self.values {
            total += 8 + value.len();
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u64).to_le_bytes());
        out.extend_from_slice(&self.user_tag.to_le_bytes());
        out.extend_from_slice(&(self.mt as i16).to_le_bytes());
        out.extend_from_slice(&(self.keys.len() as u64).to_le_bytes());
        for key in &self.keys {
            out.extend_from_slice(&(key.len() as u64).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
        }
        out.extend_from_slice(&(self.values.len() as u64).to_le_bytes());
        for value in &self.values {
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value);
        }
        Ok(out)
    }

    /// True iff `buf` holds at least one complete frame.
    pub fn full(buf: &[u8]) -> bool {
        if buf.len() < BASE_FRAME_SIZE {
            return false;
        }
        let total = u64::from_le_bytes(buf[..8].try_into().unwrap());
        buf.len() as u64 >= total
    }

    /// Declared size of the frame starting at `buf`, or -1 when the header is
    /// still incomplete.
    pub fn message_size(buf: &[u8]) -> i64 {
        if buf.len() < BASE_FRAME_SIZE {
            return -1;
        }
        i64::from_le_bytes(buf[..8].try_into().unwrap())
    }

    /// Deserialize one frame. Returns the message and the bytes consumed.
    /// Truncated or malformed input yields `InvalidMessage` and consumes
    /// nothing.
    pub fn unpack(buf: &[u8]) -> Result<(Message, usize)> {
        if !Message::full(buf) {
            return Err(ErrCode::InvalidMessage);
        }
        let total = u64::from_le_bytes(buf[..8].try_into().unwrap()) as usize;
        if total < BASE_FRAME_SIZE {
            return Err(ErrCode::InvalidMessage);
        }

        let mut cursor = Cursor {
            buf: &buf[..total],
            pos: 8,
        };
        let user_tag = cursor.read_i64()?;
        let mt = MsgType::from_i16(cursor.read_i16()?);
        if mt == MsgType::Invalid {
            return Err(ErrCode::InvalidMessage);
        }

        let key_count = cursor.read_u64()?;
        if key_count > MAX_KEY_COUNT {
            return Err(ErrCode::InvalidMessage);
        }
        let mut keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let len = cursor.read_u64()?;
            if len > MAX_KEY_SIZE {
                return Err(ErrCode::InvalidMessage);
            }
            let bytes = cursor.read_bytes(len as usize)?;
            let key = std::str::from_utf8(bytes).map_err(|_| ErrCode::InvalidMessage)?;
            keys.push(key.to_string());
        }

        let value_count = cursor.read_u64()?;
        if value_count > MAX_VALUE_COUNT {
            return Err(ErrCode::InvalidMessage);
        }
        let mut values = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            let len = cursor.read_u64()?;
            if len > MAX_VALUE_SIZE {
                return Err(ErrCode::InvalidMessage);
            }
            values.push(cursor.read_bytes(len as usize)?.to_vec());
        }

        Ok((
            Message {
                mt,
                user_tag,
                keys,
                values,
            },
            total,
        ))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(ErrCode::InvalidMessage)?;
        if end > self.buf.len() {
            return Err(ErrCode::InvalidMessage);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }
}
