// Copyright 2025 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The memcached text protocol: command parsing and response literals.

use larder::Item;

pub const SEPARATOR: &[u8] = b"\r\n";

pub const VALUE: &str = "VALUE";
pub const END: &str = "END";
pub const STORED: &str = "STORED";
pub const DELETED: &str = "DELETED";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const ERROR: &str = "ERROR";
pub const CLIENT_ERROR: &str = "CLIENT_ERROR";
pub const SERVER_ERROR: &str = "SERVER_ERROR";

/// Longest accepted command line, without the terminator.
pub const MAX_COMMAND_SIZE: usize = 4096;

/// Relative `exptime` values above this are absolute epoch seconds.
pub const MAX_RELATIVE_EXPIRY: i64 = 60 * 60 * 24 * 30;

/// A protocol violation the client is told about with `CLIENT_ERROR`; the
/// connection survives it.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    #[error("more fields required")]
    MoreFieldsRequired,
    #[error("unexpected fields")]
    UnexpectedFields,
    #[error("key is too long")]
    KeyTooLong,
    #[error("key contains invalid characters")]
    InvalidKey,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("object too large for cache")]
    ObjectTooLarge,
    #[error("bad data chunk")]
    BadDataChunk,
    #[error("command line too long")]
    CommandTooLong,
}

/// Command parse failure. Unknown commands get the bare `ERROR` response;
/// everything else is a [`ClientError`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command")]
    Unknown,
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, PartialEq, Eq)]
pub struct SetMeta<'a> {
    pub key: &'a [u8],
    pub flags: u32,
    pub exptime: i64,
    pub bytes: usize,
    pub noreply: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Get { keys: Vec<&'a [u8]> },
    Set(SetMeta<'a>),
    Delete { key: &'a [u8], noreply: bool },
    Quit,
    Version,
}

/// Parse one command line (terminator already stripped).
pub fn parse_command(line: &[u8]) -> Result<Command<'_>, CommandError> {
    let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let name = fields.next().ok_or(CommandError::Unknown)?;

    match name {
        b"get" | b"gets" => {
            let keys: Vec<&[u8]> = fields.collect();
            if keys.is_empty() {
                return Err(ClientError::MoreFieldsRequired.into());
            }
            for key in &keys {
                check_key(key)?;
            }
            Ok(Command::Get { keys })
        }
        b"set" => {
            let key = fields.next().ok_or(ClientError::MoreFieldsRequired)?;
            check_key(key)?;
            let flags = parse_num::<u32>(fields.next().ok_or(ClientError::MoreFieldsRequired)?)?;
            let exptime = parse_num::<i64>(fields.next().ok_or(ClientError::MoreFieldsRequired)?)?;
            let bytes = parse_num::<usize>(fields.next().ok_or(ClientError::MoreFieldsRequired)?)?;
            let noreply = parse_noreply(&mut fields)?;
            Ok(Command::Set(SetMeta {
                key,
                flags,
                exptime,
                bytes,
                noreply,
            }))
        }
        b"delete" => {
            let key = fields.next().ok_or(ClientError::MoreFieldsRequired)?;
            check_key(key)?;
            let noreply = parse_noreply(&mut fields)?;
            Ok(Command::Delete { key, noreply })
        }
        b"quit" => Ok(Command::Quit),
        b"version" => Ok(Command::Version),
        _ => Err(CommandError::Unknown),
    }
}

/// A key must be non-empty, at most 250 bytes, and free of whitespace and
/// control bytes.
pub fn check_key(key: &[u8]) -> Result<(), ClientError> {
    if key.is_empty() {
        return Err(ClientError::InvalidKey);
    }
    if key.len() > Item::MAX_KEY_SIZE {
        return Err(ClientError::KeyTooLong);
    }
    if key.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(ClientError::InvalidKey);
    }
    Ok(())
}

/// Convert a parsed `exptime` into an absolute expiry in epoch seconds.
/// Zero means never; values within thirty days are relative to `now`;
/// negative values expire the item immediately.
pub fn absolute_expiry(exptime: i64, now: u64) -> u64 {
    match exptime {
        0 => 0,
        t if t < 0 => 1,
        t if t <= MAX_RELATIVE_EXPIRY => now + t as u64,
        t => t as u64,
    }
}

fn parse_num<T: std::str::FromStr>(field: &[u8]) -> Result<T, ClientError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::InvalidNumber(String::from_utf8_lossy(field).into_owned()))
}

fn parse_noreply<'a>(fields: &mut impl Iterator<Item = &'a [u8]>) -> Result<bool, ClientError> {
    match fields.next() {
        None => Ok(false),
        Some(b"noreply") => match fields.next() {
            None => Ok(true),
            Some(_) => Err(ClientError::UnexpectedFields),
        },
        Some(_) => Err(ClientError::UnexpectedFields),
    }
}
