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

//! One connection's command loop.
//!
//! Client errors are reported with `CLIENT_ERROR` and the loop continues;
//! I/O errors end the connection. A set whose body never fully arrives is
//! never handed to the cache.

use std::{
    fmt::Display,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    net::TcpStream,
    sync::Arc,
};

use bytes::Bytes;
use larder::Item;

use crate::{
    proto::{
        absolute_expiry, parse_command, ClientError, Command, CommandError, SetMeta, CLIENT_ERROR,
        DELETED, END, ERROR, MAX_COMMAND_SIZE, NOT_FOUND, SEPARATOR, SERVER_ERROR, STORED, VALUE,
    },
    server::{ConnMeta, INPUT_BUFFER_SIZE, OUT_BUFFER_SIZE},
};

pub(crate) fn serve(stream: TcpStream, meta: Arc<ConnMeta>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut conn = match Conn::new(stream, meta) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to set up connection");
            return;
        }
    };

    tracing::debug!(%peer, "serving connection");
    match conn.run() {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(e) if disconnect(&e) => tracing::debug!(%peer, error = %e, "client disconnected"),
        Err(e) => {
            tracing::error!(%peer, error = %e, "connection error");
            let _ = conn.send_response(&format!("{SERVER_ERROR} {e}"));
        }
    }
}

fn disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

enum Line {
    Ok,
    TooLong,
    Eof,
}

struct Conn {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    meta: Arc<ConnMeta>,
    line: Vec<u8>,
}

impl Conn {
    fn new(stream: TcpStream, meta: Arc<ConnMeta>) -> io::Result<Self> {
        let writer = BufWriter::with_capacity(OUT_BUFFER_SIZE, stream.try_clone()?);
        Ok(Self {
            reader: BufReader::with_capacity(INPUT_BUFFER_SIZE, stream),
            writer,
            meta,
            line: Vec::new(),
        })
    }

    fn run(&mut self) -> io::Result<()> {
        loop {
            match self.read_line()? {
                Line::Eof => return Ok(()),
                Line::TooLong => {
                    self.send_client_error(&ClientError::CommandTooLong)?;
                    continue;
                }
                Line::Ok => {}
            }

            let line = std::mem::take(&mut self.line);
            let result = match parse_command(&line) {
                Ok(Command::Quit) => return self.writer.flush(),
                Ok(Command::Version) => {
                    self.send_response(&format!("VERSION {}", env!("CARGO_PKG_VERSION")))
                }
                Ok(Command::Get { keys }) => self.get(&keys),
                Ok(Command::Set(meta)) => self.set(meta),
                Ok(Command::Delete { key, noreply }) => self.delete(key, noreply),
                Err(CommandError::Unknown) => {
                    tracing::debug!("unexpected command");
                    self.send_response(ERROR)
                }
                Err(CommandError::Client(e)) => self.send_client_error(&e),
            };
            self.line = line;
            result?;
        }
    }

    /// Read one newline-terminated line, stripping the terminator. Lines
    /// beyond [`MAX_COMMAND_SIZE`] are drained and reported, keeping memory
    /// bounded.
    fn read_line(&mut self) -> io::Result<Line> {
        let Self { reader, line, .. } = self;
        line.clear();

        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return if line.is_empty() {
                    Ok(Line::Eof)
                } else {
                    Err(io::ErrorKind::UnexpectedEof.into())
                };
            }

            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&buf[..i]);
                    reader.consume(i + 1);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return if line.len() > MAX_COMMAND_SIZE {
                        Ok(Line::TooLong)
                    } else {
                        Ok(Line::Ok)
                    };
                }
                None => {
                    let n = buf.len();
                    line.extend_from_slice(buf);
                    reader.consume(n);
                    line.truncate(MAX_COMMAND_SIZE + 1);
                }
            }
        }
    }

    fn get(&mut self, keys: &[&[u8]]) -> io::Result<()> {
        let views = self.meta.handler.get(keys);
        tracing::debug!(
            requested = keys.len(),
            found = views.iter().filter(|v| v.is_some()).count(),
            "sending values"
        );

        for mut view in views.into_iter().flatten() {
            write!(self.writer, "{VALUE} ")?;
            self.writer.write_all(view.key())?;
            write!(self.writer, " {} {}", view.flags(), view.bytes())?;
            self.writer.write_all(SEPARATOR)?;
            view.write_to(&mut self.writer)?;
            self.writer.write_all(SEPARATOR)?;
        }
        self.send_response(END)
    }

    fn set(&mut self, meta: SetMeta<'_>) -> io::Result<()> {
        let SetMeta {
            key,
            flags,
            exptime,
            bytes,
            noreply,
        } = meta;
        tracing::debug!(key = ?String::from_utf8_lossy(key), bytes, noreply, "set");

        if bytes > self.meta.max_item_size {
            self.discard_body(bytes)?;
            return self.send_client_error(&ClientError::ObjectTooLarge);
        }
        let mut buf = match self.meta.pool.acquire(bytes) {
            Ok(buf) => buf,
            Err(e) => {
                self.discard_body(bytes)?;
                return self.send_client_error(&e);
            }
        };

        buf.fill_from(&mut self.reader)?;
        let mut sep = [0u8; 2];
        self.reader.read_exact(&mut sep)?;
        if &sep[..] != SEPARATOR {
            return self.send_client_error(&ClientError::BadDataChunk);
        }

        let expire_at = absolute_expiry(exptime, self.meta.clock.now());
        self.meta
            .handler
            .set(Item::new(Bytes::copy_from_slice(key), flags, expire_at, buf.freeze()));

        if noreply {
            return self.writer.flush();
        }
        self.send_response(STORED)
    }

    fn delete(&mut self, key: &[u8], noreply: bool) -> io::Result<()> {
        let deleted = self.meta.handler.delete(key);
        tracing::debug!(key = ?String::from_utf8_lossy(key), deleted, "delete");

        if noreply {
            return self.writer.flush();
        }
        self.send_response(if deleted { DELETED } else { NOT_FOUND })
    }

    /// Skip a declared body (and its terminator) after a rejected set.
    fn discard_body(&mut self, bytes: usize) -> io::Result<()> {
        let n = bytes as u64 + SEPARATOR.len() as u64;
        let copied = io::copy(&mut (&mut self.reader).take(n), &mut io::sink())?;
        if copied < n {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    fn send_client_error(&mut self, err: &dyn Display) -> io::Result<()> {
        tracing::debug!(error = %err, "client error");
        self.send_response(&format!("{CLIENT_ERROR} {err}"))
    }

    fn send_response(&mut self, response: &str) -> io::Result<()> {
        self.writer.write_all(response.as_bytes())?;
        self.writer.write_all(SEPARATOR)?;
        self.writer.flush()
    }
}
