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

use std::{io, net::TcpListener, sync::Arc, thread};

use larder::{ChunkPool, Clock, Handler};

use crate::conn;

/// Per-connection input buffer size. The pool's chunk size must be at least
/// this, so a value body read from the buffer can land contiguously in one
/// chunk.
pub const INPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection output buffer size.
pub const OUT_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a connection needs, shared across all connections.
pub struct ConnMeta {
    /// The cache the protocol layer drives.
    pub handler: Arc<dyn Handler>,
    /// Pool that value bodies are read into; shared with the cache.
    pub pool: ChunkPool,
    /// Largest accepted item payload in bytes. Larger sets are rejected at
    /// the protocol layer, not by the cache.
    pub max_item_size: usize,
    /// Time source for `exptime` conversion.
    pub clock: Arc<dyn Clock>,
}

/// Accept connections forever, serving each on its own thread.
///
/// Fails fast if the pool's chunk size is smaller than the input buffer,
/// which would break zero-copy body reads.
pub fn run(listener: TcpListener, meta: Arc<ConnMeta>) -> io::Result<()> {
    if meta.pool.chunk_size() < INPUT_BUFFER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "pool chunk size {} is smaller than the input buffer size {}",
                meta.pool.chunk_size(),
                INPUT_BUFFER_SIZE
            ),
        ));
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let meta = meta.clone();
                thread::spawn(move || conn::serve(stream, meta));
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
        }
    }
    Ok(())
}
