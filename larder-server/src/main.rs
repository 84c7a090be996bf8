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

use std::{net::TcpListener, sync::Arc};

use anyhow::Context;
use clap::Parser;
use larder::{Cache, CacheConfig, ChunkPool, PoolConfig, SystemClock};
use larder_server::{run, ConnMeta, INPUT_BUFFER_SIZE};
use tracing_subscriber::EnvFilter;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:11211")]
    addr: String,

    /// Cache memory budget. (MiB)
    #[arg(long, default_value_t = 64)]
    mem: u64,

    /// Upper bound on the hot segment as a fraction of the budget.
    #[arg(long, default_value_t = 0.5)]
    hot_fraction: f64,

    /// Largest accepted item payload. (B)
    #[arg(long, default_value_t = 1024 * 1024)]
    max_item_size: usize,

    /// Pool chunk size. (B)
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Number of released chunks the pool keeps for reuse.
    #[arg(long, default_value_t = 1024)]
    recycle_capacity: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        args.chunk_size >= INPUT_BUFFER_SIZE,
        "chunk size {} must be at least the input buffer size {}",
        args.chunk_size,
        INPUT_BUFFER_SIZE,
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.hot_fraction),
        "hot fraction {} must be in [0.0, 1.0]",
        args.hot_fraction,
    );

    let pool = ChunkPool::new(PoolConfig {
        chunk_size: args.chunk_size,
        max_buffer_size: args.max_item_size,
        recycle_capacity: args.recycle_capacity,
    });
    let cache = Cache::new(CacheConfig {
        max_bytes: args.mem * MIB,
        hot_fraction: args.hot_fraction,
    });
    let meta = Arc::new(ConnMeta {
        handler: Arc::new(cache),
        pool,
        max_item_size: args.max_item_size,
        clock: Arc::new(SystemClock),
    });

    let listener =
        TcpListener::bind(&args.addr).with_context(|| format!("failed to bind {}", args.addr))?;
    tracing::info!(addr = %args.addr, mem_mib = args.mem, "listening");

    run(listener, meta).context("server terminated")
}
