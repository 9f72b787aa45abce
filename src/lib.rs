
mod block;
mod cache_line;
mod common;
mod config;
mod error;
mod observer;
mod pool;
mod sharded;
mod unit;

pub use {
    config::{BlockConfig, PoolConfig, ShardedPoolConfig},
    error::ConfigError,
    observer::{FallbackOp, NoopObserver, PoolEvent, PoolObserver, TracingObserver},
    pool::{Pool, PoolStats},
    sharded::ShardedPool,
    unit::{Origin, Unit},
};
