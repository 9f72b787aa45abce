use thiserror::Error;

/// Errors returned when building a [`Pool`] or a [`ShardedPool`]
/// from an invalid configuration.
///
/// Allocation and free never return this type, they report
/// failures with `Option` and `bool`.
///
/// [`Pool`]: ./struct.Pool.html
/// [`ShardedPool`]: ./struct.ShardedPool.html
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unit size must be greater than zero")]
    ZeroUnitSize,

    #[error("a block must hold at least one unit")]
    ZeroUnitsPerBlock,

    /// `units_per_block * stride` doesn't fit in a single allocation
    #[error("block of {units_per_block} units of {unit_size} bytes is too large")]
    BlockTooLarge {
        unit_size: usize,
        units_per_block: usize,
    },

    #[error("a sharded pool needs at least one shard")]
    NoShards,
}
