use serde::{Deserialize, Serialize};

use crate::common::Geometry;
use crate::error::ConfigError;

/// Configuration of a [`Pool`]
///
/// `max_blocks` set to `None` (or missing when deserialized) means
/// the pool can grow without limit.
///
/// ## Example
///
/// ```
/// use unit_pool::{Pool, PoolConfig};
///
/// let config = PoolConfig { unit_size: 64, units_per_block: 128, max_blocks: Some(4) };
/// let pool = Pool::with_config(&config).unwrap();
///
/// assert_eq!(pool.max_blocks(), Some(4));
/// ```
///
/// [`Pool`]: ./struct.Pool.html
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size in bytes of a unit
    pub unit_size: usize,
    pub units_per_block: usize,
    #[serde(default)]
    pub max_blocks: Option<usize>,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry().map(|_| ())
    }

    pub(crate) fn geometry(&self) -> Result<Geometry, ConfigError> {
        Geometry::new(self.unit_size, self.units_per_block)
    }
}

/// Shape and budget of the blocks of one of the pools
/// in a [`ShardedPool`]
///
/// [`ShardedPool`]: ./struct.ShardedPool.html
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub units_per_block: usize,
    #[serde(default)]
    pub max_blocks: Option<usize>,
}

/// Configuration of a [`ShardedPool`]
///
/// All pools share the same `unit_size`. Every local pool uses
/// `local`, the shared overflow pool uses `shared`.
///
/// ```toml
/// shards = 8
/// unit_size = 256
///
/// [local]
/// units_per_block = 64
/// max_blocks = 4
///
/// [shared]
/// units_per_block = 1024
/// ```
///
/// [`ShardedPool`]: ./struct.ShardedPool.html
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedPoolConfig {
    pub shards: usize,
    pub unit_size: usize,
    pub local: BlockConfig,
    pub shared: BlockConfig,
}

impl ShardedPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::NoShards);
        }
        self.local_pool().validate()?;
        self.shared_pool().validate()
    }

    pub fn local_pool(&self) -> PoolConfig {
        PoolConfig {
            unit_size: self.unit_size,
            units_per_block: self.local.units_per_block,
            max_blocks: self.local.max_blocks,
        }
    }

    pub fn shared_pool(&self) -> PoolConfig {
        PoolConfig {
            unit_size: self.unit_size,
            units_per_block: self.shared.units_per_block,
            max_blocks: self.shared.max_blocks,
        }
    }
}
