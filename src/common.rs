use std::alloc::Layout;
use std::mem::{align_of, size_of};

use static_assertions::const_assert;

use crate::error::ConfigError;

/// Bytes reserved in front of every unit.
/// While the unit is free, it holds the index of the next free unit.
pub(crate) const HEADER_SIZE: usize = size_of::<usize>();
pub(crate) const UNIT_ALIGN: usize = align_of::<usize>();

const_assert!(HEADER_SIZE % UNIT_ALIGN == 0);
const_assert!(UNIT_ALIGN.is_power_of_two());

pub(crate) type BlockId = usize;

/// Shape of the blocks of a pool, validated once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub unit_size: usize,
    pub unit_count: usize,
    /// Distance between two consecutive headers.
    /// Rounded up so every header (and payload) is word aligned
    pub stride: usize,
    pub layout: Layout,
}

impl Geometry {
    pub fn new(unit_size: usize, unit_count: usize) -> Result<Geometry, ConfigError> {
        if unit_size == 0 {
            return Err(ConfigError::ZeroUnitSize);
        }
        if unit_count == 0 {
            return Err(ConfigError::ZeroUnitsPerBlock);
        }

        let too_large = ConfigError::BlockTooLarge {
            unit_size,
            units_per_block: unit_count,
        };

        let stride = unit_size
            .checked_add(HEADER_SIZE + UNIT_ALIGN - 1)
            .map(|s| s & !(UNIT_ALIGN - 1))
            .ok_or(too_large)?;

        let size = stride.checked_mul(unit_count).ok_or(too_large)?;

        let layout = Layout::from_size_align(size, UNIT_ALIGN).map_err(|_| too_large)?;

        Ok(Geometry { unit_size, unit_count, stride, layout })
    }

    pub fn block_size(&self) -> usize {
        self.layout.size()
    }
}

/// Converts the signed block budget of the public constructors.
/// A negative value means no limit.
pub(crate) fn block_limit(max_blocks: isize) -> Option<usize> {
    if max_blocks < 0 {
        None
    } else {
        Some(max_blocks as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::{block_limit, Geometry, HEADER_SIZE, UNIT_ALIGN};
    use crate::error::ConfigError;

    #[test]
    fn geometry_stride_is_aligned() {
        for unit_size in 1..64 {
            let geometry = Geometry::new(unit_size, 4).unwrap();
            assert_eq!(geometry.stride % UNIT_ALIGN, 0);
            assert!(geometry.stride >= unit_size + HEADER_SIZE);
            assert!(geometry.stride < unit_size + HEADER_SIZE + UNIT_ALIGN);
            assert_eq!(geometry.block_size(), geometry.stride * 4);
        }
    }

    #[test]
    fn geometry_rejects_invalid() {
        assert_eq!(Geometry::new(0, 4), Err(ConfigError::ZeroUnitSize));
        assert_eq!(Geometry::new(8, 0), Err(ConfigError::ZeroUnitsPerBlock));
        assert_eq!(
            Geometry::new(usize::MAX - 2, 1),
            Err(ConfigError::BlockTooLarge { unit_size: usize::MAX - 2, units_per_block: 1 })
        );
        assert_eq!(
            Geometry::new(1024, usize::MAX / 8),
            Err(ConfigError::BlockTooLarge { unit_size: 1024, units_per_block: usize::MAX / 8 })
        );
    }

    #[test]
    fn signed_limits() {
        assert_eq!(block_limit(-1), None);
        assert_eq!(block_limit(-100), None);
        assert_eq!(block_limit(0), Some(0));
        assert_eq!(block_limit(7), Some(7));
    }
}
