use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{Block, BlockState};
use crate::common::{block_limit, BlockId, Geometry};
use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::observer::{PoolEvent, PoolObserver, TracingObserver};
use crate::unit::{Origin, Unit};

/// Number of blocks at the front of the partial list tried before
/// walking both partial and full lists
const HOT_PARTIAL_PROBES: usize = 3;

/// Lists searched when freeing a unit.
/// An empty block can't own an allocated unit
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Searched {
    Partial,
    Full,
}

/// A pool of fixed-size units
///
/// Memory is reserved by blocks of `units_per_block` units. Blocks are
/// created on demand, up to `max_blocks`, and recycled between three
/// lists:
/// - full: no free unit
/// - partial: some free units. Its head is the block we allocate from
/// - empty: every unit is free
///
/// Blocks are never given back to the system unless [`shrink_to`] is
/// called, only recycled.
///
/// The pool isn't synchronized, use [`ShardedPool`] to share units
/// between threads.
///
/// ## Example
///
/// ```
/// use unit_pool::Pool;
///
/// let mut pool = Pool::new(16, 4, 1);
///
/// let units: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
/// assert!(pool.alloc().is_none());
///
/// assert!(pool.free(units[2]));
/// assert!(pool.alloc().is_some());
/// ```
///
/// [`shrink_to`]: #method.shrink_to
/// [`ShardedPool`]: ./struct.ShardedPool.html
pub struct Pool {
    geometry: Geometry,
    blocks: Vec<Block>,
    full: VecDeque<BlockId>,
    partial: VecDeque<BlockId>,
    empty: VecDeque<BlockId>,
    max_blocks: Option<usize>,
    origin: Origin,
    observer: Arc<dyn PoolObserver>,
    /// Event of the last operation, not yet given to the observer
    pending: Option<PoolEvent>,
}

// The pool exclusively owns the memory of its blocks
unsafe impl Send for Pool {}

/// Snapshot of the blocks and units of a pool
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub blocks: usize,
    pub full: usize,
    pub partial: usize,
    pub empty: usize,
    pub used_units: usize,
    pub free_units: usize,
}

impl Pool {
    /// Constructs a pool of units of `unit_size` bytes, allocated by blocks
    /// of `units_per_block` units
    ///
    /// A negative `max_blocks` means the pool is unbounded.
    /// No block is allocated until the first call to [`alloc`].
    ///
    /// ## Panics
    ///
    /// Panics if `unit_size` or `units_per_block` is zero, or if a block
    /// overflows `isize`. See [`with_config`] for a fallible version.
    ///
    /// [`alloc`]: #method.alloc
    /// [`with_config`]: #method.with_config
    pub fn new(unit_size: usize, units_per_block: usize, max_blocks: isize) -> Pool {
        let config = PoolConfig {
            unit_size,
            units_per_block,
            max_blocks: block_limit(max_blocks),
        };

        match Pool::with_config(&config) {
            Ok(pool) => pool,
            Err(e) => panic!("invalid pool configuration: {}", e),
        }
    }

    pub fn with_config(config: &PoolConfig) -> Result<Pool, ConfigError> {
        let geometry = config.geometry()?;

        Ok(Pool {
            geometry,
            blocks: Vec::new(),
            full: VecDeque::new(),
            partial: VecDeque::new(),
            empty: VecDeque::new(),
            max_blocks: config.max_blocks,
            origin: Origin::Pool,
            observer: Arc::new(TracingObserver),
            pending: None,
        })
    }

    /// Replaces the observer receiving the events of this pool
    ///
    /// The default is [`TracingObserver`].
    ///
    /// [`TracingObserver`]: ./struct.TracingObserver.html
    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> Pool {
        self.observer = observer;
        self
    }

    pub(crate) fn with_origin(mut self, origin: Origin) -> Pool {
        self.origin = origin;
        self
    }

    /// Allocates a unit
    ///
    /// Returns `None` when every block is full and `max_blocks`
    /// blocks already exist.
    ///
    /// The content of the unit is unspecified.
    pub fn alloc(&mut self) -> Option<Unit> {
        let unit = self.alloc_deferred();
        self.emit_pending();
        unit
    }

    /// Same as `alloc`, but the event it produces is kept until
    /// `take_event` is called.
    /// The owner of a locked pool reports it once the lock is released
    pub(crate) fn alloc_deferred(&mut self) -> Option<Unit> {
        let id = match self.partial.front() {
            Some(&id) => id,
            None => self.refill()?,
        };

        let block = &mut self.blocks[id];
        let ptr = block.allocate()?;

        if block.is_full() {
            self.partial.pop_front();
            self.push(BlockState::Full, id);
        }

        Some(Unit::new(ptr, self.geometry.unit_size, self.origin))
    }

    /// Puts a block at the head of the partial list
    fn refill(&mut self) -> Option<BlockId> {
        let id = match self.empty.pop_front() {
            Some(id) => id,
            None => self.grow()?,
        };

        self.push(BlockState::Partial, id);

        Some(id)
    }

    fn grow(&mut self) -> Option<BlockId> {
        if let Some(max_blocks) = self.max_blocks {
            if self.blocks.len() >= max_blocks {
                self.pending = Some(PoolEvent::CapacityExceeded {
                    origin: self.origin,
                    max_blocks,
                });
                return None;
            }
        }

        self.blocks.push(Block::new(&self.geometry));

        let blocks = self.blocks.len();
        self.pending = Some(PoolEvent::BlockCreated { origin: self.origin, blocks });

        Some(blocks - 1)
    }

    /// Frees a unit previously returned by [`alloc`]
    ///
    /// Returns `false` if the unit doesn't belong to this pool. The
    /// pool is left untouched in that case.
    ///
    /// The blocks most recently allocated from are searched first:
    /// the head of the partial list and the two blocks after it, then
    /// the partial and full lists are walked together.
    ///
    /// Freeing a unit that is already free is a logic error: it isn't
    /// always detected and can make the pool return the same unit twice.
    ///
    /// [`alloc`]: #method.alloc
    pub fn free(&mut self, unit: Unit) -> bool {
        let addr = unit.address();

        let mut partial = 0;
        let mut full = 0;

        while partial < HOT_PARTIAL_PROBES && partial < self.partial.len() {
            if self.release_in(Searched::Partial, partial, addr) {
                return true;
            }
            partial += 1;
        }

        while partial < self.partial.len() || full < self.full.len() {
            if partial < self.partial.len() {
                if self.release_in(Searched::Partial, partial, addr) {
                    return true;
                }
                partial += 1;
            }
            if full < self.full.len() {
                if self.release_in(Searched::Full, full, addr) {
                    return true;
                }
                full += 1;
            }
        }

        false
    }

    fn release_in(&mut self, list: Searched, position: usize, addr: usize) -> bool {
        let id = match list {
            Searched::Partial => self.partial[position],
            Searched::Full => self.full[position],
        };

        if !self.blocks[id].release(addr) {
            return false;
        }

        match list {
            // Already the hottest block, it stays there even when unused
            Searched::Partial if position == 0 => {}
            Searched::Partial => {
                self.partial.remove(position);

                if self.blocks[id].is_unused() {
                    self.push(BlockState::Empty, id);
                } else {
                    self.promote(id);
                }
            }
            Searched::Full => {
                self.full.remove(position);
                self.promote(id);
            }
        }

        true
    }

    /// Makes `id` the head of the partial list.
    /// An unused block only stays in the partial list as its head, so the
    /// previous head moves to the empty list if it's unused
    fn promote(&mut self, id: BlockId) {
        if let Some(&head) = self.partial.front() {
            if self.blocks[head].is_unused() {
                self.partial.pop_front();
                self.push(BlockState::Empty, head);
            }
        }

        self.push(BlockState::Partial, id);
    }

    fn push(&mut self, state: BlockState, id: BlockId) {
        self.blocks[id].state = state;

        match state {
            BlockState::Full => self.full.push_front(id),
            BlockState::Partial => self.partial.push_front(id),
            BlockState::Empty => self.empty.push_front(id),
        }
    }

    /// Returns `true` if `unit` was allocated from one of our blocks
    pub fn contains(&self, unit: &Unit) -> bool {
        let addr = unit.address();
        self.blocks.iter().any(|block| block.contains(addr))
    }

    /// Deallocates empty blocks until at most `keep_empty` remain
    ///
    /// The least recently emptied blocks go first. Returns the number
    /// of blocks released. The pool can grow again up to `max_blocks`.
    ///
    /// ## Example
    ///
    /// ```
    /// use unit_pool::Pool;
    ///
    /// let mut pool = Pool::new(8, 1, -1);
    ///
    /// let units: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
    /// for unit in units {
    ///     pool.free(unit);
    /// }
    ///
    /// // One unused block stays at the head of the partial list
    /// assert_eq!(pool.stats().empty, 3);
    /// assert_eq!(pool.shrink_to(1), 2);
    /// assert_eq!(pool.block_count(), 2);
    /// ```
    pub fn shrink_to(&mut self, keep_empty: usize) -> usize {
        let released = self.shrink_deferred(keep_empty);
        self.emit_pending();
        released
    }

    pub(crate) fn shrink_deferred(&mut self, keep_empty: usize) -> usize {
        let mut released = 0;

        while self.empty.len() > keep_empty {
            let id = match self.empty.pop_back() {
                Some(id) => id,
                None => break,
            };
            self.remove_block(id);
            released += 1;
        }

        if released > 0 {
            self.pending = Some(PoolEvent::BlocksReleased {
                origin: self.origin,
                released,
                blocks: self.blocks.len(),
            });
        }

        released
    }

    pub(crate) fn take_event(&mut self) -> Option<PoolEvent> {
        self.pending.take()
    }

    fn emit_pending(&mut self) {
        if let Some(event) = self.pending.take() {
            self.observer.on_event(&event);
        }
    }

    /// Deallocates every empty block
    pub fn shrink_to_fit(&mut self) -> usize {
        self.shrink_to(0)
    }

    /// Drops the block `id`, it must not be referenced by any list
    fn remove_block(&mut self, id: BlockId) {
        let last = self.blocks.len() - 1;

        self.blocks.swap_remove(id);

        if id == last {
            return;
        }

        // The last block moved to `id`
        let list = match self.blocks[id].state {
            BlockState::Full => &mut self.full,
            BlockState::Partial => &mut self.partial,
            BlockState::Empty => &mut self.empty,
        };

        if let Some(slot) = list.iter_mut().find(|slot| **slot == last) {
            *slot = id;
        }
    }

    /// Number of blocks allocated by the pool
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn max_blocks(&self) -> Option<usize> {
        self.max_blocks
    }

    pub fn unit_size(&self) -> usize {
        self.geometry.unit_size
    }

    pub fn units_per_block(&self) -> usize {
        self.geometry.unit_count
    }

    /// Returns the number of blocks in each list and the number of
    /// used and free units
    ///
    /// ## Example
    ///
    /// ```
    /// use unit_pool::Pool;
    ///
    /// let mut pool = Pool::new(32, 8, -1);
    /// let _unit = pool.alloc();
    ///
    /// let stats = pool.stats();
    /// assert!(stats.used_units == 1 && stats.free_units == 7);
    /// ```
    pub fn stats(&self) -> PoolStats {
        let free_units: usize = self.blocks.iter().map(Block::free_count).sum();
        let total: usize = self.blocks.iter().map(Block::unit_count).sum();

        PoolStats {
            blocks: self.blocks.len(),
            full: self.full.len(),
            partial: self.partial.len(),
            empty: self.empty.len(),
            used_units: total - free_units,
            free_units,
        }
    }

    /// Checks that every block is in exactly one list, the one matching
    /// its number of free units
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut seen = vec![0; self.blocks.len()];

        let lists = [
            (BlockState::Full, &self.full),
            (BlockState::Partial, &self.partial),
            (BlockState::Empty, &self.empty),
        ];

        for (state, list) in lists.iter() {
            for (position, &id) in list.iter().enumerate() {
                let block = &self.blocks[id];
                seen[id] += 1;

                assert_eq!(block.state, *state, "block {} in the wrong list", id);

                match state {
                    BlockState::Full => assert!(block.is_full()),
                    BlockState::Partial => {
                        assert!(!block.is_full());
                        assert!(position == 0 || !block.is_unused(), "unused block {} not at head", id);
                    }
                    BlockState::Empty => assert!(block.is_unused()),
                }
            }
        }

        assert!(seen.iter().all(|n| *n == 1), "blocks not in exactly one list: {:?}", seen);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let stats = self.stats();

        f.debug_struct("Pool")
         .field("unit_size", &self.geometry.unit_size)
         .field("units_per_block", &self.geometry.unit_count)
         .field("max_blocks", &self.max_blocks)
         .field("origin", &self.origin)
         .field("units_used", &stats.used_units)
         .field("units_free", &stats.free_units)
         .field("full", &self.full)
         .field("partial", &self.partial)
         .field("empty", &self.empty)
         .field("blocks", &self.blocks)
         .finish()
    }
}
