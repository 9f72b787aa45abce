use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering::*};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache_line::CacheAligned;
use crate::common::block_limit;
use crate::config::{BlockConfig, ShardedPoolConfig};
use crate::error::ConfigError;
use crate::observer::{FallbackOp, PoolEvent, PoolObserver, TracingObserver};
use crate::pool::{Pool, PoolStats};
use crate::unit::{Origin, Unit};

/// A local pool, accessed without lock by a single caller at a time
struct LocalShard {
    in_use: AtomicBool,
    pool: UnsafeCell<Pool>,
}

// The pool is only reached through a ShardGuard
unsafe impl Sync for LocalShard {}

/// Exclusive access to a local pool
///
/// This is not a lock: a shard is meant to be used by one thread at a
/// time, claiming a shard already in use is a bug of the caller and panics.
struct ShardGuard<'a> {
    shard: &'a LocalShard,
}

impl ShardGuard<'_> {
    fn claim(shard: &LocalShard, index: usize) -> ShardGuard {
        if shard.in_use.swap(true, AcqRel) {
            panic!("shard {} is used by two callers at the same time", index);
        }
        ShardGuard { shard }
    }

    fn pool(&mut self) -> &mut Pool {
        unsafe { &mut *self.shard.pool.get() }
    }
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        self.shard.in_use.store(false, Release);
    }
}

/// A pool split into shards, with a shared overflow pool
///
/// Each shard owns a local [`Pool`], used without locking. When the local
/// pool of a shard is exhausted, units are taken from the shared pool,
/// guarded by a mutex.
///
/// A shard must be used by a single thread at a time: give each worker
/// its own shard index. Using the same shard from two threads at once
/// panics.
///
/// Units should be freed through the shard that allocated them. The
/// local pool only knows its own blocks: freeing a unit of shard 0
/// through shard 1 returns `false` and the unit stays allocated.
/// [`free_routed`] uses the origin recorded in the [`Unit`] instead.
///
/// ## Example
///
/// ```
/// use unit_pool::ShardedPool;
/// use std::sync::Arc;
/// use std::thread;
///
/// let pool = Arc::new(ShardedPool::new(4, 64, 16, 1, 64, -1));
///
/// let handles: Vec<_> = (0..4).map(|shard| {
///     let pool = pool.clone();
///     thread::spawn(move || {
///         let units: Vec<_> = (0..32).map(|_| pool.alloc(shard).unwrap()).collect();
///         for unit in units {
///             assert!(pool.free(shard, unit));
///         }
///     })
/// }).collect();
///
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// ```
///
/// [`Pool`]: ./struct.Pool.html
/// [`Unit`]: ./struct.Unit.html
/// [`free_routed`]: #method.free_routed
pub struct ShardedPool {
    locals: Box<[CacheAligned<LocalShard>]>,
    shared: Mutex<Pool>,
    observer: Arc<dyn PoolObserver>,
}

impl ShardedPool {
    /// Constructs a pool of `shards` local pools and one shared pool,
    /// all with units of `unit_size` bytes
    ///
    /// A negative `local_max_blocks` or `shared_max_blocks` means that
    /// pool is unbounded.
    ///
    /// ## Panics
    ///
    /// Panics if `shards`, `unit_size` or a number of units per block is
    /// zero. See [`with_config`] for a fallible version.
    ///
    /// [`with_config`]: #method.with_config
    pub fn new(
        shards: usize,
        unit_size: usize,
        local_units_per_block: usize,
        local_max_blocks: isize,
        shared_units_per_block: usize,
        shared_max_blocks: isize,
    ) -> ShardedPool {
        let config = ShardedPoolConfig {
            shards,
            unit_size,
            local: BlockConfig {
                units_per_block: local_units_per_block,
                max_blocks: block_limit(local_max_blocks),
            },
            shared: BlockConfig {
                units_per_block: shared_units_per_block,
                max_blocks: block_limit(shared_max_blocks),
            },
        };

        match ShardedPool::with_config(&config) {
            Ok(pool) => pool,
            Err(e) => panic!("invalid sharded pool configuration: {}", e),
        }
    }

    pub fn with_config(config: &ShardedPoolConfig) -> Result<ShardedPool, ConfigError> {
        config.validate()?;

        let local = config.local_pool();
        let locals = (0..config.shards)
            .map(|index| {
                let pool = Pool::with_config(&local)?.with_origin(Origin::Local(index));
                Ok(CacheAligned::new(LocalShard {
                    in_use: AtomicBool::new(false),
                    pool: UnsafeCell::new(pool),
                }))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let shared = Pool::with_config(&config.shared_pool())?.with_origin(Origin::Shared);

        Ok(ShardedPool {
            locals: locals.into_boxed_slice(),
            shared: Mutex::new(shared),
            observer: Arc::new(TracingObserver),
        })
    }

    /// Replaces the observer receiving the events of this pool and of
    /// all its inner pools
    ///
    /// Events are delivered once the shard or the shared pool they come
    /// from is released, so the observer can call back into the pool.
    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> ShardedPool {
        self.observer = observer;
        self
    }

    fn emit(&self, event: Option<PoolEvent>) {
        if let Some(event) = event {
            self.observer.on_event(&event);
        }
    }

    fn local(&self, shard: usize) -> &LocalShard {
        assert!(
            shard < self.locals.len(),
            "shard {} out of range, the pool has {} shards", shard, self.locals.len()
        );
        &self.locals[shard]
    }

    /// Allocates a unit from the local pool of `shard`, or from the shared
    /// pool when the local pool is exhausted
    ///
    /// Returns `None` if both are exhausted, even if other shards
    /// have free units.
    ///
    /// ## Panics
    ///
    /// Panics if `shard` is out of range, or used by another thread
    /// at the same time.
    pub fn alloc(&self, shard: usize) -> Option<Unit> {
        let (unit, event) = {
            let mut guard = ShardGuard::claim(self.local(shard), shard);
            let pool = guard.pool();
            (pool.alloc_deferred(), pool.take_event())
        };
        self.emit(event);

        if unit.is_some() {
            return unit;
        }

        let (unit, event) = {
            let mut shared = self.shared.lock();
            (shared.alloc_deferred(), shared.take_event())
        };
        self.emit(event);

        self.observer.on_event(&PoolEvent::SharedFallback {
            shard,
            op: FallbackOp::Alloc,
            success: unit.is_some(),
        });

        unit
    }

    /// Frees a unit in the local pool of `shard`, or in the shared pool
    /// when the local pool doesn't own it
    ///
    /// Returns `false` if neither owns the unit. This includes units
    /// allocated by the local pool of another shard: they are not freed.
    ///
    /// ## Panics
    ///
    /// Panics if `shard` is out of range, or used by another thread
    /// at the same time.
    pub fn free(&self, shard: usize, unit: Unit) -> bool {
        let local = self.local(shard);

        if let Origin::Local(origin) = unit.origin() {
            if origin != shard {
                self.observer.on_event(&PoolEvent::ShardMismatch {
                    shard,
                    origin: unit.origin(),
                });
            }
        }

        let freed = {
            let mut guard = ShardGuard::claim(local, shard);
            guard.pool().free(unit)
        };

        if freed {
            return true;
        }

        let freed = self.shared.lock().free(unit);

        self.observer.on_event(&PoolEvent::SharedFallback {
            shard,
            op: FallbackOp::Free,
            success: freed,
        });

        freed
    }

    /// Frees a unit through the pool recorded in its origin
    ///
    /// Units of a local pool are freed through their shard, which must
    /// not be in use by another thread. Units of the shared pool go
    /// straight to the shared pool. Units that don't come from a
    /// `ShardedPool` are rejected.
    ///
    /// ## Example
    ///
    /// ```
    /// use unit_pool::ShardedPool;
    ///
    /// let pool = ShardedPool::new(2, 8, 1, 1, 1, 1);
    /// let unit = pool.alloc(0).unwrap();
    ///
    /// // The local pool of shard 1 doesn't own it
    /// assert!(!pool.free(1, unit));
    /// assert!(pool.free_routed(unit));
    /// ```
    pub fn free_routed(&self, unit: Unit) -> bool {
        match unit.origin() {
            Origin::Local(shard) if shard < self.locals.len() => self.free(shard, unit),
            Origin::Shared => self.shared.lock().free(unit),
            _ => false,
        }
    }

    pub fn shards(&self) -> usize {
        self.locals.len()
    }

    /// ## Panics
    ///
    /// Panics if `shard` is out of range, or used by another thread
    /// at the same time.
    pub fn local_stats(&self, shard: usize) -> PoolStats {
        let mut guard = ShardGuard::claim(self.local(shard), shard);
        guard.pool().stats()
    }

    pub fn shared_stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    /// Deallocates empty blocks of the local pool of `shard`, until at
    /// most `keep_empty` remain
    ///
    /// ## Panics
    ///
    /// Panics if `shard` is out of range, or used by another thread
    /// at the same time.
    pub fn shrink_local_to(&self, shard: usize, keep_empty: usize) -> usize {
        let (released, event) = {
            let mut guard = ShardGuard::claim(self.local(shard), shard);
            let pool = guard.pool();
            (pool.shrink_deferred(keep_empty), pool.take_event())
        };
        self.emit(event);
        released
    }

    /// Deallocates empty blocks of the shared pool, until at most
    /// `keep_empty` remain
    pub fn shrink_shared_to(&self, keep_empty: usize) -> usize {
        let (released, event) = {
            let mut shared = self.shared.lock();
            (shared.shrink_deferred(keep_empty), shared.take_event())
        };
        self.emit(event);
        released
    }
}

impl std::fmt::Debug for ShardedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShardedPool")
         .field("shards", &self.locals.len())
         .field("shared", &self.shared_stats())
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ShardGuard, ShardedPool};
    use crate::config::{BlockConfig, ShardedPoolConfig};
    use crate::error::ConfigError;
    use crate::observer::{FallbackOp, PoolEvent, PoolObserver, RecordObserver};
    use crate::unit::{Origin, Unit};

    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::{Arc, Barrier, Weak};
    use std::thread;

    #[test]
    fn shards_are_isolated() {
        let pool = ShardedPool::new(2, 8, 1, 1, 1, 1);

        let first = pool.alloc(0).unwrap();
        assert_eq!(first.origin(), Origin::Local(0));

        let second = pool.alloc(0).unwrap();
        assert_eq!(second.origin(), Origin::Shared);

        assert!(pool.alloc(0).is_none());

        // Shard 1 is untouched
        assert_eq!(pool.local_stats(1).blocks, 0);
        let other = pool.alloc(1).unwrap();
        assert_eq!(other.origin(), Origin::Local(1));

        assert!(pool.free(0, first));
        assert!(pool.free(0, second));
        assert!(pool.free(1, other));

        assert_eq!(pool.local_stats(0).used_units, 0);
        assert_eq!(pool.shared_stats().used_units, 0);
    }

    #[test]
    fn shared_units_freed_through_any_shard() {
        let pool = ShardedPool::new(3, 16, 2, 1, 4, 1);

        let locals: Vec<_> = (0..2).map(|_| pool.alloc(0).unwrap()).collect();
        let shared = pool.alloc(0).unwrap();
        assert_eq!(shared.origin(), Origin::Shared);

        assert!(pool.free(2, shared));
        for unit in locals {
            assert!(pool.free(0, unit));
        }
    }

    #[test]
    fn wrong_shard_is_a_false_negative() {
        let observer = Arc::new(RecordObserver::default());
        let pool = ShardedPool::new(2, 8, 4, 1, 4, 1).with_observer(observer.clone());

        let unit = pool.alloc(0).unwrap();

        assert!(!pool.free(1, unit));
        assert_eq!(pool.local_stats(0).used_units, 1);

        let events = observer.events();
        assert!(events.contains(&PoolEvent::ShardMismatch { shard: 1, origin: Origin::Local(0) }));
        assert!(events.contains(&PoolEvent::SharedFallback { shard: 1, op: FallbackOp::Free, success: false }));

        assert!(pool.free_routed(unit));
        assert_eq!(pool.local_stats(0).used_units, 0);
    }

    #[test]
    fn free_routed_follows_origin() {
        let pool = ShardedPool::new(2, 8, 1, 1, 2, 1);

        let local = pool.alloc(1).unwrap();
        let shared = pool.alloc(1).unwrap();
        assert_eq!(shared.origin(), Origin::Shared);

        assert!(pool.free_routed(shared));
        assert!(pool.free_routed(local));
        assert_eq!(pool.local_stats(1).used_units, 0);
        assert_eq!(pool.shared_stats().used_units, 0);

        let mut data = [0u8; 8];
        let foreign = Unit::from_raw(std::ptr::NonNull::from(&mut data).cast(), 8);
        assert!(!pool.free_routed(foreign));
    }

    #[test]
    fn fallback_events() {
        let observer = Arc::new(RecordObserver::default());
        let pool = ShardedPool::new(1, 8, 1, 1, 1, 1).with_observer(observer.clone());

        let a = pool.alloc(0).unwrap();
        let b = pool.alloc(0).unwrap();
        assert!(pool.alloc(0).is_none());
        assert!(pool.free(0, b));
        assert!(pool.free(0, a));

        assert_eq!(observer.events(), vec![
            PoolEvent::BlockCreated { origin: Origin::Local(0), blocks: 1 },
            PoolEvent::CapacityExceeded { origin: Origin::Local(0), max_blocks: 1 },
            PoolEvent::BlockCreated { origin: Origin::Shared, blocks: 1 },
            PoolEvent::SharedFallback { shard: 0, op: FallbackOp::Alloc, success: true },
            PoolEvent::CapacityExceeded { origin: Origin::Local(0), max_blocks: 1 },
            PoolEvent::CapacityExceeded { origin: Origin::Shared, max_blocks: 1 },
            PoolEvent::SharedFallback { shard: 0, op: FallbackOp::Alloc, success: false },
            PoolEvent::SharedFallback { shard: 0, op: FallbackOp::Free, success: true },
        ]);
    }

    /// Calls back into the pool from every event
    #[derive(Default)]
    struct ReentrantObserver {
        pool: Mutex<Weak<ShardedPool>>,
        calls: AtomicUsize,
    }

    impl PoolObserver for ReentrantObserver {
        fn on_event(&self, _event: &PoolEvent) {
            let pool = match self.pool.lock().upgrade() {
                Some(pool) => pool,
                None => return,
            };

            let _ = pool.shared_stats();
            for shard in 0..pool.shards() {
                let _ = pool.local_stats(shard);
            }
            self.calls.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn observer_can_use_the_pool() {
        let observer = Arc::new(ReentrantObserver::default());
        let pool = Arc::new(ShardedPool::new(1, 8, 1, 1, 1, -1).with_observer(observer.clone()));
        *observer.pool.lock() = Arc::downgrade(&pool);

        let local = pool.alloc(0).unwrap();
        let shared = pool.alloc(0).unwrap();
        let other = pool.alloc(0).unwrap();
        assert_eq!((shared.origin(), other.origin()), (Origin::Shared, Origin::Shared));

        for unit in [local, shared, other].iter() {
            assert!(pool.free(0, *unit));
        }
        assert_eq!(pool.shrink_shared_to(0), 1);
        assert_eq!(pool.shrink_local_to(0, 0), 0);

        // Block creations, local exhaustion, fallbacks and the shrink
        assert!(observer.calls.load(Relaxed) >= 8);
        assert_eq!(pool.shared_stats().blocks, 1);
    }

    #[test]
    fn shrink_shards() {
        let pool = ShardedPool::new(1, 8, 1, -1, 1, -1);

        let units: Vec<_> = (0..4).map(|_| pool.alloc(0).unwrap()).collect();
        for unit in units {
            assert!(pool.free(0, unit));
        }

        assert_eq!(pool.local_stats(0).empty, 3);
        assert_eq!(pool.shrink_local_to(0, 0), 3);
        assert_eq!(pool.local_stats(0).blocks, 1);
        assert_eq!(pool.shrink_shared_to(0), 0);
    }

    #[test]
    fn with_config_validates() {
        let config = ShardedPoolConfig {
            shards: 0,
            unit_size: 8,
            local: BlockConfig { units_per_block: 4, max_blocks: None },
            shared: BlockConfig { units_per_block: 4, max_blocks: None },
        };
        assert_eq!(ShardedPool::with_config(&config).err(), Some(ConfigError::NoShards));

        let config = ShardedPoolConfig { shards: 4, ..config };
        let pool = ShardedPool::with_config(&config).unwrap();
        assert_eq!(pool.shards(), 4);
        println!("{:?}", pool);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn shard_out_of_range() {
        let pool = ShardedPool::new(2, 8, 1, 1, 1, 1);
        pool.alloc(2);
    }

    #[test]
    #[should_panic(expected = "used by two callers")]
    fn shard_claimed_twice() {
        let pool = ShardedPool::new(2, 8, 1, 1, 1, 1);
        let _guard = ShardGuard::claim(pool.local(0), 0);
        pool.alloc(0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn sharded_with_threads() {
        test_with_threads(8, 2000);
    }

    #[test]
    fn miri_sharded_with_threads() {
        test_with_threads(4, 64);
    }

    fn test_with_threads(nthreads: usize, nrounds: usize) {
        // Small local pools, so the shared pool is used a lot
        let pool = Arc::new(ShardedPool::new(nthreads, 32, 4, 2, 16, -1));
        let barrier = Arc::new(Barrier::new(nthreads));

        let handles: Vec<_> = (0..nthreads).map(|shard| {
            let pool = pool.clone();
            let barrier = barrier.clone();

            thread::spawn(move || {
                let mut live: Vec<(Unit, u8)> = Vec::with_capacity(32);
                barrier.wait();

                for round in 0..nrounds {
                    let unit = pool.alloc(shard).unwrap();
                    let value = (shard * 31 + round) as u8;
                    unsafe { unit.as_mut_slice() }.fill(value);
                    live.push((unit, value));

                    if live.len() > 12 || round % 3 == 0 {
                        let (unit, value) = live.remove(round % live.len());
                        assert!(unsafe { unit.as_mut_slice() }.iter().all(|b| *b == value));
                        assert!(pool.free(shard, unit));
                    }
                }

                for (unit, value) in live {
                    assert!(unsafe { unit.as_mut_slice() }.iter().all(|b| *b == value));
                    assert!(pool.free(shard, unit));
                }
            })
        }).collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for shard in 0..nthreads {
            assert_eq!(pool.local_stats(shard).used_units, 0);
        }
        assert_eq!(pool.shared_stats().used_units, 0);
    }
}
