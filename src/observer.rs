use crate::unit::Origin;

/// Operation that fell back to the shared pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FallbackOp {
    Alloc,
    Free,
}

/// Events reported by the pools
///
/// They are emitted on the slow paths only (block creation, exhaustion,
/// shared pool fallback, shrinking). Allocating or freeing in a local
/// pool that has room never emits anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new block was allocated, `blocks` is the new block count
    BlockCreated { origin: Origin, blocks: usize },
    /// An allocation failed because the block budget is reached
    CapacityExceeded { origin: Origin, max_blocks: usize },
    /// `shrink_to` deallocated `released` empty blocks
    BlocksReleased { origin: Origin, released: usize, blocks: usize },
    /// The local pool of `shard` couldn't serve the operation,
    /// the shared pool was used under its lock
    SharedFallback { shard: usize, op: FallbackOp, success: bool },
    /// A unit produced by `origin` was freed through `shard`
    ShardMismatch { shard: usize, origin: Origin },
}

/// Receives the [`PoolEvent`]s of a pool
///
/// The default observer of the pools is [`TracingObserver`].
///
/// ## Example
///
/// ```
/// use unit_pool::{Pool, PoolEvent, PoolObserver};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountExhaustion(AtomicUsize);
///
/// impl PoolObserver for CountExhaustion {
///     fn on_event(&self, event: &PoolEvent) {
///         if let PoolEvent::CapacityExceeded { .. } = event {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
///
/// let observer = Arc::new(CountExhaustion::default());
/// let mut pool = Pool::new(8, 1, 1).with_observer(observer.clone());
///
/// assert!(pool.alloc().is_some());
/// assert!(pool.alloc().is_none());
/// assert_eq!(observer.0.load(Ordering::Relaxed), 1);
/// ```
///
/// [`PoolEvent`]: ./enum.PoolEvent.html
/// [`TracingObserver`]: ./struct.TracingObserver.html
pub trait PoolObserver: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}

/// Forwards the events to `tracing`
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_event(&self, event: &PoolEvent) {
        match *event {
            PoolEvent::BlockCreated { origin, blocks } => {
                tracing::debug!(?origin, blocks, "new block allocated");
            }
            PoolEvent::CapacityExceeded { origin, max_blocks } => {
                if overflows_to_shared(origin) {
                    tracing::debug!(?origin, max_blocks, "over max block count");
                } else {
                    tracing::warn!(?origin, max_blocks, "over max block count");
                }
            }
            PoolEvent::BlocksReleased { origin, released, blocks } => {
                tracing::debug!(?origin, released, blocks, "empty blocks released");
            }
            PoolEvent::SharedFallback { shard, op, success } => {
                tracing::debug!(shard, ?op, success, "shared pool used");
            }
            PoolEvent::ShardMismatch { shard, origin } => {
                tracing::warn!(shard, ?origin, "unit freed through another shard");
            }
        }
    }
}

/// A full local shard isn't a failure, the allocation continues
/// in the shared pool
fn overflows_to_shared(origin: Origin) -> bool {
    matches!(origin, Origin::Local(_))
}

/// Discards every event
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {
    fn on_event(&self, _event: &PoolEvent) {}
}

/// Observer keeping every event, for tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordObserver {
    events: parking_lot::Mutex<Vec<PoolEvent>>,
}

#[cfg(test)]
impl RecordObserver {
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl PoolObserver for RecordObserver {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::{overflows_to_shared, FallbackOp, NoopObserver, PoolEvent, PoolObserver, TracingObserver};
    use crate::unit::Origin;

    #[test]
    fn observers_accept_every_event() {
        let events = [
            PoolEvent::BlockCreated { origin: Origin::Pool, blocks: 1 },
            PoolEvent::CapacityExceeded { origin: Origin::Local(1), max_blocks: 2 },
            PoolEvent::BlocksReleased { origin: Origin::Shared, released: 1, blocks: 0 },
            PoolEvent::SharedFallback { shard: 0, op: FallbackOp::Alloc, success: false },
            PoolEvent::ShardMismatch { shard: 0, origin: Origin::Local(1) },
        ];

        for event in &events {
            TracingObserver.on_event(event);
            NoopObserver.on_event(event);
        }
    }

    #[test]
    fn only_local_exhaustion_is_quiet() {
        assert!(overflows_to_shared(Origin::Local(0)));
        assert!(overflows_to_shared(Origin::Local(7)));
        assert!(!overflows_to_shared(Origin::Shared));
        assert!(!overflows_to_shared(Origin::Pool));
    }
}
