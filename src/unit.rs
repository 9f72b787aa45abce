use std::ptr::NonNull;

/// Which pool handed out a [`Unit`]
///
/// [`Unit`]: ./struct.Unit.html
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A standalone [`Pool`], or a handle built with [`Unit::from_raw`]
    ///
    /// [`Pool`]: ./struct.Pool.html
    /// [`Unit::from_raw`]: ./struct.Unit.html#method.from_raw
    Pool,
    /// The local pool of this shard in a [`ShardedPool`]
    ///
    /// [`ShardedPool`]: ./struct.ShardedPool.html
    Local(usize),
    /// The shared overflow pool of a [`ShardedPool`]
    ///
    /// [`ShardedPool`]: ./struct.ShardedPool.html
    Shared,
}

/// Handle to a unit allocated in a pool
///
/// A `Unit` is only an address: it doesn't borrow the pool and
/// dropping it doesn't free anything. Give it back with
/// [`Pool::free`] or [`ShardedPool::free`].
///
/// The pool never reads or writes the payload of an allocated unit,
/// the `len()` bytes behind [`as_ptr`] belong to the caller until
/// the unit is freed.
///
/// The handle is `Copy`, so nothing prevents freeing it twice. The pool
/// rejects some double frees but not all of them, freeing a unit that is
/// already free can hand the same unit out twice.
///
/// [`Pool::free`]: ./struct.Pool.html#method.free
/// [`ShardedPool::free`]: ./struct.ShardedPool.html#method.free
/// [`as_ptr`]: #method.as_ptr
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Unit {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

// A Unit is an address, the memory it points to is owned by the pool
unsafe impl Send for Unit {}
unsafe impl Sync for Unit {}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Unit")
         .field("ptr", &self.ptr)
         .field("len", &self.len)
         .field("origin", &self.origin)
         .finish()
    }
}

impl Unit {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, origin: Origin) -> Unit {
        Unit { ptr, len, origin }
    }

    /// Builds a handle from an arbitrary address
    ///
    /// Freeing it is harmless when the address doesn't belong to the
    /// pool: `free` only compares it with the bounds of its blocks and
    /// returns `false`.
    ///
    /// ## Example
    ///
    /// ```
    /// use unit_pool::{Pool, Unit};
    /// use std::ptr::NonNull;
    ///
    /// let mut pool = Pool::new(16, 4, 1);
    /// let mut local = [0u8; 16];
    ///
    /// let foreign = Unit::from_raw(NonNull::from(&mut local).cast(), 16);
    /// assert!(!pool.free(foreign));
    /// ```
    pub fn from_raw(ptr: NonNull<u8>, len: usize) -> Unit {
        Unit { ptr, len, origin: Origin::Pool }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the payload, the `unit_size` of the pool
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Returns the payload as a mutable slice
    ///
    /// ## Safety
    ///
    /// The unit must be currently allocated, its pool must outlive the
    /// returned slice, and the caller must not create another
    /// reference to the same payload while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}
