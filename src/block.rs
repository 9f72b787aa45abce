use std::alloc::{alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

use crate::common::{Geometry, HEADER_SIZE};

/// List of the pool referencing a block
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// No free unit
    Full,
    /// At least one free unit, and at least one used unit unless it's
    /// the head of the partial list
    Partial,
    /// All units are free
    Empty,
}

/// A contiguous region of `unit_count` units
///
/// Every unit is preceded by a header of `HEADER_SIZE` bytes:
///
/// ```text
/// base
/// |-- stride --|-- stride --|
/// [hdr|payload][hdr|payload] ...
/// ```
///
/// The header of a free unit contains the index of the next free unit,
/// `unit_count` ends the list.
/// The header of an allocated unit is left untouched and its payload is
/// never read nor written here.
pub(crate) struct Block {
    base: NonNull<u8>,
    geometry: Geometry,
    free_count: usize,
    free_head: usize,
    pub state: BlockState,
}

impl Block {
    pub fn new(geometry: &Geometry) -> Block {
        let layout = geometry.layout;

        let base = unsafe { alloc(layout) };
        let base = match NonNull::new(base) {
            Some(base) => base,
            None => handle_alloc_error(layout),
        };

        let mut block = Block {
            base,
            geometry: *geometry,
            free_count: geometry.unit_count,
            free_head: 0,
            state: BlockState::Empty,
        };

        // Initial free list: 0 -> 1 -> ... -> unit_count - 1 -> unit_count
        // The sentinel `unit_count` always fits in a header, a block can't
        // hold more than usize::MAX units
        for index in 0..geometry.unit_count {
            unsafe { block.write_next(index, index + 1) };
        }

        block
    }

    /// Pointer to the header of the unit `index`
    ///
    /// ## Safety
    ///
    /// `index` must be lower than `unit_count`
    unsafe fn header(&self, index: usize) -> *mut usize {
        debug_assert!(index < self.geometry.unit_count);
        self.base.as_ptr().add(index * self.geometry.stride) as *mut usize
    }

    unsafe fn write_next(&mut self, index: usize, next: usize) {
        self.header(index).write(next);
    }

    /// Takes the unit at the head of the free list
    ///
    /// Returns the address of its payload, or `None` if the block is full
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let index = self.free_head;

        // The second condition only trips if the free list was corrupted
        // by a double free or a write in a freed unit
        if self.free_count == 0 || index >= self.geometry.unit_count {
            return None;
        }

        let header = unsafe { self.header(index) };

        self.free_head = unsafe { header.read() };
        self.free_count -= 1;

        let payload = unsafe { (header as *mut u8).add(HEADER_SIZE) };

        NonNull::new(payload)
    }

    /// Offset of the header of the unit owning `addr`
    fn offset_of(&self, addr: usize) -> Option<usize> {
        let start = addr.checked_sub(HEADER_SIZE)?;
        let base = self.base.as_ptr() as usize;

        if start < base || start >= base + self.geometry.block_size() {
            return None;
        }

        let offset = start - base;

        if offset % self.geometry.stride != 0 {
            return None;
        }

        Some(offset)
    }

    /// Returns `true` if `addr` is the payload address of one of our units
    pub fn contains(&self, addr: usize) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Gives back the unit whose payload starts at `addr`
    ///
    /// Returns `false` if `addr` isn't the payload of one our units.
    /// A unit already free is only caught when every unit of the block
    /// is free or when it sits at the head of the free list.
    pub fn release(&mut self, addr: usize) -> bool {
        let index = match self.offset_of(addr) {
            Some(offset) => offset / self.geometry.stride,
            None => return false,
        };

        if self.free_count == self.geometry.unit_count || index == self.free_head {
            return false;
        }

        let head = self.free_head;
        unsafe { self.write_next(index, head) };

        self.free_head = index;
        self.free_count += 1;

        true
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn unit_count(&self) -> usize {
        self.geometry.unit_count
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// All units are free
    pub fn is_unused(&self) -> bool {
        self.free_count == self.geometry.unit_count
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base.as_ptr(), self.geometry.layout);
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Block")
         .field("base", &self.base)
         .field("free", &self.free_count)
         .field("used", &(self.geometry.unit_count - self.free_count))
         .field("state", &self.state)
         .finish()
    }
}
