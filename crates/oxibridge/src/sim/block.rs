//! Block runtime of the simulated runtime: `_Block_copy` and
//! `_Block_release` with libclosure semantics.
//!
//! Heap blocks keep their reference count in the flags word, in steps of 2,
//! under [`BLOCK_REFCOUNT_MASK`]. A count that reaches the mask latches and
//! the block is never freed.

use crate::runtime::block::{
    BLOCK_DEALLOCATING, BLOCK_HAS_COPY_DISPOSE, BLOCK_IS_GLOBAL, BLOCK_NEEDS_FREE,
    BLOCK_REFCOUNT_MASK, BlockDescriptor, BlockLiteral,
};
use oxibridge_log::{error, trace};
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

// Distinct contents keep the two statics from sharing an address.
static STACK_BLOCK_ISA: [usize; 2] = [0x5354_4143, 0];
static MALLOC_BLOCK_ISA: [usize; 2] = [0x4d41_4c4c, 0];

pub(crate) fn stack_block_isa() -> *const c_void {
    (&raw const STACK_BLOCK_ISA).cast()
}

pub(crate) fn malloc_block_isa() -> *const c_void {
    (&raw const MALLOC_BLOCK_ISA).cast()
}

/// Counts heap blocks that have been copied and not yet freed.
#[derive(Debug, Default)]
pub(crate) struct HeapBlocks {
    live: AtomicUsize,
}

impl HeapBlocks {
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// `_Block_copy`.
    ///
    /// # Safety
    ///
    /// `block` must be null or point to a valid block literal whose
    /// descriptor describes its size.
    pub(crate) unsafe fn copy(&self, block: *const BlockLiteral) -> *mut BlockLiteral {
        if block.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: the flags word of a valid literal, updated atomically by
        // every copy and release.
        let flags = unsafe { AtomicI32::from_ptr((&raw const (*block).flags).cast_mut()) };
        let current = flags.load(Ordering::Acquire);

        if current & BLOCK_NEEDS_FREE != 0 {
            let _ = flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                (f & BLOCK_REFCOUNT_MASK != BLOCK_REFCOUNT_MASK).then_some(f + 2)
            });
            return block.cast_mut();
        }
        if current & BLOCK_IS_GLOBAL != 0 {
            return block.cast_mut();
        }

        // SAFETY: stack blocks are not shared yet; plain reads suffice.
        let descriptor = unsafe { (*block).descriptor };
        let Some(layout) = block_layout(descriptor) else {
            error!("_Block_copy: block {:p} has no usable descriptor", block);
            return std::ptr::null_mut();
        };

        // SAFETY: the layout covers at least the block header.
        let copy = unsafe { alloc::alloc(layout) }.cast::<BlockLiteral>();
        if copy.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: `copy` has room for `layout.size()` bytes and the source
        // is a block of that size.
        unsafe {
            std::ptr::copy_nonoverlapping(block.cast::<u8>(), copy.cast::<u8>(), layout.size());
            (*copy).flags = (current & !(BLOCK_REFCOUNT_MASK | BLOCK_DEALLOCATING))
                | BLOCK_NEEDS_FREE
                | 2;
            (*copy).isa = malloc_block_isa();
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        trace!("_Block_copy: {:p} -> heap {:p}", block, copy);

        if current & BLOCK_HAS_COPY_DISPOSE != 0 {
            // SAFETY: HAS_COPY_DISPOSE announces the helper words.
            if let Some(helper) = unsafe { (*descriptor).copy_helper } {
                // SAFETY: `copy` is a complete heap copy of `block`.
                unsafe { helper(copy, block) };
            }
        }
        copy
    }

    /// `_Block_release`.
    ///
    /// # Safety
    ///
    /// `block` must be null or a block returned by [`HeapBlocks::copy`]
    /// whose reference has not been released yet.
    pub(crate) unsafe fn release(&self, block: *const BlockLiteral) {
        if block.is_null() {
            return;
        }
        // SAFETY: see `copy`.
        let flags = unsafe { AtomicI32::from_ptr((&raw const (*block).flags).cast_mut()) };
        if flags.load(Ordering::Acquire) & BLOCK_NEEDS_FREE == 0 {
            return;
        }

        let previous = flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
            match f & BLOCK_REFCOUNT_MASK {
                0 | BLOCK_REFCOUNT_MASK => None,
                2 => Some((f & !BLOCK_REFCOUNT_MASK) | BLOCK_DEALLOCATING),
                _ => Some(f - 2),
            }
        });
        let previous = match previous {
            Ok(previous) => previous,
            Err(latched) if latched & BLOCK_REFCOUNT_MASK != 0 => return,
            Err(_) => {
                error!("_Block_release: over-release of block {:p}", block);
                return;
            }
        };
        if previous & BLOCK_REFCOUNT_MASK != 2 {
            return;
        }

        // SAFETY: the count reached zero, so this thread owns the block.
        unsafe { self.destroy(block.cast_mut(), previous) };
    }

    unsafe fn destroy(&self, block: *mut BlockLiteral, flags: i32) {
        // SAFETY: read before the dispose helper can touch the literal.
        let descriptor = unsafe { (*block).descriptor };
        if flags & BLOCK_HAS_COPY_DISPOSE != 0 {
            // SAFETY: HAS_COPY_DISPOSE announces the helper words.
            if let Some(helper) = unsafe { (*descriptor).dispose_helper } {
                // SAFETY: the block is still allocated.
                unsafe { helper(block) };
            }
        }
        if let Some(layout) = block_layout(descriptor) {
            // SAFETY: allocated by `copy` with this layout.
            unsafe { alloc::dealloc(block.cast(), layout) };
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        trace!("_Block_release: freed {:p}", block);
    }
}

fn block_layout(descriptor: *const BlockDescriptor) -> Option<Layout> {
    // SAFETY: non-null descriptors of valid blocks are readable.
    let size = unsafe { descriptor.as_ref() }?.size;
    if size < std::mem::offset_of!(BlockLiteral, lifetime) {
        return None;
    }
    Layout::from_size_align(size, align_of::<BlockLiteral>()).ok()
}
