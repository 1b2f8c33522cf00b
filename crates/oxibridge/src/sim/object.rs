//! Heap objects of the simulated runtime.
//!
//! An object is a fixed header followed by zeroed storage: the class's own
//! ivars, then the extra bytes requested at allocation (the indexed ivars).
//!
//! ```text
//! +---------+----------+------+------------------+-------------+
//! | isa     | refcount | size | class ivars      | extra bytes |
//! +---------+----------+------+------------------+-------------+
//! ```

use crate::runtime::native::ClassRef;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

const OBJECT_ALIGN: usize = 16;

/// Object header.
#[repr(C)]
pub(crate) struct RawObject {
    isa: ClassRef,
    refcount: AtomicU32,
    /// Total allocation size, header included.
    size: usize,
    payload: [u8; 0],
}

impl RawObject {
    fn layout(payload: usize) -> Option<Layout> {
        let size = size_of::<RawObject>().checked_add(payload)?;
        Layout::from_size_align(size, OBJECT_ALIGN).ok()
    }

    /// Allocates a zeroed object with a reference count of 1.
    ///
    /// Returns `None` if the size overflows or the allocator fails.
    pub(crate) fn allocate(isa: ClassRef, payload: usize) -> Option<NonNull<RawObject>> {
        let layout = Self::layout(payload)?;
        // SAFETY: the layout is never zero-sized; it always covers the header.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?.cast::<RawObject>();
        // SAFETY: freshly allocated, aligned and large enough for the header.
        unsafe {
            ptr.as_ptr().write(RawObject {
                isa,
                refcount: AtomicU32::new(1),
                size: layout.size(),
                payload: [],
            });
        }
        Some(ptr)
    }

    /// Frees an object regardless of its reference count.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`RawObject::allocate`] and must not be used
    /// afterwards.
    pub(crate) unsafe fn free(ptr: NonNull<RawObject>) {
        // SAFETY: the caller guarantees the header is live.
        let size = unsafe { ptr.as_ref().size };
        // SAFETY: `size` was validated by `Layout::from_size_align` at
        // allocation.
        let layout = unsafe { Layout::from_size_align_unchecked(size, OBJECT_ALIGN) };
        // SAFETY: same pointer and layout as the allocation.
        unsafe { alloc::dealloc(ptr.as_ptr().cast(), layout) };
    }

    pub(crate) fn isa(&self) -> ClassRef {
        self.isa
    }

    /// Returns the start of the storage after the header.
    pub(crate) fn payload(&self) -> *mut u8 {
        self.payload.as_ptr().cast_mut()
    }

    /// Increments the reference count.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow.
    pub(crate) fn retain(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(old < u32::MAX, "object refcount overflow");
    }

    /// Decrements the reference count. Returns true if this was the last
    /// reference; the caller then frees the object.
    pub(crate) fn release(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::Release);
        if old == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            return true;
        }
        false
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zeroed() {
        let ptr = RawObject::allocate(ClassRef::NO_CLASS, 32).unwrap();
        let object = unsafe { ptr.as_ref() };

        assert_eq!(object.refcount(), 1);
        assert_eq!(object.isa(), ClassRef::NO_CLASS);
        assert_eq!(object.payload() as usize % 8, 0);
        let bytes = unsafe { std::slice::from_raw_parts(object.payload(), 32) };
        assert!(bytes.iter().all(|b| *b == 0));

        unsafe { RawObject::free(ptr) };
    }

    #[test]
    fn test_retain_release() {
        let ptr = RawObject::allocate(ClassRef::NO_CLASS, 0).unwrap();
        let object = unsafe { ptr.as_ref() };

        object.retain();
        assert_eq!(object.refcount(), 2);
        assert!(!object.release());
        assert!(object.release());

        unsafe { RawObject::free(ptr) };
    }
}
