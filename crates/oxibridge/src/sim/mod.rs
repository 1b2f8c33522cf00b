//! An in-process native runtime.
//!
//! [`SimRuntime`] implements [`NativeRuntime`] without linking libobjc. It
//! keeps the observable semantics the bridge relies on: classes looked up
//! by name and never freed, instances with zeroed indexed ivars, interned
//! selectors, and libclosure-style block copy and release that run a
//! block's copy and dispose helpers.
//!
//! It also tracks what is alive, so tests can assert that nothing leaks.
//!
//! # Example
//!
//! ```rust
//! use oxibridge::{NativeRuntime, SimRuntime};
//!
//! let runtime = SimRuntime::new();
//! let class = runtime.define_class("NSAlpha", None).unwrap();
//!
//! let object = unsafe { runtime.create_instance(class, 8) };
//! assert_eq!(runtime.object_class_name(object).as_deref(), Some("NSAlpha"));
//! assert_eq!(runtime.live_objects(), 1);
//!
//! unsafe { runtime.destruct_instance(object) };
//! assert_eq!(runtime.live_objects(), 0);
//! ```

mod block;
mod class;
mod object;

use crate::error::Result;
use crate::runtime::block::BlockLiteral;
use crate::runtime::native::{ClassRef, Id, MessageSendCallbacks, NativeRuntime, Sel};
use block::HeapBlocks;
use class::ClassTable;
use fxhash::{FxHashMap, FxHashSet};
use object::RawObject;
use oxibridge_log::{trace, warn};
use std::ffi::{CString, c_void};
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock};

/// Simulated Objective-C runtime.
#[derive(Default)]
pub struct SimRuntime {
    classes: ClassTable,
    objects: RwLock<FxHashSet<usize>>,
    selectors: RwLock<FxHashMap<String, Sel>>,
    blocks: HeapBlocks,
    callbacks: RwLock<MessageSendCallbacks>,
}

impl SimRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class (`objc_allocateClassPair` + `objc_registerClassPair`).
    ///
    /// # Errors
    ///
    /// [`crate::Error::DuplicateRegistration`] if the name is taken, and
    /// [`crate::Error::InvalidNativeClass`] if `super_class` is not a class
    /// of this runtime or the name contains a NUL byte.
    pub fn define_class(&self, name: &str, super_class: Option<ClassRef>) -> Result<ClassRef> {
        self.define_class_with_ivars(name, super_class, 0)
    }

    /// Registers a class whose instances carry `ivar_bytes` of their own
    /// storage ahead of the indexed ivars.
    ///
    /// # Errors
    ///
    /// See [`SimRuntime::define_class`].
    pub fn define_class_with_ivars(
        &self,
        name: &str,
        super_class: Option<ClassRef>,
        ivar_bytes: usize,
    ) -> Result<ClassRef> {
        let class = self.classes.define(name, super_class, ivar_bytes)?;
        trace!("defined class {} at {:?}", name, class);
        Ok(class)
    }

    /// Superclass of a class (`class_getSuperclass`).
    #[must_use]
    pub fn super_class(&self, class: ClassRef) -> Option<ClassRef> {
        self.classes.super_class(class)
    }

    /// Number of registered classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Class of a live instance (`object_getClass`).
    #[must_use]
    pub fn object_class(&self, object: Id) -> Option<ClassRef> {
        // SAFETY: `raw_object` only yields live instances.
        self.raw_object(object).map(|raw| unsafe { raw.as_ref() }.isa())
    }

    /// Takes a native strong reference to an instance (`objc_retain`).
    /// Returns `object`, or nil if it is not a live instance.
    pub fn retain(&self, object: Id) -> Id {
        match self.raw_object(object) {
            Some(raw) => {
                // SAFETY: live per the object set.
                unsafe { raw.as_ref() }.retain();
                object
            }
            None => Id::NIL,
        }
    }

    /// Drops a native strong reference (`objc_release`), freeing the
    /// instance when it was the last.
    pub fn release(&self, object: Id) {
        let Some(raw) = self.raw_object(object) else {
            warn!("release of unknown object {:?}", object);
            return;
        };
        // SAFETY: live per the object set.
        if unsafe { raw.as_ref() }.release() {
            self.free_object(object, raw);
        }
    }

    /// Native reference count of a live instance.
    #[must_use]
    pub fn retain_count(&self, object: Id) -> Option<u32> {
        // SAFETY: `raw_object` only yields live instances.
        self.raw_object(object)
            .map(|raw| unsafe { raw.as_ref() }.refcount())
    }

    /// Number of live instances.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of heap blocks that have not been freed.
    #[must_use]
    pub fn live_heap_blocks(&self) -> usize {
        self.blocks.live()
    }

    /// The `objc_msgSend` overrides installed last.
    #[must_use]
    pub fn message_send_callbacks(&self) -> MessageSendCallbacks {
        *self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The `isa` of heap blocks (`_NSConcreteMallocBlock`).
    #[must_use]
    pub fn malloc_block_isa(&self) -> *const c_void {
        block::malloc_block_isa()
    }

    fn raw_object(&self, object: Id) -> Option<NonNull<RawObject>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        if !objects.contains(&object.addr()) {
            return None;
        }
        NonNull::new(object.as_ptr().cast())
    }

    fn free_object(&self, object: Id, raw: NonNull<RawObject>) {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object.addr());
        if removed {
            // SAFETY: removal from the set happens once per allocation.
            unsafe { RawObject::free(raw) };
            trace!("freed object {:?}", object);
        }
    }
}

impl NativeRuntime for SimRuntime {
    fn get_class(&self, name: &str) -> ClassRef {
        self.classes.lookup(name)
    }

    fn class_name(&self, class: ClassRef) -> Option<String> {
        self.classes
            .get(class)
            .map(|c| c.name().to_string_lossy().into_owned())
    }

    fn object_class_name(&self, object: Id) -> Option<String> {
        self.object_class(object)
            .and_then(|class| self.class_name(class))
    }

    fn register_selector(&self, name: &str) -> Sel {
        if let Some(sel) = self
            .selectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return *sel;
        }

        let mut selectors = self.selectors.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(sel) = selectors.get(name) {
            return *sel;
        }
        let Ok(c_name) = CString::new(name) else {
            return Sel::NO_SEL;
        };
        // Selectors live for the life of the process.
        let sel = Sel::from_ptr(c_name.into_raw().cast());
        selectors.insert(name.to_string(), sel);
        sel
    }

    unsafe fn create_instance(&self, class: ClassRef, extra_bytes: usize) -> Id {
        let Some(metadata) = self.classes.get(class) else {
            return Id::NIL;
        };
        let Some(payload) = metadata.instance_size().checked_add(extra_bytes) else {
            return Id::NIL;
        };
        let Some(raw) = RawObject::allocate(class, payload) else {
            return Id::NIL;
        };

        let object = Id::from_ptr(raw.as_ptr().cast());
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object.addr());
        trace!("created {:?} of {:?}", object, class);
        object
    }

    unsafe fn indexed_ivars(&self, object: Id) -> *mut u8 {
        let Some(raw) = self.raw_object(object) else {
            return std::ptr::null_mut();
        };
        // SAFETY: live per the object set.
        let raw = unsafe { raw.as_ref() };
        let ivars = self
            .classes
            .get(raw.isa())
            .map_or(0, |class| class.instance_size());
        // SAFETY: the payload holds the class ivars followed by the extra
        // bytes, so this stays inside the allocation.
        unsafe { raw.payload().add(ivars) }
    }

    unsafe fn destruct_instance(&self, object: Id) {
        match self.raw_object(object) {
            Some(raw) => self.free_object(object, raw),
            None => warn!("object_dispose of unknown object {:?}", object),
        }
    }

    unsafe fn block_copy(&self, block: *const BlockLiteral) -> *mut BlockLiteral {
        // SAFETY: forwarded to the caller.
        unsafe { self.blocks.copy(block) }
    }

    unsafe fn block_release(&self, block: *const BlockLiteral) {
        // SAFETY: forwarded to the caller.
        unsafe { self.blocks.release(block) }
    }

    fn stack_block_isa(&self) -> *const c_void {
        block::stack_block_isa()
    }

    fn set_message_send_callbacks(&self, callbacks: &MessageSendCallbacks) -> bool {
        *self.callbacks.write().unwrap_or_else(PoisonError::into_inner) = *callbacks;
        true
    }
}

impl Drop for SimRuntime {
    fn drop(&mut self) {
        let objects = std::mem::take(
            self.objects
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for addr in objects {
            if let Some(raw) = NonNull::new(addr as *mut RawObject) {
                // SAFETY: every address in the set is a live allocation.
                unsafe { RawObject::free(raw) };
            }
        }
    }
}
