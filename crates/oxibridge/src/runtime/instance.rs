//! Native instances that stand for managed objects.
//!
//! Each instance is allocated with one word of trailing storage that holds
//! the [`GcHandle`] of its managed object (the back-reference). Native code
//! that receives such an instance, e.g. a method trampoline, recovers the
//! managed object from that word.
//!
//! ```text
//! +--------------------+------------------+
//! | native object      | GcHandle (u64)   |
//! | header and ivars   | back-reference   |
//! +--------------------+------------------+
//!                      ^ indexed_ivars()
//! ```

use crate::error::{Error, Result};
use crate::runtime::handle::{GcHandle, ManagedHost, ManagedObject};
use crate::runtime::identity::{IdentityRegistry, Origin};
use crate::runtime::native::{ClassRef, Id, NativeRuntime};
use oxibridge_log::debug;
use std::sync::Arc;

/// Bytes of trailing storage every bridge-allocated instance carries.
pub const BACK_REFERENCE_SIZE: usize = std::mem::size_of::<GcHandle>();

/// Allocates, initialises and tears down bridge-owned instances.
pub struct InstanceAllocator {
    runtime: Arc<dyn NativeRuntime>,
    host: Arc<dyn ManagedHost>,
    registry: Arc<IdentityRegistry>,
}

impl InstanceAllocator {
    pub(crate) fn new(
        runtime: Arc<dyn NativeRuntime>,
        host: Arc<dyn ManagedHost>,
        registry: Arc<IdentityRegistry>,
    ) -> Self {
        InstanceAllocator {
            runtime,
            host,
            registry,
        }
    }

    /// Allocates an instance of `class` with an empty back-reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NativeAllocationFailed`] if the runtime refuses.
    pub(crate) fn allocate_raw(&self, class: ClassRef) -> Result<Id> {
        // SAFETY: classes reach the allocator from the registrar or the
        // runtime's own alloc path, so they are null or runtime-owned.
        let instance = unsafe { self.runtime.create_instance(class, BACK_REFERENCE_SIZE) };
        if instance.is_null() {
            return Err(Error::NativeAllocationFailed {
                class: self
                    .runtime
                    .class_name(class)
                    .unwrap_or_else(|| format!("{class:?}")),
            });
        }
        Ok(instance)
    }

    /// Allocates an instance of `class` that stands for `object`.
    ///
    /// # Errors
    ///
    /// [`Error::NativeAllocationFailed`], or [`Error::DuplicateIdentity`] if
    /// `object` was bridged concurrently; the fresh instance is destroyed in
    /// that case.
    pub(crate) fn allocate(&self, class: ClassRef, object: &ManagedObject) -> Result<Id> {
        let instance = self.allocate_raw(class)?;
        if let Err(err) = self.initialize(instance, object) {
            // SAFETY: allocated above and never published.
            unsafe { self.runtime.destruct_instance(instance) };
            return Err(err);
        }
        Ok(instance)
    }

    /// Binds a freshly allocated instance to `object`: pins the object,
    /// stores the handle in the back-reference and registers the pair under
    /// [`Origin::Managed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateIdentity`] if either side is already
    /// bridged. Nothing is left pinned or registered in that case.
    pub(crate) fn initialize(&self, instance: Id, object: &ManagedObject) -> Result<()> {
        let handle = self.host.alloc_handle(object.clone());
        // SAFETY: `instance` was allocated with `BACK_REFERENCE_SIZE` bytes
        // of trailing storage.
        unsafe { self.write_back_reference(instance, handle) };

        if let Err(err) = self.registry.register(object, instance, Origin::Managed) {
            // SAFETY: as above.
            unsafe { self.write_back_reference(instance, GcHandle::NULL) };
            self.host.free_handle(handle);
            return Err(err);
        }

        debug!("bound instance {:?} to handle {}", instance, handle.into_raw());
        Ok(())
    }

    /// Returns the managed object a bridge-owned instance stands for.
    ///
    /// Instances the bridge did not allocate return `None` without their
    /// memory being touched.
    #[must_use]
    pub fn object(&self, instance: Id) -> Option<ManagedObject> {
        self.registry.lookup_managed(instance, Origin::Managed)?;
        // SAFETY: registered under `Origin::Managed`, so the bridge
        // allocated it with back-reference storage.
        let handle = unsafe { self.read_back_reference(instance) };
        self.host.resolve(handle)
    }

    /// Tears down a bridge-owned instance: frees its handle, removes its
    /// identity pair and destroys it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if the bridge does not own
    /// `instance`.
    ///
    /// # Safety
    ///
    /// No other reference to `instance` may be used afterwards.
    pub unsafe fn teardown(&self, instance: Id) -> Result<()> {
        let Some(managed) = self.registry.remove_native(instance, Origin::Managed) else {
            return Err(Error::NotRegistered);
        };
        // SAFETY: it was registered under `Origin::Managed`.
        let handle = unsafe { self.read_back_reference(instance) };
        // SAFETY: as above.
        unsafe { self.write_back_reference(instance, GcHandle::NULL) };
        self.host.free_handle(handle);
        // SAFETY: the caller gives up the instance.
        unsafe { self.runtime.destruct_instance(instance) };

        debug!("tore down instance {:?} of {:?}", instance, managed);
        Ok(())
    }

    /// Reads the back-reference word.
    ///
    /// # Safety
    ///
    /// `instance` must be live and carry `BACK_REFERENCE_SIZE` trailing bytes.
    pub unsafe fn read_back_reference(&self, instance: Id) -> GcHandle {
        // SAFETY: per the caller; trailing storage is not necessarily
        // 8-byte aligned.
        unsafe {
            let slot = self.runtime.indexed_ivars(instance).cast::<u64>();
            GcHandle::from_raw(slot.read_unaligned())
        }
    }

    unsafe fn write_back_reference(&self, instance: Id, handle: GcHandle) {
        // SAFETY: per the caller.
        unsafe {
            let slot = self.runtime.indexed_ivars(instance).cast::<u64>();
            slot.write_unaligned(handle.into_raw());
        }
    }
}
