//! Managed objects and the handle capability that pins them.
//!
//! A managed object is any `Arc<dyn Any + Send + Sync>`. Its identity is the
//! address of the shared allocation, which stays stable for as long as any
//! strong or weak reference exists.
//!
//! Native memory cannot hold an `Arc` directly, so the bridge stores a
//! [`GcHandle`]: an opaque token allocated by a [`ManagedHost`] that keeps
//! the object alive until the token is freed. [`HandleTable`] is the default
//! host.
//!
//! # Thread Safety
//!
//! `HandleTable` guards its map with an `RwLock`. Freeing a handle removes it
//! under the write lock but drops the object only after the lock is
//! released, so destructors that re-enter the bridge cannot deadlock.

use fxhash::FxHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

/// A reference-counted managed object.
pub type ManagedObject = Arc<dyn Any + Send + Sync>;

/// A non-owning reference to a managed object.
pub type WeakManaged = Weak<dyn Any + Send + Sync>;

/// Wraps a value as a [`ManagedObject`].
///
/// # Example
///
/// ```
/// use oxibridge::managed;
///
/// let object = managed(42_u32);
/// assert_eq!(object.downcast_ref::<u32>(), Some(&42));
/// ```
#[must_use]
pub fn managed<T: Any + Send + Sync>(value: T) -> ManagedObject {
    remember_type_name::<T>();
    Arc::new(value)
}

/// Names of the concrete types seen by [`managed`], for messages about
/// erased objects.
static TYPE_NAMES: OnceLock<RwLock<FxHashMap<TypeId, &'static str>>> = OnceLock::new();

fn type_names() -> &'static RwLock<FxHashMap<TypeId, &'static str>> {
    TYPE_NAMES.get_or_init(|| RwLock::new(FxHashMap::default()))
}

pub(crate) fn remember_type_name<T: Any>() {
    let id = TypeId::of::<T>();
    let known = type_names()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&id);
    if !known {
        type_names()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, std::any::type_name::<T>());
    }
}

/// Returns the concrete type name of `object`.
///
/// Known for objects built with [`managed`] and for types the bridge was
/// told about by name; `None` for other erased objects.
#[must_use]
pub fn type_name_of(object: &ManagedObject) -> Option<&'static str> {
    let erased: &dyn Any = &**object;
    type_names()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&erased.type_id())
        .copied()
}

/// Identity of a managed object: the address of its shared allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ManagedId(usize);

impl ManagedId {
    /// Returns the identity of `object`.
    #[must_use]
    pub fn of(object: &ManagedObject) -> Self {
        ManagedId(Arc::as_ptr(object).cast::<()>() as usize)
    }

    /// Returns the identity of the object behind a weak reference.
    #[must_use]
    pub fn of_weak(object: &WeakManaged) -> Self {
        ManagedId(Weak::as_ptr(object).cast::<()>() as usize)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ManagedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedId({:#x})", self.0)
    }
}

/// An opaque token that keeps a managed object alive.
///
/// Handles are stored in native memory, so the representation is a plain
/// `u64`. Zero is never a valid handle.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GcHandle(u64);

impl GcHandle {
    /// The empty handle.
    pub const NULL: GcHandle = GcHandle(0);

    /// Reconstructs a handle from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        GcHandle(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Returns true for [`GcHandle::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The managed side's handle capability.
///
/// A handle is a strong reference: the object it names stays reachable until
/// [`ManagedHost::free_handle`] runs. Native code never sees the object,
/// only the handle.
pub trait ManagedHost: Send + Sync {
    /// Pins `object` and returns a fresh, non-null handle for it.
    fn alloc_handle(&self, object: ManagedObject) -> GcHandle;

    /// Returns the object a live handle names.
    fn resolve(&self, handle: GcHandle) -> Option<ManagedObject>;

    /// Unpins the object. Returns false if the handle was not live.
    fn free_handle(&self, handle: GcHandle) -> bool;

    /// Number of live handles.
    fn live_handles(&self) -> usize;
}

/// The default [`ManagedHost`]: a map from handle value to object.
pub struct HandleTable {
    next: AtomicU64,
    handles: RwLock<FxHashMap<u64, ManagedObject>>,
}

impl HandleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            handles: RwLock::new(FxHashMap::default()),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.live_handles())
            .finish()
    }
}

impl ManagedHost for HandleTable {
    fn alloc_handle(&self, object: ManagedObject) -> GcHandle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw, object);
        GcHandle(raw)
    }

    fn resolve(&self, handle: GcHandle) -> Option<ManagedObject> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.0)
            .cloned()
    }

    fn free_handle(&self, handle: GcHandle) -> bool {
        let removed = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        // The guard is gone; dropping the object may re-enter the table.
        removed.is_some()
    }

    fn live_handles(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_allocation_address() {
        let a = managed(1_i32);
        let b = a.clone();
        let c = managed(1_i32);

        assert_eq!(ManagedId::of(&a), ManagedId::of(&b));
        assert_ne!(ManagedId::of(&a), ManagedId::of(&c));
        assert_eq!(ManagedId::of(&a), ManagedId::of_weak(&Arc::downgrade(&a)));
    }

    #[test]
    fn test_type_names_of_erased_objects() {
        struct Named;
        struct Unnamed;

        assert!(type_name_of(&managed(Named)).unwrap().ends_with("Named"));
        let unnamed: ManagedObject = Arc::new(Unnamed);
        assert_eq!(type_name_of(&unnamed), None);
    }

    #[test]
    fn test_handle_pins_object() {
        let table = HandleTable::new();
        let object = managed(String::from("pinned"));
        let weak = Arc::downgrade(&object);

        let handle = table.alloc_handle(object);
        assert!(!handle.is_null());
        assert!(weak.upgrade().is_some());
        assert_eq!(table.live_handles(), 1);

        let resolved = table.resolve(handle).unwrap();
        assert_eq!(resolved.downcast_ref::<String>().unwrap(), "pinned");
        drop(resolved);

        assert!(table.free_handle(handle));
        assert!(weak.upgrade().is_none());
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn test_free_unknown_handle() {
        let table = HandleTable::new();
        assert!(!table.free_handle(GcHandle::from_raw(99)));
        assert!(table.resolve(GcHandle::NULL).is_none());
    }

    #[test]
    fn test_handles_are_unique() {
        let table = HandleTable::new();
        let object = managed(());
        let h1 = table.alloc_handle(object.clone());
        let h2 = table.alloc_handle(object);
        assert_ne!(h1, h2);
        assert_eq!(table.live_handles(), 2);
    }

    struct Reentrant {
        table: Arc<HandleTable>,
        inner: GcHandle,
    }

    impl Drop for Reentrant {
        fn drop(&mut self) {
            self.table.free_handle(self.inner);
        }
    }

    #[test]
    fn test_free_handle_allows_reentrant_drop() {
        let table = Arc::new(HandleTable::new());
        let inner = table.alloc_handle(managed(7_u8));
        let outer = table.alloc_handle(managed(Reentrant {
            table: table.clone(),
            inner,
        }));

        assert!(table.free_handle(outer));
        assert_eq!(table.live_handles(), 0);
    }
}
