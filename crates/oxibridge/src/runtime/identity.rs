//! Identity registry: the bijection between managed objects and native
//! pointers.
//!
//! Every bridged pair is recorded under an [`Origin`]:
//!
//! - [`Origin::Managed`] pairs were created by the bridge for a managed
//!   object (instance wrappers, closure descriptors).
//! - [`Origin::Native`] pairs map a pre-existing native object (or block) to
//!   the managed wrapper built for it.
//!
//! Within one origin the mapping is one-to-one in both directions. The same
//! managed object or native pointer may appear once under each origin.
//!
//! # Architecture
//!
//! Each origin has a [`BidirectionalMap`]: a forward `FxHashMap` keyed by
//! [`ManagedId`] and a backward map keyed by native address. The backward
//! map holds a [`WeakManaged`] so lookups can hand out the object without the
//! registry keeping it alive. An entry whose object has been dropped is
//! treated as vacant and is replaced on the next registration.
//!
//! # Thread Safety
//!
//! Both maps sit behind one `RwLock`, so a pair is always inserted or
//! removed atomically. Removing an entry drops at most a `Weak`, which never
//! runs a destructor, so nothing re-enters the registry under the lock.

use crate::error::{Error, Result};
use crate::runtime::handle::{ManagedId, ManagedObject, WeakManaged};
use crate::runtime::native::Id;
use fxhash::FxHashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Which side created a bridged pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The bridge allocated the native side for a managed object.
    Managed,
    /// The native object existed first; the managed side wraps it.
    Native,
}

impl Origin {
    const fn index(self) -> usize {
        match self {
            Origin::Managed => 0,
            Origin::Native => 1,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Managed => f.write_str("managed"),
            Origin::Native => f.write_str("native"),
        }
    }
}

struct Slot {
    managed: ManagedId,
    object: WeakManaged,
}

impl Slot {
    fn is_dead(&self) -> bool {
        self.object.strong_count() == 0
    }
}

/// One origin's forward and backward maps.
#[derive(Default)]
pub struct BidirectionalMap {
    forward: FxHashMap<ManagedId, usize>,
    backward: FxHashMap<usize, Slot>,
}

impl BidirectionalMap {
    fn with_capacity(capacity: usize) -> Self {
        BidirectionalMap {
            forward: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            backward: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Number of pairs, including entries whose object has died.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backward.len()
    }

    /// Returns true if the map holds no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backward.is_empty()
    }

    fn remove_native(&mut self, native: usize) -> Option<Slot> {
        let slot = self.backward.remove(&native)?;
        if self.forward.get(&slot.managed) == Some(&native) {
            self.forward.remove(&slot.managed);
        }
        Some(slot)
    }

    fn remove_managed(&mut self, managed: ManagedId) -> Option<usize> {
        let native = self.forward.remove(&managed)?;
        self.backward.remove(&native);
        Some(native)
    }

    /// Drops a conflicting entry if its object is gone. Returns true if the
    /// key is free afterwards.
    fn vacate_native(&mut self, native: usize) -> bool {
        match self.backward.get(&native) {
            None => true,
            Some(slot) if slot.is_dead() => {
                self.remove_native(native);
                true
            }
            Some(_) => false,
        }
    }

    fn vacate_managed(&mut self, managed: ManagedId) -> bool {
        match self.forward.get(&managed).copied() {
            None => true,
            Some(native) => self.vacate_native(native),
        }
    }

    fn insert(&mut self, object: &ManagedObject, native: usize) -> bool {
        let managed = ManagedId::of(object);
        if !self.vacate_managed(managed) || !self.vacate_native(native) {
            return false;
        }
        self.forward.insert(managed, native);
        self.backward.insert(
            native,
            Slot {
                managed,
                object: Arc::downgrade(object),
            },
        );
        true
    }
}

/// Counts of registered pairs per origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityCounts {
    /// Pairs under [`Origin::Managed`].
    pub managed: usize,
    /// Pairs under [`Origin::Native`].
    pub native: usize,
}

/// The process-wide identity registry.
///
/// # Example
///
/// ```
/// use oxibridge::{managed, Id, IdentityRegistry, Origin};
///
/// let registry = IdentityRegistry::new();
/// let object = managed("wrapper");
/// let native = Id::from_ptr(0x1000 as *mut _);
///
/// registry.register(&object, native, Origin::Native).unwrap();
/// assert_eq!(registry.lookup_native(&object, Origin::Native), Some(native));
/// assert!(registry.lookup_native(&object, Origin::Managed).is_none());
/// ```
pub struct IdentityRegistry {
    maps: RwLock<[BidirectionalMap; 2]>,
}

impl IdentityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a registry with room for `capacity` pairs per origin.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        IdentityRegistry {
            maps: RwLock::new([
                BidirectionalMap::with_capacity(capacity),
                BidirectionalMap::with_capacity(capacity),
            ]),
        }
    }

    /// Records `object <-> native` under `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateIdentity`] if either side is already paired
    /// with a live counterpart under `origin`. The registry is unchanged in
    /// that case.
    pub fn register(&self, object: &ManagedObject, native: Id, origin: Origin) -> Result<()> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        if maps[origin.index()].insert(object, native.addr()) {
            Ok(())
        } else {
            Err(Error::DuplicateIdentity {
                native: native.addr(),
                origin,
            })
        }
    }

    /// Returns the native pointer paired with `object` under `origin`.
    #[must_use]
    pub fn lookup_native(&self, object: &ManagedObject, origin: Origin) -> Option<Id> {
        self.lookup_native_by_id(ManagedId::of(object), origin)
    }

    /// Like [`IdentityRegistry::lookup_native`], keyed by identity.
    #[must_use]
    pub fn lookup_native_by_id(&self, managed: ManagedId, origin: Origin) -> Option<Id> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps[origin.index()]
            .forward
            .get(&managed)
            .map(|&native| Id::from_ptr(native as *mut _))
    }

    /// Returns the managed object paired with `native` under `origin`, if it
    /// is still alive.
    #[must_use]
    pub fn lookup_managed(&self, native: Id, origin: Origin) -> Option<ManagedObject> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps[origin.index()]
            .backward
            .get(&native.addr())
            .and_then(|slot| slot.object.upgrade())
    }

    /// Removes the native-origin pair of a managed wrapper, returning the
    /// native pointer it was bound to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if `object` has no native-origin
    /// entry.
    pub fn unregister(&self, object: &ManagedObject) -> Result<Id> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps[Origin::Native.index()]
            .remove_managed(ManagedId::of(object))
            .map(|native| Id::from_ptr(native as *mut _))
            .ok_or(Error::NotRegistered)
    }

    /// Removes whatever pair `native` belongs to under `origin`.
    pub fn remove_native(&self, native: Id, origin: Origin) -> Option<ManagedId> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps[origin.index()]
            .remove_native(native.addr())
            .map(|slot| slot.managed)
    }

    /// Removes `managed <-> native` only if exactly that pair is present.
    pub fn remove_pair(&self, managed: ManagedId, native: Id, origin: Origin) -> bool {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let map = &mut maps[origin.index()];
        if map.forward.get(&managed) == Some(&native.addr()) {
            map.remove_native(native.addr());
            true
        } else {
            false
        }
    }

    /// Removes the pair for `native` if its managed object has been dropped.
    pub fn remove_native_if_dead(&self, native: Id, origin: Origin) -> bool {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let map = &mut maps[origin.index()];
        match map.backward.get(&native.addr()) {
            Some(slot) if slot.is_dead() => {
                map.remove_native(native.addr());
                true
            }
            _ => false,
        }
    }

    /// Number of pairs per origin.
    #[must_use]
    pub fn counts(&self) -> IdentityCounts {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        IdentityCounts {
            managed: maps[Origin::Managed.index()].len(),
            native: maps[Origin::Native.index()].len(),
        }
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("counts", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::managed;

    fn native(addr: usize) -> Id {
        Id::from_ptr(addr as *mut _)
    }

    #[test]
    fn test_register_and_lookup_both_directions() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);

        registry.register(&object, native(0x10), Origin::Managed).unwrap();

        assert_eq!(registry.lookup_native(&object, Origin::Managed), Some(native(0x10)));
        let back = registry.lookup_managed(native(0x10), Origin::Managed).unwrap();
        assert!(Arc::ptr_eq(&back, &object));
    }

    #[test]
    fn test_origins_are_independent() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);

        registry.register(&object, native(0x10), Origin::Managed).unwrap();
        registry.register(&object, native(0x20), Origin::Native).unwrap();

        assert_eq!(registry.lookup_native(&object, Origin::Managed), Some(native(0x10)));
        assert_eq!(registry.lookup_native(&object, Origin::Native), Some(native(0x20)));
        assert!(registry.lookup_managed(native(0x20), Origin::Managed).is_none());
        assert_eq!(registry.counts(), IdentityCounts { managed: 1, native: 1 });
    }

    #[test]
    fn test_duplicate_native_rejected() {
        let registry = IdentityRegistry::new();
        let a = managed(1_u32);
        let b = managed(2_u32);

        registry.register(&a, native(0x10), Origin::Native).unwrap();
        let err = registry.register(&b, native(0x10), Origin::Native).unwrap_err();

        assert_eq!(
            err,
            Error::DuplicateIdentity {
                native: 0x10,
                origin: Origin::Native
            }
        );
        assert!(registry.lookup_native(&b, Origin::Native).is_none());
    }

    #[test]
    fn test_duplicate_managed_rejected() {
        let registry = IdentityRegistry::new();
        let a = managed(1_u32);

        registry.register(&a, native(0x10), Origin::Native).unwrap();
        assert!(registry.register(&a, native(0x20), Origin::Native).is_err());
        assert!(registry.lookup_managed(native(0x20), Origin::Native).is_none());
    }

    #[test]
    fn test_dead_entry_is_replaced() {
        let registry = IdentityRegistry::new();
        let old = managed(1_u32);
        registry.register(&old, native(0x10), Origin::Native).unwrap();
        drop(old);

        assert!(registry.lookup_managed(native(0x10), Origin::Native).is_none());

        let new = managed(2_u32);
        registry.register(&new, native(0x10), Origin::Native).unwrap();
        assert_eq!(registry.counts().native, 1);
    }

    #[test]
    fn test_unregister() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);

        assert_eq!(registry.unregister(&object), Err(Error::NotRegistered));

        registry.register(&object, native(0x10), Origin::Native).unwrap();
        assert_eq!(registry.unregister(&object), Ok(native(0x10)));
        assert!(registry.lookup_managed(native(0x10), Origin::Native).is_none());
        assert_eq!(registry.unregister(&object), Err(Error::NotRegistered));
    }

    #[test]
    fn test_unregister_ignores_managed_origin() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);
        registry.register(&object, native(0x10), Origin::Managed).unwrap();

        assert_eq!(registry.unregister(&object), Err(Error::NotRegistered));
        assert_eq!(registry.counts().managed, 1);
    }

    #[test]
    fn test_remove_pair_is_conditional() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);
        let id = ManagedId::of(&object);
        registry.register(&object, native(0x10), Origin::Managed).unwrap();

        assert!(!registry.remove_pair(id, native(0x20), Origin::Managed));
        assert!(!registry.remove_pair(id, native(0x10), Origin::Native));
        assert!(registry.remove_pair(id, native(0x10), Origin::Managed));
        assert_eq!(registry.counts(), IdentityCounts::default());
    }

    #[test]
    fn test_remove_native_if_dead() {
        let registry = IdentityRegistry::new();
        let object = managed(1_u32);
        registry.register(&object, native(0x10), Origin::Native).unwrap();

        assert!(!registry.remove_native_if_dead(native(0x10), Origin::Native));
        drop(object);
        assert!(registry.remove_native_if_dead(native(0x10), Origin::Native));
        assert_eq!(registry.counts().native, 0);
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        use std::thread;

        let registry = Arc::new(IdentityRegistry::new());
        let objects: Vec<ManagedObject> = (0..8).map(|i| managed(i as u32)).collect();

        let handles: Vec<_> = objects
            .iter()
            .cloned()
            .map(|object| {
                let registry = registry.clone();
                thread::spawn(move || registry.register(&object, native(0x10), Origin::Native).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.counts().native, 1);
    }

    #[test]
    fn test_concurrent_disjoint_registrations() {
        use std::thread;

        const THREADS: usize = 8;
        const PER_THREAD: usize = 256;

        let registry = Arc::new(IdentityRegistry::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut registered = Vec::with_capacity(PER_THREAD);
                    for i in 0..PER_THREAD {
                        let object = managed((t, i));
                        let addr = 0x1000 + (t * PER_THREAD + i) * 16;
                        let origin = if i % 2 == 0 { Origin::Managed } else { Origin::Native };
                        registry.register(&object, native(addr), origin).unwrap();
                        registered.push((object, addr, origin));

                        // Interleave lookups with the other threads' writes.
                        let (earlier, earlier_addr, earlier_origin) = &registered[i / 2];
                        assert_eq!(
                            registry.lookup_native(earlier, *earlier_origin),
                            Some(native(*earlier_addr))
                        );
                    }
                    registered
                })
            })
            .collect();

        let registered: Vec<(ManagedObject, usize, Origin)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(
            registry.counts(),
            IdentityCounts {
                managed: THREADS * PER_THREAD / 2,
                native: THREADS * PER_THREAD / 2,
            }
        );
        for (object, addr, origin) in &registered {
            assert_eq!(registry.lookup_native(object, *origin), Some(native(*addr)));
            let back = registry.lookup_managed(native(*addr), *origin).unwrap();
            assert!(Arc::ptr_eq(&back, object));
        }
    }
}
