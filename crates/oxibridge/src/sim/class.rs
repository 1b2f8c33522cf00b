//! Class table of the simulated runtime.
//!
//! Classes are registered by name and never deallocated, like classes in a
//! real Objective-C runtime: a [`ClassRef`] handed out stays valid for the
//! life of the process.

use crate::error::{Error, Result};
use crate::runtime::native::ClassRef;
use fxhash::{FxHashMap, FxHashSet};
use std::ffi::{CStr, CString};
use std::sync::{PoisonError, RwLock};

/// Class metadata. Leaked on registration.
#[derive(Debug)]
pub(crate) struct SimClass {
    name: CString,
    super_class: ClassRef,
    instance_size: usize,
}

impl SimClass {
    pub(crate) fn name(&self) -> &CStr {
        &self.name
    }

    pub(crate) fn instance_size(&self) -> usize {
        self.instance_size
    }
}

#[derive(Default)]
struct Classes {
    by_name: FxHashMap<String, ClassRef>,
    known: FxHashSet<usize>,
}

/// Registry of classes by name.
#[derive(Default)]
pub(crate) struct ClassTable {
    classes: RwLock<Classes>,
}

impl ClassTable {
    /// Registers a class. Instances get `instance_size` bytes of ivars
    /// before any extra bytes requested at allocation.
    pub(crate) fn define(
        &self,
        name: &str,
        super_class: Option<ClassRef>,
        instance_size: usize,
    ) -> Result<ClassRef> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidNativeClass)?;
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);

        if classes.by_name.contains_key(name) {
            return Err(Error::DuplicateRegistration {
                name: name.to_string(),
            });
        }
        let super_class = match super_class {
            Some(parent) if !classes.known.contains(&parent.addr()) => {
                return Err(Error::InvalidNativeClass);
            }
            Some(parent) => parent,
            None => ClassRef::NO_CLASS,
        };

        let class = Box::into_raw(Box::new(SimClass {
            name: c_name,
            super_class,
            instance_size,
        }));
        let class = ClassRef::from_ptr(class.cast());
        classes.by_name.insert(name.to_string(), class);
        classes.known.insert(class.addr());
        Ok(class)
    }

    pub(crate) fn lookup(&self, name: &str) -> ClassRef {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .copied()
            .unwrap_or(ClassRef::NO_CLASS)
    }

    /// Returns the metadata of a class this table registered.
    pub(crate) fn get(&self, class: ClassRef) -> Option<&'static SimClass> {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        if !classes.known.contains(&class.addr()) {
            return None;
        }
        // SAFETY: every known address is a leaked `SimClass`.
        Some(unsafe { &*class.as_ptr().cast::<SimClass>() })
    }

    pub(crate) fn super_class(&self, class: ClassRef) -> Option<ClassRef> {
        self.get(class)
            .map(|c| c.super_class)
            .filter(|parent| !parent.is_null())
    }

    pub(crate) fn len(&self) -> usize {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .len()
    }
}
