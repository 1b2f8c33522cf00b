//! Type registrar: which native class stands for which managed type, and
//! how to build a managed wrapper for an instance of a native class.
//!
//! # Architecture
//!
//! Registrations are two maps behind one `RwLock`:
//!
//! - managed type -> native class, used when a managed object crosses to the
//!   native side
//! - native class name -> factory, used when a native instance crosses to
//!   the managed side
//!
//! Both entries of a registration are inserted together or not at all.
//! Factories are cloned out of the map before they run, so a factory may
//! call back into the registrar.
//!
//! Selectors are cached by name on top of the runtime's own table.

use crate::error::{Error, Result};
use crate::runtime::flags::CreateObjectFlags;
use crate::runtime::handle::{ManagedObject, remember_type_name, type_name_of};
use crate::runtime::native::{ClassRef, Id, NativeRuntime, Sel};
use fxhash::FxHashMap;
use oxibridge_log::{debug, info};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

/// Builds the managed wrapper for a native instance.
pub type Factory = Arc<dyn Fn(Id, CreateObjectFlags) -> Result<ManagedObject> + Send + Sync>;

/// Wraps a closure as a [`Factory`].
pub fn factory<F>(f: F) -> Factory
where
    F: Fn(Id, CreateObjectFlags) -> Result<ManagedObject> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A managed type key. Equality and hashing use the `TypeId` only; the name
/// is for messages.
#[derive(Clone, Copy)]
pub struct ManagedType {
    id: TypeId,
    name: &'static str,
}

impl ManagedType {
    /// The key for `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        remember_type_name::<T>();
        ManagedType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The key for the concrete type of `object`. The name is
    /// `"<erased>"` unless the type has been seen by [`managed`] or
    /// [`ManagedType::of`].
    #[must_use]
    pub fn of_object(object: &ManagedObject) -> Self {
        let erased: &dyn Any = &**object;
        ManagedType {
            id: erased.type_id(),
            name: type_name_of(object).unwrap_or("<erased>"),
        }
    }

    /// The type's id.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// The type's name, as far as it is known.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ManagedType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ManagedType {}

impl Hash for ManagedType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ManagedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedType({})", self.name)
    }
}

#[derive(Default)]
struct Registrations {
    classes: FxHashMap<ManagedType, ClassRef>,
    class_names: FxHashMap<TypeId, String>,
    factories: FxHashMap<String, Factory>,
}

/// The type registrar.
pub struct Registrar {
    runtime: Arc<dyn NativeRuntime>,
    registrations: RwLock<Registrations>,
    selectors: RwLock<FxHashMap<String, Sel>>,
}

impl Registrar {
    /// Creates an empty registrar over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Self {
        Registrar {
            runtime,
            registrations: RwLock::new(Registrations::default()),
            selectors: RwLock::new(FxHashMap::default()),
        }
    }

    /// The native runtime this registrar resolves against.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    /// Registers `ty <-> class` with the factory that wraps instances of
    /// `class`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidNativeClass`] if `class` is null or unknown to the
    ///   runtime
    /// - [`Error::DuplicateRegistration`] if `ty` or the class name is
    ///   already registered
    pub fn register_class(&self, ty: ManagedType, class: ClassRef, factory: Factory) -> Result<()> {
        if class.is_null() {
            return Err(Error::InvalidNativeClass);
        }
        let name = self
            .runtime
            .class_name(class)
            .ok_or(Error::InvalidNativeClass)?;

        {
            let mut registrations = self
                .registrations
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if registrations.classes.contains_key(&ty) {
                return Err(Error::DuplicateRegistration {
                    name: ty.name.to_string(),
                });
            }
            if registrations.factories.contains_key(&name) {
                return Err(Error::DuplicateRegistration { name });
            }
            registrations.classes.insert(ty, class);
            registrations.class_names.insert(ty.id, name.clone());
            registrations.factories.insert(name.clone(), factory);
        }

        info!("registered {} as native class {}", ty.name, name);
        Ok(())
    }

    /// Registers each `(type, class name, factory)` triple, resolving the
    /// class through the runtime.
    ///
    /// Stops at the first failure; earlier triples stay registered.
    ///
    /// # Errors
    ///
    /// See [`Registrar::register_class`]. A name the runtime does not know
    /// yields [`Error::InvalidNativeClass`].
    pub fn initialize<'a, I>(&self, registrations: I) -> Result<()>
    where
        I: IntoIterator<Item = (ManagedType, &'a str, Factory)>,
    {
        for (ty, name, factory) in registrations {
            let class = self.runtime.get_class(name);
            self.register_class(ty, class, factory)?;
        }
        Ok(())
    }

    /// Returns the native class registered for `ty`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClass`] if `ty` is not registered.
    pub fn resolve_class(&self, ty: ManagedType) -> Result<ClassRef> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        registrations
            .classes
            .get(&ty)
            .copied()
            .ok_or_else(|| Error::UnknownClass {
                name: ty.name.to_string(),
            })
    }

    /// Returns the native class name registered for `ty`.
    #[must_use]
    pub fn class_name_of(&self, ty: ManagedType) -> Option<String> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .class_names
            .get(&ty.id)
            .cloned()
    }

    /// Returns the factory registered for a native class name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClass`] if no factory is registered.
    pub fn resolve_factory(&self, class_name: &str) -> Result<Factory> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        registrations
            .factories
            .get(class_name)
            .cloned()
            .ok_or_else(|| Error::UnknownClass {
                name: class_name.to_string(),
            })
    }

    /// Builds the managed wrapper for `instance` with the factory of its
    /// runtime class.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] if the instance's class has no factory, or
    /// whatever the factory returns.
    pub fn create_object(&self, instance: Id, flags: CreateObjectFlags) -> Result<ManagedObject> {
        let class_name = self
            .runtime
            .object_class_name(instance)
            .ok_or_else(|| Error::UnknownClass {
                name: format!("{instance:?}"),
            })?;
        let factory = self.resolve_factory(&class_name)?;
        factory(instance, flags)
    }

    /// Returns the selector for `name`, registering it on first use.
    pub fn selector(&self, name: &str) -> Sel {
        if let Some(sel) = self
            .selectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return *sel;
        }

        let sel = self.runtime.register_selector(name);
        debug!("cached selector {} as {:?}", name, sel);
        *self
            .selectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(sel)
    }

    /// Number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .classes
            .len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("classes", &self.len())
            .finish_non_exhaustive()
    }
}
