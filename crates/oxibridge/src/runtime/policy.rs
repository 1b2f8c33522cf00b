//! The overridable decisions of the bridge.
//!
//! [`WrapperPolicy`] answers three questions the bridge cannot answer on its
//! own: which native class a managed object should become, how to wrap a
//! native instance, and which invoke function and signature a managed
//! callable's block should get. [`RegistrarPolicy`] answers them from the
//! [`Registrar`] and a table of block shapes keyed by callable type.

use crate::error::{Error, Result};
use crate::runtime::encoding::validate_block_signature;
use crate::runtime::flags::{CreateBlockFlags, CreateInstanceFlags, CreateObjectFlags};
use crate::runtime::handle::ManagedObject;
use crate::runtime::native::{ClassRef, Id, Imp, MessageSendCallbacks};
use crate::runtime::registrar::{ManagedType, Registrar};
use fxhash::FxHashMap;
use oxibridge_log::debug;
use std::any::{Any, TypeId};
use std::sync::{PoisonError, RwLock};

/// Native entry point and type encoding of a callable's block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockShape {
    /// Invoke function; receives the block as its first argument.
    pub invoke: Imp,
    /// Block signature, e.g. `"i?i"`.
    pub signature: String,
}

impl BlockShape {
    /// Builds a shape after validating its signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] for a malformed signature.
    pub fn new(invoke: Imp, signature: impl Into<String>) -> Result<Self> {
        let signature = signature.into();
        validate_block_signature(&signature)?;
        Ok(BlockShape { invoke, signature })
    }
}

/// Decisions the bridge delegates to its embedder.
pub trait WrapperPolicy: Send + Sync {
    /// Chooses the native class for a managed object crossing to the
    /// native side.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] if the object's type has no native class.
    fn compute_instance_class(
        &self,
        registrar: &Registrar,
        object: &ManagedObject,
        flags: CreateInstanceFlags,
    ) -> Result<ClassRef>;

    /// Builds the managed wrapper for a native instance.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] if the instance's class has no factory, or
    /// whatever the factory reports.
    fn create_object(
        &self,
        registrar: &Registrar,
        instance: Id,
        flags: CreateObjectFlags,
    ) -> Result<ManagedObject>;

    /// Returns the invoke function and signature for a callable's block.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedCallableShape`] if the callable cannot be
    /// expressed as a block.
    fn block_shape(&self, callable: &ManagedObject, flags: CreateBlockFlags) -> Result<BlockShape>;

    /// `objc_msgSend` overrides to install when the bridge registers
    /// globally. None by default.
    fn message_send_callbacks(&self) -> MessageSendCallbacks {
        MessageSendCallbacks::default()
    }
}

/// The default policy: classes and factories from the [`Registrar`], block
/// shapes registered per callable type.
///
/// # Example
///
/// ```
/// use oxibridge::{BlockLiteral, Imp, RegistrarPolicy};
///
/// struct Doubler;
///
/// extern "C" fn doubler_invoke(_block: *mut BlockLiteral, value: i32) -> i32 {
///     value * 2
/// }
///
/// let policy = RegistrarPolicy::new();
/// policy
///     .register_block_shape::<Doubler>(Imp::from_ptr(doubler_invoke as *const _), "i?i")
///     .unwrap();
/// ```
#[derive(Default)]
pub struct RegistrarPolicy {
    shapes: RwLock<FxHashMap<TypeId, BlockShape>>,
    callbacks: MessageSendCallbacks,
}

impl RegistrarPolicy {
    /// Creates a policy with no block shapes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the overrides returned by
    /// [`WrapperPolicy::message_send_callbacks`].
    #[must_use]
    pub fn with_message_send_callbacks(mut self, callbacks: MessageSendCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Declares the block shape of callables of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] for a malformed signature.
    pub fn register_block_shape<T: Any>(&self, invoke: Imp, signature: &str) -> Result<()> {
        let shape = BlockShape::new(invoke, signature)?;
        let ty = ManagedType::of::<T>();
        debug!("block shape {} for {}", shape.signature, ty.name());
        self.shapes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ty.type_id(), shape);
        Ok(())
    }
}

impl WrapperPolicy for RegistrarPolicy {
    fn compute_instance_class(
        &self,
        registrar: &Registrar,
        object: &ManagedObject,
        _flags: CreateInstanceFlags,
    ) -> Result<ClassRef> {
        registrar.resolve_class(ManagedType::of_object(object))
    }

    fn create_object(
        &self,
        registrar: &Registrar,
        instance: Id,
        flags: CreateObjectFlags,
    ) -> Result<ManagedObject> {
        registrar.create_object(instance, flags)
    }

    fn block_shape(&self, callable: &ManagedObject, _flags: CreateBlockFlags) -> Result<BlockShape> {
        let ty = ManagedType::of_object(callable);
        self.shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ty.type_id())
            .cloned()
            .ok_or_else(|| Error::UnsupportedCallableShape {
                type_name: ty.name().to_string(),
            })
    }

    fn message_send_callbacks(&self) -> MessageSendCallbacks {
        self.callbacks
    }
}
