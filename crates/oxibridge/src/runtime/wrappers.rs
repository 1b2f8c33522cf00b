//! The bridge facade.
//!
//! [`Bridge`] ties the pieces together and exposes the bridging operations
//! in both directions:
//!
//! | managed -> native                     | native -> managed                        |
//! |---------------------------------------|------------------------------------------|
//! | [`Bridge::get_or_create_instance_for_object`] | [`Bridge::get_or_create_object_for_instance`] |
//! | [`Bridge::create_block_for_callable`] | [`Bridge::get_or_create_callable_for_block`] |
//!
//! Every operation is a lookup in the identity registry followed, on a miss,
//! by a creation and a registration. Two threads may race to bridge the same
//! object; the registry admits one pair and the loser returns the winner's
//! counterpart after discarding its own.
//!
//! # Closures
//!
//! A callable bridged to a block gets one [`BlockDetails`] record, kept in
//! the bridge's block table and registered under [`Origin::Managed`] as
//! `callable <-> descriptor`. Each literal handed out holds one reference;
//! see [`crate::runtime::lifetime`]. Records whose count has reached zero
//! stay in the table until they are retired by the next wrap of the same
//! callable or by [`Bridge::collect_released_blocks`].

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::runtime::block::{BlockDetails, BlockLiteral, inspect_bridge_block};
use crate::runtime::dispatch::BlockDispatch;
use crate::runtime::flags::{
    CreateBlockFlags, CreateDelegateFlags, CreateInstanceFlags, CreateObjectFlags,
};
use crate::runtime::handle::{HandleTable, ManagedHost, ManagedId, ManagedObject};
use crate::runtime::identity::{IdentityCounts, IdentityRegistry, Origin};
use crate::runtime::instance::InstanceAllocator;
use crate::runtime::lifetime::{self, LifetimeState};
use crate::runtime::native::{ClassRef, Id, Imp, NativeRuntime, Sel};
use crate::runtime::policy::{RegistrarPolicy, WrapperPolicy};
use crate::runtime::registrar::Registrar;
use fxhash::FxHashMap;
use oxibridge_log::{debug, error, info, trace, warn};
use std::collections::hash_map::Entry;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Snapshot of the bridge's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Identity pairs per origin.
    pub identities: IdentityCounts,
    /// Closure records in the block table, released or not.
    pub block_records: usize,
    /// Closure records whose count has reached zero.
    pub released_blocks: usize,
    /// Handles held by the managed host.
    pub live_handles: usize,
}

/// The native `alloc` and `dealloc` implementations for bridge-backed
/// classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimeMethods {
    /// `+ (id)alloc`; allocates with back-reference storage.
    pub alloc: Imp,
    /// `- (void)dealloc`; frees the handle and destroys the instance.
    pub dealloc: Imp,
}

/// Configures and builds a [`Bridge`].
pub struct BridgeBuilder {
    runtime: Arc<dyn NativeRuntime>,
    host: Option<Arc<dyn ManagedHost>>,
    policy: Option<Arc<dyn WrapperPolicy>>,
    config: BridgeConfig,
}

impl BridgeBuilder {
    /// Uses `host` for handles instead of a fresh [`HandleTable`].
    #[must_use]
    pub fn host(mut self, host: Arc<dyn ManagedHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Uses `policy` instead of an empty [`RegistrarPolicy`].
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn WrapperPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the bridge and applies the configuration's process-wide
    /// settings (log level, violation policy).
    #[must_use]
    pub fn build(self) -> Bridge {
        if let Some(level) = self.config.log_level {
            oxibridge_log::set_level(level);
        }
        lifetime::set_violation_policy(self.config.violation_policy);

        let host = self
            .host
            .unwrap_or_else(|| Arc::new(HandleTable::new()) as Arc<dyn ManagedHost>);
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(RegistrarPolicy::new()) as Arc<dyn WrapperPolicy>);
        let registry = Arc::new(IdentityRegistry::with_capacity(
            self.config.registry_capacity,
        ));
        let allocator =
            InstanceAllocator::new(self.runtime.clone(), host.clone(), registry.clone());

        info!(
            "bridge ready (violation policy {:?})",
            self.config.violation_policy
        );

        Bridge {
            registrar: Registrar::new(self.runtime.clone()),
            runtime: self.runtime,
            host,
            registry,
            policy,
            allocator,
            blocks: RwLock::new(FxHashMap::default()),
            config: self.config,
        }
    }
}

/// The object, instance and closure bridge.
pub struct Bridge {
    config: BridgeConfig,
    runtime: Arc<dyn NativeRuntime>,
    host: Arc<dyn ManagedHost>,
    registry: Arc<IdentityRegistry>,
    registrar: Registrar,
    policy: Arc<dyn WrapperPolicy>,
    allocator: InstanceAllocator,
    blocks: RwLock<FxHashMap<usize, Arc<BlockDetails>>>,
}

static GLOBAL: OnceLock<Bridge> = OnceLock::new();

impl Bridge {
    /// Starts building a bridge over `runtime`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use oxibridge::{Bridge, BridgeConfig, SimRuntime};
    ///
    /// let bridge = Bridge::builder(Arc::new(SimRuntime::new()))
    ///     .config(BridgeConfig::default())
    ///     .build();
    /// assert_eq!(bridge.stats().live_handles, 0);
    /// ```
    #[must_use]
    pub fn builder(runtime: Arc<dyn NativeRuntime>) -> BridgeBuilder {
        BridgeBuilder {
            runtime,
            host: None,
            policy: None,
            config: BridgeConfig::default(),
        }
    }

    /// Makes `bridge` the process-wide bridge used by the native `alloc`
    /// and `dealloc` implementations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalAlreadyInstalled`] if one is installed; the
    /// argument is dropped.
    pub fn install_global(bridge: Bridge) -> Result<&'static Bridge> {
        let mut installed = false;
        let global = GLOBAL.get_or_init(|| {
            installed = true;
            bridge
        });
        if installed {
            info!("installed global bridge");
            Ok(global)
        } else {
            Err(Error::GlobalAlreadyInstalled)
        }
    }

    /// Returns the process-wide bridge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalNotInstalled`] before
    /// [`Bridge::install_global`].
    pub fn global() -> Result<&'static Bridge> {
        GLOBAL.get().ok_or(Error::GlobalNotInstalled)
    }

    /// Installs the policy's `objc_msgSend` overrides in the runtime.
    ///
    /// Returns false if the policy has overrides but the runtime offers no
    /// hook for them; they are then not in effect.
    pub fn register_as_global(&self) -> bool {
        let callbacks = self.policy.message_send_callbacks();
        if self.runtime.set_message_send_callbacks(&callbacks) {
            info!(
                "registered message send callbacks (empty: {})",
                callbacks.is_empty()
            );
            true
        } else if callbacks.is_empty() {
            true
        } else {
            warn!("native runtime cannot install message send callbacks; they are ignored");
            false
        }
    }

    /// The configuration the bridge was built with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The native runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    /// The managed host.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn ManagedHost> {
        &self.host
    }

    /// The identity registry.
    #[must_use]
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// The type registrar.
    #[must_use]
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    // ========================================================================
    // Objects and instances
    // ========================================================================

    /// Returns the native instance that stands for `object`, allocating one
    /// of the policy's class on first use.
    ///
    /// With [`CreateInstanceFlags::UNWRAP`], a managed wrapper of a native
    /// object yields that native object.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownClass`] if the policy has no class for the object
    /// - [`Error::NativeAllocationFailed`] if the runtime cannot allocate
    /// - [`Error::DuplicateIdentity`] if `object` already stands for a
    ///   closure
    pub fn get_or_create_instance_for_object(
        &self,
        object: &ManagedObject,
        flags: CreateInstanceFlags,
    ) -> Result<Id> {
        if flags.contains(CreateInstanceFlags::UNWRAP) {
            if let Some(native) = self.registry.lookup_native(object, Origin::Native) {
                return Ok(native);
            }
        }
        if let Some(instance) = self.existing_instance(object)? {
            return Ok(instance);
        }

        let class = self
            .policy
            .compute_instance_class(&self.registrar, object, flags)?;
        match self.allocator.allocate(class, object) {
            Ok(instance) => {
                debug!("created instance {:?} for {:?}", instance, ManagedId::of(object));
                Ok(instance)
            }
            Err(err @ Error::DuplicateIdentity { .. }) => {
                // Lost a race; the winner's instance is registered.
                self.existing_instance(object)?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    fn existing_instance(&self, object: &ManagedObject) -> Result<Option<Id>> {
        loop {
            let Some(native) = self.registry.lookup_native(object, Origin::Managed) else {
                return Ok(None);
            };
            if self.is_block_descriptor(native) {
                return Err(Error::DuplicateIdentity {
                    native: native.addr(),
                    origin: Origin::Managed,
                });
            }
            // Closure records are unlinked from the registry before they
            // leave the block table, so a pair that survives the table
            // check is an instance.
            if self.registry.lookup_native(object, Origin::Managed) == Some(native) {
                return Ok(Some(native));
            }
        }
    }

    /// Returns the managed object for a native instance, building a wrapper
    /// with the policy on first use.
    ///
    /// With [`CreateObjectFlags::UNWRAP`], an instance the bridge allocated
    /// for a managed object yields that object.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] if the instance's class has no factory, or
    /// whatever the factory reports.
    pub fn get_or_create_object_for_instance(
        &self,
        instance: Id,
        flags: CreateObjectFlags,
    ) -> Result<ManagedObject> {
        if let Some(found) = self.existing_object(instance, flags) {
            return Ok(found);
        }
        let wrapper = self
            .policy
            .create_object(&self.registrar, instance, flags)?;
        self.bind_wrapper(instance, wrapper)
    }

    /// Like [`Bridge::get_or_create_object_for_instance`], with a wrapper
    /// the caller has already built.
    ///
    /// With [`CreateObjectFlags::OBJECT_INIT`], `instance` is a fresh
    /// allocation from [`LifetimeMethods::alloc`] and is bound to `wrapper`
    /// as a bridge-owned instance.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateIdentity`] if `wrapper` is already bridged to a
    /// different instance.
    pub fn get_or_register_object_for_instance(
        &self,
        instance: Id,
        flags: CreateObjectFlags,
        wrapper: ManagedObject,
    ) -> Result<ManagedObject> {
        if flags.contains(CreateObjectFlags::OBJECT_INIT) {
            self.allocator.initialize(instance, &wrapper)?;
            return Ok(wrapper);
        }
        if let Some(found) = self.existing_object(instance, flags) {
            return Ok(found);
        }
        self.bind_wrapper(instance, wrapper)
    }

    fn existing_object(&self, instance: Id, flags: CreateObjectFlags) -> Option<ManagedObject> {
        if flags.contains(CreateObjectFlags::UNWRAP) {
            if let Some(object) = self.allocator.object(instance) {
                return Some(object);
            }
        }
        self.registry.lookup_managed(instance, Origin::Native)
    }

    fn bind_wrapper(&self, instance: Id, wrapper: ManagedObject) -> Result<ManagedObject> {
        match self.registry.register(&wrapper, instance, Origin::Native) {
            Ok(()) => {
                debug!("wrapped instance {:?}", instance);
                Ok(wrapper)
            }
            Err(err @ Error::DuplicateIdentity { .. }) => self
                .registry
                .lookup_managed(instance, Origin::Native)
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    /// Detaches a managed wrapper from its native instance. A later lookup
    /// of the instance builds a new wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if `wrapper` is not bound.
    pub fn separate_object_from_instance(&self, wrapper: &ManagedObject) -> Result<Id> {
        let instance = self.registry.unregister(wrapper)?;
        debug!("separated wrapper from instance {:?}", instance);
        Ok(instance)
    }

    /// Returns the managed object a bridge-allocated instance stands for,
    /// read from its back-reference.
    #[must_use]
    pub fn instance_object(&self, instance: Id) -> Option<ManagedObject> {
        self.allocator.object(instance)
    }

    /// Destroys a bridge-allocated instance and unpins its object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if the bridge did not allocate it.
    ///
    /// # Safety
    ///
    /// `instance` must not be used afterwards.
    pub unsafe fn destroy_instance(&self, instance: Id) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe { self.allocator.teardown(instance) }
    }

    /// The `alloc`/`dealloc` implementations to install on bridge-backed
    /// classes. They dispatch through [`Bridge::global`].
    #[must_use]
    pub fn lifetime_methods() -> LifetimeMethods {
        LifetimeMethods {
            alloc: Imp::from_ptr(alloc_instance as *const c_void),
            dealloc: Imp::from_ptr(dealloc_instance as *const c_void),
        }
    }

    // ========================================================================
    // Closures
    // ========================================================================

    /// Returns a block literal for `callable`.
    ///
    /// The first request creates the closure record; later requests reuse it
    /// and add a reference, until every literal has been released. The
    /// literal must eventually go to [`Bridge::release_block_literal`].
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedCallableShape`] if the policy has no block shape
    ///   for the callable
    /// - [`Error::DuplicateIdentity`] if `callable` already stands for a
    ///   native instance
    pub fn create_block_for_callable(
        &self,
        callable: &ManagedObject,
        flags: CreateBlockFlags,
    ) -> Result<BlockLiteral> {
        let id = ManagedId::of(callable);
        let isa = self.runtime.stack_block_isa();

        loop {
            if let Some(descriptor) = self.registry.lookup_native_by_id(id, Origin::Managed) {
                let Some(details) = self.block_record(descriptor) else {
                    if self.registry.lookup_native_by_id(id, Origin::Managed) == Some(descriptor) {
                        return Err(Error::DuplicateIdentity {
                            native: descriptor.addr(),
                            origin: Origin::Managed,
                        });
                    }
                    // The record was collected between the two lookups.
                    continue;
                };
                if let Some(count) = details.lifetime().try_acquire() {
                    trace!("reused closure {:?}: count {}", descriptor, count);
                    return Ok(details.literal(isa));
                }
                self.retire_block(id, descriptor);
                continue;
            }

            let shape = self.policy.block_shape(callable, flags)?;
            let details =
                BlockDetails::new(callable, shape.invoke, &shape.signature, self.host.clone())?;
            let descriptor = descriptor_id(&details);
            self.blocks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(descriptor.addr(), details.clone());

            match self.registry.register(callable, descriptor, Origin::Managed) {
                Ok(()) => {
                    debug!(
                        "created closure {:?} ({}) with handle {}",
                        descriptor,
                        shape.signature,
                        details.handle().into_raw()
                    );
                    return Ok(details.literal(isa));
                }
                Err(Error::DuplicateIdentity { .. }) => {
                    // Another thread registered first; undo and take its record.
                    self.discard_block(&details);
                }
                Err(err) => {
                    self.discard_block(&details);
                    return Err(err);
                }
            }
        }
    }

    /// Drops one literal's reference to its callable. At zero the callable
    /// is unpinned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LifetimeInvariantViolation`] if the literal was
    /// already released or was not created by the bridge.
    pub fn release_block_literal(&self, literal: &mut BlockLiteral) -> Result<LifetimeState> {
        if literal.lifetime.is_null() {
            return Err(Error::lifetime("literal has already been released"));
        }
        // SAFETY: a safely obtained literal with a lifetime pointer was made
        // by the bridge and still holds its reference.
        unsafe { lifetime::release_literal(literal) }
    }

    /// Makes a second literal for the same callable, as the copy hook
    /// would.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LifetimeInvariantViolation`] if `literal` has been
    /// released.
    pub fn copy_block_literal(&self, literal: &BlockLiteral) -> Result<BlockLiteral> {
        let mut copy = BlockLiteral {
            isa: literal.isa,
            flags: literal.flags,
            reserved: literal.reserved,
            invoke: literal.invoke,
            descriptor: std::ptr::null(),
            lifetime: std::ptr::null(),
        };
        // SAFETY: both literals are valid; see `release_block_literal`.
        unsafe { lifetime::copy_literal(&mut copy, literal) }?;
        Ok(copy)
    }

    /// Returns the managed callable for a native block.
    ///
    /// With [`CreateDelegateFlags::UNWRAP`], a block the bridge created
    /// yields its original callable. Otherwise the block is copied and
    /// `create` receives a [`BlockDispatch`] owning that copy; the callable
    /// it returns must keep the dispatch alive for as long as it may invoke
    /// the block. If `create` fails, the dispatch is dropped and the copy
    /// released.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBlock`] for a null block or a failed copy, or
    /// whatever `create` returns.
    ///
    /// # Safety
    ///
    /// `block` must be null or point to a valid block literal.
    pub unsafe fn get_or_create_callable_for_block<F>(
        &self,
        block: *const BlockLiteral,
        flags: CreateDelegateFlags,
        create: F,
    ) -> Result<ManagedObject>
    where
        F: FnOnce(BlockDispatch) -> Result<ManagedObject>,
    {
        if block.is_null() {
            return Err(Error::InvalidBlock {
                reason: "null block".into(),
            });
        }
        if flags.contains(CreateDelegateFlags::UNWRAP) {
            // SAFETY: valid per the caller.
            if let Some(callable) = unsafe { inspect_bridge_block(block) }.and_then(|d| d.callable()) {
                return Ok(callable);
            }
        }
        if let Some(existing) = self
            .registry
            .lookup_managed(Id::from_block(block), Origin::Native)
        {
            return Ok(existing);
        }

        // SAFETY: valid per the caller.
        let copied = unsafe { self.runtime.block_copy(block) };
        if copied.is_null() {
            return Err(Error::InvalidBlock {
                reason: "block copy failed".into(),
            });
        }
        let dispatch = BlockDispatch::new(copied, self.runtime.clone(), self.registry.clone());
        let callable = create(dispatch)?;

        let native = Id::from_block(copied);
        match self.registry.register(&callable, native, Origin::Native) {
            Ok(()) => {
                debug!("wrapped native block {:?}", native);
                Ok(callable)
            }
            Err(err @ Error::DuplicateIdentity { .. }) => {
                self.registry.lookup_managed(native, Origin::Native).ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Removes closure records whose count has reached zero. Returns how
    /// many were removed.
    pub fn collect_released_blocks(&self) -> usize {
        let candidates: Vec<(ManagedId, Id)> = self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|details| details.lifetime().ref_count() == 0)
            .map(|details| (details.callable_id(), descriptor_id(details)))
            .collect();

        // Unlink first so a concurrent wrap never sees a registry pair
        // without its record.
        let collected = candidates
            .into_iter()
            .filter(|&(callable, descriptor)| self.retire_block(callable, descriptor))
            .count();
        if collected > 0 {
            debug!("collected {} released closures", collected);
        }
        collected
    }

    /// Current bookkeeping counts.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        let (block_records, released_blocks) = {
            let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
            let released = blocks
                .values()
                .filter(|details| details.lifetime().ref_count() == 0)
                .count();
            (blocks.len(), released)
        };
        BridgeStats {
            identities: self.registry.counts(),
            block_records,
            released_blocks,
            live_handles: self.host.live_handles(),
        }
    }

    fn block_record(&self, descriptor: Id) -> Option<Arc<BlockDetails>> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.addr())
            .cloned()
    }

    fn is_block_descriptor(&self, native: Id) -> bool {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&native.addr())
    }

    /// Unlinks a released record so the callable can get a fresh one.
    /// Returns true if this call removed it from the block table.
    ///
    /// A released record never becomes live again, so the registry pair can
    /// go before the table entry.
    fn retire_block(&self, callable: ManagedId, descriptor: Id) -> bool {
        self.registry.remove_pair(callable, descriptor, Origin::Managed);
        let removed = {
            let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
            match blocks.entry(descriptor.addr()) {
                Entry::Occupied(entry) if entry.get().lifetime().ref_count() == 0 => {
                    Some(entry.remove())
                }
                _ => None,
            }
        };
        match removed {
            Some(_) => {
                trace!("retired closure {:?}", descriptor);
                true
            }
            None => false,
        }
    }

    /// Throws away a record that was never published.
    fn discard_block(&self, details: &Arc<BlockDetails>) {
        if let Err(err) = details.lifetime().release() {
            warn!("discarding closure: {err}");
        }
        details.release_handle();
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&descriptor_id(details).addr());
    }
}

fn descriptor_id(details: &BlockDetails) -> Id {
    Id::from_ptr(details.descriptor().cast_mut().cast())
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// `+ (id)alloc` for bridge-backed classes.
unsafe extern "C" fn alloc_instance(class: ClassRef, _sel: Sel) -> Id {
    let bridge = match Bridge::global() {
        Ok(bridge) => bridge,
        Err(err) => {
            error!("alloc: {err}");
            return Id::NIL;
        }
    };
    bridge.allocator.allocate_raw(class).unwrap_or_else(|err| {
        warn!("alloc: {err}");
        Id::NIL
    })
}

/// `- (void)dealloc` for bridge-backed classes.
unsafe extern "C" fn dealloc_instance(this: Id, _sel: Sel) {
    match Bridge::global() {
        Ok(bridge) => {
            // SAFETY: the runtime deallocates `this` exactly once.
            if let Err(err) = unsafe { bridge.destroy_instance(this) } {
                warn!("dealloc {:?}: {err}", this);
            }
        }
        Err(err) => error!("dealloc: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::managed;
    use crate::runtime::native::MessageSendCallbacks;
    use crate::runtime::registrar::{ManagedType, factory};
    use crate::sim::SimRuntime;

    struct Alpha;
    struct Callback(i32);

    extern "C" fn callback_invoke(block: *mut BlockLiteral, value: i32) -> i32 {
        let callable = unsafe { BlockLiteral::callable(block) }.unwrap();
        callable.downcast_ref::<Callback>().unwrap().0 + value
    }

    fn bridge() -> (Arc<SimRuntime>, Bridge) {
        let runtime = Arc::new(SimRuntime::new());
        runtime.define_class("NSAlpha", None).unwrap();

        let policy = RegistrarPolicy::new();
        policy
            .register_block_shape::<Callback>(Imp::from_ptr(callback_invoke as *const c_void), "i?i")
            .unwrap();

        let bridge = Bridge::builder(runtime.clone())
            .policy(Arc::new(policy))
            .build();
        bridge
            .registrar()
            .initialize([(
                ManagedType::of::<Alpha>(),
                "NSAlpha",
                factory(|_, _| Ok(managed(Alpha))),
            )])
            .unwrap();
        (runtime, bridge)
    }

    #[test]
    fn test_instance_round_trip() {
        let (_runtime, bridge) = bridge();
        let object = managed(Alpha);

        let instance = bridge
            .get_or_create_instance_for_object(&object, CreateInstanceFlags::NONE)
            .unwrap();
        let again = bridge
            .get_or_create_instance_for_object(&object, CreateInstanceFlags::NONE)
            .unwrap();
        assert_eq!(instance, again);

        let back = bridge
            .get_or_create_object_for_instance(instance, CreateObjectFlags::UNWRAP)
            .unwrap();
        assert!(Arc::ptr_eq(&back, &object));

        unsafe { bridge.destroy_instance(instance) }.unwrap();
        assert_eq!(bridge.stats().live_handles, 0);
    }

    #[test]
    fn test_unknown_type_has_no_class() {
        let (_runtime, bridge) = bridge();
        let err = bridge
            .get_or_create_instance_for_object(&managed(5_u8), CreateInstanceFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownClass { .. }));
    }

    #[test]
    fn test_block_reuse_increments_count() {
        let (_runtime, bridge) = bridge();
        let callable = managed(Callback(1));

        let mut first = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();
        let mut second = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();

        assert_eq!(first.descriptor(), second.descriptor());
        assert_eq!(first.lifetime_state(), Some(LifetimeState::Live(2)));

        assert_eq!(
            bridge.release_block_literal(&mut first),
            Ok(LifetimeState::Live(1))
        );
        assert_eq!(
            bridge.release_block_literal(&mut second),
            Ok(LifetimeState::Released)
        );
        assert_eq!(bridge.stats().live_handles, 0);
    }

    #[test]
    fn test_released_record_is_replaced() {
        let (_runtime, bridge) = bridge();
        let callable = managed(Callback(1));

        let mut first = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();
        bridge.release_block_literal(&mut first).unwrap();
        assert_eq!(bridge.stats().released_blocks, 1);

        let mut fresh = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();
        assert_eq!(fresh.lifetime_state(), Some(LifetimeState::Live(1)));
        assert_eq!(bridge.stats().block_records, 1);
        assert_eq!(bridge.stats().released_blocks, 0);

        bridge.release_block_literal(&mut fresh).unwrap();
        assert_eq!(bridge.collect_released_blocks(), 1);
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[test]
    fn test_block_invokes_callable() {
        let (_runtime, bridge) = bridge();
        let callable = managed(Callback(40));
        let mut literal = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();

        let f: extern "C" fn(*mut BlockLiteral, i32) -> i32 = unsafe { literal.invoke_as() };
        assert_eq!(f(&mut literal, 2), 42);

        bridge.release_block_literal(&mut literal).unwrap();
    }

    #[test]
    fn test_object_cannot_be_instance_and_closure() {
        let (_runtime, bridge) = bridge();
        let callable = managed(Callback(0));
        let mut literal = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();

        let err = bridge
            .get_or_create_instance_for_object(&callable, CreateInstanceFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { .. }));

        bridge.release_block_literal(&mut literal).unwrap();
    }

    #[test]
    fn test_release_twice_is_violation() {
        let (_runtime, bridge) = bridge();
        let callable = managed(Callback(0));
        let mut literal = bridge
            .create_block_for_callable(&callable, CreateBlockFlags::NONE)
            .unwrap();

        bridge.release_block_literal(&mut literal).unwrap();
        let err = bridge.release_block_literal(&mut literal).unwrap_err();
        assert!(err.is_fatal());
        assert!(bridge.copy_block_literal(&literal).unwrap_err().is_fatal());
    }

    #[test]
    fn test_unshaped_callable() {
        let (_runtime, bridge) = bridge();
        let err = bridge
            .create_block_for_callable(&managed(Alpha), CreateBlockFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCallableShape { .. }));
        assert_eq!(bridge.stats().block_records, 0);
    }

    /// A runtime without classes or a message send hook.
    struct HooklessRuntime;

    impl NativeRuntime for HooklessRuntime {
        fn get_class(&self, _name: &str) -> ClassRef {
            ClassRef::NO_CLASS
        }
        fn class_name(&self, _class: ClassRef) -> Option<String> {
            None
        }
        fn object_class_name(&self, _object: Id) -> Option<String> {
            None
        }
        fn register_selector(&self, _name: &str) -> Sel {
            Sel::NO_SEL
        }
        unsafe fn create_instance(&self, _class: ClassRef, _extra_bytes: usize) -> Id {
            Id::NIL
        }
        unsafe fn indexed_ivars(&self, _object: Id) -> *mut u8 {
            std::ptr::null_mut()
        }
        unsafe fn destruct_instance(&self, _object: Id) {}
        unsafe fn block_copy(&self, _block: *const BlockLiteral) -> *mut BlockLiteral {
            std::ptr::null_mut()
        }
        unsafe fn block_release(&self, _block: *const BlockLiteral) {}
        fn stack_block_isa(&self) -> *const c_void {
            std::ptr::null()
        }
    }

    #[test]
    fn test_register_as_global_reports_missing_hook() {
        let callbacks = MessageSendCallbacks {
            msg_send: Some(Imp::from_ptr(callback_invoke as *const c_void)),
            ..MessageSendCallbacks::default()
        };
        let hookless = Bridge::builder(Arc::new(HooklessRuntime))
            .policy(Arc::new(RegistrarPolicy::new().with_message_send_callbacks(callbacks)))
            .build();
        oxibridge_log::capture();
        assert!(!hookless.register_as_global());
        assert!(oxibridge_log::take_captured().iter().any(|record| {
            record.level == oxibridge_log::Level::Warn
                && record.message.contains("message send callbacks")
        }));

        // Nothing to install is not a failure.
        let empty = Bridge::builder(Arc::new(HooklessRuntime)).build();
        assert!(empty.register_as_global());

        let (runtime, bridge) = bridge();
        let simulated = Bridge::builder(runtime.clone())
            .policy(Arc::new(RegistrarPolicy::new().with_message_send_callbacks(callbacks)))
            .build();
        assert!(simulated.register_as_global());
        assert_eq!(runtime.message_send_callbacks(), callbacks);
        drop(bridge);
    }

    #[test]
    fn test_lifetime_methods_are_distinct() {
        let methods = Bridge::lifetime_methods();
        assert!(!methods.alloc.is_null());
        assert_ne!(methods.alloc, methods.dealloc);
    }
}
