// Common test utilities for integration tests
//
// Shared fixtures: a simulated runtime with a few classes, a bridge with
// block shapes for the test callables, and invoke functions.

#![allow(dead_code)]

use oxibridge::runtime::{
    BLOCK_HAS_COPY_DISPOSE, BLOCK_HAS_SIGNATURE, BlockDescriptor, BlockDispatch,
};
use oxibridge::{
    BlockLiteral, Bridge, CreateObjectFlags, Id, Imp, ManagedObject, ManagedType, NativeRuntime,
    RegistrarPolicy, SimRuntime, factory, managed,
};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A managed type registered as `NSAlpha`.
#[derive(Debug)]
pub struct Alpha(pub u32);

/// A managed type with no native class.
#[derive(Debug)]
pub struct Beta;

/// Wrapper built by the `NSAlpha` factory for foreign instances.
#[derive(Debug)]
pub struct AlphaWrapper(pub Id);

/// A managed callable bridged with signature `i?i`.
#[derive(Debug)]
pub struct IntBlock(pub i32);

/// Invoke function of [`IntBlock`] literals: adds the argument to the
/// callable's value.
pub extern "C" fn int_block_invoke(block: *mut BlockLiteral, value: i32) -> i32 {
    match unsafe { BlockLiteral::callable(block) } {
        Some(callable) => callable
            .downcast_ref::<IntBlock>()
            .map_or(-1, |c| c.0 + value),
        None => -1,
    }
}

pub fn int_block_imp() -> Imp {
    Imp::from_ptr(int_block_invoke as *const c_void)
}

/// Runtime with `NSObject` and `NSAlpha : NSObject`.
pub fn setup_runtime() -> Arc<SimRuntime> {
    let runtime = Arc::new(SimRuntime::new());
    let root = runtime.define_class("NSObject", None).unwrap();
    runtime.define_class("NSAlpha", Some(root)).unwrap();
    runtime
}

/// Policy knowing the [`IntBlock`] shape.
pub fn setup_policy() -> RegistrarPolicy {
    let policy = RegistrarPolicy::new();
    policy
        .register_block_shape::<IntBlock>(int_block_imp(), "i?i")
        .unwrap();
    policy
}

/// Bridge with `Alpha <-> NSAlpha` registered.
pub fn setup_bridge() -> (Arc<SimRuntime>, Bridge) {
    let runtime = setup_runtime();
    let bridge = Bridge::builder(runtime.clone())
        .policy(Arc::new(setup_policy()))
        .build();
    bridge
        .registrar()
        .initialize([(
            ManagedType::of::<Alpha>(),
            "NSAlpha",
            factory(|instance, _flags: CreateObjectFlags| Ok(managed(AlphaWrapper(instance)))),
        )])
        .unwrap();
    (runtime, bridge)
}

// ============================================================================
// Native blocks
// ============================================================================

/// Invoke function of [`native_block`]: multiplies by three.
pub extern "C" fn triple_invoke(_block: *mut BlockLiteral, value: i32) -> i32 {
    value * 3
}

pub static NATIVE_COPIES: AtomicUsize = AtomicUsize::new(0);
pub static NATIVE_DISPOSES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn native_copy(_dst: *mut BlockLiteral, _src: *const BlockLiteral) {
    NATIVE_COPIES.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn native_dispose(_block: *mut BlockLiteral) {
    NATIVE_DISPOSES.fetch_add(1, Ordering::SeqCst);
}

pub static NATIVE_DESCRIPTOR: BlockDescriptor = BlockDescriptor::new(
    size_of::<BlockLiteral>(),
    Some(native_copy),
    Some(native_dispose),
    c"i?i",
);

/// A stack block as native code would build it.
pub fn native_block(runtime: &dyn NativeRuntime) -> BlockLiteral {
    BlockLiteral::new_native(
        runtime.stack_block_isa(),
        BLOCK_HAS_COPY_DISPOSE | BLOCK_HAS_SIGNATURE,
        Imp::from_ptr(triple_invoke as *const c_void),
        &NATIVE_DESCRIPTOR,
    )
}

/// Managed callable wrapping a native block.
#[derive(Debug)]
pub struct NativeCallable {
    pub dispatch: BlockDispatch,
}

impl NativeCallable {
    pub fn call(&self, value: i32) -> i32 {
        let f: extern "C" fn(*mut BlockLiteral, i32) -> i32 =
            unsafe { self.dispatch.invoker_as() };
        f(self.dispatch.block(), value)
    }
}

pub fn native_callable(dispatch: BlockDispatch) -> oxibridge::Result<ManagedObject> {
    Ok(managed(NativeCallable { dispatch }))
}
