//! `oxibridge`: an identity, closure and lifetime bridge between a managed
//! object world and an Objective-C style native runtime.
//!
//! Two object worlds meet here. On one side, reference-counted managed
//! objects (`Arc<dyn Any + Send + Sync>`); on the other, a native runtime
//! with classes, instances and blocks. The bridge provides:
//!
//! - **Identity**: each managed object maps to at most one native instance
//!   and back, so round trips preserve identity
//! - **Closures**: managed callables become C-ABI block literals that native
//!   code can copy, invoke and dispose
//! - **Lifetime**: a callable stays alive exactly as long as native code
//!   holds a block for it
//!
//! # Architecture
//!
//! - [`runtime`]: the bridge proper, written against the [`NativeRuntime`]
//!   trait
//! - [`sim`]: an in-process native runtime with libobjc/libclosure
//!   semantics
//! - `apple`: the libobjc backend, on Apple targets
//!
//! # Example
//!
//! ```rust
//! use std::ffi::c_void;
//! use std::sync::Arc;
//! use oxibridge::{
//!     Bridge, BlockLiteral, CreateBlockFlags, Imp, LifetimeState, RegistrarPolicy, SimRuntime,
//!     managed,
//! };
//!
//! struct Adder(i32);
//!
//! extern "C" fn adder_invoke(block: *mut BlockLiteral, value: i32) -> i32 {
//!     let callable = unsafe { BlockLiteral::callable(block) }.unwrap();
//!     callable.downcast_ref::<Adder>().unwrap().0 + value
//! }
//!
//! let policy = RegistrarPolicy::new();
//! policy
//!     .register_block_shape::<Adder>(Imp::from_ptr(adder_invoke as *const c_void), "i?i")
//!     .unwrap();
//! let bridge = Bridge::builder(Arc::new(SimRuntime::new()))
//!     .policy(Arc::new(policy))
//!     .build();
//!
//! let mut block = bridge
//!     .create_block_for_callable(&managed(Adder(40)), CreateBlockFlags::NONE)
//!     .unwrap();
//! let invoke: extern "C" fn(*mut BlockLiteral, i32) -> i32 = unsafe { block.invoke_as() };
//! assert_eq!(invoke(&mut block, 2), 42);
//!
//! assert_eq!(bridge.release_block_literal(&mut block), Ok(LifetimeState::Released));
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod sim;

#[cfg(target_vendor = "apple")]
pub mod apple;

// Re-export commonly used types
pub use config::{BridgeConfig, ViolationPolicy};
pub use error::{Error, Result};
pub use runtime::{
    BlockDispatch, BlockLiteral, BlockShape, Bridge, BridgeStats, ClassRef,
    CreateBlockFlags, CreateDelegateFlags, CreateInstanceFlags, CreateObjectFlags,
    GcHandle, HandleTable, Id, IdentityRegistry, Imp, LifetimeState, ManagedHost,
    ManagedObject, ManagedType, MessageSendCallbacks, NativeRuntime, Origin, RegistrarPolicy, Sel,
    WrapperPolicy, factory, managed,
};
pub use sim::SimRuntime;

#[cfg(target_vendor = "apple")]
pub use apple::ObjcRuntime;
