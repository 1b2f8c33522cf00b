//! `oxibridge` runtime module.
//!
//! # Architecture
//!
//! The runtime is organized into several modules:
//!
//! - [`native`]: native handles and the [`NativeRuntime`] surface
//! - [`handle`]: managed objects and the [`ManagedHost`] handle capability
//! - [`identity`]: the bijection between managed objects and native pointers
//! - [`registrar`]: managed type <-> native class registrations
//! - [`instance`]: bridge-allocated instances and their back-references
//! - [`block`]: block ABI records and the copy/dispose hooks
//! - [`lifetime`]: per-callable reference counting
//! - [`dispatch`]: managed handles on retained native blocks
//! - [`encoding`]: block signature validation
//! - [`policy`]: the embedder's decisions
//! - [`wrappers`]: the [`Bridge`] facade
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use oxibridge::runtime::{Bridge, CreateInstanceFlags, ManagedType, factory, managed};
//! use oxibridge::SimRuntime;
//!
//! struct Point;
//!
//! let runtime = Arc::new(SimRuntime::new());
//! runtime.define_class("NSPoint", None).unwrap();
//!
//! let bridge = Bridge::builder(runtime).build();
//! bridge
//!     .registrar()
//!     .initialize([(ManagedType::of::<Point>(), "NSPoint", factory(|_, _| Ok(managed(Point))))])
//!     .unwrap();
//!
//! let point = managed(Point);
//! let instance = bridge
//!     .get_or_create_instance_for_object(&point, CreateInstanceFlags::NONE)
//!     .unwrap();
//! assert!(bridge.instance_object(instance).is_some());
//! ```

pub mod block;
pub mod dispatch;
pub mod encoding;
pub mod flags;
pub mod handle;
pub mod identity;
pub mod instance;
pub mod lifetime;
pub mod native;
pub mod policy;
pub mod registrar;
pub mod wrappers;

pub use block::{
    BLOCK_HAS_COPY_DISPOSE, BLOCK_HAS_SIGNATURE, BLOCK_IS_GLOBAL, BLOCK_NEEDS_FREE,
    BRIDGE_BLOCK_FLAGS, BlockDescriptor, BlockLiteral, block_signature,
};
pub use dispatch::BlockDispatch;
pub use flags::{CreateBlockFlags, CreateDelegateFlags, CreateInstanceFlags, CreateObjectFlags};
pub use handle::{
    GcHandle, HandleTable, ManagedHost, ManagedId, ManagedObject, managed, type_name_of,
};
pub use identity::{IdentityCounts, IdentityRegistry, Origin};
pub use instance::BACK_REFERENCE_SIZE;
pub use lifetime::{BlockLifetime, LifetimeState};
pub use native::{ClassRef, Id, Imp, MessageSendCallbacks, NativeRuntime, Sel};
pub use policy::{BlockShape, RegistrarPolicy, WrapperPolicy};
pub use registrar::{Factory, ManagedType, Registrar, factory};
pub use wrappers::{Bridge, BridgeBuilder, BridgeStats, LifetimeMethods};
