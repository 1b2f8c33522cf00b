//! Native-side identities and the native runtime surface the bridge calls.
//!
//! The native runtime (class registry, selector table, message dispatch and
//! the block runtime) is an external collaborator. The bridge only needs the
//! handful of primitives in [`NativeRuntime`]; everything else stays behind
//! the runtime's own entry points.
//!
//! Two implementations ship with the crate: [`crate::sim::SimRuntime`], an
//! in-process runtime with libobjc/libclosure semantics, and (on Apple
//! targets) `crate::apple::ObjcRuntime`, which forwards to libobjc.

use crate::runtime::block::BlockLiteral;
use std::ffi::c_void;
use std::fmt;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident, $null:ident, $null_doc:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash)]
        pub struct $name(*mut c_void);

        impl $name {
            #[doc = $null_doc]
            pub const $null: $name = $name(std::ptr::null_mut());

            /// Wraps a raw native pointer.
            #[must_use]
            pub const fn from_ptr(ptr: *mut c_void) -> Self {
                $name(ptr)
            }

            /// Returns the raw native pointer.
            #[must_use]
            pub const fn as_ptr(self) -> *mut c_void {
                self.0
            }

            /// Returns the pointer as an address, for use as a map key.
            #[must_use]
            pub fn addr(self) -> usize {
                self.0 as usize
            }

            /// Returns true if this is the null value.
            #[must_use]
            pub fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.addr())
            }
        }

        // SAFETY: the value is an opaque address. The bridge never
        // dereferences it except through `NativeRuntime` calls, which the
        // native runtime makes thread-safe.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

native_handle!(
    /// A native object pointer (`id`). Blocks are objects too.
    Id,
    NIL,
    "The nil object."
);

native_handle!(
    /// A native class pointer (`Class`).
    ClassRef,
    NO_CLASS,
    "The null class sentinel."
);

native_handle!(
    /// A registered native selector (`SEL`).
    Sel,
    NO_SEL,
    "The null selector."
);

impl Id {
    /// Views a block pointer as an object.
    #[must_use]
    pub fn from_block(block: *const BlockLiteral) -> Self {
        Id(block.cast_mut().cast())
    }

    /// Views this object as a block pointer.
    #[must_use]
    pub fn as_block(self) -> *mut BlockLiteral {
        self.0.cast()
    }
}

/// An untyped native entry point (`IMP`, block invoke function, ...).
///
/// The concrete signature is only known at the call site; convert back with
/// [`Imp::cast`].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Imp(*const c_void);

impl Imp {
    /// Wraps an entry point address.
    #[must_use]
    pub const fn from_ptr(ptr: *const c_void) -> Self {
        Imp(ptr)
    }

    /// Returns the entry point address.
    #[must_use]
    pub const fn as_ptr(self) -> *const c_void {
        self.0
    }

    /// Returns true if no entry point is set.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Reinterprets the entry point as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type whose signature and calling
    /// convention match the code at this address. The address must not be
    /// null.
    ///
    /// # Panics
    ///
    /// Panics if `F` is not pointer-sized.
    #[must_use]
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const c_void>(),
            "Imp::cast target must be a function pointer"
        );
        // SAFETY: sizes match and the caller vouches for the signature.
        unsafe { std::mem::transmute_copy(&self.0) }
    }
}

impl fmt::Debug for Imp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imp({:p})", self.0)
    }
}

// SAFETY: an entry point is immutable code; sharing its address is sound.
unsafe impl Send for Imp {}
unsafe impl Sync for Imp {}

/// Overrides for the native `objc_msgSend` family.
///
/// Supplying these lets the managed side intercept message sends, e.g. for
/// exception propagation or variadic argument support. A `None` entry keeps
/// the runtime's own implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageSendCallbacks {
    /// `objc_msgSend`
    pub msg_send: Option<Imp>,
    /// `objc_msgSend_fpret`
    pub msg_send_fpret: Option<Imp>,
    /// `objc_msgSend_stret`
    pub msg_send_stret: Option<Imp>,
    /// `objc_msgSendSuper`
    pub msg_send_super: Option<Imp>,
    /// `objc_msgSendSuper_stret`
    pub msg_send_super_stret: Option<Imp>,
}

impl MessageSendCallbacks {
    /// Returns true if no override is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == MessageSendCallbacks::default()
    }
}

/// The native runtime primitives the bridge depends on.
///
/// Implementations must be callable from any thread. In particular
/// [`NativeRuntime::block_copy`] and [`NativeRuntime::block_release`] run the
/// bridge's copy/dispose hooks synchronously and must not hold a lock that
/// those hooks could need.
pub trait NativeRuntime: Send + Sync {
    /// Looks up a class by name (`objc_getClass`). Returns
    /// [`ClassRef::NO_CLASS`] if the runtime has no such class.
    fn get_class(&self, name: &str) -> ClassRef;

    /// Returns the name of a class (`class_getName`), or `None` if the
    /// pointer is not a class this runtime knows.
    fn class_name(&self, class: ClassRef) -> Option<String>;

    /// Returns the runtime class name of an object (`object_getClassName`).
    fn object_class_name(&self, object: Id) -> Option<String>;

    /// Registers or looks up a selector (`sel_registerName`).
    fn register_selector(&self, name: &str) -> Sel;

    /// Allocates an instance of `class` with `extra_bytes` of zeroed
    /// trailing storage (`class_createInstance`). Returns [`Id::NIL`] on
    /// failure.
    ///
    /// # Safety
    ///
    /// `class` must be null or a class pointer obtained from this runtime.
    unsafe fn create_instance(&self, class: ClassRef, extra_bytes: usize) -> Id;

    /// Returns the start of the trailing storage (`object_getIndexedIvars`).
    ///
    /// # Safety
    ///
    /// `object` must be a live instance allocated by
    /// [`NativeRuntime::create_instance`].
    unsafe fn indexed_ivars(&self, object: Id) -> *mut u8;

    /// Tears down and frees an instance (`object_dispose`).
    ///
    /// # Safety
    ///
    /// `object` must be a live instance allocated by
    /// [`NativeRuntime::create_instance`]; it is invalid afterwards.
    unsafe fn destruct_instance(&self, object: Id);

    /// Takes a strong reference to a block (`_Block_copy`). Stack blocks are
    /// moved to the heap, running the block's copy helper.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid block literal.
    unsafe fn block_copy(&self, block: *const BlockLiteral) -> *mut BlockLiteral;

    /// Drops a strong reference to a block (`_Block_release`), running the
    /// dispose helper when the last heap reference goes away.
    ///
    /// # Safety
    ///
    /// `block` must be a pointer returned by [`NativeRuntime::block_copy`]
    /// that has not been released yet.
    unsafe fn block_release(&self, block: *const BlockLiteral);

    /// The `isa` of stack blocks (`_NSConcreteStackBlock`).
    fn stack_block_isa(&self) -> *const c_void;

    /// Installs `objc_msgSend` overrides. Returns false if the runtime has
    /// no hook for them, which is the default.
    fn set_message_send_callbacks(&self, callbacks: &MessageSendCallbacks) -> bool {
        let _ = callbacks;
        false
    }
}
