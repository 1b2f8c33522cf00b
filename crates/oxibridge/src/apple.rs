//! The libobjc backend.
//!
//! [`ObjcRuntime`] forwards every [`NativeRuntime`] primitive to the system
//! Objective-C runtime and block runtime. Both ship in libobjc on Apple
//! platforms.

use crate::runtime::block::BlockLiteral;
use crate::runtime::native::{ClassRef, Id, NativeRuntime, Sel};
use std::ffi::{CStr, CString, c_char, c_void};

#[link(name = "objc")]
unsafe extern "C" {
    fn objc_getClass(name: *const c_char) -> *mut c_void;
    fn class_getName(class: *mut c_void) -> *const c_char;
    fn object_getClassName(object: *mut c_void) -> *const c_char;
    fn sel_registerName(name: *const c_char) -> *mut c_void;
    fn class_createInstance(class: *mut c_void, extra_bytes: usize) -> *mut c_void;
    fn object_getIndexedIvars(object: *mut c_void) -> *mut c_void;
    fn object_dispose(object: *mut c_void) -> *mut c_void;

    fn _Block_copy(block: *const c_void) -> *mut c_void;
    fn _Block_release(block: *const c_void);

    static _NSConcreteStackBlock: [*const c_void; 32];
}

/// [`NativeRuntime`] over the system libobjc.
///
/// libobjc has no public hook for replacing `objc_msgSend`, so this backend
/// keeps the default [`NativeRuntime::set_message_send_callbacks`] and
/// [`crate::Bridge::register_as_global`] reports the overrides as not
/// installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjcRuntime;

impl ObjcRuntime {
    /// Creates the backend. The system runtime is process-wide.
    #[must_use]
    pub const fn new() -> Self {
        ObjcRuntime
    }
}

fn owned_name(name: *const c_char) -> Option<String> {
    if name.is_null() {
        return None;
    }
    // SAFETY: libobjc returns NUL-terminated names that live as long as
    // the class.
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

impl NativeRuntime for ObjcRuntime {
    fn get_class(&self, name: &str) -> ClassRef {
        let Ok(name) = CString::new(name) else {
            return ClassRef::NO_CLASS;
        };
        // SAFETY: `name` is a valid C string.
        ClassRef::from_ptr(unsafe { objc_getClass(name.as_ptr()) })
    }

    fn class_name(&self, class: ClassRef) -> Option<String> {
        if class.is_null() {
            return None;
        }
        // SAFETY: libobjc accepts any class pointer it handed out.
        owned_name(unsafe { class_getName(class.as_ptr()) })
    }

    fn object_class_name(&self, object: Id) -> Option<String> {
        if object.is_null() {
            return None;
        }
        // SAFETY: `object` is a live object per the bridge's bookkeeping.
        owned_name(unsafe { object_getClassName(object.as_ptr()) })
    }

    fn register_selector(&self, name: &str) -> Sel {
        let Ok(name) = CString::new(name) else {
            return Sel::NO_SEL;
        };
        // SAFETY: `name` is a valid C string; libobjc copies it.
        Sel::from_ptr(unsafe { sel_registerName(name.as_ptr()) })
    }

    unsafe fn create_instance(&self, class: ClassRef, extra_bytes: usize) -> Id {
        // SAFETY: forwarded to the caller.
        Id::from_ptr(unsafe { class_createInstance(class.as_ptr(), extra_bytes) })
    }

    unsafe fn indexed_ivars(&self, object: Id) -> *mut u8 {
        // SAFETY: forwarded to the caller.
        unsafe { object_getIndexedIvars(object.as_ptr()) }.cast()
    }

    unsafe fn destruct_instance(&self, object: Id) {
        // SAFETY: forwarded to the caller.
        unsafe { object_dispose(object.as_ptr()) };
    }

    unsafe fn block_copy(&self, block: *const BlockLiteral) -> *mut BlockLiteral {
        // SAFETY: forwarded to the caller.
        unsafe { _Block_copy(block.cast()) }.cast()
    }

    unsafe fn block_release(&self, block: *const BlockLiteral) {
        // SAFETY: forwarded to the caller.
        unsafe { _Block_release(block.cast()) };
    }

    fn stack_block_isa(&self) -> *const c_void {
        (&raw const _NSConcreteStackBlock).cast()
    }
}
