// Global bridge integration tests
//
// The process-wide bridge and the native `alloc`/`dealloc`
// implementations that dispatch through it. Kept in their own test binary
// because a global bridge can only be installed once per process.

mod common;

use common::Alpha;
use oxibridge::runtime::Sel;
use oxibridge::{
    Bridge, ClassRef, CreateObjectFlags, Error, Id, Imp, MessageSendCallbacks, NativeRuntime,
    RegistrarPolicy, SimRuntime, managed,
};
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

type AllocImp = unsafe extern "C" fn(ClassRef, Sel) -> Id;
type DeallocImp = unsafe extern "C" fn(Id, Sel);

extern "C" fn fake_msg_send() {}

fn global() -> &'static (Arc<SimRuntime>, &'static Bridge) {
    static GLOBAL: OnceLock<(Arc<SimRuntime>, &'static Bridge)> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let runtime = common::setup_runtime();
        let policy = common::setup_policy().with_message_send_callbacks(MessageSendCallbacks {
            msg_send: Some(Imp::from_ptr(fake_msg_send as *const c_void)),
            ..MessageSendCallbacks::default()
        });
        let bridge = Bridge::builder(runtime.clone())
            .policy(Arc::new(policy))
            .build();
        let bridge = Bridge::install_global(bridge).unwrap();
        (runtime, bridge)
    })
}

#[test]
fn test_second_install_rejected() {
    let (runtime, _bridge) = global();
    let other = Bridge::builder(runtime.clone())
        .policy(Arc::new(RegistrarPolicy::new()))
        .build();

    assert_eq!(Bridge::install_global(other).unwrap_err(), Error::GlobalAlreadyInstalled);
    assert!(Bridge::global().is_ok());
}

#[test]
fn test_register_as_global_installs_callbacks() {
    let (runtime, bridge) = global();
    assert!(bridge.register_as_global());

    let callbacks = runtime.message_send_callbacks();
    assert_eq!(
        callbacks.msg_send,
        Some(Imp::from_ptr(fake_msg_send as *const c_void))
    );
    assert!(callbacks.msg_send_super.is_none());
}

#[test]
fn test_alloc_init_dealloc() {
    let (runtime, bridge) = global();
    let methods = Bridge::lifetime_methods();
    let alloc: AllocImp = unsafe { methods.alloc.cast() };
    let dealloc: DeallocImp = unsafe { methods.dealloc.cast() };
    let class = runtime.get_class("NSAlpha");
    let sel = bridge.registrar().selector("alloc");
    let before = runtime.live_objects();

    // Native `[NSAlpha alloc]`, then the managed initializer binds its
    // object to the fresh instance.
    let instance = unsafe { alloc(class, sel) };
    assert!(!instance.is_null());
    let object = managed(Alpha(11));
    let bound = bridge
        .get_or_register_object_for_instance(instance, CreateObjectFlags::OBJECT_INIT, object.clone())
        .unwrap();
    assert!(Arc::ptr_eq(&bound, &object));
    assert!(Arc::ptr_eq(&bridge.instance_object(instance).unwrap(), &object));

    let weak = Arc::downgrade(&object);
    drop(bound);
    drop(object);
    assert!(weak.upgrade().is_some());

    unsafe { dealloc(instance, bridge.registrar().selector("dealloc")) };
    assert!(weak.upgrade().is_none());
    assert_eq!(runtime.live_objects(), before);
}

#[test]
fn test_alloc_of_unknown_class_is_nil() {
    let (_runtime, bridge) = global();
    let alloc: AllocImp = unsafe { Bridge::lifetime_methods().alloc.cast() };

    let instance = unsafe { alloc(ClassRef::NO_CLASS, bridge.registrar().selector("alloc")) };
    assert!(instance.is_null());
}
