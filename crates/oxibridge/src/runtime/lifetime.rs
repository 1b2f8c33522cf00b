//! Closure lifetime governor.
//!
//! Each managed callable bridged to a block gets one [`BlockLifetime`]: the
//! handle pinning the callable and a reference count of the block literals
//! that share it. The count starts at 1 for the literal the bridge hands
//! out, goes up in the copy hook and down in the dispose hook. When it
//! reaches 0 the handle is freed and the callable may be collected.
//!
//! # State machine
//!
//! ```text
//! Live(n) --copy--> Live(n + 1)
//! Live(n) --dispose, n > 1--> Live(n - 1)
//! Live(1) --dispose--> Released
//! Released --copy | dispose--> violation
//! ```
//!
//! A violation means native code copied or disposed a block it no longer
//! owned. The safe entry points ([`crate::Bridge::release_block_literal`],
//! [`crate::Bridge::copy_block_literal`]) report it as
//! [`Error::LifetimeInvariantViolation`]. The native hooks cannot return an
//! error, so they log it and end the process according to the configured
//! [`ViolationPolicy`].

use crate::config::ViolationPolicy;
use crate::error::{Error, Result};
use crate::runtime::block::{BlockDetails, BlockLiteral};
use crate::runtime::handle::GcHandle;
use oxibridge_log::{debug, error, trace};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Shared lifetime record of one bridged callable.
///
/// Lives inside the closure's descriptor allocation; every literal for the
/// callable points at the same record.
#[repr(C)]
#[derive(Debug)]
pub struct BlockLifetime {
    handle: GcHandle,
    ref_count: AtomicU32,
}

/// Observable state of a [`BlockLifetime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
    /// This many literals reference the callable.
    Live(u32),
    /// The count reached zero and the handle has been freed.
    Released,
}

impl BlockLifetime {
    pub(crate) const fn new(handle: GcHandle) -> Self {
        BlockLifetime {
            handle,
            ref_count: AtomicU32::new(1),
        }
    }

    /// The handle pinning the callable.
    #[must_use]
    pub fn handle(&self) -> GcHandle {
        self.handle
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifetimeState {
        match self.ref_count() {
            0 => LifetimeState::Released,
            n => LifetimeState::Live(n),
        }
    }

    /// Adds a reference unless the record is released. Used when a wrap
    /// request reuses an existing closure.
    pub(crate) fn try_acquire(&self) -> Option<u32> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 { None } else { count.checked_add(1) }
            })
            .ok()
            .map(|prev| prev + 1)
    }

    /// Adds a reference on behalf of the copy hook.
    pub(crate) fn acquire(&self) -> Result<u32> {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 { None } else { count.checked_add(1) }
            }) {
            Ok(prev) => Ok(prev + 1),
            Err(0) => Err(Error::lifetime(
                "block copied after its closure was released",
            )),
            Err(_) => Err(Error::lifetime("closure reference count overflow")),
        }
    }

    /// Drops a reference on behalf of the dispose hook.
    pub(crate) fn release(&self) -> Result<LifetimeState> {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(1) => Ok(LifetimeState::Released),
            Ok(prev) => Ok(LifetimeState::Live(prev - 1)),
            Err(_) => Err(Error::lifetime(
                "block disposed after its closure was released",
            )),
        }
    }
}

/// Copy hook body: `dst` becomes another literal of `src`'s closure.
///
/// # Safety
///
/// `src` must point to a readable literal whose descriptor, if its lifetime
/// pointer is set, is bridge-owned. `dst` must be writable.
pub(crate) unsafe fn copy_literal(dst: *mut BlockLiteral, src: *const BlockLiteral) -> Result<u32> {
    if dst.is_null() || src.is_null() {
        return Err(Error::lifetime("copy hook received a null block"));
    }
    // SAFETY: both pointers are non-null and valid per the caller.
    let (descriptor, lifetime) = unsafe { ((*src).descriptor, (*src).lifetime) };
    if lifetime.is_null() {
        return Err(Error::lifetime("block copied after it was disposed"));
    }

    // SAFETY: a set lifetime pointer means the source literal still holds a
    // reference, so the record is alive.
    let count = unsafe { (*lifetime).acquire() }?;
    // SAFETY: the source literal's strong reference keeps the record alive;
    // `dst` now owns one of its own.
    unsafe { BlockDetails::retain_for_literal(descriptor) };

    // SAFETY: `dst` is writable per the caller.
    unsafe {
        (*dst).descriptor = descriptor;
        (*dst).lifetime = lifetime;
    }
    trace!("copied closure block {:p}: count {}", lifetime, count);
    Ok(count)
}

/// Dispose hook body: `block` stops referencing its closure.
///
/// The literal's lifetime pointer is cleared, so disposing the same literal
/// twice is reported instead of decrementing someone else's reference.
///
/// # Safety
///
/// `block` must point to a writable literal whose descriptor is
/// bridge-owned.
pub(crate) unsafe fn release_literal(block: *mut BlockLiteral) -> Result<LifetimeState> {
    if block.is_null() {
        return Err(Error::lifetime("dispose hook received a null block"));
    }
    // SAFETY: non-null and valid per the caller.
    let (descriptor, lifetime) = unsafe { ((*block).descriptor, (*block).lifetime) };
    if lifetime.is_null() {
        return Err(Error::lifetime("block disposed twice"));
    }
    if descriptor.is_null() {
        return Err(Error::lifetime("disposed block has no descriptor"));
    }

    // SAFETY: the literal still owns a strong reference, so the record is
    // alive whether or not the bridge that made it still exists.
    let owned = unsafe { &*descriptor.cast::<BlockDetails>() };
    if !std::ptr::eq(lifetime, owned.lifetime()) {
        return Err(Error::lifetime(
            "block lifetime does not belong to its descriptor",
        ));
    }

    // SAFETY: `block` is writable per the caller.
    unsafe { (*block).lifetime = std::ptr::null() };
    // SAFETY: the literal gives up its reference here; it is dropped when
    // this function returns.
    let details = unsafe { BlockDetails::from_literal_descriptor(descriptor) };

    let state = match details.lifetime().release() {
        Ok(state) => state,
        Err(err) => {
            // The count did not include this literal, so neither did the
            // strong references.
            std::mem::forget(details);
            return Err(err);
        }
    };
    match state {
        LifetimeState::Live(count) => {
            trace!("disposed closure block {:p}: count {}", lifetime, count);
        }
        LifetimeState::Released => {
            let handle = details.lifetime().handle();
            details.release_handle();
            debug!(
                "closure block {:p} released, freed handle {}",
                descriptor,
                handle.into_raw()
            );
        }
    }
    Ok(state)
}

static VIOLATION_POLICY: AtomicU8 = AtomicU8::new(ViolationPolicy::Abort as u8);

/// Sets what the native hooks do on a violation.
pub fn set_violation_policy(policy: ViolationPolicy) {
    VIOLATION_POLICY.store(policy as u8, Ordering::SeqCst);
}

/// Returns the policy currently in effect.
#[must_use]
pub fn violation_policy() -> ViolationPolicy {
    ViolationPolicy::from_u8(VIOLATION_POLICY.load(Ordering::SeqCst))
}

#[cfg(feature = "violation_backtrace")]
fn log_backtrace() {
    error!("violation backtrace:\n{:?}", backtrace::Backtrace::new());
}

#[cfg(not(feature = "violation_backtrace"))]
fn log_backtrace() {}

/// Terminates after a violation detected inside a native hook.
pub(crate) fn violation(hook: &str, err: &Error) -> ! {
    terminate(violation_policy(), hook, err)
}

fn terminate(policy: ViolationPolicy, hook: &str, err: &Error) -> ! {
    error!("{hook}: {err}");
    log_backtrace();
    match policy {
        ViolationPolicy::Abort => std::process::abort(),
        ViolationPolicy::Panic => panic!("{hook}: {err}"),
    }
}
