//! Managed-side handle on a retained native block.
//!
//! When a native block is bridged to a managed callable, the bridge copies
//! the block (taking a native reference) and hands the construction callback
//! a [`BlockDispatch`]. The callable stores it and calls through
//! [`BlockDispatch::invoker_as`]. Dropping the dispatch releases the native
//! reference, so the block lives exactly as long as the managed callable
//! that owns it.

use crate::runtime::block::BlockLiteral;
use crate::runtime::identity::{IdentityRegistry, Origin};
use crate::runtime::native::{Id, Imp, NativeRuntime};
use oxibridge_log::debug;
use std::fmt;
use std::sync::Arc;

/// A retained native block and its invoke entry point.
pub struct BlockDispatch {
    block: Id,
    invoker: Imp,
    runtime: Arc<dyn NativeRuntime>,
    registry: Arc<IdentityRegistry>,
}

impl BlockDispatch {
    /// Takes ownership of one native reference to `block`.
    pub(crate) fn new(
        block: *mut BlockLiteral,
        runtime: Arc<dyn NativeRuntime>,
        registry: Arc<IdentityRegistry>,
    ) -> Self {
        // SAFETY: the caller just obtained `block` from `block_copy`.
        let invoker = unsafe { (*block).invoke() };
        BlockDispatch {
            block: Id::from_block(block),
            invoker,
            runtime,
            registry,
        }
    }

    /// The retained block, to pass as the invoke function's first argument.
    #[must_use]
    pub fn block(&self) -> *mut BlockLiteral {
        self.block.as_block()
    }

    /// The block's invoke entry point.
    #[must_use]
    pub fn invoker(&self) -> Imp {
        self.invoker
    }

    /// Returns the invoke entry point as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must match the block's signature, including the leading block
    /// pointer argument. See [`Imp::cast`].
    ///
    /// # Example
    ///
    /// ```ignore
    /// let f: extern "C" fn(*mut BlockLiteral, i32) -> i32 = unsafe { dispatch.invoker_as() };
    /// let result = f(dispatch.block(), 7);
    /// ```
    #[must_use]
    pub unsafe fn invoker_as<F: Copy>(&self) -> F {
        // SAFETY: forwarded to the caller.
        unsafe { self.invoker.cast() }
    }
}

impl Drop for BlockDispatch {
    fn drop(&mut self) {
        // SAFETY: `block` came from `block_copy` and this is its only release.
        unsafe { self.runtime.block_release(self.block.as_block()) };
        self.registry.remove_native_if_dead(self.block, Origin::Native);
        debug!("released native block {:?}", self.block);
    }
}

impl fmt::Debug for BlockDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDispatch")
            .field("block", &self.block)
            .field("invoker", &self.invoker)
            .finish_non_exhaustive()
    }
}

// SAFETY: the block is retained for the dispatch's whole life and the block
// runtime's reference counting is thread-safe; the other fields are
// `Send + Sync`.
unsafe impl Send for BlockDispatch {}
unsafe impl Sync for BlockDispatch {}
