//! Block ABI records and the closure bridge's native hooks.
//!
//! The layouts follow the clang block ABI. A literal the bridge creates
//! carries one extension word after the standard header: a pointer to the
//! shared [`BlockLifetime`] of its callable.
//!
//! ```text
//! BlockLiteral                  BlockDetails (one per callable, Arc)
//! +------------+                +---------------------------+
//! | isa        |                | BlockDescriptor           |
//! | flags      |                |   reserved, size          |
//! | reserved   |                |   copy, dispose helpers   |
//! | invoke     |                |   signature --------------+--> "i?i\0"
//! | descriptor +--------------->+---------------------------+
//! | lifetime   +--------------->| BlockLifetime             |
//! +------------+                |   handle, ref_count       |
//!                               | invoke, signature, host   |
//!                               +---------------------------+
//! ```
//!
//! The descriptor is the first field of [`BlockDetails`], so a descriptor
//! pointer is also a details pointer. A block is recognised as
//! bridge-created only if its descriptor's helpers are this module's
//! [`copy_block`] and [`dispose_block`].

use crate::error::{Error, Result};
use crate::runtime::handle::{GcHandle, ManagedHost, ManagedId, ManagedObject};
use crate::runtime::lifetime::{self, BlockLifetime, LifetimeState};
use crate::runtime::native::Imp;
use std::ffi::{CStr, CString, c_char, c_void};
use std::fmt;
use std::sync::Arc;

/// Set while a heap block is being torn down.
pub const BLOCK_DEALLOCATING: i32 = 0x0001;
/// Heap reference count bits (counted in steps of 2).
pub const BLOCK_REFCOUNT_MASK: i32 = 0xfffe;
/// The block lives on the heap and is freed by `_Block_release`.
pub const BLOCK_NEEDS_FREE: i32 = 1 << 24;
/// The descriptor has copy and dispose helpers.
pub const BLOCK_HAS_COPY_DISPOSE: i32 = 1 << 25;
/// The helpers contain C++ code.
pub const BLOCK_HAS_CTOR: i32 = 1 << 26;
/// The block is a global constant and is never copied.
pub const BLOCK_IS_GLOBAL: i32 = 1 << 28;
/// The invoke function returns a struct through a hidden pointer.
pub const BLOCK_HAS_STRET: i32 = 1 << 29;
/// The descriptor has a signature string.
pub const BLOCK_HAS_SIGNATURE: i32 = 1 << 30;

/// Flags of every block the bridge creates.
pub const BRIDGE_BLOCK_FLAGS: i32 = BLOCK_HAS_COPY_DISPOSE | BLOCK_HAS_SIGNATURE;

/// Descriptor copy helper: called by `_Block_copy` after the bytes of `src`
/// have been copied to `dst`.
pub type CopyHelper = unsafe extern "C" fn(dst: *mut BlockLiteral, src: *const BlockLiteral);

/// Descriptor dispose helper: called before a heap block is freed.
pub type DisposeHelper = unsafe extern "C" fn(block: *mut BlockLiteral);

/// Block descriptor with copy/dispose helpers and a signature.
///
/// Descriptors without [`BLOCK_HAS_COPY_DISPOSE`] omit the helper words; use
/// [`block_signature`] to read the signature of an arbitrary block.
#[repr(C)]
#[derive(Debug)]
pub struct BlockDescriptor {
    pub(crate) reserved: usize,
    pub(crate) size: usize,
    pub(crate) copy_helper: Option<CopyHelper>,
    pub(crate) dispose_helper: Option<DisposeHelper>,
    pub(crate) signature: *const c_char,
}

impl BlockDescriptor {
    /// Describes a block of `size` bytes.
    #[must_use]
    pub const fn new(
        size: usize,
        copy_helper: Option<CopyHelper>,
        dispose_helper: Option<DisposeHelper>,
        signature: &'static CStr,
    ) -> Self {
        BlockDescriptor {
            reserved: 0,
            size,
            copy_helper,
            dispose_helper,
            signature: signature.as_ptr(),
        }
    }

    /// Size of the block literal this descriptor belongs to.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

// SAFETY: a descriptor is read-only once built and its signature points to
// a string that outlives it.
unsafe impl Send for BlockDescriptor {}
unsafe impl Sync for BlockDescriptor {}

/// A block literal: the native representation of a closure.
///
/// Literals created by [`crate::Bridge::create_block_for_callable`] own one
/// reference to their callable's [`BlockLifetime`] until they are passed to
/// [`crate::Bridge::release_block_literal`].
#[repr(C)]
pub struct BlockLiteral {
    pub(crate) isa: *const c_void,
    pub(crate) flags: i32,
    pub(crate) reserved: i32,
    pub(crate) invoke: *const c_void,
    pub(crate) descriptor: *const BlockDescriptor,
    pub(crate) lifetime: *const BlockLifetime,
}

// SAFETY: a literal is a value handle; the records it points to are
// immutable or atomically updated. Shared access only reads, and block
// runtimes update the flags word atomically.
unsafe impl Send for BlockLiteral {}
unsafe impl Sync for BlockLiteral {}

impl BlockLiteral {
    /// Builds a literal for a block that does not belong to the bridge.
    ///
    /// Its extension word is left null. Native code and tests use this to
    /// hand the bridge a block to wrap.
    #[must_use]
    pub fn new_native(
        isa: *const c_void,
        flags: i32,
        invoke: Imp,
        descriptor: *const BlockDescriptor,
    ) -> Self {
        BlockLiteral {
            isa,
            flags,
            reserved: 0,
            invoke: invoke.as_ptr(),
            descriptor,
            lifetime: std::ptr::null(),
        }
    }

    /// The block's flags word.
    #[must_use]
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// The block's `isa`.
    #[must_use]
    pub fn isa(&self) -> *const c_void {
        self.isa
    }

    /// The invoke entry point.
    #[must_use]
    pub fn invoke(&self) -> Imp {
        Imp::from_ptr(self.invoke)
    }

    /// The descriptor pointer.
    #[must_use]
    pub fn descriptor(&self) -> *const BlockDescriptor {
        self.descriptor
    }

    /// Returns the invoke entry point as a typed function pointer.
    ///
    /// # Safety
    ///
    /// See [`Imp::cast`].
    #[must_use]
    pub unsafe fn invoke_as<F: Copy>(&self) -> F {
        // SAFETY: forwarded to the caller.
        unsafe { self.invoke().cast() }
    }

    /// The literal's signature, read per its flags. See [`block_signature`].
    ///
    /// # Safety
    ///
    /// The descriptor must still be valid. For bridge literals that holds
    /// until released records are collected.
    #[must_use]
    pub unsafe fn signature(&self) -> Option<&CStr> {
        // SAFETY: forwarded to the caller.
        unsafe { block_signature(self) }
    }

    /// State of the callable this literal references, or `None` if the
    /// literal has been released (or was never a bridge literal).
    #[must_use]
    pub fn lifetime_state(&self) -> Option<LifetimeState> {
        // SAFETY: a non-null lifetime pointer means this literal still holds
        // a reference, which keeps the record alive.
        unsafe { self.lifetime.as_ref() }.map(BlockLifetime::state)
    }

    /// Returns the managed callable behind a bridge-created block.
    ///
    /// This is what an invoke trampoline calls with its first argument.
    ///
    /// # Safety
    ///
    /// `block` must point to a readable block literal.
    #[must_use]
    pub unsafe fn callable(block: *const BlockLiteral) -> Option<ManagedObject> {
        // SAFETY: forwarded to the caller.
        unsafe { inspect_bridge_block(block) }?.callable()
    }
}

impl fmt::Debug for BlockLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockLiteral")
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("invoke", &self.invoke)
            .field("descriptor", &self.descriptor)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Per-callable closure record.
///
/// Allocated once per bridged callable and shared by all of its literals.
/// The bridge's block table owns one strong reference; the dispose hook
/// takes a temporary one while it runs.
#[repr(C)]
pub(crate) struct BlockDetails {
    descriptor: BlockDescriptor,
    lifetime: BlockLifetime,
    invoke: Imp,
    callable_id: ManagedId,
    signature: CString,
    host: Arc<dyn ManagedHost>,
}

// SAFETY: after construction the descriptor is read-only and its signature
// pointer targets `signature`, which is owned by the same allocation. The
// lifetime record is atomic and the host is `Send + Sync`.
unsafe impl Send for BlockDetails {}
unsafe impl Sync for BlockDetails {}

impl BlockDetails {
    /// Pins `callable` and builds its closure record with a count of 1.
    pub(crate) fn new(
        callable: &ManagedObject,
        invoke: Imp,
        signature: &str,
        host: Arc<dyn ManagedHost>,
    ) -> Result<Arc<Self>> {
        if invoke.is_null() {
            return Err(Error::InvalidBlock {
                reason: "null invoke entry point".into(),
            });
        }
        let signature = CString::new(signature).map_err(|_| Error::InvalidEncoding)?;
        let handle = host.alloc_handle(callable.clone());

        Ok(Arc::new(BlockDetails {
            descriptor: BlockDescriptor {
                reserved: 0,
                size: std::mem::size_of::<BlockLiteral>(),
                copy_helper: Some(copy_block),
                dispose_helper: Some(dispose_block),
                // The CString's buffer does not move with the CString.
                signature: signature.as_ptr(),
            },
            lifetime: BlockLifetime::new(handle),
            invoke,
            callable_id: ManagedId::of(callable),
            signature,
            host,
        }))
    }

    /// Takes a strong reference to the record a descriptor belongs to.
    ///
    /// # Safety
    ///
    /// `descriptor` must be the descriptor of a live bridge-owned record.
    pub(crate) unsafe fn retain_from_descriptor(descriptor: *const BlockDescriptor) -> Arc<Self> {
        let details = descriptor.cast::<BlockDetails>();
        // SAFETY: the descriptor is the first field of a `repr(C)` record
        // allocated by `Arc::new`, so this is that Arc's data pointer, and
        // the caller guarantees a strong reference is outstanding.
        unsafe {
            Arc::increment_strong_count(details);
            Arc::from_raw(details)
        }
    }

    /// Takes over the strong reference a literal owns.
    ///
    /// # Safety
    ///
    /// `descriptor` must come from a bridge literal that still holds its
    /// reference, and that literal must give it up.
    pub(crate) unsafe fn from_literal_descriptor(descriptor: *const BlockDescriptor) -> Arc<Self> {
        // SAFETY: see `retain_from_descriptor`; the count is the literal's.
        unsafe { Arc::from_raw(descriptor.cast::<BlockDetails>()) }
    }

    /// Adds the strong reference a copied literal owns.
    ///
    /// # Safety
    ///
    /// As for [`BlockDetails::retain_from_descriptor`].
    pub(crate) unsafe fn retain_for_literal(descriptor: *const BlockDescriptor) {
        // SAFETY: forwarded to the caller.
        unsafe { Arc::increment_strong_count(descriptor.cast::<BlockDetails>()) };
    }

    pub(crate) fn descriptor(&self) -> *const BlockDescriptor {
        &self.descriptor
    }

    pub(crate) fn lifetime(&self) -> &BlockLifetime {
        &self.lifetime
    }

    pub(crate) fn callable_id(&self) -> ManagedId {
        self.callable_id
    }

    pub(crate) fn signature(&self) -> &CStr {
        &self.signature
    }

    /// Resolves the callable while the record is live.
    pub(crate) fn callable(&self) -> Option<ManagedObject> {
        match self.lifetime.state() {
            LifetimeState::Live(_) => self.host.resolve(self.lifetime.handle()),
            LifetimeState::Released => None,
        }
    }

    pub(crate) fn release_handle(&self) -> bool {
        self.host.free_handle(self.lifetime.handle())
    }

    /// Builds a new stack literal referencing this record.
    ///
    /// The caller must already hold the count the literal represents. The
    /// literal also owns one strong reference to the record, given back by
    /// the dispose hook, so the record outlives the bridge's table.
    pub(crate) fn literal(self: &Arc<Self>, isa: *const c_void) -> BlockLiteral {
        let _owned = Arc::into_raw(Arc::clone(self));
        BlockLiteral {
            isa,
            flags: BRIDGE_BLOCK_FLAGS,
            reserved: 0,
            invoke: self.invoke.as_ptr(),
            descriptor: &self.descriptor,
            lifetime: &self.lifetime,
        }
    }

    pub(crate) fn handle(&self) -> GcHandle {
        self.lifetime.handle()
    }
}

impl fmt::Debug for BlockDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDetails")
            .field("descriptor", &self.descriptor())
            .field("lifetime", &self.lifetime)
            .field("invoke", &self.invoke)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Copy helper of every bridge-created block.
///
/// # Safety
///
/// Called by the block runtime with a freshly copied `dst` and its live
/// source `src`.
pub unsafe extern "C" fn copy_block(dst: *mut BlockLiteral, src: *const BlockLiteral) {
    // SAFETY: the block runtime passes valid literals.
    if let Err(err) = unsafe { lifetime::copy_literal(dst, src) } {
        lifetime::violation("copy_block", &err);
    }
}

/// Dispose helper of every bridge-created block.
///
/// # Safety
///
/// Called by the block runtime with a heap block about to be freed.
pub unsafe extern "C" fn dispose_block(block: *mut BlockLiteral) {
    // SAFETY: the block runtime passes a valid literal.
    if let Err(err) = unsafe { lifetime::release_literal(block) } {
        lifetime::violation("dispose_block", &err);
    }
}

/// Returns the closure record of a bridge-created block.
///
/// Returns `None` for blocks whose flags, descriptor size or helpers differ
/// from the bridge's own, including blocks from other bridges that happen to
/// use the same flags.
///
/// # Safety
///
/// `block` must be null or point to a readable block literal.
pub(crate) unsafe fn inspect_bridge_block(block: *const BlockLiteral) -> Option<Arc<BlockDetails>> {
    // SAFETY: null or readable per the caller.
    let literal = unsafe { block.as_ref() }?;
    if literal.flags & BRIDGE_BLOCK_FLAGS != BRIDGE_BLOCK_FLAGS {
        return None;
    }
    // SAFETY: HAS_COPY_DISPOSE is set, so the descriptor has helper words.
    let descriptor = unsafe { literal.descriptor.as_ref() }?;
    if descriptor.size != std::mem::size_of::<BlockLiteral>() {
        return None;
    }

    let copy = descriptor.copy_helper.map(|f| f as usize);
    let dispose = descriptor.dispose_helper.map(|f| f as usize);
    if copy != Some(copy_block as usize) || dispose != Some(dispose_block as usize) {
        return None;
    }
    if literal.lifetime.is_null() {
        return None;
    }

    // SAFETY: the helpers identify a bridge-owned record, and the literal's
    // lifetime pointer shows it still holds a reference.
    Some(unsafe { BlockDetails::retain_from_descriptor(literal.descriptor) })
}

/// Reads the signature of any block, following the descriptor layout its
/// flags announce.
///
/// # Safety
///
/// `block` must be null or point to a readable block literal with a valid
/// descriptor. The returned string borrows from the descriptor.
#[must_use]
pub unsafe fn block_signature<'a>(block: *const BlockLiteral) -> Option<&'a CStr> {
    // SAFETY: null or readable per the caller.
    let literal = unsafe { block.as_ref() }?;
    if literal.flags & BLOCK_HAS_SIGNATURE == 0 || literal.descriptor.is_null() {
        return None;
    }

    let words = literal.descriptor.cast::<*const c_char>();
    let index = if literal.flags & BLOCK_HAS_COPY_DISPOSE != 0 { 4 } else { 2 };
    // SAFETY: the flags announce a signature word at `index`.
    let signature = unsafe { *words.add(index) };
    if signature.is_null() {
        None
    } else {
        // SAFETY: descriptors hold NUL-terminated signatures.
        Some(unsafe { CStr::from_ptr(signature) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::{HandleTable, managed};

    extern "C" fn add_one(_block: *mut BlockLiteral, value: i32) -> i32 {
        value + 1
    }

    fn invoke() -> Imp {
        Imp::from_ptr(add_one as *const c_void)
    }

    fn details(host: &Arc<HandleTable>, callable: &ManagedObject) -> Arc<BlockDetails> {
        BlockDetails::new(callable, invoke(), "i?i", host.clone()).unwrap()
    }

    #[test]
    fn test_layout() {
        let word = std::mem::size_of::<usize>();
        assert_eq!(std::mem::size_of::<BlockLiteral>(), 2 * word + 8 + 2 * word);
        assert_eq!(std::mem::size_of::<BlockDescriptor>(), 5 * word);
        assert_eq!(std::mem::offset_of!(BlockLiteral, invoke), word + 8);
    }

    #[test]
    fn test_descriptor_is_details_address() {
        let host = Arc::new(HandleTable::new());
        let record = details(&host, &managed(()));
        assert_eq!(
            record.descriptor().cast::<u8>(),
            Arc::as_ptr(&record).cast::<u8>()
        );
    }

    #[test]
    fn test_details_pin_and_release_callable() {
        let host = Arc::new(HandleTable::new());
        let callable = managed(5_i32);
        let record = details(&host, &callable);

        assert_eq!(host.live_handles(), 1);
        assert!(Arc::ptr_eq(&record.callable().unwrap(), &callable));

        record.lifetime().release().unwrap();
        assert!(record.release_handle());
        assert!(record.callable().is_none());
        assert_eq!(host.live_handles(), 0);
    }

    #[test]
    fn test_rejects_interior_nul_signature() {
        let host: Arc<dyn ManagedHost> = Arc::new(HandleTable::new());
        let err = BlockDetails::new(&managed(()), invoke(), "i?\0i", host).unwrap_err();
        assert_eq!(err, Error::InvalidEncoding);
    }

    #[test]
    fn test_rejects_null_invoke() {
        let host: Arc<dyn ManagedHost> = Arc::new(HandleTable::new());
        let err = BlockDetails::new(&managed(()), Imp::from_ptr(std::ptr::null()), "v?", host)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlock { .. }));
    }

    #[test]
    fn test_literal_fields() {
        let host = Arc::new(HandleTable::new());
        let record = details(&host, &managed(()));
        let literal = record.literal(std::ptr::null());

        assert_eq!(literal.flags(), BRIDGE_BLOCK_FLAGS);
        assert_eq!(literal.invoke(), invoke());
        assert_eq!(literal.lifetime_state(), Some(LifetimeState::Live(1)));

        let f: extern "C" fn(*mut BlockLiteral, i32) -> i32 = unsafe { literal.invoke_as() };
        assert_eq!(f(std::ptr::null_mut(), 41), 42);
    }

    #[test]
    fn test_literals_own_record_references() {
        let host = Arc::new(HandleTable::new());
        let record = details(&host, &managed(()));
        let mut literal = record.literal(std::ptr::null());
        assert_eq!(Arc::strong_count(&record), 2);

        let mut copy =
            BlockLiteral::new_native(std::ptr::null(), BRIDGE_BLOCK_FLAGS, invoke(), std::ptr::null());
        unsafe { lifetime::copy_literal(&mut copy, &literal) }.unwrap();
        assert_eq!(Arc::strong_count(&record), 3);

        let weak = Arc::downgrade(&record);
        drop(record);
        assert_eq!(
            unsafe { lifetime::release_literal(&mut literal) },
            Ok(LifetimeState::Live(1))
        );
        assert!(weak.upgrade().is_some());
        assert_eq!(
            unsafe { lifetime::release_literal(&mut copy) },
            Ok(LifetimeState::Released)
        );
        assert!(weak.upgrade().is_none());
        assert_eq!(host.live_handles(), 0);
    }

    #[test]
    fn test_inspect_recognises_own_blocks() {
        let host = Arc::new(HandleTable::new());
        let callable = managed(());
        let record = details(&host, &callable);
        let literal = record.literal(std::ptr::null());

        let found = unsafe { inspect_bridge_block(&literal) }.unwrap();
        assert!(Arc::ptr_eq(&found, &record));
        assert!(Arc::ptr_eq(&unsafe { BlockLiteral::callable(&literal) }.unwrap(), &callable));
    }

    unsafe extern "C" fn foreign_copy(_dst: *mut BlockLiteral, _src: *const BlockLiteral) {}
    unsafe extern "C" fn foreign_dispose(_block: *mut BlockLiteral) {}

    #[test]
    fn test_inspect_rejects_foreign_helpers() {
        let descriptor = BlockDescriptor::new(
            std::mem::size_of::<BlockLiteral>(),
            Some(foreign_copy),
            Some(foreign_dispose),
            c"i?i",
        );
        let literal = BlockLiteral::new_native(
            std::ptr::null(),
            BRIDGE_BLOCK_FLAGS,
            invoke(),
            &descriptor,
        );

        assert!(unsafe { inspect_bridge_block(&literal) }.is_none());
        assert!(unsafe { BlockLiteral::callable(&literal) }.is_none());
    }

    #[test]
    fn test_inspect_rejects_missing_flags_and_null() {
        let descriptor = BlockDescriptor::new(
            std::mem::size_of::<BlockLiteral>(),
            Some(copy_block),
            Some(dispose_block),
            c"i?i",
        );
        let literal =
            BlockLiteral::new_native(std::ptr::null(), BLOCK_HAS_COPY_DISPOSE, invoke(), &descriptor);

        assert!(unsafe { inspect_bridge_block(&literal) }.is_none());
        assert!(unsafe { inspect_bridge_block(std::ptr::null()) }.is_none());
    }

    #[test]
    fn test_block_signature_without_helpers() {
        #[repr(C)]
        #[allow(dead_code)]
        struct SmallDescriptor {
            reserved: usize,
            size: usize,
            signature: *const c_char,
        }
        let descriptor = SmallDescriptor {
            reserved: 0,
            size: std::mem::size_of::<BlockLiteral>(),
            signature: c"v?".as_ptr(),
        };
        let literal = BlockLiteral::new_native(
            std::ptr::null(),
            BLOCK_HAS_SIGNATURE,
            invoke(),
            (&raw const descriptor).cast(),
        );

        let signature = unsafe { block_signature(&literal) }.unwrap();
        assert_eq!(signature, c"v?");
    }

    #[test]
    fn test_block_signature_with_helpers() {
        let host = Arc::new(HandleTable::new());
        let record = details(&host, &managed(()));
        let literal = record.literal(std::ptr::null());

        assert_eq!(unsafe { block_signature(&literal) }.unwrap(), c"i?i");
        assert_eq!(unsafe { literal.signature() }, Some(c"i?i"));
        assert_eq!(record.signature(), c"i?i");
    }
}
