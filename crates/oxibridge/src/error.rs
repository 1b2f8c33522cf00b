//! Error types for the `oxibridge` runtime.
//!
//! Registry and registrar failures are ordinary errors that the bridging call
//! site handles. `LifetimeInvariantViolation` is different: it means a
//! closure's reference count was driven past its bounds, which is memory
//! corruption. The native hooks never return it; they abort instead (see
//! [`crate::runtime::lifetime`]).

use crate::runtime::identity::Origin;
use std::fmt;

/// Errors that can occur while bridging objects and closures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An identity entry already exists for this managed object or native
    /// pointer under the given origin.
    DuplicateIdentity {
        /// Native pointer of the rejected pair.
        native: usize,
        /// Origin the registration was attempted under.
        origin: Origin,
    },

    /// No identity entry exists for the object being separated.
    NotRegistered,

    /// No native class or factory is registered under this name.
    UnknownClass {
        /// Managed type name or native class name that was looked up.
        name: String,
    },

    /// The null class was passed where a native class is required.
    InvalidNativeClass,

    /// The managed type or native class name is already registered.
    DuplicateRegistration {
        /// The conflicting name.
        name: String,
    },

    /// The native runtime could not allocate an instance.
    NativeAllocationFailed {
        /// Name of the class the allocation was attempted for.
        class: String,
    },

    /// No native entry point and signature are known for this callable.
    UnsupportedCallableShape {
        /// Type name of the managed callable.
        type_name: String,
    },

    /// A closure reference count was copied or disposed out of bounds.
    LifetimeInvariantViolation {
        /// What was observed.
        reason: String,
    },

    /// Invalid block type encoding string.
    InvalidEncoding,

    /// The pointer does not describe a usable block.
    InvalidBlock {
        /// Why the block was rejected.
        reason: String,
    },

    /// A managed-side construction callback failed.
    HostFailure {
        /// Message reported by the callback.
        reason: String,
    },

    /// A global bridge has already been installed for this process.
    GlobalAlreadyInstalled,

    /// No global bridge has been installed yet.
    GlobalNotInstalled,
}

impl Error {
    /// Builds a [`Error::LifetimeInvariantViolation`].
    pub(crate) fn lifetime(reason: impl Into<String>) -> Self {
        Error::LifetimeInvariantViolation {
            reason: reason.into(),
        }
    }

    /// Builds a [`Error::HostFailure`] from any displayable error.
    pub fn host(reason: impl fmt::Display) -> Self {
        Error::HostFailure {
            reason: reason.to_string(),
        }
    }

    /// Returns true for errors that indicate memory corruption.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Error::LifetimeInvariantViolation { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity { native, origin } => {
                write!(
                    f,
                    "Identity already registered for native {native:#x} ({origin} origin)"
                )
            }
            Error::NotRegistered => write!(f, "Object is not registered"),
            Error::UnknownClass { name } => write!(f, "Unknown class: {name}"),
            Error::InvalidNativeClass => write!(f, "Invalid native class"),
            Error::DuplicateRegistration { name } => {
                write!(f, "Class already registered: {name}")
            }
            Error::NativeAllocationFailed { class } => {
                write!(f, "Native allocation failed for class {class}")
            }
            Error::UnsupportedCallableShape { type_name } => {
                write!(f, "No block signature known for callable {type_name}")
            }
            Error::LifetimeInvariantViolation { reason } => {
                write!(f, "Lifetime invariant violation: {reason}")
            }
            Error::InvalidEncoding => write!(f, "Invalid type encoding string"),
            Error::InvalidBlock { reason } => write!(f, "Invalid block: {reason}"),
            Error::HostFailure { reason } => {
                write!(f, "Managed construction failed: {reason}")
            }
            Error::GlobalAlreadyInstalled => {
                write!(f, "A global bridge is already installed")
            }
            Error::GlobalNotInstalled => write!(f, "No global bridge installed"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `oxibridge` operations.
pub type Result<T> = std::result::Result<T, Error>;
