//! Option flags for the bridging entry points.

use std::fmt;
use std::ops::BitOr;

macro_rules! bridge_flags {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$flag_meta:meta])* $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            /// No options.
            pub const NONE: $name = $name(0);
            $($(#[$flag_meta])* pub const $flag: $name = $name($value);)*

            /// Returns the raw bits.
            #[must_use]
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Returns true if every bit of `other` is set.
            #[must_use]
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                #[allow(unused_mut)]
                let mut set = f.debug_set();
                $(if self.0 & $value != 0 {
                    set.entry(&stringify!($flag));
                })*
                set.finish()
            }
        }
    };
}

bridge_flags! {
    /// Options for bridging a managed object to a native instance.
    CreateInstanceFlags {
        /// Return the native object a managed wrapper already stands for.
        UNWRAP = 1 << 0;
    }
}

bridge_flags! {
    /// Options for bridging a native instance to a managed object.
    CreateObjectFlags {
        /// Return the managed object a bridge-allocated instance stands for.
        UNWRAP = 1 << 0;
        /// The instance is being initialised by the bridge's own alloc path.
        OBJECT_INIT = 1 << 1;
        /// The wrapper takes over the native instance's lifetime.
        MANAGE_LIFETIME = 1 << 2;
    }
}

bridge_flags! {
    /// Options for bridging a managed callable to a native block.
    CreateBlockFlags {}
}

bridge_flags! {
    /// Options for bridging a native block to a managed callable.
    CreateDelegateFlags {
        /// Return the managed callable a bridge-created block stands for.
        UNWRAP = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let flags = CreateObjectFlags::UNWRAP | CreateObjectFlags::MANAGE_LIFETIME;
        assert!(flags.contains(CreateObjectFlags::UNWRAP));
        assert!(flags.contains(CreateObjectFlags::MANAGE_LIFETIME));
        assert!(!flags.contains(CreateObjectFlags::OBJECT_INIT));
        assert!(flags.contains(CreateObjectFlags::NONE));
    }

    #[test]
    fn test_default_is_none() {
        assert_eq!(CreateDelegateFlags::default(), CreateDelegateFlags::NONE);
        assert_eq!(CreateBlockFlags::default().bits(), 0);
    }

    #[test]
    fn test_debug_lists_names() {
        let flags = CreateObjectFlags::UNWRAP | CreateObjectFlags::OBJECT_INIT;
        assert_eq!(format!("{flags:?}"), r#"{"UNWRAP", "OBJECT_INIT"}"#);
        assert_eq!(format!("{:?}", CreateInstanceFlags::NONE), "{}");
    }
}
