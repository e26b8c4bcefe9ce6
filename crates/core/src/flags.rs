use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a small copyable bitset with named members.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident: $repr:ty {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(&self) -> $repr {
                self.0
            }

            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut set = f.debug_set();
                $( if self.contains(Self::$flag) && Self::$flag.0 != 0 {
                    set.entry(&stringify!($flag));
                } )*
                set.finish()
            }
        }
    };
}

flag_set! {
    /// Persistent per-entity state bits.
    EntityTags: u16 {
        /// Placeholder standing in for data whose library could not be resolved.
        const MISSING = 1 << 0;
        /// The override has been validated against its current reference.
        const REFOK = 1 << 1;
        /// The override should be re-diffed on the next batch pass.
        const AUTOREFRESH = 1 << 2;
    }
}

flag_set! {
    PropertyFlags: u8 {
        const OVERRIDABLE = 1 << 0;
        /// Back-pointer to an owner or parent; never a real dependency.
        const LOOPBACK = 1 << 1;
        /// Pointer to data owned by, and only meaningful inside, its owner.
        const EMBEDDED = 1 << 2;
    }
}

flag_set! {
    OperationFlags: u8 {
        /// The local pointer was an override of the reference pointer when recorded.
        const MATCH_REFERENCE = 1 << 0;
    }
}

flag_set! {
    OverrideTags: u8 {
        const UNUSED = 1 << 0;
    }
}

flag_set! {
    RuntimeTags: u8 {
        const NEEDS_RELOAD = 1 << 0;
    }
}

flag_set! {
    /// Nature of a link between two entities.
    LinkFlags: u8 {
        const LOOPBACK = 1 << 0;
        const EMBEDDED = 1 << 1;
        /// Link from an override to its reference.
        const OVERRIDE_REFERENCE = 1 << 2;
    }
}

impl From<PropertyFlags> for LinkFlags {
    fn from(flags: PropertyFlags) -> Self {
        let mut link = LinkFlags::empty();
        link.set(LinkFlags::LOOPBACK, flags.contains(PropertyFlags::LOOPBACK));
        link.set(LinkFlags::EMBEDDED, flags.contains(PropertyFlags::EMBEDDED));
        link
    }
}

flag_set! {
    RemapFlags: u8 {
        /// Leave usages held by linked (library) entities untouched.
        const SKIP_INDIRECT_USAGE = 1 << 0;
        /// Leave override-reference links untouched.
        const SKIP_OVERRIDE_REFERENCE = 1 << 1;
    }
}

flag_set! {
    /// Behaviour switches for comparing a local tree against its reference.
    CompareFlags: u8 {
        const IGNORE_NON_OVERRIDABLE = 1 << 0;
        const IGNORE_OVERRIDDEN = 1 << 1;
        /// Record operations for overridable differences.
        const CREATE = 1 << 2;
        /// Reset non-overridable differences to the reference value.
        const RESTORE = 1 << 3;
    }
}

/// Kind of evaluated-data invalidation requested from the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Recalc {
    CopyOnWrite,
    Transform,
    BaseFlags,
}

impl fmt::Display for Recalc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CopyOnWrite => "copy_on_write",
            Self::Transform => "transform",
            Self::BaseFlags => "base_flags",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_and_contains() {
        let mut tags = EntityTags::empty();
        assert!(tags.is_empty());

        tags.insert(EntityTags::MISSING | EntityTags::AUTOREFRESH);
        assert!(tags.contains(EntityTags::MISSING));
        assert!(tags.contains(EntityTags::AUTOREFRESH));
        assert!(!tags.contains(EntityTags::REFOK));
        assert!(!tags.contains(EntityTags::MISSING | EntityTags::REFOK));
        assert!(tags.intersects(EntityTags::MISSING | EntityTags::REFOK));

        tags.remove(EntityTags::MISSING);
        assert!(!tags.contains(EntityTags::MISSING));

        tags.set(EntityTags::REFOK, true);
        tags.set(EntityTags::AUTOREFRESH, false);
        assert_eq!(tags, EntityTags::REFOK);
    }

    #[test]
    fn debug_lists_member_names() {
        let flags = PropertyFlags::OVERRIDABLE | PropertyFlags::LOOPBACK;
        let rendered = format!("{flags:?}");
        assert!(rendered.contains("OVERRIDABLE"));
        assert!(rendered.contains("LOOPBACK"));
        assert!(!rendered.contains("EMBEDDED"));
    }
}

