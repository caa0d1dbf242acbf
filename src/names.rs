//! 128-bit random identifiers for nodes and ports.
//!
//! Both `NodeName` and `PortName` wrap the same underlying [`Name`] shape:
//! a pair of `u64`s generated together from a single CSPRNG draw. `0` (both
//! halves zero) is reserved as the invalid sentinel and is never produced
//! by [`Name::random`].

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A 128-bit identifier, represented as two `u64` halves.
///
/// The zero value (`v1 == 0 && v2 == 0`) is reserved as an invalid
/// sentinel; [`Name::random`] never returns it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name {
    v1: u64,
    v2: u64,
}

impl Name {
    /// The invalid sentinel, equal to the zero value.
    pub const INVALID: Name = Name { v1: 0, v2: 0 };

    /// Draw a new random name. Retries (astronomically unlikely) on the
    /// zero draw so the invalid sentinel is never produced.
    pub fn random() -> Name {
        let mut rng = rand::rng();
        loop {
            let v1 = rng.next_u64();
            let v2 = rng.next_u64();
            if v1 != 0 || v2 != 0 {
                return Name { v1, v2 };
            }
        }
    }

    /// Whether this name is the invalid sentinel.
    pub fn is_invalid(self) -> bool {
        self == Name::INVALID
    }

    /// The two raw halves. Only meaningful to callers that need a stable
    /// byte representation of a name, such as a dispatcher serializing
    /// its backing port name into a message's wire header (§6.1).
    pub fn as_u64_pair(self) -> (u64, u64) {
        (self.v1, self.v2)
    }
}

impl Default for Name {
    fn default() -> Name {
        Name::INVALID
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.v1, self.v2)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

macro_rules! name_newtype {
    ($(#[$meta:meta])* $vis:vis struct $ident:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        $vis struct $ident(pub Name);

        impl $ident {
            /// The invalid sentinel.
            pub const INVALID: $ident = $ident(Name::INVALID);

            /// Draw a new random value.
            pub fn random() -> $ident {
                $ident(Name::random())
            }

            /// Whether this is the invalid sentinel.
            pub fn is_invalid(self) -> bool {
                self.0.is_invalid()
            }

            /// The two raw halves of the underlying name.
            pub fn as_u64_pair(self) -> (u64, u64) {
                self.0.as_u64_pair()
            }
        }

        impl Default for $ident {
            fn default() -> $ident {
                $ident(Name::default())
            }
        }

        impl fmt::Debug for $ident {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ident), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $ident {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

name_newtype!(
    /// Identifies a single Ports-layer node, one per process.
    pub struct NodeName
);

name_newtype!(
    /// Identifies a single port, unique within its owning node.
    pub struct PortName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_names_are_not_invalid() {
        for _ in 0..1000 {
            assert!(!NodeName::random().is_invalid());
            assert!(!PortName::random().is_invalid());
        }
    }

    #[test]
    fn default_is_invalid() {
        assert!(NodeName::default().is_invalid());
        assert!(PortName::default().is_invalid());
    }

    #[test]
    fn random_names_are_distinct() {
        let a = PortName::random();
        let b = PortName::random();
        assert_ne!(a, b);
    }
}
