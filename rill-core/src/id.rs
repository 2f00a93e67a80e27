//! Typed ID wrappers for values, streams, subscriptions, readers, and workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Typed ID wrappers prevent mixing up value ids, reader ids, etc.
/// Each type draws from its own process-wide sequence starting at 1, so ids
/// are unique per type for the lifetime of the process and cheap to order.
macro_rules! sequence_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Draw the next id from this type's sequence.
            pub fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            /// The raw numeric value.
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

sequence_id!(
    ValueId,
    "Identity of one emitted value across its whole lineage through a pipeline."
);
sequence_id!(StreamId, "Unique identifier for a flow (stream) definition.");
sequence_id!(SubscriptionId, "Unique identifier for one subscription run.");
sequence_id!(ReaderId, "Unique identifier for a buffer reader attachment.");
sequence_id!(WorkerId, "Unique identifier for a pool worker.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing_per_type() {
        let a = ValueId::next();
        let b = ValueId::next();
        assert!(b > a);
    }

    #[test]
    fn sequences_are_independent() {
        let v = ValueId::next();
        let r = ReaderId::next();
        // Different types may collide numerically; equality is type-scoped.
        assert_eq!(v, ValueId::from(v.get()));
        assert_eq!(r, ReaderId::from(r.get()));
    }
}
