//! Identity types for Haven
//!
//! Engine-generated identifiers are 64-bit sequence values. They double as
//! the suffix of backing-store keys, so their `Display` form is stable.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! sequence_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub const ZERO: $name = $name(0);

            #[inline]
            pub fn new(id: u64) -> Self {
                $name(id)
            }

            #[inline]
            pub fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:08x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:08x}", self.0)
            }
        }
    };
}

sequence_id!(
    /// Checkpoint identity
    CheckpointId,
    "Checkpoint"
);
sequence_id!(
    /// Backup identity
    BackupId,
    "Backup"
);
sequence_id!(
    /// Journal entry identity
    UpdateId,
    "Update"
);
sequence_id!(
    /// Conflict identity
    ConflictId,
    "Conflict"
);
sequence_id!(
    /// Corruption report identity
    ReportId,
    "Report"
);
sequence_id!(
    /// Crisis override identity
    OverrideId,
    "Override"
);

/// Monotonic engine revision. Every committed mutation bumps it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    #[inline]
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Device identity - chosen by the device, not the engine
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId::new(id)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out sequence ids for one id space
#[derive(Debug, Default)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    pub fn new() -> Self {
        IdSequence { next: 1 }
    }

    /// Take the next raw id
    pub fn take(&mut self) -> u64 {
        if self.next == 0 {
            self.next = 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Ensure future ids never collide with `seen`
    pub fn observe(&mut self, seen: u64) {
        if seen >= self.next {
            self.next = seen + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_id_display_is_store_key_friendly() {
        let id = CheckpointId::new(0x2a);
        assert_eq!(id.to_string(), "0000002a");
        assert_eq!(format!("{:?}", id), "Checkpoint(0000002a)");
    }

    #[test]
    fn test_id_sequence_skips_observed() {
        let mut seq = IdSequence::new();
        assert_eq!(seq.take(), 1);
        seq.observe(10);
        assert_eq!(seq.take(), 11);
        seq.observe(3);
        assert_eq!(seq.take(), 12);
    }

    #[test]
    fn test_revision_ordering() {
        let r = Revision::ZERO;
        assert!(r.next() > r);
        assert_eq!(r.next().next(), Revision(2));
    }

    proptest! {
        #[test]
        fn prop_id_sequence_never_reissues(ops in prop::collection::vec(prop::option::of(0u64..10_000), 1..64)) {
            let mut seq = IdSequence::new();
            let mut last_taken = 0u64;
            let mut max_seen = 0u64;
            for op in ops {
                match op {
                    Some(seen) => {
                        seq.observe(seen);
                        max_seen = max_seen.max(seen);
                    }
                    None => {
                        let id = seq.take();
                        prop_assert!(id > last_taken);
                        prop_assert!(id > max_seen);
                        last_taken = id;
                    }
                }
            }
        }
    }
}
