use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Row id of a content block.
    BlockId,
    "Block"
);
row_id!(
    /// Row id of an ordered block list (file content or metadata).
    BlocksetId,
    "Blockset"
);
row_id!(
    /// Row id of one version of a path.
    FileId,
    "File"
);
row_id!(
    /// Row id of a snapshot. Allocated in increasing order.
    FilesetId,
    "Fileset"
);
row_id!(
    /// Row id of a remote volume.
    VolumeId,
    "Volume"
);
