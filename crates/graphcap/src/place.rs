use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a physical accelerator device by ordinal.
///
/// Places are plain values compared by equality; two `Place`s with the same
/// ordinal always name the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Place(pub usize);

impl Place {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}
