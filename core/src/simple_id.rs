use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Small integer handle shown to the operator, distinct from the OS pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimpleId(pub u32);

impl SimpleId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SimpleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
