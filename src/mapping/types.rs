//! Identifiers and pose records shared by the mapping and optimization layers.

use crate::geometry::SE3;

/// Unique identifier for a Submap.
///
/// Assigned sequentially by the collection and never reused, so a
/// `SubmapId` stays a valid handle for the lifetime of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmapId(pub u64);

impl SubmapId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SubmapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Optimized pose of one submap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizedSubmapPose {
    pub submap_id: SubmapId,
    pub map_to_submap: SE3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submap_id_ordering_and_display() {
        assert!(SubmapId::new(1) < SubmapId::new(2));
        assert_eq!(SubmapId::new(7).to_string(), "S7");
    }
}
