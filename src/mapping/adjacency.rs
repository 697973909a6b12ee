//! Proximity bookkeeping for loop-closure candidate search.

use std::collections::{BTreeSet, HashSet};

use super::types::SubmapId;

/// Spatial relation between submaps used to propose loop-closure pairs.
///
/// [`AdjacencyMatrix`] checks pairs exhaustively. A spatial index can
/// implement this trait without changing the collection.
pub trait ProximityIndex: Send {
    fn add_submap(&mut self, id: SubmapId);

    /// Set the proximity edge if `distance` is within the threshold, clear it
    /// otherwise. Self-pairs are ignored.
    fn update_adjacency(&mut self, a: SubmapId, b: SubmapId, distance: f64);

    /// Record that `a` and `b` are joined by an odometry constraint.
    fn mark_odometry_link(&mut self, a: SubmapId, b: SubmapId);

    /// Record that a loop closure between `a` and `b` has been tried.
    fn mark_attempted(&mut self, a: SubmapId, b: SubmapId);

    fn is_attempted(&self, a: SubmapId, b: SubmapId) -> bool;

    fn are_adjacent(&self, a: SubmapId, b: SubmapId) -> bool;

    /// Adjacent submaps not odometry-linked to `id` and not yet attempted
    /// with it, sorted by id.
    fn candidates(&self, id: SubmapId) -> Vec<SubmapId>;

    fn num_submaps(&self) -> usize;

    fn set_distance_threshold(&mut self, threshold: f64);
}

/// Unordered pair key.
fn pair(a: SubmapId, b: SubmapId) -> (SubmapId, SubmapId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Symmetric adjacency over registered submaps.
#[derive(Debug, Clone, Default)]
pub struct AdjacencyMatrix {
    distance_threshold: f64,
    submaps: BTreeSet<SubmapId>,
    adjacent: HashSet<(SubmapId, SubmapId)>,
    odometry_links: HashSet<(SubmapId, SubmapId)>,
    attempted: HashSet<(SubmapId, SubmapId)>,
}

impl AdjacencyMatrix {
    pub fn new(distance_threshold: f64) -> Self {
        Self {
            distance_threshold,
            ..Self::default()
        }
    }

    pub fn distance_threshold(&self) -> f64 {
        self.distance_threshold
    }
}

impl ProximityIndex for AdjacencyMatrix {
    fn add_submap(&mut self, id: SubmapId) {
        self.submaps.insert(id);
    }

    fn update_adjacency(&mut self, a: SubmapId, b: SubmapId, distance: f64) {
        if a == b {
            return;
        }
        self.submaps.insert(a);
        self.submaps.insert(b);
        if distance <= self.distance_threshold {
            self.adjacent.insert(pair(a, b));
        } else {
            self.adjacent.remove(&pair(a, b));
        }
    }

    fn mark_odometry_link(&mut self, a: SubmapId, b: SubmapId) {
        if a != b {
            self.odometry_links.insert(pair(a, b));
        }
    }

    fn mark_attempted(&mut self, a: SubmapId, b: SubmapId) {
        if a != b {
            self.attempted.insert(pair(a, b));
        }
    }

    fn is_attempted(&self, a: SubmapId, b: SubmapId) -> bool {
        self.attempted.contains(&pair(a, b))
    }

    fn are_adjacent(&self, a: SubmapId, b: SubmapId) -> bool {
        self.adjacent.contains(&pair(a, b))
    }

    fn candidates(&self, id: SubmapId) -> Vec<SubmapId> {
        self.submaps
            .iter()
            .copied()
            .filter(|&other| other != id)
            .filter(|&other| {
                let key = pair(id, other);
                self.adjacent.contains(&key) && !self.odometry_links.contains(&key) && !self.attempted.contains(&key)
            })
            .collect()
    }

    fn num_submaps(&self) -> usize {
        self.submaps.len()
    }

    fn set_distance_threshold(&mut self, threshold: f64) {
        self.distance_threshold = threshold;
    }
}
