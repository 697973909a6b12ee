//! Submap lifecycle, constraint creation and loop-closure search.
//!
//! Concurrency layout:
//! - Ingestion (`insert_scan`) owns the ingest state and only ever writes the
//!   active submap.
//! - Feature computation and loop-closure search run in the background and
//!   only write finished submaps.
//! - Each concern has its own lock: arena, ingest state, features, build
//!   flag, constraint list, proximity index. Every submap has its own
//!   `RwLock`.
//! - Submap poses are mirrored in a pose cache, so ingestion and graph
//!   building never wait on a finished submap's lock.
//! - Features are computed on a copy of the map cloud and installed with a
//!   short write.
//!
//! Lock order: ingest, arena, submap, then any of the leaf locks (pose
//! cache, proximity, constraints).
//!
//! Background work may lag ingestion by several submaps. It always works on
//! whatever submap was most recently finished when it starts.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::cloud::PointCloud;
use crate::config::MapperParameters;
use crate::geometry::SE3;
use crate::registration::{ConvergenceCriteria, Registration, RegistrationRequest};
use crate::time::Time;

use super::adjacency::{AdjacencyMatrix, ProximityIndex};
use super::constraint::Constraint;
use super::submap::{Submap, SubmapFeatures};
use super::types::{OptimizedSubmapPose, SubmapId};

/// Shared handle to one submap.
pub type SubmapHandle = Arc<RwLock<Submap>>;

/// Result of [`SubmapCollection::insert_scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Timestamp older than the last inserted scan. Nothing changed.
    RejectedOutOfOrder,
    /// Scan merged into the active submap.
    Inserted { submap_id: SubmapId },
    /// Scan merged, then `finished` was closed and `active` started.
    SwitchedSubmap { finished: SubmapId, active: SubmapId },
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        !matches!(self, InsertOutcome::RejectedOutOfOrder)
    }

    pub fn finished_submap(&self) -> Option<SubmapId> {
        match self {
            InsertOutcome::SwitchedSubmap { finished, .. } => Some(*finished),
            _ => None,
        }
    }
}

/// Result of [`SubmapCollection::build_loop_closure_constraints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopClosureBuild {
    /// Another build is in progress.
    Busy,
    /// No finished submap or no untried candidates.
    NothingToDo,
    Built { attempted: usize, accepted: usize },
}

#[derive(Debug, Default)]
struct IngestState {
    active: Option<SubmapId>,
    num_scans_merged: usize,
    last_time: Option<Time>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct CachedPose {
    map_to_submap: SE3,
    is_finished: bool,
}

/// Clears the build flag on drop.
struct BuildGuard<'a>(&'a AtomicBool);

impl<'a> BuildGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Arena of submaps plus the bookkeeping that links them.
pub struct SubmapCollection {
    params: RwLock<MapperParameters>,
    registration: Arc<dyn Registration>,

    submaps: RwLock<BTreeMap<SubmapId, SubmapHandle>>,
    poses: RwLock<BTreeMap<SubmapId, CachedPose>>,
    ingest: Mutex<IngestState>,
    last_finished: Mutex<Option<SubmapId>>,

    feature_computation: Mutex<()>,
    building_loop_closures: AtomicBool,
    constraints: Mutex<Vec<Constraint>>,
    proximity: Mutex<Box<dyn ProximityIndex>>,
}

impl SubmapCollection {
    pub fn new(params: MapperParameters, registration: Arc<dyn Registration>) -> Self {
        let proximity = Box::new(AdjacencyMatrix::new(params.submaps.adjacency_distance));
        Self::with_proximity_index(params, registration, proximity)
    }

    /// Use a custom proximity index for candidate search.
    pub fn with_proximity_index(
        params: MapperParameters,
        registration: Arc<dyn Registration>,
        proximity: Box<dyn ProximityIndex>,
    ) -> Self {
        Self {
            params: RwLock::new(params),
            registration,
            submaps: RwLock::new(BTreeMap::new()),
            poses: RwLock::new(BTreeMap::new()),
            ingest: Mutex::new(IngestState::default()),
            last_finished: Mutex::new(None),
            feature_computation: Mutex::new(()),
            building_loop_closures: AtomicBool::new(false),
            constraints: Mutex::new(Vec::new()),
            proximity: Mutex::new(proximity),
        }
    }

    /// Merge a scan into the active submap and switch submaps if needed.
    ///
    /// `preprocessed` goes into the map cloud, `raw` into the dense cloud
    /// when dense mapping is enabled. Both are in the range-sensor frame.
    pub fn insert_scan(
        &self,
        raw: &PointCloud,
        preprocessed: &PointCloud,
        map_to_range_sensor: &SE3,
        time: Time,
    ) -> InsertOutcome {
        let params = self.params.read().clone();
        let mut ingest = self.ingest.lock();

        if let Some(last) = ingest.last_time {
            if time < last {
                debug!("Submaps: scan at {} older than {}, rejecting", time, last);
                return InsertOutcome::RejectedOutOfOrder;
            }
        }
        ingest.last_time = Some(time);

        let active = match ingest.active.and_then(|id| self.submap(id)) {
            Some(handle) => handle,
            None => self.create_submap(&mut ingest, *map_to_range_sensor),
        };

        let (active_id, distance_from_origin) = {
            let mut submap = active.write();
            submap.insert(preprocessed, map_to_range_sensor, params.submaps.map_voxel_size);
            if params.submaps.build_dense_map {
                submap.insert_dense(raw, map_to_range_sensor, params.submaps.dense_voxel_size);
            }
            (submap.id(), (map_to_range_sensor.translation - submap.origin()).norm())
        };
        ingest.num_scans_merged += 1;

        let submap_params = &params.submaps;
        let n = ingest.num_scans_merged;
        let travelled_far = n >= submap_params.min_num_range_data && distance_from_origin > submap_params.submap_size;
        let scan_limit = submap_params.max_num_range_data > 0 && n >= submap_params.max_num_range_data;
        if !(travelled_far || scan_limit) {
            return InsertOutcome::Inserted { submap_id: active_id };
        }

        let new_id = self.switch_submap(&mut ingest, &active, *map_to_range_sensor, &params);
        InsertOutcome::SwitchedSubmap {
            finished: active_id,
            active: new_id,
        }
    }

    /// Create the next submap and make it active.
    fn create_submap(&self, ingest: &mut IngestState, map_to_submap: SE3) -> SubmapHandle {
        let id = SubmapId(ingest.next_id);
        ingest.next_id += 1;
        let handle = Arc::new(RwLock::new(Submap::new(id, map_to_submap)));
        self.submaps.write().insert(id, Arc::clone(&handle));
        self.poses.write().insert(
            id,
            CachedPose {
                map_to_submap,
                is_finished: false,
            },
        );
        self.proximity.lock().add_submap(id);
        ingest.active = Some(id);
        ingest.num_scans_merged = 0;
        handle
    }

    fn switch_submap(
        &self,
        ingest: &mut IngestState,
        finished: &SubmapHandle,
        map_to_range_sensor: SE3,
        params: &MapperParameters,
    ) -> SubmapId {
        let (finished_id, finished_pose, num_scans) = {
            let mut submap = finished.write();
            submap.mark_finished();
            (submap.id(), submap.map_to_submap(), submap.num_scans())
        };

        let new_id = self.create_submap(ingest, map_to_range_sensor).read().id();

        self.constraints.lock().push(Constraint::odometry(
            finished_id,
            &finished_pose,
            new_id,
            &map_to_range_sensor,
            params.odometry_information_weight,
        ));

        // Origins of every other finished submap, collected before touching
        // the proximity index.
        let others: Vec<(SubmapId, f64)> = {
            let mut poses = self.poses.write();
            if let Some(entry) = poses.get_mut(&finished_id) {
                entry.is_finished = true;
            }
            poses
                .iter()
                .filter(|(id, entry)| entry.is_finished && **id != finished_id)
                .map(|(id, entry)| (*id, (entry.map_to_submap.translation - finished_pose.translation).norm()))
                .collect()
        };

        {
            let mut proximity = self.proximity.lock();
            proximity.mark_odometry_link(finished_id, new_id);
            for (other, distance) in others {
                proximity.update_adjacency(finished_id, other, distance);
            }
        }

        *self.last_finished.lock() = Some(finished_id);

        info!(
            "Submaps: finished {} ({} scans), started {} at [{:.2}, {:.2}, {:.2}]",
            finished_id,
            num_scans,
            new_id,
            map_to_range_sensor.translation.x,
            map_to_range_sensor.translation.y,
            map_to_range_sensor.translation.z
        );
        new_id
    }

    /// Compute features for the most recently finished submap.
    ///
    /// Returns true only the first time for a given submap.
    pub fn compute_features_in_last_finished_submap(&self) -> bool {
        let Some(id) = self.last_finished_submap_id() else {
            return false;
        };
        let Some(handle) = self.submap(id) else {
            return false;
        };
        let computed = self.ensure_features(&handle);
        if computed {
            debug!("Submaps: computed features for {}", id);
        }
        computed
    }

    /// Compute features unless the submap already has final ones.
    ///
    /// The submap is only read-locked to copy its cloud and write-locked to
    /// install the result.
    fn ensure_features(&self, handle: &SubmapHandle) -> bool {
        let _guard = self.feature_computation.lock();
        let map_cloud = {
            let submap = handle.read();
            if !submap.needs_features() {
                return false;
            }
            submap.map_cloud().clone()
        };

        let params = self.params.read().submaps.clone();
        let Some(features) = SubmapFeatures::from_cloud(&map_cloud, &params) else {
            return false;
        };
        handle.write().set_features(features);
        true
    }

    /// Try to close loops between the most recently finished submap and
    /// its untried neighbours.
    pub fn build_loop_closure_constraints(&self) -> LoopClosureBuild {
        let Some(_guard) = BuildGuard::try_acquire(&self.building_loop_closures) else {
            return LoopClosureBuild::Busy;
        };
        let Some(finished_id) = self.last_finished_submap_id() else {
            return LoopClosureBuild::NothingToDo;
        };
        let candidates = self.proximity.lock().candidates(finished_id);
        if candidates.is_empty() {
            return LoopClosureBuild::NothingToDo;
        }
        let Some((source_cloud, map_to_source)) = self.features_snapshot(finished_id) else {
            return LoopClosureBuild::NothingToDo;
        };

        let params = self.params.read().loop_closure.clone();
        let mut attempted = 0;
        let mut accepted = 0;

        for candidate_id in candidates {
            let Some((target_cloud, map_to_target)) = self.features_snapshot(candidate_id) else {
                continue;
            };

            let request = RegistrationRequest {
                max_correspondence_distance: params.max_correspondence_distance,
                initial_guess: map_to_target.inverse().compose(&map_to_source),
                objective: params.icp_objective,
                criteria: ConvergenceCriteria::with_max_iteration(params.max_num_iter),
            };
            let result = self.registration.register(&source_cloud, &target_cloud, &request);

            self.proximity.lock().mark_attempted(finished_id, candidate_id);
            attempted += 1;

            if result.fitness > params.min_loop_closure_fitness {
                // The result maps finished-frame points into the candidate
                // frame, i.e. it is the finished submap's pose in the candidate.
                self.constraints.lock().push(Constraint::loop_closure(
                    candidate_id,
                    finished_id,
                    result.transformation,
                    params.information_weight,
                ));
                accepted += 1;
                info!(
                    "Loop closure accepted: {} -> {} (fitness {:.3}, rmse {:.4})",
                    candidate_id, finished_id, result.fitness, result.inlier_rmse
                );
            } else {
                debug!(
                    "Loop closure rejected: {} -> {} (fitness {:.3} <= {:.3})",
                    candidate_id, finished_id, result.fitness, params.min_loop_closure_fitness
                );
            }
        }

        LoopClosureBuild::Built { attempted, accepted }
    }

    /// Feature cloud and pose of a submap, computing features if missing.
    fn features_snapshot(&self, id: SubmapId) -> Option<(PointCloud, SE3)> {
        let handle = self.submap(id)?;
        self.ensure_features(&handle);
        let submap = handle.read();
        let features = submap.features()?;
        Some((features.cloud.clone(), submap.map_to_submap()))
    }

    /// Take every pending constraint.
    pub fn get_and_clear_constraints(&self) -> Vec<Constraint> {
        std::mem::take(&mut *self.constraints.lock())
    }

    pub fn num_pending_constraints(&self) -> usize {
        self.constraints.lock().len()
    }

    /// Write optimized poses back into the submaps.
    ///
    /// Submaps created after the graph was built are not in `poses`. They
    /// are moved by the correction `new * old⁻¹` of the newest updated
    /// submap, which is also returned. Ingestion is paused meanwhile.
    pub fn apply_optimized_poses(&self, poses: &[OptimizedSubmapPose]) -> Option<SE3> {
        let _ingest = self.ingest.lock();
        let submaps = self.submaps.read().clone();
        let mut newest: Option<(SubmapId, SE3)> = None;

        for pose in poses {
            let Some(handle) = submaps.get(&pose.submap_id) else {
                continue;
            };
            let correction = {
                let mut submap = handle.write();
                let correction = pose.map_to_submap.compose(&submap.map_to_submap().inverse());
                submap.set_map_to_submap(pose.map_to_submap);
                correction
            };
            self.cache_pose(pose.submap_id, pose.map_to_submap);
            if newest.is_none_or(|(id, _)| pose.submap_id > id) {
                newest = Some((pose.submap_id, correction));
            }
        }

        let (newest_id, correction) = newest?;
        for (id, handle) in submaps.range((Bound::Excluded(newest_id), Bound::Unbounded)) {
            let corrected = {
                let mut submap = handle.write();
                let corrected = correction.compose(&submap.map_to_submap());
                submap.set_map_to_submap(corrected);
                corrected
            };
            self.cache_pose(*id, corrected);
            debug!("Submaps: carried correction over to {}", id);
        }
        Some(correction)
    }

    fn cache_pose(&self, id: SubmapId, map_to_submap: SE3) {
        if let Some(entry) = self.poses.write().get_mut(&id) {
            entry.map_to_submap = map_to_submap;
        }
    }

    /// Reconfigure. Affects subsequent scans and searches only.
    pub fn set_parameters(&self, params: MapperParameters) {
        self.proximity
            .lock()
            .set_distance_threshold(params.submaps.adjacency_distance);
        *self.params.write() = params;
    }

    pub fn parameters(&self) -> MapperParameters {
        self.params.read().clone()
    }

    pub fn submap(&self, id: SubmapId) -> Option<SubmapHandle> {
        self.submaps.read().get(&id).cloned()
    }

    pub fn submap_ids(&self) -> Vec<SubmapId> {
        self.submaps.read().keys().copied().collect()
    }

    /// Current pose of every submap, by id.
    pub fn submap_poses(&self) -> Vec<(SubmapId, SE3)> {
        self.poses
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.map_to_submap))
            .collect()
    }

    pub fn active_submap_id(&self) -> Option<SubmapId> {
        self.ingest.lock().active
    }

    pub fn last_finished_submap_id(&self) -> Option<SubmapId> {
        *self.last_finished.lock()
    }

    pub fn num_submaps(&self) -> usize {
        self.submaps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.submaps.read().is_empty()
    }

    pub fn total_num_points(&self) -> usize {
        self.submaps.read().values().map(|s| s.read().map_cloud().len()).sum()
    }

    pub fn is_building_loop_closure_constraints(&self) -> bool {
        self.building_loop_closures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ConstraintKind;
    use crate::registration::RegistrationResult;
    use crate::registration::scripted::ScriptedRegistration;
    use approx::assert_relative_eq;
    use crossbeam_channel::{Receiver, Sender, bounded};
    use nalgebra::Vector3;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Small wall in front of the sensor.
    fn scan() -> PointCloud {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                points.push(Vector3::new(2.0, i as f64 * 0.3, j as f64 * 0.3));
            }
        }
        PointCloud::from_points(points)
    }

    fn at(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    fn params(submap_size: f64, min_scans: usize) -> MapperParameters {
        let mut params = MapperParameters::default();
        params.submaps.submap_size = submap_size;
        params.submaps.min_num_range_data = min_scans;
        params.submaps.adjacency_distance = 2.0;
        params.loop_closure.min_loop_closure_fitness = 0.5;
        params
    }

    fn collection(params: MapperParameters) -> (SubmapCollection, Arc<ScriptedRegistration>) {
        let scripted = Arc::new(ScriptedRegistration::new(0.0));
        let registration: Arc<dyn Registration> = scripted.clone();
        (SubmapCollection::new(params, registration), scripted)
    }

    fn insert_at(collection: &SubmapCollection, xs: &[f64], t0: u64) -> Vec<InsertOutcome> {
        xs.iter()
            .enumerate()
            .map(|(i, &x)| collection.insert_scan(&scan(), &scan(), &at(x), Time(t0 + i as u64)))
            .collect()
    }

    #[test]
    fn test_first_scan_creates_submap() {
        let (collection, _) = collection(params(1.0, 2));
        assert!(collection.is_empty());

        let outcome = collection.insert_scan(&scan(), &scan(), &at(0.5), Time(1));

        assert_eq!(outcome, InsertOutcome::Inserted { submap_id: SubmapId(0) });
        assert_eq!(collection.active_submap_id(), Some(SubmapId(0)));
        let submap = collection.submap(SubmapId(0)).unwrap();
        assert_relative_eq!(submap.read().origin(), Vector3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_switch_happens_exactly_once() {
        let (collection, _) = collection(params(1.0, 2));
        let outcomes = insert_at(&collection, &[0.0, 0.5, 1.0, 1.5, 1.6], 1);

        let switches: Vec<_> = outcomes.iter().filter_map(|o| o.finished_submap()).collect();
        assert_eq!(switches, vec![SubmapId(0)]);
        assert_eq!(collection.num_submaps(), 2);
        assert_eq!(collection.active_submap_id(), Some(SubmapId(1)));
        assert_eq!(collection.last_finished_submap_id(), Some(SubmapId(0)));

        let first = collection.submap(SubmapId(0)).unwrap();
        assert!(first.read().is_finished());
        assert_eq!(first.read().num_scans(), 4);
        assert!(!first.write().mark_finished());
        assert!(!collection.submap(SubmapId(1)).unwrap().read().is_finished());

        let constraints = collection.get_and_clear_constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].kind, ConstraintKind::Odometry);
        assert_eq!(constraints[0].source_submap_id, SubmapId(0));
        assert_eq!(constraints[0].target_submap_id, SubmapId(1));
        assert_relative_eq!(constraints[0].relative_pose.translation.x, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_min_scans_delays_switch() {
        let (collection, _) = collection(params(1.0, 3));
        let outcomes = insert_at(&collection, &[0.0, 5.0], 1);

        assert!(outcomes.iter().all(|o| o.finished_submap().is_none()));
        assert_eq!(collection.num_submaps(), 1);
    }

    #[test]
    fn test_max_scans_forces_switch() {
        let mut p = params(100.0, 1);
        p.submaps.max_num_range_data = 3;
        let (collection, _) = collection(p);
        let outcomes = insert_at(&collection, &[0.0, 0.0, 0.0], 1);

        assert_eq!(outcomes[2].finished_submap(), Some(SubmapId(0)));
    }

    #[test]
    fn test_out_of_order_scan_rejected() {
        let (collection, _) = collection(params(1.0, 1));
        collection.insert_scan(&scan(), &scan(), &at(0.0), Time(10));
        let points = collection.total_num_points();

        let outcome = collection.insert_scan(&scan(), &scan(), &at(5.0), Time(9));

        assert_eq!(outcome, InsertOutcome::RejectedOutOfOrder);
        assert_eq!(collection.num_submaps(), 1);
        assert_eq!(collection.total_num_points(), points);
        assert_eq!(collection.submap(SubmapId(0)).unwrap().read().num_scans(), 1);
    }

    #[test]
    fn test_constraints_drained_once() {
        let (collection, _) = collection(params(1.0, 1));
        insert_at(&collection, &[0.0, 1.5, 3.0], 1);

        assert_eq!(collection.num_pending_constraints(), 2);
        assert_eq!(collection.get_and_clear_constraints().len(), 2);
        assert!(collection.get_and_clear_constraints().is_empty());
    }

    #[test]
    fn test_features_computed_once_per_finished_submap() {
        let (collection, _) = collection(params(1.0, 1));
        assert!(!collection.compute_features_in_last_finished_submap());

        insert_at(&collection, &[0.0, 1.5], 1);

        assert!(collection.compute_features_in_last_finished_submap());
        assert!(!collection.compute_features_in_last_finished_submap());
        let submap = collection.submap(SubmapId(0)).unwrap();
        assert!(submap.read().features().is_some());
    }

    /// Out along x and back, so the fourth submap lands next to the first two.
    ///
    /// Origins: S0 0.0, S1 1.5, S2 3.0, S3 0.2, S4 -1.5 (active).
    fn out_and_back(collection: &SubmapCollection) {
        insert_at(collection, &[0.0, 1.5, 3.0, 0.2, -1.5], 1);
        assert_eq!(collection.last_finished_submap_id(), Some(SubmapId(3)));
    }

    #[test]
    fn test_loop_closure_attempts_each_pair_once() {
        let (collection, scripted) = collection(params(1.0, 1));
        out_and_back(&collection);
        collection.get_and_clear_constraints();

        let lc_pose = SE3::from_translation(Vector3::new(0.15, 0.0, 0.0));
        scripted.push(lc_pose, 0.9);
        scripted.push(SE3::identity(), 0.1);

        let built = collection.build_loop_closure_constraints();

        assert_eq!(built, LoopClosureBuild::Built { attempted: 2, accepted: 1 });
        // Candidates are visited in id order; S1 is last.
        let guess = scripted.last_request().unwrap().initial_guess;
        assert_relative_eq!(guess.translation.x, 0.2 - 1.5, epsilon = 1e-12);

        let constraints = collection.get_and_clear_constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].kind, ConstraintKind::LoopClosure);
        assert_eq!(constraints[0].source_submap_id, SubmapId(0));
        assert_eq!(constraints[0].target_submap_id, SubmapId(3));
        assert_eq!(constraints[0].relative_pose, lc_pose);

        let calls = scripted.num_calls();
        assert_eq!(collection.build_loop_closure_constraints(), LoopClosureBuild::NothingToDo);
        assert_eq!(scripted.num_calls(), calls);
    }

    #[test]
    fn test_odometry_neighbours_are_not_candidates() {
        let (collection, scripted) = collection(params(1.0, 1));
        insert_at(&collection, &[0.0, 1.5, 3.0], 1);

        // S1 is adjacent to S0 but joined by odometry.
        assert_eq!(collection.build_loop_closure_constraints(), LoopClosureBuild::NothingToDo);
        assert_eq!(scripted.num_calls(), 0);
    }

    /// Blocks inside `register` until released.
    struct GatedRegistration {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Registration for GatedRegistration {
        fn register(&self, _: &PointCloud, _: &PointCloud, request: &RegistrationRequest) -> RegistrationResult {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            RegistrationResult::failed(request.initial_guess)
        }
    }

    #[test]
    fn test_concurrent_build_is_busy() {
        let (entered_tx, entered_rx) = bounded(4);
        let (release_tx, release_rx) = bounded(4);
        let registration: Arc<dyn Registration> = Arc::new(GatedRegistration {
            entered: entered_tx,
            release: release_rx,
        });
        let collection = Arc::new(SubmapCollection::new(params(1.0, 1), registration));
        out_and_back(&collection);

        let background = {
            let collection = Arc::clone(&collection);
            thread::spawn(move || collection.build_loop_closure_constraints())
        };

        entered_rx.recv().unwrap();
        assert!(collection.is_building_loop_closure_constraints());
        assert_eq!(collection.build_loop_closure_constraints(), LoopClosureBuild::Busy);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        let built = background.join().unwrap();

        assert_eq!(built, LoopClosureBuild::Built { attempted: 2, accepted: 0 });
        assert!(!collection.is_building_loop_closure_constraints());
    }

    #[test]
    fn test_apply_optimized_poses_returns_newest_correction() {
        let (collection, _) = collection(params(1.0, 1));
        insert_at(&collection, &[0.0, 1.5], 1);

        let correction = collection.apply_optimized_poses(&[
            OptimizedSubmapPose {
                submap_id: SubmapId(0),
                map_to_submap: SE3::identity(),
            },
            OptimizedSubmapPose {
                submap_id: SubmapId(1),
                map_to_submap: at(1.2),
            },
        ]);

        let correction = correction.unwrap();
        assert_relative_eq!(correction.translation.x, -0.3, epsilon = 1e-12);
        let poses = collection.submap_poses();
        assert_relative_eq!(poses[1].1.translation.x, 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_switch_does_not_wait_on_finished_submap_lock() {
        let (collection, _) = collection(params(1.0, 1));
        insert_at(&collection, &[0.0, 1.5], 1);

        // Stand-in for a long feature computation on S0.
        let (locked_tx, locked_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let holder = {
            let handle = collection.submap(SubmapId(0)).unwrap();
            thread::spawn(move || {
                let _submap = handle.write();
                locked_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
        };
        locked_rx.recv().unwrap();

        let start = Instant::now();
        let outcome = collection.insert_scan(&scan(), &scan(), &at(3.0), Time(10));
        let poses = collection.submap_poses();
        let elapsed = start.elapsed();

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(
            outcome,
            InsertOutcome::SwitchedSubmap {
                finished: SubmapId(1),
                active: SubmapId(2),
            }
        );
        assert_eq!(poses.len(), 3);
        assert!(elapsed < Duration::from_secs(1), "ingestion waited {:?}", elapsed);
    }

    #[test]
    fn test_correction_carried_to_submaps_created_after_build() {
        let (collection, _) = collection(params(1.0, 1));
        // S0 and S1 are in the graph; S2 starts at 3.0 afterwards.
        insert_at(&collection, &[0.0, 1.5, 3.0], 1);
        collection.get_and_clear_constraints();

        let correction = collection
            .apply_optimized_poses(&[
                OptimizedSubmapPose {
                    submap_id: SubmapId(0),
                    map_to_submap: SE3::identity(),
                },
                OptimizedSubmapPose {
                    submap_id: SubmapId(1),
                    map_to_submap: at(1.2),
                },
            ])
            .unwrap();

        let active = collection.submap(SubmapId(2)).unwrap();
        assert_relative_eq!(active.read().map_to_submap().translation.x, 2.7, epsilon = 1e-12);
        assert_relative_eq!(collection.submap_poses()[2].1.translation.x, 2.7, epsilon = 1e-12);

        // Odometry says 4.5; the corrected map pose is 4.2.
        let outcome = collection.insert_scan(&scan(), &scan(), &correction.compose(&at(4.5)), Time(10));
        assert_eq!(outcome.finished_submap(), Some(SubmapId(2)));

        let constraints = collection.get_and_clear_constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].source_submap_id, SubmapId(2));
        assert_relative_eq!(constraints[0].relative_pose.translation.x, 1.5, epsilon = 1e-12);
    }
}
