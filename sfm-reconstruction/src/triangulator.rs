use crate::{
    reconstruction::reprojection_error, CorrespondenceGraph, ImageId, ImagePair,
    IncrementalTriangulatorOptions, ObservationManager, Point3DId, Reconstruction, Track,
    TrackElement,
};
use arrsac::Arrsac;
use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::{
    nalgebra::{Point2, Point3},
    sample_consensus::{Consensus, Estimator, Model},
    Bearing, CameraModel, NormalizedKeyPoint, WorldToCamera,
};
use sfm_geom::triangulation::{triangulate_multi_view_point, triangulate_point, triangulation_angle};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Up to this many observations every pair is tried as a hypothesis.
const EXHAUSTIVE_SAMPLING_THRESHOLD: usize = 15;
/// Unused observations of a new point are triangulated again if at least this many remain.
const MIN_RECURSIVE_TRACK_LENGTH: usize = 3;

/// A keypoint of a registered image along with everything needed to triangulate it.
#[derive(Debug, Clone, Copy)]
struct CorrData {
    element: TrackElement,
    cam_from_world: WorldToCamera,
    center: Point3<f64>,
    normalized: NormalizedKeyPoint,
    point3d_id: Option<Point3DId>,
}

/// A candidate point for a set of observations.
#[derive(Debug, Clone, Copy)]
struct TriangulatedPoint(Point3<f64>);

impl Model<CorrData> for TriangulatedPoint {
    /// Angle between the bearing of the keypoint and the ray to the point.
    fn residual(&self, data: &CorrData) -> f64 {
        angular_error(data.cam_from_world, data.normalized, &self.0)
    }
}

/// Two view hypotheses that satisfy the triangulation angle and cheirality constraints.
#[derive(Debug, Clone, Copy)]
struct TriangulationEstimator {
    min_tri_angle: f64,
}

impl TriangulationEstimator {
    fn is_valid(&self, a: &CorrData, b: &CorrData, point: &Point3<f64>) -> bool {
        triangulation_angle(&a.center, &b.center, point) >= self.min_tri_angle
            && a.cam_from_world.transform_point(point).z > f64::EPSILON
            && b.cam_from_world.transform_point(point).z > f64::EPSILON
    }

    /// Least squares point over all inliers, falling back to `initial` when it is degenerate.
    fn refine(&self, inliers: &[CorrData], initial: Point3<f64>) -> Point3<f64> {
        let poses: Vec<WorldToCamera> = inliers.iter().map(|c| c.cam_from_world).collect();
        let points: Vec<NormalizedKeyPoint> = inliers.iter().map(|c| c.normalized).collect();
        triangulate_multi_view_point(&poses, &points)
            .filter(|point| {
                inliers
                    .iter()
                    .all(|c| c.cam_from_world.transform_point(point).z > f64::EPSILON)
            })
            .unwrap_or(initial)
    }
}

impl Estimator<CorrData> for TriangulationEstimator {
    type Model = TriangulatedPoint;
    type ModelIter = Option<TriangulatedPoint>;
    const MIN_SAMPLES: usize = 2;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = CorrData> + Clone,
    {
        let a = data.next()?;
        let b = data.next()?;
        let point = triangulate_point(a.cam_from_world, b.cam_from_world, a.normalized, b.normalized)?;
        self.is_valid(&a, &b, &point)
            .then_some(TriangulatedPoint(point))
    }
}

fn angular_error(
    cam_from_world: WorldToCamera,
    normalized: NormalizedKeyPoint,
    point: &Point3<f64>,
) -> f64 {
    let ray = cam_from_world.transform_point(point).coords;
    let norm = ray.norm();
    if norm == 0.0 {
        return std::f64::consts::PI;
    }
    let cosine = normalized.bearing().dot(&(ray / norm));
    cosine.clamp(-1.0, 1.0).acos()
}

/// Finds the point best explaining the observations, along with the indices of its inliers.
///
/// Short tracks are searched exhaustively over all pairs. Longer ones are sampled with ARRSAC.
fn estimate_triangulation(
    corrs: &[CorrData],
    min_tri_angle: f64,
    max_angle_error: f64,
) -> Option<(Point3<f64>, Vec<usize>)> {
    let estimator = TriangulationEstimator { min_tri_angle };
    let inliers_of = |point: &TriangulatedPoint| -> Vec<usize> {
        corrs
            .iter()
            .enumerate()
            .filter(|(_, c)| point.residual(c) <= max_angle_error)
            .map(|(ix, _)| ix)
            .collect()
    };

    let (hypothesis, inliers) = if corrs.len() <= EXHAUSTIVE_SAMPLING_THRESHOLD {
        (0..corrs.len())
            .tuple_combinations()
            .filter_map(|(i, j)| estimator.estimate([corrs[i], corrs[j]].into_iter()))
            .map(|point| {
                let inliers = inliers_of(&point);
                let error: f64 = inliers.iter().map(|&ix| point.residual(&corrs[ix])).sum();
                (point, inliers, error)
            })
            .max_by_key(|(_, inliers, error)| (inliers.len(), FloatOrd(-error)))
            .map(|(point, inliers, _)| (point, inliers))?
    } else {
        let seed = corrs.len() as u64;
        let mut consensus = Arrsac::new(max_angle_error, Xoshiro256PlusPlus::seed_from_u64(seed));
        consensus.model_inliers(&estimator, corrs.iter().copied())?
    };
    if inliers.len() < 2 {
        return None;
    }

    let inlier_corrs: Vec<CorrData> = inliers.iter().map(|&ix| corrs[ix]).collect();
    let refined = TriangulatedPoint(estimator.refine(&inlier_corrs, hypothesis.0));
    let refined_inliers = inliers_of(&refined);
    if refined_inliers.len() >= inliers.len() {
        Some((refined.0, refined_inliers))
    } else {
        Some((hypothesis.0, inliers))
    }
}

/// Creates, continues, completes and merges tracks of a growing reconstruction.
///
/// Points are created from the correspondences of newly registered images. The triangulator
/// remembers which points it touched so that the mapper can restrict bundle adjustment and filtering
/// to them.
#[derive(Debug, Clone)]
pub struct IncrementalTriangulator {
    correspondence_graph: Arc<CorrespondenceGraph>,
    modified_point3d_ids: HashSet<Point3DId>,
    /// Pairs of points that were already tested for merging.
    merge_trials: HashMap<Point3DId, HashSet<Point3DId>>,
    re_num_trials: HashMap<ImagePair, usize>,
}

impl IncrementalTriangulator {
    pub fn new(correspondence_graph: Arc<CorrespondenceGraph>) -> Self {
        Self {
            correspondence_graph,
            modified_point3d_ids: HashSet::new(),
            merge_trials: HashMap::new(),
            re_num_trials: HashMap::new(),
        }
    }

    /// Triangulates the keypoints of a registered image.
    ///
    /// Keypoints with triangulated correspondences are added to the best fitting of those points.
    /// All correspondences that are not triangulated are used to create new points. Returns the
    /// number of added observations.
    pub fn triangulate_image(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        image_id: ImageId,
    ) -> usize {
        let Some(ref_template) = self.ref_corr_data(options, obs_manager.reconstruction(), image_id)
        else {
            return 0;
        };
        let mut num_tris = 0;
        let num_points2d = obs_manager.reconstruction().image(image_id).num_points2d();
        for point2d_idx in 0..num_points2d {
            let (num_triangulated, mut corrs) = self.find(
                options,
                obs_manager.reconstruction(),
                image_id,
                point2d_idx,
                options.max_transitivity,
            );
            if corrs.is_empty() {
                continue;
            }
            let ref_corr = self.with_keypoint(obs_manager.reconstruction(), ref_template, point2d_idx);
            if num_triangulated > 0 {
                num_tris += self.continue_track(options, obs_manager, &ref_corr, &corrs);
            }
            corrs.push(ref_corr);
            num_tris += self.create(options, obs_manager, &corrs);
        }
        trace!("triangulated {} observations of image {}", num_tris, image_id);
        num_tris
    }

    /// Completes the tracks observed by the image and creates points for keypoints whose
    /// correspondences are not triangulated yet.
    pub fn complete_image(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        image_id: ImageId,
    ) -> usize {
        let Some(ref_template) = self.ref_corr_data(options, obs_manager.reconstruction(), image_id)
        else {
            return 0;
        };
        let mut num_tris = 0;
        let num_points2d = obs_manager.reconstruction().image(image_id).num_points2d();
        for point2d_idx in 0..num_points2d {
            let point2d = obs_manager.reconstruction().image(image_id).point2d(point2d_idx);
            if let Some(point3d_id) = point2d.point3d_id {
                num_tris += self.complete(options, obs_manager, point3d_id);
                continue;
            }
            if options.ignore_two_view_tracks
                && self
                    .correspondence_graph
                    .is_two_view_observation(image_id, point2d_idx)
            {
                continue;
            }
            let (num_triangulated, mut corrs) = self.find(
                options,
                obs_manager.reconstruction(),
                image_id,
                point2d_idx,
                options.max_transitivity,
            );
            if num_triangulated > 0 || corrs.is_empty() {
                continue;
            }
            corrs.push(self.with_keypoint(obs_manager.reconstruction(), ref_template, point2d_idx));
            num_tris += self.create_point(options, obs_manager, &corrs).map_or(0, |(n, _)| n);
        }
        num_tris
    }

    /// Adds observations to the tracks of the given points. Returns the number of added observations.
    pub fn complete_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> usize {
        point3d_ids
            .iter()
            .map(|&point3d_id| self.complete(options, obs_manager, point3d_id))
            .sum()
    }

    pub fn complete_all_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
    ) -> usize {
        let point3d_ids = obs_manager.reconstruction().point3d_ids().into_iter().collect();
        self.complete_tracks(options, obs_manager, &point3d_ids)
    }

    /// Merges the given points with corresponding points. Returns the number of observations of
    /// the merged points.
    pub fn merge_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> usize {
        point3d_ids
            .iter()
            .map(|&point3d_id| self.merge(options, obs_manager, point3d_id))
            .sum()
    }

    pub fn merge_all_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
    ) -> usize {
        let point3d_ids = obs_manager.reconstruction().point3d_ids().into_iter().collect();
        self.merge_tracks(options, obs_manager, &point3d_ids)
    }

    /// Triangulates image pairs whose share of triangulated correspondences is below
    /// `re_min_ratio`, continuing tracks with the relaxed `re_max_angle_error`.
    ///
    /// Each pair is only retried `re_max_trials` times over the lifetime of the triangulator.
    pub fn retriangulate(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
    ) -> usize {
        self.clear_caches();
        let re_options = IncrementalTriangulatorOptions {
            continue_max_angle_error: options.re_max_angle_error,
            ..*options
        };

        let candidates: Vec<ImagePair> = obs_manager
            .image_pair_stats()
            .iter()
            .filter(|(_, stats)| {
                stats.num_total_corrs > 0
                    && (stats.num_tri_corrs as f64 / stats.num_total_corrs as f64) < options.re_min_ratio
            })
            .map(|(&pair, _)| pair)
            .sorted()
            .collect();

        let mut num_tris = 0;
        for pair in candidates {
            let (image_id1, image_id2) = (pair.first(), pair.second());
            let reconstruction = obs_manager.reconstruction();
            if !reconstruction.is_image_registered(image_id1)
                || !reconstruction.is_image_registered(image_id2)
            {
                continue;
            }
            let num_trials = self.re_num_trials.entry(pair).or_default();
            if *num_trials >= options.re_max_trials {
                continue;
            }
            *num_trials += 1;

            let (Some(template1), Some(template2)) = (
                self.ref_corr_data(options, reconstruction, image_id1),
                self.ref_corr_data(options, reconstruction, image_id2),
            ) else {
                continue;
            };
            let matches = self
                .correspondence_graph
                .find_correspondences_between_images(image_id1, image_id2);
            for (point2d_idx1, point2d_idx2) in matches {
                let reconstruction = obs_manager.reconstruction();
                let corr1 = self.with_keypoint(reconstruction, template1, point2d_idx1);
                let corr2 = self.with_keypoint(reconstruction, template2, point2d_idx2);
                // Correspondences between two different points are most likely bogus.
                num_tris += match (corr1.point3d_id, corr2.point3d_id) {
                    (Some(_), Some(_)) => 0,
                    (Some(_), None) => self.continue_track(&re_options, obs_manager, &corr2, &[corr1]),
                    (None, Some(_)) => self.continue_track(&re_options, obs_manager, &corr1, &[corr2]),
                    (None, None) => self.create(options, obs_manager, &[corr1, corr2]),
                };
            }
        }
        debug!("retriangulated {} observations", num_tris);
        num_tris
    }

    /// Forgets which point pairs were already tested for merging.
    pub fn clear_caches(&mut self) {
        self.merge_trials.clear();
    }

    pub fn add_modified_point3d(&mut self, point3d_id: Point3DId) {
        self.modified_point3d_ids.insert(point3d_id);
    }

    /// Points created or changed since the last call to [`Self::clear_modified_points3d`] that
    /// still exist.
    pub fn modified_points3d(&self, reconstruction: &Reconstruction) -> BTreeSet<Point3DId> {
        self.modified_point3d_ids
            .iter()
            .copied()
            .filter(|&id| reconstruction.exists_point3d(id))
            .collect()
    }

    pub fn clear_modified_points3d(&mut self) {
        self.modified_point3d_ids.clear();
    }

    /// Pose data of a registered image with usable intrinsics. The keypoint fields are filled in
    /// per keypoint by [`Self::with_keypoint`].
    fn ref_corr_data(
        &self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &Reconstruction,
        image_id: ImageId,
    ) -> Option<CorrData> {
        if !reconstruction.is_image_registered(image_id) {
            return None;
        }
        let image = reconstruction.image(image_id);
        let camera = reconstruction.camera(image.camera_id);
        if camera.has_bogus_params(
            options.min_focal_length_ratio,
            options.max_focal_length_ratio,
            options.max_extra_param,
        ) {
            return None;
        }
        let cam_from_world = reconstruction.cam_from_world(image_id)?;
        Some(CorrData {
            element: TrackElement::new(image_id, 0),
            cam_from_world,
            center: cam_from_world.center(),
            normalized: NormalizedKeyPoint(Point2::origin()),
            point3d_id: None,
        })
    }

    fn with_keypoint(
        &self,
        reconstruction: &Reconstruction,
        template: CorrData,
        point2d_idx: usize,
    ) -> CorrData {
        let image_id = template.element.image_id;
        let image = reconstruction.image(image_id);
        let point2d = image.point2d(point2d_idx);
        CorrData {
            element: TrackElement::new(image_id, point2d_idx),
            normalized: reconstruction.camera(image.camera_id).calibrate(point2d.keypoint),
            point3d_id: point2d.point3d_id,
            ..template
        }
    }

    /// Correspondences of a keypoint in registered images with usable intrinsics, along with how
    /// many of them are triangulated.
    fn find(
        &self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &Reconstruction,
        image_id: ImageId,
        point2d_idx: usize,
        transitivity: usize,
    ) -> (usize, Vec<CorrData>) {
        let found =
            self.correspondence_graph
                .find_transitive_correspondences(image_id, point2d_idx, transitivity);
        let mut num_triangulated = 0;
        let mut templates: HashMap<ImageId, Option<CorrData>> = HashMap::new();
        let corrs: Vec<CorrData> = found
            .into_iter()
            .filter_map(|corr| {
                let template = *templates
                    .entry(corr.image_id)
                    .or_insert_with(|| self.ref_corr_data(options, reconstruction, corr.image_id));
                let data = self.with_keypoint(reconstruction, template?, corr.point2d_idx);
                if data.point3d_id.is_some() {
                    num_triangulated += 1;
                }
                Some(data)
            })
            .collect();
        (num_triangulated, corrs)
    }

    /// Creates points from the untriangulated observations, recursing while enough observations
    /// remain unused.
    fn create(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        corrs: &[CorrData],
    ) -> usize {
        let reconstruction = obs_manager.reconstruction();
        let create_corrs: Vec<CorrData> = corrs
            .iter()
            .filter(|c| {
                !reconstruction
                    .image(c.element.image_id)
                    .point2d(c.element.point2d_idx)
                    .has_point3d()
            })
            .copied()
            .collect();
        if create_corrs.len() < 2 {
            return 0;
        }
        if options.ignore_two_view_tracks
            && create_corrs.len() == 2
            && self.correspondence_graph.is_two_view_observation(
                create_corrs[0].element.image_id,
                create_corrs[0].element.point2d_idx,
            )
        {
            return 0;
        }
        let Some((track_len, _)) = self.create_point(options, obs_manager, &create_corrs) else {
            return 0;
        };
        if create_corrs.len() - track_len >= MIN_RECURSIVE_TRACK_LENGTH {
            track_len + self.create(options, obs_manager, &create_corrs)
        } else {
            track_len
        }
    }

    /// Robustly triangulates one point from the observations and adds it with its inliers.
    fn create_point(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        corrs: &[CorrData],
    ) -> Option<(usize, Point3DId)> {
        let (position, inliers) = estimate_triangulation(
            corrs,
            options.min_angle.to_radians(),
            options.create_max_angle_error.to_radians(),
        )?;
        // Two keypoints of the same image cannot observe the same point.
        let track: Track = inliers
            .iter()
            .map(|&ix| corrs[ix].element)
            .unique_by(|element| element.image_id)
            .collect();
        if track.len() < options.min_track_length {
            return None;
        }
        let track_len = track.len();
        match obs_manager.add_point3d(position, track, [0, 0, 0]) {
            Ok(point3d_id) => {
                self.modified_point3d_ids.insert(point3d_id);
                Some((track_len, point3d_id))
            }
            Err(e) => {
                error!("failed to add triangulated point: {}", e);
                None
            }
        }
    }

    /// Adds the reference keypoint to the triangulated correspondence it fits best.
    fn continue_track(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        ref_corr: &CorrData,
        corrs: &[CorrData],
    ) -> usize {
        let reconstruction = obs_manager.reconstruction();
        if reconstruction
            .image(ref_corr.element.image_id)
            .point2d(ref_corr.element.point2d_idx)
            .has_point3d()
        {
            return 0;
        }
        let best = corrs
            .iter()
            .filter_map(|c| c.point3d_id)
            .filter(|&id| reconstruction.exists_point3d(id))
            .map(|id| {
                let position = reconstruction.point3d(id).position;
                (id, angular_error(ref_corr.cam_from_world, ref_corr.normalized, &position))
            })
            .min_by_key(|&(_, error)| FloatOrd(error));
        let Some((point3d_id, error)) = best else {
            return 0;
        };
        if error > options.continue_max_angle_error.to_radians() {
            return 0;
        }
        match obs_manager.add_observation(point3d_id, ref_corr.element) {
            Ok(()) => {
                self.modified_point3d_ids.insert(point3d_id);
                1
            }
            Err(e) => {
                error!("failed to continue track of point {}: {}", point3d_id, e);
                0
            }
        }
    }

    /// Follows the correspondences of the track breadth first and adds every untriangulated keypoint
    /// that reprojects within `complete_max_reproj_error`.
    fn complete(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        point3d_id: Point3DId,
    ) -> usize {
        if !obs_manager.reconstruction().exists_point3d(point3d_id) {
            return 0;
        }
        let position = obs_manager.reconstruction().point3d(point3d_id).position;
        let mut queue: Vec<TrackElement> = obs_manager
            .reconstruction()
            .point3d(point3d_id)
            .track
            .elements()
            .to_vec();
        let mut num_completed = 0;
        for _ in 0..options.complete_max_transitivity {
            if queue.is_empty() {
                break;
            }
            let previous = std::mem::take(&mut queue);
            for element in previous {
                let corrs = self
                    .correspondence_graph
                    .correspondences(element.image_id, element.point2d_idx);
                for corr in corrs {
                    let reconstruction = obs_manager.reconstruction();
                    if !reconstruction.is_image_registered(corr.image_id) {
                        continue;
                    }
                    let image = reconstruction.image(corr.image_id);
                    let point2d = image.point2d(corr.point2d_idx);
                    if point2d.has_point3d() {
                        continue;
                    }
                    let camera = reconstruction.camera(image.camera_id);
                    if camera.has_bogus_params(
                        options.min_focal_length_ratio,
                        options.max_focal_length_ratio,
                        options.max_extra_param,
                    ) {
                        continue;
                    }
                    let Some(cam_from_world) = reconstruction.cam_from_world(corr.image_id) else {
                        continue;
                    };
                    let error = reprojection_error(camera, cam_from_world, &point2d.keypoint, &position);
                    if error > options.complete_max_reproj_error {
                        continue;
                    }
                    let element = TrackElement::new(corr.image_id, corr.point2d_idx);
                    match obs_manager.add_observation(point3d_id, element) {
                        Ok(()) => {
                            self.modified_point3d_ids.insert(point3d_id);
                            queue.push(element);
                            num_completed += 1;
                        }
                        Err(e) => debug!("cannot complete track of point {}: {}", point3d_id, e),
                    }
                }
            }
        }
        num_completed
    }

    /// Merges the point with a corresponding point when every observation of both reprojects
    /// within `merge_max_reproj_error` of their weighted mean position. Merged points are merged
    /// again until nothing changes.
    fn merge(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        obs_manager: &mut ObservationManager,
        point3d_id: Point3DId,
    ) -> usize {
        let reconstruction = obs_manager.reconstruction();
        if !reconstruction.exists_point3d(point3d_id) {
            return 0;
        }
        let point3d = reconstruction.point3d(point3d_id);
        let candidates: Vec<Point3DId> = point3d
            .track
            .iter()
            .flat_map(|element| {
                self.correspondence_graph
                    .correspondences(element.image_id, element.point2d_idx)
            })
            .filter(|corr| reconstruction.is_image_registered(corr.image_id))
            .filter_map(|corr| {
                reconstruction
                    .image(corr.image_id)
                    .point2d(corr.point2d_idx)
                    .point3d_id
            })
            .filter(|&id| id != point3d_id)
            .unique()
            .collect();

        for corr_point3d_id in candidates {
            let reconstruction = obs_manager.reconstruction();
            if !reconstruction.exists_point3d(corr_point3d_id)
                || self
                    .merge_trials
                    .get(&point3d_id)
                    .map_or(false, |tried| tried.contains(&corr_point3d_id))
            {
                continue;
            }
            self.merge_trials
                .entry(point3d_id)
                .or_default()
                .insert(corr_point3d_id);
            self.merge_trials
                .entry(corr_point3d_id)
                .or_default()
                .insert(point3d_id);

            let point1 = reconstruction.point3d(point3d_id);
            let point2 = reconstruction.point3d(corr_point3d_id);
            // Both tracks in one image would give a point two keypoints in that image.
            if point1.track.iter().any(|e| point2.track.contains_image(e.image_id)) {
                continue;
            }
            let weight1 = point1.track.len() as f64;
            let weight2 = point2.track.len() as f64;
            let merged_position = Point3::from(
                (weight1 * point1.position.coords + weight2 * point2.position.coords)
                    / (weight1 + weight2),
            );
            let consistent = point1.track.iter().chain(point2.track.iter()).all(|element| {
                let image = reconstruction.image(element.image_id);
                reconstruction
                    .cam_from_world(element.image_id)
                    .map_or(false, |cam_from_world| {
                        reprojection_error(
                            reconstruction.camera(image.camera_id),
                            cam_from_world,
                            &image.point2d(element.point2d_idx).keypoint,
                            &merged_position,
                        ) <= options.merge_max_reproj_error
                    })
            });
            if !consistent {
                continue;
            }

            let num_merged = point1.track.len() + point2.track.len();
            let merged = match obs_manager.merge_points3d(point3d_id, corr_point3d_id) {
                Ok(merged) => merged,
                Err(e) => {
                    error!("failed to merge points {} and {}: {}", point3d_id, corr_point3d_id, e);
                    return 0;
                }
            };
            self.modified_point3d_ids.remove(&point3d_id);
            self.modified_point3d_ids.remove(&corr_point3d_id);
            self.modified_point3d_ids.insert(merged);
            let num_merged_again = self.merge(options, obs_manager, merged);
            return if num_merged_again == 0 {
                num_merged
            } else {
                num_merged_again
            };
        }
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{reconstruction::test::three_view_scene, FrameId};

    fn graph(reconstruction: &Reconstruction, num_points: usize) -> Arc<CorrespondenceGraph> {
        let mut graph = CorrespondenceGraph::new();
        for (image_id, image) in reconstruction.images() {
            graph.add_image(image_id, image.num_points2d());
        }
        let image_ids: Vec<ImageId> = reconstruction.images().map(|(id, _)| id).collect();
        for (i, &a) in image_ids.iter().enumerate() {
            for &b in &image_ids[i + 1..] {
                let matches: Vec<(usize, usize)> = (0..num_points).map(|k| (k, k)).collect();
                graph.add_correspondences(a, b, &matches).unwrap();
            }
        }
        graph.finalize();
        Arc::new(graph)
    }

    fn options() -> IncrementalTriangulatorOptions {
        IncrementalTriangulatorOptions {
            ignore_two_view_tracks: false,
            ..Default::default()
        }
    }

    #[test]
    fn triangulating_an_image_creates_points_for_every_keypoint() {
        let reconstruction = three_view_scene();
        let graph = graph(&reconstruction, 10);
        let mut obs_manager = ObservationManager::new(reconstruction, Some(graph.clone()));
        let mut triangulator = IncrementalTriangulator::new(graph);

        let num_tris = triangulator.triangulate_image(&options(), &mut obs_manager, ImageId(0));
        let reconstruction = obs_manager.reconstruction();
        assert_eq!(reconstruction.num_points3d(), 10);
        assert_eq!(num_tris, 30);
        for (point3d_id, point3d) in reconstruction.points3d() {
            assert_eq!(point3d.track.len(), 3);
            for (_, error) in reconstruction.observation_errors(point3d_id) {
                assert!(error < 1e-6);
            }
        }
        assert_eq!(triangulator.modified_points3d(reconstruction).len(), 10);
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn newly_registered_images_continue_existing_tracks() {
        let reconstruction = three_view_scene();
        let graph = graph(&reconstruction, 10);
        let mut obs_manager = ObservationManager::new(reconstruction, Some(graph.clone()));
        let mut triangulator = IncrementalTriangulator::new(graph);
        triangulator.triangulate_image(&options(), &mut obs_manager, ImageId(0));
        triangulator.clear_modified_points3d();

        obs_manager.register_frame(FrameId(3)).unwrap();
        let num_tris = triangulator.triangulate_image(&options(), &mut obs_manager, ImageId(3));
        assert_eq!(num_tris, 10);
        let reconstruction = obs_manager.reconstruction();
        assert_eq!(reconstruction.num_points3d(), 10);
        assert_eq!(reconstruction.image(ImageId(3)).num_points3d(), 10);
        assert_eq!(obs_manager.num_visible_points3d(ImageId(3)), 10);
    }

    #[test]
    fn completion_adds_consistent_keypoints() {
        let reconstruction = three_view_scene();
        let graph = graph(&reconstruction, 10);
        let mut obs_manager = ObservationManager::new(reconstruction, Some(graph.clone()));
        let mut triangulator = IncrementalTriangulator::new(graph);
        let position = Point3::new(-1.0, -0.3, 5.0);
        let point3d_id = obs_manager
            .add_point3d(
                position,
                [TrackElement::new(ImageId(0), 0), TrackElement::new(ImageId(1), 0)]
                    .into_iter()
                    .collect(),
                [0; 3],
            )
            .unwrap();

        let num_completed = triangulator.complete_all_tracks(&options(), &mut obs_manager);
        assert_eq!(num_completed, 1);
        assert_eq!(obs_manager.reconstruction().point3d(point3d_id).track.len(), 3);
    }

    #[test]
    fn corresponding_points_are_merged() {
        let reconstruction = three_view_scene();
        let graph = graph(&reconstruction, 10);
        let mut obs_manager = ObservationManager::new(reconstruction, Some(graph.clone()));
        let mut triangulator = IncrementalTriangulator::new(graph);
        obs_manager.register_frame(FrameId(3)).unwrap();
        let a = obs_manager
            .add_point3d(
                Point3::new(-0.8, 0.0, 5.0),
                [TrackElement::new(ImageId(0), 1), TrackElement::new(ImageId(1), 1)]
                    .into_iter()
                    .collect(),
                [0; 3],
            )
            .unwrap();
        let b = obs_manager
            .add_point3d(
                Point3::new(-0.8, 0.0, 5.0001),
                [TrackElement::new(ImageId(2), 1), TrackElement::new(ImageId(3), 1)]
                    .into_iter()
                    .collect(),
                [0; 3],
            )
            .unwrap();

        let num_merged = triangulator.merge_all_tracks(&options(), &mut obs_manager);
        assert_eq!(num_merged, 4);
        let reconstruction = obs_manager.reconstruction();
        assert!(!reconstruction.exists_point3d(a));
        assert!(!reconstruction.exists_point3d(b));
        assert_eq!(reconstruction.num_points3d(), 1);
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn wrong_matches_are_left_out_of_new_tracks() {
        let reconstruction = three_view_scene();
        let mut graph = CorrespondenceGraph::new();
        for (image_id, image) in reconstruction.images() {
            graph.add_image(image_id, image.num_points2d());
        }
        let identity: Vec<(usize, usize)> = (0..10).map(|k| (k, k)).collect();
        let swapped: Vec<(usize, usize)> = (0..10)
            .map(|k| match k {
                0 => (0, 5),
                5 => (5, 0),
                k => (k, k),
            })
            .collect();
        graph.add_correspondences(ImageId(0), ImageId(1), &identity).unwrap();
        graph.add_correspondences(ImageId(0), ImageId(2), &swapped).unwrap();
        graph.finalize();
        let graph = Arc::new(graph);

        let mut obs_manager = ObservationManager::new(reconstruction, Some(graph.clone()));
        let mut triangulator = IncrementalTriangulator::new(graph);
        triangulator.triangulate_image(&options(), &mut obs_manager, ImageId(0));
        let reconstruction = obs_manager.reconstruction();
        assert_eq!(reconstruction.image(ImageId(2)).point2d(5).point3d_id, None);
        assert_eq!(reconstruction.image(ImageId(2)).point2d(0).point3d_id, None);
        let point3d_id = reconstruction.image(ImageId(0)).point2d(0).point3d_id.unwrap();
        assert_eq!(reconstruction.point3d(point3d_id).track.len(), 2);
        assert_eq!(reconstruction.num_points3d(), 10);
    }
}
