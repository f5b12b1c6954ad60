use crate::{
    CorrespondenceGraph, FrameId, ImageId, ImagePair, Point3DId, Reconstruction, SceneError, Track,
    TrackElement,
};
use log::*;
use sfm_core::nalgebra::{Point2, Point3};
use sfm_geom::triangulation::triangulation_angle;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const NUM_VISIBILITY_PYRAMID_LEVELS: usize = 6;

/// Counts how well the triangulated keypoints of an image cover it.
///
/// Level `l` splits the image into `2^(l+1)` cells per side. The score grows by the number of cells
/// of a level whenever a cell of that level becomes occupied, so spread out keypoints score higher
/// than the same number of clustered ones.
#[derive(Debug, Clone)]
struct VisibilityPyramid {
    width: f64,
    height: f64,
    levels: Vec<Vec<usize>>,
    score: usize,
}

impl VisibilityPyramid {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width: width.max(1) as f64,
            height: height.max(1) as f64,
            levels: (0..NUM_VISIBILITY_PYRAMID_LEVELS)
                .map(|level| vec![0; Self::side(level) * Self::side(level)])
                .collect(),
            score: 0,
        }
    }

    fn side(level: usize) -> usize {
        1 << (level + 1)
    }

    fn cell(&self, level: usize, point: &Point2<f64>) -> usize {
        let side = Self::side(level);
        let cx = ((point.x / self.width * side as f64).max(0.0) as usize).min(side - 1);
        let cy = ((point.y / self.height * side as f64).max(0.0) as usize).min(side - 1);
        cy * side + cx
    }

    fn set_point(&mut self, point: Point2<f64>) {
        for level in 0..self.levels.len() {
            let cell = self.cell(level, &point);
            self.levels[level][cell] += 1;
            if self.levels[level][cell] == 1 {
                self.score += self.levels[level].len();
            }
        }
    }

    fn reset_point(&mut self, point: Point2<f64>) {
        for level in 0..self.levels.len() {
            let cell = self.cell(level, &point);
            let count = &mut self.levels[level][cell];
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                self.score -= self.levels[level].len();
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ImageStats {
    /// For every keypoint, how many of its correspondences observe a point.
    num_correspondences_have_point3d: Vec<usize>,
    /// Number of keypoints with at least one triangulated correspondence.
    num_visible_points3d: usize,
    num_observations: usize,
    num_correspondences: usize,
    pyramid: VisibilityPyramid,
}

/// Triangulation progress between two images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePairStats {
    /// Correspondences whose keypoints both observe the same point.
    pub num_tri_corrs: usize,
    pub num_total_corrs: usize,
}

/// Owns a [`Reconstruction`] and performs structural edits on it while keeping the correspondence
/// statistics used to rank images up to date.
///
/// Without a correspondence graph the statistics are not maintained and only the edits and
/// filters are available.
#[derive(Debug, Clone)]
pub struct ObservationManager {
    reconstruction: Reconstruction,
    correspondence_graph: Option<Arc<CorrespondenceGraph>>,
    image_stats: HashMap<ImageId, ImageStats>,
    image_pair_stats: HashMap<ImagePair, ImagePairStats>,
}

impl ObservationManager {
    pub fn new(
        reconstruction: Reconstruction,
        correspondence_graph: Option<Arc<CorrespondenceGraph>>,
    ) -> Self {
        let mut manager = Self {
            reconstruction,
            correspondence_graph,
            image_stats: HashMap::new(),
            image_pair_stats: HashMap::new(),
        };
        let Some(graph) = manager.correspondence_graph.clone() else {
            return manager;
        };

        for (pair, num_total_corrs) in graph.image_pairs() {
            manager.image_pair_stats.insert(
                pair,
                ImagePairStats {
                    num_tri_corrs: 0,
                    num_total_corrs,
                },
            );
        }
        for (image_id, image) in manager.reconstruction.images() {
            if !graph.exists_image(image_id) {
                continue;
            }
            let camera = manager.reconstruction.camera(image.camera_id);
            manager.image_stats.insert(
                image_id,
                ImageStats {
                    num_correspondences_have_point3d: vec![0; image.num_points2d()],
                    num_visible_points3d: 0,
                    num_observations: graph.num_observations_for_image(image_id),
                    num_correspondences: graph.num_correspondences_for_image(image_id),
                    pyramid: VisibilityPyramid::new(camera.width, camera.height),
                },
            );
        }
        let triangulated: Vec<(ImageId, usize)> = manager
            .reconstruction
            .images()
            .flat_map(|(image_id, image)| image.triangulated().map(move |(ix, _)| (image_id, ix)))
            .collect();
        for (image_id, point2d_idx) in triangulated {
            manager.set_observation_as_triangulated(image_id, point2d_idx, false);
        }
        manager
    }

    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    /// Direct access for edits that do not change the observations, such as updating poses.
    pub fn reconstruction_mut(&mut self) -> &mut Reconstruction {
        &mut self.reconstruction
    }

    pub fn into_reconstruction(self) -> Reconstruction {
        self.reconstruction
    }

    pub fn correspondence_graph(&self) -> Option<&Arc<CorrespondenceGraph>> {
        self.correspondence_graph.as_ref()
    }

    /// Number of keypoints of the image that have a triangulated correspondence.
    pub fn num_visible_points3d(&self, image_id: ImageId) -> usize {
        self.image_stats
            .get(&image_id)
            .map_or(0, |stats| stats.num_visible_points3d)
    }

    /// Number of keypoints of the image with at least one correspondence.
    pub fn num_observations(&self, image_id: ImageId) -> usize {
        self.image_stats
            .get(&image_id)
            .map_or(0, |stats| stats.num_observations)
    }

    pub fn num_correspondences(&self, image_id: ImageId) -> usize {
        self.image_stats
            .get(&image_id)
            .map_or(0, |stats| stats.num_correspondences)
    }

    /// Spatial coverage of the visible points in the image.
    pub fn point3d_visibility_score(&self, image_id: ImageId) -> usize {
        self.image_stats
            .get(&image_id)
            .map_or(0, |stats| stats.pyramid.score)
    }

    pub fn image_pair_stats(&self) -> &HashMap<ImagePair, ImagePairStats> {
        &self.image_pair_stats
    }

    fn set_observation_as_triangulated(
        &mut self,
        image_id: ImageId,
        point2d_idx: usize,
        is_continued_point3d: bool,
    ) {
        let Some(graph) = &self.correspondence_graph else {
            return;
        };
        let point3d_id = self.reconstruction.image(image_id).point2d(point2d_idx).point3d_id;
        for corr in graph.correspondences(image_id, point2d_idx) {
            let Some(stats) = self.image_stats.get_mut(&corr.image_id) else {
                continue;
            };
            let corr_point = self.reconstruction.image(corr.image_id).point2d(corr.point2d_idx);
            stats.num_correspondences_have_point3d[corr.point2d_idx] += 1;
            if stats.num_correspondences_have_point3d[corr.point2d_idx] == 1 {
                stats.num_visible_points3d += 1;
                stats.pyramid.set_point(corr_point.keypoint.0);
            }
            // Count each pair once, not once per direction.
            if point3d_id.is_some()
                && corr_point.point3d_id == point3d_id
                && (is_continued_point3d || image_id < corr.image_id)
            {
                self.image_pair_stats
                    .entry(ImagePair::new(image_id, corr.image_id))
                    .or_default()
                    .num_tri_corrs += 1;
            }
        }
    }

    fn reset_tri_observation(&mut self, image_id: ImageId, point2d_idx: usize, is_deleted_point3d: bool) {
        let Some(graph) = &self.correspondence_graph else {
            return;
        };
        let point3d_id = self.reconstruction.image(image_id).point2d(point2d_idx).point3d_id;
        for corr in graph.correspondences(image_id, point2d_idx) {
            let Some(stats) = self.image_stats.get_mut(&corr.image_id) else {
                continue;
            };
            let corr_point = self.reconstruction.image(corr.image_id).point2d(corr.point2d_idx);
            let count = &mut stats.num_correspondences_have_point3d[corr.point2d_idx];
            *count = count.saturating_sub(1);
            if *count == 0 {
                stats.num_visible_points3d = stats.num_visible_points3d.saturating_sub(1);
                stats.pyramid.reset_point(corr_point.keypoint.0);
            }
            if point3d_id.is_some()
                && corr_point.point3d_id == point3d_id
                && (!is_deleted_point3d || image_id < corr.image_id)
            {
                let pair = self
                    .image_pair_stats
                    .entry(ImagePair::new(image_id, corr.image_id))
                    .or_default();
                pair.num_tri_corrs = pair.num_tri_corrs.saturating_sub(1);
            }
        }
    }

    /// Adds a point. Fails without any change if the track is invalid.
    pub fn add_point3d(
        &mut self,
        position: Point3<f64>,
        track: Track,
        color: [u8; 3],
    ) -> Result<Point3DId, SceneError> {
        let elements = track.elements().to_vec();
        let point3d_id = self.reconstruction.add_point3d(position, track, color)?;
        for element in elements {
            self.set_observation_as_triangulated(element.image_id, element.point2d_idx, false);
        }
        Ok(point3d_id)
    }

    pub fn add_observation(
        &mut self,
        point3d_id: Point3DId,
        element: TrackElement,
    ) -> Result<(), SceneError> {
        self.reconstruction.add_observation(point3d_id, element)?;
        self.set_observation_as_triangulated(element.image_id, element.point2d_idx, true);
        Ok(())
    }

    pub fn delete_point3d(&mut self, point3d_id: Point3DId) -> Result<(), SceneError> {
        if !self.reconstruction.exists_point3d(point3d_id) {
            return Err(SceneError::MissingPoint3D(point3d_id));
        }
        let elements = self.reconstruction.point3d(point3d_id).track.elements().to_vec();
        for element in elements {
            self.reset_tri_observation(element.image_id, element.point2d_idx, true);
        }
        self.reconstruction.delete_point3d(point3d_id)?;
        Ok(())
    }

    /// Detaches one observation. A point left with fewer than two observations is deleted.
    pub fn delete_observation(&mut self, image_id: ImageId, point2d_idx: usize) -> Result<(), SceneError> {
        let point3d_id = self.reconstruction.observed_point3d(image_id, point2d_idx)?;
        if self.reconstruction.point3d(point3d_id).track.len() <= 2 {
            return self.delete_point3d(point3d_id);
        }
        self.reset_tri_observation(image_id, point2d_idx, false);
        self.reconstruction.delete_observation(image_id, point2d_idx)
    }

    /// Merges two points into one, see [`Reconstruction::merge_points3d`].
    pub fn merge_points3d(
        &mut self,
        point3d_id1: Point3DId,
        point3d_id2: Point3DId,
    ) -> Result<Point3DId, SceneError> {
        if point3d_id1 == point3d_id2 {
            return Err(SceneError::MergeWithItself(point3d_id1));
        }
        for point3d_id in [point3d_id1, point3d_id2] {
            if !self.reconstruction.exists_point3d(point3d_id) {
                return Err(SceneError::MissingPoint3D(point3d_id));
            }
        }
        for point3d_id in [point3d_id1, point3d_id2] {
            let elements = self.reconstruction.point3d(point3d_id).track.elements().to_vec();
            for element in elements {
                self.reset_tri_observation(element.image_id, element.point2d_idx, true);
            }
        }
        let merged = self.reconstruction.merge_points3d(point3d_id1, point3d_id2)?;
        let elements = self.reconstruction.point3d(merged).track.elements().to_vec();
        for element in elements {
            self.set_observation_as_triangulated(element.image_id, element.point2d_idx, false);
        }
        Ok(merged)
    }

    pub fn register_frame(&mut self, frame_id: FrameId) -> Result<(), SceneError> {
        self.reconstruction.register_frame(frame_id)
    }

    /// Deletes every observation made by the images of the frame, then deregisters it.
    pub fn deregister_frame(&mut self, frame_id: FrameId) -> Result<(), SceneError> {
        if !self.reconstruction.exists_frame(frame_id) {
            return Err(SceneError::MissingFrame(frame_id));
        }
        let image_ids = self.reconstruction.frame(frame_id).image_ids.clone();
        for image_id in image_ids {
            let observed: Vec<usize> = self
                .reconstruction
                .image(image_id)
                .triangulated()
                .map(|(ix, _)| ix)
                .collect();
            for point2d_idx in observed {
                // An earlier deletion may have taken the point along with it.
                if self.reconstruction.image(image_id).point2d(point2d_idx).has_point3d() {
                    self.delete_observation(image_id, point2d_idx)?;
                }
            }
        }
        self.reconstruction.deregister_frame(frame_id)
    }

    /// Filters the given points by reprojection error and triangulation angle.
    ///
    /// Observations with a pixel error above `max_reproj_error` (or behind their camera) are
    /// deleted first. A point left with fewer than two observations is deleted entirely. Then every
    /// surviving point whose largest triangulation angle over all pairs of observing cameras is below
    /// `min_tri_angle` degrees is deleted. Returns the number of deleted observations.
    pub fn filter_points3d(
        &mut self,
        max_reproj_error: f64,
        min_tri_angle: f64,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> usize {
        let num_filtered = self.filter_points3d_with_large_reprojection_error(max_reproj_error, point3d_ids)
            + self.filter_points3d_with_small_triangulation_angle(min_tri_angle, point3d_ids);
        if num_filtered > 0 {
            debug!("filtered {} observations", num_filtered);
        }
        num_filtered
    }

    /// Filters every point observed by any of the images.
    pub fn filter_points3d_in_images(
        &mut self,
        max_reproj_error: f64,
        min_tri_angle: f64,
        image_ids: &BTreeSet<ImageId>,
    ) -> usize {
        let point3d_ids: BTreeSet<Point3DId> = image_ids
            .iter()
            .filter(|&&id| self.reconstruction.exists_image(id))
            .flat_map(|&id| self.reconstruction.image(id).triangulated().map(|(_, p)| p))
            .collect();
        self.filter_points3d(max_reproj_error, min_tri_angle, &point3d_ids)
    }

    pub fn filter_all_points3d(&mut self, max_reproj_error: f64, min_tri_angle: f64) -> usize {
        let point3d_ids = self.reconstruction.point3d_ids().into_iter().collect();
        self.filter_points3d(max_reproj_error, min_tri_angle, &point3d_ids)
    }

    fn filter_points3d_with_large_reprojection_error(
        &mut self,
        max_reproj_error: f64,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> usize {
        let mut num_filtered = 0;
        for &point3d_id in point3d_ids {
            if !self.reconstruction.exists_point3d(point3d_id) {
                continue;
            }
            let errors = self.reconstruction.observation_errors(point3d_id);
            let (outliers, inliers): (Vec<_>, Vec<_>) =
                errors.iter().partition(|&&(_, error)| error > max_reproj_error);
            if outliers.is_empty() {
                let mean = inliers.iter().map(|&&(_, e)| e).sum::<f64>() / inliers.len() as f64;
                self.reconstruction.point3d_mut(point3d_id).error = Some(mean);
                continue;
            }
            if outliers.len() + 1 >= errors.len() {
                num_filtered += errors.len();
                log_failed_edit(self.delete_point3d(point3d_id));
                continue;
            }
            num_filtered += outliers.len();
            for &&(element, _) in &outliers {
                log_failed_edit(self.delete_observation(element.image_id, element.point2d_idx));
            }
            let mean = inliers.iter().map(|&&(_, e)| e).sum::<f64>() / inliers.len() as f64;
            self.reconstruction.point3d_mut(point3d_id).error = Some(mean);
        }
        num_filtered
    }

    fn filter_points3d_with_small_triangulation_angle(
        &mut self,
        min_tri_angle: f64,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> usize {
        let min_tri_angle = min_tri_angle.to_radians();
        let mut num_filtered = 0;
        for &point3d_id in point3d_ids {
            if !self.reconstruction.exists_point3d(point3d_id) {
                continue;
            }
            let point3d = self.reconstruction.point3d(point3d_id);
            let centers: Vec<Point3<f64>> = point3d
                .track
                .iter()
                .filter_map(|element| self.reconstruction.cam_from_world(element.image_id))
                .map(|pose| pose.center())
                .collect();
            let keep = centers.iter().enumerate().any(|(i, c1)| {
                centers[i + 1..]
                    .iter()
                    .any(|c2| triangulation_angle(c1, c2, &point3d.position) >= min_tri_angle)
            });
            if !keep {
                num_filtered += point3d.track.len();
                log_failed_edit(self.delete_point3d(point3d_id));
            }
        }
        num_filtered
    }

    /// Deletes every observation whose point lies behind the observing camera.
    pub fn filter_observations_with_negative_depth(&mut self) -> usize {
        let mut num_filtered = 0;
        for point3d_id in self.reconstruction.point3d_ids() {
            if !self.reconstruction.exists_point3d(point3d_id) {
                continue;
            }
            let point3d = self.reconstruction.point3d(point3d_id);
            let behind: Vec<TrackElement> = point3d
                .track
                .iter()
                .filter(|element| {
                    self.reconstruction
                        .cam_from_world(element.image_id)
                        .map_or(true, |pose| {
                            pose.transform_point(&point3d.position).z < f64::EPSILON
                        })
                })
                .collect();
            for element in behind {
                if !self.reconstruction.exists_point3d(point3d_id) {
                    break;
                }
                let track_len = self.reconstruction.point3d(point3d_id).track.len();
                match self.delete_observation(element.image_id, element.point2d_idx) {
                    // Deleting from a two element track deletes the whole point.
                    Ok(()) => num_filtered += if track_len <= 2 { track_len } else { 1 },
                    Err(e) => error!("inconsistent observation edit: {}", e),
                }
            }
        }
        num_filtered
    }

    /// Deregisters every registered frame with implausible intrinsics or without any observation.
    ///
    /// Returns the deregistered frames.
    pub fn filter_frames(
        &mut self,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> Vec<FrameId> {
        let filtered: Vec<FrameId> = self
            .reconstruction
            .reg_frame_ids()
            .into_iter()
            .filter(|&frame_id| {
                let frame = self.reconstruction.frame(frame_id);
                let num_points3d: usize = frame
                    .image_ids
                    .iter()
                    .map(|&id| self.reconstruction.image(id).num_points3d())
                    .sum();
                let bogus = frame.image_ids.iter().any(|&id| {
                    self.reconstruction
                        .camera(self.reconstruction.image(id).camera_id)
                        .has_bogus_params(
                            min_focal_length_ratio,
                            max_focal_length_ratio,
                            max_extra_param,
                        )
                });
                num_points3d == 0 || bogus
            })
            .collect();
        for &frame_id in &filtered {
            log_failed_edit(self.deregister_frame(frame_id));
        }
        filtered
    }
}

/// Errors here come from ids that were read from the model a moment ago.
fn log_failed_edit(result: Result<(), SceneError>) {
    if let Err(e) = result {
        error!("inconsistent observation edit: {}", e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconstruction::test::three_view_scene;

    fn full_graph(reconstruction: &Reconstruction) -> Arc<CorrespondenceGraph> {
        let mut graph = CorrespondenceGraph::new();
        for (image_id, image) in reconstruction.images() {
            graph.add_image(image_id, image.num_points2d());
        }
        let image_ids: Vec<ImageId> = reconstruction.images().map(|(id, _)| id).collect();
        for (i, &a) in image_ids.iter().enumerate() {
            for &b in &image_ids[i + 1..] {
                let matches: Vec<(usize, usize)> = (0..10).map(|k| (k, k)).collect();
                graph.add_correspondences(a, b, &matches).unwrap();
            }
        }
        graph.finalize();
        Arc::new(graph)
    }

    fn track(elements: &[(u32, usize)]) -> Track {
        elements
            .iter()
            .map(|&(image, idx)| TrackElement::new(ImageId(image), idx))
            .collect()
    }

    fn manager() -> ObservationManager {
        let reconstruction = three_view_scene();
        let graph = full_graph(&reconstruction);
        ObservationManager::new(reconstruction, Some(graph))
    }

    #[test]
    fn statistics_follow_edits() {
        let mut manager = manager();
        assert_eq!(manager.num_observations(ImageId(3)), 10);
        assert_eq!(manager.num_correspondences(ImageId(3)), 30);

        let id = manager
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track(&[(0, 0), (1, 0)]), [0; 3])
            .unwrap();
        assert_eq!(manager.num_visible_points3d(ImageId(3)), 1);
        assert_eq!(manager.num_visible_points3d(ImageId(0)), 1);
        assert!(manager.point3d_visibility_score(ImageId(3)) > 0);
        let stats = manager.image_pair_stats();
        assert_eq!(stats[&ImagePair::new(ImageId(0), ImageId(1))].num_tri_corrs, 1);
        assert_eq!(stats[&ImagePair::new(ImageId(0), ImageId(1))].num_total_corrs, 10);

        manager
            .add_observation(id, TrackElement::new(ImageId(2), 0))
            .unwrap();
        let stats = manager.image_pair_stats();
        assert_eq!(stats[&ImagePair::new(ImageId(0), ImageId(2))].num_tri_corrs, 1);
        assert_eq!(stats[&ImagePair::new(ImageId(1), ImageId(2))].num_tri_corrs, 1);
        assert_eq!(manager.num_visible_points3d(ImageId(3)), 1);

        manager.delete_point3d(id).unwrap();
        assert_eq!(manager.num_visible_points3d(ImageId(3)), 0);
        assert_eq!(manager.point3d_visibility_score(ImageId(3)), 0);
        assert!(manager
            .image_pair_stats()
            .values()
            .all(|stats| stats.num_tri_corrs == 0));
    }

    #[test]
    fn filtering_is_idempotent() {
        let mut manager = manager();
        let good = manager
            .add_point3d(
                Point3::new(-1.0, -0.3, 5.0),
                track(&[(0, 0), (1, 0), (2, 0)]),
                [0; 3],
            )
            .unwrap();
        let partly_bad = manager
            .add_point3d(
                Point3::new(-0.8, 0.0, 5.0),
                track(&[(0, 1), (1, 1), (2, 2)]),
                [0; 3],
            )
            .unwrap();
        let bad = manager
            .add_point3d(
                Point3::new(0.0, 0.0, 1000.0),
                track(&[(0, 3), (1, 3), (2, 3)]),
                [0; 3],
            )
            .unwrap();

        assert_eq!(manager.filter_all_points3d(4.0, 1.5), 4);
        let reconstruction = manager.reconstruction();
        assert!(reconstruction.exists_point3d(good));
        assert_eq!(reconstruction.point3d(partly_bad).track.len(), 2);
        assert!(!reconstruction.exists_point3d(bad));
        assert!(reconstruction.check_consistency());

        let num_observations = reconstruction.compute_num_observations();
        assert_eq!(manager.filter_all_points3d(4.0, 1.5), 0);
        assert_eq!(manager.reconstruction().compute_num_observations(), num_observations);
        assert_eq!(manager.reconstruction().num_points3d(), 2);
    }

    #[test]
    fn small_angles_are_filtered() {
        let mut manager = ObservationManager::new(three_view_scene(), None);
        manager
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track(&[(0, 0), (1, 0)]), [0; 3])
            .unwrap();
        // Baseline of 0.5 at a depth of 5 is about 5.7 degrees.
        assert_eq!(manager.filter_all_points3d(4.0, 10.0), 2);
        assert_eq!(manager.reconstruction().num_points3d(), 0);
    }

    #[test]
    fn observations_behind_cameras_are_removed() {
        let mut manager = ObservationManager::new(three_view_scene(), None);
        manager
            .add_point3d(Point3::new(0.0, 0.0, -5.0), track(&[(0, 5), (1, 5), (2, 5)]), [0; 3])
            .unwrap();
        let visible = manager
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track(&[(0, 0), (1, 0)]), [0; 3])
            .unwrap();
        // Every observation of the point behind the cameras counts, including the last two
        // that go away together with the point.
        assert_eq!(manager.filter_observations_with_negative_depth(), 3);
        assert_eq!(manager.reconstruction().num_points3d(), 1);
        assert!(manager.reconstruction().exists_point3d(visible));
        assert!(manager.reconstruction().check_consistency());
    }

    #[test]
    fn deregistering_a_frame_removes_its_observations() {
        let mut manager = manager();
        let id = manager
            .add_point3d(
                Point3::new(-1.0, -0.3, 5.0),
                track(&[(0, 0), (1, 0), (2, 0)]),
                [0; 3],
            )
            .unwrap();
        manager.deregister_frame(FrameId(2)).unwrap();
        assert_eq!(manager.reconstruction().point3d(id).track.len(), 2);
        assert!(!manager.reconstruction().is_image_registered(ImageId(2)));
        assert_eq!(manager.filter_frames(0.1, 10.0, 1.0), vec![]);
    }
}
