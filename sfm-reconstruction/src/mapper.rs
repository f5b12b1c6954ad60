use crate::{
    pose_estimation::{estimate_and_refine_absolute_pose, estimate_relative_pose, AbsolutePoseEstimationOptions},
    BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentGauge, BundleAdjustmentOptions, CameraId,
    DatabaseCache, FrameId, ImageId, ImagePair, ImageSelectionMethod, IncrementalMapperOptions,
    IncrementalTriangulator, IncrementalTriangulatorOptions, ObservationManager, Point3DId,
    PosePrior, Reconstruction, SceneError, TrackElement, TwoViewGeometryConfig,
};
use float_ord::FloatOrd;
use log::*;
use rayon::prelude::*;
use sfm_core::{nalgebra::Point3, CameraToCamera, KeyPoint, Pose, WorldToCamera};
use sfm_geom::{triangulation::triangulation_angles, two_view::median};
use sfm_optimize::{
    AbsolutePoseRefinementOptions, BundleAdjustmentSummary, BundleAdjustmentTermination,
    IterationCallback, LossFunction, StopToken,
};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Frames are only filtered once the model has this many registered frames, since the intrinsics
/// still change a lot before that.
const MIN_NUM_REG_FRAMES_FOR_FILTERING: usize = 20;

/// Pairs of (divisor of the minimum triangulation angle, minimum overlap ratio) tried in turn when
/// selecting the images of a local bundle.
const LOCAL_BUNDLE_SELECTION: [(f64, f64); 6] = [
    (1.0, 0.6),
    (1.5, 0.5),
    (2.0, 0.4),
    (2.5, 0.3),
    (3.0, 0.2),
    (4.0, 0.1),
];

/// The stage the mapper is in for the current reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapperState {
    /// No reconstruction was started yet.
    Uninitialized,
    /// A reconstruction was started but has no registered frames.
    Initializing,
    Registering,
    Triangulating,
    BundleAdjusting,
    Filtering,
    /// The last reconstruction was kept.
    Completed,
    /// The last reconstruction was discarded.
    Failed,
}

/// Two images and their relative pose, ready to seed a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialImagePair {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub cam2_from_cam1: CameraToCamera,
}

/// What one local bundle adjustment changed, in observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBundleAdjustmentReport {
    pub num_merged_observations: usize,
    pub num_completed_observations: usize,
    pub num_filtered_observations: usize,
    pub num_adjusted_observations: usize,
    /// How the solver ended, or `None` if the image had no local bundle.
    pub termination: Option<BundleAdjustmentTermination>,
}

impl LocalBundleAdjustmentReport {
    /// Share of the adjusted observations that were merged, completed or filtered afterwards.
    pub fn changed_ratio(&self) -> f64 {
        if self.num_adjusted_observations == 0 {
            return 0.0;
        }
        (self.num_merged_observations
            + self.num_completed_observations
            + self.num_filtered_observations) as f64
            / self.num_adjusted_observations as f64
    }
}

/// State that only lives as long as one reconstruction.
#[derive(Debug)]
struct ActiveReconstruction {
    obs_manager: ObservationManager,
    triangulator: IncrementalTriangulator,
    /// Frames that were registered before the reconstruction was started.
    existing_frame_ids: BTreeSet<FrameId>,
    filtered_frames: HashSet<FrameId>,
    num_reg_trials: HashMap<ImageId, usize>,
}

/// Grows reconstructions one image at a time.
///
/// The mapper works on one reconstruction at a time, between [`IncrementalMapper::begin_reconstruction`]
/// and [`IncrementalMapper::end_reconstruction`]. Statistics that decide where the next
/// reconstruction may start, like which images were already registered elsewhere and which initial
/// pairs were tried, live across reconstructions.
#[derive(Debug)]
pub struct IncrementalMapper {
    database_cache: Arc<DatabaseCache>,
    active: Option<ActiveReconstruction>,
    state: MapperState,
    stop_token: Option<StopToken>,
    init_num_reg_trials: HashMap<ImageId, usize>,
    init_image_pairs: HashSet<ImagePair>,
    /// In how many reconstructions each image is registered, including the active one.
    num_registrations: HashMap<ImageId, usize>,
}

impl IncrementalMapper {
    pub fn new(database_cache: Arc<DatabaseCache>) -> Self {
        Self {
            database_cache,
            active: None,
            state: MapperState::Uninitialized,
            stop_token: None,
            init_num_reg_trials: HashMap::new(),
            init_image_pairs: HashSet::new(),
            num_registrations: HashMap::new(),
        }
    }

    /// Bundle adjustments stop early once the token is stopped.
    pub fn set_stop_token(&mut self, stop_token: StopToken) {
        self.stop_token = Some(stop_token);
    }

    pub fn state(&self) -> MapperState {
        self.state
    }

    pub fn database_cache(&self) -> &Arc<DatabaseCache> {
        &self.database_cache
    }

    pub fn observation_manager(&self) -> Result<&ObservationManager, SceneError> {
        Ok(&self.active()?.obs_manager)
    }

    pub fn reconstruction(&self) -> Result<&Reconstruction, SceneError> {
        Ok(self.active()?.obs_manager.reconstruction())
    }

    /// Direct access to the model for edits that do not change its structure, like transforms
    /// and colors.
    pub fn reconstruction_mut(&mut self) -> Result<&mut Reconstruction, SceneError> {
        Ok(self.active_mut()?.obs_manager.reconstruction_mut())
    }

    fn active(&self) -> Result<&ActiveReconstruction, SceneError> {
        self.active.as_ref().ok_or(SceneError::NoActiveReconstruction)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveReconstruction, SceneError> {
        self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)
    }

    /// Starts working on a reconstruction, which may already contain registered frames.
    ///
    /// Cameras, frames and images of the database that the reconstruction lacks are added.
    pub fn begin_reconstruction(&mut self, mut reconstruction: Reconstruction) -> Result<(), SceneError> {
        if self.active.is_some() {
            return Err(SceneError::ReconstructionInProgress);
        }
        self.database_cache.setup_reconstruction(&mut reconstruction)?;
        for image_id in reconstruction.reg_image_ids() {
            *self.num_registrations.entry(image_id).or_default() += 1;
        }
        let existing_frame_ids: BTreeSet<FrameId> = reconstruction.reg_frame_ids().into_iter().collect();
        self.state = if existing_frame_ids.is_empty() {
            MapperState::Initializing
        } else {
            MapperState::Registering
        };
        info!(
            "beginning reconstruction with {} registered frames",
            existing_frame_ids.len()
        );
        let graph = self.database_cache.correspondence_graph().clone();
        self.active = Some(ActiveReconstruction {
            obs_manager: ObservationManager::new(reconstruction, Some(graph.clone())),
            triangulator: IncrementalTriangulator::new(graph),
            existing_frame_ids,
            filtered_frames: HashSet::new(),
            num_reg_trials: HashMap::new(),
        });
        Ok(())
    }

    /// Finishes the current reconstruction and hands it back.
    ///
    /// A discarded reconstruction no longer counts towards the registrations of its images.
    pub fn end_reconstruction(&mut self, discard: bool) -> Result<Reconstruction, SceneError> {
        let active = self.active.take().ok_or(SceneError::NoActiveReconstruction)?;
        let reconstruction = active.obs_manager.into_reconstruction();
        if discard {
            for image_id in reconstruction.reg_image_ids() {
                if let Some(count) = self.num_registrations.get_mut(&image_id) {
                    *count = count.saturating_sub(1);
                }
            }
            self.state = MapperState::Failed;
        } else {
            self.state = MapperState::Completed;
        }
        info!(
            "{} reconstruction with {} registered frames and {} points",
            if discard { "discarding" } else { "keeping" },
            reconstruction.num_reg_frames(),
            reconstruction.num_points3d()
        );
        Ok(reconstruction)
    }

    /// Searches for an initial pair that has not been tried yet.
    ///
    /// When one of the images is given, only pairs containing it are considered.
    pub fn find_initial_image_pair(
        &mut self,
        options: &IncrementalMapperOptions,
        image_id1: Option<ImageId>,
        image_id2: Option<ImageId>,
    ) -> Result<Option<InitialImagePair>, SceneError> {
        let reconstruction = self.reconstruction()?;
        let first_images = match (image_id1, image_id2) {
            (Some(image_id), None) | (None, Some(image_id)) => {
                if !reconstruction.exists_image(image_id) {
                    return Ok(None);
                }
                vec![image_id]
            }
            _ => self.find_first_initial_images(options)?,
        };

        for image_id1 in first_images {
            for image_id2 in self.find_second_initial_images(options, image_id1)? {
                if !self.init_image_pairs.insert(ImagePair::new(image_id1, image_id2)) {
                    continue;
                }
                if let Some(cam2_from_cam1) =
                    self.estimate_initial_two_view_geometry(options, image_id1, image_id2)?
                {
                    return Ok(Some(InitialImagePair {
                        image_id1,
                        image_id2,
                        cam2_from_cam1,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Unregistered images with correspondences, most correspondences first.
    fn find_first_initial_images(
        &self,
        options: &IncrementalMapperOptions,
    ) -> Result<Vec<ImageId>, SceneError> {
        let active = self.active()?;
        let mut candidates: Vec<(ImageId, usize)> = active
            .obs_manager
            .reconstruction()
            .images()
            .map(|(image_id, _)| (image_id, active.obs_manager.num_correspondences(image_id)))
            .filter(|&(image_id, num_correspondences)| {
                num_correspondences > 0
                    && self.init_num_reg_trials.get(&image_id).copied().unwrap_or(0)
                        < options.init_max_reg_trials
                    && self.num_registrations(image_id) == 0
            })
            .collect();
        candidates.sort_by_key(|&(image_id, num)| (Reverse(num), image_id));
        Ok(candidates.into_iter().map(|(image_id, _)| image_id).collect())
    }

    /// Images not registered anywhere that share enough correspondences with `image_id1`.
    fn find_second_initial_images(
        &self,
        options: &IncrementalMapperOptions,
        image_id1: ImageId,
    ) -> Result<Vec<ImageId>, SceneError> {
        let reconstruction = self.reconstruction()?;
        let graph = self.database_cache.correspondence_graph();
        let mut num_correspondences: HashMap<ImageId, usize> = HashMap::new();
        for point2d_idx in 0..reconstruction.image(image_id1).num_points2d() {
            for corr in graph.correspondences(image_id1, point2d_idx) {
                if self.num_registrations(corr.image_id) == 0 {
                    *num_correspondences.entry(corr.image_id).or_default() += 1;
                }
            }
        }
        let mut candidates: Vec<(ImageId, usize)> = num_correspondences
            .into_iter()
            .filter(|&(_, num)| num >= options.init_min_num_inliers)
            .collect();
        candidates.sort_by_key(|&(image_id, num)| (Reverse(num), image_id));
        Ok(candidates.into_iter().map(|(image_id, _)| image_id).collect())
    }

    /// The relative pose of two images if it is good enough to seed a reconstruction.
    ///
    /// The pair needs enough inliers, a large enough median triangulation angle and must not move
    /// mostly along the viewing direction.
    pub fn estimate_initial_two_view_geometry(
        &self,
        options: &IncrementalMapperOptions,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<Option<CameraToCamera>, SceneError> {
        let reconstruction = self.reconstruction()?;
        for image_id in [image_id1, image_id2] {
            if !reconstruction.exists_image(image_id) {
                return Err(SceneError::MissingImage(image_id));
            }
        }
        let Some(geometry) = self.database_cache.two_view_geometry(image_id1, image_id2) else {
            return Ok(None);
        };
        if matches!(
            geometry.config,
            TwoViewGeometryConfig::Degenerate | TwoViewGeometryConfig::MultipleDegenerate
        ) {
            return Ok(None);
        }

        let image1 = reconstruction.image(image_id1);
        let image2 = reconstruction.image(image_id2);
        let keypoints1: Vec<KeyPoint> = image1.points2d().iter().map(|p| p.keypoint).collect();
        let keypoints2: Vec<KeyPoint> = image2.points2d().iter().map(|p| p.keypoint).collect();
        let Some(two_view) = estimate_relative_pose(
            reconstruction.camera(image1.camera_id),
            reconstruction.camera(image2.camera_id),
            &keypoints1,
            &keypoints2,
            &geometry.inlier_matches,
            geometry.cam2_from_cam1,
            options.init_max_error,
            options.random_seed,
        ) else {
            debug!("no relative pose between {} and {}", image_id1, image_id2);
            return Ok(None);
        };

        let forward_motion = two_view.cam2_from_cam1.0.translation.vector.z.abs();
        let accepted = two_view.inliers.len() >= options.init_min_num_inliers
            && forward_motion < options.init_max_forward_motion
            && two_view.tri_angle > options.init_min_tri_angle.to_radians();
        debug!(
            "initial pair {} and {}: {} inliers, forward motion {:.3}, angle {:.2} deg, {}",
            image_id1,
            image_id2,
            two_view.inliers.len(),
            forward_motion,
            two_view.tri_angle.to_degrees(),
            if accepted { "accepted" } else { "rejected" }
        );
        Ok(accepted.then_some(two_view.cam2_from_cam1))
    }

    /// Places the first image at the origin and the second at the relative pose, then registers
    /// both frames. Points are added by triangulating the two images afterwards.
    pub fn register_initial_image_pair(
        &mut self,
        _options: &IncrementalMapperOptions,
        pair: &InitialImagePair,
    ) -> Result<(), SceneError> {
        let active = self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)?;
        let reconstruction = active.obs_manager.reconstruction();
        let mut frame_ids = vec![];
        for image_id in [pair.image_id1, pair.image_id2] {
            if !reconstruction.exists_image(image_id) {
                return Err(SceneError::MissingImage(image_id));
            }
            let frame_id = reconstruction.image(image_id).frame_id;
            if reconstruction.frame(frame_id).registered || frame_ids.contains(&frame_id) {
                return Err(SceneError::FrameAlreadyRegistered(frame_id));
            }
            frame_ids.push(frame_id);
        }

        self.init_image_pairs
            .insert(ImagePair::new(pair.image_id1, pair.image_id2));
        for image_id in [pair.image_id1, pair.image_id2] {
            *self.init_num_reg_trials.entry(image_id).or_default() += 1;
            *active.num_reg_trials.entry(image_id).or_default() += 1;
        }

        let reconstruction = active.obs_manager.reconstruction_mut();
        reconstruction.set_cam_from_world(pair.image_id1, WorldToCamera::identity())?;
        reconstruction.set_cam_from_world(pair.image_id2, WorldToCamera(pair.cam2_from_cam1.0))?;
        for frame_id in frame_ids {
            active.obs_manager.register_frame(frame_id)?;
            let image_ids = active.obs_manager.reconstruction().frame(frame_id).image_ids.clone();
            for image_id in image_ids {
                *self.num_registrations.entry(image_id).or_default() += 1;
            }
        }
        self.state = MapperState::Registering;
        Ok(())
    }

    /// Unregistered images that see enough triangulated points, best candidates first.
    ///
    /// Images that were never tried come before images that failed before or whose frame was
    /// filtered. Images that failed `max_reg_trials` times are left out.
    pub fn find_next_images(&self, options: &IncrementalMapperOptions) -> Result<Vec<ImageId>, SceneError> {
        let active = self.active()?;
        let obs_manager = &active.obs_manager;
        let reconstruction = obs_manager.reconstruction();
        let candidates: Vec<(ImageId, FrameId)> = reconstruction
            .images()
            .filter(|(_, image)| !reconstruction.frame(image.frame_id).registered)
            .map(|(image_id, image)| (image_id, image.frame_id))
            .collect();

        let ranked: Vec<(ImageId, f64, bool)> = candidates
            .par_iter()
            .filter_map(|&(image_id, frame_id)| {
                let num_visible = obs_manager.num_visible_points3d(image_id);
                if num_visible < options.abs_pose_min_num_inliers {
                    return None;
                }
                let num_trials = active.num_reg_trials.get(&image_id).copied().unwrap_or(0);
                if num_trials >= options.max_reg_trials {
                    return None;
                }
                let rank = match options.image_selection_method {
                    ImageSelectionMethod::MaxVisiblePointsNum => num_visible as f64,
                    ImageSelectionMethod::MaxVisiblePointsRatio => {
                        num_visible as f64 / obs_manager.num_observations(image_id).max(1) as f64
                    }
                    ImageSelectionMethod::MinUncertainty => {
                        obs_manager.point3d_visibility_score(image_id) as f64
                    }
                };
                let fresh = num_trials == 0 && !active.filtered_frames.contains(&frame_id);
                Some((image_id, rank, fresh))
            })
            .collect();

        let (mut fresh, mut retried): (Vec<_>, Vec<_>) =
            ranked.into_iter().partition(|&(_, _, fresh)| fresh);
        for list in [&mut fresh, &mut retried] {
            list.sort_by_key(|&(image_id, rank, _)| (Reverse(FloatOrd(rank)), image_id));
        }
        Ok(fresh
            .into_iter()
            .chain(retried)
            .map(|(image_id, _, _)| image_id)
            .collect())
    }

    /// Estimates the pose of an unregistered image from its correspondences to triangulated
    /// points and registers its frame.
    ///
    /// Returns `false` if the pose could not be estimated or had too little support. The inlier
    /// keypoints are added to the tracks of their points.
    pub fn register_next_image(
        &mut self,
        options: &IncrementalMapperOptions,
        image_id: ImageId,
    ) -> Result<bool, SceneError> {
        let graph = self.database_cache.correspondence_graph().clone();
        let active = self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)?;
        let reconstruction = active.obs_manager.reconstruction();
        if !reconstruction.exists_image(image_id) {
            return Err(SceneError::MissingImage(image_id));
        }
        let image = reconstruction.image(image_id);
        let (camera_id, frame_id) = (image.camera_id, image.frame_id);
        if reconstruction.frame(frame_id).registered {
            return Err(SceneError::FrameAlreadyRegistered(frame_id));
        }
        *active.num_reg_trials.entry(image_id).or_default() += 1;
        if active.obs_manager.num_visible_points3d(image_id) < options.abs_pose_min_num_inliers {
            return Ok(false);
        }

        // A keypoint may correspond to several points through different images.
        let mut tri_corrs: Vec<(usize, Point3DId)> = vec![];
        for point2d_idx in 0..image.num_points2d() {
            let mut seen = HashSet::new();
            for corr in graph.correspondences(image_id, point2d_idx) {
                if !reconstruction.is_image_registered(corr.image_id) {
                    continue;
                }
                let corr_point = reconstruction.image(corr.image_id).point2d(corr.point2d_idx);
                if let Some(point3d_id) = corr_point.point3d_id {
                    if seen.insert(point3d_id) {
                        tri_corrs.push((point2d_idx, point3d_id));
                    }
                }
            }
        }
        if tri_corrs.len() < options.abs_pose_min_num_inliers {
            debug!(
                "image {} has only {} correspondences to points",
                image_id,
                tri_corrs.len()
            );
            return Ok(false);
        }

        let mut camera = reconstruction.camera(camera_id).clone();
        let camera_in_use = reconstruction
            .reg_image_ids()
            .into_iter()
            .any(|id| reconstruction.image(id).camera_id == camera_id);
        let mut refine_focal_length = options.abs_pose_refine_focal_length && !camera_in_use;
        let mut refine_extra_params = options.abs_pose_refine_extra_params && !camera_in_use;
        if camera.has_bogus_params(
            options.min_focal_length_ratio,
            options.max_focal_length_ratio,
            options.max_extra_param,
        ) {
            warn!("resetting implausible intrinsics of camera {}", camera_id);
            let focal_length = 1.2 * camera.width.max(camera.height) as f64;
            camera.params = camera.model.init_params(focal_length, camera.width, camera.height);
            refine_focal_length = true;
            refine_extra_params = true;
        }

        let keypoints: Vec<KeyPoint> = tri_corrs
            .iter()
            .map(|&(point2d_idx, _)| image.point2d(point2d_idx).keypoint)
            .collect();
        let points: Vec<Point3<f64>> = tri_corrs
            .iter()
            .map(|&(_, point3d_id)| reconstruction.point3d(point3d_id).position)
            .collect();
        let estimation = AbsolutePoseEstimationOptions {
            max_error: options.abs_pose_max_error,
            min_num_inliers: options.abs_pose_min_num_inliers,
            min_inlier_ratio: options.abs_pose_min_inlier_ratio,
            random_seed: options.random_seed,
        };
        let refinement = AbsolutePoseRefinementOptions {
            refine_focal_length,
            refine_extra_params,
            ..Default::default()
        };
        let Some(estimate) =
            estimate_and_refine_absolute_pose(&estimation, &refinement, &mut camera, &keypoints, &points)
        else {
            debug!("could not estimate the pose of image {}", image_id);
            return Ok(false);
        };

        let reconstruction = active.obs_manager.reconstruction_mut();
        *reconstruction.camera_mut(camera_id) = camera;
        reconstruction.set_cam_from_world(image_id, estimate.cam_from_world)?;
        active.obs_manager.register_frame(frame_id)?;
        let image_ids = active.obs_manager.reconstruction().frame(frame_id).image_ids.clone();
        for id in image_ids {
            *self.num_registrations.entry(id).or_default() += 1;
        }

        for &ix in &estimate.inliers {
            let (point2d_idx, point3d_id) = tri_corrs[ix];
            let reconstruction = active.obs_manager.reconstruction();
            if reconstruction.image(image_id).point2d(point2d_idx).has_point3d()
                || reconstruction.point3d(point3d_id).track.contains_image(image_id)
            {
                continue;
            }
            active
                .obs_manager
                .add_observation(point3d_id, TrackElement::new(image_id, point2d_idx))?;
            active.triangulator.add_modified_point3d(point3d_id);
        }
        info!(
            "registered image {} with {} of {} correspondences",
            image_id,
            estimate.inliers.len(),
            tri_corrs.len()
        );
        self.state = MapperState::Registering;
        Ok(true)
    }

    pub fn triangulate_image(
        &mut self,
        tri_options: &IncrementalTriangulatorOptions,
        image_id: ImageId,
    ) -> Result<usize, SceneError> {
        self.state = MapperState::Triangulating;
        let active = self.active_mut()?;
        Ok(active
            .triangulator
            .triangulate_image(tri_options, &mut active.obs_manager, image_id))
    }

    pub fn retriangulate(&mut self, tri_options: &IncrementalTriangulatorOptions) -> Result<usize, SceneError> {
        self.state = MapperState::Triangulating;
        let active = self.active_mut()?;
        Ok(active.triangulator.retriangulate(tri_options, &mut active.obs_manager))
    }

    pub fn complete_tracks(
        &mut self,
        tri_options: &IncrementalTriangulatorOptions,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> Result<usize, SceneError> {
        let active = self.active_mut()?;
        Ok(active
            .triangulator
            .complete_tracks(tri_options, &mut active.obs_manager, point3d_ids))
    }

    pub fn merge_tracks(
        &mut self,
        tri_options: &IncrementalTriangulatorOptions,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> Result<usize, SceneError> {
        let active = self.active_mut()?;
        Ok(active
            .triangulator
            .merge_tracks(tri_options, &mut active.obs_manager, point3d_ids))
    }

    /// Completes and then merges every track. Returns the number of changed observations.
    pub fn complete_and_merge_tracks(
        &mut self,
        tri_options: &IncrementalTriangulatorOptions,
    ) -> Result<usize, SceneError> {
        let active = self.active_mut()?;
        let num_completed = active
            .triangulator
            .complete_all_tracks(tri_options, &mut active.obs_manager);
        let num_merged = active
            .triangulator
            .merge_all_tracks(tri_options, &mut active.obs_manager);
        debug!(
            "completed {} and merged {} observations",
            num_completed, num_merged
        );
        Ok(num_completed + num_merged)
    }

    /// The registered images that share the most points with `image_id` from sufficiently
    /// different viewpoints, at most `local_ba_num_images - 1` of them.
    ///
    /// The returned images are sorted by decreasing overlap within each selection round.
    pub fn find_local_bundle(
        &self,
        options: &IncrementalMapperOptions,
        image_id: ImageId,
    ) -> Result<Vec<ImageId>, SceneError> {
        let reconstruction = self.reconstruction()?;
        let Some(cam_from_world) = reconstruction.cam_from_world(image_id) else {
            return Err(SceneError::ImageNotRegistered(image_id));
        };
        let center = cam_from_world.center();

        let point3d_ids: Vec<Point3DId> = reconstruction
            .image(image_id)
            .triangulated()
            .map(|(_, point3d_id)| point3d_id)
            .collect();
        let mut shared: HashMap<ImageId, usize> = HashMap::new();
        for &point3d_id in &point3d_ids {
            for element in reconstruction.point3d(point3d_id).track.iter() {
                if element.image_id != image_id {
                    *shared.entry(element.image_id).or_default() += 1;
                }
            }
        }
        let mut overlapping: Vec<(ImageId, usize)> = shared.into_iter().collect();
        overlapping.sort_by_key(|&(id, num)| (Reverse(num), id));

        let num_images = options.local_ba_num_images.saturating_sub(1);
        if overlapping.len() <= num_images {
            return Ok(overlapping.into_iter().map(|(id, _)| id).collect());
        }
        let max_num_shared = overlapping.first().map_or(0, |&(_, num)| num) as f64;

        let mut selected: Vec<ImageId> = vec![];
        for (divisor, min_overlap_ratio) in LOCAL_BUNDLE_SELECTION {
            let min_tri_angle = (options.local_ba_min_tri_angle / divisor).to_radians();
            for &(other_id, num_shared) in &overlapping {
                if selected.len() >= num_images {
                    break;
                }
                if selected.contains(&other_id) || (num_shared as f64) < min_overlap_ratio * max_num_shared {
                    continue;
                }
                let Some(other_center) = reconstruction.cam_from_world(other_id).map(|p| p.center()) else {
                    continue;
                };
                let shared_points: Vec<Point3<f64>> = point3d_ids
                    .iter()
                    .map(|&id| reconstruction.point3d(id))
                    .filter(|point3d| point3d.track.contains_image(other_id))
                    .map(|point3d| point3d.position)
                    .collect();
                let mut angles = triangulation_angles(&center, &other_center, &shared_points);
                if median(&mut angles) >= min_tri_angle {
                    selected.push(other_id);
                }
            }
            if selected.len() >= num_images {
                break;
            }
        }
        // Fill up with the most overlapping images.
        for &(other_id, _) in &overlapping {
            if selected.len() >= num_images {
                break;
            }
            if !selected.contains(&other_id) {
                selected.push(other_id);
            }
        }
        Ok(selected)
    }

    /// Adjusts the local bundle of `image_id` together with the given points, then merges,
    /// completes and filters the tracks around it.
    ///
    /// The two least overlapping images of the bundle fix the gauge unless pose priors are used.
    pub fn adjust_local_bundle(
        &mut self,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        image_id: ImageId,
        point3d_ids: &BTreeSet<Point3DId>,
    ) -> Result<LocalBundleAdjustmentReport, SceneError> {
        let local_bundle = self.find_local_bundle(options, image_id)?;
        let callbacks = self.callbacks();
        let active = self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)?;
        let mut report = LocalBundleAdjustmentReport::default();

        if !local_bundle.is_empty() {
            self.state = MapperState::BundleAdjusting;
            let reconstruction = active.obs_manager.reconstruction();
            let frame_of = |id: ImageId| reconstruction.image(id).frame_id;
            let mut config = BundleAdjustmentConfig::new();
            config.add_image(image_id);
            for &id in &local_bundle {
                config.add_image(id);
                if options.fix_existing_frames && active.existing_frame_ids.contains(&frame_of(id)) {
                    config.set_constant_rig_from_world(frame_of(id));
                }
            }

            let mut num_images_per_camera: HashMap<CameraId, usize> = HashMap::new();
            for &id in config.image_ids() {
                *num_images_per_camera
                    .entry(reconstruction.image(id).camera_id)
                    .or_default() += 1;
            }
            for (camera_id, num_images) in num_images_per_camera {
                if num_reg_images_for_camera(reconstruction, camera_id) > num_images {
                    config.set_constant_cam_intrinsics(camera_id);
                }
            }

            if !options.use_prior_position {
                if let [.., second, last] = local_bundle[..] {
                    config.set_constant_rig_from_world(frame_of(last));
                    let frame = frame_of(second);
                    if !options.fix_existing_frames || !active.existing_frame_ids.contains(&frame) {
                        config.set_constant_translation(
                            frame,
                            vec![largest_translation_coord(reconstruction, frame)],
                        );
                    }
                } else if let [only] = local_bundle[..] {
                    config.set_constant_rig_from_world(frame_of(only));
                    let frame = frame_of(image_id);
                    config.set_constant_translation(
                        frame,
                        vec![largest_translation_coord(reconstruction, frame)],
                    );
                }
            }

            // New and short tracks are refined even when they reach outside the bundle.
            for &point3d_id in point3d_ids {
                if reconstruction.exists_point3d(point3d_id)
                    && reconstruction.point3d(point3d_id).track.len() <= options.local_ba_max_track_length
                {
                    config.add_variable_point(point3d_id);
                }
            }

            let adjuster = bundle_adjuster(options, ba_options, config, self.database_cache.pose_priors());
            let callbacks: Vec<&dyn IterationCallback> =
                callbacks.iter().map(|c| c as &dyn IterationCallback).collect();
            let summary = adjuster.solve(active.obs_manager.reconstruction_mut(), &callbacks);
            if !summary.is_solution_usable() {
                warn!(
                    "local bundle adjustment of image {} failed after {} iterations, keeping the previous model",
                    image_id, summary.num_iterations
                );
            } else {
                debug!(
                    "local bundle adjustment of image {} with {} images: {:?} after {} iterations",
                    image_id,
                    local_bundle.len() + 1,
                    summary.termination,
                    summary.num_iterations
                );
            }
            report.num_adjusted_observations = summary.num_residuals / 2;
            report.termination = Some(summary.termination);

            report.num_merged_observations =
                active
                    .triangulator
                    .merge_tracks(tri_options, &mut active.obs_manager, point3d_ids);
            report.num_completed_observations =
                active
                    .triangulator
                    .complete_tracks(tri_options, &mut active.obs_manager, point3d_ids)
                    + active
                        .triangulator
                        .complete_image(tri_options, &mut active.obs_manager, image_id);
        }

        self.state = MapperState::Filtering;
        let image_ids: BTreeSet<ImageId> = std::iter::once(image_id).chain(local_bundle).collect();
        report.num_filtered_observations = active.obs_manager.filter_points3d_in_images(
            options.filter_max_reproj_error,
            options.filter_min_tri_angle,
            &image_ids,
        ) + active.obs_manager.filter_points3d(
            options.filter_max_reproj_error,
            options.filter_min_tri_angle,
            point3d_ids,
        );
        Ok(report)
    }

    /// Adjusts every registered frame and point, after dropping observations behind their camera.
    pub fn adjust_global_bundle(
        &mut self,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
    ) -> Result<BundleAdjustmentSummary, SceneError> {
        let callbacks = self.callbacks();
        let active = self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)?;
        let num_reg_frames = active.obs_manager.reconstruction().num_reg_frames();
        if num_reg_frames < 2 {
            return Err(SceneError::NotEnoughRegisteredFrames {
                required: 2,
                found: num_reg_frames,
            });
        }
        self.state = MapperState::BundleAdjusting;
        active.obs_manager.filter_observations_with_negative_depth();

        let reconstruction = active.obs_manager.reconstruction();
        let mut config = BundleAdjustmentConfig::new();
        for image_id in reconstruction.reg_image_ids() {
            config.add_image(image_id);
        }
        if options.fix_existing_frames {
            for &frame_id in &active.existing_frame_ids {
                if reconstruction.frame(frame_id).registered {
                    config.set_constant_rig_from_world(frame_id);
                }
            }
        }
        config.fix_gauge(BundleAdjustmentGauge::TwoCamsFromWorld);

        let adjuster = bundle_adjuster(options, ba_options, config, self.database_cache.pose_priors());
        let callbacks: Vec<&dyn IterationCallback> =
            callbacks.iter().map(|c| c as &dyn IterationCallback).collect();
        let summary = adjuster.solve(active.obs_manager.reconstruction_mut(), &callbacks);
        if summary.is_solution_usable() {
            info!(
                "global bundle adjustment of {} frames: {:?} after {} iterations",
                num_reg_frames, summary.termination, summary.num_iterations
            );
        } else {
            warn!(
                "global bundle adjustment of {} frames failed after {} iterations, keeping the previous model",
                num_reg_frames, summary.num_iterations
            );
        }
        Ok(summary)
    }

    /// Repeats local bundle adjustment of the modified points until few observations change.
    ///
    /// Only the first iteration uses the robust loss of `ba_options`.
    #[allow(clippy::too_many_arguments)]
    pub fn iterative_local_refinement(
        &mut self,
        max_num_refinements: usize,
        max_refinement_change: f64,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        image_id: ImageId,
    ) -> Result<(), SceneError> {
        let mut ba_options = *ba_options;
        for _ in 0..max_num_refinements {
            let point3d_ids = {
                let active = self.active()?;
                active
                    .triangulator
                    .modified_points3d(active.obs_manager.reconstruction())
            };
            let report =
                self.adjust_local_bundle(options, &ba_options, tri_options, image_id, &point3d_ids)?;
            debug!(
                "local refinement: {} merged, {} completed, {} filtered of {} observations",
                report.num_merged_observations,
                report.num_completed_observations,
                report.num_filtered_observations,
                report.num_adjusted_observations
            );
            if report.changed_ratio() < max_refinement_change {
                break;
            }
            ba_options.loss_function = LossFunction::Trivial;
        }
        self.active_mut()?.triangulator.clear_modified_points3d();
        Ok(())
    }

    /// Completes, merges and re-triangulates tracks, then repeats global bundle adjustment and
    /// filtering until few observations change.
    ///
    /// With `normalize_reconstruction` the model is rescaled after every adjustment, unless pose
    /// priors or fixed frames define the frame of reference.
    #[allow(clippy::too_many_arguments)]
    pub fn iterative_global_refinement(
        &mut self,
        max_num_refinements: usize,
        max_refinement_change: f64,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        normalize_reconstruction: bool,
    ) -> Result<(), SceneError> {
        self.complete_and_merge_tracks(tri_options)?;
        let num_retriangulated = self.retriangulate(tri_options)?;
        debug!("retriangulated {} observations", num_retriangulated);
        for _ in 0..max_num_refinements {
            let num_observations = self.reconstruction()?.compute_num_observations();
            self.adjust_global_bundle(options, ba_options)?;
            if normalize_reconstruction && !options.use_prior_position && !options.fix_existing_frames {
                self.reconstruction_mut()?.normalize(10.0, 0.1, 0.9, true);
            }
            let num_changed = self.complete_and_merge_tracks(tri_options)? + self.filter_points(options)?;
            let changed = if num_observations == 0 {
                0.0
            } else {
                num_changed as f64 / num_observations as f64
            };
            debug!("global refinement changed {:.4} of the observations", changed);
            if changed < max_refinement_change {
                break;
            }
        }
        self.active_mut()?.triangulator.clear_modified_points3d();
        Ok(())
    }

    /// Filters every point by reprojection error and triangulation angle.
    pub fn filter_points(&mut self, options: &IncrementalMapperOptions) -> Result<usize, SceneError> {
        self.state = MapperState::Filtering;
        let active = self.active_mut()?;
        Ok(active
            .obs_manager
            .filter_all_points3d(options.filter_max_reproj_error, options.filter_min_tri_angle))
    }

    /// Deregisters frames with implausible intrinsics or without observations.
    ///
    /// Nothing is filtered while the model is small.
    pub fn filter_frames(&mut self, options: &IncrementalMapperOptions) -> Result<usize, SceneError> {
        self.state = MapperState::Filtering;
        let active = self.active.as_mut().ok_or(SceneError::NoActiveReconstruction)?;
        if active.obs_manager.reconstruction().num_reg_frames() < MIN_NUM_REG_FRAMES_FOR_FILTERING {
            return Ok(0);
        }
        let filtered = active.obs_manager.filter_frames(
            options.min_focal_length_ratio,
            options.max_focal_length_ratio,
            options.max_extra_param,
        );
        for &frame_id in &filtered {
            active.filtered_frames.insert(frame_id);
            for &image_id in &active.obs_manager.reconstruction().frame(frame_id).image_ids {
                if let Some(count) = self.num_registrations.get_mut(&image_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        if !filtered.is_empty() {
            info!("filtered {} frames", filtered.len());
        }
        Ok(filtered.len())
    }

    /// Forgets which initial pairs were tried, so that relaxed thresholds can try them again.
    pub fn reset_initialization_stats(&mut self) {
        self.init_num_reg_trials.clear();
        self.init_image_pairs.clear();
    }

    pub fn num_registrations(&self, image_id: ImageId) -> usize {
        self.num_registrations.get(&image_id).copied().unwrap_or(0)
    }

    /// Images registered in any kept or active reconstruction.
    pub fn num_total_reg_images(&self) -> usize {
        self.num_registrations.values().filter(|&&count| count > 0).count()
    }

    /// Images of the active reconstruction that are also registered in another one.
    pub fn num_shared_reg_images(&self) -> usize {
        self.active.as_ref().map_or(0, |active| {
            active
                .obs_manager
                .reconstruction()
                .reg_image_ids()
                .into_iter()
                .filter(|&image_id| self.num_registrations(image_id) > 1)
                .count()
        })
    }

    /// Frames deregistered by [`IncrementalMapper::filter_frames`] in the active reconstruction.
    pub fn filtered_frames(&self) -> Result<&HashSet<FrameId>, SceneError> {
        Ok(&self.active()?.filtered_frames)
    }

    /// Frames that were registered when the active reconstruction was started.
    pub fn existing_frame_ids(&self) -> Result<&BTreeSet<FrameId>, SceneError> {
        Ok(&self.active()?.existing_frame_ids)
    }

    fn callbacks(&self) -> Vec<StopToken> {
        self.stop_token.iter().cloned().collect()
    }
}

fn bundle_adjuster(
    options: &IncrementalMapperOptions,
    ba_options: &BundleAdjustmentOptions,
    config: BundleAdjustmentConfig,
    pose_priors: &HashMap<ImageId, PosePrior>,
) -> BundleAdjuster {
    let adjuster = BundleAdjuster::new(*ba_options, config);
    if options.use_prior_position {
        adjuster.with_pose_priors(options.prior_position, pose_priors.clone())
    } else {
        adjuster
    }
}

fn num_reg_images_for_camera(reconstruction: &Reconstruction, camera_id: CameraId) -> usize {
    reconstruction
        .reg_image_ids()
        .into_iter()
        .filter(|&id| reconstruction.image(id).camera_id == camera_id)
        .count()
}

/// Index of the largest translation coordinate of a frame, which is the best conditioned one to
/// hold constant.
fn largest_translation_coord(reconstruction: &Reconstruction, frame_id: FrameId) -> usize {
    reconstruction
        .frame(frame_id)
        .rig_from_world
        .map_or(0, |pose| pose.0.translation.vector.abs().argmax().0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        synthetic::{synthesize_dataset, SyntheticDatasetOptions},
        DatabaseCacheOptions,
    };

    fn mapper() -> IncrementalMapper {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let cache = DatabaseCache::create(&dataset.database, &DatabaseCacheOptions::default()).unwrap();
        IncrementalMapper::new(Arc::new(cache))
    }

    fn options() -> IncrementalMapperOptions {
        IncrementalMapperOptions {
            init_min_num_inliers: 50,
            init_min_tri_angle: 4.0,
            abs_pose_min_num_inliers: 20,
            ..Default::default()
        }
    }

    fn tri_options() -> IncrementalTriangulatorOptions {
        IncrementalTriangulatorOptions {
            ignore_two_view_tracks: false,
            ..Default::default()
        }
    }

    fn initialized_mapper() -> (IncrementalMapper, InitialImagePair) {
        let mut mapper = mapper();
        mapper.begin_reconstruction(Reconstruction::new()).unwrap();
        let pair = mapper
            .find_initial_image_pair(&options(), None, None)
            .unwrap()
            .unwrap();
        mapper.register_initial_image_pair(&options(), &pair).unwrap();
        for image_id in [pair.image_id1, pair.image_id2] {
            mapper.triangulate_image(&tri_options(), image_id).unwrap();
        }
        (mapper, pair)
    }

    #[test]
    fn operations_need_a_reconstruction() {
        let mut mapper = mapper();
        assert_eq!(mapper.state(), MapperState::Uninitialized);
        assert!(matches!(
            mapper.find_next_images(&options()),
            Err(SceneError::NoActiveReconstruction)
        ));
        assert!(matches!(
            mapper.end_reconstruction(false),
            Err(SceneError::NoActiveReconstruction)
        ));
    }

    #[test]
    fn initial_pair_seeds_the_reconstruction() {
        let (mapper, pair) = initialized_mapper();
        let reconstruction = mapper.reconstruction().unwrap();
        assert_ne!(pair.image_id1, pair.image_id2);
        assert_eq!(reconstruction.num_reg_frames(), 2);
        assert!(reconstruction.num_points3d() > 100);
        assert!(reconstruction.check_consistency());
        assert_eq!(mapper.num_total_reg_images(), 2);
    }

    #[test]
    fn tried_pairs_are_not_tried_again() {
        let mut mapper = mapper();
        mapper.begin_reconstruction(Reconstruction::new()).unwrap();
        let first = mapper
            .find_initial_image_pair(&options(), None, None)
            .unwrap()
            .unwrap();
        let second = mapper
            .find_initial_image_pair(&options(), None, None)
            .unwrap()
            .unwrap();
        assert_ne!(
            ImagePair::new(first.image_id1, first.image_id2),
            ImagePair::new(second.image_id1, second.image_id2)
        );
        mapper.reset_initialization_stats();
        let again = mapper
            .find_initial_image_pair(&options(), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn remaining_images_are_registered() {
        let (mut mapper, _) = initialized_mapper();
        loop {
            let next = mapper.find_next_images(&options()).unwrap();
            let Some(&image_id) = next.first() else {
                break;
            };
            assert!(mapper.register_next_image(&options(), image_id).unwrap());
            mapper.triangulate_image(&tri_options(), image_id).unwrap();
        }
        let reconstruction = mapper.reconstruction().unwrap();
        assert_eq!(reconstruction.num_reg_frames(), 5);
        assert!(reconstruction.check_consistency());
        assert!(reconstruction.compute_mean_reprojection_error() < 1.0);
    }

    #[test]
    fn local_bundle_is_limited_in_size() {
        let (mut mapper, _) = initialized_mapper();
        while let Some(&image_id) = mapper.find_next_images(&options()).unwrap().first() {
            mapper.register_next_image(&options(), image_id).unwrap();
            mapper.triangulate_image(&tri_options(), image_id).unwrap();
        }
        let small = IncrementalMapperOptions {
            local_ba_num_images: 3,
            ..options()
        };
        let bundle = mapper.find_local_bundle(&small, ImageId(2)).unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(!bundle.contains(&ImageId(2)));
        let bundle = mapper.find_local_bundle(&options(), ImageId(2)).unwrap();
        assert_eq!(bundle.len(), 4);
    }

    #[test]
    fn local_bundle_reports_how_the_solver_ended() {
        let (mut mapper, _) = initialized_mapper();
        let image_id = *mapper.find_next_images(&options()).unwrap().first().unwrap();
        assert!(mapper.register_next_image(&options(), image_id).unwrap());
        mapper.triangulate_image(&tri_options(), image_id).unwrap();
        let point3d_ids: BTreeSet<Point3DId> = mapper.reconstruction().unwrap().point3d_ids().into_iter().collect();

        let token = StopToken::new();
        token.stop();
        mapper.set_stop_token(token);
        let report = mapper
            .adjust_local_bundle(
                &options(),
                &BundleAdjustmentOptions::default(),
                &tri_options(),
                image_id,
                &point3d_ids,
            )
            .unwrap();
        assert_eq!(report.termination, Some(BundleAdjustmentTermination::UserTerminated));
        assert!(mapper.reconstruction().unwrap().check_consistency());
    }

    #[test]
    fn discarded_reconstruction_releases_its_images() {
        let (mut mapper, _) = initialized_mapper();
        let reconstruction = mapper.end_reconstruction(true).unwrap();
        assert_eq!(reconstruction.num_reg_frames(), 2);
        assert_eq!(mapper.state(), MapperState::Failed);
        assert_eq!(mapper.num_total_reg_images(), 0);
    }

    #[test]
    fn refinement_keeps_the_model_consistent() {
        let (mut mapper, pair) = initialized_mapper();
        let ba_options = BundleAdjustmentOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        mapper
            .iterative_global_refinement(2, 0.0005, &options(), &ba_options, &tri_options(), true)
            .unwrap();
        let image_id = *mapper.find_next_images(&options()).unwrap().first().unwrap();
        assert!(mapper.register_next_image(&options(), image_id).unwrap());
        mapper.triangulate_image(&tri_options(), image_id).unwrap();
        mapper
            .iterative_local_refinement(2, 0.001, &options(), &ba_options, &tri_options(), image_id)
            .unwrap();
        let reconstruction = mapper.reconstruction().unwrap();
        assert!(reconstruction.is_image_registered(pair.image_id1));
        assert!(reconstruction.check_consistency());
        assert!(reconstruction.compute_mean_reprojection_error() < 1.0);
    }
}
