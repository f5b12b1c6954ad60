use crate::{ImageId, PairingOptions, SceneError};
use serde::{Deserialize, Serialize};
use sfm_optimize::{LossFunction, SolverOptions};
use std::path::PathBuf;

fn ensure(condition: bool, message: &str) -> Result<(), SceneError> {
    if condition {
        Ok(())
    } else {
        Err(SceneError::InvalidOptions(message.to_owned()))
    }
}

/// The settings of the incremental triangulator.
///
/// Angles are in degrees and errors in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncrementalTriangulatorOptions {
    /// Maximum transitivity when searching correspondences of a new image.
    #[serde(default = "default_max_transitivity")]
    pub max_transitivity: usize,
    /// Maximum angular error between a bearing and the ray to a new point.
    #[serde(default = "default_create_max_angle_error")]
    pub create_max_angle_error: f64,
    /// Maximum angular error when adding an observation to an existing point.
    #[serde(default = "default_continue_max_angle_error")]
    pub continue_max_angle_error: f64,
    /// Maximum reprojection error of every observation of two points for them to be merged.
    #[serde(default = "default_merge_max_reproj_error")]
    pub merge_max_reproj_error: f64,
    /// Maximum reprojection error of an observation added when completing a track.
    #[serde(default = "default_complete_max_reproj_error")]
    pub complete_max_reproj_error: f64,
    /// Maximum transitivity when completing a track.
    #[serde(default = "default_complete_max_transitivity")]
    pub complete_max_transitivity: usize,
    /// Maximum angular error when re-triangulating under-reconstructed image pairs.
    #[serde(default = "default_re_max_angle_error")]
    pub re_max_angle_error: f64,
    /// Image pairs with a smaller ratio of triangulated correspondences are re-triangulated.
    #[serde(default = "default_re_min_ratio")]
    pub re_min_ratio: f64,
    /// How often each image pair may be re-triangulated.
    #[serde(default = "default_re_max_trials")]
    pub re_max_trials: usize,
    /// Minimum triangulation angle of a new point.
    #[serde(default = "default_min_angle")]
    pub min_angle: f64,
    /// Minimum number of observations of a new point.
    #[serde(default = "default_min_track_length")]
    pub min_track_length: usize,
    /// Skip keypoints whose only correspondence is a single other keypoint.
    #[serde(default = "default_ignore_two_view_tracks")]
    pub ignore_two_view_tracks: bool,
    /// Observations of cameras with implausible intrinsics are not triangulated.
    #[serde(default = "default_min_focal_length_ratio")]
    pub min_focal_length_ratio: f64,
    #[serde(default = "default_max_focal_length_ratio")]
    pub max_focal_length_ratio: f64,
    #[serde(default = "default_max_extra_param")]
    pub max_extra_param: f64,
}

impl Default for IncrementalTriangulatorOptions {
    fn default() -> Self {
        Self {
            max_transitivity: default_max_transitivity(),
            create_max_angle_error: default_create_max_angle_error(),
            continue_max_angle_error: default_continue_max_angle_error(),
            merge_max_reproj_error: default_merge_max_reproj_error(),
            complete_max_reproj_error: default_complete_max_reproj_error(),
            complete_max_transitivity: default_complete_max_transitivity(),
            re_max_angle_error: default_re_max_angle_error(),
            re_min_ratio: default_re_min_ratio(),
            re_max_trials: default_re_max_trials(),
            min_angle: default_min_angle(),
            min_track_length: default_min_track_length(),
            ignore_two_view_tracks: default_ignore_two_view_tracks(),
            min_focal_length_ratio: default_min_focal_length_ratio(),
            max_focal_length_ratio: default_max_focal_length_ratio(),
            max_extra_param: default_max_extra_param(),
        }
    }
}

impl IncrementalTriangulatorOptions {
    pub fn check(&self) -> Result<(), SceneError> {
        ensure(self.create_max_angle_error > 0.0, "create_max_angle_error must be positive")?;
        ensure(self.continue_max_angle_error > 0.0, "continue_max_angle_error must be positive")?;
        ensure(self.merge_max_reproj_error > 0.0, "merge_max_reproj_error must be positive")?;
        ensure(self.complete_max_reproj_error > 0.0, "complete_max_reproj_error must be positive")?;
        ensure(self.re_max_angle_error > 0.0, "re_max_angle_error must be positive")?;
        ensure((0.0..=1.0).contains(&self.re_min_ratio), "re_min_ratio must be within [0, 1]")?;
        ensure(self.min_angle > 0.0, "min_angle must be positive")?;
        ensure(self.min_track_length >= 2, "min_track_length must be at least 2")?;
        ensure(
            self.max_focal_length_ratio >= self.min_focal_length_ratio,
            "max_focal_length_ratio must not be below min_focal_length_ratio",
        )
    }
}

fn default_max_transitivity() -> usize {
    1
}

fn default_create_max_angle_error() -> f64 {
    2.0
}

fn default_continue_max_angle_error() -> f64 {
    2.0
}

fn default_merge_max_reproj_error() -> f64 {
    4.0
}

fn default_complete_max_reproj_error() -> f64 {
    4.0
}

fn default_complete_max_transitivity() -> usize {
    5
}

fn default_re_max_angle_error() -> f64 {
    5.0
}

fn default_re_min_ratio() -> f64 {
    0.2
}

fn default_re_max_trials() -> usize {
    1
}

fn default_min_angle() -> f64 {
    1.5
}

fn default_min_track_length() -> usize {
    2
}

fn default_ignore_two_view_tracks() -> bool {
    true
}

fn default_min_focal_length_ratio() -> f64 {
    0.1
}

fn default_max_focal_length_ratio() -> f64 {
    10.0
}

fn default_max_extra_param() -> f64 {
    1.0
}

/// The settings of one bundle adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentOptions {
    /// Robust loss applied to every reprojection residual.
    #[serde(default)]
    pub loss_function: LossFunction,
    #[serde(default)]
    pub solver: SolverOptions,
    #[serde(default = "default_true")]
    pub refine_focal_length: bool,
    #[serde(default)]
    pub refine_principal_point: bool,
    #[serde(default = "default_true")]
    pub refine_extra_params: bool,
    #[serde(default = "default_true")]
    pub refine_rig_from_world: bool,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            loss_function: LossFunction::default(),
            solver: SolverOptions::default(),
            refine_focal_length: true,
            refine_principal_point: false,
            refine_extra_params: true,
            refine_rig_from_world: true,
        }
    }
}

impl BundleAdjustmentOptions {
    pub fn check(&self) -> Result<(), SceneError> {
        let scale = match self.loss_function {
            LossFunction::Trivial => 1.0,
            LossFunction::SoftL1 { scale } | LossFunction::Cauchy { scale } => scale,
        };
        ensure(scale > 0.0, "loss function scale must be positive")?;
        ensure(self.solver.max_num_iterations > 0, "max_num_iterations must be positive")?;
        ensure(
            self.solver.function_tolerance >= 0.0
                && self.solver.gradient_tolerance >= 0.0
                && self.solver.parameter_tolerance >= 0.0,
            "solver tolerances must not be negative",
        )
    }
}

fn default_true() -> bool {
    true
}

/// Position prior residuals added to a bundle adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosePriorBundleAdjustmentOptions {
    /// Apply a Cauchy loss to the prior residuals.
    #[serde(default)]
    pub use_robust_loss_on_prior_position: bool,
    /// Scale of the prior loss. The default is the 95% quantile of the chi-squared distribution
    /// with three degrees of freedom.
    #[serde(default = "default_prior_position_loss_scale")]
    pub prior_position_loss_scale: f64,
}

impl Default for PosePriorBundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            use_robust_loss_on_prior_position: false,
            prior_position_loss_scale: default_prior_position_loss_scale(),
        }
    }
}

fn default_prior_position_loss_scale() -> f64 {
    7.815
}

/// How the next images to register are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageSelectionMethod {
    /// Most triangulated correspondences.
    MaxVisiblePointsNum,
    /// Largest ratio of triangulated correspondences to correspondences.
    MaxVisiblePointsRatio,
    /// Best spatial coverage of the triangulated correspondences.
    #[default]
    MinUncertainty,
}

/// The settings of the incremental mapper.
///
/// Angles are in degrees and errors in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncrementalMapperOptions {
    /// Minimum number of inliers of the initial image pair.
    #[serde(default = "default_init_min_num_inliers")]
    pub init_min_num_inliers: usize,
    /// Maximum epipolar error of an inlier of the initial image pair.
    #[serde(default = "default_init_max_error")]
    pub init_max_error: f64,
    /// Maximum share of the baseline along the viewing direction of the initial pair.
    #[serde(default = "default_init_max_forward_motion")]
    pub init_max_forward_motion: f64,
    /// Minimum median triangulation angle of the initial pair.
    #[serde(default = "default_init_min_tri_angle")]
    pub init_min_tri_angle: f64,
    /// How often an image may be tried as part of an initial pair.
    #[serde(default = "default_init_max_reg_trials")]
    pub init_max_reg_trials: usize,
    /// Maximum reprojection error of an absolute pose inlier.
    #[serde(default = "default_abs_pose_max_error")]
    pub abs_pose_max_error: f64,
    #[serde(default = "default_abs_pose_min_num_inliers")]
    pub abs_pose_min_num_inliers: usize,
    #[serde(default = "default_abs_pose_min_inlier_ratio")]
    pub abs_pose_min_inlier_ratio: f64,
    /// Refine the focal length of a camera while registering its first image.
    #[serde(default = "default_true")]
    pub abs_pose_refine_focal_length: bool,
    /// Refine the distortion of a camera while registering its first image.
    #[serde(default = "default_true")]
    pub abs_pose_refine_extra_params: bool,
    /// Number of images, besides the newest, whose poses are refined in local bundle adjustment.
    #[serde(default = "default_local_ba_num_images")]
    pub local_ba_num_images: usize,
    /// Images sharing points with the newest image are preferred when their triangulation angle
    /// exceeds this threshold.
    #[serde(default = "default_local_ba_min_tri_angle")]
    pub local_ba_min_tri_angle: f64,
    /// Points with longer tracks are held constant in local bundle adjustment.
    #[serde(default = "default_local_ba_max_track_length")]
    pub local_ba_max_track_length: usize,
    #[serde(default = "default_min_focal_length_ratio")]
    pub min_focal_length_ratio: f64,
    #[serde(default = "default_max_focal_length_ratio")]
    pub max_focal_length_ratio: f64,
    #[serde(default = "default_max_extra_param")]
    pub max_extra_param: f64,
    /// Observations with a larger reprojection error are filtered.
    #[serde(default = "default_filter_max_reproj_error")]
    pub filter_max_reproj_error: f64,
    /// Points with a smaller largest triangulation angle are filtered.
    #[serde(default = "default_filter_min_tri_angle")]
    pub filter_min_tri_angle: f64,
    /// How often registration of an image may fail before it is no longer tried.
    #[serde(default = "default_max_reg_trials")]
    pub max_reg_trials: usize,
    /// Keep the poses of frames that were registered before the mapper started.
    #[serde(default)]
    pub fix_existing_frames: bool,
    /// Add position prior residuals to global bundle adjustment.
    #[serde(default)]
    pub use_prior_position: bool,
    #[serde(default)]
    pub prior_position: PosePriorBundleAdjustmentOptions,
    #[serde(default)]
    pub image_selection_method: ImageSelectionMethod,
    /// Seed of the random number generators of the robust estimators.
    #[serde(default)]
    pub random_seed: u64,
}

impl Default for IncrementalMapperOptions {
    fn default() -> Self {
        Self {
            init_min_num_inliers: default_init_min_num_inliers(),
            init_max_error: default_init_max_error(),
            init_max_forward_motion: default_init_max_forward_motion(),
            init_min_tri_angle: default_init_min_tri_angle(),
            init_max_reg_trials: default_init_max_reg_trials(),
            abs_pose_max_error: default_abs_pose_max_error(),
            abs_pose_min_num_inliers: default_abs_pose_min_num_inliers(),
            abs_pose_min_inlier_ratio: default_abs_pose_min_inlier_ratio(),
            abs_pose_refine_focal_length: true,
            abs_pose_refine_extra_params: true,
            local_ba_num_images: default_local_ba_num_images(),
            local_ba_min_tri_angle: default_local_ba_min_tri_angle(),
            local_ba_max_track_length: default_local_ba_max_track_length(),
            min_focal_length_ratio: default_min_focal_length_ratio(),
            max_focal_length_ratio: default_max_focal_length_ratio(),
            max_extra_param: default_max_extra_param(),
            filter_max_reproj_error: default_filter_max_reproj_error(),
            filter_min_tri_angle: default_filter_min_tri_angle(),
            max_reg_trials: default_max_reg_trials(),
            fix_existing_frames: false,
            use_prior_position: false,
            prior_position: PosePriorBundleAdjustmentOptions::default(),
            image_selection_method: ImageSelectionMethod::default(),
            random_seed: 0,
        }
    }
}

impl IncrementalMapperOptions {
    pub fn check(&self) -> Result<(), SceneError> {
        ensure(self.init_min_num_inliers > 0, "init_min_num_inliers must be positive")?;
        ensure(self.init_max_error > 0.0, "init_max_error must be positive")?;
        ensure(
            (0.0..=1.0).contains(&self.init_max_forward_motion),
            "init_max_forward_motion must be within [0, 1]",
        )?;
        ensure(self.init_min_tri_angle >= 0.0, "init_min_tri_angle must not be negative")?;
        ensure(self.init_max_reg_trials >= 1, "init_max_reg_trials must be positive")?;
        ensure(self.abs_pose_max_error > 0.0, "abs_pose_max_error must be positive")?;
        ensure(self.abs_pose_min_num_inliers > 0, "abs_pose_min_num_inliers must be positive")?;
        ensure(
            (0.0..=1.0).contains(&self.abs_pose_min_inlier_ratio),
            "abs_pose_min_inlier_ratio must be within [0, 1]",
        )?;
        ensure(self.local_ba_num_images >= 2, "local_ba_num_images must be at least 2")?;
        ensure(self.local_ba_min_tri_angle >= 0.0, "local_ba_min_tri_angle must not be negative")?;
        ensure(self.min_focal_length_ratio >= 0.0, "min_focal_length_ratio must not be negative")?;
        ensure(
            self.max_focal_length_ratio >= self.min_focal_length_ratio,
            "max_focal_length_ratio must not be below min_focal_length_ratio",
        )?;
        ensure(self.max_extra_param >= 0.0, "max_extra_param must not be negative")?;
        ensure(self.filter_max_reproj_error >= 0.0, "filter_max_reproj_error must not be negative")?;
        ensure(self.filter_min_tri_angle >= 0.0, "filter_min_tri_angle must not be negative")?;
        ensure(self.max_reg_trials >= 1, "max_reg_trials must be positive")
    }
}

fn default_init_min_num_inliers() -> usize {
    100
}

fn default_init_max_error() -> f64 {
    4.0
}

fn default_init_max_forward_motion() -> f64 {
    0.95
}

fn default_init_min_tri_angle() -> f64 {
    16.0
}

fn default_init_max_reg_trials() -> usize {
    2
}

fn default_abs_pose_max_error() -> f64 {
    12.0
}

fn default_abs_pose_min_num_inliers() -> usize {
    30
}

fn default_abs_pose_min_inlier_ratio() -> f64 {
    0.25
}

fn default_local_ba_num_images() -> usize {
    6
}

fn default_local_ba_min_tri_angle() -> f64 {
    6.0
}

fn default_local_ba_max_track_length() -> usize {
    15
}

fn default_filter_max_reproj_error() -> f64 {
    4.0
}

fn default_filter_min_tri_angle() -> f64 {
    1.5
}

fn default_max_reg_trials() -> usize {
    3
}

/// The settings of the whole incremental pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalPipelineOptions {
    #[serde(default)]
    pub mapper: IncrementalMapperOptions,
    #[serde(default)]
    pub triangulation: IncrementalTriangulatorOptions,
    /// Bundle adjustment of the images around the newest image.
    #[serde(default = "default_local_bundle_adjustment")]
    pub local_bundle_adjustment: BundleAdjustmentOptions,
    /// Bundle adjustment of the whole model.
    #[serde(default = "default_global_bundle_adjustment")]
    pub global_bundle_adjustment: BundleAdjustmentOptions,
    /// Restricts the loaded image pairs to the pairs of a generator.
    #[serde(default)]
    pub pairing: Option<PairingOptions>,
    /// Image pairs with fewer verified matches are ignored.
    #[serde(default = "default_min_num_matches")]
    pub min_num_matches: usize,
    /// Ignore image pairs verified as watermarks.
    #[serde(default)]
    pub ignore_watermarks: bool,
    /// Reconstruct every connected component instead of only the first.
    #[serde(default = "default_true")]
    pub multiple_models: bool,
    #[serde(default = "default_max_num_models")]
    pub max_num_models: usize,
    /// Stop starting new models once this many registered images are shared between models.
    #[serde(default = "default_max_model_overlap")]
    pub max_model_overlap: usize,
    /// Models with fewer registered images are discarded.
    #[serde(default = "default_min_model_size")]
    pub min_model_size: usize,
    /// A model stops growing once it has this many registered images. Zero means no limit.
    #[serde(default)]
    pub max_num_images: usize,
    /// Optional initial image pair.
    #[serde(default)]
    pub init_image_id1: Option<ImageId>,
    #[serde(default)]
    pub init_image_id2: Option<ImageId>,
    /// How often the mapper tries to find an initial pair before giving up on a model.
    #[serde(default = "default_init_num_trials")]
    pub init_num_trials: usize,
    /// Color the points from the keypoint colors of the registered images.
    #[serde(default = "default_true")]
    pub extract_colors: bool,
    /// Global bundle adjustment runs whenever the number of registered frames grows by this ratio.
    #[serde(default = "default_ba_global_ratio")]
    pub ba_global_frames_ratio: f64,
    /// Global bundle adjustment runs whenever the number of points grows by this ratio.
    #[serde(default = "default_ba_global_ratio")]
    pub ba_global_points_ratio: f64,
    /// Global bundle adjustment runs at least after this many registered frames.
    #[serde(default = "default_ba_global_frames_freq")]
    pub ba_global_frames_freq: usize,
    /// Global bundle adjustment runs at least after this many new points.
    #[serde(default = "default_ba_global_points_freq")]
    pub ba_global_points_freq: usize,
    #[serde(default = "default_ba_local_max_refinements")]
    pub ba_local_max_refinements: usize,
    /// Local refinement stops once the share of changed observations is below this value.
    #[serde(default = "default_ba_local_max_refinement_change")]
    pub ba_local_max_refinement_change: f64,
    #[serde(default = "default_ba_global_max_refinements")]
    pub ba_global_max_refinements: usize,
    /// Global refinement stops once the share of changed observations is below this value.
    #[serde(default = "default_ba_global_max_refinement_change")]
    pub ba_global_max_refinement_change: f64,
    /// Directory for snapshots of the model while it grows.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Write a snapshot after this many registered frames. Zero disables snapshots.
    #[serde(default)]
    pub snapshot_frames_freq: usize,
    /// Only reconstruct these images. Empty means all images.
    #[serde(default)]
    pub image_names: Vec<String>,
}

impl Default for IncrementalPipelineOptions {
    fn default() -> Self {
        Self {
            mapper: IncrementalMapperOptions::default(),
            triangulation: IncrementalTriangulatorOptions::default(),
            local_bundle_adjustment: default_local_bundle_adjustment(),
            global_bundle_adjustment: default_global_bundle_adjustment(),
            pairing: None,
            min_num_matches: default_min_num_matches(),
            ignore_watermarks: false,
            multiple_models: true,
            max_num_models: default_max_num_models(),
            max_model_overlap: default_max_model_overlap(),
            min_model_size: default_min_model_size(),
            max_num_images: 0,
            init_image_id1: None,
            init_image_id2: None,
            init_num_trials: default_init_num_trials(),
            extract_colors: true,
            ba_global_frames_ratio: default_ba_global_ratio(),
            ba_global_points_ratio: default_ba_global_ratio(),
            ba_global_frames_freq: default_ba_global_frames_freq(),
            ba_global_points_freq: default_ba_global_points_freq(),
            ba_local_max_refinements: default_ba_local_max_refinements(),
            ba_local_max_refinement_change: default_ba_local_max_refinement_change(),
            ba_global_max_refinements: default_ba_global_max_refinements(),
            ba_global_max_refinement_change: default_ba_global_max_refinement_change(),
            snapshot_path: None,
            snapshot_frames_freq: 0,
            image_names: vec![],
        }
    }
}

impl IncrementalPipelineOptions {
    pub fn check(&self) -> Result<(), SceneError> {
        self.mapper.check()?;
        self.triangulation.check()?;
        self.local_bundle_adjustment.check()?;
        self.global_bundle_adjustment.check()?;
        ensure(self.max_num_models > 0, "max_num_models must be positive")?;
        ensure(self.max_model_overlap > 0, "max_model_overlap must be positive")?;
        ensure(self.init_num_trials > 0, "init_num_trials must be positive")?;
        ensure(self.ba_global_frames_ratio > 1.0, "ba_global_frames_ratio must exceed 1")?;
        ensure(self.ba_global_points_ratio > 1.0, "ba_global_points_ratio must exceed 1")?;
        ensure(self.ba_global_frames_freq > 0, "ba_global_frames_freq must be positive")?;
        ensure(self.ba_global_points_freq > 0, "ba_global_points_freq must be positive")?;
        ensure(self.ba_local_max_refinements > 0, "ba_local_max_refinements must be positive")?;
        ensure(
            self.ba_local_max_refinement_change >= 0.0,
            "ba_local_max_refinement_change must not be negative",
        )?;
        ensure(self.ba_global_max_refinements > 0, "ba_global_max_refinements must be positive")?;
        ensure(
            self.ba_global_max_refinement_change >= 0.0,
            "ba_global_max_refinement_change must not be negative",
        )?;
        ensure(
            self.init_image_id1.is_some() || self.init_image_id2.is_none(),
            "init_image_id2 requires init_image_id1",
        )
    }

    /// Whether a model with this many registered images must stop growing.
    pub fn reached_max_num_images(&self, num_reg_images: usize) -> bool {
        self.max_num_images > 0 && num_reg_images >= self.max_num_images
    }

    /// Whether both images of the initial pair are given.
    pub fn is_initial_pair_provided(&self) -> bool {
        self.init_image_id1.is_some() && self.init_image_id2.is_some()
    }
}

fn default_local_bundle_adjustment() -> BundleAdjustmentOptions {
    BundleAdjustmentOptions {
        loss_function: LossFunction::SoftL1 { scale: 1.0 },
        solver: SolverOptions {
            max_num_iterations: 25,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn default_global_bundle_adjustment() -> BundleAdjustmentOptions {
    BundleAdjustmentOptions {
        solver: SolverOptions {
            max_num_iterations: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn default_min_num_matches() -> usize {
    15
}

fn default_max_num_models() -> usize {
    50
}

fn default_max_model_overlap() -> usize {
    20
}

fn default_min_model_size() -> usize {
    10
}

fn default_init_num_trials() -> usize {
    200
}

fn default_ba_global_ratio() -> f64 {
    1.1
}

fn default_ba_global_frames_freq() -> usize {
    500
}

fn default_ba_global_points_freq() -> usize {
    250000
}

fn default_ba_local_max_refinements() -> usize {
    2
}

fn default_ba_local_max_refinement_change() -> f64 {
    0.001
}

fn default_ba_global_max_refinements() -> usize {
    5
}

fn default_ba_global_max_refinement_change() -> f64 {
    0.0005
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_settings_use_defaults() {
        let options: IncrementalPipelineOptions = serde_json::from_str(
            r#"{ "mapper": { "init_min_num_inliers": 50 }, "min_model_size": 3 }"#,
        )
        .unwrap();
        assert_eq!(options.mapper.init_min_num_inliers, 50);
        assert_eq!(options.mapper.abs_pose_min_num_inliers, 30);
        assert_eq!(options.min_model_size, 3);
        assert_eq!(options.triangulation, IncrementalTriangulatorOptions::default());
        assert_eq!(
            options.local_bundle_adjustment.loss_function,
            LossFunction::SoftL1 { scale: 1.0 }
        );
        options.check().unwrap();
    }

    #[test]
    fn invalid_ratios_are_rejected() {
        let options = IncrementalPipelineOptions {
            ba_global_frames_ratio: 1.0,
            ..Default::default()
        };
        assert!(matches!(options.check(), Err(SceneError::InvalidOptions(_))));
        let mut options = IncrementalPipelineOptions::default();
        options.mapper.local_ba_num_images = 1;
        assert!(options.check().is_err());
    }
}
