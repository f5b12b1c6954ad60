use crate::{
    BundleAdjustmentOptions, CameraId, CoordinateSystem, FrameId, ImageId, Point3DId, PosePrior,
    PosePriorBundleAdjustmentOptions, Reconstruction,
};
use log::*;
use serde::{Deserialize, Serialize};
use sfm_core::{
    nalgebra::{Matrix3, Point3},
    CameraToCamera, Pose,
};
use sfm_optimize::{
    BundleAdjustmentProblem, BundleAdjustmentSummary, IterationCallback, LossFunction, Observation,
    PoseBlock, PositionPrior,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How the seven degrees of freedom of a similarity are removed from a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BundleAdjustmentGauge {
    /// Leave the gauge to the constant blocks chosen by the caller.
    #[default]
    Unspecified,
    /// Hold the first frame constant and one translation coordinate of the second.
    TwoCamsFromWorld,
    /// Hold three non-collinear points constant.
    ThreePoints,
}

/// Which parts of a reconstruction a bundle adjustment refines.
///
/// Every point observed by one of the images takes part. Points that are added explicitly also
/// bring in their observations in other images, whose poses and intrinsics are then held constant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleAdjustmentConfig {
    image_ids: BTreeSet<ImageId>,
    constant_cam_intrinsics: BTreeSet<CameraId>,
    constant_rig_from_world: BTreeSet<FrameId>,
    constant_translation: BTreeMap<FrameId, Vec<usize>>,
    variable_point3d_ids: BTreeSet<Point3DId>,
    constant_point3d_ids: BTreeSet<Point3DId>,
    gauge: BundleAdjustmentGauge,
}

impl BundleAdjustmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image_id: ImageId) {
        self.image_ids.insert(image_id);
    }

    pub fn has_image(&self, image_id: ImageId) -> bool {
        self.image_ids.contains(&image_id)
    }

    pub fn remove_image(&mut self, image_id: ImageId) {
        self.image_ids.remove(&image_id);
    }

    pub fn image_ids(&self) -> &BTreeSet<ImageId> {
        &self.image_ids
    }

    pub fn num_images(&self) -> usize {
        self.image_ids.len()
    }

    pub fn set_constant_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.insert(camera_id);
    }

    pub fn set_variable_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.remove(&camera_id);
    }

    pub fn has_constant_cam_intrinsics(&self, camera_id: CameraId) -> bool {
        self.constant_cam_intrinsics.contains(&camera_id)
    }

    pub fn set_constant_rig_from_world(&mut self, frame_id: FrameId) {
        self.constant_rig_from_world.insert(frame_id);
    }

    pub fn set_variable_rig_from_world(&mut self, frame_id: FrameId) {
        self.constant_rig_from_world.remove(&frame_id);
    }

    pub fn has_constant_rig_from_world(&self, frame_id: FrameId) -> bool {
        self.constant_rig_from_world.contains(&frame_id)
    }

    /// Holds the given coordinates of the translation of a frame constant.
    pub fn set_constant_translation(&mut self, frame_id: FrameId, coords: Vec<usize>) {
        assert!(
            coords.len() < 3 && coords.iter().all(|&c| c < 3),
            "at most two of the three translation coordinates may be held constant"
        );
        self.constant_translation.insert(frame_id, coords);
    }

    pub fn remove_constant_translation(&mut self, frame_id: FrameId) {
        self.constant_translation.remove(&frame_id);
    }

    pub fn constant_translation(&self, frame_id: FrameId) -> &[usize] {
        self.constant_translation
            .get(&frame_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn add_variable_point(&mut self, point3d_id: Point3DId) {
        self.constant_point3d_ids.remove(&point3d_id);
        self.variable_point3d_ids.insert(point3d_id);
    }

    pub fn add_constant_point(&mut self, point3d_id: Point3DId) {
        self.variable_point3d_ids.remove(&point3d_id);
        self.constant_point3d_ids.insert(point3d_id);
    }

    pub fn has_variable_point(&self, point3d_id: Point3DId) -> bool {
        self.variable_point3d_ids.contains(&point3d_id)
    }

    pub fn has_constant_point(&self, point3d_id: Point3DId) -> bool {
        self.constant_point3d_ids.contains(&point3d_id)
    }

    pub fn remove_variable_point(&mut self, point3d_id: Point3DId) {
        self.variable_point3d_ids.remove(&point3d_id);
    }

    pub fn remove_constant_point(&mut self, point3d_id: Point3DId) {
        self.constant_point3d_ids.remove(&point3d_id);
    }

    pub fn variable_point3d_ids(&self) -> &BTreeSet<Point3DId> {
        &self.variable_point3d_ids
    }

    pub fn constant_point3d_ids(&self) -> &BTreeSet<Point3DId> {
        &self.constant_point3d_ids
    }

    pub fn fix_gauge(&mut self, gauge: BundleAdjustmentGauge) {
        self.gauge = gauge;
    }

    pub fn gauge(&self) -> BundleAdjustmentGauge {
        self.gauge
    }
}

/// The problem built from a configuration, with the block index of every scene entity.
struct ProblemBuilder<'a> {
    reconstruction: &'a Reconstruction,
    options: &'a BundleAdjustmentOptions,
    config: &'a BundleAdjustmentConfig,
    problem: BundleAdjustmentProblem,
    cameras: BTreeMap<CameraId, usize>,
    frames: BTreeMap<FrameId, usize>,
    points: BTreeMap<Point3DId, usize>,
}

impl<'a> ProblemBuilder<'a> {
    fn new(
        reconstruction: &'a Reconstruction,
        options: &'a BundleAdjustmentOptions,
        config: &'a BundleAdjustmentConfig,
    ) -> Self {
        Self {
            reconstruction,
            options,
            config,
            problem: BundleAdjustmentProblem::new(options.loss_function),
            cameras: BTreeMap::new(),
            frames: BTreeMap::new(),
            points: BTreeMap::new(),
        }
    }

    fn camera(&mut self, camera_id: CameraId, constant: bool) -> usize {
        if let Some(&ix) = self.cameras.get(&camera_id) {
            return ix;
        }
        let camera = self.reconstruction.camera(camera_id);
        let mut variable_params = vec![];
        if !constant && !self.config.has_constant_cam_intrinsics(camera_id) {
            if self.options.refine_focal_length {
                variable_params.extend_from_slice(camera.model.focal_length_idxs());
            }
            if self.options.refine_principal_point {
                variable_params.extend_from_slice(camera.model.principal_point_idxs());
            }
            if self.options.refine_extra_params {
                variable_params.extend_from_slice(camera.model.extra_params_idxs());
            }
        }
        let ix = self.problem.add_camera(camera.clone(), variable_params);
        self.cameras.insert(camera_id, ix);
        ix
    }

    fn frame(&mut self, frame_id: FrameId, constant: bool) -> Option<usize> {
        if let Some(&ix) = self.frames.get(&frame_id) {
            return Some(ix);
        }
        let rig_from_world = self.reconstruction.frame(frame_id).rig_from_world?;
        let constant = constant
            || !self.options.refine_rig_from_world
            || self.config.has_constant_rig_from_world(frame_id);
        let block = if constant {
            PoseBlock::constant(rig_from_world)
        } else {
            PoseBlock {
                constant_translation: self.config.constant_translation(frame_id).to_vec(),
                ..PoseBlock::variable(rig_from_world)
            }
        };
        let ix = self.problem.add_pose(block);
        self.frames.insert(frame_id, ix);
        Some(ix)
    }

    fn point(&mut self, point3d_id: Point3DId) -> usize {
        if let Some(&ix) = self.points.get(&point3d_id) {
            return ix;
        }
        let position = self.reconstruction.point3d(point3d_id).position;
        let ix = self
            .problem
            .add_point(position, self.config.has_constant_point(point3d_id));
        self.points.insert(point3d_id, ix);
        ix
    }

    fn cam_from_rig(&self, image_id: ImageId) -> Option<Option<CameraToCamera>> {
        let image = self.reconstruction.image(image_id);
        let rig = self
            .reconstruction
            .rig(self.reconstruction.frame(image.frame_id).rig_id);
        if rig.ref_sensor == image.camera_id {
            Some(None)
        } else {
            rig.cam_from_rig(image.camera_id).map(Some)
        }
    }

    fn observation(&mut self, image_id: ImageId, point2d_idx: usize, point3d_id: Point3DId, constant: bool) {
        let image = self.reconstruction.image(image_id);
        let (camera_id, frame_id) = (image.camera_id, image.frame_id);
        let keypoint = image.point2d(point2d_idx).keypoint;
        let Some(cam_from_rig) = self.cam_from_rig(image_id) else {
            warn!("image {} is not a sensor of its rig", image_id);
            return;
        };
        let Some(pose) = self.frame(frame_id, constant) else {
            return;
        };
        let camera = self.camera(camera_id, constant);
        let point = self.point(point3d_id);
        self.problem.add_observation(Observation {
            camera,
            pose,
            cam_from_rig,
            point,
            keypoint,
        });
    }

    fn add_images(&mut self) {
        for &image_id in &self.config.image_ids {
            if !self.reconstruction.is_image_registered(image_id) {
                debug!("skipping unregistered image {} in bundle adjustment", image_id);
                continue;
            }
            let observations: Vec<(usize, Point3DId)> =
                self.reconstruction.image(image_id).triangulated().collect();
            for (point2d_idx, point3d_id) in observations {
                self.observation(image_id, point2d_idx, point3d_id, false);
            }
        }
    }

    /// Observations of the explicitly added points in images outside the configuration.
    fn add_points(&mut self) {
        let point3d_ids = self
            .config
            .variable_point3d_ids
            .iter()
            .chain(&self.config.constant_point3d_ids)
            .copied()
            .filter(|&id| self.reconstruction.exists_point3d(id))
            .collect::<Vec<_>>();
        for point3d_id in point3d_ids {
            self.point(point3d_id);
            let elements: Vec<_> = self.reconstruction.point3d(point3d_id).track.iter().collect();
            for element in elements {
                if self.config.has_image(element.image_id) {
                    continue;
                }
                self.observation(element.image_id, element.point2d_idx, point3d_id, true);
            }
        }
    }

    fn fix_gauge_with_two_cams_from_world(&mut self) {
        let constant: Vec<usize> = self
            .frames
            .values()
            .copied()
            .filter(|&ix| self.problem.poses[ix].constant)
            .collect();
        if constant.len() >= 2 {
            return;
        }
        let mut variable = self
            .frames
            .values()
            .copied()
            .filter(|&ix| !self.problem.poses[ix].constant)
            .collect::<Vec<usize>>()
            .into_iter();
        if constant.is_empty() {
            let Some(first) = variable.next() else {
                return;
            };
            self.problem.poses[first].constant = true;
        }
        let Some(second) = variable.next() else {
            return;
        };
        let pose = &mut self.problem.poses[second];
        if !pose.constant_translation.is_empty() {
            return;
        }
        let translation = pose.rig_from_world.0.translation.vector;
        let (coord, _) = translation.abs().argmax();
        pose.constant_translation = vec![coord];
    }

    fn fix_gauge_with_three_points(&mut self) {
        let mut fixed: Vec<Point3<f64>> = self
            .problem
            .points
            .iter()
            .filter(|p| p.constant)
            .map(|p| p.position)
            .collect();
        for point in &mut self.problem.points {
            if independent_points(&fixed) >= 3 {
                return;
            }
            if point.constant {
                continue;
            }
            let mut candidate = fixed.clone();
            candidate.push(point.position);
            if independent_points(&candidate) > independent_points(&fixed) {
                point.constant = true;
                fixed = candidate;
            }
        }
        if independent_points(&fixed) < 3 {
            warn!("could not fix the gauge with three non-collinear points");
        }
    }

    fn add_position_priors(
        &mut self,
        prior_options: &PosePriorBundleAdjustmentOptions,
        priors: &HashMap<ImageId, PosePrior>,
    ) -> usize {
        let loss = if prior_options.use_robust_loss_on_prior_position {
            LossFunction::Cauchy {
                scale: prior_options.prior_position_loss_scale,
            }
        } else {
            LossFunction::Trivial
        };
        let mut num_priors = 0;
        for &image_id in &self.config.image_ids {
            let Some(prior) = priors.get(&image_id) else {
                continue;
            };
            if prior.coordinate_system != CoordinateSystem::Cartesian || !prior.has_valid_position() {
                continue;
            }
            let frame_id = self.reconstruction.image(image_id).frame_id;
            let (Some(&pose), Some(cam_from_rig)) =
                (self.frames.get(&frame_id), self.cam_from_rig(image_id))
            else {
                continue;
            };
            self.problem.add_prior(PositionPrior {
                pose,
                cam_from_rig,
                position: prior.position,
                sqrt_information: prior
                    .position_sqrt_information()
                    .unwrap_or_else(Matrix3::identity),
                loss,
            });
            num_priors += 1;
        }
        num_priors
    }

    fn into_blocks(self) -> ProblemBlocks {
        ProblemBlocks {
            problem: self.problem,
            cameras: self.cameras,
            frames: self.frames,
            points: self.points,
        }
    }
}

/// A solved problem together with the scene entity behind every block.
struct ProblemBlocks {
    problem: BundleAdjustmentProblem,
    cameras: BTreeMap<CameraId, usize>,
    frames: BTreeMap<FrameId, usize>,
    points: BTreeMap<Point3DId, usize>,
}

impl ProblemBlocks {
    fn write_back(&self, reconstruction: &mut Reconstruction) {
        for (&camera_id, &ix) in &self.cameras {
            let block = &self.problem.cameras[ix];
            if !block.variable_params.is_empty() {
                reconstruction.camera_mut(camera_id).params = block.camera.params.clone();
            }
        }
        for (&frame_id, &ix) in &self.frames {
            let block = &self.problem.poses[ix];
            if !block.constant {
                if let Err(e) = reconstruction.set_rig_from_world(frame_id, block.rig_from_world) {
                    error!("failed to update frame {}: {}", frame_id, e);
                }
            }
        }
        for (&point3d_id, &ix) in &self.points {
            let block = &self.problem.points[ix];
            if !block.constant {
                reconstruction.point3d_mut(point3d_id).position = block.position;
            }
        }
    }
}

/// Number of points needed to span the affine hull of the points, capped at three.
fn independent_points(points: &[Point3<f64>]) -> usize {
    let Some(first) = points.first() else {
        return 0;
    };
    let directions: Vec<_> = points[1..]
        .iter()
        .map(|p| p - first)
        .filter(|d| d.norm() > 1e-9)
        .collect();
    let Some(direction) = directions.first() else {
        return 1;
    };
    let direction = direction.normalize();
    let off_line = directions
        .iter()
        .any(|d| d.normalize().cross(&direction).norm() > 1e-6);
    if off_line {
        3
    } else {
        2
    }
}

/// Jointly refines the cameras, frames and points selected by a [`BundleAdjustmentConfig`].
///
/// With position priors, the reconstruction is first aligned to the priors and the priors replace
/// the gauge of the configuration.
#[derive(Debug, Clone)]
pub struct BundleAdjuster {
    options: BundleAdjustmentOptions,
    config: BundleAdjustmentConfig,
    priors: Option<(PosePriorBundleAdjustmentOptions, HashMap<ImageId, PosePrior>)>,
}

impl BundleAdjuster {
    pub fn new(options: BundleAdjustmentOptions, config: BundleAdjustmentConfig) -> Self {
        Self {
            options,
            config,
            priors: None,
        }
    }

    pub fn with_pose_priors(
        self,
        prior_options: PosePriorBundleAdjustmentOptions,
        priors: HashMap<ImageId, PosePrior>,
    ) -> Self {
        Self {
            priors: Some((prior_options, priors)),
            ..self
        }
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    /// Runs the adjustment. The reconstruction is only updated with a usable solution.
    pub fn solve(
        &self,
        reconstruction: &mut Reconstruction,
        callbacks: &[&dyn IterationCallback],
    ) -> BundleAdjustmentSummary {
        let use_priors = match &self.priors {
            Some((_, priors)) => {
                let num_priors = self
                    .config
                    .image_ids
                    .iter()
                    .filter(|&id| {
                        priors.get(id).map_or(false, |p| {
                            p.coordinate_system == CoordinateSystem::Cartesian
                                && p.has_valid_position()
                        }) && reconstruction.is_image_registered(*id)
                    })
                    .count();
                num_priors >= 3 && reconstruction.align_to_pose_priors(priors).is_some()
            }
            None => false,
        };

        let mut builder = ProblemBuilder::new(reconstruction, &self.options, &self.config);
        builder.add_images();
        builder.add_points();
        match &self.priors {
            Some((prior_options, priors)) if use_priors => {
                let num_priors = builder.add_position_priors(prior_options, priors);
                debug!("added {} position priors to bundle adjustment", num_priors);
            }
            _ => match self.config.gauge {
                BundleAdjustmentGauge::Unspecified => {}
                BundleAdjustmentGauge::TwoCamsFromWorld => {
                    builder.fix_gauge_with_two_cams_from_world()
                }
                BundleAdjustmentGauge::ThreePoints => builder.fix_gauge_with_three_points(),
            },
        }

        let summary = builder.problem.solve(&self.options.solver, callbacks);
        debug!(
            "bundle adjustment of {} images and {} points: {:?}, cost {:.6} -> {:.6}",
            builder.frames.len(),
            builder.points.len(),
            summary.termination,
            summary.initial_cost,
            summary.final_cost,
        );
        if summary.is_solution_usable() {
            builder.into_blocks().write_back(reconstruction);
        }
        summary
    }
}
