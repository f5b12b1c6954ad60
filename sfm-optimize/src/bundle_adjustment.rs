use crate::{CallbackReturn, IterationCallback, IterationSummary, LossFunction};
use core::cell::Cell;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use sfm_core::{
    nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point3, Vector2, Vector3, Vector6},
    Camera, CameraToCamera, KeyPoint, Pose, WorldToCamera,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The intrinsics of one camera and which of its parameters are refined.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraBlock {
    pub camera: Camera,
    /// Indices into `camera.params` that are variable. Empty for a constant camera.
    pub variable_params: Vec<usize>,
}

/// The pose of a rig (or of a single camera when it has no rig).
#[derive(Debug, Clone, PartialEq)]
pub struct PoseBlock {
    pub rig_from_world: WorldToCamera,
    pub constant: bool,
    /// Translation coordinates that stay fixed even when the pose is variable.
    pub constant_translation: Vec<usize>,
}

impl PoseBlock {
    pub fn variable(rig_from_world: WorldToCamera) -> Self {
        Self {
            rig_from_world,
            constant: false,
            constant_translation: vec![],
        }
    }

    pub fn constant(rig_from_world: WorldToCamera) -> Self {
        Self {
            constant: true,
            ..Self::variable(rig_from_world)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointBlock {
    pub position: Point3<f64>,
    pub constant: bool,
}

/// One keypoint observing one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub camera: usize,
    pub pose: usize,
    /// Pose of the observing camera in its rig. `None` means the camera is the rig.
    pub cam_from_rig: Option<CameraToCamera>,
    pub point: usize,
    pub keypoint: KeyPoint,
}

/// A soft constraint on the position of a camera center in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionPrior {
    pub pose: usize,
    pub cam_from_rig: Option<CameraToCamera>,
    pub position: Point3<f64>,
    /// Square root of the inverse position covariance.
    pub sqrt_information: Matrix3<f64>,
    pub loss: LossFunction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SolverOptions {
    /// Relative reduction of the cost below which the solver stops.
    pub function_tolerance: f64,
    /// Orthogonality between the residuals and the Jacobian columns below which the solver stops.
    pub gradient_tolerance: f64,
    /// Relative change of the parameters below which the solver stops.
    pub parameter_tolerance: f64,
    pub max_num_iterations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            function_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-10,
            max_num_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum BundleAdjustmentTermination {
    /// Converged or ran out of iterations with a usable solution.
    Success,
    /// The solver failed numerically. The inputs were left unchanged.
    Failure,
    /// A callback stopped the solver.
    UserTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BundleAdjustmentSummary {
    pub termination: BundleAdjustmentTermination,
    pub num_iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub num_residuals: usize,
    pub num_parameters: usize,
}

impl BundleAdjustmentSummary {
    pub fn is_solution_usable(&self) -> bool {
        self.termination != BundleAdjustmentTermination::Failure
    }
}

/// Reprojection error least squares over cameras, rig poses and points.
///
/// Residuals are measured in pixels. Each observation contributes a two dimensional block and each
/// position prior a three dimensional block whitened by its `sqrt_information`. The loss of the
/// problem is applied to every observation block.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjustmentProblem {
    pub cameras: Vec<CameraBlock>,
    pub poses: Vec<PoseBlock>,
    pub points: Vec<PointBlock>,
    pub observations: Vec<Observation>,
    pub priors: Vec<PositionPrior>,
    pub loss: LossFunction,
}

impl BundleAdjustmentProblem {
    pub fn new(loss: LossFunction) -> Self {
        Self {
            loss,
            ..Default::default()
        }
    }

    pub fn add_camera(&mut self, camera: Camera, variable_params: Vec<usize>) -> usize {
        self.cameras.push(CameraBlock {
            camera,
            variable_params,
        });
        self.cameras.len() - 1
    }

    pub fn add_pose(&mut self, pose: PoseBlock) -> usize {
        self.poses.push(pose);
        self.poses.len() - 1
    }

    pub fn add_point(&mut self, position: Point3<f64>, constant: bool) -> usize {
        self.points.push(PointBlock { position, constant });
        self.points.len() - 1
    }

    pub fn add_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn add_prior(&mut self, prior: PositionPrior) {
        self.priors.push(prior);
    }

    /// Number of scalar parameters the solver refines.
    pub fn num_parameters(&self) -> usize {
        Layout::new(self).slots.len()
    }

    pub fn num_residuals(&self) -> usize {
        2 * self.observations.len() + 3 * self.priors.len()
    }

    /// Current value of `½ Σ ρ(s)` over all residual blocks.
    pub fn cost(&self) -> f64 {
        let state = State::new(self);
        0.5 * state.residuals(self).norm_squared()
    }

    /// Refines the variable parameters in place.
    ///
    /// The blocks are only updated when the solution is usable. When a callback stops the solver
    /// they are updated only if the cost did not increase.
    pub fn solve(
        &mut self,
        options: &SolverOptions,
        callbacks: &[&dyn IterationCallback],
    ) -> BundleAdjustmentSummary {
        let layout = Layout::new(self);
        let num_parameters = layout.slots.len();
        let num_residuals = self.num_residuals();
        let initial = State::new(self);
        let initial_cost = 0.5 * initial.residuals(self).norm_squared();

        let least_squares = LeastSquares {
            problem: self,
            layout,
            state: initial,
            callbacks,
            max_num_iterations: options.max_num_iterations,
            iteration: Cell::new(0),
            reached_iteration_limit: Cell::new(false),
        };
        let (least_squares, report) = LevenbergMarquardt::new()
            .with_ftol(options.function_tolerance)
            .with_xtol(options.parameter_tolerance)
            .with_gtol(options.gradient_tolerance)
            .with_patience(options.max_num_iterations.max(1))
            .minimize(least_squares);
        let num_iterations = least_squares.iteration.get();
        let reached_iteration_limit = least_squares.reached_iteration_limit.get();
        let state = least_squares.state;
        let final_cost = 0.5 * state.residuals(self).norm_squared();

        let mut termination = match report.termination {
            TerminationReason::User(_) if reached_iteration_limit => {
                BundleAdjustmentTermination::Success
            }
            TerminationReason::User(_) => BundleAdjustmentTermination::UserTerminated,
            TerminationReason::LostPatience
            | TerminationReason::NoParameters
            | TerminationReason::NoResiduals => BundleAdjustmentTermination::Success,
            reason if reason.was_successful() => BundleAdjustmentTermination::Success,
            reason => {
                log::debug!("bundle adjustment failed: {:?}", reason);
                BundleAdjustmentTermination::Failure
            }
        };
        if !final_cost.is_finite() {
            termination = BundleAdjustmentTermination::Failure;
        }

        let write_back = match termination {
            BundleAdjustmentTermination::Success => true,
            BundleAdjustmentTermination::UserTerminated => final_cost <= initial_cost,
            BundleAdjustmentTermination::Failure => false,
        };
        if write_back {
            state.write_back(self);
        }

        log::debug!(
            "bundle adjustment with {} residuals and {} parameters: cost {} -> {} in {} iterations ({:?})",
            num_residuals,
            num_parameters,
            initial_cost,
            final_cost,
            num_iterations,
            termination,
        );

        BundleAdjustmentSummary {
            termination,
            num_iterations,
            initial_cost,
            final_cost: if write_back { final_cost } else { initial_cost },
            num_residuals,
            num_parameters,
        }
    }

    fn observation_residual(
        &self,
        observation: &Observation,
        params: &[f64],
        rig_from_world: &Vector6<f64>,
        point: &Point3<f64>,
    ) -> Vector2<f64> {
        let cam_from_world = cam_from_world(observation.cam_from_rig, rig_from_world);
        let camera_point = cam_from_world.transform_point(point);
        if camera_point.z <= f64::EPSILON {
            return Vector2::zeros();
        }
        let camera = &self.cameras[observation.camera].camera;
        let pixel = camera
            .model
            .img_from_cam(params, camera_point.xy().coords / camera_point.z);
        let residual = pixel - observation.keypoint.0;
        residual * self.loss.residual_scale(residual.norm_squared())
    }

    fn prior_residual(&self, prior: &PositionPrior, rig_from_world: &Vector6<f64>) -> Vector3<f64> {
        let center = cam_from_world(prior.cam_from_rig, rig_from_world).center();
        let residual = prior.sqrt_information * (center - prior.position);
        residual * prior.loss.residual_scale(residual.norm_squared())
    }
}

fn cam_from_world(cam_from_rig: Option<CameraToCamera>, rig_from_world: &Vector6<f64>) -> WorldToCamera {
    let rig_from_world = WorldToCamera::from_se3(*rig_from_world);
    match cam_from_rig {
        Some(cam_from_rig) => cam_from_rig * rig_from_world,
        None => rig_from_world,
    }
}

/// A single scalar the solver refines.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Camera { block: usize, param: usize },
    Pose { block: usize, coord: usize },
    Point { block: usize, coord: usize },
}

/// Columns of the Jacobian owned by each block, as `(column, local index)`.
struct Layout {
    slots: Vec<Slot>,
    camera_columns: Vec<Vec<(usize, usize)>>,
    pose_columns: Vec<Vec<(usize, usize)>>,
    point_columns: Vec<Vec<(usize, usize)>>,
}

impl Layout {
    fn new(problem: &BundleAdjustmentProblem) -> Self {
        let mut slots = vec![];
        let camera_columns = problem
            .cameras
            .iter()
            .enumerate()
            .map(|(block, camera)| {
                camera
                    .variable_params
                    .iter()
                    .map(|&param| {
                        slots.push(Slot::Camera { block, param });
                        (slots.len() - 1, param)
                    })
                    .collect()
            })
            .collect();
        let pose_columns = problem
            .poses
            .iter()
            .enumerate()
            .map(|(block, pose)| {
                (0..6)
                    .filter(|coord| {
                        !pose.constant && !(*coord < 3 && pose.constant_translation.contains(coord))
                    })
                    .map(|coord| {
                        slots.push(Slot::Pose { block, coord });
                        (slots.len() - 1, coord)
                    })
                    .collect()
            })
            .collect();
        let point_columns = problem
            .points
            .iter()
            .enumerate()
            .map(|(block, point)| {
                (0..3)
                    .filter(|_| !point.constant)
                    .map(|coord| {
                        slots.push(Slot::Point { block, coord });
                        (slots.len() - 1, coord)
                    })
                    .collect()
            })
            .collect();
        Self {
            slots,
            camera_columns,
            pose_columns,
            point_columns,
        }
    }
}

/// The values of every block in the parametrization used by the solver.
#[derive(Clone)]
struct State {
    camera_params: Vec<Vec<f64>>,
    poses: Vec<Vector6<f64>>,
    points: Vec<Point3<f64>>,
}

impl State {
    fn new(problem: &BundleAdjustmentProblem) -> Self {
        Self {
            camera_params: problem
                .cameras
                .iter()
                .map(|c| c.camera.params.clone())
                .collect(),
            poses: problem.poses.iter().map(|p| p.rig_from_world.se3()).collect(),
            points: problem.points.iter().map(|p| p.position).collect(),
        }
    }

    fn get(&self, slot: Slot) -> f64 {
        match slot {
            Slot::Camera { block, param } => self.camera_params[block][param],
            Slot::Pose { block, coord } => self.poses[block][coord],
            Slot::Point { block, coord } => self.points[block][coord],
        }
    }

    fn set(&mut self, slot: Slot, value: f64) {
        match slot {
            Slot::Camera { block, param } => self.camera_params[block][param] = value,
            Slot::Pose { block, coord } => self.poses[block][coord] = value,
            Slot::Point { block, coord } => self.points[block][coord] = value,
        }
    }

    fn residuals(&self, problem: &BundleAdjustmentProblem) -> DVector<f64> {
        let mut residuals = DVector::zeros(problem.num_residuals());
        for (ix, observation) in problem.observations.iter().enumerate() {
            let residual = problem.observation_residual(
                observation,
                &self.camera_params[observation.camera],
                &self.poses[observation.pose],
                &self.points[observation.point],
            );
            residuals.fixed_rows_mut::<2>(2 * ix).copy_from(&residual);
        }
        let offset = 2 * problem.observations.len();
        for (ix, prior) in problem.priors.iter().enumerate() {
            let residual = problem.prior_residual(prior, &self.poses[prior.pose]);
            residuals
                .fixed_rows_mut::<3>(offset + 3 * ix)
                .copy_from(&residual);
        }
        residuals
    }

    fn write_back(&self, problem: &mut BundleAdjustmentProblem) {
        for (block, params) in problem.cameras.iter_mut().zip(&self.camera_params) {
            if !block.variable_params.is_empty() {
                block.camera.params.clone_from(params);
            }
        }
        for (block, se3) in problem.poses.iter_mut().zip(&self.poses) {
            if !block.constant {
                block.rig_from_world = WorldToCamera::from_se3(*se3);
            }
        }
        for (block, &position) in problem.points.iter_mut().zip(&self.points) {
            if !block.constant {
                block.position = position;
            }
        }
    }
}

struct LeastSquares<'a> {
    problem: &'a BundleAdjustmentProblem,
    layout: Layout,
    state: State,
    callbacks: &'a [&'a dyn IterationCallback],
    max_num_iterations: usize,
    iteration: Cell<usize>,
    reached_iteration_limit: Cell<bool>,
}

fn step_size(value: f64) -> f64 {
    1e-6 * value.abs().max(1.0)
}

impl<'a> LeastSquares<'a> {
    /// Invokes the callbacks once per solver iteration.
    fn should_continue(&self) -> bool {
        let iteration = self.iteration.get();
        if iteration >= self.max_num_iterations {
            self.reached_iteration_limit.set(true);
            return false;
        }
        let summary = IterationSummary {
            iteration,
            cost: 0.5 * self.state.residuals(self.problem).norm_squared(),
        };
        self.iteration.set(iteration + 1);
        self.callbacks
            .iter()
            .all(|callback| callback.on_iteration(&summary) == CallbackReturn::Continue)
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for LeastSquares<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        for (&slot, &value) in self.layout.slots.iter().zip(x.iter()) {
            self.state.set(slot, value);
        }
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.layout.slots.len(),
            self.layout.slots.iter().map(|&slot| self.state.get(slot)),
        )
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.state.residuals(self.problem))
    }

    /// Central differences, evaluating only the residual block each column touches.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        if !self.should_continue() {
            return None;
        }
        let problem = self.problem;
        let state = &self.state;
        let mut jacobian = DMatrix::zeros(problem.num_residuals(), self.layout.slots.len());

        for (ix, observation) in problem.observations.iter().enumerate() {
            let params = &state.camera_params[observation.camera];
            let pose = &state.poses[observation.pose];
            let point = &state.points[observation.point];
            let mut column = |col: usize, plus: Vector2<f64>, minus: Vector2<f64>, h: f64| {
                jacobian
                    .fixed_view_mut::<2, 1>(2 * ix, col)
                    .copy_from(&((plus - minus) / (2.0 * h)));
            };

            for &(col, local) in &self.layout.camera_columns[observation.camera] {
                let h = step_size(params[local]);
                let mut perturbed = params.clone();
                perturbed[local] += h;
                let plus = problem.observation_residual(observation, &perturbed, pose, point);
                perturbed[local] -= 2.0 * h;
                let minus = problem.observation_residual(observation, &perturbed, pose, point);
                column(col, plus, minus, h);
            }
            for &(col, local) in &self.layout.pose_columns[observation.pose] {
                let h = step_size(pose[local]);
                let mut perturbed = *pose;
                perturbed[local] += h;
                let plus = problem.observation_residual(observation, params, &perturbed, point);
                perturbed[local] -= 2.0 * h;
                let minus = problem.observation_residual(observation, params, &perturbed, point);
                column(col, plus, minus, h);
            }
            for &(col, local) in &self.layout.point_columns[observation.point] {
                let h = step_size(point[local]);
                let mut perturbed = *point;
                perturbed[local] += h;
                let plus = problem.observation_residual(observation, params, pose, &perturbed);
                perturbed[local] -= 2.0 * h;
                let minus = problem.observation_residual(observation, params, pose, &perturbed);
                column(col, plus, minus, h);
            }
        }

        let offset = 2 * problem.observations.len();
        for (ix, prior) in problem.priors.iter().enumerate() {
            let pose = &state.poses[prior.pose];
            for &(col, local) in &self.layout.pose_columns[prior.pose] {
                let h = step_size(pose[local]);
                let mut perturbed = *pose;
                perturbed[local] += h;
                let plus = problem.prior_residual(prior, &perturbed);
                perturbed[local] -= 2.0 * h;
                let minus = problem.prior_residual(prior, &perturbed);
                jacobian
                    .fixed_view_mut::<3, 1>(offset + 3 * ix, col)
                    .copy_from(&((plus - minus) / (2.0 * h)));
            }
        }
        Some(jacobian)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StopToken;
    use sfm_core::{
        nalgebra::{Rotation3, Vector3},
        CameraModel, CameraModelId,
    };

    fn camera() -> Camera {
        Camera::new(CameraModelId::SimplePinhole, 500.0, 640, 480)
    }

    fn poses() -> Vec<WorldToCamera> {
        vec![
            WorldToCamera::identity(),
            WorldToCamera::from_parts(
                Vector3::new(-1.0, 0.0, 0.0),
                Rotation3::from_euler_angles(0.0, 0.05, 0.0),
            ),
            WorldToCamera::from_parts(
                Vector3::new(-2.0, 0.1, 0.2),
                Rotation3::from_euler_angles(0.02, 0.1, -0.01),
            ),
        ]
    }

    fn points() -> Vec<Point3<f64>> {
        (0..20)
            .map(|i| {
                Point3::new(
                    (i % 5) as f64 * 0.6 - 0.5,
                    (i / 5) as f64 * 0.5 - 0.75,
                    5.0 + ((i * 3) % 4) as f64 * 0.5,
                )
            })
            .collect()
    }

    /// Exact observations of the true scene with perturbed variable blocks.
    fn noisy_problem() -> BundleAdjustmentProblem {
        let camera = camera();
        let mut problem = BundleAdjustmentProblem::new(LossFunction::Trivial);
        problem.add_camera(camera.clone(), vec![]);
        for (ix, &pose) in poses().iter().enumerate() {
            if ix < 2 {
                problem.add_pose(PoseBlock::constant(pose));
            } else {
                let perturbed = WorldToCamera::from_parts(
                    pose.0.translation.vector + Vector3::new(0.05, -0.03, 0.02),
                    pose.0.rotation,
                );
                problem.add_pose(PoseBlock::variable(perturbed));
            }
        }
        for (ix, point) in points().iter().enumerate() {
            let offset = Vector3::new(0.03, -0.02, 0.05) * if ix % 2 == 0 { 1.0 } else { -1.0 };
            let block = problem.add_point(point + offset, false);
            for (pose_ix, pose) in poses().iter().enumerate() {
                let keypoint = camera.uncalibrate(pose.project(point).unwrap());
                problem.add_observation(Observation {
                    camera: 0,
                    pose: pose_ix,
                    cam_from_rig: None,
                    point: block,
                    keypoint,
                });
            }
        }
        problem
    }

    #[test]
    fn converges_to_exact_scene() {
        let mut problem = noisy_problem();
        let summary = problem.solve(&SolverOptions::default(), &[]);
        assert_eq!(summary.termination, BundleAdjustmentTermination::Success);
        assert_eq!(summary.num_residuals, 2 * 3 * 20);
        assert_eq!(summary.num_parameters, 6 + 3 * 20);
        assert!(summary.final_cost < 1e-6 * summary.initial_cost);
        assert_eq!(problem.poses[0].rig_from_world, poses()[0]);
        assert_eq!(problem.poses[1].rig_from_world, poses()[1]);
        for (block, truth) in problem.points.iter().zip(points()) {
            assert!((block.position - truth).norm() < 1e-4);
        }
        let translation = problem.poses[2].rig_from_world.0.translation.vector;
        assert!((translation - poses()[2].0.translation.vector).norm() < 1e-4);
    }

    #[test]
    fn stopped_token_leaves_problem_unchanged() {
        let mut problem = noisy_problem();
        let before = problem.points.clone();
        let token = StopToken::new();
        token.stop();
        let summary = problem.solve(&SolverOptions::default(), &[&token]);
        assert_eq!(summary.termination, BundleAdjustmentTermination::UserTerminated);
        assert!(summary.is_solution_usable());
        assert_eq!(problem.points, before);
    }

    #[test]
    fn constant_translation_coordinate_is_kept() {
        let mut problem = noisy_problem();
        problem.poses[2].constant_translation = vec![0];
        let x = problem.poses[2].rig_from_world.0.translation.vector.x;
        assert_eq!(problem.num_parameters(), 5 + 3 * 20);
        problem.solve(&SolverOptions::default(), &[]);
        assert_eq!(problem.poses[2].rig_from_world.0.translation.vector.x, x);
    }

    #[test]
    fn consistent_prior_does_not_bias_solution() {
        let mut problem = noisy_problem();
        problem.add_prior(PositionPrior {
            pose: 2,
            cam_from_rig: None,
            position: poses()[2].center(),
            sqrt_information: Matrix3::identity() * 10.0,
            loss: LossFunction::Cauchy { scale: 1.0 },
        });
        assert_eq!(problem.num_residuals(), 2 * 3 * 20 + 3);
        let summary = problem.solve(&SolverOptions::default(), &[]);
        assert!(summary.is_solution_usable());
        let center = problem.poses[2].rig_from_world.center();
        assert!((center - poses()[2].center()).norm() < 1e-4);
    }
}
