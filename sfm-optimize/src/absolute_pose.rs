use crate::{BundleAdjustmentProblem, LossFunction, Observation, PoseBlock, SolverOptions};
use sfm_core::{nalgebra::Point3, Camera, KeyPoint, WorldToCamera};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Options for refining a single camera pose against known points.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct AbsolutePoseRefinementOptions {
    pub solver: SolverOptions,
    /// Scale in pixels of the Cauchy loss applied to every reprojection error.
    pub loss_function_scale: f64,
    pub refine_focal_length: bool,
    pub refine_extra_params: bool,
}

impl Default for AbsolutePoseRefinementOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            loss_function_scale: 1.0,
            refine_focal_length: true,
            refine_extra_params: true,
        }
    }
}

/// Refines `cam_from_world` and optionally the focal length and distortion of `camera` from
/// keypoint to point correspondences. The points are held constant.
///
/// Returns `false` and leaves the inputs untouched when the solver fails.
pub fn refine_absolute_pose(
    options: &AbsolutePoseRefinementOptions,
    keypoints: &[KeyPoint],
    points: &[Point3<f64>],
    cam_from_world: &mut WorldToCamera,
    camera: &mut Camera,
) -> bool {
    assert_eq!(
        keypoints.len(),
        points.len(),
        "keypoints and points must correspond"
    );
    let mut variable_params = vec![];
    if options.refine_focal_length {
        variable_params.extend_from_slice(camera.model.focal_length_idxs());
    }
    if options.refine_extra_params {
        variable_params.extend_from_slice(camera.model.extra_params_idxs());
    }

    let mut problem = BundleAdjustmentProblem::new(LossFunction::Cauchy {
        scale: options.loss_function_scale,
    });
    problem.add_camera(camera.clone(), variable_params);
    problem.add_pose(PoseBlock::variable(*cam_from_world));
    for (&keypoint, &point) in keypoints.iter().zip(points) {
        let point = problem.add_point(point, true);
        problem.add_observation(Observation {
            camera: 0,
            pose: 0,
            cam_from_rig: None,
            point,
            keypoint,
        });
    }

    let summary = problem.solve(&options.solver, &[]);
    if !summary.is_solution_usable() {
        log::debug!("absolute pose refinement failed");
        return false;
    }
    *cam_from_world = problem.poses[0].rig_from_world;
    camera.params.clone_from(&problem.cameras[0].camera.params);
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use sfm_core::{
        nalgebra::{Rotation3, Vector3},
        CameraModel, CameraModelId, Pose,
    };

    #[test]
    fn recovers_perturbed_pose() {
        let camera = Camera::new(CameraModelId::SimpleRadial, 700.0, 800, 600);
        let truth = WorldToCamera::from_parts(
            Vector3::new(0.2, -0.1, 4.0),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        );
        let points: Vec<Point3<f64>> = (0..30)
            .map(|i| {
                Point3::new(
                    (i % 6) as f64 * 0.4 - 1.0,
                    (i / 6) as f64 * 0.4 - 0.8,
                    ((i * 5) % 7) as f64 * 0.3,
                )
            })
            .collect();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| camera.uncalibrate(truth.project(p).unwrap()))
            .collect();

        let mut pose = WorldToCamera::from_parts(
            truth.0.translation.vector + Vector3::new(0.05, 0.05, -0.1),
            Rotation3::from_euler_angles(0.06, -0.09, 0.02),
        );
        let mut refined_camera = camera.clone();
        let options = AbsolutePoseRefinementOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        assert!(refine_absolute_pose(
            &options,
            &keypoints,
            &points,
            &mut pose,
            &mut refined_camera
        ));
        assert!((pose.0.translation.vector - truth.0.translation.vector).norm() < 1e-6);
        assert!(pose.0.rotation.rotation_to(&truth.0.rotation).angle() < 1e-6);
        assert_eq!(refined_camera, camera);
    }
}
