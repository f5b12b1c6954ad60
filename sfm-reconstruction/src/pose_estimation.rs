use arrsac::Arrsac;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::{
    nalgebra::Point3, Camera, CameraModel, CameraToCamera, FeatureMatch, FeatureWorldMatch,
    KeyPoint, Projective, WorldPoint, WorldToCamera,
};
use sfm_geom::{
    absolute_pose::estimate_absolute_pose,
    two_view::{estimate_two_view_pose, evaluate_two_view_pose, TwoViewPose},
};
use sfm_optimize::{refine_absolute_pose, AbsolutePoseRefinementOptions};

/// Acceptance thresholds for a robustly estimated absolute pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbsolutePoseEstimationOptions {
    /// Maximum reprojection error in pixels of an inlier.
    pub max_error: f64,
    pub min_num_inliers: usize,
    pub min_inlier_ratio: f64,
    pub random_seed: u64,
}

/// A pose that passed the acceptance thresholds and was refined on its inliers.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatedPose {
    pub cam_from_world: WorldToCamera,
    /// Indices of the inlier correspondences.
    pub inliers: Vec<usize>,
}

/// Estimates the pose of a camera from keypoint to point correspondences.
///
/// The pose is estimated with the P3P solver inside ARRSAC, checked against the inlier count
/// and ratio thresholds and then refined on the inliers. The refinement may also update the
/// intrinsics of `camera` according to `refinement`.
pub fn estimate_and_refine_absolute_pose(
    options: &AbsolutePoseEstimationOptions,
    refinement: &AbsolutePoseRefinementOptions,
    camera: &mut Camera,
    keypoints: &[KeyPoint],
    points: &[Point3<f64>],
) -> Option<EstimatedPose> {
    let matches: Vec<FeatureWorldMatch<_>> = keypoints
        .iter()
        .zip(points)
        .map(|(&keypoint, &point)| {
            FeatureWorldMatch(camera.calibrate(keypoint), WorldPoint::from_point(point))
        })
        .collect();
    let threshold = camera.cam_from_img_threshold(options.max_error);
    let mut consensus = Arrsac::new(threshold, Xoshiro256PlusPlus::seed_from_u64(options.random_seed));
    let estimate = estimate_absolute_pose(&mut consensus, &matches, threshold)?;

    let num_inliers = estimate.inliers.len();
    let inlier_ratio = num_inliers as f64 / matches.len() as f64;
    if num_inliers < options.min_num_inliers || inlier_ratio < options.min_inlier_ratio {
        debug!(
            "absolute pose has {} inliers (ratio {:.3}), rejecting",
            num_inliers, inlier_ratio
        );
        return None;
    }

    let inlier_keypoints: Vec<KeyPoint> = estimate.inliers.iter().map(|&ix| keypoints[ix]).collect();
    let inlier_points: Vec<Point3<f64>> = estimate.inliers.iter().map(|&ix| points[ix]).collect();
    let mut cam_from_world = estimate.cam_from_world;
    if !refine_absolute_pose(
        refinement,
        &inlier_keypoints,
        &inlier_points,
        &mut cam_from_world,
        camera,
    ) {
        return None;
    }
    Some(EstimatedPose {
        cam_from_world,
        inliers: estimate.inliers,
    })
}

/// Relative pose between two images from their verified matches.
///
/// A stored relative pose is only evaluated. Otherwise the pose is estimated with the eight point
/// algorithm inside ARRSAC with a threshold of `max_error` pixels.
#[allow(clippy::too_many_arguments)]
pub fn estimate_relative_pose(
    camera1: &Camera,
    camera2: &Camera,
    keypoints1: &[KeyPoint],
    keypoints2: &[KeyPoint],
    matches: &[(usize, usize)],
    stored: Option<CameraToCamera>,
    max_error: f64,
    random_seed: u64,
) -> Option<TwoViewPose> {
    let normalized: Vec<FeatureMatch<_>> = matches
        .iter()
        .map(|&(ix1, ix2)| {
            FeatureMatch(
                camera1.calibrate(keypoints1[ix1]),
                camera2.calibrate(keypoints2[ix2]),
            )
        })
        .collect();
    if let Some(cam2_from_cam1) = stored {
        return evaluate_two_view_pose(cam2_from_cam1, &normalized);
    }
    let threshold = 0.5
        * (camera1.cam_from_img_threshold(max_error) + camera2.cam_from_img_threshold(max_error));
    let mut consensus = Arrsac::new(threshold, Xoshiro256PlusPlus::seed_from_u64(random_seed));
    estimate_two_view_pose(&mut consensus, &normalized)
}

#[cfg(test)]
mod test {
    use super::*;
    use sfm_core::{
        nalgebra::{Rotation3, Vector3},
        CameraModelId, Pose,
    };

    fn scene() -> (Camera, WorldToCamera, Vec<Point3<f64>>) {
        let camera = Camera::new(CameraModelId::SimplePinhole, 600.0, 640, 480);
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.2, -0.1, 5.0),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        );
        let points = (0..60)
            .map(|i| {
                Point3::new(
                    (i % 10) as f64 * 0.3 - 1.5,
                    (i / 10) as f64 * 0.3 - 0.9,
                    ((i * 7) % 5) as f64 * 0.4,
                )
            })
            .collect();
        (camera, pose, points)
    }

    #[test]
    fn registers_with_outliers() {
        let (camera, truth, points) = scene();
        let mut keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| camera.uncalibrate(truth.project(p).unwrap()))
            .collect();
        for keypoint in keypoints.iter_mut().step_by(10) {
            keypoint.0.x += 80.0;
        }
        let options = AbsolutePoseEstimationOptions {
            max_error: 4.0,
            min_num_inliers: 30,
            min_inlier_ratio: 0.25,
            random_seed: 0,
        };
        let refinement = AbsolutePoseRefinementOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        let mut estimated_camera = camera.clone();
        let estimate = estimate_and_refine_absolute_pose(
            &options,
            &refinement,
            &mut estimated_camera,
            &keypoints,
            &points,
        )
        .unwrap();
        assert_eq!(estimate.inliers.len(), 54);
        assert!(estimate.inliers.iter().all(|ix| ix % 10 != 0));
        let error = (estimate.cam_from_world.center() - truth.center()).norm();
        assert!(error < 1e-6);
    }

    #[test]
    fn registers_a_planar_scene() {
        let (camera, truth, _) = scene();
        let points: Vec<Point3<f64>> = (0..48)
            .map(|i| Point3::new((i % 8) as f64 * 0.35 - 1.2, (i / 8) as f64 * 0.35 - 0.9, 0.0))
            .collect();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| camera.uncalibrate(truth.project(p).unwrap()))
            .collect();
        let options = AbsolutePoseEstimationOptions {
            max_error: 2.0,
            min_num_inliers: 30,
            min_inlier_ratio: 0.25,
            random_seed: 5,
        };
        let refinement = AbsolutePoseRefinementOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        let mut estimated_camera = camera.clone();
        let estimate = estimate_and_refine_absolute_pose(
            &options,
            &refinement,
            &mut estimated_camera,
            &keypoints,
            &points,
        )
        .unwrap();
        assert_eq!(estimate.inliers.len(), 48);
        assert!((estimate.cam_from_world.center() - truth.center()).norm() < 1e-6);
    }

    #[test]
    fn rejects_too_few_inliers() {
        let (mut camera, truth, points) = scene();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| camera.uncalibrate(truth.project(p).unwrap()))
            .collect();
        let options = AbsolutePoseEstimationOptions {
            max_error: 4.0,
            min_num_inliers: 100,
            min_inlier_ratio: 0.25,
            random_seed: 0,
        };
        assert!(estimate_and_refine_absolute_pose(
            &options,
            &AbsolutePoseRefinementOptions::default(),
            &mut camera,
            &keypoints,
            &points,
        )
        .is_none());
    }
}
