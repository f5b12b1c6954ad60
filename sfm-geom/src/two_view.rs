use crate::{triangulation::triangulation_angles, EightPoint, EssentialMatrix};
use sfm_core::{
    nalgebra::Point3,
    sample_consensus::Consensus,
    CameraToCamera, FeatureMatch, NormalizedKeyPoint, Pose, WorldToCamera,
};

/// The relative pose between two images along with the structure it explains.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoViewPose {
    /// Relative pose with a unit length translation.
    pub cam2_from_cam1: CameraToCamera,
    /// Indices of the matches that are geometric inliers.
    pub inliers: Vec<usize>,
    /// Points in the first camera frame that passed the cheirality test.
    pub points: Vec<Point3<f64>>,
    /// Median triangulation angle of `points` in radians.
    pub tri_angle: f64,
}

/// Estimates the relative pose from putative matches.
///
/// The essential matrix is found with the [`EightPoint`] estimator inside the given consensus
/// algorithm. The decomposition that places the most inliers in front of both cameras is kept.
pub fn estimate_two_view_pose<C>(
    consensus: &mut C,
    matches: &[FeatureMatch<NormalizedKeyPoint>],
) -> Option<TwoViewPose>
where
    C: Consensus<EightPoint, FeatureMatch<NormalizedKeyPoint>>,
{
    let (pose, inliers) = consensus.model_inliers(&EightPoint::new(), matches.iter().copied())?;
    let inliers: Vec<usize> = inliers.into_iter().collect();
    log::trace!(
        "eight point consensus found {} of {} inliers",
        inliers.len(),
        matches.len()
    );
    let inlier_matches: Vec<_> = inliers.iter().map(|&ix| matches[ix]).collect();
    let (cam2_from_cam1, points) =
        EssentialMatrix::from(pose).pose_from_matches(&inlier_matches)?;
    Some(TwoViewPose {
        tri_angle: median_tri_angle(cam2_from_cam1, &points),
        cam2_from_cam1,
        inliers,
        points,
    })
}

/// Evaluates a known relative pose against geometrically verified matches.
///
/// This is used when the relative pose was already stored alongside the matches. Every match is
/// treated as an inlier, while only the points in front of both cameras contribute to the
/// triangulation angle.
pub fn evaluate_two_view_pose(
    cam2_from_cam1: CameraToCamera,
    matches: &[FeatureMatch<NormalizedKeyPoint>],
) -> Option<TwoViewPose> {
    let norm = cam2_from_cam1.0.translation.vector.norm();
    if norm == 0.0 {
        return None;
    }
    let cam2_from_cam1 = cam2_from_cam1.scale(norm.recip());
    let cam1 = WorldToCamera::identity();
    let cam2 = WorldToCamera(cam2_from_cam1.0);
    let points: Vec<Point3<f64>> = matches
        .iter()
        .filter_map(|&FeatureMatch(a, b)| {
            crate::triangulation::triangulate_point(cam1, cam2, a, b)
        })
        .filter(|p| p.z > f64::EPSILON && cam2.transform_point(p).z > f64::EPSILON)
        .collect();
    if points.is_empty() {
        return None;
    }
    Some(TwoViewPose {
        tri_angle: median_tri_angle(cam2_from_cam1, &points),
        cam2_from_cam1,
        inliers: (0..matches.len()).collect(),
        points,
    })
}

fn median_tri_angle(cam2_from_cam1: CameraToCamera, points: &[Point3<f64>]) -> f64 {
    let center2 = WorldToCamera(cam2_from_cam1.0).center();
    let mut angles = triangulation_angles(&Point3::origin(), &center2, points);
    median(&mut angles)
}

/// Median of the values, averaging the two middle values for even lengths.
///
/// Returns `0.0` for an empty slice.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by_key(|&v| float_ord::FloatOrd(v));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arrsac::Arrsac;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use sfm_core::nalgebra::{Point2, Rotation3, Vector3};

    fn matches(pose: CameraToCamera) -> Vec<FeatureMatch<NormalizedKeyPoint>> {
        (0..60)
            .map(|i| {
                let point = Point3::new(
                    (i % 10) as f64 * 0.3 - 1.5,
                    (i / 10) as f64 * 0.3 - 0.9,
                    4.0 + ((i * 7) % 5) as f64 * 0.5,
                );
                let a = NormalizedKeyPoint((point.xy().coords / point.z).into());
                let pb = pose.0.transform_point(&point);
                let b = NormalizedKeyPoint((pb.xy().coords / pb.z).into());
                FeatureMatch(a, b)
            })
            .collect()
    }

    #[test]
    fn estimates_pose_despite_outliers() {
        let pose = CameraToCamera::from_parts(
            Vector3::new(-1.0, 0.1, 0.05),
            Rotation3::from_euler_angles(0.02, 0.1, -0.05),
        );
        let mut matches = matches(pose);
        for (i, m) in matches.iter_mut().enumerate().filter(|(i, _)| i % 10 == 3) {
            m.1 = NormalizedKeyPoint(Point2::new(0.3 - i as f64 * 0.01, -0.2));
        }
        let mut consensus = Arrsac::new(1e-6, Xoshiro256PlusPlus::seed_from_u64(0));
        let two_view = estimate_two_view_pose(&mut consensus, &matches).unwrap();
        assert!(two_view.inliers.iter().all(|ix| ix % 10 != 3));
        assert!(
            two_view
                .cam2_from_cam1
                .0
                .rotation
                .rotation_to(&pose.0.rotation)
                .angle()
                < 1e-6
        );
        assert!(two_view.tri_angle > 0.0);
    }

    #[test]
    fn known_pose_is_normalized() {
        let pose = CameraToCamera::from_parts(Vector3::new(-3.0, 0.0, 0.0), Rotation3::identity());
        let two_view = evaluate_two_view_pose(pose, &matches(pose)).unwrap();
        assert!((two_view.cam2_from_cam1.0.translation.vector.norm() - 1.0).abs() < 1e-12);
        assert_eq!(two_view.points.len(), 60);
    }

    #[test]
    fn median_of_even_length() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
    }
}
