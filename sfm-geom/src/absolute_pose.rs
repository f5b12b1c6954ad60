use lambda_twist::LambdaTwist;
use sfm_core::{
    sample_consensus::{Consensus, Model},
    FeatureWorldMatch, NormalizedKeyPoint, WorldToCamera,
};

/// A robustly estimated absolute pose.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsolutePose {
    pub cam_from_world: WorldToCamera,
    /// Indices of the correspondences that are inliers of the pose.
    pub inliers: Vec<usize>,
}

/// Estimates the absolute pose with the [`LambdaTwist`] P3P solver inside the given consensus
/// algorithm.
///
/// The inliers are every correspondence whose residual on the virtual image plane is at most
/// `max_error`. The pose is not refined here.
pub fn estimate_absolute_pose<C>(
    consensus: &mut C,
    matches: &[FeatureWorldMatch<NormalizedKeyPoint>],
    max_error: f64,
) -> Option<AbsolutePose>
where
    C: Consensus<LambdaTwist, FeatureWorldMatch<NormalizedKeyPoint>>,
{
    let (cam_from_world, _) = consensus.model_inliers(&LambdaTwist::new(), matches.iter().copied())?;
    let inliers: Vec<usize> = matches
        .iter()
        .enumerate()
        .filter(|(_, m)| cam_from_world.residual(m) <= max_error)
        .map(|(ix, _)| ix)
        .collect();
    log::trace!("p3p consensus found {} of {} inliers", inliers.len(), matches.len());
    Some(AbsolutePose {
        cam_from_world,
        inliers,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use arrsac::Arrsac;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use sfm_core::{
        nalgebra::{Point2, Point3, Rotation3, Vector3},
        Pose, Projective, WorldPoint,
    };

    fn matches(pose: WorldToCamera, points: &[Point3<f64>]) -> Vec<FeatureWorldMatch<NormalizedKeyPoint>> {
        points
            .iter()
            .map(|&point| FeatureWorldMatch(pose.project(&point).unwrap(), WorldPoint::from_point(point)))
            .collect()
    }

    fn true_pose() -> WorldToCamera {
        WorldToCamera::from_parts(
            Vector3::new(0.3, -0.2, 6.0),
            Rotation3::from_euler_angles(0.1, -0.2, 0.05),
        )
    }

    fn assert_close(estimated: WorldToCamera, expected: WorldToCamera, tolerance: f64) {
        assert!((estimated.0.translation.vector - expected.0.translation.vector).norm() < tolerance);
        assert!(estimated.0.rotation.rotation_to(&expected.0.rotation).angle() < tolerance);
    }

    #[test]
    fn consensus_rejects_outliers() {
        let pose = true_pose();
        let points: Vec<Point3<f64>> = (0..40)
            .map(|i| {
                Point3::new(
                    (i % 8) as f64 * 0.5 - 2.0,
                    (i / 8) as f64 * 0.5 - 1.0,
                    ((i * 3) % 7) as f64 * 0.4,
                )
            })
            .collect();
        let mut matches = matches(pose, &points);
        for m in matches.iter_mut().step_by(9) {
            m.0 = NormalizedKeyPoint(Point2::new(m.0.x + 0.2, m.0.y - 0.1));
        }
        let mut consensus = Arrsac::new(1e-4, Xoshiro256PlusPlus::seed_from_u64(1));
        let estimated = estimate_absolute_pose(&mut consensus, &matches, 1e-4).unwrap();
        assert_eq!(estimated.inliers.len(), 40 - 5);
        assert!(estimated.inliers.iter().all(|ix| ix % 9 != 0));
        assert_close(estimated.cam_from_world, pose, 1e-6);
    }

    #[test]
    fn planar_scene_registers() {
        let pose = true_pose();
        let points: Vec<Point3<f64>> = (0..36)
            .map(|i| Point3::new((i % 6) as f64 * 0.6 - 1.5, (i / 6) as f64 * 0.6 - 1.5, 0.0))
            .collect();
        let mut consensus = Arrsac::new(1e-4, Xoshiro256PlusPlus::seed_from_u64(2));
        let estimated = estimate_absolute_pose(&mut consensus, &matches(pose, &points), 1e-4).unwrap();
        assert_eq!(estimated.inliers.len(), 36);
        assert_close(estimated.cam_from_world, pose, 1e-6);
    }

    #[test]
    fn residuals_of_the_estimate_are_small() {
        let pose = true_pose();
        let points: Vec<Point3<f64>> = (0..12)
            .map(|i| Point3::new((i % 4) as f64 - 1.5, (i / 4) as f64 - 1.0, (i % 3) as f64 * 0.7))
            .collect();
        let matches = matches(pose, &points);
        let mut consensus = Arrsac::new(1e-6, Xoshiro256PlusPlus::seed_from_u64(3));
        let estimated = estimate_absolute_pose(&mut consensus, &matches, 1e-6).unwrap();
        for m in &matches {
            assert!(estimated.cam_from_world.residual(m) < 1e-8);
        }
    }
}
