use crate::triangulation::triangulate_point;
use sfm_core::{
    nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector2, Vector3, SVD},
    sample_consensus::Model,
    CameraToCamera, FeatureMatch, NormalizedKeyPoint, Pose, WorldToCamera,
};

/// An essential matrix satisfying `transpose(x2) * E * x1 = 0`.
///
/// `x1` and `x2` are homogeneous normalized image coordinates of the same feature seen in the
/// first and second camera. The matrix is `[t]x R` for the relative pose `cam2_from_cam1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Enforces the constraints of an essential matrix.
    ///
    /// Finds the closest essential matrix in frobenius norm by averaging the two largest
    /// singular values and zeroing the smallest.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = self.0.try_svd(true, true, epsilon, max_iterations)?;
        svd.singular_values[2] = 0.0;
        let new_singular = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = new_singular;
        svd.singular_values[1] = new_singular;
        svd.recompose().ok().map(Self)
    }

    /// Returns the two possible rotations and the translation direction of unknown sign.
    pub fn possible_rotations_unscaled_translation(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(Rotation3<f64>, Rotation3<f64>, Vector3<f64>)> {
        // `W` from https://en.wikipedia.org/wiki/Essential_matrix#Finding_one_solution.
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let wt = w.transpose();

        let svd = SVD::try_new(self.0, true, true, epsilon, max_iterations)?;
        let (mut u, mut v_t) = (svd.u?, svd.v_t?);
        // The last singular vectors are undetermined since the singular values are (a, a, 0),
        // so flipping them fixes the handedness.
        if u.determinant() < 0.0 {
            u.column_mut(2).neg_mut();
        }
        if v_t.determinant() < 0.0 {
            v_t.row_mut(2).neg_mut();
        }
        Some((
            Rotation3::from_matrix_unchecked(u * w * v_t),
            Rotation3::from_matrix_unchecked(u * wt * v_t),
            u.column(2).into_owned(),
        ))
    }

    /// The four relative poses consistent with the matrix.
    ///
    /// ```
    /// use sfm_core::{CameraToCamera, Pose};
    /// use sfm_core::nalgebra::{Rotation3, Vector3};
    /// use sfm_geom::EssentialMatrix;
    /// let pose = CameraToCamera::from_parts(
    ///     Vector3::new(-0.8, 0.4, 0.5),
    ///     Rotation3::from_euler_angles(0.2, 0.3, 0.4),
    /// );
    /// let poses = EssentialMatrix::from(pose).possible_unscaled_poses(1e-12, 1000).unwrap();
    /// let one_correct = poses.iter().any(|&candidate| {
    ///     let angle_residual = candidate.0.rotation.rotation_to(&pose.0.rotation).angle();
    ///     let translation_residual = 1.0
    ///         - candidate.0.translation.vector.normalize()
    ///             .dot(&pose.0.translation.vector.normalize());
    ///     angle_residual < 1e-6 && translation_residual < 1e-6
    /// });
    /// assert!(one_correct);
    /// ```
    pub fn possible_unscaled_poses(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<[CameraToCamera; 4]> {
        self.possible_rotations_unscaled_translation(epsilon, max_iterations)
            .map(|(rot_a, rot_b, t)| {
                [
                    CameraToCamera::from_parts(t, rot_a),
                    CameraToCamera::from_parts(t, rot_b),
                    CameraToCamera::from_parts(-t, rot_a),
                    CameraToCamera::from_parts(-t, rot_b),
                ]
            })
    }

    /// Picks the decomposition that places the most matches in front of both cameras.
    ///
    /// Returns the unit length relative pose along with the points that passed the cheirality
    /// test, expressed in the first camera. Returns `None` if no point passes for any candidate.
    pub fn pose_from_matches(
        &self,
        matches: &[FeatureMatch<NormalizedKeyPoint>],
    ) -> Option<(CameraToCamera, Vec<Point3<f64>>)> {
        self.possible_unscaled_poses(1e-12, 1000)?
            .iter()
            .map(|&pose| (pose, points_in_front(pose, matches)))
            .filter(|(_, points)| !points.is_empty())
            .max_by_key(|(_, points)| points.len())
    }

    /// Corrects a pair of observations so that they satisfy the epipolar constraint.
    ///
    /// Uses the `niter1` method of Lindstrom, "Triangulation Made Easy" (CVPR 2010), which moves
    /// both observations by the smallest possible amount in the image planes.
    pub fn find_optimal_image_observations(
        &self,
        point1: NormalizedKeyPoint,
        point2: NormalizedKeyPoint,
    ) -> (NormalizedKeyPoint, NormalizedKeyPoint) {
        // The method is formulated for `transpose(x1) * E * x2 = 0`.
        let e = self.0.transpose();
        let x1 = point1.virtual_image_point();
        let x2 = point2.virtual_image_point();
        let e_tilde = e.fixed_view::<2, 2>(0, 0).into_owned();

        let mut n1: Vector2<f64> = (e * x2).xy();
        let mut n2: Vector2<f64> = (e.transpose() * x1).xy();
        let a = n1.dot(&(e_tilde * n2));
        let b = 0.5 * (n1.norm_squared() + n2.norm_squared());
        let c = x1.dot(&(e * x2));
        let d = (b * b - a * c).max(0.0).sqrt();
        if b + d == 0.0 {
            return (point1, point2);
        }
        let mut lambda = c / (b + d);
        let delta1 = n1 * lambda;
        let delta2 = n2 * lambda;
        n1 -= e_tilde * delta2;
        n2 -= e_tilde.transpose() * delta1;
        let norm = n1.norm_squared() + n2.norm_squared();
        if norm == 0.0 {
            return (point1, point2);
        }
        lambda *= 2.0 * d / norm;
        (
            NormalizedKeyPoint(Point2::from(point1.coords - lambda * n1)),
            NormalizedKeyPoint(Point2::from(point2.coords - lambda * n2)),
        )
    }
}

/// Triangulates every match in the first camera frame and keeps the ones in front of both
/// cameras and closer than a thousand baselines.
fn points_in_front(
    cam2_from_cam1: CameraToCamera,
    matches: &[FeatureMatch<NormalizedKeyPoint>],
) -> Vec<Point3<f64>> {
    let cam1 = WorldToCamera::identity();
    let cam2 = WorldToCamera(cam2_from_cam1.0);
    let max_depth = 1000.0 * cam2.center().coords.norm();
    matches
        .iter()
        .filter_map(|&FeatureMatch(a, b)| triangulate_point(cam1, cam2, a, b))
        .filter(|point| {
            let depth1 = point.z;
            let depth2 = cam2.transform_point(point).z;
            depth1 > f64::EPSILON
                && depth1 < max_depth
                && depth2 > f64::EPSILON
                && depth2 < max_depth
        })
        .collect()
}

/// Generates the essential matrix `[t]x R` of the relative pose.
impl From<CameraToCamera> for EssentialMatrix {
    fn from(pose: CameraToCamera) -> Self {
        Self(pose.essential())
    }
}

impl Model<FeatureMatch<NormalizedKeyPoint>> for EssentialMatrix {
    /// Sampson distance.
    fn residual(&self, data: &FeatureMatch<NormalizedKeyPoint>) -> f64 {
        let &FeatureMatch(a, b) = data;
        let x1 = a.virtual_image_point();
        let x2 = b.virtual_image_point();
        let ex1 = self.0 * x1;
        let etx2 = self.0.transpose() * x2;
        let x2tex1 = x2.dot(&ex1);
        let denominator = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
        if denominator <= 0.0 {
            return f64::INFINITY;
        }
        (x2tex1 * x2tex1 / denominator).sqrt()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scene() -> (CameraToCamera, Vec<FeatureMatch<NormalizedKeyPoint>>) {
        let pose = CameraToCamera::from_parts(
            Vector3::new(-1.0, 0.2, 0.1),
            Rotation3::from_euler_angles(0.05, 0.1, -0.03),
        );
        let matches = (0..20)
            .map(|i| {
                let point = Point3::new(
                    (i % 5) as f64 * 0.4 - 1.0,
                    (i / 5) as f64 * 0.3 - 0.5,
                    4.0 + (i % 3) as f64,
                );
                let a = NormalizedKeyPoint((point.xy().coords / point.z).into());
                let pb = pose.0.transform_point(&point);
                let b = NormalizedKeyPoint((pb.xy().coords / pb.z).into());
                FeatureMatch(a, b)
            })
            .collect();
        (pose, matches)
    }

    #[test]
    fn cheirality_selects_true_pose() {
        let (pose, matches) = scene();
        let (estimated, points) = EssentialMatrix::from(pose)
            .pose_from_matches(&matches)
            .unwrap();
        assert_eq!(points.len(), matches.len());
        assert!(estimated.0.rotation.rotation_to(&pose.0.rotation).angle() < 1e-9);
        let direction = pose.0.translation.vector.normalize();
        assert!((estimated.0.translation.vector - direction).norm() < 1e-9);
    }

    #[test]
    fn exact_observations_are_not_moved() {
        let (pose, matches) = scene();
        let essential = EssentialMatrix::from(pose);
        for &FeatureMatch(a, b) in &matches {
            let (a2, b2) = essential.find_optimal_image_observations(a, b);
            assert!((a2.0 - a.0).norm() < 1e-12);
            assert!((b2.0 - b.0).norm() < 1e-12);
        }
    }

    #[test]
    fn correction_reduces_epipolar_residual() {
        let (pose, matches) = scene();
        let essential = EssentialMatrix::from(pose);
        let FeatureMatch(a, b) = matches[7];
        let noisy = NormalizedKeyPoint(Point2::new(a.x + 2e-3, a.y - 1e-3));
        let before = essential.residual(&FeatureMatch(noisy, b));
        let (a2, b2) = essential.find_optimal_image_observations(noisy, b);
        let after = essential.residual(&FeatureMatch(a2, b2));
        assert!(after < before * 1e-3, "{after} vs {before}");
    }

    #[test]
    fn reconditioned_matrix_has_two_equal_singular_values() {
        let essential = EssentialMatrix(Matrix3::new(1.0, 0.2, 0.3, -0.1, 0.9, 0.4, 0.2, 0.1, 0.05));
        let fixed = essential.recondition(1e-12, 1000).unwrap();
        let singular = fixed.0.singular_values();
        assert!((singular[0] - singular[1]).abs() < 1e-9);
        assert!(singular[2].abs() < 1e-9);
    }
}
