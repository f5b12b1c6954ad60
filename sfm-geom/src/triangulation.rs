use crate::essential::EssentialMatrix;
use sfm_core::{
    nalgebra::{Matrix3, Matrix4, Point3, UnitVector3, Vector3, Vector4},
    Bearing, CameraToCamera, NormalizedKeyPoint, Pose, Projective, TriangulatorObservations,
    WorldPoint, WorldToCamera,
};

const SVD_EPSILON: f64 = 1e-15;
const SVD_MAX_ITERATIONS: usize = 1000;

/// Two view direct linear transform.
///
/// Stacks the two projection equations of each view into a 4x4 homogeneous system and takes its
/// null space. Fails when the homogeneous coordinate of the solution is exactly zero.
///
/// ```
/// use sfm_core::nalgebra::{Point3, Rotation3, Vector3};
/// use sfm_core::{Pose, WorldToCamera};
/// use sfm_geom::triangulation::triangulate_point;
///
/// let point = Point3::new(0.3, -0.2, 4.0);
/// let cam1 = WorldToCamera::identity();
/// let cam2 = WorldToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity());
/// let triangulated =
///     triangulate_point(cam1, cam2, cam1.project(&point).unwrap(), cam2.project(&point).unwrap())
///         .unwrap();
/// assert!((triangulated - point).norm() < 1e-9);
/// ```
pub fn triangulate_point(
    cam1_from_world: WorldToCamera,
    cam2_from_world: WorldToCamera,
    point1: NormalizedKeyPoint,
    point2: NormalizedKeyPoint,
) -> Option<Point3<f64>> {
    let p1 = cam1_from_world.matrix3x4();
    let p2 = cam2_from_world.matrix3x4();
    let mut design = Matrix4::zeros();
    design
        .row_mut(0)
        .copy_from(&(point1.x * p1.row(2) - p1.row(0)));
    design
        .row_mut(1)
        .copy_from(&(point1.y * p1.row(2) - p1.row(1)));
    design
        .row_mut(2)
        .copy_from(&(point2.x * p2.row(2) - p2.row(0)));
    design
        .row_mut(3)
        .copy_from(&(point2.y * p2.row(2) - p2.row(1)));

    let svd = design.try_svd(false, true, SVD_EPSILON, SVD_MAX_ITERATIONS)?;
    let v_t = svd.v_t?;
    let (ix, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))?;
    let homogeneous: Vector4<f64> = v_t.row(ix).transpose();
    if homogeneous.w == 0.0 {
        return None;
    }
    Point3::from_homogeneous(homogeneous).filter(|p| p.coords.iter().all(|n| n.is_finite()))
}

/// Midpoint of the shortest segment between two rays.
///
/// `ray1` is in the frame of the first camera and `ray2` in the frame of the second camera.
/// The returned point is expressed in the first camera. Fails if either ray parameter is not
/// strictly positive, which means the point lies behind one of the cameras.
pub fn triangulate_mid_point(
    cam2_from_cam1: CameraToCamera,
    ray1: Vector3<f64>,
    ray2: Vector3<f64>,
) -> Option<Point3<f64>> {
    let cam1_from_cam2_rotation = cam2_from_cam1.0.rotation.inverse();
    let ray2_in_cam1 = cam1_from_cam2_rotation * ray2;
    let cam2_in_cam1 = cam1_from_cam2_rotation * -cam2_from_cam1.0.translation.vector;

    let design = Matrix3::from_columns(&[ray1, -ray2_in_cam1, -cam2_in_cam1]);
    let svd = design.try_svd(false, true, SVD_EPSILON, SVD_MAX_ITERATIONS)?;
    let v_t = svd.v_t?;
    let (ix, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))?;
    let null = v_t.row(ix).transpose();
    if null.z == 0.0 {
        return None;
    }
    let lambda1 = null.x / null.z;
    let lambda2 = null.y / null.z;
    if lambda1 <= f64::EPSILON || lambda2 <= f64::EPSILON {
        return None;
    }
    Some(Point3::from(
        0.5 * (lambda1 * ray1 + cam2_in_cam1 + lambda2 * ray2_in_cam1),
    ))
}

/// Least squares point from any number of views.
///
/// Each observation contributes `(P - b bᵀ P)ᵀ (P - b bᵀ P)` to a 4x4 normal matrix, where
/// `b` is the normalized bearing. The eigenvector of the smallest eigenvalue is the point.
pub fn triangulate_multi_view_point(
    cams_from_world: &[WorldToCamera],
    points: &[NormalizedKeyPoint],
) -> Option<Point3<f64>> {
    if cams_from_world.len() != points.len() || points.len() < 2 {
        return None;
    }
    LinearEigenTriangulator::new()
        .normal_equation_point(
            cams_from_world
                .iter()
                .copied()
                .zip(points.iter().map(|p| p.bearing())),
        )
        .and_then(|p| p.point())
}

/// Triangulates after moving both observations to the closest pair exactly satisfying the
/// epipolar constraint of the relative pose between the cameras.
pub fn triangulate_optimal_point(
    cam1_from_world: WorldToCamera,
    cam2_from_world: WorldToCamera,
    point1: NormalizedKeyPoint,
    point2: NormalizedKeyPoint,
) -> Option<Point3<f64>> {
    let cam2_from_cam1 = CameraToCamera::between(cam1_from_world, cam2_from_world);
    let (optimal1, optimal2) =
        EssentialMatrix::from(cam2_from_cam1).find_optimal_image_observations(point1, point2);
    triangulate_point(cam1_from_world, cam2_from_world, optimal1, optimal2)
}

/// The angle between the two rays from the projection centers to the point.
///
/// Computed with the law of cosines. Triangulation is unstable for both very acute and very
/// obtuse angles, so the smaller of `angle` and `π - angle` is returned. Returns `0.0` if the
/// point coincides with one of the centers.
pub fn triangulation_angle(
    center1: &Point3<f64>,
    center2: &Point3<f64>,
    point: &Point3<f64>,
) -> f64 {
    angle_with_baseline((center1 - center2).norm_squared(), center1, center2, point)
}

/// [`triangulation_angle`] for many points seen from the same two centers.
pub fn triangulation_angles(
    center1: &Point3<f64>,
    center2: &Point3<f64>,
    points: &[Point3<f64>],
) -> Vec<f64> {
    let baseline_squared = (center1 - center2).norm_squared();
    points
        .iter()
        .map(|point| angle_with_baseline(baseline_squared, center1, center2, point))
        .collect()
}

fn angle_with_baseline(
    baseline_squared: f64,
    center1: &Point3<f64>,
    center2: &Point3<f64>,
    point: &Point3<f64>,
) -> f64 {
    let ray1_squared = (point - center1).norm_squared();
    let ray2_squared = (point - center2).norm_squared();
    let denominator = 2.0 * (ray1_squared * ray2_squared).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    let numerator = ray1_squared + ray2_squared - baseline_squared;
    let angle = (numerator / denominator).clamp(-1.0, 1.0).acos();
    angle.min(std::f64::consts::PI - angle)
}

/// A fast linear triangulator for any number of views.
///
/// Referred to as the Linear-Eigen method by Hartley and Sturm in the paper
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
/// Every observation removes the component of the projected point along its bearing, which leaves
/// four linear equations in the homogeneous point. A symmetric eigen decomposition of the 4x4
/// normal matrix gives the result.
///
/// Unlike [`triangulate_multi_view_point`], this also enforces that the point lies in front of
/// every camera.
///
/// ```
/// use sfm_core::nalgebra::{Point3, Rotation3, Vector3};
/// use sfm_core::{Pose, TriangulatorObservations, WorldToCamera};
/// use sfm_geom::triangulation::LinearEigenTriangulator;
///
/// let point = Point3::new(0.3, 0.1, 2.0);
/// let poses = [
///     WorldToCamera::identity(),
///     WorldToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::new(Vector3::new(0.1, 0.1, 0.1))),
/// ];
/// let observations = poses.iter().map(|&pose| (pose, pose.project(&point).unwrap()));
/// let triangulated = LinearEigenTriangulator::new()
///     .triangulate_observations(observations)
///     .unwrap();
/// let distance = (sfm_core::Projective::point(triangulated).unwrap() - point).norm();
/// assert!(distance < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the symmetric eigen solver.
    ///
    /// Default is `1e-12`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the symmetric eigen solver.
    ///
    /// Default is `1000`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    fn normal_equation_point<B: Bearing>(
        &self,
        observations: impl IntoIterator<Item = (WorldToCamera, B)>,
    ) -> Option<WorldPoint> {
        let mut a: Matrix4<f64> = Matrix4::zeros();
        for (pose, bearing) in observations {
            let bearing = bearing.bearing().into_inner();
            let pose = pose.matrix3x4();
            let term = pose - bearing * bearing.transpose() * pose;
            a += term.transpose() * term;
        }

        let se = a.try_symmetric_eigen(self.epsilon, self.max_iterations)?;
        se.eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| se.eigenvectors.column(ix).into_owned())
            .filter(|h: &Vector4<f64>| h.w != 0.0)
            .map(WorldPoint)
            .filter(|point| point.homogeneous().iter().all(|n| n.is_finite()))
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl TriangulatorObservations for LinearEigenTriangulator {
    fn triangulate_observations<B: Bearing>(
        &self,
        observations: impl IntoIterator<Item = (WorldToCamera, B)>,
    ) -> Option<WorldPoint> {
        let observations: Vec<(WorldToCamera, UnitVector3<f64>)> = observations
            .into_iter()
            .map(|(pose, bearing)| (pose, bearing.bearing()))
            .collect();
        if observations.len() < 2 {
            return None;
        }
        let point = self
            .normal_equation_point(observations.iter().copied())?
            .point()?;
        // Cheirality.
        observations
            .iter()
            .all(|&(pose, bearing)| pose.transform_point(&point).coords.dot(&bearing) > 0.0)
            .then(|| WorldPoint::from_point(point))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use sfm_core::nalgebra::{Point2, Rotation3};

    fn reprojection_error(pose: WorldToCamera, point: &Point3<f64>, observed: NormalizedKeyPoint) -> f64 {
        pose.project(point)
            .map(|p| (p.0 - observed.0).norm_squared())
            .unwrap_or(f64::INFINITY)
    }

    #[test]
    fn dlt_reprojects_into_both_views() {
        let cam1 = WorldToCamera::from_parts(
            Vector3::new(0.2, -0.1, 0.3),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        );
        let cam2 = WorldToCamera::from_parts(
            Vector3::new(-0.8, 0.1, 0.2),
            Rotation3::from_euler_angles(-0.02, 0.15, 0.0),
        );
        let point = Point3::new(-0.4, 0.6, 5.0);
        let p1 = cam1.project(&point).unwrap();
        let p2 = cam2.project(&point).unwrap();
        let triangulated = triangulate_point(cam1, cam2, p1, p2).unwrap();
        assert!(reprojection_error(cam1, &triangulated, p1) < 1e-18);
        assert!(reprojection_error(cam2, &triangulated, p2) < 1e-18);
    }

    #[test]
    fn mid_point_finds_intersection() {
        let cam2_from_cam1 = CameraToCamera::from_parts(
            Vector3::new(-1.0, 0.0, 0.0),
            Rotation3::from_euler_angles(0.0, 0.1, 0.0),
        );
        let point = Point3::new(0.5, 0.2, 3.0);
        let ray1 = point.coords;
        let ray2 = cam2_from_cam1.0.transform_point(&point).coords;
        let triangulated = triangulate_mid_point(cam2_from_cam1, ray1, ray2).unwrap();
        assert_relative_eq!(triangulated, point, epsilon = 1e-9);
    }

    #[test]
    fn mid_point_rejects_points_behind_camera() {
        let cam2_from_cam1 =
            CameraToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity());
        let point = Point3::new(0.5, 0.2, 3.0);
        let ray1 = -point.coords;
        let ray2 = -cam2_from_cam1.0.transform_point(&point).coords;
        assert!(triangulate_mid_point(cam2_from_cam1, ray1, ray2).is_none());
    }

    #[test]
    fn multi_view_on_a_line_is_exact() {
        let point = Point3::new(0.7, -0.3, 6.0);
        let poses: Vec<_> = (0..3)
            .map(|i| {
                WorldToCamera::from_parts(Vector3::new(-(i as f64), 0.0, 0.0), Rotation3::identity())
            })
            .collect();
        let observations: Vec<_> = poses.iter().map(|p| p.project(&point).unwrap()).collect();
        let triangulated = triangulate_multi_view_point(&poses, &observations).unwrap();
        assert_relative_eq!(triangulated, point, epsilon = 1e-9);
    }

    #[test]
    fn multi_view_needs_matching_lengths() {
        let poses = [WorldToCamera::identity(); 2];
        let points = [NormalizedKeyPoint(Point2::origin())];
        assert!(triangulate_multi_view_point(&poses, &points).is_none());
    }

    #[test]
    fn optimal_is_not_worse_than_dlt_under_noise() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        // The second camera is much further from the scene, so the algebraic error minimized by
        // the plain linear transform weights the two views very differently.
        let cam1 = WorldToCamera::identity();
        let cam2 = WorldToCamera::from_parts(
            Vector3::new(-2.0, 0.0, 8.0),
            Rotation3::from_euler_angles(0.0, 0.2, 0.0),
        );
        // 1 pixel at a focal length of 1000 pixels.
        let noise = Normal::new(0.0, 1e-3).unwrap();
        let mut dlt_error = 0.0;
        let mut optimal_error = 0.0;
        for _ in 0..200 {
            let point = Point3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(3.0..5.0),
            );
            let mut noisy = |pose: WorldToCamera| {
                let p = pose.project(&point).unwrap();
                NormalizedKeyPoint(Point2::new(
                    p.x + noise.sample(&mut rng),
                    p.y + noise.sample(&mut rng),
                ))
            };
            let p1 = noisy(cam1);
            let p2 = noisy(cam2);
            let dlt = triangulate_point(cam1, cam2, p1, p2).unwrap();
            let optimal = triangulate_optimal_point(cam1, cam2, p1, p2).unwrap();
            dlt_error += reprojection_error(cam1, &dlt, p1) + reprojection_error(cam2, &dlt, p2);
            optimal_error +=
                reprojection_error(cam1, &optimal, p1) + reprojection_error(cam2, &optimal, p2);
        }
        assert!(optimal_error <= dlt_error, "{optimal_error} > {dlt_error}");
    }

    #[test]
    fn coincident_point_has_zero_angle() {
        let center = Point3::new(1.0, 2.0, 3.0);
        assert_eq!(
            triangulation_angle(&center, &Point3::new(0.0, 0.0, 0.0), &center),
            0.0
        );
    }

    #[test]
    fn batch_angles_match_single_angles() {
        let c1 = Point3::new(0.0, 0.0, 0.0);
        let c2 = Point3::new(1.0, 0.0, 0.0);
        let points = [Point3::new(0.5, 0.0, 1.0), Point3::new(0.0, 3.0, 2.0)];
        let angles = triangulation_angles(&c1, &c2, &points);
        for (angle, point) in angles.iter().zip(&points) {
            assert_eq!(*angle, triangulation_angle(&c1, &c2, point));
        }
        assert_relative_eq!(angles[0], 2.0 * 0.5f64.atan(), epsilon = 1e-12);
    }

    #[quickcheck]
    fn angle_is_symmetric(c1: (f64, f64, f64), c2: (f64, f64, f64), p: (f64, f64, f64)) -> bool {
        let finite = |(x, y, z): (f64, f64, f64)| {
            let clamp = |v: f64| if v.is_finite() { v % 1e3 } else { 0.0 };
            Point3::new(clamp(x), clamp(y), clamp(z))
        };
        let (c1, c2, p) = (finite(c1), finite(c2), finite(p));
        triangulation_angle(&c1, &c2, &p) == triangulation_angle(&c2, &c1, &p)
    }

    #[quickcheck]
    fn angle_is_in_range(c1: (f64, f64, f64), c2: (f64, f64, f64), p: (f64, f64, f64)) -> bool {
        let finite = |(x, y, z): (f64, f64, f64)| {
            let clamp = |v: f64| if v.is_finite() { v % 1e3 } else { 0.0 };
            Point3::new(clamp(x), clamp(y), clamp(z))
        };
        let angle = triangulation_angle(&finite(c1), &finite(c2), &finite(p));
        (0.0..=std::f64::consts::FRAC_PI_2).contains(&angle)
    }
}
