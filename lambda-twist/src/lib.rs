//! Absolute pose from three 2D-3D correspondences (P3P).
//!
//! Implements "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P) Solver",
//! Persson, M. and Nordberg, K. ECCV 2018. The solver works for any three non-collinear world
//! points, so unlike linear PnP it does not degenerate when the scene is planar.
//!
//! [`LambdaTwist`] implements [`Estimator`] and is meant to be used inside a consensus algorithm
//! such as ARRSAC, which picks the right one of the up to four solutions.

// Copyright (c) 2018 Michael Persson
// Adapted to openMVG by Romain Janvier and Pierre Moulon
// Adapted to Rust by Matthieu Pizenberg

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use arrayvec::ArrayVec;
use sfm_core::{
    nalgebra::{Matrix3, Point3, Rotation3, Vector3},
    sample_consensus::Estimator,
    Bearing, FeatureWorldMatch, NormalizedKeyPoint, Pose, Projective, WorldToCamera,
};

/// Estimates up to four [`WorldToCamera`] poses satisfying `λᵢ yᵢ = R xᵢ + t` for three world
/// points `xᵢ` and their unit bearings `yᵢ`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaTwist {
    /// Gauss-Newton iterations refining the depths. Two are usually enough.
    pub gauss_newton_iterations: usize,
    pub rotation_convergence_iterations: usize,
    pub rotation_convergence_epsilon: f64,
}

impl LambdaTwist {
    pub fn new() -> Self {
        Default::default()
    }

    #[must_use]
    pub fn gauss_newton_iterations(self, gauss_newton_iterations: usize) -> Self {
        Self {
            gauss_newton_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn rotation_convergence_iterations(self, rotation_convergence_iterations: usize) -> Self {
        Self {
            rotation_convergence_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn rotation_convergence_epsilon(self, rotation_convergence_epsilon: f64) -> Self {
        Self {
            rotation_convergence_epsilon,
            ..self
        }
    }

    /// Solves the P3P problem for three world points and the bearings they are seen under.
    pub fn solve(
        &self,
        world: [Point3<f64>; 3],
        bearings: [Vector3<f64>; 3],
    ) -> ArrayVec<WorldToCamera, 4> {
        let mut poses = ArrayVec::new();

        let d12 = world[0] - world[1];
        let d13 = world[0] - world[2];
        let d23 = world[1] - world[2];
        let d12xd13 = d12.cross(&d13);
        let Some(world_basis_inv) = Matrix3::from_columns(&[d12, d13, d12xd13]).try_inverse() else {
            return poses;
        };

        // Squared distances between the world points.
        let a12 = d12.norm_squared();
        let a13 = d13.norm_squared();
        let a23 = d23.norm_squared();

        // Cosines and squared sines between the bearings.
        let c12 = bearings[0].dot(&bearings[1]);
        let c23 = bearings[1].dot(&bearings[2]);
        let c31 = bearings[2].dot(&bearings[0]);
        let blob = c12 * c23 * c31 - 1.0;
        let s12_sqr = 1.0 - c12 * c12;
        let s23_sqr = 1.0 - c23 * c23;
        let s31_sqr = 1.0 - c31 * c31;

        let b12 = -2.0 * c12;
        let b13 = -2.0 * c31;
        let b23 = -2.0 * c23;

        // Coefficients of the cubic, equation (10).
        let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
        let p2 = 2.0 * blob * a23 * a13
            + a13 * (2.0 * a12 + a13) * s23_sqr
            + a23 * (a23 - a12) * s31_sqr;
        let p1 = a23 * (a13 - a23) * s12_sqr
            - a12 * a12 * s23_sqr
            - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
        let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);
        if p3 == 0.0 {
            return poses;
        }
        let gamma = sharpest_cubic_root(p2 / p3, p1 / p3, p0 / p3);

        // The singular matrix D0 of the paper.
        #[rustfmt::skip]
        let d0 = Matrix3::new(
            a23 * (1.0 - gamma),  -(a23 * c12),                 a23 * c31 * gamma,
            -(a23 * c12),          a23 - a12 + a13 * gamma,     -c23 * (a13 * gamma - a12),
            a23 * c31 * gamma,    -c23 * (a13 * gamma - a12),   gamma * (a13 - a23) - a12,
        );
        let (eigenvectors, eigenvalues) = singular_eigen_decomposition(&d0);
        let ratio = (-eigenvalues[1] / eigenvalues[0]).max(0.0).sqrt();

        let mut depths: ArrayVec<Vector3<f64>, 4> = ArrayVec::new();
        for ratio in [ratio, -ratio] {
            // Equation (15).
            let w2 = 1.0 / (ratio * eigenvectors.m12 - eigenvectors.m11);
            let w0 = w2 * (eigenvectors.m21 - ratio * eigenvectors.m22);
            let w1 = w2 * (eigenvectors.m31 - ratio * eigenvectors.m32);
            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
            let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);
            let Some((tau1, tau2)) = real_quadratic_roots(b, c) else {
                continue;
            };
            // Equation (16).
            for tau in [tau1, tau2] {
                if tau <= 0.0 {
                    continue;
                }
                let d = a23 / (tau * (b23 + tau) + 1.0);
                if d <= 0.0 {
                    continue;
                }
                let l2 = d.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 {
                    depths.push(Vector3::new(l1, l2, l3));
                }
            }
        }

        for depth in depths {
            let depth = refine_depths(depth, self.gauss_newton_iterations, [a12, a13, a23], [b12, b13, b23]);
            let ry1 = depth.x * bearings[0];
            let ry2 = depth.y * bearings[1];
            let ry3 = depth.z * bearings[2];
            let yd1 = ry1 - ry2;
            let yd2 = ry1 - ry3;
            let camera_basis = Matrix3::from_columns(&[yd1, yd2, yd1.cross(&yd2)]);
            let rotation = Rotation3::from_matrix_eps(
                &(camera_basis * world_basis_inv),
                self.rotation_convergence_epsilon,
                self.rotation_convergence_iterations,
                Rotation3::identity(),
            );
            let translation = ry1 - rotation * world[0].coords;
            poses.push(WorldToCamera::from_parts(translation, rotation));
        }
        poses
    }
}

impl Default for LambdaTwist {
    fn default() -> Self {
        Self {
            gauss_newton_iterations: 5,
            rotation_convergence_iterations: 100,
            rotation_convergence_epsilon: 1e-12,
        }
    }
}

impl Estimator<FeatureWorldMatch<NormalizedKeyPoint>> for LambdaTwist {
    type Model = WorldToCamera;
    type ModelIter = ArrayVec<WorldToCamera, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch<NormalizedKeyPoint>> + Clone,
    {
        let mut world = [Point3::origin(); 3];
        let mut bearings = [Vector3::zeros(); 3];
        let mut count = 0;
        for FeatureWorldMatch(keypoint, point) in data.take(3) {
            let Some(point) = point.point() else {
                return ArrayVec::new();
            };
            world[count] = point;
            bearings[count] = keypoint.bearing().into_inner();
            count += 1;
        }
        if count < 3 {
            return ArrayVec::new();
        }
        self.solve(world, bearings)
    }
}

/// Gauss-Newton refinement of the three depths against the law of cosines residuals.
fn refine_depths(depth: Vector3<f64>, iterations: usize, a: [f64; 3], b: [f64; 3]) -> Vector3<f64> {
    let [a12, a13, a23] = a;
    let [b12, b13, b23] = b;
    let residual = |l: &Vector3<f64>| {
        Vector3::new(
            l.x * l.x + l.y * l.y + b12 * l.x * l.y - a12,
            l.x * l.x + l.z * l.z + b13 * l.x * l.z - a13,
            l.y * l.y + l.z * l.z + b23 * l.y * l.z - a23,
        )
    };
    let mut l = depth;
    let mut r = residual(&l);
    for _ in 0..iterations {
        if r.lp_norm(1) < 1e-10 {
            break;
        }
        let dr1dl1 = 2.0 * l.x + b12 * l.y;
        let dr1dl2 = 2.0 * l.y + b12 * l.x;
        let dr2dl1 = 2.0 * l.x + b13 * l.z;
        let dr2dl3 = 2.0 * l.z + b13 * l.x;
        let dr3dl2 = 2.0 * l.y + b23 * l.z;
        let dr3dl3 = 2.0 * l.z + b23 * l.y;
        let det = 1.0 / (-dr1dl1 * dr2dl3 * dr3dl2 - dr1dl2 * dr2dl1 * dr3dl3);
        // Adjugate of the sparse jacobian.
        #[rustfmt::skip]
        let adjugate = Matrix3::new(
            -dr2dl3 * dr3dl2, -dr1dl2 * dr3dl3,  dr1dl2 * dr2dl3,
            -dr2dl1 * dr3dl3,  dr1dl1 * dr3dl3, -dr1dl1 * dr2dl3,
             dr2dl1 * dr3dl2, -dr1dl1 * dr3dl2, -dr1dl2 * dr2dl1,
        );
        let candidate = l - det * (adjugate * r);
        let candidate_residual = residual(&candidate);
        if candidate_residual.lp_norm(1) > r.lp_norm(1) {
            break;
        }
        l = candidate;
        r = candidate_residual;
    }
    l
}

/// Real roots of `r² + b r + c`, computed without cancellation.
fn real_quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = discriminant.sqrt();
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// The root of `r³ + b r² + c r + d` with the steepest derivative.
///
/// Newton-Raphson is started from the leftmost or rightmost root of a second order approximation
/// around a stationary point, or from the inflection point when the cubic is monotonic.
fn sharpest_cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let h = |r: f64| ((r + b) * r + c) * r + d;
    let dh = |r: f64| (3.0 * r + 2.0 * b) * r + c;

    let mut r0 = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k1 = h(t1);
        if k1 > 0.0 {
            t1 - (-k1 / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            t2 + (-h(t2) / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let r0 = -b / 3.0;
        if dh(r0).abs() < 1e-4 {
            r0 + 1.0
        } else {
            r0
        }
    };

    for _ in 0..7 {
        r0 -= h(r0) / dh(r0);
    }
    for _ in 0..43 {
        let fx = h(r0);
        if fx.abs() <= 1e-13 {
            break;
        }
        r0 -= fx / dh(r0);
    }
    r0
}

/// Eigen decomposition of a symmetric 3x3 matrix with one zero eigenvalue.
///
/// The eigenvector of the zero eigenvalue is the last column. The two other eigenvalues are
/// returned with the larger magnitude first.
fn singular_eigen_decomposition(x: &Matrix3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let v3 = Vector3::new(
        x.m12 * x.m23 - x.m13 * x.m22,
        x.m13 * x.m21 - x.m23 * x.m11,
        x.m22 * x.m11 - x.m12 * x.m21,
    )
    .normalize();

    let m12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -m12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (mut e1, mut e2) = real_quadratic_roots(b, c).unwrap_or((-0.5 * b, -0.5 * b));
    if e1.abs() < e2.abs() {
        core::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let eigenvector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + m12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        let rnorm = 1.0 / (a1 * a1 + a2 * a2 + 1.0).sqrt();
        Vector3::new(a1 * rnorm, a2 * rnorm, rnorm)
    };

    (
        Matrix3::from_columns(&[eigenvector(e1), eigenvector(e2), v3]),
        Vector3::new(e1, e2, 0.0),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use sfm_core::WorldPoint;

    fn pose() -> WorldToCamera {
        WorldToCamera::from_parts(
            Vector3::new(0.1, 0.2, 0.3),
            Rotation3::from_euler_angles(0.1, 0.2, 0.3),
        )
    }

    fn samples(pose: WorldToCamera, world: &[Point3<f64>]) -> Vec<FeatureWorldMatch<NormalizedKeyPoint>> {
        world
            .iter()
            .map(|p| FeatureWorldMatch(pose.project(p).unwrap(), WorldPoint::from_point(*p)))
            .collect()
    }

    fn contains_pose(poses: &[WorldToCamera], expected: WorldToCamera) -> bool {
        poses.iter().any(|candidate| {
            candidate.0.rotation.rotation_to(&expected.0.rotation).angle() < 1e-6
                && (candidate.0.translation.vector - expected.0.translation.vector).norm() < 1e-6
        })
    }

    #[test]
    fn recovers_pose_of_three_points() {
        let pose = pose();
        let camera_points = [
            Point3::new(-0.228_125, -0.061_458_334, 1.0),
            Point3::new(0.418_75, -0.581_25, 2.0),
            Point3::new(1.128_125, 0.878_125, 3.0),
        ];
        let world: Vec<Point3<f64>> = camera_points
            .iter()
            .map(|p| pose.0.inverse_transform_point(p))
            .collect();
        let poses = LambdaTwist::new().estimate(samples(pose, &world).into_iter());
        assert!(!poses.is_empty());
        assert!(contains_pose(&poses, pose));
    }

    #[test]
    fn coplanar_points_are_not_degenerate() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.2, -0.1, 5.0),
            Rotation3::from_euler_angles(0.3, -0.2, 0.1),
        );
        let world = [
            Point3::new(-1.0, -0.5, 0.0),
            Point3::new(1.2, -0.8, 0.0),
            Point3::new(0.1, 1.1, 0.0),
        ];
        let poses = LambdaTwist::new().estimate(samples(pose, &world).into_iter());
        assert!(contains_pose(&poses, pose));
    }

    #[test]
    fn collinear_points_have_no_solution() {
        let world = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let poses = LambdaTwist::new().estimate(samples(pose(), &world).into_iter());
        assert!(poses.is_empty());
    }

    #[test]
    fn too_few_samples_have_no_solution() {
        let world = [Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let poses = LambdaTwist::new().estimate(samples(pose(), &world).into_iter());
        assert!(poses.is_empty());
    }

    #[test]
    fn sharpest_root_solves_cubic() {
        // (r - 1)(r - 2)(r + 3) = r³ - 7r + 6
        let root = sharpest_cubic_root(0.0, -7.0, 6.0);
        assert_relative_eq!((root * root - 7.0) * root + 6.0, 0.0, epsilon = 1e-10);
    }
}
