use crate::{Pose, WorldToCamera};
use nalgebra::{
    IsometryMatrix3, Matrix3, Matrix3x4, Matrix6, Point3, Rotation3, UnitQuaternion, Vector3,
};
use std::io::{BufRead, Write};
use std::ops::Mul;
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Error)]
pub enum Sim3ParseError {
    #[error("i/o error reading similarity transform: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected 8 values (scale qw qx qy qz tx ty tz), found {0}")]
    WrongCount(usize),
    #[error("invalid number in similarity transform: {0}")]
    Number(#[from] std::num::ParseFloatError),
}

/// A similarity transform `new_from_old = s * R * x + t` between two world frames.
///
/// Two reconstructions of the same scene can only ever be related by a similarity,
/// since structure from motion recovers geometry up to an unknown scale.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Sim3 {
    pub scale: f64,
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Sim3 {
    pub fn new(scale: f64, rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            scale,
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(1.0, UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Creates a similarity from a rigid transform with unit scale.
    pub fn from_isometry(isometry: IsometryMatrix3<f64>) -> Self {
        Self::new(
            1.0,
            UnitQuaternion::from_rotation_matrix(&isometry.rotation),
            isometry.translation.vector,
        )
    }

    #[must_use]
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Self::new(scale, rotation, -(rotation * self.translation) * scale)
    }

    /// The `[sR | t]` matrix.
    pub fn matrix(&self) -> Matrix3x4<f64> {
        let mut out = Matrix3x4::zeros();
        out.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation.to_rotation_matrix().into_inner() * self.scale));
        out.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        out
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.scale * (self.rotation * point.coords) + self.translation)
    }

    /// Moves a `cam_from_old_world` pose into the new world frame.
    ///
    /// The result is `cam_from_new_world` with the translation expressed in the units
    /// of the new world.
    pub fn transform_pose(&self, cam_from_old_world: WorldToCamera) -> WorldToCamera {
        let rotation = cam_from_old_world.0.rotation
            * Rotation3::from(self.rotation).inverse();
        let translation = cam_from_old_world.0.translation.vector * self.scale
            - rotation * self.translation;
        WorldToCamera::from_parts(translation, rotation)
    }

    /// Estimates `dst_from_src` from at least three point correspondences.
    ///
    /// Uses the closed form least squares solution of Umeyama. Returns `None` for fewer
    /// than three points or degenerate (e.g. collinear) configurations.
    pub fn estimate(src: &[Point3<f64>], dst: &[Point3<f64>]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 3 {
            return None;
        }
        let n = src.len() as f64;
        let mean_src = src.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
        let mean_dst = dst.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;

        let mut covariance = Matrix3::zeros();
        let mut src_variance = 0.0;
        for (s, d) in src.iter().zip(dst) {
            let sc = s.coords - mean_src;
            let dc = d.coords - mean_dst;
            covariance += dc * sc.transpose();
            src_variance += sc.norm_squared();
        }
        covariance /= n;
        src_variance /= n;
        if src_variance <= f64::EPSILON {
            return None;
        }

        let svd = covariance.try_svd(true, true, 1e-15, 1000)?;
        let (u, v_t) = (svd.u?, svd.v_t?);
        let mut correction = Vector3::new(1.0, 1.0, 1.0);
        if u.determinant() * v_t.determinant() < 0.0 {
            correction.z = -1.0;
        }
        // Two vanishing singular values means all points were collinear.
        let mut sorted = svd.singular_values;
        sorted
            .as_mut_slice()
            .sort_by(|a, b| float_ord::FloatOrd(*b).cmp(&float_ord::FloatOrd(*a)));
        if sorted[1] <= 1e-12 * sorted[0].max(1.0) {
            return None;
        }

        let rotation = u * Matrix3::from_diagonal(&correction) * v_t;
        let scale = svd.singular_values.dot(&correction) / src_variance;
        let rotation = UnitQuaternion::from_matrix(&rotation);
        let translation = mean_dst - scale * (rotation * mean_src);
        Some(Self::new(scale, rotation, translation))
    }

    /// Writes the transform as `scale qw qx qy qz tx ty tz` with full precision.
    pub fn write_text(&self, mut writer: impl Write) -> std::io::Result<()> {
        let q = self.rotation.quaternion();
        writeln!(
            writer,
            "{:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e}",
            self.scale, q.w, q.i, q.j, q.k, self.translation.x, self.translation.y, self.translation.z
        )
    }

    /// Reads the format produced by [`Sim3::write_text`].
    pub fn read_text(reader: impl BufRead) -> Result<Self, Sim3ParseError> {
        let mut values = Vec::with_capacity(8);
        for line in reader.lines() {
            for token in line?.split_whitespace() {
                values.push(token.parse::<f64>()?);
            }
        }
        if values.len() != 8 {
            return Err(Sim3ParseError::WrongCount(values.len()));
        }
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            values[1], values[2], values[3], values[4],
        ));
        Ok(Self::new(
            values[0],
            rotation,
            Vector3::new(values[5], values[6], values[7]),
        ))
    }

    /// Propagates the covariance of a rigid pose (rotation first, then translation)
    /// through the change of world frame.
    pub fn propagate_pose_covariance(&self, covariance: &Matrix6<f64>) -> Matrix6<f64> {
        let old_from_new = self.inverse();
        let r = old_from_new.rotation.to_rotation_matrix().into_inner();
        let t_hat = old_from_new.translation.cross_matrix();
        let mut jacobian = Matrix6::zeros();
        jacobian.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        jacobian
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(t_hat * r));
        jacobian
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(r * old_from_new.scale));
        jacobian * covariance * jacobian.transpose()
    }

    /// Propagates the covariance of a world position through the transform.
    pub fn propagate_position_covariance(&self, covariance: &Matrix3<f64>) -> Matrix3<f64> {
        let r = self.rotation.to_rotation_matrix().into_inner();
        self.scale * self.scale * r * covariance * r.transpose()
    }
}

impl Mul for Sim3 {
    type Output = Sim3;

    /// Composes `self * rhs`, applying `rhs` first.
    fn mul(self, rhs: Sim3) -> Sim3 {
        Sim3::new(
            self.scale * rhs.scale,
            self.rotation * rhs.rotation,
            self.scale * (self.rotation * rhs.translation) + self.translation,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn some_sim3() -> Sim3 {
        Sim3::new(
            2.5,
            UnitQuaternion::from_euler_angles(0.2, -0.3, 0.7),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn inverse_composes_to_identity() {
        let sim3 = some_sim3();
        let identity = sim3 * sim3.inverse();
        assert_relative_eq!(identity.scale, 1.0, epsilon = 1e-12);
        assert_relative_eq!(identity.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(identity.rotation.angle() < 1e-12);
    }

    #[test]
    fn estimate_recovers_transform() {
        let sim3 = some_sim3();
        let src = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.3, 0.2, 1.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| sim3.transform_point(p)).collect();
        let estimated = Sim3::estimate(&src, &dst).unwrap();
        assert_relative_eq!(estimated.scale, sim3.scale, epsilon = 1e-9);
        assert_relative_eq!(estimated.translation, sim3.translation, epsilon = 1e-9);
        assert!(estimated.rotation.angle_to(&sim3.rotation) < 1e-9);
    }

    #[test]
    fn estimate_rejects_collinear_points() {
        let src = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        assert!(Sim3::estimate(&src, &src).is_none());
    }

    #[test]
    fn transformed_pose_sees_transformed_point() {
        let sim3 = some_sim3();
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, 0.2, 3.0),
            Rotation3::from_euler_angles(0.1, 0.0, -0.2),
        );
        let point = Point3::new(0.5, -0.4, 2.0);
        let before = pose.project(&point).unwrap();
        let after = sim3
            .transform_pose(pose)
            .project(&sim3.transform_point(&point))
            .unwrap();
        assert_relative_eq!(before.0, after.0, epsilon = 1e-12);
    }

    #[test]
    fn text_round_trip_is_exact() {
        let sim3 = some_sim3();
        let mut buffer = Vec::new();
        sim3.write_text(&mut buffer).unwrap();
        let read = Sim3::read_text(buffer.as_slice()).unwrap();
        assert_eq!(read.scale, sim3.scale);
        assert_eq!(read.translation, sim3.translation);
    }
}
