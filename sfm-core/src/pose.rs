use crate::{
    CameraPoint, FeatureMatch, FeatureWorldMatch, NormalizedKeyPoint, Projective, WorldPoint,
};
use core::ops::Mul;
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix3, Matrix3x4, Matrix4, Point3, Rotation3, Vector3, Vector6};
use sample_consensus::Model;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by all the different poses in this library:
///
/// * [`CameraToWorld`] - Transforms [`CameraPoint`] into [`WorldPoint`]
/// * [`WorldToCamera`] - Transforms [`WorldPoint`] into [`CameraPoint`]
/// * [`CameraToCamera`] - Transforms [`CameraPoint`] from one camera into [`CameraPoint`] for another camera
/// * [`WorldToWorld`] - Transforms [`WorldPoint`] between two rigidly related world frames
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type InputPoint: Projective;
    type OutputPoint: Projective;
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Applies a scale factor to the pose (scales the translation component)
    #[must_use]
    fn scale(self, scale: f64) -> Self {
        let mut isometry = self.isometry();
        isometry.translation.vector *= scale;
        isometry.into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the homogeneous matrix.
    fn homogeneous(self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Retrieve the `[R | t]` 3x4 matrix.
    fn matrix3x4(self) -> Matrix3x4<f64> {
        let isometry = self.isometry();
        let mut out = Matrix3x4::zeros();
        out.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(isometry.rotation.matrix());
        out.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&isometry.translation.vector);
        out
    }

    /// Retrieve the six parameter representation of the pose.
    ///
    /// The translation comes first, followed by the scaled axis of the rotation.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r = isometry.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Create the pose from the representation returned by [`Pose::se3`].
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Rotation3::from_scaled_axis(Vector3::new(se3[3], se3[4], se3[5]));
        Self::from_parts(translation, rotation)
    }

    /// Transform the given point to an output point.
    fn transform(self, input: Self::InputPoint) -> Self::OutputPoint {
        (self.homogeneous() * input.homogeneous()).into()
    }
}

/// The pose of the world relative to the camera, commonly called `cam_from_world`.
///
/// This maps [`WorldPoint`] into [`CameraPoint`], changing an absolute position into
/// a vector relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type InputPoint = WorldPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// The position of the optical center in world coordinates.
    pub fn center(self) -> Point3<f64> {
        self.0.inverse_transform_point(&Point3::origin())
    }

    /// The viewing direction (positive z axis of the camera) in world coordinates.
    pub fn viewing_direction(self) -> Vector3<f64> {
        self.0.rotation.inverse() * Vector3::z()
    }

    /// Transforms a euclidean world point into the camera frame.
    pub fn transform_point(self, point: &Point3<f64>) -> Point3<f64> {
        self.0.transform_point(point)
    }

    /// Projects a world point to the virtual image plane.
    ///
    /// Returns `None` if the point is not strictly in front of the camera.
    pub fn project(self, point: &Point3<f64>) -> Option<NormalizedKeyPoint> {
        let camera = self.transform_point(point);
        if camera.z <= f64::EPSILON {
            return None;
        }
        Some(NormalizedKeyPoint((camera.xy().coords / camera.z).into()))
    }
}

impl Model<FeatureWorldMatch<NormalizedKeyPoint>> for WorldToCamera {
    /// Reprojection distance on the virtual image plane.
    ///
    /// Points behind the camera have an infinite residual.
    fn residual(&self, data: &FeatureWorldMatch<NormalizedKeyPoint>) -> f64 {
        let &FeatureWorldMatch(keypoint, world) = data;
        world
            .point()
            .and_then(|point| self.project(&point))
            .map(|projected| (projected.0 - keypoint.0).norm())
            .unwrap_or(f64::INFINITY)
    }
}

/// The pose of a camera relative to the world, commonly called `world_from_cam`.
///
/// This transforms camera points (with depth as `z`) into world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type InputPoint = CameraPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// A relative pose that transforms the [`CameraPoint`] of camera `A` into the
/// corresponding [`CameraPoint`] of camera `B`, commonly called `cam2_from_cam1`.
///
/// The same type is used for the fixed pose of a camera relative to the reference
/// sensor of its rig (`cam_from_rig`).
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToCamera(pub IsometryMatrix3<f64>);

impl Pose for CameraToCamera {
    type InputPoint = CameraPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl CameraToCamera {
    /// The relative pose between two absolute poses: `b_from_world * inverse(a_from_world)`.
    pub fn between(a: WorldToCamera, b: WorldToCamera) -> Self {
        Self(b.0 * a.0.inverse())
    }

    /// The essential matrix `[t]x R` implied by the pose.
    pub fn essential(self) -> Matrix3<f64> {
        self.0.translation.vector.cross_matrix() * self.0.rotation.matrix()
    }
}

impl Mul<WorldToCamera> for CameraToCamera {
    type Output = WorldToCamera;

    fn mul(self, rhs: WorldToCamera) -> WorldToCamera {
        WorldToCamera(self.0 * rhs.0)
    }
}

impl Model<FeatureMatch<NormalizedKeyPoint>> for CameraToCamera {
    /// Sampson distance of the match with respect to the essential matrix of the pose.
    fn residual(&self, data: &FeatureMatch<NormalizedKeyPoint>) -> f64 {
        let &FeatureMatch(a, b) = data;
        let essential = self.essential();
        let x1 = a.virtual_image_point();
        let x2 = b.virtual_image_point();
        let ex1 = essential * x1;
        let etx2 = essential.transpose() * x2;
        let x2tex1 = x2.dot(&ex1);
        let denominator = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
        if denominator <= 0.0 {
            return f64::INFINITY;
        }
        (x2tex1 * x2tex1 / denominator).sqrt()
    }
}

/// A rigid transform between two world frames.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToWorld(pub IsometryMatrix3<f64>);

impl Pose for WorldToWorld {
    type InputPoint = WorldPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToWorld {
    /// If a camera has a pose in two different reconstructions, we can derive the
    /// [`WorldToWorld`] transformation from the [`WorldToCamera`] pose of the camera
    /// in each reconstruction. This must be passed the camera pose in reconstruction `A`
    /// and then reconstruction `B` in that order. It will return the [`WorldToWorld`]
    /// transformation from `A` to `B`.
    pub fn from_camera_poses(a_pose: WorldToCamera, b_pose: WorldToCamera) -> Self {
        (b_pose.isometry().inverse() * a_pose.isometry()).into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn se3_round_trip_preserves_pose() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.3, -0.2, 1.5),
            Rotation3::from_euler_angles(0.1, -0.4, 0.25),
        );
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(pose.0, back.0, epsilon = 1e-12);
    }

    #[test]
    fn center_is_mapped_to_origin() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(1.0, 2.0, 3.0),
            Rotation3::from_euler_angles(0.3, 0.2, 0.1),
        );
        let center = pose.center();
        assert_relative_eq!(
            pose.transform_point(&center),
            Point3::origin(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn relative_pose_composes_back() {
        let a = WorldToCamera::from_parts(
            Vector3::new(0.1, 0.0, 0.5),
            Rotation3::from_euler_angles(0.0, 0.1, 0.0),
        );
        let b = WorldToCamera::from_parts(
            Vector3::new(-0.4, 0.2, 0.3),
            Rotation3::from_euler_angles(0.05, -0.1, 0.2),
        );
        let relative = CameraToCamera::between(a, b);
        assert_relative_eq!((relative * a).0, b.0, epsilon = 1e-12);
    }

    #[test]
    fn sampson_residual_vanishes_for_exact_match() {
        let pose = CameraToCamera::from_parts(
            Vector3::new(1.0, 0.1, 0.0),
            Rotation3::from_euler_angles(0.0, 0.05, 0.0),
        );
        let point = Point3::new(0.2, -0.3, 4.0);
        let a = NormalizedKeyPoint((point.xy().coords / point.z).into());
        let pb = pose.0.transform_point(&point);
        let b = NormalizedKeyPoint((pb.xy().coords / pb.z).into());
        assert!(pose.residual(&FeatureMatch(a, b)) < 1e-12);
    }
}
