use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point3, Unit, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Implemented by homogeneous projective 3d coordinates.
pub trait Projective: From<Vector4<f64>> + Clone + Copy {
    /// Retrieve the homogeneous vector.
    ///
    /// The vector is not normalized. Any non-zero multiple of it represents the same point.
    fn homogeneous(self) -> Vector4<f64>;

    /// Retrieve the euclidean 3d point by dividing out the homogeneous coordinate.
    ///
    /// Fails for points at infinity, which have `w == 0`.
    fn point(self) -> Option<Point3<f64>> {
        Point3::from_homogeneous(self.homogeneous())
    }

    /// Convert the euclidean 3d point into homogeneous coordinates.
    fn from_point(point: Point3<f64>) -> Self {
        point.to_homogeneous().into()
    }

    /// Retrieve the normalized bearing of the coordinate.
    fn bearing(self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.bearing_unnormalized())
    }

    /// Retrieve the unnormalized bearing of the coordinate.
    ///
    /// The sign follows the homogeneous `w` so that points stored with a negative `w`
    /// still produce the bearing towards the euclidean point.
    fn bearing_unnormalized(self) -> Vector3<f64> {
        let h = self.homogeneous();
        if h.w < 0.0 {
            -h.xyz()
        } else {
            h.xyz()
        }
    }
}

/// A 3d point relative to the optical center and orientation of a camera.
///
/// The positive X axis is right, positive Y axis is down, and positive Z axis is forwards.
/// The unit of distance is the unit of the reconstruction the camera belongs to.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPoint(pub Vector4<f64>);

impl CameraPoint {
    /// The depth of the point along the optical axis.
    ///
    /// Returns `None` if the point is at infinity.
    pub fn depth(self) -> Option<f64> {
        self.point().map(|p| p.z)
    }
}

impl Projective for CameraPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

/// A point in the coordinate frame of one reconstruction.
///
/// Structure from motion only recovers the world up to a similarity transform. The scale
/// of `WorldPoint`s is therefore arbitrary and only consistent within a single reconstruction.
/// Two reconstructions of the same scene are related by a [`Sim3`](crate::Sim3), not by an
/// isometry.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldPoint(pub Vector4<f64>);

impl WorldPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Vector4::new(x, y, z, 1.0))
    }
}

impl Projective for WorldPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_w_keeps_bearing_direction() {
        let point = CameraPoint(Vector4::new(-1.0, -2.0, -4.0, -1.0));
        let bearing = point.bearing();
        assert!(bearing.z > 0.0);
        assert_eq!(point.depth(), Some(4.0));
    }

    #[test]
    fn infinite_point_has_no_depth() {
        let point = CameraPoint(Vector4::new(0.0, 0.0, 1.0, 0.0));
        assert_eq!(point.depth(), None);
    }
}
