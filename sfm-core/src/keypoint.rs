use crate::CameraPoint;
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point2, Unit, UnitVector3, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
pub trait ImagePoint {
    /// Retrieves the point on the image
    fn image_point(&self) -> Point2<f64>;
}

/// Anything that describes a direction out of the optical center of a camera.
pub trait Bearing {
    /// Returns a unit vector of the direction that the bearing points from the optical center.
    fn bearing(&self) -> UnitVector3<f64> {
        Unit::new_normalize(self.bearing_unnormalized())
    }

    /// The bearing without normalization.
    fn bearing_unnormalized(&self) -> Vector3<f64>;

    /// Creates the bearing from a direction vector.
    fn from_bearing_vector(bearing: Vector3<f64>) -> Self;
}

impl Bearing for UnitVector3<f64> {
    fn bearing_unnormalized(&self) -> Vector3<f64> {
        self.into_inner()
    }

    fn from_bearing_vector(bearing: Vector3<f64>) -> Self {
        Unit::new_normalize(bearing)
    }
}

/// A point on an image in pixel coordinates.
///
/// The keypoint is neither undistorted nor normalized. Use a [`CameraModel`](crate::CameraModel)
/// to turn it into a [`NormalizedKeyPoint`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        self.0
    }
}

/// A point in normalized image coordinates.
///
/// The keypoint has been undistorted and normalized by the camera intrinsics so that
/// it lies on the virtual image plane at `z = 1.0` in front of the optical center.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NormalizedKeyPoint(pub Point2<f64>);

impl NormalizedKeyPoint {
    /// Projects a [`CameraPoint`] onto the virtual image plane.
    ///
    /// Fails if the point lies on the plane of the optical center.
    pub fn from_camera_point(point: CameraPoint) -> Option<Self> {
        let p = point.0;
        if p.z == 0.0 {
            return None;
        }
        Some(Self(Point2::new(p.x / p.z, p.y / p.z)))
    }

    /// Lifts the keypoint to the [`CameraPoint`] at the given `depth` along the optical axis.
    pub fn with_depth(self, depth: f64) -> CameraPoint {
        (self.coords * depth).push(depth).push(1.0).into()
    }

    /// The homogeneous virtual image point `(x, y, 1)`.
    pub fn virtual_image_point(self) -> Vector3<f64> {
        self.coords.push(1.0)
    }
}

impl Bearing for NormalizedKeyPoint {
    fn bearing_unnormalized(&self) -> Vector3<f64> {
        self.0.coords.push(1.0)
    }

    fn from_bearing_vector(bearing: Vector3<f64>) -> Self {
        Self((bearing.xy() / bearing.z).into())
    }
}
