use serde::{Deserialize, Serialize};
use sfm_core::{
    nalgebra::{Cholesky, Matrix3, Matrix6, Point3, Rotation3, UnitQuaternion, Vector3},
    Pose, WorldToCamera,
};

/// Semi-major axis of the WGS84 ellipsoid in meters.
const WGS84_A: f64 = 6_378_137.0;
/// Flattening of the WGS84 ellipsoid.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoordinateSystem {
    #[default]
    Undefined,
    /// `position` holds latitude and longitude in degrees followed by the height in meters.
    Wgs84,
    Cartesian,
}

/// An externally measured pose of an image, e.g. from GPS or an IMU.
///
/// Only the position is mandatory. The rotation is the rotation of `cam_from_world` and is
/// meaningless for [`CoordinateSystem::Wgs84`]. Missing or non-finite values make the
/// corresponding `has_valid_*` check fail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosePrior {
    #[serde(default)]
    pub coordinate_system: CoordinateSystem,
    pub position: Point3<f64>,
    #[serde(default)]
    pub position_covariance: Option<Matrix3<f64>>,
    #[serde(default)]
    pub rotation: Option<UnitQuaternion<f64>>,
    /// Covariance of the rotation in axis-angle form.
    #[serde(default)]
    pub rotation_covariance: Option<Matrix3<f64>>,
}

impl PosePrior {
    pub fn new(coordinate_system: CoordinateSystem, position: Point3<f64>) -> Self {
        Self {
            coordinate_system,
            position,
            position_covariance: None,
            rotation: None,
            rotation_covariance: None,
        }
    }

    /// A cartesian prior on the full pose of the camera.
    pub fn from_cam_from_world(cam_from_world: WorldToCamera) -> Self {
        Self {
            rotation: Some(UnitQuaternion::from_rotation_matrix(
                &cam_from_world.0.rotation,
            )),
            ..Self::new(CoordinateSystem::Cartesian, cam_from_world.center())
        }
    }

    #[must_use]
    pub fn with_position_covariance(self, covariance: Matrix3<f64>) -> Self {
        Self {
            position_covariance: Some(covariance),
            ..self
        }
    }

    #[must_use]
    pub fn with_rotation(self, rotation: UnitQuaternion<f64>, covariance: Matrix3<f64>) -> Self {
        Self {
            rotation: Some(rotation),
            rotation_covariance: Some(covariance),
            ..self
        }
    }

    pub fn has_valid_position(&self) -> bool {
        self.position.coords.iter().all(|n| n.is_finite())
    }

    pub fn has_valid_position_covariance(&self) -> bool {
        self.position_covariance
            .map_or(false, |c| c.iter().all(|n| n.is_finite()))
    }

    pub fn has_valid_rotation(&self) -> bool {
        self.rotation
            .map_or(false, |r| r.coords.iter().all(|n| n.is_finite()))
    }

    pub fn has_valid_rotation_covariance(&self) -> bool {
        self.rotation_covariance
            .map_or(false, |c| c.iter().all(|n| n.is_finite()))
    }

    pub fn has_valid_pose(&self) -> bool {
        self.has_valid_position() && self.has_valid_rotation()
    }

    fn rotation_matrix(&self) -> Option<Matrix3<f64>> {
        self.rotation
            .filter(|_| self.has_valid_rotation())
            .map(|r| r.to_rotation_matrix().into_inner())
    }

    /// The translation of `cam_from_world`, which is `-R * C`, or `-C` without a rotation.
    pub fn translation(&self) -> Vector3<f64> {
        match self.rotation_matrix() {
            Some(r) => -(r * self.position.coords),
            None => -self.position.coords,
        }
    }

    pub fn cam_from_world(&self) -> Option<WorldToCamera> {
        if !self.has_valid_pose() {
            return None;
        }
        let rotation = Rotation3::from_matrix_unchecked(self.rotation_matrix()?);
        Some(WorldToCamera::from_parts(self.translation(), rotation))
    }

    /// First order covariance of the translation `t = -R * C`.
    ///
    /// The jacobian of `t` with respect to position and rotation is `[-R | skew(-R * C)]`.
    pub fn translation_covariance(&self) -> Option<Matrix3<f64>> {
        let r = self.rotation_matrix()?;
        let position_covariance = self.position_covariance?;
        let rotation_covariance = self.rotation_covariance?;
        let j_rotation = (-(r * self.position.coords)).cross_matrix();
        Some(
            r * position_covariance * r.transpose()
                + j_rotation * rotation_covariance * j_rotation.transpose(),
        )
    }

    /// Sets the position covariance such that [`Self::translation_covariance`] returns the given
    /// covariance. The rotation and its covariance must be set.
    pub fn set_translation_covariance(&mut self, translation_covariance: &Matrix3<f64>) -> bool {
        let (Some(r), Some(rotation_covariance)) =
            (self.rotation_matrix(), self.rotation_covariance)
        else {
            return false;
        };
        let j_rotation = (-(r * self.position.coords)).cross_matrix();
        let rotation_term = j_rotation * rotation_covariance * j_rotation.transpose();
        let corrected = r.transpose() * (translation_covariance - rotation_term) * r;
        self.position_covariance = Some(0.5 * (corrected + corrected.transpose()));
        true
    }

    /// Full covariance of the pose with the rotation block first and the translation block second.
    pub fn pose_covariance(&self) -> Option<Matrix6<f64>> {
        let r = self.rotation_matrix()?;
        let position_covariance = self.position_covariance?;
        let rotation_covariance = self.rotation_covariance?;
        let j_rotation = (-(r * self.position.coords)).cross_matrix();
        let cross = j_rotation * rotation_covariance;
        let mut covariance = Matrix6::zeros();
        covariance
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&rotation_covariance);
        covariance.fixed_view_mut::<3, 3>(3, 3).copy_from(
            &(cross * j_rotation.transpose() + r * position_covariance * r.transpose()),
        );
        covariance.fixed_view_mut::<3, 3>(3, 0).copy_from(&cross);
        covariance
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&cross.transpose());
        Some(covariance)
    }

    /// Splits a full pose covariance into rotation and position covariances.
    pub fn set_pose_covariance(&mut self, pose_covariance: &Matrix6<f64>) -> bool {
        let Some(r) = self.rotation_matrix() else {
            return false;
        };
        let rotation_covariance: Matrix3<f64> = pose_covariance.fixed_view::<3, 3>(0, 0).into();
        let translation_covariance: Matrix3<f64> =
            pose_covariance.fixed_view::<3, 3>(3, 3).into();
        let j_rotation = (-(r * self.position.coords)).cross_matrix();
        self.rotation_covariance = Some(rotation_covariance);
        self.position_covariance = Some(
            r.transpose()
                * (translation_covariance
                    - j_rotation * rotation_covariance * j_rotation.transpose())
                * r,
        );
        true
    }

    /// Square root of the inverse position covariance, used to whiten position residuals.
    pub fn position_sqrt_information(&self) -> Option<Matrix3<f64>> {
        if !self.has_valid_position_covariance() {
            return None;
        }
        let information = self.position_covariance?.try_inverse()?;
        Some(Cholesky::new(information)?.l().transpose())
    }
}

/// Earth centered earth fixed coordinates of a latitude (degrees), longitude (degrees) and height.
pub fn wgs84_to_ecef(lla: &Point3<f64>) -> Vector3<f64> {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let lat = lla.x.to_radians();
    let lon = lla.y.to_radians();
    let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();
    Vector3::new(
        (n + lla.z) * lat.cos() * lon.cos(),
        (n + lla.z) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + lla.z) * lat.sin(),
    )
}

/// Converts WGS84 coordinates into the east-north-up frame tangent to the ellipsoid at the given
/// reference latitude and longitude (degrees, zero height).
pub fn wgs84_to_enu(lla: &[Point3<f64>], ref_lat: f64, ref_lon: f64) -> Vec<Point3<f64>> {
    let origin = wgs84_to_ecef(&Point3::new(ref_lat, ref_lon, 0.0));
    let (sin_lat, cos_lat) = ref_lat.to_radians().sin_cos();
    let (sin_lon, cos_lon) = ref_lon.to_radians().sin_cos();
    #[rustfmt::skip]
    let enu_from_ecef = Matrix3::new(
        -sin_lon,           cos_lon,           0.0,
        -sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat,
        cos_lat * cos_lon,  cos_lat * sin_lon,  sin_lat,
    );
    lla.iter()
        .map(|p| Point3::from(enu_from_ecef * (wgs84_to_ecef(p) - origin)))
        .collect()
}
