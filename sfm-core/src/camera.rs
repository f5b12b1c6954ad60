use crate::{ImagePoint, KeyPoint, NormalizedKeyPoint};
use nalgebra::{Point2, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows conversion between the point on an image and its normalized image coordinate.
pub trait CameraModel {
    /// Takes in a point from an image in pixel coordinates and converts it
    /// to a [`NormalizedKeyPoint`] by removing the intrinsics and distortion.
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint;

    /// Converts a [`NormalizedKeyPoint`] back into pixel coordinates.
    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint;
}

/// The parametrization of a camera.
///
/// The parameter layouts are:
///
/// * `SimplePinhole` - `f, cx, cy`
/// * `Pinhole` - `fx, fy, cx, cy`
/// * `SimpleRadial` - `f, cx, cy, k`
/// * `Radial` - `f, cx, cy, k1, k2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CameraModelId {
    SimplePinhole,
    Pinhole,
    SimpleRadial,
    Radial,
}

impl CameraModelId {
    pub fn num_params(self) -> usize {
        match self {
            Self::SimplePinhole => 3,
            Self::Pinhole => 4,
            Self::SimpleRadial => 4,
            Self::Radial => 5,
        }
    }

    pub fn focal_length_idxs(self) -> &'static [usize] {
        match self {
            Self::Pinhole => &[0, 1],
            _ => &[0],
        }
    }

    pub fn principal_point_idxs(self) -> &'static [usize] {
        match self {
            Self::Pinhole => &[2, 3],
            _ => &[1, 2],
        }
    }

    pub fn extra_params_idxs(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::Pinhole => &[],
            Self::SimpleRadial => &[3],
            Self::Radial => &[3, 4],
        }
    }

    /// Default parameters for an image of the given size with the given focal length.
    pub fn init_params(self, focal_length: f64, width: usize, height: usize) -> Vec<f64> {
        let cx = width as f64 / 2.0;
        let cy = height as f64 / 2.0;
        match self {
            Self::SimplePinhole => vec![focal_length, cx, cy],
            Self::Pinhole => vec![focal_length, focal_length, cx, cy],
            Self::SimpleRadial => vec![focal_length, cx, cy, 0.0],
            Self::Radial => vec![focal_length, cx, cy, 0.0, 0.0],
        }
    }

    /// Radial distortion factor applied to an undistorted normalized coordinate.
    fn distortion_factor(self, params: &[f64], u: Vector2<f64>) -> f64 {
        let r2 = u.norm_squared();
        match self {
            Self::SimplePinhole | Self::Pinhole => 1.0,
            Self::SimpleRadial => 1.0 + params[3] * r2,
            Self::Radial => 1.0 + params[3] * r2 + params[4] * r2 * r2,
        }
    }

    /// Projects a normalized image coordinate into pixels.
    pub fn img_from_cam(self, params: &[f64], normalized: Vector2<f64>) -> Point2<f64> {
        let distorted = normalized * self.distortion_factor(params, normalized);
        let (fx, fy, cx, cy) = self.linear(params);
        Point2::new(fx * distorted.x + cx, fy * distorted.y + cy)
    }

    /// Converts a pixel into a normalized image coordinate.
    ///
    /// Distortion is inverted by fixed point iteration.
    pub fn cam_from_img(self, params: &[f64], pixel: Point2<f64>) -> Vector2<f64> {
        let (fx, fy, cx, cy) = self.linear(params);
        let distorted = Vector2::new((pixel.x - cx) / fx, (pixel.y - cy) / fy);
        if self.extra_params_idxs().is_empty() {
            return distorted;
        }
        let mut undistorted = distorted;
        for _ in 0..100 {
            let next = distorted / self.distortion_factor(params, undistorted);
            let step = (next - undistorted).norm_squared();
            undistorted = next;
            if step < 1e-24 {
                break;
            }
        }
        undistorted
    }

    fn linear(self, params: &[f64]) -> (f64, f64, f64, f64) {
        match self {
            Self::Pinhole => (params[0], params[1], params[2], params[3]),
            _ => (params[0], params[0], params[1], params[2]),
        }
    }
}

/// Intrinsic calibration of one physical camera.
///
/// The model type is fixed at construction, while the parameters are refined by bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Camera {
    pub model: CameraModelId,
    pub width: usize,
    pub height: usize,
    pub params: Vec<f64>,
    /// Whether the focal length came from a trusted source (e.g. EXIF or calibration).
    pub has_prior_focal_length: bool,
}

impl Camera {
    /// Creates a camera with the default parameters of the model.
    pub fn new(model: CameraModelId, focal_length: f64, width: usize, height: usize) -> Self {
        Self {
            model,
            width,
            height,
            params: model.init_params(focal_length, width, height),
            has_prior_focal_length: false,
        }
    }

    /// Creates a camera from explicit parameters.
    ///
    /// Returns `None` if the number of parameters does not match the model.
    pub fn from_params(
        model: CameraModelId,
        width: usize,
        height: usize,
        params: Vec<f64>,
    ) -> Option<Self> {
        if params.len() != model.num_params() {
            return None;
        }
        Some(Self {
            model,
            width,
            height,
            params,
            has_prior_focal_length: false,
        })
    }

    /// The mean focal length in pixels.
    pub fn mean_focal_length(&self) -> f64 {
        let idxs = self.model.focal_length_idxs();
        idxs.iter().map(|&ix| self.params[ix]).sum::<f64>() / idxs.len() as f64
    }

    /// Converts a pixel threshold into a threshold on the virtual image plane.
    pub fn cam_from_img_threshold(&self, threshold: f64) -> f64 {
        threshold / self.mean_focal_length()
    }

    /// Projects a normalized coordinate into pixels.
    pub fn img_from_cam(&self, normalized: Vector2<f64>) -> Point2<f64> {
        self.model.img_from_cam(&self.params, normalized)
    }

    /// Whether the parameters are implausible for a real camera.
    ///
    /// The focal length relative to the larger image side must be within
    /// `[min_focal_length_ratio, max_focal_length_ratio]` and every extra parameter
    /// must not exceed `max_extra_param` in magnitude.
    pub fn has_bogus_params(
        &self,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> bool {
        let max_size = self.width.max(self.height) as f64;
        let focal_bogus = self.model.focal_length_idxs().iter().any(|&ix| {
            let ratio = self.params[ix] / max_size;
            ratio < min_focal_length_ratio || ratio > max_focal_length_ratio
        });
        let extra_bogus = self
            .model
            .extra_params_idxs()
            .iter()
            .any(|&ix| self.params[ix].abs() > max_extra_param);
        focal_bogus || extra_bogus
    }
}

impl CameraModel for Camera {
    /// ```
    /// use sfm_core::{Camera, CameraModel, CameraModelId, KeyPoint};
    /// let mut camera = Camera::new(CameraModelId::SimpleRadial, 800.0, 640, 480);
    /// camera.params[3] = -0.05;
    /// let kp = KeyPoint::new(471.0, 322.0);
    /// let back = camera.uncalibrate(camera.calibrate(kp));
    /// assert!((kp.0 - back.0).norm() < 1e-6);
    /// ```
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        NormalizedKeyPoint(
            self.model
                .cam_from_img(&self.params, point.image_point())
                .into(),
        )
    }

    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        KeyPoint(self.img_from_cam(projection.coords))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pinhole_projection_uses_both_focals() {
        let camera =
            Camera::from_params(CameraModelId::Pinhole, 640, 480, vec![500.0, 400.0, 320.0, 240.0])
                .unwrap();
        let pixel = camera.img_from_cam(Vector2::new(0.1, -0.1));
        assert_relative_eq!(pixel, Point2::new(370.0, 200.0), epsilon = 1e-12);
    }

    #[test]
    fn radial_round_trip() {
        let camera = Camera::from_params(
            CameraModelId::Radial,
            1000,
            800,
            vec![900.0, 500.0, 400.0, -0.08, 0.01],
        )
        .unwrap();
        let normalized = NormalizedKeyPoint(Point2::new(0.3, -0.2));
        let back = camera.calibrate(camera.uncalibrate(normalized));
        assert_relative_eq!(back.0, normalized.0, epsilon = 1e-9);
    }

    #[test]
    fn wrong_parameter_count_is_rejected() {
        assert!(Camera::from_params(CameraModelId::SimplePinhole, 10, 10, vec![1.0]).is_none());
    }

    #[test]
    fn bogus_focal_length_is_detected() {
        let camera = Camera::new(CameraModelId::SimplePinhole, 5.0, 640, 480);
        assert!(camera.has_bogus_params(0.1, 10.0, 1.0));
        let camera = Camera::new(CameraModelId::SimplePinhole, 600.0, 640, 480);
        assert!(!camera.has_bogus_params(0.1, 10.0, 1.0));
    }
}
