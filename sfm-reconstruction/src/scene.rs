use crate::{CameraId, FrameId, ImageId, Point3DId, RigId, Track};
use serde::{Deserialize, Serialize};
use sfm_core::{nalgebra::Point3, CameraToCamera, KeyPoint, Pose, WorldToCamera};

/// Cameras that are rigidly mounted together.
///
/// The pose of the reference sensor is the pose of the rig. Every other sensor is stored with its
/// fixed `cam_from_rig` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rig {
    pub ref_sensor: CameraId,
    pub sensors: Vec<(CameraId, CameraToCamera)>,
}

impl Rig {
    /// A rig made of a single camera.
    pub fn trivial(camera_id: CameraId) -> Self {
        Self {
            ref_sensor: camera_id,
            sensors: vec![],
        }
    }

    pub fn has_sensor(&self, camera_id: CameraId) -> bool {
        self.ref_sensor == camera_id || self.sensors.iter().any(|&(id, _)| id == camera_id)
    }

    /// `None` if the camera is not part of the rig.
    pub fn cam_from_rig(&self, camera_id: CameraId) -> Option<CameraToCamera> {
        if camera_id == self.ref_sensor {
            return Some(CameraToCamera::identity());
        }
        self.sensors
            .iter()
            .find(|&&(id, _)| id == camera_id)
            .map(|&(_, pose)| pose)
    }

    pub fn num_sensors(&self) -> usize {
        1 + self.sensors.len()
    }
}

/// One capture instant of a rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub rig_id: RigId,
    pub image_ids: Vec<ImageId>,
    /// Pose of the rig. Kept after deregistration so a frame can be retried from its last pose.
    pub rig_from_world: Option<WorldToCamera>,
    pub registered: bool,
}

impl Frame {
    pub fn new(rig_id: RigId) -> Self {
        Self {
            rig_id,
            image_ids: vec![],
            rig_from_world: None,
            registered: false,
        }
    }
}

/// A keypoint of an image along with the point it observes, if any.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub keypoint: KeyPoint,
    /// Color of the pixel under the keypoint.
    #[serde(default)]
    pub color: [u8; 3],
    #[serde(default)]
    pub point3d_id: Option<Point3DId>,
}

impl Point2D {
    pub fn new(keypoint: KeyPoint, color: [u8; 3]) -> Self {
        Self {
            keypoint,
            color,
            point3d_id: None,
        }
    }

    pub fn has_point3d(&self) -> bool {
        self.point3d_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    points2d: Vec<Point2D>,
    #[serde(default)]
    num_points3d: usize,
}

impl Image {
    pub fn new(
        name: impl Into<String>,
        camera_id: CameraId,
        frame_id: FrameId,
        points2d: Vec<Point2D>,
    ) -> Self {
        let mut image = Self {
            name: name.into(),
            camera_id,
            frame_id,
            points2d,
            num_points3d: 0,
        };
        image.recount_points3d();
        image
    }

    pub fn num_points2d(&self) -> usize {
        self.points2d.len()
    }

    /// Number of keypoints that observe a point.
    pub fn num_points3d(&self) -> usize {
        self.num_points3d
    }

    pub fn points2d(&self) -> &[Point2D] {
        &self.points2d
    }

    pub fn point2d(&self, point2d_idx: usize) -> &Point2D {
        &self.points2d[point2d_idx]
    }

    /// Iterates the keypoints that observe a point along with the point.
    pub fn triangulated(&self) -> impl Iterator<Item = (usize, Point3DId)> + '_ {
        self.points2d
            .iter()
            .enumerate()
            .filter_map(|(ix, p)| Some((ix, p.point3d_id?)))
    }

    pub(crate) fn set_point3d(&mut self, point2d_idx: usize, point3d_id: Point3DId) {
        let point = &mut self.points2d[point2d_idx];
        if point.point3d_id.is_none() {
            self.num_points3d += 1;
        }
        point.point3d_id = Some(point3d_id);
    }

    pub(crate) fn reset_point3d(&mut self, point2d_idx: usize) {
        let point = &mut self.points2d[point2d_idx];
        if point.point3d_id.take().is_some() {
            self.num_points3d -= 1;
        }
    }

    pub(crate) fn clear_points3d(&mut self) {
        for point in &mut self.points2d {
            point.point3d_id = None;
        }
        self.num_points3d = 0;
    }

    pub(crate) fn recount_points3d(&mut self) {
        self.num_points3d = self.points2d.iter().filter(|p| p.has_point3d()).count();
    }
}

/// A triangulated point and every observation of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub position: Point3<f64>,
    pub color: [u8; 3],
    /// Mean reprojection error in pixels. `None` until it is first computed.
    pub error: Option<f64>,
    pub track: Track,
}

impl Point3D {
    pub fn new(position: Point3<f64>, color: [u8; 3], track: Track) -> Self {
        Self {
            position,
            color,
            error: None,
            track,
        }
    }
}
