use crate::{
    CameraId, Frame, FrameId, Image, ImageId, InvalidTrackReason, Point3D, Point3DId, PosePrior,
    Rig, RigId, SceneError, Track, TrackElement,
};
use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;
use serde::{Deserialize, Serialize};
use sfm_core::{
    nalgebra::{Point3, UnitQuaternion, Vector3},
    Camera, CameraModel, KeyPoint, Pose, Sim3, WorldToCamera,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Pixel reprojection error of a point observed at `keypoint`.
///
/// Points that are not in front of the camera have an infinite error.
pub fn reprojection_error(
    camera: &Camera,
    cam_from_world: WorldToCamera,
    keypoint: &KeyPoint,
    point: &Point3<f64>,
) -> f64 {
    cam_from_world
        .project(point)
        .map(|projected| (camera.uncalibrate(projected).0 - keypoint.0).norm())
        .unwrap_or(f64::INFINITY)
}

/// Cameras, rigs, frames, images and points that share one world frame.
///
/// Structural edits keep the following consistent at all times:
///
/// * every track element references an existing keypoint of a registered image
/// * a keypoint references a point if and only if the point's track contains the keypoint
/// * no keypoint belongs to more than one point
///
/// Lookups by id index directly and panic for ids that do not exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    rigs: BTreeMap<RigId, Rig>,
    cameras: BTreeMap<CameraId, Camera>,
    frames: BTreeMap<FrameId, Frame>,
    images: BTreeMap<ImageId, Image>,
    points3d: BTreeMap<Point3DId, Point3D>,
    next_point3d_id: u64,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rig(&mut self, rig_id: RigId, rig: Rig) -> Result<(), SceneError> {
        if self.rigs.contains_key(&rig_id) {
            return Err(SceneError::Duplicate {
                kind: "rig",
                id: rig_id.0.into(),
            });
        }
        self.rigs.insert(rig_id, rig);
        Ok(())
    }

    pub fn add_camera(&mut self, camera_id: CameraId, camera: Camera) -> Result<(), SceneError> {
        if self.cameras.contains_key(&camera_id) {
            return Err(SceneError::Duplicate {
                kind: "camera",
                id: camera_id.0.into(),
            });
        }
        self.cameras.insert(camera_id, camera);
        Ok(())
    }

    /// Adds a camera along with a rig containing only that camera.
    pub fn add_camera_with_trivial_rig(
        &mut self,
        camera_id: CameraId,
        camera: Camera,
    ) -> Result<RigId, SceneError> {
        let rig_id = RigId(camera_id.0);
        if self.rigs.contains_key(&rig_id) {
            return Err(SceneError::Duplicate {
                kind: "rig",
                id: rig_id.0.into(),
            });
        }
        self.add_camera(camera_id, camera)?;
        self.rigs.insert(rig_id, Rig::trivial(camera_id));
        Ok(rig_id)
    }

    /// Adds an unregistered frame. The rig must exist.
    pub fn add_frame(&mut self, frame_id: FrameId, mut frame: Frame) -> Result<(), SceneError> {
        if self.frames.contains_key(&frame_id) {
            return Err(SceneError::Duplicate {
                kind: "frame",
                id: frame_id.0.into(),
            });
        }
        if !self.rigs.contains_key(&frame.rig_id) {
            return Err(SceneError::MissingRig(frame.rig_id));
        }
        frame.registered = false;
        self.frames.insert(frame_id, frame);
        Ok(())
    }

    /// Adds an image without any triangulated keypoints.
    ///
    /// The camera and frame must exist and the camera must be a sensor of the frame's rig. The
    /// image is added to the image ids of the frame.
    pub fn add_image(&mut self, image_id: ImageId, mut image: Image) -> Result<(), SceneError> {
        if self.images.contains_key(&image_id) {
            return Err(SceneError::Duplicate {
                kind: "image",
                id: image_id.0.into(),
            });
        }
        if !self.cameras.contains_key(&image.camera_id) {
            return Err(SceneError::MissingCamera(image.camera_id));
        }
        let frame = self
            .frames
            .get_mut(&image.frame_id)
            .ok_or(SceneError::MissingFrame(image.frame_id))?;
        if !self.rigs[&frame.rig_id].has_sensor(image.camera_id) {
            return Err(SceneError::MissingCamera(image.camera_id));
        }
        if !frame.image_ids.contains(&image_id) {
            frame.image_ids.push(image_id);
        }
        image.clear_points3d();
        self.images.insert(image_id, image);
        Ok(())
    }

    pub fn rig(&self, rig_id: RigId) -> &Rig {
        &self.rigs[&rig_id]
    }

    pub fn camera(&self, camera_id: CameraId) -> &Camera {
        &self.cameras[&camera_id]
    }

    pub fn camera_mut(&mut self, camera_id: CameraId) -> &mut Camera {
        self.cameras
            .get_mut(&camera_id)
            .unwrap_or_else(|| panic!("camera {} does not exist", camera_id))
    }

    pub fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[&frame_id]
    }

    pub fn image(&self, image_id: ImageId) -> &Image {
        &self.images[&image_id]
    }

    pub fn point3d(&self, point3d_id: Point3DId) -> &Point3D {
        &self.points3d[&point3d_id]
    }

    pub fn point3d_mut(&mut self, point3d_id: Point3DId) -> &mut Point3D {
        self.points3d
            .get_mut(&point3d_id)
            .unwrap_or_else(|| panic!("point {} does not exist", point3d_id))
    }

    pub fn rigs(&self) -> impl Iterator<Item = (RigId, &Rig)> + '_ {
        self.rigs.iter().map(|(&id, rig)| (id, rig))
    }

    pub fn cameras(&self) -> impl Iterator<Item = (CameraId, &Camera)> + '_ {
        self.cameras.iter().map(|(&id, camera)| (id, camera))
    }

    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &Frame)> + '_ {
        self.frames.iter().map(|(&id, frame)| (id, frame))
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageId, &Image)> + '_ {
        self.images.iter().map(|(&id, image)| (id, image))
    }

    pub fn points3d(&self) -> impl Iterator<Item = (Point3DId, &Point3D)> + '_ {
        self.points3d.iter().map(|(&id, point)| (id, point))
    }

    pub fn point3d_ids(&self) -> Vec<Point3DId> {
        self.points3d.keys().copied().collect()
    }

    pub fn exists_camera(&self, camera_id: CameraId) -> bool {
        self.cameras.contains_key(&camera_id)
    }

    pub fn exists_frame(&self, frame_id: FrameId) -> bool {
        self.frames.contains_key(&frame_id)
    }

    pub fn exists_image(&self, image_id: ImageId) -> bool {
        self.images.contains_key(&image_id)
    }

    pub fn exists_point3d(&self, point3d_id: Point3DId) -> bool {
        self.points3d.contains_key(&point3d_id)
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }

    pub fn num_reg_frames(&self) -> usize {
        self.frames.values().filter(|f| f.registered).count()
    }

    pub fn num_reg_images(&self) -> usize {
        self.reg_image_ids().len()
    }

    pub fn reg_frame_ids(&self) -> Vec<FrameId> {
        self.frames
            .iter()
            .filter(|(_, f)| f.registered)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn reg_image_ids(&self) -> Vec<ImageId> {
        self.frames
            .values()
            .filter(|f| f.registered)
            .flat_map(|f| f.image_ids.iter().copied())
            .sorted()
            .collect()
    }

    pub fn is_image_registered(&self, image_id: ImageId) -> bool {
        self.images
            .get(&image_id)
            .map_or(false, |image| self.frames[&image.frame_id].registered)
    }

    pub fn find_image_with_name(&self, name: &str) -> Option<ImageId> {
        self.images
            .iter()
            .find(|(_, image)| image.name == name)
            .map(|(&id, _)| id)
    }

    /// Sets the pose of a frame without changing its registration.
    pub fn set_rig_from_world(
        &mut self,
        frame_id: FrameId,
        rig_from_world: WorldToCamera,
    ) -> Result<(), SceneError> {
        let frame = self
            .frames
            .get_mut(&frame_id)
            .ok_or(SceneError::MissingFrame(frame_id))?;
        frame.rig_from_world = Some(rig_from_world);
        Ok(())
    }

    /// Sets the pose of the frame of the image such that the image has the given pose.
    pub fn set_cam_from_world(
        &mut self,
        image_id: ImageId,
        cam_from_world: WorldToCamera,
    ) -> Result<(), SceneError> {
        let image = self
            .images
            .get(&image_id)
            .ok_or(SceneError::MissingImage(image_id))?;
        let frame_id = image.frame_id;
        let cam_from_rig = self.rigs[&self.frames[&frame_id].rig_id]
            .cam_from_rig(image.camera_id)
            .ok_or(SceneError::MissingCamera(image.camera_id))?;
        self.set_rig_from_world(frame_id, cam_from_rig.inverse() * cam_from_world)
    }

    /// The pose of the image, composed from its frame and rig.
    pub fn cam_from_world(&self, image_id: ImageId) -> Option<WorldToCamera> {
        let image = self.images.get(&image_id)?;
        let frame = &self.frames[&image.frame_id];
        let rig_from_world = frame.rig_from_world?;
        let cam_from_rig = self.rigs[&frame.rig_id].cam_from_rig(image.camera_id)?;
        Some(cam_from_rig * rig_from_world)
    }

    /// Registers a frame that has a pose.
    pub fn register_frame(&mut self, frame_id: FrameId) -> Result<(), SceneError> {
        let frame = self
            .frames
            .get_mut(&frame_id)
            .ok_or(SceneError::MissingFrame(frame_id))?;
        if frame.rig_from_world.is_none() {
            return Err(SceneError::FrameNotRegistered(frame_id));
        }
        frame.registered = true;
        Ok(())
    }

    /// Deregisters a frame. None of its images may observe any point.
    pub fn deregister_frame(&mut self, frame_id: FrameId) -> Result<(), SceneError> {
        let frame = self
            .frames
            .get(&frame_id)
            .ok_or(SceneError::MissingFrame(frame_id))?;
        let observed = frame.image_ids.iter().find_map(|&image_id| {
            let (point2d_idx, point3d_id) = self.images[&image_id].triangulated().next()?;
            Some((image_id, point2d_idx, point3d_id))
        });
        if let Some((image_id, point2d_idx, point3d_id)) = observed {
            return Err(SceneError::InvalidTrack {
                image_id,
                point2d_idx,
                reason: InvalidTrackReason::AlreadyTriangulated(point3d_id),
            });
        }
        if let Some(frame) = self.frames.get_mut(&frame_id) {
            frame.registered = false;
        }
        Ok(())
    }

    /// Checks that `element` may join a track. Observations that already belong to one of
    /// `owners` count as free.
    fn validate_element(
        &self,
        element: TrackElement,
        owners: &[Point3DId],
        seen: &mut BTreeSet<TrackElement>,
    ) -> Result<(), SceneError> {
        let TrackElement {
            image_id,
            point2d_idx,
        } = element;
        let invalid = |reason| SceneError::InvalidTrack {
            image_id,
            point2d_idx,
            reason,
        };
        let image = self
            .images
            .get(&image_id)
            .ok_or(SceneError::MissingImage(image_id))?;
        if !self.frames[&image.frame_id].registered {
            return Err(invalid(InvalidTrackReason::ImageNotRegistered));
        }
        if point2d_idx >= image.num_points2d() {
            return Err(invalid(InvalidTrackReason::PointOutOfRange));
        }
        if let Some(point3d_id) = image.point2d(point2d_idx).point3d_id {
            if !owners.contains(&point3d_id) {
                return Err(invalid(InvalidTrackReason::AlreadyTriangulated(point3d_id)));
            }
        }
        if !seen.insert(element) {
            return Err(invalid(InvalidTrackReason::DuplicateElement));
        }
        Ok(())
    }

    /// Adds a point observed by the given track.
    ///
    /// Fails without modifying the reconstruction if any element is out of range, belongs to an
    /// unregistered image or is already triangulated.
    pub fn add_point3d(
        &mut self,
        position: Point3<f64>,
        track: Track,
        color: [u8; 3],
    ) -> Result<Point3DId, SceneError> {
        let point3d_id = Point3DId(self.next_point3d_id);
        self.add_point3d_with_id(point3d_id, Point3D::new(position, color, track))?;
        Ok(point3d_id)
    }

    /// Adds a point under a specific id, as used when reading a stored model.
    pub fn add_point3d_with_id(
        &mut self,
        point3d_id: Point3DId,
        point3d: Point3D,
    ) -> Result<(), SceneError> {
        if self.points3d.contains_key(&point3d_id) {
            return Err(SceneError::Duplicate {
                kind: "point",
                id: point3d_id.0,
            });
        }
        let mut seen = BTreeSet::new();
        for element in &point3d.track {
            self.validate_element(element, &[], &mut seen)?;
        }
        for element in &point3d.track {
            self.image_mut(element.image_id)
                .set_point3d(element.point2d_idx, point3d_id);
        }
        self.next_point3d_id = self.next_point3d_id.max(point3d_id.0 + 1);
        self.points3d.insert(point3d_id, point3d);
        Ok(())
    }

    /// Adds one more observation to an existing point.
    pub fn add_observation(
        &mut self,
        point3d_id: Point3DId,
        element: TrackElement,
    ) -> Result<(), SceneError> {
        let point3d = self
            .points3d
            .get(&point3d_id)
            .ok_or(SceneError::MissingPoint3D(point3d_id))?;
        let mut seen: BTreeSet<TrackElement> = point3d.track.iter().collect();
        self.validate_element(element, &[], &mut seen)?;
        self.image_mut(element.image_id)
            .set_point3d(element.point2d_idx, point3d_id);
        self.point3d_mut(point3d_id).track.add_element(element);
        Ok(())
    }

    /// Deletes a point and detaches every keypoint of its track.
    pub fn delete_point3d(&mut self, point3d_id: Point3DId) -> Result<Point3D, SceneError> {
        let point3d = self
            .points3d
            .remove(&point3d_id)
            .ok_or(SceneError::MissingPoint3D(point3d_id))?;
        for element in &point3d.track {
            self.image_mut(element.image_id)
                .reset_point3d(element.point2d_idx);
        }
        Ok(point3d)
    }

    /// Detaches a keypoint from its point. Deletes the point if it would be left with fewer than
    /// two observations.
    pub fn delete_observation(
        &mut self,
        image_id: ImageId,
        point2d_idx: usize,
    ) -> Result<(), SceneError> {
        let point3d_id = self.observed_point3d(image_id, point2d_idx)?;
        if self.points3d[&point3d_id].track.len() <= 2 {
            self.delete_point3d(point3d_id)?;
            return Ok(());
        }
        self.point3d_mut(point3d_id)
            .track
            .delete_element(TrackElement::new(image_id, point2d_idx));
        self.image_mut(image_id).reset_point3d(point2d_idx);
        Ok(())
    }

    pub(crate) fn observed_point3d(
        &self,
        image_id: ImageId,
        point2d_idx: usize,
    ) -> Result<Point3DId, SceneError> {
        let image = self
            .images
            .get(&image_id)
            .ok_or(SceneError::MissingImage(image_id))?;
        image
            .points2d()
            .get(point2d_idx)
            .and_then(|p| p.point3d_id)
            .ok_or(SceneError::InvalidTrack {
                image_id,
                point2d_idx,
                reason: InvalidTrackReason::PointOutOfRange,
            })
    }

    /// Replaces two points by one whose position and color are the track length weighted average
    /// and whose track is the union of both tracks.
    ///
    /// Fails without modifying the reconstruction if the ids are equal, either point is missing
    /// or the union track is invalid.
    pub fn merge_points3d(
        &mut self,
        point3d_id1: Point3DId,
        point3d_id2: Point3DId,
    ) -> Result<Point3DId, SceneError> {
        if point3d_id1 == point3d_id2 {
            return Err(SceneError::MergeWithItself(point3d_id1));
        }
        let owners = [point3d_id1, point3d_id2];
        let mut seen = BTreeSet::new();
        for point3d_id in owners {
            let point3d = self
                .points3d
                .get(&point3d_id)
                .ok_or(SceneError::MissingPoint3D(point3d_id))?;
            for element in &point3d.track {
                self.validate_element(element, &owners, &mut seen)?;
            }
        }

        let point1 = self.delete_point3d(point3d_id1)?;
        let point2 = self.delete_point3d(point3d_id2)?;
        let weight1 = point1.track.len() as f64;
        let weight2 = point2.track.len() as f64;
        let total = weight1 + weight2;
        let position = Point3::from(
            (weight1 * point1.position.coords + weight2 * point2.position.coords) / total,
        );
        let color = [0, 1, 2].map(|c| {
            ((weight1 * point1.color[c] as f64 + weight2 * point2.color[c] as f64) / total).round()
                as u8
        });
        let mut track = point1.track;
        track.add_elements(point2.track.iter());
        self.add_point3d(position, track, color)
    }

    fn image_mut(&mut self, image_id: ImageId) -> &mut Image {
        self.images
            .get_mut(&image_id)
            .unwrap_or_else(|| panic!("image {} does not exist", image_id))
    }

    /// Pixel reprojection error of every observation of the point.
    pub fn observation_errors(&self, point3d_id: Point3DId) -> Vec<(TrackElement, f64)> {
        let point3d = &self.points3d[&point3d_id];
        point3d
            .track
            .iter()
            .map(|element| {
                let image = &self.images[&element.image_id];
                let error = self
                    .cam_from_world(element.image_id)
                    .map(|cam_from_world| {
                        reprojection_error(
                            &self.cameras[&image.camera_id],
                            cam_from_world,
                            &image.point2d(element.point2d_idx).keypoint,
                            &point3d.position,
                        )
                    })
                    .unwrap_or(f64::INFINITY);
                (element, error)
            })
            .collect()
    }

    /// Recomputes the mean reprojection error of every point.
    pub fn update_point3d_errors(&mut self) {
        for point3d_id in self.point3d_ids() {
            self.update_point3d_error(point3d_id);
        }
    }

    pub fn update_point3d_error(&mut self, point3d_id: Point3DId) {
        let errors = self.observation_errors(point3d_id);
        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.iter().map(|&(_, e)| e).sum::<f64>() / errors.len() as f64)
        };
        self.point3d_mut(point3d_id).error = error;
    }

    pub fn compute_num_observations(&self) -> usize {
        self.points3d.values().map(|p| p.track.len()).sum()
    }

    pub fn compute_mean_track_length(&self) -> f64 {
        if self.points3d.is_empty() {
            return 0.0;
        }
        self.compute_num_observations() as f64 / self.points3d.len() as f64
    }

    pub fn compute_mean_observations_per_reg_image(&self) -> f64 {
        let num_reg_images = self.num_reg_images();
        if num_reg_images == 0 {
            return 0.0;
        }
        self.compute_num_observations() as f64 / num_reg_images as f64
    }

    /// Mean of the stored point errors, ignoring points without one.
    pub fn compute_mean_reprojection_error(&self) -> f64 {
        let errors: Vec<f64> = self.points3d.values().filter_map(|p| p.error).collect();
        if errors.is_empty() {
            return 0.0;
        }
        errors.iter().sum::<f64>() / errors.len() as f64
    }

    /// Applies a similarity to the whole model, including the rig baselines.
    pub fn transform(&mut self, new_from_old: &Sim3) {
        for rig in self.rigs.values_mut() {
            for (_, cam_from_rig) in &mut rig.sensors {
                *cam_from_rig = cam_from_rig.scale(new_from_old.scale);
            }
        }
        for frame in self.frames.values_mut() {
            if let Some(rig_from_world) = &mut frame.rig_from_world {
                *rig_from_world = new_from_old.transform_pose(*rig_from_world);
            }
        }
        for point in self.points3d.values_mut() {
            point.position = new_from_old.transform_point(&point.position);
        }
    }

    /// Centers and rescales the model so that the robust extent of the registered camera centers
    /// (or of the points, if there are fewer than two registered images) is `extent`.
    ///
    /// The robust extent ignores coordinates below percentile `p0` and above percentile `p1` on
    /// each axis. Returns the applied transform.
    pub fn normalize(&mut self, extent: f64, p0: f64, p1: f64, use_images: bool) -> Sim3 {
        assert!(extent > 0.0);
        assert!((0.0..=1.0).contains(&p0) && (0.0..=1.0).contains(&p1) && p0 <= p1);

        let mut positions: Vec<Point3<f64>> = if use_images {
            self.reg_image_ids()
                .into_iter()
                .filter_map(|id| self.cam_from_world(id))
                .map(|pose| pose.center())
                .collect()
        } else {
            vec![]
        };
        if positions.len() < 2 {
            positions = self.points3d.values().map(|p| p.position).collect();
        }
        if positions.len() < 2 {
            return Sim3::identity();
        }

        let mut bounds = [(0.0, 0.0); 3];
        for (axis, bound) in bounds.iter_mut().enumerate() {
            let mut coords: Vec<f64> = positions.iter().map(|p| p[axis]).collect();
            coords.sort_unstable_by_key(|&c| FloatOrd(c));
            let last = coords.len() - 1;
            *bound = (
                coords[(p0 * last as f64).round() as usize],
                coords[(p1 * last as f64).round() as usize],
            );
        }
        let inside: Vec<Vector3<f64>> = positions
            .iter()
            .filter(|p| (0..3).all(|axis| p[axis] >= bounds[axis].0 && p[axis] <= bounds[axis].1))
            .map(|p| p.coords)
            .collect();
        let mean = if inside.is_empty() {
            Vector3::zeros()
        } else {
            inside.iter().sum::<Vector3<f64>>() / inside.len() as f64
        };
        let diagonal = Vector3::new(
            bounds[0].1 - bounds[0].0,
            bounds[1].1 - bounds[1].0,
            bounds[2].1 - bounds[2].0,
        )
        .norm();
        let scale = if diagonal < f64::EPSILON {
            1.0
        } else {
            extent / diagonal
        };
        let tform = Sim3::new(scale, UnitQuaternion::identity(), -scale * mean);
        self.transform(&tform);
        tform
    }

    /// Colors every black point seen by the image with the color of its keypoint.
    ///
    /// Returns whether the image exists and is registered.
    pub fn extract_colors_for_image(&mut self, image_id: ImageId) -> bool {
        if !self.is_image_registered(image_id) {
            return false;
        }
        let image = &self.images[&image_id];
        for point in image.points2d() {
            if let Some(point3d) = point.point3d_id.and_then(|id| self.points3d.get_mut(&id)) {
                if point3d.color == [0, 0, 0] {
                    point3d.color = point.color;
                }
            }
        }
        true
    }

    /// Sets every point's color to the mean color of its observations.
    pub fn extract_colors_for_all_images(&mut self) {
        let images = &self.images;
        for point3d in self.points3d.values_mut() {
            if point3d.track.is_empty() {
                continue;
            }
            let mut sum = [0.0f64; 3];
            for element in &point3d.track {
                let color = images[&element.image_id].point2d(element.point2d_idx).color;
                for c in 0..3 {
                    sum[c] += color[c] as f64;
                }
            }
            let n = point3d.track.len() as f64;
            point3d.color = sum.map(|s| (s / n).round() as u8);
        }
    }

    /// Aligns the model to the cartesian priors of its registered images.
    ///
    /// At least three registered images need a valid prior. Returns the applied transform.
    pub fn align_to_pose_priors(&mut self, priors: &HashMap<ImageId, PosePrior>) -> Option<Sim3> {
        let (src, dst): (Vec<Point3<f64>>, Vec<Point3<f64>>) = self
            .reg_image_ids()
            .into_iter()
            .filter_map(|image_id| {
                let prior = priors.get(&image_id)?;
                if prior.coordinate_system == crate::CoordinateSystem::Wgs84
                    || !prior.has_valid_position()
                {
                    return None;
                }
                Some((self.cam_from_world(image_id)?.center(), prior.position))
            })
            .unzip();
        if src.len() < 3 {
            warn!(
                "cannot align to pose priors with only {} registered images with priors",
                src.len()
            );
            return None;
        }
        let prior_from_model = Sim3::estimate(&src, &dst)?;
        self.transform(&prior_from_model);
        Some(prior_from_model)
    }

    /// Removes every point and detaches every keypoint.
    pub fn delete_all_points3d(&mut self) {
        self.points3d.clear();
        for image in self.images.values_mut() {
            image.clear_points3d();
        }
    }

    /// Checks the referential invariants, logging every violation found.
    pub fn check_consistency(&self) -> bool {
        let mut consistent = true;
        for (&point3d_id, point3d) in &self.points3d {
            for element in &point3d.track {
                let observed = self
                    .images
                    .get(&element.image_id)
                    .and_then(|image| image.points2d().get(element.point2d_idx))
                    .and_then(|p| p.point3d_id);
                if observed != Some(point3d_id) {
                    error!(
                        "point {} lists image {} keypoint {} which references {:?}",
                        point3d_id, element.image_id, element.point2d_idx, observed
                    );
                    consistent = false;
                }
                if !self.is_image_registered(element.image_id) {
                    error!(
                        "point {} is observed by unregistered image {}",
                        point3d_id, element.image_id
                    );
                    consistent = false;
                }
            }
        }
        for (&image_id, image) in &self.images {
            for (point2d_idx, point3d_id) in image.triangulated() {
                let listed = self.points3d.get(&point3d_id).map_or(false, |p| {
                    p.track
                        .elements()
                        .contains(&TrackElement::new(image_id, point2d_idx))
                });
                if !listed {
                    error!(
                        "image {} keypoint {} references point {} that does not list it",
                        image_id, point2d_idx, point3d_id
                    );
                    consistent = false;
                }
            }
        }
        consistent
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::Point2D;
    use approx::assert_relative_eq;
    use sfm_core::{nalgebra::Rotation3, CameraModelId};

    /// Three registered single camera frames looking down +z and one unregistered frame.
    pub(crate) fn three_view_scene() -> Reconstruction {
        let mut reconstruction = Reconstruction::new();
        let camera = Camera::new(CameraModelId::SimplePinhole, 500.0, 640, 480);
        let rig_id = reconstruction
            .add_camera_with_trivial_rig(CameraId(1), camera.clone())
            .unwrap();
        let points: Vec<Point3<f64>> = (0..10)
            .map(|i| Point3::new(i as f64 * 0.2 - 1.0, (i % 3) as f64 * 0.3 - 0.3, 5.0))
            .collect();
        for i in 0..4u32 {
            let pose = WorldToCamera::from_parts(
                Vector3::new(-(i as f64) * 0.5, 0.0, 0.0),
                Rotation3::identity(),
            );
            reconstruction
                .add_frame(FrameId(i), Frame::new(rig_id))
                .unwrap();
            let points2d = points
                .iter()
                .map(|p| Point2D::new(camera.uncalibrate(pose.project(p).unwrap()), [10, 20, 30]))
                .collect();
            reconstruction
                .add_image(
                    ImageId(i),
                    Image::new(format!("{}.png", i), CameraId(1), FrameId(i), points2d),
                )
                .unwrap();
            reconstruction
                .set_rig_from_world(FrameId(i), pose)
                .unwrap();
            if i < 3 {
                reconstruction.register_frame(FrameId(i)).unwrap();
            }
        }
        reconstruction
    }

    fn track(elements: &[(u32, usize)]) -> Track {
        elements
            .iter()
            .map(|&(image, idx)| TrackElement::new(ImageId(image), idx))
            .collect()
    }

    #[test]
    fn add_point_links_observations() {
        let mut reconstruction = three_view_scene();
        let id = reconstruction
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track(&[(0, 0), (1, 0)]), [0; 3])
            .unwrap();
        assert_eq!(reconstruction.image(ImageId(0)).point2d(0).point3d_id, Some(id));
        assert_eq!(reconstruction.image(ImageId(1)).num_points3d(), 1);
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn claimed_observation_is_rejected_without_mutation() {
        let mut reconstruction = three_view_scene();
        reconstruction
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track(&[(0, 0), (1, 0)]), [0; 3])
            .unwrap();
        let before = reconstruction.clone();
        let result =
            reconstruction.add_point3d(Point3::new(0.0, 0.0, 5.0), track(&[(2, 0), (1, 0)]), [0; 3]);
        assert!(matches!(
            result,
            Err(SceneError::InvalidTrack {
                reason: InvalidTrackReason::AlreadyTriangulated(_),
                ..
            })
        ));
        assert_eq!(reconstruction, before);
    }

    #[test]
    fn unregistered_and_out_of_range_observations_are_rejected() {
        let mut reconstruction = three_view_scene();
        let before = reconstruction.clone();
        assert!(reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 1), (3, 1)]), [0; 3])
            .is_err());
        assert!(reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 1), (1, 99)]), [0; 3])
            .is_err());
        assert!(reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 1), (0, 1)]), [0; 3])
            .is_err());
        assert_eq!(reconstruction, before);
    }

    #[test]
    fn deleting_an_observation_of_a_two_view_point_deletes_the_point() {
        let mut reconstruction = three_view_scene();
        let id = reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 4), (1, 4)]), [0; 3])
            .unwrap();
        reconstruction.delete_observation(ImageId(1), 4).unwrap();
        assert!(!reconstruction.exists_point3d(id));
        assert_eq!(reconstruction.image(ImageId(0)).num_points3d(), 0);

        let id = reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 4), (1, 4), (2, 4)]), [0; 3])
            .unwrap();
        reconstruction.delete_observation(ImageId(1), 4).unwrap();
        assert_eq!(reconstruction.point3d(id).track.len(), 2);
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn merge_averages_by_track_length() {
        let mut reconstruction = three_view_scene();
        let a = reconstruction
            .add_point3d(Point3::new(0.0, 0.0, 3.0), track(&[(0, 5), (1, 5)]), [30, 0, 0])
            .unwrap();
        let b = reconstruction
            .add_point3d(Point3::new(0.0, 0.0, 6.0), track(&[(2, 5)]), [0, 0, 0])
            .unwrap();
        let merged = reconstruction.merge_points3d(a, b).unwrap();
        let point = reconstruction.point3d(merged);
        assert_relative_eq!(point.position, Point3::new(0.0, 0.0, 4.0));
        assert_eq!(point.color, [20, 0, 0]);
        assert_eq!(point.track.len(), 3);
        assert!(!reconstruction.exists_point3d(a));
        assert!(!reconstruction.exists_point3d(b));
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn rejected_merge_keeps_both_points() {
        let mut reconstruction = three_view_scene();
        let a = reconstruction
            .add_point3d(Point3::new(0.0, 0.0, 3.0), track(&[(0, 5), (1, 5)]), [30, 0, 0])
            .unwrap();
        let b = reconstruction
            .add_point3d(Point3::new(0.0, 0.0, 6.0), track(&[(2, 5)]), [0, 0, 0])
            .unwrap();

        assert!(matches!(
            reconstruction.merge_points3d(a, a),
            Err(SceneError::MergeWithItself(id)) if id == a
        ));
        let missing = Point3DId(1000);
        assert!(matches!(
            reconstruction.merge_points3d(a, missing),
            Err(SceneError::MissingPoint3D(id)) if id == missing
        ));
        assert!(matches!(
            reconstruction.merge_points3d(missing, b),
            Err(SceneError::MissingPoint3D(id)) if id == missing
        ));

        assert_eq!(reconstruction.num_points3d(), 2);
        assert_eq!(reconstruction.point3d(a).track.len(), 2);
        assert_eq!(reconstruction.point3d(b).track.len(), 1);
        assert_eq!(reconstruction.image(ImageId(0)).point2d(5).point3d_id, Some(a));
        assert_eq!(reconstruction.image(ImageId(2)).point2d(5).point3d_id, Some(b));
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn transform_preserves_reprojection() {
        let mut reconstruction = three_view_scene();
        let id = reconstruction
            .add_point3d(
                Point3::new(-1.0, -0.3, 5.0),
                track(&[(0, 0), (1, 0), (2, 0)]),
                [0; 3],
            )
            .unwrap();
        let tform = Sim3::new(
            2.5,
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.1),
            Vector3::new(1.0, 2.0, 3.0),
        );
        reconstruction.transform(&tform);
        for (_, error) in reconstruction.observation_errors(id) {
            assert!(error < 1e-8);
        }
    }

    #[test]
    fn normalize_sets_extent() {
        let mut reconstruction = three_view_scene();
        reconstruction.normalize(10.0, 0.0, 1.0, true);
        let centers: Vec<Point3<f64>> = reconstruction
            .reg_image_ids()
            .into_iter()
            .map(|id| reconstruction.cam_from_world(id).unwrap().center())
            .collect();
        assert_relative_eq!((centers[2] - centers[0]).norm(), 10.0, epsilon = 1e-9);
        let mean = centers.iter().map(|c| c.coords).sum::<Vector3<f64>>() / 3.0;
        assert_relative_eq!(mean, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn deregistering_a_frame_with_observations_fails() {
        let mut reconstruction = three_view_scene();
        reconstruction
            .add_point3d(Point3::origin(), track(&[(0, 4), (1, 4)]), [0; 3])
            .unwrap();
        assert!(reconstruction.deregister_frame(FrameId(0)).is_err());
        assert!(reconstruction.deregister_frame(FrameId(2)).is_ok());
        assert!(!reconstruction.is_image_registered(ImageId(2)));
    }
}
