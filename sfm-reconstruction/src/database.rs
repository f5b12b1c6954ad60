use crate::{
    pose_prior::wgs84_to_enu, CameraId, CoordinateSystem, CorrespondenceGraph, Frame, FrameId,
    Image, ImageId, ImagePair, Point2D, PosePrior, Reconstruction, Rig, RigId, SceneError,
};
use log::*;
use serde::{Deserialize, Serialize};
use sfm_core::{nalgebra::Point3, Camera, CameraToCamera, KeyPoint, Pose};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

/// What kind of geometry verified the matches between two images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TwoViewGeometryConfig {
    #[default]
    Undefined,
    Degenerate,
    /// Essential matrix between calibrated cameras.
    Calibrated,
    /// Fundamental matrix between uncalibrated cameras.
    Uncalibrated,
    Planar,
    /// Pure rotation between the views.
    Panoramic,
    PlanarOrPanoramic,
    /// Matches on a watermark or timestamp that moves with the image border.
    Watermark,
    MultipleDegenerate,
}

/// Verified matches between two images, oriented from the first image to the second.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwoViewGeometry {
    #[serde(default)]
    pub config: TwoViewGeometryConfig,
    /// Pairs of `(point2d_idx1, point2d_idx2)`.
    pub inlier_matches: Vec<(usize, usize)>,
    #[serde(default)]
    pub cam2_from_cam1: Option<CameraToCamera>,
}

impl TwoViewGeometry {
    /// The same geometry seen from the second image.
    pub fn inverted(&self) -> Self {
        Self {
            config: self.config,
            inlier_matches: self.inlier_matches.iter().map(|&(a, b)| (b, a)).collect(),
            cam2_from_cam1: self.cam2_from_cam1.map(|pose| pose.inverse()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub camera_id: CameraId,
    pub camera: Camera,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigRecord {
    pub rig_id: RigId,
    pub rig: Rig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_id: FrameId,
    pub rig_id: RigId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: ImageId,
    pub name: String,
    pub camera_id: CameraId,
    /// Images without a frame get a frame of their own under a trivial rig.
    #[serde(default)]
    pub frame_id: Option<FrameId>,
    pub keypoints: Vec<KeyPoint>,
    /// Color under each keypoint. Missing colors are black.
    #[serde(default)]
    pub colors: Vec<[u8; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePriorRecord {
    pub image_id: ImageId,
    pub prior: PosePrior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoViewGeometryRecord {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub geometry: TwoViewGeometry,
}

/// The output of feature extraction and matching, stored as JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Database {
    pub cameras: Vec<CameraRecord>,
    #[serde(default)]
    pub rigs: Vec<RigRecord>,
    #[serde(default)]
    pub frames: Vec<FrameRecord>,
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub pose_priors: Vec<PosePriorRecord>,
    #[serde(default)]
    pub two_view_geometries: Vec<TwoViewGeometryRecord>,
}

impl Database {
    pub fn read_json(reader: impl Read) -> Result<Self, SceneError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write_json(&self, writer: impl Write) -> Result<(), SceneError> {
        Ok(serde_json::to_writer_pretty(writer, self)?)
    }

    /// Positions of the priors, used by the spatial pair generator.
    pub fn pairing_images(&self) -> Vec<crate::PairingImage> {
        let priors: HashMap<ImageId, &PosePrior> = self
            .pose_priors
            .iter()
            .map(|record| (record.image_id, &record.prior))
            .collect();
        self.images
            .iter()
            .map(|image| crate::PairingImage {
                image_id: image.image_id,
                name: image.name.clone(),
                position: priors
                    .get(&image.image_id)
                    .filter(|prior| prior.has_valid_position())
                    .map(|prior| prior.position),
            })
            .collect()
    }
}

/// Which parts of a [`Database`] a [`DatabaseCache`] loads.
#[derive(Debug, Clone, Default)]
pub struct DatabaseCacheOptions {
    /// Image pairs with fewer inlier matches are ignored.
    pub min_num_matches: usize,
    pub ignore_watermarks: bool,
    /// Restricts the cache to these images. Empty means all images.
    pub image_names: HashSet<String>,
    /// Restricts the cache to these pairs, usually produced by a pair generator.
    pub image_pairs: Option<HashSet<ImagePair>>,
}

/// The subset of a [`Database`] used for reconstruction along with its correspondence graph.
///
/// Images without any usable correspondence are dropped.
#[derive(Debug, Clone)]
pub struct DatabaseCache {
    cameras: BTreeMap<CameraId, Camera>,
    rigs: BTreeMap<RigId, Rig>,
    frames: BTreeMap<FrameId, Frame>,
    images: BTreeMap<ImageId, Image>,
    pose_priors: HashMap<ImageId, PosePrior>,
    two_view_geometries: HashMap<ImagePair, TwoViewGeometry>,
    correspondence_graph: Arc<CorrespondenceGraph>,
}

impl DatabaseCache {
    pub fn create(database: &Database, options: &DatabaseCacheOptions) -> Result<Self, SceneError> {
        let cameras: BTreeMap<CameraId, Camera> = database
            .cameras
            .iter()
            .map(|record| (record.camera_id, record.camera.clone()))
            .collect();

        let mut rigs: BTreeMap<RigId, Rig> = database
            .rigs
            .iter()
            .map(|record| (record.rig_id, record.rig.clone()))
            .collect();
        for &camera_id in cameras.keys() {
            if !rigs.values().any(|rig| rig.has_sensor(camera_id)) {
                let rig_id = RigId(camera_id.0);
                if rigs.contains_key(&rig_id) {
                    return Err(SceneError::Duplicate {
                        kind: "rig",
                        id: rig_id.0.into(),
                    });
                }
                rigs.insert(rig_id, Rig::trivial(camera_id));
            }
        }

        let mut frames: BTreeMap<FrameId, Frame> = database
            .frames
            .iter()
            .map(|record| (record.frame_id, Frame::new(record.rig_id)))
            .collect();

        let mut images = BTreeMap::new();
        let mut image_names = HashMap::new();
        for record in &database.images {
            if !options.image_names.is_empty() && !options.image_names.contains(&record.name) {
                continue;
            }
            if !cameras.contains_key(&record.camera_id) {
                return Err(SceneError::MissingCamera(record.camera_id));
            }
            let frame_id = match record.frame_id {
                Some(frame_id) => frame_id,
                None => {
                    let frame_id = FrameId(record.image_id.0);
                    let rig_id = rigs
                        .iter()
                        .find(|(_, rig)| rig.ref_sensor == record.camera_id)
                        .map(|(&id, _)| id)
                        .ok_or(SceneError::MissingCamera(record.camera_id))?;
                    if frames.insert(frame_id, Frame::new(rig_id)).is_some() {
                        return Err(SceneError::Duplicate {
                            kind: "frame",
                            id: frame_id.0.into(),
                        });
                    }
                    frame_id
                }
            };
            let points2d = record
                .keypoints
                .iter()
                .enumerate()
                .map(|(ix, &keypoint)| {
                    Point2D::new(keypoint, record.colors.get(ix).copied().unwrap_or_default())
                })
                .collect();
            image_names.insert(record.image_id, record.name.clone());
            images.insert(
                record.image_id,
                Image::new(record.name.clone(), record.camera_id, frame_id, points2d),
            );
        }

        let mut graph = CorrespondenceGraph::new();
        for (&image_id, image) in &images {
            graph.add_image(image_id, image.num_points2d());
        }
        let mut two_view_geometries = HashMap::new();
        for record in &database.two_view_geometries {
            let pair = ImagePair::new(record.image_id1, record.image_id2);
            if !images.contains_key(&record.image_id1) || !images.contains_key(&record.image_id2) {
                continue;
            }
            if let Some(pairs) = &options.image_pairs {
                if !pairs.contains(&pair) {
                    continue;
                }
            }
            let geometry = &record.geometry;
            if geometry.inlier_matches.len() < options.min_num_matches {
                continue;
            }
            if options.ignore_watermarks && geometry.config == TwoViewGeometryConfig::Watermark {
                debug!(
                    "ignoring watermark matches between {} and {}",
                    image_names[&record.image_id1], image_names[&record.image_id2]
                );
                continue;
            }
            graph.add_correspondences(
                record.image_id1,
                record.image_id2,
                &geometry.inlier_matches,
            )?;
            let oriented = if record.image_id1 <= record.image_id2 {
                geometry.clone()
            } else {
                geometry.inverted()
            };
            two_view_geometries.insert(pair, oriented);
        }
        graph.finalize();

        images.retain(|&image_id, _| graph.exists_image(image_id));
        if images.is_empty() {
            return Err(SceneError::NoImagesWithMatches);
        }
        let image_ids: BTreeSet<ImageId> = images.keys().copied().collect();
        for (&image_id, image) in &images {
            if let Some(frame) = frames.get_mut(&image.frame_id) {
                frame.image_ids.push(image_id);
            } else {
                return Err(SceneError::MissingFrame(image.frame_id));
            }
        }
        frames.retain(|_, frame| !frame.image_ids.is_empty());

        let pose_priors = setup_pose_priors(
            database
                .pose_priors
                .iter()
                .filter(|record| image_ids.contains(&record.image_id))
                .map(|record| (record.image_id, record.prior))
                .collect(),
        );

        info!(
            "loaded {} cameras, {} frames, {} images and {} image pairs",
            cameras.len(),
            frames.len(),
            images.len(),
            two_view_geometries.len()
        );
        Ok(Self {
            cameras,
            rigs,
            frames,
            images,
            pose_priors,
            two_view_geometries,
            correspondence_graph: Arc::new(graph),
        })
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn cameras(&self) -> &BTreeMap<CameraId, Camera> {
        &self.cameras
    }

    pub fn rigs(&self) -> &BTreeMap<RigId, Rig> {
        &self.rigs
    }

    pub fn frames(&self) -> &BTreeMap<FrameId, Frame> {
        &self.frames
    }

    pub fn images(&self) -> &BTreeMap<ImageId, Image> {
        &self.images
    }

    pub fn exists_image(&self, image_id: ImageId) -> bool {
        self.images.contains_key(&image_id)
    }

    pub fn find_image_with_name(&self, name: &str) -> Option<ImageId> {
        self.images
            .iter()
            .find(|(_, image)| image.name == name)
            .map(|(&id, _)| id)
    }

    /// Priors in a cartesian frame. WGS84 priors are already converted.
    pub fn pose_priors(&self) -> &HashMap<ImageId, PosePrior> {
        &self.pose_priors
    }

    pub fn correspondence_graph(&self) -> &Arc<CorrespondenceGraph> {
        &self.correspondence_graph
    }

    /// The geometry between two images oriented from `image_id1` to `image_id2`.
    pub fn two_view_geometry(&self, image_id1: ImageId, image_id2: ImageId) -> Option<TwoViewGeometry> {
        let geometry = self
            .two_view_geometries
            .get(&ImagePair::new(image_id1, image_id2))?;
        if image_id1 <= image_id2 {
            Some(geometry.clone())
        } else {
            Some(geometry.inverted())
        }
    }

    /// Adds every camera, rig, frame and image that the reconstruction does not have yet.
    ///
    /// Existing entities keep their state, which lets a previous reconstruction be continued.
    pub fn setup_reconstruction(&self, reconstruction: &mut Reconstruction) -> Result<(), SceneError> {
        for (&camera_id, camera) in &self.cameras {
            if !reconstruction.exists_camera(camera_id) {
                reconstruction.add_camera(camera_id, camera.clone())?;
            }
        }
        let existing_rigs: BTreeSet<RigId> = reconstruction.rigs().map(|(id, _)| id).collect();
        for (&rig_id, rig) in &self.rigs {
            if !existing_rigs.contains(&rig_id) {
                reconstruction.add_rig(rig_id, rig.clone())?;
            }
        }
        for (&frame_id, frame) in &self.frames {
            if !reconstruction.exists_frame(frame_id) {
                reconstruction.add_frame(frame_id, Frame::new(frame.rig_id))?;
            }
        }
        for (&image_id, image) in &self.images {
            if !reconstruction.exists_image(image_id) {
                reconstruction.add_image(image_id, image.clone())?;
            }
        }
        Ok(())
    }
}

/// Converts WGS84 priors to a local east north up frame anchored at the first WGS84 prior.
fn setup_pose_priors(mut priors: BTreeMap<ImageId, PosePrior>) -> HashMap<ImageId, PosePrior> {
    let wgs84: Vec<(ImageId, Point3<f64>)> = priors
        .iter()
        .filter(|(_, prior)| {
            prior.coordinate_system == CoordinateSystem::Wgs84 && prior.has_valid_position()
        })
        .map(|(&id, prior)| (id, prior.position))
        .collect();
    if let Some(&(_, reference)) = wgs84.first() {
        let lla: Vec<Point3<f64>> = wgs84.iter().map(|&(_, p)| p).collect();
        let enu = wgs84_to_enu(&lla, reference.x, reference.y);
        for (&(image_id, _), position) in wgs84.iter().zip(enu) {
            if let Some(prior) = priors.get_mut(&image_id) {
                prior.position = position;
                prior.coordinate_system = CoordinateSystem::Cartesian;
            }
        }
        debug!("converted {} wgs84 priors to enu", wgs84.len());
    }
    priors.into_iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use sfm_core::CameraModelId;

    fn database() -> Database {
        let camera = Camera::new(CameraModelId::SimplePinhole, 500.0, 640, 480);
        let images = (0..4u32)
            .map(|i| ImageRecord {
                image_id: ImageId(i),
                name: format!("{}.png", i),
                camera_id: CameraId(1),
                frame_id: None,
                keypoints: (0..20).map(|k| KeyPoint::new(k as f64, i as f64)).collect(),
                colors: vec![],
            })
            .collect();
        let matches = |n: usize| (0..n).map(|k| (k, k)).collect::<Vec<_>>();
        Database {
            cameras: vec![CameraRecord {
                camera_id: CameraId(1),
                camera,
            }],
            images,
            pose_priors: vec![PosePriorRecord {
                image_id: ImageId(1),
                prior: PosePrior::new(CoordinateSystem::Wgs84, Point3::new(48.0, 11.0, 0.0)),
            }],
            two_view_geometries: vec![
                TwoViewGeometryRecord {
                    image_id1: ImageId(1),
                    image_id2: ImageId(0),
                    geometry: TwoViewGeometry {
                        config: TwoViewGeometryConfig::Calibrated,
                        inlier_matches: vec![(3, 4); 1]
                            .into_iter()
                            .chain(matches(19).into_iter().skip(5))
                            .collect(),
                        cam2_from_cam1: None,
                    },
                },
                TwoViewGeometryRecord {
                    image_id1: ImageId(1),
                    image_id2: ImageId(2),
                    geometry: TwoViewGeometry {
                        config: TwoViewGeometryConfig::Watermark,
                        inlier_matches: matches(20),
                        cam2_from_cam1: None,
                    },
                },
                TwoViewGeometryRecord {
                    image_id1: ImageId(2),
                    image_id2: ImageId(3),
                    geometry: TwoViewGeometry {
                        config: TwoViewGeometryConfig::Calibrated,
                        inlier_matches: matches(3),
                        cam2_from_cam1: None,
                    },
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn json_round_trip() {
        let database = database();
        let mut buffer = vec![];
        database.write_json(&mut buffer).unwrap();
        assert_eq!(Database::read_json(buffer.as_slice()).unwrap(), database);
    }

    #[test]
    fn cache_filters_pairs_and_images() {
        let options = DatabaseCacheOptions {
            min_num_matches: 10,
            ignore_watermarks: true,
            ..Default::default()
        };
        let cache = DatabaseCache::create(&database(), &options).unwrap();
        assert_eq!(cache.num_images(), 2);
        assert!(cache.exists_image(ImageId(0)) && cache.exists_image(ImageId(1)));
        assert_eq!(cache.num_frames(), 2);
        assert_eq!(cache.rigs().len(), 1);

        let graph = cache.correspondence_graph();
        assert_eq!(graph.num_correspondences_between_images(ImageId(0), ImageId(1)), 15);
        let geometry = cache.two_view_geometry(ImageId(0), ImageId(1)).unwrap();
        assert_eq!(geometry.inlier_matches[0], (4, 3));
        let geometry = cache.two_view_geometry(ImageId(1), ImageId(0)).unwrap();
        assert_eq!(geometry.inlier_matches[0], (3, 4));

        let prior = cache.pose_priors()[&ImageId(1)];
        assert_eq!(prior.coordinate_system, CoordinateSystem::Cartesian);
        assert!(prior.position.coords.norm() < 1e-6);

        let mut reconstruction = Reconstruction::new();
        cache.setup_reconstruction(&mut reconstruction).unwrap();
        assert_eq!(reconstruction.num_images(), 2);
        assert_eq!(reconstruction.num_reg_frames(), 0);
    }

    #[test]
    fn watermarks_are_kept_unless_ignored() {
        let options = DatabaseCacheOptions {
            min_num_matches: 10,
            ..Default::default()
        };
        let cache = DatabaseCache::create(&database(), &options).unwrap();
        assert_eq!(cache.num_images(), 3);
    }

    #[test]
    fn no_matches_is_an_error() {
        let options = DatabaseCacheOptions {
            min_num_matches: 100,
            ..Default::default()
        };
        assert!(matches!(
            DatabaseCache::create(&database(), &options),
            Err(SceneError::NoImagesWithMatches)
        ));
    }
}
