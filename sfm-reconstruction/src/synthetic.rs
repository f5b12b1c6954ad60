//! Synthetic scenes for tests and benchmarks.
//!
//! Frames are placed on an arc around the origin looking inwards and points are scattered in a cube
//! around the origin. Every point that projects into two or more images is matched between all of
//! those images.

use crate::{
    CameraId, CameraRecord, CoordinateSystem, Database, ImageId, ImageRecord, PosePrior,
    PosePriorRecord, TwoViewGeometry, TwoViewGeometryConfig, TwoViewGeometryRecord,
};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::{
    nalgebra::{Point3, Rotation3, Vector3},
    Camera, CameraModel, CameraModelId, CameraToCamera, Pose, WorldToCamera,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticDatasetOptions {
    pub num_frames: usize,
    pub num_points3d: usize,
    pub camera_model: CameraModelId,
    pub focal_length: f64,
    pub width: usize,
    pub height: usize,
    /// Distance of the camera centers from the origin.
    pub radius: f64,
    /// Angle in degrees between neighbouring frames on the arc.
    pub frame_spacing: f64,
    /// Half the side length of the cube the points are drawn from.
    pub point_extent: f64,
    /// Standard deviation in pixels of the gaussian noise added to each keypoint coordinate.
    pub point2d_noise: f64,
    /// Store the true relative pose with every image pair.
    pub store_relative_poses: bool,
    /// Store the true camera centers as cartesian pose priors.
    pub store_pose_priors: bool,
    pub seed: u64,
}

impl Default for SyntheticDatasetOptions {
    fn default() -> Self {
        Self {
            num_frames: 5,
            num_points3d: 120,
            camera_model: CameraModelId::SimplePinhole,
            focal_length: 500.0,
            width: 640,
            height: 480,
            radius: 6.0,
            frame_spacing: 10.0,
            point_extent: 1.2,
            point2d_noise: 0.0,
            store_relative_poses: false,
            store_pose_priors: false,
            seed: 0,
        }
    }
}

/// A database along with the ground truth it was generated from.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub database: Database,
    pub camera: Camera,
    pub cams_from_world: BTreeMap<ImageId, WorldToCamera>,
    pub points3d: Vec<Point3<f64>>,
    /// For every image, the index of the ground truth point behind each keypoint.
    pub point3d_indices: BTreeMap<ImageId, Vec<usize>>,
}

pub fn synthesize_dataset(options: &SyntheticDatasetOptions) -> SyntheticDataset {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(options.seed);
    let camera = Camera::new(
        options.camera_model,
        options.focal_length,
        options.width,
        options.height,
    );
    let camera_id = CameraId(1);

    let extent = options.point_extent;
    let points3d: Vec<Point3<f64>> = (0..options.num_points3d)
        .map(|_| {
            Point3::new(
                rng.gen_range(-extent..=extent),
                rng.gen_range(-extent..=extent),
                rng.gen_range(-extent..=extent),
            )
        })
        .collect();

    let middle = (options.num_frames as f64 - 1.0) / 2.0;
    let mut cams_from_world = BTreeMap::new();
    let mut point3d_indices = BTreeMap::new();
    let mut images = vec![];
    let noise = Normal::new(0.0, options.point2d_noise)
        .ok()
        .filter(|_| options.point2d_noise > 0.0);
    for i in 0..options.num_frames {
        let image_id = ImageId(i as u32);
        let angle = ((i as f64 - middle) * options.frame_spacing).to_radians();
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
        let center = Vector3::new(angle.sin(), 0.0, -angle.cos()) * options.radius;
        let cam_from_world = WorldToCamera::from_parts(-(rotation * center), rotation);

        let mut keypoints = vec![];
        let mut indices = vec![];
        for (ix, point) in points3d.iter().enumerate() {
            let Some(projected) = cam_from_world.project(point) else {
                continue;
            };
            let mut keypoint = camera.uncalibrate(projected);
            if let Some(noise) = &noise {
                keypoint.0.x += noise.sample(&mut rng);
                keypoint.0.y += noise.sample(&mut rng);
            }
            let inside = (0.0..camera.width as f64).contains(&keypoint.0.x)
                && (0.0..camera.height as f64).contains(&keypoint.0.y);
            if inside {
                keypoints.push(keypoint);
                indices.push(ix);
            }
        }
        images.push(ImageRecord {
            image_id,
            name: format!("image{:03}.png", i),
            camera_id,
            frame_id: None,
            keypoints,
            colors: indices
                .iter()
                .map(|&ix| [(ix % 256) as u8, 128, 255 - (ix % 256) as u8])
                .collect(),
        });
        cams_from_world.insert(image_id, cam_from_world);
        point3d_indices.insert(image_id, indices);
    }

    let mut two_view_geometries = vec![];
    let image_ids: Vec<ImageId> = cams_from_world.keys().copied().collect();
    for (a, &image_id1) in image_ids.iter().enumerate() {
        for &image_id2 in &image_ids[a + 1..] {
            let indices2: BTreeMap<usize, usize> = point3d_indices[&image_id2]
                .iter()
                .enumerate()
                .map(|(point2d_idx, &ix)| (ix, point2d_idx))
                .collect();
            let inlier_matches: Vec<(usize, usize)> = point3d_indices[&image_id1]
                .iter()
                .enumerate()
                .filter_map(|(point2d_idx1, ix)| {
                    indices2.get(ix).map(|&point2d_idx2| (point2d_idx1, point2d_idx2))
                })
                .collect();
            if inlier_matches.is_empty() {
                continue;
            }
            let cam2_from_cam1 = options.store_relative_poses.then(|| {
                CameraToCamera::between(cams_from_world[&image_id1], cams_from_world[&image_id2])
            });
            two_view_geometries.push(TwoViewGeometryRecord {
                image_id1,
                image_id2,
                geometry: TwoViewGeometry {
                    config: TwoViewGeometryConfig::Calibrated,
                    inlier_matches,
                    cam2_from_cam1,
                },
            });
        }
    }

    let pose_priors = if options.store_pose_priors {
        cams_from_world
            .iter()
            .map(|(&image_id, cam_from_world)| PosePriorRecord {
                image_id,
                prior: PosePrior::new(CoordinateSystem::Cartesian, cam_from_world.center()),
            })
            .collect()
    } else {
        vec![]
    };

    SyntheticDataset {
        database: Database {
            cameras: vec![CameraRecord {
                camera_id,
                camera: camera.clone(),
            }],
            images,
            pose_priors,
            two_view_geometries,
            ..Default::default()
        },
        camera,
        cams_from_world,
        points3d,
        point3d_indices,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn points_are_seen_by_every_frame() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        assert_eq!(dataset.database.images.len(), 5);
        for image in &dataset.database.images {
            assert_eq!(image.keypoints.len(), 120);
        }
        assert_eq!(dataset.database.two_view_geometries.len(), 10);
        for record in &dataset.database.two_view_geometries {
            assert_eq!(record.geometry.inlier_matches.len(), 120);
        }
    }

    #[test]
    fn keypoint_noise_is_gaussian() {
        let sigma = 0.5;
        let dataset = synthesize_dataset(&SyntheticDatasetOptions {
            point2d_noise: sigma,
            seed: 4,
            ..Default::default()
        });
        let mut offsets = vec![];
        for image in &dataset.database.images {
            let cam_from_world = dataset.cams_from_world[&image.image_id];
            let indices = &dataset.point3d_indices[&image.image_id];
            for (keypoint, &ix) in image.keypoints.iter().zip(indices) {
                let projected = cam_from_world.project(&dataset.points3d[ix]).unwrap();
                let offset = keypoint.0 - dataset.camera.uncalibrate(projected).0;
                offsets.extend([offset.x, offset.y]);
            }
        }
        let n = offsets.len() as f64;
        let mean = offsets.iter().sum::<f64>() / n;
        let std = (offsets.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((std - sigma).abs() < 0.05, "standard deviation {}", std);
        // A uniform offset would never leave [-sigma, sigma].
        assert!(offsets.iter().any(|x| x.abs() > sigma));
    }

    #[test]
    fn frames_look_at_the_origin() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        for cam_from_world in dataset.cams_from_world.values() {
            let origin = cam_from_world.transform_point(&Point3::origin());
            assert!(origin.x.abs() < 1e-9 && origin.y.abs() < 1e-9);
            assert!((origin.z - 6.0).abs() < 1e-9);
        }
    }
}
