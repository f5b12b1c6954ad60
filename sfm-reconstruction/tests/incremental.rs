use sfm_core::{nalgebra::Point3, Sim3};
use sfm_reconstruction::{
    synthetic::{synthesize_dataset, SyntheticDataset, SyntheticDatasetOptions},
    CameraId, ImageId, IncrementalPipeline, IncrementalPipelineOptions, InvalidTrackReason,
    ObservationManager, Reconstruction, SceneError, TrackElement,
};

fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

fn options() -> IncrementalPipelineOptions {
    let mut options = IncrementalPipelineOptions::default();
    options.mapper.init_min_num_inliers = 50;
    options.mapper.init_min_tri_angle = 4.0;
    options.mapper.abs_pose_min_num_inliers = 20;
    options.min_model_size = 3;
    options
}

fn reconstruct(dataset: &SyntheticDataset, options: IncrementalPipelineOptions) -> Vec<Reconstruction> {
    let mut pipeline = IncrementalPipeline::new(options, &dataset.database).unwrap();
    pipeline.run().unwrap();
    pipeline
        .into_manager()
        .iter()
        .map(|(_, reconstruction)| reconstruction.clone())
        .collect()
}

/// Largest distance between the aligned camera centers and the true ones, relative to the
/// distance of the cameras to the scene.
fn center_error(reconstruction: &Reconstruction, dataset: &SyntheticDataset, alignment: &Sim3) -> f64 {
    reconstruction
        .reg_image_ids()
        .into_iter()
        .map(|image_id| {
            let center = alignment.transform_point(&reconstruction.cam_from_world(image_id).unwrap().center());
            (center - dataset.cams_from_world[&image_id].center()).norm()
        })
        .fold(0.0, f64::max)
}

fn ground_truth_alignment(reconstruction: &Reconstruction, dataset: &SyntheticDataset) -> Sim3 {
    let (src, dst): (Vec<Point3<f64>>, Vec<Point3<f64>>) = reconstruction
        .reg_image_ids()
        .into_iter()
        .map(|image_id| {
            (
                reconstruction.cam_from_world(image_id).unwrap().center(),
                dataset.cams_from_world[&image_id].center(),
            )
        })
        .unzip();
    Sim3::estimate(&src, &dst).unwrap()
}

#[test]
fn five_images_match_ground_truth() {
    init_logger();
    let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
    let models = reconstruct(&dataset, options());
    assert_eq!(models.len(), 1);
    let reconstruction = &models[0];
    assert_eq!(reconstruction.num_reg_frames(), 5);
    assert!(reconstruction.check_consistency());
    assert!(reconstruction.num_points3d() > 100);
    assert!(reconstruction.compute_mean_reprojection_error() < 0.1);

    let alignment = ground_truth_alignment(reconstruction, &dataset);
    assert!(center_error(reconstruction, &dataset, &alignment) < 1e-3 * 6.0);

    for (_, point3d) in reconstruction.points3d() {
        let element = point3d.track.iter().next().unwrap();
        let truth = dataset.points3d[dataset.point3d_indices[&element.image_id][element.point2d_idx]];
        let aligned = alignment.transform_point(&point3d.position);
        assert!((aligned - truth).norm() < 1e-2);
    }
}

#[test]
fn noisy_keypoints_still_register_everything() {
    init_logger();
    let dataset = synthesize_dataset(&SyntheticDatasetOptions {
        point2d_noise: 0.5,
        seed: 3,
        ..Default::default()
    });
    let models = reconstruct(&dataset, options());
    assert_eq!(models.len(), 1);
    let reconstruction = &models[0];
    assert_eq!(reconstruction.num_reg_frames(), 5);
    assert!(reconstruction.compute_mean_reprojection_error() < 1.0);
    let alignment = ground_truth_alignment(reconstruction, &dataset);
    assert!(center_error(reconstruction, &dataset, &alignment) < 0.05 * 6.0);
}

#[test]
fn pose_priors_fix_the_frame_of_reference() {
    init_logger();
    let dataset = synthesize_dataset(&SyntheticDatasetOptions {
        store_pose_priors: true,
        ..Default::default()
    });
    let mut options = options();
    options.mapper.use_prior_position = true;
    let models = reconstruct(&dataset, options);
    assert_eq!(models.len(), 1);
    let reconstruction = &models[0];
    assert_eq!(reconstruction.num_reg_frames(), 5);
    assert!(center_error(reconstruction, &dataset, &Sim3::identity()) < 1e-2 * 6.0);
}

#[test]
fn disconnected_scenes_become_separate_models() {
    init_logger();
    let mut dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
    let other = synthesize_dataset(&SyntheticDatasetOptions {
        seed: 7,
        ..Default::default()
    });
    let shift = |image_id: ImageId| ImageId(image_id.0 + 100);
    for mut record in other.database.cameras {
        record.camera_id = CameraId(2);
        dataset.database.cameras.push(record);
    }
    for mut record in other.database.images {
        record.image_id = shift(record.image_id);
        record.camera_id = CameraId(2);
        record.name = format!("other_{}", record.name);
        dataset.database.images.push(record);
    }
    for mut record in other.database.two_view_geometries {
        record.image_id1 = shift(record.image_id1);
        record.image_id2 = shift(record.image_id2);
        dataset.database.two_view_geometries.push(record);
    }

    let models = reconstruct(&dataset, options());
    assert_eq!(models.len(), 2);
    let mut sizes: Vec<usize> = models.iter().map(|m| m.num_reg_frames()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![5, 5]);
    for model in &models {
        let ids = model.reg_image_ids();
        assert!(ids.iter().all(|id| id.0 < 100) || ids.iter().all(|id| id.0 >= 100));
    }
}

#[test]
fn filtering_all_points_is_idempotent() {
    init_logger();
    let dataset = synthesize_dataset(&SyntheticDatasetOptions {
        point2d_noise: 1.0,
        seed: 11,
        ..Default::default()
    });
    let mut models = reconstruct(&dataset, options());
    let mut obs_manager = ObservationManager::new(models.remove(0), None);
    obs_manager.filter_all_points3d(0.5, 5.0);
    let filtered_once = obs_manager.reconstruction().clone();
    assert_eq!(obs_manager.filter_all_points3d(0.5, 5.0), 0);
    assert_eq!(obs_manager.reconstruction(), &filtered_once);
}

#[test]
fn claimed_observation_is_rejected_without_changes() {
    init_logger();
    let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
    let mut models = reconstruct(&dataset, options());
    let mut reconstruction = models.remove(0);
    let (point3d_id, point3d) = reconstruction.points3d().next().unwrap();
    let claimed = point3d.track.iter().next().unwrap();
    let free = reconstruction
        .reg_image_ids()
        .into_iter()
        .filter(|&image_id| image_id != claimed.image_id)
        .find_map(|image_id| {
            let image = reconstruction.image(image_id);
            (0..image.num_points2d())
                .find(|&idx| !image.point2d(idx).has_point3d())
                .map(|idx| TrackElement::new(image_id, idx))
        });
    let before = reconstruction.clone();

    let track = std::iter::once(claimed).chain(free).collect();
    let result = reconstruction.add_point3d(Point3::new(0.0, 0.0, 0.0), track, [0, 0, 0]);
    match result {
        Err(SceneError::InvalidTrack { reason, .. }) => {
            assert_eq!(reason, InvalidTrackReason::AlreadyTriangulated(point3d_id))
        }
        other => panic!("expected an invalid track, got {:?}", other),
    }
    assert_eq!(reconstruction, before);
}
