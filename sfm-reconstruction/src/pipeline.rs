use crate::{
    write_reconstruction, Database, DatabaseCache, DatabaseCacheOptions, ImageId,
    IncrementalMapper, IncrementalMapperOptions, IncrementalPipelineOptions, InitialImagePair,
    Reconstruction, ReconstructionKey, ReconstructionManager, SceneError,
};
use log::*;
use sfm_core::{nalgebra::Point3, Sim3};
use sfm_optimize::StopToken;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A sub-model gives up on its initial pair after this many failed registrations while it is still
/// smaller than `min_model_size`.
const MIN_NUM_INITIAL_REG_TRIALS: usize = 30;

/// How often the initialization thresholds are relaxed when no model could be started.
const NUM_INIT_RELAXATIONS: usize = 2;

/// How reconstructing one sub-model ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    NoInitialPair,
    BadInitialPair,
    Success,
    Interrupted,
}

/// Points in the pipeline where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    /// The initial pair of a sub-model was registered and triangulated.
    InitialImagePairRegistered,
    /// An image was registered, triangulated and refined.
    NextImageRegistered,
    /// A sub-model was finished and kept.
    LastImageRegistered,
}

pub type PipelineCallback = Box<dyn FnMut(&Reconstruction) + Send>;

/// Reconstructs every model an image collection supports, one image at a time.
pub struct IncrementalPipeline {
    options: IncrementalPipelineOptions,
    database_cache: Arc<DatabaseCache>,
    manager: ReconstructionManager,
    stop_token: StopToken,
    callbacks: HashMap<PipelineEvent, Vec<PipelineCallback>>,
}

impl IncrementalPipeline {
    /// Loads the images and image pairs selected by the options from the database.
    pub fn new(options: IncrementalPipelineOptions, database: &Database) -> Result<Self, SceneError> {
        options.check()?;
        let image_pairs = options.pairing.as_ref().map(|pairing| {
            let pairs: HashSet<_> = pairing
                .generator(&database.pairing_images())
                .all_pairs()
                .into_iter()
                .collect();
            debug!("pair generator produced {} pairs", pairs.len());
            pairs
        });
        let cache_options = DatabaseCacheOptions {
            min_num_matches: options.min_num_matches,
            ignore_watermarks: options.ignore_watermarks,
            image_names: options.image_names.iter().cloned().collect(),
            image_pairs,
        };
        let database_cache = DatabaseCache::create(database, &cache_options)?;
        Ok(Self::with_database_cache(options, Arc::new(database_cache)))
    }

    pub fn with_database_cache(options: IncrementalPipelineOptions, database_cache: Arc<DatabaseCache>) -> Self {
        Self {
            options,
            database_cache,
            manager: ReconstructionManager::new(),
            stop_token: StopToken::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Continue from the models of a previous run. Only a single model can be continued.
    pub fn with_reconstructions(self, manager: ReconstructionManager) -> Self {
        Self { manager, ..self }
    }

    pub fn options(&self) -> &IncrementalPipelineOptions {
        &self.options
    }

    pub fn database_cache(&self) -> &Arc<DatabaseCache> {
        &self.database_cache
    }

    pub fn manager(&self) -> &ReconstructionManager {
        &self.manager
    }

    pub fn into_manager(self) -> ReconstructionManager {
        self.manager
    }

    /// Stopping the returned token interrupts the pipeline between registrations and bundle
    /// adjustments between iterations.
    pub fn stop_token(&self) -> StopToken {
        self.stop_token.clone()
    }

    pub fn add_callback(&mut self, event: PipelineEvent, callback: PipelineCallback) {
        self.callbacks.entry(event).or_default().push(callback);
    }

    fn callback(&mut self, event: PipelineEvent, reconstruction: &Reconstruction) {
        if let Some(callbacks) = self.callbacks.get_mut(&event) {
            for callback in callbacks {
                callback(reconstruction);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop_token.is_stopped()
    }

    /// Runs the whole pipeline. The results end up in [`IncrementalPipeline::manager`].
    ///
    /// If no model can be started, the initialization thresholds are relaxed and the search is
    /// repeated.
    pub fn run(&mut self) -> Result<(), SceneError> {
        if self.database_cache.num_images() == 0 {
            return Err(SceneError::NoImagesWithMatches);
        }
        let continue_reconstruction = match self.manager.len() {
            0 => false,
            1 => true,
            n => return Err(SceneError::MultipleInputReconstructions(n)),
        };

        let mut mapper = IncrementalMapper::new(self.database_cache.clone());
        mapper.set_stop_token(self.stop_token.clone());
        let mut mapper_options = self.options.mapper;
        self.reconstruct(&mut mapper, &mapper_options, continue_reconstruction)?;

        for _ in 0..NUM_INIT_RELAXATIONS {
            if !self.manager.is_empty() || self.is_stopped() {
                break;
            }
            info!("relaxing the initialization constraints");
            mapper_options.init_min_num_inliers /= 2;
            mapper.reset_initialization_stats();
            self.reconstruct(&mut mapper, &mapper_options, false)?;

            if !self.manager.is_empty() || self.is_stopped() {
                break;
            }
            info!("relaxing the initialization constraints");
            mapper_options.init_min_tri_angle /= 2.0;
            mapper.reset_initialization_stats();
            self.reconstruct(&mut mapper, &mapper_options, false)?;
        }
        info!("finished with {} models", self.manager.len());
        Ok(())
    }

    /// Starts sub-models until no initial pair is left or enough models were found.
    fn reconstruct(
        &mut self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
        continue_reconstruction: bool,
    ) -> Result<(), SceneError> {
        let num_images = self.database_cache.num_images();
        for num_trials in 0..self.options.init_num_trials {
            if self.is_stopped() {
                break;
            }
            let existing_key = if continue_reconstruction && num_trials == 0 {
                self.manager.keys().next()
            } else {
                None
            };
            let reconstruction = existing_key
                .and_then(|key| self.manager.remove(key))
                .unwrap_or_default();

            let fixed_centers = fixed_frame_centers(&reconstruction, mapper_options);
            mapper.begin_reconstruction(reconstruction)?;
            let status = self.reconstruct_sub_model(mapper, mapper_options)?;
            debug!("sub-model finished with {:?}", status);

            match status {
                PipelineStatus::Interrupted => {
                    let mut reconstruction = mapper.end_reconstruction(false)?;
                    reconstruction.update_point3d_errors();
                    self.manager.add(reconstruction);
                    return Ok(());
                }
                PipelineStatus::NoInitialPair => {
                    mapper.end_reconstruction(true)?;
                    info!("no good initial image pair found");
                    return Ok(());
                }
                PipelineStatus::BadInitialPair => {
                    mapper.end_reconstruction(true)?;
                    if self.options.is_initial_pair_provided() {
                        return Ok(());
                    }
                }
                PipelineStatus::Success => {
                    let total_num_reg_images = mapper.num_total_reg_images();
                    let min_model_size = ((0.8 * num_images as f64) as usize).min(self.options.min_model_size);
                    let num_reg_images = mapper.reconstruction()?.num_reg_images();
                    let discard = (self.options.multiple_models
                        && !self.manager.is_empty()
                        && num_reg_images < min_model_size)
                        || num_reg_images == 0;
                    let mut reconstruction = mapper.end_reconstruction(discard)?;
                    if !discard {
                        if let Some(centers) = fixed_centers {
                            realign_to_fixed_frames(&mut reconstruction, &centers);
                        }
                        reconstruction.update_point3d_errors();
                        self.callback(PipelineEvent::LastImageRegistered, &reconstruction);
                        self.manager.add(reconstruction);
                    }
                    if !self.options.multiple_models
                        || self.manager.len() >= self.options.max_num_models
                        || total_num_reg_images + 1 >= num_images
                    {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Registers the initial pair of a new model and triangulates it.
    fn initialize_reconstruction(
        &mut self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
    ) -> Result<PipelineStatus, SceneError> {
        let pair = if self.options.is_initial_pair_provided() {
            let (Some(image_id1), Some(image_id2)) = (self.options.init_image_id1, self.options.init_image_id2) else {
                return Ok(PipelineStatus::BadInitialPair);
            };
            let reconstruction = mapper.reconstruction()?;
            if !reconstruction.exists_image(image_id1) || !reconstruction.exists_image(image_id2) {
                warn!("initial image pair {} and {} does not exist", image_id1, image_id2);
                return Ok(PipelineStatus::BadInitialPair);
            }
            match mapper.estimate_initial_two_view_geometry(mapper_options, image_id1, image_id2)? {
                Some(cam2_from_cam1) => InitialImagePair {
                    image_id1,
                    image_id2,
                    cam2_from_cam1,
                },
                None => {
                    warn!("provided pair {} and {} is unsuitable for initialization", image_id1, image_id2);
                    return Ok(PipelineStatus::BadInitialPair);
                }
            }
        } else {
            match mapper.find_initial_image_pair(
                mapper_options,
                self.options.init_image_id1,
                self.options.init_image_id2,
            )? {
                Some(pair) => pair,
                None => return Ok(PipelineStatus::NoInitialPair),
            }
        };

        info!(
            "registering initial image pair {} and {}",
            pair.image_id1, pair.image_id2
        );
        mapper.register_initial_image_pair(mapper_options, &pair)?;

        let mut tri_options = self.options.triangulation;
        tri_options.min_angle = mapper_options.init_min_tri_angle;
        for image_id in frame_image_ids(mapper.reconstruction()?, &[pair.image_id1, pair.image_id2]) {
            mapper.triangulate_image(&tri_options, image_id)?;
        }

        mapper.adjust_global_bundle(mapper_options, &self.options.global_bundle_adjustment)?;
        if !mapper_options.use_prior_position {
            mapper.reconstruction_mut()?.normalize(10.0, 0.1, 0.9, true);
        }
        mapper.filter_points(mapper_options)?;
        mapper.filter_frames(mapper_options)?;

        let reconstruction = mapper.reconstruction()?;
        if reconstruction.num_reg_frames() == 0
            || reconstruction.num_points3d() < mapper_options.abs_pose_min_num_inliers.max(1)
        {
            info!(
                "initial pair left {} frames and {} points",
                reconstruction.num_reg_frames(),
                reconstruction.num_points3d()
            );
            return Ok(PipelineStatus::BadInitialPair);
        }
        if self.options.extract_colors {
            mapper.reconstruction_mut()?.extract_colors_for_image(pair.image_id1);
        }
        Ok(PipelineStatus::Success)
    }

    fn reconstruct_sub_model(
        &mut self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
    ) -> Result<PipelineStatus, SceneError> {
        if mapper.reconstruction()?.num_reg_frames() == 0 {
            let status = self.initialize_reconstruction(mapper, mapper_options)?;
            if status != PipelineStatus::Success {
                return Ok(status);
            }
        }
        self.callback(PipelineEvent::InitialImagePairRegistered, mapper.reconstruction()?);

        let mut snapshot_prev_num_reg_frames = mapper.reconstruction()?.num_reg_frames();
        let mut ba_prev_num_reg_frames = snapshot_prev_num_reg_frames;
        let mut ba_prev_num_points = mapper.reconstruction()?.num_points3d();
        let mut reg_next_success = true;
        let mut prev_reg_next_success;

        loop {
            if self.is_stopped() {
                break;
            }
            let num_reg_images = mapper.reconstruction()?.num_reg_images();
            if self.options.reached_max_num_images(num_reg_images) {
                info!("model reached the maximum of {} images", self.options.max_num_images);
                break;
            }
            prev_reg_next_success = reg_next_success;
            reg_next_success = false;

            let next_images = mapper.find_next_images(mapper_options)?;
            if next_images.is_empty() {
                break;
            }
            let mut next_image_id = None;
            for (reg_trial, &image_id) in next_images.iter().enumerate() {
                if mapper.register_next_image(mapper_options, image_id)? {
                    next_image_id = Some(image_id);
                    reg_next_success = true;
                    break;
                }
                if reg_trial >= MIN_NUM_INITIAL_REG_TRIALS
                    && mapper.reconstruction()?.num_reg_frames() < self.options.min_model_size
                {
                    break;
                }
            }

            if let Some(image_id) = next_image_id {
                for id in frame_image_ids(mapper.reconstruction()?, &[image_id]) {
                    mapper.triangulate_image(&self.options.triangulation, id)?;
                }
                mapper.iterative_local_refinement(
                    self.options.ba_local_max_refinements,
                    self.options.ba_local_max_refinement_change,
                    mapper_options,
                    &self.options.local_bundle_adjustment,
                    &self.options.triangulation,
                    image_id,
                )?;

                let reconstruction = mapper.reconstruction()?;
                let num_reg_frames = reconstruction.num_reg_frames();
                let num_points = reconstruction.num_points3d();
                if num_reg_frames as f64 >= self.options.ba_global_frames_ratio * ba_prev_num_reg_frames as f64
                    || num_reg_frames >= self.options.ba_global_frames_freq + ba_prev_num_reg_frames
                    || num_points as f64 >= self.options.ba_global_points_ratio * ba_prev_num_points as f64
                    || num_points >= self.options.ba_global_points_freq + ba_prev_num_points
                {
                    self.iterative_global_refinement(mapper, mapper_options)?;
                    let reconstruction = mapper.reconstruction()?;
                    ba_prev_num_points = reconstruction.num_points3d();
                    ba_prev_num_reg_frames = reconstruction.num_reg_frames();
                }

                if self.options.extract_colors {
                    mapper.reconstruction_mut()?.extract_colors_for_image(image_id);
                }
                let num_reg_frames = mapper.reconstruction()?.num_reg_frames();
                if self.options.snapshot_frames_freq > 0
                    && num_reg_frames >= self.options.snapshot_frames_freq + snapshot_prev_num_reg_frames
                {
                    snapshot_prev_num_reg_frames = num_reg_frames;
                    self.write_snapshot(mapper.reconstruction()?)?;
                }
                self.callback(PipelineEvent::NextImageRegistered, mapper.reconstruction()?);
            }

            if mapper.num_shared_reg_images() >= self.options.max_model_overlap {
                break;
            }
            // One more global refinement before giving up may make further images registrable.
            if !reg_next_success && prev_reg_next_success {
                self.iterative_global_refinement(mapper, mapper_options)?;
            }
            if !reg_next_success && !prev_reg_next_success {
                break;
            }
        }

        if self.is_stopped() {
            return Ok(PipelineStatus::Interrupted);
        }

        // Skip the final refinement if the last one was already global.
        let reconstruction = mapper.reconstruction()?;
        if reconstruction.num_reg_frames() >= 2
            && reconstruction.num_reg_frames() != ba_prev_num_reg_frames
            && reconstruction.num_points3d() != ba_prev_num_points
        {
            self.iterative_global_refinement(mapper, mapper_options)?;
        }
        Ok(PipelineStatus::Success)
    }

    fn iterative_global_refinement(
        &self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
    ) -> Result<(), SceneError> {
        info!("global refinement");
        mapper.iterative_global_refinement(
            self.options.ba_global_max_refinements,
            self.options.ba_global_max_refinement_change,
            mapper_options,
            &self.options.global_bundle_adjustment,
            &self.options.triangulation,
            true,
        )?;
        mapper.filter_frames(mapper_options)?;
        Ok(())
    }

    fn write_snapshot(&self, reconstruction: &Reconstruction) -> Result<(), SceneError> {
        let Some(path) = &self.options.snapshot_path else {
            return Ok(());
        };
        let dir = path.join(format!("{:06}", reconstruction.num_reg_frames()));
        debug!("writing snapshot to {}", dir.display());
        write_reconstruction(reconstruction, dir, None)
    }

    /// Triangulates the registered images of a model with known poses and refines its points.
    ///
    /// The poses of the frames stay fixed.
    pub fn triangulate_reconstruction(&mut self, key: ReconstructionKey) -> Result<(), SceneError> {
        let reconstruction = self
            .manager
            .remove(key)
            .ok_or(SceneError::NoActiveReconstruction)?;
        let mut mapper = IncrementalMapper::new(self.database_cache.clone());
        mapper.set_stop_token(self.stop_token.clone());
        mapper.begin_reconstruction(reconstruction)?;

        let reg_image_ids = mapper.reconstruction()?.reg_image_ids();
        info!("triangulating {} registered images", reg_image_ids.len());
        for &image_id in &reg_image_ids {
            mapper.triangulate_image(&self.options.triangulation, image_id)?;
        }
        let mapper_options = IncrementalMapperOptions {
            fix_existing_frames: true,
            ..self.options.mapper
        };
        let mut ba_options = self.options.global_bundle_adjustment;
        ba_options.refine_focal_length = false;
        ba_options.refine_principal_point = false;
        ba_options.refine_extra_params = false;
        ba_options.refine_rig_from_world = false;
        if mapper.reconstruction()?.num_reg_frames() >= 2 {
            mapper.iterative_global_refinement(
                self.options.ba_global_max_refinements,
                self.options.ba_global_max_refinement_change,
                &mapper_options,
                &ba_options,
                &self.options.triangulation,
                false,
            )?;
        } else {
            mapper.complete_and_merge_tracks(&self.options.triangulation)?;
        }
        let mut reconstruction = mapper.end_reconstruction(false)?;
        if self.options.extract_colors {
            reconstruction.extract_colors_for_all_images();
        }
        reconstruction.update_point3d_errors();
        self.manager.add(reconstruction);
        Ok(())
    }
}

/// The images of the frames the given images belong to.
fn frame_image_ids(reconstruction: &Reconstruction, image_ids: &[ImageId]) -> Vec<ImageId> {
    let mut frame_ids = vec![];
    for &image_id in image_ids {
        let frame_id = reconstruction.image(image_id).frame_id;
        if !frame_ids.contains(&frame_id) {
            frame_ids.push(frame_id);
        }
    }
    frame_ids
        .into_iter()
        .flat_map(|frame_id| reconstruction.frame(frame_id).image_ids.clone())
        .collect()
}

/// Camera centers of the registered images when they are going to be held fixed.
fn fixed_frame_centers(
    reconstruction: &Reconstruction,
    options: &IncrementalMapperOptions,
) -> Option<Vec<(ImageId, Point3<f64>)>> {
    if !options.fix_existing_frames {
        return None;
    }
    let centers: Vec<(ImageId, Point3<f64>)> = reconstruction
        .reg_image_ids()
        .into_iter()
        .filter_map(|image_id| Some((image_id, reconstruction.cam_from_world(image_id)?.center())))
        .collect();
    (centers.len() >= 3).then_some(centers)
}

/// Moves the model back onto the original centers of its fixed images.
fn realign_to_fixed_frames(reconstruction: &mut Reconstruction, centers: &[(ImageId, Point3<f64>)]) {
    let (src, dst): (Vec<Point3<f64>>, Vec<Point3<f64>>) = centers
        .iter()
        .filter_map(|&(image_id, original)| {
            Some((reconstruction.cam_from_world(image_id)?.center(), original))
        })
        .unzip();
    if src.len() < 3 {
        return;
    }
    match Sim3::estimate(&src, &dst) {
        Some(original_from_current) => reconstruction.transform(&original_from_current),
        None => warn!("could not realign the model to its fixed frames"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::synthetic::{synthesize_dataset, SyntheticDatasetOptions};
    use std::sync::Mutex;

    fn options() -> IncrementalPipelineOptions {
        let mut options = IncrementalPipelineOptions::default();
        options.mapper.init_min_num_inliers = 50;
        options.mapper.init_min_tri_angle = 4.0;
        options.mapper.abs_pose_min_num_inliers = 20;
        options.min_num_matches = 15;
        options
    }

    #[test]
    fn callbacks_follow_registrations() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let mut pipeline = IncrementalPipeline::new(options(), &dataset.database).unwrap();
        let events = Arc::new(Mutex::new(vec![]));
        for event in [
            PipelineEvent::InitialImagePairRegistered,
            PipelineEvent::NextImageRegistered,
            PipelineEvent::LastImageRegistered,
        ] {
            let events = events.clone();
            pipeline.add_callback(
                event,
                Box::new(move |reconstruction: &Reconstruction| {
                    events
                        .lock()
                        .unwrap()
                        .push((event, reconstruction.num_reg_frames()));
                }),
            );
        }
        pipeline.run().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            events.first(),
            Some(&(PipelineEvent::InitialImagePairRegistered, 2))
        );
        let next: Vec<usize> = events
            .iter()
            .filter(|(event, _)| *event == PipelineEvent::NextImageRegistered)
            .map(|&(_, num)| num)
            .collect();
        assert_eq!(next, vec![3, 4, 5]);
        assert_eq!(events.last(), Some(&(PipelineEvent::LastImageRegistered, 5)));
    }

    #[test]
    fn max_num_images_caps_the_model() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let options = IncrementalPipelineOptions {
            max_num_images: 3,
            multiple_models: false,
            ..options()
        };
        let mut pipeline = IncrementalPipeline::new(options, &dataset.database).unwrap();
        pipeline.run().unwrap();

        assert_eq!(pipeline.manager().len(), 1);
        let (_, reconstruction) = pipeline.manager().iter().next().unwrap();
        assert_eq!(reconstruction.num_reg_images(), 3);
        assert!(reconstruction.check_consistency());
    }

    #[test]
    fn stopped_pipeline_keeps_nothing_new() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let mut pipeline = IncrementalPipeline::new(options(), &dataset.database).unwrap();
        pipeline.stop_token().stop();
        pipeline.run().unwrap();
        assert!(pipeline.manager().is_empty());
    }

    #[test]
    fn unknown_initial_pair_is_rejected() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let options = IncrementalPipelineOptions {
            init_image_id1: Some(ImageId(0)),
            init_image_id2: Some(ImageId(42)),
            ..options()
        };
        let mut pipeline = IncrementalPipeline::new(options, &dataset.database).unwrap();
        pipeline.run().unwrap();
        assert!(pipeline.manager().is_empty());
    }

    #[test]
    fn continuing_needs_a_single_model() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default());
        let mut manager = ReconstructionManager::new();
        manager.add(Reconstruction::new());
        manager.add(Reconstruction::new());
        let mut pipeline = IncrementalPipeline::new(options(), &dataset.database)
            .unwrap()
            .with_reconstructions(manager);
        assert!(matches!(
            pipeline.run(),
            Err(SceneError::MultipleInputReconstructions(2))
        ));
    }
}
