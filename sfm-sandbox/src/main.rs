use log::*;
use sfm_reconstruction::{
    export_reconstruction, read_reconstruction,
    synthetic::{synthesize_dataset, SyntheticDatasetOptions},
    write_reconstruction, Database, ExportOptions, IncrementalPipeline, IncrementalPipelineOptions,
    PipelineEvent, Reconstruction, ReconstructionManager,
};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(name = "sfm-sandbox", about = "A tool for testing incremental reconstruction")]
struct Opt {
    /// The database of cameras, images and verified image pairs.
    ///
    /// This is in the format of `sfm_reconstruction::Database`. Without a database a synthetic
    /// scene is reconstructed.
    #[structopt(short, long, parse(from_os_str))]
    database: Option<PathBuf>,
    /// The file where settings are specified.
    ///
    /// This is in the format of `sfm_reconstruction::IncrementalPipelineOptions`.
    #[structopt(short, long, default_value = "sfm-settings.json")]
    settings: PathBuf,
    /// A model directory to continue from.
    #[structopt(short, long, parse(from_os_str))]
    input: Option<PathBuf>,
    /// Directory that receives one numbered model directory per finished model.
    #[structopt(short, long, default_value = "sparse")]
    output: PathBuf,
    /// Output PLY file to deposit the point cloud of the largest model.
    #[structopt(long, parse(from_os_str))]
    ply: Option<PathBuf>,
    /// The file where all models are saved with bincode.
    #[structopt(long, parse(from_os_str))]
    data: Option<PathBuf>,
    /// Number of frames of the synthetic scene.
    #[structopt(long, default_value = "8")]
    synthetic_frames: usize,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: IncrementalPipelineOptions = settings.unwrap_or_default();

    let database = match &opt.database {
        Some(path) => {
            let file = std::fs::File::open(path).expect("failed to open the database");
            Database::read_json(file).expect("failed to read the database")
        }
        None => {
            info!("using a synthetic scene with {} frames", opt.synthetic_frames);
            synthesize_dataset(&SyntheticDatasetOptions {
                num_frames: opt.synthetic_frames,
                point2d_noise: 0.5,
                ..Default::default()
            })
            .database
        }
    };

    let mut pipeline =
        IncrementalPipeline::new(settings, &database).expect("failed to set up the pipeline");
    if let Some(path) = &opt.input {
        let (reconstruction, _) = read_reconstruction(path).expect("failed to read input model");
        let mut manager = ReconstructionManager::new();
        manager.add(reconstruction);
        pipeline = pipeline.with_reconstructions(manager);
    }

    let output = opt.output.clone();
    let mut num_models = 0;
    pipeline.add_callback(
        PipelineEvent::LastImageRegistered,
        Box::new(move |reconstruction: &Reconstruction| {
            let dir = output.join(num_models.to_string());
            num_models += 1;
            if let Err(e) = write_reconstruction(reconstruction, &dir, None) {
                error!("unable to write model to {}: {}", dir.display(), e);
            }
        }),
    );
    pipeline.add_callback(
        PipelineEvent::NextImageRegistered,
        Box::new(|reconstruction: &Reconstruction| {
            info!(
                "model has {} frames and {} points",
                reconstruction.num_reg_frames(),
                reconstruction.num_points3d()
            );
        }),
    );

    pipeline.run().expect("reconstruction failed");
    let manager = pipeline.into_manager();
    for (_, reconstruction) in manager.iter() {
        info!(
            "model with {} frames, {} points, mean track length {:.2} and mean error {:.3} px",
            reconstruction.num_reg_frames(),
            reconstruction.num_points3d(),
            reconstruction.compute_mean_track_length(),
            reconstruction.compute_mean_reprojection_error()
        );
    }

    if let Some(path) = opt.data {
        info!("saving the reconstruction data");
        if let Err(e) = manager.save_file(&path) {
            error!("unable to save reconstruction data: {}", e);
        }
    }

    if let Some(path) = opt.ply {
        info!("exporting the largest model");
        match manager.largest().and_then(|key| manager.get(key)) {
            Some(reconstruction) => {
                let file = std::fs::File::create(path).expect("failed to create the PLY file");
                export_reconstruction(file, reconstruction, &ExportOptions::default())
                    .expect("failed to export the model");
            }
            None => warn!("no model to export"),
        }
    }
}
