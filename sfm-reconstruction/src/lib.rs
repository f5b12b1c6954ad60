//! Incremental structure from motion.
//!
//! A [`Reconstruction`] holds cameras, rigs, frames, images and triangulated points. The
//! [`IncrementalMapper`] grows it one image at a time using the correspondences of a
//! [`DatabaseCache`], while the [`IncrementalPipeline`] decides when to register, triangulate,
//! refine and filter, and collects every model it finds in a [`ReconstructionManager`].

mod bundle_adjuster;
mod correspondence_graph;
mod database;
mod error;
mod export;
mod ids;
mod io;
mod manager;
mod mapper;
mod observation_manager;
mod options;
mod pairing;
mod pipeline;
mod pose_estimation;
mod pose_prior;
mod reconstruction;
mod scene;
pub mod synthetic;
mod track;
mod triangulator;

pub use bundle_adjuster::*;
pub use correspondence_graph::*;
pub use database::*;
pub use error::*;
pub use export::*;
pub use ids::*;
pub use io::*;
pub use manager::*;
pub use mapper::*;
pub use observation_manager::*;
pub use options::*;
pub use pairing::*;
pub use pipeline::*;
pub use pose_estimation::*;
pub use pose_prior::*;
pub use reconstruction::*;
pub use scene::*;
pub use track::*;
pub use triangulator::*;

pub use sfm_core::{Camera, CameraModelId};
