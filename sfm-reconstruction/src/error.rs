use crate::{CameraId, FrameId, ImageId, Point3DId, RigId};
use sfm_core::Sim3ParseError;
use thiserror::Error;

/// Why a track was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTrackReason {
    /// The observation index is past the end of the keypoints of the image.
    PointOutOfRange,
    /// The observation already belongs to another point.
    AlreadyTriangulated(Point3DId),
    /// The image of the observation is not registered.
    ImageNotRegistered,
    /// The same observation appears twice in the track.
    DuplicateElement,
}

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("camera {0} does not exist")]
    MissingCamera(CameraId),
    #[error("image {0} does not exist")]
    MissingImage(ImageId),
    #[error("frame {0} does not exist")]
    MissingFrame(FrameId),
    #[error("rig {0} does not exist")]
    MissingRig(RigId),
    #[error("point {0} does not exist")]
    MissingPoint3D(Point3DId),
    #[error("point {0} cannot be merged with itself")]
    MergeWithItself(Point3DId),
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: u64 },
    #[error("invalid track element (image {image_id}, point {point2d_idx}): {reason:?}")]
    InvalidTrack {
        image_id: ImageId,
        point2d_idx: usize,
        reason: InvalidTrackReason,
    },
    #[error("image {0} is not registered")]
    ImageNotRegistered(ImageId),
    #[error("frame {0} is not registered")]
    FrameNotRegistered(FrameId),
    #[error("frame {0} is already registered")]
    FrameAlreadyRegistered(FrameId),
    #[error("at least {required} registered frames are needed, found {found}")]
    NotEnoughRegisteredFrames { required: usize, found: usize },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("no images with matches found in the database")]
    NoImagesWithMatches,
    #[error("can only resume from a single reconstruction, found {0}")]
    MultipleInputReconstructions(usize),
    #[error("no reconstruction was started")]
    NoActiveReconstruction,
    #[error("a reconstruction is already in progress")]
    ReconstructionInProgress,
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Sim3Parse(#[from] Sim3ParseError),
}
