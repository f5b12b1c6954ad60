//! Directory model format.
//!
//! A model directory holds one JSON file per table (`rigs.json`, `cameras.json`, `frames.json`,
//! `images.json` and `points3D.json`), each an array of `[id, value]` pairs. A model that was
//! aligned to a reference frame additionally carries the alignment in `sim3.txt`.

use crate::{
    CameraId, Frame, FrameId, Image, ImageId, Point3D, Point3DId, Reconstruction, Rig, RigId,
    SceneError,
};
use log::*;
use serde::{de::DeserializeOwned, Serialize};
use sfm_core::{Camera, Sim3};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

const RIGS: &str = "rigs.json";
const CAMERAS: &str = "cameras.json";
const FRAMES: &str = "frames.json";
const IMAGES: &str = "images.json";
const POINTS3D: &str = "points3D.json";
const SIM3: &str = "sim3.txt";

/// Writes a reconstruction into `dir`, creating the directory if needed.
pub fn write_reconstruction(
    reconstruction: &Reconstruction,
    dir: impl AsRef<Path>,
    alignment: Option<&Sim3>,
) -> Result<(), SceneError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    write_table(dir.join(RIGS), reconstruction.rigs())?;
    write_table(dir.join(CAMERAS), reconstruction.cameras())?;
    write_table(dir.join(FRAMES), reconstruction.frames())?;
    write_table(dir.join(IMAGES), reconstruction.images())?;
    write_table(dir.join(POINTS3D), reconstruction.points3d())?;
    if let Some(sim3) = alignment {
        sim3.write_text(BufWriter::new(File::create(dir.join(SIM3))?))?;
    }
    info!(
        "wrote model with {} frames and {} points to {}",
        reconstruction.num_reg_frames(),
        reconstruction.num_points3d(),
        dir.display()
    );
    Ok(())
}

/// Reads a reconstruction written by [`write_reconstruction`] along with its alignment, if any.
///
/// The model is rebuilt through the checked insertion methods, so a directory with inconsistent
/// tables is rejected.
pub fn read_reconstruction(dir: impl AsRef<Path>) -> Result<(Reconstruction, Option<Sim3>), SceneError> {
    let dir = dir.as_ref();
    let rigs: Vec<(RigId, Rig)> = read_table(dir.join(RIGS))?;
    let cameras: Vec<(CameraId, Camera)> = read_table(dir.join(CAMERAS))?;
    let frames: Vec<(FrameId, Frame)> = read_table(dir.join(FRAMES))?;
    let images: Vec<(ImageId, Image)> = read_table(dir.join(IMAGES))?;
    let points3d: Vec<(Point3DId, Point3D)> = read_table(dir.join(POINTS3D))?;

    let mut reconstruction = Reconstruction::new();
    for (camera_id, camera) in cameras {
        reconstruction.add_camera(camera_id, camera)?;
    }
    for (rig_id, rig) in rigs {
        reconstruction.add_rig(rig_id, rig)?;
    }
    let mut poses = vec![];
    for (frame_id, mut frame) in frames {
        if let (true, Some(rig_from_world)) = (frame.registered, frame.rig_from_world) {
            poses.push((frame_id, rig_from_world));
        }
        frame.image_ids.clear();
        reconstruction.add_frame(frame_id, frame)?;
    }
    for (image_id, image) in images {
        reconstruction.add_image(image_id, image)?;
    }
    for (frame_id, rig_from_world) in poses {
        reconstruction.set_rig_from_world(frame_id, rig_from_world)?;
        reconstruction.register_frame(frame_id)?;
    }
    for (point3d_id, point3d) in points3d {
        reconstruction.add_point3d_with_id(point3d_id, point3d)?;
    }

    let sim3_path = dir.join(SIM3);
    let alignment = if sim3_path.exists() {
        Some(Sim3::read_text(BufReader::new(File::open(sim3_path)?))?)
    } else {
        None
    };
    Ok((reconstruction, alignment))
}

fn write_table<'a, K: Serialize, V: Serialize + 'a>(
    path: impl AsRef<Path>,
    rows: impl Iterator<Item = (K, &'a V)>,
) -> Result<(), SceneError> {
    let rows: Vec<(K, &V)> = rows.collect();
    serde_json::to_writer(BufWriter::new(File::create(path)?), &rows)?;
    Ok(())
}

fn read_table<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, SceneError> {
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{reconstruction::test::three_view_scene, TrackElement};
    use sfm_core::nalgebra::{Point3, UnitQuaternion, Vector3};

    #[test]
    fn model_directory_round_trip() {
        let mut reconstruction = three_view_scene();
        let track = [0, 1, 2]
            .into_iter()
            .map(|i| TrackElement::new(ImageId(i), 4))
            .collect();
        let point3d_id = reconstruction
            .add_point3d(Point3::new(-0.2, 0.0, 5.0), track, [1, 2, 3])
            .unwrap();
        reconstruction.update_point3d_errors();
        let alignment = Sim3::new(2.0, UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));

        let dir = tempfile::tempdir().unwrap();
        write_reconstruction(&reconstruction, dir.path(), Some(&alignment)).unwrap();
        let (read, read_alignment) = read_reconstruction(dir.path()).unwrap();

        assert_eq!(read, reconstruction);
        assert_eq!(read.point3d(point3d_id).track.len(), 3);
        assert!(!read.frame(FrameId(3)).registered);
        let read_alignment = read_alignment.unwrap();
        assert!((read_alignment.scale - 2.0).abs() < 1e-12);
    }

    #[test]
    fn missing_tables_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_reconstruction(dir.path()),
            Err(SceneError::IoError(_))
        ));
    }
}
