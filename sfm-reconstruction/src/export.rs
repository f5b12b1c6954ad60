use crate::{Reconstruction, SceneError};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use sfm_core::nalgebra::{Point3, Vector3};
use std::io::Write;

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// A camera drawn as a small pyramid pointing along its viewing direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    /// Depth of the pyramid in world units.
    pub focal_length: f64,
}

/// What [`export_reconstruction`] writes besides the points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportOptions {
    /// Add a pyramid per registered image.
    pub cameras: bool,
    /// Connect the pyramid vertices with faces.
    pub camera_faces: bool,
    /// Pyramid depth relative to the median distance of the cameras to their centroid.
    pub camera_scale: f64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            cameras: true,
            camera_faces: true,
            camera_scale: 0.05,
        }
    }
}

/// Writes the points of a reconstruction with their colors as an ASCII PLY file.
pub fn export_reconstruction(
    writer: impl Write,
    reconstruction: &Reconstruction,
    options: &ExportOptions,
) -> Result<(), SceneError> {
    let points_and_colors = reconstruction
        .points3d()
        .map(|(_, point3d)| (point3d.position, point3d.color))
        .collect();
    let cameras = if options.cameras {
        export_cameras(reconstruction, options.camera_scale)
    } else {
        vec![]
    };
    export(writer, points_and_colors, cameras, options.camera_faces)
}

fn export_cameras(reconstruction: &Reconstruction, camera_scale: f64) -> Vec<ExportCamera> {
    let poses: Vec<_> = reconstruction
        .reg_image_ids()
        .into_iter()
        .filter_map(|image_id| reconstruction.cam_from_world(image_id))
        .collect();
    if poses.is_empty() {
        return vec![];
    }
    let centers: Vec<Point3<f64>> = poses.iter().map(|pose| pose.center()).collect();
    let centroid = centers
        .iter()
        .fold(Vector3::zeros(), |sum, center| sum + center.coords)
        / centers.len() as f64;
    let mut distances: Vec<f64> = centers
        .iter()
        .map(|center| (center.coords - centroid).norm())
        .collect();
    let size = camera_scale * sfm_geom::two_view::median(&mut distances).max(1e-3);

    poses
        .iter()
        .zip(centers)
        .map(|(pose, optical_center)| {
            let world_from_cam = pose.0.rotation.inverse();
            ExportCamera {
                optical_center,
                // Image y points down.
                up_direction: world_from_cam * -Vector3::y(),
                forward_direction: world_from_cam * Vector3::z(),
                focal_length: size,
            }
        })
        .collect()
}

pub fn export(
    mut writer: impl Write,
    points_and_colors: Vec<(Point3<f64>, [u8; 3])>,
    cameras: Vec<ExportCamera>,
    camera_faces: bool,
) -> Result<(), SceneError> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from sfm-reconstruction".to_string());

    // Camera pyramids and points share the vertex element.
    let mut point_element = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for name in ["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);

    let camera_faces = camera_faces && !cameras.is_empty();
    if camera_faces {
        let mut face_element = ElementDef::new("face".to_string());
        let vertex_list = PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        );
        face_element.properties.add(vertex_list);
        ply.header.elements.add(face_element);
    }

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        focal_length,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * focal_length
                        + up as f64 * up_direction * focal_length
                        + right as f64 * right_direction * focal_length,
                    CAMERA_COLOR,
                )
            });

        if camera_faces {
            add_triangle(center_point, down_right, up_right);
            add_triangle(center_point, up_right, up_left);
            add_triangle(center_point, up_left, down_left);
            add_triangle(center_point, down_left, down_right);
        }
    }

    for (p, c) in points_and_colors {
        add_vertex(p, c);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    if camera_faces {
        ply.payload.insert("face".to_string(), faces);
    }

    Writer::new().write_ply(&mut writer, &mut ply)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconstruction::test::three_view_scene;

    #[test]
    fn header_counts_points_and_cameras() {
        let mut reconstruction = three_view_scene();
        let track = [0, 1]
            .into_iter()
            .map(|i| crate::TrackElement::new(crate::ImageId(i), 0))
            .collect();
        reconstruction
            .add_point3d(Point3::new(-1.0, -0.3, 5.0), track, [10, 20, 30])
            .unwrap();

        let mut out = vec![];
        export_reconstruction(&mut out, &reconstruction, &ExportOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        // Three registered images with five vertices each plus one point.
        assert!(text.contains("element vertex 16"));
        assert!(text.contains("element face 12"));
        assert!(text.contains("10 20 30"));
    }

    #[test]
    fn points_only() {
        let reconstruction = three_view_scene();
        let options = ExportOptions {
            cameras: false,
            ..Default::default()
        };
        let mut out = vec![];
        export_reconstruction(&mut out, &reconstruction, &options).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("element vertex 0"));
        assert!(!text.contains("element face"));
    }
}
