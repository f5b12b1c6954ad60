use crate::{Bearing, CameraPoint, CameraToCamera, Pose, WorldPoint, WorldToCamera};

/// Triangulates a point from two or more observations.
///
/// Each observation is the `cam_from_world` pose of the observing image together with the
/// bearing of the feature in that image.
pub trait TriangulatorObservations {
    fn triangulate_observations<B: Bearing>(
        &self,
        observations: impl IntoIterator<Item = (WorldToCamera, B)>,
    ) -> Option<WorldPoint>;
}

/// Triangulates a point seen by two cameras related by `cam2_from_cam1`.
///
/// The resulting point is expressed in the frame of the first camera.
pub trait TriangulatorRelative {
    fn triangulate_relative<A: Bearing, B: Bearing>(
        &self,
        cam2_from_cam1: CameraToCamera,
        a: A,
        b: B,
    ) -> Option<CameraPoint>;
}

impl<T> TriangulatorRelative for T
where
    T: TriangulatorObservations,
{
    fn triangulate_relative<A: Bearing, B: Bearing>(
        &self,
        CameraToCamera(pose): CameraToCamera,
        a: A,
        b: B,
    ) -> Option<CameraPoint> {
        use core::iter::once;

        // The first camera acts as the world.
        self.triangulate_observations(
            once((WorldToCamera::identity(), a.bearing()))
                .chain(once((WorldToCamera(pose), b.bearing()))),
        )
        .map(|p| CameraPoint(p.0))
    }
}
