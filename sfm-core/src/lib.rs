//! # SfM Core
//!
//! This library provides the common abstractions and types shared by every crate of the incremental
//! structure-from-motion workspace. This includes camera models, bearings, poses, keypoints, matches
//! and similarity transforms. The crate is kept small so that the geometry, optimization and
//! reconstruction crates can all agree on the same vocabulary without pulling each other in.
//!
//! ## Coordinate conventions
//!
//! Camera space for a given camera is defined as thus:
//!
//! * Origin is the optical center
//! * Positive z axis is forwards
//! * Positive y axis is down
//! * Positive x axis is right
//!
//! Poses are named after the direction they transform points. A [`WorldToCamera`] takes a
//! [`WorldPoint`] and produces the [`CameraPoint`] seen by that camera. This is what is commonly
//! called `cam_from_world` and it is the representation stored for every registered image.
//!
//! ## Triangulation
//!
//! Several of the traits within `sfm-core`, such as [`TriangulatorObservations`], must perform a
//! process called [triangulation](https://en.wikipedia.org/wiki/Triangulation). We typically know:
//!
//! * [The pose of a camera](WorldToCamera)
//! * [The relative pose of a camera](CameraToCamera)
//! * [A bearing direction at which lies a feature](nalgebra::UnitVector3)
//!
//! Each camera has an optical center out of which the bearing protrudes. Bearings from two or more
//! cameras approximately point at the same 3d point, but because the data is noisy they will not
//! exactly intersect. Different triangulators deal with the error in different ways.
//!
//! - `p` the point we are trying to triangulate
//! - `a` the normalized keypoint on camera A
//! - `b` the normalized keypoint on camera B
//! - `O` the optical center of a camera
//! - `@` the virtual image plane
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!            /           @
//!           /            @
//!   @@@@@@@a@@@@@
//!         /
//!        /
//!       /
//!      O
//! ```

mod camera;
mod keypoint;
mod matches;
mod point;
mod pose;
mod sim3;
mod triangulation;

pub use camera::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use sample_consensus;
pub use sim3::*;
pub use triangulation::*;
