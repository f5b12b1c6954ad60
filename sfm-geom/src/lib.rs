//! This crate contains the computational geometry used by incremental structure from motion.
//!
//! ## Triangulation
//!
//! In this problem we know the pose of two or more cameras and the normalized keypoint of the
//! same feature observed in each of them. We want to find the point of intersection from all
//! cameras. [`triangulation`] provides the two view direct linear transform, the midpoint method,
//! a multi-view least squares method and an optimal two view method that first corrects the
//! observations to satisfy the epipolar constraint.
//!
//! ## Relative pose
//!
//! [`EightPoint`] estimates an [`EssentialMatrix`] from matches between two images, and
//! [`two_view`] turns it into a relative pose using the cheirality constraint.
//!
//! ## Absolute pose
//!
//! [`absolute_pose`] estimates the pose of a camera from correspondences between its keypoints
//! and already triangulated points, using the [`LambdaTwist`] P3P solver inside a consensus
//! algorithm.

pub mod absolute_pose;
mod eight_point;
mod essential;
pub mod triangulation;
pub mod two_view;

pub use eight_point::EightPoint;
pub use essential::EssentialMatrix;
pub use lambda_twist::LambdaTwist;
