//! Nonlinear refinement for incremental structure from motion.
//!
//! [`BundleAdjustmentProblem`] jointly refines camera intrinsics, rig poses and points by minimizing
//! the robustified reprojection error of every observation, optionally with soft constraints on
//! camera positions. It is solved with Levenberg-Marquardt. Parameters can be held constant block by
//! block, which is how the caller fixes the gauge.
//!
//! An [`IterationCallback`] is consulted once per solver iteration and may stop the solver early.
//! [`StopToken`] is the callback used for cooperative cancellation.

mod absolute_pose;
mod bundle_adjustment;
mod callback;
mod loss;

pub use absolute_pose::*;
pub use bundle_adjustment::*;
pub use callback::*;
pub use loss::*;
