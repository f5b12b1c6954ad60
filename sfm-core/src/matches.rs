use crate::WorldPoint;

/// Two observations of the same feature in two different images.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FeatureMatch<P>(pub P, pub P);

/// An observation in an image matched to a triangulated point of the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FeatureWorldMatch<P>(pub P, pub WorldPoint);
