use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

macro_rules! scene_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Display,
            From,
            Into,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);
    };
}

scene_id!(
    /// Identifies a [`Camera`](sfm_core::Camera) in a reconstruction and in the database.
    CameraId(u32)
);
scene_id!(
    /// Identifies an [`Image`](crate::Image).
    ImageId(u32)
);
scene_id!(
    /// Identifies a [`Frame`](crate::Frame).
    FrameId(u32)
);
scene_id!(
    /// Identifies a [`Rig`](crate::Rig).
    RigId(u32)
);
scene_id!(
    /// Identifies a [`Point3D`](crate::Point3D). Never reused within one reconstruction.
    Point3DId(u64)
);

/// An unordered pair of images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImagePair(ImageId, ImageId);

impl ImagePair {
    /// Creates a new pair, canonicalizing the order of the pair.
    pub fn new(a: ImageId, b: ImageId) -> Self {
        Self(a.min(b), a.max(b))
    }

    pub fn first(self) -> ImageId {
        self.0
    }

    pub fn second(self) -> ImageId {
        self.1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pair_is_canonical() {
        let pair = ImagePair::new(ImageId(7), ImageId(3));
        assert_eq!(pair, ImagePair::new(ImageId(3), ImageId(7)));
        assert_eq!(pair.first(), ImageId(3));
        assert_eq!(pair.second(), ImageId(7));
        assert_eq!(ImageId(3).to_string(), "3");
    }
}
