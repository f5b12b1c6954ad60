use crate::ImageId;
use serde::{Deserialize, Serialize};

/// One observation of a point: a keypoint of a specific image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackElement {
    pub image_id: ImageId,
    pub point2d_idx: usize,
}

impl TrackElement {
    pub fn new(image_id: ImageId, point2d_idx: usize) -> Self {
        Self {
            image_id,
            point2d_idx,
        }
    }
}

/// Every observation of a single point. Order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    elements: Vec<TrackElement>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[TrackElement] {
        &self.elements
    }

    pub fn iter(&self) -> impl Iterator<Item = TrackElement> + '_ {
        self.elements.iter().copied()
    }

    pub fn add_element(&mut self, element: TrackElement) {
        self.elements.push(element);
    }

    pub fn add_elements(&mut self, elements: impl IntoIterator<Item = TrackElement>) {
        self.elements.extend(elements);
    }

    /// Removes the element, returning whether it was present.
    pub fn delete_element(&mut self, element: TrackElement) -> bool {
        let len = self.elements.len();
        self.elements.retain(|&e| e != element);
        self.elements.len() != len
    }

    pub fn contains_image(&self, image_id: ImageId) -> bool {
        self.elements.iter().any(|e| e.image_id == image_id)
    }
}

impl FromIterator<TrackElement> for Track {
    fn from_iter<I: IntoIterator<Item = TrackElement>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Track {
    type Item = TrackElement;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, TrackElement>>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter().copied()
    }
}
