use crate::{ImageId, ImagePair, SceneError};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A keypoint of another image that matches a given keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Correspondence {
    pub image_id: ImageId,
    pub point2d_idx: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImageCorrespondences {
    /// Number of keypoints with at least one correspondence.
    num_observations: usize,
    /// Total number of correspondences summed over all keypoints.
    num_correspondences: usize,
    corrs: Vec<Vec<Correspondence>>,
}

/// Geometrically verified keypoint matches between all image pairs.
///
/// Matches are stored per keypoint in both directions, so following a match from either image
/// finds the other.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrespondenceGraph {
    images: BTreeMap<ImageId, ImageCorrespondences>,
    pairs: HashMap<ImagePair, usize>,
}

impl CorrespondenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image_id: ImageId, num_points2d: usize) {
        self.images.insert(
            image_id,
            ImageCorrespondences {
                corrs: vec![vec![]; num_points2d],
                ..Default::default()
            },
        );
    }

    pub fn exists_image(&self, image_id: ImageId) -> bool {
        self.images.contains_key(&image_id)
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.images.keys().copied()
    }

    /// Adds the matches `(point2d_idx1, point2d_idx2)` between two images.
    ///
    /// Matches referencing keypoints that do not exist are skipped with a warning. Matches of an
    /// image with itself are ignored.
    pub fn add_correspondences(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[(usize, usize)],
    ) -> Result<(), SceneError> {
        if image_id1 == image_id2 {
            warn!("ignoring matches of image {} with itself", image_id1);
            return Ok(());
        }
        let num_points1 = self
            .images
            .get(&image_id1)
            .ok_or(SceneError::MissingImage(image_id1))?
            .corrs
            .len();
        let num_points2 = self
            .images
            .get(&image_id2)
            .ok_or(SceneError::MissingImage(image_id2))?
            .corrs
            .len();

        let mut num_added = 0;
        for &(point2d_idx1, point2d_idx2) in matches {
            if point2d_idx1 >= num_points1 || point2d_idx2 >= num_points2 {
                warn!(
                    "match ({}, {}) between images {} and {} is out of range",
                    point2d_idx1, point2d_idx2, image_id1, image_id2
                );
                continue;
            }
            self.push(image_id1, point2d_idx1, image_id2, point2d_idx2);
            self.push(image_id2, point2d_idx2, image_id1, point2d_idx1);
            num_added += 1;
        }
        *self
            .pairs
            .entry(ImagePair::new(image_id1, image_id2))
            .or_default() += num_added;
        Ok(())
    }

    fn push(&mut self, image_id: ImageId, point2d_idx: usize, other: ImageId, other_idx: usize) {
        if let Some(image) = self.images.get_mut(&image_id) {
            image.corrs[point2d_idx].push(Correspondence {
                image_id: other,
                point2d_idx: other_idx,
            });
        }
    }

    /// Drops images without any correspondence and computes the per image statistics.
    pub fn finalize(&mut self) {
        self.images.retain(|image_id, image| {
            image.num_observations = image.corrs.iter().filter(|c| !c.is_empty()).count();
            image.num_correspondences = image.corrs.iter().map(Vec::len).sum();
            if image.num_observations == 0 {
                debug!("image {} has no correspondences", image_id);
            }
            image.num_observations > 0
        });
        for image in self.images.values_mut() {
            for corrs in &mut image.corrs {
                corrs.shrink_to_fit();
            }
        }
    }

    pub fn num_observations_for_image(&self, image_id: ImageId) -> usize {
        self.images
            .get(&image_id)
            .map_or(0, |image| image.num_observations)
    }

    pub fn num_correspondences_for_image(&self, image_id: ImageId) -> usize {
        self.images
            .get(&image_id)
            .map_or(0, |image| image.num_correspondences)
    }

    pub fn num_correspondences_between_images(&self, image_id1: ImageId, image_id2: ImageId) -> usize {
        self.pairs
            .get(&ImagePair::new(image_id1, image_id2))
            .copied()
            .unwrap_or(0)
    }

    /// Every image pair with its number of correspondences.
    pub fn image_pairs(&self) -> impl Iterator<Item = (ImagePair, usize)> + '_ {
        self.pairs.iter().map(|(&pair, &n)| (pair, n))
    }

    pub fn correspondences(&self, image_id: ImageId, point2d_idx: usize) -> &[Correspondence] {
        self.images
            .get(&image_id)
            .and_then(|image| image.corrs.get(point2d_idx))
            .map_or(&[], Vec::as_slice)
    }

    pub fn has_correspondences(&self, image_id: ImageId, point2d_idx: usize) -> bool {
        !self.correspondences(image_id, point2d_idx).is_empty()
    }

    /// Whether the keypoint has exactly one correspondence that in turn only corresponds back.
    pub fn is_two_view_observation(&self, image_id: ImageId, point2d_idx: usize) -> bool {
        match self.correspondences(image_id, point2d_idx) {
            [corr] => self.correspondences(corr.image_id, corr.point2d_idx).len() == 1,
            _ => false,
        }
    }

    /// Correspondences reachable within `transitivity` hops, excluding the keypoint itself.
    ///
    /// A transitivity of one returns the direct correspondences.
    pub fn find_transitive_correspondences(
        &self,
        image_id: ImageId,
        point2d_idx: usize,
        transitivity: usize,
    ) -> Vec<Correspondence> {
        if transitivity == 1 {
            return self.correspondences(image_id, point2d_idx).to_vec();
        }
        let start = Correspondence {
            image_id,
            point2d_idx,
        };
        let mut visited: HashSet<Correspondence> = HashSet::new();
        visited.insert(start);
        let mut found = vec![];
        let mut frontier = vec![start];
        for _ in 0..transitivity {
            if frontier.is_empty() {
                break;
            }
            let mut next = vec![];
            for corr in frontier {
                for &other in self.correspondences(corr.image_id, corr.point2d_idx) {
                    if visited.insert(other) {
                        found.push(other);
                        next.push(other);
                    }
                }
            }
            frontier = next;
        }
        found
    }

    /// All matches `(point2d_idx1, point2d_idx2)` between two images.
    pub fn find_correspondences_between_images(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Vec<(usize, usize)> {
        let Some(image) = self.images.get(&image_id1) else {
            return vec![];
        };
        image
            .corrs
            .iter()
            .enumerate()
            .flat_map(|(point2d_idx1, corrs)| {
                corrs
                    .iter()
                    .filter(move |corr| corr.image_id == image_id2)
                    .map(move |corr| (point2d_idx1, corr.point2d_idx))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph() -> CorrespondenceGraph {
        let mut graph = CorrespondenceGraph::new();
        for i in 0..4 {
            graph.add_image(ImageId(i), 5);
        }
        graph
            .add_correspondences(ImageId(0), ImageId(1), &[(0, 0), (1, 1), (2, 9)])
            .unwrap();
        graph
            .add_correspondences(ImageId(1), ImageId(2), &[(0, 3)])
            .unwrap();
        graph
            .add_correspondences(ImageId(0), ImageId(2), &[(4, 4)])
            .unwrap();
        graph.finalize();
        graph
    }

    #[test]
    fn out_of_range_matches_are_skipped() {
        let graph = graph();
        assert_eq!(graph.num_correspondences_between_images(ImageId(1), ImageId(0)), 2);
        assert!(!graph.exists_image(ImageId(3)));
        assert_eq!(graph.num_observations_for_image(ImageId(0)), 3);
        assert_eq!(graph.num_correspondences_for_image(ImageId(1)), 3);
    }

    #[test]
    fn transitive_correspondences_follow_matches() {
        let graph = graph();
        assert_eq!(
            graph.find_transitive_correspondences(ImageId(0), 0, 1),
            vec![Correspondence {
                image_id: ImageId(1),
                point2d_idx: 0
            }]
        );
        let found = graph.find_transitive_correspondences(ImageId(0), 0, 2);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&Correspondence {
            image_id: ImageId(2),
            point2d_idx: 3
        }));
    }

    #[test]
    fn two_view_observations() {
        let graph = graph();
        assert!(graph.is_two_view_observation(ImageId(0), 1));
        assert!(!graph.is_two_view_observation(ImageId(0), 0));
        assert!(graph.is_two_view_observation(ImageId(2), 4));
        assert_eq!(
            graph.find_correspondences_between_images(ImageId(2), ImageId(1)),
            vec![(3, 0)]
        );
    }
}
