//! Restartable producers of image pairs.
//!
//! A generator yields batches of pairs until it has finished. The pipeline uses the pairs to
//! restrict which two-view geometries of the database are loaded.

use crate::{ImageId, ImagePair};
use log::*;
use rstar::{primitives::PointWithData, RTree};
use serde::{Deserialize, Serialize};
use sfm_core::nalgebra::Point3;
use std::collections::{BTreeSet, HashMap};

/// An image as seen by a pair generator.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingImage {
    pub image_id: ImageId,
    pub name: String,
    /// Position prior of the camera center, if any.
    pub position: Option<Point3<f64>>,
}

pub trait PairGenerator {
    /// Starts over from the first batch.
    fn reset(&mut self);

    fn has_finished(&self) -> bool;

    /// The next batch of pairs. Empty once finished.
    fn next(&mut self) -> Vec<ImagePair>;

    /// Every pair from the start.
    fn all_pairs(&mut self) -> Vec<ImagePair> {
        self.reset();
        let mut pairs = vec![];
        while !self.has_finished() {
            pairs.extend(self.next());
        }
        pairs
    }
}

fn default_exhaustive_block_size() -> usize {
    50
}

fn default_overlap() -> usize {
    10
}

fn default_quadratic_overlap() -> bool {
    true
}

fn default_ignore_z() -> bool {
    true
}

fn default_max_num_neighbors() -> usize {
    50
}

fn default_max_distance() -> f64 {
    100.0
}

fn default_imported_block_size() -> usize {
    1225
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustivePairingOptions {
    /// Number of images per block. Each batch pairs two blocks.
    #[serde(default = "default_exhaustive_block_size")]
    pub block_size: usize,
}

impl Default for ExhaustivePairingOptions {
    fn default() -> Self {
        Self {
            block_size: default_exhaustive_block_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequentialPairingOptions {
    /// Number of following images, in name order, each image is paired with.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// Also pair each image with the images `2^k` positions ahead for `k < overlap`.
    #[serde(default = "default_quadratic_overlap")]
    pub quadratic_overlap: bool,
}

impl Default for SequentialPairingOptions {
    fn default() -> Self {
        Self {
            overlap: default_overlap(),
            quadratic_overlap: default_quadratic_overlap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialPairingOptions {
    /// Compare positions in the ground plane only.
    #[serde(default = "default_ignore_z")]
    pub ignore_z: bool,
    #[serde(default = "default_max_num_neighbors")]
    pub max_num_neighbors: usize,
    /// Nearest neighbors that are paired regardless of `max_distance`.
    #[serde(default)]
    pub min_num_neighbors: usize,
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
}

impl Default for SpatialPairingOptions {
    fn default() -> Self {
        Self {
            ignore_z: default_ignore_z(),
            max_num_neighbors: default_max_num_neighbors(),
            min_num_neighbors: 0,
            max_distance: default_max_distance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedPairingOptions {
    #[serde(default = "default_imported_block_size")]
    pub block_size: usize,
    /// Pairs of image names.
    pub pairs: Vec<(String, String)>,
}

/// Which generator to use, along with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PairingOptions {
    Exhaustive(ExhaustivePairingOptions),
    Sequential(SequentialPairingOptions),
    Spatial(SpatialPairingOptions),
    Imported(ImportedPairingOptions),
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self::Exhaustive(ExhaustivePairingOptions::default())
    }
}

impl PairingOptions {
    pub fn generator(&self, images: &[PairingImage]) -> Box<dyn PairGenerator> {
        match self {
            Self::Exhaustive(options) => Box::new(ExhaustivePairGenerator::new(*options, images)),
            Self::Sequential(options) => Box::new(SequentialPairGenerator::new(*options, images)),
            Self::Spatial(options) => Box::new(SpatialPairGenerator::new(*options, images)),
            Self::Imported(options) => Box::new(ImportedPairGenerator::new(options, images)),
        }
    }
}

/// Every pair of images, one pair of blocks per batch.
#[derive(Debug, Clone)]
pub struct ExhaustivePairGenerator {
    block_size: usize,
    image_ids: Vec<ImageId>,
    start_idx1: usize,
    start_idx2: usize,
}

impl ExhaustivePairGenerator {
    pub fn new(options: ExhaustivePairingOptions, images: &[PairingImage]) -> Self {
        Self {
            block_size: options.block_size.max(1),
            image_ids: images.iter().map(|image| image.image_id).collect(),
            start_idx1: 0,
            start_idx2: 0,
        }
    }
}

impl PairGenerator for ExhaustivePairGenerator {
    fn reset(&mut self) {
        self.start_idx1 = 0;
        self.start_idx2 = 0;
    }

    fn has_finished(&self) -> bool {
        self.start_idx1 >= self.image_ids.len()
    }

    fn next(&mut self) -> Vec<ImagePair> {
        if self.has_finished() {
            return vec![];
        }
        let n = self.image_ids.len();
        let end_idx1 = (self.start_idx1 + self.block_size).min(n);
        let end_idx2 = (self.start_idx2 + self.block_size).min(n);
        let mut pairs = vec![];
        for idx1 in self.start_idx1..end_idx1 {
            for idx2 in self.start_idx2.max(idx1 + 1)..end_idx2 {
                pairs.push(ImagePair::new(self.image_ids[idx1], self.image_ids[idx2]));
            }
        }
        self.start_idx2 += self.block_size;
        if self.start_idx2 >= n {
            self.start_idx1 += self.block_size;
            self.start_idx2 = self.start_idx1;
        }
        pairs
    }
}

/// Pairs of images that are close in name order, one image per batch.
#[derive(Debug, Clone)]
pub struct SequentialPairGenerator {
    options: SequentialPairingOptions,
    image_ids: Vec<ImageId>,
    image_idx: usize,
}

impl SequentialPairGenerator {
    pub fn new(options: SequentialPairingOptions, images: &[PairingImage]) -> Self {
        let mut sorted: Vec<&PairingImage> = images.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            options,
            image_ids: sorted.iter().map(|image| image.image_id).collect(),
            image_idx: 0,
        }
    }
}

impl PairGenerator for SequentialPairGenerator {
    fn reset(&mut self) {
        self.image_idx = 0;
    }

    fn has_finished(&self) -> bool {
        self.image_idx >= self.image_ids.len()
    }

    fn next(&mut self) -> Vec<ImagePair> {
        if self.has_finished() {
            return vec![];
        }
        let n = self.image_ids.len();
        let idx1 = self.image_idx;
        let mut others = BTreeSet::new();
        for i in 0..self.options.overlap {
            others.insert(idx1 + i + 1);
            if self.options.quadratic_overlap && i < usize::BITS as usize - 1 {
                others.insert(idx1.saturating_add(1 << i));
            }
        }
        self.image_idx += 1;
        others
            .into_iter()
            .filter(|&idx2| idx2 < n)
            .map(|idx2| ImagePair::new(self.image_ids[idx1], self.image_ids[idx2]))
            .collect()
    }
}

type IndexedPosition = PointWithData<usize, [f64; 3]>;

/// Pairs of images whose position priors are near each other, one image per batch.
///
/// Images without a position prior are not paired.
pub struct SpatialPairGenerator {
    options: SpatialPairingOptions,
    image_ids: Vec<ImageId>,
    positions: Vec<[f64; 3]>,
    index: RTree<IndexedPosition>,
    current_idx: usize,
}

impl SpatialPairGenerator {
    pub fn new(options: SpatialPairingOptions, images: &[PairingImage]) -> Self {
        let (image_ids, positions): (Vec<ImageId>, Vec<[f64; 3]>) = images
            .iter()
            .filter_map(|image| {
                let p = image.position?;
                let z = if options.ignore_z { 0.0 } else { p.z };
                Some((image.image_id, [p.x, p.y, z]))
            })
            .unzip();
        if positions.len() < images.len() {
            warn!(
                "{} images have no position prior and are not paired",
                images.len() - positions.len()
            );
        }
        let index = RTree::bulk_load(
            positions
                .iter()
                .enumerate()
                .map(|(ix, &p)| IndexedPosition::new(ix, p))
                .collect(),
        );
        Self {
            options,
            image_ids,
            positions,
            index,
            current_idx: 0,
        }
    }
}

impl PairGenerator for SpatialPairGenerator {
    fn reset(&mut self) {
        self.current_idx = 0;
    }

    fn has_finished(&self) -> bool {
        self.current_idx >= self.positions.len()
    }

    fn next(&mut self) -> Vec<ImagePair> {
        if self.has_finished() {
            return vec![];
        }
        let idx1 = self.current_idx;
        self.current_idx += 1;
        let query = self.positions[idx1];
        let max_distance_squared = self.options.max_distance * self.options.max_distance;
        let mut pairs = vec![];
        for neighbor in self.index.nearest_neighbor_iter(&query) {
            if pairs.len() >= self.options.max_num_neighbors {
                break;
            }
            if neighbor.data == idx1 {
                continue;
            }
            let position = neighbor.position();
            let distance_squared: f64 = (0..3).map(|i| (position[i] - query[i]).powi(2)).sum();
            if pairs.len() >= self.options.min_num_neighbors && distance_squared > max_distance_squared {
                break;
            }
            pairs.push(ImagePair::new(
                self.image_ids[idx1],
                self.image_ids[neighbor.data],
            ));
        }
        pairs
    }
}

/// Pairs read from a list of image names, one block per batch.
#[derive(Debug, Clone)]
pub struct ImportedPairGenerator {
    block_size: usize,
    pairs: Vec<ImagePair>,
    pair_idx: usize,
}

impl ImportedPairGenerator {
    pub fn new(options: &ImportedPairingOptions, images: &[PairingImage]) -> Self {
        let ids: HashMap<&str, ImageId> = images
            .iter()
            .map(|image| (image.name.as_str(), image.image_id))
            .collect();
        let mut seen = BTreeSet::new();
        let pairs = options
            .pairs
            .iter()
            .filter_map(|(name1, name2)| {
                let (Some(&id1), Some(&id2)) = (ids.get(name1.as_str()), ids.get(name2.as_str()))
                else {
                    warn!("skipping pair of unknown images {} and {}", name1, name2);
                    return None;
                };
                if id1 == id2 {
                    return None;
                }
                Some(ImagePair::new(id1, id2))
            })
            .filter(|&pair| seen.insert(pair))
            .collect();
        Self {
            block_size: options.block_size.max(1),
            pairs,
            pair_idx: 0,
        }
    }
}

impl PairGenerator for ImportedPairGenerator {
    fn reset(&mut self) {
        self.pair_idx = 0;
    }

    fn has_finished(&self) -> bool {
        self.pair_idx >= self.pairs.len()
    }

    fn next(&mut self) -> Vec<ImagePair> {
        let end = (self.pair_idx + self.block_size).min(self.pairs.len());
        let batch = self.pairs[self.pair_idx.min(end)..end].to_vec();
        self.pair_idx = end;
        batch
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::Itertools;

    fn images(n: u32) -> Vec<PairingImage> {
        (0..n)
            .map(|i| PairingImage {
                image_id: ImageId(i),
                // Reverse name order so sorting by name matters.
                name: format!("{:03}.png", n - i),
                position: Some(Point3::new(i as f64 * 10.0, 0.0, i as f64 * 1000.0)),
            })
            .collect()
    }

    #[test]
    fn exhaustive_covers_every_pair_once() {
        let mut generator =
            ExhaustivePairGenerator::new(ExhaustivePairingOptions { block_size: 3 }, &images(7));
        let pairs = generator.all_pairs();
        assert_eq!(pairs.len(), 21);
        assert_eq!(pairs.iter().unique().count(), 21);
        assert!(generator.has_finished());
        assert_eq!(generator.all_pairs().len(), 21);
    }

    #[test]
    fn sequential_follows_names() {
        let options = SequentialPairingOptions {
            overlap: 2,
            quadratic_overlap: true,
        };
        let mut generator = SequentialPairGenerator::new(options, &images(6));
        // The first image by name is image 5.
        let first = generator.next();
        assert_eq!(
            first,
            vec![
                ImagePair::new(ImageId(5), ImageId(4)),
                ImagePair::new(ImageId(5), ImageId(3)),
            ]
        );
        let pairs = generator.all_pairs();
        assert_eq!(pairs.len(), 9);
    }

    #[test]
    fn spatial_respects_distance() {
        let options = SpatialPairingOptions {
            max_distance: 15.0,
            ..Default::default()
        };
        let mut generator = SpatialPairGenerator::new(options, &images(4));
        let pairs: BTreeSet<ImagePair> = generator.all_pairs().into_iter().collect();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&ImagePair::new(ImageId(1), ImageId(2))));

        let options = SpatialPairingOptions {
            max_distance: 15.0,
            min_num_neighbors: 2,
            ..Default::default()
        };
        let mut generator = SpatialPairGenerator::new(options, &images(4));
        let pairs: BTreeSet<ImagePair> = generator.all_pairs().into_iter().collect();
        assert!(pairs.contains(&ImagePair::new(ImageId(0), ImageId(2))));
    }

    #[test]
    fn imported_resolves_names() {
        let options = ImportedPairingOptions {
            block_size: 1,
            pairs: vec![
                ("006.png".into(), "005.png".into()),
                ("005.png".into(), "006.png".into()),
                ("006.png".into(), "missing.png".into()),
            ],
        };
        let mut generator = ImportedPairGenerator::new(&options, &images(6));
        assert_eq!(generator.next(), vec![ImagePair::new(ImageId(0), ImageId(1))]);
        assert!(generator.has_finished());
    }
}
