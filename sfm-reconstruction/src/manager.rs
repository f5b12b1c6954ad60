use crate::{read_reconstruction, write_reconstruction, Reconstruction, SceneError};
use log::*;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

new_key_type! {
    pub struct ReconstructionKey;
}

/// The independent models found in one image collection.
///
/// Images that cannot be connected end up in different reconstructions, each with its own
/// coordinate frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconstructionManager {
    reconstructions: SlotMap<ReconstructionKey, Reconstruction>,
}

impl ReconstructionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reconstruction: Reconstruction) -> ReconstructionKey {
        self.reconstructions.insert(reconstruction)
    }

    pub fn get(&self, key: ReconstructionKey) -> Option<&Reconstruction> {
        self.reconstructions.get(key)
    }

    pub fn get_mut(&mut self, key: ReconstructionKey) -> Option<&mut Reconstruction> {
        self.reconstructions.get_mut(key)
    }

    pub fn remove(&mut self, key: ReconstructionKey) -> Option<Reconstruction> {
        self.reconstructions.remove(key)
    }

    pub fn clear(&mut self) {
        self.reconstructions.clear();
    }

    pub fn len(&self) -> usize {
        self.reconstructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconstructions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ReconstructionKey> + '_ {
        self.reconstructions.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReconstructionKey, &Reconstruction)> + '_ {
        self.reconstructions.iter()
    }

    /// The reconstruction with the most registered frames.
    pub fn largest(&self) -> Option<ReconstructionKey> {
        self.reconstructions
            .iter()
            .max_by_key(|(_, reconstruction)| reconstruction.num_reg_frames())
            .map(|(key, _)| key)
    }

    /// Writes every reconstruction into a numbered subdirectory of `dir`, largest first.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<(), SceneError> {
        let dir = dir.as_ref();
        let mut reconstructions: Vec<&Reconstruction> = self.reconstructions.values().collect();
        reconstructions.sort_by_key(|reconstruction| std::cmp::Reverse(reconstruction.num_reg_frames()));
        for (ix, reconstruction) in reconstructions.into_iter().enumerate() {
            write_reconstruction(reconstruction, dir.join(ix.to_string()), None)?;
        }
        Ok(())
    }

    /// Reads the numbered subdirectories written by [`ReconstructionManager::write`].
    ///
    /// Returns the keys in directory order.
    pub fn read(&mut self, dir: impl AsRef<Path>) -> Result<Vec<ReconstructionKey>, SceneError> {
        let mut subdirs: Vec<(usize, std::path::PathBuf)> = vec![];
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let index = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok());
            if let (true, Some(index)) = (path.is_dir(), index) {
                subdirs.push((index, path));
            }
        }
        subdirs.sort();
        let mut keys = vec![];
        for (_, path) in subdirs {
            let (reconstruction, _) = read_reconstruction(&path)?;
            keys.push(self.add(reconstruction));
        }
        info!("read {} reconstructions", keys.len());
        Ok(keys)
    }

    /// Writes every reconstruction in one `bincode` blob.
    pub fn save(&self, writer: impl Write) -> Result<(), SceneError> {
        bincode::serialize_into(BufWriter::new(writer), self)?;
        Ok(())
    }

    pub fn load(reader: impl Read) -> Result<Self, SceneError> {
        Ok(bincode::deserialize_from(BufReader::new(reader))?)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), SceneError> {
        self.save(File::create(path)?)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, SceneError> {
        Self::load(File::open(path)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconstruction::test::three_view_scene;

    fn two_models() -> ReconstructionManager {
        let mut manager = ReconstructionManager::new();
        let mut small = three_view_scene();
        small.deregister_frame(crate::FrameId(2)).unwrap();
        manager.add(small);
        manager.add(three_view_scene());
        manager
    }

    #[test]
    fn largest_model() {
        let manager = two_models();
        let largest = manager.largest().unwrap();
        assert_eq!(manager.get(largest).unwrap().num_reg_frames(), 3);
    }

    #[test]
    fn removed_keys_are_dead() {
        let mut manager = two_models();
        let key = manager.largest().unwrap();
        assert!(manager.remove(key).is_some());
        assert!(manager.get(key).is_none());
        assert_eq!(manager.len(), 1);
        manager.clear();
        assert!(manager.is_empty());
    }

    #[test]
    fn directories_are_ordered_by_size() {
        let manager = two_models();
        let dir = tempfile::tempdir().unwrap();
        manager.write(dir.path()).unwrap();

        let mut read = ReconstructionManager::new();
        let keys = read.read(dir.path()).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(read.get(keys[0]).unwrap().num_reg_frames(), 3);
        assert_eq!(read.get(keys[1]).unwrap().num_reg_frames(), 2);
    }

    #[test]
    fn bincode_snapshot() {
        let manager = two_models();
        let mut bytes = vec![];
        manager.save(&mut bytes).unwrap();
        let loaded = ReconstructionManager::load(&bytes[..]).unwrap();
        assert_eq!(loaded.len(), 2);
        for (key, reconstruction) in manager.iter() {
            assert_eq!(loaded.get(key), Some(reconstruction));
        }
    }
}
