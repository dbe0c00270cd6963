use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::HarvestError;

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: Utf8PathBuf,
}

impl ImageStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create {}: {err}", self.root)))
    }

    pub fn photo_path(&self, observation_id: u64, index: usize) -> Utf8PathBuf {
        self.root.join(photo_file_name(observation_id, index))
    }

    pub fn is_present(&self, path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }
}

pub fn photo_file_name(observation_id: u64, index: usize) -> String {
    format!("obs_{observation_id}_photo_{index}.jpg")
}

pub fn temp_file_beside(destination: &Utf8Path) -> Result<NamedTempFile, HarvestError> {
    let parent = destination
        .parent()
        .ok_or_else(|| HarvestError::Filesystem("invalid destination path".to_string()))?;
    let parent = if parent.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    tempfile::Builder::new()
        .prefix(".inat-harvest-")
        .suffix(".part")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    let temp = temp_file_beside(path)?;
    fs::write(temp.path(), content).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = ImageStore::new(Utf8PathBuf::from("images"));
        let path = store.photo_path(12345, 0);
        assert!(path.ends_with("obs_12345_photo_0.jpg"));
        assert_eq!(store.photo_path(7, 3).as_str(), "images/obs_7_photo_3.jpg");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/out.json")).unwrap();
        write_bytes_atomic(&path, b"first").unwrap();
        write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap().as_std_path())
            .unwrap()
            .count();
        assert_eq!(leftovers, 1);
    }
}
