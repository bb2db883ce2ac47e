//! Loading mesh data from its authoritative file.

use std::path::Path;

use crate::blob;
use crate::error::CacheError;
use crate::mesh::MeshData;

/// Reads a mesh's data from the file system level's storage
pub trait MeshLoader: Send + Sync {
    /// Load the complete vertex and index payload
    fn load(&self, source: &Path) -> Result<MeshData, CacheError>;

    /// Byte size of the payload without loading it
    fn probe_size(&self, source: &Path) -> Result<usize, CacheError>;
}

/// Loads meshes stored as blob files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMeshLoader;

impl MeshLoader for FileMeshLoader {
    fn load(&self, source: &Path) -> Result<MeshData, CacheError> {
        blob::read_blob(source)
    }

    fn probe_size(&self, source: &Path) -> Result<usize, CacheError> {
        let (vertices, indices) = blob::read_header(source)?;
        vertices.checked_add(indices).ok_or_else(|| CacheError::CorruptBlob {
            path: source.to_path_buf(),
            reason: "payload too large".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.blob");
        let data = MeshData::new(vec![3; 1000], vec![4; 300]);
        blob::write_blob(&path, &data).unwrap();

        let loader = FileMeshLoader;
        assert_eq!(loader.probe_size(&path).unwrap(), 1300);
        assert_eq!(loader.load(&path).unwrap(), data);
    }
}
