use crate::model::DatasetHash;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dataset '{0}' is not present in the registry. Its producing step must be re-run to regenerate it.")]
    Missing(DatasetHash),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Content-addressed dataset storage: every produced output lives here
/// under its SHA-256. Entries may be purged while execution records keep
/// referencing them; a missing entry is what triggers recovery.
pub struct DatasetRegistry {
    root: PathBuf,
}

impl DatasetRegistry {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs_err::create_dir_all(&root).map_err(|e| RegistryError::PathIo {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, hash: &DatasetHash) -> PathBuf {
        self.root.join(&hash.0)
    }

    pub fn contains(&self, hash: &DatasetHash) -> bool {
        self.path_of(hash).is_file()
    }

    /// Hashes and ingests a file. A no-op copy when the content is already
    /// registered.
    pub fn store(&self, path: &Path) -> Result<(DatasetHash, u64)> {
        let hash = hash_file(path)?;
        let size = fs_err::metadata(path)?.len();
        let dest = self.path_of(&hash);
        if !dest.exists() {
            let tmp = self.root.join(format!(".tmp_{}", hash.0));
            fs_err::copy(path, &tmp)?;
            fs_err::rename(&tmp, &dest)?;
        }
        Ok((hash, size))
    }

    /// Copies a registered dataset out to `dest`. `Missing` here is the
    /// recovery trigger, not a plain error.
    pub fn materialize(&self, hash: &DatasetHash, dest: &Path) -> Result<()> {
        let source = self.path_of(hash);
        if !source.is_file() {
            return Err(RegistryError::Missing(hash.clone()));
        }
        if let Some(parent) = dest.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::copy(&source, dest)?;
        Ok(())
    }

    pub fn remove(&self, hash: &DatasetHash) -> Result<()> {
        match fs_err::remove_file(self.path_of(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

pub fn hash_file(path: &Path) -> Result<DatasetHash> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(DatasetHash(format!("{:x}", hasher.finalize())))
}

/// Hashes a set of files in parallel, preserving order.
pub fn hash_files(paths: &[PathBuf]) -> Result<Vec<DatasetHash>> {
    paths.par_iter().map(|p| hash_file(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_store_and_materialize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::open(dir.path().join("datasets")).unwrap();

        let input = dir.path().join("input.txt");
        fs::write(&input, "hello datasets").unwrap();

        let (hash, size) = registry.store(&input).unwrap();
        assert_eq!(size, 14);
        assert!(registry.contains(&hash));

        let out = dir.path().join("copy.txt");
        registry.materialize(&hash, &out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello datasets");
    }

    #[test]
    fn test_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::open(dir.path().join("datasets")).unwrap();

        let input = dir.path().join("input.txt");
        fs::write(&input, "same content").unwrap();

        let (h1, _) = registry.store(&input).unwrap();
        let (h2, _) = registry.store(&input).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_materialize_missing_reports_recovery_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::open(dir.path().join("datasets")).unwrap();

        let gone = DatasetHash("0".repeat(64));
        let err = registry
            .materialize(&gone, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Missing(_)));
    }

    #[test]
    fn test_hash_files_parallel_matches_serial() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..6 {
            let p = dir.path().join(format!("f{}", i));
            fs::write(&p, format!("content-{}", i)).unwrap();
            paths.push(p);
        }
        let parallel = hash_files(&paths).unwrap();
        for (p, h) in paths.iter().zip(&parallel) {
            assert_eq!(&hash_file(p).unwrap(), h);
        }
    }
}
