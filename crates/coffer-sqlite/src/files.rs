//! The set of files making up one on-disk store
//!
//! A store at `dir/notes.sqlite` consists of `notes.sqlite`,
//! `notes.sqlite-wal` and `notes.sqlite-shm`. Sibling sets used during
//! migration insert a suffix before the extension: `notesTemp.sqlite`,
//! `notesBackup.sqlite-wal`, ...

use coffer_core::error::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFiles {
    main: PathBuf,
}

impl StoreFiles {
    pub fn new(main: impl Into<PathBuf>) -> Self {
        Self { main: main.into() }
    }

    pub fn main(&self) -> &Path {
        &self.main
    }

    /// Main, WAL and shared-memory paths, in that order.
    pub fn paths(&self) -> [PathBuf; 3] {
        FILE_SUFFIXES.map(|suffix| {
            let mut name = self.main.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
    }

    /// Sibling file set with `suffix` appended to the file stem.
    pub fn sibling(&self, suffix: &str) -> StoreFiles {
        let stem = self
            .main
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.main.extension() {
            Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
            None => format!("{stem}{suffix}"),
        };
        StoreFiles::new(self.main.with_file_name(name))
    }

    pub fn temp(&self) -> StoreFiles {
        self.sibling("Temp")
    }

    pub fn backup(&self) -> StoreFiles {
        self.sibling("Backup")
    }

    pub fn exists(&self) -> bool {
        self.main.exists()
    }

    /// Paths of the set that currently exist.
    pub fn existing(&self) -> Vec<PathBuf> {
        self.paths().into_iter().filter(|p| p.exists()).collect()
    }

    /// Remove every file of the set; missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        for path in self.paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_siblings() {
        let files = StoreFiles::new("/data/notes.sqlite");
        let [main, wal, shm] = files.paths();
        assert_eq!(main, PathBuf::from("/data/notes.sqlite"));
        assert_eq!(wal, PathBuf::from("/data/notes.sqlite-wal"));
        assert_eq!(shm, PathBuf::from("/data/notes.sqlite-shm"));

        assert_eq!(files.temp().main(), Path::new("/data/notesTemp.sqlite"));
        assert_eq!(
            files.backup().paths()[1],
            PathBuf::from("/data/notesBackup.sqlite-wal")
        );
    }

    #[test]
    fn test_remove_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("a.sqlite"));
        std::fs::write(files.main(), b"x").unwrap();
        files.remove().unwrap();
        assert!(!files.exists());
        files.remove().unwrap();
    }
}
