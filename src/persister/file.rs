//! File-backed persistence medium: one JSON file per store.

use crate::error::Result;
use crate::persister::PersisterMedium;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Persists store content as a JSON file. A missing file reads as no
/// content; writes replace the whole file.
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl PersisterMedium for FileMedium {
    fn get_persisted(&mut self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_persisted(&mut self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut medium = FileMedium::new(dir.path().join("absent.json"));
        assert_eq!(medium.get_persisted().unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut medium = FileMedium::new(dir.path().join("nested").join("store.json"));
        medium.set_persisted("[{},{\"open\":true}]").unwrap();
        assert_eq!(
            medium.get_persisted().unwrap().as_deref(),
            Some("[{},{\"open\":true}]")
        );
    }
}
