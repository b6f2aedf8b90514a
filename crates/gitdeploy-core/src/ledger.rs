//! Version marker: the commit currently published in the production directory.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::domain::Result;

/// `VERSION` file reader / writer.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    path: PathBuf,
}

impl VersionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Published commit, or `None` when the marker is missing or blank.
    ///
    /// Undecodable bytes are replaced rather than rejected; such a value never
    /// matches a commit and is treated as stale.
    pub fn read(&self) -> Result<Option<String>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let commit = text.trim();
                Ok((!commit.is_empty()).then(|| commit.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the marker atomically.
    pub fn write(&self, commit: &str) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        // Write to a temp file in the same directory, then rename over the marker.
        let mut tmp = NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{commit}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
