// Filesystem checks made before a session touches a file, and cleanup of files a failed receive
// leaves behind.

use std::fs;
use std::path::{Path, PathBuf};

/// Whether `path` names a regular file this process can open for reading.
pub fn is_readable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => fs::File::open(path).is_ok(),
        _ => false,
    }
}

/// Whether a file could be written at `path`: an existing file must not be read-only, a new one
/// needs an existing, writable parent directory.
pub fn is_writable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && !meta.permissions().readonly(),
        Err(_) => {
            let parent = match path.parent() {
                Some(p) if p.as_os_str().is_empty() => Path::new("."),
                Some(p) => p,
                None => return false,
            };
            fs::metadata(parent).map_or(false, |meta| meta.is_dir() && !meta.permissions().readonly())
        }
    }
}

/// Deletes the file at its path when dropped, unless `keep` was called.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    pub fn new(path: impl Into<PathBuf>) -> PartialFile {
        PartialFile { path: path.into(), keep: false }
    }

    pub fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::info!("Removed incomplete file {}", self.path.display()),
            Err(e) => log::warn!("Couldn't remove incomplete file {}: {e}", self.path.display()),
        }
    }
}
