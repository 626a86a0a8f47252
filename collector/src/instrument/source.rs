//! Source files from the local filesystem

use super::{SourceFile, SourceProvider};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves file names against an ordered list of search directories.
///
/// Absolute names are read directly; relative names are tried in each
/// search path in turn, then relative to the working directory.
#[derive(Debug, Clone, Default)]
pub struct FsSourceProvider {
    search_paths: Vec<PathBuf>,
}

impl FsSourceProvider {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }
        let mut out: Vec<PathBuf> = self.search_paths.iter().map(|d| d.join(path)).collect();
        out.push(path.to_path_buf());
        out
    }
}

impl SourceProvider for FsSourceProvider {
    fn read_file(&self, name: &str) -> Option<SourceFile> {
        for candidate in self.candidates(name) {
            match std::fs::read(&candidate) {
                Ok(raw) => {
                    // Sources in legacy encodings are shown with replacement characters.
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    let full_path = candidate
                        .canonicalize()
                        .unwrap_or(candidate)
                        .display()
                        .to_string();
                    return Some(SourceFile { full_path, text });
                }
                Err(e) => debug!("source lookup {}: {}", candidate.display(), e),
            }
        }
        None
    }

    fn list_subdirs(&self, path: &str) -> Option<Vec<String>> {
        let entries = std::fs::read_dir(path).ok()?;
        let mut dirs: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        dirs.sort();
        Some(dirs)
    }
}
