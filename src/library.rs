//! Library discovery: one subdirectory per category, filtered by extension.

use crate::sound::Sound;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Suffix of a file whose normalization is in flight.
pub const STAGING_SUFFIX: &str = ".normalizing";
/// Suffix of the normalizer's output before it replaces the original.
pub const OUTPUT_SUFFIX: &str = ".normalized";

/// The audio library rooted at one directory.
#[derive(Debug, Clone)]
pub struct Library {
    root: PathBuf,
    extensions: Vec<String>,
}

impl Library {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Library {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.root.join(category)
    }

    /// True when the extension is on the allow-list (case-insensitive).
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
    }

    /// Category subdirectories, sorted by name.
    pub fn categories(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                log::error!("Cannot read library '{}': {}", self.root.display(), e);
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    /// Supported files of one category, sorted by path.
    pub fn list(&self, category: &str) -> Vec<PathBuf> {
        let dir = self.category_dir(category);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Cannot list category '{}': {}", dir.display(), e);
                return Vec::new();
            }
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_supported(path))
            .collect();
        files.sort();
        files
    }

    /// Sound handles for every file of a category.
    pub fn discover(&self, category: &str) -> Vec<Sound> {
        self.list(category).into_iter().map(Sound::new).collect()
    }

    pub fn has_sounds(&self, category: &str) -> bool {
        !self.list(category).is_empty()
    }

    /// Undo interrupted normalizations across every category.
    ///
    /// A staged file whose original is missing is renamed back; a finished
    /// output whose original and staging file are both gone is promoted; a
    /// staging file next to a present original is stale and removed, as is
    /// any output left next to a present original. Returns the restored paths.
    pub fn recover_staged(&self) -> Vec<PathBuf> {
        let mut restored = Vec::new();
        for category in self.categories() {
            let entries = match fs::read_dir(self.category_dir(&category)) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let leftovers: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|p| {
                    let name = p.to_string_lossy();
                    name.ends_with(STAGING_SUFFIX) || name.ends_with(OUTPUT_SUFFIX)
                })
                .collect();

            for leftover in leftovers {
                if let Some(original) = recover_one(&leftover) {
                    restored.push(original);
                }
            }
        }
        restored.sort();
        restored.dedup();
        restored
    }
}

fn recover_one(leftover: &Path) -> Option<PathBuf> {
    let name = leftover.to_string_lossy();
    let (original, is_staging) = if let Some(stem) = name.strip_suffix(STAGING_SUFFIX) {
        (PathBuf::from(stem), true)
    } else if let Some(stem) = name.strip_suffix(OUTPUT_SUFFIX) {
        (PathBuf::from(stem), false)
    } else {
        return None;
    };

    if original.exists() {
        if let Err(e) = fs::remove_file(leftover) {
            log::error!("Cannot remove stale '{}': {}", leftover.display(), e);
        } else {
            log::warn!("Removed stale '{}'", leftover.display());
        }
        return None;
    }

    // A staged original wins over a finished output of unknown completeness.
    if !is_staging && staging_path(&original).exists() {
        if let Err(e) = fs::remove_file(leftover) {
            log::error!("Cannot remove partial '{}': {}", leftover.display(), e);
        }
        return None;
    }

    match fs::rename(leftover, &original) {
        Ok(()) => {
            log::warn!(
                "Recovered '{}' from interrupted normalization",
                original.display()
            );
            Some(original)
        }
        Err(e) => {
            log::error!("Cannot recover '{}': {}", leftover.display(), e);
            None
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<file>.normalizing`
pub fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, STAGING_SUFFIX)
}

/// `<file>.normalized`
pub fn output_path(path: &Path) -> PathBuf {
    with_suffix(path, OUTPUT_SUFFIX)
}

/// SHA-256 of a file's content as lowercase hex, read in 128 KiB chunks.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
