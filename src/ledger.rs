//! Persistent record of which file contents have been normalized, and to what.
//!
//! Stored as `{"sound": [{name, hash, loudness, bitrate}, ...]}`, one entry
//! per content hash.

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Loudness targets closer than this are considered the same target.
const LOUDNESS_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRecord {
    pub name: String,
    pub hash: String,
    /// Integrated loudness (LUFS) the file was normalized to.
    pub loudness: f64,
    pub bitrate: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    sound: Vec<NormalizationRecord>,
}

#[derive(Debug)]
pub struct NormalizationLedger {
    path: Option<PathBuf>,
    doc: LedgerDocument,
    dirty: bool,
}

impl NormalizationLedger {
    /// Open the ledger at `path`. A missing file is an empty ledger; a file
    /// that exists but does not parse is an error rather than silently reset.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let doc = match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => LedgerDocument::default(),
            Ok(text) => serde_json::from_str(&text).map_err(|source| LedgerError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerDocument::default(),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        log::debug!("Ledger '{}' holds {} records", path.display(), doc.sound.len());
        Ok(NormalizationLedger {
            path: Some(path.to_path_buf()),
            doc,
            dirty: false,
        })
    }

    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        NormalizationLedger {
            path: None,
            doc: LedgerDocument::default(),
            dirty: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.doc.sound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.sound.is_empty()
    }

    pub fn records(&self) -> &[NormalizationRecord] {
        &self.doc.sound
    }

    pub fn lookup(&self, hash: &str) -> Option<&NormalizationRecord> {
        self.doc.sound.iter().find(|r| r.hash == hash)
    }

    /// Insert or replace the record with the same hash.
    pub fn upsert(&mut self, record: NormalizationRecord) {
        match self.doc.sound.iter_mut().find(|r| r.hash == record.hash) {
            Some(existing) => *existing = record,
            None => self.doc.sound.push(record),
        }
        self.dirty = true;
    }

    /// True when this content was already normalized to `target` LUFS.
    pub fn is_normalized(&self, hash: &str, target: f64) -> bool {
        self.lookup(hash)
            .is_some_and(|r| (r.loudness - target).abs() < LOUDNESS_EPSILON)
    }

    /// Write the document if it changed: temp file, then rename over the ledger.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&self.doc).map_err(|source| LedgerError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, loudness: f64) -> NormalizationRecord {
        NormalizationRecord {
            name: format!("{}.mp3", hash),
            hash: hash.to_string(),
            loudness,
            bitrate: "192k".to_string(),
        }
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = NormalizationLedger::open(&dir.path().join("db.json")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "not valid json{{{").unwrap();
        assert!(matches!(
            NormalizationLedger::open(&path),
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn upsert_replaces_by_hash() {
        let mut ledger = NormalizationLedger::in_memory();
        ledger.upsert(record("aa", -23.0));
        ledger.upsert(record("bb", -23.0));
        ledger.upsert(record("aa", -16.0));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.lookup("aa").unwrap().loudness, -16.0);
        assert!(ledger.lookup("cc").is_none());
    }

    #[test]
    fn normalized_only_at_recorded_target() {
        let mut ledger = NormalizationLedger::in_memory();
        ledger.upsert(record("aa", -23.0));
        assert!(ledger.is_normalized("aa", -23.0));
        assert!(!ledger.is_normalized("aa", -16.0));
        assert!(!ledger.is_normalized("bb", -23.0));
    }

    #[test]
    fn flush_persists_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("db.json");
        let mut ledger = NormalizationLedger::open(&path).unwrap();
        ledger.upsert(record("aa", -23.0));
        ledger.flush().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["sound"][0]["hash"], "aa");
        assert_eq!(raw["sound"][0]["bitrate"], "192k");

        let reopened = NormalizationLedger::open(&path).unwrap();
        assert_eq!(reopened.records(), ledger.records());
    }

    #[test]
    fn in_memory_flush_is_noop() {
        let mut ledger = NormalizationLedger::in_memory();
        ledger.upsert(record("aa", -23.0));
        ledger.flush().unwrap();
        assert!(ledger.path().is_none());
    }
}
