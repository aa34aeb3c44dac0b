//! On-disk manifest of synthesized capabilities.
//!
//! Persisted capability sources live next to a `manifest.json` that records
//! their declared shape and a SHA-256 of the source, so a restart can reload
//! them explicitly instead of scanning the directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::capability::CapabilityKind;
use crate::error::RegistryError;

/// Name of the manifest JSON file inside the capability directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// One persisted capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub input_shape: String,
    pub output_shape: String,
    /// Source file name, relative to the capability directory.
    pub file: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// The manifest file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub capabilities: Vec<ManifestEntry>,
}

impl CapabilityManifest {
    /// Load the manifest from `dir`; a missing file yields an empty manifest.
    pub fn load(dir: &Path) -> Result<Self, RegistryError> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the manifest into `dir`, creating it if needed.
    ///
    /// Writes to a sibling temp file and renames it into place so readers
    /// never observe a half-written manifest.
    pub fn save(&self, dir: &Path) -> Result<(), RegistryError> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILENAME));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, dir.join(MANIFEST_FILENAME))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.capabilities.iter().find(|entry| entry.name == name)
    }

    /// Insert or replace the entry with the same name.
    pub fn upsert(&mut self, entry: ManifestEntry) {
        match self.capabilities.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.capabilities.push(entry),
        }
        self.capabilities.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn remove(&mut self, name: &str) -> Option<ManifestEntry> {
        let idx = self.capabilities.iter().position(|e| e.name == name)?;
        Some(self.capabilities.remove(idx))
    }

    /// Absolute path of an entry's source file.
    pub fn source_path(dir: &Path, entry: &ManifestEntry) -> PathBuf {
        dir.join(&entry.file)
    }
}

/// Hex SHA-256 of a capability source.
pub fn source_digest(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}
