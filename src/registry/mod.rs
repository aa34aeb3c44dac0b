//! Capability registry.
//!
//! This module provides:
//! - The [`Capability`] invocation contract
//! - [`CapabilityRegistry`], a name-keyed index shared by every run
//! - The on-disk [`CapabilityManifest`] used to reload synthesized capabilities
//!
//! The index is behind an `RwLock` so many runs can look capabilities up while
//! a synthesis run registers a new one. Registrations of the same name are
//! serialized through [`CapabilityRegistry::registration_lock`].

pub mod capability;
pub mod manifest;

pub use capability::{is_valid_capability_name, Capability, CapabilityKind, CapabilityShape};
pub use manifest::{source_digest, CapabilityManifest, ManifestEntry, MANIFEST_FILENAME};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::RegistryError;
use crate::metrics::MetricsCollector;

/// Where a registered capability came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityOrigin {
    BuiltIn,
    Synthesized {
        location: PathBuf,
        source_sha256: String,
    },
}

struct RegistryEntry {
    capability: Arc<dyn Capability>,
    origin: CapabilityOrigin,
    registered_at: DateTime<Utc>,
}

/// Read-only description of a registry entry, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub shape: CapabilityShape,
    pub origin: CapabilityOrigin,
    pub registered_at: DateTime<Utc>,
}

/// Builds a live capability from a persisted manifest entry.
pub trait CapabilityLoader: Send + Sync {
    fn load(
        &self,
        entry: &ManifestEntry,
        source: String,
        location: PathBuf,
    ) -> Result<Arc<dyn Capability>, RegistryError>;
}

/// Outcome of [`CapabilityRegistry::reload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub loaded: Vec<String>,
    /// Entries that could not be loaded, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Name-keyed index of invocable capabilities.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    registration_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: MetricsCollector,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            registration_locks: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Register a built-in capability under its own name.
    pub fn register_builtin(&self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let name = capability.name().to_string();
        self.insert(name, capability, CapabilityOrigin::BuiltIn)
    }

    /// Register a synthesized capability.
    ///
    /// Replaces any existing entry with the same name (last writer wins).
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if `name` is not a snake_case identifier.
    pub fn register(
        &self,
        name: &str,
        capability: Arc<dyn Capability>,
        source_text: &str,
        storage_location: impl Into<PathBuf>,
    ) -> Result<(), RegistryError> {
        let origin = CapabilityOrigin::Synthesized {
            location: storage_location.into(),
            source_sha256: source_digest(source_text),
        };
        self.insert(name.to_string(), capability, origin)
    }

    fn insert(
        &self,
        name: String,
        capability: Arc<dyn Capability>,
        origin: CapabilityOrigin,
    ) -> Result<(), RegistryError> {
        if !is_valid_capability_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }

        let count = {
            let mut entries = self.entries.write().expect("registry write lock poisoned");
            let replaced = entries
                .insert(
                    name.clone(),
                    RegistryEntry {
                        capability,
                        origin,
                        registered_at: Utc::now(),
                    },
                )
                .is_some();
            if replaced {
                tracing::info!(capability = %name, "Replaced existing capability registration");
            } else {
                tracing::debug!(capability = %name, "Registered capability");
            }
            entries.len()
        };
        self.metrics.set_registered_capabilities(count);
        Ok(())
    }

    /// Remove a capability, returning it if it was present.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let (removed, count) = {
            let mut entries = self.entries.write().expect("registry write lock poisoned");
            let removed = entries.remove(name).map(|entry| entry.capability);
            (removed, entries.len())
        };
        if removed.is_some() {
            tracing::info!(capability = %name, "Unregistered capability");
            self.metrics.set_registered_capabilities(count);
        }
        removed
    }

    /// Look a capability up by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries
            .read()
            .expect("registry read lock poisoned")
            .get(name)
            .map(|entry| Arc::clone(&entry.capability))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("registry read lock poisoned")
            .contains_key(name)
    }

    pub fn origin(&self, name: &str) -> Option<CapabilityOrigin> {
        self.entries
            .read()
            .expect("registry read lock poisoned")
            .get(name)
            .map(|entry| entry.origin.clone())
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .expect("registry read lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Registered names of one kind, sorted.
    pub fn names_of_kind(&self, kind: CapabilityKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .expect("registry read lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.capability.kind() == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Descriptions of every entry, sorted by name.
    pub fn describe(&self) -> Vec<CapabilityDescriptor> {
        let mut descriptors: Vec<CapabilityDescriptor> = self
            .entries
            .read()
            .expect("registry read lock poisoned")
            .iter()
            .map(|(name, entry)| CapabilityDescriptor {
                name: name.clone(),
                description: entry.capability.description().to_string(),
                kind: entry.capability.kind(),
                shape: entry.capability.shape(),
                origin: entry.origin.clone(),
                registered_at: entry.registered_at,
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-name lock serializing registrations of the same capability.
    ///
    /// Hold the guard for the whole generate-test-persist sequence.
    pub fn registration_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .registration_locks
            .lock()
            .expect("registration lock map poisoned");
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Hand back a lock obtained from [`registration_lock`](Self::registration_lock).
    ///
    /// The map entry is dropped once no other caller holds or waits on it.
    pub fn release_registration_lock(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .registration_locks
            .lock()
            .expect("registration lock map poisoned");
        drop(lock);
        if locks.get(name).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(name);
        }
    }

    /// Number of names with a live registration lock.
    pub fn pending_registrations(&self) -> usize {
        self.registration_locks
            .lock()
            .expect("registration lock map poisoned")
            .len()
    }

    /// Reload every capability recorded in the manifest under `dir`.
    ///
    /// Entries whose source is missing, fails its hash check, or cannot be
    /// loaded are skipped and reported; the rest are registered.
    pub fn reload(
        &self,
        dir: &Path,
        loader: &dyn CapabilityLoader,
    ) -> Result<ReloadReport, RegistryError> {
        let manifest = CapabilityManifest::load(dir)?;
        let mut report = ReloadReport::default();

        for entry in &manifest.capabilities {
            match self.reload_entry(dir, entry, loader) {
                Ok(()) => report.loaded.push(entry.name.clone()),
                Err(e) => {
                    tracing::warn!(capability = %entry.name, error = %e, "Skipping manifest entry");
                    report.skipped.push((entry.name.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            dir = %dir.display(),
            "Reloaded synthesized capabilities"
        );
        Ok(report)
    }

    fn reload_entry(
        &self,
        dir: &Path,
        entry: &ManifestEntry,
        loader: &dyn CapabilityLoader,
    ) -> Result<(), RegistryError> {
        if !is_valid_capability_name(&entry.name) {
            return Err(RegistryError::InvalidName(entry.name.clone()));
        }
        let location = CapabilityManifest::source_path(dir, entry);
        let source = fs::read_to_string(&location)?;
        let actual = source_digest(&source);
        if actual != entry.sha256 {
            return Err(RegistryError::HashMismatch {
                name: entry.name.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        let capability = loader.load(entry, source.clone(), location.clone())?;
        self.register(&entry.name, capability, &source, location)
    }
}
