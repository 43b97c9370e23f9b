//! Test manifest store: resolves a unit identifier to its [`TestPlan`].
//!
//! The orchestrator only depends on the [`ManifestStore`] trait. The
//! production implementation, [`TomlManifestStore`], reads a directory of
//! TOML manifests; [`MemoryManifestStore`] serves fixed plans.

pub mod loader;

use std::collections::HashMap;

use crate::models::plan::TestPlan;
use crate::Result;

/// Resolves validated, immutable test plans.
pub trait ManifestStore: Send + Sync {
    /// Resolve the plan for `unit_id`.
    ///
    /// Returns `Ok(None)` when no test is defined for the unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Manifest` if a matching manifest exists but
    /// cannot be read or fails validation.
    fn resolve(&self, unit_id: &str) -> Result<Option<TestPlan>>;

    /// Whether any test is defined for `unit_id`.
    fn has_plan(&self, unit_id: &str) -> bool;
}

/// Store backed by a fixed map of serial prefixes to plans.
#[derive(Debug, Default, Clone)]
pub struct MemoryManifestStore {
    plans: HashMap<String, TestPlan>,
}

impl MemoryManifestStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plan` for every unit whose identifier starts with `serial_prefix`.
    #[must_use]
    pub fn with_plan(mut self, serial_prefix: impl Into<String>, plan: TestPlan) -> Self {
        self.plans.insert(serial_prefix.into(), plan);
        self
    }

    fn lookup(&self, unit_id: &str) -> Option<&TestPlan> {
        longest_prefix_match(self.plans.iter(), unit_id)
    }
}

impl ManifestStore for MemoryManifestStore {
    fn resolve(&self, unit_id: &str) -> Result<Option<TestPlan>> {
        Ok(self.lookup(unit_id).cloned())
    }

    fn has_plan(&self, unit_id: &str) -> bool {
        self.lookup(unit_id).is_some()
    }
}

/// Pick the entry with the longest serial prefix matching `unit_id`.
pub(crate) fn longest_prefix_match<'a, V: 'a>(
    entries: impl Iterator<Item = (&'a String, &'a V)>,
    unit_id: &str,
) -> Option<&'a V> {
    entries
        .filter(|(prefix, _)| !prefix.is_empty() && unit_id.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, value)| value)
}

pub use loader::TomlManifestStore;
