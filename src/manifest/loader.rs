//! TOML manifest directory loader.
//!
//! Layout under `manifest_dir`:
//!
//! ```text
//! tests.toml            [[test]] serial = "6805018"  name = "camera"
//! camera/test.toml      instructions, prestartup, startup, shutdown, [[subtest]]
//! camera/*.sh           stage scripts, referenced relative to the test dir
//! ```
//!
//! The index is read once at construction; a test's own manifest is read
//! on every [`resolve`](ManifestStore::resolve) so edits apply to the next
//! session without a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{longest_prefix_match, ManifestStore};
use crate::models::plan::{Subtest, TestPlan};
use crate::{AppError, Result};

/// Index file name within the manifest directory.
const INDEX_FILE: &str = "tests.toml";

/// Per-test manifest file name.
const TEST_FILE: &str = "test.toml";

#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    test: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    serial: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestFile {
    #[serde(default)]
    instructions: Option<PathBuf>,
    #[serde(default)]
    prestartup: Vec<PathBuf>,
    #[serde(default)]
    startup: Option<PathBuf>,
    #[serde(default)]
    shutdown: Option<PathBuf>,
    #[serde(default)]
    subtest: Vec<SubtestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubtestEntry {
    script: PathBuf,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pre: Option<PathBuf>,
    #[serde(default)]
    post: Option<PathBuf>,
}

/// Manifest store reading `tests.toml` and per-test `test.toml` files.
#[derive(Debug, Clone)]
pub struct TomlManifestStore {
    root: PathBuf,
    tests: HashMap<String, String>,
}

impl TomlManifestStore {
    /// Read the index from `manifest_dir/tests.toml`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Manifest` if the index cannot be read or parsed.
    pub fn open(manifest_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = manifest_dir.into();
        let index_path = root.join(INDEX_FILE);
        let raw = fs::read_to_string(&index_path).map_err(|err| {
            AppError::Manifest(format!(
                "could not load tests description from {}: {err}",
                index_path.display()
            ))
        })?;
        let index: IndexFile = toml::from_str(&raw)
            .map_err(|err| AppError::Manifest(format!("invalid {INDEX_FILE}: {err}")))?;

        let mut tests = HashMap::new();
        for entry in index.test {
            if let Some(previous) = tests.insert(entry.serial.clone(), entry.name.clone()) {
                warn!(
                    serial = %entry.serial,
                    previous,
                    replacement = %entry.name,
                    "duplicate serial prefix in test index, last entry wins"
                );
            }
        }
        debug!(count = tests.len(), root = %root.display(), "test index loaded");

        Ok(Self { root, tests })
    }

    /// Number of tests in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    fn load_plan(&self, test_name: &str) -> Result<TestPlan> {
        let test_dir = self.root.join(test_name);
        let manifest_path = test_dir.join(TEST_FILE);
        let raw = fs::read_to_string(&manifest_path).map_err(|err| {
            AppError::Manifest(format!("cannot read {}: {err}", manifest_path.display()))
        })?;
        let file: TestFile = toml::from_str(&raw).map_err(|err| {
            AppError::Manifest(format!("invalid {}: {err}", manifest_path.display()))
        })?;

        let subtests = file
            .subtest
            .into_iter()
            .map(|entry| {
                let name = entry
                    .name
                    .unwrap_or_else(|| entry.script.to_string_lossy().into_owned());
                Subtest {
                    name,
                    script: resolve(&test_dir, &entry.script),
                    pre: entry.pre.map(|p| resolve(&test_dir, &p)),
                    post: entry.post.map(|p| resolve(&test_dir, &p)),
                }
            })
            .collect();

        let mut plan = TestPlan::new(test_name, subtests)?.with_prestartup(
            file.prestartup
                .iter()
                .map(|p| resolve(&test_dir, p))
                .collect(),
        );
        if let Some(startup) = file.startup {
            plan = plan.with_startup(resolve(&test_dir, &startup));
        }
        if let Some(shutdown) = file.shutdown {
            plan = plan.with_shutdown(resolve(&test_dir, &shutdown));
        }
        if let Some(instructions) = file.instructions {
            plan = plan.with_instructions(resolve(&test_dir, &instructions));
        }
        Ok(plan)
    }
}

impl ManifestStore for TomlManifestStore {
    fn resolve(&self, unit_id: &str) -> Result<Option<TestPlan>> {
        match longest_prefix_match(self.tests.iter(), unit_id) {
            Some(test_name) => self.load_plan(test_name).map(Some),
            None => Ok(None),
        }
    }

    fn has_plan(&self, unit_id: &str) -> bool {
        longest_prefix_match(self.tests.iter(), unit_id).is_some()
    }
}

fn resolve(test_dir: &Path, reference: &Path) -> PathBuf {
    if reference.is_absolute() {
        reference.to_path_buf()
    } else {
        test_dir.join(reference)
    }
}
