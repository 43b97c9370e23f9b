//! Immutable test plan resolved for a unit under test.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{AppError, Result};

/// One ordered subtest of a plan.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Subtest {
    /// Unique name within the plan.
    pub name: String,
    /// Script reference launched asynchronously for this subtest.
    pub script: PathBuf,
    /// Script run to completion before the subtest's own script.
    pub pre: Option<PathBuf>,
    /// Script run to completion after the subtest's result is recorded.
    pub post: Option<PathBuf>,
}

impl Subtest {
    /// Subtest whose name doubles as its script reference.
    #[must_use]
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            pre: None,
            post: None,
        }
    }

    /// Attach a pre-subtest script.
    #[must_use]
    pub fn with_pre(mut self, script: impl Into<PathBuf>) -> Self {
        self.pre = Some(script.into());
        self
    }

    /// Attach a post-subtest script.
    #[must_use]
    pub fn with_post(mut self, script: impl Into<PathBuf>) -> Self {
        self.post = Some(script.into());
        self
    }
}

/// Test plan loaded once per session and never mutated afterwards.
///
/// Subtest names are unique. An empty subtest list is representable so the
/// orchestrator can refuse it with [`AppError::EmptyPlan`] before launching
/// anything.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TestPlan {
    name: String,
    subtests: Vec<Subtest>,
    prestartup: Vec<PathBuf>,
    startup: Option<PathBuf>,
    shutdown: Option<PathBuf>,
    instructions: Option<PathBuf>,
}

impl TestPlan {
    /// Build a plan, rejecting duplicate subtest names.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Manifest` if two subtests share a name.
    pub fn new(name: impl Into<String>, subtests: Vec<Subtest>) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::new();
        for subtest in &subtests {
            if !seen.insert(subtest.name.as_str()) {
                return Err(AppError::Manifest(format!(
                    "plan {name} declares subtest {} more than once",
                    subtest.name
                )));
            }
        }

        Ok(Self {
            name,
            subtests,
            prestartup: Vec::new(),
            startup: None,
            shutdown: None,
            instructions: None,
        })
    }

    /// Set the ordered prestartup scripts.
    #[must_use]
    pub fn with_prestartup(mut self, scripts: Vec<PathBuf>) -> Self {
        self.prestartup = scripts;
        self
    }

    /// Set the startup script.
    #[must_use]
    pub fn with_startup(mut self, script: impl Into<PathBuf>) -> Self {
        self.startup = Some(script.into());
        self
    }

    /// Set the shutdown script.
    #[must_use]
    pub fn with_shutdown(mut self, script: impl Into<PathBuf>) -> Self {
        self.shutdown = Some(script.into());
        self
    }

    /// Set the instructions document shown before prestartup.
    #[must_use]
    pub fn with_instructions(mut self, document: impl Into<PathBuf>) -> Self {
        self.instructions = Some(document.into());
        self
    }

    /// Plan (test) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered subtests.
    #[must_use]
    pub fn subtests(&self) -> &[Subtest] {
        &self.subtests
    }

    /// Subtest at `index`, if any.
    #[must_use]
    pub fn subtest(&self, index: usize) -> Option<&Subtest> {
        self.subtests.get(index)
    }

    /// Number of subtests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subtests.len()
    }

    /// Whether the plan declares no subtests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subtests.is_empty()
    }

    /// Ordered prestartup scripts.
    #[must_use]
    pub fn prestartup(&self) -> &[PathBuf] {
        &self.prestartup
    }

    /// Startup script, if declared.
    #[must_use]
    pub fn startup(&self) -> Option<&Path> {
        self.startup.as_deref()
    }

    /// Shutdown script, if declared.
    #[must_use]
    pub fn shutdown(&self) -> Option<&Path> {
        self.shutdown.as_deref()
    }

    /// Instructions document, if declared.
    #[must_use]
    pub fn instructions(&self) -> Option<&Path> {
        self.instructions.as_deref()
    }

    /// Pre-subtest script declared for the named subtest.
    #[must_use]
    pub fn pre_subtest(&self, name: &str) -> Option<&Path> {
        self.find(name).and_then(|s| s.pre.as_deref())
    }

    /// Post-subtest script declared for the named subtest.
    #[must_use]
    pub fn post_subtest(&self, name: &str) -> Option<&Path> {
        self.find(name).and_then(|s| s.post.as_deref())
    }

    fn find(&self, name: &str) -> Option<&Subtest> {
        self.subtests.iter().find(|s| s.name == name)
    }
}
