//! Subtest outcomes and the payload reported over the result channel.

use serde::{Deserialize, Serialize};

/// Final verdict recorded for a subtest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Subtest passed.
    Pass,
    /// Subtest failed; remaining subtests are skipped.
    Fail,
}

impl Outcome {
    /// Upper-case label used in reports and the inventory status key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

/// Outcome as announced by a running subtest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedOutcome {
    /// Judged passing by the subtest itself.
    Pass,
    /// Judged failing by the subtest itself.
    Fail,
    /// Operator must inspect the payload and decide.
    HumanRequired,
}

/// A plot or other attachment produced by a subtest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plot {
    /// Attachment title; used as the inventory attachment name.
    #[serde(default)]
    pub title: String,
    /// Caption / measurement text.
    #[serde(default)]
    pub text: String,
    /// Encoded image bytes (base64 on the wire); empty when text-only.
    #[serde(default, with = "base64_bytes")]
    pub image: Vec<u8>,
    /// Image format suffix, e.g. `png`.
    #[serde(default)]
    pub image_format: String,
}

impl Plot {
    /// Whether the plot carries image data.
    #[must_use]
    pub fn has_image(&self) -> bool {
        !self.image.is_empty()
    }
}

/// Opaque structured payload carried alongside a subtest result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultPayload {
    /// Plots in reporting order.
    #[serde(default)]
    pub plots: Vec<Plot>,
}

/// Body of one result channel call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultReport {
    /// Outcome announced by the subtest.
    pub outcome: ReportedOutcome,
    /// Free-text report body.
    #[serde(default)]
    pub text: String,
    /// Attachments.
    #[serde(default)]
    pub plots: Vec<Plot>,
}

impl ResultReport {
    /// Report with no attachments.
    #[must_use]
    pub fn new(outcome: ReportedOutcome, text: impl Into<String>) -> Self {
        Self {
            outcome,
            text: text.into(),
            plots: Vec::new(),
        }
    }

    /// Split the attachments out as an opaque payload.
    #[must_use]
    pub fn payload(&self) -> ResultPayload {
        ResultPayload {
            plots: self.plots.clone(),
        }
    }
}

/// Recorded result of one subtest that actually ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtestResult {
    /// Subtest name (or a synthetic stage label for aborts).
    pub name: String,
    /// Verdict.
    pub outcome: Outcome,
    /// Free-text report body.
    pub text: String,
    /// Why the subtest failed, when it did.
    pub failure_reason: Option<String>,
    /// Attachments, absent for synthetic results.
    pub payload: Option<ResultPayload>,
}

impl SubtestResult {
    /// Passing result.
    #[must_use]
    pub fn pass(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::Pass,
            text: text.into(),
            failure_reason: None,
            payload: None,
        }
    }

    /// Failing result with a reason.
    #[must_use]
    pub fn fail(
        name: impl Into<String>,
        text: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::Fail,
            text: text.into(),
            failure_reason: Some(reason.into()),
            payload: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: ResultPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Synthetic result recorded when a prestartup script fails.
    #[must_use]
    pub fn prestartup_failure(script: &str) -> Self {
        Self::fail(
            "Prestartup failure",
            format!("Prestartup script {script} failed; hardware cannot be qualified"),
            script,
        )
    }
}

/// Base64 (de)serialization for binary attachment data.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}
