//! HTTP inventory sink.
//!
//! Talks to the unit inventory service with basic authentication:
//!
//! | Call | Request |
//! |---|---|
//! | note | `POST {base}/units/{unit}/notes` `{"note": ...}` |
//! | status | `PUT {base}/units/{unit}/kv/{key}` `{"value": ...}` |
//! | attachment | `POST {base}/units/{unit}/attachments` `{"name", "content_type", "data"}` (base64) |

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::debug;

use super::{InventorySubmission, ReportSink, STATUS_KEY};
use crate::config::InventoryConfig;
use crate::launcher::BoxFuture;
use crate::{AppError, Result};

/// Inventory sink over HTTP.
#[derive(Debug, Clone)]
pub struct HttpInventorySink {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl HttpInventorySink {
    /// Construct a sink from the `[inventory]` section (credentials loaded).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: &InventoryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| AppError::Config(format!("invalid inventory base_url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(
                "inventory base_url cannot be used as a base".into(),
            ));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AppError::ReportSink("inventory base_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<()> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(what, %status, "inventory call succeeded");
            Ok(())
        } else {
            Err(AppError::ReportSink(format!(
                "inventory rejected {what}: {status}"
            )))
        }
    }

    async fn put_status(&self, unit_id: &str, status: &str) -> Result<()> {
        let url = self.endpoint(&["units", unit_id, "kv", STATUS_KEY])?;
        self.send(self.client.put(url).json(&json!({ "value": status })), "status")
            .await
    }

    async fn post_note(&self, unit_id: &str, note: &str) -> Result<()> {
        let url = self.endpoint(&["units", unit_id, "notes"])?;
        self.send(self.client.post(url).json(&json!({ "note": note })), "note")
            .await
    }
}

impl ReportSink for HttpInventorySink {
    fn add_note<'a>(&'a self, unit_id: &'a str, note: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post_note(unit_id, note))
    }

    fn submit<'a>(&'a self, submission: &'a InventorySubmission) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.put_status(&submission.unit_id, &submission.status)
                .await?;
            self.post_note(&submission.unit_id, &submission.note).await?;

            let url = self.endpoint(&["units", &submission.unit_id, "attachments"])?;
            for attachment in &submission.attachments {
                let body = json!({
                    "name": attachment.name,
                    "content_type": attachment.content_type,
                    "data": STANDARD.encode(&attachment.data),
                });
                self.send(self.client.post(url.clone()).json(&body), "attachment")
                    .await?;
            }
            Ok(())
        })
    }
}
