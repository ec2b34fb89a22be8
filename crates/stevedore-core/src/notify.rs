//! Release notifications.
//!
//! Posts release outcomes to a Slack-style incoming webhook. Notification
//! failures are the caller's to log and shrug at; a flaky webhook must
//! never fail a release.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::update::{ReleaseResult, UpdateSpec};

/// Errors from posting a notification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// The webhook could not be reached.
    #[error("notification transport error: {0}")]
    Transport(String),

    /// The webhook answered with a failure status.
    #[error("webhook returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, if readable.
        message: String,
    },
}

/// Something that hears about releases.
pub trait Notifier: Send + Sync {
    /// Announces a finished release.
    ///
    /// # Errors
    ///
    /// Fails when the announcement cannot be delivered.
    fn post_release(
        &self,
        spec: &UpdateSpec,
        result: &ReleaseResult,
        error: Option<&str>,
    ) -> Result<(), NotifyError>;
}

/// A Slack incoming-webhook notifier.
pub struct SlackNotifier {
    webhook_url: String,
    username: String,
    client: reqwest::blocking::Client,
}

impl SlackNotifier {
    /// Builds a notifier posting as `username`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(
        webhook_url: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            username: username.into(),
            client,
        })
    }

    fn render(spec: &UpdateSpec, result: &ReleaseResult, error: Option<&str>) -> String {
        if let Some(error) = error {
            return format!("Release failed: {error}");
        }
        let images: Vec<String> = result.image_ids().iter().map(ToString::to_string).collect();
        let images = if images.is_empty() {
            "no image changes".to_string()
        } else {
            images.join(", ")
        };
        let services: Vec<String> = result
            .service_ids()
            .iter()
            .map(ToString::to_string)
            .collect();
        let services = if services.is_empty() {
            "no workloads".to_string()
        } else {
            services.join(", ")
        };
        let origin = match spec {
            UpdateSpec::Automated(_) => " (automated)",
            _ => "",
        };
        format!("Released: {images} to {services}{origin}")
    }
}

impl Notifier for SlackNotifier {
    fn post_release(
        &self,
        spec: &UpdateSpec,
        result: &ReleaseResult,
        error: Option<&str>,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "username": self.username,
            "text": Self::render(spec, result, error),
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(NotifyError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageRef;
    use crate::update::{ContainerUpdate, WorkloadResult};

    #[test]
    fn renders_release_lines() {
        let mut result = ReleaseResult::new();
        result.record(
            "default/hello".parse().unwrap(),
            WorkloadResult::success(vec![ContainerUpdate {
                container: "hello".to_string(),
                current: ImageRef::parse("team/app:v1").unwrap(),
                target: ImageRef::parse("team/app:v2").unwrap(),
            }]),
        );
        let spec = UpdateSpec::Automated(Vec::new());
        let text = SlackNotifier::render(&spec, &result, None);
        assert_eq!(
            text,
            "Released: team/app:v2 to default:Deployment/hello (automated)"
        );
        let failed = SlackNotifier::render(&spec, &result, Some("push rejected"));
        assert!(failed.starts_with("Release failed"));
    }
}
