//! HTTP client for the daemon API.

use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

use stevedore_core::api::{
    ImageStatus, PolicyRequest, ReleaseRequest, ReleaseResponse, ServiceStatus,
};
use stevedore_core::jobs::Job;

/// Errors the CLI surfaces, with their exit codes: 1 for client mistakes,
/// 2 for server trouble.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The invocation was wrong before any request went out.
    #[error("{0}")]
    Usage(String),

    /// The daemon rejected the request.
    #[error("daemon returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// The daemon's error message.
        message: String,
    },

    /// The daemon could not be reached.
    #[error("talking to the daemon: {0}")]
    Transport(String),
}

impl ClientError {
    /// 0 is success, 1 a client error, 2 a server error.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Usage(_) => ExitCode::from(1),
            Self::Api { status, .. } if *status < 500 => ExitCode::from(1),
            _ => ExitCode::from(2),
        }
    }
}

/// A client bound to one daemon.
pub struct ApiClient {
    base: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

impl ApiClient {
    /// Builds a client for the daemon at `base`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(base: &str, token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// `GET /v1/services`.
    ///
    /// # Errors
    ///
    /// Fails on transport or API errors.
    pub fn list_services(&self) -> Result<Vec<ServiceStatus>, ClientError> {
        let response = self
            .request(reqwest::Method::GET, "/v1/services")
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::read(response)
    }

    /// `GET /v1/images[?service=S]`.
    ///
    /// # Errors
    ///
    /// Fails on transport or API errors.
    pub fn list_images(&self, service: Option<&str>) -> Result<Vec<ImageStatus>, ClientError> {
        let mut builder = self.request(reqwest::Method::GET, "/v1/images");
        if let Some(service) = service {
            builder = builder.query(&[("service", service)]);
        }
        let response = builder
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::read(response)
    }

    /// `POST /v1/release`, returning the job id to poll.
    ///
    /// # Errors
    ///
    /// Fails on transport or API errors.
    pub fn post_release(&self, request: &ReleaseRequest) -> Result<String, ClientError> {
        let response = self
            .request(reqwest::Method::POST, "/v1/release")
            .json(request)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let parsed: ReleaseResponse = Self::read(response)?;
        Ok(parsed.release_id)
    }

    /// `POST /v1/policy`, returning the job id to poll.
    ///
    /// # Errors
    ///
    /// Fails on transport or API errors.
    pub fn post_policy(&self, request: &PolicyRequest) -> Result<String, ClientError> {
        let response = self
            .request(reqwest::Method::POST, "/v1/policy")
            .json(request)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let parsed: ReleaseResponse = Self::read(response)?;
        Ok(parsed.release_id)
    }

    /// `GET /v1/jobs/:id`.
    ///
    /// # Errors
    ///
    /// Fails on transport or API errors.
    pub fn get_job(&self, id: &str) -> Result<Job, ClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/jobs/{id}"))
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::read(response)
    }
}
