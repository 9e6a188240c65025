//! Typed error hierarchy for the packaging service.
//!
//! Three top-level enums cover the three subsystems:
//! - `FetchError`: manifest/icon resolution failures, including SSRF blocks
//! - `PipelineError`: external-tool and artifact failures during a build
//! - `ValidationError`: user-correctable request problems

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors from outbound manifest and icon fetching.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Destination host {host} is not allowed")]
    Blocked { host: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Fetch failed with HTTP status {status}")]
    FetchFailed { status: u16 },

    #[error("Redirect chain too long")]
    TooManyRedirects,

    #[error("Response is not a valid web app manifest")]
    InvalidManifest,

    #[error("Page contains no <link rel=\"manifest\"> tag")]
    ManifestLinkNotFound,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Network error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(err)
        }
    }
}

/// Errors from a single pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to spawn {stage} tool: {source}")]
    SpawnFailed {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed (exit code {exit_code}): {message}")]
    ToolFailure {
        stage: Stage,
        exit_code: i32,
        message: String,
    },

    #[error("No APK found in {}", dir.display())]
    ArtifactNotFound { dir: PathBuf },

    #[error("Failed to prepare working directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Icon rasterization failed: {0}")]
    Rasterize(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A user-correctable problem with a build request field.
#[derive(Debug, Error)]
#[error("Invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}
