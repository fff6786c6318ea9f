//! Typed rejections and the per-stage verdict surface.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

use super::input_sanitizer::BodyFormat;
use crate::error::{ErrorCode, ErrorDetails, ErrorResponse, GuardError};

/// Pipeline stage, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Size,
    Origin,
    RateLimit,
    Sanitize,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Origin => "origin",
            Self::RateLimit => "rate_limit",
            Self::Sanitize => "sanitize",
        }
    }
}

/// Terminal rejection of a request. Display text is safe to show callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error("{message}")]
    PayloadTooLarge { max_bytes: u64, message: String },

    #[error("Invalid Content-Length header")]
    MalformedDeclaredSize,

    #[error("Invalid origin")]
    InvalidOrigin,

    #[error("Too many requests. Please try again later.")]
    RateLimited {
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Matched pattern name is for logs and metrics only
    #[error("Invalid input")]
    DangerousInputDetected { pattern: &'static str },

    /// Body could not be parsed in its declared format
    #[error("Invalid input")]
    InvalidBody { format: BodyFormat },
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::MalformedDeclaredSize => ErrorCode::MalformedDeclaredSize,
            Self::InvalidOrigin => ErrorCode::InvalidOrigin,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::DangerousInputDetected { .. } => ErrorCode::DangerousInputDetected,
            Self::InvalidBody { format: BodyFormat::Json } => ErrorCode::InvalidJson,
            Self::InvalidBody { format: BodyFormat::Form } => ErrorCode::InvalidInput,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.code().http_status()
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::PayloadTooLarge { .. } | Self::MalformedDeclaredSize => Stage::Size,
            Self::InvalidOrigin => Stage::Origin,
            Self::RateLimited { .. } => Stage::RateLimit,
            Self::DangerousInputDetected { .. } | Self::InvalidBody { .. } => Stage::Sanitize,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        Verdict {
            allowed: false,
            http_status: self.status().as_u16(),
            message: self.to_string(),
            retry_after_secs: self.retry_after_secs(),
        }
    }
}

impl From<Rejection> for GuardError {
    fn from(rejection: Rejection) -> Self {
        let mut details = ErrorDetails::new().with_context("stage", rejection.stage().as_str());
        if let Some(secs) = rejection.retry_after_secs() {
            details = details.with_retry_after(secs);
        }
        if let Rejection::DangerousInputDetected { pattern } = &rejection {
            return GuardError::with_internal(
                rejection.code(),
                rejection.to_string(),
                format!("matched sanitizer pattern {pattern}"),
            )
            .with_details(details);
        }

        GuardError::new(rejection.code(), Cow::Owned(rejection.to_string())).with_details(details)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let Self::RateLimited {
            limit,
            reset_at,
            retry_after_secs,
        } = &self
        {
            headers.insert("Retry-After", HeaderValue::from(*retry_after_secs));
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u64));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_at.timestamp()));
        }

        // The pipeline logs rejections itself.
        let error = GuardError::from(self);
        (error.http_status(), headers, Json(ErrorResponse::from(&error))).into_response()
    }
}

/// Structured outcome of a stage, for callers that translate it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub http_status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            http_status: StatusCode::OK.as_u16(),
            message: "OK".to_string(),
            retry_after_secs: None,
        }
    }
}

impl From<&Rejection> for Verdict {
    fn from(rejection: &Rejection) -> Self {
        rejection.verdict()
    }
}
