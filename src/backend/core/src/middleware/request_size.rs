//! Content-type-aware payload size limits.
//!
//! The limit is picked by the normalized declared content type, falling back
//! to the `default` entry. A declared `Content-Length` is checked up front; an
//! undeclared one is allowed here and capped later while the body is buffered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::verdict::Rejection;
use crate::error::{GuardError, Result};

pub const DEFAULT_LIMIT_KEY: &str = "default";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadLimit {
    pub max_bytes: u64,
    pub message: String,
}

impl PayloadLimit {
    pub fn new(max_bytes: u64, message: impl Into<String>) -> Self {
        Self {
            max_bytes,
            message: message.into(),
        }
    }

    fn rejection(&self) -> Rejection {
        Rejection::PayloadTooLarge {
            max_bytes: self.max_bytes,
            message: self.message.clone(),
        }
    }
}

pub fn default_payload_limits() -> HashMap<String, PayloadLimit> {
    [
        (
            "application/json",
            PayloadLimit::new(MIB, "JSON payload too large (max 1MB)"),
        ),
        (
            "multipart/form-data",
            PayloadLimit::new(10 * MIB, "File upload too large (max 10MB)"),
        ),
        (
            "application/x-www-form-urlencoded",
            PayloadLimit::new(100 * KIB, "Form data too large (max 100KB)"),
        ),
        (
            "text/plain",
            PayloadLimit::new(100 * KIB, "Text payload too large (max 100KB)"),
        ),
        (
            DEFAULT_LIMIT_KEY,
            PayloadLimit::new(MIB, "Payload too large (max 1MB)"),
        ),
    ]
    .into_iter()
    .map(|(ct, limit)| (ct.to_string(), limit))
    .collect()
}

/// Lowercased media type with parameters stripped: `Application/JSON; charset=utf-8` -> `application/json`.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Outcome of an accepted size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadCheck {
    /// Declared length, if any
    pub declared: Option<u64>,

    /// Cap to apply while buffering the body
    pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PayloadValidator {
    limits: HashMap<String, PayloadLimit>,
    default: PayloadLimit,
}

impl PayloadValidator {
    pub fn new(limits: HashMap<String, PayloadLimit>) -> Result<Self> {
        let limits: HashMap<String, PayloadLimit> = limits
            .into_iter()
            .map(|(ct, limit)| (normalize_content_type(&ct), limit))
            .collect();

        let default = limits.get(DEFAULT_LIMIT_KEY).cloned().ok_or_else(|| {
            GuardError::configuration("payload limits must contain a `default` entry")
        })?;

        Ok(Self { limits, default })
    }

    /// Limit for a declared content type. Missing or unknown types get `default`.
    pub fn limit_for(&self, content_type: Option<&str>) -> &PayloadLimit {
        content_type
            .map(normalize_content_type)
            .and_then(|ct| self.limits.get(&ct))
            .unwrap_or(&self.default)
    }

    /// Check the declared length against the limit for `content_type`.
    pub fn validate(
        &self,
        content_length: Option<&str>,
        content_type: Option<&str>,
    ) -> std::result::Result<PayloadCheck, Rejection> {
        let limit = self.limit_for(content_type);

        let Some(raw) = content_length else {
            return Ok(PayloadCheck {
                declared: None,
                max_bytes: limit.max_bytes,
            });
        };

        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Rejection::MalformedDeclaredSize);
        }

        // All digits, so a parse failure can only be overflow
        let declared: u64 = raw.parse().map_err(|_| limit.rejection())?;
        if declared > limit.max_bytes {
            return Err(limit.rejection());
        }

        Ok(PayloadCheck {
            declared: Some(declared),
            max_bytes: limit.max_bytes,
        })
    }

    /// Rejection used when an undeclared body overflows its cap while buffering.
    pub fn overflow(&self, content_type: Option<&str>) -> Rejection {
        self.limit_for(content_type).rejection()
    }
}
