//! XSS screening for untrusted input.
//!
//! Two separate operations:
//! - [`InputSanitizer::assert_safe`] is a gate. Any dangerous pattern rejects
//!   the value; nothing is cleaned and passed through.
//! - [`InputSanitizer::strip_known_safe_formatting`] is a best-effort cleanup
//!   for low-stakes free-text fields. It removes tags and script URI schemes and
//!   never rejects.
//!
//! Patterns are an ordered, named list. The first match names the verdict; the
//! name goes to logs and metrics, never to the caller.

use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::verdict::Rejection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    /// Body fields cleaned instead of gated
    pub free_text_fields: Vec<String>,

    /// Also flag bare `cookie` and `document.` mentions. Prone to false positives.
    pub flag_generic_keywords: bool,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            free_text_fields: vec!["description".into(), "notes".into()],
            flag_generic_keywords: false,
        }
    }
}

/// Body encodings the pipeline parses and screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyFormat {
    Json,
    Form,
}

impl BodyFormat {
    /// Format for a normalized content type (no parameters, lowercase).
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/json" => Some(Self::Json),
            "application/x-www-form-urlencoded" => Some(Self::Form),
            ct if ct.ends_with("+json") => Some(Self::Json),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Form => "form",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizationVerdict {
    Clean,
    Rejected { pattern: &'static str },
}

impl SanitizationVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("script_block", r"(?i)<\s*/?\s*script\b"),
    ("iframe_block", r"(?i)<\s*/?\s*iframe\b"),
    ("object_block", r"(?i)<\s*/?\s*object\b"),
    ("embed_block", r"(?i)<\s*/?\s*embed\b"),
    ("svg_block", r"(?i)<\s*/?\s*svg\b"),
    ("img_tag", r"(?i)<\s*img\b"),
    ("javascript_uri", r"(?i)javascript\s*:"),
    ("vbscript_uri", r"(?i)vbscript\s*:"),
    ("data_uri", r"(?i)\bdata\s*:\s*[a-z]+/[a-z0-9.+-]+"),
    ("event_handler", r#"(?i)(?:^|[\s"'/;<])on[a-z]+\s*="#),
    (
        "script_trigger",
        r"(?i)\b(?:eval|expression|alert)\s*\(|\b(?:prompt|confirm)\(|document\s*\.\s*cookie",
    ),
    ("encoded_angle_bracket", r"(?i)%3[ce]"),
];

const GENERIC_KEYWORD_PATTERNS: &[(&str, &str)] = &[
    ("cookie_access", r"(?i)\bcookies?\b"),
    ("document_access", r"(?i)\bdocument\s*\."),
];

const TAG_LIKE: (&str, &str) = ("tag_like", r"</?[a-zA-Z!][^<>]*>");

const MAX_STRIP_PASSES: usize = 5;

#[derive(Debug, Clone)]
pub struct InputSanitizer {
    patterns: Vec<(&'static str, Regex)>,
    free_text_fields: HashSet<String>,
    tags: Regex,
    schemes: Regex,
    spaces: Regex,
}

impl InputSanitizer {
    pub fn new(config: &SanitizeConfig) -> Self {
        let mut table: Vec<(&'static str, &'static str)> = BLOCKING_PATTERNS.to_vec();
        if config.flag_generic_keywords {
            table.extend_from_slice(GENERIC_KEYWORD_PATTERNS);
        }
        table.push(TAG_LIKE);

        Self {
            patterns: table
                .into_iter()
                .map(|(name, pattern)| (name, compile(pattern)))
                .collect(),
            free_text_fields: config.free_text_fields.iter().cloned().collect(),
            tags: compile(r"<[^<>]*>"),
            schemes: compile(r"(?i)(?:javascript|vbscript|data)\s*:"),
            spaces: compile(r"[ \t]{2,}"),
        }
    }

    /// Names of the active patterns, in evaluation order.
    pub fn pattern_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.patterns.iter().map(|(name, _)| *name)
    }

    pub fn is_free_text(&self, field: &str) -> bool {
        self.free_text_fields.contains(field)
    }

    /// First matching pattern, if any.
    pub fn check(&self, value: &str) -> SanitizationVerdict {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(value))
            .map_or(SanitizationVerdict::Clean, |(name, _)| {
                SanitizationVerdict::Rejected { pattern: *name }
            })
    }

    /// Gate: return the value untouched or reject it.
    pub fn assert_safe<'a>(&self, value: &'a str) -> Result<&'a str, Rejection> {
        match self.check(value) {
            SanitizationVerdict::Clean => Ok(value),
            SanitizationVerdict::Rejected { pattern } => {
                counter!("sanitizer_blocked_total", "pattern" => pattern).increment(1);
                Err(Rejection::DangerousInputDetected { pattern })
            }
        }
    }

    /// Cleanup: drop tag-like substrings and script URI schemes, collapse the
    /// whitespace they leave behind. Repeats until stable so nested fragments
    /// like `<scr<b>ipt>` cannot reassemble.
    pub fn strip_known_safe_formatting(&self, value: &str) -> String {
        let mut current = value.to_string();
        for _ in 0..MAX_STRIP_PASSES {
            let next = {
                let without_tags = self.tags.replace_all(&current, "");
                self.schemes.replace_all(&without_tags, "").into_owned()
            };
            if next == current {
                break;
            }
            current = next;
        }

        self.spaces.replace_all(&current, " ").trim().to_string()
    }

    /// Screen a parsed JSON body in place.
    ///
    /// Object keys and ordinary strings are gated. Strings under a free-text
    /// field (directly or inside arrays) are cleaned. Returns how many values
    /// were changed by cleanup.
    pub fn screen_json(&self, value: &mut Value) -> Result<usize, Rejection> {
        let mut stripped = 0;
        self.screen_value(value, false, &mut stripped)?;
        if stripped > 0 {
            counter!("sanitizer_stripped_total").increment(stripped as u64);
            debug!(stripped, "Cleaned free-text fields");
        }
        Ok(stripped)
    }

    /// Screen decoded form pairs in place.
    ///
    /// Every name is gated. Values of free-text fields are cleaned, all other
    /// values are gated. Returns how many values were changed by cleanup.
    pub fn screen_form(&self, pairs: &mut [(String, String)]) -> Result<usize, Rejection> {
        let mut stripped = 0;
        for (name, value) in pairs.iter_mut() {
            if let Err(rejection) = self.assert_safe(name) {
                warn!("Dangerous content in form field name");
                return Err(rejection);
            }
            if self.is_free_text(name) {
                let cleaned = self.strip_known_safe_formatting(value);
                if cleaned != *value {
                    *value = cleaned;
                    stripped += 1;
                }
            } else {
                self.assert_safe(value)?;
            }
        }
        if stripped > 0 {
            counter!("sanitizer_stripped_total").increment(stripped as u64);
            debug!(stripped, "Cleaned free-text fields");
        }
        Ok(stripped)
    }

    fn screen_value(&self, value: &mut Value, free_text: bool, stripped: &mut usize) -> Result<(), Rejection> {
        match value {
            Value::String(s) if free_text => {
                let cleaned = self.strip_known_safe_formatting(s);
                if cleaned != *s {
                    *s = cleaned;
                    *stripped += 1;
                }
            }
            Value::String(s) => {
                self.assert_safe(s)?;
            }
            Value::Array(items) => {
                for item in items {
                    self.screen_value(item, free_text, stripped)?;
                }
            }
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if let Err(rejection) = self.assert_safe(key) {
                        warn!("Dangerous content in JSON object key");
                        return Err(rejection);
                    }
                    self.screen_value(child, self.is_free_text(key), stripped)?;
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(&SanitizeConfig::default())
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in sanitizer pattern must compile")
}
