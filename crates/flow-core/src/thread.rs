use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{FlowError, Result};

static THREAD_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static thread id pattern"));

/// Strips every character outside `[A-Za-z0-9_-]`.
pub fn sanitize_thread_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Validate a thread identifier.
///
/// The sanitized form must equal the input exactly: anything that would have
/// been rewritten is rejected instead of silently accepted.
pub fn validate_thread_id(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(FlowError::InvalidArgument(
            "thread id must not be empty".into(),
        ));
    }
    if sanitize_thread_id(raw) != raw || !THREAD_ID_PATTERN.is_match(raw) {
        return Err(FlowError::InvalidArgument(format!(
            "thread id '{raw}' must match ^[A-Za-z0-9_-]+$"
        )));
    }
    Ok(())
}

/// A validated thread identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId(String);

impl ThreadId {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_thread_id(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ThreadId {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<ThreadId> for String {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-form thread metadata value (string or number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Number(f64),
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Number(v)
    }
}

/// A conversation or workflow instance that execution state is scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    #[serde(default)]
    pub metadata: HashMap<String, MetadataValue>,
}

impl Thread {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: ThreadId::parse(id)?,
            metadata: HashMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
