//! Context versions: the append-only log of every mutation made during an
//! execution, plus the ranking used to query it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;

/// Who produced a context mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    System,
    Agent,
    Tool,
    User,
    Llm,
}

impl ContextSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextSource::System => "system",
            ContextSource::Agent => "agent",
            ContextSource::Tool => "tool",
            ContextSource::User => "user",
            ContextSource::Llm => "llm",
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a version should be routed for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    #[default]
    Memory,
    Session,
    Persistent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageHints {
    pub tier: StorageTier,
    /// Seconds this version is worth keeping, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionLinks {
    /// Id of the previous version for the same execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// One immutable mutation record. Superseded, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextVersion {
    pub id: String,
    pub execution_id: String,
    pub version: u64,
    pub source: ContextSource,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub metadata: VersionMetadata,
    pub storage: StorageHints,
    pub links: VersionLinks,
}

impl ContextVersion {
    pub fn derive_id(
        execution_id: &str,
        version: u64,
        source: ContextSource,
        timestamp: DateTime<Utc>,
    ) -> String {
        format!(
            "{}_v{}_{}_{}",
            execution_id,
            version,
            source,
            timestamp.timestamp_millis()
        )
    }

    /// The `type` field of the payload, when it carries one.
    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// One entry of an execution's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    /// 1-based, contiguous within the execution.
    pub step: u32,
    pub execution_id: String,
    pub version_id: String,
    pub source: ContextSource,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecutionStep {
    pub fn from_version(step: u32, version: &ContextVersion) -> Self {
        Self {
            step,
            execution_id: version.execution_id.clone(),
            version_id: version.id.clone(),
            source: version.source,
            action: version.kind().unwrap_or("context_update").to_string(),
            timestamp: version.timestamp,
            success: version.metadata.success,
            duration_ms: version.metadata.duration_ms,
        }
    }
}

/// Storage backend for context versions.
///
/// `append` must either persist the version or return an error without
/// side effects.
pub trait VersionStore: Send + Sync {
    fn append(&self, version: ContextVersion) -> Result<()>;

    fn all(&self) -> Vec<ContextVersion>;

    fn for_execution(&self, execution_id: &str) -> Vec<ContextVersion> {
        self.all()
            .into_iter()
            .filter(|v| v.execution_id == execution_id)
            .collect()
    }

    /// Keep the `keep` most recent versions by timestamp; returns how many
    /// were dropped.
    fn retain_latest(&self, keep: usize) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filter for [`rank_versions`].
#[derive(Debug, Clone, Default)]
pub struct VersionQuery {
    pub sources: Option<Vec<ContextSource>>,
    pub execution_id: Option<String>,
    pub agent_name: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl VersionQuery {
    pub fn matches(&self, version: &ContextVersion) -> bool {
        if let Some(sources) = &self.sources {
            if !sources.contains(&version.source) {
                return false;
            }
        }
        if let Some(id) = &self.execution_id {
            if &version.execution_id != id {
                return false;
            }
        }
        if let Some(success) = self.success {
            if version.metadata.success != Some(success) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if version.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if version.timestamp > until {
                return false;
            }
        }
        true
    }

    /// Decayed-recency relevance: `max(0.1, 1 - age_hours / 24)`, then ×2.0
    /// for an exact execution match, then ×1.5 for a matching agent name.
    pub fn relevance(&self, version: &ContextVersion, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - version.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        let mut score = (1.0 - age_hours / 24.0).max(0.1);
        if self.execution_id.as_deref() == Some(version.execution_id.as_str()) {
            score *= 2.0;
        }
        if let Some(agent) = &self.agent_name {
            if version.metadata.agent_name.as_deref() == Some(agent.as_str()) {
                score *= 1.5;
            }
        }
        score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredVersion {
    pub version: ContextVersion,
    pub relevance: f64,
}

/// Filter, score, sort (descending relevance), then page.
pub fn rank_versions(
    versions: impl IntoIterator<Item = ContextVersion>,
    query: &VersionQuery,
    now: DateTime<Utc>,
) -> Vec<ScoredVersion> {
    let mut scored: Vec<ScoredVersion> = versions
        .into_iter()
        .filter(|v| query.matches(v))
        .map(|v| {
            let relevance = query.relevance(&v, now);
            ScoredVersion { version: v, relevance }
        })
        .collect();
    scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    let page = scored.into_iter().skip(query.offset);
    match query.limit {
        Some(limit) => page.take(limit).collect(),
        None => page.collect(),
    }
}
