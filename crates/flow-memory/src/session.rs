use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use flow_core::{FlowError, HealthStatus, IdGenerator, Result};

/// One input/output exchange recorded against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub input: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub thread_id: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Read view of a session handed to planners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub tenant_id: String,
    pub thread_id: String,
    pub conversation_history: Vec<ConversationEntry>,
    pub metadata: Map<String, Value>,
}

/// Append-only conversation history keyed by (tenant, thread).
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn find_session_by_thread(
        &self,
        thread_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Session>>;

    async fn create_session(
        &self,
        tenant_id: &str,
        thread_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<Session>;

    async fn get_session_context(&self, session_id: &str) -> Result<Option<SessionContext>>;

    async fn add_conversation_entry(
        &self,
        session_id: &str,
        input: Value,
        output: Value,
        agent_name: Option<&str>,
    ) -> Result<()>;

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

struct SessionRecord {
    session: Session,
    history: Vec<ConversationEntry>,
}

/// Process-local session service.
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    by_thread: RwLock<HashMap<(String, String), String>>,
    /// Entries kept per session; the oldest are dropped first.
    max_history: usize,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::with_max_history(100)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_thread: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn find_session_by_thread(
        &self,
        thread_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Session>> {
        let key = (tenant_id.to_string(), thread_id.to_string());
        let Some(session_id) = self.by_thread.read().get(&key).cloned() else {
            return Ok(None);
        };
        Ok(self
            .sessions
            .read()
            .get(&session_id)
            .map(|r| r.session.clone()))
    }

    async fn create_session(
        &self,
        tenant_id: &str,
        thread_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: IdGenerator::session_id(),
            tenant_id: tenant_id.to_string(),
            thread_id: thread_id.to_string(),
            metadata,
            created_at: now,
            last_activity: now,
        };

        self.sessions.write().insert(
            session.id.clone(),
            SessionRecord {
                session: session.clone(),
                history: Vec::new(),
            },
        );
        self.by_thread.write().insert(
            (tenant_id.to_string(), thread_id.to_string()),
            session.id.clone(),
        );

        debug!(session_id = %session.id, tenant_id, thread_id, "session created");
        Ok(session)
    }

    async fn get_session_context(&self, session_id: &str) -> Result<Option<SessionContext>> {
        Ok(self.sessions.read().get(session_id).map(|r| SessionContext {
            session_id: r.session.id.clone(),
            tenant_id: r.session.tenant_id.clone(),
            thread_id: r.session.thread_id.clone(),
            conversation_history: r.history.clone(),
            metadata: r.session.metadata.clone(),
        }))
    }

    async fn add_conversation_entry(
        &self,
        session_id: &str,
        input: Value,
        output: Value,
        agent_name: Option<&str>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| FlowError::Session(format!("session not found: {}", session_id)))?;

        let now = Utc::now();
        record.history.push(ConversationEntry {
            timestamp: now,
            input,
            output,
            agent_name: agent_name.map(str::to_string),
        });
        if record.history.len() > self.max_history {
            let excess = record.history.len() - self.max_history;
            record.history.drain(..excess);
        }
        record.session.last_activity = now;
        Ok(())
    }
}
