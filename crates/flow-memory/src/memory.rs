use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use flow_config::MemoryConfig;
use flow_core::{FlowError, IdGenerator, Result};

/// One long-term memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryItem {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            id: IdGenerator::memory_id(),
            kind: kind.into(),
            content,
            tenant_id: None,
            session_id: None,
            agent_name: None,
            tags: Vec::new(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Filter for [`MemoryManager::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Case-insensitive substring of the serialized content.
    pub text: Option<String>,
    pub kind: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_name: Option<String>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn matches(&self, item: &MemoryItem) -> bool {
        fn same(want: &Option<String>, have: &Option<String>) -> bool {
            want.is_none() || want == have
        }

        if let Some(ref kind) = self.kind {
            if &item.kind != kind {
                return false;
            }
        }
        if !same(&self.tenant_id, &item.tenant_id)
            || !same(&self.session_id, &item.session_id)
            || !same(&self.agent_name, &item.agent_name)
        {
            return false;
        }
        if !self.tags.iter().all(|t| item.tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.since {
            if item.timestamp < since {
                return false;
            }
        }
        if let Some(ref text) = self.text {
            let haystack = match &item.content {
                Value::String(s) => s.to_lowercase(),
                other => other.to_string().to_lowercase(),
            };
            if !haystack.contains(&text.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Opaque long-term store.
#[async_trait]
pub trait MemoryManager: Send + Sync {
    fn name(&self) -> &str;

    /// Persist an item; returns its id.
    async fn store(&self, item: MemoryItem) -> Result<String>;

    /// Matching items, newest first.
    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>>;

    async fn is_healthy(&self) -> bool;
}

// ── In-memory backend ──────────────────────────────────────────

pub struct InMemoryMemoryManager {
    items: RwLock<VecDeque<MemoryItem>>,
    max_items: usize,
}

impl InMemoryMemoryManager {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: RwLock::new(VecDeque::new()),
            max_items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl Default for InMemoryMemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default().max_items)
    }
}

#[async_trait]
impl MemoryManager for InMemoryMemoryManager {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, item: MemoryItem) -> Result<String> {
        let id = item.id.clone();
        let mut items = self.items.write();
        items.push_back(item);
        while items.len() > self.max_items {
            items.pop_front();
        }
        Ok(id)
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let items = self.items.read();
        Ok(items
            .iter()
            .rev()
            .filter(|item| query.matches(item))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

// ── SQLite backend ─────────────────────────────────────────────

/// Durable memory manager backed by a single SQLite table.
pub struct SqliteMemoryManager {
    db: Arc<Mutex<Connection>>,
}

fn memory_err(e: rusqlite::Error) -> FlowError {
    FlowError::Memory(e.to_string())
}

impl SqliteMemoryManager {
    /// Open or create the memory database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening memory database");
        let conn = Connection::open(path).map_err(memory_err)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(memory_err)?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(memory_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_items (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                tenant_id TEXT,
                session_id TEXT,
                agent_name TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_memory_kind ON memory_items(kind);
            CREATE INDEX IF NOT EXISTS idx_memory_created ON memory_items(created_at);
            ",
        )
        .map_err(memory_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl MemoryManager for SqliteMemoryManager {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn store(&self, item: MemoryItem) -> Result<String> {
        let content = serde_json::to_string(&item.content)?;
        let tags = serde_json::to_string(&item.tags)?;
        let metadata = serde_json::to_string(&item.metadata)?;

        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO memory_items
                (id, kind, content, tenant_id, session_id, agent_name, tags, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                &item.id,
                &item.kind,
                &content,
                &item.tenant_id,
                &item.session_id,
                &item.agent_name,
                &tags,
                &metadata,
                item.timestamp.timestamp_millis(),
            ],
        )
        .map_err(memory_err)?;

        debug!(id = %item.id, kind = %item.kind, "memory item stored");
        Ok(item.id)
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id, kind, content, tenant_id, session_id, agent_name, tags, metadata, created_at
                 FROM memory_items ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(memory_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(memory_err)?;

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for row in rows {
            let (id, kind, content, tenant_id, session_id, agent_name, tags, metadata, created) =
                row.map_err(memory_err)?;

            let item = MemoryItem {
                id,
                kind,
                content: serde_json::from_str(&content)?,
                tenant_id,
                session_id,
                agent_name,
                tags: serde_json::from_str(&tags).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                timestamp: Utc
                    .timestamp_millis_opt(created)
                    .single()
                    .unwrap_or_else(Utc::now),
            };
            if query.matches(&item) {
                items.push(item);
                if items.len() >= limit {
                    break;
                }
            }
        }
        Ok(items)
    }

    async fn is_healthy(&self) -> bool {
        self.db
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Build the backend named by `memory.backend`.
pub fn open_memory_manager(config: &MemoryConfig) -> Result<Arc<dyn MemoryManager>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryMemoryManager::new(config.max_items))),
        "sqlite" => Ok(Arc::new(SqliteMemoryManager::open(&config.db_path)?)),
        other => Err(FlowError::Config(format!(
            "unknown memory backend '{}'",
            other
        ))),
    }
}
