use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, MutexGuard as TokioMutexGuard};
use tracing::{debug, info, warn};

use flow_config::RuntimeConfig;
use flow_core::{
    ContextSource, ContextVersion, ExecutionStep, FlowError, HealthReport, Result, ScoredVersion,
    SharedClock, StorageHints, StorageTier, VersionLinks, VersionMetadata, VersionQuery,
    VersionStore, rank_versions, system_clock,
};
use flow_memory::{InMemoryVersionStore, MemoryManager};

use crate::context::{AgentContext, ExecutionHandle};
use crate::planner::{
    ExecutionHints, PlannerExecutionContext, StepExecution, history_from_conversation,
};
use crate::services::RuntimeServices;

/// Roots `resolve_context_path` always accepts, even before any value is set.
pub const CONTEXT_ROOTS: [&str; 6] = ["agent", "tools", "session", "execution", "user", "planner"];

const PLANNER_NAMESPACE: &str = "planner";
const PLANNER_HISTORY_KEY: &str = "history";
/// Planner history entries written back to thread state.
const MAX_PERSISTED_HISTORY: usize = 50;

/// Typed key/value entry; last write wins per `(kind, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextValueUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ContextValueUpdate {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            value,
            metadata: Map::new(),
        }
    }

    fn source(&self) -> ContextSource {
        match self.kind.as_str() {
            "user" => ContextSource::User,
            "agent" | "planner" => ContextSource::Agent,
            "tools" => ContextSource::Tool,
            _ => ContextSource::System,
        }
    }
}

/// How an execution finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub versions_removed: usize,
    pub executions_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub thread_id: String,
    pub total_versions: usize,
    pub tracked_executions: usize,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_execution_id: Option<String>,
    pub context_types: Vec<String>,
}

struct Running {
    execution_id: String,
    agent_name: String,
    correlation_id: String,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    current: Option<Running>,
    /// Last version number issued per execution. Never pruned, so numbers
    /// are never reused.
    counters: HashMap<String, u64>,
    steps: HashMap<String, Vec<ExecutionStep>>,
    /// Executions in first-seen order, which is also start order.
    execution_order: VecDeque<String>,
    context_values: HashMap<String, HashMap<String, ContextValueUpdate>>,
}

/// The stateful engine behind one thread's agent executions.
///
/// All bookkeeping (version counters, traces, context values) sits behind a
/// single lock; every mutation including the store append happens inside one
/// critical section, so per-execution version numbers are gap-free under
/// concurrent callers.
pub struct ExecutionRuntime {
    thread_id: String,
    services: RuntimeServices,
    store: Arc<dyn VersionStore>,
    clock: SharedClock,
    limits: RuntimeConfig,
    run_lock: TokioMutex<()>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionRuntime {
    pub fn new(
        thread_id: impl Into<String>,
        services: RuntimeServices,
        limits: RuntimeConfig,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            services,
            store: Arc::new(InMemoryVersionStore::new()),
            clock: system_clock(),
            limits,
            run_lock: TokioMutex::new(()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.services.memory
    }

    /// Serialise whole agent runs on this thread.
    pub async fn lock_run(&self) -> TokioMutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    // ── Lifecycle ──────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    pub fn current_execution_id(&self) -> Option<String> {
        self.inner
            .lock()
            .current
            .as_ref()
            .map(|r| r.execution_id.clone())
    }

    pub fn start_execution(&self, execution_id: &str, ctx: &AgentContext) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(ref running) = inner.current {
            return Err(FlowError::AlreadyRunning(running.execution_id.clone()));
        }

        let metadata = VersionMetadata {
            agent_name: Some(ctx.agent_name.clone()),
            ..Default::default()
        };
        let data = json!({
            "type": "execution_started",
            "agentName": ctx.agent_name,
            "invocationId": ctx.invocation_id,
            "correlationId": ctx.correlation_id,
            "tenantId": ctx.tenant_id,
            "sessionId": ctx.session_id,
            "threadId": ctx.thread.id.as_str(),
        });
        let links = VersionLinks {
            correlation_id: Some(ctx.correlation_id.clone()),
            ..Default::default()
        };
        let started = self.append_locked(
            &mut inner,
            execution_id,
            ContextSource::System,
            data,
            metadata,
            links,
        )?;

        inner.current = Some(Running {
            execution_id: execution_id.to_string(),
            agent_name: ctx.agent_name.clone(),
            correlation_id: ctx.correlation_id.clone(),
            started_at: started.timestamp,
        });
        info!(
            thread_id = %self.thread_id,
            execution_id,
            agent = %ctx.agent_name,
            "execution started"
        );
        Ok(())
    }

    pub fn end_execution(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<ExecutionSummary> {
        let mut inner = self.inner.lock();
        let (agent_name, correlation_id, started_at) = match inner.current {
            Some(ref r) if r.execution_id == execution_id => {
                (r.agent_name.clone(), r.correlation_id.clone(), r.started_at)
            }
            _ => return Err(FlowError::NotRunning),
        };

        let duration_ms = (self.clock.now() - started_at).num_milliseconds().max(0) as u64;
        let status = if outcome.success { "completed" } else { "failed" };
        let data = json!({
            "type": "execution_ended",
            "status": status,
            "durationMs": duration_ms,
            "result": outcome.result,
            "error": outcome.error,
        });
        let metadata = VersionMetadata {
            agent_name: Some(agent_name),
            success: Some(outcome.success),
            duration_ms: Some(duration_ms),
            ..Default::default()
        };
        let links = VersionLinks {
            correlation_id: Some(correlation_id),
            ..Default::default()
        };
        self.append_locked(
            &mut inner,
            execution_id,
            ContextSource::System,
            data,
            metadata,
            links,
        )?;
        inner.current = None;

        info!(thread_id = %self.thread_id, execution_id, status, duration_ms, "execution ended");
        Ok(ExecutionSummary {
            execution_id: execution_id.to_string(),
            success: outcome.success,
            duration_ms,
        })
    }

    pub fn update_execution(&self, patch: Value) -> Result<()> {
        self.append(
            ContextSource::System,
            json!({ "type": "execution_updated", "patch": patch }),
        )
        .map(|_| ())
    }

    // ── Versioning ─────────────────────────────────────────────

    /// Record `data` against the running execution.
    pub fn append(&self, source: ContextSource, data: Value) -> Result<ContextVersion> {
        let mut inner = self.inner.lock();
        let (execution_id, agent_name, correlation_id) = match inner.current {
            Some(ref r) => (
                r.execution_id.clone(),
                r.agent_name.clone(),
                r.correlation_id.clone(),
            ),
            None => return Err(FlowError::NotRunning),
        };
        let metadata = VersionMetadata {
            agent_name: Some(agent_name),
            ..Default::default()
        };
        let links = VersionLinks {
            correlation_id: Some(correlation_id),
            ..Default::default()
        };
        self.append_locked(&mut inner, &execution_id, source, data, metadata, links)
    }

    /// Record `data` against any execution, running or not.
    pub fn append_version(
        &self,
        execution_id: &str,
        source: ContextSource,
        data: Value,
        metadata: VersionMetadata,
    ) -> Result<ContextVersion> {
        let mut inner = self.inner.lock();
        self.append_locked(
            &mut inner,
            execution_id,
            source,
            data,
            metadata,
            VersionLinks::default(),
        )
    }

    /// The one place versions are created. Nothing in `inner` changes unless
    /// the store accepted the version.
    fn append_locked(
        &self,
        inner: &mut Inner,
        execution_id: &str,
        source: ContextSource,
        data: Value,
        metadata: VersionMetadata,
        mut links: VersionLinks,
    ) -> Result<ContextVersion> {
        let version = inner.counters.get(execution_id).copied().unwrap_or(0) + 1;
        let timestamp = self.clock.now();

        links.previous = inner
            .steps
            .get(execution_id)
            .and_then(|steps| steps.last())
            .map(|s| s.version_id.clone());
        links.thread_id = Some(self.thread_id.clone());

        let record = ContextVersion {
            id: ContextVersion::derive_id(execution_id, version, source, timestamp),
            execution_id: execution_id.to_string(),
            version,
            source,
            timestamp,
            data,
            metadata,
            storage: storage_hints(source),
            links,
        };

        self.store.append(record.clone())?;

        inner.counters.insert(execution_id.to_string(), version);
        if !inner.steps.contains_key(execution_id) {
            inner.execution_order.push_back(execution_id.to_string());
        }
        let steps = inner.steps.entry(execution_id.to_string()).or_default();
        let step = ExecutionStep::from_version(steps.len() as u32 + 1, &record);
        steps.push(step);

        debug!(
            execution_id,
            version,
            source = %source,
            "context version appended"
        );
        Ok(record)
    }

    // ── Context values ─────────────────────────────────────────

    /// Update the value cache and the version log together.
    pub fn add_context_value(&self, update: ContextValueUpdate) -> Result<ContextVersion> {
        let mut inner = self.inner.lock();
        let (execution_id, agent_name) = match inner.current {
            Some(ref r) => (r.execution_id.clone(), r.agent_name.clone()),
            None => return Err(FlowError::NotRunning),
        };

        let data = json!({
            "type": "context_value",
            "contextType": update.kind,
            "key": update.key,
            "value": update.value,
            "metadata": update.metadata,
        });
        let metadata = VersionMetadata {
            agent_name: Some(agent_name),
            ..Default::default()
        };
        let version = self.append_locked(
            &mut inner,
            &execution_id,
            update.source(),
            data,
            metadata,
            VersionLinks::default(),
        )?;

        inner
            .context_values
            .entry(update.kind.clone())
            .or_default()
            .insert(update.key.clone(), update);
        Ok(version)
    }

    pub fn get_context_value(&self, kind: &str, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .context_values
            .get(kind)
            .and_then(|values| values.get(key))
            .map(|u| u.value.clone())
    }

    pub fn get_context_type(&self, kind: &str) -> HashMap<String, Value> {
        self.inner
            .lock()
            .context_values
            .get(kind)
            .map(|values| {
                values
                    .iter()
                    .map(|(k, u)| (k.clone(), u.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve `type.key[.field...]`. The root must be a known context type.
    pub fn resolve_context_path(&self, path: &str) -> Result<Option<Value>> {
        let mut parts = path.split('.');
        let root = parts.next().unwrap_or_default();

        let inner = self.inner.lock();
        if !CONTEXT_ROOTS.contains(&root) && !inner.context_values.contains_key(root) {
            return Err(FlowError::UnknownContextPath(path.to_string()));
        }
        let Some(values) = inner.context_values.get(root) else {
            return Ok(None);
        };

        let Some(key) = parts.next() else {
            let all: Map<String, Value> = values
                .iter()
                .map(|(k, u)| (k.clone(), u.value.clone()))
                .collect();
            return Ok(Some(Value::Object(all)));
        };

        let mut current = match values.get(key) {
            Some(update) => &update.value,
            None => return Ok(None),
        };
        for field in parts {
            current = match current {
                Value::Object(map) => match map.get(field) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                Value::Array(items) => match field.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(current.clone()))
    }

    fn context_snapshot(&self) -> Map<String, Value> {
        self.inner
            .lock()
            .context_values
            .iter()
            .map(|(kind, values)| {
                let entries: Map<String, Value> = values
                    .iter()
                    .map(|(k, u)| (k.clone(), u.value.clone()))
                    .collect();
                (kind.clone(), Value::Object(entries))
            })
            .collect()
    }

    // ── Planning ───────────────────────────────────────────────

    /// Assemble the planner view for the running execution.
    ///
    /// Prior history comes from thread state (`planner` / `history`); when
    /// there is none, the session conversation is folded into one entry.
    pub async fn build_planner_context(
        &self,
        input: &str,
        ctx: &AgentContext,
    ) -> Result<PlannerExecutionContext> {
        let execution_id = self.current_execution_id().ok_or(FlowError::NotRunning)?;

        let mut history: Vec<StepExecution> = match self
            .services
            .state
            .get(PLANNER_NAMESPACE, PLANNER_HISTORY_KEY, Some(&self.thread_id))
            .await?
        {
            Some(raw) => serde_json::from_value(raw).unwrap_or_else(|e| {
                warn!(thread_id = %self.thread_id, error = %e, "discarding unreadable planner history");
                Vec::new()
            }),
            None => Vec::new(),
        };

        if history.is_empty() {
            let session = self
                .services
                .sessions
                .get_session_context(&ctx.session_id)
                .await?;
            if let Some(session) = session {
                history.extend(history_from_conversation(&session.conversation_history));
            }
        }

        let hints = ExecutionHints::derive(input, &ctx.identity);
        self.append(
            ContextSource::System,
            json!({
                "type": "planner_context_built",
                "historyEntries": history.len(),
                "hints": hints,
            }),
        )?;

        Ok(PlannerExecutionContext::new(
            input.to_string(),
            execution_id,
            self.thread_id.clone(),
            ctx.agent_name.clone(),
            ctx.max_iterations,
            hints,
            self.context_snapshot(),
            history,
            Arc::clone(&self.clock),
        ))
    }

    /// Write planner history back to thread state for the next run.
    pub async fn persist_planner_history(&self, planner: &PlannerExecutionContext) -> Result<()> {
        let history = planner.history();
        let start = history.len().saturating_sub(MAX_PERSISTED_HISTORY);
        let value = serde_json::to_value(&history[start..])?;
        self.services
            .state
            .set(
                PLANNER_NAMESPACE,
                PLANNER_HISTORY_KEY,
                value,
                Some(&self.thread_id),
            )
            .await
    }

    /// Drop the thread-scoped state this runtime wrote to the shared service.
    pub async fn release_thread_state(&self) -> Result<()> {
        self.services
            .state
            .clear(PLANNER_NAMESPACE, Some(&self.thread_id))
            .await
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn query(&self, query: &VersionQuery) -> Vec<ScoredVersion> {
        rank_versions(self.store.all(), query, self.clock.now())
    }

    pub fn execution_trace(&self, execution_id: &str) -> Vec<ExecutionStep> {
        self.inner
            .lock()
            .steps
            .get(execution_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn versions_for(&self, execution_id: &str) -> Vec<ContextVersion> {
        self.store.for_execution(execution_id)
    }

    pub fn stats(&self) -> RuntimeStats {
        let inner = self.inner.lock();
        let mut context_types: Vec<String> = inner.context_values.keys().cloned().collect();
        context_types.sort();
        RuntimeStats {
            thread_id: self.thread_id.clone(),
            total_versions: self.store.len(),
            tracked_executions: inner.steps.len(),
            running: inner.current.is_some(),
            current_execution_id: inner.current.as_ref().map(|r| r.execution_id.clone()),
            context_types,
        }
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Trim the version log to the newest `max_versions` by timestamp and the
    /// execution traces to the `max_executions` most recently started.
    pub fn cleanup(&self) -> CleanupReport {
        let mut inner = self.inner.lock();
        let versions_removed = self.store.retain_latest(self.limits.max_versions);

        let running = inner.current.as_ref().map(|r| r.execution_id.clone());
        let excess = inner
            .execution_order
            .len()
            .saturating_sub(self.limits.max_executions);
        let mut dropped: HashSet<String> = HashSet::new();
        for id in inner.execution_order.iter() {
            if dropped.len() == excess {
                break;
            }
            if running.as_deref() != Some(id.as_str()) {
                dropped.insert(id.clone());
            }
        }
        inner.execution_order.retain(|id| !dropped.contains(id));
        inner.steps.retain(|id, _| !dropped.contains(id));

        let report = CleanupReport {
            versions_removed,
            executions_removed: dropped.len(),
        };
        if report != CleanupReport::default() {
            info!(thread_id = %self.thread_id, ?report, "runtime cleanup");
        }
        report
    }

    pub async fn health(&self) -> HealthReport {
        self.services.health().await
    }
}

fn storage_hints(source: ContextSource) -> StorageHints {
    let tier = match source {
        ContextSource::User | ContextSource::Agent => StorageTier::Session,
        ContextSource::System | ContextSource::Tool | ContextSource::Llm => StorageTier::Memory,
    };
    StorageHints {
        tier,
        ttl_secs: None,
    }
}

#[async_trait]
impl ExecutionHandle for ExecutionRuntime {
    fn start(&self, execution_id: &str, ctx: &AgentContext) -> Result<()> {
        self.start_execution(execution_id, ctx)
    }

    fn end(&self, execution_id: &str, outcome: ExecutionOutcome) -> Result<ExecutionSummary> {
        self.end_execution(execution_id, outcome)
    }

    fn update(&self, patch: Value) -> Result<()> {
        self.update_execution(patch)
    }

    async fn health(&self) -> HealthReport {
        ExecutionRuntime::health(self).await
    }

    fn cleanup(&self) -> CleanupReport {
        ExecutionRuntime::cleanup(self)
    }
}
