use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flow_config::{RegistryConfig, RuntimeConfig};
use flow_core::{Event, EventBus, Result, SharedClock, system_clock, validate_thread_id};

use crate::execution::ExecutionRuntime;
use crate::services::RuntimeServices;

struct Entry {
    runtime: Arc<ExecutionRuntime>,
    last_access: DateTime<Utc>,
}

/// Thread id → [`ExecutionRuntime`], created on first use and evicted once
/// idle.
///
/// While any thread is registered a background task sweeps the map every
/// cleanup interval; it stops by itself when the map drains.
pub struct RuntimeRegistry {
    runtimes: DashMap<String, Entry>,
    services: RuntimeServices,
    settings: RegistryConfig,
    limits: RuntimeConfig,
    clock: SharedClock,
    events: EventBus,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeRegistry {
    pub fn new(
        services: RuntimeServices,
        settings: RegistryConfig,
        limits: RuntimeConfig,
        events: EventBus,
    ) -> Self {
        Self {
            runtimes: DashMap::new(),
            services,
            settings,
            limits,
            clock: system_clock(),
            events,
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The runtime for `thread_id`, creating it on first use.
    ///
    /// Every call for the same thread returns the same `Arc` until the thread
    /// is evicted or removed.
    pub fn get_by_thread(self: &Arc<Self>, thread_id: &str) -> Result<Arc<ExecutionRuntime>> {
        validate_thread_id(thread_id)?;
        let now = self.clock.now();

        let mut created = false;
        let runtime = {
            let mut entry = self
                .runtimes
                .entry(thread_id.to_string())
                .or_insert_with(|| {
                    created = true;
                    Entry {
                        runtime: Arc::new(
                            ExecutionRuntime::new(
                                thread_id,
                                self.services.clone(),
                                self.limits.clone(),
                            )
                            .with_clock(Arc::clone(&self.clock)),
                        ),
                        last_access: now,
                    }
                });
            entry.last_access = now;
            Arc::clone(&entry.runtime)
        };

        if created {
            debug!(thread_id, "execution runtime created");
            self.ensure_cleanup_timer();
        }
        Ok(runtime)
    }

    pub fn has_thread(&self, thread_id: &str) -> bool {
        self.runtimes.contains_key(thread_id)
    }

    pub fn remove_thread(&self, thread_id: &str) -> bool {
        match self.runtimes.remove(thread_id) {
            Some((_, entry)) => {
                release_thread_state(entry.runtime);
                true
            }
            None => false,
        }
    }

    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runtimes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    /// Evict runtimes idle longer than the idle timeout, or all of them when
    /// `force` is set. A runtime with an execution in flight is only evicted
    /// by force. Returns the number evicted.
    pub fn cleanup(&self, force: bool) -> usize {
        let now = self.clock.now();
        let idle_ms = self.settings.idle_timeout().as_millis() as i64;
        let evictable = |entry: &Entry| {
            force
                || (!entry.runtime.is_running()
                    && (now - entry.last_access).num_milliseconds() > idle_ms)
        };

        let candidates: Vec<String> = self
            .runtimes
            .iter()
            .filter(|e| evictable(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for thread_id in candidates {
            // Re-checked under the shard lock: the thread may have been touched since.
            if let Some((_, entry)) = self
                .runtimes
                .remove_if(&thread_id, |_, entry| evictable(entry))
            {
                evicted += 1;
                release_thread_state(entry.runtime);
                debug!(thread_id = %thread_id, "execution runtime evicted");
                self.events.publish(Event::ThreadEvicted { thread_id });
            }
        }
        if evicted > 0 {
            info!(evicted, remaining = self.runtimes.len(), force, "registry cleanup");
        }
        evicted
    }

    /// Stop the background sweep. It restarts on the next new thread.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
            debug!("registry cleanup timer stopped");
        }
    }

    pub fn is_cleanup_active(&self) -> bool {
        self.cleanup_task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep and drop every runtime.
    pub fn clear(&self) {
        self.stop_cleanup();
        let drained: Vec<String> = self.runtimes.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for thread_id in drained {
            if let Some((_, entry)) = self.runtimes.remove(&thread_id) {
                release_thread_state(entry.runtime);
                count += 1;
            }
        }
        info!(count, "registry cleared");
    }

    fn ensure_cleanup_timer(self: &Arc<Self>) {
        let mut slot = self.cleanup_task.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime, registry cleanup timer not started");
            return;
        };
        *slot = Some(handle.spawn(cleanup_loop(
            Arc::downgrade(self),
            self.settings.cleanup_interval(),
        )));
        debug!(
            interval_secs = self.settings.cleanup_interval_secs,
            "registry cleanup timer started"
        );
    }

    /// Called from the sweep. Clears the task slot when nothing is left to
    /// watch, so the next new thread starts a fresh timer.
    fn release_timer_if_idle(&self) -> bool {
        let mut slot = self.cleanup_task.lock();
        if self.runtimes.is_empty() {
            slot.take();
            return true;
        }
        false
    }
}

/// Clear an evicted runtime's shared thread state in the background.
/// Without an async runtime the state is left for the service's own cap.
fn release_thread_state(runtime: Arc<ExecutionRuntime>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        if let Err(e) = runtime.release_thread_state().await {
            warn!(thread_id = %runtime.thread_id(), error = %e, "failed to release thread state");
        }
    });
}

async fn cleanup_loop(registry: Weak<RuntimeRegistry>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.cleanup(false);
        if registry.release_timer_if_idle() {
            debug!("registry empty, cleanup timer exiting");
            break;
        }
    }
}

impl Drop for RuntimeRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
    }
}
