#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{Map, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use flow_config::{RuntimeConfig, StateConfig};
    use flow_core::{
        Clock, ContextSource, ContextVersion, FlowError, HealthStatus, ManualClock, Result, Thread,
        VersionMetadata, VersionQuery, VersionStore,
    };
    use flow_memory::{InMemoryVersionStore, MemoryItem, MemoryQuery};
    use flow_runtime::{
        ActionResult, AgentConfig, AgentContext, AgentIdentity, AgentThought, CallOptions,
        ContextBuilder, ContextValueUpdate, ExecutionOutcome, ExecutionRuntime, ResultAnalysis,
        RuntimeServices,
    };

    fn runtime(thread: &str) -> (Arc<ExecutionRuntime>, RuntimeServices) {
        let services = RuntimeServices::in_memory();
        let rt = ExecutionRuntime::new(thread, services.clone(), RuntimeConfig::default());
        (Arc::new(rt), services)
    }

    async fn context_for(rt: &Arc<ExecutionRuntime>, services: &RuntimeServices) -> AgentContext {
        let builder = ContextBuilder::new(services.clone(), StateConfig::default(), "default");
        let agent = AgentConfig::new("Tester", AgentIdentity::role("tester"));
        let options =
            CallOptions::default().with_thread(Thread::new(rt.thread_id()).unwrap());
        builder
            .build(&agent, &json!("hello"), &options, rt.clone())
            .await
            .unwrap()
    }

    // ── Lifecycle ──────────────────────────────────────────────

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_start_twice_is_rejected() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();

            let err = rt.start_execution("exec_2", &ctx).unwrap_err();
            assert!(matches!(err, FlowError::AlreadyRunning(ref id) if id == "exec_1"));
            assert_eq!(rt.current_execution_id().as_deref(), Some("exec_1"));
        }

        #[tokio::test]
        async fn test_end_without_start_is_rejected() {
            let (rt, _) = runtime("t1");
            let err = rt
                .end_execution("exec_1", ExecutionOutcome::succeeded(json!(1)))
                .unwrap_err();
            assert_eq!(err.code(), "NOT_RUNNING");
        }

        #[tokio::test]
        async fn test_end_with_wrong_id_is_rejected() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            assert!(matches!(
                rt.end_execution("exec_other", ExecutionOutcome::failed("x")),
                Err(FlowError::NotRunning)
            ));
            assert!(rt.is_running());
        }

        #[tokio::test]
        async fn test_start_and_end_record_system_versions() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            rt.update_execution(json!({ "phase": "warmup" })).unwrap();
            let summary = rt
                .end_execution("exec_1", ExecutionOutcome::succeeded(json!("done")))
                .unwrap();
            assert!(summary.success);
            assert!(!rt.is_running());

            let versions = rt.versions_for("exec_1");
            let kinds: Vec<&str> = versions
                .iter()
                .map(|v| v.data["type"].as_str().unwrap())
                .collect();
            assert_eq!(
                kinds,
                vec!["execution_started", "execution_updated", "execution_ended"]
            );
            assert!(versions.iter().all(|v| v.source == ContextSource::System));
            assert_eq!(versions[2].data["status"], "completed");
            assert_eq!(versions[2].metadata.success, Some(true));
        }

        #[tokio::test]
        async fn test_append_requires_running_execution() {
            let (rt, _) = runtime("t1");
            assert!(matches!(
                rt.append(ContextSource::Agent, json!({})),
                Err(FlowError::NotRunning)
            ));
        }

        #[tokio::test]
        async fn test_health_is_healthy_with_in_memory_services() {
            let (rt, _) = runtime("t1");
            let report = rt.health().await;
            assert_eq!(report.status, HealthStatus::Healthy);
            assert_eq!(report.components.len(), 3);
        }
    }

    // ── Versioning ─────────────────────────────────────────────

    mod versioning {
        use super::*;

        #[tokio::test]
        async fn test_versions_and_steps_are_contiguous() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            for i in 0..5 {
                let v = rt.append(ContextSource::Agent, json!({ "i": i })).unwrap();
                assert_eq!(v.version, i + 2);
                assert!(v.id.contains("exec_1"));
            }

            let trace = rt.execution_trace("exec_1");
            let steps: Vec<u32> = trace.iter().map(|s| s.step).collect();
            assert_eq!(steps, (1..=6).collect::<Vec<_>>());

            let versions = rt.versions_for("exec_1");
            assert_eq!(versions[3].links.previous.as_deref(), Some(versions[2].id.as_str()));
            assert_eq!(versions[0].links.thread_id.as_deref(), Some("t1"));
        }

        #[tokio::test]
        async fn test_append_version_works_for_any_execution() {
            let (rt, _) = runtime("t1");
            let first = rt
                .append_version("exec_a", ContextSource::User, json!(1), Default::default())
                .unwrap();
            let second = rt
                .append_version("exec_a", ContextSource::User, json!(2), Default::default())
                .unwrap();
            let other = rt
                .append_version("exec_b", ContextSource::User, json!(3), Default::default())
                .unwrap();
            assert_eq!((first.version, second.version, other.version), (1, 2, 1));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_appends_never_collide() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();

            let mut handles = Vec::new();
            for _ in 0..8 {
                let rt = Arc::clone(&rt);
                handles.push(tokio::spawn(async move {
                    (0..50)
                        .map(|_| rt.append(ContextSource::Tool, json!({})).unwrap().version)
                        .collect::<Vec<_>>()
                }));
            }
            let mut seen = Vec::new();
            for h in handles {
                seen.extend(h.await.unwrap());
            }
            seen.sort_unstable();
            assert_eq!(seen, (2..=401).collect::<Vec<u64>>());
            assert_eq!(rt.execution_trace("exec_1").len(), 401);
        }

        struct FlakyStore {
            inner: InMemoryVersionStore,
            fail: AtomicBool,
        }

        impl VersionStore for FlakyStore {
            fn append(&self, version: ContextVersion) -> Result<()> {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(FlowError::Storage("disk full".into()));
                }
                self.inner.append(version)
            }

            fn all(&self) -> Vec<ContextVersion> {
                self.inner.all()
            }

            fn retain_latest(&self, keep: usize) -> usize {
                self.inner.retain_latest(keep)
            }

            fn len(&self) -> usize {
                self.inner.len()
            }
        }

        #[tokio::test]
        async fn test_failed_store_append_changes_nothing() {
            let services = RuntimeServices::in_memory();
            let store = Arc::new(FlakyStore {
                inner: InMemoryVersionStore::new(),
                fail: AtomicBool::new(false),
            });
            let rt = Arc::new(
                ExecutionRuntime::new("t1", services.clone(), RuntimeConfig::default())
                    .with_store(store.clone()),
            );
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            rt.append(ContextSource::Agent, json!("ok")).unwrap();

            store.fail.store(true, Ordering::SeqCst);
            let err = rt.append(ContextSource::Agent, json!("lost")).unwrap_err();
            assert_eq!(err.code(), "STORAGE_ERROR");
            let err = rt
                .add_context_value(ContextValueUpdate::new("agent", "k", json!(1)))
                .unwrap_err();
            assert!(matches!(err, FlowError::Storage(_)));
            assert_eq!(rt.get_context_value("agent", "k"), None);
            assert_eq!(rt.execution_trace("exec_1").len(), 2);
            assert_eq!(store.len(), 2);

            store.fail.store(false, Ordering::SeqCst);
            let next = rt.append(ContextSource::Agent, json!("again")).unwrap();
            assert_eq!(next.version, 3);
        }
    }

    // ── Context values ─────────────────────────────────────────

    mod context_values {
        use super::*;

        #[tokio::test]
        async fn test_last_write_wins_and_is_versioned() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();

            rt.add_context_value(ContextValueUpdate::new("user", "lang", json!("en")))
                .unwrap();
            let v = rt
                .add_context_value(ContextValueUpdate::new("user", "lang", json!("pt")))
                .unwrap();
            assert_eq!(v.source, ContextSource::User);
            assert_eq!(v.data["type"], "context_value");

            assert_eq!(rt.get_context_value("user", "lang"), Some(json!("pt")));
            assert_eq!(rt.get_context_type("user").len(), 1);
            assert_eq!(rt.execution_trace("exec_1").len(), 3);
        }

        #[tokio::test]
        async fn test_add_context_value_requires_running_execution() {
            let (rt, _) = runtime("t1");
            let err = rt
                .add_context_value(ContextValueUpdate::new("tools", "k", json!(1)))
                .unwrap_err();
            assert_eq!(err.code(), "NOT_RUNNING");
        }

        #[tokio::test]
        async fn test_resolve_context_path() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            rt.add_context_value(ContextValueUpdate::new(
                "agent",
                "identity",
                json!({ "role": "support", "skills": ["billing", "refunds"] }),
            ))
            .unwrap();

            assert_eq!(
                rt.resolve_context_path("agent.identity.role").unwrap(),
                Some(json!("support"))
            );
            assert_eq!(
                rt.resolve_context_path("agent.identity.skills.1").unwrap(),
                Some(json!("refunds"))
            );
            assert_eq!(rt.resolve_context_path("agent.identity.missing").unwrap(), None);
            assert_eq!(
                rt.resolve_context_path("agent").unwrap(),
                Some(json!({ "identity": { "role": "support", "skills": ["billing", "refunds"] } }))
            );
            // Known root, nothing set yet.
            assert_eq!(rt.resolve_context_path("session.id").unwrap(), None);

            let err = rt.resolve_context_path("bogus.key").unwrap_err();
            assert_eq!(err.code(), "UNKNOWN_CONTEXT_PATH");
        }

        #[tokio::test]
        async fn test_custom_root_resolves_once_set() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            assert!(rt.resolve_context_path("billing.plan").is_err());

            let v = rt
                .add_context_value(ContextValueUpdate::new("billing", "plan", json!("pro")))
                .unwrap();
            assert_eq!(v.source, ContextSource::System);
            assert_eq!(
                rt.resolve_context_path("billing.plan").unwrap(),
                Some(json!("pro"))
            );
            assert_eq!(rt.stats().context_types, vec!["billing".to_string()]);
        }
    }

    // ── Queries and retention ──────────────────────────────────

    mod retention {
        use super::*;

        fn clocked(
            thread: &str,
            limits: RuntimeConfig,
        ) -> (Arc<ExecutionRuntime>, RuntimeServices, ManualClock) {
            let clock = ManualClock::new(Utc::now());
            let services = RuntimeServices::in_memory();
            let rt = ExecutionRuntime::new(thread, services.clone(), limits)
                .with_clock(Arc::new(clock.clone()));
            (Arc::new(rt), services, clock)
        }

        #[tokio::test]
        async fn test_query_ranks_recent_and_matching_agent_first() {
            let (rt, _, clock) = clocked("t1", RuntimeConfig::default());
            let meta = |agent: &str| VersionMetadata {
                agent_name: Some(agent.to_string()),
                ..Default::default()
            };
            rt.append_version("exec_old", ContextSource::Agent, json!("old"), meta("a"))
                .unwrap();
            clock.advance(Duration::hours(12));
            rt.append_version("exec_new", ContextSource::Agent, json!("new"), meta("b"))
                .unwrap();
            clock.advance(Duration::hours(1));

            let plain = rt.query(&VersionQuery::default());
            assert_eq!(plain[0].version.data, json!("new"));

            // The agent boost applies after decay and does not outrank 12h of age.
            let by_agent = rt.query(&VersionQuery {
                agent_name: Some("a".into()),
                ..Default::default()
            });
            assert_eq!(by_agent[0].version.data, json!("new"));
            assert!((by_agent[1].relevance - (1.0 - 13.0 / 24.0) * 1.5).abs() < 1e-9);

            let only_old = rt.query(&VersionQuery {
                execution_id: Some("exec_old".into()),
                ..Default::default()
            });
            assert_eq!(only_old.len(), 1);
            assert!((only_old[0].relevance - (1.0 - 13.0 / 24.0) * 2.0).abs() < 1e-9);
        }

        #[tokio::test]
        async fn test_cleanup_keeps_newest_thousand_versions() {
            let (rt, services, clock) = clocked("t1", RuntimeConfig::default());
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            for i in 0..1199 {
                clock.advance(Duration::seconds(1));
                rt.append(ContextSource::Tool, json!({ "i": i })).unwrap();
            }

            let report = rt.cleanup();
            assert_eq!(report.versions_removed, 200);
            assert_eq!(report.executions_removed, 0);

            let kept = rt.versions_for("exec_1");
            assert_eq!(kept.len(), 1000);
            assert_eq!(kept.iter().map(|v| v.version).min(), Some(201));

            // Counters are not rewound by pruning.
            let next = rt.append(ContextSource::Tool, json!("after")).unwrap();
            assert_eq!(next.version, 1201);
        }

        #[tokio::test]
        async fn test_cleanup_keeps_newest_versions_across_executions() {
            let limits = RuntimeConfig {
                max_versions: 1000,
                max_executions: 10_000,
            };
            let (rt, _, clock) = clocked("t1", limits);
            let base = clock.now();

            // 7 is coprime with 1200, so offsets are a shuffled 0..1200.
            let offset = |i: i64| (i * 7) % 1200;
            for i in 0..1200 {
                clock.set(base + Duration::seconds(offset(i)));
                rt.append_version(
                    &format!("exec_{i}"),
                    ContextSource::Tool,
                    json!(i),
                    Default::default(),
                )
                .unwrap();
            }

            let report = rt.cleanup();
            assert_eq!(report.versions_removed, 200);

            for i in 0..1200 {
                let kept = rt.versions_for(&format!("exec_{i}"));
                if offset(i) >= 200 {
                    assert_eq!(kept.len(), 1, "exec_{i} should survive");
                } else {
                    assert!(kept.is_empty(), "exec_{i} should be pruned");
                }
            }
        }

        #[tokio::test]
        async fn test_cleanup_prunes_oldest_executions_but_not_running_one() {
            let limits = RuntimeConfig {
                max_versions: 10_000,
                max_executions: 3,
            };
            let (rt, services, clock) = clocked("t1", limits);
            let ctx = context_for(&rt, &services).await;

            rt.start_execution("exec_0", &ctx).unwrap();
            for i in 1..5 {
                rt.append_version(
                    &format!("exec_{i}"),
                    ContextSource::System,
                    json!(i),
                    Default::default(),
                )
                .unwrap();
                clock.advance(Duration::seconds(1));
            }

            let report = rt.cleanup();
            assert_eq!(report.executions_removed, 2);
            assert_eq!(report.versions_removed, 0);
            assert_eq!(rt.stats().tracked_executions, 3);
            assert!(!rt.execution_trace("exec_0").is_empty());
            assert!(rt.execution_trace("exec_1").is_empty());
            assert!(rt.execution_trace("exec_2").is_empty());
            assert!(!rt.execution_trace("exec_4").is_empty());
        }
    }

    // ── Agent context ──────────────────────────────────────────

    mod agent_context {
        use super::*;

        #[tokio::test]
        async fn test_cleanup_clears_only_invocation_state() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;

            ctx.state
                .set("scratch", "draft", json!("v1"), None)
                .await
                .unwrap();
            services
                .state
                .set("planner", "history", json!([]), Some("t1"))
                .await
                .unwrap();
            ctx.sessions
                .add_conversation_entry(&ctx.session_id, json!("hi"), json!("hello"), Some("Tester"))
                .await
                .unwrap();
            ctx.memory
                .store(MemoryItem::new("note", json!("keep me")).with_session(ctx.session_id.clone()))
                .await
                .unwrap();

            ctx.cleanup().await.unwrap();

            assert_eq!(ctx.state.get("scratch", "draft", None).await.unwrap(), None);
            assert!(
                services
                    .state
                    .get("planner", "history", Some("t1"))
                    .await
                    .unwrap()
                    .is_some()
            );
            let session = services
                .sessions
                .get_session_context(&ctx.session_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(session.conversation_history.len(), 1);
            let items = services
                .memory
                .query(&MemoryQuery {
                    session_id: Some(ctx.session_id.clone()),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].content, json!("keep me"));
        }

        #[tokio::test]
        async fn test_started_at_reads_injected_clock() {
            let (rt, services) = runtime("t1");
            let clock = ManualClock::new(Utc::now() - Duration::days(3));
            let builder = ContextBuilder::new(services.clone(), StateConfig::default(), "default")
                .with_clock(Arc::new(clock.clone()));
            let agent = AgentConfig::new("Tester", AgentIdentity::role("tester"));
            let options = CallOptions::default().with_thread(Thread::new("t1").unwrap());
            let ctx = builder
                .build(&agent, &json!("x"), &options, rt.clone())
                .await
                .unwrap();
            assert_eq!(ctx.system().started_at, clock.now());
        }
    }

    // ── Planner context ────────────────────────────────────────

    mod planner {
        use super::*;

        #[tokio::test]
        async fn test_session_conversation_seeds_history() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            services
                .sessions
                .add_conversation_entry(&ctx.session_id, json!("hi"), json!("hello"), None)
                .await
                .unwrap();

            rt.start_execution("exec_1", &ctx).unwrap();
            let planner = rt.build_planner_context("please hurry, urgent", &ctx).await.unwrap();
            assert!(planner.has_prior_history());
            assert_eq!(planner.history().len(), 1);
            assert_eq!(planner.iterations(), 0);
            assert_eq!(planner.hints.urgency, flow_runtime::Level::High);

            let last = rt.versions_for("exec_1").pop().unwrap();
            assert_eq!(last.data["type"], "planner_context_built");
            assert_eq!(last.data["historyEntries"], 1);
        }

        #[tokio::test]
        async fn test_history_persists_across_executions() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;

            rt.start_execution("exec_1", &ctx).unwrap();
            let planner = rt.build_planner_context("look it up", &ctx).await.unwrap();
            assert!(!planner.has_prior_history());
            planner.update(
                AgentThought::tool_call("search", json!({ "q": "rust" })),
                ActionResult::ToolResult {
                    content: json!(["a", "b"]),
                },
                ResultAnalysis::continue_with(true, "search succeeded"),
            );
            planner.update(
                AgentThought::final_answer(json!("a")),
                ActionResult::FinalAnswer {
                    content: json!("a"),
                },
                ResultAnalysis::complete(),
            );
            let result = planner.get_final_result();
            assert!(result.success);
            assert_eq!(result.iterations, 2);
            assert_eq!(result.tool_calls, 1);
            assert_eq!(result.result, Some(json!("a")));

            rt.persist_planner_history(&planner).await.unwrap();
            rt.end_execution("exec_1", ExecutionOutcome::succeeded(json!("a")))
                .unwrap();

            rt.start_execution("exec_2", &ctx).unwrap();
            let next = rt.build_planner_context("again", &ctx).await.unwrap();
            assert_eq!(next.history().len(), 2);
            let fresh = next.get_final_result();
            assert_eq!(fresh.iterations, 0);
            assert!(!fresh.success);
        }

        #[tokio::test]
        async fn test_errors_are_counted() {
            let (rt, services) = runtime("t1");
            let ctx = context_for(&rt, &services).await;
            rt.start_execution("exec_1", &ctx).unwrap();
            let planner = rt.build_planner_context("x", &ctx).await.unwrap();
            planner.update(
                AgentThought::tool_call("broken", json!({})),
                ActionResult::Error {
                    error: "boom".into(),
                },
                ResultAnalysis::continue_with(false, "broken failed"),
            );
            let result = planner.get_final_result();
            assert_eq!(result.errors, 1);
            assert!(!result.success);
            assert_eq!(result.result, None);
        }

        #[tokio::test]
        async fn test_context_user_map_is_exposed() {
            let (rt, services) = runtime("t1");
            let builder = ContextBuilder::new(services.clone(), StateConfig::default(), "acme");
            let mut user = Map::new();
            user.insert("plan".into(), json!("pro"));
            let options = CallOptions::default()
                .with_thread(Thread::new("t1").unwrap())
                .with_user_context(user);
            let agent = AgentConfig::new("Tester", AgentIdentity::role("tester"));
            let ctx = builder
                .build(&agent, &json!("x"), &options, rt.clone())
                .await
                .unwrap();
            assert_eq!(ctx.tenant_id, "acme");
            assert_eq!(ctx.user()["plan"], "pro");
            assert_eq!(ctx.max_iterations, flow_runtime::DEFAULT_MAX_ITERATIONS);
        }
    }
}
