#[cfg(test)]
mod tests {
    use flow_core::*;

    // ── Thread id tests ────────────────────────────────────────

    mod thread {
        use super::*;

        #[test]
        fn test_valid_thread_ids() {
            assert!(validate_thread_id("abc-123_OK").is_ok());
            assert!(validate_thread_id("t1").is_ok());
            assert!(ThreadId::parse("thread_0af3").is_ok());
        }

        #[test]
        fn test_invalid_thread_ids() {
            for raw in ["", "abc/123", "with space", "dots.not.allowed", "ünïcode", "a\nb"] {
                let err = validate_thread_id(raw).unwrap_err();
                assert_eq!(err.code(), "INVALID_ARGUMENT", "input {raw:?}");
                assert!(err.is_validation());
            }
        }

        #[test]
        fn test_sanitize_is_not_applied_silently() {
            assert_eq!(sanitize_thread_id("abc/123"), "abc123");
            assert!(ThreadId::parse("abc/123").is_err());
        }

        #[test]
        fn test_thread_id_serde_validates() {
            let ok: ThreadId = serde_json::from_str("\"t-1\"").unwrap();
            assert_eq!(ok.as_str(), "t-1");
            assert!(serde_json::from_str::<ThreadId>("\"t/1\"").is_err());
        }

        #[test]
        fn test_thread_metadata() {
            let thread = Thread::new("t1")
                .unwrap()
                .with_metadata("channel", "web")
                .with_metadata("priority", 2.0);
            assert_eq!(thread.metadata["channel"], MetadataValue::Text("web".into()));
            assert_eq!(thread.metadata["priority"], MetadataValue::Number(2.0));
        }

        #[test]
        fn test_generated_ids_are_valid_thread_ids() {
            assert!(validate_thread_id(&IdGenerator::thread_id()).is_ok());
            assert!(IdGenerator::execution_id().starts_with("exec_"));
            assert_ne!(IdGenerator::correlation_id(), IdGenerator::correlation_id());
        }
    }

    // ── Status machine tests ───────────────────────────────────

    mod status {
        use super::*;
        use UnifiedStatus::*;

        fn expected_table() -> Vec<(UnifiedStatus, Vec<UnifiedStatus>)> {
            vec![
                (Pending, vec![Executing, Cancelled, Skipped]),
                (
                    Executing,
                    vec![
                        Completed, Failed, Replanning, WaitingInput, Paused, Cancelled, Rewriting,
                        Observing, Parallel, Stagnated, Timeout, Deadlock,
                    ],
                ),
                (Failed, vec![Replanning, Cancelled]),
                (Replanning, vec![Executing, Failed, Cancelled]),
                (WaitingInput, vec![Executing, Cancelled]),
                (Paused, vec![Executing, Cancelled]),
                (Rewriting, vec![Executing, Failed, Cancelled]),
                (Observing, vec![Executing, Failed, Cancelled]),
                (Parallel, vec![Executing, Failed, Cancelled]),
                (Stagnated, vec![Executing, Failed, Cancelled]),
                (Timeout, vec![Replanning, Cancelled]),
                (Deadlock, vec![Replanning, Cancelled]),
                (Completed, vec![]),
                (Cancelled, vec![]),
                (Skipped, vec![]),
                (FinalAnswerResult, vec![]),
            ]
        }

        #[test]
        fn test_every_pair_matches_table() {
            let table = expected_table();
            assert_eq!(table.len(), UnifiedStatus::ALL.len());
            for (from, allowed) in &table {
                for to in UnifiedStatus::ALL {
                    assert_eq!(
                        StatusMachine::is_valid(*from, to),
                        allowed.contains(&to),
                        "{from} -> {to}"
                    );
                }
            }
        }

        #[test]
        fn test_terminal_states() {
            for status in [Completed, Cancelled, Skipped, FinalAnswerResult] {
                assert!(status.is_terminal());
                assert!(status.allowed_transitions().is_empty());
            }
            assert!(!Pending.is_terminal());
            assert!(!Failed.is_terminal());
        }

        #[test]
        fn test_transition_in_place() {
            let mut status = Pending;
            StatusMachine::transition(&mut status, Executing).unwrap();
            assert_eq!(status, Executing);

            let err = StatusMachine::transition(&mut status, Pending).unwrap_err();
            assert_eq!(err.code(), "INVALID_TRANSITION");
            assert_eq!(status, Executing);
        }

        #[test]
        fn test_parse_and_display() {
            for status in UnifiedStatus::ALL {
                let parsed: UnifiedStatus = status.as_str().parse().unwrap();
                assert_eq!(parsed, status);
            }
            assert_eq!(WaitingInput.to_string(), "waiting_input");
            assert!("bogus".parse::<UnifiedStatus>().is_err());
        }

        #[test]
        fn test_serde_uses_snake_case() {
            let json = serde_json::to_string(&FinalAnswerResult).unwrap();
            assert_eq!(json, "\"final_answer_result\"");
        }
    }

    // ── Plan tests ─────────────────────────────────────────────

    mod plan {
        use super::*;

        fn three_step_plan() -> ExecutionPlan {
            ExecutionPlan::new("ship it").with_steps(vec![
                PlanStep::new("fetch").with_id("a"),
                PlanStep::new("analyze").with_id("b").depends_on("a"),
                PlanStep::new("report").with_id("c").depends_on("b"),
            ])
        }

        #[test]
        fn test_valid_dag() {
            assert!(three_step_plan().validate().is_ok());
        }

        #[test]
        fn test_cycle_detected() {
            let plan = ExecutionPlan::new("loop").with_steps(vec![
                PlanStep::new("x").with_id("a").depends_on("b"),
                PlanStep::new("y").with_id("b").depends_on("a"),
            ]);
            let err = plan.validate().unwrap_err();
            assert!(err.to_string().contains("cycle"));
        }

        #[test]
        fn test_repeated_dependency_is_not_a_cycle() {
            let plan = ExecutionPlan::new("dup").with_steps(vec![
                PlanStep::new("x").with_id("a"),
                PlanStep::new("y").with_id("b").depends_on("a").depends_on("a"),
            ]);
            assert!(plan.validate().is_ok());

            let self_loop = ExecutionPlan::new("self")
                .with_steps(vec![PlanStep::new("x").with_id("a").depends_on("a")]);
            assert!(self_loop.validate().is_err());
        }

        #[test]
        fn test_unknown_dependency() {
            let plan = ExecutionPlan::new("bad")
                .with_steps(vec![PlanStep::new("x").with_id("a").depends_on("zzz")]);
            assert!(plan.validate().unwrap_err().to_string().contains("zzz"));
        }

        #[test]
        fn test_ready_steps_follow_dependencies() {
            let mut plan = three_step_plan();
            assert_eq!(plan.next_ready_step().unwrap().id, "a");

            plan.transition_step("a", UnifiedStatus::Executing).unwrap();
            assert!(plan.next_ready_step().is_none());

            plan.transition_step("a", UnifiedStatus::Completed).unwrap();
            assert_eq!(plan.next_ready_step().unwrap().id, "b");
            assert!((plan.progress() - 1.0 / 3.0).abs() < f32::EPSILON);
        }

        #[test]
        fn test_illegal_step_transition_rejected() {
            let mut plan = three_step_plan();
            let err = plan
                .transition_step("a", UnifiedStatus::Completed)
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_TRANSITION");
            assert_eq!(plan.step("a").unwrap().status, UnifiedStatus::Pending);
        }

        #[test]
        fn test_skipped_counts_as_done() {
            let mut plan = ExecutionPlan::new("g").with_steps(vec![
                PlanStep::new("x").with_id("a"),
                PlanStep::new("y").with_id("b"),
            ]);
            plan.transition_step("a", UnifiedStatus::Skipped).unwrap();
            plan.transition_step("b", UnifiedStatus::Executing).unwrap();
            plan.transition_step("b", UnifiedStatus::Completed).unwrap();
            assert!(plan.is_complete());
        }
    }

    // ── Version ranking tests ──────────────────────────────────

    mod versions {
        use super::*;
        use chrono::{Duration, TimeZone, Utc};
        use serde_json::json;

        fn version(exec: &str, n: u64, ts: chrono::DateTime<Utc>) -> ContextVersion {
            ContextVersion {
                id: ContextVersion::derive_id(exec, n, ContextSource::Agent, ts),
                execution_id: exec.to_string(),
                version: n,
                source: ContextSource::Agent,
                timestamp: ts,
                data: json!({"type": "note"}),
                metadata: VersionMetadata::default(),
                storage: StorageHints::default(),
                links: VersionLinks::default(),
            }
        }

        #[test]
        fn test_derived_id_contains_parts() {
            let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            let id = ContextVersion::derive_id("exec_1", 3, ContextSource::Tool, ts);
            assert_eq!(id, format!("exec_1_v3_tool_{}", ts.timestamp_millis()));
        }

        #[test]
        fn test_decay_and_floor() {
            let now = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();
            let query = VersionQuery::default();
            let fresh = query.relevance(&version("e", 1, now), now);
            let hour = query.relevance(&version("e", 2, now - Duration::hours(1)), now);
            let old = query.relevance(&version("e", 3, now - Duration::hours(25)), now);
            assert!((fresh - 1.0).abs() < 1e-9);
            assert!((hour - (1.0 - 1.0 / 24.0)).abs() < 1e-9);
            assert!((old - 0.1).abs() < 1e-9);
        }

        #[test]
        fn test_multipliers_apply_after_decay() {
            let now = Utc::now();
            let mut v = version("e1", 1, now - Duration::hours(30));
            v.metadata.agent_name = Some("planner".into());
            let query = VersionQuery {
                execution_id: Some("e1".into()),
                agent_name: Some("planner".into()),
                ..Default::default()
            };
            let score = query.relevance(&v, now);
            assert!((score - 0.1 * 2.0 * 1.5).abs() < 1e-9);
        }

        #[test]
        fn test_rank_orders_and_pages() {
            let now = Utc::now();
            let versions = vec![
                version("e", 1, now - Duration::hours(25)),
                version("e", 2, now),
                version("e", 3, now - Duration::hours(1)),
            ];
            let ranked = rank_versions(versions.clone(), &VersionQuery::default(), now);
            let order: Vec<u64> = ranked.iter().map(|s| s.version.version).collect();
            assert_eq!(order, vec![2, 3, 1]);
            assert!(ranked[2].relevance < ranked[1].relevance / 5.0);

            let paged = rank_versions(
                versions,
                &VersionQuery {
                    offset: 1,
                    limit: Some(1),
                    ..Default::default()
                },
                now,
            );
            assert_eq!(paged.len(), 1);
            assert_eq!(paged[0].version.version, 3);
        }

        #[test]
        fn test_filter_predicates() {
            let now = Utc::now();
            let mut ok = version("e", 1, now);
            ok.metadata.success = Some(true);
            let mut tool = version("e", 2, now);
            tool.source = ContextSource::Tool;
            let query = VersionQuery {
                sources: Some(vec![ContextSource::Agent]),
                success: Some(true),
                since: Some(now - Duration::minutes(1)),
                ..Default::default()
            };
            assert!(query.matches(&ok));
            assert!(!query.matches(&tool));
            assert!(!query.matches(&version("e", 3, now)));
        }
    }

    // ── Misc ───────────────────────────────────────────────────

    #[test]
    fn test_health_aggregate() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::aggregate([Healthy, Healthy]), Healthy);
        assert_eq!(HealthStatus::aggregate([Healthy, Degraded]), Degraded);
        assert_eq!(HealthStatus::aggregate([Degraded, Unhealthy]), Unhealthy);
        assert_eq!(HealthStatus::aggregate([]), Healthy);
    }

    #[test]
    fn test_error_messages_and_codes() {
        let err = FlowError::AgentNotFound("X".into());
        assert_eq!(err.to_string(), "Agent 'X' not found");
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
        assert_eq!(FlowError::NotRunning.code(), "NOT_RUNNING");
        let t = FlowError::Timeout {
            operation: "agent Echo".into(),
            timeout_ms: 60_000,
        };
        assert!(t.to_string().contains("60000"));
    }

    #[test]
    fn test_manual_clock() {
        use chrono::Duration;
        let clock = ManualClock::default();
        let before = clock.now();
        clock.advance(Duration::minutes(31));
        assert_eq!((clock.now() - before).num_minutes(), 31);
    }

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::Shutdown);
        assert!(matches!(rx.recv().await.unwrap(), Event::Shutdown));
    }
}
