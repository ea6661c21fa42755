#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::{Value, json};
    use taskline_types::{
        CreateResponse, FilterCriterion, ListFilter, Observation, ResponseMode, SequenceTracker,
        SessionId, StreamEvent, TaskId, TaskNotification, TaskResult, TaskStatus, codes,
    };
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    use crate::api::TaskRuntime;
    use crate::runtime::config::{FilterSupport, RuntimeConfig};
    use crate::runtime::context::TaskContext;
    use crate::runtime::operation::{OperationRequest, operation_fn};
    use crate::runtime::sequencer::{DeliveryCursor, MAX_EMITTED_SEQ_NR};
    use crate::runtime::types::{OperationError, TaskError};

    fn runtime(config: RuntimeConfig) -> TaskRuntime {
        let runtime = TaskRuntime::new(config);
        runtime.register(
            "test/echo",
            operation_fn(|ctx: TaskContext, params: Value| async move {
                for word in params.as_str().unwrap_or_default().split_whitespace() {
                    ctx.emit(word)?;
                }
                Ok::<_, OperationError>(None)
            }),
        );
        runtime.register(
            "test/idle",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                ctx.cancelled().await;
                Ok::<_, OperationError>(None)
            }),
        );
        runtime
    }

    fn session() -> SessionId {
        SessionId::default()
    }

    fn task_id(response: &CreateResponse) -> TaskId {
        response.task_id().expect("response should carry a task handle")
    }

    async fn submit_task(runtime: &TaskRuntime, request: OperationRequest) -> TaskId {
        let response = runtime
            .submit(request.with_modes([ResponseMode::Task]))
            .await
            .unwrap();
        assert!(matches!(response, CreateResponse::Task { .. }));
        task_id(&response)
    }

    // ── Mode negotiation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn inline_request_returns_the_result() {
        let runtime = runtime(RuntimeConfig::default());
        let response = runtime
            .submit(
                OperationRequest::new("test/echo", json!("hello there"))
                    .with_modes([ResponseMode::Inline, ResponseMode::Task]),
            )
            .await
            .unwrap();

        match response {
            CreateResponse::Inline { result, task } => {
                assert_eq!(result.status, TaskStatus::Completed);
                assert_eq!(result.content, vec![json!("hello"), json!("there")]);
                let task = task.expect("completed record is retained");
                let snapshot = runtime.get(&session(), task.task_id).await.unwrap();
                assert_eq!(snapshot.status, TaskStatus::Completed);
            }
            other => panic!("expected inline result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inline_without_retention_drops_the_record() {
        let runtime = runtime(RuntimeConfig {
            retain_inline_results: false,
            ..RuntimeConfig::default()
        });
        let response = runtime
            .submit(OperationRequest::new("test/echo", json!("x")).with_modes([ResponseMode::Inline]))
            .await
            .unwrap();
        assert!(matches!(response, CreateResponse::Inline { task: None, .. }));
        let page = runtime.list(&session(), &ListFilter::default()).await.unwrap();
        assert!(page.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_inline_request_degrades_to_a_task() {
        let runtime = runtime(RuntimeConfig::default());
        let response = runtime
            .submit(OperationRequest::new("test/idle", Value::Null).with_modes([ResponseMode::Inline]))
            .await
            .unwrap();
        let CreateResponse::Task { task } = response else {
            panic!("expected a task handle");
        };
        assert_eq!(task.status, TaskStatus::Working);
        assert_eq!(task.poll_interval, 1_000);
    }

    #[tokio::test]
    async fn unsupported_modes_fall_back_to_task() {
        let runtime = runtime(RuntimeConfig {
            supported_modes: vec![ResponseMode::Task],
            ..RuntimeConfig::default()
        });
        let response = runtime
            .submit(OperationRequest::new("test/echo", json!("x")).with_modes([ResponseMode::Stream]))
            .await
            .unwrap();
        assert!(matches!(response, CreateResponse::Task { .. }));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected_without_a_record() {
        let runtime = runtime(RuntimeConfig::default());
        let err = runtime
            .submit(OperationRequest::new("no/such", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::UnknownMethod("no/such".into()));
        let page = runtime.list(&session(), &ListFilter::default()).await.unwrap();
        assert!(page.tasks.is_empty());
    }

    // ── Delivery ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_delivers_each_fragment_once_across_channels() {
        let runtime = runtime(RuntimeConfig::default());
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        runtime.register(
            "test/staged",
            operation_fn(move |ctx: TaskContext, _params: Value| {
                let gate = Arc::clone(&gate);
                async move {
                    ctx.emit("a")?;
                    ctx.emit("b")?;
                    gate.notified().await;
                    ctx.emit("c")?;
                    Ok::<_, OperationError>(None)
                }
            }),
        );

        let cursor = DeliveryCursor::new();
        let response = runtime
            .submit_with_cursor(
                OperationRequest::new("test/staged", Value::Null).with_modes([ResponseMode::Stream]),
                &cursor,
            )
            .await
            .unwrap();
        let CreateResponse::Stream { task, fragments, complete } = response else {
            panic!("expected a stream response");
        };
        assert!(!fragments.is_empty());
        assert!(!complete);

        release.notify_one();
        let mut seqs: Vec<u64> = fragments.iter().map(|f| f.seq_nr).collect();
        let events: Vec<StreamEvent> = runtime
            .subscribe(&session(), task.task_id, cursor.clone())
            .await
            .unwrap()
            .collect()
            .await;
        for event in &events {
            if let StreamEvent::Fragment(f) = event {
                seqs.push(f.seq_nr);
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(events.last().is_some_and(StreamEvent::is_complete));

        let page = runtime.poll(&session(), task.task_id, &cursor).await.unwrap();
        assert!(page.fragments.is_empty());
        assert!(page.complete);
    }

    #[tokio::test]
    async fn gap_is_visible_to_consumers_and_resumable() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/gappy",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                ctx.emit("one")?;
                ctx.emit("two")?;
                ctx.emit_at(4, "four")?;
                Ok::<_, OperationError>(None)
            }),
        );
        let id = submit_task(&runtime, OperationRequest::new("test/gappy", Value::Null)).await;
        runtime.final_result(&session(), id, None).await.unwrap();

        let page = runtime.resume(&session(), id, 2).await.unwrap();
        let seqs: Vec<u64> = page.fragments.iter().map(|f| f.seq_nr).collect();
        assert_eq!(seqs, vec![4]);
        assert!(page.complete);

        let mut tracker = SequenceTracker::resume_at(2);
        assert_eq!(
            tracker.observe(4),
            Observation::Gap {
                missing_from: 3,
                missing_to: 3
            }
        );
        assert_eq!(tracker.last_contiguous(), 2);
    }

    #[tokio::test]
    async fn resume_validates_and_reports_mismatch() {
        let runtime = runtime(RuntimeConfig::default());
        let id = submit_task(&runtime, OperationRequest::new("test/echo", json!("a b"))).await;
        runtime.final_result(&session(), id, None).await.unwrap();

        assert!(matches!(
            runtime.resume(&session(), id, 0).await,
            Err(TaskError::InvalidSeqNr(_))
        ));
        for raw in ["-1", "two", ""] {
            assert!(matches!(
                runtime.result(&session(), id, Some(raw), None).await,
                Err(TaskError::InvalidSeqNr(_))
            ));
        }

        let at_highest = runtime.resume(&session(), id, 2).await.unwrap();
        assert!(at_highest.fragments.is_empty());
        assert!(at_highest.complete);
        assert!(!at_highest.cursor_mismatch);

        match runtime.result(&session(), id, Some("7"), None).await.unwrap() {
            TaskResult::Page(page) => {
                assert!(page.complete);
                assert!(page.cursor_mismatch);
            }
            TaskResult::Final(_) => panic!("expected a page"),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn parent_result_merges_children_first() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/child",
            operation_fn(|_ctx: TaskContext, _params: Value| async move {
                tokio::task::yield_now().await;
                Ok::<_, OperationError>(Some(json!("X")))
            }),
        );
        runtime.register(
            "test/parent",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                ctx.spawn_subtask(OperationRequest::new("test/child", Value::Null))
                    .await?;
                Ok::<_, OperationError>(Some(json!("Y")))
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/parent", Value::Null)).await;
        let result = runtime.final_result(&session(), id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.content, vec![json!("X"), json!("Y")]);

        let parent = runtime.get(&session(), id).await.unwrap();
        let child = runtime.get(&session(), parent.child_task_ids[0]).await.unwrap();
        assert_eq!(child.parent_task_id, Some(id));
        assert_eq!(child.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn input_required_round_trip() {
        let runtime = runtime(RuntimeConfig::default());
        let gate = Arc::new(Notify::new());
        let answer = Arc::clone(&gate);
        runtime.register(
            "test/ask",
            operation_fn(move |ctx: TaskContext, _params: Value| {
                let gate = Arc::clone(&gate);
                async move {
                    ctx.require_input("which file?")?;
                    gate.notified().await;
                    ctx.resume_working()?;
                    Ok::<_, OperationError>(Some(json!("done")))
                }
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/ask", Value::Null)).await;
        let waiting = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = runtime.get(&session(), id).await.unwrap();
                if snapshot.status == TaskStatus::InputRequired {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(waiting.status_message.as_deref(), Some("which file?"));

        answer.notify_one();
        let result = runtime.final_result(&session(), id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[traced_test]
    #[tokio::test]
    async fn cancel_cascades_to_both_children() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/parent-of-two",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                ctx.spawn_subtask(OperationRequest::new("test/idle", Value::Null))
                    .await?;
                ctx.spawn_subtask(OperationRequest::new("test/idle", Value::Null))
                    .await?;
                ctx.cancelled().await;
                Ok::<_, OperationError>(None)
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/parent-of-two", Value::Null)).await;
        let children = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = runtime.get(&session(), id).await.unwrap();
                if snapshot.child_task_ids.len() == 2 {
                    return snapshot.child_task_ids;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let ack = runtime.cancel(&session(), id).await.unwrap();
        assert_eq!(ack.status, TaskStatus::Cancelled);
        for child in children {
            let snapshot = runtime.get(&session(), child).await.unwrap();
            assert_eq!(snapshot.status, TaskStatus::Cancelled);
        }
        assert!(matches!(
            runtime.cancel(&session(), id).await,
            Err(TaskError::AlreadyTerminal { .. })
        ));
        assert!(logs_contain("cancellation requested"));
        assert!(logs_contain("settled by its subtasks"));
    }

    #[traced_test]
    #[tokio::test]
    async fn producer_can_cancel_its_own_subtasks() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/prune",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                let a = ctx
                    .spawn_subtask(OperationRequest::new("test/idle", Value::Null))
                    .await?;
                let b = ctx
                    .spawn_subtask(OperationRequest::new("test/idle", Value::Null))
                    .await?;
                ctx.cancel_subtasks().await;
                ctx.cancel_subtasks().await;
                let mut statuses = Vec::new();
                for child in [a, b] {
                    statuses.push(ctx.subtask_result(child).await?.status);
                }
                Ok::<_, OperationError>(Some(json!(statuses)))
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/prune", Value::Null)).await;
        let result = runtime.final_result(&session(), id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.content.last(), Some(&json!(["cancelled", "cancelled"])));
        assert!(logs_contain("subtask cancel requested"));
    }

    #[tokio::test]
    async fn panicking_producer_fails_the_task() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/panic",
            operation_fn(|_ctx: TaskContext, params: Value| async move {
                if params.is_null() {
                    panic!("producer blew up");
                }
                Ok::<_, OperationError>(None)
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/panic", Value::Null)).await;
        let result = runtime.final_result(&session(), id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.map(|e| e.code), Some(codes::PRODUCER_CRASHED));
    }

    #[tokio::test]
    async fn operation_error_keeps_partial_output() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/fail",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                ctx.emit("partial")?;
                Err::<Option<Value>, _>(OperationError::new("disk full").with_code(-32010))
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/fail", Value::Null)).await;
        let result = runtime.final_result(&session(), id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.content, vec![json!("partial")]);
        let page = runtime.resume(&session(), id, 1).await.unwrap();
        assert_eq!(page.fragments.len(), 1);
        assert!(page.fragments[0].is_error());
        assert_eq!(page.error.map(|e| e.code), Some(-32010));
    }

    #[tokio::test]
    async fn producer_at_the_top_of_the_seq_nr_range_still_finishes() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register(
            "test/top",
            operation_fn(|ctx: TaskContext, _params: Value| async move {
                let beyond = matches!(
                    ctx.emit_at(u64::MAX, "late"),
                    Err(TaskError::SeqNrExhausted { .. })
                );
                ctx.emit_at(MAX_EMITTED_SEQ_NR, "last")?;
                let after_last = matches!(ctx.emit("more"), Err(TaskError::SeqNrExhausted { .. }));
                Ok::<_, OperationError>(Some(json!({ "beyond": beyond, "afterLast": after_last })))
            }),
        );

        let id = submit_task(&runtime, OperationRequest::new("test/top", Value::Null)).await;
        let result = runtime
            .final_result(&session(), id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(
            result.content,
            vec![json!("last"), json!({ "beyond": true, "afterLast": true })]
        );

        let page = runtime
            .poll(&session(), id, &DeliveryCursor::starting_at(MAX_EMITTED_SEQ_NR - 1))
            .await
            .unwrap();
        let seqs: Vec<u64> = page.fragments.iter().map(|f| f.seq_nr).collect();
        assert_eq!(seqs, vec![MAX_EMITTED_SEQ_NR, u64::MAX - 1]);
        assert!(page.complete);
    }

    // ── TTL ───────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn task_past_its_ttl_reads_as_terminal() {
        let runtime = runtime(RuntimeConfig::default());
        let id = submit_task(
            &runtime,
            OperationRequest::new("test/idle", Value::Null).with_ttl(Duration::from_millis(1_000)),
        )
        .await;
        assert_eq!(runtime.get(&session(), id).await.unwrap().status, TaskStatus::Working);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let snapshot = runtime.get(&session(), id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error.map(|e| e.code), Some(codes::TTL_EXPIRED));
    }

    #[tokio::test(start_paused = true)]
    async fn reaped_task_reads_as_expired() {
        let runtime = runtime(RuntimeConfig {
            terminal_grace: Duration::ZERO,
            ..RuntimeConfig::default()
        });
        let id = submit_task(
            &runtime,
            OperationRequest::new("test/echo", json!("x")).with_ttl(Duration::from_secs(1)),
        )
        .await;
        runtime.final_result(&session(), id, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        runtime.sweep().await;
        assert_eq!(
            runtime.get(&session(), id).await,
            Err(TaskError::Expired { task_id: id })
        );
        let unknown = TaskId::new();
        assert_eq!(
            runtime.get(&session(), unknown).await,
            Err(TaskError::NotFound { task_id: unknown })
        );
    }

    // ── Listing & sessions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn sessions_do_not_see_each_other() {
        let runtime = runtime(RuntimeConfig::default());
        let id = submit_task(
            &runtime,
            OperationRequest::new("test/echo", json!("x")).in_session(SessionId::new("alice")),
        )
        .await;
        let bob = SessionId::new("bob");
        assert_eq!(runtime.get(&bob, id).await, Err(TaskError::NotFound { task_id: id }));
        assert!(matches!(runtime.cancel(&bob, id).await, Err(TaskError::NotFound { .. })));
        assert!(runtime.list(&bob, &ListFilter::default()).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn unsupported_status_filter_is_reported_not_applied() {
        let runtime = runtime(RuntimeConfig {
            filter_support: FilterSupport::all().without(FilterCriterion::Status),
            ..RuntimeConfig::default()
        });
        let done = submit_task(&runtime, OperationRequest::new("test/echo", json!("x"))).await;
        runtime.final_result(&session(), done, None).await.unwrap();
        submit_task(&runtime, OperationRequest::new("test/idle", Value::Null)).await;

        let filter = ListFilter {
            statuses: Some(vec![TaskStatus::Completed]),
            ..Default::default()
        };
        let page = runtime.list(&session(), &filter).await.unwrap();
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.dropped_criteria, vec![FilterCriterion::Status]);
        let kept: Vec<TaskId> = page
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.task_id)
            .collect();
        assert_eq!(kept, vec![done]);
    }

    #[tokio::test]
    async fn creation_signals_list_changed() {
        let runtime = runtime(RuntimeConfig::default());
        let mut rx = runtime.notifications();
        submit_task(&runtime, OperationRequest::new("test/idle", Value::Null)).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first, TaskNotification::TaskListChanged { session: session() });
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_fails_unfinished_tasks_and_refuses_new_ones() {
        let runtime = runtime(RuntimeConfig::default());
        let id = submit_task(&runtime, OperationRequest::new("test/idle", Value::Null)).await;

        assert_eq!(runtime.shutdown().await, 1);
        let snapshot = runtime.get(&session(), id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error.map(|e| e.code), Some(codes::SHUTDOWN));
        assert_eq!(
            runtime
                .submit(OperationRequest::new("test/echo", json!("x")))
                .await
                .unwrap_err(),
            TaskError::Shutdown
        );
    }

    // ── Tree invariants ───────────────────────────────────────────────────────

    mod tree_properties {
        use std::collections::HashMap;

        use proptest::prelude::*;
        use taskline_types::{TaskId, TaskNotification, TaskStatus};

        use crate::runtime::storage::{TaskCell, TaskStore};
        use crate::runtime::tree;
        use crate::runtime::types::TaskError;

        const MAX_DEPTH: usize = 6;

        fn new_cell(parent: Option<&TaskCell>) -> std::sync::Arc<TaskCell> {
            std::sync::Arc::new(TaskCell::new(
                parent,
                Default::default(),
                "tools/call",
                std::time::Duration::from_secs(60),
                std::time::Duration::from_secs(1),
            ))
        }

        proptest! {
            #[test]
            fn random_trees_stay_consistent_and_cancel_bottom_up(
                picks in prop::collection::vec(any::<prop::sample::Index>(), 1..32)
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let store = TaskStore::new(1024);
                    let root = new_cell(None);
                    store.insert(root.clone()).await;

                    let mut nodes = vec![root.clone()];
                    let mut expected: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
                    for pick in &picks {
                        let parent = nodes[pick.index(nodes.len())].clone();
                        let child = new_cell(Some(parent.as_ref()));
                        match tree::attach(&store, &parent, child.clone(), MAX_DEPTH).await {
                            Ok(()) => {
                                expected.entry(parent.id).or_default().push(child.id);
                                nodes.push(child);
                            }
                            Err(TaskError::DepthExceeded { .. }) => {
                                assert_eq!(parent.depth, MAX_DEPTH);
                            }
                            Err(other) => panic!("unexpected attach error: {other}"),
                        }
                    }

                    for node in &nodes {
                        let children = node.snapshot().child_task_ids;
                        assert_eq!(&children, expected.get(&node.id).unwrap_or(&Vec::new()));
                        for child in &children {
                            let child = store.get(child).await.unwrap();
                            assert_eq!(child.parent, Some(node.id));
                            assert_eq!(child.depth, node.depth + 1);
                        }
                    }

                    let mut rx = store.subscribe();
                    tree::cancel(&store, &root).await.unwrap();
                    let mut finished = Vec::new();
                    while let Ok(n) = rx.try_recv() {
                        if let TaskNotification::StatusChanged { task_id, status } = n {
                            assert_eq!(status, TaskStatus::Cancelled);
                            finished.push(task_id);
                        }
                    }
                    assert_eq!(finished.len(), nodes.len());
                    let position: HashMap<TaskId, usize> =
                        finished.iter().enumerate().map(|(i, id)| (*id, i)).collect();
                    for node in nodes.iter().skip(1) {
                        let parent = node.parent.unwrap();
                        assert!(position[&node.id] < position[&parent]);
                    }
                });
            }
        }
    }
}
