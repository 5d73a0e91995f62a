//! End-to-end tests for the delivery pipeline.
//!
//! Orchestrator → in-process engine → executor → send/verify tasks → record store,
//! with a scripted provider and an explicit clock passed to `run_due`.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use enforcement_core::NotificationId;
    use enforcement_notify::testing::ScriptedEmailProvider;
    use enforcement_notify::{
        EmailNotificationRequest, EmailProvider, InMemoryNotificationStore, NotificationOrchestrator,
        NotificationRecord, NotificationStatus, NotificationStore, NotificationTasks, NotifySettings,
        PermanentFailureAction, ProviderError, TaskEngine, TaskKind,
    };

    use crate::external::DryRunEmailProvider;
    use crate::records::SqliteNotificationStore;
    use crate::tasks::{
        InMemoryTaskStore, InProcessTaskEngine, SqliteTaskStore, TaskExecutor, TaskStatus,
        TaskStore,
    };

    struct Pipeline {
        tasks: Arc<dyn TaskStore>,
        engine: Arc<InProcessTaskEngine<Arc<dyn TaskStore>>>,
        orchestrator: Arc<NotificationOrchestrator>,
        executor: TaskExecutor<Arc<dyn TaskStore>>,
    }

    impl Pipeline {
        fn new(
            records: Arc<dyn NotificationStore>,
            provider: Arc<dyn EmailProvider>,
            settings: NotifySettings,
        ) -> Self {
            Self::with_tasks(InMemoryTaskStore::arc(), records, provider, settings)
        }

        fn with_tasks(
            tasks: Arc<dyn TaskStore>,
            records: Arc<dyn NotificationStore>,
            provider: Arc<dyn EmailProvider>,
            settings: NotifySettings,
        ) -> Self {
            let descriptors = settings.descriptors();
            let engine = Arc::new(InProcessTaskEngine::new(tasks.clone(), descriptors));
            let orchestrator = Arc::new(NotificationOrchestrator::new(
                records,
                engine.clone(),
                settings,
            ));
            let runner = Arc::new(NotificationTasks::new(orchestrator.clone(), provider));
            let executor = TaskExecutor::new(tasks.clone(), runner, descriptors);
            Self {
                tasks,
                engine,
                orchestrator,
                executor,
            }
        }

        fn record(&self, id: NotificationId) -> NotificationRecord {
            self.orchestrator.notification(id).unwrap().unwrap()
        }

        fn live_tasks(&self) -> usize {
            self.tasks.stats().unwrap().live()
        }

        fn dead_letters(&self) -> usize {
            self.tasks.stats().unwrap().dead_lettered
        }
    }

    fn scripted(settings: NotifySettings) -> (Pipeline, Arc<ScriptedEmailProvider>) {
        let provider = Arc::new(ScriptedEmailProvider::new());
        let pipeline = Pipeline::new(InMemoryNotificationStore::arc(), provider.clone(), settings);
        (pipeline, provider)
    }

    fn request() -> EmailNotificationRequest {
        EmailNotificationRequest::new("penalty-notice", "debtor@example.com")
            .with_personalisation("amount", serde_json::json!("£120.00"))
            .with_reference("case-1001")
    }

    fn after(t: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t + Duration::seconds(secs)
    }

    #[test]
    fn scheduling_leaves_one_pending_send_task() {
        let (p, _) = scripted(NotifySettings::default());

        let resp = p.orchestrator.schedule_email(request()).unwrap();

        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::Scheduled);
        let task = p.tasks.get(resp.task_id).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::SendEmail);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(p.live_tasks(), 1);

        // Nothing runs before the processing delay.
        assert_eq!(p.executor.run_due(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn enqueue_with_existing_task_id_is_ignored() {
        let (p, _) = scripted(NotifySettings::default());
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let state = p.tasks.get(resp.task_id).unwrap().unwrap().state().unwrap();

        let again = p
            .engine
            .enqueue_if_absent(TaskKind::SendEmail, resp.task_id, &state, Utc::now())
            .unwrap();

        assert!(!again);
        assert_eq!(p.live_tasks(), 1);
    }

    #[test]
    fn scenario_a_successful_send_schedules_verification() {
        let (p, provider) = scripted(NotifySettings::default());
        provider.push_send_ok("P1");
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        assert_eq!(p.executor.run_due(after(t0, 3)).unwrap(), 1);

        let record = p.record(resp.notification_id);
        assert_eq!(record.status, NotificationStatus::Submitted);
        assert_eq!(record.provider_notification_id.unwrap().as_str(), "P1");

        let task = p.tasks.get(resp.task_id).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::VerifyEmail);
        assert!(task.execute_at >= after(t0, 60));
        assert_eq!(task.state().unwrap().provider_notification_id.unwrap().as_str(), "P1");
    }

    #[test]
    fn scenario_b_rejected_send_is_final() {
        let (p, provider) = scripted(NotifySettings::default());
        provider.push_send_err(400, "template not found");
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        p.executor.run_due(after(t0, 3)).unwrap();
        p.executor.run_due(after(t0, 86_400)).unwrap();

        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::PermanentFailure);
        assert_eq!(provider.sent_references().len(), 1);
        assert_eq!(p.live_tasks(), 0);
        assert_eq!(p.dead_letters(), 0);
    }

    #[test]
    fn scenario_c_send_recovers_after_three_server_errors() {
        let settings = NotifySettings {
            verify_delay: std::time::Duration::from_secs(7 * 86_400),
            ..Default::default()
        };
        let (p, provider) = scripted(settings);
        for _ in 0..3 {
            provider.push_send_err(500, "internal error");
        }
        provider.push_send_ok("P1");
        let resp = p.orchestrator.schedule_email(request()).unwrap();

        let mut now = after(Utc::now(), 3);
        for (attempt, backoff) in [(1, 300), (2, 600), (3, 1200)] {
            assert_eq!(p.executor.run_due(now).unwrap(), 1);

            let task = p.tasks.get(resp.task_id).unwrap().unwrap();
            assert!(matches!(task.status, TaskStatus::Failed { attempt: a, .. } if a == attempt));
            assert_eq!(task.execute_at, after(now, backoff));
            assert_eq!(
                p.record(resp.notification_id).status,
                NotificationStatus::TemporaryFailure
            );

            // Not retried before the backoff elapses.
            assert_eq!(p.executor.run_due(after(now, backoff - 1)).unwrap(), 0);
            now = after(now, backoff);
        }

        assert_eq!(p.executor.run_due(now).unwrap(), 1);

        let record = p.record(resp.notification_id);
        assert_eq!(record.status, NotificationStatus::Submitted);
        assert_eq!(record.provider_notification_id.unwrap().as_str(), "P1");
        assert_eq!(provider.sent_references().len(), 4);
        assert_eq!(p.dead_letters(), 0);
        assert_eq!(p.tasks.get(resp.task_id).unwrap().unwrap().kind, TaskKind::VerifyEmail);
    }

    #[test]
    fn temporary_failures_are_abandoned_at_retry_ceiling() {
        let settings = NotifySettings {
            send_max_retries: 2,
            ..Default::default()
        };
        let (p, provider) = scripted(settings);
        for _ in 0..5 {
            provider.push_send_err(429, "rate limited");
        }
        let resp = p.orchestrator.schedule_email(request()).unwrap();

        let mut now = Utc::now();
        for _ in 0..6 {
            now = after(now, 86_400);
            p.executor.run_due(now).unwrap();
        }

        assert_eq!(provider.sent_references().len(), 3);
        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::TemporaryFailure);
        assert_eq!(p.live_tasks(), 0);
        assert_eq!(p.dead_letters(), 1);
    }

    #[test]
    fn unclassified_send_error_is_dead_lettered_without_retry() {
        let (p, provider) = scripted(NotifySettings::default());
        provider.push_send_err(503, "bad gateway");
        let resp = p.orchestrator.schedule_email(request()).unwrap();

        let mut now = Utc::now();
        for _ in 0..3 {
            now = after(now, 86_400);
            p.executor.run_due(now).unwrap();
        }

        assert_eq!(provider.sent_references().len(), 1);
        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::TechnicalFailure);
        assert_eq!(p.dead_letters(), 1);
    }

    #[test]
    fn scenario_d_verification_outcomes() {
        for (provider_status, expected) in [
            ("delivered", NotificationStatus::Delivered),
            ("DELIVERED", NotificationStatus::Delivered),
            ("failed", NotificationStatus::PermanentFailure),
        ] {
            let (p, provider) = scripted(NotifySettings::default());
            provider.push_send_ok("P1");
            provider.set_status("P1", Ok(provider_status.to_string()));
            let resp = p.orchestrator.schedule_email(request()).unwrap();
            let t0 = Utc::now();

            p.executor.run_due(after(t0, 3)).unwrap();
            assert_eq!(p.executor.run_due(after(t0, 120)).unwrap(), 1);

            assert_eq!(p.record(resp.notification_id).status, expected);
            assert_eq!(provider.status_calls(), 1);
            assert_eq!(p.live_tasks(), 0);
        }
    }

    #[test]
    fn scenario_e_unknown_provider_notification() {
        let (p, provider) = scripted(NotifySettings::default());
        provider.push_send_ok("P1");
        provider.set_status("P1", Err(ProviderError::new(404, "not found")));
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        p.executor.run_due(after(t0, 3)).unwrap();
        p.executor.run_due(after(t0, 120)).unwrap();
        p.executor.run_due(after(t0, 86_400)).unwrap();

        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::PermanentFailure);
        assert_eq!(provider.status_calls(), 1);
        assert_eq!(p.live_tasks(), 0);
        assert_eq!(p.dead_letters(), 0);
    }

    #[test]
    fn verification_error_other_than_not_found_drops_task() {
        let (p, provider) = scripted(NotifySettings::default());
        provider.push_send_ok("P1");
        provider.set_status("P1", Err(ProviderError::new(500, "provider down")));
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        p.executor.run_due(after(t0, 3)).unwrap();
        p.executor.run_due(after(t0, 120)).unwrap();

        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::Submitted);
        assert_eq!(p.live_tasks(), 0);
    }

    #[test]
    fn permanent_failure_can_route_through_verification() {
        let settings = NotifySettings {
            on_permanent_failure: PermanentFailureAction::Verify,
            ..Default::default()
        };
        let (p, provider) = scripted(settings);
        provider.push_send_err(403, "recipient blocked");
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        p.executor.run_due(after(t0, 3)).unwrap();
        assert_eq!(p.tasks.get(resp.task_id).unwrap().unwrap().kind, TaskKind::VerifyEmail);

        p.executor.run_due(after(t0, 120)).unwrap();

        assert_eq!(p.record(resp.notification_id).status, NotificationStatus::PermanentFailure);
        assert_eq!(provider.status_calls(), 0);
        assert_eq!(p.live_tasks(), 0);
    }

    #[test]
    fn dry_run_provider_with_sqlite_records_delivers() {
        let records = Arc::new(SqliteNotificationStore::open_in_memory().unwrap());
        let p = Pipeline::new(
            records,
            Arc::new(DryRunEmailProvider::new()),
            NotifySettings::default(),
        );
        let resp = p.orchestrator.schedule_email(request()).unwrap();
        let t0 = Utc::now();

        p.executor.run_due(after(t0, 3)).unwrap();
        p.executor.run_due(after(t0, 120)).unwrap();

        let record = p.record(resp.notification_id);
        assert_eq!(record.status, NotificationStatus::Delivered);
        assert!(record.provider_notification_id.is_some());
        assert!(record.submitted_at.is_some());
        assert_eq!(p.live_tasks(), 0);
    }

    #[test]
    fn queued_send_resumes_after_restart_with_sqlite_stores() {
        let path = std::env::temp_dir().join(format!("notify-restart-{}.db", NotificationId::new()));
        let open = |provider: Arc<dyn EmailProvider>| {
            Pipeline::with_tasks(
                Arc::new(SqliteTaskStore::open(&path).unwrap()),
                Arc::new(SqliteNotificationStore::open(&path).unwrap()),
                provider,
                NotifySettings::default(),
            )
        };

        let first = open(Arc::new(DryRunEmailProvider::new()));
        let resp = first.orchestrator.schedule_email(request()).unwrap();
        assert_eq!(first.live_tasks(), 1);
        drop(first);

        let second = open(Arc::new(DryRunEmailProvider::new()));
        assert_eq!(second.record(resp.notification_id).status, NotificationStatus::Scheduled);
        assert_eq!(second.live_tasks(), 1);
        let t0 = Utc::now();

        second.executor.run_due(after(t0, 3)).unwrap();
        second.executor.run_due(after(t0, 120)).unwrap();

        assert_eq!(second.record(resp.notification_id).status, NotificationStatus::Delivered);
        assert_eq!(second.live_tasks(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
