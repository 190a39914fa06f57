//! Integration: leak alerts over the bus, and executions traced end-to-end.

use std::sync::Arc;
use std::time::Duration;

use plexus_kernel::bus::{BusConfig, EventBus, EventFilter};
use plexus_kernel::config::{LeakDetectorConfig, LeakThresholds};
use plexus_kernel::event::EventPriority;
use plexus_kernel::executor::StepExecutor;
use plexus_kernel::ids::Clock;
use plexus_kernel::plan::{Plan, PlanStep, StrategyKind};
use plexus_kernel::runtime::{FnToolRunner, ToolFuture, ToolOutput};

use plexus_monitoring::resource::{
    AlertSeverity, LeakDetector, LeakType, ResourceKind, ResourceManager, TaskTracker,
};
use plexus_monitoring::trace::{SpanStatus, Tracer, TracerConfig, TracingStepObserver};

// ---------------------------------------------------------------------------
// Scenario: leak alert within one monitoring interval
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timer_flood_raises_alert_within_one_interval() {
    let bus = Arc::new(EventBus::with_config(
        BusConfig::new(256).with_flush_interval_ms(10),
    ));
    let flusher = bus.start();
    let (_id, mut alerts_rx) = bus
        .subscribe_channel(EventFilter::all().with_type("system:memory.leak.detected"))
        .await;

    let resources = Arc::new(ResourceManager::new());
    let tasks = Arc::new(TaskTracker::new());
    let config = LeakDetectorConfig {
        monitoring_interval_ms: 20,
        thresholds: LeakThresholds {
            max_active_timers: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let detector = Arc::new(
        LeakDetector::new(config, resources.clone(), tasks).with_bus(bus.clone()),
    );

    // A producer allocates 200 timers.
    for i in 0..200 {
        resources.register(format!("timer-{i}"), ResourceKind::Timer, || Ok(()));
    }

    let monitor = detector.start();
    let event = tokio::time::timeout(Duration::from_secs(2), alerts_rx.recv())
        .await
        .expect("no leak alert within the monitoring window")
        .unwrap();

    assert_eq!(event.event_type, "system:memory.leak.detected");
    assert_eq!(event.priority, EventPriority::Critical);
    let alert: serde_json::Value = event.data.clone();
    assert_eq!(alert["leak_type"], "TIMER_LEAK");
    assert_eq!(alert["severity"], "warning");
    assert_eq!(alert["active_timers"], 200);

    monitor.abort();
    bus.shutdown().await;
    let _ = flusher.await;
}

#[tokio::test]
async fn auto_cleanup_sweeps_stale_timers() {
    struct FakeClock(std::sync::atomic::AtomicU64);
    impl Clock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    let clock = Arc::new(FakeClock(std::sync::atomic::AtomicU64::new(1_000)));
    let resources = Arc::new(ResourceManager::new().with_clock(clock.clone()));
    for i in 0..10 {
        resources.register(format!("old-{i}"), ResourceKind::Timer, || Ok(()));
    }
    clock.0.store(400_000, std::sync::atomic::Ordering::SeqCst);
    resources.register("fresh", ResourceKind::Timer, || Ok(()));

    // Default max_resource_age is 300 s; the ten old timers are past it.
    let released = resources.cleanup_older_than(300_000);
    assert_eq!(released, 10);
    assert_eq!(resources.count(ResourceKind::Timer), 1);
}

#[tokio::test]
async fn probe_reports_warning_severity_for_timer_breach() {
    let resources = Arc::new(ResourceManager::new());
    let tasks = Arc::new(TaskTracker::new());
    let config = LeakDetectorConfig {
        monitoring_interval_ms: 0,
        thresholds: LeakThresholds {
            max_active_timers: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let detector = LeakDetector::new(config, resources.clone(), tasks);
    resources.register("t-1", ResourceKind::Timer, || Ok(()));
    resources.register("t-2", ResourceKind::Timer, || Ok(()));

    let report = detector.probe().await;
    let alert = report
        .alerts
        .iter()
        .find(|a| a.leak_type == LeakType::TimerLeak)
        .unwrap();
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert!(alert.message.contains("2 active timers"));
}

// ---------------------------------------------------------------------------
// Traced execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execution_produces_tool_execute_spans() {
    let tracer = Tracer::new(TracerConfig::new("plexus-test"));
    let observer = Arc::new(TracingStepObserver::new(tracer.clone()));

    let runner = Arc::new(FnToolRunner::new(|_tool, _args, _ctx| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ToolOutput::value("ok"))
        }) as ToolFuture
    }));
    let executor = Arc::new(StepExecutor::new(runner).with_observer(observer));

    let plan = Plan::new("traced run", StrategyKind::Linear)
        .add_step(PlanStep::new("a", "fetch data").with_tool("fetch"))
        .add_step(
            PlanStep::new("b", "process data")
                .with_tool("process")
                .depends_on("a"),
        );

    let handle = executor.start_execution(plan).await.unwrap();
    let report = executor.wait(&handle.execution_id).await.unwrap();
    assert_eq!(
        report.status,
        plexus_kernel::executor::ExecutionStatus::Completed
    );

    let spans = tracer.completed_spans().await;
    assert_eq!(spans.len(), 2);
    for span in &spans {
        assert_eq!(span.name, "tool.execute");
        assert_eq!(span.status, SpanStatus::Ok);
        assert!(span.end_time.unwrap() >= span.start_time);
        assert!(span.attributes.contains_key("execution.id"));
        assert!(span.attributes.contains_key("correlation.id"));
    }
    assert_eq!(tracer.active_count().await, 0);
}
