//! Scheduler behavior: auto-rule firing, run-now, rerun.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use parkwatch_detect::testing::UniformDetector;
use parkwatch_frame_source::testing::ScriptedFrameSource;
use parkwatch_store::{BlobStore, NewAutoRule, Store, TaskFilter};
use parkwatch_types::{ChannelCode, ExecutionStatus, TaskStatus};

use parkwatch_engine::{change, EngineConfig, ExecutionEngine, PlanRequest, Scheduler};

fn chan(s: &str) -> ChannelCode {
    ChannelCode::parse(s).unwrap()
}

struct Rig {
    store: Arc<Store>,
    scheduler: Scheduler,
    engine: ExecutionEngine,
    _blob_dir: tempfile::TempDir,
}

fn rig() -> Rig {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let blob_dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BlobStore::new(blob_dir.path()).unwrap());
    let (change_tx, change_rx) = mpsc::channel(64);
    let _change = change::start(store.clone(), change_rx);
    let cfg = EngineConfig {
        retry_backoff: Duration::from_millis(10),
        drain_grace: Duration::from_millis(500),
        ..EngineConfig::default()
    };
    let engine = ExecutionEngine::new(
        store.clone(),
        blobs,
        Arc::new(ScriptedFrameSource::always_ok()),
        Arc::new(UniformDetector {
            occupied: None,
            confidence: None,
        }),
        change_tx,
        cfg.clone(),
    );
    let scheduler = Scheduler::new(store.clone(), engine.clone(), cfg);
    Rig {
        store,
        scheduler,
        engine,
        _blob_dir: blob_dir,
    }
}

async fn wait_terminal(store: &Store, expected: u64) {
    for _ in 0..500 {
        let page = store
            .list_tasks(&TaskFilter {
                status_in: vec![TaskStatus::ScreenshotTaken, TaskStatus::Failed],
                page_size: 500,
                ..Default::default()
            })
            .unwrap();
        if page.total >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tasks did not finish in time");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn run_now_plans_and_submits() {
    let r = rig();
    let outcome = r
        .scheduler
        .run_now(&PlanRequest {
            day: "2025-12-19".into(),
            base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan("c1"),
            interval_minutes: 360,
        })
        .await
        .unwrap();
    assert_eq!(outcome.plan.created, 4);
    assert_eq!(outcome.submitted, 4);

    wait_terminal(&r.store, 4).await;
    let done = r
        .store
        .list_tasks(&TaskFilter {
            status_in: vec![TaskStatus::ScreenshotTaken],
            page_size: 100,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(done.total, 4);
    r.engine.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rerun_rearms_and_resubmits() {
    let r = rig();
    r.scheduler
        .run_now(&PlanRequest {
            day: "2025-12-19".into(),
            base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan("c1"),
            interval_minutes: 720,
        })
        .await
        .unwrap();
    wait_terminal(&r.store, 2).await;

    let rearmed = r
        .scheduler
        .rerun(&parkwatch_engine::RerunTarget::Matching {
            date: "2025-12-19".into(),
            ip: Some("10.0.0.1".into()),
            channel: None,
        })
        .await
        .unwrap();
    assert_eq!(rearmed.len(), 2);
    wait_terminal(&r.store, 2).await;
    r.engine.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auto_rule_fires_once_per_minute() {
    let r = rig();
    // 18:00 Asia/Shanghai == 10:00 UTC.
    let now = Utc.with_ymd_and_hms(2025, 12, 19, 10, 0, 7).unwrap();
    let rule_id = r
        .store
        .create_rule(&NewAutoRule {
            use_today: true,
            custom_date: None,
            base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan("c1"),
            interval_minutes: 1440,
            trigger_time: "18:00".into(),
            is_enabled: true,
        })
        .unwrap();

    r.scheduler.fire_due_rules(now).await.unwrap();
    // A second tick in the same wall minute is a no-op.
    let later_same_minute = Utc.with_ymd_and_hms(2025, 12, 19, 10, 0, 37).unwrap();
    r.scheduler.fire_due_rules(later_same_minute).await.unwrap();

    let rule = r.store.list_rules().unwrap().pop().unwrap();
    assert_eq!(rule.id, rule_id);
    assert_eq!(rule.execution_count, 1);
    assert_eq!(rule.last_execution_status, ExecutionStatus::Success);

    // The plan for the wall-local day was materialized and submitted.
    let page = r
        .store
        .list_tasks(&TaskFilter {
            date: Some("2025-12-19".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);
    wait_terminal(&r.store, 1).await;

    // A tick at a non-matching minute does nothing.
    let off_minute = Utc.with_ymd_and_hms(2025, 12, 19, 10, 5, 0).unwrap();
    r.scheduler.fire_due_rules(off_minute).await.unwrap();
    let rule = r.store.list_rules().unwrap().pop().unwrap();
    assert_eq!(rule.execution_count, 1);
    r.engine.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn disabled_and_custom_date_rules() {
    let r = rig();
    let now = Utc.with_ymd_and_hms(2025, 12, 19, 10, 0, 0).unwrap();

    r.store
        .create_rule(&NewAutoRule {
            use_today: false,
            custom_date: Some("2025-12-01".into()),
            base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan("c1"),
            interval_minutes: 1440,
            trigger_time: "18:00".into(),
            is_enabled: true,
        })
        .unwrap();
    r.store
        .create_rule(&NewAutoRule {
            use_today: true,
            custom_date: None,
            base_rtsp: "rtsp://u:p@10.0.0.2:554".into(),
            channel: chan("c2"),
            interval_minutes: 1440,
            trigger_time: "18:00".into(),
            is_enabled: false,
        })
        .unwrap();

    r.scheduler.fire_due_rules(now).await.unwrap();

    // The custom-date rule planned its configured day.
    let page = r
        .store
        .list_tasks(&TaskFilter {
            date: Some("2025-12-01".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);

    // The disabled rule did nothing.
    let rules = r.store.list_rules().unwrap();
    let disabled = rules.iter().find(|x| !x.is_enabled).unwrap();
    assert_eq!(disabled.execution_count, 0);
    r.engine.shutdown().await;
}
