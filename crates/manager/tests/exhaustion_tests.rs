mod common;

use std::time::Duration;

use taskmill_manager::{
    AllocationMode, AllocationTier, Manager, ManagerConfig, Task, TaskResult,
};

use common::ready_worker;

fn test_config() -> ManagerConfig {
    ManagerConfig {
        port: 0,
        ..ManagerConfig::default()
    }
}

fn exhausted_summary(memory_used: i64) -> String {
    serde_json::json!({
        "exit_status": 137,
        "usage": { "cores": 1, "memory": memory_used, "disk": 10, "gpus": 0 },
        "wall_time": 5_000_000u64,
        "limits_exceeded": { "cores": -1, "memory": memory_used, "disk": -1, "gpus": -1 },
    })
    .to_string()
}

fn clean_summary() -> String {
    serde_json::json!({
        "exit_status": 0,
        "usage": { "cores": 1, "memory": 900, "disk": 10, "gpus": 0 },
        "wall_time": 5_000_000u64,
    })
    .to_string()
}

#[tokio::test]
async fn memory_exhaustion_retries_at_the_category_max() -> anyhow::Result<()> {
    let monitor_dir = tempfile::tempdir()?;

    let mut m = Manager::listen(test_config()).await?;
    m.enable_monitoring(monitor_dir.path());
    m.set_category_mode("heavy", AllocationMode::MinWaste);
    let port = m.port();

    let mut t = Task::new("analyze big-input");
    t.set_category("heavy");
    t.set_memory(1000);
    t.set_cores(1);
    let task_id = m.submit(t)?;

    let worker = tokio::spawn(async move {
        let mut w = ready_worker(port, "node1", 4, 4096, 10240).await?;

        // First attempt: killed over its memory limit.
        let first = w.expect_task().await?;
        assert_eq!(first.memory, 1000);
        w.offer_result(first.task_id, 0, 137, 5_000_000, b"").await?;
        w.serve_one_get(exhausted_summary(2000).as_bytes()).await?;

        // The retry arrives with the observed maximum instead.
        let second = w.expect_task().await?;
        assert_eq!(second.task_id, first.task_id);
        assert_eq!(second.memory, 2000);
        w.offer_result(second.task_id, 0, 0, 5_000_000, b"").await?;
        w.serve_one_get(clean_summary().as_bytes()).await?;
        anyhow::Ok(())
    });

    let done = m
        .wait(Some(Duration::from_secs(10)))
        .await
        .expect("task completes on the retry");

    assert_eq!(done.id(), task_id);
    assert_eq!(done.result(), TaskResult::Success);
    assert_eq!(done.exit_code(), 0);
    assert_eq!(done.allocation_tier(), AllocationTier::Max);
    assert_eq!(done.exhausted_attempts(), 1);
    // Two commits, but the exhaustion retry is not charged extra tries
    // beyond the re-dispatch itself.
    assert_eq!(done.try_count(), 2);
    let measured = done.resources_measured().expect("monitor summary parsed");
    assert!(measured.limits_exceeded.is_none());

    assert_eq!(m.stats().tasks_exhausted_attempts, 1);
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn exhaustion_at_the_maximum_fails_the_task() -> anyhow::Result<()> {
    let monitor_dir = tempfile::tempdir()?;

    let mut m = Manager::listen(test_config()).await?;
    m.enable_monitoring(monitor_dir.path());
    // Fixed allocation: there is no larger tier to retry at.
    m.set_category_mode("rigid", AllocationMode::Fixed);
    let port = m.port();

    let mut t = Task::new("analyze big-input");
    t.set_category("rigid");
    t.set_memory(1000);
    t.set_cores(1);
    let task_id = m.submit(t)?;

    let worker = tokio::spawn(async move {
        let mut w = ready_worker(port, "node1", 4, 4096, 10240).await?;
        let commit = w.expect_task().await?;
        w.offer_result(commit.task_id, 0, 137, 5_000_000, b"").await?;
        w.serve_one_get(exhausted_summary(2000).as_bytes()).await?;
        anyhow::Ok(())
    });

    let done = m
        .wait(Some(Duration::from_secs(10)))
        .await
        .expect("task fails terminally");
    assert_eq!(done.id(), task_id);
    assert_eq!(done.result(), TaskResult::MaxRetries);
    assert_eq!(done.exhausted_attempts(), 1);

    worker.await??;
    Ok(())
}
