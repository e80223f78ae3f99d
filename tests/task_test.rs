//! Tests for `TaskManager` lifecycle, reaping and cancellation.

use std::time::Duration;

use tokio::sync::oneshot;

use skjold::tasks::CANCELLED_ERROR;
use skjold::{SkjoldError, TaskId, TaskManager, TaskManagerConfig, TaskState};

fn manager() -> TaskManager<String> {
    TaskManager::new(TaskManagerConfig::default())
}

/// Poll until the task reaches a terminal state.
async fn wait_terminal(manager: &TaskManager<String>, id: TaskId) {
    for _ in 0..1000 {
        if manager
            .get_status(id)
            .is_some_and(|status| status.status.is_terminal())
        {
            return;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("task {id} never finished");
}

#[tokio::test]
async fn create_task_returns_before_work_runs() {
    let manager = manager();
    let (release, gate) = oneshot::channel::<()>();

    let id = manager.create_task(async move {
        let _ = gate.await;
        Ok("done".to_string())
    });

    let status = manager.get_status(id).unwrap();
    assert_eq!(status.id, id);
    assert!(matches!(status.status, TaskState::Pending | TaskState::Running));
    assert_eq!(status.progress, 0.0);
    assert!(status.result.is_none());
    assert!(status.completed_at.is_none());

    release.send(()).unwrap();
    wait_terminal(&manager, id).await;
}

#[tokio::test]
async fn running_task_has_started_at() {
    let manager = manager();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release, gate) = oneshot::channel::<()>();

    let id = manager.create_task(async move {
        let _ = started_tx.send(());
        let _ = gate.await;
        Ok(String::new())
    });

    started_rx.await.unwrap();
    let status = manager.get_status(id).unwrap();
    assert_eq!(status.status, TaskState::Running);
    assert!(status.started_at.is_some());

    release.send(()).unwrap();
    wait_terminal(&manager, id).await;
}

#[tokio::test]
async fn successful_task_completes_with_result() {
    let manager = manager();
    let id = manager.create_task(async { Ok("diagram".to_string()) });
    wait_terminal(&manager, id).await;

    let status = manager.get_status(id).unwrap();
    assert_eq!(status.status, TaskState::Completed);
    assert_eq!(status.result.as_deref(), Some("diagram"));
    assert_eq!(status.progress, 100.0);
    assert!(status.error.is_none());
    let (started, completed) = (status.started_at.unwrap(), status.completed_at.unwrap());
    assert!(status.created_at <= started && started <= completed);
}

#[tokio::test]
async fn failed_task_records_error_message() {
    let manager = manager();
    let id = manager.create_task(async {
        Err(SkjoldError::ModelNotAvailable("llama3".into()))
    });
    wait_terminal(&manager, id).await;

    let status = manager.get_status(id).unwrap();
    assert_eq!(status.status, TaskState::Failed);
    assert_eq!(status.error.as_deref(), Some("model not available: llama3"));
    assert_eq!(status.progress, 100.0);
    assert!(status.result.is_none());
    assert!(status.completed_at.is_some());
}

#[tokio::test]
async fn unknown_id_has_no_status() {
    assert!(manager().get_status(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn all_statuses_lists_every_task() {
    let manager = manager();
    let a = manager.create_task(async { Ok("a".to_string()) });
    let b = manager.create_task(async { Err(SkjoldError::Operation("b".into())) });
    wait_terminal(&manager, a).await;
    wait_terminal(&manager, b).await;

    let all = manager.get_all_statuses();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&a].status, TaskState::Completed);
    assert_eq!(all[&b].status, TaskState::Failed);
}

#[tokio::test]
async fn status_serializes_for_clients() {
    let manager = manager();
    let id = manager.create_task(async { Ok("x".to_string()) });
    wait_terminal(&manager, id).await;

    let json = serde_json::to_value(manager.get_status(id).unwrap()).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["result"], "x");
    assert_eq!(json["progress"], 100.0);
}

// ============================================================================
// Reaper
// ============================================================================

#[tokio::test]
async fn reap_now_keeps_recent_and_in_flight_tasks() {
    let manager = manager();
    let done = manager.create_task(async { Ok("done".to_string()) });
    let (release, gate) = oneshot::channel::<()>();
    let pending = manager.create_task(async move {
        let _ = gate.await;
        Ok(String::new())
    });
    wait_terminal(&manager, done).await;

    assert_eq!(manager.reap_now(), 0);
    assert!(manager.get_status(done).is_some());
    assert!(manager.get_status(pending).is_some());

    release.send(()).unwrap();
    wait_terminal(&manager, pending).await;
}

#[tokio::test]
async fn reaper_removes_entries_past_retention() {
    let manager: TaskManager<String> = TaskManager::new(
        TaskManagerConfig::new()
            .reap_interval(Duration::from_millis(20))
            .retention(Duration::from_millis(10)),
    );
    manager.start();

    let id = manager.create_task(async { Ok("old".to_string()) });
    wait_terminal(&manager, id).await;

    for _ in 0..200 {
        if manager.get_status(id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.get_status(id).is_none(), "reaper never removed the task");
    manager.stop().await;
}

#[tokio::test]
async fn start_twice_and_stop_twice_are_harmless() {
    let manager = manager();
    manager.start();
    manager.start();
    manager.stop().await;
    manager.stop().await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn stop_leaves_in_flight_tasks_running() {
    let manager = manager();
    manager.start();
    let (release, gate) = oneshot::channel::<()>();
    let id = manager.create_task(async move {
        let _ = gate.await;
        Ok("finished".to_string())
    });

    manager.stop().await;
    release.send(()).unwrap();
    wait_terminal(&manager, id).await;
    assert_eq!(manager.get_status(id).unwrap().status, TaskState::Completed);
}

#[tokio::test]
async fn cancelled_task_fails_with_cancelled_error() {
    let manager = manager();
    let id = manager.create_task(async {
        std::future::pending::<()>().await;
        Ok(String::new())
    });

    assert!(manager.cancel(id));
    wait_terminal(&manager, id).await;

    let status = manager.get_status(id).unwrap();
    assert_eq!(status.status, TaskState::Failed);
    assert_eq!(status.error.as_deref(), Some(CANCELLED_ERROR));
    assert_eq!(status.progress, 100.0);

    // Already finished.
    assert!(!manager.cancel(id));
}

#[tokio::test]
async fn shutdown_cancels_every_in_flight_task() {
    let manager = manager();
    manager.start();
    let ids: Vec<TaskId> = (0..3)
        .map(|_| {
            manager.create_task(async {
                std::future::pending::<()>().await;
                Ok(String::new())
            })
        })
        .collect();

    manager.shutdown().await;
    for id in ids {
        wait_terminal(&manager, id).await;
        assert_eq!(
            manager.get_status(id).unwrap().error.as_deref(),
            Some("task cancelled")
        );
    }
}

#[tokio::test]
async fn tasks_created_after_shutdown_still_run() {
    let manager = manager();
    let before = manager.create_task(async {
        std::future::pending::<()>().await;
        Ok(String::new())
    });
    manager.shutdown().await;
    wait_terminal(&manager, before).await;

    let after = manager.create_task(async { Ok("fresh".to_string()) });
    wait_terminal(&manager, after).await;
    let status = manager.get_status(after).unwrap();
    assert_eq!(status.status, TaskState::Completed);
    assert_eq!(status.result.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn progress_is_clamped_and_fractional() {
    let manager = manager();
    let (release, gate) = oneshot::channel::<()>();
    let id = manager.create_task(async move {
        let _ = gate.await;
        Ok("done".to_string())
    });

    assert!(manager.set_progress(id, 42.5));
    assert_eq!(manager.get_status(id).unwrap().progress, 42.5);
    assert!(manager.set_progress(id, 250.0));
    assert_eq!(manager.get_status(id).unwrap().progress, 100.0);
    assert!(manager.set_progress(id, -3.0));
    assert_eq!(manager.get_status(id).unwrap().progress, 0.0);
    assert!(!manager.set_progress(id, f32::NAN));
    assert!(!manager.set_progress(uuid::Uuid::new_v4(), 10.0));

    release.send(()).unwrap();
    wait_terminal(&manager, id).await;
    assert!(!manager.set_progress(id, 10.0));
    assert_eq!(manager.get_status(id).unwrap().progress, 100.0);
}
