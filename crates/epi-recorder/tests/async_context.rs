// crates/epi-recorder/tests/async_context.rs
// ============================================================================
// Module: Async Session Context Tests
// Description: Tests for current-session resolution under cooperative suspension.
// ============================================================================
//! ## Overview
//! Exercises `record_async` across yields, sibling futures, nested scopes,
//! local task sets, worker threads, and cancellation.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::path::Path;
use std::time::Duration;

use epi_core::KeyManager;
use epi_core::StepRecord;
use epi_core::read_steps;
use epi_core::verify_integrity;
use epi_recorder::RecordError;
use epi_recorder::RecordOptions;
use epi_recorder::Recorder;
use epi_recorder::get_current_session;
use epi_recorder::log_step;
use serde_json::json;
use tempfile::TempDir;
use tokio::task::LocalSet;
use tokio::task::spawn_local;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio::time::timeout;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn recorder(root: &Path) -> Recorder {
    Recorder::new(KeyManager::new(root.join("keys")))
        .with_output_dir(root.join("out"))
        .with_staging_root(root.join("staging"))
}

fn kinds(archive: &Path) -> Vec<String> {
    read_steps(archive).unwrap().into_iter().map(|step| step.kind.as_str().to_string()).collect()
}

fn end_step(archive: &Path) -> StepRecord {
    read_steps(archive).unwrap().into_iter().find(|step| step.kind.as_str() == "session.end").unwrap()
}

// ============================================================================
// SECTION: Suspension
// ============================================================================

#[tokio::test]
async fn session_stays_current_across_suspension() {
    let dir = TempDir::new().unwrap();
    let recorded = recorder(dir.path())
        .record_async(RecordOptions::new().goal("async"), |session| async move {
            assert!(get_current_session().unwrap().same_session(&session));
            log_step("before.yield", json!(null)).unwrap();
            yield_now().await;
            sleep(Duration::from_millis(5)).await;
            assert!(get_current_session().unwrap().same_session(&session));
            log_step("after.yield", json!(null)).unwrap();
            7
        })
        .await
        .unwrap();

    assert_eq!(recorded.value, 7);
    let archive = recorded.archive.unwrap();
    let kinds = kinds(&archive);
    assert!(kinds.contains(&"before.yield".to_string()));
    assert!(kinds.contains(&"after.yield".to_string()));
    assert!(verify_integrity(&archive).unwrap().ok());
    assert!(get_current_session().is_none());
}

#[tokio::test]
async fn session_does_not_leak_into_sibling_futures() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());

    let recording = recorder.record_async(RecordOptions::new().output("scoped"), |session| async move {
        sleep(Duration::from_millis(30)).await;
        assert!(get_current_session().unwrap().same_session(&session));
        log_step("scoped.step", json!(null)).unwrap();
    });
    let sibling = async {
        sleep(Duration::from_millis(5)).await;
        let seen = get_current_session().is_some();
        log_step("sibling.step", json!(null)).unwrap();
        seen
    };
    let (recorded, sibling_saw_session) = tokio::join!(recording, sibling);

    assert!(!sibling_saw_session);
    let kinds = kinds(&recorded.unwrap().archive.unwrap());
    assert!(kinds.contains(&"scoped.step".to_string()));
    assert!(!kinds.contains(&"sibling.step".to_string()));
}

#[tokio::test]
async fn concurrent_sibling_sessions_stay_isolated() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());

    let body = |label: &'static str| {
        move |session: epi_recorder::Session| async move {
            for _ in 0..5 {
                assert!(get_current_session().unwrap().same_session(&session));
                log_step(label, json!(null)).unwrap();
                yield_now().await;
            }
        }
    };
    let (left, right) = tokio::join!(
        recorder.record_async(RecordOptions::new().output("left"), body("left.step")),
        recorder.record_async(RecordOptions::new().output("right"), body("right.step")),
    );

    let left = kinds(&left.unwrap().archive.unwrap());
    let right = kinds(&right.unwrap().archive.unwrap());
    assert_eq!(left.iter().filter(|kind| *kind == "left.step").count(), 5);
    assert!(!left.contains(&"right.step".to_string()));
    assert_eq!(right.iter().filter(|kind| *kind == "right.step").count(), 5);
    assert!(!right.contains(&"left.step".to_string()));
}

// ============================================================================
// SECTION: Nesting
// ============================================================================

#[tokio::test]
async fn nested_async_scopes_restore_outer_session() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());
    let inner_recorder = recorder.clone();

    let outer = recorder
        .record_async(RecordOptions::new().output("outer"), |outer| async move {
            let inner = inner_recorder
                .record_async(RecordOptions::new().output("inner"), |inner| async move {
                    assert!(get_current_session().unwrap().same_session(&inner));
                    yield_now().await;
                    log_step("inner.step", json!(null)).unwrap();
                })
                .await
                .unwrap();
            assert!(get_current_session().unwrap().same_session(&outer));
            log_step("outer.after", json!(null)).unwrap();
            inner.archive.unwrap()
        })
        .await
        .unwrap();

    let inner_kinds = kinds(&outer.value);
    assert!(inner_kinds.contains(&"inner.step".to_string()));
    assert!(!inner_kinds.contains(&"outer.after".to_string()));
    let outer_kinds = kinds(&outer.archive.unwrap());
    assert!(outer_kinds.contains(&"outer.after".to_string()));
    assert!(!outer_kinds.contains(&"inner.step".to_string()));
}

#[tokio::test]
async fn sync_recording_inside_async_scope_is_innermost() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());
    let sync_recorder = recorder.clone();

    let outer = recorder
        .record_async(RecordOptions::new().output("outer"), |outer| async move {
            let archive = {
                let recording = sync_recorder.start(RecordOptions::new().output("sync")).unwrap();
                assert!(get_current_session().unwrap().same_session(recording.session()));
                log_step("sync.step", json!(null)).unwrap();
                recording.finish().unwrap()
            };
            yield_now().await;
            assert!(get_current_session().unwrap().same_session(&outer));
            archive
        })
        .await
        .unwrap();

    assert!(kinds(&outer.value).contains(&"sync.step".to_string()));
    assert!(!kinds(&outer.archive.unwrap()).contains(&"sync.step".to_string()));
}

#[tokio::test]
async fn detached_recording_is_refused_on_runtime_threads() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());

    let holder = async {
        let started = recorder.start(RecordOptions::new().output("held"));
        yield_now().await;
        yield_now().await;
        started.map(epi_recorder::Recording::finish)
    };
    let sibling = async {
        yield_now().await;
        get_current_session()
    };
    let (started, seen) = tokio::join!(holder, sibling);

    assert!(matches!(started, Err(RecordError::AsyncContext)));
    assert!(seen.is_none());
    assert!(!dir.path().join("out").join("held.epi").exists());
}

// ============================================================================
// SECTION: Local Task Sets
// ============================================================================

#[tokio::test]
async fn local_tasks_keep_their_own_sessions() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());
    let local = LocalSet::new();

    let (archives, observer_saw_session) = local
        .run_until(async {
            let handles: Vec<_> = ["alpha", "beta"]
                .into_iter()
                .map(|label| {
                    let recorder = recorder.clone();
                    spawn_local(async move {
                        recorder
                            .record_async(RecordOptions::new().output(label), |session| async move {
                                let kind = format!("{label}.step");
                                for _ in 0..3 {
                                    yield_now().await;
                                    assert!(get_current_session().unwrap().same_session(&session));
                                    log_step(&kind, json!(null)).unwrap();
                                }
                            })
                            .await
                            .unwrap()
                            .archive
                            .unwrap()
                    })
                })
                .collect();
            let observer = spawn_local(async {
                yield_now().await;
                yield_now().await;
                get_current_session().is_some()
            });
            let mut archives = Vec::new();
            for handle in handles {
                archives.push(handle.await.unwrap());
            }
            (archives, observer.await.unwrap())
        })
        .await;

    assert!(!observer_saw_session);
    let alpha = kinds(&archives[0]);
    let beta = kinds(&archives[1]);
    assert_eq!(alpha.iter().filter(|kind| *kind == "alpha.step").count(), 3);
    assert!(!alpha.contains(&"beta.step".to_string()));
    assert_eq!(beta.iter().filter(|kind| *kind == "beta.step").count(), 3);
    assert!(!beta.contains(&"alpha.step".to_string()));
}

#[test]
fn local_tasks_do_not_resolve_thread_scope_of_caller() {
    let dir = TempDir::new().unwrap();
    let recorded = recorder(dir.path())
        .record(RecordOptions::new().output("thread"), |session| {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let local = LocalSet::new();
            local.block_on(&runtime, async {
                let root_saw_session =
                    get_current_session().is_some_and(|current| current.same_session(session));
                let spawned = spawn_local(async {
                    yield_now().await;
                    get_current_session().is_some()
                });
                (root_saw_session, spawned.await.unwrap())
            })
        })
        .unwrap();

    let (root_saw_session, task_saw_session) = recorded.value;
    assert!(root_saw_session);
    assert!(!task_saw_session);
    assert!(recorded.archive.is_ok());
}

// ============================================================================
// SECTION: Worker Threads
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_tasks_own_independent_sessions() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let recorder = recorder.clone();
            tokio::spawn(async move {
                let label = format!("task.{index}");
                recorder
                    .record_async(RecordOptions::new().output(format!("task-{index}")), |session| {
                        async move {
                            for _ in 0..5 {
                                sleep(Duration::from_millis(1)).await;
                                assert!(get_current_session().unwrap().same_session(&session));
                                log_step(&label, json!(index)).unwrap();
                            }
                        }
                    })
                    .await
                    .unwrap()
                    .archive
                    .unwrap()
            })
        })
        .collect();

    for (index, handle) in handles.into_iter().enumerate() {
        let archive = handle.await.unwrap();
        let own = format!("task.{index}");
        let user: Vec<_> = kinds(&archive).into_iter().filter(|kind| kind.starts_with("task.")).collect();
        assert_eq!(user.len(), 5);
        assert!(user.iter().all(|kind| *kind == own));
    }
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

#[tokio::test]
async fn cancelled_recording_still_finalizes() {
    let dir = TempDir::new().unwrap();
    let recorder = recorder(dir.path());
    let output = dir.path().join("out").join("cancelled.epi");

    let pending = recorder.record_async(RecordOptions::new().output(&output), |session| async move {
        session.log_step("started", json!(null)).unwrap();
        sleep(Duration::from_secs(60)).await;
    });
    assert!(timeout(Duration::from_millis(20), pending).await.is_err());

    assert!(output.is_file());
    assert_eq!(end_step(&output).content["outcome"], json!("dropped"));
    assert!(kinds(&output).contains(&"started".to_string()));
    assert!(get_current_session().is_none());
}
