use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine_shared::task::TaskStatus;

use crate::account_pool::AccountPool;
use crate::scheduler::{SchedulerRoutine, TaskHandle};
use crate::session_pool::SessionPool;
use crate::store::{DurableStore, MemoryStore};
use crate::testing::{sample_account, MockBackend, MockDriverFactory};

use super::{payload, record, test_config};

fn stack(accounts: Vec<engine_shared::account::Account>) -> (Arc<dyn DurableStore>, Arc<AccountPool>, Arc<SessionPool<MockBackend>>) {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::default());
    let account_pool = Arc::new(AccountPool::new(accounts));
    let session_pool = SessionPool::new(Arc::new(MockBackend::new()), Arc::clone(&account_pool), 0, 2);
    (store, account_pool, session_pool)
}

/// S1-style scenario: an immediately-runnable task whose driver reaches its
/// target inside the first batch completes with the aggregated count, and
/// the post-target-reached guard (§4.4: only honored once `batch_index > 0`)
/// means exactly one driver invocation ran.
#[tokio::test]
async fn immediate_run_completes_once_target_is_reached() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_millis(10)));
    let batches_run = Arc::clone(&driver_factory.batches_run);

    let routine = Arc::new(SchedulerRoutine {
        store: Arc::clone(&store),
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let rec = record("0000000001", TaskStatus::Pending, payload("MX", 100, 6), None);
    let handle = Arc::new(TaskHandle::new(rec));
    routine.run(Arc::clone(&handle)).await;

    let final_record = handle.record.lock().await.clone();
    assert_eq!(final_record.status, TaskStatus::Completed);
    assert_eq!(final_record.new_creators, 6);
    assert_eq!(batches_run.load(Ordering::SeqCst), 1);

    let persisted = store.get("0000000001").await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::Completed);
}

/// A deadline reached mid-run cancels the task well before the driver's own
/// (much longer) batch delay would have finished it.
#[tokio::test]
async fn deadline_watcher_cancels_a_slow_running_batch() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_secs(5)));

    let routine = Arc::new(SchedulerRoutine {
        store,
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let mut rec = record("0000000002", TaskStatus::Pending, payload("MX", 100, 6), None);
    rec.run_end_time_utc = Some(Utc::now() + chrono::Duration::milliseconds(200));
    let handle = Arc::new(TaskHandle::new(rec));

    let run = tokio::time::timeout(Duration::from_secs(3), routine.run(Arc::clone(&handle))).await;
    assert!(run.is_ok(), "scheduler should finish well inside the deadline-driven cancel path");

    let final_record = handle.record.lock().await.clone();
    assert_eq!(final_record.status, TaskStatus::Cancelled);
}

/// ForceCancel always wins, even over a driver that reported success.
#[tokio::test]
async fn force_terminated_overrides_a_successful_batch_result() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_millis(10)));

    let routine = Arc::new(SchedulerRoutine {
        store,
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let rec = record("0000000003", TaskStatus::Pending, payload("MX", 100, 6), None);
    let handle = Arc::new(TaskHandle::new(rec));
    handle.force_terminated.store(true, Ordering::SeqCst);

    routine.run(Arc::clone(&handle)).await;

    let final_record = handle.record.lock().await.clone();
    assert_eq!(final_record.status, TaskStatus::Cancelled);
    assert_eq!(final_record.message, "force-cancelled");
}

/// No enabled account for the task's region fails the run outright rather
/// than blocking forever.
#[tokio::test]
async fn missing_account_for_region_fails_the_task() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "BR")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_millis(10)));

    let routine = Arc::new(SchedulerRoutine {
        store,
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let rec = record("0000000004", TaskStatus::Pending, payload("MX", 100, 6), None);
    let handle = Arc::new(TaskHandle::new(rec));
    routine.run(Arc::clone(&handle)).await;

    let final_record = handle.record.lock().await.clone();
    assert_eq!(final_record.status, TaskStatus::Failed);
}

/// A task scheduled a moment into the future is observed passing through
/// `to-be-run` before `running`, and the account is only taken once it
/// actually starts.
#[tokio::test]
async fn scheduled_run_passes_through_to_be_run_before_running() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_millis(10)));

    let routine = Arc::new(SchedulerRoutine {
        store: Arc::clone(&store),
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let run_at = Utc::now() + chrono::Duration::milliseconds(150);
    let rec = record("0000000005", TaskStatus::Pending, payload("MX", 100, 6), Some(run_at));
    let handle = Arc::new(TaskHandle::new(rec));

    let run_handle = tokio::spawn({
        let routine = Arc::clone(&routine);
        let handle = Arc::clone(&handle);
        async move { routine.run(handle).await }
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(handle.record.lock().await.status, TaskStatus::Pending);

    tokio::time::sleep(Duration::from_millis(140)).await;
    let status_while_starting = handle.record.lock().await.status;
    assert!(matches!(status_while_starting, TaskStatus::ToBeRun | TaskStatus::Running));

    run_handle.await.unwrap();
    assert_eq!(handle.record.lock().await.status, TaskStatus::Completed);
}

/// §4.4: a driver reporting `restart_requested` bypasses the min-batch-new
/// exhaustion-stop entirely (mirroring the original's `continue`), so a
/// batch yielding fewer new creators than the threshold still spins up a
/// fresh driver instance for another batch instead of stopping the run.
#[tokio::test]
async fn restart_requested_bypasses_the_exhaustion_stop() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory {
        new_per_batch: 2,
        scanned_per_batch: 3,
        batch_delay: Duration::from_millis(5),
        success: true,
        restart_requested: true,
        batches_run: Arc::new(std::sync::atomic::AtomicU32::new(0)),
    });
    let batches_run = Arc::clone(&driver_factory.batches_run);

    let routine = Arc::new(SchedulerRoutine {
        store: Arc::clone(&store),
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let rec = record("0000000007", TaskStatus::Pending, payload("MX", 100, 100), None);
    let handle = Arc::new(TaskHandle::new(rec));

    let run = tokio::time::timeout(Duration::from_secs(3), routine.run(Arc::clone(&handle))).await;
    assert!(run.is_ok(), "restart-requested batches should still finish well inside the max-batches ceiling");

    // min_batch_new_threshold is 5 and each batch only yields 2 new creators,
    // so without the restart-requested bypass the loop would stop after the
    // first batch; with it, the run keeps going until max_batches is hit.
    assert!(batches_run.load(Ordering::SeqCst) >= 2, "restart_requested should carry the loop past the threshold-stop into a second batch");

    let final_record = handle.record.lock().await.clone();
    assert_eq!(final_record.status, TaskStatus::Completed);
}

/// A Cancel delivered before the scheduled start time fires finalizes
/// straight to `cancelled` without ever touching the Account Pool.
#[tokio::test]
async fn cancel_before_scheduled_start_skips_the_run_entirely() {
    let (store, account_pool, session_pool) = stack(vec![sample_account(0, "MX")]);
    let driver_factory = Arc::new(MockDriverFactory::new(6, Duration::from_millis(10)));
    let batches_run = Arc::clone(&driver_factory.batches_run);

    let routine = Arc::new(SchedulerRoutine {
        store,
        account_pool,
        session_pool,
        driver_factory,
        config: test_config(),
    });

    let run_at = Utc::now() + chrono::Duration::seconds(30);
    let rec = record("0000000006", TaskStatus::Pending, payload("MX", 100, 6), Some(run_at));
    let handle = Arc::new(TaskHandle::new(rec));

    handle.cancel.cancel();
    let run = tokio::time::timeout(Duration::from_secs(2), routine.run(Arc::clone(&handle))).await;
    assert!(run.is_ok());

    assert_eq!(handle.record.lock().await.status, TaskStatus::Cancelled);
    assert_eq!(batches_run.load(Ordering::SeqCst), 0);
}
