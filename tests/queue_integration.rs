//! End-to-end queue scenarios against an in-memory store and a fake
//! platform: retries, cancellation, ranges, recovery, session holds,
//! concurrency ceilings and delivery settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, watch};
use uuid::Uuid;

use save_restricted_bot::clock::{Clock, ManualClock, SystemClock};
use save_restricted_bot::config::QueueConfig;
use save_restricted_bot::error::{ChannelError, ErrorClass, PlatformError, QueueError};
use save_restricted_bot::platform::{
    ClientPool, Deliverer, DownloadStream, ItemMetadata, MediaKind, PlatformClient,
    PlatformConnector,
};
use save_restricted_bot::progress::{Notifier, ProgressReporter, TaskEvent};
use save_restricted_bot::queue::{BatchRequest, ChatRef, QueueEngine, SourceRef, TaskState};
use save_restricted_bot::settings::FileCategory;
use save_restricted_bot::store::{LibSqlBackend, SessionStore, SettingsStore, TaskStore};
use save_restricted_bot::vault::{CredentialVault, Credentials};

/// Maximum time any test is allowed to wait for the queue.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const CHUNK: usize = 1024;
const OWNER: i64 = 42;

/// Message ids the fake platform treats specially.
const MISSING_MESSAGE: i64 = 404;
const EXPIRED_SESSION_MESSAGE: i64 = 401;

// ── Fakes ───────────────────────────────────────────────────────────

struct FakePlatform {
    fetch_calls: AtomicU32,
    /// Transient failures still to inject before fetches succeed.
    transient_failures: AtomicU32,
    chunks: usize,
    chunk_delay: Duration,
}

impl FakePlatform {
    fn new(chunks: usize, chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fetch_calls: AtomicU32::new(0),
            transient_failures: AtomicU32::new(0),
            chunks,
            chunk_delay,
        })
    }

    fn fail_next(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn fetch(&self, source: &SourceRef) -> Result<ItemMetadata, PlatformError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(PlatformError::Transient {
                reason: "connection reset".into(),
            });
        }
        match source.message_id {
            MISSING_MESSAGE => Err(PlatformError::NotFound {
                what: source.to_string(),
            }),
            EXPIRED_SESSION_MESSAGE => Err(PlatformError::SessionExpired { user_id: OWNER }),
            _ => Ok(ItemMetadata {
                source: source.clone(),
                kind: MediaKind::Document,
                file_name: Some(format!("file_{}.bin", source.message_id)),
                file_size: Some((self.chunks * CHUNK) as u64),
                mime_type: None,
                caption: None,
                text: None,
                file_ref: Some("ref".into()),
            }),
        }
    }

    async fn download(&self, _item: &ItemMetadata) -> Result<DownloadStream, PlatformError> {
        let n = self.chunks;
        let delay = self.chunk_delay;
        let chunks = futures::stream::unfold(0usize, move |i| async move {
            if i >= n {
                return None;
            }
            tokio::time::sleep(delay).await;
            Some((Ok(vec![7u8; CHUNK]), i + 1))
        })
        .boxed();
        Ok(DownloadStream {
            total: Some((n * CHUNK) as u64),
            chunks,
        })
    }
}

struct FakeConnector {
    platform: Arc<FakePlatform>,
}

#[async_trait]
impl PlatformConnector for FakeConnector {
    async fn authenticate(
        &self,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let client: Arc<dyn PlatformClient> = self.platform.clone();
        Ok(client)
    }
}

#[derive(Default)]
struct RecordingDeliverer {
    delivered: Mutex<Vec<(i64, SourceRef, usize)>>,
    /// How long each delivery takes.
    delay: Duration,
}

impl RecordingDeliverer {
    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(
        &self,
        chat_id: i64,
        item: &ItemMetadata,
        bytes: Vec<u8>,
    ) -> Result<(), PlatformError> {
        tokio::time::sleep(self.delay).await;
        self.delivered
            .lock()
            .await
            .push((chat_id, item.source.clone(), bytes.len()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    engine: Arc<QueueEngine>,
    store: Arc<LibSqlBackend>,
    platform: Arc<FakePlatform>,
    deliverer: Arc<RecordingDeliverer>,
    shutdown: watch::Sender<bool>,
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        max_concurrent_downloads: 4,
        max_user_concurrent_downloads: 2,
        rate_limit_per_sec: 1000.0,
        rate_limit_burst: 1000,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        ..QueueConfig::default()
    }
}

async fn harness(platform: Arc<FakePlatform>, clock: Arc<dyn Clock>) -> Harness {
    harness_with(
        platform,
        clock,
        fast_config(),
        Arc::new(RecordingDeliverer::default()),
    )
    .await
}

async fn harness_with(
    platform: Arc<FakePlatform>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    deliverer: Arc<RecordingDeliverer>,
) -> Harness {
    config.validate().unwrap();
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let sessions: Arc<dyn SessionStore> = store.clone();
    let settings: Arc<dyn SettingsStore> = store.clone();
    let vault = CredentialVault::new(sessions, None);
    let pool = Arc::new(ClientPool::new(
        Arc::new(FakeConnector {
            platform: platform.clone(),
        }),
        vault.clone(),
        Some(Credentials::new("bot-token")),
        Arc::clone(&clock),
        config.platform_timeout,
    ));
    let engine = Arc::new(QueueEngine::new(
        store.clone(),
        settings,
        vault,
        pool,
        deliverer.clone(),
        clock,
        config,
    ));
    let (shutdown, _) = watch::channel(false);
    Harness {
        engine,
        store,
        platform,
        deliverer,
        shutdown,
    }
}

impl Harness {
    async fn start(&self) {
        self.engine.start(self.shutdown.subscribe()).await.unwrap();
    }

    async fn wait_for_state(&self, id: Uuid, state: TaskState) {
        let waited = tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                if self.engine.get(id).await.unwrap().state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        let current = self.engine.get(id).await.unwrap().state;
        assert!(waited.is_ok(), "task {id} stuck in {current}, expected {state}");
    }

    /// Sample the queue until every task is terminal. Returns the highest
    /// number of workers seen at once, overall and for any single owner.
    async fn watch_until_drained(&self) -> (usize, usize) {
        let mut peak = 0;
        let mut peak_per_owner = 0;
        let drained = tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                peak = peak.max(self.engine.scheduler().running_count().await);
                let tasks = self.store.all_tasks().await.unwrap();
                let mut claimed: HashMap<i64, usize> = HashMap::new();
                for task in tasks.iter().filter(|t| t.state.is_claimed()) {
                    *claimed.entry(task.owner_user_id).or_default() += 1;
                }
                peak_per_owner = peak_per_owner.max(claimed.values().copied().max().unwrap_or(0));
                if tasks.iter().all(|t| t.state.is_terminal()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "queue did not drain");
        (peak, peak_per_owner)
    }
}

fn public(message_id: i64) -> SourceRef {
    SourceRef::new(ChatRef::Username("news".into()), message_id)
}

fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failure_is_retried_then_completes_once() {
    let platform = FakePlatform::new(4, Duration::ZERO);
    platform.fail_next(1);
    let h = harness(platform, Arc::new(SystemClock)).await;

    let notifier = Arc::new(RecordingNotifier::default());
    ProgressReporter::new(notifier.clone(), 5).spawn(h.engine.subscribe());
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(10)).await.unwrap();
    h.wait_for_state(id, TaskState::Completed).await;

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.bytes_done, (4 * CHUNK) as u64);
    assert!(task.claimed_by.is_none());
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 2);

    let delivered = h.deliverer.delivered.lock().await.clone();
    assert_eq!(delivered, vec![(7, public(10), 4 * CHUNK)]);

    // Let the reporter catch up, then count completion notices.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = notifier.sent.lock().await.clone();
    let completed = sent
        .iter()
        .filter(|(chat, text)| *chat == 7 && text.starts_with("✅ Completed"))
        .count();
    assert_eq!(completed, 1, "notifications: {sent:?}");
    assert!(sent.iter().any(|(_, text)| text.starts_with("🔁 Retrying")));
}

#[tokio::test]
async fn cancel_while_downloading_stops_the_worker() {
    let platform = FakePlatform::new(200, Duration::from_millis(20));
    let h = harness(platform, Arc::new(SystemClock)).await;
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(11)).await.unwrap();
    h.wait_for_state(id, TaskState::Downloading).await;

    h.engine.cancel(Some(OWNER), id).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, h.engine.scheduler().wait_idle())
        .await
        .unwrap();

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(h.deliverer.delivered.lock().await.is_empty());

    // A second cancel is refused as an invalid transition.
    let err = h.engine.cancel(Some(OWNER), id).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
}

#[tokio::test]
async fn cancelling_one_range_task_leaves_siblings() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;

    let ids = h
        .engine
        .enqueue_batch(
            OWNER,
            7,
            BatchRequest {
                chat: ChatRef::Username("news".into()),
                start: 100,
                end: 200,
            },
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 101);

    h.engine.cancel(Some(OWNER), ids[50]).await.unwrap();

    let pending = h
        .engine
        .list_tasks(Some(OWNER), Some(TaskState::Pending), 1000)
        .await
        .unwrap();
    assert_eq!(pending.len(), 100);
    assert!(pending.iter().all(|t| t.id != ids[50]));

    let status = h.engine.status(OWNER).await.unwrap();
    assert_eq!(status.batches.len(), 1);
    assert_eq!(status.batches[0].total, 101);
    assert_eq!(status.batches[0].remaining, 100);
}

#[tokio::test]
async fn cancel_by_another_user_is_refused() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    let id = h.engine.enqueue(OWNER, 7, public(12)).await.unwrap();

    let err = h.engine.cancel(Some(OWNER + 1), id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotOwner { .. }));
    assert_eq!(h.engine.get(id).await.unwrap().state, TaskState::Pending);
}

#[tokio::test]
async fn expired_lease_is_requeued_once() {
    let clock = ManualClock::new(Utc::now());
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(clock.clone())).await;
    let id = h.engine.enqueue(OWNER, 7, public(13)).await.unwrap();

    // A worker that claimed the task and then vanished.
    let now = clock.now();
    assert!(
        h.store
            .try_claim(id, "gone-1", now, now + chrono::Duration::seconds(120))
            .await
            .unwrap()
    );
    clock.advance(chrono::Duration::seconds(121));

    let mut events = h.engine.subscribe();
    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.requeued, 1);

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempt_count, 1);
    assert!(task.claimed_by.is_none());
    assert_eq!(drain(&mut events).len(), 1);

    // Nothing left to do: the second pass changes nothing and says nothing.
    let again = h.engine.recover().await.unwrap();
    assert!(again.is_empty());
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.engine.get(id).await.unwrap(), task);
}

#[tokio::test]
async fn lease_expiry_past_attempt_budget_fails_task() {
    let clock = ManualClock::new(Utc::now());
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(clock.clone())).await;
    let id = h.engine.enqueue(OWNER, 7, public(14)).await.unwrap();
    let max_attempts = h.engine.config().max_attempts;

    for round in 0..max_attempts {
        let now = clock.now();
        assert!(
            h.store
                .try_claim(id, &format!("gone-{round}"), now, now + chrono::Duration::seconds(1))
                .await
                .unwrap()
        );
        clock.advance(chrono::Duration::seconds(2));
        h.engine.recover().await.unwrap();
    }

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempt_count, max_attempts);
}

#[tokio::test]
async fn missing_message_fails_without_retry() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(MISSING_MESSAGE)).await.unwrap();
    h.wait_for_state(id, TaskState::Failed).await;

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.last_error.unwrap().class, ErrorClass::NotFound);
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 1);

    // An admin retry gives it a fresh budget; it fails the same way.
    h.engine.retry(id).await.unwrap();
    h.wait_for_state(id, TaskState::Failed).await;
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_session_holds_tasks_without_consuming_attempts() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    h.start().await;

    let id = h
        .engine
        .enqueue(OWNER, 7, public(EXPIRED_SESSION_MESSAGE))
        .await
        .unwrap();

    let held = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if h.engine.status(OWNER).await.unwrap().held {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(held.is_ok(), "user never put on hold");
    tokio::time::timeout(TEST_TIMEOUT, h.engine.scheduler().wait_idle())
        .await
        .unwrap();

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.last_error.unwrap().class, ErrorClass::SessionExpired);

    // Held users are not dispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 1);
    let stats = h.engine.admin_stats().await.unwrap();
    assert_eq!(stats.held_users, vec![OWNER]);
}

#[tokio::test]
async fn paused_user_is_not_dispatched_until_resumed() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    assert!(h.engine.pause(OWNER).await);
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(15)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.get(id).await.unwrap().state, TaskState::Pending);
    assert!(h.engine.status(OWNER).await.unwrap().paused);

    assert!(h.engine.resume(OWNER).await);
    h.wait_for_state(id, TaskState::Completed).await;
}

#[tokio::test]
async fn private_source_requires_login() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    let err = h
        .engine
        .enqueue(OWNER, 7, SourceRef::new(ChatRef::Id(-1001234), 5))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LoginRequired));
    assert!(h.store.all_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn lease_is_renewed_while_delivery_is_slow() {
    let config = QueueConfig {
        lease_duration: Duration::from_millis(300),
        store_timeout: Duration::from_millis(100),
        recovery_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let h = harness_with(
        FakePlatform::new(1, Duration::ZERO),
        Arc::new(SystemClock),
        config,
        RecordingDeliverer::slow(Duration::from_secs(1)),
    )
    .await;
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(30)).await.unwrap();
    h.wait_for_state(id, TaskState::Completed).await;
    // Recovery keeps running; nothing may be requeued after the fact either.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempt_count, 0);
    assert!(task.last_error.is_none());
    assert_eq!(h.deliverer.delivered.lock().await.len(), 1);
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refused_lease_renewal_abandons_the_attempt() {
    let config = QueueConfig {
        lease_duration: Duration::from_millis(300),
        store_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let h = harness_with(
        FakePlatform::new(1, Duration::ZERO),
        Arc::new(SystemClock),
        config,
        RecordingDeliverer::slow(Duration::from_secs(3)),
    )
    .await;
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(31)).await.unwrap();
    h.wait_for_state(id, TaskState::Uploading).await;

    // Take the claim away without telling the worker.
    assert!(h.store.cancel(id, None, Utc::now()).await.unwrap());
    tokio::time::timeout(Duration::from_secs(1), h.engine.scheduler().wait_idle())
        .await
        .expect("worker kept running after losing its claim");

    assert_eq!(h.engine.get(id).await.unwrap().state, TaskState::Cancelled);
    assert!(h.deliverer.delivered.lock().await.is_empty());
}

#[tokio::test]
async fn per_user_ceiling_holds_under_load() {
    let h = harness(FakePlatform::new(10, Duration::from_millis(20)), Arc::new(SystemClock)).await;
    for message_id in 40..50 {
        h.engine.enqueue(OWNER, 7, public(message_id)).await.unwrap();
    }
    h.start().await;

    let (peak, peak_per_owner) = h.watch_until_drained().await;
    assert_eq!(peak, 2);
    assert_eq!(peak_per_owner, 2);
    assert_eq!(h.deliverer.delivered.lock().await.len(), 10);
}

#[tokio::test]
async fn global_ceiling_holds_across_users() {
    let config = QueueConfig {
        max_concurrent_downloads: 3,
        ..fast_config()
    };
    let h = harness_with(
        FakePlatform::new(10, Duration::from_millis(20)),
        Arc::new(SystemClock),
        config,
        Arc::new(RecordingDeliverer::default()),
    )
    .await;
    for owner in [OWNER, OWNER + 1, OWNER + 2] {
        for message_id in 50..54 {
            h.engine.enqueue(owner, owner, public(message_id)).await.unwrap();
        }
    }
    h.start().await;

    let (peak, peak_per_owner) = h.watch_until_drained().await;
    assert_eq!(peak, 3);
    assert!(peak_per_owner <= 2, "one user ran {peak_per_owner} at once");
    assert_eq!(h.deliverer.delivered.lock().await.len(), 12);
}

#[tokio::test]
async fn held_session_times_out_into_failures() {
    let clock = ManualClock::new(Utc::now());
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(clock.clone())).await;
    h.start().await;

    let expired = h
        .engine
        .enqueue(OWNER, 7, public(EXPIRED_SESSION_MESSAGE))
        .await
        .unwrap();
    let held = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if h.engine.status(OWNER).await.unwrap().held {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(held.is_ok(), "user never put on hold");
    tokio::time::timeout(TEST_TIMEOUT, h.engine.scheduler().wait_idle())
        .await
        .unwrap();
    let waiting = h.engine.enqueue(OWNER, 7, public(60)).await.unwrap();

    // Still inside the hold window: nothing changes.
    clock.advance(chrono::Duration::hours(1));
    assert!(h.engine.recover().await.unwrap().is_empty());
    assert_eq!(h.engine.get(waiting).await.unwrap().state, TaskState::Pending);

    let hold = chrono::Duration::from_std(h.engine.config().session_hold_timeout).unwrap();
    clock.advance(hold);
    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.session_failures, 2);

    for id in [expired, waiting] {
        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.last_error.unwrap().class, ErrorClass::SessionExpired);
    }
    assert!(!h.engine.status(OWNER).await.unwrap().held);
    assert!(h.engine.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_all_stops_running_and_queued_tasks() {
    let h = harness(FakePlatform::new(200, Duration::from_millis(20)), Arc::new(SystemClock)).await;
    let bystander = OWNER + 1;
    assert!(h.engine.pause(bystander).await);
    let other = h.engine.enqueue(bystander, bystander, public(70)).await.unwrap();

    let mut ids = Vec::new();
    for message_id in 71..76 {
        ids.push(h.engine.enqueue(OWNER, 7, public(message_id)).await.unwrap());
    }
    let mut events = h.engine.subscribe();
    h.start().await;
    h.wait_for_state(ids[0], TaskState::Downloading).await;

    assert_eq!(h.engine.cancel_all(OWNER).await.unwrap(), 5);
    tokio::time::timeout(TEST_TIMEOUT, h.engine.scheduler().wait_idle())
        .await
        .unwrap();

    for id in &ids {
        assert_eq!(h.engine.get(*id).await.unwrap().state, TaskState::Cancelled);
    }
    assert_eq!(h.engine.get(other).await.unwrap().state, TaskState::Pending);
    assert!(h.deliverer.delivered.lock().await.is_empty());
    assert_eq!(h.engine.cancel_all(OWNER).await.unwrap(), 0);

    let announced = drain(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                TaskEvent::StateChanged {
                    state: TaskState::Cancelled,
                    ..
                }
            )
        })
        .count();
    assert!((1..=2).contains(&announced), "announced {announced} running tasks");
}

#[tokio::test]
async fn filtered_file_types_are_skipped_not_retried() {
    let h = harness(FakePlatform::new(2, Duration::ZERO), Arc::new(SystemClock)).await;
    h.engine
        .set_filter(OWNER, FileCategory::Document, true)
        .await
        .unwrap();
    h.start().await;

    let id = h.engine.enqueue(OWNER, 7, public(80)).await.unwrap();
    h.wait_for_state(id, TaskState::Failed).await;

    let task = h.engine.get(id).await.unwrap();
    assert_eq!(task.attempt_count, 0);
    let error = task.last_error.unwrap();
    assert_eq!(error.class, ErrorClass::Filtered);
    assert!(error.message.contains("document"), "{}", error.message);
    assert_eq!(task.bytes_done, 0);
    assert!(h.deliverer.delivered.lock().await.is_empty());
    assert_eq!(h.platform.fetch_calls.load(Ordering::SeqCst), 1);

    // Switching the type back on and retrying delivers it.
    h.engine
        .set_filter(OWNER, FileCategory::Document, false)
        .await
        .unwrap();
    h.engine.retry(id).await.unwrap();
    h.wait_for_state(id, TaskState::Completed).await;
    assert_eq!(h.deliverer.delivered.lock().await.len(), 1);
}

#[tokio::test]
async fn target_chat_is_fixed_at_enqueue() {
    let h = harness(FakePlatform::new(1, Duration::ZERO), Arc::new(SystemClock)).await;
    let channel = -100_900;
    h.engine
        .set_target_chat(OWNER, Some(channel))
        .await
        .unwrap();
    let redirected = h.engine.enqueue(OWNER, 7, public(90)).await.unwrap();
    let batch = h
        .engine
        .enqueue_batch(
            OWNER,
            7,
            BatchRequest {
                chat: ChatRef::Username("news".into()),
                start: 91,
                end: 92,
            },
        )
        .await
        .unwrap();

    h.engine.set_target_chat(OWNER, None).await.unwrap();
    let direct = h.engine.enqueue(OWNER, 7, public(93)).await.unwrap();

    let task = h.engine.get(redirected).await.unwrap();
    assert_eq!(task.chat_id, 7);
    assert_eq!(task.target_chat, Some(channel));
    assert_eq!(h.engine.get(direct).await.unwrap().target_chat, None);

    h.start().await;
    for id in [redirected, direct].iter().chain(&batch) {
        h.wait_for_state(*id, TaskState::Completed).await;
    }
    let mut delivered: Vec<(i64, i64)> = h
        .deliverer
        .delivered
        .lock()
        .await
        .iter()
        .map(|(chat, source, _)| (source.message_id, *chat))
        .collect();
    delivered.sort_unstable();
    assert_eq!(
        delivered,
        vec![(90, channel), (91, channel), (92, channel), (93, 7)]
    );
}
