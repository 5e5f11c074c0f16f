//! Task dispatcher: polls due tasks, claims them, hands the claims to
//! workers that run the matching handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::datastore::Datastore;

use super::protocol::{Claim, ProcessOutcome, ProtocolError, TaskHandler, TaskProtocol};
use super::types::{TaskKey, TaskKind};

/// Type-erased handler bound to a datastore.
#[async_trait]
trait TaskRunner<D>: Send + Sync {
    async fn run(&self, protocol: &TaskProtocol<D>, key: &TaskKey) -> Result<ProcessOutcome, ProtocolError>;
}

struct HandlerRunner<H>(H);

#[async_trait]
impl<D, H> TaskRunner<D> for HandlerRunner<H>
where
    D: Datastore,
    H: TaskHandler,
{
    async fn run(&self, protocol: &TaskProtocol<D>, key: &TaskKey) -> Result<ProcessOutcome, ProtocolError> {
        protocol.process(&self.0, key).await
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll for due tasks
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll
    pub batch_size: usize,
    /// Maximum tasks processed concurrently
    pub workers: usize,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            workers: 4,
            name: "task-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Counters over the dispatcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub committed: usize,
    pub stale: usize,
    pub failed: usize,
    /// Claimed tasks past their maximum age.
    pub expired: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.claimed += other.claimed;
        self.committed += other.committed;
        self.stale += other.stale;
        self.failed += other.failed;
        self.expired += other.expired;
    }

    fn record(&mut self, result: &Result<ProcessOutcome, ProtocolError>) {
        match result {
            Ok(ProcessOutcome::Committed { .. }) => self.committed += 1,
            Ok(ProcessOutcome::Stale { .. }) => self.stale += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatchReport>>,
}

impl DispatcherHandle {
    /// Stop polling, let in-flight tasks finish, then return the final counts.
    pub async fn shutdown(self) -> DispatchReport {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher loop terminated abnormally");
        }
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> DispatchReport {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes due tasks to the registered handlers.
pub struct Dispatcher<D> {
    protocol: TaskProtocol<D>,
    runners: HashMap<TaskKind, Arc<dyn TaskRunner<D>>>,
}

impl<D> Dispatcher<D>
where
    D: Datastore + 'static,
{
    pub fn new(protocol: TaskProtocol<D>) -> Self {
        Self {
            protocol,
            runners: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> &TaskProtocol<D> {
        &self.protocol
    }

    /// Register the handler for its task kind, replacing any previous one.
    pub fn register<H: TaskHandler>(&mut self, handler: H) -> &mut Self {
        let kind = handler.kind();
        if self.runners.insert(kind, Arc::new(HandlerRunner(handler))).is_some() {
            warn!(kind = %kind, "replaced task handler");
        }
        self
    }

    pub fn handles(&self, kind: TaskKind) -> bool {
        self.runners.contains_key(&kind)
    }

    /// Claim up to `limit` due tasks.
    ///
    /// Tasks without a registered handler are claimed too, so their lease
    /// moves them behind the handled ones; processing them reports
    /// `NoHandler`. A key that vanished between listing and claiming was
    /// finished by someone else and is skipped.
    pub async fn poll(&self, limit: usize) -> Result<Vec<Claim>, ProtocolError> {
        let mut claims = Vec::new();
        for key in self.protocol.list_due(limit).await? {
            if !self.handles(key.kind) {
                warn!(task = %key, "no handler for due task; leasing it out of the way");
            }
            match self.protocol.claim(&key).await {
                Ok(claim) => claims.push(claim),
                Err(ProtocolError::TaskNotFound(_)) => debug!(task = %key, "task gone before claim"),
                Err(e) => return Err(e),
            }
        }
        Ok(claims)
    }

    /// Process one claimed task.
    pub async fn process(&self, key: &TaskKey) -> Result<ProcessOutcome, ProtocolError> {
        let runner = self
            .runners
            .get(&key.kind)
            .ok_or(ProtocolError::NoHandler(key.kind))?;
        runner.run(&self.protocol, key).await
    }

    /// One poll, then process every claim in order.
    pub async fn run_once(&self, limit: usize) -> Result<DispatchReport, ProtocolError> {
        let claims = self.poll(limit).await?;
        let mut report = DispatchReport {
            claimed: claims.len(),
            expired: claims.iter().filter(|c| c.expired).count(),
            ..DispatchReport::default()
        };

        for claim in &claims {
            let result = self.process(&claim.key).await;
            log_result(&claim.key, &result);
            report.record(&result);
        }
        Ok(report)
    }

    /// Repeat `run_once` until nothing is due (tasks scheduled by a cascade
    /// at `now` are picked up by the next round).
    pub async fn run_until_idle(&self, limit: usize) -> Result<DispatchReport, ProtocolError> {
        const MAX_ROUNDS: usize = 64;

        let mut total = DispatchReport::default();
        for _ in 0..MAX_ROUNDS {
            let round = self.run_once(limit).await?;
            if round.claimed == 0 {
                break;
            }
            total.merge(round);
        }
        Ok(total)
    }

    /// Run the poll loop on the tokio runtime.
    pub fn spawn(self, config: DispatcherConfig) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DispatchReport::default()));
        let dispatcher = Arc::new(self);

        let join = tokio::spawn(dispatch_loop(dispatcher, config, shutdown_rx, Arc::clone(&stats)));

        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

fn log_result(key: &TaskKey, result: &Result<ProcessOutcome, ProtocolError>) {
    match result {
        Ok(ProcessOutcome::Committed { version }) => debug!(task = %key, version, "task done"),
        Ok(ProcessOutcome::Stale { current_version }) => {
            debug!(task = %key, current_version, "task discarded")
        }
        Err(e) if e.is_transient() => warn!(task = %key, error = %e, "task attempt failed; will retry"),
        Err(e) => error!(task = %key, error = %e, "task attempt failed"),
    }
}

fn update_stats(stats: &Mutex<DispatchReport>, f: impl FnOnce(&mut DispatchReport)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

async fn dispatch_loop<D>(
    dispatcher: Arc<Dispatcher<D>>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<DispatchReport>>,
) where
    D: Datastore + 'static,
{
    let workers = config.workers.max(1);
    let (queue_tx, queue_rx) = mpsc::channel::<Claim>(config.batch_size.max(1));

    info!(dispatcher = %config.name, workers, "task dispatcher started");

    let worker_pool = tokio::spawn(run_workers(
        Arc::clone(&dispatcher),
        queue_rx,
        workers,
        Arc::clone(&stats),
    ));

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let claims = match dispatcher.poll(config.batch_size).await {
            Ok(claims) => claims,
            Err(e) => {
                error!(dispatcher = %config.name, error = %e, "failed to poll due tasks");
                continue;
            }
        };

        update_stats(&stats, |s| {
            s.claimed += claims.len();
            s.expired += claims.iter().filter(|c| c.expired).count();
        });

        for claim in claims {
            if queue_tx.send(claim).await.is_err() {
                warn!(dispatcher = %config.name, "worker pool gone; stopping");
                return;
            }
        }
    }

    drop(queue_tx);
    if let Err(e) = worker_pool.await {
        error!(dispatcher = %config.name, error = %e, "worker pool terminated abnormally");
    }
    info!(dispatcher = %config.name, "task dispatcher stopped");
}

async fn run_workers<D>(
    dispatcher: Arc<Dispatcher<D>>,
    mut queue: mpsc::Receiver<Claim>,
    workers: usize,
    stats: Arc<Mutex<DispatchReport>>,
) where
    D: Datastore + 'static,
{
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(claim) = queue.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let dispatcher = Arc::clone(&dispatcher);
        let stats = Arc::clone(&stats);

        tokio::spawn(async move {
            let result = dispatcher.process(&claim.key).await;
            log_result(&claim.key, &result);
            update_stats(&stats, |s| s.record(&result));
            drop(permit);
        });
    }

    // Wait for in-flight tasks.
    let _ = permits.acquire_many(workers as u32).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use payrail_billing::BillingProfile;
    use payrail_core::{AccountId, Clock, Currency, ManualClock, VersionedEntity};

    use crate::datastore::{InMemoryDatastore, Transaction};
    use crate::entity_store::{EntityStore, EntityStoreExt};
    use crate::external::ExternalError;
    use crate::tasks::{BackoffPolicy, IdempotencyToken, Task, TaskStore, Transition};

    /// Counts sync calls for billing profiles; fails the first `failures` calls.
    struct CountingSync {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    #[async_trait]
    impl TaskHandler for CountingSync {
        type Entity = BillingProfile;
        type Context = ();
        type Effect = ();

        fn kind(&self) -> TaskKind {
            TaskKind::SyncBillingProfile
        }

        async fn load(
            &self,
            tx: &mut dyn EntityStore,
            key: &TaskKey,
        ) -> Result<(BillingProfile, ()), ProtocolError> {
            Ok((tx.get(AccountId::from(key.subject_id)).await?, ()))
        }

        async fn execute(
            &self,
            _key: &TaskKey,
            _entity: &BillingProfile,
            _context: &(),
            _token: &IdempotencyToken,
        ) -> Result<(), ExternalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ExternalError::Unavailable("sibling down".into()));
            }
            Ok(())
        }

        fn apply_transition(
            &self,
            _key: &TaskKey,
            _entity: &BillingProfile,
            _context: &(),
            _effect: (),
            _now: DateTime<Utc>,
        ) -> Result<Transition<BillingProfile>, ProtocolError> {
            Ok(Transition::none())
        }
    }

    async fn seed(store: &InMemoryDatastore, count: usize, now: DateTime<Utc>) -> Vec<TaskKey> {
        let mut keys = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for _ in 0..count {
            let profile = BillingProfile::create(AccountId::new(), Currency::new("USD").unwrap(), now, now);
            let key = TaskKey::versioned(TaskKind::SyncBillingProfile, profile.account_id, profile.version());
            tx.insert(&profile).await.unwrap();
            tx.insert_task(Task::new(key, now)).await.unwrap();
            keys.push(key);
        }
        tx.commit().await.unwrap();
        keys
    }

    fn dispatcher(store: &InMemoryDatastore, clock: &ManualClock) -> Dispatcher<InMemoryDatastore> {
        Dispatcher::new(TaskProtocol::new(
            store.clone(),
            BackoffPolicy::default(),
            Arc::new(clock.clone()),
        ))
    }

    #[tokio::test]
    async fn run_once_claims_and_processes_due_tasks() {
        let store = InMemoryDatastore::new();
        let clock = ManualClock::new(Utc::now());
        seed(&store, 3, clock.now()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(&store, &clock);
        dispatcher.register(CountingSync {
            calls: Arc::clone(&calls),
            failures: 0,
        });

        let report = dispatcher.run_once(10).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.committed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(store.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn failed_attempt_waits_for_backoff() {
        let store = InMemoryDatastore::new();
        let clock = ManualClock::new(Utc::now());
        seed(&store, 1, clock.now()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(&store, &clock);
        dispatcher.register(CountingSync {
            calls: Arc::clone(&calls),
            failures: 1,
        });

        let first = dispatcher.run_once(10).await.unwrap();
        assert_eq!(first.failed, 1);

        // Not visible again until the lease runs out.
        assert_eq!(dispatcher.run_once(10).await.unwrap().claimed, 0);

        clock.advance(chrono::Duration::minutes(5));
        let second = dispatcher.run_once(10).await.unwrap();
        assert_eq!(second.committed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tasks_without_handler_do_not_block_handled_ones() {
        let store = InMemoryDatastore::new();
        let clock = ManualClock::new(Utc::now());
        let earlier = clock.now() - chrono::Duration::minutes(1);

        let mut tx = store.begin().await.unwrap();
        for _ in 0..2 {
            let key = TaskKey::versioned(TaskKind::NotifyStatement, uuid::Uuid::now_v7(), 1);
            tx.insert_task(Task::new(key, earlier)).await.unwrap();
        }
        tx.commit().await.unwrap();
        seed(&store, 1, clock.now()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(&store, &clock);
        dispatcher.register(CountingSync {
            calls: Arc::clone(&calls),
            failures: 0,
        });

        // A batch smaller than the number of unhandled tasks.
        let first = dispatcher.run_once(2).await.unwrap();
        assert_eq!(first.claimed, 2);
        assert_eq!(first.failed, 2);

        let second = dispatcher.run_once(2).await.unwrap();
        assert_eq!(second.committed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let unhandled = store.tasks_of_kind(TaskKind::NotifyStatement).await;
        assert_eq!(unhandled.len(), 2);
        assert!(unhandled.iter().all(|t| t.retry_count == 1 && t.execution_time > clock.now()));

        match dispatcher
            .process(&TaskKey::new(TaskKind::CreateCustomer, uuid::Uuid::now_v7()))
            .await
            .unwrap_err()
        {
            ProtocolError::NoHandler(TaskKind::CreateCustomer) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_queue_and_shuts_down() {
        let store = InMemoryDatastore::new();
        let clock = ManualClock::new(Utc::now());
        seed(&store, 5, clock.now()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher(&store, &clock);
        dispatcher.register(CountingSync {
            calls: Arc::clone(&calls),
            failures: 0,
        });

        let handle = dispatcher.spawn(
            DispatcherConfig::default()
                .with_name("test-dispatcher")
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(10)),
        );

        for _ in 0..200 {
            if store.tasks().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert!(store.tasks().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(stats.claimed, 5);
    }
}
