use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::Utc;
use payrail_billing::PayoutProfile;
use payrail_core::{AccountId, Currency, SystemClock, UuidV7Generator, VersionedEntity};
use payrail_infra::datastore::{Datastore, InMemoryDatastore, Transaction};
use payrail_infra::entity_store::EntityStoreExt;
use payrail_infra::external::{FakeGateway, RecordingSibling};
use payrail_infra::kinds::register_all;
use payrail_infra::service::BillingService;
use payrail_infra::tasks::{BackoffPolicy, Dispatcher, Task, TaskKey, TaskKind, TaskProtocol, TaskStore};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn dispatcher(store: &InMemoryDatastore) -> Dispatcher<InMemoryDatastore> {
    let mut dispatcher = Dispatcher::new(TaskProtocol::new(
        store.clone(),
        BackoffPolicy::default(),
        Arc::new(SystemClock),
    ));
    register_all(
        &mut dispatcher,
        Arc::new(FakeGateway::new()),
        Arc::new(RecordingSibling::new()),
    );
    dispatcher
}

/// Payout profiles with their pending sync task.
async fn seed_sync_tasks(store: &InMemoryDatastore, count: usize) {
    let now = Utc::now();
    let mut tx = store.begin().await.unwrap();
    for i in 0..count {
        let profile = PayoutProfile::create(
            AccountId::new(),
            Currency::new("USD").unwrap(),
            format!("acct_{i}"),
            now,
        )
        .unwrap();
        let key = TaskKey::versioned(TaskKind::SyncPayoutProfile, profile.account_id, profile.version());
        tx.insert(&profile).await.unwrap();
        tx.insert_task(Task::new(key, now)).await.unwrap();
    }
    tx.commit().await.unwrap();
}

fn bench_claim_latency(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryDatastore::new();
    let protocol = TaskProtocol::new(store.clone(), BackoffPolicy::default(), Arc::new(SystemClock));
    let key = TaskKey::new(TaskKind::CreateCustomer, AccountId::new());
    rt.block_on(async {
        let mut tx = store.begin().await.unwrap();
        tx.insert_task(Task::new(key, Utc::now())).await.unwrap();
        tx.commit().await.unwrap();
    });

    let mut group = c.benchmark_group("claim_latency");
    group.sample_size(1000);
    group.bench_function("claim_existing_task", |b| {
        b.iter(|| rt.block_on(protocol.claim(black_box(&key))).unwrap())
    });
    group.finish();
}

fn bench_account_lifecycle(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("account_lifecycle");
    group.bench_function("create_link_and_sync_billing_profile", |b| {
        b.iter_batched(
            || {
                let store = InMemoryDatastore::new();
                let service = BillingService::new(
                    store.clone(),
                    Arc::new(SystemClock),
                    Arc::new(UuidV7Generator),
                );
                (service, dispatcher(&store))
            },
            |(service, dispatcher)| {
                rt.block_on(async {
                    service
                        .create_billing_profile(AccountId::new(), Currency::new("EUR").unwrap(), Utc::now())
                        .await
                        .unwrap();
                    dispatcher.run_until_idle(100).await.unwrap()
                })
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("dispatch_throughput");
    for batch_size in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &size| {
            b.iter_batched(
                || {
                    let store = InMemoryDatastore::new();
                    rt.block_on(seed_sync_tasks(&store, size));
                    dispatcher(&store)
                },
                |dispatcher| {
                    let report = rt.block_on(dispatcher.run_once(size)).unwrap();
                    assert_eq!(report.committed, size);
                    report
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_claim_latency,
    bench_account_lifecycle,
    bench_dispatch_throughput
);
criterion_main!(benches);
