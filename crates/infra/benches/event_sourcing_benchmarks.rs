use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::runtime::Runtime;

use eventide_core::{
    execute, Aggregate, AggregateId, Clock, CorrelationId, DomainError, DomainResult, ExpectedVersion, SystemClock,
};
use eventide_events::{Command, Envelope, Event, Message, TypeRegistry};
use eventide_infra::{
    AggregateRepository, Cancellation, Commit, CommitPersistence, EventStore, HandlerContext, HandlerError, Handles,
    InMemoryBackend, MessageBus, Persistence, RuntimeConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Increment {
    counter: AggregateId,
    by: i64,
}

impl Message for Increment {
    fn message_type() -> &'static str {
        "bench.increment"
    }
}

impl Command for Increment {
    fn target_aggregate_id(&self) -> AggregateId {
        self.counter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented {
    by: i64,
}

impl Message for Incremented {
    fn message_type() -> &'static str {
        "bench.incremented"
    }
}

impl Event for Incremented {}

#[derive(Debug, Clone)]
struct Counter {
    value: i64,
}

impl Aggregate for Counter {
    type Command = Increment;
    type Event = Incremented;

    fn aggregate_type() -> &'static str {
        "bench.counter"
    }

    fn new(_id: AggregateId) -> Self {
        Self { value: 0 }
    }

    fn apply(&mut self, event: &Incremented) {
        self.value += event.by;
    }

    fn handle(&self, command: &Increment) -> DomainResult<Vec<Incremented>> {
        Ok(vec![Incremented { by: command.by }])
    }

    fn snapshot(&self) -> Option<JsonValue> {
        Some(json!({ "value": self.value }))
    }

    fn restore(_id: AggregateId, state: JsonValue) -> DomainResult<Self> {
        let value = state["value"]
            .as_i64()
            .ok_or_else(|| DomainError::invariant("value missing"))?;
        Ok(Self { value })
    }
}

struct Ignore;

#[async_trait]
impl Handles<Incremented> for Ignore {
    async fn handle(&self, event: Incremented, _ctx: &HandlerContext) -> Result<(), HandlerError> {
        black_box(event);
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn persistence() -> (Arc<InMemoryBackend>, Arc<Persistence>, Arc<dyn Clock>) {
    let backend = Arc::new(InMemoryBackend::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let persistence = Arc::new(Persistence::new(backend.clone(), clock.clone()));
    (backend, persistence, clock)
}

fn events(id: AggregateId, n: usize) -> Vec<Envelope> {
    let correlation = CorrelationId::new();
    (0..n)
        .map(|i| Envelope::event(id, &Incremented { by: i as i64 }, correlation, Utc::now()).unwrap())
        .collect()
}

fn bench_commit_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("commit_throughput");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("events_per_commit", batch_size), batch_size, |b, &n| {
            let (_, persistence, _) = persistence();
            let id = AggregateId::new();
            b.to_async(&rt).iter(|| {
                let persistence = persistence.clone();
                let batch = events(id, n);
                async move {
                    let commit = Commit::new(id, ExpectedVersion::Any)
                        .with_messages(batch.clone())
                        .with_events(batch);
                    black_box(persistence.persist(commit, &Cancellation::none()).await.unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_event_replay(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_replay");

    for stream_len in [10usize, 100, 1000].iter() {
        for snapshot_every in [None, Some(50u64)] {
            let label = match snapshot_every {
                Some(_) => "with_snapshots",
                None => "full_replay",
            };

            let (_, persistence, clock) = persistence();
            let store = EventStore::new(persistence.backend().clone(), persistence.clone(), clock);
            let types = Arc::new(TypeRegistry::new());
            types.register_event::<Incremented>();
            let repo = AggregateRepository::<Counter>::new(store, types).with_snapshot_interval(snapshot_every);
            let id = AggregateId::new();

            rt.block_on(async {
                for _ in 0..*stream_len {
                    let mut loaded = repo.load_or_new(id, &Cancellation::none()).await.unwrap();
                    let events = execute(&mut loaded.aggregate, &Increment { counter: id, by: 1 }).unwrap();
                    repo.save(id, &mut loaded, &events, None, &Cancellation::none())
                        .await
                        .unwrap();
                }
            });

            group.throughput(Throughput::Elements(*stream_len as u64));
            group.bench_with_input(BenchmarkId::new(label, stream_len), stream_len, |b, _| {
                b.to_async(&rt).iter(|| {
                    let repo = repo.clone();
                    async move {
                        let loaded = repo.load(id, &Cancellation::none()).await.unwrap();
                        black_box(loaded.aggregate.value);
                    }
                });
            });
        }
    }

    group.finish();
}

fn bench_bus_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("bus_round_trip");

    let bus = rt.block_on(async {
        MessageBus::builder()
            .with_backend(Arc::new(InMemoryBackend::new()))
            .with_config(RuntimeConfig::default())
            .register_aggregate::<Counter>()
            .register_event_handler::<Incremented, _, _>("ignore", || Ignore)
            .start()
            .unwrap()
    });
    let counter = AggregateId::new();

    group.bench_function("send_and_flush", |b| {
        b.to_async(&rt).iter(|| {
            let bus = bus.clone();
            async move {
                bus.send(&Increment { counter, by: 1 }, &Cancellation::none())
                    .await
                    .unwrap();
                bus.flush(&Cancellation::none()).await.unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_commit_throughput,
    bench_event_replay,
    bench_bus_round_trip
);
criterion_main!(benches);
