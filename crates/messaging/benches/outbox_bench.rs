use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::SystemClock;
use criterion::{Criterion, criterion_group, criterion_main};
use messaging::{
    EventConverter, EventKind, InMemoryDatabase, InMemoryEventBus, JsonConverter, OutboxPublisher,
    OutboxRecord, OutboxStore, OutboxTable, OutboxTables, PublisherConfig, Registry, WirePayload,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Reserved,
}

impl EventKind for Kind {
    fn as_str(&self) -> &'static str {
        "Reserved"
    }

    fn topic(&self) -> &'static str {
        "order.replies"
    }

    fn parse(name: &str) -> Option<Self> {
        (name == "Reserved").then_some(Kind::Reserved)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Reserved {
    order_id: Uuid,
}

impl WirePayload for Reserved {}

#[derive(Debug, Clone, Default)]
struct State {
    outbox: OutboxTable,
}

impl OutboxTables for State {
    fn outbox(&self) -> &OutboxTable {
        &self.outbox
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

async fn seeded(count: usize) -> InMemoryDatabase<State> {
    let db = InMemoryDatabase::new(State::default());
    let now = Utc::now();
    db.transaction(|state| {
        for n in 0..count {
            let order_id = Uuid::new_v4();
            let record = OutboxRecord::pending(
                order_id,
                Kind::Reserved,
                format!("reserved-{n}"),
                &Reserved { order_id },
                now,
            )?;
            state.outbox.insert(record)?;
        }
        Ok::<_, messaging::MessagingError>(())
    })
    .await
    .unwrap();
    db
}

fn bench_claim_batch_50(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox/claim_batch_50_of_500", |b| {
        b.iter(|| {
            rt.block_on(async {
                let db = seeded(500).await;
                db.claim_batch("bench", 50, Duration::from_secs(30), Utc::now())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_publish_batch_50(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox/publish_batch_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                let db = seeded(50).await;
                let converters = Registry::build(
                    "converters",
                    [(
                        Kind::Reserved,
                        Arc::new(JsonConverter::<Reserved>::new()) as Arc<dyn EventConverter>,
                    )],
                )
                .unwrap();
                let publisher = OutboxPublisher::new(
                    Arc::new(db),
                    Arc::new(InMemoryEventBus::new()),
                    converters,
                    Arc::new(SystemClock),
                    PublisherConfig::new("bench"),
                );
                publisher.run_once().await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_claim_batch_50, bench_publish_batch_50);
criterion_main!(benches);
