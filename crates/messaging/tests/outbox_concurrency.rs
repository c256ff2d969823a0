//! Racing publishers against one in-memory outbox.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Clock, ManualClock, SystemClock};
use messaging::{
    EventConverter, EventKind, InMemoryDatabase, InMemoryEventBus, JsonConverter, OutboxPublisher,
    OutboxRecord, OutboxStatus, OutboxStore, OutboxTable, OutboxTables, PublisherConfig, Registry,
    WirePayload,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Numbered,
}

impl EventKind for Kind {
    fn as_str(&self) -> &'static str {
        "Numbered"
    }

    fn topic(&self) -> &'static str {
        "numbers"
    }

    fn parse(name: &str) -> Option<Self> {
        (name == "Numbered").then_some(Kind::Numbered)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Numbered {
    n: usize,
}

impl WirePayload for Numbered {}

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

async fn seed(db: &InMemoryDatabase<State>, count: usize) {
    let now = Utc::now();
    db.transaction(|state| {
        for n in 0..count {
            let record = OutboxRecord::pending(
                Uuid::new_v4(),
                Kind::Numbered,
                format!("numbered-{n}"),
                &Numbered { n },
                now,
            )?;
            state.outbox.insert(record)?;
        }
        Ok::<_, messaging::MessagingError>(())
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_n_racers_claims_a_record() {
    let db = InMemoryDatabase::new(State::default());
    seed(&db, 1).await;
    let now = Utc::now();

    let mut handles = Vec::new();
    for worker in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.claim_batch(&format!("w{worker}"), 10, Duration::from_secs(30), now)
                .await
                .unwrap()
                .len()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        winners += handle.await.unwrap();
    }
    assert_eq!(winners, 1);
    assert_eq!(
        db.count_by_status(OutboxStatus::Processing).await.unwrap(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_publish_each_record_once() {
    let db = InMemoryDatabase::new(State::default());
    let bus = InMemoryEventBus::new();
    seed(&db, 200).await;

    let mut handles = Vec::new();
    for worker in 0..4 {
        let converters = Registry::build(
            "converters",
            [(
                Kind::Numbered,
                Arc::new(JsonConverter::<Numbered>::new()) as Arc<dyn EventConverter>,
            )],
        )
        .unwrap();
        let publisher = OutboxPublisher::new(
            Arc::new(db.clone()),
            Arc::new(bus.clone()),
            converters,
            Arc::new(SystemClock),
            PublisherConfig::new(format!("publisher-{worker}")).with_batch_size(7),
        );
        handles.push(tokio::spawn(async move { publisher.drain().await.unwrap() }));
    }

    let mut published = 0;
    for handle in handles {
        published += handle.await.unwrap().published;
    }

    assert_eq!(published, 200);
    let sent = bus.sent().await;
    let unique: HashSet<Uuid> = sent.iter().map(|m| m.event.event_id).collect();
    assert_eq!(sent.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(
        db.count_by_status(OutboxStatus::Published).await.unwrap(),
        200
    );
}

#[tokio::test]
async fn crashed_claimant_is_taken_over_after_lease() {
    let db = InMemoryDatabase::new(State::default());
    seed(&db, 3).await;
    let clock = ManualClock::new(Utc::now());
    let lease = Duration::from_secs(10);

    let crashed = db.claim_batch("crashed", 10, lease, clock.now()).await.unwrap();
    assert_eq!(crashed.len(), 3);
    assert!(db.claim_batch("survivor", 10, lease, clock.now()).await.unwrap().is_empty());

    clock.advance(chrono::Duration::seconds(10));
    let taken = db.claim_batch("survivor", 10, lease, clock.now()).await.unwrap();
    assert_eq!(taken.len(), 3);
    assert!(taken.iter().all(|r| r.locked_by.as_deref() == Some("survivor")));

    for record in &crashed {
        assert!(!db.mark_published(record.id, "crashed", clock.now()).await.unwrap());
    }
    for record in &taken {
        assert!(db.mark_published(record.id, "survivor", clock.now()).await.unwrap());
    }
}
