//! Full saga runs across the order, inventory and payment services.

use std::sync::Arc;
use std::time::Duration;

use app::{Collaborators, Config, FulfillmentSystem};
use common::{Clock, Currency, Money, OrderId, ProductId, SystemClock, UserId};
use contracts::{InventoryReserveRequested, RequestedItem, emit};
use inventory::ReservationStatus;
use order::{InMemoryCatalog, Order, OrderItem, OrderLine, OrderStatus, PlaceOrder, SagaStatus};
use payment::{InMemoryPaymentGateway, PaymentStatus};

const SKU: &str = "SKU-BOOK";

fn usd() -> Currency {
    Currency::parse("USD").unwrap()
}

async fn system_with(config: Config, gateway: &InMemoryPaymentGateway, stock: u32) -> FulfillmentSystem {
    let catalog = InMemoryCatalog::new().with_price(SKU, Money::from_cents(1500), usd());
    let system = FulfillmentSystem::build(
        &config,
        Collaborators {
            catalog: Arc::new(catalog),
            gateway: Arc::new(gateway.clone()),
            clock: Arc::new(SystemClock),
        },
    )
    .await
    .unwrap();
    system
        .services
        .inventory
        .add_stock(ProductId::new(SKU), stock)
        .await
        .unwrap();
    system
}

async fn system(gateway: &InMemoryPaymentGateway, stock: u32) -> FulfillmentSystem {
    system_with(Config::default(), gateway, stock).await
}

fn order_of(quantity: u32) -> PlaceOrder {
    PlaceOrder {
        user_id: UserId::new(),
        idempotency_key: format!("checkout-{quantity}"),
        items: vec![OrderLine::new(SKU, quantity)],
        total_amount: Money::from_cents(1500 * i64::from(quantity)),
        currency: usd(),
    }
}

async fn stock(system: &FulfillmentSystem) -> (u32, u32) {
    let inventory = system
        .services
        .inventory
        .inventory(&ProductId::new(SKU))
        .await
        .unwrap();
    (inventory.available_quantity(), inventory.reserved_quantity())
}

#[tokio::test]
async fn successful_order_completes() {
    let gateway = InMemoryPaymentGateway::new();
    let mut system = system(&gateway, 10).await;

    let order_id = system.services.orders.place_order(order_of(2)).await.unwrap();
    let report = system.pump().await.unwrap();
    assert_eq!(report.dropped, 0);

    let saga = system.services.orders.saga(order_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Completed);
    assert!(saga.payment_requested_at().is_some());
    assert!(saga.completed_at().is_some());

    let order = system.services.orders.order(order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Completed);

    assert_eq!(stock(&system).await, (8, 0));
    assert_eq!(
        system.services.inventory.reservation(order_id).await.unwrap().status(),
        ReservationStatus::Committed
    );
    assert_eq!(
        system.services.payment.payment(order_id).await.unwrap().status(),
        PaymentStatus::Commited
    );
    assert_eq!(gateway.captured().len(), 1);

    // The order passed through PAID on its way to COMPLETED.
    assert_eq!(system.bus.sent_of_type("InventoryCommitRequested").await.len(), 1);
    assert_eq!(system.bus.sent_of_type("PaymentCommitRequested").await.len(), 1);
}

/// Placement committed the order and its reserve request, then stopped
/// before creating the saga. Inventory answers long before recovery runs.
#[tokio::test]
async fn reply_overtaking_saga_bootstrap_still_completes() {
    let gateway = InMemoryPaymentGateway::new();
    let mut system = system(&gateway, 10).await;

    let now = SystemClock.now();
    let order = Order::place(
        UserId::new(),
        "interrupted-checkout",
        vec![OrderItem {
            product_id: SKU.into(),
            quantity: 2,
            unit_price: Money::from_cents(1500),
        }],
        usd(),
        now,
    )
    .unwrap();
    let order_id = order.id();
    system
        .services
        .orders
        .database()
        .transaction(|state| -> order::Result<()> {
            state.orders.insert(order)?;
            emit(
                state,
                order_id,
                &InventoryReserveRequested {
                    order_id,
                    items: vec![RequestedItem {
                        product_id: SKU.into(),
                        quantity: 2,
                    }],
                },
                now,
            )?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(system.services.orders.saga(order_id).await.is_none());

    let report = system.pump().await.unwrap();
    assert_eq!(report.dropped, 0);

    let saga = system.services.orders.saga(order_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(
        system.services.orders.order(order_id).await.unwrap().status(),
        OrderStatus::Completed
    );
    assert_eq!(stock(&system).await, (8, 0));
    assert_eq!(gateway.captured().len(), 1);
}

#[tokio::test]
async fn reservation_failure_fails_without_payment() {
    let gateway = InMemoryPaymentGateway::new();
    let mut system = system(&gateway, 1).await;

    let order_id = system.services.orders.place_order(order_of(3)).await.unwrap();
    system.pump().await.unwrap();

    let saga = system.services.orders.saga(order_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Failed);
    assert!(saga.payment_requested_at().is_none());
    assert!(saga.inventory_released_at().is_some());
    assert_eq!(
        system.services.orders.order(order_id).await.unwrap().status(),
        OrderStatus::Fail
    );

    assert!(system.bus.sent_of_type("PaymentRequested").await.is_empty());
    assert!(system.services.payment.payment(order_id).await.is_none());
    assert_eq!(stock(&system).await, (1, 0));
}

#[tokio::test]
async fn payment_failure_returns_reserved_stock() {
    let gateway = InMemoryPaymentGateway::new();
    gateway.decline_next(1);
    let mut system = system(&gateway, 10).await;

    let order_id = system.services.orders.place_order(order_of(4)).await.unwrap();
    system.pump().await.unwrap();

    let saga = system.services.orders.saga(order_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Failed);
    assert!(saga.inventory_released_at().is_some());
    assert!(saga.failed_at().is_some());
    assert_eq!(saga.fail_reason(), Some("card declined"));
    assert_eq!(
        system.services.orders.order(order_id).await.unwrap().status(),
        OrderStatus::PaymentFailed
    );

    assert_eq!(stock(&system).await, (10, 0));
    assert_eq!(
        system.services.inventory.reservation(order_id).await.unwrap().status(),
        ReservationStatus::Released
    );
    assert_eq!(
        system.services.payment.payment(order_id).await.unwrap().status(),
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn broker_outage_delays_but_does_not_lose_events() {
    let gateway = InMemoryPaymentGateway::new();
    let config = Config {
        outbox_base_delay: Duration::ZERO,
        ..Config::default()
    };
    let mut system = system_with(config, &gateway, 5).await;
    system.bus.fail_next(2).await;

    let order_id = system.services.orders.place_order(order_of(1)).await.unwrap();
    // Zero backoff makes failed records claimable again within the same drain.
    let report = system.pump().await.unwrap();
    assert!(report.published >= 6);

    assert_eq!(
        system.services.orders.saga(order_id).await.unwrap().status(),
        SagaStatus::Completed
    );
    assert_eq!(system.bus.sent_of_type("InventoryReserveRequested").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_tasks_drive_the_saga() {
    let gateway = InMemoryPaymentGateway::new();
    let config = Config {
        outbox_poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let system = system_with(config, &gateway, 3).await;
    let running = system.start();

    let order_id: OrderId = running.services.orders.place_order(order_of(1)).await.unwrap();
    let mut status = None;
    for _ in 0..300 {
        status = running.services.orders.saga(order_id).await.map(|s| s.status());
        if status == Some(SagaStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    running.shutdown().await;

    assert_eq!(status, Some(SagaStatus::Completed));
}

#[tokio::test]
async fn retention_prunes_finished_messaging_rows() {
    let gateway = InMemoryPaymentGateway::new();
    let config = Config {
        retention: Duration::ZERO,
        ..Config::default()
    };
    let mut system = system_with(config, &gateway, 10).await;

    let order_id = system.services.orders.place_order(order_of(1)).await.unwrap();
    system.pump().await.unwrap();
    assert_eq!(
        system.services.orders.saga(order_id).await.unwrap().status(),
        SagaStatus::Completed
    );
    let before = system
        .services
        .orders
        .database()
        .read(|s| (s.outbox.len(), s.inbox.len()))
        .await;
    assert!(before.0 > 0 && before.1 > 0);

    let report = system.services.retention.sweep().await.unwrap();
    assert!(report.outbox >= before.0);
    assert!(report.inbox >= before.1);
    assert_eq!(
        system
            .services
            .orders
            .database()
            .read(|s| (s.outbox.len(), s.inbox.len()))
            .await,
        (0, 0)
    );

    // Aggregates are untouched.
    assert_eq!(
        system.services.orders.order(order_id).await.unwrap().status(),
        OrderStatus::Completed
    );
    assert_eq!(stock(&system).await, (9, 0));
    assert_eq!(
        system.services.retention.sweep().await.unwrap(),
        messaging::RetentionReport::default()
    );
}
