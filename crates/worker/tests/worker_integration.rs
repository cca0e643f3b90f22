//! Worker wiring against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use domain::{ClientId, Money, PricedProductItem, ShoppingCartId, ShoppingCartService};
use common::PartitionKey;
use event_store::{CheckpointStore, InMemoryEventStore};
use projections::{ClientShoppingSummaryProjection, ProcessorTick, ShoppingCartDetailsProjection};
use worker::{Config, summary_processor};

fn config() -> Config {
    Config {
        database_url: "memory".to_string(),
        poll_interval: Duration::from_millis(10),
        batch_size: 2,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_run_catches_up_and_stops_on_shutdown() {
    let store = InMemoryEventStore::new();
    let service = ShoppingCartService::new(store.clone());
    let (cart_id, client_id) = (ShoppingCartId::new(), ClientId::new());
    service.open(cart_id, client_id).await.unwrap();
    service
        .add_product_item(
            cart_id,
            PricedProductItem::new("SKU-1", 3, Money::from_units(2)),
        )
        .await
        .unwrap();
    service.confirm(cart_id).await.unwrap();

    let config = config();
    worker::run(
        store.clone(),
        &config,
        tokio::time::sleep(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    let summary = ClientShoppingSummaryProjection::new(store.clone())
        .find(client_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.confirmed.carts_count, 1);
    assert_eq!(summary.confirmed.total_amount, Money::from_units(6));

    let key = worker::processor_options(&config).key();
    let checkpoint = store.read_checkpoint(&key).await.unwrap();
    assert_eq!(checkpoint.map(|c| c.position.as_i64()), Some(3));
}

#[tokio::test]
async fn test_second_worker_waits_for_the_lease() {
    let store = InMemoryEventStore::new();
    let service = ShoppingCartService::new(store.clone());
    service
        .open(ShoppingCartId::new(), ClientId::new())
        .await
        .unwrap();

    let config = config();
    let first = summary_processor(store.clone(), &config);
    let second = summary_processor(store.clone(), &config);

    assert!(matches!(
        first.run_once().await.unwrap(),
        ProcessorTick::Processed { messages: 1, .. }
    ));
    assert_eq!(second.run_once().await.unwrap(), ProcessorTick::NotOwner);
}

#[tokio::test]
async fn test_worker_only_runs_the_summary_alongside_writer_inline_views() {
    let writer_store = InMemoryEventStore::new()
        .with_inline_projection(Arc::new(ShoppingCartDetailsProjection::new()));
    let service = ShoppingCartService::new(writer_store.clone());
    let (cart_id, client_id) = (ShoppingCartId::new(), ClientId::new());
    service.open(cart_id, client_id).await.unwrap();

    let processor = summary_processor(writer_store.clone(), &config());
    assert_eq!(processor.projection_count(), 1);
    processor.run_once().await.unwrap();

    let details = ShoppingCartDetailsProjection::find(&writer_store, &PartitionKey::default(), cart_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(details.client_id, Some(client_id));
    assert!(
        ClientShoppingSummaryProjection::new(writer_store)
            .find(client_id)
            .await
            .unwrap()
            .is_some()
    );
}
