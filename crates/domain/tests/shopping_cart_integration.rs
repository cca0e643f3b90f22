//! Integration tests for the shopping cart domain.
//!
//! These tests exercise the command handler against the in-memory store:
//! persistence, replay with time travel and concurrent writers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::shopping_cart::{evolve, initial_state};
use domain::{
    ClientId, CommandHandler, DiscountApplied, DomainError, HandleOptions, Money,
    PricedProductItem, ProductItemAdded, RetryPolicy, ShoppingCart, ShoppingCartCommand,
    ShoppingCartEvent, ShoppingCartId, ShoppingCartService, ShoppingCartStatus,
};
use event_store::{
    AppendOptions, EventStoreExt, ExpectedStreamVersion, InMemoryEventStore, ReadStreamOptions,
    StreamPosition,
};

fn create_service(store: InMemoryEventStore) -> ShoppingCartService<InMemoryEventStore> {
    ShoppingCartService::new(store)
}

fn item(quantity: u32) -> PricedProductItem {
    PricedProductItem::new("SKU-1", quantity, Money::from_units(3))
}

mod replay {
    use super::*;

    #[tokio::test]
    async fn aggregated_cart_matches_handled_state() {
        let store = InMemoryEventStore::new();
        let service = create_service(store.clone());
        let cart_id = ShoppingCartId::new();

        service.open(cart_id, ClientId::new()).await.unwrap();
        service.add_product_item(cart_id, item(10)).await.unwrap();
        service.add_product_item(cart_id, item(10)).await.unwrap();
        let discounted = service
            .apply_discount(cart_id, 10, "WELCOME10")
            .await
            .unwrap();

        let aggregated = store
            .aggregate_stream::<ShoppingCart, ShoppingCartEvent>(
                &cart_id.stream_id(),
                evolve,
                initial_state,
                ReadStreamOptions::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(aggregated.state.total_amount, Money::from_units(54));
        assert_eq!(aggregated.state.product_items.len(), 2);
        assert_eq!(aggregated.current_stream_version, StreamPosition::new(4));
        assert_eq!(aggregated.state, discounted.new_state);
    }

    #[tokio::test]
    async fn appended_events_fold_into_discounted_total() {
        let store = InMemoryEventStore::new();
        let (cart_id, client_id) = (ShoppingCartId::new(), ClientId::new());
        let added = || {
            ShoppingCartEvent::ProductItemAdded(ProductItemAdded {
                shopping_cart_id: cart_id,
                client_id,
                product_item: item(10),
                added_at: Utc::now(),
            })
        };
        let events = [
            added(),
            added(),
            ShoppingCartEvent::DiscountApplied(DiscountApplied {
                shopping_cart_id: cart_id,
                client_id,
                percent: 10,
                coupon_id: "WELCOME10".to_string(),
                applied_at: Utc::now(),
            }),
        ];

        let appended = store
            .append_events(&cart_id.stream_id(), &events, AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(appended.next_expected_stream_version, StreamPosition::new(3));

        let aggregated = store
            .aggregate_stream::<ShoppingCart, ShoppingCartEvent>(
                &cart_id.stream_id(),
                evolve,
                initial_state,
                ReadStreamOptions::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(aggregated.state.total_amount, Money::from_units(54));
        assert_eq!(aggregated.current_stream_version, StreamPosition::new(3));
    }

    #[tokio::test]
    async fn time_travel_rebuilds_an_earlier_version() {
        let store = InMemoryEventStore::new();
        let service = create_service(store.clone());
        let cart_id = ShoppingCartId::new();

        service.open(cart_id, ClientId::new()).await.unwrap();
        service.add_product_item(cart_id, item(10)).await.unwrap();
        service.add_product_item(cart_id, item(10)).await.unwrap();
        service
            .apply_discount(cart_id, 10, "WELCOME10")
            .await
            .unwrap();

        let at_three = store
            .aggregate_stream::<ShoppingCart, ShoppingCartEvent>(
                &cart_id.stream_id(),
                evolve,
                initial_state,
                ReadStreamOptions::new().to(StreamPosition::new(3)),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(at_three.state.total_amount, Money::from_units(60));
        assert!(at_three.state.applied_coupons.is_empty());
        assert_eq!(at_three.current_stream_version, StreamPosition::new(4));
    }
}

mod illegal_states {
    use super::*;

    #[tokio::test]
    async fn confirmed_cart_rejects_changes() {
        let service = create_service(InMemoryEventStore::new());
        let cart_id = ShoppingCartId::new();

        service.open(cart_id, ClientId::new()).await.unwrap();
        service.add_product_item(cart_id, item(1)).await.unwrap();
        service.confirm(cart_id).await.unwrap();

        for command in [
            ShoppingCartCommand::AddProductItem {
                product_item: item(1),
            },
            ShoppingCartCommand::Cancel,
            ShoppingCartCommand::Confirm,
        ] {
            let err = service.execute(cart_id, command).await.unwrap_err();
            assert!(matches!(err, DomainError::IllegalState(_)));
        }

        let cart = service.get(cart_id).await.unwrap().unwrap();
        assert_eq!(cart.status, ShoppingCartStatus::Confirmed);
    }

    #[tokio::test]
    async fn unknown_item_cannot_be_removed() {
        let service = create_service(InMemoryEventStore::new());
        let cart_id = ShoppingCartId::new();

        service.open(cart_id, ClientId::new()).await.unwrap();
        let err = service
            .remove_product_item(cart_id, item(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::IllegalState(msg) if msg.contains("SKU-1")));
    }

    #[tokio::test]
    async fn coupon_cannot_be_reused() {
        let service = create_service(InMemoryEventStore::new());
        let cart_id = ShoppingCartId::new();

        service.open(cart_id, ClientId::new()).await.unwrap();
        service.add_product_item(cart_id, item(1)).await.unwrap();
        service.apply_discount(cart_id, 10, "ONCE").await.unwrap();

        let err = service.apply_discount(cart_id, 10, "ONCE").await.unwrap_err();
        assert!(matches!(err, DomainError::IllegalState(_)));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn only_one_concurrent_creation_wins() {
        let store = InMemoryEventStore::new();
        let cart_id = ShoppingCartId::new();
        let service = Arc::new(create_service(store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service.open(cart_id, ClientId::new()).await
            }));
        }

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => {
                    assert!(result.created_new_stream);
                    won += 1;
                }
                Err(e) => assert!(
                    e.is_concurrency_conflict() || matches!(e, DomainError::IllegalState(_)),
                    "unexpected error: {e}"
                ),
            }
        }

        assert_eq!(won, 1);
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn stale_expected_version_is_rejected() {
        let store = InMemoryEventStore::new();
        let service = create_service(store.clone());
        let cart_id = ShoppingCartId::new();
        service.open(cart_id, ClientId::new()).await.unwrap();
        service.add_product_item(cart_id, item(1)).await.unwrap();

        let handler = CommandHandler::new(store.clone(), evolve, initial_state);
        let version = handler
            .handle(
                &cart_id.stream_id(),
                |_: &ShoppingCart| Ok::<_, DomainError>(Vec::<ShoppingCartEvent>::new()),
                HandleOptions::new(),
            )
            .await
            .map(|result| result.next_expected_stream_version)
            .unwrap();
        assert_eq!(version, StreamPosition::new(2));

        let conflict = handler
            .handle(
                &cart_id.stream_id(),
                |state: &ShoppingCart| {
                    domain::shopping_cart::decide(
                        cart_id,
                        &ShoppingCartCommand::Cancel,
                        state,
                        chrono::Utc::now(),
                    )
                },
                HandleOptions::new().expect(ExpectedStreamVersion::exact(1)),
            )
            .await
            .unwrap_err();

        assert!(conflict.is_concurrency_conflict());
        assert_eq!(store.message_count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_additions_all_land_with_retry() {
        let store = InMemoryEventStore::new();
        let cart_id = ShoppingCartId::new();
        let service = Arc::new(create_service(store.clone()).with_retry_policy(
            RetryPolicy::default()
                .with_retries(20)
                .with_min_delay(Duration::from_millis(1)),
        ));
        service.open(cart_id, ClientId::new()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service.add_product_item(cart_id, item(1)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let cart = service.get(cart_id).await.unwrap().unwrap();
        assert_eq!(cart.quantity_of(&item(1)), 5);
        assert_eq!(cart.total_amount, Money::from_units(15));
    }
}
