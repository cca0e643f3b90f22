use criterion::{Criterion, criterion_group, criterion_main};
use domain::shopping_cart::{evolve, initial_state};
use domain::{
    ClientId, Money, PricedProductItem, ShoppingCartEvent, ShoppingCartId, ShoppingCartService,
};
use domain::{ProductItemAdded, ShoppingCartOpened};
use event_store::InMemoryEventStore;

fn bench_open_cart(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/open_cart", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = ShoppingCartService::new(InMemoryEventStore::new());
                service
                    .open(ShoppingCartId::new(), ClientId::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_add_product_item(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = ShoppingCartService::new(InMemoryEventStore::new());
    let cart_id = ShoppingCartId::new();
    rt.block_on(async { service.open(cart_id, ClientId::new()).await.unwrap() });

    c.bench_function("domain/add_product_item", |b| {
        b.iter(|| {
            rt.block_on(async {
                let item = PricedProductItem::new("SKU-BENCH", 1, Money::from_cents(1000));
                service.add_product_item(cart_id, item).await.unwrap();
            });
        });
    });
}

fn bench_full_command_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/full_open_add_confirm", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = ShoppingCartService::new(InMemoryEventStore::new());
                let cart_id = ShoppingCartId::new();
                service.open(cart_id, ClientId::new()).await.unwrap();
                service
                    .add_product_item(
                        cart_id,
                        PricedProductItem::new("SKU-001", 2, Money::from_cents(1000)),
                    )
                    .await
                    .unwrap();
                service.confirm(cart_id).await.unwrap();
            });
        });
    });
}

fn bench_evolve_100_events(c: &mut Criterion) {
    let cart_id = ShoppingCartId::new();
    let client_id = ClientId::new();
    let mut events = vec![ShoppingCartEvent::ShoppingCartOpened(ShoppingCartOpened {
        shopping_cart_id: cart_id,
        client_id,
        opened_at: chrono::Utc::now(),
    })];
    for i in 0..99 {
        events.push(ShoppingCartEvent::ProductItemAdded(ProductItemAdded {
            shopping_cart_id: cart_id,
            client_id,
            product_item: PricedProductItem::new(format!("SKU-{i}"), 1, Money::from_cents(100)),
            added_at: chrono::Utc::now(),
        }));
    }

    c.bench_function("domain/evolve_100_events", |b| {
        b.iter(|| events.iter().fold(initial_state(), evolve));
    });
}

criterion_group!(
    benches,
    bench_open_cart,
    bench_add_product_item,
    bench_full_command_cycle,
    bench_evolve_100_events,
);
criterion_main!(benches);
