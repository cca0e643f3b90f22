//! Shopping cart domain events.

use chrono::{DateTime, Utc};
use event_store::DomainEvent;
use serde::{Deserialize, Serialize};

use super::{ClientId, PricedProductItem, ShoppingCartId};

/// Events that can occur on a shopping cart.
///
/// Every event carries the owning client so multi-stream projections can
/// route it without reading the cart's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ShoppingCartEvent {
    ShoppingCartOpened(ShoppingCartOpened),
    ProductItemAdded(ProductItemAdded),
    ProductItemRemoved(ProductItemRemoved),
    DiscountApplied(DiscountApplied),
    ShoppingCartConfirmed(ShoppingCartConfirmed),
    ShoppingCartCancelled(ShoppingCartCancelled),
}

impl ShoppingCartEvent {
    /// Every message type a cart stream can contain.
    pub const TYPES: &'static [&'static str] = &[
        "ShoppingCartOpened",
        "ProductItemAdded",
        "ProductItemRemoved",
        "DiscountApplied",
        "ShoppingCartConfirmed",
        "ShoppingCartCancelled",
    ];

    pub fn shopping_cart_id(&self) -> ShoppingCartId {
        match self {
            ShoppingCartEvent::ShoppingCartOpened(e) => e.shopping_cart_id,
            ShoppingCartEvent::ProductItemAdded(e) => e.shopping_cart_id,
            ShoppingCartEvent::ProductItemRemoved(e) => e.shopping_cart_id,
            ShoppingCartEvent::DiscountApplied(e) => e.shopping_cart_id,
            ShoppingCartEvent::ShoppingCartConfirmed(e) => e.shopping_cart_id,
            ShoppingCartEvent::ShoppingCartCancelled(e) => e.shopping_cart_id,
        }
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            ShoppingCartEvent::ShoppingCartOpened(e) => e.client_id,
            ShoppingCartEvent::ProductItemAdded(e) => e.client_id,
            ShoppingCartEvent::ProductItemRemoved(e) => e.client_id,
            ShoppingCartEvent::DiscountApplied(e) => e.client_id,
            ShoppingCartEvent::ShoppingCartConfirmed(e) => e.client_id,
            ShoppingCartEvent::ShoppingCartCancelled(e) => e.client_id,
        }
    }
}

impl DomainEvent for ShoppingCartEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ShoppingCartEvent::ShoppingCartOpened(_) => "ShoppingCartOpened",
            ShoppingCartEvent::ProductItemAdded(_) => "ProductItemAdded",
            ShoppingCartEvent::ProductItemRemoved(_) => "ProductItemRemoved",
            ShoppingCartEvent::DiscountApplied(_) => "DiscountApplied",
            ShoppingCartEvent::ShoppingCartConfirmed(_) => "ShoppingCartConfirmed",
            ShoppingCartEvent::ShoppingCartCancelled(_) => "ShoppingCartCancelled",
        }
    }
}

/// Data for ShoppingCartOpened event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCartOpened {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    pub opened_at: DateTime<Utc>,
}

/// Data for ProductItemAdded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductItemAdded {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    pub product_item: PricedProductItem,
    pub added_at: DateTime<Utc>,
}

/// Data for ProductItemRemoved event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductItemRemoved {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    pub product_item: PricedProductItem,
    pub removed_at: DateTime<Utc>,
}

/// Data for DiscountApplied event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountApplied {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    /// Percentage taken off the running total, 1..=100.
    pub percent: u8,
    /// Coupon that granted the discount; each coupon applies at most once.
    pub coupon_id: String,
    pub applied_at: DateTime<Utc>,
}

/// Data for ShoppingCartConfirmed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCartConfirmed {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    pub confirmed_at: DateTime<Utc>,
}

/// Data for ShoppingCartCancelled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCartCancelled {
    pub shopping_cart_id: ShoppingCartId,
    pub client_id: ClientId,
    pub cancelled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopping_cart::Money;

    #[test]
    fn event_types_match_serialized_tag() {
        let event = ShoppingCartEvent::ProductItemAdded(ProductItemAdded {
            shopping_cart_id: ShoppingCartId::new(),
            client_id: ClientId::new(),
            product_item: PricedProductItem::new("SKU-1", 1, Money::from_units(3)),
            added_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert!(ShoppingCartEvent::TYPES.contains(&event.event_type()));

        let back: ShoppingCartEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
