//! Shopping cart state and how events evolve it.

use serde::{Deserialize, Serialize};

use super::{ClientId, Money, PricedProductItem, ShoppingCartEvent};

/// Lifecycle of a shopping cart.
///
/// ```text
/// Empty ──► Opened ──┬──► Confirmed
///                    └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShoppingCartStatus {
    /// No events yet.
    #[default]
    Empty,
    Opened,
    Confirmed,
    Cancelled,
}

impl ShoppingCartStatus {
    /// Confirmed and cancelled carts accept no further changes.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ShoppingCartStatus::Confirmed | ShoppingCartStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShoppingCartStatus::Empty => "Empty",
            ShoppingCartStatus::Opened => "Opened",
            ShoppingCartStatus::Confirmed => "Confirmed",
            ShoppingCartStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ShoppingCartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a shopping cart rebuilt from its stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCart {
    pub status: ShoppingCartStatus,
    pub client_id: Option<ClientId>,
    /// Items in the order they were added; adding the same product twice keeps two entries.
    pub product_items: Vec<PricedProductItem>,
    pub total_amount: Money,
    pub applied_coupons: Vec<String>,
}

impl ShoppingCart {
    /// Quantity of `product_id` at `unit_price` currently in the cart.
    pub fn quantity_of(&self, item: &PricedProductItem) -> u32 {
        self.product_items
            .iter()
            .filter(|i| i.product_id == item.product_id && i.unit_price == item.unit_price)
            .map(|i| i.quantity)
            .sum()
    }
}

pub fn initial_state() -> ShoppingCart {
    ShoppingCart::default()
}

pub fn evolve(mut state: ShoppingCart, event: &ShoppingCartEvent) -> ShoppingCart {
    match event {
        ShoppingCartEvent::ShoppingCartOpened(e) => {
            state.status = ShoppingCartStatus::Opened;
            state.client_id = Some(e.client_id);
        }
        ShoppingCartEvent::ProductItemAdded(e) => {
            state.total_amount += e.product_item.total_price();
            state.product_items.push(e.product_item.clone());
        }
        ShoppingCartEvent::ProductItemRemoved(e) => {
            state.total_amount -= e.product_item.total_price();
            remove_quantity(&mut state.product_items, &e.product_item);
        }
        ShoppingCartEvent::DiscountApplied(e) => {
            state.total_amount = state.total_amount.discounted(e.percent);
            state.applied_coupons.push(e.coupon_id.clone());
        }
        ShoppingCartEvent::ShoppingCartConfirmed(_) => {
            state.status = ShoppingCartStatus::Confirmed;
        }
        ShoppingCartEvent::ShoppingCartCancelled(_) => {
            state.status = ShoppingCartStatus::Cancelled;
        }
    }
    state
}

/// Takes `removed.quantity` off matching entries, newest first, dropping emptied ones.
fn remove_quantity(items: &mut Vec<PricedProductItem>, removed: &PricedProductItem) {
    let mut remaining = removed.quantity;
    for item in items.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        if item.product_id != removed.product_id || item.unit_price != removed.unit_price {
            continue;
        }
        let taken = remaining.min(item.quantity);
        item.quantity -= taken;
        remaining -= taken;
    }
    items.retain(|item| item.quantity > 0);
}
