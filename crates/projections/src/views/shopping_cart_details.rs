//! Shopping cart details read model, maintained inline with each append.

use chrono::{DateTime, Utc};
use common::PartitionKey;
use domain::{
    ClientId, Money, PricedProductItem, ShoppingCartEvent, ShoppingCartId, ShoppingCartStatus,
};
use event_store::{DocumentStore, InlineProjection, RecordedMessage, SingleStreamProjection};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One document per cart stream, with items merged by product and price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCartDetails {
    pub id: Option<ShoppingCartId>,
    pub client_id: Option<ClientId>,
    pub status: ShoppingCartStatus,
    pub product_items: Vec<PricedProductItem>,
    pub product_items_count: u32,
    pub total_amount: Money,
    pub applied_coupons: Vec<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

fn evolve(mut details: ShoppingCartDetails, event: &ShoppingCartEvent) -> ShoppingCartDetails {
    match event {
        ShoppingCartEvent::ShoppingCartOpened(e) => {
            details.id = Some(e.shopping_cart_id);
            details.client_id = Some(e.client_id);
            details.status = ShoppingCartStatus::Opened;
            details.opened_at = Some(e.opened_at);
        }
        ShoppingCartEvent::ProductItemAdded(e) => {
            let added = &e.product_item;
            match details.product_items.iter_mut().find(|item| same_line(item, added)) {
                Some(item) => item.quantity += added.quantity,
                None => details.product_items.push(added.clone()),
            }
            details.product_items_count += added.quantity;
            details.total_amount += added.total_price();
        }
        ShoppingCartEvent::ProductItemRemoved(e) => {
            let removed = &e.product_item;
            if let Some(item) = details
                .product_items
                .iter_mut()
                .find(|item| same_line(item, removed))
            {
                item.quantity = item.quantity.saturating_sub(removed.quantity);
            }
            details.product_items.retain(|item| item.quantity > 0);
            details.product_items_count = details
                .product_items_count
                .saturating_sub(removed.quantity);
            details.total_amount -= removed.total_price();
        }
        ShoppingCartEvent::DiscountApplied(e) => {
            details.total_amount = details.total_amount.discounted(e.percent);
            details.applied_coupons.push(e.coupon_id.clone());
        }
        ShoppingCartEvent::ShoppingCartConfirmed(e) => {
            details.status = ShoppingCartStatus::Confirmed;
            details.confirmed_at = Some(e.confirmed_at);
        }
        ShoppingCartEvent::ShoppingCartCancelled(e) => {
            details.status = ShoppingCartStatus::Cancelled;
            details.cancelled_at = Some(e.cancelled_at);
        }
    }
    details
}

fn same_line(item: &PricedProductItem, other: &PricedProductItem) -> bool {
    item.product_id == other.product_id && item.unit_price == other.unit_price
}

/// Inline projection keeping a [`ShoppingCartDetails`] document per cart stream.
///
/// Registered on the store, it runs inside every append that touches a cart,
/// so the document is never behind the stream.
pub struct ShoppingCartDetailsProjection {
    inner: SingleStreamProjection<ShoppingCartDetails, ShoppingCartEvent>,
}

impl ShoppingCartDetailsProjection {
    pub const NAME: &'static str = "shopping_cart_details";

    pub fn new() -> Self {
        Self {
            inner: SingleStreamProjection::new(
                Self::NAME,
                ShoppingCartEvent::TYPES,
                evolve,
                ShoppingCartDetails::default,
            ),
        }
    }

    /// Reads the details document of a cart.
    pub async fn find<S>(
        store: &S,
        partition: &PartitionKey,
        cart_id: ShoppingCartId,
    ) -> Result<Option<ShoppingCartDetails>>
    where
        S: DocumentStore + ?Sized,
    {
        let document = store
            .find_document(Self::NAME, partition, cart_id.stream_id().as_str())
            .await?;
        Ok(document
            .map(|d| d.decode::<ShoppingCartDetails>())
            .transpose()?)
    }
}

impl Default for ShoppingCartDetailsProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineProjection for ShoppingCartDetailsProjection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn can_handle(&self) -> &[&'static str] {
        self.inner.can_handle()
    }

    fn evolve(
        &self,
        document: Option<serde_json::Value>,
        message: &RecordedMessage,
    ) -> event_store::Result<Option<serde_json::Value>> {
        self.inner.evolve(document, message)
    }
}
