//! Client shopping summary: per-client totals across all of the client's carts.

use std::collections::HashMap;

use async_trait::async_trait;
use common::PartitionKey;
use domain::{ClientId, Money, ShoppingCartEvent, ShoppingCartId, ShoppingCartStatus};
use event_store::{DocumentStore, EventStoreError, RecordedMessage, StreamPosition};
use serde::{Deserialize, Serialize};

use crate::projection::Projection;
use crate::{ProjectionError, Result};

/// Upserts attempted before giving up on a document that keeps changing.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Totals over the carts of one status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub carts_count: u32,
    pub product_items_count: u32,
    pub total_amount: Money,
}

/// What the summary knows about one of the client's carts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCart {
    pub status: ShoppingCartStatus,
    pub product_items_count: u32,
    pub total_amount: Money,
    /// Last stream position folded in; anything at or below it was already applied.
    pub last_stream_position: StreamPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientShoppingSummary {
    pub client_id: ClientId,
    pub pending: CartTotals,
    pub confirmed: CartTotals,
    pub cancelled: CartTotals,
    pub carts: HashMap<ShoppingCartId, ClientCart>,
}

impl ClientShoppingSummary {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            pending: CartTotals::default(),
            confirmed: CartTotals::default(),
            cancelled: CartTotals::default(),
            carts: HashMap::new(),
        }
    }

    /// Folds one cart event in. Returns false if the event was already applied.
    pub fn apply(&mut self, position: StreamPosition, event: &ShoppingCartEvent) -> bool {
        let cart = self
            .carts
            .entry(event.shopping_cart_id())
            .or_insert(ClientCart {
                status: ShoppingCartStatus::Opened,
                product_items_count: 0,
                total_amount: Money::zero(),
                last_stream_position: StreamPosition::initial(),
            });
        if position <= cart.last_stream_position {
            return false;
        }

        match event {
            ShoppingCartEvent::ShoppingCartOpened(_) => cart.status = ShoppingCartStatus::Opened,
            ShoppingCartEvent::ProductItemAdded(e) => {
                cart.product_items_count += e.product_item.quantity;
                cart.total_amount += e.product_item.total_price();
            }
            ShoppingCartEvent::ProductItemRemoved(e) => {
                cart.product_items_count = cart
                    .product_items_count
                    .saturating_sub(e.product_item.quantity);
                cart.total_amount -= e.product_item.total_price();
            }
            ShoppingCartEvent::DiscountApplied(e) => {
                cart.total_amount = cart.total_amount.discounted(e.percent);
            }
            ShoppingCartEvent::ShoppingCartConfirmed(_) => {
                cart.status = ShoppingCartStatus::Confirmed
            }
            ShoppingCartEvent::ShoppingCartCancelled(_) => {
                cart.status = ShoppingCartStatus::Cancelled
            }
        }
        cart.last_stream_position = position;

        self.recompute_totals();
        true
    }

    fn recompute_totals(&mut self) {
        let mut pending = CartTotals::default();
        let mut confirmed = CartTotals::default();
        let mut cancelled = CartTotals::default();
        for cart in self.carts.values() {
            let totals = match cart.status {
                ShoppingCartStatus::Confirmed => &mut confirmed,
                ShoppingCartStatus::Cancelled => &mut cancelled,
                ShoppingCartStatus::Empty | ShoppingCartStatus::Opened => &mut pending,
            };
            totals.carts_count += 1;
            totals.product_items_count += cart.product_items_count;
            totals.total_amount += cart.total_amount;
        }
        self.pending = pending;
        self.confirmed = confirmed;
        self.cancelled = cancelled;
    }
}

/// Multi-stream projection keeping one [`ClientShoppingSummary`] document per client.
///
/// Fed by a [`ProjectionProcessor`](crate::ProjectionProcessor), so it lags
/// the log slightly and may see a message twice after a crash; per-cart
/// stream positions make re-delivery a no-op.
pub struct ClientShoppingSummaryProjection<S> {
    store: S,
    partition: PartitionKey,
}

impl<S: DocumentStore> ClientShoppingSummaryProjection<S> {
    pub const NAME: &'static str = "client_shopping_summary";

    pub fn new(store: S) -> Self {
        Self {
            store,
            partition: PartitionKey::default(),
        }
    }

    pub fn with_partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }

    /// Reads the summary of a client.
    pub async fn find(&self, client_id: ClientId) -> Result<Option<ClientShoppingSummary>> {
        let document = self
            .store
            .find_document(Self::NAME, &self.partition, &client_id.to_string())
            .await?;
        Ok(document
            .map(|d| d.decode::<ClientShoppingSummary>())
            .transpose()?)
    }
}

#[async_trait]
impl<S: DocumentStore> Projection for ClientShoppingSummaryProjection<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_handle(&self) -> &[&'static str] {
        ShoppingCartEvent::TYPES
    }

    async fn handle(&self, message: &RecordedMessage) -> Result<()> {
        let event: ShoppingCartEvent = message.decode()?;
        let document_id = event.client_id().to_string();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .find_document(Self::NAME, &self.partition, &document_id)
                .await?;
            let (mut summary, expected_version) = match current {
                Some(document) => (
                    document.decode::<ClientShoppingSummary>()?,
                    document.version,
                ),
                None => (ClientShoppingSummary::new(event.client_id()), 0),
            };

            if !summary.apply(message.stream_position, &event) {
                tracing::debug!(
                    stream_id = %message.stream_id,
                    position = %message.stream_position,
                    "message already in client summary"
                );
                return Ok(());
            }

            match self
                .store
                .upsert_document(
                    Self::NAME,
                    &self.partition,
                    &document_id,
                    serde_json::to_value(&summary)?,
                    Some(expected_version),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(EventStoreError::DocumentVersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProjectionError::DocumentContention {
            collection: Self::NAME.to_string(),
            document_id,
        })
    }

    async fn reset(&self) -> Result<()> {
        let removed = self
            .store
            .clear_collection(Self::NAME, &self.partition)
            .await?;
        tracing::info!(removed, "client summaries cleared");
        Ok(())
    }
}
