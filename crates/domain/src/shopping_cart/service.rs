//! Shopping cart service providing a simplified API for cart operations.

use chrono::Utc;
use common::PartitionKey;
use event_store::EventStore;

use crate::command::{CommandHandler, CommandHandlerResult, HandleOptions};
use crate::error::DomainError;
use crate::retry::RetryPolicy;

use super::{
    ClientId, PricedProductItem, STREAM_TYPE, ShoppingCart, ShoppingCartCommand,
    ShoppingCartEvent, ShoppingCartId, decide, evolve, initial_state,
};

pub type ShoppingCartResult = CommandHandlerResult<ShoppingCart, ShoppingCartEvent>;

/// Service for managing shopping carts.
///
/// Wraps the command handler with the cart's evolve and decide functions.
/// Commands that lose a concurrency race are retried per the configured
/// policy, which by default never retries.
pub struct ShoppingCartService<S: EventStore> {
    handler: CommandHandler<S, ShoppingCart, ShoppingCartEvent>,
    partition: PartitionKey,
    retry: RetryPolicy,
}

impl<S: EventStore> ShoppingCartService<S> {
    /// Creates a new shopping cart service with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store, evolve, initial_state).with_stream_type(STREAM_TYPE),
            partition: PartitionKey::default(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &CommandHandler<S, ShoppingCart, ShoppingCartEvent> {
        &self.handler
    }

    /// Current state of a cart, `None` if it was never opened.
    pub async fn get(&self, cart_id: ShoppingCartId) -> Result<Option<ShoppingCart>, DomainError> {
        let loaded = self
            .handler
            .load(&cart_id.stream_id(), &self.partition)
            .await?;
        Ok(loaded.map(|(state, _)| state))
    }

    /// Runs any cart command.
    #[tracing::instrument(skip(self))]
    pub async fn execute(
        &self,
        cart_id: ShoppingCartId,
        command: ShoppingCartCommand,
    ) -> Result<ShoppingCartResult, DomainError> {
        self.handler
            .handle_with_retry(
                &cart_id.stream_id(),
                |state| decide(cart_id, &command, state, Utc::now()),
                HandleOptions::new().partition(self.partition.clone()),
                self.retry,
            )
            .await
    }

    pub async fn open(
        &self,
        cart_id: ShoppingCartId,
        client_id: ClientId,
    ) -> Result<ShoppingCartResult, DomainError> {
        self.execute(cart_id, ShoppingCartCommand::Open { client_id })
            .await
    }

    pub async fn add_product_item(
        &self,
        cart_id: ShoppingCartId,
        product_item: PricedProductItem,
    ) -> Result<ShoppingCartResult, DomainError> {
        self.execute(cart_id, ShoppingCartCommand::AddProductItem { product_item })
            .await
    }

    pub async fn remove_product_item(
        &self,
        cart_id: ShoppingCartId,
        product_item: PricedProductItem,
    ) -> Result<ShoppingCartResult, DomainError> {
        self.execute(cart_id, ShoppingCartCommand::RemoveProductItem { product_item })
            .await
    }

    pub async fn apply_discount(
        &self,
        cart_id: ShoppingCartId,
        percent: u8,
        coupon_id: impl Into<String>,
    ) -> Result<ShoppingCartResult, DomainError> {
        self.execute(
            cart_id,
            ShoppingCartCommand::ApplyDiscount {
                percent,
                coupon_id: coupon_id.into(),
            },
        )
        .await
    }

    pub async fn confirm(&self, cart_id: ShoppingCartId) -> Result<ShoppingCartResult, DomainError> {
        self.execute(cart_id, ShoppingCartCommand::Confirm).await
    }

    pub async fn cancel(&self, cart_id: ShoppingCartId) -> Result<ShoppingCartResult, DomainError> {
        self.execute(cart_id, ShoppingCartCommand::Cancel).await
    }
}
