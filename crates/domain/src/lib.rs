//! Domain layer for the event-sourcing system.
//!
//! This crate provides:
//! - `CommandHandler` running the read, decide, append cycle with evolve/decide functions
//! - `RetryPolicy` for re-running commands that lost a concurrency race
//! - The shopping cart reference domain

pub mod command;
pub mod error;
pub mod retry;
pub mod shopping_cart;

pub use command::{CommandHandler, CommandHandlerResult, HandleOptions};
pub use error::DomainError;
pub use event_store::DomainEvent;
pub use retry::RetryPolicy;
pub use shopping_cart::{
    ClientId, DiscountApplied, Money, PricedProductItem, ProductId, ProductItemAdded,
    ProductItemRemoved, ShoppingCart, ShoppingCartCancelled, ShoppingCartCommand,
    ShoppingCartConfirmed, ShoppingCartError, ShoppingCartEvent, ShoppingCartId,
    ShoppingCartOpened, ShoppingCartService, ShoppingCartStatus,
};
