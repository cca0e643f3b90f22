//! Shopping cart reference domain.

mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use commands::{ShoppingCartCommand, decide};
pub use events::{
    DiscountApplied, ProductItemAdded, ProductItemRemoved, ShoppingCartCancelled,
    ShoppingCartConfirmed, ShoppingCartEvent, ShoppingCartOpened,
};
pub use service::ShoppingCartService;
pub use state::{ShoppingCart, ShoppingCartStatus, evolve, initial_state};
pub use value_objects::{ClientId, Money, PricedProductItem, ProductId, ShoppingCartId};

use thiserror::Error;

use crate::error::DomainError;

/// Stream type recorded for cart streams; also the stream id prefix.
pub const STREAM_TYPE: &str = "shopping_cart";

/// Commands a cart in its current state cannot accept.
#[derive(Debug, Error)]
pub enum ShoppingCartError {
    #[error("Shopping cart is not opened")]
    NotOpened,

    #[error("Shopping cart is already opened")]
    AlreadyOpened,

    /// Confirmed or cancelled carts are immutable.
    #[error("Shopping cart is {status}")]
    Closed { status: ShoppingCartStatus },

    #[error("Product item not found: {product_id}")]
    ProductItemNotFound { product_id: String },

    #[error("Discount already applied: {coupon_id}")]
    DiscountAlreadyApplied { coupon_id: String },

    #[error("Quantity must be greater than 0")]
    InvalidQuantity,

    #[error("Invalid discount: {percent}% (must be between 1 and 100)")]
    InvalidDiscount { percent: u8 },

    #[error("Shopping cart has no items")]
    NoItems,
}

impl From<ShoppingCartError> for DomainError {
    fn from(e: ShoppingCartError) -> Self {
        DomainError::IllegalState(e.to_string())
    }
}
