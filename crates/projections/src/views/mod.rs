//! Read model views over the shopping cart streams.

pub mod client_shopping_summary;
pub mod shopping_cart_details;

pub use client_shopping_summary::{
    CartTotals, ClientCart, ClientShoppingSummary, ClientShoppingSummaryProjection,
};
pub use shopping_cart_details::{ShoppingCartDetails, ShoppingCartDetailsProjection};
