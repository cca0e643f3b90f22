//! Projections deriving read models from the message log.
//!
//! This crate provides:
//! - [`Projection`] trait for handling messages delivered from the log
//! - [`ProjectionProcessor`] for checkpointed, lease-guarded delivery across instances
//! - Shopping cart views: cart details (inline) and client summaries (asynchronous)

pub mod error;
pub mod processor;
pub mod projection;
pub mod views;

pub use error::{ProjectionError, Result};
pub use processor::{ProcessorOptions, ProcessorTick, ProjectionProcessor};
pub use projection::Projection;
pub use views::{
    CartTotals, ClientCart, ClientShoppingSummary, ClientShoppingSummaryProjection, ShoppingCartDetails,
    ShoppingCartDetailsProjection,
};
