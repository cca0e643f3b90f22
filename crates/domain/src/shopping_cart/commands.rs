//! Shopping cart commands and the decisions they lead to.

use chrono::{DateTime, Utc};

use super::{
    ClientId, DiscountApplied, PricedProductItem, ProductItemAdded, ProductItemRemoved,
    ShoppingCart, ShoppingCartCancelled, ShoppingCartConfirmed, ShoppingCartError,
    ShoppingCartEvent, ShoppingCartId, ShoppingCartOpened, ShoppingCartStatus,
};

/// Intentions against a single shopping cart.
#[derive(Debug, Clone, PartialEq)]
pub enum ShoppingCartCommand {
    Open {
        client_id: ClientId,
    },
    AddProductItem {
        product_item: PricedProductItem,
    },
    RemoveProductItem {
        product_item: PricedProductItem,
    },
    ApplyDiscount {
        percent: u8,
        coupon_id: String,
    },
    Confirm,
    Cancel,
}

/// Decides which events `command` produces against the current cart.
///
/// Pure: `now` stamps the events, nothing is read from the environment.
pub fn decide(
    shopping_cart_id: ShoppingCartId,
    command: &ShoppingCartCommand,
    state: &ShoppingCart,
    now: DateTime<Utc>,
) -> Result<Vec<ShoppingCartEvent>, ShoppingCartError> {
    if let ShoppingCartCommand::Open { client_id } = command {
        if state.status != ShoppingCartStatus::Empty {
            return Err(ShoppingCartError::AlreadyOpened);
        }
        return Ok(vec![ShoppingCartEvent::ShoppingCartOpened(
            ShoppingCartOpened {
                shopping_cart_id,
                client_id: *client_id,
                opened_at: now,
            },
        )]);
    }

    let client_id = open_cart_client(state)?;

    let event = match command {
        ShoppingCartCommand::Open { .. } => unreachable!("handled above"),
        ShoppingCartCommand::AddProductItem { product_item } => {
            if product_item.quantity == 0 {
                return Err(ShoppingCartError::InvalidQuantity);
            }
            ShoppingCartEvent::ProductItemAdded(ProductItemAdded {
                shopping_cart_id,
                client_id,
                product_item: product_item.clone(),
                added_at: now,
            })
        }
        ShoppingCartCommand::RemoveProductItem { product_item } => {
            if product_item.quantity == 0 {
                return Err(ShoppingCartError::InvalidQuantity);
            }
            if state.quantity_of(product_item) < product_item.quantity {
                return Err(ShoppingCartError::ProductItemNotFound {
                    product_id: product_item.product_id.to_string(),
                });
            }
            ShoppingCartEvent::ProductItemRemoved(ProductItemRemoved {
                shopping_cart_id,
                client_id,
                product_item: product_item.clone(),
                removed_at: now,
            })
        }
        ShoppingCartCommand::ApplyDiscount { percent, coupon_id } => {
            if *percent == 0 || *percent > 100 {
                return Err(ShoppingCartError::InvalidDiscount { percent: *percent });
            }
            if state.applied_coupons.contains(coupon_id) {
                return Err(ShoppingCartError::DiscountAlreadyApplied {
                    coupon_id: coupon_id.clone(),
                });
            }
            ShoppingCartEvent::DiscountApplied(DiscountApplied {
                shopping_cart_id,
                client_id,
                percent: *percent,
                coupon_id: coupon_id.clone(),
                applied_at: now,
            })
        }
        ShoppingCartCommand::Confirm => {
            if state.product_items.is_empty() {
                return Err(ShoppingCartError::NoItems);
            }
            ShoppingCartEvent::ShoppingCartConfirmed(ShoppingCartConfirmed {
                shopping_cart_id,
                client_id,
                confirmed_at: now,
            })
        }
        ShoppingCartCommand::Cancel => {
            ShoppingCartEvent::ShoppingCartCancelled(ShoppingCartCancelled {
                shopping_cart_id,
                client_id,
                cancelled_at: now,
            })
        }
    };

    Ok(vec![event])
}

/// The owning client of an open cart; any other status rejects the command.
fn open_cart_client(state: &ShoppingCart) -> Result<ClientId, ShoppingCartError> {
    match (state.status, state.client_id) {
        (ShoppingCartStatus::Opened, Some(client_id)) => Ok(client_id),
        (ShoppingCartStatus::Empty, _) | (ShoppingCartStatus::Opened, None) => {
            Err(ShoppingCartError::NotOpened)
        }
        (status, _) => Err(ShoppingCartError::Closed { status }),
    }
}
