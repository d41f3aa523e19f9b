use std::collections::HashMap;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use shared::OrderStatus;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::api::AppState;
use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::inventory;
use crate::models::{CartItem, NewOrder, Order, OrderItem, Product};
use crate::notify;
use crate::orders::OrderResponse;
use crate::schema::{cart_items, order_items, orders, products};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const MAX_ORDERS_PER_WINDOW: i64 = 5;
pub const RATE_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    /// Explicit order lines; omitted or null means "check out my cart".
    #[validate(nested)]
    pub products: Option<Vec<CheckoutLine>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

/// A checkout line resolved against the catalog, carrying the product row
/// whose price becomes the order-item snapshot.
#[derive(Debug, Clone)]
struct ResolvedLine {
    product: Product,
    quantity: i32,
}

pub async fn checkout(
    State(state): State<AppState>,
    identity: Identity,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<OrderResponse>)> {
    identity.require_customer()?;
    request.validate()?;
    let key = idempotency_key(&headers)?;

    let mut conn = state.pool.get().await?;

    // A replayed key observes the first request's outcome, never a new order.
    if let Some(existing) = order_by_key(&mut conn, &key).await? {
        info!(order_id = %existing.id, "idempotency key replayed, returning existing order");
        let items = items_for_order(&mut conn, existing.id).await?;
        return Ok((
            StatusCode::OK,
            Json(OrderResponse {
                order: existing,
                items,
            }),
        ));
    }

    enforce_rate_limit(&mut conn, identity.user_id).await?;

    let (lines, from_cart) = resolve_lines(&mut conn, &identity, &request).await?;

    let user_id = identity.user_id;
    let txn_key = key.clone();
    let result = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                // Reserve every line first; one failed guard rolls back all of
                // them along with the order itself.
                for line in &lines {
                    inventory::reserve(conn, line.product.id, line.quantity).await?;
                }

                let total = order_total(&lines);
                let order: Order = diesel::insert_into(orders::table)
                    .values(&NewOrder {
                        id: Uuid::new_v4(),
                        user_id,
                        status: OrderStatus::Pending.as_str().to_string(),
                        total_amount: total,
                        idempotency_key: Some(txn_key),
                    })
                    .get_result(conn)
                    .await?;

                let items: Vec<OrderItem> = lines
                    .iter()
                    .map(|line| OrderItem {
                        id: Uuid::new_v4(),
                        order_id: order.id,
                        product_id: line.product.id,
                        quantity: line.quantity,
                        price: line.product.price.clone(),
                    })
                    .collect();
                diesel::insert_into(order_items::table)
                    .values(&items)
                    .execute(conn)
                    .await?;

                if from_cart {
                    diesel::delete(cart_items::table.filter(cart_items::user_id.eq(user_id)))
                        .execute(conn)
                        .await?;
                }

                Ok((order, items))
            })
        })
        .await;

    let (order, items) = match result {
        Ok(created) => created,
        // Lost the unique-key insert race against a concurrent retry; the
        // winner's order is the one both requests report.
        Err(ApiError::Conflict(_)) => {
            if let Some(existing) = order_by_key(&mut conn, &key).await? {
                let items = items_for_order(&mut conn, existing.id).await?;
                return Ok((
                    StatusCode::OK,
                    Json(OrderResponse {
                        order: existing,
                        items,
                    }),
                ));
            }
            return Err(ApiError::Conflict("duplicate order".to_string()));
        }
        Err(e) => return Err(e),
    };

    info!(order_id = %order.id, total = %order.total_amount, "order created");

    // Best-effort; a notification problem must never fail the checkout.
    match notify::order_placed_messages(&mut conn, &order).await {
        Ok(messages) => state.notifier.dispatch(messages),
        Err(e) => warn!(order_id = %order.id, error = %e, "could not assemble order notifications"),
    }

    Ok((StatusCode::CREATED, Json(OrderResponse { order, items })))
}

/// The idempotency key must be a canonical UUID; it is stored in canonical
/// form so replays with different casing still match.
fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("idempotency-key header is required"))?;
    let key = Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::validation("idempotency-key must be a canonical UUID"))?;
    Ok(key.to_string())
}

async fn order_by_key(
    conn: &mut AsyncPgConnection,
    key: &str,
) -> Result<Option<Order>, ApiError> {
    let order = orders::table
        .filter(orders::idempotency_key.eq(key))
        .first::<Order>(conn)
        .await
        .optional()?;
    Ok(order)
}

async fn items_for_order(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
) -> Result<Vec<OrderItem>, ApiError> {
    let items = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .load::<OrderItem>(conn)
        .await?;
    Ok(items)
}

/// Sliding window over order creation times, not a fixed bucket.
async fn enforce_rate_limit(conn: &mut AsyncPgConnection, user_id: Uuid) -> Result<(), ApiError> {
    let cutoff = Utc::now() - Duration::minutes(RATE_WINDOW_MINUTES);
    let recent: i64 = orders::table
        .filter(orders::user_id.eq(user_id))
        .filter(orders::created_at.gt(cutoff))
        .count()
        .get_result(conn)
        .await?;
    if recent >= MAX_ORDERS_PER_WINDOW {
        return Err(ApiError::RateLimited);
    }
    Ok(())
}

async fn resolve_lines(
    conn: &mut AsyncPgConnection,
    identity: &Identity,
    request: &CheckoutRequest,
) -> Result<(Vec<ResolvedLine>, bool), ApiError> {
    match &request.products {
        Some(requested) if !requested.is_empty() => {
            let wanted = merge_lines(requested);
            let ids: Vec<Uuid> = wanted.iter().map(|(id, _)| *id).collect();
            let found: Vec<Product> = products::table
                .filter(products::id.eq_any(&ids))
                .load(conn)
                .await?;
            if found.len() != ids.len() {
                return Err(ApiError::NotFound("some products not found".to_string()));
            }
            let by_id: HashMap<Uuid, Product> = found.into_iter().map(|p| (p.id, p)).collect();

            let mut lines = Vec::with_capacity(wanted.len());
            for (product_id, quantity) in wanted {
                let product = by_id
                    .get(&product_id)
                    .cloned()
                    .ok_or_else(|| ApiError::internal("resolved product disappeared"))?;
                lines.push(ResolvedLine { product, quantity });
            }
            Ok((lines, false))
        }
        Some(_) => Err(ApiError::validation("at least one product is required")),
        None => {
            let rows: Vec<(CartItem, Product)> = cart_items::table
                .inner_join(products::table)
                .filter(cart_items::user_id.eq(identity.user_id))
                .load(conn)
                .await?;
            if rows.is_empty() {
                return Err(ApiError::validation("cart is empty"));
            }
            let lines = rows
                .into_iter()
                .map(|(item, product)| ResolvedLine {
                    product,
                    quantity: item.quantity,
                })
                .collect();
            Ok((lines, true))
        }
    }
}

/// Collapses repeated product ids into one line each, preserving the order
/// of first appearance.
fn merge_lines(requested: &[CheckoutLine]) -> Vec<(Uuid, i32)> {
    let mut merged: Vec<(Uuid, i32)> = Vec::new();
    for line in requested {
        if let Some(entry) = merged.iter_mut().find(|(id, _)| *id == line.product_id) {
            entry.1 += line.quantity;
        } else {
            merged.push((line.product_id, line.quantity));
        }
    }
    merged
}

fn order_total(lines: &[ResolvedLine]) -> BigDecimal {
    lines.iter().fold(BigDecimal::from(0), |acc, line| {
        acc + &line.product.price * BigDecimal::from(line.quantity)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::str::FromStr;

    fn product(price: BigDecimal) -> Product {
        Product {
            id: Uuid::new_v4(),
            farmer_id: Uuid::new_v4(),
            name: "produce".to_string(),
            price,
            stock: 100,
            image_url: None,
            created_at: None,
        }
    }

    #[test]
    fn total_uses_price_snapshots() {
        // 2 x 50 + 1 x 100 = 200
        let lines = vec![
            ResolvedLine {
                product: product(BigDecimal::from(50)),
                quantity: 2,
            },
            ResolvedLine {
                product: product(BigDecimal::from(100)),
                quantity: 1,
            },
        ];
        assert_eq!(order_total(&lines), BigDecimal::from(200));
    }

    #[test]
    fn total_is_exact_for_decimal_prices() {
        let lines = vec![
            ResolvedLine {
                product: product(BigDecimal::from_str("19.99").expect("decimal")),
                quantity: 3,
            },
            ResolvedLine {
                product: product(BigDecimal::from_str("0.01").expect("decimal")),
                quantity: 3,
            },
        ];
        assert_eq!(
            order_total(&lines),
            BigDecimal::from_str("60.00").expect("decimal")
        );
    }

    #[test]
    fn duplicate_lines_merge_by_product() {
        let shared_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        let requested = vec![
            CheckoutLine {
                product_id: shared_id,
                quantity: 1,
            },
            CheckoutLine {
                product_id: other_id,
                quantity: 2,
            },
            CheckoutLine {
                product_id: shared_id,
                quantity: 4,
            },
        ];
        let merged = merge_lines(&requested);
        assert_eq!(merged, vec![(shared_id, 5), (other_id, 2)]);
    }

    #[test]
    fn idempotency_key_is_canonicalized() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IDEMPOTENCY_KEY_HEADER,
            HeaderValue::from_static("D9B2D63D-A233-4123-847A-0D6FB4D9F5BC"),
        );
        assert_eq!(
            idempotency_key(&headers).expect("key"),
            "d9b2d63d-a233-4123-847a-0d6fb4d9f5bc"
        );
    }

    #[test]
    fn missing_or_malformed_key_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            idempotency_key(&headers),
            Err(ApiError::Validation(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("order-1"));
        assert!(matches!(
            idempotency_key(&headers),
            Err(ApiError::Validation(_))
        ));
    }
}
