use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::{staff_transition_allowed, OrderStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::inventory;
use crate::models::{Order, OrderItem, Payment};
use crate::notify;
use crate::schema::{order_items, orders, payments, products};

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize)]
pub struct OrderDetailResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderDetailResponse>,
}

#[derive(Debug, Serialize)]
pub struct FarmerOrderListResponse {
    pub orders: Vec<OrderResponse>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

async fn load_owned_order(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    identity: &Identity,
) -> Result<Order, ApiError> {
    let order = orders::table
        .find(order_id)
        .first::<Order>(conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("order not found".to_string()))?;
    if order.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "order belongs to another user".to_string(),
        ));
    }
    Ok(order)
}

pub async fn get_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderDetailResponse>> {
    let mut conn = state.pool.get().await?;
    let order = load_owned_order(&mut conn, order_id, &identity).await?;

    let items = order_items::table
        .filter(order_items::order_id.eq(order.id))
        .load::<OrderItem>(&mut conn)
        .await?;
    let payment_rows = payments::table
        .filter(payments::order_id.eq(order.id))
        .load::<Payment>(&mut conn)
        .await?;

    Ok(Json(OrderDetailResponse {
        order,
        items,
        payments: payment_rows,
    }))
}

pub async fn list_my_orders(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<OrderListResponse>> {
    let mut conn = state.pool.get().await?;
    let mine: Vec<Order> = orders::table
        .filter(orders::user_id.eq(identity.user_id))
        .order(orders::created_at.desc())
        .load(&mut conn)
        .await?;

    let ids: Vec<Uuid> = mine.iter().map(|o| o.id).collect();
    let mut items_by_order = group_items(
        order_items::table
            .filter(order_items::order_id.eq_any(&ids))
            .load::<OrderItem>(&mut conn)
            .await?,
        |item| item.order_id,
    );
    let mut payments_by_order = group_items(
        payments::table
            .filter(payments::order_id.eq_any(&ids))
            .load::<Payment>(&mut conn)
            .await?,
        |payment| payment.order_id,
    );

    let orders = mine
        .into_iter()
        .map(|order| {
            let items = items_by_order.remove(&order.id).unwrap_or_default();
            let payments = payments_by_order.remove(&order.id).unwrap_or_default();
            OrderDetailResponse {
                order,
                items,
                payments,
            }
        })
        .collect();
    Ok(Json(OrderListResponse { orders }))
}

/// Orders that contain at least one of the calling farmer's products.
pub async fn list_farmer_orders(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<FarmerOrderListResponse>> {
    identity.require_farmer()?;

    let mut conn = state.pool.get().await?;
    let relevant: Vec<Order> = orders::table
        .inner_join(order_items::table.inner_join(products::table))
        .filter(products::farmer_id.eq(identity.user_id))
        .select(orders::all_columns)
        .distinct()
        .order(orders::created_at.desc())
        .load(&mut conn)
        .await?;

    let ids: Vec<Uuid> = relevant.iter().map(|o| o.id).collect();
    let mut items_by_order = group_items(
        order_items::table
            .filter(order_items::order_id.eq_any(&ids))
            .load::<OrderItem>(&mut conn)
            .await?,
        |item| item.order_id,
    );

    let orders = relevant
        .into_iter()
        .map(|order| OrderResponse {
            items: items_by_order.remove(&order.id).unwrap_or_default(),
            order,
        })
        .collect();
    Ok(Json(FarmerOrderListResponse { orders }))
}

/// Customer cancellation. Only PENDING orders qualify, and the status flip
/// and the stock release commit together or not at all.
pub async fn cancel_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    identity.require_customer()?;

    let mut conn = state.pool.get().await?;
    let order = load_owned_order(&mut conn, order_id, &identity).await?;

    let status = order
        .status()
        .ok_or_else(|| ApiError::internal(format!("order {} has unknown status", order.id)))?;
    if status != OrderStatus::Pending {
        return Err(ApiError::Conflict(
            "only pending orders can be cancelled".to_string(),
        ));
    }

    let items = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                cancel_and_release(conn, order_id, OrderStatus::Pending).await
            })
        })
        .await?;

    info!(order_id = %order_id, "order cancelled by customer");

    let order = orders::table
        .find(order_id)
        .first::<Order>(&mut conn)
        .await?;
    Ok(Json(OrderResponse { order, items }))
}

/// Flips `expected` -> CANCELLED and releases every line's reservation in
/// the caller's transaction. The guarded update keeps a concurrent
/// transition (e.g. the payment webhook confirming) from being clobbered.
async fn cancel_and_release(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    expected: OrderStatus,
) -> Result<Vec<OrderItem>, ApiError> {
    let affected = diesel::update(
        orders::table
            .filter(orders::id.eq(order_id))
            .filter(orders::status.eq(expected.as_str())),
    )
    .set((
        orders::status.eq(OrderStatus::Cancelled.as_str()),
        orders::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;
    if affected == 0 {
        return Err(ApiError::Conflict(
            "order status changed concurrently".to_string(),
        ));
    }

    let items = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .load::<OrderItem>(conn)
        .await?;
    for item in &items {
        inventory::release(conn, item.product_id, item.quantity).await?;
    }
    Ok(items)
}

/// Staff-driven status change (fulfilment advance or admin cancel).
pub async fn update_order_status(
    State(state): State<AppState>,
    identity: Identity,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> ApiResult<Json<OrderResponse>> {
    identity.require_staff()?;

    let next = OrderStatus::parse(&request.status).ok_or_else(|| {
        ApiError::validation(format!("invalid order status {:?}", request.status))
    })?;

    let mut conn = state.pool.get().await?;
    let order = orders::table
        .find(order_id)
        .first::<Order>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("order not found".to_string()))?;

    let current = order
        .status()
        .ok_or_else(|| ApiError::internal(format!("order {} has unknown status", order.id)))?;
    if !staff_transition_allowed(identity.role, current, next) {
        return Err(ApiError::Conflict(format!(
            "cannot change order from {} to {}",
            current, next
        )));
    }

    let items = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                if next == OrderStatus::Cancelled {
                    // Admin override: the reservation goes back with the flip.
                    return cancel_and_release(conn, order_id, current).await;
                }

                let affected = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::status.eq(current.as_str())),
                )
                .set((
                    orders::status.eq(next.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
                if affected == 0 {
                    return Err(ApiError::Conflict(
                        "order status changed concurrently".to_string(),
                    ));
                }

                let items = order_items::table
                    .filter(order_items::order_id.eq(order_id))
                    .load::<OrderItem>(conn)
                    .await?;
                Ok(items)
            })
        })
        .await?;

    let order = orders::table
        .find(order_id)
        .first::<Order>(&mut conn)
        .await?;
    info!(order_id = %order.id, status = %order.status, "order status updated");

    // Best-effort fan-out to the involved farmers and the customer.
    match notify::status_changed_messages(&mut conn, &order).await {
        Ok(messages) => state.notifier.dispatch(messages),
        Err(e) => warn!(order_id = %order.id, error = %e, "could not assemble status notifications"),
    }

    Ok(Json(OrderResponse { order, items }))
}

fn group_items<T, K, F>(rows: Vec<T>, key: F) -> HashMap<K, Vec<T>>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut grouped: HashMap<K, Vec<T>> = HashMap::new();
    for row in rows {
        grouped.entry(key(&row)).or_default().push(row);
    }
    grouped
}
