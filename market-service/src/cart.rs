use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::api::AppState;
use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::models::{CartItem, NewCartItem, Product};
use crate::schema::{cart_items, products};

#[derive(Debug, Deserialize, Validate)]
pub struct AddCartItemRequest {
    pub product_id: Uuid,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateCartItemRequest {
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct ProductSummary {
    pub id: Uuid,
    pub name: String,
    pub price: bigdecimal::BigDecimal,
    pub stock: i32,
    pub image_url: Option<String>,
    pub farmer_id: Uuid,
}

impl From<Product> for ProductSummary {
    fn from(p: Product) -> Self {
        Self {
            id: p.id,
            name: p.name,
            price: p.price,
            stock: p.stock,
            image_url: p.image_url,
            farmer_id: p.farmer_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CartEntry {
    pub item: CartItem,
    pub product: ProductSummary,
}

#[derive(Debug, Serialize)]
pub struct CartListResponse {
    pub items: Vec<CartEntry>,
}

#[derive(Debug, Serialize)]
pub struct CartItemResponse {
    pub item: CartItem,
}

pub async fn list_cart(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<CartListResponse>> {
    let mut conn = state.pool.get().await?;
    let rows: Vec<(CartItem, Product)> = cart_items::table
        .inner_join(products::table)
        .filter(cart_items::user_id.eq(identity.user_id))
        .order(cart_items::created_at.desc())
        .load(&mut conn)
        .await?;

    Ok(Json(CartListResponse {
        items: rows
            .into_iter()
            .map(|(item, product)| CartEntry {
                item,
                product: product.into(),
            })
            .collect(),
    }))
}

/// Adds goods to the caller's cart, merging into the existing row when the
/// product is already there. The stock check here is advisory; the checkout
/// reservation is the authoritative one.
pub async fn add_to_cart(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<AddCartItemRequest>,
) -> ApiResult<(StatusCode, Json<CartItemResponse>)> {
    identity.require_customer()?;
    request.validate()?;

    let mut conn = state.pool.get().await?;
    let product = products::table
        .find(request.product_id)
        .first::<Product>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("product not found".to_string()))?;

    if product.stock < request.quantity {
        return Err(ApiError::InsufficientStock(product.id));
    }

    let item: CartItem = diesel::insert_into(cart_items::table)
        .values(&NewCartItem {
            id: Uuid::new_v4(),
            user_id: identity.user_id,
            product_id: request.product_id,
            quantity: request.quantity,
        })
        .on_conflict((cart_items::user_id, cart_items::product_id))
        .do_update()
        .set((
            cart_items::quantity.eq(cart_items::quantity + request.quantity),
            cart_items::updated_at.eq(Utc::now()),
        ))
        .get_result(&mut conn)
        .await?;

    Ok((StatusCode::CREATED, Json(CartItemResponse { item })))
}

pub async fn update_cart_item(
    State(state): State<AppState>,
    identity: Identity,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateCartItemRequest>,
) -> ApiResult<Json<CartItemResponse>> {
    request.validate()?;

    let mut conn = state.pool.get().await?;
    let item = cart_items::table
        .find(item_id)
        .first::<CartItem>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("cart item not found".to_string()))?;

    if item.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "cart item belongs to another user".to_string(),
        ));
    }

    let product = products::table
        .find(item.product_id)
        .first::<Product>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("product not found".to_string()))?;

    if product.stock < request.quantity {
        return Err(ApiError::InsufficientStock(product.id));
    }

    let updated: CartItem = diesel::update(cart_items::table.find(item_id))
        .set((
            cart_items::quantity.eq(request.quantity),
            cart_items::updated_at.eq(Utc::now()),
        ))
        .get_result(&mut conn)
        .await?;

    Ok(Json(CartItemResponse { item: updated }))
}

pub async fn remove_cart_item(
    State(state): State<AppState>,
    identity: Identity,
    Path(item_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut conn = state.pool.get().await?;
    let item = cart_items::table
        .find(item_id)
        .first::<CartItem>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("cart item not found".to_string()))?;

    if item.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "cart item belongs to another user".to_string(),
        ));
    }

    diesel::delete(cart_items::table.find(item_id))
        .execute(&mut conn)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
