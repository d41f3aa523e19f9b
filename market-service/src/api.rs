use std::sync::Arc;

use axum::routing::{get, patch, post, put};
use axum::Router;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::AsyncPgConnection;

use crate::notify::NotificationDispatcher;
use crate::stripe::PaymentProvider;
use crate::{cart, checkout, orders, payments};

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub provider: Arc<dyn PaymentProvider>,
    pub notifier: Arc<NotificationDispatcher>,
    pub currency: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/cart", get(cart::list_cart).post(cart::add_to_cart))
        .route(
            "/cart/:id",
            patch(cart::update_cart_item).delete(cart::remove_cart_item),
        )
        .route("/orders/checkout", post(checkout::checkout))
        .route("/orders/my", get(orders::list_my_orders))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route("/orders/:id/status", put(orders::update_order_status))
        .route("/farmer/orders", get(orders::list_farmer_orders))
        .route("/payments", post(payments::create_payment_intent))
        .route("/payments/refund", post(payments::refund_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/webhooks/payments", post(payments::payment_webhook))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}
