use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use shared::{OrderStatus, PaymentStatus};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::api::AppState;
use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::models::{NewPayment, NewProcessedWebhookEvent, Order, Payment};
use crate::notify;
use crate::schema::{orders, payments, processed_webhook_events};
use crate::stripe::{IntentMetadata, Refund, WebhookEvent};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    pub client_secret: String,
    pub payment_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    /// Major units; omitted means a full refund.
    #[validate(range(min = 0.01, message = "refund amount must be positive"))]
    pub amount: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub refund: Refund,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// The provider charges in minor units; the order total is kept in major
/// units and converted with `round(total * 100)`.
fn minor_units(amount: &BigDecimal) -> Option<i64> {
    (amount * BigDecimal::from(100)).round(0).to_i64()
}

/// Creates an external payment intent for a PENDING order and records the
/// local attempt. No local row is written if the provider call fails.
pub async fn create_payment_intent(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<CreatePaymentRequest>,
) -> ApiResult<Json<CreatePaymentResponse>> {
    identity.require_customer()?;

    let mut conn = state.pool.get().await?;
    let order = orders::table
        .find(request.order_id)
        .first::<Order>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("order not found".to_string()))?;

    if order.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "only the order owner may pay".to_string(),
        ));
    }
    let status = order
        .status()
        .ok_or_else(|| ApiError::internal(format!("order {} has unknown status", order.id)))?;
    if status != OrderStatus::Pending {
        return Err(ApiError::Conflict(
            "order is not in a payable state".to_string(),
        ));
    }

    let in_flight: i64 = payments::table
        .filter(payments::order_id.eq(order.id))
        .filter(payments::status.eq(PaymentStatus::Pending.as_str()))
        .count()
        .get_result(&mut conn)
        .await?;
    if in_flight > 0 {
        return Err(ApiError::Conflict(
            "a payment for this order is already in progress".to_string(),
        ));
    }

    let amount_minor = minor_units(&order.total_amount)
        .ok_or_else(|| ApiError::internal("order total is not representable in minor units"))?;

    let intent = state
        .provider
        .create_payment_intent(
            amount_minor,
            &state.currency,
            IntentMetadata {
                order_id: order.id,
                user_id: order.user_id,
            },
        )
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    let payment: Payment = diesel::insert_into(payments::table)
        .values(&NewPayment {
            id: Uuid::new_v4(),
            order_id: order.id,
            external_payment_id: intent.id,
            amount: order.total_amount.clone(),
            currency: state.currency.clone(),
            status: PaymentStatus::Pending.as_str().to_string(),
        })
        .get_result(&mut conn)
        .await?;

    info!(order_id = %order.id, payment_id = %payment.id, "payment intent created");

    Ok(Json(CreatePaymentResponse {
        client_secret: intent.client_secret,
        payment_id: payment.id,
    }))
}

pub async fn get_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    let mut conn = state.pool.get().await?;
    let payment = payments::table
        .find(payment_id)
        .first::<Payment>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("payment not found".to_string()))?;

    let order = orders::table
        .find(payment.order_id)
        .first::<Order>(&mut conn)
        .await?;
    if order.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "payment belongs to another user".to_string(),
        ));
    }
    Ok(Json(payment))
}

/// Owner-requested refund. The provider call happens first; the local row is
/// then marked REFUNDED optimistically, with the webhook remaining the
/// authority (replays are absorbed by the payment transition rules).
pub async fn refund_payment(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<RefundRequest>,
) -> ApiResult<Json<RefundResponse>> {
    request.validate()?;

    let mut conn = state.pool.get().await?;
    let payment = payments::table
        .find(request.payment_id)
        .first::<Payment>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("payment not found".to_string()))?;

    let order = orders::table
        .find(payment.order_id)
        .first::<Order>(&mut conn)
        .await?;
    if order.user_id != identity.user_id {
        return Err(ApiError::Forbidden(
            "only the order owner may refund".to_string(),
        ));
    }

    let status = payment
        .status()
        .ok_or_else(|| ApiError::internal(format!("payment {} has unknown status", payment.id)))?;
    if status != PaymentStatus::Succeeded {
        return Err(ApiError::Conflict(
            "only settled payments can be refunded".to_string(),
        ));
    }

    let amount_minor = match request.amount {
        Some(amount) => {
            let requested = (amount * 100.0).round() as i64;
            let captured = minor_units(&payment.amount)
                .ok_or_else(|| ApiError::internal("captured amount is not representable"))?;
            if requested > captured {
                return Err(ApiError::validation(
                    "refund amount exceeds the captured amount",
                ));
            }
            Some(requested)
        }
        None => None,
    };

    let refund = state
        .provider
        .create_refund(&payment.external_payment_id, amount_minor)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    diesel::update(payments::table.find(payment.id))
        .set((
            payments::status.eq(PaymentStatus::Refunded.as_str()),
            payments::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

    info!(payment_id = %payment.id, refund_id = %refund.id, "refund issued");

    Ok(Json(RefundResponse { refund }))
}

/// Provider webhook. Signature failures reject with 400 and process nothing;
/// once the event is verified, local failures are logged but the endpoint
/// still acknowledges so the provider stops redelivering.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::InvalidSignature("missing stripe-signature header".to_string())
        })?;

    let event = state
        .provider
        .verify_and_parse(&body, signature)
        .map_err(|e| ApiError::InvalidSignature(e.to_string()))?;

    if let Err(e) = reconcile(&state, &event).await {
        error!(event_id = %event.id, error = %e, "webhook reconciliation failed locally");
    }

    Ok(Json(WebhookAck { received: true }))
}

/// Applies a verified event exactly once, keyed by its external id. The
/// event insert and every status move share one transaction, and settled
/// payment rows are guarded by status so a stale replay cannot regress them.
async fn reconcile(state: &AppState, event: &WebhookEvent) -> Result<(), ApiError> {
    let mut conn = state.pool.get().await?;

    let event_row = NewProcessedWebhookEvent {
        event_id: event.id.clone(),
        event_type: event.kind.clone(),
    };
    let kind = event.kind.clone();
    let event_id = event.id.clone();
    let intent_id = event.intent_id().map(str::to_owned);

    let confirmed_order = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                let fresh = diesel::insert_into(processed_webhook_events::table)
                    .values(&event_row)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if fresh == 0 {
                    debug!(event_id = %event_id, "webhook event replayed, ignoring");
                    return Ok(None);
                }

                let Some(intent_id) = intent_id else {
                    debug!(event_id = %event_id, kind = %kind, "event carries no payment intent");
                    return Ok(None);
                };
                let payment = payments::table
                    .filter(payments::external_payment_id.eq(&intent_id))
                    .first::<Payment>(conn)
                    .await
                    .optional()?;
                let Some(payment) = payment else {
                    warn!(event_id = %event_id, intent_id = %intent_id, "event for unknown payment intent");
                    return Ok(None);
                };

                match kind.as_str() {
                    "payment_intent.succeeded" => {
                        let moved =
                            move_payment(conn, &payment, PaymentStatus::Succeeded).await?;
                        if !moved {
                            return Ok(None);
                        }
                        // Order confirmation rides in the same transaction.
                        diesel::update(
                            orders::table
                                .filter(orders::id.eq(payment.order_id))
                                .filter(orders::status.eq(OrderStatus::Pending.as_str())),
                        )
                        .set((
                            orders::status.eq(OrderStatus::Confirmed.as_str()),
                            orders::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                        Ok(Some(payment.order_id))
                    }
                    "payment_intent.payment_failed" => {
                        // The order stays PENDING so the customer can retry.
                        move_payment(conn, &payment, PaymentStatus::Failed).await?;
                        Ok(None)
                    }
                    "charge.refunded" => {
                        move_payment(conn, &payment, PaymentStatus::Refunded).await?;
                        Ok(None)
                    }
                    other => {
                        debug!(event_id = %event_id, kind = %other, "unhandled webhook event type");
                        Ok(None)
                    }
                }
            })
        })
        .await?;

    if let Some(order_id) = confirmed_order {
        info!(order_id = %order_id, "payment settled, order confirmed");
        let order = orders::table
            .find(order_id)
            .first::<Order>(&mut conn)
            .await?;
        match notify::order_paid_messages(&mut conn, &order).await {
            Ok(messages) => state.notifier.dispatch(messages),
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "could not assemble payment notifications")
            }
        }
    }

    Ok(())
}

/// Guarded status move honoring the payment lifecycle; returns whether a row
/// actually changed.
async fn move_payment(
    conn: &mut diesel_async::AsyncPgConnection,
    payment: &Payment,
    next: PaymentStatus,
) -> Result<bool, ApiError> {
    let eligible: Vec<&'static str> = [
        PaymentStatus::Pending,
        PaymentStatus::Succeeded,
        PaymentStatus::Failed,
        PaymentStatus::Refunded,
    ]
    .into_iter()
    .filter(|from| from.can_transition_to(next))
    .map(|from| from.as_str())
    .collect();

    let affected = diesel::update(
        payments::table
            .filter(payments::id.eq(payment.id))
            .filter(payments::status.eq_any(&eligible)),
    )
    .set((
        payments::status.eq(next.as_str()),
        payments::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if affected == 0 {
        debug!(payment_id = %payment.id, next = %next, "stale event ignored by status guard");
    }
    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn totals_convert_to_minor_units() {
        let cases = [
            ("200", 20_000),
            ("19.99", 1_999),
            ("0.01", 1),
            ("1234.56", 123_456),
        ];
        for (major, minor) in cases {
            let amount = BigDecimal::from_str(major).expect("decimal");
            assert_eq!(minor_units(&amount), Some(minor), "for {}", major);
        }
    }

    #[test]
    fn sub_cent_totals_are_rounded() {
        let amount = BigDecimal::from_str("10.999").expect("decimal");
        assert_eq!(minor_units(&amount), Some(1_100));
    }
}
