use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::ApiError;
use crate::schema::products;

/// Conditional atomic stock decrement.
///
/// Succeeds only while `stock >= quantity`, expressed as a single guarded
/// UPDATE so concurrent checkouts for the same product cannot both win the
/// last units. Zero affected rows means the guard failed; the error aborts
/// the caller's enclosing transaction, rolling back any sibling line that
/// already reserved.
pub async fn reserve(
    conn: &mut AsyncPgConnection,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ApiError> {
    let affected = diesel::update(
        products::table
            .filter(products::id.eq(product_id))
            .filter(products::stock.ge(quantity)),
    )
    .set(products::stock.eq(products::stock - quantity))
    .execute(conn)
    .await?;

    if affected == 0 {
        return Err(ApiError::InsufficientStock(product_id));
    }
    Ok(())
}

/// Unconditional stock increment, used when a cancellation returns reserved
/// units. Increments mirror a prior reserve, so no upper bound is enforced.
pub async fn release(
    conn: &mut AsyncPgConnection,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ApiError> {
    diesel::update(products::table.filter(products::id.eq(product_id)))
        .set(products::stock.eq(products::stock + quantity))
        .execute(conn)
        .await?;
    Ok(())
}
