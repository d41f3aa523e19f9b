use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error taxonomy for the HTTP surface. Every handler failure is one of
/// these kinds; the status code and the machine-readable `kind` in the
/// response body both derive from the variant.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("validation failed")]
    Validation(Vec<String>),

    #[error("{0}")]
    Conflict(String),

    #[error("insufficient stock for product {0}")]
    InsufficientStock(Uuid),

    #[error("too many orders placed recently, try again later")]
    RateLimited,

    #[error("webhook signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("payment provider request failed: {0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn validation(issue: impl Into<String>) -> Self {
        ApiError::Validation(vec![issue.into()])
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::Conflict(_) => "conflict",
            ApiError::InsufficientStock(_) => "insufficient_stock",
            ApiError::RateLimited => "rate_limited",
            ApiError::InvalidSignature(_) => "invalid_signature",
            ApiError::Upstream(_) => "upstream_failure",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::BAD_REQUEST,
            ApiError::InsufficientStock(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    kind: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<&'a [String]>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Upstream(message) => error!(error = %message, "upstream failure"),
            ApiError::Internal(message) => error!(error = %message, "internal error"),
            _ => {}
        }
        let issues = match &self {
            ApiError::Validation(issues) => Some(issues.as_slice()),
            _ => None,
        };
        let body = ErrorBody {
            kind: self.kind(),
            error: self.to_string(),
            issues,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => ApiError::NotFound("record not found".to_string()),
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => ApiError::Conflict(info.message().to_string()),
            other => ApiError::internal(format!("database error: {}", other)),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for ApiError {
    fn from(e: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        ApiError::internal(format!("connection pool error: {}", e))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut issues = Vec::new();
        flatten_validation_errors("", &errors, &mut issues);
        ApiError::Validation(issues)
    }
}

fn flatten_validation_errors(
    prefix: &str,
    errors: &validator::ValidationErrors,
    issues: &mut Vec<String>,
) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for e in field_errors {
                    match &e.message {
                        Some(message) => issues.push(format!("{}: {}", path, message)),
                        None => issues.push(format!("{}: invalid value ({})", path, e.code)),
                    }
                }
            }
            ValidationErrorsKind::Struct(nested) => {
                flatten_validation_errors(&path, nested, issues);
            }
            ValidationErrorsKind::List(entries) => {
                for (index, nested) in entries {
                    flatten_validation_errors(&format!("{}[{}]", path, index), nested, issues);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_mirror_the_taxonomy() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Forbidden("nope".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::NotFound("gone".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::validation("bad").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Conflict("dup".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::InsufficientStock(Uuid::nil()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::InvalidSignature("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Upstream("down".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unique_violations_become_conflicts() {
        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key".to_string()),
        );
        assert!(matches!(ApiError::from(err), ApiError::Conflict(_)));

        let err = diesel::result::Error::NotFound;
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
    }
}
