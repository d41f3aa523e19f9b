use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use shared::Role;
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Request-scoped identity, established by the upstream session layer and
/// passed down via trusted headers. Handlers receive it as an extractor;
/// there is no ambient session state anywhere in the service.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn require_customer(&self) -> Result<(), ApiError> {
        if self.role == Role::Customer {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "only customers may perform this action".to_string(),
            ))
        }
    }

    pub fn require_farmer(&self) -> Result<(), ApiError> {
        if self.role == Role::Farmer {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "only farmers may perform this action".to_string(),
            ))
        }
    }

    pub fn require_staff(&self) -> Result<(), ApiError> {
        if self.role.is_staff() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "only farmers or admins may perform this action".to_string(),
            ))
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(ApiError::Unauthorized)?;
        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or(ApiError::Unauthorized)?;
        Ok(Identity { user_id, role })
    }
}
