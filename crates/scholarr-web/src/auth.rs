//! Bearer-token user resolution.
//!
//! Session management proper lives outside this service; the core only
//! needs "which user is this request for", resolved from a per-user API
//! token.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use scholarr_db::users::{User, UserRepository};

use crate::envelope::ApiError;
use crate::state::AppState;

/// The authenticated user for this request.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(ApiError::unauthorized)?;

        let user = UserRepository::new(state.db.clone())
            .find_by_api_token(token)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(ApiError::unauthorized)?;

        Ok(CurrentUser(user))
    }
}
