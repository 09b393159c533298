//! Static bearer-token authentication extractor for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use meshgen_core::error::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// Proof that the request carried a token from the configured allow-set.
///
/// Use this as the first extractor parameter of any handler that requires
/// authentication, so the check runs before the body is read:
///
/// ```ignore
/// async fn my_handler(_auth: BearerAuth, Json(body): Json<Input>) -> AppResult<Json<()>> {
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BearerAuth;

impl FromRequestParts<AppState> for BearerAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        if !state.config.valid_tokens.contains(token.trim()) {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid authentication token".into(),
            )));
        }

        Ok(BearerAuth)
    }
}
