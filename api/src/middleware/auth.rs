use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use common::auth::{require_permission, ADMIN_PERMISSION};

use crate::handlers::ErrorResponse;
use crate::state::AppState;

/// Bearer-token authentication for the administrative routes
///
/// The token must carry the admin permission. Decoded claims are inserted into
/// the request extensions.
#[tracing::instrument(skip(state, req, next))]
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ErrorResponse::new("unauthorized", "Missing Authorization header"))?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::warn!("Invalid authorization header format");
        ErrorResponse::new("unauthorized", "Expected a Bearer token")
    })?;

    let claims = state.jwt.decode_token(token)?;
    if let Err(e) = require_permission(&claims, ADMIN_PERMISSION) {
        tracing::warn!(identity = %claims.sub, "Caller lacks admin permission");
        return Err(e.into());
    }

    tracing::info!(
        identity = %claims.sub,
        method = %req.method(),
        path = %req.uri().path(),
        "Admin API operation"
    );
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
