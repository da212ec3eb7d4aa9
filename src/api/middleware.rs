use std::str::FromStr;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::Role,
    services::auth::{AuthService, Claims},
    AppState,
};

/// Authentication middleware. Validates the bearer token and stashes the
/// claims; role resolution happens later, in the identity resolver.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let auth_service = AuthService::new(state.config.jwt.clone());
    let claims = auth_service.validate_token(token)?;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

/// Extracts the verified (authId, claimed role) pair from the claims.
pub fn auth_identity(claims: &Claims) -> AppResult<(Uuid, Role)> {
    let auth_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)?;
    let role = Role::from_str(&claims.role).map_err(|_| AppError::InvalidToken)?;
    Ok((auth_id, role))
}
