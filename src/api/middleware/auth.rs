use crate::api::error::AppError;
use crate::utils::auth::validate_jwt;
use crate::{AppState, entities::prelude::Users};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use sea_orm::EntityTrait;
use serde::Deserialize;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then `?token=` so plain download links work.
fn bearer_token(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        req.uri()
            .query()
            .and_then(|q| serde_urlencoded::from_str::<TokenQuery>(q).ok())
            .and_then(|q| q.token)
    })
}

/// Resolves the caller and stores their [`Claims`](crate::utils::auth::Claims)
/// in the request extensions. Every `/api/file` route sits behind this.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&req)
        .ok_or_else(|| AppError::Unauthorized("Missing access token".to_string()))?;

    let claims = validate_jwt(&token, &state.config.jwt_secret).map_err(|e| {
        tracing::debug!("Rejected access token: {}", e);
        AppError::Unauthorized("Invalid or expired token".to_string())
    })?;

    // Tokens outlive deleted accounts
    if Users::find_by_id(claims.sub.clone())
        .one(&state.db)
        .await?
        .is_none()
    {
        return Err(AppError::Unauthorized("Unknown user".to_string()));
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
