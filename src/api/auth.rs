// =============================================================================
// Admin Authentication — config-driven bearer token
// =============================================================================
//
// The authenticated routes are guarded by a single admin token that lives in
// `RuntimeConfig.admin_token` (normally injected through the
// `MERIDIAN_ADMIN_TOKEN` environment variable at startup, like the store
// secret). Keeping the token in config means rotation rides the same
// hot-reload path as every other setting instead of a process restart.
//
// Comparison hashes both sides with SHA-256 (already on hand for store
// request signing) and compares the fixed-length digests, so timing reveals
// nothing about the configured token's length or content.
//
// `AdminAuth` is an extractor over this engine's `Arc<AppState>`:
//
//   async fn handler(State(state): State<Arc<AppState>>, _auth: AdminAuth, ...)
//
// An unconfigured token refuses every authenticated request.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::app_state::AppState;

// =============================================================================
// Token comparison
// =============================================================================

/// A configured token that is actually usable (present and non-empty).
fn usable_token(configured: Option<&str>) -> Option<&str> {
    configured.filter(|t| !t.is_empty())
}

/// Compare a presented token against the configured one by SHA-256 digest.
/// The digests have fixed length, so the comparison cost is independent of
/// either token.
fn token_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// Check a bare token string against the engine config. Used where the
/// extractor cannot run, e.g. the WebSocket upgrade's `?token=` parameter.
pub fn authorize(state: &AppState, presented: &str) -> bool {
    let config = state.runtime_config.read();
    match usable_token(config.admin_token.as_deref()) {
        Some(expected) => token_matches(expected, presented),
        None => false,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Marker extractor: admits the request when a valid
/// `Authorization: Bearer <token>` header matches the configured admin
/// token, otherwise short-circuits with a 403 before the handler runs.
pub struct AdminAuth;

fn forbidden(message: &'static str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let configured = state.runtime_config.read().admin_token.clone();
        let Some(expected) = usable_token(configured.as_deref()) else {
            warn!("admin_token not configured — refusing authenticated request");
            return Err(forbidden("authentication not configured"));
        };

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if token_matches(expected, token) => Ok(AdminAuth),
            Some(_) => {
                warn!("invalid admin token presented");
                Err(forbidden("invalid authorization token"))
            }
            None => {
                warn!("missing or malformed Authorization header");
                Err(forbidden("missing bearer token"))
            }
        }
    }
}
