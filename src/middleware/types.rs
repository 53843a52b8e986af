use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::Serialize;

use super::error::GuardRejection;
use crate::device::DeviceInfo;
use crate::types::CredentialKind;

/// Coarse auth facts for rendering. Never carries token values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthSummary {
    pub authenticated: bool,
    /// Kind marker of whatever session cookie is present, valid or not.
    pub kind: Option<CredentialKind>,
    pub subscription_status: Option<String>,
}

/// Facts the route guard attaches to every request it lets through.
///
/// Use as an Axum extractor behind [`route_guard`](super::route_guard).
///
/// # Example
///
/// ```rust,ignore
/// async fn dashboard(ctx: RequestContext) -> impl IntoResponse {
///     if ctx.device.is_mobile() { render_compact(&ctx.auth) } else { render_full(&ctx.auth) }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub device: DeviceInfo,
    pub auth: AuthSummary,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = GuardRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(GuardRejection::MissingContext)
    }
}
