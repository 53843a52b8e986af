use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use super::error::GuardRejection;
use super::guard::{GuardDecision, RequestCredentialFacts, RouteGuard};
use super::types::RequestContext;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::device::DeviceInfo;

/// State for [`route_guard`].
#[derive(Clone)]
pub struct GuardState {
    guard: Arc<RouteGuard>,
    clock: Arc<dyn Clock>,
}

impl GuardState {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: &SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: Arc::new(RouteGuard::from_config(config)),
            clock,
        }
    }

    #[must_use]
    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }
}

/// Axum middleware: redirects unauthenticated requests for protected paths
/// to sign-in and attaches a [`RequestContext`] to every other request.
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/app/dashboard", get(dashboard))
///     .layer(axum::middleware::from_fn_with_state(GuardState::new(&config), route_guard));
/// ```
pub async fn route_guard(
    State(state): State<GuardState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let facts = RequestCredentialFacts::from_jar(state.guard.names(), &jar);
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);

    match state
        .guard
        .evaluate(&facts, &path_and_query, state.clock.now())
    {
        GuardDecision::Allow(auth) => {
            let device = extract_user_agent(request.headers())
                .map_or_else(DeviceInfo::unknown, |ua| DeviceInfo::from_user_agent(&ua));
            request
                .extensions_mut()
                .insert(RequestContext { device, auth });
            next.run(request).await
        }
        GuardDecision::RedirectTo { location } => {
            tracing::debug!(path = request.uri().path(), "Redirecting unauthenticated request");
            GuardRejection::SignInRequired { location }.into_response()
        }
    }
}

fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
