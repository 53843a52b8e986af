use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};

/// Why the guard layer refused a request.
#[derive(Debug, thiserror::Error)]
pub enum GuardRejection {
    /// Protected path without a valid session.
    #[error("Sign-in required")]
    SignInRequired { location: String },

    /// A handler asked for [`RequestContext`](super::RequestContext) on a
    /// route the guard does not cover.
    #[error("Request context missing")]
    MissingContext,
}

impl IntoResponse for GuardRejection {
    fn into_response(self) -> Response {
        match self {
            Self::SignInRequired { location } => Redirect::to(&location).into_response(),
            Self::MissingContext => {
                tracing::error!(error = %self, "route_guard is not installed on this route");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
