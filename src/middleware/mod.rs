//! Request-time route guard for Axum.
//!
//! Decides from cookies alone whether a request may reach a protected path,
//! and attaches coarse, non-sensitive facts for rendering.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use finboard_auth::SessionConfig;
//! use finboard_auth::middleware::{GuardState, RequestContext, route_guard};
//!
//! // 1. Configure from environment
//! let config = SessionConfig::from_env()?;
//!
//! // 2. Wrap the router
//! let app = axum::Router::new()
//!     .route("/app/dashboard", get(dashboard))
//!     .layer(axum::middleware::from_fn_with_state(GuardState::new(&config), route_guard));
//!
//! // 3. Read the derived facts in handlers
//! async fn dashboard(ctx: RequestContext) -> impl IntoResponse { /* ... */ }
//! ```

mod error;
mod guard;
mod layer;
mod types;

pub use error::GuardRejection;
pub use guard::{GuardDecision, RequestCredentialFacts, RouteGuard};
pub use layer::{GuardState, route_guard};
pub use types::{AuthSummary, RequestContext};
