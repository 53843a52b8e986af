//! The auth backend the session core talks to.
//!
//! Every endpoint answers with a [`TokenGrant`] on success. Failures are
//! classified here, at the boundary, so callers only ever see [`Error`] kinds.

use std::future::Future;

#[cfg(feature = "http")]
use serde::Serialize;

use crate::device::DeviceInfo;
use crate::error::Error;
use crate::types::{DeviceId, TokenGrant};

/// Auth backend REST surface.
///
/// # Example
///
/// ```rust,ignore
/// use finboard_auth::{AuthBackend, HttpBackend};
///
/// let backend = HttpBackend::new("https://api.finboard.example/".parse()?);
/// let grant = backend.login("kim@example.com", "hunter2").await?;
/// ```
pub trait AuthBackend: Send + Sync + 'static {
    /// `POST /auth/login`
    fn login(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// `POST /auth/google-signin`: exchanges a Google ID token.
    fn google_sign_in(
        &self,
        id_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// `POST /auth/verify-email`
    fn verify_email(
        &self,
        email: &str,
        code: &str,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// `POST /auth/refresh-token`: renews a registered credential.
    fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// `POST /auth/logout`
    fn logout(&self, access_token: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// `POST /device/register`: issues an anonymous credential for a device.
    fn register_device(
        &self,
        device_id: &DeviceId,
        info: &DeviceInfo,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// `POST /auth/refresh`: renews an anonymous credential.
    fn refresh_anonymous(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;
}

#[cfg(feature = "http")]
#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[cfg(feature = "http")]
#[derive(Serialize)]
struct GoogleBody<'a> {
    token: &'a str,
}

#[cfg(feature = "http")]
#[derive(Serialize)]
struct VerifyEmailBody<'a> {
    email: &'a str,
    code: &'a str,
}

#[cfg(feature = "http")]
#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[cfg(feature = "http")]
#[derive(Serialize)]
struct RegisterDeviceBody<'a> {
    device_id: &'a DeviceId,
    os: &'a str,
    browser: &'a str,
}

/// Status codes meaning "the backend looked at the credential and said no".
#[cfg(feature = "http")]
fn is_rejection(status: u16) -> bool {
    matches!(status, 400 | 401 | 403 | 404 | 422)
}

/// reqwest-backed [`AuthBackend`].
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base: url::Url,
    http: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpBackend {
    #[must_use]
    pub fn new(mut base: url::Url) -> Self {
        // Relative joins drop the last segment unless the base ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, Error> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }

    async fn post_grant<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        operation: &'static str,
    ) -> Result<TokenGrant, Error> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, operation))?;

        let response = Self::ensure_success(response, operation).await?;
        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{operation}: invalid response: {e}")))
    }

    fn transport_error(e: reqwest::Error, operation: &'static str) -> Error {
        if e.is_timeout() {
            Error::Timeout { operation }
        } else {
            Error::UpstreamUnavailable(format!("{operation}: {e}"))
        }
    }

    /// Checks HTTP response status; returns the response on success or a classified error.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{operation} returned {}: {body}", status.as_u16());
        if is_rejection(status.as_u16()) {
            Err(Error::CredentialInvalid(detail))
        } else {
            Err(Error::UpstreamUnavailable(detail))
        }
    }
}

#[cfg(feature = "http")]
impl AuthBackend for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> Result<TokenGrant, Error> {
        self.post_grant("auth/login", &LoginBody { email, password }, "login")
            .await
    }

    async fn google_sign_in(&self, id_token: &str) -> Result<TokenGrant, Error> {
        self.post_grant("auth/google-signin", &GoogleBody { token: id_token }, "google-signin")
            .await
    }

    async fn verify_email(&self, email: &str, code: &str) -> Result<TokenGrant, Error> {
        self.post_grant(
            "auth/verify-email",
            &VerifyEmailBody { email, code },
            "verify-email",
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, Error> {
        self.post_grant(
            "auth/refresh-token",
            &RefreshBody { refresh_token },
            "refresh-token",
        )
        .await
    }

    async fn logout(&self, access_token: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(self.endpoint("auth/logout")?)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, "logout"))?;
        Self::ensure_success(response, "logout").await?;
        Ok(())
    }

    async fn register_device(
        &self,
        device_id: &DeviceId,
        info: &DeviceInfo,
    ) -> Result<TokenGrant, Error> {
        let body = RegisterDeviceBody {
            device_id,
            os: &info.os,
            browser: &info.browser,
        };
        self.post_grant("device/register", &body, "device-register")
            .await
    }

    async fn refresh_anonymous(&self, refresh_token: &str) -> Result<TokenGrant, Error> {
        self.post_grant(
            "auth/refresh",
            &RefreshBody { refresh_token },
            "anonymous-refresh",
        )
        .await
    }
}

#[cfg(all(test, feature = "http"))]
mod tests {
    use axum::extract::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use serde_json::{Value, json};

    use super::*;

    async fn serve(router: Router) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api").parse().unwrap()
    }

    fn grant_json() -> Value {
        json!({
            "access_token": "acc",
            "refresh_token": "ref",
            "expires_in": 900,
            "user_type": "premium",
            "id": 42,
            "email": "kim@example.com"
        })
    }

    #[tokio::test]
    async fn login_posts_credentials_and_decodes_grant() {
        let router = Router::new().route(
            "/api/auth/login",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["email"], "kim@example.com");
                assert_eq!(body["password"], "pw");
                Json(grant_json())
            }),
        );
        let backend = HttpBackend::new(serve(router).await);

        let grant = backend.login("kim@example.com", "pw").await.unwrap();
        assert_eq!(grant.access_token, "acc");
        assert_eq!(grant.id.unwrap().to_string(), "42");
    }

    #[tokio::test]
    async fn register_device_sends_fingerprint() {
        let router = Router::new().route(
            "/api/device/register",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["device_id"], "dev-1");
                assert_eq!(body["os"], "macos");
                assert_eq!(body["browser"], "chrome");
                Json(json!({"access_token": "anon", "refresh_token": "anon-r", "expires_in": 60}))
            }),
        );
        let backend = HttpBackend::new(serve(router).await);
        let info = DeviceInfo {
            os: "macos".into(),
            browser: "chrome".into(),
        };

        let grant = backend
            .register_device(&DeviceId("dev-1".into()), &info)
            .await
            .unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("anon-r"));
    }

    #[tokio::test]
    async fn rejected_refresh_is_credential_invalid() {
        let router = Router::new().route(
            "/api/auth/refresh-token",
            post(|| async { (StatusCode::UNAUTHORIZED, "revoked") }),
        );
        let backend = HttpBackend::new(serve(router).await);

        let err = backend.refresh_token("old").await.unwrap_err();
        assert!(matches!(err, Error::CredentialInvalid(ref d) if d.contains("revoked")));
    }

    #[tokio::test]
    async fn server_error_is_upstream_unavailable() {
        let router = Router::new().route(
            "/api/auth/refresh",
            post(|| async { StatusCode::BAD_GATEWAY }),
        );
        let backend = HttpBackend::new(serve(router).await);

        let err = backend.refresh_anonymous("r").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn malformed_grant_is_upstream_unavailable() {
        let router = Router::new().route(
            "/api/auth/google-signin",
            post(|| async { Json(json!({"token": "not a grant"})) }),
        );
        let backend = HttpBackend::new(serve(router).await);

        let err = backend.google_sign_in("id-token").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn logout_sends_bearer_token() {
        let router = Router::new().route(
            "/api/auth/logout",
            post(|headers: HeaderMap| async move {
                if headers.get("authorization").and_then(|v| v.to_str().ok())
                    == Some("Bearer acc")
                {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::UNAUTHORIZED
                }
            }),
        );
        let backend = HttpBackend::new(serve(router).await);
        backend.logout("acc").await.unwrap();
        assert!(backend.logout("other").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_is_upstream_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HttpBackend::new(format!("http://{addr}/").parse().unwrap());
        let err = backend.logout("acc").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
    }
}
