//! Authentication middleware and the `CurrentUser` extractor.
//!
//! The middleware authenticates once per request, installs the
//! request-scoped actor context (request id + user id) for audit
//! stamping, and stashes the authenticated subject in request extensions
//! for handlers to extract.

use axum::body::Body;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use ctp_auth::{Authenticated, Credentials, Principal};
use ctp_core::{context, ApiError};

use crate::state::AppState;

/// Parse credentials from the Authorization header or, for WebSocket
/// handshakes, the `token` query parameter.
fn extract_credentials(parts: &Parts) -> Option<Credentials> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let value = header.to_str().ok()?;
        let (scheme, rest) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") {
            return Some(Credentials::Bearer(rest.trim().to_string()));
        }
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = BASE64_STANDARD.decode(rest.trim()).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        return None;
    }

    // WebSocket clients cannot set headers from the browser.
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(token) = pair.strip_prefix("token=") {
            return Some(Credentials::Bearer(token.to_string()));
        }
    }
    None
}

/// Authenticate when credentials are present and run the rest of the
/// stack inside the actor context. Endpoints that require a principal
/// reject later through [`CurrentUser`].
pub async fn auth_context(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut ctx = context::RequestContext::new(request_id);

    let (parts, body) = request.into_parts();
    if let Some(credentials) = extract_credentials(&parts) {
        if let Ok(auth) = state.auth.authenticate(&credentials).await {
            ctx.user_id = Some(auth.principal.user_id);
            request = Request::from_parts(parts, body);
            request.extensions_mut().insert(auth);
        } else {
            request = Request::from_parts(parts, body);
        }
    } else {
        request = Request::from_parts(parts, body);
    }

    context::with_context(ctx, next.run(request)).await
}

/// The authenticated subject of the current request.
#[derive(Clone)]
pub struct CurrentUser(pub Authenticated);

impl CurrentUser {
    pub fn principal(&self) -> &Principal {
        &self.0.principal
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Authenticated>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(ApiError::unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn parts_for(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_header_wins() {
        let parts = parts_for("/users", Some("Bearer abc123"));
        match extract_credentials(&parts) {
            Some(Credentials::Bearer(token)) => assert_eq!(token, "abc123"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn basic_header_decodes_username_and_password() {
        let encoded = BASE64_STANDARD.encode("admin:Admin_P@ss_12!");
        let parts = parts_for("/users", Some(&format!("Basic {encoded}")));
        match extract_credentials(&parts) {
            Some(Credentials::Basic { username, password }) => {
                assert_eq!(username, "admin");
                assert_eq!(password, "Admin_P@ss_12!");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ws_token_query_parameter_is_a_bearer() {
        let parts = parts_for("/ws?token=sometoken", None);
        match extract_credentials(&parts) {
            Some(Credentials::Bearer(token)) => assert_eq!(token, "sometoken"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn absent_credentials_yield_none() {
        assert!(extract_credentials(&parts_for("/users", None)).is_none());
        assert!(extract_credentials(&parts_for("/users", Some("Digest xyz"))).is_none());
    }
}
