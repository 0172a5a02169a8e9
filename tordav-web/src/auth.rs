//! HTTP Basic authentication.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

/// Outcome of checking a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    /// No usable Authorization header
    Missing,
    /// Credentials present but wrong
    Rejected,
}

/// Single-user Basic authentication.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some((username, password)) = credentials(headers) else {
            return AuthOutcome::Missing;
        };
        if username == self.username && password == self.password {
            AuthOutcome::Granted
        } else {
            debug!("Rejected credentials for user {username:?}");
            AuthOutcome::Rejected
        }
    }
}

fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// 401 response carrying a Basic challenge.
pub fn unauthorized(challenge: bool) -> Response {
    let mut response = Response::new(Body::from("Unauthorized"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    if challenge {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Restricted\""),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn test_check_outcomes() {
        let auth = BasicAuth::new("alice", "s3cret");

        assert_eq!(auth.check(&HeaderMap::new()), AuthOutcome::Missing);
        assert_eq!(auth.check(&headers_with("Bearer token")), AuthOutcome::Missing);
        assert_eq!(auth.check(&headers_with("Basic !!!")), AuthOutcome::Missing);
        assert_eq!(
            auth.check(&headers_with(&basic("alice", "s3cret"))),
            AuthOutcome::Granted
        );
        assert_eq!(
            auth.check(&headers_with(&basic("alice", "wrong"))),
            AuthOutcome::Rejected
        );
        assert_eq!(
            auth.check(&headers_with(&basic("bob", "s3cret"))),
            AuthOutcome::Rejected
        );
    }

    #[test]
    fn test_password_may_contain_colons() {
        let auth = BasicAuth::new("alice", "a:b:c");
        assert_eq!(
            auth.check(&headers_with(&basic("alice", "a:b:c"))),
            AuthOutcome::Granted
        );
    }

    #[test]
    fn test_unauthorized_challenge_header() {
        let response = unauthorized(true);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert!(
            !unauthorized(false)
                .headers()
                .contains_key(header::WWW_AUTHENTICATE)
        );
    }
}
