//! 上传与管理接口的共享密钥校验。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::middleware;
use axum::response::Response;
use std::sync::Arc;
use tracing::warn;

use crate::config::AUTH_TOKEN_HEADER;
use crate::error::ApiError;

#[derive(Debug)]
pub struct AuthConfig {
    pub token: String,
}

/// 认证中间件：校验 `X-Auth-Token` 请求头。
pub async fn require_auth_token(
    Extension(auth): Extension<Arc<AuthConfig>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(AUTH_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !constant_time_eq(provided, &auth.token) {
        warn!(path = req.uri().path(), "rejected request with invalid auth token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}

/// Compares two tokens without short-circuiting on the first differing byte.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_tokens() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn constant_time_eq_rejects_different_tokens() {
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "secret"));
    }
}
