//! 认证处理：Basic 认证中间件，解析出上传使用的主体名。

use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;

/// Credentials accepted by the server. No credentials means anonymous
/// uploads into the storage root.
#[derive(Debug, Default)]
pub struct AuthConfig {
    pub credentials: Option<(String, String)>,
}

impl AuthConfig {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        let credentials = username.map(|user| (user, password.unwrap_or_default()));
        Self { credentials }
    }
}

/// Authenticated principal of a request, `None` for anonymous access.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal(pub Option<String>);

impl Principal {
    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// 认证中间件：校验 Basic 认证并注入 [`Principal`]。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let basic = auth_header.as_ref().map(|TypedHeader(value)| value);
    if let Some(principal) = authenticate(&auth, basic) {
        req.extensions_mut().insert(principal);
        return Ok(next.run(req).await);
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="AxoResume""#),
    );
    Err(ApiError::Unauthorized(headers))
}

/// Resolves the principal for the given Basic credentials, `None` when they
/// are missing or wrong.
pub fn authenticate(auth: &AuthConfig, basic: Option<&Authorization<Basic>>) -> Option<Principal> {
    let Some((username, password)) = &auth.credentials else {
        return Some(Principal(None));
    };
    let basic = basic?;
    if basic.username() == username && basic.password() == password {
        return Some(Principal(Some(username.clone())));
    }
    warn!(user = basic.username(), "basic auth rejected");
    None
}

fn is_auth_exempt_path(path: &str) -> bool {
    path == "/api/version"
}
