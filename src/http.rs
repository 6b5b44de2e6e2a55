//! HTTP 辅助工具：CORS 与客户端 IP 解析。

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::{CONTENT_SHA1_HEADER, UPLOAD_OFFSET_HEADER, UPLOAD_SESSION_HEADER};

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    let offset = HeaderName::from_static(UPLOAD_OFFSET_HEADER);
    let session = HeaderName::from_static(UPLOAD_SESSION_HEADER);
    let sha1 = HeaderName::from_static(CONTENT_SHA1_HEADER);
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                offset.clone(),
                session.clone(),
                sha1,
            ])
            .expose_headers([
                offset,
                session,
                header::RETRY_AFTER,
                header::LAST_MODIFIED,
            ])
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}
