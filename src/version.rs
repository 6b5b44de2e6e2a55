//! API 版本信息处理器。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::error::ApiError;
use crate::journal::FormatVersion;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    /// Journal format versions this build can read.
    journal_versions: Vec<u32>,
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    let version_info = VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        journal_versions: FormatVersion::SUPPORTED
            .iter()
            .map(|version| version.tag())
            .collect(),
    };
    Ok(JsonResponse(version_info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_lists_journal_formats() {
        let JsonResponse(info) = get_version_info()
            .await
            .unwrap_or_else(|_| panic!("version info"));
        assert_eq!(info.journal_versions, vec![1, 2]);
        assert_eq!(info.version, crate::build::PKG_VERSION);
    }
}
