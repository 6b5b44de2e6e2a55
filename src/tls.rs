//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置；未提供证书且未要求自签名时返回 None。
pub async fn build_rustls_config(
    args: &Args,
    host: IpAddr,
) -> Result<Option<RustlsConfig>, std::io::Error> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (None, None) if args.tls_self_signed => generate_self_signed_paths(host)?,
        (None, None) => return Ok(None),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await.map(Some)
}

/// 生成自签名证书并返回文件路径。
fn generate_self_signed_paths(host: IpAddr) -> Result<(PathBuf, PathBuf), std::io::Error> {
    let cert = generate_simple_self_signed([host.to_string()])
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join("axo-resume-cert.pem");
    let key_path = std::env::temp_dir().join("axo-resume-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!("generated self-signed cert: {:?}", cert_path);
    Ok((cert_path, key_path))
}
