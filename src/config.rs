//! CLI arguments, server configuration defaults and upload engine constants.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// Largest number of bytes covered by a single begin/end journal pair.
pub const HUNK_SIZE: usize = 1024 * 1024;
/// Block size used when reading the request body.
pub const READ_BLOCK_SIZE: usize = 64 * 1024;
/// Small blocks are coalesced until the buffer reaches this size.
pub const COALESCE_THRESHOLD: usize = 256 * 1024;
/// Capacity of the receiver → writer channel.
pub const PIPELINE_DEPTH: usize = 8;

pub const PARTIAL_SUFFIX: &str = ".part";
pub const JOURNAL_SUFFIX: &str = ".partialinfo";
pub const ARCHIVE_SUFFIX: &str = ".done";

pub const UPLOAD_OFFSET_HEADER: &str = "x-upload-offset";
pub const UPLOAD_SESSION_HEADER: &str = "x-upload-session";
pub const CONTENT_SHA1_HEADER: &str = "x-content-sha1";
pub const UPLOAD_COOKIE_NAME: &str = "AXO_UPLOAD";

pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const BUSY_RETRY_AFTER_SECS: u64 = 5;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-resume", version = VERSION_INFO, about = "AxoResume upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Storage directory for uploads"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "AXO_AUTH_USER",
        help = "Basic auth username (anonymous uploads when unset)"
    )]
    pub auth_user: Option<String>,
    #[arg(long, env = "AXO_AUTH_PASS", help = "Basic auth password")]
    pub auth_pass: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "AXO_TLS_SELF_SIGNED",
        help = "Generate a self-signed certificate when no cert/key is given"
    )]
    pub tls_self_signed: bool,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Upload session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_FSYNC",
        help = "Sync journal and data to disk around every hunk"
    )]
    pub fsync: bool,
    #[arg(
        long,
        env = "AXO_KEEP_JOURNALS",
        help = "Archive journals of completed uploads instead of deleting them"
    )]
    pub keep_journals: bool,
    #[arg(
        long,
        env = "AXO_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_fits_inside_one_hunk() {
        assert!(PIPELINE_DEPTH >= 2);
        assert!(READ_BLOCK_SIZE <= COALESCE_THRESHOLD);
        assert!(COALESCE_THRESHOLD <= HUNK_SIZE);
    }

    #[test]
    fn args_parse_defaults() {
        let args = Args::try_parse_from(["axo-resume"]).expect("parse args");
        assert_eq!(args.http_port, 5005);
        assert!(args.https_port.is_none());
        assert!(args.auth_user.is_none());
        assert!(!args.fsync);
    }
}
