//! AxoResume server binary.
//!
//! This crate serves resumable uploads over HTTP. Every in-progress file is
//! guarded by a write-ahead journal, so an interrupted transfer continues
//! from the last confirmed byte after a disconnect or a server crash. The
//! main entry point builds the Axum router, configures TLS, and starts the
//! HTTP/HTTPS listeners.

mod admission;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod http;
mod journal;
mod locking;
mod logging;
mod pipeline;
mod session;
mod storage;
mod tls;
mod upload;
mod version;
mod wal;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::atomic::{CompletionHook, PromoteAndArchive};
use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::storage::Storage;
use crate::upload::{UploadConfig, UploadRegistry};

shadow!(build);

/// Starts the AxoResume server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    info!(root = ?storage.root_path(), "storage ready");
    let auth_config = Arc::new(AuthConfig::new(
        args.auth_user.clone(),
        args.auth_pass.clone(),
    ));
    let upload_config = Arc::new(UploadConfig {
        max_total_size: args.upload_max_size,
        durable: args.fsync,
    });
    let registry = Arc::new(UploadRegistry::new(Duration::from_secs(
        args.session_ttl_secs,
    )));
    let hook: Arc<dyn CompletionHook> = Arc::new(PromoteAndArchive {
        keep_journals: args.keep_journals,
    });
    if auth_config.credentials.is_none() {
        info!("no credentials configured, uploads are anonymous");
    }

    let mut app = Router::new()
        .route(
            "/api/upload/{*name}",
            get(upload::upload_status)
                .put(upload::upload_file)
                .delete(upload::abort_upload)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(auth_config))
        .layer(Extension(upload_config))
        .layer(Extension(registry.clone()))
        .layer(Extension(hook));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    let https_server = match args.https_port {
        Some(port) => {
            let Some(tls_config) = tls::build_rustls_config(&args, host).await? else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "--https-port needs --tls-cert/--tls-key or --tls-self-signed",
                ));
            };
            let https_addr = SocketAddr::new(host, port);
            info!("🔒 Starting HTTPS server at {}", https_addr);
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(
                        app.clone()
                            .into_make_service_with_connect_info::<SocketAddr>(),
                    ),
            )
        }
        None => None,
    };

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(registry);
    match https_server {
        Some(https_server) => {
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
