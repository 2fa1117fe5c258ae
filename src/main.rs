//! Self-hosted iOS/Android app distribution server.
//!
//! Uploaded `.ipa`/`.apk` packages are inspected for their metadata, stored
//! under a per-upload directory and served through installation pages, OTA
//! manifests and direct downloads. A latest-upload index answers "what is
//! the newest build of this bundle id" for CI tooling.

mod api;
mod assets;
mod atomic;
mod auth;
mod axml;
mod build_info;
mod bundle_index;
mod config;
mod error;
mod health;
mod http;
mod inspect;
mod logging;
mod pages;
mod routes;
mod storage;
mod tls;
mod upload_store;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::AuthConfig;
use crate::config::{AppConfig, Args, DEFAULT_AUTH_TOKEN};
use crate::http::{build_cors_layer, extract_forwarded_ip};
use crate::inspect::{MetadataExtractor, PackageInspector};
use crate::storage::Storage;
use crate::upload_store::UploadStore;

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage_root = config::storage_root(&args.storage_url)?;
    let storage = Storage::new(storage_root);
    storage.ensure_root().await?;
    info!(root = ?storage.root_path(), "using upload storage");
    let store = Arc::new(UploadStore::new(storage));

    if args.migrate_legacy || args.reconcile_index {
        return run_maintenance(&args, &store).await;
    }

    let auth_config = Arc::new(AuthConfig {
        token: resolve_auth_token(args.auth_token.as_deref()),
    });
    let app_config = Arc::new(AppConfig::from_args(&args));
    let extractor: Arc<dyn MetadataExtractor> = Arc::new(PackageInspector);
    let upload_max_size = usize::try_from(args.upload_max_size).unwrap_or(usize::MAX);

    let mut app = routes::build_router(
        store,
        extractor,
        app_config,
        auth_config,
        upload_max_size,
    )
    .layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let forwarded_ip = extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string());
                let client_ip = forwarded_ip
                    .or(connect_ip)
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
    );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    match args.https_port {
        Some(https_port) => {
            let https_addr = SocketAddr::new(host, https_port);
            let tls_config = tls::build_rustls_config(&args, host).await?;
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());

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

fn resolve_auth_token(configured: Option<&str>) -> String {
    match configured.map(str::trim).filter(|token| !token.is_empty()) {
        Some(token) => token.to_string(),
        None => {
            warn!(
                "SECURITY WARNING: UPLOADS_SECRET_AUTH_TOKEN is not set, using the default token `{}`",
                DEFAULT_AUTH_TOKEN
            );
            DEFAULT_AUTH_TOKEN.to_string()
        }
    }
}

/// 一次性维护任务：执行完即退出，不启动监听。
async fn run_maintenance(args: &Args, store: &UploadStore) -> Result<(), io::Error> {
    if args.migrate_legacy {
        let migrated = store
            .migrate_all_legacy()
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        info!(migrated, "legacy migration finished");
    }
    if args.reconcile_index {
        let removed = store
            .reconcile_latest_index()
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        info!(removed, "latest-upload index reconciled");
    }
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
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
                warn!(error = %err, "failed to install SIGTERM handler");
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
