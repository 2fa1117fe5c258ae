//! 路由装配：认证 API 与公开页面。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::sync::Arc;

use crate::auth::{self, AuthConfig};
use crate::config::AppConfig;
use crate::inspect::MetadataExtractor;
use crate::upload_store::UploadStore;
use crate::{api, assets, health, http, pages};

/// 构建应用路由；追踪与 CORS 由调用方叠加。
pub fn build_router(
    store: Arc<UploadStore>,
    extractor: Arc<dyn MetadataExtractor>,
    config: Arc<AppConfig>,
    auth: Arc<AuthConfig>,
    upload_max_size: usize,
) -> Router {
    let protected = Router::new()
        .route("/upload", post(api::upload_plaintext))
        .route("/api/upload", post(api::upload_json))
        .route("/api/delete/{upload_id}", delete(api::delete_upload))
        // deprecated alias
        .route("/delete/{upload_id}", delete(api::delete_upload))
        .route(
            "/api/bundle/{bundle_id}/latest_upload",
            get(api::latest_upload_by_bundle_id),
        )
        .route_layer(middleware::from_fn(auth::require_auth_token))
        .layer(DefaultBodyLimit::max(upload_max_size));

    Router::new()
        .merge(protected)
        .route("/get/{upload_id}", get(pages::installation_page))
        .route("/get/{upload_id}/{file_name}", get(pages::upload_file))
        .route("/healthz", get(health::healthz))
        .route("/api/version", get(health::get_version_info))
        .route("/static/{*path}", get(assets::serve_static))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(Extension(store))
        .layer(Extension(extractor))
        .layer(Extension(config))
        .layer(Extension(auth))
}
