//! 需要认证的 API：上传、删除与按 bundle id 查询最新上传。

use axum::body::Bytes;
use axum::extract::{Extension, Multipart, Path};
use axum::response::Json as JsonResponse;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::build_info::{BuildInfo, Platform};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::inspect::MetadataExtractor;
use crate::upload_store::UploadStore;

const APP_FILE_FIELD: &str = "app_file";
const MAX_BUNDLE_ID_LEN: usize = 256;

/// 上传安装包，返回安装页的绝对地址（纯文本）。
pub async fn upload_plaintext(
    Extension(store): Extension<Arc<UploadStore>>,
    Extension(extractor): Extension<Arc<dyn MetadataExtractor>>,
    Extension(config): Extension<Arc<AppConfig>>,
    multipart: Multipart,
) -> Result<String, ApiError> {
    let build_info = receive_upload(&store, extractor, multipart).await?;
    Ok(config.absolute_url(&format!("/get/{}", build_info.upload_id)))
}

/// 上传安装包，返回 JSON 格式的元数据。
pub async fn upload_json(
    Extension(store): Extension<Arc<UploadStore>>,
    Extension(extractor): Extension<Arc<dyn MetadataExtractor>>,
    multipart: Multipart,
) -> Result<JsonResponse<BuildInfo>, ApiError> {
    let build_info = receive_upload(&store, extractor, multipart).await?;
    Ok(JsonResponse(build_info))
}

async fn receive_upload(
    store: &UploadStore,
    extractor: Arc<dyn MetadataExtractor>,
    mut multipart: Multipart,
) -> Result<BuildInfo, ApiError> {
    let (platform, content) = read_app_file(&mut multipart).await?;
    let upload_id = Uuid::new_v4().to_string();
    debug!(%upload_id, bytes = content.len(), "obtaining build info");

    let (metadata, content) = tokio::task::spawn_blocking(move || {
        let metadata = extractor.extract(platform, &content);
        (metadata, content)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    let metadata = metadata?;

    let build_info = BuildInfo {
        app_title: metadata.app_title,
        bundle_id: metadata.bundle_id,
        bundle_version: metadata.bundle_version,
        upload_id,
        file_size: Some(metadata.file_size),
        created_at: Some(Utc::now()),
        platform,
    };

    store.save(&build_info, &content).await?;
    info!(
        bundle_id = %build_info.bundle_id,
        upload_id = %build_info.upload_id,
        platform = platform.display_name(),
        "upload complete"
    );
    Ok(build_info)
}

async fn read_app_file(multipart: &mut Multipart) -> Result<(Platform, Bytes), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        warn!(error = %err, "invalid multipart body");
        ApiError::InvalidFileType
    })? {
        if field.name() != Some(APP_FILE_FIELD) {
            continue;
        }
        let platform = field
            .file_name()
            .and_then(Platform::from_file_name)
            .ok_or(ApiError::InvalidFileType)?;
        let content = field.bytes().await.map_err(|err| {
            warn!(error = %err, "failed to read uploaded file");
            ApiError::InvalidFileType
        })?;
        return Ok((platform, content));
    }

    Err(ApiError::InvalidFileType)
}

/// 删除上传；bundle 索引中的指向不会被清理。
pub async fn delete_upload(
    Path(upload_id): Path<String>,
    Extension(store): Extension<Arc<UploadStore>>,
) -> Result<&'static str, ApiError> {
    store.assert_platform(&upload_id, None).await?;
    store.delete(&upload_id).await?;
    info!(%upload_id, "upload deleted");
    Ok("Upload deleted successfully")
}

/// 查询某个 bundle id 最近一次保存的上传。
pub async fn latest_upload_by_bundle_id(
    Path(bundle_id): Path<String>,
    Extension(store): Extension<Arc<UploadStore>>,
) -> Result<JsonResponse<BuildInfo>, ApiError> {
    if !is_valid_bundle_id(&bundle_id) {
        return Err(ApiError::NotFound);
    }
    let upload_id = store
        .lookup_latest(&bundle_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    store.assert_platform(&upload_id, None).await?;
    Ok(JsonResponse(store.load_metadata(&upload_id).await?))
}

fn is_valid_bundle_id(bundle_id: &str) -> bool {
    !bundle_id.is_empty()
        && bundle_id.len() <= MAX_BUNDLE_ID_LEN
        && bundle_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_id_pattern() {
        assert!(is_valid_bundle_id("com.example.app"));
        assert!(is_valid_bundle_id("com.example-app.2"));
        assert!(!is_valid_bundle_id(""));
        assert!(!is_valid_bundle_id("com/example"));
        assert!(!is_valid_bundle_id("com_example"));
        assert!(!is_valid_bundle_id(&"a".repeat(257)));
    }
}
