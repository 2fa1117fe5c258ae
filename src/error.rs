//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::inspect::InspectError;
use crate::storage::StorageError;
use crate::upload_store::StoreError;

/// 对外暴露的错误种类；内部细节只写日志，不返回给客户端。
#[derive(Debug)]
pub enum ApiError {
    InvalidFileType,
    NotFound,
    Unauthorized,
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidFileType => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ApiError::InvalidFileType => {
                "Invalid file type. Only valid .ipa or .apk files are allowed."
            }
            ApiError::NotFound => "Not found",
            ApiError::Unauthorized => "Invalid X-Auth-Token",
            ApiError::Internal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!(%detail, "internal error");
        }
        (self.status(), self.message()).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound | StoreError::InvalidUploadId => ApiError::NotFound,
            StoreError::Storage(err) => err.into(),
            StoreError::Serialization(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<InspectError> for ApiError {
    fn from(_: InspectError) -> Self {
        ApiError::InvalidFileType
    }
}
