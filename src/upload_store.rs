//! 按 upload id 组织的上传存储：保存、读取、平台探测、旧版迁移与删除。
//!
//! 每个上传占用根目录下一个以 upload id 命名的子目录：
//!
//! ```text
//! <upload_id>/
//!   app.ipa | app.apk
//!   build_info.json
//!   app_info.json      # 旧版元数据，仅作为迁移来源
//! ```

use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, error, info, warn};

use crate::build_info::{BuildInfo, LegacyAppInfo, Platform};
use crate::bundle_index::{INDEXES_DIRECTORY, LatestBundleIndex};
use crate::storage::{Storage, StorageError};

pub const BUILD_INFO_JSON_FILE_NAME: &str = "build_info.json";
pub const LEGACY_BUILD_INFO_JSON_FILE_NAME: &str = "app_info.json";
const MAX_UPLOAD_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload not found")]
    NotFound,
    #[error("invalid upload id")]
    InvalidUploadId,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("malformed upload metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 上传存储句柄，进程启动时创建一次，通过 `Arc` 在请求间共享。
#[derive(Clone, Debug)]
pub struct UploadStore {
    storage: Storage,
    index: LatestBundleIndex,
}

impl UploadStore {
    pub fn new(storage: Storage) -> Self {
        let index = LatestBundleIndex::new(storage.clone());
        Self { storage, index }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// 确保上传目录存在，可重复调用。
    pub async fn create_namespace(&self, upload_id: &str) -> StoreResult<()> {
        validate_upload_id(upload_id)?;
        self.storage.create_dir(upload_id).await?;
        Ok(())
    }

    /// 保存元数据与二进制文件，并更新 bundle 索引。
    ///
    /// 元数据先写、二进制后写：平台探测只看二进制文件，因此上传在两者都落盘后才可见。
    pub async fn save(&self, build_info: &BuildInfo, app_file: &[u8]) -> StoreResult<()> {
        let upload_id = build_info.upload_id.as_str();
        self.create_namespace(upload_id).await?;
        self.save_build_info(build_info).await?;

        for platform in Platform::ALL {
            if platform != build_info.platform {
                self.storage
                    .remove_file(&app_file_path(upload_id, platform))
                    .await?;
            }
        }
        self.storage
            .write_atomic(&app_file_path(upload_id, build_info.platform), app_file)
            .await?;

        self.index.record_latest(build_info).await?;
        debug!(
            upload_id,
            platform = build_info.platform.display_name(),
            bytes = app_file.len(),
            "upload saved"
        );
        Ok(())
    }

    /// 按固定文件名探测上传的平台；id 非法或文件都不存在时返回 `None`。
    pub async fn detect_platform(&self, upload_id: &str) -> StoreResult<Option<Platform>> {
        if validate_upload_id(upload_id).is_err() {
            return Ok(None);
        }
        for platform in Platform::ALL {
            match self
                .storage
                .exists(&app_file_path(upload_id, platform))
                .await
            {
                Ok(true) => return Ok(Some(platform)),
                Ok(false) => {}
                // 符号链接或非目录的命名空间与不存在的上传一样处理
                Err(StorageError::InvalidPath) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// 探测平台并校验期望值。
    ///
    /// 平台不匹配同样返回 `NotFound`，避免通过带平台的 URL 泄露上传是否存在。
    pub async fn assert_platform(
        &self,
        upload_id: &str,
        expected: Option<Platform>,
    ) -> StoreResult<Platform> {
        let platform = self
            .detect_platform(upload_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        match expected {
            Some(expected) if expected != platform => Err(StoreError::NotFound),
            _ => Ok(platform),
        }
    }

    /// 读取当前格式的元数据；缺失时尝试从旧版格式迁移。
    pub async fn load_metadata(&self, upload_id: &str) -> StoreResult<BuildInfo> {
        validate_upload_id(upload_id).map_err(|_| StoreError::NotFound)?;

        let content = match self.storage.read(&build_info_path(upload_id)).await {
            Ok(content) => content,
            Err(err) if err.is_not_found() => return self.migrate_legacy_app_info(upload_id).await,
            Err(err) => return Err(err.into()),
        };

        let mut build_info: BuildInfo = serde_json::from_slice(&content)?;
        if build_info.upload_id != upload_id {
            if !build_info.upload_id.is_empty() {
                warn!(
                    upload_id,
                    stored = %build_info.upload_id,
                    "stored upload id differs from directory name"
                );
            }
            build_info.upload_id = upload_id.to_string();
        }
        Ok(build_info)
    }

    async fn migrate_legacy_app_info(&self, upload_id: &str) -> StoreResult<BuildInfo> {
        let legacy_path = format!("{upload_id}/{LEGACY_BUILD_INFO_JSON_FILE_NAME}");
        let content = match self.storage.read(&legacy_path).await {
            Ok(content) => content,
            Err(err) if err.is_not_found() => return Err(StoreError::NotFound),
            Err(err) => return Err(err.into()),
        };

        info!(upload_id, "migrating legacy upload to current schema");
        let legacy: LegacyAppInfo = serde_json::from_slice(&content)?;
        let file_size = self
            .storage
            .file_size(&app_file_path(upload_id, Platform::Ios))
            .await?;

        let build_info = BuildInfo::from_legacy(upload_id, legacy, file_size);
        self.save_build_info(&build_info).await?;
        info!(upload_id, "legacy upload migrated");

        Ok(build_info)
    }

    async fn save_build_info(&self, build_info: &BuildInfo) -> StoreResult<()> {
        let content = serde_json::to_vec_pretty(build_info)?;
        self.storage
            .write_atomic(&build_info_path(&build_info.upload_id), &content)
            .await?;
        Ok(())
    }

    pub async fn load_app_file(&self, build_info: &BuildInfo) -> StoreResult<Vec<u8>> {
        validate_upload_id(&build_info.upload_id)?;
        let path = app_file_path(&build_info.upload_id, build_info.platform);
        Ok(self.storage.read(&path).await?)
    }

    /// 打开二进制文件用于流式下载。
    pub async fn open_app_file(
        &self,
        build_info: &BuildInfo,
    ) -> StoreResult<(File, u64, Option<std::time::SystemTime>)> {
        validate_upload_id(&build_info.upload_id)?;
        let path = app_file_path(&build_info.upload_id, build_info.platform);
        Ok(self.storage.open(&path).await?)
    }

    /// 删除整个上传目录；目录不存在不算错误。bundle 索引不会被同步清理。
    pub async fn delete(&self, upload_id: &str) -> StoreResult<()> {
        validate_upload_id(upload_id)?;
        match self.storage.remove_tree(upload_id).await {
            Ok(removed) => {
                info!(upload_id, removed, "upload directory deleted");
                Ok(())
            }
            Err(err) => {
                error!(upload_id, error = %err, "failed to delete upload directory");
                Err(err.into())
            }
        }
    }

    pub async fn lookup_latest(&self, bundle_id: &str) -> StoreResult<Option<String>> {
        Ok(self.index.lookup_latest(bundle_id).await?)
    }

    /// 列出所有可探测到平台的上传 id（已排序）。
    pub async fn list_upload_ids(&self) -> StoreResult<Vec<String>> {
        let mut upload_ids = Vec::new();
        for name in self.storage.list_dirs("").await? {
            if name == INDEXES_DIRECTORY || validate_upload_id(&name).is_err() {
                continue;
            }
            if self.detect_platform(&name).await?.is_some() {
                upload_ids.push(name);
            }
        }
        Ok(upload_ids)
    }

    /// 主动迁移所有仍为旧版格式的上传，返回迁移数量。
    pub async fn migrate_all_legacy(&self) -> StoreResult<usize> {
        let mut migrated = 0;
        for upload_id in self.list_upload_ids().await? {
            if self.storage.exists(&build_info_path(&upload_id)).await? {
                continue;
            }
            let legacy_path = format!("{upload_id}/{LEGACY_BUILD_INFO_JSON_FILE_NAME}");
            if !self.storage.exists(&legacy_path).await? {
                warn!(%upload_id, "upload has no metadata file");
                continue;
            }
            self.load_metadata(&upload_id).await?;
            migrated += 1;
        }
        Ok(migrated)
    }

    /// 清理指向已删除上传的索引项。删除操作不会自动调用它，需显式触发。
    pub async fn reconcile_latest_index(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for entry in self.index.entries().await? {
            if self.detect_platform(&entry.upload_id).await?.is_some() {
                continue;
            }
            self.index.remove_entry(&entry).await?;
            info!(
                upload_id = %entry.upload_id,
                entry = %entry.file_name,
                "removed dangling latest-upload index entry"
            );
            removed += 1;
        }
        Ok(removed)
    }
}

fn build_info_path(upload_id: &str) -> String {
    format!("{upload_id}/{BUILD_INFO_JSON_FILE_NAME}")
}

fn app_file_path(upload_id: &str, platform: Platform) -> String {
    format!("{upload_id}/{}", platform.app_file_name())
}

/// upload id 必须是单一且安全的路径段；`_` 与 `.` 开头的名称保留给存储内部使用。
pub fn validate_upload_id(upload_id: &str) -> StoreResult<()> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && !upload_id.starts_with(['.', '_'])
        && upload_id
            .chars()
            .all(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidUploadId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, UploadStore) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, UploadStore::new(Storage::new(root)))
    }

    fn build(upload_id: &str, platform: Platform, bundle_id: &str) -> BuildInfo {
        BuildInfo {
            app_title: "Demo".into(),
            bundle_id: bundle_id.into(),
            bundle_version: "1.2.3".into(),
            upload_id: upload_id.into(),
            file_size: Some(4),
            created_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()),
            platform,
        }
    }

    fn write_legacy_upload(store: &UploadStore, upload_id: &str, binary: &[u8]) {
        let dir = store.storage().root_path().join(upload_id);
        std::fs::create_dir_all(&dir).expect("create legacy dir");
        std::fs::write(dir.join("app.ipa"), binary).expect("write legacy ipa");
        std::fs::write(
            dir.join(LEGACY_BUILD_INFO_JSON_FILE_NAME),
            r#"{"app_title":"Legacy","bundle_id":"com.example.legacy","bundle_version":"0.9"}"#,
        )
        .expect("write legacy info");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_temp, store) = make_store();
        let info = build("upload-1", Platform::Ios, "com.example.app");
        store.save(&info, b"data").await.expect("save");

        assert_eq!(store.load_metadata("upload-1").await.expect("load"), info);
        assert_eq!(store.load_app_file(&info).await.expect("binary"), b"data");
    }

    #[tokio::test]
    async fn create_namespace_is_idempotent() {
        let (_temp, store) = make_store();
        store.create_namespace("ns").await.expect("first");
        store.create_namespace("ns").await.expect("second");
        assert_eq!(store.detect_platform("ns").await.expect("detect"), None);
    }

    #[tokio::test]
    async fn detect_platform_matches_written_binary() {
        let (_temp, store) = make_store();
        store
            .save(&build("ios-one", Platform::Ios, "com.a"), b"ipa")
            .await
            .expect("save ios");
        store
            .save(&build("android-one", Platform::Android, "com.b"), b"apk")
            .await
            .expect("save android");

        assert_eq!(
            store.detect_platform("ios-one").await.expect("detect"),
            Some(Platform::Ios)
        );
        assert_eq!(
            store.detect_platform("android-one").await.expect("detect"),
            Some(Platform::Android)
        );
        assert_eq!(store.detect_platform("never").await.expect("detect"), None);
        assert_eq!(store.detect_platform("../etc").await.expect("detect"), None);
    }

    #[tokio::test]
    async fn expected_platform_mismatch_is_not_found() {
        let (_temp, store) = make_store();
        store
            .save(&build("ios-one", Platform::Ios, "com.a"), b"ipa")
            .await
            .expect("save");

        assert_eq!(
            store
                .assert_platform("ios-one", Some(Platform::Ios))
                .await
                .expect("assert"),
            Platform::Ios
        );
        assert!(matches!(
            store.assert_platform("ios-one", Some(Platform::Android)).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.assert_platform("missing", None).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn resaving_with_other_platform_keeps_single_binary() {
        let (_temp, store) = make_store();
        store
            .save(&build("reused", Platform::Ios, "com.a"), b"ipa")
            .await
            .expect("save ios");
        store
            .save(&build("reused", Platform::Android, "com.a"), b"apk")
            .await
            .expect("save android");

        assert_eq!(
            store.detect_platform("reused").await.expect("detect"),
            Some(Platform::Android)
        );
        assert!(!store.storage().exists("reused/app.ipa").await.expect("exists"));
    }

    #[tokio::test]
    async fn metadata_without_binary_is_not_visible() {
        let (_temp, store) = make_store();
        let info = build("partial", Platform::Ios, "com.a");
        store.create_namespace("partial").await.expect("namespace");
        store.save_build_info(&info).await.expect("metadata");

        assert_eq!(store.detect_platform("partial").await.expect("detect"), None);
    }

    #[tokio::test]
    async fn legacy_metadata_is_migrated_once() {
        let (_temp, store) = make_store();
        write_legacy_upload(&store, "legacy", b"123456");

        let first = store.load_metadata("legacy").await.expect("first load");
        assert!(
            store
                .storage()
                .exists("legacy/build_info.json")
                .await
                .expect("exists")
        );
        let second = store.load_metadata("legacy").await.expect("second load");

        assert_eq!(first, second);
        assert_eq!(first.upload_id, "legacy");
        assert_eq!(first.platform, Platform::Ios);
        assert_eq!(first.file_size, Some(6));
        assert_eq!(first.created_at, None);
        assert_eq!(first.app_title, "Legacy");
    }

    #[tokio::test]
    async fn legacy_migration_without_binary_fails() {
        let (_temp, store) = make_store();
        write_legacy_upload(&store, "legacy", b"x");
        std::fs::remove_file(store.storage().root_path().join("legacy/app.ipa"))
            .expect("remove binary");

        assert!(matches!(
            store.load_metadata("legacy").await,
            Err(StoreError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn load_metadata_without_any_schema_is_not_found() {
        let (_temp, store) = make_store();
        store.create_namespace("empty").await.expect("namespace");

        assert!(matches!(
            store.load_metadata("empty").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.load_metadata("never-created").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.load_metadata("_indexes").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn upload_id_is_reconstructed_from_path() {
        let (_temp, store) = make_store();
        store.create_namespace("by-path").await.expect("namespace");
        std::fs::write(
            store.storage().root_path().join("by-path/build_info.json"),
            r#"{"app_title":"Demo","bundle_id":"com.a","bundle_version":"1",
                "file_size":3,"created_at":null,"platform":"android"}"#,
        )
        .expect("write metadata");

        let info = store.load_metadata("by-path").await.expect("load");
        assert_eq!(info.upload_id, "by-path");
        assert_eq!(info.platform, Platform::Android);
    }

    #[tokio::test]
    async fn latest_follows_save_order_not_created_at() {
        let (_temp, store) = make_store();
        let mut newer = build("u1", Platform::Ios, "com.example.app");
        newer.created_at = Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        let mut older = build("u2", Platform::Ios, "com.example.app");
        older.created_at = Some(Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap());

        store.save(&newer, b"one").await.expect("save u1");
        store.save(&older, b"two").await.expect("save u2");

        assert_eq!(
            store.lookup_latest("com.example.app").await.expect("lookup"),
            Some("u2".to_string())
        );
    }

    #[tokio::test]
    async fn delete_leaves_index_entry_dangling() {
        let (_temp, store) = make_store();
        store
            .save(&build("doomed", Platform::Ios, "com.example.app"), b"ipa")
            .await
            .expect("save");

        store.delete("doomed").await.expect("delete");

        assert_eq!(store.detect_platform("doomed").await.expect("detect"), None);
        assert!(matches!(
            store.load_metadata("doomed").await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(
            store.lookup_latest("com.example.app").await.expect("lookup"),
            Some("doomed".to_string())
        );
        store.delete("doomed").await.expect("delete again");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_failure_is_reported_as_storage_error() {
        let (_temp, store) = make_store();
        // a regular file where the namespace directory should be cannot be removed as a tree
        std::fs::write(store.storage().root_path().join("blocked"), b"not a dir")
            .expect("write blocker");

        let err = store.delete("blocked").await.expect_err("delete must fail");
        assert!(matches!(err, StoreError::Storage(StorageError::Io(_))));
        assert!(matches!(
            crate::error::ApiError::from(err),
            crate::error::ApiError::Internal(_)
        ));
        assert!(store.storage().root_path().join("blocked").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_namespace_is_not_found() {
        let (temp, store) = make_store();
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside dir");
        std::fs::write(outside.join("app.ipa"), b"ipa").expect("write outside ipa");
        std::os::unix::fs::symlink(&outside, store.storage().root_path().join("linked"))
            .expect("symlink");

        assert_eq!(store.detect_platform("linked").await.expect("detect"), None);
        assert!(matches!(
            store.assert_platform("linked", None).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn reconcile_removes_only_dangling_entries() {
        let (_temp, store) = make_store();
        store
            .save(&build("kept", Platform::Ios, "com.kept"), b"ipa")
            .await
            .expect("save kept");
        store
            .save(&build("gone", Platform::Android, "com.gone"), b"apk")
            .await
            .expect("save gone");
        store.delete("gone").await.expect("delete");

        assert_eq!(store.reconcile_latest_index().await.expect("reconcile"), 1);
        assert_eq!(store.lookup_latest("com.gone").await.expect("lookup"), None);
        assert_eq!(
            store.lookup_latest("com.kept").await.expect("lookup"),
            Some("kept".to_string())
        );
    }

    #[tokio::test]
    async fn list_and_migrate_all_legacy() {
        let (_temp, store) = make_store();
        write_legacy_upload(&store, "legacy-a", b"aa");
        write_legacy_upload(&store, "legacy-b", b"bbb");
        store
            .save(&build("current", Platform::Android, "com.a"), b"apk")
            .await
            .expect("save");
        store.create_namespace("no-binary").await.expect("namespace");

        assert_eq!(
            store.list_upload_ids().await.expect("list"),
            vec!["current", "legacy-a", "legacy-b"]
        );
        assert_eq!(store.migrate_all_legacy().await.expect("migrate"), 2);
        assert_eq!(store.migrate_all_legacy().await.expect("migrate again"), 0);
    }

    #[tokio::test]
    async fn concurrent_saves_leave_one_participant_in_index() {
        let (_temp, store) = make_store();
        let store = Arc::new(store);
        let ids: Vec<String> = (0..8).map(|n| format!("race-{n}")).collect();

        let mut tasks = Vec::new();
        for id in &ids {
            let store = store.clone();
            let info = build(id, Platform::Ios, "com.example.race");
            tasks.push(tokio::spawn(async move { store.save(&info, b"x").await }));
        }
        for task in tasks {
            task.await.expect("join").expect("save");
        }

        let latest = store
            .lookup_latest("com.example.race")
            .await
            .expect("lookup")
            .expect("some latest");
        assert!(ids.contains(&latest));
    }

    #[test]
    fn upload_id_validation() {
        assert!(validate_upload_id("0b6f3c7e-2d1a-4d8e-9a53-1f0e5c2b7a90").is_ok());
        assert!(validate_upload_id("").is_err());
        assert!(validate_upload_id("..").is_err());
        assert!(validate_upload_id("a/b").is_err());
        assert!(validate_upload_id("a\\b").is_err());
        assert!(validate_upload_id("_indexes").is_err());
        assert!(validate_upload_id(".hidden").is_err());
    }
}
