//! bundle id 到最近一次保存的 upload id 的索引。

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::build_info::BuildInfo;
use crate::storage::{Storage, StorageError};

pub const INDEXES_DIRECTORY: &str = "_indexes";
const LATEST_UPLOAD_BY_BUNDLE_ID: &str = "latest_upload_by_bundle_id";
const ENTRY_SUFFIX: &str = ".txt";
const MAX_TOKEN_LEN: usize = 128;
const TRUNCATED_PREFIX_LEN: usize = 64;

#[derive(Clone, Debug)]
pub struct LatestBundleIndex {
    storage: Storage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_name: String,
    pub upload_id: String,
}

impl LatestBundleIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// 原子覆盖写入，不比较时间戳。
    pub async fn record_latest(&self, build_info: &BuildInfo) -> Result<(), StorageError> {
        self.storage.create_dir(&index_directory()).await?;
        let path = entry_path(&build_info.bundle_id);
        self.storage
            .write_atomic(&path, build_info.upload_id.as_bytes())
            .await?;
        debug!(
            bundle_id = %build_info.bundle_id,
            upload_id = %build_info.upload_id,
            %path,
            "latest upload recorded"
        );
        Ok(())
    }

    pub async fn lookup_latest(&self, bundle_id: &str) -> Result<Option<String>, StorageError> {
        let path = entry_path(bundle_id);
        debug!(bundle_id, %path, "looking up latest upload");
        match self.storage.read(&path).await {
            Ok(content) => Ok(parse_entry(&content)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn entries(&self) -> Result<Vec<IndexEntry>, StorageError> {
        let directory = index_directory();
        let file_names = match self.storage.list_files(&directory).await {
            Ok(names) => names,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut entries = Vec::new();
        for file_name in file_names {
            // 写入中的临时文件以 uuid 结尾
            if !file_name.ends_with(ENTRY_SUFFIX) {
                continue;
            }
            let content = self.storage.read(&format!("{directory}/{file_name}")).await?;
            if let Some(upload_id) = parse_entry(&content) {
                entries.push(IndexEntry {
                    file_name,
                    upload_id,
                });
            }
        }
        Ok(entries)
    }

    pub async fn remove_entry(&self, entry: &IndexEntry) -> Result<(), StorageError> {
        let path = format!("{}/{}", index_directory(), entry.file_name);
        self.storage.remove_file(&path).await?;
        Ok(())
    }
}

fn index_directory() -> String {
    format!("{INDEXES_DIRECTORY}/{LATEST_UPLOAD_BY_BUNDLE_ID}")
}

fn entry_path(bundle_id: &str) -> String {
    format!("{}/{}{ENTRY_SUFFIX}", index_directory(), bundle_token(bundle_id))
}

fn parse_entry(content: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(content);
    let upload_id = text.lines().next()?.trim();
    if upload_id.is_empty() {
        return None;
    }
    Some(upload_id.to_string())
}

/// bundle id 转文件名：`[A-Za-z0-9._-]` 以外的字节做百分号编码，过长时截断并拼接 SHA-256。
pub fn bundle_token(bundle_id: &str) -> String {
    let mut token = String::with_capacity(bundle_id.len());
    for byte in bundle_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            token.push(byte as char);
        } else {
            token.push_str(&format!("%{byte:02X}"));
        }
    }

    if token.len() > MAX_TOKEN_LEN {
        let digest = hex::encode(Sha256::digest(bundle_id.as_bytes()));
        token.truncate(TRUNCATED_PREFIX_LEN);
        token.push('-');
        token.push_str(&digest);
    }
    token
}
