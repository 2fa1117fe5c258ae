//! 以根目录为边界的文件存储后端：路径校验、原子写入与目录操作。

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, ErrorKind};

use crate::atomic::AtomicFile;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 判断路径是否存在；中间目录缺失同样视为不存在。
    pub async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::metadata(&target).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    pub async fn file_size(&self, relative: &str) -> Result<u64, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        Ok(fs::metadata(&target).await?.len())
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        Ok(fs::read(&target).await?)
    }

    /// 打开文件用于流式读取，返回句柄、大小与修改时间。
    pub async fn open(
        &self,
        relative: &str,
    ) -> Result<(File, u64, Option<SystemTime>), StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let file = File::open(&target).await?;
        let metadata = file.metadata().await?;
        Ok((file, metadata.len(), metadata.modified().ok()))
    }

    /// 写入临时文件后原子替换目标，父目录需已存在。
    pub async fn write_atomic(&self, relative: &str, content: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        let mut atomic = AtomicFile::new(&target).await?;
        if let Err(err) = atomic.file_mut().write_all(content).await {
            atomic.cleanup().await;
            return Err(StorageError::Io(err));
        }
        atomic.finalize().await
    }

    pub async fn create_dir(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        fs::create_dir_all(target).await?;
        Ok(())
    }

    /// 列出目录下的子目录名称（按名称排序）。
    pub async fn list_dirs(&self, relative: &str) -> Result<Vec<String>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let mut dir = fs::read_dir(&target).await?;
        let mut names = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().to_string());
        }

        names.sort();
        Ok(names)
    }

    /// 列出目录下的普通文件名称（按名称排序）。
    pub async fn list_files(&self, relative: &str) -> Result<Vec<String>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let mut dir = fs::read_dir(&target).await?;
        let mut names = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().to_string());
        }

        names.sort();
        Ok(names)
    }

    /// 删除单个文件，不存在时返回 `Ok(false)`。
    pub async fn remove_file(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 递归删除目录，不存在时返回 `Ok(false)`。
    pub async fn remove_tree(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        if target == self.root {
            return Err(StorageError::InvalidPath);
        }
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == ErrorKind::NotFound)
    }
}
