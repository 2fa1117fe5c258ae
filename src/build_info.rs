//! 上传记录的数据模型：平台枚举、当前与旧版元数据格式。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 支持分发的移动平台。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

struct PlatformInfo {
    display_name: &'static str,
    app_file_name: &'static str,
    extension: &'static str,
}

const IOS_INFO: PlatformInfo = PlatformInfo {
    display_name: "iOS",
    app_file_name: "app.ipa",
    extension: "ipa",
};

const ANDROID_INFO: PlatformInfo = PlatformInfo {
    display_name: "Android",
    app_file_name: "app.apk",
    extension: "apk",
};

impl Platform {
    /// Probe order used when detecting the platform of an upload.
    pub const ALL: [Platform; 2] = [Platform::Ios, Platform::Android];

    fn info(self) -> &'static PlatformInfo {
        match self {
            Platform::Ios => &IOS_INFO,
            Platform::Android => &ANDROID_INFO,
        }
    }

    pub fn display_name(self) -> &'static str {
        self.info().display_name
    }

    /// 存储中二进制文件的固定名称，与客户端上传的文件名无关。
    pub fn app_file_name(self) -> &'static str {
        self.info().app_file_name
    }

    pub fn extension(self) -> &'static str {
        self.info().extension
    }

    /// 根据上传文件名的扩展名推断平台。
    pub fn from_file_name(file_name: &str) -> Option<Platform> {
        let (_, extension) = file_name.rsplit_once('.')?;
        Platform::ALL
            .into_iter()
            .find(|platform| platform.extension() == extension)
    }
}

/// 旧版 `app_info.json` 的结构，仅作为迁移来源读取。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyAppInfo {
    pub app_title: String,
    pub bundle_id: String,
    pub bundle_version: String,
}

/// 当前版本的上传元数据（`build_info.json`）。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub app_title: String,
    pub bundle_id: String,
    pub bundle_version: String,
    #[serde(default)]
    pub upload_id: String,
    /// `None` means the size is unknown, which is not the same as zero.
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub platform: Platform,
}

impl BuildInfo {
    /// 由旧版记录升级：旧版只支持 iOS，且从未记录创建时间。
    pub fn from_legacy(upload_id: &str, legacy: LegacyAppInfo, file_size: u64) -> Self {
        Self {
            app_title: legacy.app_title,
            bundle_id: legacy.bundle_id,
            bundle_version: legacy.bundle_version,
            upload_id: upload_id.to_string(),
            file_size: Some(file_size),
            created_at: None,
            platform: Platform::Ios,
        }
    }

    pub fn human_file_size(&self) -> String {
        match self.file_size {
            Some(size) => format_file_size(size),
            None => "unknown size".to_string(),
        }
    }
}

fn format_file_size(size: u64) -> String {
    const ONE_KB: u64 = 1024;
    let value = size as f64;

    if size < ONE_KB {
        return format!("{size}B");
    }
    if size < ONE_KB.pow(2) {
        return format!("{:.2}KB", value / ONE_KB as f64);
    }
    if size < ONE_KB.pow(3) {
        return format!("{:.2}MB", value / ONE_KB.pow(2) as f64);
    }
    format!("{:.2}GB", value / ONE_KB.pow(3) as f64)
}
