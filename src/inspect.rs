//! 从 `.ipa` / `.apk` 包中提取应用元数据。

use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::{debug, error};
use zip::ZipArchive;

use crate::axml::{self, AttributeValue, AxmlError};
use crate::build_info::Platform;

const INFO_PLIST_SUFFIX: &str = ".app/Info.plist";
const ANDROID_MANIFEST: &str = "AndroidManifest.xml";
/// Info.plist 与 AndroidManifest.xml 解压后的大小上限。
const MAX_DESCRIPTOR_SIZE: u64 = 1024 * 1024;

/// 提取结果：三个字段均保证非空。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppMetadata {
    pub app_title: String,
    pub bundle_id: String,
    pub bundle_version: String,
    pub file_size: u64,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("archive could not be read: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive entry could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("no {0} found in package")]
    MissingDescriptor(&'static str),
    #[error("{0} exceeds the descriptor size limit")]
    DescriptorTooLarge(&'static str),
    #[error("Info.plist could not be parsed: {0}")]
    Plist(#[from] plist::Error),
    #[error("Info.plist root is not a dictionary")]
    PlistNotDictionary,
    #[error("AndroidManifest.xml could not be parsed: {0}")]
    Manifest(#[from] AxmlError),
    #[error("required field `{0}` missing or empty")]
    MissingField(&'static str),
}

/// 元数据提取器接口，便于在测试中替换。
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, platform: Platform, content: &[u8]) -> Result<AppMetadata, InspectError>;
}

/// 基于 zip 包内容的默认提取器。
#[derive(Clone, Copy, Debug, Default)]
pub struct PackageInspector;

impl MetadataExtractor for PackageInspector {
    fn extract(&self, platform: Platform, content: &[u8]) -> Result<AppMetadata, InspectError> {
        let result = match platform {
            Platform::Ios => inspect_ipa(content),
            Platform::Android => inspect_apk(content),
        };
        if let Err(err) = &result {
            error!(
                platform = platform.display_name(),
                error = %err,
                "failed to extract package metadata"
            );
        }
        result
    }
}

fn inspect_ipa(content: &[u8]) -> Result<AppMetadata, InspectError> {
    let mut archive = ZipArchive::new(Cursor::new(content))?;

    // Payload/<name>.app/Info.plist wins over nested bundles such as watch apps
    let plist_name = archive
        .file_names()
        .filter(|name| name.ends_with(INFO_PLIST_SUFFIX))
        .min_by_key(|name| name.matches('/').count())
        .map(str::to_string)
        .ok_or(InspectError::MissingDescriptor("Info.plist"))?;
    debug!(entry = %plist_name, "reading Info.plist");

    let entry = archive.by_name(&plist_name)?;
    let declared_size = entry.size();
    let plist_content = read_descriptor(entry, declared_size, "Info.plist")?;

    let value = plist::Value::from_reader(Cursor::new(plist_content))?;
    let info = value
        .as_dictionary()
        .ok_or(InspectError::PlistNotDictionary)?;
    let field = |key: &str| {
        info.get(key)
            .and_then(plist::Value::as_string)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let bundle_id =
        field("CFBundleIdentifier").ok_or(InspectError::MissingField("CFBundleIdentifier"))?;
    let app_title = field("CFBundleName")
        .or_else(|| field("CFBundleDisplayName"))
        .ok_or(InspectError::MissingField("CFBundleName"))?;
    let bundle_version = field("CFBundleShortVersionString")
        .ok_or(InspectError::MissingField("CFBundleShortVersionString"))?;

    Ok(AppMetadata {
        app_title,
        bundle_id,
        bundle_version,
        file_size: content.len() as u64,
    })
}

fn inspect_apk(content: &[u8]) -> Result<AppMetadata, InspectError> {
    let mut archive = ZipArchive::new(Cursor::new(content))?;
    let manifest = match archive.by_name(ANDROID_MANIFEST) {
        Ok(entry) => {
            let declared_size = entry.size();
            read_descriptor(entry, declared_size, ANDROID_MANIFEST)?
        }
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(InspectError::MissingDescriptor(ANDROID_MANIFEST));
        }
        Err(err) => return Err(err.into()),
    };

    let elements = axml::start_elements(&manifest)?;
    let string_attribute = |element: &str, attribute: &str| {
        elements
            .iter()
            .find(|candidate| candidate.name == element)
            .and_then(|candidate| candidate.attribute(attribute))
            .and_then(AttributeValue::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let bundle_id =
        string_attribute("manifest", "package").ok_or(InspectError::MissingField("package"))?;
    let bundle_version = string_attribute("manifest", "versionName")
        .ok_or(InspectError::MissingField("versionName"))?;
    // labels are usually resource references; the package name stands in for those
    let app_title = string_attribute("application", "label").unwrap_or_else(|| bundle_id.clone());

    Ok(AppMetadata {
        app_title,
        bundle_id,
        bundle_version,
        file_size: content.len() as u64,
    })
}

/// 读取描述文件；声明大小与实际解压出的字节数都受上限约束。
fn read_descriptor(
    entry: impl Read,
    declared_size: u64,
    name: &'static str,
) -> Result<Vec<u8>, InspectError> {
    if declared_size > MAX_DESCRIPTOR_SIZE {
        return Err(InspectError::DescriptorTooLarge(name));
    }
    let mut content = Vec::new();
    entry
        .take(MAX_DESCRIPTOR_SIZE + 1)
        .read_to_end(&mut content)?;
    if content.len() as u64 > MAX_DESCRIPTOR_SIZE {
        return Err(InspectError::DescriptorTooLarge(name));
    }
    Ok(content)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{Cursor, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use crate::axml::testing::{TestElement, TestValue, encode};

    pub fn info_plist(bundle_id: &str, name: &str, version: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>{bundle_id}</string>
    <key>CFBundleName</key>
    <string>{name}</string>
    <key>CFBundleShortVersionString</key>
    <string>{version}</string>
</dict>
</plist>
"#
        )
    }

    pub fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(content).expect("write zip entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    pub fn ipa(bundle_id: &str, name: &str, version: &str) -> Vec<u8> {
        let plist = info_plist(bundle_id, name, version);
        zip_with(&[
            ("Payload/Demo.app/Info.plist", plist.as_bytes()),
            ("Payload/Demo.app/Demo", b"binary".as_slice()),
        ])
    }

    pub fn apk(package: &str, version: &str, label: Option<&str>) -> Vec<u8> {
        let application_attributes = match label {
            Some(label) => vec![("label", TestValue::Str(label))],
            None => vec![("label", TestValue::Reference(0x7F0B_0001))],
        };
        let manifest = encode(&[
            TestElement {
                name: "manifest",
                attributes: vec![
                    ("versionCode", TestValue::Int(7)),
                    ("versionName", TestValue::Str(version)),
                    ("package", TestValue::Str(package)),
                ],
            },
            TestElement {
                name: "application",
                attributes: application_attributes,
            },
        ]);
        zip_with(&[
            ("AndroidManifest.xml", manifest.as_slice()),
            ("classes.dex", b"dex".as_slice()),
        ])
    }
}
