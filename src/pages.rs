//! 公开页面：安装页、iOS OTA 清单与安装包下载。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use plist::{Dictionary, Value};
use qrcode::QrCode;
use qrcode::render::svg;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::build_info::{BuildInfo, Platform};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::upload_store::UploadStore;

const MANIFEST_FILE_NAME: &str = "app.plist";

/// 平台对应的安装地址。
pub fn install_url(config: &AppConfig, upload_id: &str, platform: Platform) -> String {
    match platform {
        Platform::Ios => format!(
            "itms-services://?action=download-manifest&url={}",
            config.absolute_url(&format!("/get/{upload_id}/{MANIFEST_FILE_NAME}"))
        ),
        Platform::Android => config.absolute_url(&format!(
            "/get/{upload_id}/{}",
            Platform::Android.app_file_name()
        )),
    }
}

/// 渲染安装页。
pub async fn installation_page(
    Path(upload_id): Path<String>,
    Extension(store): Extension<Arc<UploadStore>>,
    Extension(config): Extension<Arc<AppConfig>>,
) -> Result<Html<String>, ApiError> {
    let platform = store.assert_platform(&upload_id, None).await?;
    let build_info = store.load_metadata(&upload_id).await?;
    let install_url = install_url(&config, &upload_id, platform);
    Ok(Html(render_installation_page(
        &config,
        &build_info,
        &install_url,
    )))
}

/// `/get/{upload_id}/{file_name}`：清单或二进制文件。
pub async fn upload_file(
    Path((upload_id, file_name)): Path<(String, String)>,
    Extension(store): Extension<Arc<UploadStore>>,
    Extension(config): Extension<Arc<AppConfig>>,
) -> Result<Response, ApiError> {
    if file_name == MANIFEST_FILE_NAME {
        return ios_manifest(&store, &config, &upload_id).await;
    }
    let platform = Platform::ALL
        .into_iter()
        .find(|platform| platform.app_file_name() == file_name)
        .ok_or(ApiError::NotFound)?;
    download_app_file(&store, &upload_id, platform).await
}

async fn ios_manifest(
    store: &UploadStore,
    config: &AppConfig,
    upload_id: &str,
) -> Result<Response, ApiError> {
    store.assert_platform(upload_id, Some(Platform::Ios)).await?;
    let build_info = store.load_metadata(upload_id).await?;
    let ipa_url = config.absolute_url(&format!(
        "/get/{upload_id}/{}",
        Platform::Ios.app_file_name()
    ));
    let body = build_manifest(&ipa_url, &build_info)
        .map_err(|err| ApiError::Internal(format!("failed to render manifest: {err}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    Ok((headers, body).into_response())
}

fn build_manifest(ipa_url: &str, build_info: &BuildInfo) -> Result<Vec<u8>, plist::Error> {
    let mut asset = Dictionary::new();
    asset.insert("kind".into(), Value::String("software-package".into()));
    asset.insert("url".into(), Value::String(ipa_url.to_string()));

    let mut metadata = Dictionary::new();
    metadata.insert(
        "bundle-identifier".into(),
        Value::String(build_info.bundle_id.clone()),
    );
    metadata.insert(
        "bundle-version".into(),
        Value::String(build_info.bundle_version.clone()),
    );
    metadata.insert("kind".into(), Value::String("software".into()));
    metadata.insert("title".into(), Value::String(build_info.app_title.clone()));

    let mut item = Dictionary::new();
    item.insert(
        "assets".into(),
        Value::Array(vec![Value::Dictionary(asset)]),
    );
    item.insert("metadata".into(), Value::Dictionary(metadata));

    let mut root = Dictionary::new();
    root.insert("items".into(), Value::Array(vec![Value::Dictionary(item)]));

    let mut buffer = Vec::new();
    Value::Dictionary(root).to_writer_xml(&mut buffer)?;
    Ok(buffer)
}

async fn download_app_file(
    store: &UploadStore,
    upload_id: &str,
    platform: Platform,
) -> Result<Response, ApiError> {
    store.assert_platform(upload_id, Some(platform)).await?;
    let build_info = store.load_metadata(upload_id).await?;
    let (file, size, modified) = store.open_app_file(&build_info).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download_file_name(&build_info)
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|err| ApiError::Internal(err.to_string()))?,
    );
    if let Some(modified) = modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let body = AxumBody::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// 下载文件名：`{标题} {版本} {创建时间}.{扩展名}`，仅保留可放入响应头的 ASCII 字符。
fn download_file_name(build_info: &BuildInfo) -> String {
    let mut name = format!("{} {}", build_info.app_title, build_info.bundle_version);
    if let Some(created_at) = build_info.created_at {
        name.push(' ');
        name.push_str(&created_at.format("%Y-%m-%d_%H-%M-%S").to_string());
    }
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && !matches!(c, '"' | '\\')) {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.{}", build_info.platform.extension())
}

fn render_installation_page(config: &AppConfig, build_info: &BuildInfo, install_url: &str) -> String {
    let page_title = format!(
        "{} @{} - {}",
        build_info.app_title, build_info.bundle_version, config.app_title
    );
    let logo = config
        .logo_url
        .as_deref()
        .map(|url| {
            format!(
                r#"<img class="logo" src="{}" alt="logo">"#,
                escape_html(url)
            )
        })
        .unwrap_or_default();
    let created_at = build_info
        .created_at
        .map(|created_at| created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let qr_code = qr_code_svg(install_url)
        .map(|svg| format!(r#"<div class="qr">{svg}</div>"#))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{page_title}</title>
<style>
body {{ font-family: -apple-system, "Segoe UI", sans-serif; max-width: 32rem; margin: 2rem auto; padding: 0 1rem; text-align: center; }}
.logo {{ max-height: 4rem; }}
dl {{ display: grid; grid-template-columns: auto 1fr; gap: .25rem 1rem; text-align: left; }}
.qr svg {{ width: 12rem; height: 12rem; margin-top: 1rem; }}
.install {{ display: inline-block; margin-top: 1.5rem; padding: .75rem 2rem; border-radius: .5rem; background: #0a84ff; color: #fff; text-decoration: none; }}
</style>
</head>
<body>
{logo}
<h1>{app_title}</h1>
<dl>
<dt>Bundle ID</dt><dd>{bundle_id}</dd>
<dt>Version</dt><dd>{bundle_version}</dd>
<dt>Platform</dt><dd>{platform}</dd>
<dt>Size</dt><dd>{file_size}</dd>
<dt>Uploaded</dt><dd>{created_at}</dd>
</dl>
<a class="install" href="{install_url}">Install</a>
{qr_code}
</body>
</html>
"#,
        page_title = escape_html(&page_title),
        logo = logo,
        // Android 的 label 为资源引用时这里是包名，resources.arsc 不做解析
        app_title = escape_html(&build_info.app_title),
        bundle_id = escape_html(&build_info.bundle_id),
        bundle_version = escape_html(&build_info.bundle_version),
        platform = build_info.platform.display_name(),
        file_size = build_info.human_file_size(),
        created_at = created_at,
        install_url = escape_html(install_url),
        qr_code = qr_code,
    )
}

/// 安装地址的 SVG 二维码，去掉 XML 声明以便内联到 HTML。
fn qr_code_svg(install_url: &str) -> Option<String> {
    let code = match QrCode::new(install_url.as_bytes()) {
        Ok(code) => code,
        Err(err) => {
            warn!(error = %err, "failed to render qr code");
            return None;
        }
    };
    let image = code
        .render::<svg::Color<'_>>()
        .module_dimensions(5, 5)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    image.find("<svg").map(|start| image[start..].to_string())
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
