//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::io;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_URL: &str = "osfs://./uploads";
pub const DEFAULT_AUTH_TOKEN: &str = "secret";
pub const DEFAULT_APP_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_APP_TITLE: &str = "iOS/Android app distribution server";
pub const DEFAULT_LOGO_URL: &str = "/static/logo.svg";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "app-distribution-server",
    version = VERSION_INFO,
    about = "Self-hosted iOS/Android app distribution server"
)]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "STORAGE_URL",
        default_value = DEFAULT_STORAGE_URL,
        help = "Storage location (osfs://, file:// or a plain directory path)"
    )]
    pub storage_url: String,
    #[arg(
        long,
        env = "UPLOADS_SECRET_AUTH_TOKEN",
        hide_env_values = true,
        help = "Shared secret expected in the X-Auth-Token header"
    )]
    pub auth_token: Option<String>,
    #[arg(
        long,
        env = "APP_BASE_URL",
        default_value = DEFAULT_APP_BASE_URL,
        help = "Public base URL used for install links and manifests"
    )]
    pub base_url: String,
    #[arg(
        long,
        env = "APP_TITLE",
        default_value = DEFAULT_APP_TITLE,
        help = "Title shown on installation pages"
    )]
    pub app_title: String,
    #[arg(
        long,
        env = "LOGO_URL",
        default_value = DEFAULT_LOGO_URL,
        help = "Logo URL for installation pages (empty, 0 or false to disable)"
    )]
    pub logo_url: String,
    #[arg(
        short = 'b',
        long,
        env = "APP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "APP_HTTP_PORT",
        default_value_t = 8000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "APP_HTTPS_PORT",
        help = "HTTPS port (HTTPS is disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "APP_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "APP_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "APP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "APP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload body size in bytes"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        help = "Migrate every legacy upload to the current metadata schema and exit"
    )]
    pub migrate_legacy: bool,
    #[arg(
        long,
        help = "Drop latest-upload index entries that point at deleted uploads and exit"
    )]
    pub reconcile_index: bool,
}

/// Settings shared with request handlers.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub base_url: String,
    pub app_title: String,
    pub logo_url: Option<String>,
}

impl AppConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            base_url: args.base_url.trim_end_matches('/').to_string(),
            app_title: args.app_title.clone(),
            logo_url: parse_logo_url(&args.logo_url),
        }
    }

    pub fn absolute_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn parse_logo_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "0" || trimmed.eq_ignore_ascii_case("false") {
        return None;
    }
    Some(trimmed.to_string())
}

/// 将存储 URL 解析为本地根目录。
pub fn storage_root(storage_url: &str) -> io::Result<PathBuf> {
    if let Some((scheme, rest)) = storage_url.split_once("://") {
        return match scheme {
            "osfs" | "file" if !rest.is_empty() => Ok(PathBuf::from(rest)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported storage url `{storage_url}`"),
            )),
        };
    }
    if storage_url.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "storage url is empty",
        ));
    }
    Ok(PathBuf::from(storage_url))
}
