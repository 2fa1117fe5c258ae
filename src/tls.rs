//! HTTPS 监听器的 TLS 配置：优先使用给定证书，否则生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Args;

const SELF_SIGNED_CERT_FILE: &str = "app-distribution-cert.pem";
const SELF_SIGNED_KEY_FILE: &str = "app-distribution-key.pem";

pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (cert, key) => {
            if cert.is_some() || key.is_some() {
                warn!("both APP_TLS_CERT and APP_TLS_KEY are required, falling back to a self-signed cert");
            }
            write_self_signed(&subject_names(args, host)).await?
        }
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 证书主体：绑定地址加上公开地址中的主机名。
fn subject_names(args: &Args, host: IpAddr) -> Vec<String> {
    let mut names = vec![host.to_string()];
    if let Some(public_host) = base_url_host(&args.base_url)
        && !names.iter().any(|name| name == public_host)
    {
        names.push(public_host.to_string());
    }
    names
}

fn base_url_host(base_url: &str) -> Option<&str> {
    let (_, rest) = base_url.split_once("://")?;
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    (!host.is_empty()).then_some(host)
}

async fn write_self_signed(names: &[String]) -> io::Result<(PathBuf, PathBuf)> {
    let cert = generate_simple_self_signed(names.to_vec())
        .map_err(|err| io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join(SELF_SIGNED_CERT_FILE);
    let key_path = std::env::temp_dir().join(SELF_SIGNED_KEY_FILE);
    fs::write(&cert_path, cert.cert.pem()).await?;
    fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    info!(?names, "generated self-signed cert: {:?}", cert_path);
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_host_strips_scheme_and_port() {
        assert_eq!(
            base_url_host("https://apps.example.com:8443/dist"),
            Some("apps.example.com")
        );
        assert_eq!(base_url_host("http://localhost"), Some("localhost"));
        assert_eq!(base_url_host("apps.example.com"), None);
    }
}
