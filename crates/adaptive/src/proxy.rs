use reqwest::Proxy;

use crate::error::TransportError;

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy every manifest, key and segment request goes through.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Infers the proxy type from the URL scheme, defaulting to HTTP.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let proxy_type = if url.starts_with("socks5") {
            ProxyType::Socks5
        } else if url.starts_with("https://") {
            ProxyType::Https
        } else {
            ProxyType::Http
        };
        Self {
            url,
            proxy_type,
            auth: None,
        }
    }
}

pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, TransportError> {
    let proxy_url = &config.url;

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url)
            .map_err(|e| TransportError::invalid_url(proxy_url, format!("HTTP proxy: {e}")))?,
        ProxyType::Https => Proxy::https(proxy_url)
            .map_err(|e| TransportError::invalid_url(proxy_url, format!("HTTPS proxy: {e}")))?,
        ProxyType::Socks5 => {
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };

            Proxy::all(&url)
                .map_err(|e| TransportError::invalid_url(&url, format!("SOCKS5 proxy: {e}")))?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
