use reqwest::Proxy;

use crate::error::TransferError;

/// Scheme used to reach the proxy itself.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

impl ProxyType {
    fn guess(url: &str) -> Self {
        match url.split_once("://").map(|(scheme, _)| scheme) {
            Some(scheme) if scheme.starts_with("socks5") => Self::Socks5,
            Some("https") => Self::Https,
            _ => Self::Http,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy that every upload and download request is routed through.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Proxy for all traffic, guessing the type from the URL scheme.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            proxy_type: ProxyType::guess(&url),
            url,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Reqwest proxy for this configuration.
    ///
    /// HTTP and HTTPS proxies only intercept their own scheme; SOCKS5 takes
    /// all traffic and gets a `socks5://` prefix when the URL has none.
    pub fn to_reqwest(&self) -> Result<Proxy, TransferError> {
        let invalid = |kind: &str, e: reqwest::Error| {
            TransferError::proxy_configuration(format!("invalid {kind} proxy `{}`: {e}", self.url))
        };
        let proxy = match self.proxy_type {
            ProxyType::Http => Proxy::http(&self.url).map_err(|e| invalid("HTTP", e))?,
            ProxyType::Https => Proxy::https(&self.url).map_err(|e| invalid("HTTPS", e))?,
            ProxyType::Socks5 => {
                let url = if self.url.contains("://") {
                    self.url.clone()
                } else {
                    format!("socks5://{}", self.url)
                };
                Proxy::all(url).map_err(|e| invalid("SOCKS5", e))?
            }
        };
        Ok(match &self.auth {
            Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
            None => proxy,
        })
    }
}
