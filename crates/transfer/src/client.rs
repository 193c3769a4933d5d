use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::TransferError;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the `reqwest::Client` both engines talk through.
pub fn create_client(config: &ClientConfig) -> Result<Client, TransferError> {
    install_rustls_provider();

    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs);

    if config.timeout > Duration::ZERO {
        builder = builder.timeout(config.timeout);
    }

    if !config.follow_redirects {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }

    if let Some(proxy_config) = &config.proxy {
        let proxy = proxy_config.to_reqwest()?;
        debug!(proxy_url = %proxy_config.url, proxy_type = ?proxy_config.proxy_type, "Using explicit proxy");
        builder = builder.proxy(proxy);
    } else if !config.use_system_proxy {
        builder = builder.no_proxy();
    }

    builder.build().map_err(TransferError::from)
}
