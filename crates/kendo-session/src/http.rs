//! HTTP client construction.
//!
//! reqwest is built without a bundled rustls crypto provider, so the
//! aws-lc-rs one is installed before the first client is created.

use std::sync::Once;

use reqwest::ClientBuilder;
use rustls::crypto::CryptoProvider;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ProxyConfig, SessionConfig};

/// Install aws-lc-rs as the process-wide rustls provider unless one exists.
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if CryptoProvider::get_default().is_some() {
            return;
        }
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider was installed concurrently");
        }
    });
}

/// How requests reach the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRoute {
    /// Connect directly. Environment and system proxies are ignored.
    Direct,
    /// Whatever the environment configures (`HTTPS_PROXY`, ...).
    System,
    /// Through a configured proxy, with optional basic auth.
    Explicit {
        url: Url,
        auth: Option<(String, String)>,
    },
}

impl ProxyRoute {
    pub fn from_config(proxy: &ProxyConfig) -> Self {
        if !proxy.enabled {
            return Self::Direct;
        }

        match proxy.url.as_deref() {
            Some(raw) => match parse_proxy_url(raw) {
                Some(url) => Self::Explicit {
                    url,
                    auth: proxy.username.clone().zip(proxy.password.clone()),
                },
                None => {
                    warn!(proxy_url = %raw, "Unusable proxy URL; connecting directly");
                    Self::Direct
                }
            },
            None if proxy.use_system_proxy => Self::System,
            None => Self::Direct,
        }
    }

    fn apply(&self, builder: ClientBuilder) -> ClientBuilder {
        match self {
            Self::Direct => builder.no_proxy(),
            Self::System => builder,
            Self::Explicit { url, auth } => match reqwest::Proxy::all(url.as_str()) {
                Ok(proxy) => match auth {
                    Some((username, password)) => {
                        builder.proxy(proxy.basic_auth(username, password))
                    }
                    None => builder.proxy(proxy),
                },
                Err(error) => {
                    warn!(proxy_url = %url, %error, "Proxy rejected by reqwest; connecting directly");
                    builder.no_proxy()
                }
            },
        }
    }

    /// Whether a default client built after a failure may pick up system proxies.
    fn allows_system_fallback(&self) -> bool {
        matches!(self, Self::System)
    }
}

/// A scheme-less value such as `proxy.lan:3128` is taken as plain HTTP.
fn parse_proxy_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    let url = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("http://{raw}"))
    };
    url.ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
}

/// Build the client used for login and renewal requests.
pub fn build_client(config: &SessionConfig) -> reqwest::Client {
    ensure_crypto_provider();

    let route = ProxyRoute::from_config(&config.proxy);
    let mut builder = reqwest::Client::builder().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));
    if !config.request_timeout.is_zero() {
        builder = builder.timeout(config.request_timeout);
    }

    route.apply(builder).build().unwrap_or_else(|error| {
        warn!(%error, ?route, "Failed to build configured HTTP client; using defaults");
        let fallback = reqwest::Client::builder();
        let fallback = if route.allows_system_fallback() {
            fallback
        } else {
            fallback.no_proxy()
        };
        fallback.build().unwrap_or_else(|_| reqwest::Client::new())
    })
}
