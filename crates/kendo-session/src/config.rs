//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::DEFAULT_RENEWAL_MARGIN;
use crate::error::{Error, Result};

/// Default backend root.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/";

/// Default timeout for a single login or renewal request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound proxy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_system_proxy: bool,
}

/// Configuration shared by the HTTP client and the renewal scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend root; `auth/...` endpoints are resolved against it.
    #[serde(deserialize_with = "deserialize_base_url")]
    pub base_url: Url,
    /// Lead time before expiry at which a renewal fires.
    #[serde(rename = "renewal_margin_ms", with = "millis")]
    pub renewal_margin: Duration,
    /// Timeout of a single request.
    #[serde(rename = "request_timeout_secs", with = "secs")]
    pub request_timeout: Duration,
    pub proxy: ProxyConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            proxy: ProxyConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for `base_url` with default timings.
    pub fn new(base_url: &str) -> Result<Self> {
        let config = Self {
            base_url: parse_base_url(base_url)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `KENDO_*` environment overrides on top of `self`.
    ///
    /// - `KENDO_BACKEND_URL`
    /// - `KENDO_RENEW_MARGIN_MS`
    /// - `KENDO_REQUEST_TIMEOUT_SECS`
    /// - `KENDO_PROXY_URL` (enables the proxy)
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = var("KENDO_BACKEND_URL") {
            self.base_url = parse_base_url(&url)?;
        }
        if let Some(margin) = var("KENDO_RENEW_MARGIN_MS") {
            let millis = margin.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("KENDO_RENEW_MARGIN_MS must be milliseconds: {e}"))
            })?;
            self.renewal_margin = Duration::from_millis(millis);
        }
        if let Some(timeout) = var("KENDO_REQUEST_TIMEOUT_SECS") {
            let secs = timeout.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("KENDO_REQUEST_TIMEOUT_SECS must be seconds: {e}"))
            })?;
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(proxy) = var("KENDO_PROXY_URL") {
            self.proxy.enabled = true;
            self.proxy.url = Some(proxy);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the scheduler or client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.renewal_margin.is_zero() {
            return Err(Error::config("renewal margin must be greater than zero"));
        }
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "unsupported backend URL scheme: {}",
                self.base_url.scheme()
            )));
        }
        Ok(())
    }

    /// Resolve an endpoint path relative to the backend root.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::config(format!("invalid endpoint {path}: {e}")))
    }
}

/// Parse a backend root, making sure it ends with `/` so relative joins keep
/// any path prefix (`https://host/backend` → `https://host/backend/auth/...`).
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw.trim()).map_err(|e| Error::config(format!("invalid backend URL {raw}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn deserialize_base_url<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Url, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_base_url(&raw).map_err(serde::de::Error::custom)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
