use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kendo_session::SessionConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Args;

const APP_DIR: &str = "kendo-session";
const CONFIG_FILE: &str = "config.toml";
const SESSION_FILE: &str = "session.json";

/// CLI configuration, read from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the session is persisted between runs.
    pub session_file: Option<PathBuf>,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file yields the defaults. `KENDO_*` environment variables are
    /// applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };

        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            _ => Self::default(),
        };

        config.session = config.session.with_env_overrides()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.session.validate()?;
        Ok(config)
    }

    /// Apply command line overrides.
    pub fn with_args(mut self, args: &Args) -> Result<Self> {
        if let Some(url) = &args.backend_url {
            self.session.base_url = SessionConfig::new(url)?.base_url;
        }
        if let Some(margin) = args.margin_ms {
            self.session.renewal_margin = Duration::from_millis(margin);
        }
        if let Some(path) = &args.session_file {
            self.session_file = Some(path.clone());
        }
        self.session.validate()?;
        Ok(self)
    }

    pub fn session_file(&self) -> PathBuf {
        self.session_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR).join(SESSION_FILE))
                .unwrap_or_else(|| PathBuf::from(SESSION_FILE))
        })
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }
}
