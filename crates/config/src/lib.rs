//! Layered settings.
//!
//! Settings are merged from, in increasing precedence:
//!
//! 1. built-in defaults;
//! 2. `trawl.toml` in the user's configuration directory, then in the
//!    working directory (or only the file named on the command line);
//! 3. environment variables prefixed `TRAWL_`, with `__` between nested
//!    keys, such as `TRAWL_AMQP__URL`.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use trawl_model::HttpConfig;
use trawl_pipeline::PipelineSettings;
use trawl_transport::AmqpSettings;

pub const FILE_NAME: &str = "trawl.toml";
pub const ENV_PREFIX: &str = "TRAWL_";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub model: ModelSettings,
    pub amqp: AmqpSettings,
    pub logging: LoggingSettings,
}

/// Settings for the backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// How many links deep the web crawler goes.
    pub http_ttl: u32,
    /// Seconds.
    pub http_timeout: u64,
    pub max_redirects: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self { http_ttl: 10, http_timeout: 30, max_redirects: 10 }
    }
}

impl ModelSettings {
    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            timeout: Duration::from_secs(self.http_timeout),
            max_redirects: self.max_redirects,
            ttl: self.http_ttl,
            ..HttpConfig::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default log filter, in `RUST_LOG` syntax. `RUST_LOG` itself wins.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Pretty }
    }
}

/// Files read when no file is named explicitly, lowest precedence first.
pub fn default_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(dirs) = ProjectDirs::from("", "", "trawl") {
        files.push(dirs.config_dir().join(FILE_NAME));
    }
    files.push(PathBuf::from(FILE_NAME));
    files
}

/// The merged providers. Missing files are skipped.
pub fn figment(files: &[PathBuf]) -> Figment {
    let figment = files.iter().fold(Figment::from(Serialized::defaults(Settings::default())), |figment, file| {
        figment.merge(Toml::file(file))
    });
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Loads and validates settings. An explicitly named file must exist.
pub fn load(file: Option<&Path>) -> Result<Settings> {
    let files = match file {
        Some(file) if !file.is_file() => exn::bail!(ErrorKind::NotFound(file.to_path_buf())),
        Some(file) => vec![file.to_path_buf()],
        None => default_files(),
    };
    tracing::debug!(?files, "loading configuration");
    let settings: Settings = figment(&files).extract().or_raise(|| ErrorKind::Load)?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.op_tries == 0 {
            exn::bail!(ErrorKind::Invalid { key: "pipeline.op_tries", reason: "must be at least 1".into() });
        }
        if self.pipeline.op_timeout == 0 {
            exn::bail!(ErrorKind::Invalid { key: "pipeline.op_timeout", reason: "must be at least 1".into() });
        }
        if self.amqp.prefetch_count == 0 {
            exn::bail!(ErrorKind::Invalid { key: "amqp.prefetch_count", reason: "must be at least 1".into() });
        }
        if !(self.amqp.url.starts_with("amqp://") || self.amqp.url.starts_with("amqps://")) {
            let reason = format!("`{}` is not an AMQP URL", self.amqp.redacted_url());
            exn::bail!(ErrorKind::Invalid { key: "amqp.url", reason });
        }
        if self.amqp.backoff.max_tries == 0 {
            exn::bail!(ErrorKind::Invalid { key: "amqp.backoff.max_tries", reason: "must be at least 1".into() });
        }
        Ok(())
    }
}
