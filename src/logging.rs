use crate::error::{ErrorKind, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};
use trawl_config::{LogFormat, LoggingSettings};
use trawl_transport::LogLevelHook;

/// Changes the active log filter after start-up.
#[derive(Clone, Debug)]
pub struct FilterHandle(reload::Handle<EnvFilter, Registry>);

impl FilterHandle {
    pub fn set(&self, directives: &str) -> std::result::Result<(), String> {
        let filter = EnvFilter::try_new(directives).map_err(|e| e.to_string())?;
        self.0.reload(filter).map_err(|e| e.to_string())
    }

    pub fn into_hook(self) -> LogLevelHook {
        Box::new(move |directives| self.set(directives))
    }
}

/// `from_env` wins when it holds valid directives.
fn initial_filter(from_env: Option<&str>, settings: &LoggingSettings) -> Result<EnvFilter> {
    if let Some(filter) = from_env.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(&settings.level).map_err(|e| exn::Exn::from(ErrorKind::Logging(e.to_string())))
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// level until a command changes it.
pub fn init(settings: &LoggingSettings) -> Result<FilterHandle> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (filter, handle) = reload::Layer::new(initial_filter(from_env.as_deref(), settings)?);
    let pretty = (settings.format == LogFormat::Pretty).then(|| fmt::layer().with_target(true));
    let json = (settings.format == LogFormat::Json).then(|| fmt::layer().json().with_current_span(true));
    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| exn::Exn::from(ErrorKind::Logging(e.to_string())))?;
    Ok(FilterHandle(handle))
}
