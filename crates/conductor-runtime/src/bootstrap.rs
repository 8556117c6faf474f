//! Runtime bootstrap from a single `conductor.yaml`

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use conductor_config::{load_config, ConductorConfig, ConfigError, ObservabilityConfig};
use conductor_core::activity::ActivityRef;
use conductor_core::substrate::Outbound;
use conductor_core::types::Message;

use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::listener::SessionListener;
use crate::spawner::{RuntimeError, SpawnerBuilder, SpawnerHandle};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// A configured spawner for one correlated activity
pub struct RuntimeApp {
    pub config: ConductorConfig,
    pub spawner: SpawnerHandle,
    config_path: PathBuf,
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

impl RuntimeApp {
    /// Create a runnable app from a single `conductor.yaml`.
    pub fn from_config_path(
        path: impl Into<PathBuf>,
        body: ActivityRef,
    ) -> Result<Self, BootstrapError> {
        Self::from_config_path_with(path, body, None, Vec::new())
    }

    /// Create a runnable app with an outbound substrate and session listeners.
    pub fn from_config_path_with(
        path: impl Into<PathBuf>,
        body: ActivityRef,
        outbound: Option<Arc<dyn Outbound>>,
        listeners: Vec<Arc<dyn SessionListener>>,
    ) -> Result<Self, BootstrapError> {
        let config_path = path.into();
        let config = load_config(&config_path)?;
        init_tracing_if_needed(&config.observability);
        tracing::info!(
            app = %config.app.name,
            environment = %config.app.environment,
            config = %config_path.display(),
            "config loaded"
        );

        let mut builder = SpawnerBuilder::from_config(&config.runtime)?;
        if let Some(outbound) = outbound {
            builder = builder.outbound(outbound);
        }
        for listener in listeners {
            builder = builder.listener(listener);
        }
        let spawner = builder.start(body);
        Ok(Self {
            config,
            spawner,
            config_path,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Dispatch `inbound` until it closes, then shut the spawner down.
    pub async fn serve(
        &self,
        inbound: mpsc::Receiver<Message>,
    ) -> Result<DispatchStats, BootstrapError> {
        let stats = Dispatcher::new(self.spawner.clone()).run(inbound).await;
        self.spawner.shutdown().await?;
        Ok(stats)
    }
}

/// Subscriber settings resolved from the observability section
#[derive(Debug, Clone, PartialEq, Eq)]
struct TracingSettings {
    level: &'static str,
    span_events: bool,
    log_file: Option<PathBuf>,
}

impl TracingSettings {
    /// `log_file_override` (`CONDUCTOR_LOG_FILE`) wins over `observability.log_file`
    fn resolve(observability: &ObservabilityConfig, log_file_override: Option<String>) -> Self {
        let level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        let log_file = log_file_override
            .filter(|path| !path.trim().is_empty())
            .or_else(|| observability.log_file.clone())
            .map(PathBuf::from);
        Self {
            level,
            span_events: observability.traces_enabled,
            log_file,
        }
    }

    /// `RUST_LOG` first, the configured level otherwise
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let settings =
            TracingSettings::resolve(observability, std::env::var("CONDUCTOR_LOG_FILE").ok());
        let file = settings
            .log_file
            .as_deref()
            .and_then(|path| match open_log_file(path) {
                Ok(file) => Some(file),
                Err(err) => {
                    eprintln!("failed to open log file '{}': {}", path.display(), err);
                    None
                }
            });
        let to_file = file.is_some();
        let writer = match file {
            Some(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
            None => BoxMakeWriter::new(std::io::stdout),
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(settings.filter())
            .with_target(true)
            .with_ansi(!to_file)
            .with_span_events(settings.span_events())
            .with_writer(writer)
            .try_init();

        tracing::info!(
            log_level = settings.level,
            traces_enabled = settings.span_events,
            log_file = ?settings.log_file,
            to_file,
            "tracing initialized"
        );
    });
}

/// Open `path` for appending, creating missing parent directories
fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use conductor_core::activity::Noop;

    #[test]
    fn test_tracing_settings_normalize_level() {
        let mut observability = ObservabilityConfig::default();
        observability.log_level = " DEBUG ".to_string();
        assert_eq!(TracingSettings::resolve(&observability, None).level, "debug");

        observability.log_level = "chatty".to_string();
        let settings = TracingSettings::resolve(&observability, None);
        assert_eq!(settings.level, "info");
        assert_eq!(settings.span_events(), FmtSpan::NONE);
    }

    #[test]
    fn test_tracing_settings_log_file_override() {
        let mut observability = ObservabilityConfig::default();
        observability.log_file = Some("from-config.log".to_string());
        observability.traces_enabled = true;

        let settings = TracingSettings::resolve(&observability, Some("from-env.log".to_string()));
        assert_eq!(settings.log_file, Some(PathBuf::from("from-env.log")));
        assert_eq!(settings.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);

        let settings = TracingSettings::resolve(&observability, Some("  ".to_string()));
        assert_eq!(settings.log_file, Some(PathBuf::from("from-config.log")));
    }

    #[test]
    fn test_open_log_file_creates_parent_dirs_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/conductor.log");
        open_log_file(&path).unwrap().write_all(b"first\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_app_from_config_path_builds_spawner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(
            &path,
            "version: 1\nruntime:\n  execution_mode: sequential\n  start_operations: [start]\n",
        )
        .unwrap();

        let app = RuntimeApp::from_config_path(&path, Arc::new(Noop)).unwrap();
        assert_eq!(app.spawner.mode(), crate::ExecutionMode::Sequential);
        assert!(app.spawner.is_start_operation("start"));
        assert!(!app.spawner.is_start_operation("data"));
        assert_eq!(app.config_path(), path.as_path());
    }

    #[tokio::test]
    async fn test_app_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(&path, "version: 1\nruntime:\n  execution_mode: eventually\n").unwrap();

        let result = RuntimeApp::from_config_path(&path, Arc::new(Noop));
        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
