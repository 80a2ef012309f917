pub mod logging {
    //! Process-wide `tracing` subscriber for the client.
    //!
    //! Everything the subscriber needs is resolved into a [`LogConfig`] up
    //! front (CLI level and sink, env overrides), so installing it only has
    //! to open the sink and parse the directives.

    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::filter::ParseError;
    use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

    /// Full directive string; replaces the level-derived filter.
    pub const LOG_FILTER_VAR: &str = "BEACH_SYNC_LOG_FILTER";
    /// Keeps network-stack targets at the chosen level under `trace`.
    pub const TRACE_DEPS_VAR: &str = "BEACH_SYNC_TRACE_DEPS";

    /// Targets that flood the output at trace level.
    const NOISY_TARGETS: &[&str] = &[
        "hyper",
        "hyper_util",
        "h2",
        "reqwest",
        "rustls",
        "native_tls",
        "tungstenite",
        "tokio_tungstenite",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub enum LogSink {
        #[default]
        Stderr,
        /// Appends; the file is created if missing.
        File(PathBuf),
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub sink: LogSink,
        pub filter_override: Option<String>,
        pub trace_dependencies: bool,
    }

    impl LogConfig {
        /// Combines the CLI choices with `BEACH_SYNC_LOG_FILTER` and
        /// `BEACH_SYNC_TRACE_DEPS`.
        pub fn from_env(level: LogLevel, file: Option<PathBuf>) -> Self {
            Self {
                level,
                sink: file.map(LogSink::File).unwrap_or_default(),
                filter_override: std::env::var(LOG_FILTER_VAR)
                    .ok()
                    .filter(|directives| !directives.trim().is_empty()),
                trace_dependencies: std::env::var(TRACE_DEPS_VAR)
                    .is_ok_and(|value| !value.is_empty() && value != "0"),
            }
        }

        /// Directive string the subscriber filters with.
        pub fn directives(&self) -> String {
            if let Some(directives) = &self.filter_override {
                return directives.clone();
            }
            let mut directives = match self.level {
                LogLevel::Trace => String::from("info,beach_sync=trace"),
                LogLevel::Debug => String::from("info,beach_sync=debug"),
                level => LevelFilter::from(level).to_string().to_lowercase(),
            };
            if self.mutes_dependencies() {
                for target in NOISY_TARGETS {
                    directives.push_str(&format!(",{target}=info"));
                }
            }
            directives
        }

        fn mutes_dependencies(&self) -> bool {
            self.filter_override.is_none()
                && self.level == LogLevel::Trace
                && !self.trace_dependencies
        }

        fn env_filter(&self) -> Result<EnvFilter, InitError> {
            let directives = self.directives();
            EnvFilter::try_new(&directives).map_err(|source| InitError::Filter { directives, source })
        }

        fn writer(&self) -> Result<(NonBlocking, WorkerGuard), InitError> {
            match &self.sink {
                LogSink::Stderr => Ok(tracing_appender::non_blocking(std::io::stderr())),
                LogSink::File(path) => OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(tracing_appender::non_blocking)
                    .map_err(|source| InitError::OpenFile {
                        path: path.clone(),
                        source,
                    }),
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        OpenFile {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid log filter {directives:?}: {source}")]
        Filter {
            directives: String,
            #[source]
            source: ParseError,
        },
        #[error("a global subscriber is already installed: {0}")]
        Install(#[from] TryInitError),
    }

    /// Flushes buffered lines when the process exits.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber once; later calls return `Ok` without
    /// touching it.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }
        let filter = config.env_filter()?;
        let (writer, guard) = config.writer()?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.sink == LogSink::Stderr)
            .finish()
            .try_init()?;
        let _ = WRITER_GUARD.set(guard);

        if config.mutes_dependencies() {
            tracing::debug!(
                target = "beach_sync::telemetry",
                "network dependency traces capped at info; set {TRACE_DEPS_VAR}=1 to see them"
            );
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at(level: LogLevel) -> LogConfig {
            LogConfig {
                level,
                ..LogConfig::default()
            }
        }

        #[test]
        fn quiet_levels_use_a_single_directive() {
            assert_eq!(at(LogLevel::Error).directives(), "error");
            assert_eq!(at(LogLevel::Warn).directives(), "warn");
            assert_eq!(at(LogLevel::Info).directives(), "info");
            assert_eq!(at(LogLevel::Debug).directives(), "info,beach_sync=debug");
        }

        #[test]
        fn trace_caps_network_targets_unless_asked() {
            let capped = at(LogLevel::Trace).directives();
            assert!(capped.starts_with("info,beach_sync=trace,"));
            assert!(capped.contains(",tungstenite=info"));
            assert!(capped.contains(",reqwest=info"));

            let open = LogConfig {
                trace_dependencies: true,
                ..at(LogLevel::Trace)
            };
            assert_eq!(open.directives(), "info,beach_sync=trace");
        }

        #[test]
        fn override_replaces_the_level_filter() {
            let config = LogConfig {
                filter_override: Some("beach_sync::channel=trace".into()),
                ..at(LogLevel::Trace)
            };
            assert_eq!(config.directives(), "beach_sync::channel=trace");
            assert!(!config.mutes_dependencies());
        }

        #[test]
        fn every_level_produces_a_valid_filter() {
            for level in LogLevel::value_variants() {
                assert!(at(*level).env_filter().is_ok(), "{level:?}");
            }
        }

        #[test]
        fn malformed_override_is_rejected() {
            let config = LogConfig {
                filter_override: Some("beach_sync=loudest".into()),
                ..LogConfig::default()
            };
            assert!(matches!(
                config.env_filter(),
                Err(InitError::Filter { directives, .. }) if directives == "beach_sync=loudest"
            ));
        }

        #[test]
        fn unopenable_file_fails_before_installing() {
            let config = LogConfig {
                sink: LogSink::File(PathBuf::from("/nonexistent-beach-sync-dir/client.log")),
                ..LogConfig::default()
            };
            assert!(matches!(init(&config), Err(InitError::OpenFile { .. })));
            assert!(WRITER_GUARD.get().is_none());
        }
    }
}
