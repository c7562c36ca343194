// pool-miner/src/logging.rs
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Where the effective log level came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Environment,
    Config,
    /// The configured level did not parse.
    InvalidConfig,
    Default,
}

impl LevelSource {
    fn describe(self) -> &'static str {
        match self {
            LevelSource::Environment => "RUST_LOG environment variable",
            LevelSource::Config => "Config.toml",
            LevelSource::InvalidConfig => "default (invalid config value)",
            LevelSource::Default => "default",
        }
    }
}

/// `RUST_LOG` wins over the configured level; an invalid configured level
/// falls back to INFO. Returns the filter, the effective level string and its
/// source.
pub(crate) fn determine_filter_and_source(log_level_from_config: Option<&str>) -> (EnvFilter, String, LevelSource) {
    if let Ok(env_value) = std::env::var("RUST_LOG") {
        if !env_value.is_empty() {
            // May be a full directive list such as "info,pool_miner=debug".
            return (EnvFilter::new(&env_value), env_value, LevelSource::Environment);
        }
    }

    let (level, source) = match log_level_from_config {
        Some(configured) => match LevelFilter::from_str(configured.trim()) {
            Ok(parsed) => (parsed, LevelSource::Config),
            Err(_) => (DEFAULT_LOG_LEVEL, LevelSource::InvalidConfig),
        },
        None => (DEFAULT_LOG_LEVEL, LevelSource::Default),
    };
    let filter = EnvFilter::builder().with_default_directive(level.into()).parse_lossy("");
    (filter, level.to_string(), source)
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(log_level_from_config: Option<&str>) {
    let (filter, effective_level, source) = determine_filter_and_source(log_level_from_config);

    if source == LevelSource::InvalidConfig {
        if let Some(invalid) = log_level_from_config {
            eprintln!(
                "Warning: invalid log level '{}' in Config.toml, using '{}'.",
                invalid, DEFAULT_LOG_LEVEL
            );
        }
    }

    let filter_description = filter.to_string();
    let formatter = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .with_thread_names(true)
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE);

    if tracing_subscriber::registry().with(filter).with(formatter).try_init().is_err() {
        return;
    }

    info!(
        level = %effective_level,
        source = source.describe(),
        filter = %filter_description,
        "Logging initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ENV_GUARD;
    use std::env;

    fn with_rust_log<F>(value: Option<&str>, test_fn: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let original = env::var("RUST_LOG").ok();
        match value {
            Some(v) => env::set_var("RUST_LOG", v),
            None => env::remove_var("RUST_LOG"),
        }

        test_fn();

        match original {
            Some(v) => env::set_var("RUST_LOG", v),
            None => env::remove_var("RUST_LOG"),
        }
    }

    #[test]
    fn test_determine_from_config_debug() {
        with_rust_log(None, || {
            let (filter, level, source) = determine_filter_and_source(Some("DEBUG"));
            assert_eq!(level, "DEBUG");
            assert_eq!(source, LevelSource::Config);
            assert!(filter.to_string().to_lowercase().contains("debug"), "Filter string was: {}", filter);
        });
    }

    #[test]
    fn test_determine_rust_log_overrides_config() {
        with_rust_log(Some("warn"), || {
            let (filter, level, source) = determine_filter_and_source(Some("DEBUG"));
            assert_eq!(level, "warn");
            assert_eq!(source, LevelSource::Environment);
            assert!(filter.to_string().to_lowercase().contains("warn"), "Filter string was: {}", filter);
        });
    }

    #[test]
    fn test_determine_rust_log_directive_list() {
        let directives = "pool_miner=trace,pool_stratum_connector=debug";
        with_rust_log(Some(directives), || {
            let (_, level, source) = determine_filter_and_source(Some("info"));
            assert_eq!(level, directives);
            assert_eq!(source, LevelSource::Environment);
        });
    }

    #[test]
    fn test_determine_invalid_config_falls_back_to_default() {
        with_rust_log(None, || {
            let (_, level, source) = determine_filter_and_source(Some("VERY_INVALID_LEVEL"));
            assert_eq!(level, DEFAULT_LOG_LEVEL.to_string());
            assert_eq!(source, LevelSource::InvalidConfig);
        });
    }

    #[test]
    fn test_determine_no_config_no_env_uses_default() {
        with_rust_log(None, || {
            let (_, level, source) = determine_filter_and_source(None);
            assert_eq!(level, DEFAULT_LOG_LEVEL.to_string());
            assert_eq!(source, LevelSource::Default);
        });
    }

    #[test]
    fn test_determine_config_case_insensitivity() {
        with_rust_log(None, || {
            let (_, level, source) = determine_filter_and_source(Some("tRaCe"));
            assert_eq!(level, "TRACE");
            assert_eq!(source, LevelSource::Config);
        });
    }

    #[test]
    fn test_empty_rust_log_is_ignored() {
        with_rust_log(Some(""), || {
            let (_, level, source) = determine_filter_and_source(Some("warn"));
            assert_eq!(level, "WARN");
            assert_eq!(source, LevelSource::Config);
        });
    }
}
