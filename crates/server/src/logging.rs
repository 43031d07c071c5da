//! Tracing subscriber setup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use venn_core::config::LoggingConfig;

pub const FORMAT_ENV: &str = "SLOG_FORMAT";
pub const LEVEL_ENV: &str = "SLOG_LEVEL";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Tint,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "tint" | "text" => Some(Self::Tint),
            _ => None,
        }
    }
}

/// Accepts level names and the slog integers (`-4` debug, `0` info, `4` warn, `8` error).
#[must_use]
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Some(match n {
            i64::MIN..=-5 => LevelFilter::TRACE,
            -4..=-1 => LevelFilter::DEBUG,
            0..=3 => LevelFilter::INFO,
            4..=7 => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        });
    }
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// Env vars win over the config file; unknown values fall back to pretty / info.
#[must_use]
pub fn resolve(config: &LoggingConfig) -> (LogFormat, LevelFilter) {
    let format = std::env::var(FORMAT_ENV)
        .ok()
        .and_then(|f| LogFormat::parse(&f))
        .or_else(|| LogFormat::parse(&config.format))
        .unwrap_or(LogFormat::Pretty);
    let level = std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|l| parse_level(&l))
        .or_else(|| parse_level(&config.log_level))
        .unwrap_or(LevelFilter::INFO);
    (format, level)
}

/// Installs the global subscriber. `RUST_LOG` replaces the level-derived filter when set.
pub fn init(config: &LoggingConfig) {
    let (format, level) = resolve(config);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,venn_core={level},server={level},venn={level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .init(),
        LogFormat::Tint => registry
            .with(tracing_subscriber::fmt::layer().compact().with_ansi(true).with_target(false))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("-4"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("0"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("4"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("8"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("tint"), Some(LogFormat::Tint));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    #[serial]
    fn test_env_overrides_config() {
        let config = LoggingConfig { format: "pretty".into(), log_level: "info".into() };
        std::env::set_var(FORMAT_ENV, "json");
        std::env::set_var(LEVEL_ENV, "-4");
        assert_eq!(resolve(&config), (LogFormat::Json, LevelFilter::DEBUG));

        std::env::remove_var(FORMAT_ENV);
        std::env::remove_var(LEVEL_ENV);
        assert_eq!(resolve(&config), (LogFormat::Pretty, LevelFilter::INFO));
    }
}
