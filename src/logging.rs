use std::fmt;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber for the serving process.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(tracing_fmt::layer().json().with_target(true))
            .try_init()?,
        LogFormat::Text => registry
            .with(tracing_fmt::layer().with_target(true))
            .try_init()?,
    }

    Ok(())
}

/// Map a configured level name onto a filter directive. Unknown names fall back to `info`.
pub fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Wraps a secret so it never reaches the logs.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Drop any `user:pass@` part from a URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("error"), "error");
        assert_eq!(level_directive("verbose"), "info");
    }

    #[test]
    fn test_redacted_hides_value() {
        let password = Redacted("hunter2");
        assert_eq!(password.to_string(), "***");
        assert_eq!(format!("{:?}", password), "***");
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(redact_url("ws://root:secret@db:8000/rpc"), "ws://db:8000/rpc");
        assert_eq!(redact_url("ws://db:8000/rpc"), "ws://db:8000/rpc");
        assert_eq!(redact_url("ws://db:8000/a@b"), "ws://db:8000/a@b");
        assert_eq!(redact_url("not a url"), "not a url");
    }
}
