use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

const DEFAULT_DIRECTIVE: &str = "bookshelf_sync=info";

/// Initializes logging with both console and file output.
///
/// The file layer writes JSON lines to a daily-rotated file under the configured
/// directory. Keep the returned guard alive for the life of the process so buffered
/// lines are flushed on exit.
pub fn init_logging(settings: &LoggingSettings) -> WorkerGuard {
    // Ensure logs directory exists
    let _ = fs::create_dir_all(&settings.directory);

    let file_appender = tracing_appender::rolling::daily(&settings.directory, &settings.file_prefix);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

/// `RUST_LOG` when set and valid, otherwise info for this crate
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        assert!(DEFAULT_DIRECTIVE.parse::<tracing_subscriber::filter::Directive>().is_ok());
    }
}
