// Structured logging module using tracing
// Console output on stdout with microsecond timestamps, INFO or DEBUG only

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::ChronoLocal;

/// Wall-clock stamp with microseconds, e.g. `Jan  2 15:04:05.000000`.
pub const TIMESTAMP_FORMAT: &str = "%b %e %H:%M:%S%.6f";

pub fn level(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Builds the subscriber without installing it.
pub fn build<W>(debug: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(level(debug))
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_writer(writer)
        .finish()
}

/// Installs the process-wide subscriber writing to stdout.
///
/// The returned guard flushes buffered lines when dropped; hold it until the
/// process is about to exit.
pub fn init(debug: bool) -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing::subscriber::set_global_default(build(debug, writer))
        .context("Logger already initialized")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level(true), LevelFilter::DEBUG);
        assert_eq!(level(false), LevelFilter::INFO);
    }
}
