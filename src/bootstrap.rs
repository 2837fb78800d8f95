// Startup sequence shared by the binary and tests
// Resolve exactly one configuration, then hand it to the runtime with its origin path

use crate::cli::CliArgs;
use crate::config::ProxyConfig;
use crate::resolver::{self, ConfigOrigin, ConfigSource};
use anyhow::Result;
use std::future::Future;

/// Resolves the configuration and runs `runtime` with it.
///
/// `runtime` receives the origin path: empty for flag-built configurations,
/// the literal `--config` value for file-backed ones. Every error is returned
/// unchanged; nothing here retries or exits.
pub async fn bootstrap<S, R, Fut>(args: &CliArgs, source: &S, runtime: R) -> Result<()>
where
    S: ConfigSource + ?Sized,
    R: FnOnce(ProxyConfig, String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (config, origin) = resolver::resolve_with(source, args)?;

    match &origin {
        ConfigOrigin::Ephemeral => tracing::info!(
            servers = config.servers.len(),
            "Using configuration from command-line flags"
        ),
        ConfigOrigin::File(path) => tracing::info!(
            path = %path,
            servers = config.servers.len(),
            "Using configuration file"
        ),
    }

    runtime(config, origin.origin_path().to_string()).await
}
