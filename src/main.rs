// octo: TCP forwarding proxy
// Parse flags, set up logging, resolve config, then block in the proxy runtime

use clap::Parser;
use octo_proxy::bootstrap::bootstrap;
use octo_proxy::cli::CliArgs;
use octo_proxy::resolver::YamlConfigSource;
use octo_proxy::{logger, runner};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Malformed command lines are reported by clap, which exits on its own
    let args = CliArgs::parse();

    let log_guard = match logger::init(args.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        debug = args.debug,
        "octo-proxy starting"
    );

    let result = bootstrap(&args, &YamlConfigSource, |config, origin_path| async move {
        runner::run(config, &origin_path).await
    })
    .await;

    let code = match result {
        Ok(()) => {
            tracing::info!("octo-proxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "failed to start");
            ExitCode::FAILURE
        }
    };

    // Flush buffered log lines before the process exits
    drop(log_guard);
    code
}
