// Command-line arguments for the octo binary

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "octo")]
#[command(version, about = "TCP port forwarding proxy", long_about = None)]
pub struct CliArgs {
    /// Local ip:port to listen on
    #[arg(short, long, default_value = "127.0.0.1:8050")]
    pub listener: String,

    /// Remote ip:port targets to proxy to, comma separated, e.g. "192.168.1.15:9090,192.168.1.15:9091"
    #[arg(short, long, default_value = "")]
    pub target: String,

    /// Run the metrics endpoint on this ip:port
    #[arg(short, long, default_value = "0.0.0.0:9123")]
    pub metrics: String,

    /// Config file path, ignored when --target is set
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Enable debug log
    #[arg(long)]
    pub debug: bool,
}

impl CliArgs {
    /// Splits `--target` on commas, keeping order, duplicates and empty
    /// elements. `None` when no target was given.
    pub fn targets(&self) -> Option<Vec<String>> {
        if self.target.is_empty() {
            return None;
        }

        Some(self.target.split(',').map(str::to_string).collect())
    }
}
