// Configuration source resolution
// A non-empty --target always wins; the config file is only consulted otherwise

use crate::cli::CliArgs;
use crate::config::{self, ConfigError, ProxyConfig};
use std::path::Path;

/// Where the running configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Synthesized from flags; nothing to watch or reload.
    Ephemeral,
    /// Loaded from this literal path.
    File(String),
}

impl ConfigOrigin {
    /// Path handed to the runtime: empty for ephemeral configurations.
    pub fn origin_path(&self) -> &str {
        match self {
            ConfigOrigin::Ephemeral => "",
            ConfigOrigin::File(path) => path,
        }
    }

    pub fn is_reloadable(&self) -> bool {
        matches!(self, ConfigOrigin::File(_))
    }
}

/// The two ways of producing a ProxyConfig.
pub trait ConfigSource {
    fn generate(
        &self,
        listener: &str,
        targets: &[String],
        metrics: &str,
    ) -> Result<ProxyConfig, ConfigError>;

    fn load(&self, path: &Path) -> Result<ProxyConfig, ConfigError>;
}

/// Flag synthesis and YAML file loading from the config module.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlConfigSource;

impl ConfigSource for YamlConfigSource {
    fn generate(
        &self,
        listener: &str,
        targets: &[String],
        metrics: &str,
    ) -> Result<ProxyConfig, ConfigError> {
        config::generate(listener, targets, metrics)
    }

    fn load(&self, path: &Path) -> Result<ProxyConfig, ConfigError> {
        config::load(path)
    }
}

pub fn resolve(args: &CliArgs) -> Result<(ProxyConfig, ConfigOrigin), ConfigError> {
    resolve_with(&YamlConfigSource, args)
}

pub fn resolve_with<S: ConfigSource + ?Sized>(
    source: &S,
    args: &CliArgs,
) -> Result<(ProxyConfig, ConfigOrigin), ConfigError> {
    match args.targets() {
        Some(targets) => {
            tracing::debug!(
                listener = %args.listener,
                targets = ?targets,
                metrics = %args.metrics,
                "Using configuration from command-line flags"
            );

            let config = source.generate(&args.listener, &targets, &args.metrics)?;
            Ok((config, ConfigOrigin::Ephemeral))
        }
        None => {
            tracing::debug!(path = %args.config, "Using configuration file");

            let config = source.load(Path::new(&args.config))?;
            Ok((config, ConfigOrigin::File(args.config.clone())))
        }
    }
}
