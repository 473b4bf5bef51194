use std::env;

use vitalis_server::config::loader::load_config;
use vitalis_server::{AppContext, ServerBuilder, shutdown_tracing};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From VITALIS_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (vitalis.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (VITALIS_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional; anything else going wrong with it is worth a warning
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    vitalis_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );

    vitalis_server::observability::apply_logging_level(&cfg.logging.level);
    vitalis_server::metrics::init_metrics();

    // Store and limiter must be up before anything listens.
    let context = match AppContext::initialize(cfg).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Startup failed: {e}");
            std::process::exit(2);
        }
    };

    let server = ServerBuilder::new(context).build();
    let result = server.run().await;
    shutdown_tracing();

    if let Err(err) = result {
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: VITALIS_CONFIG
/// 3. Default: vitalis.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("VITALIS_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("vitalis.toml".to_string(), ConfigSource::Default)
}
