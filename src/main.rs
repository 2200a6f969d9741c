mod app;
mod config;
mod discovery;
mod server;
mod streaming;

use clap::Parser;

use config::{Config, ConfigFile};

/// Default config file name.
const DEFAULT_CONFIG: &str = "opendaq-streaming.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Layer a TOML config file under env vars so CLI > env > file, same
    // precedence the teacher's own startup path uses.
    let config_file_path =
        std::env::var("STREAMING_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("warning: failed to load {config_file_path}: {e}"),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
