use clap::Parser;
use revproxy::{Config, Server};
use std::path::PathBuf;

/// TCP-level HTTP/1.1 reverse proxy.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides the `RUST_LOG` environment variable.
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    revproxy::logging::init(cli.log_filter.as_deref());

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return std::process::ExitCode::FAILURE;
        }
    };

    let server = Server::new(config);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(e) = server.run(shutdown).await {
        tracing::error!(error = %e, "server exited with error");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}
