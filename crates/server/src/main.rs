use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use portico::{Server, ServerConfig, welcome};
use portico_http::handler::make_handler;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// TLS and HTTP/1.1 front end server
#[derive(Debug, Parser)]
#[command(name = "portico", version, about)]
struct Args {
    /// configuration file
    #[arg(short, long, default_value = "portico.toml")]
    config: PathBuf,

    /// overrides the configured log level
    #[arg(short, long)]
    log_level: Option<Level>,

    /// load and check the configuration, then exit
    #[arg(short = 't', long)]
    check: bool,
}

fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install the log subscriber: {e}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ServerConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(args.log_level.unwrap_or(Level::INFO));
            error!(config = %args.config.display(), cause = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    // validated while loading
    let level = args.log_level.or_else(|| config.log_level().ok()).unwrap_or(Level::INFO);
    init_logging(level);

    if args.check {
        for listener in &config.listeners {
            if let Err(e) = listener.tls_listener_config() {
                error!(address = %listener.address(), cause = %e, "invalid listener");
                return ExitCode::FAILURE;
            }
        }
        info!(config = %args.config.display(), "config is valid");
        return ExitCode::SUCCESS;
    }

    let server = match Server::bind(&config, make_handler(welcome)).await {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!(cause = %e, "failed to listen for ctrl-c"),
        }
    });

    info!(addresses = ?server.local_addrs(), "portico started");
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(cause = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
