use clap::Parser;
use log_bus::AmqpTransport;
use logbus_cli::{execute, Cli, LogFormat};
use tracing::{info, warn};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("logbus=info,log_bus=info,lapin=warn"));

    // Logs go to stderr so consumed records on stdout stay machine-readable.
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Populate the environment before clap reads env-backed flags.
    let env_file = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_format);
    if let Err(e) = env_file {
        warn!(error = %e, "Could not load .env file, using environment variables from the host");
    }

    let config = cli.broker_config()?;
    info!(broker = %config.redacted_url(), "Using broker");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    execute(cli.command, &AmqpTransport, &config, shutdown).await
}
