use anyhow::Result;
use clap::Parser;
use dialflow::app::AppBuilder;
use dialflow::config::{Cli, Config};
use dialflow::logs::RotatingWriter;
use std::path::Path;
use tokio::select;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::from_path(&cli.env_file).ok();
    let config = Config::from_env();

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let app_log = RotatingWriter::open(Path::new(&config.log_dir).join("app.log"))
        .expect("failed to open app log");
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(app_log)
        .with_ansi(false)
        .try_init()
        .ok();

    let app = AppBuilder::new().config(config).build()?;
    info!("starting dialflow (company={})", app.config.company);

    let stop = app.cancel_token.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
        stop.cancel();
    });

    app.run().await
}
