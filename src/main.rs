mod cli;

use crate::cli::app::App;
use crate::cli::args::Cli;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::open(cli.store.as_deref(), cli.config.as_deref()).await?;
    let result = app.run(cli.command).await;
    app.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
