//! CadBridge CLI — incremental CAD-to-document-graph conversion.
//!
//! Walks a product structure from its root assemblies, converts changed
//! files through the external converter and uploads the resulting document
//! graph to the index service.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
