use clap::Parser;
use message_bus::core::app::CoreApp;
use message_bus::core::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = CoreApp::init(cli).await?;
    app.run().await
}
