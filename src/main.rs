use api_gateway::{config::Args, logger, server};
use clap::Parser; // for cli

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();
    logger::init_logger();

    server::run(args).await
}
