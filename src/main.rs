use clap::Parser;
use miette::Result;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use jvclink::engine::Engine;
use jvclink::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("jvclink {} starting", jvclink::VERSION);

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("jvclink", move |handle| async move {
            Engine::new(&handle, args).await.map(|_engine| ())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await
    .map_err(|e| miette::miette!("{}", e))
}
