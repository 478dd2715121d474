mod app;
mod config;
mod error;
mod system;

use clap::Parser;

use config::{Cli, Config};
use error::ForwardError;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config::from_cli(&cli);

    if let Err(e) = run(cfg).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<(), ForwardError> {
    let listener = system::listener::bind(cfg.listen_addr).await?;
    log::info!(
        "listening on {}, forwarding to upstream SOCKS5 proxy at {}",
        cfg.listen_addr,
        cfg.upstream_addr
    );

    tokio::select! {
        result = system::server::run(listener, cfg) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
            Ok(())
        }
    }
}
