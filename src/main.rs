use std::sync::Arc;

use easy_error::Terminator;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sockspipe::{cli, config::Config, server::ForwardServer};

#[tokio::main]
async fn main() -> Result<(), Terminator> {
    let args = cli::parse_args()?;
    let cfg = Config::load(&args.config_file).await?;
    let server = Arc::new(ForwardServer::new(&cfg)?);
    if args.config_test {
        info!("config ok");
        return Ok(());
    }

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.cancel();
        }
    });
    server.run(token).await?;
    Ok(())
}
