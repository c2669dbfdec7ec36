use std::{sync::Arc, time::Duration};

use easy_error::{Error, ResultExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::SocksClient,
    config::Config,
    forward::{RelayStats, relay},
    stream::IoStream,
    target::TargetAddr,
};

/// Accepts local TCP connections and forwards each one to the configured
/// target through the upstream SOCKS5 proxy.
pub struct ForwardServer {
    listen: String,
    target: TargetAddr,
    idle_timeout: Duration,
    client: SocksClient,
}

impl ForwardServer {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let target = cfg.target.parse().context("parse target address")?;
        Ok(Self {
            listen: cfg.listen.clone(),
            target,
            idle_timeout: Duration::from_secs(cfg.timeouts.idle),
            client: SocksClient::new(cfg.proxy.server.clone(), cfg.proxy.port),
        })
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.listen).await.context("bind")?;
        info!("listening on {}, forwarding to {}", self.listen, self.target);
        self.serve(listener, token).await
    }

    /// Accept loop on an already-bound listener. Handshakes run in their own
    /// tasks so a slow proxy cannot block accepting.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                r = listener.accept() => {
                    let (socket, source) = r.context("accept")?;
                    debug!("connection from {}", source);
                    let this = self.clone();
                    let token = token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle(socket, token).await {
                            warn!("{}: {:?}", e, e.cause);
                        }
                    });
                }
                _ = token.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, socket: TcpStream, token: CancellationToken) -> Result<(), Error> {
        let (hs, server_stream) = self.client.connect(self.target.clone()).await?;
        let client_stream: Box<dyn IoStream> = Box::new(socket);
        let stats = Arc::new(RelayStats::default());
        relay(
            hs,
            server_stream,
            client_stream,
            stats,
            self.idle_timeout,
            token,
        )
        .await
    }
}
