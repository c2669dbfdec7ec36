//! Post-handshake relaying. Server-to-client chunks pass through the state
//! machine's forwarding relay; client-to-server writes are acknowledged back
//! to it for flow-control accounting.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use easy_error::{Error, ResultExt, bail};
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    handshake::{HandshakeState, Socks5Handshake, StreamOp},
    stream::IoStream,
};

const BUFFER_SIZE: usize = 65536;

/// Byte counters for one relayed connection.
#[derive(Debug, Default)]
pub struct RelayStats {
    client_to_server: AtomicU64,
    server_to_client: AtomicU64,
}

impl RelayStats {
    pub fn client_to_server(&self) -> u64 {
        self.client_to_server.load(Ordering::Relaxed)
    }

    pub fn server_to_client(&self) -> u64 {
        self.server_to_client.load(Ordering::Relaxed)
    }

    fn incr_client_to_server(&self, n: usize) {
        self.client_to_server.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn incr_server_to_client(&self, n: usize) {
        self.server_to_client.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Shuttle bytes both ways until EOF on both sides, an error, idle timeout,
/// or cancellation. `hs` must have completed its handshake.
pub async fn relay(
    mut hs: Socks5Handshake,
    mut server: Box<dyn IoStream>,
    mut client: Box<dyn IoStream>,
    stats: Arc<RelayStats>,
    idle_timeout: Duration,
    token: CancellationToken,
) -> Result<(), Error> {
    if hs.state() != HandshakeState::Forwarding {
        bail!("relay requires a completed handshake, state is {:?}", hs.state());
    }
    let mut cbuf = vec![0u8; BUFFER_SIZE];
    let mut sbuf = vec![0u8; BUFFER_SIZE];
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_activity = Instant::now();
    let mut client_open = true;
    let mut server_open = true;

    while client_open || server_open {
        tokio::select! {
            r = client.read(&mut cbuf), if client_open => {
                let len = r.context("read from client")?;
                if len == 0 {
                    client_open = false;
                    server.shutdown().await.context("shutdown server")?;
                } else {
                    server.write_all(&cbuf[..len]).await.context("write to server")?;
                    server.flush().await.context("flush server")?;
                    if let Some(acked) = hs.write_completed(len) {
                        stats.incr_client_to_server(acked);
                    }
                    last_activity = Instant::now();
                }
            }
            r = server.read(&mut sbuf), if server_open => {
                let len = r.context("read from server")?;
                if len == 0 {
                    server_open = false;
                    client.shutdown().await.context("shutdown client")?;
                } else {
                    match hs.bytes_received(&sbuf[..len])? {
                        StreamOp::Relay(data) => {
                            client.write_all(&data).await.context("write to client")?;
                            client.flush().await.context("flush client")?;
                            stats.incr_server_to_client(data.len());
                        }
                        other => bail!("unexpected relay step: {:?}", other),
                    }
                    last_activity = Instant::now();
                }
            }
            _ = token.cancelled() => bail!("relay cancelled"),
            _ = interval.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    bail!("idle timeout")
                }
            }
        }
    }
    debug!(
        "relay for {} finished, client to server {} bytes, server to client {} bytes",
        hs.target(),
        stats.client_to_server(),
        stats.server_to_client()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::io::duplex;

    fn forwarding(target: &str) -> Socks5Handshake {
        let mut hs = Socks5Handshake::new(target.parse().unwrap());
        hs.open_connection().unwrap();
        hs.connected().unwrap();
        hs.bytes_received(&[5, 0]).unwrap();
        hs.bytes_received(&[5, 0, 0, 1, 0]).unwrap();
        assert_eq!(hs.bytes_received(&[0, 0, 0, 0, 0]).unwrap(), StreamOp::Ready);
        hs
    }

    #[test(tokio::test)]
    async fn relay_passes_bytes_both_ways() {
        let (client_end, mut local) = duplex(1024);
        let (server_end, mut remote) = duplex(1024);
        let stats = Arc::new(RelayStats::default());
        let task = tokio::spawn(relay(
            forwarding("example.com:80"),
            Box::new(server_end),
            Box::new(client_end),
            stats.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        ));

        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(local);
        drop(remote);
        task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_server(), 4);
        assert_eq!(stats.server_to_client(), 5);
    }

    #[test(tokio::test)]
    async fn relay_rejects_unfinished_handshake() {
        let (client_end, _local) = duplex(64);
        let (server_end, _remote) = duplex(64);
        let hs = Socks5Handshake::new("example.com:80".parse().unwrap());
        let err = relay(
            hs,
            Box::new(server_end),
            Box::new(client_end),
            Arc::new(RelayStats::default()),
            Duration::from_secs(60),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("completed handshake"));
    }

    #[test(tokio::test)]
    async fn relay_stops_on_cancellation() {
        let (client_end, _local) = duplex(64);
        let (server_end, _remote) = duplex(64);
        let token = CancellationToken::new();
        token.cancel();
        let err = relay(
            forwarding("example.com:80"),
            Box::new(server_end),
            Box::new(client_end),
            Arc::new(RelayStats::default()),
            Duration::from_secs(60),
            token,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test(tokio::test(start_paused = true))]
    async fn relay_stops_when_idle() {
        let (client_end, _local) = duplex(64);
        let (server_end, _remote) = duplex(64);
        let err = relay(
            forwarding("example.com:80"),
            Box::new(server_end),
            Box::new(client_end),
            Arc::new(RelayStats::default()),
            Duration::from_secs(3),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("idle timeout"));
    }
}
