use std::sync::Arc;

use easy_error::{Error, ResultExt, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    handshake::{Socks5Handshake, StreamOp},
    stream::{IoStream, ProxyDialer, TokioTcpDialer},
    target::TargetAddr,
};

/// Establishes connections through an upstream SOCKS5 proxy by pumping a
/// [`Socks5Handshake`] against a dialed stream. One client may serve many
/// connections; each `connect` call runs an independent handshake.
pub struct SocksClient {
    server: String,
    port: u16,
    dialer: Arc<dyn ProxyDialer>,
    cancel: CancellationToken,
}

impl SocksClient {
    pub fn new<T: Into<String>>(server: T, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            dialer: Arc::new(TokioTcpDialer),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn ProxyDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run one handshake for `target`. On success the returned stream carries
    /// opaque application bytes and the state machine is ready to relay.
    ///
    /// Failures are terminal for this attempt; retrying is the caller's call.
    pub async fn connect(
        &self,
        target: TargetAddr,
    ) -> Result<(Socks5Handshake, Box<dyn IoStream>), Error> {
        let mut hs = Socks5Handshake::new(target);
        if self.cancel.is_cancelled() {
            hs.cancel();
        }
        if hs.open_connection().is_none() {
            bail!("handshake cancelled before connect");
        }
        debug!(
            "connecting to socks server {}:{} for {}",
            self.server,
            self.port,
            hs.target()
        );
        let mut stream = self
            .dialer
            .connect(&self.server, self.port)
            .await
            .context("connect to socks server")?;

        let mut op = hs.connected()?;
        loop {
            op = match op {
                StreamOp::Send { data, then_read } => {
                    stream.write_all(&data).await.context("write")?;
                    stream.flush().await.context("flush")?;
                    let mut buf = vec![0u8; then_read];
                    stream.read_exact(&mut buf).await.context("read")?;
                    hs.bytes_received(&buf)?
                }
                StreamOp::Recv(n) => {
                    let mut buf = vec![0u8; n];
                    stream.read_exact(&mut buf).await.context("read")?;
                    hs.bytes_received(&buf)?
                }
                StreamOp::Ready => break,
                other => bail!("unexpected handshake step: {:?}", other),
            };
        }
        trace!("socks handshake complete for {}", hs.target());
        Ok((hs, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeState;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use test_log::test;
    use tokio_test::io::Builder;

    struct MockDialer(Mutex<Option<Box<dyn IoStream>>>);

    impl MockDialer {
        fn new<T: IoStream + 'static>(stream: T) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Some(Box::new(stream)))))
        }
    }

    #[async_trait]
    impl ProxyDialer for MockDialer {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn IoStream>, Error> {
            Ok(self.0.lock().unwrap().take().unwrap())
        }
    }

    struct PanicDialer;

    #[async_trait]
    impl ProxyDialer for PanicDialer {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn IoStream>, Error> {
            panic!("connect attempted after cancellation")
        }
    }

    #[test(tokio::test)]
    async fn handshake_ipv4_target() {
        let stream = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
            .read(&[5, 0, 0, 1, 127])
            .read(&[0, 0, 1, 0, 80])
            .build();
        let client =
            SocksClient::new("proxy.test", 1080).with_dialer(MockDialer::new(stream));
        let (hs, _stream) = client.connect("93.184.216.34:80".parse().unwrap()).await.unwrap();
        assert_eq!(hs.state(), HandshakeState::Forwarding);
    }

    #[test(tokio::test)]
    async fn handshake_domain_target() {
        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&[1, 187]);
        let stream = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&request)
            .read(&[5, 0, 0, 3, 9])
            .read(&[b'l', b'o', b'c', b'a', b'l', b'h', b'o', b's', b't', 1, 187])
            .build();
        let client =
            SocksClient::new("proxy.test", 1080).with_dialer(MockDialer::new(stream));
        let (hs, _stream) = client.connect("example.com:443".parse().unwrap()).await.unwrap();
        assert_eq!(hs.state(), HandshakeState::Forwarding);
    }

    #[test(tokio::test)]
    async fn unsupported_reply_atyp() {
        let stream = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
            .read(&[5, 0, 0, 9, 0])
            .build();
        let client =
            SocksClient::new("proxy.test", 1080).with_dialer(MockDialer::new(stream));
        let err = client
            .connect("93.184.216.34:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported address type"));
    }

    #[test(tokio::test)]
    async fn server_closes_mid_handshake() {
        let stream = Builder::new().write(&[5, 1, 0]).read(&[5]).build();
        let client =
            SocksClient::new("proxy.test", 1080).with_dialer(MockDialer::new(stream));
        assert!(
            client
                .connect("93.184.216.34:80".parse().unwrap())
                .await
                .is_err()
        );
    }

    #[test(tokio::test)]
    async fn cancelled_before_connect() {
        let token = CancellationToken::new();
        token.cancel();
        let client = SocksClient::new("proxy.test", 1080)
            .with_dialer(Arc::new(PanicDialer))
            .with_cancellation(token);
        let err = client
            .connect("93.184.216.34:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
