use async_trait::async_trait;
use easy_error::{Error, ResultExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Type-erased duplex byte stream used between the handshake and the proxy.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl std::fmt::Debug for dyn IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn IoStream")
    }
}

/// Opens the transport to the proxy server. Kept behind a trait so tests can
/// inject scripted streams instead of real sockets.
#[async_trait]
pub trait ProxyDialer: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn IoStream>, Error>;
}

pub struct TokioTcpDialer;

#[async_trait]
impl ProxyDialer for TokioTcpDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn IoStream>, Error> {
        let stream = TcpStream::connect((host, port)).await.context("connect")?;
        Ok(Box::new(stream))
    }
}
